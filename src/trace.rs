use chrono::Local;
use serde_json::{json, Value};
use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

pub const DEBUG_FILE_ENV: &str = "NEWPY_DEBUG_FILE";

// Once stdout/stderr point at the log file (or nowhere) this is the only
// reliable way to see what a detaching process did.
pub fn debug_to_file(message: &str, data: Option<Value>) {
    let Some(path) = env::var_os(DEBUG_FILE_ENV) else {
        return;
    };
    if let Err(err) = write_debug_entry(Path::new(&path), message, data) {
        eprintln!("DEBUG ERROR: {err}");
    }
}

pub fn write_debug_entry(path: &Path, message: &str, data: Option<Value>) -> io::Result<()> {
    let mut entry = json!({
        "timestamp": Local::now().to_rfc3339(),
        "pid": std::process::id(),
        "ppid": parent_pid(),
        "message": message,
    });
    if let Some(data) = data {
        entry["data"] = data;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{entry}")
}

#[cfg(unix)]
fn parent_pid() -> Option<u32> {
    // SAFETY: getppid has no preconditions and cannot fail.
    u32::try_from(unsafe { libc::getppid() }).ok()
}

#[cfg(not(unix))]
fn parent_pid() -> Option<u32> {
    None
}
