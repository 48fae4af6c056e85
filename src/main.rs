mod config;
mod console;
mod detach;
mod error;
mod instance;
mod logging;
mod trace;

use crate::config::{
    editor_invocation, ensure_config_file, load_settings, prepare_config_dir, resolve_config_dir,
    AppPaths, Settings, APP_NAME,
};
use crate::console::Console;
use crate::detach::{
    configure_detached_session, select_strategy, successor_request, DetachController,
    DetachOptions, Detachment,
};
use crate::error::AppError;
use crate::instance::{InstanceLock, LockGuard, LockState};
use crate::logging::{init_terminal_logging, level_for, terminal_logger, BufferHandler, LogPipeline, LogRouter};
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{self, Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "newpy", version, about = "New Python GitHub project launcher")]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(long, global = true)]
    foreground: bool,
    #[arg(long, global = true, hide = true)]
    detached: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Launch,
    Status,
    Stop {
        #[arg(long, default_value_t = 10)]
        timeout_sec: u64,
    },
    Paths,
    Logs {
        #[arg(long, default_value_t = false)]
        console: bool,
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Show,
    Edit,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    paths: AppPaths,
    json: bool,
    verbose: bool,
    foreground: bool,
    detached: bool,
}

fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli);

    if !matches!(cli.command, Commands::Launch) {
        init_terminal_logging(level_for(ctx.verbose));
    }
    let result = match cli.command {
        Commands::Launch => handle_launch(&ctx),
        Commands::Status => handle_status(&ctx),
        Commands::Stop { timeout_sec } => handle_stop(&ctx, timeout_sec),
        Commands::Paths => handle_paths(&ctx),
        Commands::Logs { console, lines } => handle_logs(&ctx, console, lines),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        process::exit(1);
    }

    Ok(())
}

fn build_context(cli: &Cli) -> Context {
    Context {
        paths: AppPaths::under(resolve_config_dir(cli.config_dir.as_ref())),
        json: cli.json,
        verbose: cli.verbose,
        foreground: cli.foreground,
        detached: cli.detached,
    }
}

fn handle_launch(ctx: &Context) -> Result<(), AppError> {
    prepare_config_dir(&ctx.paths.config_dir)?;
    let settings = load_settings(&ctx.paths.config_path)?;
    let level = level_for(ctx.verbose || settings.logging.verbose);

    let pipeline = LogPipeline::with_optional_buffer(
        LogRouter::new(level, Some(terminal_logger(level))),
        BufferHandler::open_or_report(),
    );
    pipeline
        .install_global()
        .map_err(|err| AppError::Process(format!("failed to install logger: {err}")))?;
    info!(
        "Starting {APP_NAME} {} (pid {})",
        env!("CARGO_PKG_VERSION"),
        process::id()
    );
    info!("Config directory: {}", ctx.paths.config_dir.display());
    if let Some(buffer) = pipeline.buffer() {
        debug!("Log buffer: {}", buffer.path().display());
    }

    let lock = InstanceLock::new(ctx.paths.lock_path.clone());
    if let Err(err) = startup_checks(&lock, &settings) {
        pipeline.discard_buffer();
        return Err(err);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    register_shutdown_signals(&shutdown)?;

    let strategy = select_strategy(
        env::consts::OS,
        DetachOptions {
            enabled: settings.detach.enabled,
            foreground: ctx.foreground,
            already_detached: ctx.detached,
        },
        successor_request(
            &ctx.paths.log_path,
            pipeline.buffer().map(BufferHandler::path),
        ),
    );
    let mut controller = DetachController::new(strategy, lock.clone());
    match controller.run()? {
        Detachment::Replaced {
            successor_pid,
            running,
        } => {
            if running {
                pipeline.stop_buffering();
                info!(
                    "Continuing in background process {successor_pid}; output goes to {}",
                    ctx.paths.log_path.display()
                );
            } else {
                pipeline.discard_buffer();
                info!("Background process {successor_pid} already finished");
            }
            return Ok(());
        }
        outcome => info!("Detachment finished: {outcome:?} ({:?})", controller.state()),
    }
    let _guard = LockGuard::new(lock);

    let (mut console, handle) = Console::open(&ctx.paths.console_path)?;
    let replayed = pipeline.hand_off(Arc::new(handle));
    info!(
        "Console ready at {}, {replayed} buffered lines replayed",
        console.path().display()
    );
    debug!(
        "Log routing is {:?} at {}",
        pipeline.router().mode(),
        pipeline.router().level()
    );
    let written = console.run(&shutdown)?;
    info!("Shutting down after {written} console lines");
    Ok(())
}

fn startup_checks(lock: &InstanceLock, settings: &Settings) -> Result<(), AppError> {
    lock.ensure_single_instance()?;
    check_runtime_deps(&settings.runtime.required_tools)
}

fn check_runtime_deps(tools: &[String]) -> Result<(), AppError> {
    for tool in tools {
        match which::which(tool) {
            Ok(path) => debug!("Found {tool} at {}", path.display()),
            Err(_) => {
                error!("Missing runtime dependency: {tool}. Please install it first");
                return Err(AppError::MissingDependency(tool.clone()));
            }
        }
    }
    Ok(())
}

fn register_shutdown_signals(flag: &Arc<AtomicBool>) -> Result<(), AppError> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(flag))?;
    }
    #[cfg(unix)]
    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(flag))?;
    Ok(())
}

fn lock_state_json(state: &LockState) -> serde_json::Value {
    match state {
        LockState::Absent => json!({"state": "absent", "pid": null}),
        LockState::Stale { pid } => json!({"state": "stale", "pid": pid}),
        LockState::Running { pid } => json!({"state": "running", "pid": pid}),
    }
}

fn handle_status(ctx: &Context) -> Result<(), AppError> {
    let state = InstanceLock::new(ctx.paths.lock_path.clone()).inspect();
    let mut payload = lock_state_json(&state);
    payload["lock_path"] = json!(ctx.paths.lock_path);
    payload["log_path"] = json!(ctx.paths.log_path);
    output(ctx, payload)
}

#[cfg(unix)]
fn handle_stop(ctx: &Context, timeout_sec: u64) -> Result<(), AppError> {
    use std::time::{Duration, Instant};

    let lock = InstanceLock::new(ctx.paths.lock_path.clone());
    let pid = match lock.inspect() {
        LockState::Running { pid } => pid,
        state => {
            return Err(AppError::Process(format!(
                "no running instance ({})",
                lock_state_json(&state)["state"]
                    .as_str()
                    .unwrap_or("unknown")
            )))
        }
    };
    let raw_pid = libc::pid_t::try_from(pid)
        .map_err(|_| AppError::Process(format!("pid {pid} out of range")))?;
    // SAFETY: plain signal delivery to a pid read from our own lock file.
    if unsafe { libc::kill(raw_pid, libc::SIGTERM) } != 0 {
        return Err(AppError::Io(io::Error::last_os_error()));
    }
    info!("Sent SIGTERM to {pid}");

    // The lock disappearing is the signal: an unreaped child would still
    // answer kill(0).
    let deadline = Instant::now() + Duration::from_secs(timeout_sec);
    while lock.inspect() == (LockState::Running { pid }) {
        if Instant::now() >= deadline {
            return Err(AppError::Process(format!(
                "instance {pid} did not stop within {timeout_sec}s"
            )));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    output(ctx, json!({"stopped": true, "pid": pid}))
}

#[cfg(not(unix))]
fn handle_stop(_ctx: &Context, _timeout_sec: u64) -> Result<(), AppError> {
    Err(AppError::Process(
        "stop is only supported on unix hosts; close the console window instead".to_string(),
    ))
}

fn handle_paths(ctx: &Context) -> Result<(), AppError> {
    output(
        ctx,
        json!({
            "config_dir": ctx.paths.config_dir,
            "config_path": ctx.paths.config_path,
            "config_exists": ctx.paths.config_path.is_file(),
            "lock_path": ctx.paths.lock_path,
            "log_path": ctx.paths.log_path,
            "console_path": ctx.paths.console_path,
        }),
    )
}

fn handle_logs(ctx: &Context, console: bool, lines: usize) -> Result<(), AppError> {
    let target = if console {
        &ctx.paths.console_path
    } else {
        &ctx.paths.log_path
    };
    if !target.exists() {
        return Err(AppError::Process(format!(
            "log not found: {}",
            target.display()
        )));
    }
    if ctx.json {
        return output(ctx, json!({"path": target}));
    }
    let content = fs::read_to_string(target)?;
    let lines_vec: Vec<&str> = content.lines().collect();
    let start = lines_vec.len().saturating_sub(lines);
    for line in &lines_vec[start..] {
        println!("{}", line);
    }
    Ok(())
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), AppError> {
    prepare_config_dir(&ctx.paths.config_dir)?;
    match command {
        ConfigCommand::Init => {
            let created = ensure_config_file(&ctx.paths.config_path)?;
            output(
                ctx,
                json!({"path": ctx.paths.config_path, "created": created}),
            )
        }
        ConfigCommand::Show => {
            let settings = load_settings(&ctx.paths.config_path)?;
            if ctx.json {
                output(ctx, serde_json::to_value(&settings)?)
            } else {
                print!("{}", serde_yaml::to_string(&settings)?);
                Ok(())
            }
        }
        ConfigCommand::Edit => {
            let settings = load_settings(&ctx.paths.config_path)?;
            edit_config_file(ctx, &settings)
        }
    }
}

fn edit_config_file(ctx: &Context, settings: &Settings) -> Result<(), AppError> {
    let path = &ctx.paths.config_path;
    let (program, args) = editor_invocation(env::consts::OS, &settings.editor, path)?;
    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    configure_detached_session(&mut cmd);
    match cmd.spawn() {
        Ok(child) => {
            info!("Opened {} with {program} (pid {})", path.display(), child.id());
            output(ctx, json!({"path": path, "editor": program, "pid": child.id()}))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!("Editor not found: {program}");
            Err(editor_missing(&program, path))
        }
        Err(err) => Err(AppError::Process(format!(
            "failed to launch editor {program}: {err}"
        ))),
    }
}

fn editor_missing(program: &str, path: &Path) -> AppError {
    AppError::Process(format!(
        "editor not found: {program}. Please install it or edit {} manually",
        path.display()
    ))
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), AppError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), AppError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx_in(dir: &Path) -> Context {
        Context {
            paths: AppPaths::under(dir.to_path_buf()),
            json: true,
            verbose: false,
            foreground: false,
            detached: false,
        }
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["newpy", "launch", "--foreground", "-v", "--detached"]);
        assert!(matches!(cli.command, Commands::Launch));
        assert!(cli.foreground);
        assert!(cli.verbose);
        assert!(cli.detached);
    }

    #[test]
    fn cli_parses_logs_options() {
        let cli = Cli::parse_from(["newpy", "logs", "--console", "--lines", "5"]);
        match cli.command {
            Commands::Logs { console, lines } => {
                assert!(console);
                assert_eq!(lines, 5);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn missing_tool_is_reported_by_name() {
        let err = check_runtime_deps(&["newpy-surely-missing-tool".to_string()]).unwrap_err();
        assert!(matches!(err, AppError::MissingDependency(ref tool) if tool == "newpy-surely-missing-tool"));
        check_runtime_deps(&[]).unwrap();
    }

    #[test]
    fn lock_state_serializes_for_status() {
        assert_eq!(lock_state_json(&LockState::Absent)["state"], "absent");
        assert_eq!(lock_state_json(&LockState::Stale { pid: Some(7) })["pid"], 7);
        assert_eq!(lock_state_json(&LockState::Running { pid: 9 })["state"], "running");
    }

    #[test]
    fn startup_checks_refuse_a_live_lock() {
        let dir = tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        fs::write(&ctx.paths.lock_path, process::id().to_string()).unwrap();
        let settings = Settings {
            runtime: crate::config::RuntimeSettings {
                required_tools: Vec::new(),
            },
            ..Settings::default()
        };
        let lock = InstanceLock::new(ctx.paths.lock_path.clone());
        assert!(matches!(
            startup_checks(&lock, &settings),
            Err(AppError::AlreadyRunning { .. })
        ));
    }

    #[test]
    fn editor_error_names_the_config_file() {
        let err = editor_missing("gedit", Path::new("/tmp/config.yaml"));
        let text = err.to_string();
        assert!(text.contains("editor not found: gedit"));
        assert!(text.contains("/tmp/config.yaml"));
    }
}
