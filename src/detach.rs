use crate::error::AppError;
use crate::instance::InstanceLock;
use crate::logging::LOG_BUFFER_ENV;
use crate::trace::debug_to_file;
use log::{error, info};
use serde_json::json;
use std::env;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use thiserror::Error;

pub const DETACHED_FLAG: &str = "--detached";
const SUCCESSOR_SETTLE: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum DetachError {
    #[error("fork failed: {0}")]
    Fork(io::Error),
    #[error("setsid failed: {0}")]
    Session(io::Error),
    #[error("redirecting standard streams failed: {0}")]
    Redirect(io::Error),
    #[error("failed to spawn successor: {0}")]
    Spawn(io::Error),
    #[error("successor exited during startup ({0})")]
    SuccessorExited(String),
    #[cfg(not(unix))]
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachState {
    Attached,
    Detaching,
    Detached,
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detachment {
    Detached,
    PartiallyDetached { reason: String },
    NotNeeded,
    Replaced { successor_pid: u32, running: bool },
    StayedAttached,
}

impl Detachment {
    pub fn state(&self) -> DetachState {
        match self {
            Detachment::Detached
            | Detachment::PartiallyDetached { .. }
            | Detachment::NotNeeded => DetachState::Detached,
            Detachment::Replaced { .. } => DetachState::Replaced,
            Detachment::StayedAttached => DetachState::Attached,
        }
    }
}

pub trait DetachStrategy {
    fn name(&self) -> &'static str;
    fn detach(&self) -> Result<Detachment, DetachError>;
}

pub trait TerminalProbe {
    fn is_attached(&self) -> bool;
}

pub struct ControllingTerminal;

impl TerminalProbe for ControllingTerminal {
    #[cfg(unix)]
    fn is_attached(&self) -> bool {
        // SAFETY: both calls only read process group ids.
        let (own, foreground) = unsafe { (libc::getpgrp(), libc::tcgetpgrp(libc::STDOUT_FILENO)) };
        foreground != -1 && own == foreground
    }

    #[cfg(windows)]
    fn is_attached(&self) -> bool {
        use windows_sys::Win32::System::Console::GetConsoleWindow;
        // SAFETY: GetConsoleWindow takes no arguments and returns null when
        // there is no console.
        unsafe { !GetConsoleWindow().is_null() }
    }

    #[cfg(not(any(unix, windows)))]
    fn is_attached(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct SuccessorRequest {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub log_path: PathBuf,
    pub env: Vec<(OsString, OsString)>,
}

pub fn successor_request(log_path: &Path, buffer_path: Option<&Path>) -> SuccessorRequest {
    let program = env::current_exe().unwrap_or_else(|_| {
        env::args_os()
            .next()
            .map_or_else(|| PathBuf::from("newpy"), PathBuf::from)
    });
    let mut args: Vec<OsString> = env::args_os().skip(1).collect();
    args.push(OsString::from(DETACHED_FLAG));
    SuccessorRequest {
        program,
        args,
        log_path: log_path.to_path_buf(),
        env: buffer_path
            .map(|path| {
                (
                    OsString::from(LOG_BUFFER_ENV),
                    path.as_os_str().to_owned(),
                )
            })
            .into_iter()
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Successor {
    pub pid: u32,
    pub running: bool,
}

pub trait SuccessorSpawner {
    fn spawn(&self, request: &SuccessorRequest) -> Result<Successor, DetachError>;
}

pub struct ProcessSpawner {
    settle: Duration,
}

impl Default for ProcessSpawner {
    fn default() -> Self {
        Self {
            settle: SUCCESSOR_SETTLE,
        }
    }
}

impl SuccessorSpawner for ProcessSpawner {
    fn spawn(&self, request: &SuccessorRequest) -> Result<Successor, DetachError> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_path)
            .map_err(DetachError::Redirect)?;
        let log_err = log.try_clone().map_err(DetachError::Redirect)?;

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        configure_detached_session(&mut cmd);

        let mut child = cmd.spawn().map_err(DetachError::Spawn)?;
        thread::sleep(self.settle);
        let pid = child.id();
        match child.try_wait() {
            Ok(None) => Ok(Successor { pid, running: true }),
            Ok(Some(status)) if status.success() => Ok(Successor {
                pid,
                running: false,
            }),
            Ok(Some(status)) => Err(DetachError::SuccessorExited(status.to_string())),
            Err(err) => {
                // Its state is unknown, so it must not outlive the fallback
                // to running attached.
                let _ = child.kill();
                let _ = child.wait();
                Err(DetachError::Spawn(err))
            }
        }
    }
}

#[cfg(unix)]
pub fn configure_detached_session(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: the hook runs in the forked child before exec and only calls
    // setsid, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
pub fn configure_detached_session(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    use windows_sys::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW};
    cmd.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
pub fn configure_detached_session(_cmd: &mut Command) {}

pub struct DoubleFork {
    terminal: Box<dyn TerminalProbe>,
    log_path: PathBuf,
}

impl DoubleFork {
    pub fn new(terminal: Box<dyn TerminalProbe>, log_path: PathBuf) -> Self {
        Self { terminal, log_path }
    }
}

impl DetachStrategy for DoubleFork {
    fn name(&self) -> &'static str {
        "double-fork"
    }

    fn detach(&self) -> Result<Detachment, DetachError> {
        if !self.terminal.is_attached() {
            debug_to_file("not attached to a terminal, skipping fork", None);
            return Ok(Detachment::NotNeeded);
        }
        let outcome = daemonize(&self.log_path)?;
        debug_to_file(
            "daemonized",
            Some(json!({
                "log_path": self.log_path.display().to_string(),
                "outcome": format!("{outcome:?}"),
            })),
        );
        Ok(outcome)
    }
}

// Every fallible open happens before the first fork, so a failure there
// leaves the launching process attached and intact. After the first fork the
// launching process is gone, and later failures leave a partial detach.
#[cfg(unix)]
fn daemonize(log_path: &Path) -> Result<Detachment, DetachError> {
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    let devnull = File::open("/dev/null").map_err(DetachError::Redirect)?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(DetachError::Redirect)?;
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    fork_and_exit_parent()?;
    let finish = || -> Result<(), DetachError> {
        // SAFETY: setsid has no memory-safety preconditions.
        if unsafe { libc::setsid() } == -1 {
            return Err(DetachError::Session(io::Error::last_os_error()));
        }
        fork_and_exit_parent()?;
        if let Err(err) = env::set_current_dir("/") {
            debug_to_file("chdir / failed", Some(json!({"error": err.to_string()})));
        }
        redirect(devnull.as_raw_fd(), libc::STDIN_FILENO)?;
        redirect(log.as_raw_fd(), libc::STDOUT_FILENO)?;
        redirect(log.as_raw_fd(), libc::STDERR_FILENO)
    };
    match finish() {
        Ok(()) => Ok(Detachment::Detached),
        Err(err) => Ok(Detachment::PartiallyDetached {
            reason: err.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn daemonize(_log_path: &Path) -> Result<Detachment, DetachError> {
    Err(DetachError::Unsupported("fork"))
}

#[cfg(unix)]
fn fork_and_exit_parent() -> Result<(), DetachError> {
    // SAFETY: startup is still single-threaded, so the child inherits the
    // only thread and may continue running Rust code. The parent leaves via
    // _exit without running destructors or flushing shared buffers.
    match unsafe { libc::fork() } {
        -1 => Err(DetachError::Fork(io::Error::last_os_error())),
        0 => Ok(()),
        _ => unsafe { libc::_exit(0) },
    }
}

#[cfg(unix)]
fn redirect(source: libc::c_int, target: libc::c_int) -> Result<(), DetachError> {
    // SAFETY: both descriptors are open for the duration of the call.
    if unsafe { libc::dup2(source, target) } == -1 {
        return Err(DetachError::Redirect(io::Error::last_os_error()));
    }
    Ok(())
}

pub struct Respawn {
    name: &'static str,
    terminal: Option<Box<dyn TerminalProbe>>,
    spawner: Box<dyn SuccessorSpawner>,
    request: SuccessorRequest,
}

impl Respawn {
    pub fn console(
        terminal: Box<dyn TerminalProbe>,
        spawner: Box<dyn SuccessorSpawner>,
        request: SuccessorRequest,
    ) -> Self {
        Self {
            name: "console-respawn",
            terminal: Some(terminal),
            spawner,
            request,
        }
    }

    pub fn session(spawner: Box<dyn SuccessorSpawner>, request: SuccessorRequest) -> Self {
        Self {
            name: "session-respawn",
            terminal: None,
            spawner,
            request,
        }
    }
}

impl DetachStrategy for Respawn {
    fn name(&self) -> &'static str {
        self.name
    }

    fn detach(&self) -> Result<Detachment, DetachError> {
        if let Some(terminal) = &self.terminal {
            if !terminal.is_attached() {
                debug_to_file("no console attached, skipping respawn", None);
                return Ok(Detachment::NotNeeded);
            }
        }
        let successor = self.spawner.spawn(&self.request)?;
        debug_to_file(
            "successor started",
            Some(json!({
                "successor_pid": successor.pid,
                "running": successor.running,
                "strategy": self.name,
            })),
        );
        Ok(Detachment::Replaced {
            successor_pid: successor.pid,
            running: successor.running,
        })
    }
}

pub struct StayAttached {
    reason: &'static str,
}

impl DetachStrategy for StayAttached {
    fn name(&self) -> &'static str {
        self.reason
    }

    fn detach(&self) -> Result<Detachment, DetachError> {
        Ok(Detachment::NotNeeded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    DoubleFork,
    ConsoleRespawn,
    SessionRespawn,
    Stay(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct DetachOptions {
    pub enabled: bool,
    pub foreground: bool,
    pub already_detached: bool,
}

pub fn strategy_kind(os: &str, options: DetachOptions) -> StrategyKind {
    if options.already_detached {
        return StrategyKind::Stay("already-detached");
    }
    if options.foreground {
        return StrategyKind::Stay("foreground");
    }
    if !options.enabled {
        return StrategyKind::Stay("disabled");
    }
    match os {
        "windows" => StrategyKind::ConsoleRespawn,
        "macos" => StrategyKind::SessionRespawn,
        _ => StrategyKind::DoubleFork,
    }
}

pub fn build_strategy(kind: StrategyKind, request: SuccessorRequest) -> Box<dyn DetachStrategy> {
    match kind {
        StrategyKind::DoubleFork => Box::new(DoubleFork::new(
            Box::new(ControllingTerminal),
            request.log_path,
        )),
        StrategyKind::ConsoleRespawn => Box::new(Respawn::console(
            Box::new(ControllingTerminal),
            Box::new(ProcessSpawner::default()),
            request,
        )),
        StrategyKind::SessionRespawn => {
            Box::new(Respawn::session(Box::new(ProcessSpawner::default()), request))
        }
        StrategyKind::Stay(reason) => Box::new(StayAttached { reason }),
    }
}

pub fn select_strategy(
    os: &str,
    options: DetachOptions,
    request: SuccessorRequest,
) -> Box<dyn DetachStrategy> {
    build_strategy(strategy_kind(os, options), request)
}

pub struct DetachController {
    strategy: Box<dyn DetachStrategy>,
    lock: InstanceLock,
    state: DetachState,
}

impl DetachController {
    pub fn new(strategy: Box<dyn DetachStrategy>, lock: InstanceLock) -> Self {
        Self {
            strategy,
            lock,
            state: DetachState::Attached,
        }
    }

    pub fn state(&self) -> DetachState {
        self.state
    }

    pub fn run(&mut self) -> Result<Detachment, AppError> {
        let name = self.strategy.name();
        info!("Detaching from terminal (strategy: {name})");
        debug_to_file("detach requested", Some(json!({"strategy": name})));
        self.state = DetachState::Detaching;

        let outcome = match self.strategy.detach() {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Failed to detach from terminal ({name}): {err}. Continuing in the foreground.");
                debug_to_file("detach failed", Some(json!({"error": err.to_string()})));
                Detachment::StayedAttached
            }
        };
        self.state = outcome.state();
        if let Detachment::PartiallyDetached { reason } = &outcome {
            error!("Left the terminal session, but detaching did not finish ({name}): {reason}");
        }

        if matches!(outcome, Detachment::Replaced { .. }) {
            return Ok(outcome);
        }
        self.lock.write_current().map_err(|err| {
            AppError::Process(format!(
                "failed to write lock file {}: {err}",
                self.lock.path().display()
            ))
        })?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::fs;
    use tempfile::tempdir;

    struct FixedTerminal(bool);

    impl TerminalProbe for FixedTerminal {
        fn is_attached(&self) -> bool {
            self.0
        }
    }

    struct FailingSpawner;

    impl SuccessorSpawner for FailingSpawner {
        fn spawn(&self, _request: &SuccessorRequest) -> Result<Successor, DetachError> {
            Err(DetachError::Spawn(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "spawn refused",
            )))
        }
    }

    #[derive(Default)]
    struct RecordingSpawner {
        requests: RefCell<Vec<SuccessorRequest>>,
    }

    impl SuccessorSpawner for std::rc::Rc<RecordingSpawner> {
        fn spawn(&self, request: &SuccessorRequest) -> Result<Successor, DetachError> {
            self.requests.borrow_mut().push(request.clone());
            Ok(Successor {
                pid: 4242,
                running: true,
            })
        }
    }

    struct FixedOutcome(Detachment);

    impl DetachStrategy for FixedOutcome {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detach(&self) -> Result<Detachment, DetachError> {
            Ok(self.0.clone())
        }
    }

    fn request_in(dir: &Path) -> SuccessorRequest {
        successor_request(&dir.join("app.log"), Some(&dir.join("buffer.log")))
    }

    fn read_lock(lock: &InstanceLock) -> String {
        fs::read_to_string(lock.path()).unwrap()
    }

    #[test]
    fn not_attached_skips_fork_and_still_writes_lock() {
        let dir = tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("app.lock"));
        let strategy = DoubleFork::new(Box::new(FixedTerminal(false)), dir.path().join("app.log"));
        let mut controller = DetachController::new(Box::new(strategy), lock.clone());

        let outcome = controller.run().unwrap();
        assert_eq!(outcome, Detachment::NotNeeded);
        assert_eq!(controller.state(), DetachState::Detached);
        assert_eq!(read_lock(&lock), std::process::id().to_string());
        assert!(!dir.path().join("app.log").exists());
    }

    #[test]
    fn spawn_failure_falls_back_to_attached() {
        let dir = tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("app.lock"));
        let strategy = Respawn::session(Box::new(FailingSpawner), request_in(dir.path()));
        let mut controller = DetachController::new(Box::new(strategy), lock.clone());

        let outcome = controller.run().unwrap();
        assert_eq!(outcome, Detachment::StayedAttached);
        assert_eq!(controller.state(), DetachState::Attached);
        assert_eq!(read_lock(&lock), std::process::id().to_string());
    }

    #[test]
    fn successful_respawn_leaves_lock_to_successor() {
        let dir = tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("app.lock"));
        let spawner = std::rc::Rc::new(RecordingSpawner::default());
        let strategy = Respawn::console(
            Box::new(FixedTerminal(true)),
            Box::new(std::rc::Rc::clone(&spawner)),
            request_in(dir.path()),
        );
        let mut controller = DetachController::new(Box::new(strategy), lock.clone());

        let outcome = controller.run().unwrap();
        assert_eq!(
            outcome,
            Detachment::Replaced {
                successor_pid: 4242,
                running: true
            }
        );
        assert_eq!(controller.state(), DetachState::Replaced);
        assert!(!lock.path().exists());

        let requests = spawner.requests.borrow();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].args.last(), Some(&OsString::from(DETACHED_FLAG)));
        assert_eq!(
            requests[0].env,
            vec![(
                OsString::from(LOG_BUFFER_ENV),
                dir.path().join("buffer.log").into_os_string()
            )]
        );
    }

    #[test]
    fn console_respawn_without_console_does_not_spawn() {
        let dir = tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("app.lock"));
        let spawner = std::rc::Rc::new(RecordingSpawner::default());
        let strategy = Respawn::console(
            Box::new(FixedTerminal(false)),
            Box::new(std::rc::Rc::clone(&spawner)),
            request_in(dir.path()),
        );
        let mut controller = DetachController::new(Box::new(strategy), lock.clone());

        assert_eq!(controller.run().unwrap(), Detachment::NotNeeded);
        assert!(spawner.requests.borrow().is_empty());
        assert!(lock.path().exists());
    }

    #[test]
    fn lock_write_failure_is_reported() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let lock = InstanceLock::new(blocker.join("app.lock"));
        let mut controller = DetachController::new(
            build_strategy(StrategyKind::Stay("foreground"), request_in(dir.path())),
            lock,
        );
        let err = controller.run().unwrap_err();
        assert!(err.to_string().contains("failed to write lock file"));
    }

    #[test]
    fn partial_detach_counts_as_detached_and_writes_lock() {
        let dir = tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("app.lock"));
        let outcome = Detachment::PartiallyDetached {
            reason: "redirecting standard streams failed: EBADF".to_string(),
        };
        let mut controller =
            DetachController::new(Box::new(FixedOutcome(outcome.clone())), lock.clone());

        assert_eq!(controller.run().unwrap(), outcome);
        assert_eq!(controller.state(), DetachState::Detached);
        assert_eq!(read_lock(&lock), std::process::id().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn successor_that_finishes_during_settle_is_not_running() {
        let dir = tempdir().unwrap();
        let mut request = request_in(dir.path());
        request.program = PathBuf::from("true");
        let successor = ProcessSpawner::default().spawn(&request).unwrap();
        assert!(!successor.running);

        request.program = PathBuf::from("false");
        assert!(matches!(
            ProcessSpawner::default().spawn(&request),
            Err(DetachError::SuccessorExited(_))
        ));
    }

    #[test]
    fn successor_request_without_buffer_sets_no_env() {
        let dir = tempdir().unwrap();
        let request = successor_request(&dir.path().join("app.log"), None);
        assert!(request.env.is_empty());
        assert_eq!(request.args.last(), Some(&OsString::from(DETACHED_FLAG)));
    }

    #[test]
    fn real_spawner_reports_missing_program() {
        let dir = tempdir().unwrap();
        let mut request = request_in(dir.path());
        request.program = dir.path().join("no-such-binary");
        let result = ProcessSpawner::default().spawn(&request);
        assert!(matches!(result, Err(DetachError::Spawn(_))));
    }

    #[test]
    fn strategy_selection_per_platform() {
        let attached = DetachOptions {
            enabled: true,
            foreground: false,
            already_detached: false,
        };
        assert_eq!(strategy_kind("linux", attached), StrategyKind::DoubleFork);
        assert_eq!(strategy_kind("freebsd", attached), StrategyKind::DoubleFork);
        assert_eq!(strategy_kind("macos", attached), StrategyKind::SessionRespawn);
        assert_eq!(strategy_kind("windows", attached), StrategyKind::ConsoleRespawn);

        let successor = DetachOptions {
            already_detached: true,
            ..attached
        };
        assert_eq!(
            strategy_kind("windows", successor),
            StrategyKind::Stay("already-detached")
        );
        let foreground = DetachOptions {
            foreground: true,
            ..attached
        };
        assert_eq!(strategy_kind("linux", foreground), StrategyKind::Stay("foreground"));
        let disabled = DetachOptions {
            enabled: false,
            ..attached
        };
        assert_eq!(strategy_kind("macos", disabled), StrategyKind::Stay("disabled"));
    }

    #[test]
    fn successor_request_marks_the_successor() {
        let dir = tempdir().unwrap();
        let request = request_in(dir.path());
        assert_eq!(request.args.last(), Some(&OsString::from(DETACHED_FLAG)));
        assert_eq!(request.log_path, dir.path().join("app.log"));
    }
}
