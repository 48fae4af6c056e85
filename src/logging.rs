use env_logger::Env;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::env;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const LOG_BUFFER_ENV: &str = "NEWPY_LOG_BUFFER";

pub fn format_line(level: Level, message: impl fmt::Display) -> String {
    format!("{level}: {message}")
}

pub fn level_for(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    }
}

pub fn terminal_logger(level: LevelFilter) -> env_logger::Logger {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level.as_str()));
    builder.format_timestamp_millis();
    builder.build()
}

pub fn init_terminal_logging(level: LevelFilter) {
    let logger = terminal_logger(level);
    let max_level = logger.filter();
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(max_level);
    }
}

// Same destination the `log` facade uses for its own failures: the handler
// cannot log about itself without recursing into the router.
fn report_internal_error(context: &str, err: &io::Error) {
    eprintln!("newpy: {context}: {err}");
}

/// Receives formatted log lines on behalf of a surface owned by another thread.
///
/// Implementations are called from whichever thread emitted the record and
/// must hand the line over to the owning thread rather than mutating the
/// surface in place.
pub trait LogSurface: Send + Sync {
    fn post(&self, line: String);
}

pub trait Handler: Send + Sync {
    fn emit(&self, line: &str);
}

#[derive(Debug)]
pub struct BufferHandler {
    path: PathBuf,
}

impl BufferHandler {
    pub fn from_env() -> io::Result<Self> {
        if let Some(existing) = env::var_os(LOG_BUFFER_ENV).map(PathBuf::from) {
            if existing.is_file() {
                return Ok(Self::at(existing));
            }
        }
        let handler = Self::create_in(&env::temp_dir())?;
        env::set_var(LOG_BUFFER_ENV, handler.path());
        Ok(handler)
    }

    // Buffering is best effort: without a buffer file the startup lines only
    // reach the terminal, and launch carries on.
    pub fn open_or_report() -> Option<Self> {
        match Self::from_env() {
            Ok(handler) => Some(handler),
            Err(err) => {
                report_internal_error("log buffer unavailable, startup lines are not buffered", &err);
                None
            }
        }
    }

    pub fn create_in(dir: &Path) -> io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("newpy-buffer-")
            .suffix(".log")
            .tempfile_in(dir)?;
        let (_, path) = file.keep().map_err(|err| err.error)?;
        Ok(Self { path })
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&self) -> Vec<String> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                report_internal_error("log buffer read failed", &err);
                return Vec::new();
            }
        };
        BufReader::new(file)
            .lines()
            .collect::<io::Result<Vec<_>>>()
            .unwrap_or_else(|err| {
                report_internal_error("log buffer read failed", &err);
                Vec::new()
            })
    }

    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => report_internal_error("log buffer removal failed", &err),
        }
    }

    // No handle is kept between records so a forked or respawned process can
    // keep appending to the same file.
    fn append(&self, line: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }
}

impl Handler for BufferHandler {
    fn emit(&self, line: &str) {
        if let Err(err) = self.append(line) {
            report_internal_error("log buffer write failed", &err);
        }
    }
}

#[derive(Default)]
pub struct SurfaceHandler {
    surface: RwLock<Option<Arc<dyn LogSurface>>>,
}

impl SurfaceHandler {
    pub fn configure(&self, surface: Arc<dyn LogSurface>) {
        let mut slot = match self.surface.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(surface);
    }

    #[cfg(test)]
    pub fn is_configured(&self) -> bool {
        match self.surface.read() {
            Ok(slot) => slot.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

impl Handler for SurfaceHandler {
    fn emit(&self, line: &str) {
        let slot = match self.surface.read() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(surface) = slot.as_ref() {
            surface.post(line.to_string());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    Buffering,
    Live,
}

struct RouterState {
    mode: RoutingMode,
    buffer: Option<Arc<BufferHandler>>,
    handlers: Vec<Arc<dyn Handler>>,
}

pub struct LogRouter {
    level: LevelFilter,
    terminal: Option<env_logger::Logger>,
    state: RwLock<RouterState>,
}

fn same_handler(a: &Arc<dyn Handler>, b: &Arc<dyn Handler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl LogRouter {
    pub fn new(level: LevelFilter, terminal: Option<env_logger::Logger>) -> Self {
        Self {
            level,
            terminal,
            state: RwLock::new(RouterState {
                mode: RoutingMode::Buffering,
                buffer: None,
                handlers: Vec::new(),
            }),
        }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn max_level(&self) -> LevelFilter {
        let terminal = self
            .terminal
            .as_ref()
            .map(|terminal| terminal.filter())
            .unwrap_or(LevelFilter::Off);
        self.level.max(terminal)
    }

    pub fn mode(&self) -> RoutingMode {
        self.read_state().mode
    }

    pub fn set_buffer(&self, buffer: Arc<BufferHandler>) {
        self.write_state().buffer = Some(buffer);
    }

    pub fn release_buffer(&self) {
        self.write_state().buffer = None;
    }

    pub fn attach(&self, handler: Arc<dyn Handler>) -> bool {
        let mut state = self.write_state();
        if state
            .handlers
            .iter()
            .any(|existing| same_handler(existing, &handler))
        {
            return false;
        }
        state.handlers.push(handler);
        true
    }

    pub fn go_live(&self) -> bool {
        let mut state = self.write_state();
        if state.mode == RoutingMode::Live {
            return false;
        }
        state.mode = RoutingMode::Live;
        state.buffer = None;
        true
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RouterState> {
        match self.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RouterState> {
        match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Log for LogRouter {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
            || self
                .terminal
                .as_ref()
                .is_some_and(|terminal| terminal.enabled(metadata))
    }

    fn log(&self, record: &Record<'_>) {
        if let Some(terminal) = &self.terminal {
            if terminal.matches(record) {
                terminal.log(record);
            }
        }
        if record.level() > self.level {
            return;
        }
        let line = format_line(record.level(), record.args());
        let state = self.read_state();
        if state.mode == RoutingMode::Buffering {
            if let Some(buffer) = &state.buffer {
                buffer.emit(&line);
            }
        }
        for handler in &state.handlers {
            handler.emit(&line);
        }
    }

    fn flush(&self) {
        if let Some(terminal) = &self.terminal {
            terminal.flush();
        }
    }
}

struct GlobalLogger(Arc<LogRouter>);

impl Log for GlobalLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.0.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        self.0.log(record)
    }

    fn flush(&self) {
        self.0.flush()
    }
}

pub struct LogPipeline {
    router: Arc<LogRouter>,
    buffer: Option<Arc<BufferHandler>>,
    surface: Arc<SurfaceHandler>,
}

impl LogPipeline {
    pub fn new(router: LogRouter, buffer: BufferHandler) -> Self {
        let buffer = Arc::new(buffer);
        router.set_buffer(Arc::clone(&buffer));
        Self {
            router: Arc::new(router),
            buffer: Some(buffer),
            surface: Arc::new(SurfaceHandler::default()),
        }
    }

    pub fn unbuffered(router: LogRouter) -> Self {
        Self {
            router: Arc::new(router),
            buffer: None,
            surface: Arc::new(SurfaceHandler::default()),
        }
    }

    pub fn with_optional_buffer(router: LogRouter, buffer: Option<BufferHandler>) -> Self {
        match buffer {
            Some(buffer) => Self::new(router, buffer),
            None => Self::unbuffered(router),
        }
    }

    pub fn install_global(&self) -> Result<(), log::SetLoggerError> {
        log::set_boxed_logger(Box::new(GlobalLogger(Arc::clone(&self.router))))?;
        log::set_max_level(self.router.max_level());
        Ok(())
    }

    pub fn router(&self) -> &LogRouter {
        &self.router
    }

    pub fn buffer(&self) -> Option<&BufferHandler> {
        self.buffer.as_deref()
    }

    pub fn discard_buffer(&self) {
        self.router.release_buffer();
        if let Some(buffer) = &self.buffer {
            buffer.clear();
        }
    }

    // A parent that has handed over to a successor must stop writing to the
    // shared buffer before it reports anything else.
    pub fn stop_buffering(&self) {
        self.router.release_buffer();
    }

    // Buffered lines are already formatted as `LEVEL: message`, so they are
    // posted verbatim and bypass the router. Callers must hand off before
    // starting anything that logs from another thread.
    pub fn hand_off(&self, surface: Arc<dyn LogSurface>) -> usize {
        self.surface.configure(surface);
        let handler: Arc<dyn Handler> = self.surface.clone();
        self.router.attach(handler);
        self.router.go_live();

        let Some(buffer) = &self.buffer else {
            return 0;
        };
        let lines = buffer.read_all();
        for line in &lines {
            self.surface.emit(line);
        }
        buffer.clear();
        lines.len()
    }
}
