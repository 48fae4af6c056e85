use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("another instance is already running (pid {pid}, lock {})", lock_path.display())]
    AlreadyRunning { pid: u32, lock_path: PathBuf },
    #[error("missing runtime dependency: {0}. Please install it first")]
    MissingDependency(String),
    #[error("process error: {0}")]
    Process(String),
}
