use crate::error::AppError;
use dirs::{config_dir, home_dir};
use serde::{Deserialize, Serialize};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "new-python-gh-project";
pub const CONFIG_DIR_ENV: &str = "NEWPY_CONFIG_DIR";
pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
const CONFIG_VERSION: u32 = 1;
const DIRLOCK_FILE: &str = ".dirlock";
const DIRLOCK_MARKER: &str = "owner=newpy";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub config_path: PathBuf,
    pub lock_path: PathBuf,
    pub log_path: PathBuf,
    pub console_path: PathBuf,
}

impl AppPaths {
    pub fn under(config_dir: PathBuf) -> Self {
        Self {
            config_path: config_dir.join("config.yaml"),
            lock_path: config_dir.join("app.lock"),
            log_path: config_dir.join("app.log"),
            console_path: config_dir.join("console.log"),
            config_dir,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub version: u32,
    pub logging: LoggingSettings,
    pub detach: DetachSettings,
    pub runtime: RuntimeSettings,
    pub editor: EditorSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub verbose: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DetachSettings {
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSettings {
    pub required_tools: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EditorSettings {
    pub linux: String,
    pub macos: String,
    pub windows: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            logging: LoggingSettings::default(),
            detach: DetachSettings::default(),
            runtime: RuntimeSettings::default(),
            editor: EditorSettings::default(),
        }
    }
}

impl Default for DetachSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            required_tools: vec!["uv".to_string()],
        }
    }
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            linux: "gedit".to_string(),
            macos: "TextEdit".to_string(),
            windows: "notepad".to_string(),
        }
    }
}

pub fn resolve_config_dir(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return absolutize(path.clone());
    }
    if let Ok(path) = env::var(CONFIG_DIR_ENV) {
        if !path.trim().is_empty() {
            return absolutize(PathBuf::from(path));
        }
    }
    if let Some(base) = config_dir() {
        return base.join(APP_NAME);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push(APP_NAME);
    absolutize(base)
}

// The double fork changes directory to `/`, so every path handed to the
// detached process has to be absolute.
fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}

pub fn prepare_config_dir(dir: &Path) -> Result<(), AppError> {
    if dir.is_file() {
        return Err(AppError::Config(format!(
            "config directory {} is a file, expected a directory",
            dir.display()
        )));
    }
    let marker = dir.join(DIRLOCK_FILE);
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        fs::write(&marker, DIRLOCK_MARKER)?;
        return Ok(());
    }
    let problem = if marker.is_file() {
        let content = fs::read_to_string(&marker)?;
        if content.starts_with(DIRLOCK_MARKER) {
            return Ok(());
        }
        "bad content"
    } else if marker.is_dir() {
        "is a directory"
    } else {
        if fs::read_dir(dir)?.next().is_none() {
            fs::write(&marker, DIRLOCK_MARKER)?;
            return Ok(());
        }
        "missing"
    };
    Err(AppError::Config(format!(
        "config dir marker {}: {}. The directory {} might be owned by another app",
        marker.display(),
        problem,
        dir.display()
    )))
}

pub fn read_settings_from_str(content: &str) -> Result<Settings, AppError> {
    let settings: Settings = serde_yaml::from_str(content)?;
    if settings.version != CONFIG_VERSION {
        return Err(AppError::Config(format!(
            "unsupported config version {}",
            settings.version
        )));
    }
    for tool in &settings.runtime.required_tools {
        if tool.trim().is_empty() {
            return Err(AppError::Config(
                "runtime.required_tools must not contain empty names".to_string(),
            ));
        }
    }
    Ok(settings)
}

pub fn ensure_config_file(path: &Path) -> Result<bool, AppError> {
    if path.exists() {
        if !path.is_file() {
            return Err(AppError::Config(format!(
                "config path {} exists, but is not a file",
                path.display()
            )));
        }
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, DEFAULT_CONFIG_YAML)?;
    Ok(true)
}

pub fn load_settings(path: &Path) -> Result<Settings, AppError> {
    ensure_config_file(path)?;
    let content = fs::read_to_string(path)?;
    read_settings_from_str(&content)
}

pub fn editor_invocation(
    os: &str,
    editor: &EditorSettings,
    path: &Path,
) -> Result<(String, Vec<OsString>), AppError> {
    match os {
        "linux" => Ok((editor.linux.clone(), vec![path.as_os_str().to_owned()])),
        "macos" => Ok((
            "open".to_string(),
            vec![
                OsString::from("-a"),
                OsString::from(&editor.macos),
                path.as_os_str().to_owned(),
            ],
        )),
        "windows" => Ok((editor.windows.clone(), vec![path.as_os_str().to_owned()])),
        other => Err(AppError::Config(format!("unknown platform: {other}"))),
    }
}
