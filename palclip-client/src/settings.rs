use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;
use tracing::warn;

/// Name of the single persisted settings slot.
pub const SETTINGS_KEY: &str = "settings";
pub const CONFIG_DIR_ENV: &str = "PALCLIP_CONFIG_DIR";

#[derive(Debug, Error)]
pub enum SettingsLoadError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum SettingsSaveError {
    #[error("create config dir failed: {0}")]
    CreateDir(#[source] io::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
}

/// One opaque text slot. Last write wins; the text is never inspected.
pub trait SettingsStorage: Send {
    /// `Ok(None)` when nothing was ever saved.
    fn load(&self) -> Result<Option<String>, SettingsLoadError>;

    fn save(&mut self, text: &str) -> Result<(), SettingsSaveError>;
}

/// Stores the slot as `<dir>/settings.txt`.
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(format!("{SETTINGS_KEY}.txt")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStorage for FileSettingsStore {
    fn load(&self) -> Result<Option<String>, SettingsLoadError> {
        load_settings_from_path(&self.path)
    }

    fn save(&mut self, text: &str) -> Result<(), SettingsSaveError> {
        save_settings_with_retry(&self.path, text)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySettingsStore {
    slot: Option<String>,
}

impl SettingsStorage for MemorySettingsStore {
    fn load(&self) -> Result<Option<String>, SettingsLoadError> {
        Ok(self.slot.clone())
    }

    fn save(&mut self, text: &str) -> Result<(), SettingsSaveError> {
        self.slot = Some(text.to_owned());
        Ok(())
    }
}

/// Resolve the configuration directory: `PALCLIP_CONFIG_DIR`, then the per-user config
/// location, then the working directory.
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|dir| !dir.is_empty()) {
        return PathBuf::from(dir);
    }

    let base = if cfg!(windows) {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config"))
    };

    base.map(|base| base.join("palclip"))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn load_settings_from_path(path: &Path) -> Result<Option<String>, SettingsLoadError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(SettingsLoadError::Read(err)),
    }
}

pub fn save_settings_to_path(path: &Path, text: &str) -> Result<(), SettingsSaveError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(SettingsSaveError::CreateDir)?;
    }

    let tmp = path.with_extension("txt.tmp");
    fs::write(&tmp, text.as_bytes()).map_err(SettingsSaveError::WriteTmp)?;

    // Windows refuses to rename over an existing file; elsewhere rename replaces it atomically.
    if cfg!(windows) && path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(SettingsSaveError::Rename)?;
    Ok(())
}

pub fn save_settings_with_retry(path: &Path, text: &str) -> Result<(), SettingsSaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt: u32 = 1;
    loop {
        match save_settings_to_path(path, text) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                warn!(attempt, path = %path.display(), "settings save failed: {err}");
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
