//! Persisted OAuth credentials.
//!
//! The record is always read and written as a whole. [`FileStore`] keeps it as
//! JSON under `~/.baidupan-cli/config.json`; [`MemoryStore`] keeps it in process.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<CredentialRecord, Error>;
    fn save(&self, record: &CredentialRecord) -> Result<(), Error>;
}

pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore { path: path.into() }
    }

    /// `~/.baidupan-cli/config.json`, when a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(|home| PathBuf::from(home).join(".baidupan-cli").join("config.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileStore {
    fn load(&self) -> Result<CredentialRecord, Error> {
        if !self.path.exists() {
            return Ok(CredentialRecord::default());
        }
        let data = fs::read_to_string(&self.path)?;
        match serde_json::from_str(&data) {
            Ok(record) => {
                debug!("loaded credentials from {:?}", self.path);
                Ok(record)
            }
            Err(e) => {
                warn!("ignoring unreadable credential file {:?}: {e}", self.path);
                Ok(CredentialRecord::default())
            }
        }
    }

    fn save(&self, record: &CredentialRecord) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| Error::Credential(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
            restrict(parent, 0o700)?;
        }

        // replace the file in one step so readers never see half a record
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        restrict(&tmp, 0o600)?;
        fs::rename(&tmp, &self.path)?;
        debug!("persisted credentials to {:?}", self.path);
        Ok(())
    }
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<(), Error> {
    Ok(())
}

#[derive(Default)]
pub struct MemoryStore {
    record: Mutex<CredentialRecord>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new(record: CredentialRecord) -> Self {
        MemoryStore {
            record: Mutex::new(record),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self) -> Result<CredentialRecord, Error> {
        Ok(self
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, record: &CredentialRecord) -> Result<(), Error> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = record.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
