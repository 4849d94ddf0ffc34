use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::config::ConfigLocator;

use super::{AuthError, CredentialPair};

/// Fixed names under which the two tokens are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    AccessToken,
    RefreshToken,
}

impl CredentialKey {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialKey::AccessToken => "token",
            CredentialKey::RefreshToken => "refreshToken",
        }
    }
}

/// Persistence abstraction for authentication credentials.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: CredentialKey) -> Result<Option<String>, AuthError>;
    fn set(&self, key: CredentialKey, value: &str) -> Result<(), AuthError>;
    fn remove(&self, key: CredentialKey) -> Result<(), AuthError>;

    fn access_token(&self) -> Result<Option<String>, AuthError> {
        self.get(CredentialKey::AccessToken)
    }

    fn refresh_token(&self) -> Result<Option<String>, AuthError> {
        self.get(CredentialKey::RefreshToken)
    }

    fn save_pair(&self, pair: &CredentialPair) -> Result<(), AuthError> {
        self.set(CredentialKey::AccessToken, &pair.access_token)?;
        self.set(CredentialKey::RefreshToken, &pair.refresh_token)
    }

    /// Delete both tokens. Missing entries are not an error.
    fn clear(&self) -> Result<(), AuthError> {
        self.remove(CredentialKey::AccessToken)?;
        self.remove(CredentialKey::RefreshToken)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-local store, used when nothing should touch the disk.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<CredentialKey, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: &CredentialPair) -> Self {
        let store = Self::new();
        {
            let mut entries = lock(&store.entries);
            entries.insert(CredentialKey::AccessToken, pair.access_token.clone());
            entries.insert(CredentialKey::RefreshToken, pair.refresh_token.clone());
        }
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>, AuthError> {
        Ok(lock(&self.entries).get(&key).cloned())
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), AuthError> {
        lock(&self.entries).insert(key, value.to_owned());
        Ok(())
    }

    fn remove(&self, key: CredentialKey) -> Result<(), AuthError> {
        lock(&self.entries).remove(&key);
        Ok(())
    }
}

/// Filesystem-backed credential storage located in the user configuration directory.
pub struct FileCredentialStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    guard: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(locator: ConfigLocator) -> Self {
        Self::at_path(locator.credentials_file())
    }

    pub fn at_path(path: PathBuf) -> Self {
        Self {
            path,
            guard: Mutex::new(()),
        }
    }

    pub fn with_default_locator() -> Result<Self, AuthError> {
        Ok(Self::new(ConfigLocator::new()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_envelope(&self) -> Result<CredentialEnvelope, AuthError> {
        if !self.path.exists() {
            return Ok(CredentialEnvelope::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_envelope(&self, envelope: &CredentialEnvelope) -> Result<(), AuthError> {
        if envelope.is_empty() {
            return match fs::remove_file(&self.path) {
                Ok(_) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            };
        }
        let payload = serde_json::to_string_pretty(envelope)?;
        Self::write_file(&self.path, &payload)
    }

    fn write_file(path: &Path, payload: &str) -> Result<(), AuthError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;

        // `mode` only applies on creation; tighten files left by older versions.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perm = file.metadata()?.permissions();
            if perm.mode() & 0o777 != 0o600 {
                perm.set_mode(0o600);
                fs::set_permissions(path, perm)?;
            }
        }

        file.write_all(payload.as_bytes())?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>, AuthError> {
        let _guard = lock(&self.guard);
        Ok(self.read_envelope()?.slot(key).clone())
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), AuthError> {
        let _guard = lock(&self.guard);
        let mut envelope = self.read_envelope()?;
        *envelope.slot_mut(key) = Some(value.to_owned());
        self.write_envelope(&envelope)
    }

    fn remove(&self, key: CredentialKey) -> Result<(), AuthError> {
        let _guard = lock(&self.guard);
        let mut envelope = self.read_envelope()?;
        if envelope.slot(key).is_none() {
            return Ok(());
        }
        *envelope.slot_mut(key) = None;
        self.write_envelope(&envelope)
    }

    fn clear(&self) -> Result<(), AuthError> {
        let _guard = lock(&self.guard);
        self.write_envelope(&CredentialEnvelope::default())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialEnvelope {
    #[serde(default = "envelope_version")]
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(
        default,
        rename = "refreshToken",
        skip_serializing_if = "Option::is_none"
    )]
    refresh_token: Option<String>,
}

fn envelope_version() -> u32 {
    1
}

impl CredentialEnvelope {
    fn slot(&self, key: CredentialKey) -> &Option<String> {
        match key {
            CredentialKey::AccessToken => &self.token,
            CredentialKey::RefreshToken => &self.refresh_token,
        }
    }

    fn slot_mut(&mut self, key: CredentialKey) -> &mut Option<String> {
        self.version = envelope_version();
        match key {
            CredentialKey::AccessToken => &mut self.token,
            CredentialKey::RefreshToken => &mut self.refresh_token,
        }
    }

    fn is_empty(&self) -> bool {
        self.token.is_none() && self.refresh_token.is_none()
    }
}
