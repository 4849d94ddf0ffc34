use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_URL: &str = "https://api.dou.app/api";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LOGOUT_GUARD_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_USER_AGENT: &str = "dou-rs/0.1.0";

const API_URL_ENV: &str = "DOU_API_URL";
const TIMEOUT_ENV: &str = "DOU_TIMEOUT_SECS";
const CONFIG_DIR_ENV: &str = "DOU_CONFIG_DIR";

/// Settings shared by the API client, the refresh client and the session service.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    pub timeout: Duration,
    /// How long the forced-logout guard stays armed after a failed refresh.
    pub logout_guard_delay: Duration,
    pub user_agent: String,
}

impl ClientConfig {
    pub fn new(api_url: Url) -> Self {
        Self {
            api_url,
            timeout: DEFAULT_TIMEOUT,
            logout_guard_delay: DEFAULT_LOGOUT_GUARD_DELAY,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }

    /// Parse the base URL, e.g. a mock server address in tests.
    pub fn parse(api_url: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(Url::parse(api_url)?))
    }

    /// Build a configuration from `DOU_API_URL` and `DOU_TIMEOUT_SECS`, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = match env::var(API_URL_ENV) {
            Ok(value) if !value.trim().is_empty() => value,
            _ => DEFAULT_API_URL.to_owned(),
        };
        let mut config = Self::parse(&api_url)?;

        if let Ok(raw) = env::var(TIMEOUT_ENV) {
            let secs = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidTimeout(raw.clone()))?;
            config.timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_logout_guard_delay(mut self, delay: Duration) -> Self {
        self.logout_guard_delay = delay;
        self
    }

    pub fn with_user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Resolve an API path (`"posts/"`, `"/auth/refresh/"`) against the base URL.
    ///
    /// The base URL is treated as a directory even when it lacks a trailing slash, so
    /// `https://host/api` + `auth/refresh/` yields `https://host/api/auth/refresh/`.
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        let mut base = self.api_url.clone();
        if !base.path().ends_with('/') {
            let dir = format!("{}/", base.path());
            base.set_path(&dir);
        }
        base.join(path.trim_start_matches('/'))
    }

    /// Whether `url` shares the base URL's origin and sits under its path.
    ///
    /// Absolute links handed back by the server (pagination `next`) resolve to whatever
    /// host they name, so anything carrying the bearer token is checked against this.
    pub fn is_within_base(&self, url: &Url) -> bool {
        let base = &self.api_url;
        if url.scheme() != base.scheme()
            || url.host_str() != base.host_str()
            || url.port_or_known_default() != base.port_or_known_default()
        {
            return false;
        }
        let dir = base.path().trim_end_matches('/');
        let path = url.path();
        path == dir || path.starts_with(&format!("{dir}/"))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let api_url = Url::parse(DEFAULT_API_URL).expect("valid default API URL");
        Self::new(api_url)
    }
}

/// Application-specific configuration helpers.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Attempt to discover the persistent configuration directory, creating it if needed.
    ///
    /// `DOU_CONFIG_DIR` overrides the platform directory.
    pub fn new() -> Result<Self, ConfigError> {
        let root = match env::var_os(CONFIG_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => ProjectDirs::from("app", "dou", "dou-rs")
                .ok_or(ConfigError::MissingProjectDirs)?
                .config_dir()
                .to_path_buf(),
        };
        Self::with_root(root)
    }

    pub fn with_root(root: PathBuf) -> Result<Self, ConfigError> {
        fs::create_dir_all(&root).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the file holding the `token` / `refreshToken` pair.
    pub fn credentials_file(&self) -> PathBuf {
        self.root.join("credentials.json")
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Errors that can occur while building configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for dou-rs")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("invalid API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid timeout '{0}', expected whole seconds")]
    InvalidTimeout(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}
