//! Layered configuration for cubeidx.
//!
//! Config files are TOML and are read in order, later files overriding earlier
//! ones field by field: `/etc/cubeidx.toml`, `~/.cubeidx.toml`, `$CUBEIDX_CONFIG`,
//! then any paths given explicitly. Environment variables are applied last.

use crate::error::{DbTarget, Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// System-wide config file, read first when present.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/cubeidx.toml";
/// File name of the per-user config in the home directory.
pub const USER_CONFIG_NAME: &str = ".cubeidx.toml";
/// Environment variable naming an additional config file.
pub const CONFIG_PATH_ENV: &str = "CUBEIDX_CONFIG";

const DEFAULT_DATABASE: &str = "cubeidx.db";
const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;

// ============================================================================
// Config Macros
// ============================================================================

/// Apply `Option`-field overrides from a partial file onto the resolved config.
macro_rules! apply_option_overrides {
    ($src:expr, $dst:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(ref v) = $src.$field {
                $dst.$field = v.clone();
            }
        )+
    };
}

/// Which schema backend to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Core tables, field indexes, views, and role grants.
    #[default]
    Default,
    /// Everything `Default` does, plus the S3 extension tables.
    S3aio,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::S3aio => "s3aio",
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Shown by `check` and in connection errors.
    pub db_hostname: Option<String>,
    /// Shown by `check` and in connection errors.
    pub db_port: Option<u16>,
    /// Path of the SQLite database file.
    pub db_database: String,
    pub db_username: Option<String>,
    pub driver: DriverKind,
    pub busy_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_hostname: None,
            db_port: None,
            db_database: DEFAULT_DATABASE.to_string(),
            db_username: std::env::var("USER").ok().filter(|u| !u.is_empty()),
            driver: DriverKind::default(),
            busy_timeout_secs: DEFAULT_BUSY_TIMEOUT_SECS,
        }
    }
}

/// One config file as written on disk; every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialConfig {
    db_hostname: Option<String>,
    db_port: Option<u16>,
    db_database: Option<String>,
    db_username: Option<String>,
    driver: Option<DriverKind>,
    busy_timeout_secs: Option<u64>,
}

impl PartialConfig {
    fn apply_to(&self, config: &mut Config) {
        apply_option_overrides!(self, config, db_database, driver, busy_timeout_secs);
        // Optional in the resolved config too, so copy the Option itself.
        if self.db_hostname.is_some() {
            config.db_hostname = self.db_hostname.clone();
        }
        if self.db_port.is_some() {
            config.db_port = self.db_port;
        }
        if self.db_username.is_some() {
            config.db_username = self.db_username.clone();
        }
    }
}

impl Config {
    /// Host shown to the user; `localhost` when unset.
    pub fn hostname(&self) -> &str {
        self.db_hostname.as_deref().unwrap_or("localhost")
    }

    /// Connection target used for error context.
    pub fn target(&self) -> DbTarget {
        DbTarget {
            host: self.hostname().to_string(),
            port: self.db_port,
            database: self.db_database.clone(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("CUBEIDX_DB_DATABASE") {
            self.db_database = v;
        }
        if let Ok(v) = std::env::var("CUBEIDX_DB_USERNAME") {
            self.db_username = Some(v);
        }
        if let Ok(v) = std::env::var("CUBEIDX_DB_HOSTNAME") {
            self.db_hostname = Some(v);
        }
        if let Ok(v) = std::env::var("CUBEIDX_DB_PORT") {
            let port = v
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid CUBEIDX_DB_PORT: {}", v)))?;
            self.db_port = Some(port);
        }
        Ok(())
    }
}

/// Resolved config plus the list of files it was read from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub files_loaded: Vec<PathBuf>,
}

impl LoadedConfig {
    /// Load from the default search path plus `explicit` files.
    ///
    /// Default-path files are skipped when missing; explicit files must exist.
    pub fn load(explicit: &[PathBuf]) -> Result<Self> {
        let mut candidates = vec![PathBuf::from(SYSTEM_CONFIG_PATH)];
        if let Some(home) = dirs_next::home_dir() {
            candidates.push(home.join(USER_CONFIG_NAME));
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV)
            && !path.is_empty()
        {
            candidates.push(PathBuf::from(path));
        }

        let mut loaded = Self::from_files(&candidates, false)?;
        for path in explicit {
            loaded.read_file(path)?;
        }
        loaded.config.apply_env()?;
        Ok(loaded)
    }

    /// Layer exactly the given files, without consulting the environment.
    pub fn from_files(paths: &[PathBuf], required: bool) -> Result<Self> {
        let mut loaded = Self {
            config: Config::default(),
            files_loaded: Vec::new(),
        };
        for path in paths {
            if !required && !path.is_file() {
                continue;
            }
            loaded.read_file(path)?;
        }
        Ok(loaded)
    }

    fn read_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let partial: PartialConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        partial.apply_to(&mut self.config);
        log::debug!("loaded config file {}", path.display());
        self.files_loaded.push(path.to_path_buf());
        Ok(())
    }
}
