use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use directories::BaseDirs;
use log::debug;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_API_KEY_ENV_VAR: &str = "BFL_API_KEY";
pub const DEFAULT_BASE_URL: &str = "https://api.bfl.ml";
pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 1.0;
pub const DOTENV_FILE_NAME: &str = ".env";

const CONFIG_DIR_NAME: &str = ".fluxgen";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine configuration directory")]
    ConfigDirUnavailable,
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to deserialize configuration: {0}")]
    Deserialize(#[from] toml::de::Error),
    #[error("{field} must be a non-negative number of seconds (got {value})")]
    InvalidDuration { field: &'static str, value: f64 },
    #[error("{field} must be greater than zero (got {value})")]
    ZeroPollInterval { field: &'static str, value: f64 },
    #[error("failed to parse {}: {source}", path.display())]
    Dotenv {
        path: PathBuf,
        #[source]
        source: dotenv::Error,
    },
    #[error("{var} not found in environment variables")]
    MissingApiKey { var: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output_dir: String,
    pub poll_interval_secs: f64,
    pub max_wait_secs: Option<f64>,
    pub bfl_api: BflApiConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BflApiConfig {
    pub base_url: String,
    pub api_key_env_var: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_wait_secs: None,
            bfl_api: BflApiConfig::default(),
        }
    }
}

impl Default for BflApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key_env_var: DEFAULT_API_KEY_ENV_VAR.to_string(),
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        poll_interval_seconds("poll_interval_secs", self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Result<Option<Duration>, ConfigError> {
        self.max_wait_secs
            .map(|value| seconds("max_wait_secs", value))
            .transpose()
    }
}

/// Converts a user-supplied number of seconds, rejecting negative and non-finite values.
pub fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration { field, value })
}

/// Like [`seconds`], but a poll interval of zero is rejected as well.
pub fn poll_interval_seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    let interval = seconds(field, value)?;
    if interval.is_zero() {
        return Err(ConfigError::ZeroPollInterval { field, value });
    }
    Ok(interval)
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub config: Config,
    pub path: PathBuf,
    pub found: bool,
}

/// Loads `~/.fluxgen/config.toml`, falling back to defaults when the file is absent.
///
/// The file is never created; every key is optional.
pub fn load() -> Result<LoadOutcome, ConfigError> {
    let path = config_file_path()?;
    let (config, found) = load_from(&path)?;
    Ok(LoadOutcome {
        config,
        path,
        found,
    })
}

pub fn load_from(path: &Path) -> Result<(Config, bool), ConfigError> {
    if !path.exists() {
        debug!("no configuration file at {}", path.display());
        return Ok((Config::default(), false));
    }

    let contents = fs::read_to_string(path)?;
    let config = toml::from_str(&contents)?;
    debug!("loaded configuration from {}", path.display());
    Ok((config, true))
}

fn config_file_path() -> Result<PathBuf, ConfigError> {
    let base_dirs = BaseDirs::new().ok_or(ConfigError::ConfigDirUnavailable)?;
    Ok(base_dirs
        .home_dir()
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME))
}

/// The two optional `.env` files consulted for credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DotenvFiles {
    pub user: Option<PathBuf>,
    pub project: Option<PathBuf>,
}

impl DotenvFiles {
    /// Looks for `~/.env` and the nearest `.env` in the working directory or its ancestors.
    pub fn discover() -> Result<Self, ConfigError> {
        let home = BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
        let cwd = std::env::current_dir()?;
        Ok(Self::discover_from(home.as_deref(), &cwd))
    }

    pub fn discover_from(home: Option<&Path>, cwd: &Path) -> Self {
        let user = home
            .map(|dir| dir.join(DOTENV_FILE_NAME))
            .filter(|path| path.is_file());
        let project = cwd
            .ancestors()
            .map(|dir| dir.join(DOTENV_FILE_NAME))
            .find(|path| path.is_file());

        Self { user, project }
    }

    /// Parses both files without touching the process environment.
    ///
    /// Project-level entries replace user-level entries with the same key.
    pub fn load(&self) -> Result<DotenvValues, ConfigError> {
        let mut values = HashMap::new();

        for path in [&self.user, &self.project].into_iter().flatten() {
            let entries = dotenv::from_path_iter(path).map_err(|source| ConfigError::Dotenv {
                path: path.clone(),
                source,
            })?;

            for entry in entries {
                let (key, value) = entry.map_err(|source| ConfigError::Dotenv {
                    path: path.clone(),
                    source,
                })?;
                values.insert(key, value);
            }
            debug!("read environment entries from {}", path.display());
        }

        Ok(DotenvValues { values })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DotenvValues {
    values: HashMap<String, String>,
}

impl DotenvValues {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

impl FromIterator<(String, String)> for DotenvValues {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Resolves the API key named `var`.
///
/// The process environment takes precedence over values read from `.env`
/// files. Blank values are treated as missing.
pub fn resolve_api_key(var: &str, dotenv: &DotenvValues) -> Result<String, ConfigError> {
    let from_process = std::env::var(var).ok();

    [from_process.as_deref(), dotenv.get(var)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ConfigError::MissingApiKey {
            var: var.to_string(),
        })
}
