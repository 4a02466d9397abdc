use presence_core::{CameraId, ZoneId};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Which D-Bus bus the service registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration.
///
/// Sources, lowest priority first: built-in defaults, the TOML file named by
/// `PRESENCE_CONFIG`, then `PRESENCE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite ledger.
    pub db_path: PathBuf,
    /// Zone the local tracking loop reports into.
    pub zone_id: ZoneId,
    /// Camera recorded as provenance on tracker-created entries.
    pub camera_id: Option<CameraId>,
    /// Sampling period of the tracking loop.
    pub tick_interval_ms: u64,
    /// How long a recognized person is suppressed after being logged.
    pub dedup_ttl_secs: u64,
    /// Minimum gap between two stored unknown-face captures.
    pub unknown_cooldown_secs: u64,
    /// Pixels of context around a face crop.
    pub crop_padding: u32,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Whether to run the live tracking loop at all.
    pub tracking_enabled: bool,
    pub bus: BusKind,
}

/// Shape of the optional TOML file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub db_path: Option<PathBuf>,
    pub zone_id: Option<ZoneId>,
    pub camera_id: Option<CameraId>,
    pub tick_interval_ms: Option<u64>,
    pub dedup_ttl_secs: Option<u64>,
    pub unknown_cooldown_secs: Option<u64>,
    pub crop_padding: Option<u32>,
    pub busy_timeout_ms: Option<u64>,
    pub tracking_enabled: Option<bool>,
    pub bus: Option<BusKind>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Load from the process environment and the file it points at.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("PRESENCE_CONFIG") {
            Some(path) => Some(FileConfig::from_path(Path::new(&path))?),
            None => None,
        };
        Self::from_sources(file.unwrap_or_default(), |key| std::env::var(key).ok())
    }

    /// Merge defaults, `file`, and whatever `env` returns for `PRESENCE_*` keys.
    pub fn from_sources(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let db_path = env("PRESENCE_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(&env).join("presence.db"));

        let bus = match env("PRESENCE_BUS").as_deref() {
            Some("system") => BusKind::System,
            Some("session") => BusKind::Session,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "PRESENCE_BUS",
                    message: format!("{other:?} (expected system or session)"),
                })
            }
            None => file.bus.unwrap_or(BusKind::System),
        };

        let config = Self {
            db_path,
            zone_id: env_parse(&env, "PRESENCE_ZONE_ID")?
                .or(file.zone_id)
                .unwrap_or(1),
            camera_id: env_parse(&env, "PRESENCE_CAMERA_ID")?.or(file.camera_id),
            tick_interval_ms: env_parse(&env, "PRESENCE_TICK_INTERVAL_MS")?
                .or(file.tick_interval_ms)
                .unwrap_or(3000),
            dedup_ttl_secs: env_parse(&env, "PRESENCE_DEDUP_TTL_SECS")?
                .or(file.dedup_ttl_secs)
                .unwrap_or(300),
            unknown_cooldown_secs: env_parse(&env, "PRESENCE_UNKNOWN_COOLDOWN_SECS")?
                .or(file.unknown_cooldown_secs)
                .unwrap_or(10),
            crop_padding: env_parse(&env, "PRESENCE_CROP_PADDING")?
                .or(file.crop_padding)
                .unwrap_or(presence_core::frame::CROP_PADDING),
            busy_timeout_ms: env_parse(&env, "PRESENCE_BUSY_TIMEOUT_MS")?
                .or(file.busy_timeout_ms)
                .unwrap_or(5000),
            tracking_enabled: env("PRESENCE_TRACKING_ENABLED")
                .map(|v| v != "0")
                .or(file.tracking_enabled)
                .unwrap_or(true),
            bus,
        };

        if config.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "tick_interval_ms",
                message: "must be greater than zero".into(),
            });
        }
        Ok(config)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn unknown_cooldown(&self) -> Duration {
        Duration::from_secs(self.unknown_cooldown_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

fn env_parse<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    env(key)
        .map(|v| {
            v.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                message: format!("{v:?}: {e}"),
            })
        })
        .transpose()
}
