use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use gpures::Policy;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace, warn};

const TELEMETRY_INTERVAL_JSON: &str = "telemetry_interval";
const REPORT_INTERVAL_JSON: &str = "report_interval";
const REPORT_PATH_JSON: &str = "report_path";
const POLICY_JSON: &str = "policy";

const DEFAULT_TELEMETRY_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to open configuration file {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        error: io::Error,
    },
    #[error("Failed to parse configuration file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        error: serde_json::Error,
    },
}

// Daemon settings, every field falls back to a default on its own
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub telemetry_interval: Duration,
    pub report_interval: Duration,

    // Requests go to stdout when no path is given
    pub report_path: Option<PathBuf>,

    pub policy: Policy,
}

// Read the daemon Json configuration
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: &Path) -> Self {
        Self {
            config_path: config_path.to_path_buf(),
        }
    }

    // Load the configuration file, a missing file is not an error
    // and results in the default configuration
    pub fn load(&self) -> Result<DaemonConfig, ConfigError> {
        debug!("Parsing config file at: {:?}", self.config_path);

        let file = match File::open(&self.config_path) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "Configuration file {:?} not found, using defaults",
                    self.config_path
                );

                return Ok(DaemonConfig::default());
            }
            Err(error) => {
                return Err(ConfigError::Open {
                    path: self.config_path.clone(),
                    error,
                });
            }
        };

        let config_json: Value = serde_json::from_reader(BufReader::new(file))
            .map_err(|error| ConfigError::Parse {
                path: self.config_path.clone(),
                error,
            })?;

        let config = Self::parse_config(&config_json);
        trace!("Current config: {:?}", config);

        Ok(config)
    }

    // Parse every section separately so that one broken
    // entry does not discard the rest of the file
    pub fn parse_config(config_json: &Value) -> DaemonConfig {
        let mut config = DaemonConfig::default();

        if let Some(interval) =
            Self::parse_interval(config_json, TELEMETRY_INTERVAL_JSON)
        {
            config.telemetry_interval = interval;
        }

        if let Some(interval) =
            Self::parse_interval(config_json, REPORT_INTERVAL_JSON)
        {
            config.report_interval = interval;
        }

        match &config_json[REPORT_PATH_JSON] {
            Value::Null => {}
            Value::String(path) => config.report_path = Some(PathBuf::from(path)),
            other => warn!("Invalid {REPORT_PATH_JSON}: {other}, ignoring it"),
        }

        if !config_json[POLICY_JSON].is_null() {
            match serde_json::from_value(config_json[POLICY_JSON].clone()) {
                Ok(policy) => config.policy = policy,
                Err(err) => {
                    warn!("Failed to parse policy: {err}, every GPU is disabled")
                }
            }
        }

        config
    }

    // Intervals are given in seconds and must be positive
    fn parse_interval(config_json: &Value, key: &str) -> Option<Duration> {
        let value = &config_json[key];

        if value.is_null() {
            return None;
        }

        match value.as_f64() {
            Some(secs) if secs.is_finite() && secs > 0. => {
                Some(Duration::from_secs_f64(secs))
            }
            _ => {
                warn!("Invalid {key}: {value}, using the default");
                None
            }
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            telemetry_interval: DEFAULT_TELEMETRY_INTERVAL,
            report_interval: DEFAULT_REPORT_INTERVAL,
            report_path: None,
            policy: Policy::default(),
        }
    }
}
