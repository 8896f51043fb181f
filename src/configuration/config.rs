use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::auth::AuthMode;
use crate::error_handling::types::ConfigError;

/// Runtime configuration for the collector.
///
/// Every field can come from the command line, from the environment, or
/// from a TOML file; command-line parsing is handled by the `clap` derive
/// and file parsing by `serde`/`toml`. Environment names match what the
/// deployment already exports (`FLOW_PORT`, `FLOW_RECORD_TTL`, ...).
///
/// # Fields Overview
///
/// - `listen_host` / `listen_port`: where the query API binds
/// - `flow_record_ttl_secs`: retention for completed flows; `0` disables
///   eviction entirely
/// - `reaper_period_secs`: how often the retention sweep runs
/// - `auth_mode`: authentication strategy for the query surface
/// - `users_dir`: directory of user/password files for internal auth
/// - `origin`: site identity this collector runs at
/// - `prometheus_url`: co-located metrics store the proxy endpoints forward
///   to, e.g. `http://prometheus:9090/api/v1/`
/// - `use_cors` / `log_request_uri`: HTTP boundary toggles
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "vancollector", version, about = "Network flow collector for a virtual application network")]
#[serde(default)]
pub struct Config {
    /// Host address the query API binds to.
    #[arg(long, env = "FLOW_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Port the query API binds to.
    #[arg(long, env = "FLOW_PORT", default_value_t = 8010)]
    pub listen_port: u16,

    /// Seconds a completed flow is retained before eviction; 0 disables.
    #[arg(long, env = "FLOW_RECORD_TTL", default_value_t = 900)]
    pub flow_record_ttl_secs: u64,

    /// Seconds between retention sweeps.
    #[arg(long, default_value_t = 30)]
    pub reaper_period_secs: u64,

    /// Authentication mode for the query surface.
    #[arg(long, env = "AUTH_MODE", value_enum, default_value_t = AuthMode::Unsecured)]
    pub auth_mode: AuthMode,

    /// Directory with one file per user holding that user's password.
    #[arg(long, env = "FLOW_USERS")]
    pub users_dir: Option<PathBuf>,

    /// Identity of the site this collector runs at.
    #[arg(long, env = "VAN_SITE_ID", default_value = "unknown")]
    pub origin: String,

    /// Base URL of the co-located metrics store, e.g.
    /// `http://prometheus:9090/api/v1/`.
    #[arg(long, env = "PROMETHEUS_URL")]
    pub prometheus_url: Option<String>,

    /// Emit permissive CORS headers on API responses.
    #[arg(long, env = "USE_CORS", action = clap::ArgAction::SetTrue)]
    pub use_cors: bool,

    /// Log the URI of every API request.
    #[arg(long, env = "LOG_REQ_URI", action = clap::ArgAction::SetTrue)]
    pub log_request_uri: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8010,
            flow_record_ttl_secs: 900,
            reaper_period_secs: 30,
            auth_mode: AuthMode::Unsecured,
            users_dir: None,
            origin: "unknown".to_string(),
            prometheus_url: None,
            use_cors: false,
            log_request_uri: false,
        }
    }
}

impl Config {
    /// Parse from the command line and environment.
    pub fn from_args() -> Result<Self, ConfigError> {
        let config = Self::parse().normalized();
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML file; unset keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }

    /// A users directory implies internal auth when no mode was chosen
    /// explicitly.
    fn normalized(mut self) -> Self {
        if self.users_dir.is_some() && self.auth_mode == AuthMode::Unsecured {
            self.auth_mode = AuthMode::Internal;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_port == 0 {
            return Err(ConfigError::BadPortsRange(
                "listen_port must be non-zero".to_string(),
            ));
        }
        if self.reaper_period_secs == 0 {
            return Err(ConfigError::NotInRange(
                "reaper_period_secs must be non-zero".to_string(),
            ));
        }
        if let Some(dir) = &self.users_dir {
            if !dir.is_dir() {
                return Err(ConfigError::DirectoryDoesNotExist(format!(
                    "users directory {:?} does not exist",
                    dir
                )));
            }
        }
        if self.auth_mode == AuthMode::Internal && self.users_dir.is_none() {
            return Err(ConfigError::DirectoryDoesNotExist(
                "internal auth requires a users directory".to_string(),
            ));
        }
        Ok(())
    }

    /// Retention as a duration; zero means eviction is disabled.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.flow_record_ttl_secs as i64)
    }

    pub fn reaper_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reaper_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_port, 8010);
        assert_eq!(config.retention(), chrono::Duration::seconds(900));
    }

    #[test]
    fn zero_port_is_rejected() {
        let config = Config {
            listen_port: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadPortsRange(_))
        ));
    }

    #[test]
    fn internal_auth_needs_an_existing_users_dir() {
        let config = Config {
            auth_mode: AuthMode::Internal,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DirectoryDoesNotExist(_))
        ));

        let config = Config {
            auth_mode: AuthMode::Internal,
            users_dir: Some(PathBuf::from("/definitely/not/here")),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DirectoryDoesNotExist(_))
        ));
    }

    #[test]
    fn file_config_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "listen_port = 9999\nflow_record_ttl_secs = 60\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.listen_port, 9999);
        assert_eq!(config.flow_record_ttl_secs, 60);
        assert_eq!(config.listen_host, "0.0.0.0");
    }

    #[test]
    fn users_dir_implies_internal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            "users_dir = \"{}\"\n",
            dir.path().display()
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.auth_mode, AuthMode::Internal);
    }

    #[test]
    #[serial]
    fn environment_overrides_are_read() {
        std::env::set_var("FLOW_PORT", "8181");
        let config = Config::try_parse_from(["vancollector"]).unwrap();
        std::env::remove_var("FLOW_PORT");
        assert_eq!(config.listen_port, 8181);
    }
}
