//! TOML settings file.
//!
//! ```toml
//! [connection]
//! username = "demo"
//! password = "secret"
//! tmx = "10.0.0.1:10.0.0.2"
//! timeout_secs = 30
//!
//! [gd]
//! client_name = "demo-client"
//! max_outstanding = 1000
//! saturation = "reject"
//!
//! [host]
//! max_worker_threads = 64
//! work_pool_capacity = 64
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use super::options::{ConnectOptions, DEFAULT_GD_MAX_OUTSTANDING};
use crate::session::SaturationPolicy;

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Syntax(#[from] toml::de::Error),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeSettings {
    pub connection: ConnectionSettings,
    pub gd: GdSettings,
    pub host: HostSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionSettings {
    pub username: Option<String>,
    pub password: Option<String>,
    /// `primary[:secondary]`
    pub tmx: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GdSettings {
    pub client_name: Option<String>,
    pub max_outstanding: u32,
    pub saturation: SaturationPolicy,
}

impl Default for GdSettings {
    fn default() -> Self {
        Self {
            client_name: None,
            max_outstanding: DEFAULT_GD_MAX_OUTSTANDING,
            saturation: SaturationPolicy::default(),
        }
    }
}

/// Host loop and worker pool tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostSettings {
    /// Upper bound on concurrently running blocking native calls.
    pub max_worker_threads: usize,
    /// Idle work-request records kept for reuse.
    pub work_pool_capacity: usize,
    /// How long dropping the host loop waits for running native calls.
    pub shutdown_grace_ms: u64,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            max_worker_threads: 64,
            work_pool_capacity: 64,
            shutdown_grace_ms: 1000,
        }
    }
}

impl BridgeSettings {
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        let settings: BridgeSettings = toml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.gd.max_outstanding == 0 {
            return Err(ConfigError::Invalid {
                message: "gd.max_outstanding must be at least 1".to_string(),
            });
        }
        if self.host.max_worker_threads == 0 {
            return Err(ConfigError::Invalid {
                message: "host.max_worker_threads must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Build connect options, letting explicit arguments override the file.
    pub fn connect_options(
        &self,
        username: Option<&str>,
        password: Option<&str>,
        tmx: Option<&str>,
        gd_client_name: Option<&str>,
    ) -> ConfigResult<ConnectOptions> {
        let username = username
            .map(str::to_string)
            .or_else(|| self.connection.username.clone());
        let password = password
            .map(str::to_string)
            .or_else(|| self.connection.password.clone());
        let tmx = tmx.map(str::to_string).or_else(|| self.connection.tmx.clone());
        let Some(tmx) = tmx else {
            return Err(ConfigError::Invalid {
                message: "Missing TMX".to_string(),
            });
        };
        let (primary, secondary) = split_tmx(&tmx);

        let mut options = ConnectOptions::new(
            username.unwrap_or_default(),
            password.unwrap_or_default(),
            primary,
        )
        .with_saturation_policy(self.gd.saturation);
        if let Some(secondary) = secondary {
            options = options.with_secondary_tmx(secondary);
        }
        if let Some(secs) = self.connection.timeout_secs {
            options = options.with_timeout(Duration::from_secs(secs));
        }
        let client = gd_client_name
            .map(str::to_string)
            .or_else(|| self.gd.client_name.clone());
        if let Some(client) = client {
            options = options.with_guaranteed_delivery(client, self.gd.max_outstanding);
        }
        Ok(options)
    }
}

/// Split `primary[:secondary]`.
pub fn split_tmx(tmx: &str) -> (String, Option<String>) {
    match tmx.split_once(':') {
        Some((primary, secondary)) if !secondary.is_empty() => {
            (primary.to_string(), Some(secondary.to_string()))
        }
        Some((primary, _)) => (primary.to_string(), None),
        None => (tmx.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let settings = BridgeSettings::from_toml_str("").unwrap();
        assert_eq!(settings, BridgeSettings::default());
        assert_eq!(settings.gd.max_outstanding, 1000);
        assert_eq!(settings.host.max_worker_threads, 64);
    }

    #[test]
    fn full_file_parses() {
        let settings = BridgeSettings::from_toml_str(
            r#"
            [connection]
            username = "demo"
            password = "secret"
            tmx = "10.0.0.1:10.0.0.2"
            timeout_secs = 5

            [gd]
            client_name = "client"
            max_outstanding = 2
            saturation = "overwrite"

            [host]
            work_pool_capacity = 8
            "#,
        )
        .unwrap();
        assert_eq!(settings.gd.saturation, SaturationPolicy::Overwrite);
        assert_eq!(settings.host.work_pool_capacity, 8);

        let options = settings.connect_options(None, None, None, None).unwrap();
        assert_eq!(options.username, "demo");
        assert_eq!(options.primary_tmx, "10.0.0.1");
        assert_eq!(options.secondary_tmx.as_deref(), Some("10.0.0.2"));
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.gd_client_name.as_deref(), Some("client"));
        assert_eq!(options.gd_max_outstanding, 2);
    }

    #[test]
    fn arguments_override_file_values() {
        let settings = BridgeSettings::from_toml_str(
            r#"
            [connection]
            username = "file-user"
            tmx = "file-tmx"
            "#,
        )
        .unwrap();
        let options = settings
            .connect_options(Some("cli-user"), Some("pw"), Some("cli-tmx"), None)
            .unwrap();
        assert_eq!(options.username, "cli-user");
        assert_eq!(options.primary_tmx, "cli-tmx");
        assert!(!options.gd_enabled());
    }

    #[test]
    fn missing_tmx_is_reported() {
        let err = BridgeSettings::default()
            .connect_options(Some("u"), Some("p"), None, None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn unknown_keys_and_zero_window_are_rejected() {
        assert!(matches!(
            BridgeSettings::from_toml_str("[gd]\nwindow = 3\n"),
            Err(ConfigError::Syntax(_))
        ));
        assert!(matches!(
            BridgeSettings::from_toml_str("[gd]\nmax_outstanding = 0\n"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = BridgeSettings::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn split_tmx_forms() {
        assert_eq!(split_tmx("a"), ("a".to_string(), None));
        assert_eq!(split_tmx("a:b"), ("a".to_string(), Some("b".to_string())));
        assert_eq!(split_tmx("a:"), ("a".to_string(), None));
    }
}
