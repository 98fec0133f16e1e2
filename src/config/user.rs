//! User configuration loading for fabric-bridge.
//!
//! User config location: $XDG_CONFIG_HOME/fabric-bridge/fabric-bridge.toml
//! Fallback: the platform config directory (`dirs::config_dir()`).

use std::path::PathBuf;

use super::settings::{BridgeSettings, ConfigResult};

/// Returns the path to the user configuration file.
///
/// The path is determined by:
/// 1. If $XDG_CONFIG_HOME is set: $XDG_CONFIG_HOME/fabric-bridge/fabric-bridge.toml
/// 2. Otherwise: <platform config dir>/fabric-bridge/fabric-bridge.toml
///
/// Returns None if no config directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(xdg) if !xdg.is_empty() => PathBuf::from(xdg),
        _ => dirs::config_dir()?,
    };
    Some(base.join("fabric-bridge").join("fabric-bridge.toml"))
}

/// Load the user configuration file if it exists.
pub fn load_user_config() -> ConfigResult<Option<BridgeSettings>> {
    let Some(path) = user_config_path() else {
        return Ok(None);
    };
    if !path.exists() {
        log::debug!(
            target: "fabric_bridge::config",
            "No user config at {}",
            path.display()
        );
        return Ok(None);
    }
    BridgeSettings::load(&path).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    struct XdgGuard(Option<std::ffi::OsString>);

    impl XdgGuard {
        fn set(value: &std::path::Path) -> Self {
            let original = env::var_os("XDG_CONFIG_HOME");
            // SAFETY: tests touching XDG_CONFIG_HOME are serialized with #[serial(xdg_env)]
            unsafe {
                env::set_var("XDG_CONFIG_HOME", value);
            }
            Self(original)
        }
    }

    impl Drop for XdgGuard {
        fn drop(&mut self) {
            // SAFETY: Same as above - restoring original env state
            unsafe {
                match self.0.take() {
                    Some(val) => env::set_var("XDG_CONFIG_HOME", val),
                    None => env::remove_var("XDG_CONFIG_HOME"),
                }
            }
        }
    }

    #[test]
    #[serial(xdg_env)]
    fn user_config_path_uses_xdg_config_home_when_set() {
        let _guard = XdgGuard::set(std::path::Path::new("/custom/config"));
        assert_eq!(
            user_config_path(),
            Some(PathBuf::from("/custom/config/fabric-bridge/fabric-bridge.toml"))
        );
    }

    #[test]
    #[serial(xdg_env)]
    fn missing_user_config_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let _guard = XdgGuard::set(dir.path());
        assert!(load_user_config().unwrap().is_none());
    }

    #[test]
    #[serial(xdg_env)]
    fn user_config_is_loaded_from_xdg_dir() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("fabric-bridge");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("fabric-bridge.toml"),
            "[connection]\nusername = \"from-file\"\n",
        )
        .unwrap();
        let _guard = XdgGuard::set(dir.path());

        let settings = load_user_config().unwrap().unwrap();
        assert_eq!(settings.connection.username.as_deref(), Some("from-file"));
    }
}
