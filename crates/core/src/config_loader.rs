use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use std::path::Path;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/Config.toml";

/// Environment variable prefix. Nested keys use `__`, e.g. `UPDOWN_STRATEGY__ENTRY_PRICE=95`.
pub const ENV_PREFIX: &str = "UPDOWN_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the strategy is invalid.
    pub fn load() -> Result<AppConfig> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration by merging a TOML file, environment variables, and an
    /// optional JSON file sitting next to the TOML file.
    ///
    /// A missing file is not an error; defaults fill any absent key.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the strategy is invalid.
    pub fn load_from(path: impl AsRef<Path>) -> Result<AppConfig> {
        let path = path.as_ref();
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .join(Json::file(path.with_extension("json")));

        Self::extract(&figment, path)
    }

    /// Loads configuration with a profile overlay (`Config.<profile>.toml`) applied
    /// on top of the base file.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the strategy is invalid.
    pub fn load_with_profile(path: impl AsRef<Path>, profile: &str) -> Result<AppConfig> {
        let path = path.as_ref();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Config");
        let overlay = path.with_file_name(format!("{stem}.{profile}.toml"));

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Toml::file(overlay))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .join(Json::file(path.with_extension("json")));

        Self::extract(&figment, path)
    }

    fn extract(figment: &Figment, path: &Path) -> Result<AppConfig> {
        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to parse configuration from {}", path.display()))?;

        config
            .strategy
            .validate()
            .context("Invalid strategy configuration")?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::load_from(dir.path().join("absent.toml")).unwrap();
        assert!(!config.strategy.enabled);
        assert_eq!(config.strategy.entry_price, dec!(96));
    }

    #[test]
    fn test_loads_toml_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "Config.toml",
            r#"
[strategy]
enabled = true
entry_price = 94
profit_target_price = 98
stop_loss_price = 90
trade_size = 5

[lifecycle]
max_consecutive_failures = 3
"#,
        );

        let config = ConfigLoader::load_from(&path).unwrap();
        assert!(config.strategy.enabled);
        assert_eq!(config.strategy.entry_price, dec!(94));
        assert_eq!(config.strategy.trade_size, dec!(5));
        assert_eq!(config.lifecycle.max_consecutive_failures, 3);
    }

    #[test]
    fn test_invalid_strategy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "Config.toml",
            r#"
[strategy]
profit_target_price = 90
stop_loss_price = 95
"#,
        );

        let err = ConfigLoader::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid strategy configuration"));
    }

    #[test]
    fn test_profile_overlay_overrides_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_config(&dir, "Config.toml", "[strategy]\ntrade_size = 2\n");
        write_config(&dir, "Config.live.toml", "[strategy]\ntrade_size = 7\n");

        let config = ConfigLoader::load_with_profile(&base, "live").unwrap();
        assert_eq!(config.strategy.trade_size, dec!(7));
    }
}
