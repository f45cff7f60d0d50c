pub mod config;
pub mod config_loader;
pub mod config_watcher;
pub mod types;

pub use config::{
    AppConfig, ConfigError, LifecycleConfig, PaperConfig, RedemptionConfig, StrategyConfig,
    PRICE_UNITS,
};
pub use config_loader::{ConfigLoader, DEFAULT_CONFIG_PATH, ENV_PREFIX};
pub use config_watcher::ConfigWatcher;
pub use types::Direction;
