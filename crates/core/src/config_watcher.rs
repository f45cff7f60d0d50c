use crate::config::AppConfig;
use crate::config_loader::ConfigLoader;
use anyhow::Result;
use notify::{Event, RecursiveMode, Watcher};
use std::path::PathBuf;
use tokio::sync::watch;

/// Broadcasts a fresh [`AppConfig`] whenever the watched file changes.
///
/// Reloads that fail to parse or validate are logged and dropped; receivers keep
/// the last good configuration.
pub struct ConfigWatcher {
    path: PathBuf,
    tx: watch::Sender<AppConfig>,
}

impl ConfigWatcher {
    /// Creates a new watcher for `path` with an initial configuration.
    ///
    /// Returns a tuple of the watcher and a receiver for configuration updates.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, initial_config: AppConfig) -> (Self, watch::Receiver<AppConfig>) {
        let (tx, rx) = watch::channel(initial_config);
        (
            Self {
                path: path.into(),
                tx,
            },
            rx,
        )
    }

    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Reloads the file once and publishes the result if it is valid.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or fails validation.
    pub fn reload(&self) -> Result<()> {
        let config = ConfigLoader::load_from(&self.path)?;
        self.tx.send_replace(config);
        Ok(())
    }

    /// Watches the configuration file for changes and broadcasts updates.
    ///
    /// # Errors
    ///
    /// Returns an error if file watching cannot be initiated or if the watcher task fails.
    pub async fn watch(&self) -> Result<()> {
        let tx = self.tx.clone();
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let (notify_tx, notify_rx) = std::sync::mpsc::channel();

            let mut watcher = notify::recommended_watcher(move |res: Result<Event, _>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            })?;

            watcher.watch(&path, RecursiveMode::NonRecursive)?;

            for event in notify_rx {
                if !event.kind.is_modify() {
                    continue;
                }
                tracing::info!(path = %path.display(), "Config file changed, reloading");
                match ConfigLoader::load_from(&path) {
                    Ok(new_config) => {
                        if tx.send(new_config).is_err() {
                            tracing::debug!("All config receivers dropped, stopping watcher");
                            break;
                        }
                        tracing::info!("Config reloaded successfully");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to reload config, keeping previous");
                    }
                }
            }

            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reload_publishes_new_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Config.toml");
        std::fs::write(&path, "[strategy]\ntrade_size = 2\n").unwrap();

        let (watcher, rx) = ConfigWatcher::new(&path, AppConfig::default());
        std::fs::write(&path, "[strategy]\ntrade_size = 9\n").unwrap();
        watcher.reload().unwrap();

        assert_eq!(rx.borrow().strategy.trade_size, dec!(9));
    }

    #[test]
    fn test_invalid_reload_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Config.toml");
        std::fs::write(&path, "[strategy]\ntrade_size = -1\n").unwrap();

        let (watcher, rx) = ConfigWatcher::new(&path, AppConfig::default());
        assert!(watcher.reload().is_err());
        assert_eq!(rx.borrow().strategy.trade_size, dec!(2));
    }
}
