//! Configuration file watcher for hot reload.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::SocketEngineConfig;

/// Re-reads the config file and publishes it when valid. Cloned into the
/// file watcher and the SIGHUP handler.
#[derive(Debug, Clone)]
pub struct ConfigReloader {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<SocketEngineConfig>,
}

impl ConfigReloader {
    /// Returns true when a new configuration was published.
    pub fn reload(&self, trigger: &'static str) -> bool {
        match load_config(&self.path) {
            Ok(config) => {
                tracing::info!(target: "program_flow", path = ?self.path, trigger, "Configuration reloaded");
                self.update_tx.send(config).is_ok()
            }
            Err(e) => {
                tracing::error!(
                    target: "exceptions",
                    path = ?self.path,
                    trigger,
                    error = %e,
                    "Failed to reload config, keeping current configuration"
                );
                false
            }
        }
    }
}

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    reloader: ConfigReloader,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<SocketEngineConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let reloader = ConfigReloader {
            path: path.to_path_buf(),
            update_tx,
        };
        (
            Self {
                path: path.to_path_buf(),
                reloader,
            },
            update_rx,
        )
    }

    pub fn reloader(&self) -> ConfigReloader {
        self.reloader.clone()
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let reloader = self.reloader.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    reloader.reload("file_change");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(target: "exceptions", error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(target: "program_flow", path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("socket-engine-watch-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("engine-{}.toml", contents.len()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn reload_publishes_valid_config() {
        let path = scratch("[listener]\nports = [9100]\n");
        let (watcher, mut rx) = ConfigWatcher::new(&path);
        assert!(watcher.reloader().reload("test"));
        assert_eq!(rx.try_recv().unwrap().listener.ports, vec![9100]);
    }

    #[test]
    fn reload_keeps_quiet_on_invalid_config() {
        let path = scratch("[timeouts]\nconnect_ms = 0\n");
        let (watcher, mut rx) = ConfigWatcher::new(&path);
        assert!(!watcher.reloader().reload("test"));
        assert!(rx.try_recv().is_err());
    }
}
