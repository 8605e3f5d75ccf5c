//! Hot reload of the configuration file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::ResilienceConfig;

/// Watches one configuration file and forwards each new valid version.
///
/// Files that fail to parse or validate are logged and skipped; the running
/// configuration stays in force. Saves that leave the content unchanged are
/// not forwarded.
pub struct ConfigWatcher {
    path: PathBuf,
    current: Option<ResilienceConfig>,
    update_tx: mpsc::UnboundedSender<ResilienceConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiving end of its updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ResilienceConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            current: load_config(path).ok(),
            update_tx,
        };
        (watcher, update_rx)
    }

    /// Start watching. Updates stop when the returned handle is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let ConfigWatcher {
            path,
            current,
            update_tx,
        } = self;
        let reload_path = path.clone();
        let last = Mutex::new(current);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = %e, "Config watch error");
                        return;
                    }
                };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }

                let config = match load_config(&reload_path) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::error!(
                            path = %reload_path.display(),
                            error = %e,
                            "Config reload rejected, keeping current configuration"
                        );
                        return;
                    }
                };

                let Ok(mut last) = last.lock() else { return };
                if last.as_ref() == Some(&config) {
                    return;
                }
                tracing::info!(path = %reload_path.display(), sites = config.sites.len(), "Config change detected");
                *last = Some(config.clone());
                let _ = update_tx.send(config);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %path.display(), "Config watcher started");
        Ok(watcher)
    }
}
