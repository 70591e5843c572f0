//! Hot reload of the config file
//!
//! The parent directory is watched rather than the file itself. Editors that
//! save through a temp file and a rename replace the file, and a watch on the
//! old file would go quiet after the first save.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppConfig;

/// Quiet period before re-reading a changed file
const SETTLE: Duration = Duration::from_millis(100);

/// Delivers every revision of the config file that loads and validates
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    updates: mpsc::Receiver<AppConfig>,
}

impl ConfigWatcher {
    /// Load `path` once, then watch it. Fails when the first load fails.
    pub async fn new(path: impl Into<PathBuf>) -> Result<(Self, Arc<AppConfig>)> {
        let path = path.into();
        let initial = AppConfig::load(&path)
            .await
            .context("Failed to load initial config")?;

        let file_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .with_context(|| format!("Config path has no file name: {}", path.display()))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, updates) = mpsc::channel(10);
        // notify calls back on its own thread, outside the runtime
        let runtime = Handle::current();
        let reload_path = path.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if touches(&event, &file_name) => {
                debug!("Config file changed ({:?})", event.kind);
                runtime.spawn(reload(reload_path.clone(), tx.clone()));
            }
            Ok(_) => {}
            Err(e) => error!("Config watch error: {}", e),
        })?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;
        info!("Watching {} for changes", path.display());

        Ok((Self { _watcher: watcher, updates }, Arc::new(initial)))
    }

    /// Wait for the next valid config. `None` once the watcher is gone.
    pub async fn next_config(&mut self) -> Option<AppConfig> {
        self.updates.recv().await
    }
}

/// Modify or create events naming the config file
fn touches(event: &Event, file_name: &OsString) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

async fn reload(path: PathBuf, tx: mpsc::Sender<AppConfig>) {
    tokio::time::sleep(SETTLE).await;

    match AppConfig::load(&path).await {
        Ok(config) => {
            info!("Configuration reloaded from {}", path.display());
            if tx.send(config).await.is_err() {
                debug!("Config watcher dropped, discarding reload");
            }
        }
        Err(e) => warn!("Keeping previous config, reload failed: {:#}", e),
    }
}
