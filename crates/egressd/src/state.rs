//! Crash safe persistence of the sender state.
//!
//! Snapshots are serialized by the caller and handed over without
//! blocking; a background writer persists the most recent one. Older
//! snapshots that were superseded before the writer got to them are
//! simply skipped.
use crate::lifecycle::ShutdownSubscription;
use anyhow::Context;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Replaces `path` with `data` so that readers only ever observe the
/// old or the new content in full.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temporary file in {}", dir.display()))?;
    temp.write_all(data)
        .with_context(|| format!("writing {}", temp.path().display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("syncing {}", temp.path().display()))?;
    temp.persist(path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

type Snapshot = Option<Arc<Vec<u8>>>;

pub struct StateStore {
    path: PathBuf,
    tx: watch::Sender<Snapshot>,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Arc<Self> {
        let (tx, _rx) = watch::channel(None);
        Arc::new(Self { path, tx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted state. A missing file is a cold start.
    pub fn load<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let state = serde_json::from_slice(&data)
            .with_context(|| format!("parsing state from {}", self.path.display()))?;
        Ok(Some(state))
    }

    /// Hands a snapshot to the background writer
    pub fn submit(&self, snapshot: Vec<u8>) {
        self.tx.send_replace(Some(Arc::new(snapshot)));
    }

    /// Writes a snapshot synchronously, bypassing the writer
    pub fn save_now(&self, snapshot: &[u8]) -> anyhow::Result<()> {
        write_atomic(&self.path, snapshot)
    }

    /// Persists submitted snapshots until shutdown
    pub async fn run_writer(self: Arc<Self>, mut shutdown: ShutdownSubscription) {
        let mut rx = self.tx.subscribe();
        // pick up anything submitted before we started
        rx.mark_changed();

        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.shutting_down() => break,
            }

            let snapshot = rx.borrow_and_update().clone();
            let Some(data) = snapshot else {
                continue;
            };
            let path = self.path.clone();
            match tokio::task::spawn_blocking(move || write_atomic(&path, &data)).await {
                Ok(Ok(())) => tracing::trace!("saved state to {}", self.path.display()),
                Ok(Err(err)) => tracing::error!("saving state: {err:#}"),
                Err(err) => tracing::error!("state writer task failed: {err:#}"),
            }
        }
    }
}
