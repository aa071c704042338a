//! Durable per-stream progress.
//!
//! Two backends: a directory of `{stream}.json` files replaced atomically
//! (temp file in the same directory, fsync, rename, fsync dir), or the
//! `ingest_checkpoints` table through [`LeaderboardStore`].

use crate::database_ops::rows::CheckpointState;
use crate::database_ops::store::LeaderboardStore;
use crate::ingest::stream::{FetchMode, StreamKind};
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointBackend {
    Directory(PathBuf),
    Table,
}

pub struct CheckpointStore {
    backend: CheckpointBackend,
    store: Arc<dyn LeaderboardStore>,
}

impl CheckpointStore {
    pub fn new(backend: CheckpointBackend, store: Arc<dyn LeaderboardStore>) -> Self {
        Self { backend, store }
    }

    pub fn backend(&self) -> &CheckpointBackend {
        &self.backend
    }

    /// Stored state for `stream`, if any.
    pub async fn read(&self, stream: &str) -> Result<Option<CheckpointState>> {
        match &self.backend {
            CheckpointBackend::Directory(dir) => {
                let path = state_path(dir, stream);
                tokio::task::spawn_blocking(move || read_file(&path))
                    .await
                    .context("checkpoint read task")?
            }
            CheckpointBackend::Table => self.store.load_checkpoint(stream).await,
        }
    }

    /// Stored state, or a fresh one. By-id streams without a checkpoint start
    /// one past the highest id already in storage.
    pub async fn load(&self, kind: StreamKind) -> Result<CheckpointState> {
        if let Some(state) = self.read(kind.as_str()).await? {
            debug!(stream = %kind, cursor = state.cursor, "loaded checkpoint");
            return Ok(state);
        }
        let cursor = match kind.fetch_mode() {
            FetchMode::ById => match self.store.max_record_id().await? {
                Some(max) => max + 1,
                None => kind.initial_cursor(),
            },
            FetchMode::Paged => kind.initial_cursor(),
        };
        info!(stream = %kind, cursor, "no checkpoint; bootstrapped from storage");
        Ok(CheckpointState::new(kind.as_str(), cursor))
    }

    pub async fn save(&self, state: &CheckpointState) -> Result<()> {
        match &self.backend {
            CheckpointBackend::Directory(dir) => {
                let dir = dir.clone();
                let state = state.clone();
                tokio::task::spawn_blocking(move || write_file_atomic(&dir, &state))
                    .await
                    .context("checkpoint write task")?
            }
            CheckpointBackend::Table => self.store.save_checkpoint(state).await,
        }
    }

    pub async fn list(&self) -> Result<Vec<CheckpointState>> {
        match &self.backend {
            CheckpointBackend::Directory(_) => {
                let mut out = Vec::new();
                for kind in StreamKind::ALL {
                    if let Some(state) = self.read(kind.as_str()).await? {
                        out.push(state);
                    }
                }
                Ok(out)
            }
            CheckpointBackend::Table => self.store.list_checkpoints().await,
        }
    }

    /// Delete the stored state. Returns whether anything existed.
    pub async fn reset(&self, stream: &str) -> Result<bool> {
        match &self.backend {
            CheckpointBackend::Directory(dir) => {
                let path = state_path(dir, stream);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
                }
            }
            CheckpointBackend::Table => self.store.delete_checkpoint(stream).await,
        }
    }
}

fn state_path(dir: &Path, stream: &str) -> PathBuf {
    dir.join(format!("{stream}.json"))
}

fn read_file(path: &Path) -> Result<Option<CheckpointState>> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let state = serde_json::from_str(&text)
                .with_context(|| format!("corrupt checkpoint {}", path.display()))?;
            Ok(Some(state))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

fn write_file_atomic(dir: &Path, state: &CheckpointState) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = state_path(dir, &state.stream);
    let json = serde_json::to_string_pretty(state)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("create temp checkpoint")?;
    tmp.write_all(json.as_bytes())?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path)
        .with_context(|| format!("persist {}", path.display()))?;
    if let Ok(d) = std::fs::File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::rows::RecordRow;
    use chrono::Utc;

    fn record(original_id: i64) -> RecordRow {
        RecordRow {
            original_id,
            player_id: 1,
            map_id: 1,
            server_id: 1,
            mode: "kz_timer".into(),
            stage: 0,
            time: 1.0,
            teleports: 0,
            points: 0,
            tickrate: 128,
            record_filter_id: 0,
            replay_id: 0,
            created_on: Utc::now(),
            updated_on: Utc::now(),
        }
    }

    #[tokio::test]
    async fn directory_backend_round_trips_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let cps = CheckpointStore::new(
            CheckpointBackend::Directory(dir.path().join("cp")),
            store,
        );
        let mut state = cps.load(StreamKind::Bans).await.unwrap();
        assert_eq!(state.cursor, 0);
        state.cursor = 300;
        state.processed = 300;
        cps.save(&state).await.unwrap();

        let again = cps.load(StreamKind::Bans).await.unwrap();
        assert_eq!(again, state);
        assert_eq!(cps.list().await.unwrap().len(), 1);
        assert!(cps.reset("bans").await.unwrap());
        assert!(!cps.reset("bans").await.unwrap());
        assert_eq!(cps.load(StreamKind::Bans).await.unwrap().cursor, 0);
    }

    #[tokio::test]
    async fn bootstraps_from_max_stored_record() {
        let store = Arc::new(MemoryStore::new());
        store.insert_records(&[record(41), record(7)], false).await.unwrap();
        let cps = CheckpointStore::new(CheckpointBackend::Table, store.clone());
        let state = cps.load(StreamKind::Records).await.unwrap();
        assert_eq!(state.cursor, 42);

        cps.save(&CheckpointState::new("records", 100)).await.unwrap();
        assert_eq!(cps.load(StreamKind::Records).await.unwrap().cursor, 100);
    }
}
