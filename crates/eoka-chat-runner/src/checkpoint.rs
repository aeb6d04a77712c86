//! Run persistence, keyed per target.
//!
//! A checkpoint is the whole [`AutomationRun`] minus in-flight bookkeeping,
//! enough to rebuild the controller after a restart. Final results are kept
//! separately so they survive the checkpoint being cleared.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use crate::controller::{AutomationRun, PromptResult};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub run: AutomationRun,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn of(run: &AutomationRun) -> Self {
        Self {
            run: run.clone(),
            saved_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, target: &str, checkpoint: &Checkpoint) -> Result<()>;

    async fn load(&self, target: &str) -> Result<Option<Checkpoint>>;

    /// Forget the checkpoint. Clearing a missing one is not an error.
    async fn clear(&self, target: &str) -> Result<()>;

    async fn save_results(&self, target: &str, results: &[PromptResult]) -> Result<()>;
}

/// Keeps everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
    results: RwLock<HashMap<String, Vec<PromptResult>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results last saved for `target`.
    pub async fn results(&self, target: &str) -> Option<Vec<PromptResult>> {
        self.results.read().await.get(target).cloned()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn save(&self, target: &str, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .write()
            .await
            .insert(target.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, target: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.read().await.get(target).cloned())
    }

    async fn clear(&self, target: &str) -> Result<()> {
        self.checkpoints.write().await.remove(target);
        Ok(())
    }

    async fn save_results(&self, target: &str, results: &[PromptResult]) -> Result<()> {
        self.results
            .write()
            .await
            .insert(target.to_string(), results.to_vec());
        Ok(())
    }
}

/// One JSON file per target: `<key>.checkpoint.json` and `<key>.results.json`.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, target: &str, kind: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.json", file_key(target), kind))
    }

    /// Write through a temp file so a crash never leaves half a checkpoint.
    async fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Wrote {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for JsonFileStore {
    async fn save(&self, target: &str, checkpoint: &Checkpoint) -> Result<()> {
        self.write_json(&self.path(target, "checkpoint"), checkpoint)
            .await
    }

    async fn load(&self, target: &str) -> Result<Option<Checkpoint>> {
        let path = self.path(target, "checkpoint");
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self, target: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(target, "checkpoint")).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_results(&self, target: &str, results: &[PromptResult]) -> Result<()> {
        self.write_json(&self.path(target, "results"), results).await
    }
}

/// Longest readable part of a file key.
const KEY_PREFIX_LEN: usize = 80;

/// Target ids are usually URLs; keep them file-name safe. The readable part
/// is lossy, so a digest of the raw id keeps distinct targets apart.
fn file_key(target: &str) -> String {
    let digest = hex::encode(Sha256::digest(target.as_bytes()));
    let readable: String = target
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .chars()
        .take(KEY_PREFIX_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let readable = readable.trim_matches('_');
    let readable = if readable.is_empty() { "target" } else { readable };
    format!("{}-{}", readable, &digest[..12])
}
