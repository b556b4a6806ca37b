//! Checkpoint store - durable set of resolved (task, backend) pairs.
//!
//! The file is JSON lines, one `{"task_id": .., "backend_id": ..}` object per
//! line, appended and fsynced on every write. A kill mid-append leaves at
//! most one torn trailing line, which is dropped (and the file compacted) on
//! the next load.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Identity of one unit of fan-out work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub task_id: String,
    pub backend_id: String,
}

impl PairKey {
    pub fn new(task_id: impl Into<String>, backend_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            backend_id: backend_id.into(),
        }
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} x {}", self.task_id, self.backend_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt checkpoint {path} at line {line}: {reason}")]
    Corrupt {
        path: String,
        line: usize,
        reason: String,
    },
    #[error("failed to encode checkpoint entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Append-only set of completed pairs, held in memory and mirrored to disk.
///
/// All writes go through one lock so concurrent workers never interleave
/// partial lines.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    completed: Mutex<HashSet<PairKey>>,
}

impl CheckpointStore {
    /// Load the store from `path`, creating nothing until the first write.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let io_err = |source| CheckpointError::Io {
            path: path.display().to_string(),
            source,
        };

        let mut completed = HashSet::new();
        if fs::try_exists(&path).await.map_err(io_err)? {
            let contents = fs::read_to_string(&path).await.map_err(io_err)?;
            let lines: Vec<&str> = contents.lines().collect();
            let mut torn_tail = false;

            for (idx, line) in lines.iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<PairKey>(line) {
                    Ok(key) => {
                        completed.insert(key);
                    }
                    Err(e) if idx + 1 == lines.len() && !contents.ends_with('\n') => {
                        tracing::warn!(
                            "Dropping torn final checkpoint line in {}: {}",
                            path.display(),
                            e
                        );
                        torn_tail = true;
                    }
                    Err(e) => {
                        return Err(CheckpointError::Corrupt {
                            path: path.display().to_string(),
                            line: idx + 1,
                            reason: e.to_string(),
                        });
                    }
                }
            }

            if torn_tail || (!contents.is_empty() && !contents.ends_with('\n')) {
                Self::compact(&path, &completed).await?;
            }
            tracing::info!(
                "Loaded {} checkpoint entries from {}",
                completed.len(),
                path.display()
            );
        } else {
            tracing::info!("No checkpoint at {}, starting fresh", path.display());
        }

        Ok(Self {
            path,
            completed: Mutex::new(completed),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn contains(&self, key: &PairKey) -> bool {
        self.completed.lock().await.contains(key)
    }

    pub async fn len(&self) -> usize {
        self.completed.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.completed.lock().await.is_empty()
    }

    /// Snapshot of all entries, sorted.
    pub async fn entries(&self) -> Vec<PairKey> {
        let mut entries: Vec<PairKey> = self.completed.lock().await.iter().cloned().collect();
        entries.sort();
        entries
    }

    /// Durably record `key`. Returns `false` if it was already present.
    ///
    /// The in-memory set is only updated after the line has been synced.
    pub async fn record(&self, key: PairKey) -> Result<bool, CheckpointError> {
        let mut completed = self.completed.lock().await;
        if completed.contains(&key) {
            return Ok(false);
        }

        let mut line = serde_json::to_string(&key)?;
        line.push('\n');
        self.append(line.as_bytes()).await?;

        tracing::debug!("Checkpointed {}", key);
        completed.insert(key);
        Ok(true)
    }

    async fn append(&self, bytes: &[u8]) -> Result<(), CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;
        Ok(())
    }

    /// Rewrite the file from `entries` via a temp file and rename.
    async fn compact(path: &Path, entries: &HashSet<PairKey>) -> Result<(), CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: path.display().to_string(),
            source,
        };
        let mut sorted: Vec<&PairKey> = entries.iter().collect();
        sorted.sort();
        let mut contents = String::new();
        for key in sorted {
            contents.push_str(&serde_json::to_string(key)?);
            contents.push('\n');
        }

        let tmp = path.with_extension("jsonl.tmp");
        let mut file = fs::File::create(&tmp).await.map_err(io_err)?;
        file.write_all(contents.as_bytes()).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);
        fs::rename(&tmp, path).await.map_err(io_err)?;
        Ok(())
    }
}
