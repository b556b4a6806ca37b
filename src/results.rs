//! Result records and the sink that persists them.
//!
//! Exactly one record exists per resolved (task, backend) pair. Records are
//! written before the pair is checkpointed, so a crash between the two
//! steps leaves the pair unresolved and the next run overwrites the orphan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::budget::{backend_slug, Usage};
use crate::checkpoint::PairKey;
use crate::llm::TokenUsage;
use crate::verdict::{Evidence, PartialVerdict, VerdictLabel};

/// Error code recorded when the structured verdict fails to parse.
pub const PARSE_FAILED: &str = "parse_failed";

/// How the investigation phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationExit {
    /// The backend stopped calling tools.
    Stop,
    /// The backend's output was cut off by its token limit.
    Length,
    /// The turn budget ran out.
    MaxTurns,
}

/// The persisted outcome of one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: String,
    pub backend_id: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    pub verdict: Option<VerdictLabel>,
    pub rationale: Option<String>,
    #[serde(default)]
    pub sources: Vec<Evidence>,

    pub finish_status: Option<InvestigationExit>,
    #[serde(default)]
    pub turns: u32,
    /// Billed usage from the provider; null when it could not be fetched.
    #[serde(default)]
    pub usage: Usage,
    /// Token counts reported alongside each completion, for audit only.
    #[serde(default)]
    pub reported_usage: TokenUsage,

    #[serde(default)]
    pub timeout: bool,
    #[serde(default)]
    pub incomplete: bool,
    pub error: Option<String>,
}

impl ResultRecord {
    /// A record with no verdict and no flags set.
    pub fn empty(key: &PairKey, run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id: key.task_id.clone(),
            backend_id: key.backend_id.clone(),
            run_id,
            started_at,
            finished_at: Utc::now(),
            verdict: None,
            rationale: None,
            sources: Vec::new(),
            finish_status: None,
            turns: 0,
            usage: Usage::default(),
            reported_usage: TokenUsage::default(),
            timeout: false,
            incomplete: false,
            error: None,
        }
    }

    /// The record for a pair abandoned at its deadline.
    pub fn timed_out(key: &PairKey, run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            timeout: true,
            ..Self::empty(key, run_id, started_at)
        }
    }

    pub fn key(&self) -> PairKey {
        PairKey::new(&self.task_id, &self.backend_id)
    }

    pub fn set_verdict(&mut self, verdict: PartialVerdict) {
        self.verdict = verdict.verdict;
        self.rationale = verdict.rationale;
        self.sources = verdict.sources;
    }

    pub fn is_success(&self) -> bool {
        !self.timeout && self.error.is_none() && self.verdict.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResultSinkError {
    #[error("result I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("result record YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Destination for result records.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn write(&self, record: &ResultRecord) -> Result<(), ResultSinkError>;
}

/// Writes one YAML file per pair into a directory.
#[derive(Debug, Clone)]
pub struct FileResultSink {
    dir: PathBuf,
}

impl FileResultSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{task}-{backend slug}-{hash}.yaml`. The hash keeps names unique when
    /// sanitizing or truncation maps two ids onto the same characters.
    pub fn file_name(key: &PairKey) -> String {
        let slug = backend_slug(&key.backend_id);
        let mut hasher = Sha256::new();
        hasher.update(key.task_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(key.backend_id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!(
            "{}-{}-{}.yaml",
            sanitize(&key.task_id, MAX_TASK_CHARS),
            sanitize(slug, MAX_SLUG_CHARS),
            &digest[..8]
        )
    }

    pub fn path_for(&self, key: &PairKey) -> PathBuf {
        self.dir.join(Self::file_name(key))
    }

    /// Read every record in the directory.
    pub async fn read_all(&self) -> Result<Vec<ResultRecord>, ResultSinkError> {
        let io_err = |source| ResultSinkError::Io {
            path: self.dir.display().to_string(),
            source,
        };
        let mut records = Vec::new();
        if !fs::try_exists(&self.dir).await.map_err(io_err)? {
            return Ok(records);
        }
        let mut entries = fs::read_dir(&self.dir).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().map(|e| e == "yaml").unwrap_or(false) {
                let content = fs::read_to_string(&path).await.map_err(io_err)?;
                records.push(serde_yaml::from_str(&content)?);
            }
        }
        records.sort_by(|a: &ResultRecord, b| a.key().cmp(&b.key()));
        Ok(records)
    }
}

/// Name components are capped so the whole file name stays well under the
/// usual 255-byte limit.
const MAX_TASK_CHARS: usize = 96;
const MAX_SLUG_CHARS: usize = 64;

fn sanitize(s: &str, max_chars: usize) -> String {
    s.chars()
        .take(max_chars)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl ResultSink for FileResultSink {
    async fn write(&self, record: &ResultRecord) -> Result<(), ResultSinkError> {
        let path = self.path_for(&record.key());
        let io_err = |source| ResultSinkError::Io {
            path: path.display().to_string(),
            source,
        };

        fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let contents = serde_yaml::to_string(record)?;

        // Write-then-rename so a reader never sees half a record. Each write
        // gets its own temp file; concurrent writers of one record must not
        // share one.
        let tmp = path.with_extension(format!("yaml.{}.tmp", Uuid::new_v4().simple()));
        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(contents.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_err(e));
        }

        tracing::debug!("Wrote result {}", path.display());
        Ok(())
    }
}
