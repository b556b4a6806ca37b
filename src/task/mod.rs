//! Task module - the work items judged by every backend.
//!
//! Tasks are loaded once from a YAML file and never change afterwards:
//!
//! ```yaml
//! tasks:
//!   - id: 12345
//!     question: Was Douglas Adams born on 11 March 1952?
//!     context:
//!       edit: {title: Q42, property: P569}
//!       item: {label_en: Douglas Adams}
//!     warnings:
//!       - "Value precision is day; source may only give year."
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// One unit of work to be judged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(deserialize_with = "id_from_scalar")]
    pub id: String,
    pub question: String,
    /// Named sections of supporting material, rendered in key order.
    #[serde(default)]
    pub context: BTreeMap<String, serde_yaml::Value>,
    /// Pre-computed caveats appended after the question.
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Accept `id: 12345` as well as `id: "12345"`.
fn id_from_scalar<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(s) if !s.trim().is_empty() => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!(
            "task id must be a non-empty string or number, got {:?}",
            other
        ))),
    }
}

impl Task {
    pub fn new(id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
            context: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    /// The opening user message for the investigation phase.
    pub fn render_context(&self) -> String {
        let mut parts = vec![format!("## Task\n\nid: {}", self.id)];

        for (section, value) in &self.context {
            let body = match value {
                serde_yaml::Value::String(s) => s.clone(),
                other => serde_yaml::to_string(other).unwrap_or_else(|_| format!("{:?}", other)),
            };
            parts.push(format!("## {}\n\n{}", section, body.trim_end()));
        }

        let mut question = format!("## Verification question\n\n{}", self.question.trim());
        if !self.warnings.is_empty() {
            question.push_str("\n\n");
            question.push_str(&self.warnings.join("\n"));
        }
        parts.push(question);

        parts.join("\n\n")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskLoadError {
    #[error("failed to read task file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid task file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("duplicate task id '{0}'")]
    DuplicateId(String),
}

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Parse a task document. Task ids must be unique.
pub fn parse_tasks(contents: &str) -> Result<Vec<Task>, serde_yaml::Error> {
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: TaskFile = serde_yaml::from_str(contents)?;
    Ok(file.tasks)
}

/// Load tasks from a YAML file.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>, TaskLoadError> {
    let contents = std::fs::read_to_string(path).map_err(|source| TaskLoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let tasks = parse_tasks(&contents).map_err(|source| TaskLoadError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let mut seen = HashSet::new();
    for task in &tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(TaskLoadError::DuplicateId(task.id.clone()));
        }
    }

    tracing::info!("Loaded {} tasks from {}", tasks.len(), path.display());
    Ok(tasks)
}
