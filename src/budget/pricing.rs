//! Backend descriptors and their price tables.

use serde::{Deserialize, Serialize};

/// Context window assumed for backends we know nothing about.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 100_000;

/// List price for a backend, in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub prompt_per_million: f64,
    pub completion_per_million: f64,
}

/// A judge backend, configured at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Provider model id, e.g. `deepseek/deepseek-v3.2`.
    pub id: String,
    #[serde(default = "default_context_window")]
    pub context_window: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<ModelPricing>,
}

fn default_context_window() -> u64 {
    DEFAULT_CONTEXT_WINDOW
}

impl BackendDescriptor {
    pub fn new(id: impl Into<String>, context_window: u64) -> Self {
        Self {
            id: id.into(),
            context_window,
            pricing: None,
        }
    }

    /// Descriptor for an id given on the command line: a known backend's
    /// settings if there is one, otherwise the default context window.
    pub fn lookup(id: &str, known: &[BackendDescriptor]) -> Self {
        known
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .unwrap_or_else(|| Self::new(id, DEFAULT_CONTEXT_WINDOW))
    }
}

/// Short name of a backend id: its last `/`-separated segment.
pub fn backend_slug(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

/// The default judge panel.
pub fn default_backends() -> Vec<BackendDescriptor> {
    vec![
        BackendDescriptor::new("nvidia/nemotron-3-nano-30b-a3b", 262_000),
        BackendDescriptor::new("allenai/olmo-3.1-32b-instruct", 65_000),
        BackendDescriptor::new("deepseek/deepseek-v3.2", 164_000),
        BackendDescriptor::new("anthropic/claude-4.5-haiku-20251001", 200_000),
    ]
}
