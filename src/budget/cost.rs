//! Authoritative usage accounting.
//!
//! Token counts and cost recorded for a pair come from the provider's
//! generation endpoint, not from the usage blocks returned with each
//! completion. A field that cannot be obtained for every generation is
//! left empty rather than filled from partial data.

use serde::{Deserialize, Serialize};

use crate::llm::{GenerationUsage, LlmClient};

/// Billed usage for one pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
}

impl Usage {
    pub fn is_known(&self) -> bool {
        self.prompt_tokens.is_some() || self.completion_tokens.is_some() || self.cost_usd.is_some()
    }
}

/// Sums per-generation usage into a pair total.
#[derive(Debug, Default)]
struct UsageTotals {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    cost_usd: Option<f64>,
    prompt_complete: bool,
    completion_complete: bool,
    cost_complete: bool,
}

impl UsageTotals {
    fn new() -> Self {
        Self {
            prompt_complete: true,
            completion_complete: true,
            cost_complete: true,
            ..Self::default()
        }
    }

    fn add(&mut self, usage: Option<GenerationUsage>) {
        let usage = usage.unwrap_or_default();
        accumulate(&mut self.prompt_tokens, &mut self.prompt_complete, usage.prompt_tokens);
        accumulate(
            &mut self.completion_tokens,
            &mut self.completion_complete,
            usage.completion_tokens,
        );
        match usage.cost_usd {
            Some(cost) if self.cost_complete => {
                self.cost_usd = Some(self.cost_usd.unwrap_or(0.0) + cost)
            }
            Some(_) => {}
            None => self.cost_complete = false,
        }
    }

    fn finish(self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens.filter(|_| self.prompt_complete),
            completion_tokens: self.completion_tokens.filter(|_| self.completion_complete),
            cost_usd: self.cost_usd.filter(|_| self.cost_complete),
        }
    }
}

fn accumulate(total: &mut Option<u64>, complete: &mut bool, value: Option<u64>) {
    match value {
        Some(v) if *complete => *total = Some(total.unwrap_or(0).saturating_add(v)),
        Some(_) => {}
        None => *complete = false,
    }
}

/// Query the provider once per generation id and total the results.
pub async fn authoritative_usage(client: &dyn LlmClient, response_ids: &[String]) -> Usage {
    if response_ids.is_empty() {
        return Usage::default();
    }

    let mut totals = UsageTotals::new();
    for id in response_ids {
        match client.generation_usage(id).await {
            Ok(usage) => {
                if usage.is_none() {
                    tracing::debug!("No usage record for generation {}", id);
                }
                totals.add(usage);
            }
            Err(e) => {
                tracing::warn!("Usage lookup failed for generation {}: {}", id, e);
                totals.add(None);
            }
        }
    }
    totals.finish()
}
