//! # Verdict Fanout
//!
//! Sends every task in a batch to every judge backend and records one
//! auditable verdict per (task, backend) pair.
//!
//! ## Architecture
//!
//! ```text
//!   tasks x backends
//!          │
//!          ▼
//!   ┌──────────────┐   skip done   ┌──────────────────┐
//!   │ Orchestrator │ ────────────▶ │ Checkpoint Store │
//!   └──────┬───────┘               └──────────────────┘
//!          │ per pair, under a deadline
//!          ▼
//!   ┌──────────────┐  search/fetch ┌───────────────┐
//!   │    Worker    │ ────────────▶ │ Tool Executor │
//!   └──────┬───────┘               └───────────────┘
//!          │ record, then checkpoint
//!          ▼
//!   ┌──────────────┐
//!   │ Result Sink  │
//!   └──────────────┘
//! ```
//!
//! ## Pair Flow
//! 1. Investigate: the backend searches and fetches until it stops or runs out of turns
//! 2. Verdict: tools are withdrawn and the reply is forced into the verdict schema
//! 3. Account: billed usage is looked up per generation
//! 4. Persist: the result record is written, then the pair is checkpointed
//!
//! ## Modules
//! - `orchestrator`: pair ordering, deadlines, persistence order
//! - `worker`: the two-phase protocol
//! - `tools`: web search and page fetching for backends
//! - `budget`: backend descriptors and usage accounting

pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod llm;
pub mod orchestrator;
pub mod results;
pub mod task;
pub mod tools;
pub mod verdict;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use orchestrator::{Orchestrator, RunSummary};
