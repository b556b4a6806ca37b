//! Budget module - backend descriptors, pricing and cost accounting.
//!
//! # Key Concepts
//! - Descriptor: a judge backend's id, context window and list price
//! - Usage: billed tokens and cost for one pair, from the provider
//! - Accounting: one usage query per generation, never estimated

mod cost;
mod pricing;

pub use cost::{authoritative_usage, Usage};
pub use pricing::{backend_slug, default_backends, BackendDescriptor, ModelPricing, DEFAULT_CONTEXT_WINDOW};
