//! Analysis of new and changed entities.
//!
//! The analyzer builds a prompt from each entity's recent history, asks the
//! LLM for a summary and derived metrics, and persists the outcome.

pub mod analyzer;
pub mod prompt;
pub mod response;

pub use analyzer::{AnalyzeTally, Analyzer, AnalyzerConfig};
