//! Conversation engine for a terminal coding assistant.
//!
//! The [`core::Engine`] drives a streaming turn loop over a
//! [`session_store::Session`], honoring at most one tool call per turn and
//! routing each call through the [`approval::ApprovalGate`]. Sessions are
//! branchable append-only logs persisted as JSON lines.

pub mod approval;
pub mod audit;
pub mod client;
pub mod compaction;
pub mod config;
pub mod core;
pub mod error_taxonomy;
pub mod history;
pub mod llm_client;
pub mod logging;
pub mod models;
pub mod prompts;
pub mod session_store;
pub mod tools;
pub mod utils;

#[cfg(test)]
mod test_support;
