//! SecFS Test & Validation Infrastructure
//!
//! Shares backed by in-memory servers, servers that misbehave on request,
//! and end-to-end scenarios covering groups, encryption, concurrent clients
//! and fork detection.

pub mod harness;
pub mod servers;

pub use harness::TestShare;
pub use servers::{InterferingVersionServer, SwitchableVersionServer};

#[cfg(test)]
mod concurrency_tests;
