//! Binsight backend server
//!
//! Single process hosting the HTTP ingestion surface, the tier-partitioned
//! worker pools, the payment webhook, and the nightly janitor.

pub mod analyzer;
pub mod api;
pub mod blob;
pub mod db;
pub mod ingest;
pub mod janitor;
pub mod queue;
pub mod state;
pub mod worker;
