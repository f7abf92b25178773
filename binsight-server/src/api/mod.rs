//! HTTP API surface
//!
//! SDK routes authenticate with API keys, dashboard routes trust the
//! upstream session layer's user header, and the payment webhook
//! authenticates by signature. All failures share one error envelope.

pub mod admin;
pub mod auth;
pub mod error;
pub mod payment;
pub mod sdk;
pub mod server;
pub mod sse;
pub mod user;

pub use server::{build_router, run};
