//! Mutapa Times offline worker
//!
//! Request caching in three tiers, versioned cache generations with atomic
//! install and garbage collection on activate, and push notification
//! delivery. The binary drives one event per invocation; everything here is
//! also usable directly, which the integration tests rely on.

pub mod cache;
pub mod cli;
pub mod clients;
pub mod config;
pub mod fetch;
pub mod lifecycle;
pub mod push;
pub mod request;
pub mod router;
