//! Turnstile - Per-client admission control
//!
//! This crate implements a token-bucket rate limiting stage for request
//! pipelines. Each client identity gets its own bucket, and a background
//! janitor forgets clients that have gone idle so memory stays bounded.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod ratelimit;
pub mod server;
