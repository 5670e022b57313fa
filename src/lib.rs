//! slms-gate - Per-client admission control
//!
//! This crate implements the rate limiting layer of the short link
//! management system: a time-expiring store holding one token bucket per
//! client and policy, a controller deciding per request whether a client
//! may proceed, and an axum middleware that turns those decisions into
//! `429` responses and `X-RateLimit-*` headers.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
