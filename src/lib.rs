//! Sluice - Rate Limiting Forwarding Proxy
//!
//! This crate implements a transparent HTTP proxy that protects a single
//! downstream service. Every request is admitted through a per-client leaky
//! bucket before it is relayed; denied requests are held in a tarpit and
//! answered with a fixed 429.

pub mod config;
pub mod error;
pub mod proxy;
pub mod ratelimit;
