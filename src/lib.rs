//! Breakwater - Adaptive Admission Control Engine
//!
//! This crate implements an admission-control engine for multi-tenant APIs:
//! per-endpoint fixed-window rate limiting, an IP blocklist, subscription
//! plan overrides, a circuit breaker guarding the shared counter store, and
//! a DDoS detector that escalates to tightened emergency limits.

pub mod alerts;
pub mod breaker;
pub mod config;
pub mod ddos;
pub mod error;
pub mod facade;
pub mod limiter;
pub mod stats;
pub mod store;
