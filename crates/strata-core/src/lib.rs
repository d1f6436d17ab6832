//! Core building blocks for the Strata object storage service.
//!
//! This crate carries the pieces every other Strata crate leans on:
//!
//! - [`config`]: the nested service configuration, loadable from a TOML
//!   file with environment-variable overrides.
//! - [`crypto`]: HMAC-SHA256, streaming SHA-256, the AES-256-GCM secret
//!   envelope, and CSPRNG-backed credential generators.
//! - [`locker`]: keyed advisory locks with TTLs, in-process and
//!   distributed-ready implementations.
//! - [`cache`]: a TTL cache for hot metadata lookups.
//! - [`limiter`]: a token-bucket rate limiter for the front-end.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod limiter;
pub mod locker;

pub use config::StrataConfig;
pub use locker::{Locker, MemoryLocker};
