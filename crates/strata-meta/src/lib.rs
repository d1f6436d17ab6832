//! Relational metadata persistence for Strata.
//!
//! Everything durable except blob bytes lives here: users and their access
//! keys, buckets, versioned object rows, the refcounted blob index,
//! multipart uploads with their parts, and lifecycle rules.
//!
//! Services never talk to SQL directly. Each depends on the narrow
//! capability trait it needs ([`store::ObjectStore`], [`store::BlobIndex`],
//! ...); [`SqliteMetaStore`] implements all of them over a `sqlx` pool with
//! embedded migrations. Driver-specific failures surface as typed
//! [`MetaError`] values — notably unique-constraint violations, which
//! callers match on rather than parsing messages.

pub mod entities;
pub mod error;
pub mod sqlite;
pub mod store;

pub use error::{MetaError, MetaResult};
pub use sqlite::SqliteMetaStore;
