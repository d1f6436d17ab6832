//! AWS Signature Version 4 authentication for Strata.
//!
//! The engine verifies two request shapes:
//!
//! - **Header mode**: the `Authorization` header carries the credential
//!   scope, signed-header list, and signature ([`sigv4`]).
//! - **Presigned mode**: the same material travels in `X-Amz-*` query
//!   parameters with an expiry window ([`presigned`]).
//!
//! Secrets are resolved through the [`credentials::CredentialStore`] trait;
//! the IAM service supplies the production implementation so this crate
//! never depends on a concrete store. Signature comparison is constant
//! time.

pub mod canonical;
pub mod credentials;
pub mod error;
pub mod presigned;
pub mod sigv4;

pub use credentials::{Credential, CredentialStore, StaticCredentialStore};
pub use error::AuthError;
pub use sigv4::{SigV4Verifier, VerifiedPrincipal};
