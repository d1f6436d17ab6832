//! Service layer of the Strata object store.
//!
//! Each service orchestrates the blob backend, the metadata store, and the
//! locker to provide one slice of the S3 surface:
//!
//! ```text
//! HTTP layer (external)                 background timers
//!        |                                     |
//!        v                                     v
//! BucketService / ObjectService /   GarbageCollector / LifecycleEngine
//! MultipartService / PresignService
//!        |                |
//!        v                v
//!   metadata store    blob backend
//!   (capability       (content-addressed
//!    traits)           filesystem)
//! ```
//!
//! Services depend on the narrow store traits they need and are wired
//! together at construction. The IAM service additionally adapts itself to
//! the auth crate's `CredentialStore` so signature verification never
//! depends on a concrete service.

pub mod bucket;
pub mod error;
pub mod etag;
pub mod gc;
pub mod iam;
pub mod lifecycle;
pub mod multipart;
pub mod object;
pub mod presign;
pub mod principal;
pub mod util;
pub mod validation;

pub use bucket::BucketService;
pub use error::{ServiceError, ServiceResult};
pub use gc::GarbageCollector;
pub use iam::IamService;
pub use lifecycle::LifecycleEngine;
pub use multipart::MultipartService;
pub use object::ObjectService;
pub use presign::PresignService;
pub use principal::Principal;
