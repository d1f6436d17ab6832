//! Metadata store error type.

/// Errors surfaced by metadata store adapters.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The requested row does not exist.
    #[error("{entity} not found")]
    NotFound {
        /// Which entity kind was missing.
        entity: &'static str,
    },

    /// A uniqueness constraint was violated (duplicate username, bucket
    /// name, access key id, ...). Adapters translate their driver's error
    /// into this variant so callers never inspect messages.
    #[error("{entity} already exists")]
    UniqueViolation {
        /// Which entity kind collided.
        entity: &'static str,
    },

    /// A stored value could not be decoded (bad enum text, invalid JSON).
    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    /// Any other database failure.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Schema migration failure at startup.
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Convenience result alias for store operations.
pub type MetaResult<T> = Result<T, MetaError>;

impl MetaError {
    /// Whether this is the typed unique-violation case.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }

    /// Whether this is a not-found case.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
