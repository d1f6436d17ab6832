//! Credential resolution for signature verification.
//!
//! The verifier resolves secret access keys through the [`CredentialStore`]
//! trait. Production deployments wire in the IAM service's adapter (which
//! decrypts secrets from the metadata store); tests use
//! [`StaticCredentialStore`].

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::AuthError;

/// A usable credential: an active, unexpired access key and its secret.
#[derive(Debug, Clone)]
pub struct Credential {
    /// The access key id.
    pub access_key_id: String,
    /// The plaintext secret access key.
    pub secret_access_key: String,
    /// The id of the user who owns the key.
    pub user_id: i64,
}

/// Resolves access key ids to usable credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up an active, unexpired credential by access key id.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidAccessKeyId`] if the key is unknown,
    /// inactive, or expired.
    async fn lookup(&self, access_key_id: &str) -> Result<Credential, AuthError>;

    /// Record that the key was just used. Best effort: implementations must
    /// not block the request path and must swallow their own failures.
    fn touch_last_used(&self, _access_key_id: &str) {}
}

/// In-memory credential store for tests and development.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialStore {
    credentials: HashMap<String, Credential>,
}

impl StaticCredentialStore {
    /// Build a store from `(access_key_id, secret_access_key)` pairs.
    /// User ids are assigned sequentially from 1.
    #[must_use]
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        let credentials = pairs
            .into_iter()
            .enumerate()
            .map(|(i, (access_key_id, secret_access_key))| {
                (
                    access_key_id.clone(),
                    Credential {
                        access_key_id,
                        secret_access_key,
                        user_id: i64::try_from(i).unwrap_or(0) + 1,
                    },
                )
            })
            .collect();
        Self { credentials }
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn lookup(&self, access_key_id: &str) -> Result<Credential, AuthError> {
        self.credentials
            .get(access_key_id)
            .cloned()
            .ok_or_else(|| AuthError::InvalidAccessKeyId {
                access_key_id: access_key_id.to_owned(),
            })
    }
}
