//! User and access-key management.
//!
//! Secrets are generated from the CSPRNG, sealed with AES-256-GCM before
//! they touch the database, and returned in plaintext exactly once at
//! creation. Verification decrypts on demand and never caches plaintext.
//!
//! [`IamCredentialBridge`] adapts this service to the auth crate's
//! `CredentialStore` so the SigV4 verifier stays decoupled from IAM.
//! Last-used stamps flow through a bounded channel into a single worker
//! task; a full channel drops the stamp rather than blocking a request.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use strata_auth::credentials::{Credential, CredentialStore};
use strata_auth::error::AuthError;
use strata_core::crypto::{self, SecretBox};
use strata_meta::MetaError;
use strata_meta::entities::{AccessKey, KeyStatus, User};
use strata_meta::store::{AccessKeyStore, NewAccessKey, NewUser, UserStore};

use crate::error::{ServiceError, ServiceResult};

/// Maximum number of active access keys per user.
pub const MAX_ACTIVE_KEYS_PER_USER: i64 = 5;

/// Attempts at generating a non-colliding access key id.
const KEY_ID_ATTEMPTS: u32 = 3;

/// Capacity of the last-used stamp channel.
const TOUCH_QUEUE_DEPTH: usize = 1024;

/// A freshly created access key with its one-time plaintext secret.
#[derive(Debug)]
pub struct CreatedAccessKey {
    /// The stored key row.
    pub key: AccessKey,
    /// The plaintext secret. This is the only time it is ever returned.
    pub secret_access_key: String,
}

/// A decrypted, usable credential.
#[derive(Debug, Clone)]
pub struct VerifiedKey {
    /// The access key id.
    pub access_key_id: String,
    /// The decrypted secret.
    pub secret_access_key: String,
    /// The owning user.
    pub user_id: i64,
    /// Expiry, if the key has one.
    pub expires_at: Option<DateTime<Utc>>,
}

/// User accounts and access keys.
pub struct IamService {
    users: Arc<dyn UserStore>,
    keys: Arc<dyn AccessKeyStore>,
    secrets: SecretBox,
}

impl std::fmt::Debug for IamService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IamService").finish_non_exhaustive()
    }
}

impl IamService {
    /// Wire the service together with the secret-sealing master key.
    pub fn new(users: Arc<dyn UserStore>, keys: Arc<dyn AccessKeyStore>, secrets: SecretBox) -> Self {
        Self {
            users,
            keys,
            secrets,
        }
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    /// Create a user with a bcrypt-hashed password.
    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
        is_admin: bool,
    ) -> ServiceResult<User> {
        let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| ServiceError::Internal(anyhow::Error::new(e)))?;

        let user = self
            .users
            .create_user(NewUser {
                username: username.to_owned(),
                email: email.to_owned(),
                password_hash,
                is_admin,
            })
            .await
            .map_err(|e| match e {
                MetaError::UniqueViolation { .. } => ServiceError::UserAlreadyExists,
                other => other.into(),
            })?;

        info!(username, user_id = user.id, "created user");
        Ok(user)
    }

    /// Fetch a user by id.
    pub async fn get_user(&self, id: i64) -> ServiceResult<User> {
        self.users.get_user(id).await.map_err(|e| match e {
            MetaError::NotFound { .. } => ServiceError::NoSuchUser,
            other => other.into(),
        })
    }

    /// Fetch a user by username.
    pub async fn get_user_by_username(&self, username: &str) -> ServiceResult<User> {
        self.users
            .get_user_by_username(username)
            .await
            .map_err(|e| match e {
                MetaError::NotFound { .. } => ServiceError::NoSuchUser,
                other => other.into(),
            })
    }

    /// All users.
    pub async fn list_users(&self) -> ServiceResult<Vec<User>> {
        Ok(self.users.list_users().await?)
    }

    /// Delete a user and (by cascade) their access keys.
    pub async fn delete_user(&self, id: i64) -> ServiceResult<()> {
        self.users.delete_user(id).await.map_err(|e| match e {
            MetaError::NotFound { .. } => ServiceError::NoSuchUser,
            other => other.into(),
        })
    }

    // -----------------------------------------------------------------------
    // Access keys
    // -----------------------------------------------------------------------

    /// Create an access key for an active user.
    ///
    /// # Errors
    ///
    /// [`ServiceError::AccessDenied`] for inactive users,
    /// [`ServiceError::TooManyAccessKeys`] past the per-user cap.
    pub async fn create_access_key(
        &self,
        user_id: i64,
        description: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> ServiceResult<CreatedAccessKey> {
        let user = self.get_user(user_id).await?;
        if !user.is_active {
            return Err(ServiceError::AccessDenied);
        }

        let active = self.keys.count_active_keys(user_id).await?;
        if active >= MAX_ACTIVE_KEYS_PER_USER {
            return Err(ServiceError::TooManyAccessKeys);
        }

        let secret_access_key = crypto::generate_secret_access_key();
        let encrypted_secret = self.secrets.seal(secret_access_key.as_bytes());

        // Key id collisions are astronomically unlikely; retry a few times
        // anyway rather than surfacing one to the caller.
        let mut attempt = 0;
        let key = loop {
            let access_key_id = crypto::generate_access_key_id();
            match self
                .keys
                .insert_access_key(NewAccessKey {
                    user_id,
                    access_key_id,
                    encrypted_secret: encrypted_secret.clone(),
                    description: description.clone(),
                    expires_at,
                })
                .await
            {
                Ok(key) => break key,
                Err(MetaError::UniqueViolation { .. }) if attempt < KEY_ID_ATTEMPTS => {
                    attempt += 1;
                }
                Err(other) => return Err(other.into()),
            }
        };

        info!(user_id, access_key_id = %key.access_key_id, "created access key");
        Ok(CreatedAccessKey {
            key,
            secret_access_key,
        })
    }

    /// Fetch an active, unexpired key and decrypt its secret.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NoSuchAccessKey`] for unknown ids,
    /// [`ServiceError::AccessDenied`] for inactive/expired keys or
    /// inactive owners.
    pub async fn verify_access_key(&self, access_key_id: &str) -> ServiceResult<VerifiedKey> {
        let key = self
            .keys
            .get_access_key(access_key_id)
            .await
            .map_err(|e| match e {
                MetaError::NotFound { .. } => ServiceError::NoSuchAccessKey,
                other => other.into(),
            })?;

        if !key.is_usable(Utc::now()) {
            return Err(ServiceError::AccessDenied);
        }
        let user = self.get_user(key.user_id).await?;
        if !user.is_active {
            return Err(ServiceError::AccessDenied);
        }

        let secret_access_key = self
            .secrets
            .open_string(&key.encrypted_secret)
            .map_err(|e| ServiceError::Internal(anyhow::Error::new(e)))?;

        Ok(VerifiedKey {
            access_key_id: key.access_key_id,
            secret_access_key,
            user_id: key.user_id,
            expires_at: key.expires_at,
        })
    }

    /// All keys of a user (secrets stay sealed).
    pub async fn list_access_keys(&self, user_id: i64) -> ServiceResult<Vec<AccessKey>> {
        Ok(self.keys.list_access_keys(user_id).await?)
    }

    /// Disable a key without deleting it.
    pub async fn deactivate_access_key(&self, access_key_id: &str) -> ServiceResult<()> {
        self.set_status(access_key_id, KeyStatus::Inactive).await
    }

    /// Re-enable a key.
    pub async fn activate_access_key(&self, access_key_id: &str) -> ServiceResult<()> {
        self.set_status(access_key_id, KeyStatus::Active).await
    }

    async fn set_status(&self, access_key_id: &str, status: KeyStatus) -> ServiceResult<()> {
        self.keys
            .set_key_status(access_key_id, status)
            .await
            .map_err(|e| match e {
                MetaError::NotFound { .. } => ServiceError::NoSuchAccessKey,
                other => other.into(),
            })
    }

    /// Delete a key permanently.
    pub async fn delete_access_key(&self, access_key_id: &str) -> ServiceResult<()> {
        self.keys
            .delete_access_key(access_key_id)
            .await
            .map_err(|e| match e {
                MetaError::NotFound { .. } => ServiceError::NoSuchAccessKey,
                other => other.into(),
            })
    }

    /// Remove every expired key. Returns how many were removed.
    pub async fn delete_expired_keys(&self) -> ServiceResult<u64> {
        Ok(self.keys.delete_expired_keys(Utc::now()).await?)
    }

    /// Best-effort last-used stamp.
    pub async fn touch_last_used(&self, access_key_id: &str) -> ServiceResult<()> {
        Ok(self.keys.touch_last_used(access_key_id, Utc::now()).await?)
    }
}

// ---------------------------------------------------------------------------
// Credential bridge
// ---------------------------------------------------------------------------

/// Adapts [`IamService`] to the auth crate's `CredentialStore`.
pub struct IamCredentialBridge {
    iam: Arc<IamService>,
    touch_tx: mpsc::Sender<String>,
}

impl std::fmt::Debug for IamCredentialBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IamCredentialBridge").finish_non_exhaustive()
    }
}

impl IamCredentialBridge {
    /// Build the bridge and spawn its last-used worker. The worker drains
    /// until every bridge clone is dropped, then exits; join the handle on
    /// shutdown so no stamp is abandoned mid-write.
    pub fn spawn(iam: Arc<IamService>) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (touch_tx, mut touch_rx) = mpsc::channel::<String>(TOUCH_QUEUE_DEPTH);
        let worker_iam = Arc::clone(&iam);
        let handle = tokio::spawn(async move {
            while let Some(access_key_id) = touch_rx.recv().await {
                if let Err(e) = worker_iam.touch_last_used(&access_key_id).await {
                    warn!(access_key_id, error = %e, "failed to stamp last-used");
                }
            }
        });
        (Arc::new(Self { iam, touch_tx }), handle)
    }
}

#[async_trait]
impl CredentialStore for IamCredentialBridge {
    async fn lookup(&self, access_key_id: &str) -> Result<Credential, AuthError> {
        let verified = self
            .iam
            .verify_access_key(access_key_id)
            .await
            .map_err(|e| {
                debug!(access_key_id, error = %e, "credential lookup failed");
                AuthError::InvalidAccessKeyId {
                    access_key_id: access_key_id.to_owned(),
                }
            })?;
        Ok(Credential {
            access_key_id: verified.access_key_id,
            secret_access_key: verified.secret_access_key,
            user_id: verified.user_id,
        })
    }

    fn touch_last_used(&self, access_key_id: &str) {
        // A full queue drops the stamp; correctness never depends on it.
        let _ = self.touch_tx.try_send(access_key_id.to_owned());
    }
}
