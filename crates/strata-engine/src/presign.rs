//! Presigned URL generation.
//!
//! The caller identifies the signing key by id only; the secret is fetched
//! and decrypted through IAM, used for the signature, and discarded.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use strata_auth::presigned::{PresignRequest, presign_url};

use crate::error::ServiceResult;
use crate::iam::IamService;

/// Inputs for presigning a URL.
#[derive(Debug, Clone)]
pub struct PresignInput {
    /// The signing access key id.
    pub access_key_id: String,
    /// HTTP method the URL authorizes.
    pub method: String,
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Validity in seconds; the service default when absent.
    pub expires_secs: Option<u64>,
    /// URL scheme.
    pub scheme: String,
    /// Host (and optional port) of the service endpoint.
    pub host: String,
}

/// Builds presigned URLs on behalf of access keys.
pub struct PresignService {
    iam: Arc<IamService>,
    region: String,
    service: String,
    default_expiry_secs: u64,
}

impl std::fmt::Debug for PresignService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresignService")
            .field("region", &self.region)
            .field("default_expiry_secs", &self.default_expiry_secs)
            .finish_non_exhaustive()
    }
}

impl PresignService {
    /// Wire the service with its credential scope.
    pub fn new(
        iam: Arc<IamService>,
        region: impl Into<String>,
        service: impl Into<String>,
        default_expiry_secs: u64,
    ) -> Self {
        Self {
            iam,
            region: region.into(),
            service: service.into(),
            default_expiry_secs,
        }
    }

    /// Build a presigned URL.
    ///
    /// # Errors
    ///
    /// Key-resolution failures from IAM, or
    /// [`strata_auth::AuthError::InvalidPresignedUrl`] for an expiry
    /// outside one second to seven days.
    pub async fn presign(&self, input: PresignInput) -> ServiceResult<String> {
        let verified = self.iam.verify_access_key(&input.access_key_id).await?;

        let expires_secs = input.expires_secs.unwrap_or(self.default_expiry_secs);
        let url = presign_url(&PresignRequest {
            method: input.method.clone(),
            scheme: input.scheme.clone(),
            host: input.host.clone(),
            path: format!("/{}/{}", input.bucket, input.key),
            access_key_id: verified.access_key_id,
            secret_access_key: verified.secret_access_key,
            region: self.region.clone(),
            service: self.service.clone(),
            expires_secs,
            signed_at: Utc::now(),
        })?;

        debug!(
            access_key_id = %input.access_key_id,
            bucket = %input.bucket,
            key = %input.key,
            expires_secs,
            "built presigned URL"
        );
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strata_auth::SigV4Verifier;
    use strata_core::crypto::{SecretBox, generate_master_key};
    use strata_meta::SqliteMetaStore;

    use crate::error::ServiceError;
    use crate::iam::IamCredentialBridge;

    use super::*;

    async fn setup() -> (PresignService, Arc<IamService>, String) {
        let store = Arc::new(SqliteMetaStore::in_memory().await.expect("test store"));
        let secrets = SecretBox::new(&generate_master_key()).expect("test key");
        let iam = Arc::new(IamService::new(store.clone(), store.clone(), secrets));

        let user = iam
            .create_user("alice", "alice@example.com", "pw-pw-pw", false)
            .await
            .expect("test user");
        let created = iam
            .create_access_key(user.id, None, None)
            .await
            .expect("test key");

        let svc = PresignService::new(iam.clone(), "us-east-1", "s3", 900);
        (svc, iam, created.key.access_key_id)
    }

    #[tokio::test]
    async fn test_should_presign_and_verify_through_iam() {
        let (svc, iam, access_key_id) = setup().await;

        let url = svc
            .presign(PresignInput {
                access_key_id: access_key_id.clone(),
                method: "GET".to_owned(),
                bucket: "photos".to_owned(),
                key: "cat.jpg".to_owned(),
                expires_secs: Some(3600),
                scheme: "http".to_owned(),
                host: "localhost:9000".to_owned(),
            })
            .await
            .expect("test presign");

        assert!(url.starts_with("http://localhost:9000/photos/cat.jpg?"));
        assert!(url.contains("X-Amz-Signature="));

        // The generated URL verifies against the same credential store.
        let (bridge, worker) = IamCredentialBridge::spawn(iam);
        let verifier = SigV4Verifier::new(bridge.clone(), Duration::from_secs(900));

        let (parts, ()) = http::Request::builder()
            .method("GET")
            .uri(url)
            .body(())
            .expect("test request")
            .into_parts();
        let principal = verifier.verify(&parts).await.expect("presigned verify");
        assert_eq!(principal.access_key_id, access_key_id);

        drop(verifier);
        drop(bridge);
        worker.await.expect("worker join");
    }

    #[tokio::test]
    async fn test_should_reject_out_of_range_expiry() {
        let (svc, _iam, access_key_id) = setup().await;

        for bad in [0, 604_801] {
            let result = svc
                .presign(PresignInput {
                    access_key_id: access_key_id.clone(),
                    method: "GET".to_owned(),
                    bucket: "b".to_owned(),
                    key: "k".to_owned(),
                    expires_secs: Some(bad),
                    scheme: "http".to_owned(),
                    host: "h".to_owned(),
                })
                .await;
            assert!(
                matches!(
                    result,
                    Err(ServiceError::Auth(
                        strata_auth::AuthError::InvalidPresignedUrl { .. }
                    ))
                ),
                "expiry {bad}"
            );
        }
    }

    #[tokio::test]
    async fn test_should_reject_unknown_signing_key() {
        let (svc, _iam, _) = setup().await;
        let result = svc
            .presign(PresignInput {
                access_key_id: "AKIADOESNOTEXIST0000".to_owned(),
                method: "GET".to_owned(),
                bucket: "b".to_owned(),
                key: "k".to_owned(),
                expires_secs: None,
                scheme: "http".to_owned(),
                host: "h".to_owned(),
            })
            .await;
        assert!(matches!(result, Err(ServiceError::NoSuchAccessKey)));
    }
}
