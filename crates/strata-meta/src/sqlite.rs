//! SQLite adapter for the metadata store.
//!
//! Implements every capability trait over a `sqlx` pool. Queries are
//! runtime-bound (`sqlx::query` + `try_get`) so the crate builds without a
//! live database; the schema ships as embedded migrations run at connect
//! time.
//!
//! Multi-row mutations that must be atomic (`insert_as_latest`,
//! `insert_replacing`, `abort_upload`) run inside transactions. The blob
//! upsert and refcount decrement are single statements with `RETURNING`, so
//! there is no check-then-act window even without a transaction.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::{debug, info};

use crate::entities::{
    AccessKey, BlobRecord, Bucket, BucketAcl, KeyStatus, LifecycleRule, MultipartUpload,
    ObjectRecord, UploadPart, UploadStatus, User, UserMetadata, VersioningState,
};
use crate::error::{MetaError, MetaResult};
use crate::store::{
    AccessKeyStore, BlobIndex, BlobRefOutcome, BucketStore, LifecycleStore, MultipartStore,
    NewAccessKey, NewBucket, NewLifecycleRule, NewObject, NewPart, NewUpload, NewUser,
    ObjectStore, UserStore,
};

/// Metadata store over a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct SqliteMetaStore {
    pool: SqlitePool,
}

impl SqliteMetaStore {
    /// Open (creating if missing) and migrate a database at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`] if the pool cannot be opened or a migration
    /// fails.
    pub async fn connect(url: &str, max_connections: u32) -> MetaResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!(url, "running metadata migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an in-memory database for tests.
    ///
    /// A single connection is pinned open; SQLite in-memory databases live
    /// and die with their connection.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`] if the pool cannot be opened or a migration
    /// fails.
    pub async fn in_memory() -> MetaResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool (for health checks).
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Translate a driver unique-violation into the typed domain error.
fn unique_violation(entity: &'static str, e: sqlx::Error) -> MetaError {
    if let sqlx::Error::Database(db) = &e {
        if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) {
            return MetaError::UniqueViolation { entity };
        }
    }
    MetaError::Database(e)
}

/// Escape LIKE wildcards in a user-supplied prefix (pattern uses `\` as
/// the escape character).
fn escape_like(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn decode_metadata(text: &str) -> MetaResult<UserMetadata> {
    serde_json::from_str(text).map_err(|e| MetaError::Corrupt(format!("metadata json: {e}")))
}

fn encode_metadata(metadata: &UserMetadata) -> String {
    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_owned())
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn map_user(row: &SqliteRow) -> MetaResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        is_active: row.try_get("is_active")?,
        is_admin: row.try_get("is_admin")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_access_key(row: &SqliteRow) -> MetaResult<AccessKey> {
    let status: String = row.try_get("status")?;
    Ok(AccessKey {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        access_key_id: row.try_get("access_key_id")?,
        encrypted_secret: row.try_get("encrypted_secret")?,
        description: row.try_get("description")?,
        status: KeyStatus::parse(&status)
            .ok_or_else(|| MetaError::Corrupt(format!("key status: {status}")))?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

fn map_bucket(row: &SqliteRow) -> MetaResult<Bucket> {
    let versioning: String = row.try_get("versioning")?;
    let acl: String = row.try_get("acl")?;
    Ok(Bucket {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        region: row.try_get("region")?,
        versioning: VersioningState::parse(&versioning)
            .ok_or_else(|| MetaError::Corrupt(format!("versioning state: {versioning}")))?,
        object_lock: row.try_get("object_lock")?,
        acl: BucketAcl::parse(&acl)
            .ok_or_else(|| MetaError::Corrupt(format!("bucket acl: {acl}")))?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_object(row: &SqliteRow) -> MetaResult<ObjectRecord> {
    let metadata: String = row.try_get("metadata")?;
    Ok(ObjectRecord {
        id: row.try_get("id")?,
        bucket_id: row.try_get("bucket_id")?,
        key: row.try_get("key")?,
        version_id: row.try_get("version_id")?,
        is_latest: row.try_get("is_latest")?,
        is_delete_marker: row.try_get("is_delete_marker")?,
        content_hash: row.try_get("content_hash")?,
        size: row.try_get("size")?,
        content_type: row.try_get("content_type")?,
        etag: row.try_get("etag")?,
        storage_class: row.try_get("storage_class")?,
        metadata: decode_metadata(&metadata)?,
        created_at: row.try_get("created_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn map_blob(row: &SqliteRow) -> MetaResult<BlobRecord> {
    Ok(BlobRecord {
        content_hash: row.try_get("content_hash")?,
        size: row.try_get("size")?,
        storage_path: row.try_get("storage_path")?,
        ref_count: row.try_get("ref_count")?,
        created_at: row.try_get("created_at")?,
        last_accessed: row.try_get("last_accessed")?,
        is_encrypted: row.try_get("is_encrypted")?,
        encryption_iv: row.try_get("encryption_iv")?,
    })
}

fn map_upload(row: &SqliteRow) -> MetaResult<MultipartUpload> {
    let status: String = row.try_get("status")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(MultipartUpload {
        id: row.try_get("id")?,
        bucket_id: row.try_get("bucket_id")?,
        key: row.try_get("key")?,
        initiator_id: row.try_get("initiator_id")?,
        status: UploadStatus::parse(&status)
            .ok_or_else(|| MetaError::Corrupt(format!("upload status: {status}")))?,
        storage_class: row.try_get("storage_class")?,
        metadata: decode_metadata(&metadata)?,
        initiated_at: row.try_get("initiated_at")?,
        expires_at: row.try_get("expires_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn map_part(row: &SqliteRow) -> MetaResult<UploadPart> {
    Ok(UploadPart {
        id: row.try_get("id")?,
        upload_id: row.try_get("upload_id")?,
        part_number: row.try_get("part_number")?,
        content_hash: row.try_get("content_hash")?,
        size: row.try_get("size")?,
        etag: row.try_get("etag")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_rule(row: &SqliteRow) -> MetaResult<LifecycleRule> {
    Ok(LifecycleRule {
        id: row.try_get("id")?,
        bucket_id: row.try_get("bucket_id")?,
        prefix: row.try_get("prefix")?,
        expiration_days: row.try_get("expiration_days")?,
        enabled: row.try_get("enabled")?,
    })
}

// ---------------------------------------------------------------------------
// UserStore
// ---------------------------------------------------------------------------

#[async_trait]
impl UserStore for SqliteMetaStore {
    async fn create_user(&self, new: NewUser) -> MetaResult<User> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO users (username, email, password_hash, is_active, is_admin, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5) RETURNING id",
        )
        .bind(&new.username)
        .bind(&new.email)
        .bind(&new.password_hash)
        .bind(new.is_admin)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation("user", e))?;

        Ok(User {
            id: row.try_get("id")?,
            username: new.username,
            email: new.email,
            password_hash: new.password_hash,
            is_active: true,
            is_admin: new.is_admin,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_user(&self, id: i64) -> MetaResult<User> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(MetaError::NotFound { entity: "user" })?;
        map_user(&row)
    }

    async fn get_user_by_username(&self, username: &str) -> MetaResult<User> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(MetaError::NotFound { entity: "user" })?;
        map_user(&row)
    }

    async fn list_users(&self) -> MetaResult<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_user).collect()
    }

    async fn delete_user(&self, id: i64) -> MetaResult<()> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetaError::NotFound { entity: "user" });
        }
        Ok(())
    }

    async fn set_user_active(&self, id: i64, active: bool) -> MetaResult<()> {
        let result =
            sqlx::query("UPDATE users SET is_active = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(active)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(MetaError::NotFound { entity: "user" });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AccessKeyStore
// ---------------------------------------------------------------------------

#[async_trait]
impl AccessKeyStore for SqliteMetaStore {
    async fn insert_access_key(&self, new: NewAccessKey) -> MetaResult<AccessKey> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO access_keys (user_id, access_key_id, encrypted_secret, description, status, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, 'Active', ?5, ?6) RETURNING id",
        )
        .bind(new.user_id)
        .bind(&new.access_key_id)
        .bind(&new.encrypted_secret)
        .bind(&new.description)
        .bind(now)
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation("access key", e))?;

        Ok(AccessKey {
            id: row.try_get("id")?,
            user_id: new.user_id,
            access_key_id: new.access_key_id,
            encrypted_secret: new.encrypted_secret,
            description: new.description,
            status: KeyStatus::Active,
            created_at: now,
            expires_at: new.expires_at,
            last_used_at: None,
        })
    }

    async fn get_access_key(&self, access_key_id: &str) -> MetaResult<AccessKey> {
        let row = sqlx::query("SELECT * FROM access_keys WHERE access_key_id = ?1")
            .bind(access_key_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(MetaError::NotFound {
                entity: "access key",
            })?;
        map_access_key(&row)
    }

    async fn list_access_keys(&self, user_id: i64) -> MetaResult<Vec<AccessKey>> {
        let rows =
            sqlx::query("SELECT * FROM access_keys WHERE user_id = ?1 ORDER BY created_at DESC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(map_access_key).collect()
    }

    async fn count_active_keys(&self, user_id: i64) -> MetaResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM access_keys WHERE user_id = ?1 AND status = 'Active'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    async fn set_key_status(&self, access_key_id: &str, status: KeyStatus) -> MetaResult<()> {
        let result = sqlx::query("UPDATE access_keys SET status = ?1 WHERE access_key_id = ?2")
            .bind(status.as_str())
            .bind(access_key_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetaError::NotFound {
                entity: "access key",
            });
        }
        Ok(())
    }

    async fn delete_access_key(&self, access_key_id: &str) -> MetaResult<()> {
        let result = sqlx::query("DELETE FROM access_keys WHERE access_key_id = ?1")
            .bind(access_key_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetaError::NotFound {
                entity: "access key",
            });
        }
        Ok(())
    }

    async fn delete_expired_keys(&self, now: DateTime<Utc>) -> MetaResult<u64> {
        let result =
            sqlx::query("DELETE FROM access_keys WHERE expires_at IS NOT NULL AND expires_at < ?1")
                .bind(now)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn touch_last_used(&self, access_key_id: &str, at: DateTime<Utc>) -> MetaResult<()> {
        sqlx::query("UPDATE access_keys SET last_used_at = ?1 WHERE access_key_id = ?2")
            .bind(at)
            .bind(access_key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BucketStore
// ---------------------------------------------------------------------------

#[async_trait]
impl BucketStore for SqliteMetaStore {
    async fn create_bucket(&self, new: NewBucket) -> MetaResult<Bucket> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO buckets (owner_id, name, region, versioning, object_lock, acl, created_at) \
             VALUES (?1, ?2, ?3, 'Disabled', ?4, 'private', ?5) RETURNING id",
        )
        .bind(new.owner_id)
        .bind(&new.name)
        .bind(&new.region)
        .bind(new.object_lock)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation("bucket", e))?;

        Ok(Bucket {
            id: row.try_get("id")?,
            owner_id: new.owner_id,
            name: new.name,
            region: new.region,
            versioning: VersioningState::Disabled,
            object_lock: new.object_lock,
            acl: BucketAcl::Private,
            created_at: now,
        })
    }

    async fn get_bucket(&self, name: &str) -> MetaResult<Bucket> {
        let row = sqlx::query("SELECT * FROM buckets WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(MetaError::NotFound { entity: "bucket" })?;
        map_bucket(&row)
    }

    async fn get_bucket_by_id(&self, id: i64) -> MetaResult<Bucket> {
        let row = sqlx::query("SELECT * FROM buckets WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(MetaError::NotFound { entity: "bucket" })?;
        map_bucket(&row)
    }

    async fn list_buckets(&self, owner_id: Option<i64>) -> MetaResult<Vec<Bucket>> {
        let rows = match owner_id {
            Some(owner) => {
                sqlx::query("SELECT * FROM buckets WHERE owner_id = ?1 ORDER BY name")
                    .bind(owner)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM buckets ORDER BY name")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(map_bucket).collect()
    }

    async fn delete_bucket(&self, id: i64) -> MetaResult<()> {
        let result = sqlx::query("DELETE FROM buckets WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetaError::NotFound { entity: "bucket" });
        }
        Ok(())
    }

    async fn set_versioning(&self, id: i64, state: VersioningState) -> MetaResult<()> {
        let result = sqlx::query("UPDATE buckets SET versioning = ?1 WHERE id = ?2")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetaError::NotFound { entity: "bucket" });
        }
        Ok(())
    }

    async fn set_acl(&self, id: i64, acl: BucketAcl) -> MetaResult<()> {
        let result = sqlx::query("UPDATE buckets SET acl = ?1 WHERE id = ?2")
            .bind(acl.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetaError::NotFound { entity: "bucket" });
        }
        Ok(())
    }

    async fn count_current_objects(&self, bucket_id: i64) -> MetaResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM objects \
             WHERE bucket_id = ?1 AND is_latest = 1 AND deleted_at IS NULL AND is_delete_marker = 0",
        )
        .bind(bucket_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }
}

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

const INSERT_OBJECT_SQL: &str =
    "INSERT INTO objects (bucket_id, key, version_id, is_latest, is_delete_marker, content_hash, \
     size, content_type, etag, storage_class, metadata, created_at) \
     VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) RETURNING id";

#[async_trait]
impl ObjectStore for SqliteMetaStore {
    async fn insert_as_latest(&self, new: NewObject) -> MetaResult<ObjectRecord> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE objects SET is_latest = 0 WHERE bucket_id = ?1 AND key = ?2 AND is_latest = 1")
            .bind(new.bucket_id)
            .bind(&new.key)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(INSERT_OBJECT_SQL)
            .bind(new.bucket_id)
            .bind(&new.key)
            .bind(&new.version_id)
            .bind(new.is_delete_marker)
            .bind(&new.content_hash)
            .bind(new.size)
            .bind(&new.content_type)
            .bind(&new.etag)
            .bind(&new.storage_class)
            .bind(encode_metadata(&new.metadata))
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        let id: i64 = row.try_get("id")?;

        tx.commit().await?;
        debug!(bucket_id = new.bucket_id, key = %new.key, version_id = %new.version_id, "inserted latest version");
        Ok(object_from_new(new, id, now))
    }

    async fn insert_replacing(&self, new: NewObject) -> MetaResult<ObjectRecord> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM objects WHERE bucket_id = ?1 AND key = ?2")
            .bind(new.bucket_id)
            .bind(&new.key)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(INSERT_OBJECT_SQL)
            .bind(new.bucket_id)
            .bind(&new.key)
            .bind(&new.version_id)
            .bind(new.is_delete_marker)
            .bind(&new.content_hash)
            .bind(new.size)
            .bind(&new.content_type)
            .bind(&new.etag)
            .bind(&new.storage_class)
            .bind(encode_metadata(&new.metadata))
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        let id: i64 = row.try_get("id")?;

        tx.commit().await?;
        Ok(object_from_new(new, id, now))
    }

    async fn mark_not_latest(&self, bucket_id: i64, key: &str) -> MetaResult<u64> {
        let result = sqlx::query(
            "UPDATE objects SET is_latest = 0 WHERE bucket_id = ?1 AND key = ?2 AND is_latest = 1",
        )
        .bind(bucket_id)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_current(&self, bucket_id: i64, key: &str) -> MetaResult<Option<ObjectRecord>> {
        let row = sqlx::query(
            "SELECT * FROM objects \
             WHERE bucket_id = ?1 AND key = ?2 AND is_latest = 1 AND deleted_at IS NULL",
        )
        .bind(bucket_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_object).transpose()
    }

    async fn get_version(
        &self,
        bucket_id: i64,
        key: &str,
        version_id: &str,
    ) -> MetaResult<Option<ObjectRecord>> {
        let row = sqlx::query(
            "SELECT * FROM objects WHERE bucket_id = ?1 AND key = ?2 AND version_id = ?3",
        )
        .bind(bucket_id)
        .bind(key)
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_object).transpose()
    }

    async fn delete_version(&self, id: i64) -> MetaResult<()> {
        let result = sqlx::query("DELETE FROM objects WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetaError::NotFound { entity: "object" });
        }
        Ok(())
    }

    async fn list_current(
        &self,
        bucket_id: i64,
        prefix: &str,
        start_after: &str,
        limit: i64,
    ) -> MetaResult<Vec<ObjectRecord>> {
        let pattern = format!("{}%", escape_like(prefix));
        let rows = sqlx::query(
            "SELECT * FROM objects \
             WHERE bucket_id = ?1 AND is_latest = 1 AND deleted_at IS NULL AND is_delete_marker = 0 \
               AND key > ?2 AND key LIKE ?3 ESCAPE '\\' \
             ORDER BY key ASC LIMIT ?4",
        )
        .bind(bucket_id)
        .bind(start_after)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_object).collect()
    }

    async fn list_versions(
        &self,
        bucket_id: i64,
        prefix: &str,
        key_marker: &str,
        limit: i64,
    ) -> MetaResult<Vec<ObjectRecord>> {
        let pattern = format!("{}%", escape_like(prefix));
        let rows = sqlx::query(
            "SELECT * FROM objects \
             WHERE bucket_id = ?1 AND key >= ?2 AND key LIKE ?3 ESCAPE '\\' \
             ORDER BY key ASC, created_at DESC, id DESC LIMIT ?4",
        )
        .bind(bucket_id)
        .bind(key_marker)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_object).collect()
    }

    async fn list_expired_current(
        &self,
        bucket_id: i64,
        prefix: &str,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> MetaResult<Vec<ObjectRecord>> {
        let pattern = format!("{}%", escape_like(prefix));
        let rows = sqlx::query(
            "SELECT * FROM objects \
             WHERE bucket_id = ?1 AND is_latest = 1 AND deleted_at IS NULL AND is_delete_marker = 0 \
               AND created_at < ?2 AND key LIKE ?3 ESCAPE '\\' \
             ORDER BY key ASC LIMIT ?4",
        )
        .bind(bucket_id)
        .bind(cutoff)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_object).collect()
    }
}

fn object_from_new(new: NewObject, id: i64, created_at: DateTime<Utc>) -> ObjectRecord {
    ObjectRecord {
        id,
        bucket_id: new.bucket_id,
        key: new.key,
        version_id: new.version_id,
        is_latest: true,
        is_delete_marker: new.is_delete_marker,
        content_hash: new.content_hash,
        size: new.size,
        content_type: new.content_type,
        etag: new.etag,
        storage_class: new.storage_class,
        metadata: new.metadata,
        created_at,
        deleted_at: None,
    }
}

// ---------------------------------------------------------------------------
// BlobIndex
// ---------------------------------------------------------------------------

#[async_trait]
impl BlobIndex for SqliteMetaStore {
    async fn upsert_blob_ref(
        &self,
        content_hash: &str,
        size: i64,
        storage_path: &str,
    ) -> MetaResult<BlobRefOutcome> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO blobs (content_hash, size, storage_path, ref_count, created_at, last_accessed) \
             VALUES (?1, ?2, ?3, 1, ?4, ?4) \
             ON CONFLICT (content_hash) DO UPDATE SET ref_count = ref_count + 1, last_accessed = ?4 \
             RETURNING ref_count",
        )
        .bind(content_hash)
        .bind(size)
        .bind(storage_path)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let ref_count: i32 = row.try_get("ref_count")?;
        Ok(BlobRefOutcome {
            is_new: ref_count == 1,
            ref_count,
        })
    }

    async fn decrement_blob_ref(&self, content_hash: &str) -> MetaResult<i32> {
        let row = sqlx::query(
            "UPDATE blobs SET ref_count = ref_count - 1 WHERE content_hash = ?1 RETURNING ref_count",
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(MetaError::NotFound { entity: "blob" })?;
        Ok(row.try_get("ref_count")?)
    }

    async fn get_blob(&self, content_hash: &str) -> MetaResult<Option<BlobRecord>> {
        let row = sqlx::query("SELECT * FROM blobs WHERE content_hash = ?1")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_blob).transpose()
    }

    async fn list_orphans(&self, cutoff: DateTime<Utc>, limit: i64) -> MetaResult<Vec<BlobRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM blobs WHERE ref_count <= 0 AND created_at < ?1 \
             ORDER BY created_at ASC LIMIT ?2",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_blob).collect()
    }

    async fn delete_blob_record(&self, content_hash: &str) -> MetaResult<()> {
        let result = sqlx::query("DELETE FROM blobs WHERE content_hash = ?1")
            .bind(content_hash)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetaError::NotFound { entity: "blob" });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MultipartStore
// ---------------------------------------------------------------------------

#[async_trait]
impl MultipartStore for SqliteMetaStore {
    async fn create_upload(&self, new: NewUpload) -> MetaResult<MultipartUpload> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO multipart_uploads (id, bucket_id, key, initiator_id, status, storage_class, metadata, initiated_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, 'InProgress', ?5, ?6, ?7, ?8)",
        )
        .bind(&new.id)
        .bind(new.bucket_id)
        .bind(&new.key)
        .bind(new.initiator_id)
        .bind(&new.storage_class)
        .bind(encode_metadata(&new.metadata))
        .bind(now)
        .bind(new.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation("multipart upload", e))?;

        Ok(MultipartUpload {
            id: new.id,
            bucket_id: new.bucket_id,
            key: new.key,
            initiator_id: new.initiator_id,
            status: UploadStatus::InProgress,
            storage_class: new.storage_class,
            metadata: new.metadata,
            initiated_at: now,
            expires_at: new.expires_at,
            completed_at: None,
        })
    }

    async fn get_upload(&self, upload_id: &str) -> MetaResult<Option<MultipartUpload>> {
        let row = sqlx::query("SELECT * FROM multipart_uploads WHERE id = ?1")
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_upload).transpose()
    }

    async fn set_upload_status(
        &self,
        upload_id: &str,
        status: UploadStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> MetaResult<()> {
        let result = sqlx::query(
            "UPDATE multipart_uploads SET status = ?1, completed_at = ?2 WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(upload_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetaError::NotFound {
                entity: "multipart upload",
            });
        }
        Ok(())
    }

    async fn upsert_part(&self, new: NewPart) -> MetaResult<Option<String>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let previous: Option<String> = sqlx::query(
            "SELECT content_hash FROM upload_parts WHERE upload_id = ?1 AND part_number = ?2",
        )
        .bind(&new.upload_id)
        .bind(new.part_number)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get("content_hash"))
        .transpose()?;

        sqlx::query(
            "INSERT INTO upload_parts (upload_id, part_number, content_hash, size, etag, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (upload_id, part_number) DO UPDATE SET \
               content_hash = excluded.content_hash, size = excluded.size, \
               etag = excluded.etag, created_at = excluded.created_at",
        )
        .bind(&new.upload_id)
        .bind(new.part_number)
        .bind(&new.content_hash)
        .bind(new.size)
        .bind(&new.etag)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(previous.filter(|hash| *hash != new.content_hash))
    }

    async fn get_part(&self, upload_id: &str, part_number: i32) -> MetaResult<Option<UploadPart>> {
        let row = sqlx::query(
            "SELECT * FROM upload_parts WHERE upload_id = ?1 AND part_number = ?2",
        )
        .bind(upload_id)
        .bind(part_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_part).transpose()
    }

    async fn list_parts(
        &self,
        upload_id: &str,
        part_number_marker: i32,
        limit: i64,
    ) -> MetaResult<Vec<UploadPart>> {
        let rows = sqlx::query(
            "SELECT * FROM upload_parts WHERE upload_id = ?1 AND part_number > ?2 \
             ORDER BY part_number ASC LIMIT ?3",
        )
        .bind(upload_id)
        .bind(part_number_marker)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_part).collect()
    }

    async fn list_uploads(
        &self,
        bucket_id: i64,
        key_marker: &str,
        upload_id_marker: &str,
        limit: i64,
    ) -> MetaResult<Vec<MultipartUpload>> {
        let rows = sqlx::query(
            "SELECT * FROM multipart_uploads \
             WHERE bucket_id = ?1 AND status = 'InProgress' \
               AND (key > ?2 OR (key = ?2 AND id > ?3)) \
             ORDER BY key ASC, id ASC LIMIT ?4",
        )
        .bind(bucket_id)
        .bind(key_marker)
        .bind(upload_id_marker)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_upload).collect()
    }

    async fn list_expired_uploads(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> MetaResult<Vec<MultipartUpload>> {
        let rows = sqlx::query(
            "SELECT * FROM multipart_uploads \
             WHERE status = 'InProgress' AND expires_at < ?1 \
             ORDER BY expires_at ASC LIMIT ?2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_upload).collect()
    }

    async fn abort_upload(&self, upload_id: &str) -> MetaResult<u64> {
        let mut tx = self.pool.begin().await?;

        let part_rows = sqlx::query(
            "SELECT content_hash FROM upload_parts WHERE upload_id = ?1 ORDER BY part_number",
        )
        .bind(upload_id)
        .fetch_all(&mut *tx)
        .await?;

        // One decrement per part, inside the same transaction as the part
        // deletion so a crash cannot double-release.
        for row in &part_rows {
            let content_hash: String = row.try_get("content_hash")?;
            sqlx::query("UPDATE blobs SET ref_count = ref_count - 1 WHERE content_hash = ?1")
                .bind(&content_hash)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM upload_parts WHERE upload_id = ?1")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            "UPDATE multipart_uploads SET status = 'Aborted' WHERE id = ?1",
        )
        .bind(upload_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetaError::NotFound {
                entity: "multipart upload",
            });
        }

        tx.commit().await?;
        debug!(upload_id, parts = part_rows.len(), "aborted multipart upload");
        Ok(part_rows.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// LifecycleStore
// ---------------------------------------------------------------------------

#[async_trait]
impl LifecycleStore for SqliteMetaStore {
    async fn put_rule(&self, new: NewLifecycleRule) -> MetaResult<LifecycleRule> {
        let row = sqlx::query(
            "INSERT INTO lifecycle_rules (bucket_id, prefix, expiration_days, enabled) \
             VALUES (?1, ?2, ?3, ?4) RETURNING id",
        )
        .bind(new.bucket_id)
        .bind(&new.prefix)
        .bind(new.expiration_days)
        .bind(new.enabled)
        .fetch_one(&self.pool)
        .await?;

        Ok(LifecycleRule {
            id: row.try_get("id")?,
            bucket_id: new.bucket_id,
            prefix: new.prefix,
            expiration_days: new.expiration_days,
            enabled: new.enabled,
        })
    }

    async fn list_rules(&self, bucket_id: i64) -> MetaResult<Vec<LifecycleRule>> {
        let rows = sqlx::query("SELECT * FROM lifecycle_rules WHERE bucket_id = ?1 ORDER BY id")
            .bind(bucket_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_rule).collect()
    }

    async fn list_enabled_rules(&self) -> MetaResult<Vec<LifecycleRule>> {
        let rows = sqlx::query("SELECT * FROM lifecycle_rules WHERE enabled = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_rule).collect()
    }

    async fn delete_rule(&self, id: i64) -> MetaResult<()> {
        let result = sqlx::query("DELETE FROM lifecycle_rules WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetaError::NotFound {
                entity: "lifecycle rule",
            });
        }
        Ok(())
    }
}
