//! Per-destination in-progress marker
//!
//! One row in `wh_upload_locks` per `(source, destination)`. A lock whose
//! lease has expired can be taken over, so a crashed scheduler does not
//! block its destinations forever.

use sqlx::PgPool;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::UploadError;

/// Proof of holding the lock of one pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub source_id: String,
    pub destination_id: String,
    pub owner: String,
}

#[derive(Clone)]
pub struct UploadLocks {
    pool: PgPool,
    lease: Duration,
    identity: String,
}

impl UploadLocks {
    pub fn new(pool: PgPool, lease: Duration, identity: impl Into<String>) -> Self {
        Self {
            pool,
            lease,
            identity: identity.into(),
        }
    }

    /// Takes the lock if it is free or its lease has expired.
    pub async fn acquire(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> Result<Option<LockToken>, UploadError> {
        let owner = format!("{}:{}", self.identity, Uuid::new_v4().simple());

        let result = sqlx::query(
            r#"
            INSERT INTO wh_upload_locks (source_id, destination_id, owner, lease_expires_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (source_id, destination_id) DO UPDATE
            SET owner = EXCLUDED.owner,
                upload_id = NULL,
                lease_expires_at = EXCLUDED.lease_expires_at,
                acquired_at = NOW()
            WHERE wh_upload_locks.lease_expires_at < NOW()
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .bind(&owner)
        .bind(self.lease.as_secs_f64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(source_id, destination_id, "Upload lock held elsewhere");
            return Ok(None);
        }

        Ok(Some(LockToken {
            source_id: source_id.to_string(),
            destination_id: destination_id.to_string(),
            owner,
        }))
    }

    /// Records which upload the lock holder is running.
    pub async fn attach(&self, token: &LockToken, upload_id: i64) -> Result<(), UploadError> {
        let result = sqlx::query(
            r#"
            UPDATE wh_upload_locks SET upload_id = $4
            WHERE source_id = $1 AND destination_id = $2 AND owner = $3
            "#,
        )
        .bind(&token.source_id)
        .bind(&token.destination_id)
        .bind(&token.owner)
        .bind(upload_id)
        .execute(&self.pool)
        .await?;

        ensure_held(token, result.rows_affected())
    }

    /// Extends the lease. Fails with [`UploadError::LeaseLost`] once another
    /// owner has taken the lock.
    pub async fn renew(&self, token: &LockToken) -> Result<(), UploadError> {
        let result = sqlx::query(
            r#"
            UPDATE wh_upload_locks
            SET lease_expires_at = NOW() + make_interval(secs => $4)
            WHERE source_id = $1 AND destination_id = $2 AND owner = $3
            "#,
        )
        .bind(&token.source_id)
        .bind(&token.destination_id)
        .bind(&token.owner)
        .bind(self.lease.as_secs_f64())
        .execute(&self.pool)
        .await?;

        ensure_held(token, result.rows_affected())
    }

    /// Drops the lock if still owned by `token`.
    pub async fn release(&self, token: &LockToken) -> Result<(), UploadError> {
        sqlx::query(
            r#"
            DELETE FROM wh_upload_locks
            WHERE source_id = $1 AND destination_id = $2 AND owner = $3
            "#,
        )
        .bind(&token.source_id)
        .bind(&token.destination_id)
        .bind(&token.owner)
        .execute(&self.pool)
        .await?;

        debug!(source_id = %token.source_id, destination_id = %token.destination_id, "Upload lock released");
        Ok(())
    }
}

fn ensure_held(token: &LockToken, rows_affected: u64) -> Result<(), UploadError> {
    if rows_affected == 0 {
        Err(UploadError::LeaseLost {
            source_id: token.source_id.clone(),
            destination_id: token.destination_id.clone(),
        })
    } else {
        Ok(())
    }
}
