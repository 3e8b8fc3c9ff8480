//! PostgreSQL advisory lock provider
//!
//! Uses session-scoped `pg_try_advisory_lock` on a connection that is kept out
//! of the pool while the lock is held. If that connection dies the server
//! drops the lock, so a crashed holder can never wedge future migrations.

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::collections::HashMap;

use super::{LockProvider, LockState};
use crate::error::LockResult;

/// Stable 64-bit lock id for a key: the first eight bytes of its SHA-256.
pub fn advisory_key(key: &str) -> i64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

pub struct AdvisoryLockProvider {
    pool: PgPool,
    /// Held sessions by owner token
    held: Mutex<HashMap<String, PoolConnection<Postgres>>>,
}

impl AdvisoryLockProvider {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LockProvider for AdvisoryLockProvider {
    fn name(&self) -> &'static str {
        "advisory"
    }

    async fn try_acquire(&self, key: &str) -> LockResult<Option<LockState>> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(advisory_key(key))
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            return Ok(None);
        }

        let state = LockState::new(key);
        self.held.lock().insert(state.owner_token.clone(), conn);
        Ok(Some(state))
    }

    async fn release(&self, key: &str, token: &str) -> LockResult<bool> {
        let conn = self.held.lock().remove(token);
        let Some(mut conn) = conn else {
            return Ok(false);
        };

        let unlocked: Result<bool, sqlx::Error> =
            sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                .bind(advisory_key(key))
                .fetch_one(&mut *conn)
                .await;

        match unlocked {
            Ok(unlocked) => Ok(unlocked),
            Err(e) => {
                // Ending the session frees every lock it holds
                tracing::warn!(
                    "pg_advisory_unlock failed for '{}', closing the session instead: {}",
                    key,
                    e
                );
                if let Err(close_err) = conn.close().await {
                    tracing::warn!("Closing lock session failed: {}", close_err);
                }
                Ok(true)
            }
        }
    }

    /// Looks the key up in `pg_locks` without taking the lock.
    async fn is_locked(&self, key: &str) -> LockResult<bool> {
        let (high, low) = lock_id_halves(advisory_key(key));
        let held: bool = sqlx::query_scalar(IS_LOCKED_SQL)
            .bind(high)
            .bind(low)
            .fetch_one(&self.pool)
            .await?;
        Ok(held)
    }
}

/// A bigint advisory lock shows up in `pg_locks` with its high half in
/// `classid`, its low half in `objid` and `objsubid = 1`.
const IS_LOCKED_SQL: &str = "SELECT EXISTS (\
     SELECT 1 FROM pg_locks \
     WHERE locktype = 'advisory' AND granted AND objsubid = 1 \
     AND database = (SELECT oid FROM pg_database WHERE datname = current_database()) \
     AND classid::bigint = $1 AND objid::bigint = $2)";

/// Unsigned 32-bit halves of a lock id, as `pg_locks` reports them
fn lock_id_halves(id: i64) -> (i64, i64) {
    let bits = id as u64;
    ((bits >> 32) as i64, (bits & 0xffff_ffff) as i64)
}
