use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{error::AppError, storage::db::SurrealDbClient};

/// Record id of the organization-wide counter in the shared store.
const COUNTER_KEY: &str = "openai_tpm_counter";
/// Sliding-minute leak: every write re-arms a 70 second expiry.
const WINDOW_TTL: &str = "70s";
/// Pause between reservation attempts while waiting for budget.
const RETRY_SLEEP: Duration = Duration::from_millis(500);

/// Outcome of a single reservation attempt.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub ok: bool,
    pub used_after: u64,
}

#[derive(Deserialize)]
struct CounterRow {
    used: u64,
}

/// Shared per-minute token bucket gating every external model call. The
/// counter is a single record in the shared store; increment-then-check with
/// a best-effort decrement on overshoot is acceptable per the budget
/// contract. Store errors fail closed.
#[derive(Clone)]
pub struct RateLedger {
    db: std::sync::Arc<SurrealDbClient>,
    tpm_limit: u64,
}

impl RateLedger {
    pub fn new(db: std::sync::Arc<SurrealDbClient>, tpm_limit: u64) -> Self {
        Self { db, tpm_limit }
    }

    /// Atomically add `tokens` to the minute window and report whether the
    /// post-increment usage is inside the ceiling. Expired windows reset
    /// before the increment; the expiry is re-armed on every write.
    pub async fn reserve(&self, tokens: u64) -> Result<Reservation, AppError> {
        let sql = format!(
            "UPSERT type::thing('rate_budget', $key) SET \
                used = IF expires_at != NONE AND expires_at > time::now() \
                    THEN (used ?? 0) + $tokens \
                    ELSE $tokens \
                END, \
                expires_at = time::now() + {WINDOW_TTL} \
             RETURN AFTER;"
        );

        let mut response = self
            .db
            .query(sql)
            .bind(("key", COUNTER_KEY))
            .bind(("tokens", tokens))
            .await?;

        let rows: Vec<CounterRow> = response.take(0)?;
        let used_after = rows
            .into_iter()
            .next()
            .map(|row| row.used)
            .ok_or_else(|| AppError::InternalError("rate counter upsert returned no row".into()))?;

        if used_after <= self.tpm_limit {
            return Ok(Reservation {
                ok: true,
                used_after,
            });
        }

        // Best-effort release of the overshoot; a failure here only costs
        // budget until the window expires.
        let release = self
            .db
            .query(
                "UPDATE type::thing('rate_budget', $key) SET \
                    used = IF (used ?? 0) > $tokens THEN used - $tokens ELSE 0 END;",
            )
            .bind(("key", COUNTER_KEY))
            .bind(("tokens", tokens))
            .await;
        if let Err(err) = release {
            warn!(error = %err, "failed to release over-limit reservation");
        }

        Ok(Reservation {
            ok: false,
            used_after,
        })
    }

    /// Loop `reserve` with 500 ms pauses until it succeeds or `max_wait`
    /// elapses. Store failures count as rejection (fail closed).
    pub async fn try_acquire(&self, tokens: u64, max_wait: Duration) -> bool {
        let mut waited = Duration::ZERO;

        loop {
            match self.reserve(tokens).await {
                Ok(Reservation { ok: true, .. }) => return true,
                Ok(Reservation {
                    ok: false,
                    used_after,
                }) => {
                    debug!(tokens, used_after, "rate budget exhausted, waiting");
                }
                Err(err) => {
                    warn!(error = %err, "rate ledger unreachable, rejecting reservation");
                }
            }

            if waited >= max_wait {
                return false;
            }
            sleep(RETRY_SLEEP).await;
            waited += RETRY_SLEEP;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn setup_ledger(tpm_limit: u64) -> (RateLedger, Arc<SurrealDbClient>) {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory(namespace, database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        (RateLedger::new(Arc::clone(&db), tpm_limit), db)
    }

    #[tokio::test]
    async fn test_reserve_within_limit() {
        let (ledger, _db) = setup_ledger(100).await;

        let first = ledger.reserve(60).await.expect("reserve");
        assert!(first.ok);
        assert_eq!(first.used_after, 60);

        let second = ledger.reserve(30).await.expect("reserve");
        assert!(second.ok);
        assert_eq!(second.used_after, 90);
    }

    #[tokio::test]
    async fn test_over_limit_reservation_is_released() {
        let (ledger, _db) = setup_ledger(100).await;

        let first = ledger.reserve(99).await.expect("reserve");
        assert!(first.ok);

        let second = ledger.reserve(50).await.expect("reserve");
        assert!(!second.ok);
        assert_eq!(second.used_after, 149);

        // The failed reservation must not consume budget.
        let third = ledger.reserve(1).await.expect("reserve");
        assert!(third.ok);
        assert_eq!(third.used_after, 100);
    }

    #[tokio::test]
    async fn test_try_acquire_rejects_without_waiting() {
        let (ledger, _db) = setup_ledger(100).await;

        assert!(ledger.try_acquire(99, Duration::ZERO).await);
        assert!(!ledger.try_acquire(50, Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_expired_window_resets_counter() {
        let (ledger, db) = setup_ledger(100).await;

        let first = ledger.reserve(90).await.expect("reserve");
        assert!(first.ok);

        // Force the window into the past; the next reservation starts fresh.
        db.query(
            "UPDATE type::thing('rate_budget', $key) SET expires_at = time::now() - 1m;",
        )
        .bind(("key", COUNTER_KEY))
        .await
        .expect("age counter");

        let second = ledger.reserve(90).await.expect("reserve");
        assert!(second.ok);
        assert_eq!(second.used_after, 90);
    }
}
