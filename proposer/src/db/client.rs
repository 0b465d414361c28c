//! SQLite-backed implementation of the proof request store.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::{ProofRequest, RequestStatus, RequestType, StoreError};

/// Durable store for proof requests.
///
/// The pool is restricted to a single connection: SQLite has a single
/// writer anyway, and funneling every operation through one connection is
/// what serializes concurrent status transitions from scheduler workers.
#[derive(Debug, Clone)]
pub struct ProofStore {
    pool: SqlitePool,
}

impl ProofStore {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(sqlx::Error::from)?;

        info!("proof request store ready");
        Ok(Self { pool })
    }

    /// Inserts a new unrequested entry, rejecting any range that overlaps
    /// a non-failed entry of the same type. Returns the new id.
    pub async fn new_entry(
        &self,
        req_type: RequestType,
        start_block: i64,
        end_block: i64,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let overlapping: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM proof_requests
             WHERE req_type = ? AND status != ? AND start_block <= ? AND end_block >= ?",
        )
        .bind(req_type)
        .bind(RequestStatus::Failed)
        .bind(end_block)
        .bind(start_block)
        .fetch_one(&mut *tx)
        .await?;

        if overlapping > 0 {
            return Err(StoreError::Duplicate { req_type, start: start_block, end: end_block });
        }

        let result = sqlx::query(
            "INSERT INTO proof_requests (req_type, start_block, end_block, status)
             VALUES (?, ?, ?, ?)",
        )
        .bind(req_type)
        .bind(start_block)
        .bind(end_block)
        .bind(RequestStatus::Unrequested)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    /// All unrequested entries in `(start_block asc, id asc)` order.
    pub async fn get_all_unrequested(&self) -> Result<Vec<ProofRequest>, StoreError> {
        let requests = sqlx::query_as::<_, ProofRequest>(
            "SELECT * FROM proof_requests WHERE status = ? ORDER BY start_block ASC, id ASC",
        )
        .bind(RequestStatus::Unrequested)
        .fetch_all(&self.pool)
        .await?;
        Ok(requests)
    }

    /// All entries currently awaiting the prover.
    pub async fn get_all_pending(&self) -> Result<Vec<ProofRequest>, StoreError> {
        let requests = sqlx::query_as::<_, ProofRequest>(
            "SELECT * FROM proof_requests WHERE status = ? ORDER BY start_block ASC, id ASC",
        )
        .bind(RequestStatus::Requested)
        .fetch_all(&self.pool)
        .await?;
        Ok(requests)
    }

    pub async fn fetch_request(&self, id: i64) -> Result<ProofRequest, StoreError> {
        sqlx::query_as::<_, ProofRequest>("SELECT * FROM proof_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)
    }

    /// Advances a request's status. The update is a compare-and-swap on the
    /// unique legal prior status, so when two workers race on the same
    /// entry exactly one wins and the other observes `IllegalTransition`.
    ///
    /// Entering `Requested` also stamps `request_time`, the base for the
    /// proof timeout.
    pub async fn update_status(
        &self,
        id: i64,
        new_status: RequestStatus,
    ) -> Result<(), StoreError> {
        let prior = match new_status {
            RequestStatus::Requested => RequestStatus::Unrequested,
            RequestStatus::Complete | RequestStatus::Failed => RequestStatus::Requested,
            RequestStatus::Unrequested => {
                let from = self.fetch_request(id).await?.status;
                return Err(StoreError::IllegalTransition { id, from, to: new_status });
            }
        };

        let query = if new_status == RequestStatus::Requested {
            "UPDATE proof_requests
             SET status = ?, request_time = strftime('%s', 'now'),
                 updated_at = strftime('%s', 'now')
             WHERE id = ? AND status = ?"
        } else {
            "UPDATE proof_requests
             SET status = ?, updated_at = strftime('%s', 'now')
             WHERE id = ? AND status = ?"
        };
        let result =
            sqlx::query(query).bind(new_status).bind(id).bind(prior).execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            let from = self.fetch_request(id).await?.status;
            return Err(StoreError::IllegalTransition { id, from, to: new_status });
        }
        Ok(())
    }

    /// Records the prover's handle for a request. Only legal while the
    /// request is `Requested` and the handle has not been set before.
    pub async fn set_prover_request_id(&self, id: i64, rid: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE proof_requests
             SET prover_request_id = ?, updated_at = strftime('%s', 'now')
             WHERE id = ? AND status = ? AND prover_request_id IS NULL",
        )
        .bind(rid)
        .bind(id)
        .bind(RequestStatus::Requested)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let from = self.fetch_request(id).await?.status;
            return Err(StoreError::IllegalTransition { id, from, to: RequestStatus::Requested });
        }
        Ok(())
    }

    /// Stores the proof bytes and marks the request complete in one write.
    pub async fn add_proof(&self, id: i64, proof: &[u8]) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE proof_requests
             SET proof = ?, status = ?, updated_at = strftime('%s', 'now')
             WHERE id = ? AND status = ?",
        )
        .bind(proof)
        .bind(RequestStatus::Complete)
        .bind(id)
        .bind(RequestStatus::Requested)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let from = self.fetch_request(id).await?.status;
            return Err(StoreError::IllegalTransition { id, from, to: RequestStatus::Complete });
        }
        Ok(())
    }

    /// Highest end block across all non-failed entries; the derivation
    /// watermark.
    pub async fn get_latest_end_block(&self) -> Result<i64, StoreError> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(end_block) FROM proof_requests WHERE status != ?",
        )
        .bind(RequestStatus::Failed)
        .fetch_one(&self.pool)
        .await?;
        max.ok_or(StoreError::NotFound)
    }

    /// Proof bytes of the complete span proofs exactly partitioning
    /// `[start_block, end_block]`, in start-block order.
    pub async fn get_subproofs(
        &self,
        start_block: i64,
        end_block: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let spans = sqlx::query_as::<_, ProofRequest>(
            "SELECT * FROM proof_requests
             WHERE req_type = ? AND status = ? AND start_block >= ? AND end_block <= ?
             ORDER BY start_block ASC",
        )
        .bind(RequestType::Span)
        .bind(RequestStatus::Complete)
        .bind(start_block)
        .bind(end_block)
        .fetch_all(&self.pool)
        .await?;

        let missing = || StoreError::MissingPartition { start: start_block, end: end_block };
        let mut expected = start_block;
        let mut proofs = Vec::with_capacity(spans.len());
        for span in &spans {
            if span.start_block != expected {
                return Err(missing());
            }
            proofs.push(span.proof.clone().ok_or_else(missing)?);
            expected = span.end_block + 1;
        }
        if expected != end_block + 1 {
            return Err(missing());
        }
        Ok(proofs)
    }

    /// Creates an unrequested AGG entry over the maximal gap-free chain of
    /// complete span proofs starting at `from`, provided the chain reaches
    /// at least `min_to` and no non-failed AGG with the same start exists.
    /// Returns the created range.
    pub async fn try_create_agg_proof_from_span_proofs(
        &self,
        from: i64,
        min_to: i64,
    ) -> Result<Option<(i64, i64)>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let active_aggs: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM proof_requests
             WHERE req_type = ? AND start_block = ? AND status != ?",
        )
        .bind(RequestType::Aggregation)
        .bind(from)
        .bind(RequestStatus::Failed)
        .fetch_one(&mut *tx)
        .await?;
        if active_aggs > 0 {
            return Ok(None);
        }

        let spans: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT start_block, end_block FROM proof_requests
             WHERE req_type = ? AND status = ? AND start_block >= ?
             ORDER BY start_block ASC",
        )
        .bind(RequestType::Span)
        .bind(RequestStatus::Complete)
        .bind(from)
        .fetch_all(&mut *tx)
        .await?;

        let mut expected = from;
        for (start, end) in spans {
            if start != expected {
                break;
            }
            expected = end + 1;
        }
        let end = expected - 1;
        if expected == from || end < min_to {
            return Ok(None);
        }

        sqlx::query(
            "INSERT INTO proof_requests (req_type, start_block, end_block, status)
             VALUES (?, ?, ?, ?)",
        )
        .bind(RequestType::Aggregation)
        .bind(from)
        .bind(end)
        .bind(RequestStatus::Unrequested)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some((from, end)))
    }

    /// Attaches the L1 checkpoint to the unrequested AGG entry covering
    /// `[start_block, end_block]`.
    pub async fn add_l1_block_info(
        &self,
        start_block: i64,
        end_block: i64,
        l1_block_number: i64,
        l1_block_hash: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE proof_requests
             SET l1_block_number = ?, l1_block_hash = ?, updated_at = strftime('%s', 'now')
             WHERE req_type = ? AND start_block = ? AND end_block = ? AND status = ?",
        )
        .bind(l1_block_number)
        .bind(l1_block_hash)
        .bind(RequestType::Aggregation)
        .bind(start_block)
        .bind(end_block)
        .bind(RequestStatus::Unrequested)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
