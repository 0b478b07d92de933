//! Postgres-backed saga log.
//!
//! Enforces append-only semantics and the legal status walk at the database
//! boundary: `mark` runs in a transaction that re-reads the current status
//! under lock before updating, so concurrent workers cannot race an entry
//! into an illegal state.
//!
//! ## Error Mapping
//!
//! All SQLx failures surface as [`SagaLogError::Unavailable`] except row
//! decoding problems, which are [`SagaLogError::Corrupt`]. Handlers treat
//! `Unavailable` as retryable (nack + redeliver).

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use async_trait::async_trait;

use partnerflow_core::{EntryId, SagaId};
use partnerflow_events::EventKind;
use partnerflow_saga::SagaState;

use super::r#trait::{
    EntryStatus, NewLogEntry, SagaLogEntry, SagaLogError, SagaLogStore, SagaRecord,
};

/// Postgres saga log store.
///
/// Thread-safe; all operations go through the SQLx connection pool and use
/// short transactions (one per append/mark).
#[derive(Debug, Clone)]
pub struct PostgresSagaLogStore {
    pool: Arc<PgPool>,
}

impl PostgresSagaLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `saga_log` and `sagas` tables and their indices.
    ///
    /// Initial create only; there is no migration machinery here.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), SagaLogError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS saga_log (
                entry_id UUID PRIMARY KEY,
                saga_id UUID NOT NULL,
                partner_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                received_at TIMESTAMPTZ NOT NULL,
                processed_at TIMESTAMPTZ,
                status TEXT NOT NULL,
                error_message TEXT,
                attempts INT NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create saga_log", e))?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_saga_log_saga_received ON saga_log (saga_id, received_at)",
            "CREATE INDEX IF NOT EXISTS idx_saga_log_partner ON saga_log (partner_id)",
            "CREATE INDEX IF NOT EXISTS idx_saga_log_status ON saga_log (status)",
            "CREATE INDEX IF NOT EXISTS idx_saga_log_event_type ON saga_log (event_type)",
        ] {
            sqlx::query(ddl)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("create saga_log index", e))?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sagas (
                saga_id UUID PRIMARY KEY,
                partner_id TEXT NOT NULL UNIQUE,
                state TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create sagas", e))?;

        Ok(())
    }
}

#[async_trait]
impl SagaLogStore for PostgresSagaLogStore {
    #[instrument(
        skip(self, entry),
        fields(saga_id = %entry.saga_id, event_type = %entry.event_type),
        err
    )]
    async fn append(&self, entry: NewLogEntry) -> Result<SagaLogEntry, SagaLogError> {
        let entry_id = EntryId::new();

        sqlx::query(
            r#"
            INSERT INTO saga_log (
                entry_id, saga_id, partner_id, event_type, payload,
                received_at, status, attempts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry_id.as_uuid())
        .bind(entry.saga_id.as_uuid())
        .bind(&entry.partner_id)
        .bind(entry.event_type.name())
        .bind(&entry.payload)
        .bind(entry.received_at)
        .bind(EntryStatus::Received.name())
        .bind(1i32)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append", e))?;

        Ok(SagaLogEntry {
            entry_id,
            saga_id: entry.saga_id,
            partner_id: entry.partner_id,
            event_type: entry.event_type,
            payload: entry.payload,
            received_at: entry.received_at,
            processed_at: None,
            status: EntryStatus::Received,
            error_message: None,
            attempts: 1,
        })
    }

    #[instrument(skip(self), fields(saga_id = %saga_id), err)]
    async fn find_by_saga(
        &self,
        saga_id: SagaId,
        limit: usize,
    ) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        let rows = sqlx::query(
            r#"
            SELECT entry_id, saga_id, partner_id, event_type, payload,
                   received_at, processed_at, status, error_message, attempts
            FROM saga_log
            WHERE saga_id = $1
            ORDER BY received_at ASC
            LIMIT $2
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_saga", e))?;

        rows_to_entries(rows)
    }

    #[instrument(skip(self), err)]
    async fn find_by_partner(
        &self,
        partner_id: &str,
        limit: usize,
    ) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        let rows = sqlx::query(
            r#"
            SELECT entry_id, saga_id, partner_id, event_type, payload,
                   received_at, processed_at, status, error_message, attempts
            FROM saga_log
            WHERE partner_id = $1
            ORDER BY received_at ASC
            LIMIT $2
            "#,
        )
        .bind(partner_id)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_partner", e))?;

        rows_to_entries(rows)
    }

    #[instrument(skip(self), err)]
    async fn find_pending(&self, max_attempts: u32) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        let rows = sqlx::query(
            r#"
            SELECT entry_id, saga_id, partner_id, event_type, payload,
                   received_at, processed_at, status, error_message, attempts
            FROM saga_log
            WHERE status IN ($1, $2) AND attempts <= $3
            ORDER BY received_at ASC
            "#,
        )
        .bind(EntryStatus::Received.name())
        .bind(EntryStatus::Error.name())
        .bind(max_attempts as i32)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_pending", e))?;

        rows_to_entries(rows)
    }

    #[instrument(skip(self), fields(entry_id = %entry_id, status = %status), err)]
    async fn mark(
        &self,
        entry_id: EntryId,
        status: EntryStatus,
        error: Option<String>,
    ) -> Result<(), SagaLogError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let row = sqlx::query("SELECT status FROM saga_log WHERE entry_id = $1 FOR UPDATE")
            .bind(entry_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark/select", e))?
            .ok_or(SagaLogError::NotFound(entry_id))?;

        let current: String = row
            .try_get("status")
            .map_err(|e| SagaLogError::Corrupt(format!("status column: {e}")))?;
        let current = EntryStatus::from_str(&current)
            .map_err(|e| SagaLogError::Corrupt(e.to_string()))?;

        if !current.can_transition_to(status) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(SagaLogError::IllegalStatusTransition {
                from: current,
                to: status,
            });
        }

        match status {
            EntryStatus::Processed => {
                sqlx::query(
                    r#"
                    UPDATE saga_log
                    SET status = $2, processed_at = $3,
                        error_message = COALESCE($4, error_message)
                    WHERE entry_id = $1
                    "#,
                )
                .bind(entry_id.as_uuid())
                .bind(status.name())
                .bind(Utc::now())
                .bind(&error)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("mark/processed", e))?;
            }
            EntryStatus::Error => {
                sqlx::query(
                    r#"
                    UPDATE saga_log
                    SET status = $2, error_message = $3, attempts = attempts + 1
                    WHERE entry_id = $1
                    "#,
                )
                .bind(entry_id.as_uuid())
                .bind(status.name())
                .bind(&error)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("mark/error", e))?;
            }
            _ => {
                sqlx::query("UPDATE saga_log SET status = $2 WHERE entry_id = $1")
                    .bind(entry_id.as_uuid())
                    .bind(status.name())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("mark/update", e))?;
            }
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(skip(self, record), fields(saga_id = %record.saga_id), err)]
    async fn save_saga(&self, record: &SagaRecord) -> Result<(), SagaLogError> {
        let existing: Option<String> =
            sqlx::query("SELECT partner_id FROM sagas WHERE saga_id = $1")
                .bind(record.saga_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("save_saga/select", e))?
                .map(|row| {
                    row.try_get("partner_id")
                        .map_err(|e| SagaLogError::Corrupt(format!("partner_id column: {e}")))
                })
                .transpose()?;

        if let Some(existing) = existing {
            if existing != record.partner_id {
                return Err(SagaLogError::PartnerIdImmutable {
                    saga_id: record.saga_id,
                    existing,
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO sagas (saga_id, partner_id, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (saga_id)
            DO UPDATE SET state = EXCLUDED.state, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.saga_id.as_uuid())
        .bind(&record.partner_id)
        .bind(record.state.name())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_saga/upsert", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn find_saga_by_partner(
        &self,
        partner_id: &str,
    ) -> Result<Option<SagaRecord>, SagaLogError> {
        let row = sqlx::query(
            r#"
            SELECT saga_id, partner_id, state, created_at, updated_at
            FROM sagas
            WHERE partner_id = $1
            "#,
        )
        .bind(partner_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_saga_by_partner", e))?;

        row.map(|r| {
            SagaRecordRow::from_row(&r)
                .map_err(|e| SagaLogError::Corrupt(e.to_string()))
                .and_then(SagaRecordRow::into_record)
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_open_sagas(&self) -> Result<Vec<SagaRecord>, SagaLogError> {
        let rows = sqlx::query(
            r#"
            SELECT saga_id, partner_id, state, created_at, updated_at
            FROM sagas
            WHERE state NOT IN ($1, $2, $3)
            "#,
        )
        .bind(SagaState::CompletedOk.name())
        .bind(SagaState::CompletedFailed.name())
        .bind(SagaState::PendingRevision.name())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_open_sagas", e))?;

        rows.into_iter()
            .map(|r| {
                SagaRecordRow::from_row(&r)
                    .map_err(|e| SagaLogError::Corrupt(e.to_string()))
                    .and_then(SagaRecordRow::into_record)
            })
            .collect()
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&*self.pool).await.is_ok()
    }
}

#[derive(FromRow)]
struct SagaLogRow {
    entry_id: uuid::Uuid,
    saga_id: uuid::Uuid,
    partner_id: String,
    event_type: String,
    payload: serde_json::Value,
    received_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    status: String,
    error_message: Option<String>,
    attempts: i32,
}

impl SagaLogRow {
    fn into_entry(self) -> Result<SagaLogEntry, SagaLogError> {
        Ok(SagaLogEntry {
            entry_id: EntryId::from_uuid(self.entry_id),
            saga_id: SagaId::from_uuid(self.saga_id),
            partner_id: self.partner_id,
            event_type: EventKind::from_str(&self.event_type)
                .map_err(|e| SagaLogError::Corrupt(e.to_string()))?,
            payload: self.payload,
            received_at: self.received_at,
            processed_at: self.processed_at,
            status: EntryStatus::from_str(&self.status)
                .map_err(|e| SagaLogError::Corrupt(e.to_string()))?,
            error_message: self.error_message,
            attempts: self.attempts as u32,
        })
    }
}

#[derive(FromRow)]
struct SagaRecordRow {
    saga_id: uuid::Uuid,
    partner_id: String,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SagaRecordRow {
    fn into_record(self) -> Result<SagaRecord, SagaLogError> {
        Ok(SagaRecord {
            saga_id: SagaId::from_uuid(self.saga_id),
            partner_id: self.partner_id,
            state: SagaState::from_str(&self.state)
                .map_err(|e| SagaLogError::Corrupt(e.to_string()))?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn rows_to_entries(
    rows: Vec<sqlx::postgres::PgRow>,
) -> Result<Vec<SagaLogEntry>, SagaLogError> {
    rows.into_iter()
        .map(|row| {
            SagaLogRow::from_row(&row)
                .map_err(|e| SagaLogError::Corrupt(e.to_string()))
                .and_then(SagaLogRow::into_entry)
        })
        .collect()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SagaLogError {
    SagaLogError::Unavailable(format!("{operation}: {err}"))
}
