use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use partnerflow_core::{EntryId, SagaId};
use partnerflow_events::EventKind;
use partnerflow_saga::SagaState;

/// Processing status of one log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Received,
    Processing,
    Processed,
    Error,
}

impl EntryStatus {
    pub fn name(&self) -> &'static str {
        match self {
            EntryStatus::Received => "received",
            EntryStatus::Processing => "processing",
            EntryStatus::Processed => "processed",
            EntryStatus::Error => "error",
        }
    }

    /// The only legal status moves. Everything else is rejected so a
    /// `Processed` entry can never be rewritten.
    pub fn can_transition_to(&self, next: EntryStatus) -> bool {
        matches!(
            (self, next),
            (EntryStatus::Received, EntryStatus::Processing)
                | (EntryStatus::Processing, EntryStatus::Processed)
                | (EntryStatus::Processing, EntryStatus::Error)
                | (EntryStatus::Error, EntryStatus::Processing)
        )
    }

    /// Entries a background reprocessor may pick up.
    pub fn is_pending(&self) -> bool {
        matches!(self, EntryStatus::Received | EntryStatus::Error)
    }
}

impl core::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl core::str::FromStr for EntryStatus {
    type Err = partnerflow_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            EntryStatus::Received,
            EntryStatus::Processing,
            EntryStatus::Processed,
            EntryStatus::Error,
        ]
        .into_iter()
        .find(|status| status.name() == s)
        .ok_or_else(|| partnerflow_core::DomainError::validation(format!("unknown entry status: {s}")))
    }
}

/// An entry ready to be appended (not yet assigned an id or status).
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub saga_id: SagaId,
    pub partner_id: String,
    pub event_type: EventKind,
    pub payload: JsonValue,
    pub received_at: DateTime<Utc>,
}

impl NewLogEntry {
    pub fn new(
        saga_id: SagaId,
        partner_id: impl Into<String>,
        event_type: EventKind,
        payload: JsonValue,
    ) -> Self {
        Self {
            saga_id,
            partner_id: partner_id.into(),
            event_type,
            payload,
            received_at: Utc::now(),
        }
    }
}

/// A stored log entry. Append-only; `Processed` entries are never mutated,
/// and broker redeliveries append new entries rather than overwriting.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaLogEntry {
    pub entry_id: EntryId,
    pub saga_id: SagaId,
    pub partner_id: String,
    pub event_type: EventKind,
    pub payload: JsonValue,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    pub error_message: Option<String>,
    /// Monotonic processing-attempt counter, starting at 1.
    pub attempts: u32,
}

/// Saga head row, owned by the log store.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaRecord {
    pub saga_id: SagaId,
    pub partner_id: String,
    pub state: SagaState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SagaLogError {
    /// The backing store could not be reached or the write failed. Handlers
    /// must surface this (nack) so the broker redelivers; never swallow it.
    #[error("saga log unavailable: {0}")]
    Unavailable(String),

    #[error("log entry not found: {0}")]
    NotFound(EntryId),

    #[error("illegal status transition: {from} -> {to}")]
    IllegalStatusTransition { from: EntryStatus, to: EntryStatus },

    /// The correlation key of a saga row is immutable after first write.
    #[error("partner id is immutable: saga {saga_id} is bound to {existing}")]
    PartnerIdImmutable { saga_id: SagaId, existing: String },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Durable, append-only saga log.
///
/// - `append` succeeds or fails loudly; it never silently drops
/// - status moves only along [`EntryStatus::can_transition_to`]
/// - marking `Error` bumps `attempts` and records the message
/// - marking `Processed` stamps `processed_at`
#[async_trait]
pub trait SagaLogStore: Send + Sync {
    async fn append(&self, entry: NewLogEntry) -> Result<SagaLogEntry, SagaLogError>;

    /// Entries for a saga, ordered by `received_at` ascending.
    async fn find_by_saga(
        &self,
        saga_id: SagaId,
        limit: usize,
    ) -> Result<Vec<SagaLogEntry>, SagaLogError>;

    /// Entries for a partner, ordered by `received_at` ascending.
    async fn find_by_partner(
        &self,
        partner_id: &str,
        limit: usize,
    ) -> Result<Vec<SagaLogEntry>, SagaLogError>;

    /// Entries in `{Received, Error}` with `attempts <= max_attempts`,
    /// oldest first. Consumed by the background reprocessor.
    async fn find_pending(&self, max_attempts: u32) -> Result<Vec<SagaLogEntry>, SagaLogError>;

    async fn mark(
        &self,
        entry_id: EntryId,
        status: EntryStatus,
        error: Option<String>,
    ) -> Result<(), SagaLogError>;

    /// Upsert a saga head row. The partner id is immutable after first write.
    async fn save_saga(&self, record: &SagaRecord) -> Result<(), SagaLogError>;

    async fn find_saga_by_partner(
        &self,
        partner_id: &str,
    ) -> Result<Option<SagaRecord>, SagaLogError>;

    /// Sagas not yet in a terminal state, for restart recovery.
    async fn list_open_sagas(&self) -> Result<Vec<SagaRecord>, SagaLogError>;

    /// Liveness probe for the operational surface.
    async fn ping(&self) -> bool {
        true
    }
}

#[async_trait]
impl<S> SagaLogStore for Arc<S>
where
    S: SagaLogStore + ?Sized,
{
    async fn append(&self, entry: NewLogEntry) -> Result<SagaLogEntry, SagaLogError> {
        (**self).append(entry).await
    }

    async fn find_by_saga(
        &self,
        saga_id: SagaId,
        limit: usize,
    ) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        (**self).find_by_saga(saga_id, limit).await
    }

    async fn find_by_partner(
        &self,
        partner_id: &str,
        limit: usize,
    ) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        (**self).find_by_partner(partner_id, limit).await
    }

    async fn find_pending(&self, max_attempts: u32) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        (**self).find_pending(max_attempts).await
    }

    async fn mark(
        &self,
        entry_id: EntryId,
        status: EntryStatus,
        error: Option<String>,
    ) -> Result<(), SagaLogError> {
        (**self).mark(entry_id, status, error).await
    }

    async fn save_saga(&self, record: &SagaRecord) -> Result<(), SagaLogError> {
        (**self).save_saga(record).await
    }

    async fn find_saga_by_partner(
        &self,
        partner_id: &str,
    ) -> Result<Option<SagaRecord>, SagaLogError> {
        (**self).find_saga_by_partner(partner_id).await
    }

    async fn list_open_sagas(&self) -> Result<Vec<SagaRecord>, SagaLogError> {
        (**self).list_open_sagas().await
    }

    async fn ping(&self) -> bool {
        (**self).ping().await
    }
}
