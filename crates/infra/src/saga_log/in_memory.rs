//! In-memory saga log for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use partnerflow_core::{EntryId, SagaId};

use super::r#trait::{
    EntryStatus, NewLogEntry, SagaLogEntry, SagaLogError, SagaLogStore, SagaRecord,
};

/// In-memory append-only saga log.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemorySagaLogStore {
    entries: RwLock<Vec<SagaLogEntry>>,
    /// partner_id → saga head
    sagas: RwLock<HashMap<String, SagaRecord>>,
}

impl InMemorySagaLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaLogStore for InMemorySagaLogStore {
    async fn append(&self, entry: NewLogEntry) -> Result<SagaLogEntry, SagaLogError> {
        let stored = SagaLogEntry {
            entry_id: EntryId::new(),
            saga_id: entry.saga_id,
            partner_id: entry.partner_id,
            event_type: entry.event_type,
            payload: entry.payload,
            received_at: entry.received_at,
            processed_at: None,
            status: EntryStatus::Received,
            error_message: None,
            attempts: 1,
        };

        let mut entries = self
            .entries
            .write()
            .map_err(|_| SagaLogError::Unavailable("lock poisoned".to_string()))?;
        entries.push(stored.clone());
        Ok(stored)
    }

    async fn find_by_saga(
        &self,
        saga_id: SagaId,
        limit: usize,
    ) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| SagaLogError::Unavailable("lock poisoned".to_string()))?;

        let mut found: Vec<SagaLogEntry> = entries
            .iter()
            .filter(|e| e.saga_id == saga_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.received_at);
        found.truncate(limit);
        Ok(found)
    }

    async fn find_by_partner(
        &self,
        partner_id: &str,
        limit: usize,
    ) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| SagaLogError::Unavailable("lock poisoned".to_string()))?;

        let mut found: Vec<SagaLogEntry> = entries
            .iter()
            .filter(|e| e.partner_id == partner_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.received_at);
        found.truncate(limit);
        Ok(found)
    }

    async fn find_pending(&self, max_attempts: u32) -> Result<Vec<SagaLogEntry>, SagaLogError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| SagaLogError::Unavailable("lock poisoned".to_string()))?;

        let mut found: Vec<SagaLogEntry> = entries
            .iter()
            .filter(|e| e.status.is_pending() && e.attempts <= max_attempts)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.received_at);
        Ok(found)
    }

    async fn mark(
        &self,
        entry_id: EntryId,
        status: EntryStatus,
        error: Option<String>,
    ) -> Result<(), SagaLogError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| SagaLogError::Unavailable("lock poisoned".to_string()))?;

        let entry = entries
            .iter_mut()
            .find(|e| e.entry_id == entry_id)
            .ok_or(SagaLogError::NotFound(entry_id))?;

        if !entry.status.can_transition_to(status) {
            return Err(SagaLogError::IllegalStatusTransition {
                from: entry.status,
                to: status,
            });
        }

        entry.status = status;
        match status {
            EntryStatus::Processed => {
                entry.processed_at = Some(Utc::now());
                if let Some(note) = error {
                    entry.error_message = Some(note);
                }
            }
            EntryStatus::Error => {
                entry.attempts += 1;
                entry.error_message = error;
            }
            _ => {}
        }
        Ok(())
    }

    async fn save_saga(&self, record: &SagaRecord) -> Result<(), SagaLogError> {
        let mut sagas = self
            .sagas
            .write()
            .map_err(|_| SagaLogError::Unavailable("lock poisoned".to_string()))?;

        if let Some(existing) = sagas.values().find(|s| s.saga_id == record.saga_id) {
            if existing.partner_id != record.partner_id {
                return Err(SagaLogError::PartnerIdImmutable {
                    saga_id: record.saga_id,
                    existing: existing.partner_id.clone(),
                });
            }
        }

        sagas.insert(record.partner_id.clone(), record.clone());
        Ok(())
    }

    async fn find_saga_by_partner(
        &self,
        partner_id: &str,
    ) -> Result<Option<SagaRecord>, SagaLogError> {
        let sagas = self
            .sagas
            .read()
            .map_err(|_| SagaLogError::Unavailable("lock poisoned".to_string()))?;
        Ok(sagas.get(partner_id).cloned())
    }

    async fn list_open_sagas(&self) -> Result<Vec<SagaRecord>, SagaLogError> {
        let sagas = self
            .sagas
            .read()
            .map_err(|_| SagaLogError::Unavailable("lock poisoned".to_string()))?;
        Ok(sagas
            .values()
            .filter(|s| !s.state.is_terminal())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partnerflow_events::EventKind;
    use partnerflow_saga::SagaState;
    use serde_json::json;

    fn entry_for(partner: &str) -> NewLogEntry {
        NewLogEntry::new(
            SagaId::for_partner(partner),
            partner,
            EventKind::PartnerCreated,
            json!({"partner_id": partner}),
        )
    }

    #[tokio::test]
    async fn append_assigns_received_status_and_first_attempt() {
        let store = InMemorySagaLogStore::new();
        let stored = store.append(entry_for("P0000000001")).await.unwrap();
        assert_eq!(stored.status, EntryStatus::Received);
        assert_eq!(stored.attempts, 1);
        assert!(stored.processed_at.is_none());
    }

    #[tokio::test]
    async fn status_walk_received_processing_processed() {
        let store = InMemorySagaLogStore::new();
        let stored = store.append(entry_for("P0000000001")).await.unwrap();

        store
            .mark(stored.entry_id, EntryStatus::Processing, None)
            .await
            .unwrap();
        store
            .mark(stored.entry_id, EntryStatus::Processed, None)
            .await
            .unwrap();

        let entries = store
            .find_by_saga(SagaId::for_partner("P0000000001"), 10)
            .await
            .unwrap();
        assert_eq!(entries[0].status, EntryStatus::Processed);
        assert!(entries[0].processed_at.is_some());
    }

    #[tokio::test]
    async fn illegal_status_moves_are_rejected() {
        let store = InMemorySagaLogStore::new();
        let stored = store.append(entry_for("P0000000001")).await.unwrap();

        // Received → Processed skips Processing.
        let err = store
            .mark(stored.entry_id, EntryStatus::Processed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaLogError::IllegalStatusTransition { .. }));

        // Processed entries are frozen.
        store
            .mark(stored.entry_id, EntryStatus::Processing, None)
            .await
            .unwrap();
        store
            .mark(stored.entry_id, EntryStatus::Processed, None)
            .await
            .unwrap();
        let err = store
            .mark(stored.entry_id, EntryStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaLogError::IllegalStatusTransition { .. }));
    }

    #[tokio::test]
    async fn marking_error_bumps_attempts_and_allows_reprocessing() {
        let store = InMemorySagaLogStore::new();
        let stored = store.append(entry_for("P0000000001")).await.unwrap();

        store
            .mark(stored.entry_id, EntryStatus::Processing, None)
            .await
            .unwrap();
        store
            .mark(stored.entry_id, EntryStatus::Error, Some("store down".to_string()))
            .await
            .unwrap();

        let pending = store.find_pending(3).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(pending[0].error_message.as_deref(), Some("store down"));

        // Error → Processing is the retry path.
        store
            .mark(stored.entry_id, EntryStatus::Processing, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn find_pending_respects_the_attempt_cap() {
        let store = InMemorySagaLogStore::new();
        let stored = store.append(entry_for("P0000000001")).await.unwrap();

        for _ in 0..3 {
            store
                .mark(stored.entry_id, EntryStatus::Processing, None)
                .await
                .unwrap();
            store
                .mark(stored.entry_id, EntryStatus::Error, Some("still down".to_string()))
                .await
                .unwrap();
        }

        // attempts is now 4, past the default cap of 3.
        assert!(store.find_pending(3).await.unwrap().is_empty());
        assert_eq!(store.find_pending(4).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_is_ordered_and_append_only() {
        let store = InMemorySagaLogStore::new();
        for _ in 0..3 {
            store.append(entry_for("P0000000001")).await.unwrap();
        }

        let entries = store
            .find_by_partner("P0000000001", 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.windows(2).all(|w| w[0].received_at <= w[1].received_at));
    }

    #[tokio::test]
    async fn saga_head_upsert_keeps_partner_id_immutable() {
        let store = InMemorySagaLogStore::new();
        let now = Utc::now();
        let record = SagaRecord {
            saga_id: SagaId::for_partner("P0000000001"),
            partner_id: "P0000000001".to_string(),
            state: SagaState::PartnerCreated,
            created_at: now,
            updated_at: now,
        };
        store.save_saga(&record).await.unwrap();

        let renamed = SagaRecord {
            partner_id: "P0000000099".to_string(),
            ..record.clone()
        };
        let err = store.save_saga(&renamed).await.unwrap_err();
        assert!(matches!(err, SagaLogError::PartnerIdImmutable { .. }));

        // State updates on the same partner are fine.
        let advanced = SagaRecord {
            state: SagaState::ContractCreated,
            ..record
        };
        store.save_saga(&advanced).await.unwrap();
        let found = store.find_saga_by_partner("P0000000001").await.unwrap().unwrap();
        assert_eq!(found.state, SagaState::ContractCreated);
    }

    #[tokio::test]
    async fn open_sagas_excludes_terminal_states() {
        let store = InMemorySagaLogStore::new();
        let now = Utc::now();
        store
            .save_saga(&SagaRecord {
                saga_id: SagaId::for_partner("P0000000001"),
                partner_id: "P0000000001".to_string(),
                state: SagaState::ContractCreated,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        store
            .save_saga(&SagaRecord {
                saga_id: SagaId::for_partner("P0000000002"),
                partner_id: "P0000000002".to_string(),
                state: SagaState::CompletedOk,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let open = store.list_open_sagas().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].partner_id, "P0000000001");
    }
}
