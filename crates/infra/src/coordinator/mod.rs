//! Saga coordinator: drives inbound events through the log store and the
//! state machine, and runs the rejection → revision escalation path.
//!
//! Flow per message:
//! receive → decode → correlate → append `Received` → `Processing` →
//! apply transition → side effects → `Processed` + ack
//! (any failure: `Error` + nack, the broker redelivers)
//!
//! The coordinator owns the saga map; the store and bus are injected at
//! construction. Workers hold a coordinator handle and never reach back for
//! globals.

pub mod normalize;
pub mod striped;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use partnerflow_compliance::RuleId;
use partnerflow_core::SagaId;
use partnerflow_events::schema::{ContractRejected, ContractRevisionRequested};
use partnerflow_events::{
    CodecError, Delivery, EventKind, MessageBus, PublishError, SagaEvent, SubscribeError, codec,
    topics,
};
use partnerflow_saga::{Observation, Saga, SagaState, SideEffect};

use crate::saga_log::{EntryStatus, NewLogEntry, SagaLogEntry, SagaLogError, SagaLogStore, SagaRecord};
use striped::StripedLock;

/// Bounded in-handler retry for transient publish failures; beyond this the
/// handler fails and the broker redelivers.
const PUBLISH_RETRIES: u32 = 3;

/// Upper bound on history loaded for replay; sagas are short-lived and never
/// come close.
const HISTORY_LIMIT: usize = 1_000;

#[derive(Debug, Error)]
pub enum HandleError {
    #[error(transparent)]
    Store(#[from] SagaLogError),

    #[error("revision publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Hosts the active saga states and the per-topic consumer loops.
pub struct SagaCoordinator<S> {
    store: S,
    bus: Arc<dyn MessageBus>,
    /// partner_id → live aggregate. Mutated only under the stripe guard.
    sagas: Mutex<HashMap<String, Saga>>,
    stripes: StripedLock,
    lease: Duration,
}

impl<S> SagaCoordinator<S>
where
    S: SagaLogStore + 'static,
{
    pub fn new(store: S, bus: Arc<dyn MessageBus>, lease: Duration) -> Self {
        Self {
            store,
            bus,
            sagas: Mutex::new(HashMap::new()),
            stripes: StripedLock::default(),
            lease,
        }
    }

    /// Reload open sagas from the log store after a restart.
    ///
    /// Replays each saga's processed history into in-memory state; returns
    /// how many sagas were recovered.
    pub async fn recover(&self) -> Result<usize, SagaLogError> {
        let open = self.store.list_open_sagas().await?;
        let count = open.len();
        for record in open {
            let saga = self.replay_from_store(&record).await?;
            info!(
                partner_id = %record.partner_id,
                state = %saga.state(),
                "recovered in-flight saga"
            );
            self.cache(saga);
        }
        Ok(count)
    }

    /// Spawn one consumer task per subscribed topic.
    ///
    /// Each loop blocks on the bus for at most one lease, then re-checks the
    /// shutdown signal, so stopping the coordinator drains at lease
    /// boundaries.
    pub async fn spawn_consumers(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, SubscribeError> {
        let mut handles = Vec::new();
        for (topic, subscription) in topics::coordinator_subscriptions() {
            let mut sub = self.bus.subscribe(topic, subscription).await?;
            let coordinator = Arc::clone(self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                info!(topic, subscription, "consumer loop started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match sub.recv_timeout(coordinator.lease).await {
                        Ok(Some(delivery)) => coordinator.handle_delivery(delivery).await,
                        Ok(None) => {} // lease lapsed, loop to observe shutdown
                        Err(_) => break,
                    }
                }
                info!(topic, "consumer loop stopped");
            }));
        }
        Ok(handles)
    }

    /// Handle one delivery end to end, settling it (ack/nack) on every path.
    pub async fn handle_delivery(&self, delivery: Delivery) {
        let topic = delivery.topic().to_string();

        let event = match SagaEvent::decode(&topic, delivery.payload()) {
            Ok(event) => event,
            Err(CodecError::UnknownTopic(topic)) => {
                warn!(topic, "no event kind for topic, dropping");
                delivery.ack();
                return;
            }
            Err(err) => {
                error!(topic, error = %err, "malformed payload, rejecting");
                delivery.nack();
                return;
            }
        };

        let partner_id = match event.kind {
            // Command payloads are form blobs without an id; assign a
            // temporary scope and wait for `PartnerCreated` to bring the
            // real one.
            EventKind::CreatePartnerCommand => normalize::temp_partner_id(),
            _ => match event.partner_id.as_deref() {
                Some(raw) => normalize::normalize_partner_id(raw),
                None => {
                    error!(topic, event = %event.kind, "correlation key absent, rejecting");
                    delivery.nack();
                    return;
                }
            },
        };

        match self.process(event.kind, &partner_id, &event.payload).await {
            Ok(()) => delivery.ack(),
            Err(err) => {
                error!(
                    partner_id = %partner_id,
                    event = %event.kind,
                    error = %err,
                    "handler failed, message will be redelivered"
                );
                delivery.nack();
            }
        }
    }

    /// Append + process one event for a partner, serialized per key.
    pub async fn process(
        &self,
        kind: EventKind,
        partner_id: &str,
        payload: &JsonValue,
    ) -> Result<(), HandleError> {
        let _guard = self.stripes.lock(partner_id).await;

        let saga_id = SagaId::for_partner(partner_id);
        let entry = self
            .store
            .append(NewLogEntry::new(saga_id, partner_id, kind, payload.clone()))
            .await?;
        self.store
            .mark(entry.entry_id, EntryStatus::Processing, None)
            .await?;

        match self.apply_event(partner_id, kind, payload).await {
            Ok(note) => {
                self.store
                    .mark(entry.entry_id, EntryStatus::Processed, note)
                    .await?;
                Ok(())
            }
            Err(err) => {
                if let Err(mark_err) = self
                    .store
                    .mark(entry.entry_id, EntryStatus::Error, Some(err.to_string()))
                    .await
                {
                    error!(error = %mark_err, "failed to mark entry as error");
                }
                Err(err)
            }
        }
    }

    /// Re-drive a previously logged entry (background reprocessor path).
    pub async fn reprocess_entry(&self, entry: &SagaLogEntry) -> Result<(), HandleError> {
        let _guard = self.stripes.lock(&entry.partner_id).await;

        self.store
            .mark(entry.entry_id, EntryStatus::Processing, None)
            .await?;

        match self
            .apply_event(&entry.partner_id, entry.event_type, &entry.payload)
            .await
        {
            Ok(note) => {
                self.store
                    .mark(entry.entry_id, EntryStatus::Processed, note)
                    .await?;
                Ok(())
            }
            Err(err) => {
                if let Err(mark_err) = self
                    .store
                    .mark(entry.entry_id, EntryStatus::Error, Some(err.to_string()))
                    .await
                {
                    error!(error = %mark_err, "failed to mark entry as error");
                }
                Err(err)
            }
        }
    }

    /// Current state of the saga for a partner, if one is materialized.
    pub fn saga_state(&self, partner_id: &str) -> Option<SagaState> {
        self.sagas
            .lock()
            .expect("saga map lock poisoned")
            .get(partner_id)
            .map(Saga::state)
    }

    /// Apply one event to the partner's saga. Caller holds the stripe guard.
    ///
    /// Returns an optional warning note recorded on the log entry.
    async fn apply_event(
        &self,
        partner_id: &str,
        kind: EventKind,
        payload: &JsonValue,
    ) -> Result<Option<String>, HandleError> {
        if kind == EventKind::CreatePartnerCommand {
            info!(partner_id, "onboarding command observed, awaiting partner creation");
            return Ok(None);
        }

        let mut saga = match self.load_saga(partner_id).await? {
            Some(saga) => saga,
            // The saga is born on its first PartnerCreated.
            None if kind == EventKind::PartnerCreated => {
                Saga::start(SagaId::for_partner(partner_id), partner_id, Utc::now())
            }
            None => {
                warn!(partner_id, event = %kind, "event for unknown saga, recording only");
                return Ok(Some(format!("no saga for partner; {kind} recorded only")));
            }
        };

        let note = match saga.observe(kind, payload, Utc::now()) {
            Observation::Applied { previous, next, effects } => {
                info!(
                    partner_id,
                    event = %kind,
                    from = %previous,
                    to = %next,
                    "saga advanced"
                );
                for effect in effects {
                    match effect {
                        SideEffect::RequestRevision => {
                            self.escalate_rejection(&mut saga, payload).await?;
                        }
                    }
                }
                None
            }
            Observation::Duplicate => Some("duplicate event suppressed".to_string()),
            Observation::LogOnly => None,
            Observation::IgnoredTerminal { state } => {
                Some(format!("saga already terminal in state {state}"))
            }
            Observation::IgnoredIllegal { state, kind } => {
                Some(format!("no transition from {state} on {kind}"))
            }
        };

        self.persist(&saga).await?;
        Ok(note)
    }

    /// Escalate a rejection: publish the revision request, audit it, and
    /// self-apply it so the saga lands in `PendingRevision`.
    async fn escalate_rejection(
        &self,
        saga: &mut Saga,
        payload: &JsonValue,
    ) -> Result<(), HandleError> {
        let mut rejected: ContractRejected = serde_json::from_value(payload.clone())
            .map_err(|e| HandleError::Malformed(format!("rejection payload: {e}")))?;
        if rejected.failed_rule.is_empty() {
            rejected.failed_rule = RuleId::classify(&rejected.cause).name().to_string();
        }

        let revision = ContractRevisionRequested::from_rejected(&rejected, Utc::now());
        let bytes = codec::encode(&revision).map_err(|e| HandleError::Malformed(e.to_string()))?;
        self.publish_with_retry(topics::CONTRACT_REVISION, bytes).await?;
        info!(
            partner_id = %revision.partner_id,
            contract_id = %revision.contract_id,
            failed_rule = %revision.failed_rule,
            "revision requested for rejected contract"
        );

        // Audit the self-emitted event and advance the saga with it.
        let revision_payload = serde_json::to_value(&revision)
            .map_err(|e| HandleError::Malformed(e.to_string()))?;
        let entry = self
            .store
            .append(NewLogEntry::new(
                saga.saga_id(),
                saga.partner_id(),
                EventKind::ContractRevisionRequested,
                revision_payload.clone(),
            ))
            .await?;
        self.store
            .mark(entry.entry_id, EntryStatus::Processing, None)
            .await?;
        saga.observe(EventKind::ContractRevisionRequested, &revision_payload, Utc::now());
        self.store
            .mark(entry.entry_id, EntryStatus::Processed, None)
            .await?;

        Ok(())
    }

    async fn publish_with_retry(&self, topic: &str, bytes: Vec<u8>) -> Result<(), PublishError> {
        let mut last = None;
        for attempt in 1..=PUBLISH_RETRIES {
            match self.bus.publish(topic, bytes.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(topic, attempt, error = %err, "publish failed");
                    last = Some(err);
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
            }
        }
        Err(last.expect("at least one publish attempt"))
    }

    /// Fetch the live saga for a partner: the map first, then a store-backed
    /// replay (lazy rehydration after restart).
    async fn load_saga(&self, partner_id: &str) -> Result<Option<Saga>, SagaLogError> {
        {
            let sagas = self.sagas.lock().expect("saga map lock poisoned");
            if let Some(saga) = sagas.get(partner_id) {
                return Ok(Some(saga.clone()));
            }
        }

        let Some(record) = self.store.find_saga_by_partner(partner_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.replay_from_store(&record).await?))
    }

    async fn replay_from_store(&self, record: &SagaRecord) -> Result<Saga, SagaLogError> {
        let entries = self.store.find_by_saga(record.saga_id, HISTORY_LIMIT).await?;
        let history = entries
            .into_iter()
            .filter(|e| e.status == EntryStatus::Processed)
            .map(|e| (e.event_type, e.payload, e.received_at));
        Ok(Saga::replay(record.saga_id, record.partner_id.clone(), history))
    }

    async fn persist(&self, saga: &Saga) -> Result<(), SagaLogError> {
        self.store
            .save_saga(&SagaRecord {
                saga_id: saga.saga_id(),
                partner_id: saga.partner_id().to_string(),
                state: saga.state(),
                created_at: saga.created_at(),
                updated_at: saga.updated_at(),
            })
            .await?;
        self.cache(saga.clone());
        Ok(())
    }

    fn cache(&self, saga: Saga) {
        self.sagas
            .lock()
            .expect("saga map lock poisoned")
            .insert(saga.partner_id().to_string(), saga);
    }
}
