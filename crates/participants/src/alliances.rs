//! Alliances participant: contract materialization and revision intake.
//!
//! Consumes `PartnerCreated` and publishes the contract outcome; separately
//! consumes `ContractRevisionRequested` and annotates the affected contract
//! in its own store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use partnerflow_events::schema::{
    ContractCreated, ContractCreationFailed, ContractRevisionRequested, PartnerCreated,
};
use partnerflow_events::{Delivery, MessageBus, SubscribeError, codec, topics};

const PARTNER_CREATED_SUBSCRIPTION: &str = "alianzas-partner-created";
const REVISION_SUBSCRIPTION: &str = "alianzas-contract-revision";

/// A contract as the factory materializes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractDraft {
    pub contract_id: String,
    pub amount: f64,
    pub currency: String,
    pub state: String,
    pub contract_type: Option<String>,
}

/// Port to the contract store's creation path (out of scope for the core).
#[async_trait]
pub trait ContractFactory: Send + Sync {
    async fn create(&self, partner_id: &str) -> Result<ContractDraft, String>;
}

/// Port to the contract store's revision path: mark the contract rejected
/// and attach the escalation metadata.
#[async_trait]
pub trait ContractAnnotator: Send + Sync {
    async fn mark_rejected(&self, revision: &ContractRevisionRequested) -> Result<(), String>;
}

/// Dev factory: every partner gets the same modest contract.
#[derive(Debug, Clone)]
pub struct FixedContractFactory {
    pub amount: f64,
    pub currency: String,
    pub state: String,
    pub contract_type: Option<String>,
}

impl Default for FixedContractFactory {
    fn default() -> Self {
        Self {
            amount: 2_500.0,
            currency: "USD".to_string(),
            state: "ACTIVO".to_string(),
            contract_type: Some("BASICO".to_string()),
        }
    }
}

#[async_trait]
impl ContractFactory for FixedContractFactory {
    async fn create(&self, _partner_id: &str) -> Result<ContractDraft, String> {
        Ok(ContractDraft {
            contract_id: format!("contract-{}", uuid::Uuid::now_v7().simple()),
            amount: self.amount,
            currency: self.currency.clone(),
            state: self.state.clone(),
            contract_type: self.contract_type.clone(),
        })
    }
}

/// Dev annotator: records the escalation in the log only.
#[derive(Debug, Default)]
pub struct LoggingContractAnnotator;

#[async_trait]
impl ContractAnnotator for LoggingContractAnnotator {
    async fn mark_rejected(&self, revision: &ContractRevisionRequested) -> Result<(), String> {
        info!(
            contract_id = %revision.contract_id,
            failed_rule = %revision.failed_rule,
            original_cause = %revision.original_cause,
            "contract flagged for manual revision"
        );
        Ok(())
    }
}

pub struct AlliancesService<F, A> {
    bus: Arc<dyn MessageBus>,
    factory: F,
    annotator: A,
    lease: Duration,
}

impl<F, A> AlliancesService<F, A>
where
    F: ContractFactory + 'static,
    A: ContractAnnotator + 'static,
{
    pub fn new(bus: Arc<dyn MessageBus>, factory: F, annotator: A, lease: Duration) -> Self {
        Self {
            bus,
            factory,
            annotator,
            lease,
        }
    }

    pub async fn spawn(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, SubscribeError> {
        let mut created_sub = self
            .bus
            .subscribe(topics::PARTNER_CREATED, PARTNER_CREATED_SUBSCRIPTION)
            .await?;
        let mut revision_sub = self
            .bus
            .subscribe(topics::CONTRACT_REVISION, REVISION_SUBSCRIPTION)
            .await?;

        let mut handles = Vec::new();

        let service = Arc::clone(&self);
        let stop = shutdown.clone();
        handles.push(tokio::spawn(async move {
            info!("alliances partner-created consumer started");
            loop {
                if *stop.borrow() {
                    break;
                }
                match created_sub.recv_timeout(service.lease).await {
                    Ok(Some(delivery)) => service.handle_partner_created(delivery).await,
                    Ok(None) => {}
                    Err(_) => break,
                }
            }
        }));

        let service = self;
        let stop = shutdown;
        handles.push(tokio::spawn(async move {
            info!("alliances revision consumer started");
            loop {
                if *stop.borrow() {
                    break;
                }
                match revision_sub.recv_timeout(service.lease).await {
                    Ok(Some(delivery)) => service.handle_revision(delivery).await,
                    Ok(None) => {}
                    Err(_) => break,
                }
            }
        }));

        Ok(handles)
    }

    async fn handle_partner_created(&self, delivery: Delivery) {
        let payload = match codec::decode_payload(delivery.payload()) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "undecodable partner-created payload");
                delivery.nack();
                return;
            }
        };

        // Creation failures share this topic; they are not ours to handle.
        if payload.get("error_message").is_some() {
            delivery.ack();
            return;
        }

        let created: PartnerCreated = match serde_json::from_value(payload) {
            Ok(created) => created,
            Err(err) => {
                error!(error = %err, "malformed partner-created payload");
                delivery.nack();
                return;
            }
        };

        let outcome = match self.factory.create(&created.partner_id).await {
            Ok(draft) => {
                info!(
                    partner_id = %created.partner_id,
                    contract_id = %draft.contract_id,
                    "contract materialized"
                );
                codec::encode(&ContractCreated {
                    partner_id: created.partner_id,
                    contract_id: draft.contract_id,
                    amount: draft.amount,
                    currency: draft.currency,
                    state: draft.state,
                    contract_type: draft.contract_type,
                })
            }
            Err(message) => {
                warn!(partner_id = %created.partner_id, error = %message, "contract creation failed");
                codec::encode(&ContractCreationFailed {
                    partner_id: created.partner_id,
                    contract_id: None,
                    error_message: message,
                })
            }
        };

        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "outcome encoding failed");
                delivery.nack();
                return;
            }
        };

        match self.bus.publish(topics::CONTRACT_CREATED, bytes).await {
            Ok(()) => delivery.ack(),
            Err(err) => {
                error!(error = %err, "contract outcome publish failed, will redeliver");
                delivery.nack();
            }
        }
    }

    async fn handle_revision(&self, delivery: Delivery) {
        let revision: ContractRevisionRequested =
            match serde_json::from_slice(delivery.payload()) {
                Ok(revision) => revision,
                Err(err) => {
                    error!(error = %err, "malformed revision request");
                    delivery.nack();
                    return;
                }
            };

        match self.annotator.mark_rejected(&revision).await {
            Ok(()) => delivery.ack(),
            Err(err) => {
                error!(
                    contract_id = %revision.contract_id,
                    error = %err,
                    "revision annotation failed, will redeliver"
                );
                delivery.nack();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use partnerflow_events::InMemoryBus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAnnotator {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContractAnnotator for RecordingAnnotator {
        async fn mark_rejected(&self, revision: &ContractRevisionRequested) -> Result<(), String> {
            self.seen.lock().unwrap().push(revision.contract_id.clone());
            Ok(())
        }
    }

    fn revision_for(contract_id: &str) -> ContractRevisionRequested {
        ContractRevisionRequested {
            partner_id: "P0000000002".to_string(),
            contract_id: contract_id.to_string(),
            amount: 75_000.0,
            currency: "USD".to_string(),
            state: "REVISION_PENDING".to_string(),
            contract_type: "STANDARD".to_string(),
            requested_at: Utc::now(),
            original_cause: "amount 75000 exceeds maximum of 50000".to_string(),
            failed_rule: "AmountLimits".to_string(),
            requires_manual_intervention: true,
        }
    }

    #[tokio::test]
    async fn partner_created_yields_a_contract() {
        let bus = Arc::new(InMemoryBus::new());
        let mut contracts = bus
            .subscribe(topics::CONTRACT_CREATED, "test-observer")
            .await
            .unwrap();

        let service = Arc::new(AlliancesService::new(
            bus.clone() as Arc<dyn MessageBus>,
            FixedContractFactory::default(),
            LoggingContractAnnotator,
            Duration::from_millis(50),
        ));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handles = service.spawn(stop_rx).await.unwrap();

        bus.publish(
            topics::PARTNER_CREATED,
            codec::encode(&PartnerCreated {
                partner_id: "P0000000001".to_string(),
            })
            .unwrap(),
        )
        .await
        .unwrap();

        let delivery = contracts
            .recv_timeout(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("expected a contract-created event");
        let created: ContractCreated = serde_json::from_slice(delivery.payload()).unwrap();
        assert_eq!(created.partner_id, "P0000000001");
        assert_eq!(created.currency, "USD");
        delivery.ack();

        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn revision_requests_reach_the_annotator() {
        let bus = Arc::new(InMemoryBus::new());
        let annotator = Arc::new(RecordingAnnotator::default());

        struct SharedAnnotator(Arc<RecordingAnnotator>);

        #[async_trait]
        impl ContractAnnotator for SharedAnnotator {
            async fn mark_rejected(
                &self,
                revision: &ContractRevisionRequested,
            ) -> Result<(), String> {
                self.0.mark_rejected(revision).await
            }
        }

        let service = Arc::new(AlliancesService::new(
            bus.clone() as Arc<dyn MessageBus>,
            FixedContractFactory::default(),
            SharedAnnotator(annotator.clone()),
            Duration::from_millis(50),
        ));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handles = service.spawn(stop_rx).await.unwrap();

        bus.publish(
            topics::CONTRACT_REVISION,
            codec::encode(&revision_for("C2")).unwrap(),
        )
        .await
        .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            if annotator.seen.lock().unwrap().as_slice() == ["C2"] {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "annotation never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn partner_creation_failures_are_skipped() {
        let bus = Arc::new(InMemoryBus::new());
        let mut contracts = bus
            .subscribe(topics::CONTRACT_CREATED, "test-observer")
            .await
            .unwrap();

        let service = Arc::new(AlliancesService::new(
            bus.clone() as Arc<dyn MessageBus>,
            FixedContractFactory::default(),
            LoggingContractAnnotator,
            Duration::from_millis(50),
        ));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handles = service.spawn(stop_rx).await.unwrap();

        bus.publish(
            topics::PARTNER_CREATED,
            codec::encode(&serde_json::json!({
                "partner_id": "P0000000001",
                "error_message": "directory down"
            }))
            .unwrap(),
        )
        .await
        .unwrap();

        let none = contracts
            .recv_timeout(Duration::from_millis(200))
            .await
            .unwrap();
        assert!(none.is_none(), "failure events must not produce contracts");

        for handle in handles {
            handle.abort();
        }
    }
}
