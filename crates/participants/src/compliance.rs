//! Compliance participant: runs the rule set over created contracts.
//!
//! Consumes `ContractCreated`, applies the validator, and publishes
//! `ContractApproved` or `ContractRejected`. The validator is pure; this
//! service only adds the bus plumbing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use partnerflow_compliance::{ComplianceOutcome, ContractFact, validate};
use partnerflow_events::schema::{
    ContractApproved, ContractCreated, ContractRejected, DEFAULT_CONTRACT_TYPE, STATE_APPROVED,
    STATE_REJECTED,
};
use partnerflow_events::{Delivery, MessageBus, SubscribeError, codec, topics};

const SUBSCRIPTION: &str = "compliance-contract-created";

pub struct ComplianceService {
    bus: Arc<dyn MessageBus>,
    lease: Duration,
}

impl ComplianceService {
    pub fn new(bus: Arc<dyn MessageBus>, lease: Duration) -> Self {
        Self { bus, lease }
    }

    pub async fn spawn(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, SubscribeError> {
        let mut sub = self
            .bus
            .subscribe(topics::CONTRACT_CREATED, SUBSCRIPTION)
            .await?;

        Ok(tokio::spawn(async move {
            info!("compliance consumer started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match sub.recv_timeout(self.lease).await {
                    Ok(Some(delivery)) => self.handle(delivery).await,
                    Ok(None) => {}
                    Err(_) => break,
                }
            }
            info!("compliance consumer stopped");
        }))
    }

    async fn handle(&self, delivery: Delivery) {
        let payload = match codec::decode_payload(delivery.payload()) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "undecodable contract-created payload");
                delivery.nack();
                return;
            }
        };

        // Creation failures share this topic; compliance has nothing to
        // validate for them.
        if payload.get("error_message").is_some() {
            delivery.ack();
            return;
        }

        let created: ContractCreated = match serde_json::from_value(payload) {
            Ok(created) => created,
            Err(err) => {
                error!(error = %err, "malformed contract-created payload");
                delivery.nack();
                return;
            }
        };

        let fact = ContractFact {
            partner_id: created.partner_id.clone(),
            contract_id: created.contract_id.clone(),
            amount: created.amount,
            currency: created.currency.clone(),
            state: created.state.clone(),
            contract_type: created.contract_type.clone(),
        };

        let contract_type = created
            .contract_type
            .unwrap_or_else(|| DEFAULT_CONTRACT_TYPE.to_string());

        let (topic, bytes) = match validate(&fact) {
            ComplianceOutcome::Approved {
                validated_rules,
                warnings,
            } => {
                info!(
                    partner_id = %created.partner_id,
                    contract_id = %created.contract_id,
                    warnings = warnings.len(),
                    "contract approved"
                );
                let approved = ContractApproved {
                    partner_id: created.partner_id,
                    contract_id: created.contract_id,
                    amount: created.amount,
                    currency: created.currency,
                    state: STATE_APPROVED.to_string(),
                    contract_type,
                    approved_at: Utc::now(),
                    validated_rules: validated_rules
                        .iter()
                        .map(|rule| rule.name().to_string())
                        .collect(),
                };
                (topics::CONTRACT_APPROVED, codec::encode(&approved))
            }
            ComplianceOutcome::Rejected { failed_rule, cause } => {
                warn!(
                    partner_id = %created.partner_id,
                    contract_id = %created.contract_id,
                    failed_rule = %failed_rule,
                    cause = %cause,
                    "contract rejected"
                );
                let rejected = ContractRejected {
                    partner_id: created.partner_id,
                    contract_id: created.contract_id,
                    amount: created.amount,
                    currency: created.currency,
                    state: STATE_REJECTED.to_string(),
                    contract_type,
                    rejected_at: Utc::now(),
                    cause,
                    failed_rule: failed_rule.name().to_string(),
                };
                (topics::CONTRACT_REJECTED, codec::encode(&rejected))
            }
        };

        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "outcome encoding failed");
                delivery.nack();
                return;
            }
        };

        match self.bus.publish(topic, bytes).await {
            Ok(()) => delivery.ack(),
            Err(err) => {
                error!(error = %err, "outcome publish failed, will redeliver");
                delivery.nack();
            }
        }
    }
}
