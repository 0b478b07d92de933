//! Integrations participant: partner provisioning.
//!
//! Consumes `CreatePartnerCommand`, provisions partner master data through
//! the injected port, and publishes the outcome on `partner-created`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use partnerflow_events::schema::{PartnerCreated, PartnerCreationFailed};
use partnerflow_events::{Delivery, MessageBus, SubscribeError, codec, event, topics};

const SUBSCRIPTION: &str = "integrations-create-partner";

/// Port to the partner master data store (out of scope for the saga core).
#[async_trait]
pub trait PartnerProvisioner: Send + Sync {
    /// Create the partner and return its id.
    async fn provision(&self, request: &JsonValue) -> Result<String, String>;
}

/// Dev provisioner: assigns fresh partner ids unconditionally.
#[derive(Debug, Default)]
pub struct UuidPartnerProvisioner;

#[async_trait]
impl PartnerProvisioner for UuidPartnerProvisioner {
    async fn provision(&self, _request: &JsonValue) -> Result<String, String> {
        Ok(format!("partner-{}", uuid::Uuid::now_v7().simple()))
    }
}

pub struct IntegrationsService<P> {
    bus: Arc<dyn MessageBus>,
    provisioner: P,
    lease: Duration,
}

impl<P> IntegrationsService<P>
where
    P: PartnerProvisioner + 'static,
{
    pub fn new(bus: Arc<dyn MessageBus>, provisioner: P, lease: Duration) -> Self {
        Self {
            bus,
            provisioner,
            lease,
        }
    }

    pub async fn spawn(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, SubscribeError> {
        let mut sub = self
            .bus
            .subscribe(topics::CREATE_PARTNER_COMMAND, SUBSCRIPTION)
            .await?;

        Ok(tokio::spawn(async move {
            info!("integrations consumer started");
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
            info!("integrations consumer stopped");
        }))
    }

    async fn handle(&self, delivery: Delivery) {
        let request = match codec::decode_payload(delivery.payload()) {
            Ok(request) => request,
            Err(err) => {
                error!(error = %err, "undecodable create-partner command");
                delivery.nack();
                return;
            }
        };

        let outcome = match self.provisioner.provision(&request).await {
            Ok(partner_id) => {
                info!(partner_id, "partner provisioned");
                codec::encode(&PartnerCreated { partner_id })
            }
            Err(message) => {
                // Business failure: reported on the same topic, then the
                // command is done.
                let partner_id = event::partner_id_of(&request).unwrap_or_default();
                warn!(partner_id, error = %message, "partner provisioning failed");
                codec::encode(&PartnerCreationFailed {
                    partner_id,
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

        match self.bus.publish(topics::PARTNER_CREATED, bytes).await {
            Ok(()) => delivery.ack(),
            Err(err) => {
                error!(error = %err, "outcome publish failed, command will redeliver");
                delivery.nack();
            }
        }
    }
}
