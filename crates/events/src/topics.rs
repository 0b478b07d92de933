//! Topic and subscription names shared by all participants.

/// External trigger: start onboarding a partner. Arbitrary form payload.
pub const CREATE_PARTNER_COMMAND: &str = "create-partner-command";

/// Integrations outcome: partner master data exists (or failed).
pub const PARTNER_CREATED: &str = "partner-created";

/// Alliances outcome: contract materialized (or creation failed).
pub const CONTRACT_CREATED: &str = "contract-created";

/// Compliance outcome: contract passed validation.
pub const CONTRACT_APPROVED: &str = "contract-approved";

/// Compliance outcome: contract rejected with a structured cause.
pub const CONTRACT_REJECTED: &str = "contract-rejected";

/// Coordinator escalation: rejected contract awaits manual revision.
pub const CONTRACT_REVISION: &str = "contract-revision";

/// Shared subscription names used by the saga coordinator.
///
/// All coordinator replicas bear the same names, so the broker load-balances
/// deliveries across them instead of duplicating work.
pub mod subscriptions {
    pub const CREATE_PARTNER: &str = "saga-choreography-create-partner";
    pub const PARTNER_CREATED: &str = "saga-choreography-partner-created";
    pub const CONTRACT_CREATED: &str = "saga-choreography-contract-created";
    pub const CONTRACT_APPROVED: &str = "saga-choreography-contract-approved";
    pub const CONTRACT_REJECTED: &str = "saga-choreography-contract-rejected";
}

/// The `(topic, subscription)` pairs the coordinator consumes.
pub fn coordinator_subscriptions() -> [(&'static str, &'static str); 5] {
    [
        (CREATE_PARTNER_COMMAND, subscriptions::CREATE_PARTNER),
        (PARTNER_CREATED, subscriptions::PARTNER_CREATED),
        (CONTRACT_CREATED, subscriptions::CONTRACT_CREATED),
        (CONTRACT_APPROVED, subscriptions::CONTRACT_APPROVED),
        (CONTRACT_REJECTED, subscriptions::CONTRACT_REJECTED),
    ]
}
