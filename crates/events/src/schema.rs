//! Wire schemas for the saga event protocol.
//!
//! All messages are JSON UTF-8 and carry `partner_id` (the correlation key)
//! except `CreatePartnerCommand`, whose payload is an arbitrary form blob and
//! is never deserialized into a schema. Timestamps are ISO-8601.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contract state stamped on approval outcomes.
pub const STATE_APPROVED: &str = "APPROVED";

/// Contract state stamped on rejection outcomes.
pub const STATE_REJECTED: &str = "REJECTED";

/// Contract state stamped on revision escalations.
pub const STATE_REVISION_PENDING: &str = "REVISION_PENDING";

/// Contract type applied when a producer omitted one.
pub const DEFAULT_CONTRACT_TYPE: &str = "STANDARD";

/// Published by integrations once partner master data exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerCreated {
    pub partner_id: String,
}

/// Published by integrations when provisioning fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerCreationFailed {
    pub partner_id: String,
    pub error_message: String,
}

/// Published by alliances when a contract is materialized.
///
/// Legacy producers name the contract key `id`; both spellings decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCreated {
    pub partner_id: String,
    #[serde(alias = "id")]
    pub contract_id: String,
    pub amount: f64,
    pub currency: String,
    pub state: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub contract_type: Option<String>,
}

/// Published by alliances when contract creation fails; shares the
/// `contract-created` topic and is discriminated by `error_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCreationFailed {
    pub partner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,
    pub error_message: String,
}

/// Published by compliance when every rule passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractApproved {
    pub partner_id: String,
    pub contract_id: String,
    pub amount: f64,
    pub currency: String,
    pub state: String,
    #[serde(rename = "type")]
    pub contract_type: String,
    pub approved_at: DateTime<Utc>,
    pub validated_rules: Vec<String>,
}

/// Published by compliance when a rule rejected the contract.
///
/// Deserialization is lenient: legacy producers omit the outcome metadata,
/// and a rejection must still be escalatable when fields are missing. A
/// `failed_rule` left empty is classified from the cause downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRejected {
    pub partner_id: String,
    #[serde(alias = "id", default)]
    pub contract_id: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(default = "default_rejected_state")]
    pub state: String,
    #[serde(rename = "type", default = "default_contract_type")]
    pub contract_type: String,
    #[serde(default = "Utc::now")]
    pub rejected_at: DateTime<Utc>,
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub failed_rule: String,
}

fn default_rejected_state() -> String {
    STATE_REJECTED.to_string()
}

fn default_contract_type() -> String {
    DEFAULT_CONTRACT_TYPE.to_string()
}

/// Published by the coordinator to escalate a rejection to manual revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRevisionRequested {
    pub partner_id: String,
    pub contract_id: String,
    pub amount: f64,
    pub currency: String,
    pub state: String,
    #[serde(rename = "type")]
    pub contract_type: String,
    pub requested_at: DateTime<Utc>,
    pub original_cause: String,
    pub failed_rule: String,
    pub requires_manual_intervention: bool,
}

impl ContractRevisionRequested {
    /// Build the escalation that follows a rejection, echoing the contract
    /// facts and carrying the original cause forward.
    pub fn from_rejected(rejected: &ContractRejected, requested_at: DateTime<Utc>) -> Self {
        Self {
            partner_id: rejected.partner_id.clone(),
            contract_id: rejected.contract_id.clone(),
            amount: rejected.amount,
            currency: rejected.currency.clone(),
            state: STATE_REVISION_PENDING.to_string(),
            contract_type: rejected.contract_type.clone(),
            requested_at,
            original_cause: rejected.cause.clone(),
            failed_rule: rejected.failed_rule.clone(),
            requires_manual_intervention: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn sample_rejected() -> ContractRejected {
        ContractRejected {
            partner_id: "P0000000002".to_string(),
            contract_id: "C2".to_string(),
            amount: 75_000.0,
            currency: "USD".to_string(),
            state: STATE_REJECTED.to_string(),
            contract_type: DEFAULT_CONTRACT_TYPE.to_string(),
            rejected_at: Utc::now(),
            cause: "amount 75000 exceeds maximum of 50000".to_string(),
            failed_rule: "AmountLimits".to_string(),
        }
    }

    #[test]
    fn contract_created_accepts_id_alias() {
        let bytes = br#"{"partner_id":"P0000000001","id":"C1","amount":2500,"currency":"USD","state":"ACTIVO","type":"BASICO"}"#;
        let msg: ContractCreated = serde_json::from_slice(bytes).unwrap();
        assert_eq!(msg.contract_id, "C1");
        assert_eq!(msg.contract_type.as_deref(), Some("BASICO"));
    }

    #[test]
    fn contract_created_type_is_optional() {
        let bytes =
            br#"{"partner_id":"P0000000002","contract_id":"C2","amount":75000,"currency":"USD","state":"ACTIVO"}"#;
        let msg: ContractCreated = serde_json::from_slice(bytes).unwrap();
        assert_eq!(msg.contract_type, None);
    }

    #[test]
    fn revision_request_echoes_the_rejection() {
        let rejected = sample_rejected();
        let now = Utc::now();
        let revision = ContractRevisionRequested::from_rejected(&rejected, now);

        assert_eq!(revision.partner_id, rejected.partner_id);
        assert_eq!(revision.contract_id, rejected.contract_id);
        assert_eq!(revision.amount, rejected.amount);
        assert_eq!(revision.currency, rejected.currency);
        assert_eq!(revision.state, STATE_REVISION_PENDING);
        assert_eq!(revision.original_cause, rejected.cause);
        assert_eq!(revision.failed_rule, rejected.failed_rule);
        assert!(revision.requires_manual_intervention);
        assert_eq!(revision.requested_at, now);
    }

    #[test]
    fn sparse_legacy_rejection_still_decodes() {
        let bytes = br#"{"partner_id":"P0000000002","contract_id":"C2","amount":75000,"currency":"USD","cause":"amount 75000 exceeds maximum of 50000","failed_rule":"AmountLimits"}"#;
        let msg: ContractRejected = serde_json::from_slice(bytes).unwrap();
        assert_eq!(msg.state, STATE_REJECTED);
        assert_eq!(msg.contract_type, DEFAULT_CONTRACT_TYPE);
        assert_eq!(msg.failed_rule, "AmountLimits");
    }

    #[test]
    fn partner_created_round_trips() {
        let msg = PartnerCreated {
            partner_id: "P0000000001".to_string(),
        };
        let bytes = codec::encode(&msg).unwrap();
        let back: PartnerCreated = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn contract_approved_round_trips() {
        let msg = ContractApproved {
            partner_id: "P0000000001".to_string(),
            contract_id: "C1".to_string(),
            amount: 2_500.0,
            currency: "USD".to_string(),
            state: STATE_APPROVED.to_string(),
            contract_type: "BASICO".to_string(),
            approved_at: Utc::now(),
            validated_rules: vec!["AmountLimits".to_string(), "StateValidity".to_string()],
        };
        let bytes = codec::encode(&msg).unwrap();
        let back: ContractApproved = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn rejection_and_revision_round_trip() {
        let rejected = sample_rejected();
        let bytes = codec::encode(&rejected).unwrap();
        let back: ContractRejected = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, rejected);

        let revision = ContractRevisionRequested::from_rejected(&rejected, Utc::now());
        let bytes = codec::encode(&revision).unwrap();
        let back: ContractRevisionRequested = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, revision);
    }

    #[test]
    fn creation_failures_round_trip_with_optional_contract_id() {
        let msg = ContractCreationFailed {
            partner_id: "P0000000003".to_string(),
            contract_id: None,
            error_message: "db down".to_string(),
        };
        let bytes = codec::encode(&msg).unwrap();
        // The optional key is omitted entirely, not serialized as null.
        assert!(!String::from_utf8(bytes.clone()).unwrap().contains("contract_id"));
        let back: ContractCreationFailed = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
    }
}
