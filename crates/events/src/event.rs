//! The closed event model.
//!
//! Every message the saga observes or emits is one of a fixed set of kinds.
//! Handlers dispatch on the tag, never on runtime payload shapes, which keeps
//! the state machine a total function over `(state, kind)`.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use partnerflow_core::DomainError;

use crate::codec;
use crate::topics;

/// Tag identifying one kind of saga event.
///
/// The symbolic names (see [`EventKind::name`]) are what the saga log stores
/// in its `event_type` column; they are stable identifiers and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CreatePartnerCommand,
    PartnerCreated,
    PartnerCreationFailed,
    ContractCreated,
    ContractCreationFailed,
    ContractApproved,
    ContractRejected,
    ContractRevisionRequested,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::CreatePartnerCommand,
        EventKind::PartnerCreated,
        EventKind::PartnerCreationFailed,
        EventKind::ContractCreated,
        EventKind::ContractCreationFailed,
        EventKind::ContractApproved,
        EventKind::ContractRejected,
        EventKind::ContractRevisionRequested,
    ];

    /// Stable symbolic name, `{aggregate}.{action}`.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::CreatePartnerCommand => "partner.create_command",
            EventKind::PartnerCreated => "partner.created",
            EventKind::PartnerCreationFailed => "partner.creation_failed",
            EventKind::ContractCreated => "contract.created",
            EventKind::ContractCreationFailed => "contract.creation_failed",
            EventKind::ContractApproved => "contract.approved",
            EventKind::ContractRejected => "contract.rejected",
            EventKind::ContractRevisionRequested => "contract.revision_requested",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown event type: {s}")))
    }
}

/// A single decoded event as the coordinator sees it.
///
/// One record for all kinds; the payload keeps whatever the producer sent so
/// the audit log stays faithful even for messages we only partially understand.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaEvent {
    pub kind: EventKind,
    /// Correlation key, when the payload carries one. `CreatePartnerCommand`
    /// payloads are arbitrary form blobs and usually do not.
    pub partner_id: Option<String>,
    pub payload: JsonValue,
}

impl SagaEvent {
    pub fn new(kind: EventKind, partner_id: Option<String>, payload: JsonValue) -> Self {
        Self {
            kind,
            partner_id,
            payload,
        }
    }

    /// Decode a raw bus payload received on `topic`.
    ///
    /// Applies the codec fallback rules for legacy producers; the event kind
    /// is derived from the topic plus payload discrimination (creation-failure
    /// events share their success topic and are told apart by `error_message`).
    pub fn decode(topic: &str, bytes: &[u8]) -> Result<Self, codec::CodecError> {
        let payload = codec::decode_payload(bytes)?;
        let kind = kind_for_topic(topic, &payload)
            .ok_or_else(|| codec::CodecError::UnknownTopic(topic.to_string()))?;
        let partner_id = partner_id_of(&payload);
        Ok(Self {
            kind,
            partner_id,
            payload,
        })
    }
}

/// Map a topic (plus payload discrimination) to the event kind carried on it.
pub fn kind_for_topic(topic: &str, payload: &JsonValue) -> Option<EventKind> {
    let failed = payload.get("error_message").is_some();
    match topic {
        topics::CREATE_PARTNER_COMMAND => Some(EventKind::CreatePartnerCommand),
        topics::PARTNER_CREATED if failed => Some(EventKind::PartnerCreationFailed),
        topics::PARTNER_CREATED => Some(EventKind::PartnerCreated),
        topics::CONTRACT_CREATED if failed => Some(EventKind::ContractCreationFailed),
        topics::CONTRACT_CREATED => Some(EventKind::ContractCreated),
        topics::CONTRACT_APPROVED => Some(EventKind::ContractApproved),
        topics::CONTRACT_REJECTED => Some(EventKind::ContractRejected),
        topics::CONTRACT_REVISION => Some(EventKind::ContractRevisionRequested),
        _ => None,
    }
}

/// Extract the raw correlation key from a decoded payload.
///
/// Legacy producers sometimes send a bare string; that string *is* the
/// partner id (the fallback decode path produces these).
pub fn partner_id_of(payload: &JsonValue) -> Option<String> {
    match payload {
        JsonValue::Object(map) => map
            .get("partner_id")
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_names_round_trip() {
        for kind in EventKind::ALL {
            let parsed: EventKind = kind.name().parse().unwrap();
            assert_eq!(kind, parsed);
        }
    }

    #[test]
    fn unknown_event_type_name_is_rejected() {
        assert!("contract.deleted".parse::<EventKind>().is_err());
    }

    #[test]
    fn failure_events_share_their_success_topic() {
        let ok = json!({"partner_id": "P0000000001"});
        let failed = json!({"partner_id": "P0000000001", "error_message": "db down"});

        assert_eq!(
            kind_for_topic(topics::PARTNER_CREATED, &ok),
            Some(EventKind::PartnerCreated)
        );
        assert_eq!(
            kind_for_topic(topics::PARTNER_CREATED, &failed),
            Some(EventKind::PartnerCreationFailed)
        );
        assert_eq!(
            kind_for_topic(topics::CONTRACT_CREATED, &failed),
            Some(EventKind::ContractCreationFailed)
        );
    }

    #[test]
    fn partner_id_comes_from_object_or_bare_string() {
        assert_eq!(
            partner_id_of(&json!({"partner_id": "P0000000001"})),
            Some("P0000000001".to_string())
        );
        assert_eq!(
            partner_id_of(&json!("P0000000002")),
            Some("P0000000002".to_string())
        );
        assert_eq!(partner_id_of(&json!({"other": 1})), None);
        assert_eq!(partner_id_of(&json!("")), None);
    }

    #[test]
    fn decode_derives_kind_and_partner_id() {
        let bytes = br#"{"partner_id":"P0000000001"}"#;
        let event = SagaEvent::decode(topics::PARTNER_CREATED, bytes).unwrap();
        assert_eq!(event.kind, EventKind::PartnerCreated);
        assert_eq!(event.partner_id.as_deref(), Some("P0000000001"));
    }

    #[test]
    fn decode_rejects_unknown_topic() {
        let err = SagaEvent::decode("partner-archived", b"{}").unwrap_err();
        assert!(matches!(err, codec::CodecError::UnknownTopic(_)));
    }
}
