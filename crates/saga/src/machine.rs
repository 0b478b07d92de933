//! The saga aggregate: per-partner state plus duplicate suppression.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::warn;

use partnerflow_core::SagaId;
use partnerflow_events::EventKind;

use crate::state::{SagaState, SideEffect, TransitionOutcome, step};

/// Idempotency key for one observed event: the tag plus a digest of the
/// payload. Redelivered messages hash identically; distinct events of the
/// same kind do not.
pub type Fingerprint = (EventKind, [u8; 32]);

/// Compute the idempotency fingerprint of an event.
///
/// `serde_json::Value` keeps object keys sorted, so serializing it again is a
/// canonical form regardless of the producer's key order.
pub fn fingerprint(kind: EventKind, payload: &JsonValue) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    (kind, hasher.finalize().into())
}

/// What observing one event did to the saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// The saga advanced; the coordinator must run the listed effects.
    Applied {
        previous: SagaState,
        next: SagaState,
        effects: Vec<SideEffect>,
    },
    /// Same event (kind + payload) was already applied; recorded for audit,
    /// no transition, no effects.
    Duplicate,
    /// Recorded for audit only (commands never drive the machine).
    LogOnly,
    /// The saga is terminal; recorded and ignored.
    IgnoredTerminal { state: SagaState },
    /// No legal transition; recorded and ignored.
    IgnoredIllegal { state: SagaState, kind: EventKind },
}

/// Aggregate root: one onboarding attempt for one partner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Saga {
    saga_id: SagaId,
    partner_id: String,
    state: SagaState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    seen: HashSet<Fingerprint>,
}

impl Saga {
    /// Create a saga in `Started`. A saga is born when its first
    /// `PartnerCreated` is observed, immediately before that event is applied.
    pub fn start(saga_id: SagaId, partner_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            saga_id,
            partner_id: partner_id.into(),
            state: SagaState::Started,
            created_at: now,
            updated_at: now,
            seen: HashSet::new(),
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    /// Correlation key. Immutable after first write.
    pub fn partner_id(&self) -> &str {
        &self.partner_id
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Observe one event and advance the machine if the transition is legal.
    ///
    /// Duplicates (same kind + payload digest) are suppressed before the
    /// transition table is consulted, so a redelivered event can never
    /// re-trigger side effects.
    pub fn observe(&mut self, kind: EventKind, payload: &JsonValue, now: DateTime<Utc>) -> Observation {
        let print = fingerprint(kind, payload);
        if self.seen.contains(&print) {
            warn!(
                saga_id = %self.saga_id,
                partner_id = %self.partner_id,
                event = %kind,
                "duplicate event observed, suppressing"
            );
            return Observation::Duplicate;
        }

        match step(self.state, kind) {
            TransitionOutcome::Advanced { next, effects } => {
                let previous = self.state;
                self.state = next;
                self.updated_at = now;
                self.seen.insert(print);
                Observation::Applied {
                    previous,
                    next,
                    effects,
                }
            }
            TransitionOutcome::LogOnly => Observation::LogOnly,
            TransitionOutcome::IgnoredTerminal => {
                warn!(
                    saga_id = %self.saga_id,
                    partner_id = %self.partner_id,
                    state = %self.state,
                    event = %kind,
                    "event observed after terminal state, ignoring"
                );
                Observation::IgnoredTerminal { state: self.state }
            }
            TransitionOutcome::IgnoredIllegal => {
                warn!(
                    saga_id = %self.saga_id,
                    partner_id = %self.partner_id,
                    state = %self.state,
                    event = %kind,
                    "no legal transition for event, ignoring"
                );
                Observation::IgnoredIllegal {
                    state: self.state,
                    kind,
                }
            }
        }
    }

    /// Rebuild a saga by replaying its recorded event history in order.
    ///
    /// Replay is deterministic: observing the same history from `Started`
    /// always lands in the same state, which is how in-flight sagas are
    /// recovered after a restart.
    pub fn replay<I>(saga_id: SagaId, partner_id: impl Into<String>, history: I) -> Self
    where
        I: IntoIterator<Item = (EventKind, JsonValue, DateTime<Utc>)>,
    {
        let partner_id = partner_id.into();
        let mut history = history.into_iter();

        let (first_kind, first_payload, first_at) = match history.next() {
            Some(first) => first,
            None => return Self::start(saga_id, partner_id, Utc::now()),
        };

        let mut saga = Self::start(saga_id, partner_id, first_at);
        saga.observe(first_kind, &first_payload, first_at);
        for (kind, payload, at) in history {
            saga.observe(kind, &payload, at);
        }
        saga
    }
}
