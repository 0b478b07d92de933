//! Explicit saga state machine.
//!
//! Transitions are declared as one total match over `(state, event tag)`.
//! Everything not declared legal is ignored without changing state; the
//! state machine is the ordering authority for events arriving from
//! independent topics.

use serde::{Deserialize, Serialize};

use partnerflow_events::EventKind;

/// Canonical state of one partner onboarding saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    /// Saga exists but no participant outcome has been observed yet.
    Started,
    PartnerCreated,
    ContractCreated,
    /// Pass-through on approval; the graph completes the saga in the same
    /// step, so this is only seen in stored snapshots from older writers.
    ContractApproved,
    /// Holding state between a rejection and its revision escalation.
    ContractRejected,
    /// Terminal: awaiting manual action, resolved out-of-band.
    PendingRevision,
    /// Terminal: onboarding finished successfully.
    CompletedOk,
    /// Terminal: onboarding failed before compliance ran.
    CompletedFailed,
}

impl SagaState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::CompletedOk | SagaState::CompletedFailed | SagaState::PendingRevision
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SagaState::Started => "started",
            SagaState::PartnerCreated => "partner_created",
            SagaState::ContractCreated => "contract_created",
            SagaState::ContractApproved => "contract_approved",
            SagaState::ContractRejected => "contract_rejected",
            SagaState::PendingRevision => "pending_revision",
            SagaState::CompletedOk => "completed_ok",
            SagaState::CompletedFailed => "completed_failed",
        }
    }
}

impl core::fmt::Display for SagaState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl core::str::FromStr for SagaState {
    type Err = partnerflow_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            SagaState::Started,
            SagaState::PartnerCreated,
            SagaState::ContractCreated,
            SagaState::ContractApproved,
            SagaState::ContractRejected,
            SagaState::PendingRevision,
            SagaState::CompletedOk,
            SagaState::CompletedFailed,
        ]
        .into_iter()
        .find(|state| state.name() == s)
        .ok_or_else(|| partnerflow_core::DomainError::validation(format!("unknown saga state: {s}")))
    }
}

/// Side effect a transition requires the coordinator to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Publish a `ContractRevisionRequested` escalation for the rejection
    /// that produced this transition.
    RequestRevision,
}

/// What a single event does to a saga in a given state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The event advances the saga.
    Advanced {
        next: SagaState,
        effects: Vec<SideEffect>,
    },
    /// The event is recorded for audit but never drives the machine
    /// (`CreatePartnerCommand`, and failure reports before a saga exists).
    LogOnly,
    /// The saga is terminal; the event is recorded and ignored.
    IgnoredTerminal,
    /// No legal transition from this state on this event; recorded and
    /// ignored without changing state.
    IgnoredIllegal,
}

/// The transition function. Total: every `(state, kind)` pair has an outcome.
pub fn step(state: SagaState, kind: EventKind) -> TransitionOutcome {
    // Commands are logged, never applied.
    if kind == EventKind::CreatePartnerCommand {
        return TransitionOutcome::LogOnly;
    }

    if state.is_terminal() {
        return TransitionOutcome::IgnoredTerminal;
    }

    match (state, kind) {
        (SagaState::Started, EventKind::PartnerCreated) => {
            advanced(SagaState::PartnerCreated, vec![])
        }
        (SagaState::PartnerCreated, EventKind::ContractCreated) => {
            advanced(SagaState::ContractCreated, vec![])
        }
        (SagaState::PartnerCreated, EventKind::ContractCreationFailed) => {
            advanced(SagaState::CompletedFailed, vec![])
        }
        (SagaState::ContractCreated, EventKind::ContractApproved) => {
            advanced(SagaState::CompletedOk, vec![])
        }
        (SagaState::ContractCreated, EventKind::ContractRejected) => advanced(
            SagaState::ContractRejected,
            vec![SideEffect::RequestRevision],
        ),
        (SagaState::ContractRejected, EventKind::ContractRevisionRequested) => {
            advanced(SagaState::PendingRevision, vec![])
        }
        _ => TransitionOutcome::IgnoredIllegal,
    }
}

fn advanced(next: SagaState, effects: Vec<SideEffect>) -> TransitionOutcome {
    TransitionOutcome::Advanced { next, effects }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [SagaState; 8] = [
        SagaState::Started,
        SagaState::PartnerCreated,
        SagaState::ContractCreated,
        SagaState::ContractApproved,
        SagaState::ContractRejected,
        SagaState::PendingRevision,
        SagaState::CompletedOk,
        SagaState::CompletedFailed,
    ];

    #[test]
    fn happy_path_reaches_completed_ok() {
        let mut state = SagaState::Started;
        for kind in [
            EventKind::PartnerCreated,
            EventKind::ContractCreated,
            EventKind::ContractApproved,
        ] {
            match step(state, kind) {
                TransitionOutcome::Advanced { next, effects } => {
                    assert!(effects.is_empty());
                    state = next;
                }
                other => panic!("expected advance on {kind}, got {other:?}"),
            }
        }
        assert_eq!(state, SagaState::CompletedOk);
    }

    #[test]
    fn rejection_path_requests_revision_then_pends() {
        let outcome = step(SagaState::ContractCreated, EventKind::ContractRejected);
        assert_eq!(
            outcome,
            TransitionOutcome::Advanced {
                next: SagaState::ContractRejected,
                effects: vec![SideEffect::RequestRevision],
            }
        );

        let outcome = step(
            SagaState::ContractRejected,
            EventKind::ContractRevisionRequested,
        );
        assert_eq!(
            outcome,
            TransitionOutcome::Advanced {
                next: SagaState::PendingRevision,
                effects: vec![],
            }
        );
    }

    #[test]
    fn contract_creation_failure_completes_failed() {
        let outcome = step(SagaState::PartnerCreated, EventKind::ContractCreationFailed);
        assert_eq!(
            outcome,
            TransitionOutcome::Advanced {
                next: SagaState::CompletedFailed,
                effects: vec![],
            }
        );
    }

    #[test]
    fn create_partner_command_never_advances_any_state() {
        for state in ALL_STATES {
            assert_eq!(
                step(state, EventKind::CreatePartnerCommand),
                TransitionOutcome::LogOnly
            );
        }
    }

    #[test]
    fn terminal_states_ignore_every_event() {
        for state in ALL_STATES.into_iter().filter(SagaState::is_terminal) {
            for kind in EventKind::ALL {
                if kind == EventKind::CreatePartnerCommand {
                    continue;
                }
                assert_eq!(
                    step(state, kind),
                    TransitionOutcome::IgnoredTerminal,
                    "{state} must ignore {kind}"
                );
            }
        }
    }

    #[test]
    fn out_of_order_events_are_ignored_not_applied() {
        assert_eq!(
            step(SagaState::Started, EventKind::ContractApproved),
            TransitionOutcome::IgnoredIllegal
        );
        assert_eq!(
            step(SagaState::Started, EventKind::ContractCreated),
            TransitionOutcome::IgnoredIllegal
        );
        assert_eq!(
            step(SagaState::ContractCreated, EventKind::PartnerCreated),
            TransitionOutcome::IgnoredIllegal
        );
    }

    #[test]
    fn only_the_rejected_transition_carries_effects() {
        for state in ALL_STATES {
            for kind in EventKind::ALL {
                if let TransitionOutcome::Advanced { effects, .. } = step(state, kind) {
                    if (state, kind) == (SagaState::ContractCreated, EventKind::ContractRejected) {
                        assert_eq!(effects, vec![SideEffect::RequestRevision]);
                    } else {
                        assert!(effects.is_empty(), "{state} + {kind} has stray effects");
                    }
                }
            }
        }
    }

    #[test]
    fn state_names_round_trip() {
        for state in ALL_STATES {
            let parsed: SagaState = state.name().parse().unwrap();
            assert_eq!(state, parsed);
        }
    }
}
