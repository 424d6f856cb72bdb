use std::time::SystemTime;

use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Player currently allowed to answer, with the store-time deadline of the turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnHolder {
    /// Player name.
    pub name: String,
    /// Instant at which the turn expires, in store time.
    pub deadline: SystemTime,
}

/// Adjudicator decision on the holder's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Answer is correct: reward the holder and close the turn.
    Accept,
    /// Answer is wrong: penalize the holder and pass the turn on.
    Fail,
}

/// Phases of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnPhase {
    /// Nobody holds the turn.
    Idle,
    /// A holder is answering against the countdown.
    Active(TurnHolder),
    /// An adjudication for the holder is being written to the store.
    Resolving {
        /// Holder being adjudicated.
        holder: TurnHolder,
        /// Decision being applied.
        verdict: Verdict,
    },
}

impl TurnPhase {
    /// Holder carried by the phase, if any.
    pub fn holder(&self) -> Option<&TurnHolder> {
        match self {
            TurnPhase::Idle => None,
            TurnPhase::Active(holder) | TurnPhase::Resolving { holder, .. } => Some(holder),
        }
    }
}

/// Events that can be applied to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Recompute found a (new) holder at the head of the queue.
    HolderElected(TurnHolder),
    /// Recompute found the queue empty.
    QueueDrained,
    /// The adjudicator issued a verdict for the current holder.
    AdjudicationStarted(Verdict),
    /// The verdict was written; carries the next holder if the queue is not empty.
    AdjudicationFinished(Option<TurnHolder>),
    /// The verdict could not be written; the holder keeps the turn.
    AdjudicationAborted,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the state machine was in when the invalid event was received.
    pub from: TurnPhase,
    /// The event that cannot be applied from this phase.
    pub event: TurnEvent,
}

/// Snapshot of the current state machine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Current phase of the state machine.
    pub phase: TurnPhase,
    /// Version number of the state machine (increments on each transition).
    pub version: usize,
}

/// Idle / Active / Resolving machine driven by the coordinator.
#[derive(Debug, Clone)]
pub struct TurnStateMachine {
    phase: TurnPhase,
    version: usize,
}

impl Default for TurnStateMachine {
    fn default() -> Self {
        Self {
            phase: TurnPhase::Idle,
            version: 0,
        }
    }
}

impl TurnStateMachine {
    /// Create a new state machine initialised in the idle state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> &TurnPhase {
        &self.phase
    }

    /// Copy of the phase together with its version.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase.clone(),
            version: self.version,
        }
    }

    /// True while a verdict is being written.
    pub fn is_resolving(&self) -> bool {
        matches!(self.phase, TurnPhase::Resolving { .. })
    }

    /// Validate and apply an event, returning the new phase.
    pub fn apply(&mut self, event: TurnEvent) -> Result<TurnPhase, InvalidTransition> {
        let next = self.compute_transition(event)?;
        self.phase = next;
        self.version += 1;
        Ok(self.phase.clone())
    }

    fn compute_transition(&self, event: TurnEvent) -> Result<TurnPhase, InvalidTransition> {
        let next = match (&self.phase, event) {
            (TurnPhase::Idle | TurnPhase::Active(_), TurnEvent::HolderElected(holder)) => {
                TurnPhase::Active(holder)
            }
            (TurnPhase::Active(_), TurnEvent::QueueDrained) => TurnPhase::Idle,
            (TurnPhase::Active(holder), TurnEvent::AdjudicationStarted(verdict)) => {
                TurnPhase::Resolving {
                    holder: holder.clone(),
                    verdict,
                }
            }
            (TurnPhase::Resolving { .. }, TurnEvent::AdjudicationFinished(Some(next))) => {
                TurnPhase::Active(next)
            }
            (TurnPhase::Resolving { .. }, TurnEvent::AdjudicationFinished(None)) => TurnPhase::Idle,
            (TurnPhase::Resolving { holder, .. }, TurnEvent::AdjudicationAborted) => {
                TurnPhase::Active(holder.clone())
            }
            (from, event) => {
                return Err(InvalidTransition {
                    from: from.clone(),
                    event,
                });
            }
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn holder(name: &str, deadline_secs: u64) -> TurnHolder {
        TurnHolder {
            name: name.into(),
            deadline: UNIX_EPOCH + Duration::from_secs(deadline_secs),
        }
    }

    fn apply(sm: &mut TurnStateMachine, event: TurnEvent) -> TurnPhase {
        sm.apply(event).unwrap()
    }

    #[test]
    fn initial_state_is_idle() {
        let sm = TurnStateMachine::new();
        assert_eq!(sm.phase(), &TurnPhase::Idle);
        assert_eq!(sm.snapshot().version, 0);
    }

    #[test]
    fn fail_hands_the_turn_to_the_next_claim() {
        let mut sm = TurnStateMachine::new();

        assert_eq!(
            apply(&mut sm, TurnEvent::HolderElected(holder("alice", 15))),
            TurnPhase::Active(holder("alice", 15))
        );
        assert_eq!(
            apply(&mut sm, TurnEvent::AdjudicationStarted(Verdict::Fail)),
            TurnPhase::Resolving {
                holder: holder("alice", 15),
                verdict: Verdict::Fail
            }
        );
        assert_eq!(
            apply(
                &mut sm,
                TurnEvent::AdjudicationFinished(Some(holder("bob", 32)))
            ),
            TurnPhase::Active(holder("bob", 32))
        );
        assert_eq!(sm.snapshot().version, 3);
    }

    #[test]
    fn accept_with_empty_queue_returns_to_idle() {
        let mut sm = TurnStateMachine::new();
        apply(&mut sm, TurnEvent::HolderElected(holder("alice", 15)));
        apply(&mut sm, TurnEvent::AdjudicationStarted(Verdict::Accept));

        assert_eq!(
            apply(&mut sm, TurnEvent::AdjudicationFinished(None)),
            TurnPhase::Idle
        );
    }

    #[test]
    fn aborted_adjudication_keeps_the_holder() {
        let mut sm = TurnStateMachine::new();
        apply(&mut sm, TurnEvent::HolderElected(holder("alice", 15)));
        apply(&mut sm, TurnEvent::AdjudicationStarted(Verdict::Accept));
        assert!(sm.is_resolving());

        assert_eq!(
            apply(&mut sm, TurnEvent::AdjudicationAborted),
            TurnPhase::Active(holder("alice", 15))
        );
    }

    #[test]
    fn verdict_without_holder_is_rejected() {
        let mut sm = TurnStateMachine::new();
        let err = sm
            .apply(TurnEvent::AdjudicationStarted(Verdict::Fail))
            .unwrap_err();
        assert_eq!(err.from, TurnPhase::Idle);
        assert_eq!(err.event, TurnEvent::AdjudicationStarted(Verdict::Fail));
        assert_eq!(sm.snapshot().version, 0);
    }

    #[test]
    fn recompute_cannot_interrupt_resolution() {
        let mut sm = TurnStateMachine::new();
        apply(&mut sm, TurnEvent::HolderElected(holder("alice", 15)));
        apply(&mut sm, TurnEvent::AdjudicationStarted(Verdict::Fail));

        assert!(sm.apply(TurnEvent::QueueDrained).is_err());
        assert!(
            sm.apply(TurnEvent::HolderElected(holder("bob", 20)))
                .is_err()
        );
    }
}
