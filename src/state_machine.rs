//! Per-key issuance state for debounced remote calls:
//! Idle → Scheduled → InFlight → Settled → Idle.
//! A Scheduled key may be re-scheduled by a newer request (supersede) or
//! dropped back to Idle when its caller goes away before the window closes.

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Where a key is in its issuance lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IssueState {
    Idle,
    Scheduled,
    InFlight,
    Settled,
}

impl std::fmt::Display for IssueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueState::Idle => write!(f, "Idle"),
            IssueState::Scheduled => write!(f, "Scheduled"),
            IssueState::InFlight => write!(f, "InFlight"),
            IssueState::Settled => write!(f, "Settled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: IssueState,
    pub to: IssueState,
}

impl IssueState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: IssueState) -> bool {
        matches!(
            (self, next),
            (IssueState::Idle, IssueState::Scheduled)
                | (IssueState::Scheduled, IssueState::Scheduled) // superseded, window restarts
                | (IssueState::Scheduled, IssueState::InFlight)
                | (IssueState::Scheduled, IssueState::Idle) // caller dropped before firing
                | (IssueState::InFlight, IssueState::Settled)
                | (IssueState::Settled, IssueState::Idle)
                | (IssueState::Settled, IssueState::Scheduled)
        )
    }
}

/// State of one key plus the generation that owns it.
/// Each (re)schedule takes a fresh generation, so a superseded waiter can tell
/// it no longer owns the slot.
#[derive(Debug, Clone, Copy)]
pub struct IssueSlot {
    state: IssueState,
    generation: u64,
}

impl IssueSlot {
    pub fn scheduled(generation: u64) -> Self {
        Self {
            state: IssueState::Scheduled,
            generation,
        }
    }

    pub fn state(&self) -> IssueState {
        self.state
    }

    pub fn owned_by(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Attempt a transition. Rescheduling also moves the slot to `generation`.
    pub fn transition(&mut self, next: IssueState, generation: u64) -> Result<IssueState, InvalidTransition> {
        let from = self.state;
        if !from.can_transition_to(next) {
            let err = InvalidTransition { from, to: next };
            warn!(%from, to = %next, "issue_state_rejected");
            return Err(err);
        }
        self.state = next;
        if next == IssueState::Scheduled {
            self.generation = generation;
        }
        Ok(next)
    }
}
