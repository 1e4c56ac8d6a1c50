//! Event state machine.
//!
//! ```text
//! QUEUED → SUBMITTED → RUNNING → COMPLETE
//!    └──────────┴──────────┴──→ ERROR
//! ```
//! COMPLETE and ERROR are terminal; a terminal state never changes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::status;

/// Execution state of an event. Encoded as one byte on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventState {
    Queued = 0,
    Submitted = 1,
    Running = 2,
    Complete = 3,
    Error = 4,
}

impl EventState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventState::Complete | EventState::Error)
    }

    /// Whether `self → to` is a single legal step.
    pub fn can_transition_to(self, to: EventState) -> bool {
        match (self, to) {
            (EventState::Queued, EventState::Submitted) => true,
            (EventState::Submitted, EventState::Running) => true,
            (EventState::Running, EventState::Complete) => true,
            (from, EventState::Error) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Whether an observer holding `self` should accept `to`.
    ///
    /// Receivers accept any forward move; the owner is responsible for
    /// emitting single steps.
    pub fn is_superseded_by(self, to: EventState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == EventState::Error || to.rank() > self.rank()
    }

    /// Whether `exit_code` may accompany this state: negative for ERROR,
    /// `0` for everything else.
    pub fn admits_exit_code(self, exit_code: i32) -> bool {
        match self {
            EventState::Error => exit_code < 0,
            _ => exit_code == 0,
        }
    }

    /// Next state on the success path.
    pub fn next(self) -> Option<EventState> {
        match self {
            EventState::Queued => Some(EventState::Submitted),
            EventState::Submitted => Some(EventState::Running),
            EventState::Running => Some(EventState::Complete),
            EventState::Complete | EventState::Error => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            EventState::Queued => 0,
            EventState::Submitted => 1,
            EventState::Running => 2,
            EventState::Complete | EventState::Error => 3,
        }
    }
}

impl TryFrom<u8> for EventState {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        Ok(match value {
            0 => EventState::Queued,
            1 => EventState::Submitted,
            2 => EventState::Running,
            3 => EventState::Complete,
            4 => EventState::Error,
            other => return Err(other),
        })
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventState::Queued => "QUEUED",
            EventState::Submitted => "SUBMITTED",
            EventState::Running => "RUNNING",
            EventState::Complete => "COMPLETE",
            EventState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Snapshot of an event as seen by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStatus {
    pub state: EventState,
    /// `0` unless the state is ERROR, then a negative status code.
    pub exit_code: i32,
    /// Owner-side wall clock of the transition, nanoseconds since the epoch.
    pub timestamp_ns: u64,
}

impl EventStatus {
    pub fn new(state: EventState, exit_code: i32) -> Self {
        Self {
            state,
            exit_code,
            timestamp_ns: now_ns(),
        }
    }

    pub fn queued() -> Self {
        Self::new(EventState::Queued, 0)
    }

    pub fn is_well_formed(&self) -> bool {
        self.state.admits_exit_code(self.exit_code)
    }

    /// Force the exit code to agree with the state. The state wins: an ERROR
    /// without a negative code becomes ERROR(`PROTOCOL_ERROR`), any other
    /// state gets `0`.
    pub fn normalized(self) -> Self {
        if self.is_well_formed() {
            return self;
        }
        let exit_code = match self.state {
            EventState::Error => status::PROTOCOL_ERROR,
            _ => 0,
        };
        Self { exit_code, ..self }
    }

    /// The host-API execution status: `CL_COMPLETE` (0), `CL_RUNNING` (1),
    /// `CL_SUBMITTED` (2), `CL_QUEUED` (3), or the negative error code.
    pub fn to_cl_status(&self) -> i32 {
        match self.state {
            EventState::Complete => 0,
            EventState::Running => 1,
            EventState::Submitted => 2,
            EventState::Queued => 3,
            EventState::Error => self.exit_code,
        }
    }
}

pub(crate) fn now_ns() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .and_then(|ns| u64::try_from(ns).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_single_steps() {
        assert!(EventState::Queued.can_transition_to(EventState::Submitted));
        assert!(EventState::Submitted.can_transition_to(EventState::Running));
        assert!(EventState::Running.can_transition_to(EventState::Complete));
        assert!(EventState::Queued.can_transition_to(EventState::Error));
        assert!(EventState::Running.can_transition_to(EventState::Error));
    }

    #[test]
    fn test_illegal_steps() {
        assert!(!EventState::Queued.can_transition_to(EventState::Complete));
        assert!(!EventState::Running.can_transition_to(EventState::Submitted));
        assert!(!EventState::Complete.can_transition_to(EventState::Error));
        assert!(!EventState::Error.can_transition_to(EventState::Error));
    }

    #[test]
    fn test_terminal_is_never_superseded() {
        for to in [
            EventState::Queued,
            EventState::Submitted,
            EventState::Running,
            EventState::Complete,
            EventState::Error,
        ] {
            assert!(!EventState::Complete.is_superseded_by(to));
            assert!(!EventState::Error.is_superseded_by(to));
        }
    }

    #[test]
    fn test_receiver_accepts_forward_jumps_only() {
        assert!(EventState::Queued.is_superseded_by(EventState::Running));
        assert!(!EventState::Running.is_superseded_by(EventState::Running));
        assert!(!EventState::Running.is_superseded_by(EventState::Submitted));
    }

    #[test]
    fn test_exit_code_must_agree_with_state() {
        assert!(EventStatus::new(EventState::Complete, 0).is_well_formed());
        assert!(EventStatus::new(EventState::Error, -5).is_well_formed());
        assert!(!EventStatus::new(EventState::Error, 0).is_well_formed());
        assert!(!EventStatus::new(EventState::Error, 7).is_well_formed());
        assert!(!EventStatus::new(EventState::Complete, -5).is_well_formed());
        assert!(!EventStatus::new(EventState::Running, 3).is_well_formed());
    }

    #[test]
    fn test_normalized_keeps_state() {
        let fixed = EventStatus::new(EventState::Error, 0).normalized();
        assert_eq!(fixed.state, EventState::Error);
        assert_eq!(fixed.exit_code, status::PROTOCOL_ERROR);

        let fixed = EventStatus::new(EventState::Complete, -5).normalized();
        assert_eq!((fixed.state, fixed.exit_code), (EventState::Complete, 0));

        let good = EventStatus::new(EventState::Error, -14);
        assert_eq!(good.normalized(), good);
    }

    #[test]
    fn test_cl_status_mapping() {
        assert_eq!(EventStatus::new(EventState::Complete, 0).to_cl_status(), 0);
        assert_eq!(EventStatus::new(EventState::Queued, 0).to_cl_status(), 3);
        assert_eq!(EventStatus::new(EventState::Error, -5).to_cl_status(), -5);
    }
}
