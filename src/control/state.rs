//! state.rs
//! Operator-driven control state machine.
//!
//! ```text
//!   idle --begin--> running --end_valid--> stopped
//!                           --end_invalid--> interrupted
//!   stopped | interrupted --reset--> idle
//!   any --exit--> exit (sticky)
//! ```
//!
//! The state lives in one `AtomicU8`, so the filter and the episode loop read it without
//! touching the client lock. Every transition is a compare-and-swap against the state it
//! was validated from; a concurrent change makes the transition retry against the new state.

use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum State {
    Idle = 0,
    Running = 1,
    Stopped = 2,
    Interrupted = 3,
    Exit = 4,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Idle,
            1 => State::Running,
            2 => State::Stopped,
            3 => State::Interrupted,
            _ => State::Exit,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Running => "running",
            State::Stopped => "stopped",
            State::Interrupted => "interrupted",
            State::Exit => "exit",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Begin,
    EndValid,
    EndInvalid,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown control signal {0:?}")]
pub struct UnknownSignal(pub String);

impl FromStr for ControlSignal {
    type Err = UnknownSignal;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "begin" => Ok(ControlSignal::Begin),
            "end_valid" => Ok(ControlSignal::EndValid),
            "end_invalid" => Ok(ControlSignal::EndInvalid),
            "exit" => Ok(ControlSignal::Exit),
            other => Err(UnknownSignal(other.to_string())),
        }
    }
}

/// A signal that has no edge out of the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{signal:?} not accepted in state {from}")]
pub struct Rejected {
    pub from: State,
    pub signal: ControlSignal,
}

#[derive(Clone)]
pub struct ControlState {
    cell: Arc<AtomicU8>,
}

impl ControlState {
    pub fn new() -> Self {
        Self { cell: Arc::new(AtomicU8::new(State::Idle as u8)) }
    }

    pub fn get(&self) -> State {
        State::from_u8(self.cell.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.get() == State::Running
    }

    pub fn apply(&self, signal: ControlSignal) -> Result<State, Rejected> {
        loop {
            let from = self.get();
            let to = match (from, signal) {
                (_, ControlSignal::Exit) => State::Exit,
                (State::Idle, ControlSignal::Begin) => State::Running,
                (State::Running, ControlSignal::EndValid) => State::Stopped,
                (State::Running, ControlSignal::EndInvalid) => State::Interrupted,
                _ => return Err(Rejected { from, signal }),
            };
            if self.swap_from(from, to) {
                return Ok(to);
            }
        }
    }

    /// running -> interrupted without operator input. `false` if not running.
    pub fn interrupt(&self) -> bool {
        self.swap_from(State::Running, State::Interrupted)
    }

    /// stopped | interrupted -> idle, once the episode has been finalized.
    pub fn reset(&self) -> bool {
        let from = self.get();
        matches!(from, State::Stopped | State::Interrupted) && self.swap_from(from, State::Idle)
    }

    pub fn force_exit(&self) {
        self.cell.store(State::Exit as u8, Ordering::Release);
    }

    fn swap_from(&self, from: State, to: State) -> bool {
        self.cell
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_episode_cycle() {
        let s = ControlState::new();
        assert_eq!(s.get(), State::Idle);
        assert_eq!(s.apply(ControlSignal::Begin), Ok(State::Running));
        assert_eq!(s.apply(ControlSignal::EndValid), Ok(State::Stopped));
        assert!(s.reset());
        assert_eq!(s.apply(ControlSignal::Begin), Ok(State::Running));
        assert_eq!(s.apply(ControlSignal::EndInvalid), Ok(State::Interrupted));
        assert!(s.reset());
        assert_eq!(s.get(), State::Idle);
    }

    #[test]
    fn test_illegal_edges_are_rejected() {
        let s = ControlState::new();
        let err = s.apply(ControlSignal::EndValid).unwrap_err();
        assert_eq!(err.from, State::Idle);
        s.apply(ControlSignal::Begin).unwrap();
        assert!(s.apply(ControlSignal::Begin).is_err());
        s.apply(ControlSignal::EndValid).unwrap();
        // a begin during finalization has to wait for reset
        assert!(s.apply(ControlSignal::Begin).is_err());
        assert!(!s.interrupt());
    }

    #[test]
    fn test_exit_is_sticky_from_any_state() {
        let s = ControlState::new();
        s.apply(ControlSignal::Begin).unwrap();
        assert_eq!(s.apply(ControlSignal::Exit), Ok(State::Exit));
        assert!(s.apply(ControlSignal::Begin).is_err());
        assert!(!s.reset());
        assert!(!s.interrupt());
        assert_eq!(s.apply(ControlSignal::Exit), Ok(State::Exit));
    }

    #[test]
    fn test_interrupt_only_from_running() {
        let s = ControlState::new();
        assert!(!s.interrupt());
        s.apply(ControlSignal::Begin).unwrap();
        assert!(s.interrupt());
        assert_eq!(s.get(), State::Interrupted);
    }

    #[test]
    fn test_parse_signal_strings() {
        assert_eq!("end_invalid".parse::<ControlSignal>(), Ok(ControlSignal::EndInvalid));
        assert_eq!(
            "pause".parse::<ControlSignal>(),
            Err(UnknownSignal("pause".to_string()))
        );
    }
}
