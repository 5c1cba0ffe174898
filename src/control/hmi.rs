//! hmi.rs
//! Applies operator signals from the listener to the control state.

use std::time::Duration;

use log::{info, warn};

use crate::control::{
    exit::ExitToken,
    state::{ControlSignal, ControlState, State},
};
use crate::vehicle::channel::OrderedReceiver;

/// Consumes operator signals until `exit` arrives (or the exit token fires).
///
/// A `begin` received while the previous episode is still being finalized
/// (stopped / interrupted) is held and retried every `poll` until the episode loop resets
/// the state to idle. An `exit` arriving meanwhile still shuts the pipeline down; other
/// signals are dropped.
pub fn run_hmi_control(
    signals: OrderedReceiver<ControlSignal>,
    state: ControlState,
    exit: ExitToken,
    poll: Duration,
) {
    while !exit.is_set() {
        let signal = match signals.get(poll) {
            Ok(s) => s,
            Err(e) if e.is_absence() => continue,
            Err(_) => {
                info!("[Hmi] signal channel closed");
                break;
            }
        };

        match signal {
            ControlSignal::Exit => {
                operator_exit(&state, &exit);
                break;
            }
            ControlSignal::Begin => {
                if hold_begin(&signals, &state, &exit, poll) {
                    break;
                }
            }
            other => match state.apply(other) {
                Ok(to) => info!("[Hmi] {:?} -> {}", other, to),
                Err(rejected) => warn!("[Hmi] ignored: {}", rejected),
            },
        }
    }
}

fn operator_exit(state: &ControlState, exit: &ExitToken) {
    info!("[Hmi] exit requested by operator");
    state.force_exit();
    exit.trigger();
}

/// `true` if an operator exit came in while the begin was held.
fn hold_begin(
    signals: &OrderedReceiver<ControlSignal>,
    state: &ControlState,
    exit: &ExitToken,
    poll: Duration,
) -> bool {
    loop {
        match state.apply(ControlSignal::Begin) {
            Ok(to) => {
                info!("[Hmi] Begin -> {}", to);
                return false;
            }
            Err(rejected) if matches!(rejected.from, State::Stopped | State::Interrupted) => {
                while let Ok(signal) = signals.try_get() {
                    if signal == ControlSignal::Exit {
                        operator_exit(state, exit);
                        return true;
                    }
                    warn!("[Hmi] {:?} dropped while begin is pending", signal);
                }
                if exit.sleep(poll) {
                    return false;
                }
            }
            Err(rejected) => {
                warn!("[Hmi] ignored: {}", rejected);
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::channel::ordered;
    use std::{thread, time::Instant};

    fn wait_for(state: &ControlState, want: State) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if state.get() == want {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_begin_is_held_until_reset() {
        let (tx, rx) = ordered(8);
        let state = ControlState::new();
        let exit = ExitToken::new();
        let worker = {
            let (state, exit) = (state.clone(), exit.clone());
            thread::spawn(move || run_hmi_control(rx, state, exit, Duration::from_millis(5)))
        };

        tx.put(ControlSignal::Begin).unwrap();
        assert!(wait_for(&state, State::Running));
        tx.put(ControlSignal::EndValid).unwrap();
        assert!(wait_for(&state, State::Stopped));

        tx.put(ControlSignal::Begin).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(state.get(), State::Stopped);
        assert!(state.reset());
        assert!(wait_for(&state, State::Running));

        tx.put(ControlSignal::Exit).unwrap();
        worker.join().unwrap();
        assert_eq!(state.get(), State::Exit);
        assert!(exit.is_set());
    }

    #[test]
    fn test_exit_is_honoured_while_begin_is_held() {
        let (tx, rx) = ordered(8);
        let state = ControlState::new();
        let exit = ExitToken::new();
        let worker = {
            let (state, exit) = (state.clone(), exit.clone());
            thread::spawn(move || run_hmi_control(rx, state, exit, Duration::from_millis(5)))
        };

        tx.put(ControlSignal::Begin).unwrap();
        assert!(wait_for(&state, State::Running));
        tx.put(ControlSignal::EndValid).unwrap();
        assert!(wait_for(&state, State::Stopped));

        // nobody resets the state: the begin stays pending
        tx.put(ControlSignal::Begin).unwrap();
        thread::sleep(Duration::from_millis(20));
        tx.put(ControlSignal::Exit).unwrap();

        assert!(wait_for(&state, State::Exit));
        let deadline = Instant::now() + Duration::from_secs(2);
        while !worker.is_finished() {
            assert!(Instant::now() < deadline, "hmi worker still holding begin after exit");
            thread::sleep(Duration::from_millis(2));
        }
        worker.join().unwrap();
        assert!(exit.is_set());
    }
}
