//! filter.rs
//! Gates raw telemetry on the control state and turns it into observation frames.
//!
//! While the state is not `running` every raw bundle is discarded. While running, each
//! bundle is framed and pushed to the episode loop, then the filter parks until the loop
//! (or the flash worker) tells it to resume. That hand-shake keeps sensing and actuation
//! from overlapping: no frame captured during a flash is ever delivered.

use std::time::Duration;

use log::{debug, info, warn};

use crate::conn::RawSignalBundle;
use crate::control::{exit::ExitToken, state::ControlState};
use crate::vehicle::{
    channel::{ChannelError, FreshReader, OrderedSender, SignalReceiver},
    framer::{FrameError, Framer, ObservationFrame},
    watchdog::Watchdog,
};

/// Why the filter may take the next raw bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Nothing was flashed; the pending raw bundle is still valid.
    Continue,
    /// A flash attempt just finished; whatever was captured meanwhile is stale.
    AfterFlash,
}

pub struct FrameFilter {
    pub raw: FreshReader<RawSignalBundle>,
    pub frames: OrderedSender<ObservationFrame>,
    pub resume: SignalReceiver<Resume>,
    pub state: ControlState,
    pub framer: Framer,
    pub watchdog: Watchdog,
    pub exit: ExitToken,
    pub poll: Duration,
}

impl FrameFilter {
    pub fn run(&self) -> Result<(), FrameError> {
        info!("[Filter] starting, {} rows per frame", self.framer.geometry().rows());
        let mut was_running = false;
        while !self.exit.is_set() {
            if !self.state.is_running() {
                if self.raw.clear() {
                    debug!("[Filter] discarded raw bundle outside an episode");
                }
                was_running = false;
                self.exit.sleep(self.poll);
                continue;
            }
            if !was_running {
                // leftovers from the previous episode
                self.resume.drain();
                was_running = true;
            }

            let bundle = match self.raw.get() {
                Ok(b) => b,
                Err(_) => {
                    self.exit.sleep(self.poll);
                    continue;
                }
            };

            let frame = match self.framer.frame(&bundle) {
                Ok(f) => f,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let failures = self.watchdog.record_capture_failure();
                    warn!("[Filter] bundle dropped ({} capture failures): {}", failures, e);
                    continue;
                }
            };

            match self.push(frame) {
                Pushed::Yes => self.await_resume(),
                Pushed::Abandoned => continue,
                Pushed::Closed => break,
            }
        }
        info!("[Filter] stopped");
        Ok(())
    }

    fn push(&self, mut frame: ObservationFrame) -> Pushed {
        loop {
            match self.frames.put_timeout(frame, self.poll) {
                Ok(()) => return Pushed::Yes,
                Err(rej) if rej.reason == ChannelError::Closed => return Pushed::Closed,
                Err(rej) => {
                    if self.exit.is_set() || !self.state.is_running() {
                        debug!("[Filter] episode ended while queue was full, frame dropped");
                        return Pushed::Abandoned;
                    }
                    frame = rej.item;
                }
            }
        }
    }

    fn await_resume(&self) {
        loop {
            match self.resume.wait(self.poll) {
                Ok(Resume::AfterFlash) => {
                    if self.raw.clear() {
                        debug!("[Filter] dropped bundle captured during flash");
                    }
                    return;
                }
                Ok(Resume::Continue) => return,
                Err(ChannelError::Closed) => return,
                Err(_) => {
                    if self.exit.is_set() || !self.state.is_running() {
                        return;
                    }
                }
            }
        }
    }
}

enum Pushed {
    Yes,
    Abandoned,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::vehicles::VehicleRegistry;
    use crate::conn::{SignalKind, client::Sample};
    use crate::control::state::ControlSignal;
    use crate::vehicle::channel::{fresh, ordered, signal};
    use std::thread;

    fn bundle(speed: f64) -> RawSignalBundle {
        let tick = |v: f64| vec![vec![Sample::Num(v); 30]];
        let mut b = RawSignalBundle { timestamps: vec!["0".into()], ..Default::default() };
        for kind in SignalKind::ALL {
            b = b.with_signal(kind, tick(if kind == SignalKind::Velocity { speed } else { 1.0 }));
        }
        b
    }

    #[test]
    fn test_filter_waits_for_resume_and_drops_stale_after_flash() {
        let reg = VehicleRegistry::builtin();
        let m2 = reg.by_vid("M2").unwrap();
        let (raw_tx, raw_rx) = fresh();
        let (frames_tx, frames_rx) = ordered(4);
        let (resume_tx, resume_rx) = signal();
        let state = ControlState::new();
        let exit = ExitToken::new();
        let filter = FrameFilter {
            raw: raw_rx.clone(),
            frames: frames_tx,
            resume: resume_rx,
            state: state.clone(),
            framer: Framer::for_profile(m2),
            watchdog: Watchdog::new(),
            exit: exit.clone(),
            poll: Duration::from_millis(5),
        };
        let worker = thread::spawn(move || filter.run());

        // not running: raw data is thrown away
        raw_tx.put(bundle(5.0));
        thread::sleep(Duration::from_millis(30));
        assert!(!raw_rx.is_pending());

        state.apply(ControlSignal::Begin).unwrap();
        raw_tx.put(bundle(10.0));
        let first = frames_rx.get(Duration::from_secs(1)).unwrap();
        assert_eq!(first.max_velocity(), 10.0);

        // parked until resumed: the next bundle stays pending
        raw_tx.put(bundle(25.0));
        assert_eq!(frames_rx.get(Duration::from_millis(50)), Err(ChannelError::Timeout));
        assert!(resume_tx.raise(Resume::AfterFlash));
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while raw_rx.is_pending() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!raw_rx.is_pending());
        raw_tx.put(bundle(35.0));
        // the 25 km/h bundle was captured during the flash and must never show up
        let next = frames_rx.get(Duration::from_secs(1)).unwrap();
        assert_eq!(next.max_velocity(), 35.0);

        exit.trigger();
        worker.join().unwrap().unwrap();
    }
}
