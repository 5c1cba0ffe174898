//! interface.rs
//! Vehicle Interface Orchestrator: wires the workers of one vehicle interface together.
//!
//! ```text
//!  client --capture--> [fresh raw] --filter--> [frames] --> episode loop
//!    ^                                   ^                      |
//!    |                                resume                 [tables]
//!    +-------------------flash worker <-------------------------+
//!  udp/dummy --listener--> [signals] --hmi control--> ControlState
//! ```
//!
//! Each worker runs on its own named thread until the exit token fires. The first worker
//! that fails fatally forces the state to `exit`, triggers the token, and its error is what
//! [`Workers::join`] returns.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{error, info};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::vehicles::VehicleProfile;
use crate::conn::{ProtocolError, SharedClient, probe::LivenessProbe};
use crate::control::{
    exit::ExitToken,
    hmi::run_hmi_control,
    state::{ControlState, State},
    table::ActuationTable,
};
use crate::vehicle::{
    capture::CaptureWorker,
    channel::{OrderedReceiver, OrderedSender, SignalReceiver, SignalSender, fresh, ordered, signal},
    filter::{FrameFilter, Resume},
    flasher::{FlashOutcome, FlashWorker},
    framer::{FrameError, Framer, ObservationFrame},
    listener::{HmiSource, bind_udp, run_dummy_listener, run_udp_listener},
    watchdog::Watchdog,
};

const SIGNAL_QUEUE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("framing: {0}")]
    Frame(#[from] FrameError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("worker {0} panicked")]
    WorkerPanicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSettings {
    /// Upper bound on every blocking wait, so workers notice exit promptly.
    pub poll: Duration,
    pub retry_backoff: Duration,
    /// Added to the capture span to form the `get_signals` timeout.
    pub capture_timeout_margin: Duration,
    pub observation_capacity: usize,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(50),
            retry_backoff: Duration::from_millis(500),
            capture_timeout_margin: Duration::from_secs(7),
            observation_capacity: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state: State,
    pub capture_failures: u64,
    pub flash_failures: u64,
    pub stale_raw_dropped: u64,
}

/// Read-only view of the pipeline for status reporting.
#[derive(Clone)]
pub struct PipelineStatus {
    state: ControlState,
    watchdog: Watchdog,
    stale_raw: Arc<AtomicU64>,
}

impl PipelineStatus {
    pub fn new(state: ControlState, watchdog: Watchdog, stale_raw: Arc<AtomicU64>) -> Self {
        Self { state, watchdog, stale_raw }
    }

    pub fn snapshot(&self) -> StatusReport {
        let counters = self.watchdog.snapshot();
        StatusReport {
            state: self.state.get(),
            capture_failures: counters.capture,
            flash_failures: counters.flash,
            stale_raw_dropped: self.stale_raw.load(Ordering::Relaxed),
        }
    }
}

/// The episode loop's ends of the pipeline.
pub struct EpisodeLink {
    pub frames: OrderedReceiver<ObservationFrame>,
    pub tables: OrderedSender<ActuationTable>,
    pub flash_done: SignalReceiver<FlashOutcome>,
    pub resume: SignalSender<Resume>,
    pub state: ControlState,
    pub status: PipelineStatus,
}

pub struct Workers {
    handles: Vec<(String, JoinHandle<()>)>,
    first_error: Arc<Mutex<Option<PipelineError>>>,
    exit: ExitToken,
    state: ControlState,
}

/// Forces exit if the owning worker thread unwinds.
struct PanicGuard {
    exit: ExitToken,
    state: ControlState,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.state.force_exit();
            self.exit.trigger();
        }
    }
}

impl Workers {
    fn new(exit: ExitToken, state: ControlState) -> Self {
        Self {
            handles: Vec::new(),
            first_error: Arc::new(Mutex::new(None)),
            exit,
            state,
        }
    }

    fn spawn<F>(&mut self, name: &str, work: F) -> Result<(), PipelineError>
    where
        F: FnOnce() -> Result<(), PipelineError> + Send + 'static,
    {
        let exit = self.exit.clone();
        let state = self.state.clone();
        let slot = self.first_error.clone();
        let label = name.to_string();
        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _guard = PanicGuard { exit: exit.clone(), state: state.clone() };
            if let Err(e) = work() {
                error!("[{}] fatal: {}", label, e);
                state.force_exit();
                exit.trigger();
                slot.lock().get_or_insert(e);
            }
        });
        match spawned {
            Ok(handle) => {
                self.handles.push((name.to_string(), handle));
                Ok(())
            }
            Err(e) => {
                self.exit.trigger();
                Err(e.into())
            }
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handles.iter().map(|(n, _)| n.as_str())
    }

    /// Waits for every worker. The first fatal error (in time) wins over panics.
    pub fn join(self) -> Result<(), PipelineError> {
        let mut panicked = None;
        for (name, handle) in self.handles {
            if handle.join().is_err() {
                error!("[Interface] worker {} panicked", name);
                panicked.get_or_insert(name);
            }
        }
        if let Some(e) = self.first_error.lock().take() {
            return Err(e);
        }
        match panicked {
            Some(name) => Err(PipelineError::WorkerPanicked(name)),
            None => Ok(()),
        }
    }
}

pub struct VehicleInterface {
    profile: VehicleProfile,
    client: SharedClient,
    probe: Arc<dyn LivenessProbe>,
    settings: InterfaceSettings,
}

impl VehicleInterface {
    pub fn new(
        profile: VehicleProfile,
        client: SharedClient,
        probe: Arc<dyn LivenessProbe>,
        settings: InterfaceSettings,
    ) -> Self {
        Self { profile, client, probe, settings }
    }

    pub fn profile(&self) -> &VehicleProfile {
        &self.profile
    }

    /// Launches every worker and returns once they are all running.
    pub fn start(
        &self,
        exit: ExitToken,
        hmi: HmiSource,
    ) -> Result<(EpisodeLink, Workers), PipelineError> {
        let s = self.settings;
        let state = ControlState::new();
        let watchdog = Watchdog::new();

        let (raw_tx, raw_rx) = fresh();
        let (frames_tx, frames_rx) = ordered(s.observation_capacity);
        let (tables_tx, tables_rx) = ordered(1);
        let (signals_tx, signals_rx) = ordered(SIGNAL_QUEUE);
        let (done_tx, done_rx) = signal();
        let (resume_tx, resume_rx) = signal();
        let status = PipelineStatus::new(state.clone(), watchdog.clone(), raw_rx.overwrite_counter());

        let mut workers = Workers::new(exit.clone(), state.clone());

        let duration = self.profile.interface.capture_duration();
        let capture = CaptureWorker {
            client: self.client.clone(),
            probe: self.probe.clone(),
            watchdog: watchdog.clone(),
            raw: raw_tx,
            exit: exit.clone(),
            duration,
            timeout: duration + s.capture_timeout_margin,
            retry_backoff: s.retry_backoff,
        };
        workers.spawn("capture", move || capture.run().map_err(PipelineError::from))?;

        match hmi {
            HmiSource::Udp { bind } => {
                let socket = bind_udp(bind, s.poll)?;
                let (watchdog, exit) = (watchdog.clone(), exit.clone());
                workers.spawn("hmi-listener", move || {
                    run_udp_listener(socket, signals_tx, watchdog, exit, s.poll).map_err(PipelineError::from)
                })?;
            }
            HmiSource::Dummy => {
                let exit = exit.clone();
                workers.spawn("hmi-listener", move || {
                    run_dummy_listener(signals_tx, exit, s.poll);
                    Ok(())
                })?;
            }
        }

        {
            let (state, exit) = (state.clone(), exit.clone());
            workers.spawn("hmi-control", move || {
                run_hmi_control(signals_rx, state, exit, s.poll);
                Ok(())
            })?;
        }

        let filter = FrameFilter {
            raw: raw_rx,
            frames: frames_tx,
            resume: resume_rx,
            state: state.clone(),
            framer: Framer::for_profile(&self.profile),
            watchdog: watchdog.clone(),
            exit: exit.clone(),
            poll: s.poll,
        };
        workers.spawn("filter", move || filter.run().map_err(PipelineError::from))?;

        let flasher = FlashWorker {
            client: self.client.clone(),
            probe: self.probe.clone(),
            watchdog,
            tables: tables_rx,
            done: done_tx,
            resume: resume_tx.clone(),
            exit,
            poll: s.poll,
        };
        workers.spawn("flasher", move || flasher.run().map_err(PipelineError::from))?;

        info!(
            "[Interface] {} ({}) started: {}",
            self.profile.vid,
            self.profile.interface.name(),
            workers.names().collect::<Vec<_>>().join(", ")
        );

        let link = EpisodeLink {
            frames: frames_rx,
            tables: tables_tx,
            flash_done: done_rx,
            resume: resume_tx,
            state,
            status,
        };
        Ok((link, workers))
    }
}
