//! flasher.rs
//! Writes actuation tables to the vehicle, one at a time, under the client lock.

use std::{sync::Arc, time::Duration};

use log::{error, info, warn};

use crate::conn::{ProtocolError, SharedClient, probe::LivenessProbe};
use crate::control::{exit::ExitToken, table::ActuationTable};
use crate::vehicle::{
    channel::{OrderedReceiver, SignalSender},
    filter::Resume,
    watchdog::Watchdog,
};

/// What became of the table the episode loop handed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOutcome {
    Flashed,
    /// Recoverable failure; the vehicle still runs the previous table.
    Failed,
}

pub struct FlashWorker {
    pub client: SharedClient,
    pub probe: Arc<dyn LivenessProbe>,
    pub watchdog: Watchdog,
    pub tables: OrderedReceiver<ActuationTable>,
    pub done: SignalSender<FlashOutcome>,
    pub resume: SignalSender<Resume>,
    pub exit: ExitToken,
    pub poll: Duration,
}

impl FlashWorker {
    pub fn run(&self) -> Result<(), ProtocolError> {
        info!("[Flash] ready");
        let mut flashed: u64 = 0;
        while !self.exit.is_set() {
            let table = match self.tables.get(self.poll) {
                Ok(t) => t,
                Err(e) if e.is_absence() => continue,
                Err(_) => break,
            };
            let row = table.start_row;

            let result = {
                let mut client = self.client.lock();
                client.send_actuation(table)
            };

            match result {
                Ok(()) => {
                    flashed += 1;
                    info!("[Flash] table #{} written at row {}", flashed, row);
                    self.finish(FlashOutcome::Flashed);
                }
                Err(e) if e.is_recoverable() => {
                    let failures = self.watchdog.record_flash_failure();
                    warn!("[Flash] send_actuation failed ({} so far): {}", failures, e);
                    self.probe.probe();
                    self.finish(FlashOutcome::Failed);
                }
                Err(e) => {
                    self.watchdog.record_flash_failure();
                    error!("[Flash] send_actuation failed fatally: {}", e);
                    self.done.raise(FlashOutcome::Failed);
                    return Err(e);
                }
            }
        }
        info!("[Flash] stopped after {} tables", flashed);
        Ok(())
    }

    /// Resume goes out before done: once the episode loop has seen done, the filter's
    /// wake-up is already armed and gets consumed or drained before the next episode.
    fn finish(&self, outcome: FlashOutcome) {
        self.resume.raise(Resume::AfterFlash);
        self.done.raise(outcome);
    }
}
