//! capture.rs
//! Periodic telemetry capture into the freshness buffer.
//!
//! Every iteration takes the client lock for exactly one `get_signals` call. Failures are
//! counted; connectivity failures additionally trigger a liveness probe and a short backoff
//! before the next attempt. Anything else ends the worker.

use std::{sync::Arc, time::Duration};

use log::{debug, error, info, warn};

use crate::conn::{ProtocolError, RawSignalBundle, SharedClient, probe::LivenessProbe};
use crate::control::exit::ExitToken;
use crate::vehicle::{channel::FreshWriter, watchdog::Watchdog};

pub struct CaptureWorker {
    pub client: SharedClient,
    pub probe: Arc<dyn LivenessProbe>,
    pub watchdog: Watchdog,
    pub raw: FreshWriter<RawSignalBundle>,
    pub exit: ExitToken,
    /// Span requested from the remote service per call.
    pub duration: Duration,
    /// Hard limit handed to the client, `duration` plus a network margin.
    pub timeout: Duration,
    pub retry_backoff: Duration,
}

impl CaptureWorker {
    pub fn run(&self) -> Result<(), ProtocolError> {
        info!(
            "[Capture] starting, duration={:?} timeout={:?}",
            self.duration, self.timeout
        );
        let mut captured: u64 = 0;
        while !self.exit.is_set() {
            let result = {
                let mut client = self.client.lock();
                client.get_signals(self.duration, self.timeout)
            };

            match result {
                Ok(bundle) => {
                    captured += 1;
                    if self.raw.put(bundle) {
                        debug!("[Capture] bundle #{} replaced an unread one", captured);
                    }
                }
                Err(e) if e.is_recoverable() => {
                    let failures = self.watchdog.record_capture_failure();
                    warn!("[Capture] get_signals failed ({} so far), retrying: {}", failures, e);
                    self.probe.probe();
                    if self.exit.sleep(self.retry_backoff) {
                        break;
                    }
                }
                Err(e) => {
                    self.watchdog.record_capture_failure();
                    error!("[Capture] get_signals failed fatally: {}", e);
                    return Err(e);
                }
            }
        }
        info!("[Capture] stopped after {} bundles", captured);
        Ok(())
    }
}
