//! client.rs
//! Protocol Client seam and the raw telemetry bundle it returns.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::conn::error::ProtocolError;
use crate::control::table::ActuationTable;

/// Telemetry channels delivered by the remote CAN service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignalKind {
    Velocity,
    Thrust,
    Brake,
    Gear,
    Current,
    Voltage,
}

impl SignalKind {
    pub const ALL: [SignalKind; 6] = [
        SignalKind::Velocity,
        SignalKind::Thrust,
        SignalKind::Brake,
        SignalKind::Gear,
        SignalKind::Current,
        SignalKind::Voltage,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            SignalKind::Velocity => "list_speed_1s",
            SignalKind::Thrust => "list_pedal_1s",
            SignalKind::Brake => "list_brake_pressure_1s",
            SignalKind::Gear => "list_gears",
            SignalKind::Current => "list_current_1s",
            SignalKind::Voltage => "list_voltage_1s",
        }
    }
}

/// One sample as the remote service sends it: sometimes a number, sometimes a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sample {
    Num(f64),
    Text(String),
}

impl Sample {
    pub fn value(&self) -> Option<f64> {
        match self {
            Sample::Num(v) => Some(*v),
            Sample::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<f64> for Sample {
    fn from(v: f64) -> Self {
        Sample::Num(v)
    }
}

/// Everything one `get_signals` call returned.
///
/// `signals[name][tick]` is the ragged sample list for that one-second tick;
/// `timestamps[tick]` is the tick start in epoch milliseconds, as a string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSignalBundle {
    pub timestamps: Vec<String>,
    #[serde(flatten)]
    pub signals: BTreeMap<String, Vec<Vec<Sample>>>,
}

#[derive(Deserialize)]
struct Envelope {
    result: RawSignalBundle,
}

impl RawSignalBundle {
    /// Parses the service's `{"result": {...}}` reply.
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Envelope>(body).map(|e| e.result)
    }

    pub fn ticks(&self) -> usize {
        self.timestamps.len()
    }

    pub fn signal(&self, kind: SignalKind) -> Option<&[Vec<Sample>]> {
        self.signals.get(kind.wire_name()).map(Vec::as_slice)
    }

    pub fn with_signal(mut self, kind: SignalKind, ticks: Vec<Vec<Sample>>) -> Self {
        self.signals.insert(kind.wire_name().to_string(), ticks);
        self
    }
}

/// A connection to one vehicle.
///
/// Implementations are driven from several worker threads, always through a
/// [`SharedClient`], so at most one call is in flight at any time.
pub trait ProtocolClient: Send {
    /// Captures `duration` worth of telemetry; must give up after `timeout`.
    fn get_signals(
        &mut self,
        duration: Duration,
        timeout: Duration,
    ) -> Result<RawSignalBundle, ProtocolError>;

    /// Writes one calibration table window to the vehicle.
    fn send_actuation(&mut self, table: ActuationTable) -> Result<(), ProtocolError>;
}

/// Client plus its single-flight lock.
pub type SharedClient = Arc<Mutex<Box<dyn ProtocolClient>>>;

pub fn shared(client: impl ProtocolClient + 'static) -> SharedClient {
    let client: Box<dyn ProtocolClient> = Box::new(client);
    Arc::new(Mutex::new(client))
}
