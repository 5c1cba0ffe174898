//! Protocol Client seam: error taxonomy, bundle model, transports and liveness probes.

pub mod client;
pub mod error;
pub mod probe;
pub mod sim;
pub mod tbox;

pub use client::{ProtocolClient, RawSignalBundle, Sample, SharedClient, SignalKind};
pub use error::{ErrorCode, ProtocolError};
