//! Vehicle Interface Orchestrator and the stages it wires together.

pub mod capture;
pub mod channel;
pub mod filter;
pub mod flasher;
pub mod framer;
pub mod interface;
pub mod listener;
pub mod watchdog;
