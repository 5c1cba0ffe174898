//! # vcu_pipeline
//!
//! Closed-loop telemetry capture and torque-table actuation for one vehicle interface.
//!
//! ## Key Architecture
//! - **Capture:** periodic `get_signals` into a capacity-1 freshness buffer (newest wins).
//! - **Filter:** frames raw bundles into fixed-shape observation windows while an episode runs.
//! - **Episode loop:** feeds frames to the agent, emits actuation tables, waits for each flash.
//! - **Flash worker:** writes tables to the vehicle; capture and flash share one client lock.
//! - **HMI:** operator datagrams drive the control state machine.
//!
//! ## Concurrency
//! - One OS thread per worker, bounded crossbeam channels between them.
//! - Every blocking wait is bounded by a poll interval and interruptible by the exit token.

pub mod config;
pub mod conn;
pub mod control;
pub mod utils;
pub mod vehicle;
