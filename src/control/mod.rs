//! Control side of the loop: operator state machine, agent seam, episode loop.

pub mod agent;
pub mod episode;
pub mod exit;
pub mod hmi;
pub mod state;
pub mod table;
