//! Episode CSV log and the status endpoint.

pub mod episode_log;
pub mod health;
