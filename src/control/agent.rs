//! agent.rs
//! Decision-making agent seam and a seeded random exploration agent.

use std::{collections::VecDeque, fs, io, path::PathBuf};

use average::{Mean, Variance};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::IteratorRandom};
use serde::Serialize;

use crate::vehicle::framer::ObservationFrame;

/// What the agent observes of one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentState {
    pub timestamp: Option<DateTime<Utc>>,
    pub velocity: Vec<f64>,
    pub thrust: Vec<f64>,
    pub brake: Vec<f64>,
}

impl From<&ObservationFrame> for AgentState {
    fn from(frame: &ObservationFrame) -> Self {
        Self {
            timestamp: frame.started_at(),
            velocity: frame.velocity.clone(),
            thrust: frame.thrust.clone(),
            brake: frame.brake.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: AgentState,
    pub action: Vec<f32>,
    /// Electrical work spent over the step, in joules. Lower is better.
    pub reward: f64,
    pub next_state: AgentState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Losses {
    pub actor: f64,
    pub critic: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("checkpoint io: {0}")]
    Checkpoint(#[from] io::Error),
    #[error("checkpoint encoding: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("training failed: {0}")]
    Training(String),
}

pub trait Agent: Send {
    fn start_episode(&mut self, at: Option<DateTime<Utc>>);
    /// Returns a flat, row-major delta-torque window.
    fn infer(&mut self, state: &AgentState) -> Vec<f32>;
    fn deposit(&mut self, transition: Transition);
    fn end_episode(&mut self);
    fn train(&mut self) -> Result<Losses, AgentError>;
    fn save_checkpoint(&mut self) -> Result<(), AgentError>;
    fn buffer_len(&self) -> usize;
    /// Flushes and releases the experience buffer; called once on shutdown.
    fn close(&mut self);
}

const BATCH: usize = 32;

#[derive(Serialize)]
struct Checkpoint {
    saved_at: DateTime<Utc>,
    episodes: u64,
    transitions: usize,
    mean_reward: f64,
}

/// Uniform exploration inside ± `amplitude` Nm. Keeps a bounded replay buffer so the
/// training and checkpoint path runs end to end without a learning backend.
pub struct RandomAgent {
    rng: StdRng,
    numel: usize,
    amplitude: f32,
    buffer: VecDeque<Transition>,
    capacity: usize,
    checkpoint_dir: Option<PathBuf>,
    episodes: u64,
}

impl RandomAgent {
    pub fn new(seed: u64, numel: usize, amplitude: f32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            numel,
            amplitude: amplitude.abs(),
            buffer: VecDeque::new(),
            capacity: 10_000,
            checkpoint_dir: None,
            episodes: 0,
        }
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    fn mean_reward(&self) -> f64 {
        let mean: Mean = self.buffer.iter().map(|t| t.reward).collect();
        mean.mean()
    }
}

impl Agent for RandomAgent {
    fn start_episode(&mut self, at: Option<DateTime<Utc>>) {
        debug!("[Agent] episode {} starts at {:?}", self.episodes + 1, at);
    }

    fn infer(&mut self, _state: &AgentState) -> Vec<f32> {
        if self.amplitude == 0.0 {
            return vec![0.0; self.numel];
        }
        (0..self.numel)
            .map(|_| self.rng.random_range(-self.amplitude..=self.amplitude))
            .collect()
    }

    fn deposit(&mut self, transition: Transition) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(transition);
    }

    fn end_episode(&mut self) {
        self.episodes += 1;
    }

    fn train(&mut self) -> Result<Losses, AgentError> {
        if self.buffer.is_empty() {
            return Err(AgentError::Training("empty replay buffer".into()));
        }
        let batch: Variance = self
            .buffer
            .iter()
            .choose_multiple(&mut self.rng, BATCH)
            .into_iter()
            .map(|t| t.reward)
            .collect();
        // no learner behind this agent; report the sampled batch spread as critic loss
        Ok(Losses { actor: 0.0, critic: batch.error() })
    }

    fn save_checkpoint(&mut self) -> Result<(), AgentError> {
        let Some(dir) = &self.checkpoint_dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        let ckpt = Checkpoint {
            saved_at: Utc::now(),
            episodes: self.episodes,
            transitions: self.buffer.len(),
            mean_reward: self.mean_reward(),
        };
        let path = dir.join("random_agent.json");
        fs::write(&path, serde_json::to_string_pretty(&ckpt)?)?;
        info!("[Agent] checkpoint written to {}", path.display());
        Ok(())
    }

    fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    fn close(&mut self) {
        info!("[Agent] closing with {} transitions after {} episodes", self.buffer.len(), self.episodes);
        self.buffer.clear();
    }
}
