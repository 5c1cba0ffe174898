//! episode.rs
//! Episode / flash loop: frames in, agent decisions out, one flash at a time.
//!
//! Steps alternate between two half-steps:
//! - **active**: deposit the previous transition, infer, hand the table to the flash
//!   worker and block until the flash attempt completes;
//! - **dummy**: only account the frame's electrical work and let the filter resume.
//!
//! The dummy half-step skips the frame that straddles the flash, so every deposited
//! transition pairs an action with a frame observed entirely under that action.
//!
//! An episode that ends while a table is still with the flash worker is not closed until
//! that flash reports back; the next episode never sees its completion.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::vehicles::VehicleProfile;
use crate::control::{
    agent::{Agent, AgentError, AgentState, Transition},
    exit::ExitToken,
    state::State,
    table::{ActionShapeError, ActuationTable},
};
use crate::utils::episode_log::{EpisodeLog, EpisodeRow};
use crate::vehicle::{
    channel::{ChannelError, Rejected},
    filter::Resume,
    flasher::FlashOutcome,
    framer::ObservationFrame,
    interface::EpisodeLink,
};

const RUNNING_REWARD_ALPHA: f64 = 0.05;

#[derive(Debug, thiserror::Error)]
pub enum EpisodeError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Action(#[from] ActionShapeError),
    #[error("episode log: {0}")]
    Log(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpisodeSettings {
    pub first_frame_timeout: Duration,
    pub step_timeout: Duration,
    /// More queued frames than this means the loop fell behind; the episode is interrupted.
    pub backlog_limit: usize,
    pub train_rounds: u32,
    pub infer_mode: bool,
    pub poll: Duration,
}

impl Default for EpisodeSettings {
    fn default() -> Self {
        Self {
            first_frame_timeout: Duration::from_secs(10),
            step_timeout: Duration::from_millis(1550),
            backlog_limit: 2,
            train_rounds: 6,
            infer_mode: false,
            poll: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Valid,
    Interrupted,
}

impl Outcome {
    fn name(self) -> &'static str {
        match self {
            Outcome::Valid => "valid",
            Outcome::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeSummary {
    pub episode: u64,
    pub outcome: Outcome,
    pub steps: u32,
    pub episode_reward: f64,
    pub running_reward: f64,
}

/// How an inner wait ended when it did not produce a value.
enum Wake {
    Exit,
    Left,
}

pub struct EpisodeLoop<A: Agent> {
    agent: A,
    profile: VehicleProfile,
    link: EpisodeLink,
    exit: ExitToken,
    settings: EpisodeSettings,
    log: Option<EpisodeLog>,
    running_reward: f64,
    episodes: u64,
    history: Vec<EpisodeSummary>,
    /// A table was handed to the flash worker and its outcome has not been received.
    in_flight: bool,
}

impl<A: Agent> EpisodeLoop<A> {
    pub fn new(
        agent: A,
        profile: VehicleProfile,
        link: EpisodeLink,
        exit: ExitToken,
        settings: EpisodeSettings,
    ) -> Self {
        Self {
            agent,
            profile,
            link,
            exit,
            settings,
            log: None,
            running_reward: 0.0,
            episodes: 0,
            history: Vec::new(),
            in_flight: false,
        }
    }

    pub fn with_log(mut self, log: EpisodeLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn history(&self) -> &[EpisodeSummary] {
        &self.history
    }

    /// Runs episodes until exit, then closes the agent's experience buffer.
    pub fn run(&mut self) -> Result<(), EpisodeError> {
        info!("[Episode] loop ready for {}", self.profile.vid);
        let result = self.run_episodes();
        self.agent.close();
        info!("[Episode] loop finished after {} episodes", self.episodes);
        result
    }

    fn run_episodes(&mut self) -> Result<(), EpisodeError> {
        while !self.exit.is_set() {
            match self.link.state.get() {
                State::Running => {}
                State::Exit => break,
                State::Stopped | State::Interrupted => {
                    // ended before a first frame ever arrived
                    self.finish_boundary();
                    continue;
                }
                State::Idle => {
                    self.exit.sleep(self.settings.poll);
                    continue;
                }
            }

            let first = match self.first_frame() {
                Ok(f) => f,
                Err(Wake::Exit) => break,
                Err(Wake::Left) => continue,
            };
            self.run_episode(first)?;
        }
        Ok(())
    }

    fn finish_boundary(&mut self) {
        if self.in_flight {
            info!("[Episode] waiting for the outstanding flash before closing the episode");
            self.settle_flash();
        }
        let stale = self.link.frames.drain();
        self.link.flash_done.drain();
        if stale > 0 {
            debug!("[Episode] dropped {} stale frames", stale);
        }
        self.link.state.reset();
    }

    /// Blocks until the flash worker reports on the table it already holds.
    fn settle_flash(&mut self) {
        loop {
            match self.link.flash_done.wait(self.settings.poll) {
                Ok(outcome) => {
                    debug!("[Episode] outstanding flash finished: {:?}", outcome);
                    break;
                }
                Err(ChannelError::Closed) => break,
                Err(_) => {
                    if self.exit.is_set() {
                        break;
                    }
                }
            }
        }
        self.in_flight = false;
    }

    fn first_frame(&self) -> Result<ObservationFrame, Wake> {
        let mut deadline = Instant::now() + self.settings.first_frame_timeout;
        loop {
            if self.exit.is_set() {
                return Err(Wake::Exit);
            }
            if !self.link.state.is_running() {
                return Err(Wake::Left);
            }
            match self.link.frames.get(self.settings.poll) {
                Ok(f) => return Ok(f),
                Err(ChannelError::Closed) => return Err(Wake::Exit),
                Err(_) => {
                    if Instant::now() >= deadline {
                        info!(
                            "[Episode] no first frame within {:?}, still waiting",
                            self.settings.first_frame_timeout
                        );
                        deadline = Instant::now() + self.settings.first_frame_timeout;
                    }
                }
            }
        }
    }

    fn run_episode(&mut self, first: ObservationFrame) -> Result<(), EpisodeError> {
        let started_at = first.started_at();
        self.agent.start_episode(started_at);
        self.link.resume.raise(Resume::Continue);
        info!("[Episode] episode {} begins at {:?}", self.episodes + 1, started_at);

        let mut prev_state = AgentState::from(&first);
        let mut prev_action = vec![0.0f32; self.profile.flash_numel()];
        let mut episode_reward = 0.0;
        let mut step_reward = 0.0;
        let mut flashed = false;
        let mut steps: u32 = 0;

        let outcome = loop {
            if self.exit.is_set() {
                return Ok(());
            }
            match self.link.state.get() {
                State::Running => {}
                State::Stopped => break Outcome::Valid,
                State::Interrupted => break Outcome::Interrupted,
                State::Idle | State::Exit => return Ok(()),
            }

            let queued = self.link.frames.len();
            if queued > self.settings.backlog_limit {
                warn!("[Episode] {} frames queued, interrupting episode", queued);
                self.link.state.interrupt();
                continue;
            }

            let frame = match self.link.frames.get(self.settings.step_timeout) {
                Ok(f) => f,
                Err(ChannelError::Closed) => return Ok(()),
                Err(_) => continue,
            };
            let work = frame.work_joules();
            episode_reward += work;

            if flashed {
                // dummy half-step
                step_reward = work;
                flashed = false;
                self.link.resume.raise(Resume::Continue);
                continue;
            }

            step_reward += work;
            let state = AgentState::from(&frame);
            self.agent.deposit(Transition {
                state: prev_state,
                action: prev_action.clone(),
                reward: step_reward,
                next_state: state.clone(),
            });

            let action = self.agent.infer(&state);
            let table = ActuationTable::from_action(&action, frame.window.row, &self.profile)?;
            let realized = match self.flash(table) {
                Some(FlashOutcome::Flashed) => action,
                Some(FlashOutcome::Failed) => prev_action.clone(),
                None => {
                    // left running mid-flash; the next state check ends the episode
                    prev_action.clone()
                }
            };

            steps += 1;
            debug!(
                "[Episode] step {} row {} reward {:.1} J",
                steps, frame.window.row, step_reward
            );
            prev_action = realized;
            prev_state = state;
            step_reward = 0.0;
            flashed = true;
        };

        self.finish_episode(outcome, started_at, steps, episode_reward)?;
        self.finish_boundary();
        Ok(())
    }

    /// Hands `table` to the flash worker and waits for the attempt to finish.
    /// `None` if the episode stopped running first.
    fn flash(&mut self, mut table: ActuationTable) -> Option<FlashOutcome> {
        loop {
            match self.link.tables.put_timeout(table, self.settings.poll) {
                Ok(()) => break,
                Err(Rejected { item, reason: ChannelError::Timeout }) => {
                    if self.exit.is_set() {
                        return None;
                    }
                    table = item;
                }
                Err(_) => return None,
            }
        }
        self.in_flight = true;
        loop {
            match self.link.flash_done.wait(self.settings.poll) {
                Ok(outcome) => {
                    self.in_flight = false;
                    return Some(outcome);
                }
                Err(ChannelError::Closed) => {
                    self.in_flight = false;
                    return None;
                }
                Err(_) => {
                    if self.exit.is_set() || !self.link.state.is_running() {
                        return None;
                    }
                }
            }
        }
    }

    fn finish_episode(
        &mut self,
        outcome: Outcome,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        steps: u32,
        episode_reward: f64,
    ) -> Result<(), EpisodeError> {
        self.episodes += 1;
        match outcome {
            Outcome::Valid => {
                self.agent.end_episode();
                self.running_reward = RUNNING_REWARD_ALPHA * (-episode_reward)
                    + (1.0 - RUNNING_REWARD_ALPHA) * self.running_reward;
                if !self.settings.infer_mode && self.agent.buffer_len() > 0 {
                    for round in 0..self.settings.train_rounds {
                        let losses = self.agent.train()?;
                        debug!(
                            "[Episode] train round {} actor {:.4} critic {:.4}",
                            round + 1,
                            losses.actor,
                            losses.critic
                        );
                    }
                    self.agent.save_checkpoint()?;
                }
                info!(
                    "[Episode] episode {} done: {} steps, reward {:.1} J, running {:.1}",
                    self.episodes, steps, episode_reward, self.running_reward
                );
            }
            Outcome::Interrupted => {
                info!(
                    "[Episode] episode {} interrupted after {} steps, discarded",
                    self.episodes, steps
                );
            }
        }

        let summary = EpisodeSummary {
            episode: self.episodes,
            outcome,
            steps,
            episode_reward,
            running_reward: self.running_reward,
        };
        if let Some(log) = self.log.as_mut() {
            let counters = self.link.status.snapshot();
            log.record(&EpisodeRow {
                episode: summary.episode,
                started_at: started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                outcome: outcome.name(),
                steps,
                episode_reward,
                running_reward: self.running_reward,
                capture_failures: counters.capture_failures,
                flash_failures: counters.flash_failures,
            })?;
        }
        self.history.push(summary);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::vehicles::VehicleRegistry;
    use crate::conn::RawSignalBundle;
    use crate::control::{
        agent::Losses,
        state::{ControlSignal, ControlState},
    };
    use crate::vehicle::{
        channel::{OrderedSender, SignalSender, fresh, ordered, signal},
        framer::WindowStart,
        interface::PipelineStatus,
        watchdog::Watchdog,
    };
    use chrono::{DateTime, Utc};
    use std::thread;

    #[derive(Default)]
    struct TapeAgent {
        numel: usize,
        deposits: Vec<Transition>,
        trained: u32,
    }

    impl Agent for TapeAgent {
        fn start_episode(&mut self, _at: Option<DateTime<Utc>>) {}
        fn infer(&mut self, _state: &AgentState) -> Vec<f32> {
            vec![1.0; self.numel]
        }
        fn deposit(&mut self, transition: Transition) {
            self.deposits.push(transition);
        }
        fn end_episode(&mut self) {}
        fn train(&mut self) -> Result<Losses, AgentError> {
            self.trained += 1;
            Ok(Losses::default())
        }
        fn save_checkpoint(&mut self) -> Result<(), AgentError> {
            Ok(())
        }
        fn buffer_len(&self) -> usize {
            self.deposits.len()
        }
        fn close(&mut self) {}
    }

    /// 30 rows at 20 Hz and 400 V: work is `600 * amps` joules.
    fn frame(amps: f64) -> ObservationFrame {
        ObservationFrame {
            timestep: (0..30).map(|i| 1_700_000_000_000 + i * 50).collect(),
            velocity: vec![15.0; 30],
            thrust: vec![0.1; 30],
            brake: vec![0.0; 30],
            gear: vec![2.0; 30],
            current: vec![amps; 30],
            voltage: vec![400.0; 30],
            rate_hz: 20,
            window: WindowStart { row: 0, clamped: false },
        }
    }

    struct Harness {
        frames: OrderedSender<ObservationFrame>,
        state: ControlState,
        exit: ExitToken,
        flasher: thread::JoinHandle<usize>,
        episode_loop: EpisodeLoop<TapeAgent>,
    }

    /// Wires a loop to an in-test flash worker that answers each table with the next
    /// scripted outcome after `delay`.
    fn harness(outcomes: Vec<FlashOutcome>, delay: Duration) -> Harness {
        let profile = VehicleRegistry::builtin().by_vid("M2").cloned().unwrap();
        let (frames_tx, frames_rx) = ordered(8);
        let (tables_tx, tables_rx) = ordered::<ActuationTable>(1);
        let (done_tx, done_rx): (SignalSender<FlashOutcome>, _) = signal();
        let (resume_tx, _resume_rx) = signal();
        let (_raw_tx, raw_rx) = fresh::<RawSignalBundle>();
        let state = ControlState::new();
        let exit = ExitToken::new();
        let link = EpisodeLink {
            frames: frames_rx,
            tables: tables_tx,
            flash_done: done_rx,
            resume: resume_tx,
            state: state.clone(),
            status: PipelineStatus::new(state.clone(), Watchdog::new(), raw_rx.overwrite_counter()),
        };
        let flasher = thread::spawn(move || {
            let mut answered = 0;
            for outcome in outcomes {
                if tables_rx.get(Duration::from_secs(5)).is_err() {
                    break;
                }
                thread::sleep(delay);
                done_tx.raise(outcome);
                answered += 1;
            }
            answered
        });
        let settings = EpisodeSettings {
            first_frame_timeout: Duration::from_millis(200),
            step_timeout: Duration::from_millis(20),
            backlog_limit: 8,
            poll: Duration::from_millis(5),
            ..EpisodeSettings::default()
        };
        let agent = TapeAgent { numel: profile.flash_numel(), ..Default::default() };
        Harness {
            frames: frames_tx,
            state,
            exit: exit.clone(),
            flasher,
            episode_loop: EpisodeLoop::new(agent, profile, link, exit, settings),
        }
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn run_in_background(
        mut episode_loop: EpisodeLoop<TapeAgent>,
    ) -> thread::JoinHandle<(EpisodeLoop<TapeAgent>, Result<(), EpisodeError>)> {
        thread::spawn(move || {
            let result = episode_loop.run();
            (episode_loop, result)
        })
    }

    #[test]
    fn test_episode_reward_counts_trailing_dummy_frame() {
        let h = harness(vec![FlashOutcome::Flashed], Duration::ZERO);
        // first frame, active half-step, dummy half-step
        for amps in [1.0, 2.0, 3.0] {
            h.frames.put(frame(amps)).unwrap();
        }
        h.state.apply(ControlSignal::Begin).unwrap();
        let runner = run_in_background(h.episode_loop);

        wait_until("dummy frame consumed", || h.frames.is_empty());
        assert_eq!(h.flasher.join().unwrap(), 1);
        h.state.apply(ControlSignal::EndValid).unwrap();
        wait_until("episode closed", || h.state.get() == State::Idle);
        h.exit.trigger();

        let (episode_loop, result) = runner.join().unwrap();
        assert!(result.is_ok());
        let summary = &episode_loop.history()[0];
        assert_eq!(summary.outcome, Outcome::Valid);
        assert_eq!(summary.steps, 1);
        assert_eq!(summary.episode_reward, 1200.0 + 1800.0);
        assert_eq!(summary.running_reward, 0.05 * -3000.0);
    }

    #[test]
    fn test_failed_flash_keeps_previous_action() {
        let h = harness(vec![FlashOutcome::Failed, FlashOutcome::Flashed], Duration::ZERO);
        // first, active, dummy, active
        for amps in [1.0, 2.0, 3.0, 4.0] {
            h.frames.put(frame(amps)).unwrap();
        }
        h.state.apply(ControlSignal::Begin).unwrap();
        let runner = run_in_background(h.episode_loop);

        assert_eq!(h.flasher.join().unwrap(), 2);
        h.state.apply(ControlSignal::EndValid).unwrap();
        wait_until("episode closed", || h.state.get() == State::Idle);
        h.exit.trigger();

        let (episode_loop, _) = runner.join().unwrap();
        let deposits = &episode_loop.agent().deposits;
        assert_eq!(deposits.len(), 2);
        assert!(deposits[0].action.iter().all(|v| *v == 0.0));
        assert_eq!(deposits[0].reward, 1200.0);
        // the first table never reached the vehicle
        assert!(deposits[1].action.iter().all(|v| *v == 0.0));
        assert_eq!(deposits[1].reward, 1800.0 + 2400.0);
        assert_eq!(episode_loop.agent().trained, 6);
    }

    #[test]
    fn test_episode_ended_mid_flash_waits_for_the_flash() {
        let h = harness(vec![FlashOutcome::Flashed], Duration::from_millis(200));
        for amps in [1.0, 2.0] {
            h.frames.put(frame(amps)).unwrap();
        }
        h.state.apply(ControlSignal::Begin).unwrap();
        let runner = run_in_background(h.episode_loop);

        wait_until("table handed over", || h.frames.is_empty());
        thread::sleep(Duration::from_millis(20));
        h.state.apply(ControlSignal::EndValid).unwrap();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(h.state.get(), State::Stopped);

        assert_eq!(h.flasher.join().unwrap(), 1);
        wait_until("episode closed", || h.state.get() == State::Idle);
        h.exit.trigger();
        let (episode_loop, result) = runner.join().unwrap();
        assert!(result.is_ok());
        assert_eq!(episode_loop.history()[0].steps, 1);
        // the completion was consumed by the boundary, not left for the next episode
        assert!(!episode_loop.link.flash_done.drain());
    }
}
