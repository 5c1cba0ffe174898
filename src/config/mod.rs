//! Runtime configuration (TOML) and the static vehicle registry.

pub mod vehicles;

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::control::episode::EpisodeSettings;
use crate::vehicle::{interface::InterfaceSettings, listener::HmiSource};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub vehicle: VehicleConfig,
    pub pipeline: PipelineConfig,
    pub hmi: HmiConfig,
    pub transport: TransportConfig,
    pub probe: ProbeConfig,
    pub agent: AgentConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub vid: String,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self { vid: "VB7".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub poll_interval_ms: u64,
    pub retry_backoff_ms: u64,
    pub capture_timeout_margin_s: u64,
    pub observation_capacity: usize,
    pub first_frame_timeout_ms: u64,
    pub step_timeout_ms: u64,
    pub backlog_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            retry_backoff_ms: 500,
            capture_timeout_margin_s: 7,
            observation_capacity: 8,
            first_frame_timeout_ms: 10_000,
            step_timeout_ms: 1_550,
            backlog_limit: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HmiKind {
    Udp,
    Dummy,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HmiConfig {
    pub source: HmiKind,
    pub bind: String,
}

impl Default for HmiConfig {
    fn default() -> Self {
        Self { source: HmiKind::Dummy, bind: "127.0.0.1:8002".into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashKind {
    Loopback,
    Tbox,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub flash: FlashKind,
    /// Root of a T-Box simulator checkout, used when `flash = "tbox"`.
    pub tbox_root: PathBuf,
    pub diff_flash: bool,
    pub diff_timeout_ms: u64,
    pub full_timeout_ms: u64,
    pub seed: u64,
    /// Run captures as fast as possible instead of in real time.
    pub unpaced: bool,
    pub fault_rate: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            flash: FlashKind::Loopback,
            tbox_root: PathBuf::from("tbox-simulator"),
            diff_flash: false,
            diff_timeout_ms: 3_000,
            full_timeout_ms: 5_000,
            seed: 0,
            unpaced: false,
            fault_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Ping,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub kind: ProbeKind,
    /// Host for `ping`, `host:port` for `tcp`.
    pub target: String,
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { kind: ProbeKind::Ping, target: "127.0.0.1".into(), timeout_ms: 1_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub infer_mode: bool,
    pub train_rounds: u32,
    pub seed: u64,
    pub exploration_nm: f32,
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            infer_mode: false,
            train_rounds: 6,
            seed: 0,
            exploration_nm: 20.0,
            checkpoint_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    pub episode_log: Option<PathBuf>,
    pub health_bind: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            episode_log: Some(PathBuf::from("data/episodes.csv")),
            health_bind: Some("127.0.0.1:8080".into()),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        ensure!(p.poll_interval_ms > 0, "pipeline.poll_interval_ms must be positive");
        ensure!(p.observation_capacity > p.backlog_limit,
            "pipeline.observation_capacity ({}) must exceed backlog_limit ({})",
            p.observation_capacity, p.backlog_limit);
        ensure!(p.step_timeout_ms > 0, "pipeline.step_timeout_ms must be positive");
        ensure!((0.0..=1.0).contains(&self.transport.fault_rate),
            "transport.fault_rate must be within [0, 1]");
        ensure!(self.agent.exploration_nm.is_finite(), "agent.exploration_nm must be finite");
        if self.hmi.source == HmiKind::Udp {
            self.hmi_bind()?;
        }
        if let Some(bind) = &self.output.health_bind {
            bind.parse::<SocketAddr>()
                .with_context(|| format!("output.health_bind {bind:?} is not a socket address"))?;
        }
        if self.probe.kind == ProbeKind::Tcp && !self.probe.target.contains(':') {
            bail!("probe.target {:?} needs host:port for the tcp probe", self.probe.target);
        }
        Ok(())
    }

    fn hmi_bind(&self) -> Result<SocketAddr> {
        self.hmi
            .bind
            .parse()
            .with_context(|| format!("hmi.bind {:?} is not a socket address", self.hmi.bind))
    }

    pub fn hmi_source(&self) -> Result<HmiSource> {
        Ok(match self.hmi.source {
            HmiKind::Udp => HmiSource::Udp { bind: self.hmi_bind()? },
            HmiKind::Dummy => HmiSource::Dummy,
        })
    }

    pub fn interface_settings(&self) -> InterfaceSettings {
        let p = &self.pipeline;
        InterfaceSettings {
            poll: Duration::from_millis(p.poll_interval_ms),
            retry_backoff: Duration::from_millis(p.retry_backoff_ms),
            capture_timeout_margin: Duration::from_secs(p.capture_timeout_margin_s),
            observation_capacity: p.observation_capacity,
        }
    }

    pub fn episode_settings(&self) -> EpisodeSettings {
        let p = &self.pipeline;
        EpisodeSettings {
            first_frame_timeout: Duration::from_millis(p.first_frame_timeout_ms),
            step_timeout: Duration::from_millis(p.step_timeout_ms),
            backlog_limit: p.backlog_limit,
            train_rounds: self.agent.train_rounds,
            infer_mode: self.agent.infer_mode,
            poll: Duration::from_millis(p.poll_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        config.validate().unwrap();
        assert_eq!(config.episode_settings(), EpisodeSettings::default());
        assert_eq!(config.interface_settings(), InterfaceSettings::default());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [vehicle]
            vid = "M2"

            [hmi]
            source = "udp"
            bind = "0.0.0.0:9000"

            [agent]
            infer_mode = true
            "#,
        )
        .unwrap();
        assert_eq!(config.vehicle.vid, "M2");
        assert_eq!(config.agent.train_rounds, 6);
        assert!(config.agent.infer_mode);
        assert_eq!(
            config.hmi_source().unwrap(),
            HmiSource::Udp { bind: "0.0.0.0:9000".parse().unwrap() }
        );
    }

    #[test]
    fn test_validation_catches_bad_values() {
        let mut config = AppConfig::default();
        config.pipeline.observation_capacity = 2;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.hmi.source = HmiKind::Udp;
        config.hmi.bind = "localhost".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[pipeline\npoll_interval_ms = 1").unwrap();
        let err = AppConfig::load(&path).unwrap_err();
        assert!(format!("{err}").contains("bad.toml"));
    }
}
