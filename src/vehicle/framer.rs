//! framer.rs
//! Raw telemetry bundle -> fixed-shape observation frame.
//!
//! Each one-second tick of a bundle carries a ragged list of samples per signal. The framer
//! - fills ticks with no samples from the nearest populated tick,
//! - resamples every tick linearly onto `samples_per_unit` points (endpoints aligned),
//! - upsamples gear by repetition to the signal rate,
//! - picks the torque-table window from the peak velocity of the frame.
//!
//! Pure and deterministic: the same bundle always yields the same frame.

use average::Mean;
use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::config::vehicles::VehicleProfile;
use crate::conn::client::{RawSignalBundle, SignalKind};

/// Shape of one observation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub units: usize,
    pub samples_per_unit: usize,
    pub gear_samples_per_unit: usize,
    pub rate_hz: u32,
}

impl FrameGeometry {
    pub fn rows(&self) -> usize {
        self.units * self.samples_per_unit
    }

    /// How often each resampled gear value is repeated to reach the signal rate.
    pub fn gear_repeat(&self) -> usize {
        (self.samples_per_unit / self.gear_samples_per_unit.max(1)).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("shape mismatch in {column}: got {got}, expected {want}")]
    ShapeMismatch { column: &'static str, got: usize, want: usize },

    #[error("unreadable sample {text:?} in {signal} tick {tick}")]
    BadSample { signal: &'static str, tick: usize, text: String },

    #[error("{signal} carried no samples")]
    EmptySignal { signal: &'static str },
}

impl FrameError {
    /// Shape errors mean the interface and the geometry disagree; nothing downstream can
    /// recover from that. Bad or empty data only spoils the one bundle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::ShapeMismatch { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStart {
    pub row: usize,
    /// Velocity was outside the table, or the rule landed past the last window row.
    pub clamped: bool,
}

/// Torque-table row where the flash window starts, from the frame's peak velocity (km/h).
pub fn select_window_start(max_velocity: f64, last_row: usize) -> WindowStart {
    let (row, out_of_range) = if max_velocity < 20.0 {
        (0, false)
    } else if max_velocity < 30.0 {
        (1, false)
    } else if max_velocity < 120.0 {
        (((max_velocity - 30.0) / 10.0).floor() as usize + 2, false)
    } else {
        (last_row, true)
    };
    WindowStart {
        row: row.min(last_row),
        clamped: out_of_range || row > last_row,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationFrame {
    /// Epoch milliseconds of each row.
    pub timestep: Vec<i64>,
    pub velocity: Vec<f64>,
    pub thrust: Vec<f64>,
    pub brake: Vec<f64>,
    pub gear: Vec<f64>,
    pub current: Vec<f64>,
    pub voltage: Vec<f64>,
    pub rate_hz: u32,
    pub window: WindowStart,
}

impl ObservationFrame {
    pub fn len(&self) -> usize {
        self.timestep.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestep.is_empty()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.timestep.first().and_then(|ms| DateTime::from_timestamp_millis(*ms))
    }

    pub fn max_velocity(&self) -> f64 {
        self.velocity.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Electrical work over the window in joules.
    pub fn work_joules(&self) -> f64 {
        let power: f64 = self.current.iter().zip(&self.voltage).map(|(i, u)| i * u).sum();
        power / self.rate_hz.max(1) as f64
    }
}

pub struct Framer {
    geometry: FrameGeometry,
    last_row: usize,
}

impl Framer {
    pub fn new(geometry: FrameGeometry, last_row: usize) -> Self {
        Self { geometry, last_row }
    }

    pub fn for_profile(profile: &VehicleProfile) -> Self {
        Self::new(profile.interface.geometry(), profile.last_window_row())
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn frame(&self, bundle: &RawSignalBundle) -> Result<ObservationFrame, FrameError> {
        let g = &self.geometry;
        let rows = g.rows();
        check_len("timestamps", bundle.ticks(), g.units)?;

        let mut timestep = Vec::with_capacity(rows);
        for (tick, raw) in bundle.timestamps.iter().enumerate() {
            let start: i64 = raw.trim().parse().map_err(|_| FrameError::BadSample {
                signal: "timestamps",
                tick,
                text: raw.clone(),
            })?;
            timestep.extend(
                (0..g.samples_per_unit).map(|j| start + (j as i64 * 1000) / g.rate_hz.max(1) as i64),
            );
        }

        let velocity = self.column(bundle, SignalKind::Velocity, g.samples_per_unit)?;
        let thrust = self.column(bundle, SignalKind::Thrust, g.samples_per_unit)?;
        let brake = self.column(bundle, SignalKind::Brake, g.samples_per_unit)?;
        let current = self.column(bundle, SignalKind::Current, g.samples_per_unit)?;
        let voltage = self.column(bundle, SignalKind::Voltage, g.samples_per_unit)?;

        let repeat = g.gear_repeat();
        let gear: Vec<f64> = self
            .column(bundle, SignalKind::Gear, g.gear_samples_per_unit)?
            .into_iter()
            .flat_map(|v| std::iter::repeat_n(v.round(), repeat))
            .collect();

        check_len("timestep", timestep.len(), rows)?;
        check_len("velocity", velocity.len(), rows)?;
        check_len("thrust", thrust.len(), rows)?;
        check_len("brake", brake.len(), rows)?;
        check_len("gear", gear.len(), rows)?;
        check_len("current", current.len(), rows)?;
        check_len("voltage", voltage.len(), rows)?;

        let mut frame = ObservationFrame {
            timestep,
            velocity,
            thrust,
            brake,
            gear,
            current,
            voltage,
            rate_hz: g.rate_hz,
            window: WindowStart { row: 0, clamped: false },
        };
        let peak = frame.max_velocity();
        frame.window = select_window_start(peak, self.last_row);
        if frame.window.clamped {
            warn!(
                "[Framer] peak velocity {:.1} km/h outside table, window clamped to row {}",
                peak, frame.window.row
            );
        }

        let mean: Mean = frame.velocity.iter().collect();
        debug!(
            "[Framer] {} rows, mean velocity {:.2}, peak {:.2}, window row {}",
            rows,
            mean.mean(),
            peak,
            frame.window.row
        );
        Ok(frame)
    }

    fn column(
        &self,
        bundle: &RawSignalBundle,
        kind: SignalKind,
        points: usize,
    ) -> Result<Vec<f64>, FrameError> {
        let signal = kind.wire_name();
        let ticks = bundle.signal(kind).ok_or(FrameError::EmptySignal { signal })?;
        check_len(signal, ticks.len(), self.geometry.units)?;

        let mut parsed: Vec<Vec<f64>> = Vec::with_capacity(ticks.len());
        for (tick, samples) in ticks.iter().enumerate() {
            let mut values = Vec::with_capacity(samples.len());
            for s in samples {
                match s.value() {
                    Some(v) if v.is_finite() => values.push(v),
                    _ => {
                        return Err(FrameError::BadSample {
                            signal,
                            tick,
                            text: format!("{:?}", s),
                        });
                    }
                }
            }
            parsed.push(values);
        }

        let filled = fill_empty_ticks(parsed).ok_or(FrameError::EmptySignal { signal })?;
        Ok(filled.iter().flat_map(|tick| resample(tick, points)).collect())
    }
}

fn check_len(column: &'static str, got: usize, want: usize) -> Result<(), FrameError> {
    if got == want {
        Ok(())
    } else {
        Err(FrameError::ShapeMismatch { column, got, want })
    }
}

/// Replaces every empty tick with the nearest edge sample of the closest populated tick.
/// Ties go to the earlier tick. `None` if no tick has any sample.
fn fill_empty_ticks(mut ticks: Vec<Vec<f64>>) -> Option<Vec<Vec<f64>>> {
    let populated: Vec<usize> = (0..ticks.len()).filter(|&i| !ticks[i].is_empty()).collect();
    if populated.is_empty() {
        return None;
    }
    for i in 0..ticks.len() {
        if !ticks[i].is_empty() {
            continue;
        }
        let src = populated
            .iter()
            .copied()
            .min_by_key(|&j| (j.abs_diff(i), j))?;
        let edge = if src < i {
            ticks[src].last().copied()
        } else {
            ticks[src].first().copied()
        }?;
        ticks[i] = vec![edge];
    }
    Some(ticks)
}

/// Linear interpolation of `src` onto `n` evenly spaced points, first and last aligned.
fn resample(src: &[f64], n: usize) -> Vec<f64> {
    match (src.len(), n) {
        (_, 0) | (0, _) => Vec::new(),
        (1, _) => vec![src[0]; n],
        (_, 1) => vec![src[0]],
        (m, n) => (0..n)
            .map(|k| {
                let pos = (k * (m - 1)) as f64 / (n - 1) as f64;
                let lo = (pos.floor() as usize).min(m - 1);
                let hi = (lo + 1).min(m - 1);
                let frac = pos - lo as f64;
                src[lo] + (src[hi] - src[lo]) * frac
            })
            .collect(),
    }
}
