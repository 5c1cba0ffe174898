//! sim.rs
//! Simulated vehicle behind the Protocol Client seam.
//!
//! Produces bundles in the remote CAN service shape (ragged ticks, numeric and string
//! samples mixed) from a random-walk drive cycle, and accepts actuation tables either in
//! memory or through the T-Box simulator transport.

use std::time::Duration;

use chrono::Utc;
use log::{debug, info};
use rand::{Rng, SeedableRng, rngs::StdRng};
use spin_sleep::{SpinSleeper, SpinStrategy};

use crate::conn::{
    client::{ProtocolClient, RawSignalBundle, Sample, SignalKind},
    error::{ErrorCode, ProtocolError},
    tbox::TboxFlasher,
};
use crate::control::table::ActuationTable;
use crate::vehicle::framer::FrameGeometry;

const MAX_SPEED_KMH: f64 = 130.0;
const PACK_VOLTAGE: f64 = 380.0;

pub enum FlashBackend {
    /// Keep the last table in memory.
    Loopback,
    Tbox(TboxFlasher),
}

pub struct SimVehicle {
    geometry: FrameGeometry,
    rng: StdRng,
    speed: f64,
    gear: f64,
    pace: bool,
    fault_rate: f64,
    backend: FlashBackend,
    flashed: u64,
    last_table: Option<ActuationTable>,
}

impl SimVehicle {
    pub fn new(geometry: FrameGeometry, seed: u64, backend: FlashBackend) -> Self {
        Self {
            geometry,
            rng: StdRng::seed_from_u64(seed),
            speed: 0.0,
            gear: 1.0,
            pace: true,
            fault_rate: 0.0,
            backend,
            flashed: 0,
            last_table: None,
        }
    }

    /// Return immediately instead of taking `duration` of wall-clock time per capture.
    pub fn unpaced(mut self) -> Self {
        self.pace = false;
        self
    }

    /// Probability that a call fails with a recoverable network error.
    pub fn with_fault_rate(mut self, p: f64) -> Self {
        self.fault_rate = p.clamp(0.0, 1.0);
        self
    }

    pub fn flashed(&self) -> u64 {
        self.flashed
    }

    pub fn last_table(&self) -> Option<&ActuationTable> {
        self.last_table.as_ref()
    }

    fn maybe_fault(&mut self, what: &str) -> Result<(), ProtocolError> {
        if self.fault_rate > 0.0 && self.rng.random_bool(self.fault_rate) {
            return Err(ProtocolError::connection(
                ErrorCode::NetworkUnknown,
                format!("simulated {what} dropout"),
            ));
        }
        Ok(())
    }

    fn drive_tick(&mut self) -> [Vec<Sample>; 6] {
        let n = self.geometry.samples_per_unit;
        // ragged like the real service: a few samples more or less per tick
        let count = (n as i64 + self.rng.random_range(-3..=3)).max(1) as usize;

        let mut velocity = Vec::with_capacity(count);
        let mut thrust = Vec::with_capacity(count);
        let mut brake = Vec::with_capacity(count);
        let mut current = Vec::with_capacity(count);
        let mut voltage = Vec::with_capacity(count);
        for _ in 0..count {
            let pedal: f64 = self.rng.random_range(0.0..0.6);
            let braking = self.rng.random_bool(0.1);
            let accel = if braking { -1.5 } else { pedal * 1.2 - 0.25 };
            self.speed = (self.speed + accel).clamp(0.0, MAX_SPEED_KMH);

            velocity.push(Sample::Num(self.speed));
            thrust.push(Sample::Num(if braking { 0.0 } else { pedal }));
            brake.push(Sample::Num(if braking { self.rng.random_range(5.0..40.0) } else { 0.0 }));
            let amps = pedal * 200.0 + self.rng.random_range(-2.0..2.0);
            current.push(Sample::Num(amps));
            // the service sometimes stringifies voltage
            let volts = PACK_VOLTAGE - amps * 0.05;
            voltage.push(Sample::Text(format!("{volts:.2}")));
        }

        self.gear = (self.speed / 25.0).floor().clamp(0.0, 5.0) + 1.0;
        let gears = (0..self.geometry.gear_samples_per_unit)
            .map(|_| Sample::Text(format!("{}", self.gear as u8)))
            .collect();
        [velocity, thrust, brake, gears, current, voltage]
    }
}

impl ProtocolClient for SimVehicle {
    fn get_signals(
        &mut self,
        duration: Duration,
        timeout: Duration,
    ) -> Result<RawSignalBundle, ProtocolError> {
        if duration > timeout {
            return Err(ProtocolError::timeout(
                ErrorCode::NetworkUnknown,
                format!("capture of {duration:?} cannot finish within {timeout:?}"),
            ));
        }
        if self.pace {
            SpinSleeper::new(100_000)
                .with_spin_strategy(SpinStrategy::YieldThread)
                .sleep(duration);
        }
        self.maybe_fault("capture")?;

        let units = self.geometry.units;
        let end_ms = Utc::now().timestamp_millis();
        let mut columns: [Vec<Vec<Sample>>; 6] = Default::default();
        let mut timestamps = Vec::with_capacity(units);
        for u in 0..units {
            timestamps.push((end_ms - ((units - u) as i64) * 1000).to_string());
            for (col, tick) in columns.iter_mut().zip(self.drive_tick()) {
                col.push(tick);
            }
        }

        let mut bundle = RawSignalBundle { timestamps, ..Default::default() };
        for (kind, col) in SignalKind::ALL.into_iter().zip(columns) {
            bundle = bundle.with_signal(kind, col);
        }
        debug!("[Sim] captured {} ticks, speed now {:.1} km/h", units, self.speed);
        Ok(bundle)
    }

    fn send_actuation(&mut self, table: ActuationTable) -> Result<(), ProtocolError> {
        self.maybe_fault("flash")?;
        if let FlashBackend::Tbox(flasher) = &self.backend {
            flasher.send_table(&table)?;
        }
        self.flashed += 1;
        info!(
            "[Sim] flash #{} accepted at row {} ({} cells)",
            self.flashed,
            table.start_row,
            table.values().len()
        );
        self.last_table = Some(table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::vehicles::VehicleRegistry;
    use crate::vehicle::framer::Framer;

    #[test]
    fn test_sim_bundles_frame_cleanly() {
        let reg = VehicleRegistry::builtin();
        let vb7 = reg.by_vid("VB7").unwrap();
        let mut sim = SimVehicle::new(vb7.interface.geometry(), 7, FlashBackend::Loopback).unpaced();
        let framer = Framer::for_profile(vb7);
        for _ in 0..5 {
            let bundle = sim.get_signals(Duration::from_secs(4), Duration::from_secs(11)).unwrap();
            let frame = framer.frame(&bundle).unwrap();
            assert_eq!(frame.len(), 200);
            assert!(frame.window.row <= vb7.last_window_row());
            assert!(frame.gear.iter().all(|g| (1.0..=6.0).contains(g)));
        }
    }

    #[test]
    fn test_capture_longer_than_timeout_is_recoverable() {
        let reg = VehicleRegistry::builtin();
        let vb7 = reg.by_vid("VB7").unwrap();
        let mut sim = SimVehicle::new(vb7.interface.geometry(), 1, FlashBackend::Loopback).unpaced();
        let err = sim.get_signals(Duration::from_secs(4), Duration::from_secs(2)).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_loopback_keeps_last_table() {
        let reg = VehicleRegistry::builtin();
        let vb7 = reg.by_vid("VB7").unwrap();
        let mut sim = SimVehicle::new(vb7.interface.geometry(), 1, FlashBackend::Loopback);
        sim.send_actuation(ActuationTable::zeros(2, vb7)).unwrap();
        assert_eq!(sim.flashed(), 1);
        assert_eq!(sim.last_table().map(|t| t.start_row), Some(2));
    }
}
