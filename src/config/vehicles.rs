//! vehicles.rs
//! Static vehicle profiles: identity, calibration-table axes and interface timing.
//!
//! The registry is built once at startup and only ever read afterwards. Interface
//! specific sampling constants travel as data on [`InterfaceKind`], so a profile
//! carries exactly the timing of the interface it was built for.

use std::time::Duration;

use serde::Serialize;

use crate::vehicle::framer::FrameGeometry;

/// Pedal opening axis of the torque table (fraction of full travel).
pub const PEDAL_SCALES: [f32; 17] = [
    0.0, 0.02, 0.04, 0.08, 0.12, 0.16, 0.20, 0.24, 0.28, 0.32, 0.38, 0.44, 0.50, 0.62, 0.74,
    0.86, 1.0,
];

/// Speed axis (km/h) for VB and MP maturity vehicles.
pub const SPEED_SCALES_VB: [f32; 14] = [
    0.0, 7.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0, 110.0, 120.0,
];

/// Speed axis (km/h) for mule vehicles.
pub const SPEED_SCALES_MULE: [f32; 21] = [
    0.0, 7.0, 10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 40.0, 45.0, 50.0, 55.0, 60.0, 65.0, 70.0,
    75.0, 80.0, 85.0, 90.0, 95.0, 100.0,
];

const DEFAULT_ROWS_TO_FLASH: usize = 4;
const DEFAULT_TORQUE_BUDGET_NM: f32 = 250.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Maturity {
    Mule,
    Vb,
    Mp,
}

/// Sampling constants of the remote T-Box (cloud) interface, fixed by the remote CAN service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TboxTiming {
    pub signal_frequency: u32,
    pub gear_frequency: u32,
    pub unit_duration: u32,
    pub unit_number: u32,
}

impl Default for TboxTiming {
    fn default() -> Self {
        Self {
            signal_frequency: 50,
            gear_frequency: 2,
            unit_duration: 1,
            unit_number: 4,
        }
    }
}

/// Sampling constants of the local Kvaser (field) interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KvaserTiming {
    pub observation_number: u32,
    pub observation_frequency: u32,
    pub countdown: u32,
}

impl Default for KvaserTiming {
    fn default() -> Self {
        Self {
            observation_number: 30,
            observation_frequency: 20,
            countdown: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InterfaceKind {
    Cloud(TboxTiming),
    Field(KvaserTiming),
}

impl InterfaceKind {
    pub fn name(&self) -> &'static str {
        match self {
            InterfaceKind::Cloud(_) => "cloud",
            InterfaceKind::Field(_) => "kvaser",
        }
    }

    /// Shape of one observation window for this interface.
    pub fn geometry(&self) -> FrameGeometry {
        match self {
            InterfaceKind::Cloud(t) => FrameGeometry {
                units: t.unit_number as usize,
                samples_per_unit: (t.unit_duration * t.signal_frequency) as usize,
                gear_samples_per_unit: (t.unit_duration * t.gear_frequency) as usize,
                rate_hz: t.signal_frequency,
            },
            // the local bus delivers gear at full rate, one unit per window
            InterfaceKind::Field(k) => FrameGeometry {
                units: 1,
                samples_per_unit: k.observation_number as usize,
                gear_samples_per_unit: k.observation_number as usize,
                rate_hz: k.observation_frequency,
            },
        }
    }

    /// Wall-clock span covered by a single `get_signals` call.
    pub fn capture_duration(&self) -> Duration {
        match self {
            InterfaceKind::Cloud(t) => Duration::from_secs((t.unit_number * t.unit_duration) as u64),
            InterfaceKind::Field(k) => {
                Duration::from_secs_f64(k.observation_number as f64 / k.observation_frequency as f64)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VehicleProfile {
    pub vid: String,
    pub vin: String,
    pub plate: String,
    pub maturity: Maturity,
    pub interface: InterfaceKind,
    pub pedal_scale: Vec<f32>,
    pub speed_scale: Vec<f32>,
    pub rows_to_flash: usize,
    pub torque_budget: f32,
}

impl VehicleProfile {
    pub fn new(vid: &str, vin: &str, plate: &str, maturity: Maturity, interface: InterfaceKind) -> Self {
        let speed_scale = match maturity {
            Maturity::Mule => SPEED_SCALES_MULE.to_vec(),
            Maturity::Vb | Maturity::Mp => SPEED_SCALES_VB.to_vec(),
        };
        Self {
            vid: vid.to_string(),
            vin: vin.to_string(),
            plate: plate.to_string(),
            maturity,
            interface,
            pedal_scale: PEDAL_SCALES.to_vec(),
            speed_scale,
            rows_to_flash: DEFAULT_ROWS_TO_FLASH,
            torque_budget: DEFAULT_TORQUE_BUDGET_NM,
        }
    }

    pub fn table_rows(&self) -> usize {
        self.speed_scale.len()
    }

    pub fn table_cols(&self) -> usize {
        self.pedal_scale.len()
    }

    /// Number of torque cells written per flash (rows_to_flash × pedal columns).
    pub fn flash_numel(&self) -> usize {
        self.rows_to_flash * self.table_cols()
    }

    /// Highest row a flash window may start at while still fitting inside the table.
    pub fn last_window_row(&self) -> usize {
        self.table_rows().saturating_sub(self.rows_to_flash)
    }
}

/// Read-only set of known vehicles.
#[derive(Debug, Clone)]
pub struct VehicleRegistry {
    profiles: Vec<VehicleProfile>,
}

impl VehicleRegistry {
    pub fn builtin() -> Self {
        let cloud = InterfaceKind::Cloud(TboxTiming::default());
        let field = InterfaceKind::Field(KvaserTiming::default());
        Self {
            profiles: vec![
                VehicleProfile::new("default", "", "", Maturity::Vb, cloud),
                VehicleProfile::new("MP73", "HMZABAAH4NF003873", "AB82511", Maturity::Mp, cloud),
                VehicleProfile::new("MP74", "HMZABAAH4MF018274", "EDY8203", Maturity::Mp, cloud),
                VehicleProfile::new("MP02", "HMZABAAH1NF004902", "ABD9968", Maturity::Mp, cloud),
                VehicleProfile::new("VB7", "HMZABAAH7MF011058", "AD06158", Maturity::Vb, cloud),
                VehicleProfile::new("VB7F", "HMZABAAH7MF011058", "AD06158", Maturity::Vb, field),
                VehicleProfile::new("M2", "HMZABAAH2MF000001", "", Maturity::Mule, field),
            ],
        }
    }

    pub fn from_profiles(profiles: Vec<VehicleProfile>) -> Self {
        Self { profiles }
    }

    pub fn by_vid(&self, vid: &str) -> Option<&VehicleProfile> {
        self.profiles.iter().find(|p| p.vid == vid)
    }

    pub fn by_vin(&self, vin: &str) -> Option<&VehicleProfile> {
        self.profiles.iter().find(|p| !p.vin.is_empty() && p.vin == vin)
    }

    pub fn vids(&self) -> impl Iterator<Item = &str> {
        self.profiles.iter().map(|p| p.vid.as_str())
    }
}
