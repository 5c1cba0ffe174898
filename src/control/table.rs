//! table.rs
//! Delta-torque calibration window written to the vehicle on each active step.

use serde::Serialize;

use crate::config::vehicles::VehicleProfile;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("action has {got} values, table window needs {want}")]
pub struct ActionShapeError {
    pub got: usize,
    pub want: usize,
}

/// `rows × cols` torque deltas starting at `start_row` of the vehicle's torque map.
/// Values are row-major and already clamped to the vehicle's torque budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuationTable {
    pub start_row: usize,
    pub rows: usize,
    pub cols: usize,
    pub speed_labels: Vec<f32>,
    pub pedal_labels: Vec<f32>,
    values: Vec<f32>,
}

impl ActuationTable {
    pub fn from_action(
        action: &[f32],
        start_row: usize,
        profile: &VehicleProfile,
    ) -> Result<Self, ActionShapeError> {
        let want = profile.flash_numel();
        if action.len() != want {
            return Err(ActionShapeError { got: action.len(), want });
        }
        let start_row = start_row.min(profile.last_window_row());
        let budget = profile.torque_budget;
        let rows = profile.rows_to_flash;
        Ok(Self {
            start_row,
            rows,
            cols: profile.table_cols(),
            speed_labels: window_labels(&profile.speed_scale, start_row, rows),
            pedal_labels: profile.pedal_scale.clone(),
            values: action.iter().map(|v| v.clamp(-budget, budget)).collect(),
        })
    }

    pub fn zeros(start_row: usize, profile: &VehicleProfile) -> Self {
        let start_row = start_row.min(profile.last_window_row());
        Self {
            start_row,
            rows: profile.rows_to_flash,
            cols: profile.table_cols(),
            speed_labels: window_labels(&profile.speed_scale, start_row, profile.rows_to_flash),
            pedal_labels: profile.pedal_scale.clone(),
            values: vec![0.0; profile.flash_numel()],
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn row(&self, r: usize) -> Option<&[f32]> {
        (r < self.rows).then(|| &self.values[r * self.cols..(r + 1) * self.cols])
    }
}

fn window_labels(scale: &[f32], start: usize, rows: usize) -> Vec<f32> {
    scale.iter().skip(start).take(rows).copied().collect()
}
