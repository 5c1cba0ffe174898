//! tbox.rs
//! Legacy T-Box simulator transport.
//!
//! A calibration table is flattened row-major, every `f32` is encoded as 8 hex digits
//! (little-endian bytes read back as a big-endian `u32`), and the concatenated string is
//! written into the matching `data[].value` entry of a template JSON. A download script
//! then pushes the JSON to the ECU:
//! - diff-on script: 3 s budget, non-zero exit is an internal error (code 2)
//! - diff-off script: 5 s budget, exit status ignored
//!
//! Overrunning the budget kills the script and reports a flash timeout (code 4).

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    process::Command,
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use serde_json::Value;

use crate::conn::error::{ErrorCode, ProtocolError};
use crate::control::table::ActuationTable;

pub const DEFAULT_CALIBRATION_NAME: &str = "TQD_trqTrqSetNormal_MAP_v";

const DIFF_ON_TIMEOUT: Duration = Duration::from_secs(3);
const DIFF_OFF_TIMEOUT: Duration = Duration::from_secs(5);
const SCRIPT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum TboxError {
    #[error("template io: {0}")]
    Io(#[from] io::Error),

    #[error("template json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("template has no usable entry: {0}")]
    Template(String),

    #[error("{name}: value has {got} hex digits, template expects {want}")]
    LengthMismatch { name: String, got: usize, want: usize },

    #[error("calibration {0} not present in template")]
    UnknownName(String),

    #[error("not a hex word: {0:?}")]
    BadHex(String),
}

impl From<TboxError> for ProtocolError {
    fn from(e: TboxError) -> Self {
        match e {
            TboxError::Io(_) | TboxError::Json(_) => {
                ProtocolError::internal(ErrorCode::DownloadFailure, e.to_string())
            }
            _ => ProtocolError::internal(ErrorCode::InternalError, e.to_string()),
        }
    }
}

pub fn float_to_hex(v: f32) -> String {
    format!("{:08x}", u32::from_be_bytes(v.to_le_bytes()))
}

pub fn hex_to_float(word: &str) -> Result<f32, TboxError> {
    let raw = u32::from_str_radix(word, 16).map_err(|_| TboxError::BadHex(word.to_string()))?;
    Ok(f32::from_le_bytes(raw.to_be_bytes()))
}

pub fn float_array_to_buffer(values: &[f32]) -> String {
    values.iter().map(|v| float_to_hex(*v)).collect()
}

pub fn buffer_to_float_array(buffer: &str) -> Result<Vec<f32>, TboxError> {
    if buffer.len() % 8 != 0 || !buffer.is_ascii() {
        return Err(TboxError::BadHex(buffer.to_string()));
    }
    (0..buffer.len())
        .step_by(8)
        .map(|i| hex_to_float(&buffer[i..i + 8]))
        .collect()
}

fn as_count(v: &Value) -> Option<usize> {
    match v {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Copies `template` to `output` with the `value` of entry `name` replaced.
/// Nothing is written if the hex length disagrees with the entry's `dim` and `value_length`.
pub fn write_json(template: &Path, output: &Path, name: &str, value: &str) -> Result<(), TboxError> {
    let mut doc: Value = serde_json::from_str(&fs::read_to_string(template)?)?;
    let entries = doc
        .get_mut("data")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| TboxError::Template("missing data array".into()))?;

    let entry = entries
        .iter_mut()
        .find(|e| e.get("name").and_then(Value::as_str) == Some(name))
        .ok_or_else(|| TboxError::UnknownName(name.to_string()))?;

    let numel: usize = entry
        .get("dim")
        .and_then(Value::as_array)
        .ok_or_else(|| TboxError::Template(format!("{name} has no dim")))?
        .iter()
        .map(|d| as_count(d).ok_or_else(|| TboxError::Template(format!("{name} dim {d}"))))
        .product::<Result<usize, _>>()?;
    let value_length = entry
        .get("value_length")
        .and_then(as_count)
        .ok_or_else(|| TboxError::Template(format!("{name} has no value_length")))?;

    let want = numel * value_length * 2;
    if value.len() != want {
        return Err(TboxError::LengthMismatch { name: name.to_string(), got: value.len(), want });
    }
    entry["value"] = Value::String(value.to_string());
    fs::write(output, serde_json::to_string(&doc)?)?;
    Ok(())
}

/// File layout of a T-Box simulator checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TboxPaths {
    pub template: PathBuf,
    pub output: PathBuf,
    pub diff_on_script: PathBuf,
    pub diff_off_script: PathBuf,
}

impl TboxPaths {
    pub fn under(root: &Path) -> Self {
        let xcp = root.join("xcp_driver");
        Self {
            template: xcp.join("json/example.json"),
            output: xcp.join("json/download.json"),
            diff_on_script: xcp.join("scripts/download_diffon.sh"),
            diff_off_script: xcp.join("scripts/download_diffoff.sh"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TboxFlasher {
    paths: TboxPaths,
    calibration_name: String,
    diff: bool,
    diff_timeout: Duration,
    full_timeout: Duration,
}

impl TboxFlasher {
    pub fn new(paths: TboxPaths, diff: bool) -> Self {
        Self {
            paths,
            calibration_name: DEFAULT_CALIBRATION_NAME.to_string(),
            diff,
            diff_timeout: DIFF_ON_TIMEOUT,
            full_timeout: DIFF_OFF_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, diff_timeout: Duration, full_timeout: Duration) -> Self {
        self.diff_timeout = diff_timeout;
        self.full_timeout = full_timeout;
        self
    }

    pub fn with_calibration_name(mut self, name: impl Into<String>) -> Self {
        self.calibration_name = name.into();
        self
    }

    pub fn send_table(&self, table: &ActuationTable) -> Result<(), ProtocolError> {
        let buffer = float_array_to_buffer(table.values());
        write_json(&self.paths.template, &self.paths.output, &self.calibration_name, &buffer)?;
        debug!(
            "[Tbox] wrote {} cells at row {} to {}",
            table.values().len(),
            table.start_row,
            self.paths.output.display()
        );
        if self.diff {
            run_script(&self.paths.diff_on_script, self.diff_timeout, true)
        } else {
            run_script(&self.paths.diff_off_script, self.full_timeout, false)
        }
    }
}

fn run_script(script: &Path, timeout: Duration, check: bool) -> Result<(), ProtocolError> {
    let mut child = Command::new(script).spawn().map_err(|e| {
        ProtocolError::internal(ErrorCode::DownloadFailure, format!("xcp download failed: {e}"))
    })?;
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) if check && !status.success() => {
                return Err(ProtocolError::internal(
                    ErrorCode::InternalError,
                    format!("xcp download failed: {status}"),
                ));
            }
            Ok(Some(_)) => return Ok(()),
            Ok(None) if start.elapsed() >= timeout => {
                if let Err(e) = child.kill() {
                    warn!("[Tbox] could not kill {}: {}", script.display(), e);
                }
                let _ = child.wait();
                return Err(ProtocolError::flash_timeout("xcp download timeout"));
            }
            Ok(None) => thread::sleep(SCRIPT_POLL),
            Err(e) => {
                return Err(ProtocolError::internal(
                    ErrorCode::DownloadFailure,
                    format!("xcp download failed: {e}"),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::vehicles::VehicleRegistry;

    #[test]
    fn test_hex_word_layout() {
        // 1.0f32 is 0x3f800000; little-endian bytes 00 00 80 3f read big-endian
        assert_eq!(float_to_hex(1.0), "0000803f");
        assert_eq!(float_to_hex(0.0), "00000000");
        assert_eq!(float_array_to_buffer(&[1.0, -2.5]), "0000803f000020c0");
        assert_eq!(hex_to_float("000020c0").unwrap(), -2.5);
        assert!(matches!(hex_to_float("zz"), Err(TboxError::BadHex(_))));
    }

    #[test]
    fn test_buffer_decodes_back() {
        let values = [0.0f32, 1.5, -250.0, 3.1415927, f32::MIN_POSITIVE];
        let decoded = buffer_to_float_array(&float_array_to_buffer(&values)).unwrap();
        assert_eq!(decoded, values);
        assert!(buffer_to_float_array("0000803").is_err());
    }

    fn template(dir: &Path, numel: [u32; 2]) -> PathBuf {
        let path = dir.join("example.json");
        let doc = serde_json::json!({
            "data": [
                {"name": "other", "dim": [1], "value_length": 4, "value": "00000000"},
                {"name": DEFAULT_CALIBRATION_NAME, "dim": [numel[0].to_string(), numel[1]],
                 "value_length": "4", "value": ""}
            ]
        });
        fs::write(&path, doc.to_string()).unwrap();
        path
    }

    #[test]
    fn test_write_json_fills_matching_entry() {
        let dir = tempfile::tempdir().unwrap();
        let tpl = template(dir.path(), [1, 2]);
        let out = dir.path().join("download.json");
        let value = float_array_to_buffer(&[1.0, 2.0]);
        write_json(&tpl, &out, DEFAULT_CALIBRATION_NAME, &value).unwrap();

        let doc: Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(doc["data"][1]["value"], Value::String(value));
        assert_eq!(doc["data"][0]["value"], "00000000");
    }

    #[test]
    fn test_write_json_length_mismatch_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let tpl = template(dir.path(), [2, 2]);
        let out = dir.path().join("download.json");
        let err = write_json(&tpl, &out, DEFAULT_CALIBRATION_NAME, "0000803f").unwrap_err();
        assert!(matches!(err, TboxError::LengthMismatch { got: 8, want: 32, .. }));
        assert!(!out.exists());
        assert_eq!(ProtocolError::from(err).code(), ErrorCode::InternalError);

        let err = write_json(&tpl, &out, "missing", "").unwrap_err();
        assert!(matches!(err, TboxError::UnknownName(_)));
    }

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn flasher_with(dir: &Path, diff_on: &str, diff_off: &str, diff: bool) -> (TboxFlasher, ActuationTable) {
        let reg = VehicleRegistry::builtin();
        let vb7 = reg.by_vid("VB7").unwrap();
        let paths = TboxPaths {
            template: template(dir, [4, 17]),
            output: dir.join("download.json"),
            diff_on_script: script(dir, "diffon.sh", diff_on),
            diff_off_script: script(dir, "diffoff.sh", diff_off),
        };
        let flasher = TboxFlasher::new(paths, diff)
            .with_timeouts(Duration::from_millis(300), Duration::from_millis(300));
        (flasher, ActuationTable::zeros(0, vb7))
    }

    #[cfg(unix)]
    #[test]
    fn test_diff_flash_overrunning_budget_is_flash_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (flasher, table) = flasher_with(dir.path(), "sleep 5", "exit 0", true);
        let start = Instant::now();
        let err = flasher.send_table(&table).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FlashTimeout);
        assert!(!err.is_recoverable());
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_status_checked_only_in_diff_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (diff, table) = flasher_with(dir.path(), "exit 3", "exit 3", true);
        assert_eq!(diff.send_table(&table).unwrap_err().code(), ErrorCode::InternalError);

        let (full, table) = flasher_with(dir.path(), "exit 3", "exit 3", false);
        assert!(full.send_table(&table).is_ok());
    }

    #[test]
    fn test_missing_script_is_download_failure() {
        let dir = tempfile::tempdir().unwrap();
        let reg = VehicleRegistry::builtin();
        let vb7 = reg.by_vid("VB7").unwrap();
        let mut paths = TboxPaths::under(dir.path());
        paths.template = template(dir.path(), [4, 17]);
        paths.output = dir.path().join("download.json");
        let err = TboxFlasher::new(paths, false)
            .send_table(&ActuationTable::zeros(0, vb7))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DownloadFailure);
    }
}
