//! episode_log.rs
//! One CSV row per finished or interrupted episode.

use std::{
    fs::{self, File, OpenOptions},
    path::Path,
};

use csv::{Writer, WriterBuilder};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeRow {
    pub episode: u64,
    pub started_at: String,
    pub outcome: &'static str,
    pub steps: u32,
    pub episode_reward: f64,
    pub running_reward: f64,
    pub capture_failures: u64,
    pub flash_failures: u64,
}

pub struct EpisodeLog {
    writer: Writer<File>,
}

impl EpisodeLog {
    /// Appends to `path`; the header is written only when the file is new or empty.
    pub fn open(path: &Path) -> csv::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let fresh = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let writer = WriterBuilder::new().has_headers(fresh).from_writer(file);
        Ok(Self { writer })
    }

    pub fn record(&mut self, row: &EpisodeRow) -> csv::Result<()> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(episode: u64) -> EpisodeRow {
        EpisodeRow {
            episode,
            started_at: "2024-01-01T00:00:00Z".into(),
            outcome: "valid",
            steps: 3,
            episode_reward: 1200.5,
            running_reward: -60.0,
            capture_failures: 0,
            flash_failures: 1,
        }
    }

    #[test]
    fn test_header_written_once_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/episodes.csv");
        EpisodeLog::open(&path).unwrap().record(&row(1)).unwrap();
        EpisodeLog::open(&path).unwrap().record(&row(2)).unwrap();

        let body = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("episode,started_at,outcome"));
        assert!(lines[2].starts_with("2,"));
    }
}
