use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const HEADER: [&str; 3] = ["epoch", "train_loss", "test_loss"];

/// One row of the per-epoch loss table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub test_loss: f64,
}

/// Per-epoch loss table backed by a CSV file.
///
/// Every row is appended to disk as soon as it is recorded, so an aborted
/// run keeps the epochs it completed.
#[derive(Debug)]
pub struct MetricsRecorder {
    path: PathBuf,
    rows: Vec<EpochMetrics>,
}

impl MetricsRecorder {
    /// Truncates any prior file at `path` and writes the header.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let recorder = MetricsRecorder { path, rows: Vec::new() };
        recorder.flush()?;
        debug!("created metrics table at {}", recorder.path.display());
        Ok(recorder)
    }

    pub fn record(&mut self, epoch: usize, train_loss: f64, test_loss: f64) -> Result<()> {
        if let Some(last) = self.rows.last() {
            if epoch <= last.epoch {
                return Err(Error::MetricsOrder { got: epoch, last: last.epoch });
            }
        }
        let row = EpochMetrics { epoch, train_loss, test_loss };

        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.serialize(row)?;
        writer.flush()?;

        self.rows.push(row);
        debug!("epoch {epoch}: train_loss={train_loss:.4}, test_loss={test_loss:.4}");
        Ok(())
    }

    /// Rewrites the whole table, replacing whatever is on disk.
    pub fn flush(&self) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(File::create(&self.path)?);
        writer.write_record(HEADER)?;
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads a table written by a recorder.
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<EpochMetrics>> {
        let mut reader = csv::Reader::from_path(path)?;
        let rows = reader.deserialize().collect::<std::result::Result<Vec<EpochMetrics>, _>>()?;
        Ok(rows)
    }

    pub fn rows(&self) -> &[EpochMetrics] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Receives named scalar series as they are produced, e.g. for plotting.
pub trait MetricsSink {
    fn record(&mut self, epoch: usize, series: &str, value: f64);
}

/// Forwards every value to the `debug` log level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn record(&mut self, epoch: usize, series: &str, value: f64) {
        debug!("[{series}] epoch {epoch}: {value:.6}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_reach_disk_as_they_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Results").join("Lossframe.csv");
        let mut recorder = MetricsRecorder::new(&path).unwrap();

        recorder.record(1, 12.5, 13.0).unwrap();
        recorder.record(2, 10.0, 11.25).unwrap();

        let on_disk = MetricsRecorder::read(&path).unwrap();
        assert_eq!(on_disk, recorder.rows());
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("epoch,train_loss,test_loss\n"));
    }

    #[test]
    fn new_recorder_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.csv");
        fs::write(&path, "stale\n1,2,3\n").unwrap();

        let recorder = MetricsRecorder::new(&path).unwrap();
        assert!(recorder.is_empty());
        assert!(MetricsRecorder::read(&path).unwrap().is_empty());
    }

    #[test]
    fn epochs_must_ascend() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = MetricsRecorder::new(dir.path().join("m.csv")).unwrap();
        recorder.record(2, 1.0, 1.0).unwrap();
        let err = recorder.record(2, 1.0, 1.0).unwrap_err();
        assert!(matches!(err, Error::MetricsOrder { got: 2, last: 2 }));
        assert_eq!(recorder.len(), 1);
    }

    #[test]
    fn flush_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.csv");
        let mut recorder = MetricsRecorder::new(&path).unwrap();
        recorder.record(1, 3.0, 4.0).unwrap();
        let appended = fs::read(&path).unwrap();
        recorder.flush().unwrap();
        recorder.flush().unwrap();
        assert_eq!(appended, fs::read(&path).unwrap());
    }
}
