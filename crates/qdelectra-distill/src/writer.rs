//! Scalar metric sinks.
//!
//! The loss engine reports one `data/scalar_group` record per step.
//! [`JsonlScalarWriter`] appends them to `scalars.jsonl` in the log directory
//! so runs can be plotted afterwards; [`MemoryScalarWriter`] keeps them in
//! memory.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{DistillError, DistillResult};

pub const SCALARS_FILE: &str = "scalars.jsonl";

/// One `add_scalars` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    pub step: usize,
    /// Seconds since the Unix epoch.
    pub wall_time: f64,
    pub values: BTreeMap<String, f64>,
}

pub trait ScalarWriter: Send {
    fn add_scalars(&mut self, tag: &str, values: &BTreeMap<String, f64>, step: usize) -> DistillResult<()>;
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct JsonlScalarWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonlScalarWriter {
    /// Open (append) `log_dir/scalars.jsonl`, creating the directory.
    pub fn create(log_dir: &Path) -> DistillResult<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(SCALARS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, out: BufWriter::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScalarWriter for JsonlScalarWriter {
    fn add_scalars(&mut self, tag: &str, values: &BTreeMap<String, f64>, step: usize) -> DistillResult<()> {
        let record = ScalarRecord { tag: tag.to_string(), step, wall_time: wall_time(), values: values.clone() };
        let line = serde_json::to_string(&record)?;
        writeln!(self.out, "{line}")?;
        self.out.flush().map_err(DistillError::from)
    }
}

/// In-memory writer. Clones share the same record list.
///
/// A panic while another clone holds the lock leaves the list intact, so a
/// poisoned lock is recovered rather than reported.
#[derive(Debug, Clone, Default)]
pub struct MemoryScalarWriter {
    records: Arc<Mutex<Vec<ScalarRecord>>>,
}

impl MemoryScalarWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ScalarRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ScalarRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ScalarWriter for MemoryScalarWriter {
    fn add_scalars(&mut self, tag: &str, values: &BTreeMap<String, f64>, step: usize) -> DistillResult<()> {
        let record = ScalarRecord { tag: tag.to_string(), step, wall_time: wall_time(), values: values.clone() };
        self.lock().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn jsonl_appends_one_line_per_call() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("runs");
        let mut writer = JsonlScalarWriter::create(&log_dir).unwrap();
        let values = BTreeMap::from([("total_loss".to_string(), 0.5), ("lr".to_string(), 1e-4)]);
        writer.add_scalars("data/scalar_group", &values, 1).unwrap();
        writer.add_scalars("data/scalar_group", &values, 2).unwrap();

        let text = fs::read_to_string(log_dir.join(SCALARS_FILE)).unwrap();
        let records: Vec<ScalarRecord> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].step, 2);
        assert_eq!(records[0].values["total_loss"], 0.5);
        assert!(records[0].wall_time > 0.0);
    }

    #[test]
    fn memory_writer_clones_share_records() {
        let writer = MemoryScalarWriter::new();
        let mut handle = writer.clone();
        handle.add_scalars("t", &BTreeMap::new(), 7).unwrap();
        assert_eq!(writer.records()[0].step, 7);
    }

    #[test]
    fn memory_writer_survives_poisoned_lock() {
        let writer = MemoryScalarWriter::new();
        let mut handle = writer.clone();
        handle.add_scalars("t", &BTreeMap::new(), 1).unwrap();

        let poisoner = writer.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.records.lock().unwrap();
            panic!("writer thread died");
        })
        .join();
        assert!(writer.records.is_poisoned());

        handle.add_scalars("t", &BTreeMap::new(), 2).unwrap();
        let steps: Vec<usize> = writer.records().iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![1, 2]);
    }
}
