//! Newline-delimited JSON logs of loopback deliveries.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tilesync_core::SimTick;

/// One frame handed from one peer to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    /// Cluster round in which the frame was delivered.
    pub tick: SimTick,
    /// Sending peer id.
    pub from: u64,
    /// Receiving peer id.
    pub to: u64,
    /// Message kind label, `unknown` for unparseable tags.
    pub kind: String,
    /// Frame length.
    pub bytes: usize,
}

/// A sink that writes newline-delimited JSON to disk.
pub struct JsonlSink {
    file: File,
}

impl JsonlSink {
    /// Create a new sink at `path`, creating parent directories.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self { file })
    }

    /// Append one record.
    pub fn write<R: Serialize>(&mut self, record: &R) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        Ok(())
    }
}

/// Read back a log written by [`JsonlSink`]. Blank lines are skipped.
pub fn read_traffic<P: AsRef<Path>>(path: P) -> Result<Vec<TrafficRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}
