//! JSON summaries of loopback sessions for CI artifacts.

use crate::cluster::LoopbackNode;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tilesync_net::Role;

/// Summary of one cluster run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    /// Scenario identifier.
    pub name: String,

    /// When the report was built (RFC 3339).
    pub timestamp: String,

    /// Overall outcome.
    pub result: TestResult,

    /// Rounds the cluster ran.
    pub ticks: u64,

    /// Messages delivered across the network.
    pub messages: u64,

    /// Frame bytes delivered across the network.
    pub bytes: u64,

    /// Host first, then peers in index order.
    pub nodes: Vec<NodeMetrics>,
}

/// Outcome of a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestResult {
    /// All checks held
    Pass,
    /// A check failed
    Fail,
    /// Not run
    Skip,
}

/// Per-node queue and replication counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// Peer id.
    pub peer: u64,
    /// `host`, `peer` or `none`.
    pub role: String,
    /// Messages accepted by the transport.
    pub sent: u64,
    /// Messages dropped after a permanent failure.
    pub failed: u64,
    /// Rate-limit responses seen.
    pub rate_limited: u64,
    /// Messages discarded for dead connections.
    pub purged: u64,
    /// Largest outbound queue depth.
    pub peak_depth: usize,
    /// Non-air tiles held.
    pub tiles: usize,
    /// Replicated entities held.
    pub entities: usize,
}

impl NodeMetrics {
    /// Snapshot the counters of `node`.
    pub fn from_node(node: &LoopbackNode) -> Self {
        let queue = node.queue_metrics();
        let role = match node.session().role() {
            Some(Role::Host) => "host",
            Some(Role::Peer) => "peer",
            None => "none",
        };
        Self {
            peer: node.local_peer().0,
            role: role.to_string(),
            sent: queue.sent,
            failed: queue.failed,
            rate_limited: queue.rate_limited,
            purged: queue.purged,
            peak_depth: queue.peak_depth,
            tiles: node.tiles().tiles().len(),
            entities: node.entities().len(),
        }
    }
}

/// Builder for [`SessionReport`].
pub struct SessionReportBuilder {
    report: SessionReport,
}

impl SessionReportBuilder {
    /// Start a passing report stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            report: SessionReport {
                name: name.into(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                result: TestResult::Pass,
                ticks: 0,
                messages: 0,
                bytes: 0,
                nodes: Vec::new(),
            },
        }
    }

    /// Set the outcome
    pub fn result(mut self, result: TestResult) -> Self {
        self.report.result = result;
        self
    }

    /// Set the round count
    pub fn ticks(mut self, ticks: u64) -> Self {
        self.report.ticks = ticks;
        self
    }

    /// Set the delivered message count
    pub fn messages(mut self, messages: u64) -> Self {
        self.report.messages = messages;
        self
    }

    /// Set the delivered byte count
    pub fn bytes(mut self, bytes: u64) -> Self {
        self.report.bytes = bytes;
        self
    }

    /// Set the per-node counters
    pub fn nodes(mut self, nodes: Vec<NodeMetrics>) -> Self {
        self.report.nodes = nodes;
        self
    }

    /// Finish the report
    pub fn build(self) -> SessionReport {
        self.report
    }
}

/// Writes a [`SessionReport`] as pretty JSON.
pub struct ReportSink {
    path: PathBuf,
}

impl ReportSink {
    /// Point a sink at `path`, creating parent directories.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Overwrite the file with `report`.
    pub fn write(&self, report: &SessionReport) -> Result<()> {
        let json = serde_json::to_string_pretty(report)?;
        let mut file = File::create(&self.path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
