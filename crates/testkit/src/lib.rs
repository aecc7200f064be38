#![warn(missing_docs)]
//! Deterministic multi-node harness: loopback clusters, traffic logs and
//! JSON session reports.

mod cluster;
mod report;
mod traffic;

pub use cluster::*;
pub use report::*;
pub use traffic::*;
