//! Serializable aggregate snapshots.
//!
//! A snapshot is a deep copy of all published plot values plus run metadata.
//! It is encoded once per broadcast cycle and the same bytes go to every
//! client and to the persistence sink.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One plot leaf, as published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlotSnapshot {
    Counter {
        name: String,
        count: u64,
        sum: f64,
    },
    Histogram {
        name: String,
        low: f64,
        high: f64,
        bins: Vec<u64>,
        underflow: u64,
        overflow: u64,
        entries: u64,
        sum: f64,
    },
}

impl PlotSnapshot {
    pub fn name(&self) -> &str {
        match self {
            PlotSnapshot::Counter { name, .. } => name,
            PlotSnapshot::Histogram { name, .. } => name,
        }
    }
}

/// One monitor's folder of plots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderSnapshot {
    pub name: String,
    pub plots: Vec<PlotSnapshot>,
}

/// Full aggregate state at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    /// Agent instance name from the configuration.
    pub instance: String,
    pub run: u32,
    pub sub_run: u32,
    /// Events committed into this aggregate since the last reset.
    pub events: u64,
    /// Events rejected by the all-or-nothing fill since the last reset.
    pub fill_errors: u64,
    pub generated_unix_ms: u64,
    pub folders: Vec<FolderSnapshot>,
}

impl AggregateSnapshot {
    /// JSON-encode for the wire and the persistence sink.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Persistence file name: `aggregate_{run}.json`, with the sub-run
    /// appended when this snapshot came from an operator rollover.
    pub fn file_name(&self) -> String {
        if self.sub_run > 0 {
            format!("aggregate_{}_{}.json", self.run, self.sub_run)
        } else {
            format!("aggregate_{}.json", self.run)
        }
    }

    /// Total number of plot leaves across all folders.
    pub fn leaf_count(&self) -> usize {
        self.folders.iter().map(|f| f.plots.len()).sum()
    }
}

/// Wallclock in milliseconds since the epoch, for snapshot metadata.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
