//! Run-scoped aggregation.
//!
//! The aggregator owns the fixed monitor set and applies one event at a time.
//! An update is all-or-nothing: if any leaf rejects a sample the whole event
//! is discarded and counted as a fill error, so published plots never hold a
//! partial event. Snapshots are deep copies, safe to serialize while the live
//! aggregate keeps moving.

pub mod monitor;
pub mod plot;
pub mod snapshot;

use crate::capture::DecodedEvent;
use crate::reco::{Cluster, Track, Vertex};

use self::monitor::Monitor;
use self::plot::PlotError;
use self::snapshot::{now_unix_ms, AggregateSnapshot};

/// Borrowed view of one event's pipeline products.
pub struct EventProducts<'a> {
    pub event: &'a DecodedEvent,
    pub clusters: &'a [Cluster],
    pub tracks: &'a [Track],
    pub vertices: &'a [Vertex],
}

/// Owner of the mutable aggregate state. Single-task: the service loop is the
/// only writer, everyone else sees snapshots.
pub struct Aggregator {
    instance: String,
    monitors: Vec<Monitor>,
    fill_errors: u64,
}

impl Aggregator {
    pub fn new(instance: String) -> Self {
        Self {
            instance,
            monitors: Monitor::standard_set(),
            fill_errors: 0,
        }
    }

    /// Apply exactly one event. On error nothing is published and the event
    /// counts as one fill error.
    pub fn update(&mut self, products: &EventProducts<'_>) -> Result<(), PlotError> {
        for i in 0..self.monitors.len() {
            if let Err(e) = self.monitors[i].fill(products) {
                for monitor in &mut self.monitors {
                    monitor.discard();
                }
                self.fill_errors += 1;
                return Err(e);
            }
        }
        for monitor in &mut self.monitors {
            monitor.commit();
        }
        Ok(())
    }

    /// Clear all published values and the fill-error count.
    pub fn reset(&mut self) {
        for monitor in &mut self.monitors {
            monitor.reset();
        }
        self.fill_errors = 0;
    }

    pub fn fill_errors(&self) -> u64 {
        self.fill_errors
    }

    /// Deep copy of the published state under the given run coordinates.
    pub fn snapshot(&self, run: u32, sub_run: u32, events: u64) -> AggregateSnapshot {
        AggregateSnapshot {
            instance: self.instance.clone(),
            run,
            sub_run,
            events,
            fill_errors: self.fill_errors,
            generated_unix_ms: now_unix_ms(),
            folders: self.monitors.iter().map(|m| m.snapshot()).collect(),
        }
    }
}
