//! Externally visible service state.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::pipeline::StageId;

/// What the service loop is doing right now. Published on every transition
/// so the ops surface can report it without touching the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceStatus {
    /// Not running: before start, after cancellation, between one-shot runs.
    Stopped = 0,
    /// Polling the catalog, nothing new to process.
    Waiting = 1,
    /// Reading and decoding a capture file.
    Reading = 2,
    /// Running the reconstruction stages.
    Reconstructing = 3,
    /// Filling aggregates from reconstruction products.
    Filling = 4,
    /// Folding the processed unit into run bookkeeping.
    Updating = 5,
    /// Persisting a snapshot.
    Writing = 6,
    /// Clearing aggregates at a run boundary.
    Resetting = 7,
    /// Draining pending client connections.
    Connecting = 8,
    /// Pushing snapshot frames to observers.
    Broadcasting = 9,
}

impl ServiceStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Waiting => "waiting",
            ServiceStatus::Reading => "reading",
            ServiceStatus::Reconstructing => "reconstructing",
            ServiceStatus::Filling => "filling",
            ServiceStatus::Updating => "updating",
            ServiceStatus::Writing => "writing",
            ServiceStatus::Resetting => "resetting",
            ServiceStatus::Connecting => "connecting",
            ServiceStatus::Broadcasting => "broadcasting",
        }
    }

    /// Gauge value for the metrics endpoint.
    pub const fn code(&self) -> i64 {
        *self as i64
    }

    /// Status published while a given pipeline stage runs.
    pub const fn for_stage(stage: StageId) -> ServiceStatus {
        match stage {
            StageId::Acquire => ServiceStatus::Reading,
            StageId::FindClusters | StageId::BuildTracks | StageId::FindVertices => {
                ServiceStatus::Reconstructing
            }
            StageId::Fill => ServiceStatus::Filling,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free cell holding the current status. The service loop writes it,
/// the ops server and tests read it.
pub struct StatusCell {
    inner: ArcSwap<ServiceStatus>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(ServiceStatus::Stopped),
        }
    }

    pub fn set(&self, status: ServiceStatus) {
        self.inner.store(Arc::new(status));
    }

    pub fn get(&self) -> ServiceStatus {
        **self.inner.load()
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_mapping() {
        assert_eq!(
            ServiceStatus::for_stage(StageId::Acquire),
            ServiceStatus::Reading
        );
        assert_eq!(
            ServiceStatus::for_stage(StageId::FindClusters),
            ServiceStatus::Reconstructing
        );
        assert_eq!(
            ServiceStatus::for_stage(StageId::BuildTracks),
            ServiceStatus::Reconstructing
        );
        assert_eq!(
            ServiceStatus::for_stage(StageId::FindVertices),
            ServiceStatus::Reconstructing
        );
        assert_eq!(ServiceStatus::for_stage(StageId::Fill), ServiceStatus::Filling);
    }

    #[test]
    fn test_cell_starts_stopped_and_swaps() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), ServiceStatus::Stopped);

        cell.set(ServiceStatus::Waiting);
        assert_eq!(cell.get(), ServiceStatus::Waiting);
        assert_eq!(cell.get().as_str(), "waiting");
        assert_eq!(cell.get().code(), 1);
    }
}
