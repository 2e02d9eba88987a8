//! Staged reconstruction pipeline.
//!
//! Stages run strictly in order against one input unit, each consuming the
//! previous stage's products from the shared [`RecoContext`]. The caller gates
//! every stage on the previous outcome and on its cancellation token; the
//! runner reports per-stage outcomes and keeps stale downstream products from
//! leaking into the next attempt by clearing them before each stage.

use std::fmt;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::aggregate::Aggregator;
use crate::capture::{self, DecodedEvent};
use crate::catalog::InputUnit;
use crate::config::RecoConfig;
use crate::reco::{Cluster, ClusterFinder, Track, TrackBuilder, Vertex, VertexFinder};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StageId {
    Acquire = 0,
    FindClusters = 1,
    BuildTracks = 2,
    FindVertices = 3,
    Fill = 4,
}

impl StageId {
    pub const ALL: [StageId; 5] = [
        StageId::Acquire,
        StageId::FindClusters,
        StageId::BuildTracks,
        StageId::FindVertices,
        StageId::Fill,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            StageId::Acquire => "acquire",
            StageId::FindClusters => "find_clusters",
            StageId::BuildTracks => "build_tracks",
            StageId::FindVertices => "find_vertices",
            StageId::Fill => "fill",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage could not complete its unit.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: StageId,
    pub reason: anyhow::Error,
}

/// Result of one stage invocation. Drives control flow only.
#[derive(Debug)]
pub enum StageOutcome {
    Success,
    Failure(StageFailure),
    Aborted,
}

impl StageOutcome {
    fn failure(stage: StageId, reason: anyhow::Error) -> Self {
        StageOutcome::Failure(StageFailure { stage, reason })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success)
    }
}

/// Shared per-unit state: each stage's products, indexed per event.
#[derive(Default)]
pub struct RecoContext {
    pub events: Vec<DecodedEvent>,
    pub clusters: Vec<Vec<Cluster>>,
    pub tracks: Vec<Vec<Track>>,
    pub vertices: Vec<Vec<Vertex>>,
    /// Events committed by the fill stage.
    pub filled: u64,
}

impl RecoContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the products of `stage` and everything after it. Run before each
    /// stage so an aborted or failed earlier unit cannot leak stale products
    /// into this one.
    pub fn clear_from(&mut self, stage: StageId) {
        if stage as u8 <= StageId::Acquire as u8 {
            self.events.clear();
        }
        if stage as u8 <= StageId::FindClusters as u8 {
            self.clusters.clear();
        }
        if stage as u8 <= StageId::BuildTracks as u8 {
            self.tracks.clear();
        }
        if stage as u8 <= StageId::FindVertices as u8 {
            self.vertices.clear();
        }
        self.filled = 0;
    }

    /// Borrowed view of one event's products for the fill stage.
    pub fn products(&self, idx: usize) -> crate::aggregate::EventProducts<'_> {
        crate::aggregate::EventProducts {
            event: &self.events[idx],
            clusters: &self.clusters[idx],
            tracks: &self.tracks[idx],
            vertices: &self.vertices[idx],
        }
    }
}

/// Executes pipeline stages over one unit at a time.
pub struct StageRunner {
    cluster_finder: ClusterFinder,
    track_builder: TrackBuilder,
    vertex_finder: VertexFinder,
}

impl StageRunner {
    pub fn new(cfg: &RecoConfig) -> Self {
        Self {
            cluster_finder: ClusterFinder::new(cfg.adc_threshold, cfg.max_clusters_per_event),
            track_builder: TrackBuilder::new(cfg.cell_tolerance, cfg.min_track_points),
            vertex_finder: VertexFinder::new(cfg.min_vertex_tracks),
        }
    }

    /// Run one stage against the unit. The caller is responsible for stage
    /// ordering; cancellation is checked here before any work starts, so a
    /// stop request never waits on a stage.
    pub async fn run_stage(
        &self,
        stage: StageId,
        unit: &InputUnit,
        ctx: &mut RecoContext,
        aggregator: &mut Aggregator,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        if cancel.is_cancelled() {
            return StageOutcome::Aborted;
        }
        ctx.clear_from(stage);

        match stage {
            StageId::Acquire => self.acquire(unit, ctx).await,
            StageId::FindClusters => self.find_clusters(unit, ctx),
            StageId::BuildTracks => {
                ctx.tracks = ctx
                    .clusters
                    .iter()
                    .map(|clusters| self.track_builder.build(clusters))
                    .collect();
                StageOutcome::Success
            }
            StageId::FindVertices => {
                ctx.vertices = ctx
                    .tracks
                    .iter()
                    .map(|tracks| self.vertex_finder.find(tracks))
                    .collect();
                StageOutcome::Success
            }
            StageId::Fill => Self::fill(unit, ctx, aggregator),
        }
    }

    async fn acquire(&self, unit: &InputUnit, ctx: &mut RecoContext) -> StageOutcome {
        let (header, events) = match capture::read_file(&unit.path).await {
            Ok(decoded) => decoded,
            Err(e) => return StageOutcome::failure(StageId::Acquire, e.into()),
        };

        // The unit was built from a header probe; the file must still agree.
        if header.run != unit.run {
            return StageOutcome::failure(
                StageId::Acquire,
                anyhow!(
                    "run id changed between probe and read: {} != {}",
                    header.run,
                    unit.run
                ),
            );
        }
        if events.len() as u32 != unit.events {
            return StageOutcome::failure(
                StageId::Acquire,
                anyhow!(
                    "event count changed between probe and read: {} != {}",
                    events.len(),
                    unit.events
                ),
            );
        }

        ctx.events = events;
        StageOutcome::Success
    }

    fn find_clusters(&self, unit: &InputUnit, ctx: &mut RecoContext) -> StageOutcome {
        let mut clusters = Vec::with_capacity(ctx.events.len());
        for event in &ctx.events {
            match self.cluster_finder.find(event) {
                Ok(found) => clusters.push(found),
                Err(e) => {
                    return StageOutcome::failure(
                        StageId::FindClusters,
                        anyhow!(e).context(format!(
                            "event {} of {}",
                            event.seq, unit.name
                        )),
                    )
                }
            }
        }
        ctx.clusters = clusters;
        StageOutcome::Success
    }

    /// Fill is all-or-nothing per event: a rejected event is logged and
    /// counted by the aggregator, the rest of the unit still commits.
    fn fill(unit: &InputUnit, ctx: &mut RecoContext, aggregator: &mut Aggregator) -> StageOutcome {
        for idx in 0..ctx.events.len() {
            let products = ctx.products(idx);
            match aggregator.update(&products) {
                Ok(()) => ctx.filled += 1,
                Err(e) => {
                    warn!(
                        stage = %StageId::Fill,
                        file = %unit.name,
                        seq = ctx.events[idx].seq,
                        error = %e,
                        "event rejected by fill",
                    );
                }
            }
        }
        StageOutcome::Success
    }
}
