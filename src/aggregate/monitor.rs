//! Monitor variants.
//!
//! Each monitor owns one folder of plots and knows how to fill it from one
//! event's products. The set is closed: dispatch is a match over the enum,
//! not trait objects, so the aggregator can iterate homogeneously.

use crate::reco::{Cluster, Track, Vertex};

use super::plot::{CounterPlot, HistogramPlot, PlotError};
use super::snapshot::FolderSnapshot;
use super::EventProducts;

const LAYER_BINS: usize = 16;
const SLOPE_RANGE: f64 = 8.0;
const VERTEX_Z_RANGE: f64 = 32.0;

/// One monitor with its folder of plots.
pub enum Monitor {
    Readout(ReadoutMonitor),
    Tracking(TrackingMonitor),
    Vertexing(VertexMonitor),
}

impl Monitor {
    /// The full monitor set, in snapshot order.
    pub fn standard_set() -> Vec<Monitor> {
        vec![
            Monitor::Readout(ReadoutMonitor::new()),
            Monitor::Tracking(TrackingMonitor::new()),
            Monitor::Vertexing(VertexMonitor::new()),
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Monitor::Readout(_) => "readout",
            Monitor::Tracking(_) => "tracking",
            Monitor::Vertexing(_) => "vertexing",
        }
    }

    /// Record one event into the scratch layer of every plot.
    pub fn fill(&mut self, products: &EventProducts<'_>) -> Result<(), PlotError> {
        match self {
            Monitor::Readout(m) => m.fill(products),
            Monitor::Tracking(m) => m.fill(products),
            Monitor::Vertexing(m) => m.fill(products),
        }
    }

    pub fn commit(&mut self) {
        match self {
            Monitor::Readout(m) => m.commit(),
            Monitor::Tracking(m) => m.commit(),
            Monitor::Vertexing(m) => m.commit(),
        }
    }

    pub fn discard(&mut self) {
        match self {
            Monitor::Readout(m) => m.discard(),
            Monitor::Tracking(m) => m.discard(),
            Monitor::Vertexing(m) => m.discard(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Monitor::Readout(m) => m.reset(),
            Monitor::Tracking(m) => m.reset(),
            Monitor::Vertexing(m) => m.reset(),
        }
    }

    pub fn snapshot(&self) -> FolderSnapshot {
        match self {
            Monitor::Readout(m) => m.snapshot(),
            Monitor::Tracking(m) => m.snapshot(),
            Monitor::Vertexing(m) => m.snapshot(),
        }
    }
}

/// Raw readout statistics: hit volume and where it lands.
pub struct ReadoutMonitor {
    hits_per_event: HistogramPlot,
    payload_bytes: HistogramPlot,
    layer_occupancy: HistogramPlot,
    hits_total: CounterPlot,
}

impl ReadoutMonitor {
    pub fn new() -> Self {
        Self {
            hits_per_event: HistogramPlot::new("hits_per_event", 0.0, 512.0, 64),
            payload_bytes: HistogramPlot::new("payload_bytes", 0.0, 4096.0, 64),
            layer_occupancy: HistogramPlot::new(
                "layer_occupancy",
                0.0,
                LAYER_BINS as f64,
                LAYER_BINS,
            ),
            hits_total: CounterPlot::new("hits_total"),
        }
    }

    fn fill(&mut self, products: &EventProducts<'_>) -> Result<(), PlotError> {
        let hits = products.event.hits.len() as f64;
        self.hits_per_event.fill(hits)?;
        self.payload_bytes
            .fill(products.event.payload_bytes() as f64)?;
        for hit in &products.event.hits {
            self.layer_occupancy.fill(hit.layer as f64)?;
        }
        self.hits_total.add(hits)?;
        Ok(())
    }

    fn commit(&mut self) {
        self.hits_per_event.commit();
        self.payload_bytes.commit();
        self.layer_occupancy.commit();
        self.hits_total.commit();
    }

    fn discard(&mut self) {
        self.hits_per_event.discard();
        self.payload_bytes.discard();
        self.layer_occupancy.discard();
        self.hits_total.discard();
    }

    fn reset(&mut self) {
        self.hits_per_event.reset();
        self.payload_bytes.reset();
        self.layer_occupancy.reset();
        self.hits_total.reset();
    }

    fn snapshot(&self) -> FolderSnapshot {
        FolderSnapshot {
            name: "readout".to_string(),
            plots: vec![
                self.hits_per_event.snapshot(),
                self.payload_bytes.snapshot(),
                self.layer_occupancy.snapshot(),
                self.hits_total.snapshot(),
            ],
        }
    }
}

impl Default for ReadoutMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Cluster and track statistics.
pub struct TrackingMonitor {
    clusters_per_event: HistogramPlot,
    cluster_size: HistogramPlot,
    cluster_charge: HistogramPlot,
    tracks_per_event: HistogramPlot,
    track_slope: HistogramPlot,
    tracks_total: CounterPlot,
}

impl TrackingMonitor {
    pub fn new() -> Self {
        Self {
            clusters_per_event: HistogramPlot::new("clusters_per_event", 0.0, 128.0, 32),
            cluster_size: HistogramPlot::new("cluster_size", 0.0, 16.0, 16),
            cluster_charge: HistogramPlot::new("cluster_charge", 0.0, 2048.0, 64),
            tracks_per_event: HistogramPlot::new("tracks_per_event", 0.0, 32.0, 32),
            track_slope: HistogramPlot::new("track_slope", -SLOPE_RANGE, SLOPE_RANGE, 64),
            tracks_total: CounterPlot::new("tracks_total"),
        }
    }

    fn fill_clusters(&mut self, clusters: &[Cluster]) -> Result<(), PlotError> {
        self.clusters_per_event.fill(clusters.len() as f64)?;
        for cluster in clusters {
            self.cluster_size.fill(cluster.size as f64)?;
            self.cluster_charge.fill(cluster.charge as f64)?;
        }
        Ok(())
    }

    fn fill_tracks(&mut self, tracks: &[Track]) -> Result<(), PlotError> {
        self.tracks_per_event.fill(tracks.len() as f64)?;
        for track in tracks {
            self.track_slope.fill(track.slope)?;
        }
        self.tracks_total.add(tracks.len() as f64)?;
        Ok(())
    }

    fn fill(&mut self, products: &EventProducts<'_>) -> Result<(), PlotError> {
        self.fill_clusters(products.clusters)?;
        self.fill_tracks(products.tracks)?;
        Ok(())
    }

    fn commit(&mut self) {
        self.clusters_per_event.commit();
        self.cluster_size.commit();
        self.cluster_charge.commit();
        self.tracks_per_event.commit();
        self.track_slope.commit();
        self.tracks_total.commit();
    }

    fn discard(&mut self) {
        self.clusters_per_event.discard();
        self.cluster_size.discard();
        self.cluster_charge.discard();
        self.tracks_per_event.discard();
        self.track_slope.discard();
        self.tracks_total.discard();
    }

    fn reset(&mut self) {
        self.clusters_per_event.reset();
        self.cluster_size.reset();
        self.cluster_charge.reset();
        self.tracks_per_event.reset();
        self.track_slope.reset();
        self.tracks_total.reset();
    }

    fn snapshot(&self) -> FolderSnapshot {
        FolderSnapshot {
            name: "tracking".to_string(),
            plots: vec![
                self.clusters_per_event.snapshot(),
                self.cluster_size.snapshot(),
                self.cluster_charge.snapshot(),
                self.tracks_per_event.snapshot(),
                self.track_slope.snapshot(),
                self.tracks_total.snapshot(),
            ],
        }
    }
}

impl Default for TrackingMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Vertex statistics.
pub struct VertexMonitor {
    vertices_per_event: HistogramPlot,
    vertex_z: HistogramPlot,
    vertices_total: CounterPlot,
}

impl VertexMonitor {
    pub fn new() -> Self {
        Self {
            vertices_per_event: HistogramPlot::new("vertices_per_event", 0.0, 8.0, 8),
            vertex_z: HistogramPlot::new("vertex_z", -VERTEX_Z_RANGE, VERTEX_Z_RANGE, 64),
            vertices_total: CounterPlot::new("vertices_total"),
        }
    }

    fn fill_vertices(&mut self, vertices: &[Vertex]) -> Result<(), PlotError> {
        self.vertices_per_event.fill(vertices.len() as f64)?;
        for vertex in vertices {
            self.vertex_z.fill(vertex.z)?;
        }
        self.vertices_total.add(vertices.len() as f64)?;
        Ok(())
    }

    fn fill(&mut self, products: &EventProducts<'_>) -> Result<(), PlotError> {
        self.fill_vertices(products.vertices)
    }

    fn commit(&mut self) {
        self.vertices_per_event.commit();
        self.vertex_z.commit();
        self.vertices_total.commit();
    }

    fn discard(&mut self) {
        self.vertices_per_event.discard();
        self.vertex_z.discard();
        self.vertices_total.discard();
    }

    fn reset(&mut self) {
        self.vertices_per_event.reset();
        self.vertex_z.reset();
        self.vertices_total.reset();
    }

    fn snapshot(&self) -> FolderSnapshot {
        FolderSnapshot {
            name: "vertexing".to_string(),
            plots: vec![
                self.vertices_per_event.snapshot(),
                self.vertex_z.snapshot(),
                self.vertices_total.snapshot(),
            ],
        }
    }
}

impl Default for VertexMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::capture::{DecodedEvent, Hit};
    use crate::aggregate::snapshot::PlotSnapshot;

    fn products<'a>(
        event: &'a DecodedEvent,
        clusters: &'a [Cluster],
        tracks: &'a [Track],
        vertices: &'a [Vertex],
    ) -> EventProducts<'a> {
        EventProducts {
            event,
            clusters,
            tracks,
            vertices,
        }
    }

    #[test]
    fn test_standard_set_names() {
        let names: Vec<&str> = Monitor::standard_set().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["readout", "tracking", "vertexing"]);
    }

    #[test]
    fn test_readout_fill_commit() {
        let event = DecodedEvent {
            seq: 0,
            hits: vec![
                Hit {
                    layer: 0,
                    cell: 1,
                    adc: 100,
                },
                Hit {
                    layer: 3,
                    cell: 2,
                    adc: 100,
                },
            ],
        };
        let mut monitor = Monitor::Readout(ReadoutMonitor::new());
        monitor
            .fill(&products(&event, &[], &[], &[]))
            .expect("fill");
        monitor.commit();

        let folder = monitor.snapshot();
        assert_eq!(folder.name, "readout");
        match &folder.plots[3] {
            PlotSnapshot::Counter { name, count, sum } => {
                assert_eq!(name, "hits_total");
                assert_eq!(*count, 1);
                assert!((sum - 2.0).abs() < 1e-12);
            }
            other => panic!("unexpected plot {other:?}"),
        }
    }

    #[test]
    fn test_vertex_nan_is_fill_error() {
        let event = DecodedEvent {
            seq: 0,
            hits: vec![],
        };
        let vertices = vec![Vertex {
            z: f64::NAN,
            tracks: 2,
        }];
        let mut monitor = Monitor::Vertexing(VertexMonitor::new());
        let err = monitor
            .fill(&products(&event, &[], &[], &vertices))
            .expect_err("nan must be rejected");
        assert!(matches!(err, PlotError::NonFinite { plot: "vertex_z", .. }));
    }

    #[test]
    fn test_discard_drops_partial_fill() {
        let event = DecodedEvent {
            seq: 0,
            hits: vec![],
        };
        let vertices = vec![Vertex { z: 1.5, tracks: 2 }];
        let mut monitor = Monitor::Vertexing(VertexMonitor::new());
        monitor
            .fill(&products(&event, &[], &[], &vertices))
            .expect("fill");
        monitor.discard();
        monitor.commit();

        let folder = monitor.snapshot();
        match &folder.plots[2] {
            PlotSnapshot::Counter { count, .. } => assert_eq!(*count, 0),
            other => panic!("unexpected plot {other:?}"),
        }
    }
}
