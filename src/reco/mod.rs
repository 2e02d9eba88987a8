//! Reconstruction collaborators invoked by the pipeline stages.
//!
//! Small deterministic transforms over decoded events: contiguous hits become
//! clusters, aligned clusters become tracks, crossing tracks become a vertex
//! estimate. The pipeline only depends on their inputs, outputs, and failure
//! reporting.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::capture::{DecodedEvent, Hit};

/// Errors reported by reconstruction collaborators.
#[derive(Error, Debug)]
pub enum RecoError {
    #[error("{found} clusters exceeds the per-event cap of {cap}")]
    ClusterCap { found: usize, cap: usize },
}

/// A contiguous group of above-threshold hits on one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub layer: u8,
    pub first_cell: u16,
    pub size: u16,
    /// Summed ADC over the member hits.
    pub charge: u32,
    /// Charge-weighted mean cell position.
    pub centroid: f64,
}

/// A chain of clusters aligned across consecutive layers.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub points: u16,
    /// Mean cluster charge along the chain.
    pub charge: f64,
    /// Centroid drift per layer.
    pub slope: f64,
    /// Extrapolated centroid at layer 0.
    pub origin: f64,
}

impl Track {
    /// Centroid position extrapolated to the given depth.
    pub fn position_at(&self, depth: f64) -> f64 {
        self.origin + self.slope * depth
    }
}

/// A crossing point estimated from the track ensemble.
#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    pub z: f64,
    pub tracks: u16,
}

/// Groups adjacent above-threshold cells on each layer into clusters.
pub struct ClusterFinder {
    adc_threshold: u16,
    max_clusters: usize,
}

impl ClusterFinder {
    pub fn new(adc_threshold: u16, max_clusters: usize) -> Self {
        Self {
            adc_threshold,
            max_clusters,
        }
    }

    pub fn find(&self, event: &DecodedEvent) -> Result<Vec<Cluster>, RecoError> {
        let mut by_layer: BTreeMap<u8, Vec<Hit>> = BTreeMap::new();
        for hit in &event.hits {
            if hit.adc >= self.adc_threshold {
                by_layer.entry(hit.layer).or_default().push(*hit);
            }
        }

        let mut clusters = Vec::new();
        for (layer, mut hits) in by_layer {
            hits.sort_unstable_by_key(|h| h.cell);

            let mut current: Option<(u16, u16, u32, f64)> = None;
            for hit in hits {
                match current.take() {
                    Some((first, size, charge, weighted))
                        if hit.cell as u32 == first as u32 + size as u32 =>
                    {
                        current = Some((
                            first,
                            size + 1,
                            charge + hit.adc as u32,
                            weighted + hit.cell as f64 * hit.adc as f64,
                        ));
                    }
                    Some(done) => {
                        clusters.push(Self::close(layer, done));
                        current = Some(Self::open(hit));
                    }
                    None => current = Some(Self::open(hit)),
                }
            }
            if let Some(done) = current {
                clusters.push(Self::close(layer, done));
            }
        }

        if clusters.len() > self.max_clusters {
            return Err(RecoError::ClusterCap {
                found: clusters.len(),
                cap: self.max_clusters,
            });
        }

        Ok(clusters)
    }

    fn open(hit: Hit) -> (u16, u16, u32, f64) {
        (
            hit.cell,
            1,
            hit.adc as u32,
            hit.cell as f64 * hit.adc as f64,
        )
    }

    fn close(layer: u8, (first, size, charge, weighted): (u16, u16, u32, f64)) -> Cluster {
        Cluster {
            layer,
            first_cell: first,
            size,
            charge,
            centroid: weighted / charge as f64,
        }
    }
}

/// Chains clusters across consecutive layers into track candidates.
pub struct TrackBuilder {
    cell_tolerance: f64,
    min_points: usize,
}

impl TrackBuilder {
    pub fn new(cell_tolerance: f64, min_points: usize) -> Self {
        Self {
            cell_tolerance,
            // A slope needs at least two layers.
            min_points: min_points.max(2),
        }
    }

    pub fn build(&self, clusters: &[Cluster]) -> Vec<Track> {
        let mut order: Vec<usize> = (0..clusters.len()).collect();
        order.sort_by(|&a, &b| {
            clusters[a]
                .layer
                .cmp(&clusters[b].layer)
                .then(clusters[a].centroid.total_cmp(&clusters[b].centroid))
        });

        let mut used = vec![false; clusters.len()];
        let mut tracks = Vec::new();

        for &start in &order {
            if used[start] {
                continue;
            }

            let mut chain = vec![start];
            let mut cur = &clusters[start];
            loop {
                let next = order
                    .iter()
                    .copied()
                    .filter(|&i| {
                        !used[i]
                            && clusters[i].layer as u16 == cur.layer as u16 + 1
                            && (clusters[i].centroid - cur.centroid).abs()
                                <= self.cell_tolerance
                    })
                    .min_by(|&a, &b| {
                        let da = (clusters[a].centroid - cur.centroid).abs();
                        let db = (clusters[b].centroid - cur.centroid).abs();
                        da.total_cmp(&db)
                    });
                match next {
                    Some(i) => {
                        chain.push(i);
                        cur = &clusters[i];
                    }
                    None => break,
                }
            }

            if chain.len() < self.min_points {
                continue;
            }

            for &i in &chain {
                used[i] = true;
            }

            let first = &clusters[chain[0]];
            let last = &clusters[chain[chain.len() - 1]];
            let span = (last.layer - first.layer) as f64;
            let slope = (last.centroid - first.centroid) / span;
            let charge = chain
                .iter()
                .map(|&i| clusters[i].charge as f64)
                .sum::<f64>()
                / chain.len() as f64;

            tracks.push(Track {
                points: chain.len() as u16,
                charge,
                slope,
                origin: first.centroid - slope * first.layer as f64,
            });
        }

        tracks
    }
}

/// Estimates a crossing point from pairwise track intersections.
pub struct VertexFinder {
    min_tracks: usize,
}

impl VertexFinder {
    /// Slope differences below this are treated as parallel.
    const PARALLEL_EPS: f64 = 1e-6;

    pub fn new(min_tracks: usize) -> Self {
        Self {
            min_tracks: min_tracks.max(2),
        }
    }

    pub fn find(&self, tracks: &[Track]) -> Vec<Vertex> {
        if tracks.len() < self.min_tracks {
            return Vec::new();
        }

        let mut crossings = Vec::new();
        for i in 0..tracks.len() {
            for j in i + 1..tracks.len() {
                let ds = tracks[i].slope - tracks[j].slope;
                if ds.abs() < Self::PARALLEL_EPS {
                    continue;
                }
                crossings.push((tracks[j].origin - tracks[i].origin) / ds);
            }
        }

        if crossings.is_empty() {
            return Vec::new();
        }

        let z = crossings.iter().sum::<f64>() / crossings.len() as f64;
        vec![Vertex {
            z,
            tracks: tracks.len() as u16,
        }]
    }
}
