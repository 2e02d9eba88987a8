//! Atomic snapshot persistence.
//!
//! Snapshots land as `aggregate_{run}[_{subrun}].json` in the configured
//! directory. Writes go to a temporary name first and are renamed into place,
//! so a concurrent reader never sees a half-written snapshot.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::aggregate::snapshot::AggregateSnapshot;

/// File-based persistence sink for aggregate snapshots.
pub struct SnapshotSink {
    dir: PathBuf,
}

impl SnapshotSink {
    /// Create the sink and its directory. Failure here is an initialization
    /// failure: the service must not start without a writable sink.
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating persist directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one snapshot atomically and return its final path.
    pub async fn flush(&self, snapshot: &AggregateSnapshot) -> Result<PathBuf> {
        let name = snapshot.file_name();
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{name}.tmp"));

        let bytes = snapshot.encode().context("encoding snapshot")?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} into place", tmp.display()))?;

        info!(
            file = %path.display(),
            run = snapshot.run,
            sub_run = snapshot.sub_run,
            events = snapshot.events,
            "persisted aggregate snapshot",
        );

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::aggregate::Aggregator;

    fn snapshot(run: u32, sub_run: u32, events: u64) -> AggregateSnapshot {
        Aggregator::new("test".to_string()).snapshot(run, sub_run, events)
    }

    #[tokio::test]
    async fn test_flush_writes_named_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = SnapshotSink::new(dir.path().join("aggregates")).expect("sink");

        let path = sink.flush(&snapshot(1234, 0, 5)).await.expect("flush");
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("aggregate_1234.json")
        );

        let bytes = std::fs::read(&path).expect("read back");
        let decoded: AggregateSnapshot = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(decoded.run, 1234);
        assert_eq!(decoded.events, 5);
    }

    #[tokio::test]
    async fn test_flush_sub_run_suffix_and_no_leftover_tmp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = SnapshotSink::new(dir.path().to_path_buf()).expect("sink");

        sink.flush(&snapshot(7, 2, 3)).await.expect("flush");

        let entries: Vec<String> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        assert_eq!(entries, vec!["aggregate_7_2.json".to_string()]);
    }

    #[tokio::test]
    async fn test_flush_overwrites_same_coordinates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = SnapshotSink::new(dir.path().to_path_buf()).expect("sink");

        sink.flush(&snapshot(7, 0, 1)).await.expect("flush");
        sink.flush(&snapshot(7, 0, 9)).await.expect("flush again");

        let bytes = std::fs::read(dir.path().join("aggregate_7.json")).expect("read");
        let decoded: AggregateSnapshot = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(decoded.events, 9);
    }

    #[tokio::test]
    async fn test_flush_into_removed_directory_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("gone");
        let sink = SnapshotSink::new(target.clone()).expect("sink");
        std::fs::remove_dir_all(&target).expect("remove");

        assert!(sink.flush(&snapshot(1, 0, 5)).await.is_err());
    }
}
