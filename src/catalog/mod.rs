//! Catalog polling and input discovery.
//!
//! The catalog is a directory where producers deposit finished capture files
//! named `{producer}_{date}_{time}.{ext}`. [`FileWatcher`] scans it on demand,
//! selects the newest entry by (date, time), and hands back at most one
//! not-yet-seen [`InputUnit`] per poll.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::capture;

/// Errors from one catalog round trip. Transient from the caller's point of
/// view: the next poll retries from scratch.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("listing catalog {dir}: {source}")]
    List {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("catalog scan timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

/// Errors parsing one entry name. A failed parse skips the entry.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NameError {
    #[error("missing `.{expected}` extension")]
    WrongExtension { expected: String },

    #[error("expected producer_date_time, got {parts} part(s)")]
    WrongShape { parts: usize },

    #[error("empty producer field")]
    EmptyProducer,

    #[error("non-numeric {field} field")]
    NonNumeric { field: &'static str },
}

/// Parsed catalog entry name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryName {
    pub producer: String,
    pub date: u64,
    pub time: u64,
}

impl EntryName {
    /// Parse `{producer}_{date}_{time}.{ext}`, rejecting anything else.
    pub fn parse(file_name: &str, extension: &str) -> Result<Self, NameError> {
        let stem = match file_name.rsplit_once('.') {
            Some((stem, ext)) if ext == extension => stem,
            _ => {
                return Err(NameError::WrongExtension {
                    expected: extension.to_string(),
                })
            }
        };

        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() != 3 {
            return Err(NameError::WrongShape { parts: parts.len() });
        }
        if parts[0].is_empty() {
            return Err(NameError::EmptyProducer);
        }

        let date: u64 = parts[1]
            .parse()
            .map_err(|_| NameError::NonNumeric { field: "date" })?;
        let time: u64 = parts[2]
            .parse()
            .map_err(|_| NameError::NonNumeric { field: "time" })?;

        Ok(EntryName {
            producer: parts[0].to_string(),
            date,
            time,
        })
    }

    /// Recency key: date first, then time.
    pub fn key(&self) -> (u64, u64) {
        (self.date, self.time)
    }
}

/// One discovered unit of work: a capture file plus its probed header.
/// Immutable once discovered.
#[derive(Debug, Clone)]
pub struct InputUnit {
    pub path: PathBuf,
    /// Logical catalog name (file name as listed).
    pub name: String,
    pub producer: String,
    pub run: u32,
    pub events: u32,
}

/// Polls the catalog directory and yields each new capture file once.
pub struct FileWatcher {
    dir: PathBuf,
    extension: String,
    probe_timeout: Duration,
    last_name: Option<String>,
}

impl FileWatcher {
    pub fn new(dir: PathBuf, extension: String, probe_timeout: Duration) -> Self {
        Self {
            dir,
            extension,
            probe_timeout,
            last_name: None,
        }
    }

    /// Name of the entry most recently returned (or selected and skipped).
    pub fn last_name(&self) -> Option<&str> {
        self.last_name.as_deref()
    }

    /// One poll: select the newest well-formed entry, skip it if it was
    /// already returned, probe its header, and build the unit.
    ///
    /// The selected name is recorded before probing, so a file that fails to
    /// probe is not retried until a newer one appears. Probe problems are
    /// reported as "no new file"; only listing failures surface as errors.
    pub async fn poll_for_newest(&mut self) -> Result<Option<InputUnit>, CatalogError> {
        let scan = timeout(self.probe_timeout, self.scan_newest());
        let newest = match scan.await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CatalogError::Timeout {
                    timeout: self.probe_timeout,
                })
            }
        };

        let Some(entry) = newest else {
            return Ok(None);
        };
        if self.last_name.as_deref() == Some(entry.0.as_str()) {
            return Ok(None);
        }

        let (file_name, parsed) = entry;
        self.last_name = Some(file_name.clone());
        let path = self.dir.join(&file_name);

        let header = match timeout(self.probe_timeout, capture::probe(&path)).await {
            Ok(Ok(header)) => header,
            Ok(Err(e)) => {
                warn!(file = %file_name, error = %e, "skipping unreadable capture");
                return Ok(None);
            }
            Err(_) => {
                warn!(file = %file_name, "capture probe timed out");
                return Ok(None);
            }
        };

        if header.events == 0 {
            warn!(file = %file_name, "capture declares no events, skipping");
            return Ok(None);
        }

        debug!(
            file = %file_name,
            run = header.run,
            events = header.events,
            "selected new capture",
        );

        Ok(Some(InputUnit {
            path,
            name: file_name,
            producer: parsed.producer,
            run: header.run,
            events: header.events,
        }))
    }

    /// List the catalog and pick the entry with the greatest (date, time).
    ///
    /// Entries are compared in name order and ties keep the earlier entry,
    /// so the result does not depend on directory iteration order.
    async fn scan_newest(&self) -> Result<Option<(String, EntryName)>, CatalogError> {
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| CatalogError::List {
                dir: self.dir.clone(),
                source: e,
            })?;

        let mut names = Vec::new();
        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    if let Ok(name) = entry.file_name().into_string() {
                        names.push(name);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(CatalogError::List {
                        dir: self.dir.clone(),
                        source: e,
                    })
                }
            }
        }
        names.sort_unstable();

        let mut newest: Option<(String, EntryName)> = None;
        for name in names {
            let parsed = match EntryName::parse(&name, &self.extension) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };
            let newer = match &newest {
                Some((_, best)) => parsed.key() > best.key(),
                None => true,
            };
            if newer {
                newest = Some((name, parsed));
            }
        }

        Ok(newest)
    }
}
