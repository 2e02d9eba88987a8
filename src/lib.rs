//! watchoor: a capture-file monitoring agent.
//!
//! Watches a catalog directory for raw capture files, runs each new file
//! through a staged reconstruction pipeline, accumulates run-scoped
//! statistics, persists snapshots at run boundaries, and broadcasts the
//! live aggregate to connected TCP clients.

pub mod aggregate;
pub mod broadcast;
pub mod capture;
pub mod catalog;
pub mod config;
pub mod export;
pub mod persist;
pub mod pipeline;
pub mod reco;
pub mod run;
pub mod service;
