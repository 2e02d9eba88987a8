use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the watchoor service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifies this watchoor instance in snapshots and logs.
    #[serde(default)]
    pub instance_name: String,

    /// Capture file catalog configuration.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Reconstruction thresholds.
    #[serde(default)]
    pub reco: RecoConfig,

    /// Snapshot persistence configuration.
    #[serde(default)]
    pub persist: PersistConfig,

    /// Snapshot broadcast listener configuration.
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Capture file catalog configuration.
#[derive(Debug, Deserialize)]
pub struct CatalogConfig {
    /// Directory to poll for capture files.
    #[serde(default)]
    pub path: String,

    /// Capture file extension, without the dot. Default: "raw".
    #[serde(default = "default_extension")]
    pub extension: String,

    /// How often to poll the catalog when idle. Default: 2s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Upper bound on one catalog round trip (listing plus header probe).
    /// Default: 5s.
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Stop after this many consecutive failed polls. Default: 0 (never).
    #[serde(default)]
    pub max_consecutive_failures: u32,
}

/// Reconstruction thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct RecoConfig {
    /// Minimum ADC count for a cell to enter clustering. Default: 40.
    #[serde(default = "default_adc_threshold")]
    pub adc_threshold: u16,

    /// Upper bound on clusters per event; beyond it the event is rejected.
    /// Default: 256.
    #[serde(default = "default_max_clusters")]
    pub max_clusters_per_event: usize,

    /// Maximum centroid drift (in cells) between consecutive layers when
    /// chaining clusters into a track. Default: 2.0.
    #[serde(default = "default_cell_tolerance")]
    pub cell_tolerance: f64,

    /// Minimum clusters per track. Default: 3.
    #[serde(default = "default_min_track_points")]
    pub min_track_points: usize,

    /// Minimum tracks per vertex. Default: 2.
    #[serde(default = "default_min_vertex_tracks")]
    pub min_vertex_tracks: usize,
}

/// Snapshot persistence configuration.
#[derive(Debug, Deserialize)]
pub struct PersistConfig {
    /// Directory receiving `aggregate_{run}.json` snapshot files.
    #[serde(default)]
    pub dir: String,

    /// Minimum events in a run before its snapshot is persisted. Default: 2.
    #[serde(default = "default_min_events")]
    pub min_events: u64,
}

/// Snapshot broadcast listener configuration.
#[derive(Debug, Deserialize)]
pub struct BroadcastConfig {
    /// Listen address for observer/display clients. Default: "0.0.0.0:9327".
    #[serde(default = "default_broadcast_addr")]
    pub addr: String,

    /// How long a new connection has to send its handshake token.
    /// Default: 2s.
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Upper bound on one frame send to one client. Default: 5s.
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_extension() -> String {
    "raw".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_adc_threshold() -> u16 {
    40
}

fn default_max_clusters() -> usize {
    256
}

fn default_cell_tolerance() -> f64 {
    2.0
}

fn default_min_track_points() -> usize {
    3
}

fn default_min_vertex_tracks() -> usize {
    2
}

fn default_min_events() -> u64 {
    2
}

fn default_broadcast_addr() -> String {
    "0.0.0.0:9327".to_string()
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            instance_name: String::new(),
            catalog: CatalogConfig::default(),
            reco: RecoConfig::default(),
            persist: PersistConfig::default(),
            broadcast: BroadcastConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            extension: default_extension(),
            poll_interval: default_poll_interval(),
            probe_timeout: default_probe_timeout(),
            max_consecutive_failures: 0,
        }
    }
}

impl Default for RecoConfig {
    fn default() -> Self {
        Self {
            adc_threshold: default_adc_threshold(),
            max_clusters_per_event: default_max_clusters(),
            cell_tolerance: default_cell_tolerance(),
            min_track_points: default_min_track_points(),
            min_vertex_tracks: default_min_vertex_tracks(),
        }
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            min_events: default_min_events(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            addr: default_broadcast_addr(),
            handshake_timeout: default_handshake_timeout(),
            send_timeout: default_send_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.instance_name.is_empty() {
            bail!("instance_name is required");
        }

        if self.catalog.path.is_empty() {
            bail!("catalog.path is required");
        }

        if self.catalog.extension.is_empty() || self.catalog.extension.contains('.') {
            bail!("catalog.extension must be a bare extension without a dot");
        }

        if self.catalog.poll_interval.is_zero() {
            bail!("catalog.poll_interval must be positive");
        }

        if self.catalog.probe_timeout.is_zero() {
            bail!("catalog.probe_timeout must be positive");
        }

        if self.reco.max_clusters_per_event == 0 {
            bail!("reco.max_clusters_per_event must be positive");
        }

        if !(self.reco.cell_tolerance.is_finite() && self.reco.cell_tolerance > 0.0) {
            bail!("reco.cell_tolerance must be a positive finite number");
        }

        if self.reco.min_track_points < 2 {
            bail!("reco.min_track_points must be at least 2");
        }

        if self.reco.min_vertex_tracks < 2 {
            bail!("reco.min_vertex_tracks must be at least 2");
        }

        if self.persist.dir.is_empty() {
            bail!("persist.dir is required");
        }

        if self.persist.min_events == 0 {
            bail!("persist.min_events must be at least 1");
        }

        if self.broadcast.addr.parse::<SocketAddr>().is_err() {
            bail!(
                "broadcast.addr is not a valid socket address: {}",
                self.broadcast.addr
            );
        }

        if self.broadcast.handshake_timeout.is_zero() {
            bail!("broadcast.handshake_timeout must be positive");
        }

        if self.broadcast.send_timeout.is_zero() {
            bail!("broadcast.send_timeout must be positive");
        }

        Ok(())
    }

    /// Parsed broadcast listen address. Call after `validate()`.
    pub fn broadcast_addr(&self) -> Result<SocketAddr> {
        self.broadcast
            .addr
            .parse()
            .with_context(|| format!("parsing broadcast.addr {}", self.broadcast.addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            instance_name: "test-station".to_string(),
            catalog: CatalogConfig {
                path: "/data/captures".to_string(),
                ..Default::default()
            },
            persist: PersistConfig {
                dir: "/data/snapshots".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.catalog.extension, "raw");
        assert_eq!(cfg.catalog.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.catalog.max_consecutive_failures, 0);
        assert_eq!(cfg.persist.min_events, 2);
        assert_eq!(cfg.broadcast.addr, "0.0.0.0:9327");
        assert_eq!(cfg.health.addr, ":9090");
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validation_missing_instance_name() {
        let mut cfg = valid_config();
        cfg.instance_name = String::new();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("instance_name"));
    }

    #[test]
    fn test_validation_missing_catalog_path() {
        let mut cfg = valid_config();
        cfg.catalog.path = String::new();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("catalog.path"));
    }

    #[test]
    fn test_validation_extension_with_dot() {
        let mut cfg = valid_config();
        cfg.catalog.extension = ".raw".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("catalog.extension"));
    }

    #[test]
    fn test_validation_min_events_zero() {
        let mut cfg = valid_config();
        cfg.persist.min_events = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("min_events"));
    }

    #[test]
    fn test_validation_min_track_points_too_small() {
        let mut cfg = valid_config();
        cfg.reco.min_track_points = 1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("min_track_points"));
    }

    #[test]
    fn test_validation_bad_broadcast_addr() {
        let mut cfg = valid_config();
        cfg.broadcast.addr = "not-an-address".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("broadcast.addr"));
    }

    #[test]
    fn test_validation_cell_tolerance_must_be_finite() {
        let mut cfg = valid_config();
        cfg.reco.cell_tolerance = f64::NAN;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("cell_tolerance"));
    }

    #[test]
    fn test_yaml_round_trip_with_durations() {
        let yaml = r#"
instance_name: station-7
catalog:
  path: /data/captures
  poll_interval: 500ms
  probe_timeout: 1s
persist:
  dir: /data/snapshots
  min_events: 5
broadcast:
  addr: 127.0.0.1:9327
  send_timeout: 250ms
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate().expect("validate");
        assert_eq!(cfg.instance_name, "station-7");
        assert_eq!(cfg.catalog.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.persist.min_events, 5);
        assert_eq!(cfg.broadcast.send_timeout, Duration::from_millis(250));
        // Untouched sections keep their defaults.
        assert_eq!(cfg.catalog.extension, "raw");
        assert_eq!(cfg.reco.min_track_points, 3);
    }
}
