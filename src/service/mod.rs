//! Top-level monitor service.
//!
//! One task owns the catalog watcher, the stage runner, the aggregate and
//! the broadcast roster, and drives them as a state machine: wait for a new
//! capture file, run the pipeline over it with cancellation gates between
//! stages, fold the result into run bookkeeping, then persist and broadcast
//! at the boundaries the run tracker reports.

pub mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::snapshot::AggregateSnapshot;
use crate::aggregate::Aggregator;
use crate::broadcast::BroadcastServer;
use crate::capture;
use crate::catalog::{FileWatcher, InputUnit};
use crate::config::Config;
use crate::export::HealthMetrics;
use crate::persist::SnapshotSink;
use crate::pipeline::{RecoContext, StageId, StageOutcome, StageRunner};
use crate::run::{CompletedRun, RunTracker};

pub use status::{ServiceStatus, StatusCell};

/// Operator commands accepted between loop iterations.
#[derive(Debug, Clone, Copy)]
pub enum Command {
    /// Flush the current aggregate under the next sub-run suffix, then reset.
    ForceReset,
}

/// Cheap cloneable handle for controlling a running service from outside
/// its task.
#[derive(Clone)]
pub struct ServiceHandle {
    cancel: CancellationToken,
    commands: mpsc::Sender<Command>,
    status: Arc<StatusCell>,
}

impl ServiceHandle {
    /// Request a cooperative stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Schedule a forced rollover; false if the command queue is full.
    pub fn force_reset(&self) -> bool {
        self.commands.try_send(Command::ForceReset).is_ok()
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.get()
    }
}

/// Orchestrates catalog polling, the reconstruction pipeline, aggregation,
/// persistence and broadcast.
pub struct MonitorService {
    cfg: Config,
    status: Arc<StatusCell>,
    health: Arc<HealthMetrics>,
    watcher: FileWatcher,
    runner: StageRunner,
    tracker: RunTracker,
    aggregator: Aggregator,
    broadcast: BroadcastServer,
    sink: SnapshotSink,
    /// Completed snapshot whose write failed, kept for retry at the next
    /// flush point.
    pending_flush: Option<AggregateSnapshot>,
    /// Encoded frame of the latest snapshot, sent to observers that connect
    /// mid-run. Cleared on reset.
    last_frame: Option<Vec<u8>>,
    cancel: CancellationToken,
    commands: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
}

impl MonitorService {
    /// Build the service: bind the broadcast listener, create the snapshot
    /// directory, check the catalog. Any failure here aborts startup.
    pub async fn new(cfg: Config) -> Result<(Self, ServiceHandle)> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let status = Arc::new(StatusCell::new());

        let catalog_dir = PathBuf::from(&cfg.catalog.path);
        if !catalog_dir.is_dir() {
            bail!("catalog path {} is not a directory", catalog_dir.display());
        }
        let watcher = FileWatcher::new(
            catalog_dir,
            cfg.catalog.extension.clone(),
            cfg.catalog.probe_timeout,
        );

        let runner = StageRunner::new(&cfg.reco);
        let tracker = RunTracker::new(cfg.persist.min_events);
        let aggregator = Aggregator::new(cfg.instance_name.clone());
        let sink =
            SnapshotSink::new(PathBuf::from(&cfg.persist.dir)).context("creating snapshot sink")?;

        let broadcast = BroadcastServer::bind(
            cfg.broadcast_addr()?,
            cfg.broadcast.handshake_timeout,
            cfg.broadcast.send_timeout,
        )
        .await
        .context("starting broadcast listener")?;

        let cancel = CancellationToken::new();
        let (command_tx, commands) = mpsc::channel(4);

        let handle = ServiceHandle {
            cancel: cancel.clone(),
            commands: command_tx.clone(),
            status: Arc::clone(&status),
        };

        Ok((
            Self {
                cfg,
                status,
                health,
                watcher,
                runner,
                tracker,
                aggregator,
                broadcast,
                sink,
                pending_flush: None,
                last_frame: None,
                cancel,
                commands,
                command_tx,
            },
            handle,
        ))
    }

    /// Start the HTTP ops server (/healthz, /metrics, /status, /reset).
    pub async fn start_ops(&self) -> Result<()> {
        self.health
            .start(Arc::clone(&self.status), self.command_tx.clone())
            .await
            .context("starting health metrics server")
    }

    /// Address the broadcast listener actually bound to.
    pub fn broadcast_addr(&self) -> Result<std::net::SocketAddr> {
        self.broadcast.local_addr()
    }

    /// Main loop: poll the catalog, process each new unit, serve clients.
    /// Exits on cancellation or after too many consecutive catalog failures;
    /// every exit path runs the final flush before reporting `Stopped`.
    pub async fn run(mut self) -> Result<()> {
        info!(
            instance = %self.cfg.instance_name,
            catalog = %self.cfg.catalog.path,
            "monitor service started",
        );

        let cancel = self.cancel.clone();
        let mut failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                info!("cancellation requested, stopping");
                break;
            }

            self.drain_commands().await;

            // Newcomers are admitted even while idle.
            self.set_status(ServiceStatus::Connecting);
            let frame = if self.tracker.events() > 0 {
                self.last_frame.as_deref()
            } else {
                None
            };
            self.broadcast.accept_pending(frame).await;
            self.update_client_gauges();

            self.set_status(ServiceStatus::Waiting);
            match self.watcher.poll_for_newest().await {
                Ok(Some(unit)) => {
                    failures = 0;
                    info!(
                        file = %unit.name,
                        run = unit.run,
                        events = unit.events,
                        "new capture file",
                    );
                    self.process_one(unit).await;
                }
                Ok(None) => {
                    failures = 0;
                    self.idle_sleep(&cancel).await;
                }
                Err(e) => {
                    failures += 1;
                    self.health.catalog_errors.inc();
                    warn!(error = %e, consecutive = failures, "catalog poll failed");

                    let limit = self.cfg.catalog.max_consecutive_failures;
                    if limit > 0 && failures >= limit {
                        error!(limit, "catalog failed too many polls in a row, giving up");
                        break;
                    }
                    self.idle_sleep(&cancel).await;
                }
            }
        }

        self.final_flush().await;
        self.set_status(ServiceStatus::Stopped);
        self.health.stop().await?;
        info!("monitor service stopped");

        Ok(())
    }

    /// One-shot processing of an explicit capture file, outside the catalog.
    /// Run id and event count come from the file header; the persistence
    /// threshold is 1 for the duration so even a single event is written out.
    pub async fn process_file(&mut self, path: &Path) -> Result<()> {
        if self.status.get() != ServiceStatus::Stopped {
            bail!("one-shot processing requires a stopped service");
        }

        let header = capture::probe(path)
            .await
            .with_context(|| format!("probing {}", path.display()))?;
        if header.events == 0 {
            bail!("capture {} declares zero events", path.display());
        }

        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| path.display().to_string());
        let producer = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        let unit = InputUnit {
            path: path.to_path_buf(),
            name,
            producer,
            run: header.run,
            events: header.events,
        };

        let saved_min = self.tracker.min_events();
        self.tracker.set_min_events(1);

        self.process_one(unit).await;
        self.final_flush().await;

        // Leave the service reusable: next one-shot starts from scratch.
        self.aggregator.reset();
        self.tracker = RunTracker::new(saved_min);
        self.last_frame = None;
        self.set_status(ServiceStatus::Stopped);

        Ok(())
    }

    /// Run one unit through the pipeline and publish the result.
    async fn process_one(&mut self, unit: InputUnit) {
        // 1. Run boundary first: the incoming unit may belong to a new run.
        if let Some(completed) = self.tracker.observe(unit.run) {
            info!(
                finished_run = completed.run,
                new_run = unit.run,
                events = completed.events,
                "run boundary",
            );
            self.finish_run(completed).await;
        }

        let fill_errors_before = self.aggregator.fill_errors();

        // 2. Stages in order; the runner refuses each stage once cancelled.
        let mut ctx = RecoContext::new();
        for stage in StageId::ALL {
            self.set_status(ServiceStatus::for_stage(stage));

            let outcome = self
                .runner
                .run_stage(stage, &unit, &mut ctx, &mut self.aggregator, &self.cancel)
                .await;
            match outcome {
                StageOutcome::Success => {
                    if stage == StageId::FindVertices {
                        // Reconstruction done: nudge the display.
                        self.broadcast.notify_display().await;
                    }
                }
                StageOutcome::Failure(failure) => {
                    warn!(
                        stage = %failure.stage,
                        file = %unit.name,
                        run = unit.run,
                        sub_run = self.tracker.sub_run(),
                        error = %failure.reason,
                        "stage failed, unit dropped",
                    );
                    self.health
                        .stage_failures
                        .with_label_values(&[failure.stage.as_str()])
                        .inc();
                    return;
                }
                StageOutcome::Aborted => {
                    info!(file = %unit.name, stage = %stage, "unit aborted by cancellation");
                    return;
                }
            }
        }

        // 3. Fold into run bookkeeping and rebuild the broadcast frame.
        self.set_status(ServiceStatus::Updating);
        self.tracker.record_events(ctx.filled);
        self.health.events_processed.inc_by(ctx.filled as f64);
        self.health.files_processed.inc();

        let new_fill_errors = self
            .aggregator
            .fill_errors()
            .saturating_sub(fill_errors_before);
        if new_fill_errors > 0 {
            self.health.fill_errors.inc_by(new_fill_errors as f64);
        }

        let snapshot = self.aggregator.snapshot(
            unit.run,
            self.tracker.sub_run(),
            self.tracker.events(),
        );
        match snapshot.encode() {
            Ok(frame) => self.last_frame = Some(frame),
            Err(e) => warn!(error = %e, "snapshot serialization failed, frame not updated"),
        }
        self.update_run_gauges();

        // 4. Admit pending clients, with the fresh frame for registration.
        self.set_status(ServiceStatus::Connecting);
        let frame = if self.tracker.events() > 0 {
            self.last_frame.as_deref()
        } else {
            None
        };
        self.broadcast.accept_pending(frame).await;

        // 5. Push to every observer.
        self.set_status(ServiceStatus::Broadcasting);
        if let Some(frame) = &self.last_frame {
            let delivered = self.broadcast.push_snapshot(frame).await;
            if delivered > 0 {
                self.health.snapshots_broadcast.inc_by(delivered as f64);
            }
            debug!(delivered, bytes = frame.len(), "snapshot broadcast");
        }
        self.update_client_gauges();
    }

    /// Flush-then-reset for a completed run. Ordering matters: a pending
    /// failed write goes first, then the completed aggregate is persisted
    /// under its own (old) coordinates, then everything is cleared.
    async fn finish_run(&mut self, completed: CompletedRun) {
        self.set_status(ServiceStatus::Writing);
        self.retry_pending_flush().await;

        if self.tracker.should_persist(&completed) {
            let snapshot =
                self.aggregator
                    .snapshot(completed.run, completed.sub_run, completed.events);
            self.flush_snapshot(snapshot).await;
        } else {
            debug!(
                run = completed.run,
                events = completed.events,
                min_events = self.tracker.min_events(),
                "snapshot discarded below event threshold",
            );
        }

        self.set_status(ServiceStatus::Resetting);
        self.aggregator.reset();
        self.last_frame = None;
        self.update_run_gauges();
    }

    /// Final flush on the way out: retry anything pending, then persist the
    /// current aggregate if it clears the threshold.
    async fn final_flush(&mut self) {
        self.set_status(ServiceStatus::Writing);
        self.retry_pending_flush().await;

        if let Some(completed) = self.tracker.completed_now() {
            if self.tracker.should_persist(&completed) {
                let snapshot =
                    self.aggregator
                        .snapshot(completed.run, completed.sub_run, completed.events);
                self.flush_snapshot(snapshot).await;
            } else {
                debug!(
                    run = completed.run,
                    events = completed.events,
                    "final snapshot discarded below event threshold",
                );
            }
        }
    }

    async fn retry_pending_flush(&mut self) {
        let Some(snapshot) = self.pending_flush.take() else {
            return;
        };
        match self.sink.flush(&snapshot).await {
            Ok(_) => self.health.snapshots_persisted.inc(),
            Err(e) => {
                self.health.persist_errors.inc();
                warn!(
                    error = %e,
                    run = snapshot.run,
                    "pending snapshot write failed again, keeping it",
                );
                self.pending_flush = Some(snapshot);
            }
        }
    }

    /// Persist one snapshot; on failure park it in the single pending slot,
    /// displacing whatever older snapshot was stuck there.
    async fn flush_snapshot(&mut self, snapshot: AggregateSnapshot) {
        match self.sink.flush(&snapshot).await {
            Ok(_) => self.health.snapshots_persisted.inc(),
            Err(e) => {
                self.health.persist_errors.inc();
                warn!(
                    error = %e,
                    run = snapshot.run,
                    "snapshot write failed, will retry at the next flush point",
                );
                if let Some(old) = self.pending_flush.replace(snapshot) {
                    warn!(run = old.run, "dropping older pending snapshot");
                }
            }
        }
    }

    async fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::ForceReset => {
                    info!("operator reset requested");
                    match self.tracker.force_rollover() {
                        Some(completed) => self.finish_run(completed).await,
                        None => debug!("reset ignored, no run adopted yet"),
                    }
                }
            }
        }
    }

    async fn idle_sleep(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.cfg.catalog.poll_interval) => {}
        }
    }

    fn set_status(&self, status: ServiceStatus) {
        self.status.set(status);
        self.health.service_status.set(status.code() as f64);
    }

    fn update_run_gauges(&self) {
        if let Some(run) = self.tracker.current_run() {
            self.health.current_run.set(f64::from(run));
        }
        self.health
            .current_sub_run
            .set(f64::from(self.tracker.sub_run()));
        self.health.events_in_run.set(self.tracker.events() as f64);
    }

    fn update_client_gauges(&self) {
        self.health
            .connected_clients
            .with_label_values(&["observer"])
            .set(self.broadcast.observer_count() as f64);
        self.health
            .connected_clients
            .with_label_values(&["display"])
            .set(if self.broadcast.has_display() { 1.0 } else { 0.0 });
    }
}
