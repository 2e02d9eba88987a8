use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use watchoor::broadcast::read_frame;
use watchoor::config::{BroadcastConfig, CatalogConfig, Config, PersistConfig};
use watchoor::service::{MonitorService, ServiceStatus};

fn capture_bytes(run: u32, events: &[Vec<(u8, u16, u16)>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"WCA1");
    buf.extend_from_slice(&run.to_le_bytes());
    buf.extend_from_slice(&(events.len() as u32).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    for (seq, hits) in events.iter().enumerate() {
        buf.extend_from_slice(&(seq as u32).to_le_bytes());
        buf.extend_from_slice(&((hits.len() * 5) as u32).to_le_bytes());
        for &(layer, cell, adc) in hits {
            buf.push(layer);
            buf.extend_from_slice(&cell.to_le_bytes());
            buf.extend_from_slice(&adc.to_le_bytes());
        }
    }
    buf
}

fn write_capture(dir: &Path, name: &str, run: u32, events: &[Vec<(u8, u16, u16)>]) {
    std::fs::write(dir.join(name), capture_bytes(run, events)).expect("write capture");
}

/// Writes a capture whose header declares more events than the body holds.
fn write_corrupt_capture(
    dir: &Path,
    name: &str,
    run: u32,
    declared: u32,
    events: &[Vec<(u8, u16, u16)>],
) {
    let mut bytes = capture_bytes(run, events);
    bytes[8..12].copy_from_slice(&declared.to_le_bytes());
    std::fs::write(dir.join(name), bytes).expect("write capture");
}

fn three_events() -> Vec<Vec<(u8, u16, u16)>> {
    vec![
        vec![(0, 10, 300), (0, 11, 280), (1, 10, 250), (2, 11, 220)],
        vec![(0, 40, 190), (1, 41, 180), (2, 41, 170)],
        vec![(0, 90, 90), (1, 90, 95)],
    ]
}

fn two_events() -> Vec<Vec<(u8, u16, u16)>> {
    vec![
        vec![(0, 5, 210), (1, 5, 205), (2, 6, 200)],
        vec![(0, 70, 150), (1, 71, 140)],
    ]
}

fn test_config(catalog: &Path, persist: &Path) -> Config {
    Config {
        instance_name: "blackbox".to_string(),
        catalog: CatalogConfig {
            path: catalog.display().to_string(),
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        },
        persist: PersistConfig {
            dir: persist.display().to_string(),
            ..Default::default()
        },
        broadcast: BroadcastConfig {
            addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn connect(addr: std::net::SocketAddr, token: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(format!("{token}\n").as_bytes())
        .await
        .expect("handshake");
    stream
}

async fn next_snapshot(stream: &mut TcpStream) -> Value {
    let frame = timeout(Duration::from_secs(10), read_frame(stream))
        .await
        .expect("timed out waiting for a snapshot frame")
        .expect("read frame");
    serde_json::from_slice(&frame).expect("snapshot json")
}

/// Reads frames until one describes `run`; registration may duplicate the
/// previous snapshot depending on when the client was admitted.
async fn snapshot_for_run(stream: &mut TcpStream, run: u32) -> Value {
    for _ in 0..10 {
        let snap = next_snapshot(stream).await;
        if snap["run"] == run {
            return snap;
        }
    }
    panic!("never saw a snapshot for run {run}");
}

async fn wait_for_file(path: &Path) {
    for _ in 0..250 {
        if path.is_file() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", path.display());
}

fn read_snapshot_file(path: &Path) -> Value {
    let data = std::fs::read(path).expect("read snapshot file");
    serde_json::from_slice(&data).expect("snapshot file json")
}

#[tokio::test]
async fn service_processes_broadcasts_and_persists_across_run_boundary() {
    let catalog = tempfile::tempdir().expect("catalog dir");
    let persist = tempfile::tempdir().expect("persist dir");

    let cfg = test_config(catalog.path(), persist.path());
    let (service, handle) = MonitorService::new(cfg).await.expect("build service");
    let addr = service.broadcast_addr().expect("local addr");

    let worker = tokio::spawn(service.run());

    let mut observer = connect(addr, "observer").await;
    let mut display = connect(addr, "display").await;

    // First unit: run 7 with three events.
    write_capture(catalog.path(), "dcs_20240301_1200.raw", 7, &three_events());

    let snap = snapshot_for_run(&mut observer, 7).await;
    assert_eq!(snap["instance"], "blackbox");
    assert_eq!(snap["events"], 3);
    assert_eq!(snap["sub_run"], 0);
    assert_eq!(snap["fill_errors"], 0);
    assert!(snap["folders"].as_array().is_some_and(|f| !f.is_empty()));

    // Nothing persisted yet: no boundary has passed.
    assert!(!persist.path().join("aggregate_7.json").is_file());

    // Second unit: run 8 forces the boundary, flushing run 7.
    write_capture(catalog.path(), "dcs_20240301_1201.raw", 8, &two_events());

    let snap = snapshot_for_run(&mut observer, 8).await;
    assert_eq!(snap["events"], 2);

    let run7_file = persist.path().join("aggregate_7.json");
    wait_for_file(&run7_file).await;
    let persisted = read_snapshot_file(&run7_file);
    assert_eq!(persisted["run"], 7);
    assert_eq!(persisted["events"], 3);
    assert_eq!(persisted["sub_run"], 0);

    // The display only ever sees the notification token.
    let note = timeout(Duration::from_secs(10), read_frame(&mut display))
        .await
        .expect("timed out waiting for display notification")
        .expect("read notification");
    assert_eq!(note, b"new event");

    // Cooperative stop: final flush persists run 8 before Stopped.
    handle.cancel();
    worker.await.expect("join worker").expect("service run");
    assert_eq!(handle.status(), ServiceStatus::Stopped);

    let run8_file = persist.path().join("aggregate_8.json");
    assert!(run8_file.is_file());
    let persisted = read_snapshot_file(&run8_file);
    assert_eq!(persisted["run"], 8);
    assert_eq!(persisted["events"], 2);
}

#[tokio::test]
async fn forced_reset_persists_numbered_sub_run() {
    let catalog = tempfile::tempdir().expect("catalog dir");
    let persist = tempfile::tempdir().expect("persist dir");

    let cfg = test_config(catalog.path(), persist.path());
    let (service, handle) = MonitorService::new(cfg).await.expect("build service");
    let addr = service.broadcast_addr().expect("local addr");

    let worker = tokio::spawn(service.run());
    let mut observer = connect(addr, "observer").await;

    write_capture(catalog.path(), "dcs_20240301_0900.raw", 5, &three_events());
    snapshot_for_run(&mut observer, 5).await;

    // Operator reset: the current aggregate goes out as sub-run 1.
    assert!(handle.force_reset());

    let forced_file = persist.path().join("aggregate_5_1.json");
    wait_for_file(&forced_file).await;
    let persisted = read_snapshot_file(&forced_file);
    assert_eq!(persisted["run"], 5);
    assert_eq!(persisted["sub_run"], 1);
    assert_eq!(persisted["events"], 3);

    // No events since the reset: the final flush discards instead of
    // writing an empty aggregate.
    handle.cancel();
    worker.await.expect("join worker").expect("service run");
    assert!(!persist.path().join("aggregate_5.json").is_file());
    assert!(!persist.path().join("aggregate_5_2.json").is_file());
}

#[tokio::test]
async fn stage_failure_drops_unit_and_run_continues() {
    let catalog = tempfile::tempdir().expect("catalog dir");
    let persist = tempfile::tempdir().expect("persist dir");

    let cfg = test_config(catalog.path(), persist.path());
    let (service, handle) = MonitorService::new(cfg).await.expect("build service");
    let addr = service.broadcast_addr().expect("local addr");

    // Declares 5 events but carries 2: the acquire stage rejects the unit.
    write_corrupt_capture(
        catalog.path(),
        "dcs_20240301_1000.raw",
        9,
        5,
        &two_events(),
    );

    let worker = tokio::spawn(service.run());
    let mut observer = connect(addr, "observer").await;

    // Let the corrupt unit be selected and dropped before the good one lands.
    sleep(Duration::from_millis(300)).await;
    write_capture(catalog.path(), "dcs_20240301_1001.raw", 9, &two_events());

    // Only the well-formed unit contributes.
    let snap = snapshot_for_run(&mut observer, 9).await;
    assert_eq!(snap["events"], 2);
    assert_eq!(snap["fill_errors"], 0);

    handle.cancel();
    worker.await.expect("join worker").expect("service run");
    let persisted = read_snapshot_file(&persist.path().join("aggregate_9.json"));
    assert_eq!(persisted["events"], 2);
}

#[tokio::test]
async fn one_shot_processing_persists_even_a_single_event() {
    let catalog = tempfile::tempdir().expect("catalog dir");
    let persist = tempfile::tempdir().expect("persist dir");
    let scratch = tempfile::tempdir().expect("scratch dir");

    let cfg = test_config(catalog.path(), persist.path());
    let (mut service, handle) = MonitorService::new(cfg).await.expect("build service");

    // A single-event capture, by an arbitrary path outside the catalog.
    let file = scratch.path().join("manual-capture.raw");
    std::fs::write(
        &file,
        capture_bytes(12, &[vec![(0, 3, 120), (1, 3, 110), (2, 4, 100)]]),
    )
    .expect("write capture");

    service.process_file(&file).await.expect("one-shot");
    assert_eq!(handle.status(), ServiceStatus::Stopped);

    // min_events is overridden to 1 for the one-shot, so this persists.
    let snapshot_file = persist.path().join("aggregate_12.json");
    assert!(snapshot_file.is_file());
    let persisted = read_snapshot_file(&snapshot_file);
    assert_eq!(persisted["run"], 12);
    assert_eq!(persisted["events"], 1);

    // The run loop never started and the catalog stayed untouched.
    assert_eq!(
        std::fs::read_dir(catalog.path()).expect("read catalog").count(),
        0
    );
}
