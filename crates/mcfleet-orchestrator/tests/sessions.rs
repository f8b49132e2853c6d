//! Log fan-out and stats sampling against the scripted runtime.

mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::timeout;

use mcfleet_common::{
    CreateInstancePayload, FleetError, InMemoryRepository, InstanceRepository, LogSource,
    ServerKind, StatsEvent, UsageSample,
};
use mcfleet_orchestrator::{Fleet, StatsSampler};
use support::MockRuntime;

fn payload(name: &str, port: u16, directory: &Path) -> CreateInstancePayload {
    CreateInstancePayload {
        name: name.to_string(),
        port,
        container_port: 25565,
        additional_ports: vec![],
        version: "1.20.4".to_string(),
        kind: ServerKind::Vanilla,
        directory: directory.to_path_buf(),
        eula: true,
        cpu_limit: 2.0,
        memory_limit_mib: 2048,
        rcon_port: port + 1,
    }
}

fn fleet() -> (Fleet, Arc<MockRuntime>, Arc<InMemoryRepository>) {
    support::init_tracing();
    let runtime = Arc::new(MockRuntime::new());
    let repository = Arc::new(InMemoryRepository::new());
    (
        Fleet::new(repository.clone(), runtime.clone()),
        runtime,
        repository,
    )
}

fn frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![stream_type, 0, 0, 0];
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

fn sample(memory: u64) -> UsageSample {
    UsageSample {
        cpu_total_usage: 2_000_000,
        system_cpu_usage: Some(20_000_000),
        precpu_total_usage: 1_000_000,
        pre_system_cpu_usage: Some(10_000_000),
        online_cpus: Some(2),
        memory_usage: memory,
    }
}

#[tokio::test]
async fn attached_subscribers_see_demultiplexed_lines() -> anyhow::Result<()> {
    let (fleet, runtime, _) = fleet();
    let dir = tempfile::tempdir()?;

    // Two frames, the second split mid-payload across chunks; a non-output
    // frame type interleaved.
    let first = frame(1, b"[Server] Starting minecraft server\n");
    let second = frame(2, b"[Server] Done (3.14s)!\n");
    let noise = frame(0, b"dropped\n");
    {
        let mut chunks = runtime.log_chunks.lock().unwrap();
        chunks.push(first);
        chunks.push(noise[..6].to_vec());
        chunks.push(noise[6..].to_vec());
        chunks.push(second[..11].to_vec());
        chunks.push(second[11..].to_vec());
    }

    let record = fleet.create(payload("alpha", 42621, dir.path())).await?;
    let mut subscriber = fleet.attach_logs(&record.id).await?;

    let event = timeout(Duration::from_secs(1), subscriber.recv()).await??;
    assert_eq!(event.line, "[Server] Starting minecraft server");
    assert_eq!(event.source, LogSource::Server);

    let event = timeout(Duration::from_secs(1), subscriber.recv()).await??;
    assert_eq!(event.line, "[Server] Done (3.14s)!");
    Ok(())
}

#[tokio::test]
async fn command_echo_interleaves_with_server_output() -> anyhow::Result<()> {
    let (fleet, _, _) = fleet();
    let dir = tempfile::tempdir()?;

    let record = fleet.create(payload("alpha", 42631, dir.path())).await?;
    let mut subscriber = fleet.attach_logs(&record.id).await?;

    // No RCON server is listening, so the command fails after its single
    // retry; both the echo and the failure land on the log channel.
    let result = fleet.execute_command(&record.id, "list").await;
    assert!(result.is_err());

    let mut lines = Vec::new();
    while let Ok(Ok(event)) = timeout(Duration::from_millis(500), subscriber.recv()).await {
        if event.source == LogSource::Command {
            lines.push(event.line);
        }
        if lines.len() == 2 {
            break;
        }
    }
    assert_eq!(lines[0], "> list");
    assert!(lines[1].starts_with("Error: "), "got {:?}", lines[1]);
    Ok(())
}

#[tokio::test]
async fn attach_requires_a_container_identity() -> anyhow::Result<()> {
    let (fleet, _, repository) = fleet();
    let dir = tempfile::tempdir()?;

    let record = fleet.create(payload("alpha", 42641, dir.path())).await?;
    repository.update_container_id(&record.id, None).await?;

    let err = fleet.attach_logs(&record.id).await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound));

    let err = fleet.attach_logs("srv-ghost").await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound));
    Ok(())
}

#[tokio::test]
async fn sampler_caches_snapshots_while_the_stream_is_live() -> anyhow::Result<()> {
    let (fleet, runtime, _) = fleet();
    let dir = tempfile::tempdir()?;
    runtime.samples.lock().unwrap().push(sample(512 * 1024 * 1024));

    let record = fleet.create(payload("alpha", 42651, dir.path())).await?;
    let container_id = record.container_id.clone().unwrap();

    let sampler = StatsSampler::new(runtime.clone());
    // First call opens the stream; no sample has been computed yet.
    assert!(sampler
        .get_or_start(&record.id, &container_id, &record.name)
        .await
        .is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = sampler
        .get_or_start(&record.id, &container_id, &record.name)
        .await
        .expect("sample should be cached");
    assert_eq!(snapshot.memory, 512 * 1024 * 1024);
    // (1_000_000 / 10_000_000) × 2 cpus × 100
    assert_eq!(snapshot.cpu, 20.0);
    assert_eq!(snapshot.status, "running");
    assert!(sampler.get_all().contains_key(&record.id));

    sampler.evict(&record.id);
    assert!(sampler.get(&record.id).is_none());
    Ok(())
}

#[tokio::test]
async fn sampler_returns_nothing_for_stopped_containers() -> anyhow::Result<()> {
    let (fleet, runtime, _) = fleet();
    let dir = tempfile::tempdir()?;

    let record = fleet.create(payload("alpha", 42661, dir.path())).await?;
    let container_id = record.container_id.clone().unwrap();
    assert_eq!(fleet.stop(&record.id).await, mcfleet_common::OpStatus::Stopped);

    let sampler = StatsSampler::new(runtime.clone());
    assert!(sampler
        .get_or_start(&record.id, &container_id, &record.name)
        .await
        .is_none());
    assert!(sampler.get(&record.id).is_none());
    Ok(())
}

#[tokio::test]
async fn watch_emits_heartbeats_then_snapshots() -> anyhow::Result<()> {
    let (fleet, runtime, _) = fleet();
    let dir = tempfile::tempdir()?;
    runtime.samples.lock().unwrap().push(sample(1024));

    let record = fleet.create(payload("alpha", 42671, dir.path())).await?;
    let mut events = Box::pin(fleet.watch_stats(record.id.clone()));

    // The first tick starts the sample stream and has nothing cached yet.
    let first = timeout(Duration::from_secs(2), events.next()).await?.unwrap();
    assert!(matches!(first, StatsEvent::Heartbeat));

    let second = timeout(Duration::from_secs(3), events.next()).await?.unwrap();
    match second {
        StatsEvent::Snapshot(snapshot) => {
            assert_eq!(snapshot.memory, 1024);
            assert_eq!(snapshot.id, record.id);
        }
        StatsEvent::Heartbeat => panic!("expected a snapshot on the second tick"),
    }
    Ok(())
}

#[tokio::test]
async fn watch_ends_when_the_record_disappears() -> anyhow::Result<()> {
    let (fleet, _, _) = fleet();
    let dir = tempfile::tempdir()?;

    let record = fleet.create(payload("alpha", 42681, dir.path())).await?;
    let mut events = Box::pin(fleet.watch_stats(record.id.clone()));
    let _ = timeout(Duration::from_secs(2), events.next()).await?;

    assert_eq!(
        fleet.remove(&record.id, false).await,
        mcfleet_common::OpStatus::Removed
    );
    let end = timeout(Duration::from_secs(3), events.next()).await?;
    assert!(end.is_none());
    Ok(())
}
