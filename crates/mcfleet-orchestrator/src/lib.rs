//! Fleet orchestration: maps durable instance records onto live containers,
//! deciding recreate-vs-reuse per instance, with the command channel, log
//! fan-out and stats sampling riding on the same per-instance identity.

use chrono::Utc;
use futures::Stream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use mcfleet_common::runtime::{LABEL_INSTANCE_ID, SERVER_IMAGE};
use mcfleet_common::{
    generate_instance_id, generate_rcon_password, ContainerRuntime, CreateInstancePayload,
    EditInstancePayload, FleetError, InstanceRecord, InstanceRepository, InstanceView, LogEvent,
    LogSource, OpStatus, Result, StatsEvent, StatsSnapshot,
};

pub mod allocation;
pub mod drift;
pub mod logs;
pub mod rcon;
pub mod stats;

pub use allocation::AllocationGuard;
pub use logs::LogMultiplexer;
pub use rcon::CommandSessions;
pub use stats::StatsSampler;

/// Cadence of the stats watch stream.
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Container state reported for instances with no container at all.
const STATE_MISSING: &str = "missing";

/// The fleet orchestrator. Operations on different instance ids run
/// concurrently; operations on the same id are best-effort idempotent rather
/// than serialized — each one re-reads current state (label lookup, fresh
/// inspect) instead of trusting a cached view.
#[derive(Clone)]
pub struct Fleet {
    repository: Arc<dyn InstanceRepository>,
    runtime: Arc<dyn ContainerRuntime>,
    guard: AllocationGuard,
    sessions: Arc<CommandSessions>,
    logs: Arc<LogMultiplexer>,
    stats: Arc<StatsSampler>,
}

impl Fleet {
    pub fn new(
        repository: Arc<dyn InstanceRepository>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            guard: AllocationGuard::new(runtime.clone()),
            sessions: Arc::new(CommandSessions::new(repository.clone())),
            logs: Arc::new(LogMultiplexer::new()),
            stats: Arc::new(StatsSampler::new(runtime.clone())),
            repository,
            runtime,
        }
    }

    /// All instances joined with their observed container state.
    pub async fn list(&self) -> Result<Vec<InstanceView>> {
        let containers = self.runtime.list_containers(None).await?;
        let records = self.repository.get_all().await?;
        Ok(records
            .into_iter()
            .map(|record| {
                let state = containers
                    .iter()
                    .find(|c| Some(&c.id) == record.container_id.as_ref())
                    .or_else(|| {
                        containers
                            .iter()
                            .find(|c| c.labels.get(LABEL_INSTANCE_ID) == Some(&record.id))
                    })
                    .map(|c| c.state.clone())
                    .unwrap_or_else(|| STATE_MISSING.to_string());
                InstanceView { record, state }
            })
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<InstanceView>> {
        let Some(record) = self.repository.get_by_id(id).await? else {
            return Ok(None);
        };
        let container = match &record.container_id {
            Some(container_id) => self
                .runtime
                .inspect_container(container_id)
                .await
                .ok()
                .map(|observed| observed.status),
            None => None,
        };
        let state = match container {
            Some(status) => status,
            None => self
                .runtime
                .find_by_instance(&record.id)
                .await?
                .map(|c| c.state)
                .unwrap_or_else(|| STATE_MISSING.to_string()),
        };
        Ok(Some(InstanceView { record, state }))
    }

    /// Create a new instance: allocation checks, container build+start, then
    /// record persistence. Atomic from the caller's perspective — on any
    /// container failure no record is persisted and the partial container is
    /// removed best-effort.
    #[instrument(skip(self, payload), fields(name = %payload.name))]
    pub async fn create(&self, payload: CreateInstancePayload) -> Result<InstanceRecord> {
        payload.validate()?;
        let directory = allocation::resolve_absolute(&payload.directory);

        self.guard.check_port_free(payload.port).await?;
        for extra in &payload.additional_ports {
            self.guard.check_port_free(extra.host).await?;
        }
        self.guard.check_directory_free(&directory).await?;

        self.runtime.pull_image(SERVER_IMAGE).await?;

        let now = Utc::now();
        let record = InstanceRecord {
            id: generate_instance_id(),
            name: payload.name.trim().to_string(),
            port: payload.port,
            container_port: payload.container_port,
            additional_ports: payload.additional_ports,
            version: payload.version,
            kind: payload.kind,
            directory,
            cpu_limit: payload.cpu_limit,
            memory_limit_mib: payload.memory_limit_mib,
            rcon_port: payload.rcon_port,
            rcon_password: generate_rcon_password(),
            container_id: None,
            created_at: now,
            updated_at: now,
        };

        let container_id = self
            .runtime
            .create_container(&record)
            .await
            .map_err(creation_error)?;
        if let Err(err) = self.runtime.start_container(&container_id).await {
            if let Err(cleanup) = self.runtime.remove_container(&container_id, true).await {
                warn!(%container_id, error = %cleanup, "failed to remove partial container");
            }
            return Err(creation_error(err));
        }

        let record = self
            .repository
            .create(InstanceRecord {
                container_id: Some(container_id),
                ..record
            })
            .await?;
        info!(instance_id = %record.id, port = record.port, "instance created");
        Ok(record)
    }

    /// Start an instance, recreating its container first when the observed
    /// state has drifted from the desired record.
    #[instrument(skip(self))]
    pub async fn start(&self, id: &str) -> OpStatus {
        if id.trim().is_empty() {
            return OpStatus::MissingId;
        }
        match self.try_start(id).await {
            Ok(status) => status,
            Err(err) => {
                error!(instance_id = %id, error = %err, "start failed");
                err.status()
            }
        }
    }

    async fn try_start(&self, id: &str) -> Result<OpStatus> {
        let Some(record) = self.repository.get_by_id(id).await? else {
            return Ok(OpStatus::NotFound);
        };

        // The stored identity may be stale after external drift; the label
        // lookup is authoritative.
        if let Some(existing) = self.runtime.find_by_instance(&record.id).await? {
            // An uninspectable container is treated as drifted.
            match self.runtime.inspect_container(&existing.id).await.ok() {
                Some(observed) if !drift::needs_recreation(&observed, &record) => {
                    if observed.running {
                        return Ok(OpStatus::AlreadyRunning);
                    }
                    self.runtime.start_container(&existing.id).await?;
                    return Ok(OpStatus::Started);
                }
                _ => {
                    info!(
                        instance_id = %record.id,
                        container_id = %existing.id,
                        "configuration drift detected, recreating container"
                    );
                    self.stop_and_remove(&existing.id).await;
                    self.repository
                        .update_container_id(&record.id, None)
                        .await?;
                }
            }
        }

        let container_id = self.runtime.create_container(&record).await?;
        if let Err(err) = self.runtime.start_container(&container_id).await {
            let _ = self.runtime.remove_container(&container_id, true).await;
            return Err(err.into());
        }
        self.repository
            .update_container_id(&record.id, Some(container_id))
            .await?;
        Ok(OpStatus::Started)
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> OpStatus {
        if id.trim().is_empty() {
            return OpStatus::MissingId;
        }
        match self.try_stop(id).await {
            Ok(status) => status,
            Err(err) => {
                error!(instance_id = %id, error = %err, "stop failed");
                err.status()
            }
        }
    }

    async fn try_stop(&self, id: &str) -> Result<OpStatus> {
        let Some(record) = self.repository.get_by_id(id).await? else {
            return Ok(OpStatus::NotFound);
        };

        let mut observed = match record.container_id.as_deref() {
            Some(container_id) => self.runtime.inspect_container(container_id).await.ok(),
            None => None,
        };
        if observed.is_none() {
            observed = match self.runtime.find_by_instance(&record.id).await? {
                Some(container) => self.runtime.inspect_container(&container.id).await.ok(),
                None => None,
            };
        }
        let Some(observed) = observed else {
            return Ok(OpStatus::NotFound);
        };
        if !observed.running {
            return Ok(OpStatus::AlreadyStopped);
        }

        // Stopping the container invalidates the command session.
        self.sessions.close(&record.id);
        self.runtime.stop_container(&observed.id).await?;
        Ok(OpStatus::Stopped)
    }

    /// Stop then start; a missing instance short-circuits.
    pub async fn restart(&self, id: &str) -> OpStatus {
        let stopped = self.stop(id).await;
        if stopped == OpStatus::NotFound || stopped == OpStatus::MissingId {
            return stopped;
        }
        self.start(id).await
    }

    /// Merge a partial edit into the stored record, re-running the
    /// allocation guard for changed ports/directory only. The running
    /// container is left alone; drift is reconciled lazily on next start.
    #[instrument(skip(self, payload))]
    pub async fn edit(&self, id: &str, payload: EditInstancePayload) -> OpStatus {
        if id.trim().is_empty() {
            return OpStatus::MissingId;
        }
        match self.try_edit(id, payload).await {
            Ok(status) => status,
            Err(err) => {
                error!(instance_id = %id, error = %err, "edit failed");
                err.status()
            }
        }
    }

    async fn try_edit(&self, id: &str, mut payload: EditInstancePayload) -> Result<OpStatus> {
        payload.validate()?;
        let Some(record) = self.repository.get_by_id(id).await? else {
            return Ok(OpStatus::NotFound);
        };

        if let Some(port) = payload.port {
            if port != record.port {
                self.guard.check_port_free(port).await?;
            }
        }
        if let Some(additional) = &payload.additional_ports {
            for extra in additional {
                let already_claimed = record
                    .additional_ports
                    .iter()
                    .any(|mapping| mapping.host == extra.host);
                if !already_claimed {
                    self.guard.check_port_free(extra.host).await?;
                }
            }
        }
        if let Some(directory) = &payload.directory {
            let absolute = allocation::resolve_absolute(directory);
            if absolute != record.directory {
                self.guard.check_directory_free(&absolute).await?;
            }
            payload.directory = Some(absolute);
        }

        self.repository.update(&record.id, payload).await?;
        Ok(OpStatus::Updated)
    }

    /// Tear down the instance: command session, container, optionally the
    /// data directory, then the record. Repeated calls are safe.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str, delete_data: bool) -> OpStatus {
        if id.trim().is_empty() {
            return OpStatus::MissingId;
        }
        match self.try_remove(id, delete_data).await {
            Ok(status) => status,
            Err(err) => {
                error!(instance_id = %id, error = %err, "remove failed");
                err.status()
            }
        }
    }

    async fn try_remove(&self, id: &str, delete_data: bool) -> Result<OpStatus> {
        let Some(record) = self.repository.get_by_id(id).await? else {
            return Ok(OpStatus::NotFound);
        };

        self.sessions.close(&record.id);
        self.logs.close(&record.id);
        self.stats.evict(&record.id);

        let container_id = match record.container_id.clone() {
            Some(container_id) => Some(container_id),
            None => self
                .runtime
                .find_by_instance(&record.id)
                .await?
                .map(|c| c.id),
        };
        if let Some(container_id) = container_id {
            self.stop_and_remove(&container_id).await;
        }

        if delete_data {
            remove_data_dir(&record.directory).await;
        }

        self.repository.delete(&record.id).await?;
        info!(instance_id = %record.id, "instance removed");
        Ok(OpStatus::Removed)
    }

    /// Execute a command over the instance's RCON channel. The echo and the
    /// response (or failure) are interleaved into the instance's log channel.
    pub async fn execute_command(&self, id: &str, command: &str) -> Result<String> {
        if id.trim().is_empty() {
            return Err(FleetError::MissingId);
        }
        let Some(record) = self.repository.get_by_id(id).await? else {
            return Err(FleetError::NotFound);
        };

        self.logs
            .publish(&record.id, LogSource::Command, &format!("> {command}"));
        match self.sessions.execute(&record.id, command).await {
            Ok(response) => {
                if !response.trim().is_empty() {
                    self.logs.publish(&record.id, LogSource::Command, &response);
                }
                Ok(response)
            }
            Err(err) => {
                self.logs
                    .publish(&record.id, LogSource::Command, &format!("Error: {err}"));
                Err(err)
            }
        }
    }

    /// Subscribe to the instance's log channel, demultiplexed from the
    /// container's output and interleaved with command echo events.
    pub async fn attach_logs(&self, id: &str) -> Result<broadcast::Receiver<LogEvent>> {
        let Some(record) = self.repository.get_by_id(id).await? else {
            return Err(FleetError::NotFound);
        };
        let Some(container_id) = record.container_id else {
            return Err(FleetError::NotFound);
        };

        // Subscribe before the pump starts so its first lines are not sent
        // into an empty channel (which would end the pump).
        let receiver = self.logs.subscribe(&record.id);
        if !self.logs.pump_active(&record.id) {
            let raw = self.runtime.container_logs(&container_id).await?;
            self.logs.spawn_pump(&record.id, raw);
        }
        Ok(receiver)
    }

    pub fn stats_snapshot(&self, id: &str) -> Option<StatsSnapshot> {
        self.stats.get(id)
    }

    pub fn all_stats(&self) -> std::collections::HashMap<String, StatsSnapshot> {
        self.stats.get_all()
    }

    /// Periodic stats events for one instance: a snapshot when a sample is
    /// cached, a heartbeat otherwise. Ends when the record disappears.
    /// Cancelling the stream drops only this observation; the shared cache
    /// entry is untouched.
    pub fn watch_stats(&self, id: String) -> impl Stream<Item = StatsEvent> + Send + 'static {
        let repository = self.repository.clone();
        let stats = self.stats.clone();
        async_stream::stream! {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let record = match repository.get_by_id(&id).await {
                    Ok(Some(record)) => record,
                    Ok(None) => break,
                    Err(err) => {
                        debug!(instance_id = %id, error = %err, "stats watch lost the record");
                        break;
                    }
                };
                let snapshot = match &record.container_id {
                    Some(container_id) => {
                        stats.get_or_start(&record.id, container_id, &record.name).await
                    }
                    None => None,
                };
                match snapshot {
                    Some(snapshot) => yield StatsEvent::Snapshot(snapshot),
                    None => yield StatsEvent::Heartbeat,
                }
            }
        }
    }

    /// Stop then force-remove, tolerating a container that is already gone.
    async fn stop_and_remove(&self, container_id: &str) {
        if let Err(err) = self.runtime.stop_container(container_id).await {
            debug!(%container_id, error = %err, "stop before removal failed");
        }
        if let Err(err) = self.runtime.remove_container(container_id, true).await {
            debug!(%container_id, error = %err, "container removal failed (may already be gone)");
        }
    }
}

fn creation_error(err: mcfleet_common::RuntimeError) -> FleetError {
    match err {
        conflict @ mcfleet_common::RuntimeError::PortConflict(_) => FleetError::Runtime(conflict),
        other => FleetError::CreationFailed(other.to_string()),
    }
}

/// Recursively delete an instance's data directory, refusing root-ish paths
/// and ignoring deletion errors.
async fn remove_data_dir(directory: &Path) {
    if directory.as_os_str().is_empty() || !directory.is_absolute() || directory.parent().is_none()
    {
        warn!(directory = %directory.display(), "refusing to delete data directory");
        return;
    }
    if let Err(err) = tokio::fs::remove_dir_all(directory).await {
        debug!(directory = %directory.display(), error = %err, "data directory deletion failed");
    }
}
