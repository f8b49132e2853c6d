use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::HashMap;

use crate::{InstanceRecord, RuntimeError};

/// Image every instance container runs.
pub const SERVER_IMAGE: &str = "itzg/minecraft-server";

/// Label identifying which instance a container belongs to. At most one
/// container carries a given instance id at any time.
pub const LABEL_INSTANCE_ID: &str = "mcfleet.instance_id";
pub const LABEL_NAME: &str = "mcfleet.name";
pub const LABEL_PORT: &str = "mcfleet.port";
pub const LABEL_CONTAINER_PORT: &str = "mcfleet.container_port";
pub const LABEL_VERSION: &str = "mcfleet.version";
pub const LABEL_KIND: &str = "mcfleet.kind";
pub const LABEL_DATA_DIR: &str = "mcfleet.data_dir";

pub const ENV_EULA: &str = "EULA";
pub const ENV_VERSION: &str = "VERSION";
pub const ENV_KIND: &str = "TYPE";
pub const ENV_SERVER_PORT: &str = "SERVER_PORT";
pub const ENV_ENABLE_RCON: &str = "ENABLE_RCON";
pub const ENV_RCON_PORT: &str = "RCON_PORT";
pub const ENV_RCON_PASSWORD: &str = "RCON_PASSWORD";

/// Identifying labels a container must carry for its instance.
pub fn desired_labels(desired: &InstanceRecord) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_INSTANCE_ID.to_string(), desired.id.clone()),
        (LABEL_NAME.to_string(), desired.name.clone()),
        (LABEL_PORT.to_string(), desired.port.to_string()),
        (
            LABEL_CONTAINER_PORT.to_string(),
            desired.container_port.to_string(),
        ),
        (LABEL_VERSION.to_string(), desired.version.clone()),
        (LABEL_KIND.to_string(), desired.kind.to_string()),
        (
            LABEL_DATA_DIR.to_string(),
            desired.directory.display().to_string(),
        ),
    ])
}

/// Environment a container must carry for its instance. Doubles as the
/// tracked-field contract for drift detection: every entry must be present
/// verbatim in a container's observed environment.
pub fn desired_env(desired: &InstanceRecord) -> Vec<String> {
    vec![
        format!("{ENV_EULA}=TRUE"),
        format!("{ENV_VERSION}={}", desired.version),
        format!("{ENV_KIND}={}", desired.kind),
        format!("{ENV_SERVER_PORT}={}", desired.container_port),
        format!("{ENV_ENABLE_RCON}=TRUE"),
        format!("{ENV_RCON_PORT}={}", desired.rcon_port),
        format!("{ENV_RCON_PASSWORD}={}", desired.rcon_password),
    ]
}

/// The `host:container` volume bind for an instance's data directory.
pub fn desired_data_bind(desired: &InstanceRecord) -> String {
    format!("{}:/data", desired.directory.display())
}

/// Raw bytes from the engine's log endpoint, still in its multiplexed
/// framing.
pub type ByteStream = BoxStream<'static, Result<Bytes, RuntimeError>>;

/// Live resource-usage samples for one container.
pub type SampleStream = BoxStream<'static, Result<UsageSample, RuntimeError>>;

/// One entry from a container listing.
#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub state: String,
    /// Host-side tcp ports this container publishes.
    pub published_tcp_ports: Vec<u16>,
}

/// Facts read from a container inspect. Never persisted; always re-fetched.
#[derive(Debug, Clone, Default)]
pub struct ObservedContainer {
    pub id: String,
    pub labels: HashMap<String, String>,
    /// `KEY=VALUE` pairs as the engine reports them.
    pub env: Vec<String>,
    /// Container-side `"port/proto"` key to host port value.
    pub port_bindings: HashMap<String, String>,
    /// Volume bind strings, `host:container` form.
    pub binds: Vec<String>,
    pub nano_cpus: Option<i64>,
    pub memory_bytes: Option<i64>,
    pub running: bool,
    pub restarting: bool,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
}

/// One raw resource-usage sample, as reported by the engine's stats
/// endpoint. CPU counters are cumulative; consumers derive percentages
/// from deltas against the previous reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageSample {
    pub cpu_total_usage: u64,
    pub system_cpu_usage: Option<u64>,
    pub precpu_total_usage: u64,
    pub pre_system_cpu_usage: Option<u64>,
    pub online_cpus: Option<u32>,
    pub memory_usage: u64,
}

/// Capability surface of the container runtime. All calls are fallible and
/// asynchronous; the orchestrator treats every one as an external RPC.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers (including stopped ones), optionally filtered by a
    /// `key=value` label expression.
    async fn list_containers(
        &self,
        label_filter: Option<&str>,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Locate the container carrying an instance's id label, if any.
    async fn find_by_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<ContainerSummary>, RuntimeError> {
        let filter = format!("{LABEL_INSTANCE_ID}={instance_id}");
        Ok(self
            .list_containers(Some(&filter))
            .await?
            .into_iter()
            .next())
    }

    /// Build a container from the desired record (labels, env, port
    /// bindings, data bind, resource limits). Returns the new container id;
    /// the container is not started.
    async fn create_container(&self, desired: &InstanceRecord) -> Result<String, RuntimeError>;

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn inspect_container(&self, container_id: &str)
        -> Result<ObservedContainer, RuntimeError>;

    /// Raw log stream in the engine's multiplexed framing.
    async fn container_logs(&self, container_id: &str) -> Result<ByteStream, RuntimeError>;

    async fn container_stats(&self, container_id: &str) -> Result<SampleStream, RuntimeError>;

    /// Pull an image; a no-op when the image is already present.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;
}
