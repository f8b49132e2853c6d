use chrono::{DateTime, Utc};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;

use crate::FleetError;

/// Server software flavor, mirrored into the container's `TYPE` environment
/// variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerKind {
    #[default]
    Vanilla,
    Forge,
    Fabric,
    Spigot,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::Vanilla => "VANILLA",
            ServerKind::Forge => "FORGE",
            ServerKind::Fabric => "FABRIC",
            ServerKind::Spigot => "SPIGOT",
        }
    }
}

impl Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One host-to-container port binding beyond the primary game port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// Durable desired configuration for one instance. The `container_id` field
/// is bookkeeping only and goes stale when the container is replaced out of
/// band; lookups fall back to the instance-id label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub container_port: u16,
    pub additional_ports: Vec<PortMapping>,
    pub version: String,
    pub kind: ServerKind,
    pub directory: PathBuf,
    pub cpu_limit: f64,
    pub memory_limit_mib: u64,
    pub rcon_port: u16,
    pub rcon_password: String,
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Merge an edit payload into this record. The caller is responsible for
    /// resolving a changed directory to absolute form first.
    pub fn apply(&mut self, patch: &EditInstancePayload) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(port) = patch.port {
            self.port = port;
        }
        if let Some(container_port) = patch.container_port {
            self.container_port = container_port;
        }
        if let Some(additional) = &patch.additional_ports {
            self.additional_ports = additional.clone();
        }
        if let Some(version) = &patch.version {
            self.version = version.clone();
        }
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(directory) = &patch.directory {
            self.directory = directory.clone();
        }
        if let Some(cpu_limit) = patch.cpu_limit {
            self.cpu_limit = cpu_limit;
        }
        if let Some(memory_limit_mib) = patch.memory_limit_mib {
            self.memory_limit_mib = memory_limit_mib;
        }
        if let Some(rcon_port) = patch.rcon_port {
            self.rcon_port = rcon_port;
        }
    }
}

/// An instance record joined with the container state observed at list time
/// (`"missing"` when no container carries the instance label).
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub record: InstanceRecord,
    pub state: String,
}

fn default_port() -> u16 {
    25565
}

fn default_container_port() -> u16 {
    25565
}

fn default_version() -> String {
    "latest".to_string()
}

fn default_cpu_limit() -> f64 {
    2.0
}

fn default_memory_limit() -> u64 {
    2048
}

fn default_rcon_port() -> u16 {
    25575
}

/// Creation request for a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstancePayload {
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default)]
    pub additional_ports: Vec<PortMapping>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub kind: ServerKind,
    pub directory: PathBuf,
    pub eula: bool,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mib: u64,
    #[serde(default = "default_rcon_port")]
    pub rcon_port: u16,
}

impl CreateInstancePayload {
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.name.trim().len() < 3 {
            return Err(FleetError::Validation(
                "name must be at least 3 characters".into(),
            ));
        }
        if !self.eula {
            return Err(FleetError::Validation("EULA must be accepted".into()));
        }
        validate_host_port(self.port)?;
        validate_container_port(self.container_port)?;
        for mapping in &self.additional_ports {
            validate_host_port(mapping.host)?;
            validate_container_port(mapping.container)?;
        }
        validate_host_port(self.rcon_port)?;
        if !(0.5..=16.0).contains(&self.cpu_limit) {
            return Err(FleetError::Validation(
                "cpu limit must be between 0.5 and 16 cores".into(),
            ));
        }
        if !(512..=32768).contains(&self.memory_limit_mib) {
            return Err(FleetError::Validation(
                "memory limit must be between 512 and 32768 MiB".into(),
            ));
        }
        if self.directory.as_os_str().is_empty() {
            return Err(FleetError::Validation("directory is required".into()));
        }
        Ok(())
    }
}

/// Partial edit of an instance; unset fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditInstancePayload {
    pub name: Option<String>,
    pub port: Option<u16>,
    pub container_port: Option<u16>,
    pub additional_ports: Option<Vec<PortMapping>>,
    pub version: Option<String>,
    pub kind: Option<ServerKind>,
    pub directory: Option<PathBuf>,
    pub cpu_limit: Option<f64>,
    pub memory_limit_mib: Option<u64>,
    pub rcon_port: Option<u16>,
}

impl EditInstancePayload {
    pub fn validate(&self) -> Result<(), FleetError> {
        if let Some(name) = &self.name {
            if name.trim().len() < 3 {
                return Err(FleetError::Validation(
                    "name must be at least 3 characters".into(),
                ));
            }
        }
        if let Some(port) = self.port {
            validate_host_port(port)?;
        }
        if let Some(container_port) = self.container_port {
            validate_container_port(container_port)?;
        }
        if let Some(additional) = &self.additional_ports {
            for mapping in additional {
                validate_host_port(mapping.host)?;
                validate_container_port(mapping.container)?;
            }
        }
        if let Some(rcon_port) = self.rcon_port {
            validate_host_port(rcon_port)?;
        }
        if let Some(cpu_limit) = self.cpu_limit {
            if !(0.5..=16.0).contains(&cpu_limit) {
                return Err(FleetError::Validation(
                    "cpu limit must be between 0.5 and 16 cores".into(),
                ));
            }
        }
        if let Some(memory_limit_mib) = self.memory_limit_mib {
            if !(512..=32768).contains(&memory_limit_mib) {
                return Err(FleetError::Validation(
                    "memory limit must be between 512 and 32768 MiB".into(),
                ));
            }
        }
        Ok(())
    }
}

fn validate_host_port(port: u16) -> Result<(), FleetError> {
    if port < 1024 {
        return Err(FleetError::Validation(format!(
            "host port {port} must be 1024 or above"
        )));
    }
    Ok(())
}

fn validate_container_port(port: u16) -> Result<(), FleetError> {
    if port == 0 {
        return Err(FleetError::Validation("container port must be non-zero".into()));
    }
    Ok(())
}

/// Where a log line originated: the server process itself, or the command
/// channel echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Server,
    Command,
}

/// One line fanned out to log subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub line: String,
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
}

/// Last-known resource usage for one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub id: String,
    pub name: String,
    pub cpu: f64,
    pub memory: u64,
    pub uptime: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Event emitted on a stats watch stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatsEvent {
    Snapshot(StatsSnapshot),
    Heartbeat,
}

/// New globally-unique instance id.
pub fn generate_instance_id() -> String {
    format!("srv-{}", uuid::Uuid::new_v4().simple())
}

/// Random credential for the instance's command channel.
pub fn generate_rcon_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}
