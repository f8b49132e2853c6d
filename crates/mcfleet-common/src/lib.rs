//! Shared types for the mcfleet workspace: the instance data model, the
//! operation status vocabulary, the error taxonomy, and the capability
//! traits consumed by the orchestrator (container runtime, instance
//! repository).

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

pub mod model;
pub mod repository;
pub mod runtime;

pub use model::{
    generate_instance_id, generate_rcon_password, CreateInstancePayload, EditInstancePayload,
    InstanceRecord, InstanceView, LogEvent, LogSource, PortMapping, ServerKind, StatsEvent,
    StatsSnapshot,
};
pub use repository::{InMemoryRepository, InstanceRepository, RepositoryError};
pub use runtime::{
    ByteStream, ContainerRuntime, ContainerSummary, ObservedContainer, SampleStream, UsageSample,
};

/// Terminal status of a fleet operation, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpStatus {
    NotFound,
    MissingId,
    AlreadyStopped,
    Stopped,
    AlreadyRunning,
    Started,
    PortInUse,
    DataDirInUse,
    ImagePullFailed,
    CreationFailed,
    Updated,
    Removed,
    Error,
}

impl OpStatus {
    /// Human-readable message for the status, suitable for a caller-facing
    /// response body.
    pub fn message(&self) -> &'static str {
        match self {
            OpStatus::NotFound => "Instance not found",
            OpStatus::MissingId => "Missing instance ID",
            OpStatus::AlreadyStopped => "Instance is already stopped",
            OpStatus::Stopped => "Instance stopped successfully",
            OpStatus::AlreadyRunning => "Instance is already running",
            OpStatus::Started => "Instance started successfully",
            OpStatus::PortInUse => "Host port is already in use",
            OpStatus::DataDirInUse => "Data directory is already used by another instance",
            OpStatus::ImagePullFailed => "Server image could not be pulled",
            OpStatus::CreationFailed => "Container creation failed",
            OpStatus::Updated => "Instance updated successfully",
            OpStatus::Removed => "Instance removed successfully",
            OpStatus::Error => "Unexpected error",
        }
    }
}

impl Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            OpStatus::NotFound => "NOT_FOUND",
            OpStatus::MissingId => "MISSING_ID",
            OpStatus::AlreadyStopped => "ALREADY_STOPPED",
            OpStatus::Stopped => "STOPPED",
            OpStatus::AlreadyRunning => "ALREADY_RUNNING",
            OpStatus::Started => "STARTED",
            OpStatus::PortInUse => "PORT_IN_USE",
            OpStatus::DataDirInUse => "DATA_DIR_IN_USE",
            OpStatus::ImagePullFailed => "IMAGE_PULL_FAILED",
            OpStatus::CreationFailed => "CREATION_FAILED",
            OpStatus::Updated => "UPDATED",
            OpStatus::Removed => "REMOVED",
            OpStatus::Error => "ERROR",
        };
        f.write_str(tag)
    }
}

/// Failure raised by the container runtime adapter.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("host port already allocated: {0}")]
    PortConflict(String),
    #[error("image pull failed: {0}")]
    ImagePull(String),
    #[error("engine api error: {0}")]
    Api(String),
    #[error("engine transport error: {0}")]
    Transport(String),
}

/// Top-level error for fleet operations. Each variant maps onto the
/// [`OpStatus`] vocabulary via [`FleetError::status`].
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("instance not found")]
    NotFound,
    #[error("missing instance id")]
    MissingId,
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("port {0} already in use")]
    PortInUse(u16),
    #[error("data directory {0} already used by another instance")]
    DataDirInUse(String),
    #[error("image pull failed: {0}")]
    ImagePull(String),
    #[error("container creation failed: {0}")]
    CreationFailed(String),
    #[error("command channel failure: {0}")]
    Command(String),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl FleetError {
    pub fn status(&self) -> OpStatus {
        match self {
            FleetError::NotFound => OpStatus::NotFound,
            FleetError::MissingId => OpStatus::MissingId,
            FleetError::PortInUse(_) => OpStatus::PortInUse,
            FleetError::DataDirInUse(_) => OpStatus::DataDirInUse,
            FleetError::ImagePull(_) => OpStatus::ImagePullFailed,
            FleetError::CreationFailed(_) => OpStatus::CreationFailed,
            // A port race surfaced by the engine is reported the same way as
            // a pre-check violation.
            FleetError::Runtime(RuntimeError::PortConflict(_)) => OpStatus::PortInUse,
            FleetError::Runtime(RuntimeError::ImagePull(_)) => OpStatus::ImagePullFailed,
            _ => OpStatus::Error,
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
