use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::debug;

use mcfleet_common::runtime::LABEL_DATA_DIR;
use mcfleet_common::{ContainerRuntime, FleetError};

/// Fleet-wide invariant checker for host ports and data directories.
///
/// Both checks are advisory snapshots over a fresh container listing, not a
/// lock; the runtime-call sites translate engine-reported port conflicts into
/// the same result class.
#[derive(Clone)]
pub struct AllocationGuard {
    runtime: Arc<dyn ContainerRuntime>,
}

impl AllocationGuard {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Fails when any existing container publishes `port`, or when the port
    /// cannot be bound on the host.
    pub async fn check_port_free(&self, port: u16) -> Result<(), FleetError> {
        let containers = self.runtime.list_containers(None).await?;
        for container in &containers {
            if container.published_tcp_ports.contains(&port) {
                debug!(%port, container_id = %container.id, "port already published");
                return Err(FleetError::PortInUse(port));
            }
        }
        if !probe_host_port(port).await {
            return Err(FleetError::PortInUse(port));
        }
        Ok(())
    }

    /// Fails when any existing container's data-directory label resolves to
    /// the same absolute path.
    pub async fn check_directory_free(&self, directory: &Path) -> Result<(), FleetError> {
        let wanted = normalize_path(directory);
        let containers = self.runtime.list_containers(None).await?;
        for container in containers {
            if let Some(label) = container.labels.get(LABEL_DATA_DIR) {
                if normalize_path(Path::new(label)) == wanted {
                    return Err(FleetError::DataDirInUse(directory.display().to_string()));
                }
            }
        }
        Ok(())
    }
}

/// A port that cannot be bound on the any-interface address is treated as
/// already occupied.
async fn probe_host_port(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).await.is_ok()
}

/// Resolve a path to absolute form without touching the filesystem.
pub(crate) fn resolve_absolute(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    normalize_path(&absolute)
}

/// Lexical normalization: fold `.` and `..` components so label comparisons
/// are not fooled by equivalent spellings.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}
