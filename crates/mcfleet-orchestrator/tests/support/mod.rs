//! Scripted in-memory container runtime for exercising the orchestrator
//! without a live engine.
#![allow(dead_code)] // not every test binary uses every knob

use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use mcfleet_common::runtime::{
    desired_data_bind, desired_env, desired_labels, LABEL_INSTANCE_ID,
};
use mcfleet_common::{
    ByteStream, ContainerRuntime, ContainerSummary, InstanceRecord, ObservedContainer,
    RuntimeError, SampleStream, UsageSample,
};

#[derive(Clone)]
struct MockContainer {
    id: String,
    desired: InstanceRecord,
    running: bool,
}

impl MockContainer {
    fn host_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.desired.port, self.desired.rcon_port];
        ports.extend(self.desired.additional_ports.iter().map(|m| m.host));
        ports
    }

    fn summary(&self, hide_ports: bool) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            labels: desired_labels(&self.desired),
            state: if self.running { "running" } else { "exited" }.to_string(),
            published_tcp_ports: if hide_ports { vec![] } else { self.host_ports() },
        }
    }

    fn observed(&self) -> ObservedContainer {
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            format!("{}/tcp", self.desired.container_port),
            self.desired.port.to_string(),
        );
        for mapping in &self.desired.additional_ports {
            port_bindings.insert(
                format!("{}/tcp", mapping.container),
                mapping.host.to_string(),
            );
        }
        port_bindings.insert(
            format!("{}/tcp", self.desired.rcon_port),
            self.desired.rcon_port.to_string(),
        );
        ObservedContainer {
            id: self.id.clone(),
            labels: desired_labels(&self.desired),
            env: desired_env(&self.desired),
            port_bindings,
            binds: vec![desired_data_bind(&self.desired)],
            nano_cpus: Some((self.desired.cpu_limit * 1e9) as i64),
            memory_bytes: Some(self.desired.memory_limit_mib as i64 * 1024 * 1024),
            running: self.running,
            restarting: false,
            status: if self.running { "running" } else { "exited" }.to_string(),
            started_at: self.running.then(Utc::now),
        }
    }
}

#[derive(Default)]
pub struct MockRuntime {
    containers: Mutex<Vec<MockContainer>>,
    next_id: AtomicU64,
    /// When set, image pulls fail.
    pub fail_image_pull: AtomicBool,
    /// When set, listings report no published ports, blinding the allocation
    /// guard so the engine-level conflict path can be exercised.
    pub hide_published_ports: AtomicBool,
    /// Raw chunks served by `container_logs`.
    pub log_chunks: Mutex<Vec<Vec<u8>>>,
    /// Samples served by `container_stats` (the stream then stays open).
    pub samples: Mutex<Vec<UsageSample>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn container_ids_for(&self, instance_id: &str) -> Vec<String> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.desired.id == instance_id)
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn is_running(&self, container_id: &str) -> Option<bool> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == container_id)
            .map(|c| c.running)
    }

    /// Simulate an out-of-band removal (e.g. `docker rm` behind our back).
    pub fn remove_out_of_band(&self, container_id: &str) {
        self.containers
            .lock()
            .unwrap()
            .retain(|c| c.id != container_id);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(
        &self,
        label_filter: Option<&str>,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let hide = self.hide_published_ports.load(Ordering::Relaxed);
        let wanted_instance = label_filter.and_then(|expr| {
            expr.strip_prefix(&format!("{LABEL_INSTANCE_ID}="))
                .map(str::to_string)
        });
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| {
                wanted_instance
                    .as_deref()
                    .map(|id| c.desired.id == id)
                    .unwrap_or(true)
            })
            .map(|c| c.summary(hide))
            .collect())
    }

    async fn create_container(&self, desired: &InstanceRecord) -> Result<String, RuntimeError> {
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.containers.lock().unwrap().push(MockContainer {
            id: id.clone(),
            desired: desired.clone(),
            running: false,
        });
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let wanted: Vec<u16> = containers
            .iter()
            .find(|c| c.id == container_id)
            .map(|c| c.host_ports())
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        let conflict = containers.iter().any(|c| {
            c.id != container_id && c.running && c.host_ports().iter().any(|p| wanted.contains(p))
        });
        if conflict {
            return Err(RuntimeError::PortConflict(
                "driver failed programming external connectivity: port is already allocated"
                    .to_string(),
            ));
        }
        let container = containers
            .iter_mut()
            .find(|c| c.id == container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .iter_mut()
            .find(|c| c.id == container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let before = containers.len();
        containers.retain(|c| c.id != container_id);
        if containers.len() == before {
            return Err(RuntimeError::NotFound(container_id.to_string()));
        }
        Ok(())
    }

    async fn inspect_container(
        &self,
        container_id: &str,
    ) -> Result<ObservedContainer, RuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == container_id)
            .map(MockContainer::observed)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))
    }

    async fn container_logs(&self, container_id: &str) -> Result<ByteStream, RuntimeError> {
        if self.is_running(container_id).is_none() {
            return Err(RuntimeError::NotFound(container_id.to_string()));
        }
        let chunks: Vec<_> = self
            .log_chunks
            .lock()
            .unwrap()
            .iter()
            .map(|chunk| Ok(bytes::Bytes::from(chunk.clone())))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn container_stats(&self, container_id: &str) -> Result<SampleStream, RuntimeError> {
        if self.is_running(container_id).is_none() {
            return Err(RuntimeError::NotFound(container_id.to_string()));
        }
        let samples: Vec<_> = self
            .samples
            .lock()
            .unwrap()
            .iter()
            .map(|sample| Ok(*sample))
            .collect();
        // Keep the stream open after the canned samples so the sampling task
        // stays alive like a real stats subscription.
        Ok(stream::iter(samples).chain(stream::pending()).boxed())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.fail_image_pull.load(Ordering::Relaxed) {
            return Err(RuntimeError::ImagePull(format!("no such image: {image}")));
        }
        Ok(())
    }
}

/// Route test tracing through RUST_LOG when set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
