//! Docker implementation of the [`ContainerRuntime`] capability surface.
//!
//! Control-plane calls (create/start/stop/remove/inspect/list/stats/pull) go
//! through bollard. The log endpoint is fetched raw over the engine's Unix
//! socket instead, because bollard demultiplexes the stream client-side and
//! the log multiplexer owns the framing for any transport.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, PortTypeEnum, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Full};
use hyper::StatusCode;
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, instrument, warn};

use mcfleet_common::runtime::{desired_data_bind, desired_env, desired_labels, SERVER_IMAGE};
use mcfleet_common::{
    ByteStream, ContainerRuntime, ContainerSummary, InstanceRecord, ObservedContainer,
    RuntimeError, SampleStream, UsageSample,
};

const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// How many trailing lines a fresh log stream replays before following.
const LOG_TAIL: u32 = 100;

/// Stop grace period before the engine kills the server process.
const STOP_TIMEOUT_SECS: i64 = 30;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    http: Client<UnixConnector, Full<Bytes>>,
    socket_path: PathBuf,
}

impl DockerRuntime {
    /// Connect using the local engine defaults and the standard socket path.
    pub fn new() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;
        Ok(Self::with_client(docker, DEFAULT_DOCKER_SOCKET))
    }

    pub fn with_client(docker: Docker, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            docker,
            http: Client::unix(),
            socket_path: socket_path.into(),
        }
    }
}

fn map_engine_error(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        BollardError::DockerResponseServerError { message, .. }
            if message.contains("port is already allocated") =>
        {
            RuntimeError::PortConflict(message)
        }
        other => RuntimeError::Api(other.to_string()),
    }
}

fn container_name(desired: &InstanceRecord) -> String {
    let clean: String = desired
        .name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    format!("mc-{}-{}", clean, desired.id)
}

type PortMap = HashMap<String, Option<Vec<PortBinding>>>;

fn build_port_maps(desired: &InstanceRecord) -> (HashMap<String, HashMap<(), ()>>, PortMap) {
    let mut exposed = HashMap::new();
    let mut bindings: PortMap = HashMap::new();

    let mut bind = |container_port: u16, host_port: u16| {
        let key = format!("{container_port}/tcp");
        exposed.insert(key.clone(), HashMap::new());
        bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }]),
        );
    };

    bind(desired.container_port, desired.port);
    for mapping in &desired.additional_ports {
        bind(mapping.container, mapping.host);
    }
    bind(desired.rcon_port, desired.rcon_port);

    (exposed, bindings)
}

fn summary_from(c: bollard::models::ContainerSummary) -> ContainerSummary {
    let published_tcp_ports = c
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter(|p| matches!(p.typ, Some(PortTypeEnum::TCP)))
        .filter_map(|p| p.public_port)
        .collect();
    ContainerSummary {
        id: c.id.unwrap_or_default(),
        labels: c.labels.unwrap_or_default(),
        state: c.state.unwrap_or_else(|| "unknown".to_string()),
        published_tcp_ports,
    }
}

fn parse_started_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        // The engine reports the zero timestamp for never-started containers.
        .filter(|t| t.timestamp() > 0)
}

fn sample_from(stats: Stats) -> UsageSample {
    UsageSample {
        cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
        system_cpu_usage: stats.cpu_stats.system_cpu_usage,
        precpu_total_usage: stats.precpu_stats.cpu_usage.total_usage,
        pre_system_cpu_usage: stats.precpu_stats.system_cpu_usage,
        online_cpus: stats.cpu_stats.online_cpus.map(|n| n as u32),
        memory_usage: stats.memory_stats.usage.unwrap_or(0),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(
        &self,
        label_filter: Option<&str>,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        if let Some(expr) = label_filter {
            filters.insert("label".to_string(), vec![expr.to_string()]);
        }
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_engine_error)?;
        Ok(containers.into_iter().map(summary_from).collect())
    }

    #[instrument(skip(self, desired), fields(instance_id = %desired.id))]
    async fn create_container(&self, desired: &InstanceRecord) -> Result<String, RuntimeError> {
        let (exposed_ports, port_bindings) = build_port_maps(desired);
        let host_config = HostConfig {
            binds: Some(vec![desired_data_bind(desired)]),
            port_bindings: Some(port_bindings),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            memory: Some(desired.memory_limit_mib as i64 * 1024 * 1024),
            nano_cpus: Some((desired.cpu_limit * 1e9) as i64),
            ..Default::default()
        };
        let config = Config {
            image: Some(SERVER_IMAGE.to_string()),
            labels: Some(desired_labels(desired)),
            env: Some(desired_env(desired)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: container_name(desired),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_engine_error)?;
        info!(container_id = %created.id, "container created");
        Ok(created.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_engine_error)
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
            .map_err(map_engine_error)
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_engine_error)
    }

    async fn inspect_container(
        &self,
        container_id: &str,
    ) -> Result<ObservedContainer, RuntimeError> {
        let response = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(map_engine_error)?;

        let state = response.state.unwrap_or_default();
        let config = response.config.unwrap_or_default();
        let host_config = response.host_config.unwrap_or_default();

        let port_bindings = host_config
            .port_bindings
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, bindings)| {
                let host_port = bindings?.into_iter().next()?.host_port?;
                Some((key, host_port))
            })
            .collect();

        Ok(ObservedContainer {
            id: response.id.unwrap_or_else(|| container_id.to_string()),
            labels: config.labels.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            port_bindings,
            binds: host_config.binds.unwrap_or_default(),
            nano_cpus: host_config.nano_cpus,
            memory_bytes: host_config.memory,
            running: state.running.unwrap_or(false),
            restarting: state.restarting.unwrap_or(false),
            status: state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            started_at: state.started_at.as_deref().and_then(parse_started_at),
        })
    }

    async fn container_logs(&self, container_id: &str) -> Result<ByteStream, RuntimeError> {
        let path = format!(
            "/containers/{container_id}/logs?follow=true&stdout=true&stderr=true&tail={LOG_TAIL}"
        );
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, &path).into();
        let response = self
            .http
            .get(uri)
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(RuntimeError::NotFound(container_id.to_string())),
            status if !status.is_success() => {
                Err(RuntimeError::Api(format!("log request returned {status}")))
            }
            _ => Ok(response
                .into_body()
                .into_data_stream()
                .map_err(|e| RuntimeError::Transport(e.to_string()))
                .boxed()),
        }
    }

    async fn container_stats(&self, container_id: &str) -> Result<SampleStream, RuntimeError> {
        let options = StatsOptions {
            stream: true,
            one_shot: false,
        };
        let stream = self
            .docker
            .stats(container_id, Some(options))
            .map(|item| item.map(sample_from).map_err(map_engine_error));
        Ok(stream.boxed())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(%image, "pulling server image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| {
                warn!(%image, error = %e, "image pull failed");
                RuntimeError::ImagePull(e.to_string())
            })?;
        Ok(())
    }
}
