//! Resource-usage sampling: one background sample stream per instance while
//! observers are attached, with a shared last-known snapshot cache.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use mcfleet_common::{ContainerRuntime, StatsSnapshot, UsageSample};

pub struct StatsSampler {
    runtime: Arc<dyn ContainerRuntime>,
    cache: Arc<DashMap<String, StatsSnapshot>>,
    active: Arc<DashMap<String, JoinHandle<()>>>,
}

impl StatsSampler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            cache: Arc::new(DashMap::new()),
            active: Arc::new(DashMap::new()),
        }
    }

    /// Return the instance's latest snapshot, starting the background sample
    /// stream when none is active. Returns `None` for containers that are
    /// neither running nor restarting (and evicts any stale state), and for
    /// a freshly started stream that has not produced a sample yet.
    pub async fn get_or_start(
        &self,
        instance_id: &str,
        container_id: &str,
        name: &str,
    ) -> Option<StatsSnapshot> {
        let observed = match self.runtime.inspect_container(container_id).await {
            Ok(observed) => observed,
            Err(_) => {
                self.evict(instance_id);
                return None;
            }
        };
        if !observed.running && !observed.restarting {
            self.evict(instance_id);
            return None;
        }
        let status = if observed.restarting {
            "restarting".to_string()
        } else {
            observed.status.clone()
        };

        let stream_live = self
            .active
            .get(instance_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        if stream_live {
            let mut cached = self.cache.get_mut(instance_id)?;
            cached.name = name.to_string();
            cached.status = status;
            if let Some(started_at) = cached.started_at {
                cached.uptime = format_uptime(started_at);
            }
            return Some(cached.clone());
        }

        let stream = match self.runtime.container_stats(container_id).await {
            Ok(stream) => stream,
            Err(_) => {
                self.evict(instance_id);
                return None;
            }
        };

        let started_at = observed.started_at;
        let cache = self.cache.clone();
        let active = self.active.clone();
        let id = instance_id.to_string();
        let name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(sample) = stream.next().await {
                let sample = match sample {
                    Ok(sample) => sample,
                    Err(e) => {
                        debug!(instance_id = %id, error = %e, "usage stream error");
                        break;
                    }
                };
                let snapshot = StatsSnapshot {
                    id: id.clone(),
                    name: name.clone(),
                    cpu: cpu_percent(&sample),
                    memory: sample.memory_usage,
                    uptime: started_at
                        .map(format_uptime)
                        .unwrap_or_else(|| "00:00:00".to_string()),
                    status: status.clone(),
                    started_at,
                };
                cache.insert(id.clone(), snapshot);
            }
            // Stream end or error: this observation state is gone.
            cache.remove(&id);
            active.remove(&id);
        });
        self.active.insert(instance_id.to_string(), handle);

        self.cache.get(instance_id).map(|entry| entry.clone())
    }

    pub fn get(&self, instance_id: &str) -> Option<StatsSnapshot> {
        self.cache.get(instance_id).map(|entry| entry.clone())
    }

    /// All cached snapshots with uptimes recomputed against the current
    /// clock.
    pub fn get_all(&self) -> HashMap<String, StatsSnapshot> {
        for mut entry in self.cache.iter_mut() {
            if let Some(started_at) = entry.started_at {
                entry.uptime = format_uptime(started_at);
            }
        }
        self.cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Drop the instance's snapshot and sample stream.
    pub fn evict(&self, instance_id: &str) {
        if let Some((_, handle)) = self.active.remove(instance_id) {
            handle.abort();
        }
        self.cache.remove(instance_id);
    }
}

/// CPU percentage from one sample's deltas, clamped to zero for non-positive
/// deltas and rounded to two decimals.
pub(crate) fn cpu_percent(sample: &UsageSample) -> f64 {
    let (Some(system), Some(pre_system)) = (sample.system_cpu_usage, sample.pre_system_cpu_usage)
    else {
        return 0.0;
    };
    let system_delta = system as i64 - pre_system as i64;
    if system_delta <= 0 {
        return 0.0;
    }
    let cpu_delta = sample.cpu_total_usage as i64 - sample.precpu_total_usage as i64;
    let cpus = sample.online_cpus.unwrap_or(1) as f64;
    let percent = (cpu_delta as f64 / system_delta as f64 * cpus * 100.0).max(0.0);
    (percent * 100.0).round() / 100.0
}

fn format_uptime(started_at: DateTime<Utc>) -> String {
    format_duration_secs(Utc::now().signed_duration_since(started_at).num_seconds())
}

/// `HH:MM:SS`, floored, zero-padded, never negative.
pub(crate) fn format_duration_secs(total_seconds: i64) -> String {
    let total = total_seconds.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}
