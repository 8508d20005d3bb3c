//! Host resource snapshots.
//!
//! Every query goes through the `hardware` queue class so overlapping
//! requests are answered one at a time.

use crate::config::QueueConfig;
use crate::error::{PlexusError, Result};
use crate::queue::{BoundedQueue, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use sysinfo::System;
use tracing::trace;

/// Memory figures in bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub total_mem: u64,
    pub used_mem: u64,
    pub available_mem: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesInfo {
    pub mem: MemoryInfo,
    pub cpu_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuLoad {
    /// Global CPU usage, 0-100.
    pub usage: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentLoad {
    pub cpu: CpuLoad,
}

/// Cheap to clone; clones share the sampler.
#[derive(Clone)]
pub struct SystemMonitor {
    system: Arc<Mutex<System>>,
    queue: BoundedQueue,
}

impl SystemMonitor {
    pub fn new(queue: BoundedQueue) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();

        Self {
            system: Arc::new(Mutex::new(system)),
            queue,
        }
    }

    pub async fn resources(&self) -> Result<ResourcesInfo> {
        self.sample(|system| {
            system.refresh_memory();
            ResourcesInfo {
                mem: MemoryInfo {
                    total_mem: system.total_memory(),
                    used_mem: system.used_memory(),
                    available_mem: system.available_memory(),
                },
                cpu_count: system.cpus().len(),
            }
        })
        .await
    }

    pub async fn current_load(&self) -> Result<CurrentLoad> {
        self.sample(|system| {
            system.refresh_cpu_usage();
            CurrentLoad {
                cpu: CpuLoad {
                    usage: system.global_cpu_usage(),
                },
            }
        })
        .await
    }

    async fn sample<T, F>(&self, read: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&mut System) -> T + Send + Sync + Clone + 'static,
    {
        let system = self.system.clone();
        self.queue
            .enqueue(QueueConfig::HARDWARE_CLASS, RetryPolicy::none(), move || {
                let system = system.clone();
                let read = read.clone();
                async move {
                    // sysinfo refreshes block; keep them off the runtime threads.
                    tokio::task::spawn_blocking(move || {
                        let mut system = system.lock().unwrap_or_else(|p| p.into_inner());
                        trace!("Sampling system resources");
                        read(&mut system)
                    })
                    .await
                    .map_err(|e| PlexusError::Other(format!("resource sampling failed: {}", e)))
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resources_report_memory() {
        let monitor = SystemMonitor::new(BoundedQueue::new());
        let info = monitor.resources().await.unwrap();
        assert!(info.mem.total_mem > 0);
        assert!(info.mem.used_mem <= info.mem.total_mem);

        let json = serde_json::to_value(&info).unwrap();
        assert!(json["mem"]["totalMem"].is_u64());
    }

    #[tokio::test]
    async fn test_current_load_in_range() {
        let monitor = SystemMonitor::new(BoundedQueue::new());
        let load = monitor.current_load().await.unwrap();
        assert!((0.0..=100.0).contains(&load.cpu.usage) || load.cpu.usage.is_nan());
    }

    #[tokio::test]
    async fn test_queries_share_hardware_lane() {
        let queue = BoundedQueue::new();
        let monitor = SystemMonitor::new(queue.clone());
        let (a, b) = tokio::join!(monitor.resources(), monitor.current_load());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(queue.limit(QueueConfig::HARDWARE_CLASS), 1);
    }
}
