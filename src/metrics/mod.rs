//! Metrics collection: polls the cluster gateway for node and container
//! state and maintains a bounded history of samples per container.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::gateway::{
    Aggregation, ClusterGateway, GatewayError, NodeState, RuntimeStatus, Timeframe,
};

/// Maximum number of container fan-outs the aggregator runs concurrently.
const MAX_CONCURRENT_CONTAINER_FETCHES: usize = 5;

/// Ring-buffer capacity per container; oldest samples are dropped once full.
const MAX_SAMPLES_PER_CONTAINER: usize = 100;

#[derive(Debug, Clone)]
pub struct Sample {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub cpu_usage_pct: f64,
    pub memory_used_mb: u64,
    pub memory_usage_pct: f64,
    pub cpu_cores: u32,
    /// Configured memory allocation in MB. Carried on every sample so the
    /// most recent one doubles as the container's current allocation,
    /// without a second round trip to the gateway for config.
    pub mem_total_mb: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerMetrics {
    pub node: String,
    pub status: Option<RuntimeStatus>,
    samples: Vec<Sample>,
}

impl ContainerMetrics {
    pub(crate) fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
        if self.samples.len() > MAX_SAMPLES_PER_CONTAINER {
            let overflow = self.samples.len() - MAX_SAMPLES_PER_CONTAINER;
            self.samples.drain(0..overflow);
        }
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.last()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Average CPU/memory usage over the most recent `periods` samples, or
    /// `None` if fewer than `periods` samples have been collected yet.
    pub fn average(&self, periods: usize) -> Option<Sample> {
        self.windowed(periods, |window| {
            let n = window.len() as f64;
            let cpu_usage_pct = window.iter().map(|s| s.cpu_usage_pct).sum::<f64>() / n;
            let memory_usage_pct = window.iter().map(|s| s.memory_usage_pct).sum::<f64>() / n;
            let memory_used_mb =
                (window.iter().map(|s| s.memory_used_mb).sum::<u64>() as f64 / n) as u64;
            (cpu_usage_pct, memory_usage_pct, memory_used_mb)
        })
    }

    /// Peak CPU/memory usage over the most recent `periods` samples, or
    /// `None` if fewer than `periods` samples have been collected yet.
    pub fn peak(&self, periods: usize) -> Option<Sample> {
        self.windowed(periods, |window| {
            let cpu_usage_pct = window
                .iter()
                .map(|s| s.cpu_usage_pct)
                .fold(f64::MIN, f64::max);
            let memory_usage_pct = window
                .iter()
                .map(|s| s.memory_usage_pct)
                .fold(f64::MIN, f64::max);
            let memory_used_mb = window.iter().map(|s| s.memory_used_mb).max().unwrap_or(0);
            (cpu_usage_pct, memory_usage_pct, memory_used_mb)
        })
    }

    fn windowed(
        &self,
        periods: usize,
        reduce: impl FnOnce(&[Sample]) -> (f64, f64, u64),
    ) -> Option<Sample> {
        if self.samples.len() < periods || periods == 0 {
            return None;
        }
        let window = &self.samples[self.samples.len() - periods..];
        let latest = window.last()?;
        let (cpu_usage_pct, memory_usage_pct, memory_used_mb) = reduce(window);
        Some(Sample {
            timestamp: latest.timestamp,
            cpu_usage_pct,
            memory_usage_pct,
            memory_used_mb,
            cpu_cores: latest.cpu_cores,
            mem_total_mb: latest.mem_total_mb,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NodeMetrics {
    pub cpu_usage_pct: f64,
    pub memory_usage_pct: f64,
    pub load_average: [f64; 3],
}

/// A point-in-time view across the whole cluster, built from the latest
/// per-node snapshots. `total_cpu_cores` is left unset rather than
/// approximated from unrelated node fields.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub nodes: HashMap<String, NodeMetrics>,
    pub total_cpu_cores: Option<u32>,
}

impl ClusterSnapshot {
    pub fn cpu_available_pct(&self) -> f64 {
        self.average_available(|n| n.cpu_usage_pct)
    }

    pub fn mem_available_pct(&self) -> f64 {
        self.average_available(|n| n.memory_usage_pct)
    }

    fn average_available(&self, field: impl Fn(&NodeMetrics) -> f64) -> f64 {
        if self.nodes.is_empty() {
            return 100.0;
        }
        let avg_usage = self.nodes.values().map(field).sum::<f64>() / self.nodes.len() as f64;
        (100.0 - avg_usage).max(0.0)
    }
}

/// Polls the gateway and maintains per-container history plus the latest
/// cluster-wide snapshot.
pub struct MetricsAggregator<C: Clock> {
    gateway: Arc<dyn ClusterGateway>,
    clock: C,
    containers: DashMap<u64, ContainerMetrics>,
    last_collected: std::sync::RwLock<Option<chrono::DateTime<chrono::Utc>>>,
}

impl<C: Clock> MetricsAggregator<C> {
    pub fn new(gateway: Arc<dyn ClusterGateway>, clock: C) -> Self {
        Self {
            gateway,
            clock,
            containers: DashMap::new(),
            last_collected: std::sync::RwLock::new(None),
        }
    }

    pub fn container(&self, vmid: u64) -> Option<ContainerMetrics> {
        self.containers.get(&vmid).map(|c| c.clone())
    }

    /// Age of the most recent completed collection cycle, or `None` if no
    /// cycle has completed yet.
    pub fn collection_age(&self) -> Option<chrono::Duration> {
        self.last_collected
            .read()
            .unwrap()
            .map(|t| self.clock.now() - t)
    }

    pub fn is_recent(&self, max_age: chrono::Duration) -> bool {
        self.collection_age().is_some_and(|age| age <= max_age)
    }

    /// Runs one collection cycle: node status for every online node, then a
    /// bounded fan-out over every tracked container's status/config/
    /// timeseries. Returns the resulting cluster snapshot.
    pub async fn collect(&self, tracked_vmids: &[u64]) -> ClusterSnapshot {
        let snapshot = self.collect_nodes().await;
        self.collect_containers(tracked_vmids).await;
        *self.last_collected.write().unwrap() = Some(self.clock.now());
        snapshot
    }

    async fn collect_nodes(&self) -> ClusterSnapshot {
        let nodes = match self.gateway.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "failed to list nodes");
                return ClusterSnapshot::default();
            }
        };

        let online: Vec<_> = nodes
            .into_iter()
            .filter(|n| n.status == NodeState::Online)
            .collect();

        let fetches = online.iter().map(|node| {
            let gateway = Arc::clone(&self.gateway);
            let name = node.name.clone();
            async move {
                let result = gateway.get_node_status(&name).await;
                (name, result)
            }
        });

        let mut snapshot = ClusterSnapshot::default();
        for (name, result) in join_all(fetches).await {
            match result {
                Ok(status) => {
                    snapshot.nodes.insert(
                        name,
                        NodeMetrics {
                            cpu_usage_pct: status.cpu_fraction * 100.0,
                            memory_usage_pct: if status.memory.total_bytes > 0 {
                                status.memory.used_bytes as f64 / status.memory.total_bytes as f64
                                    * 100.0
                            } else {
                                0.0
                            },
                            load_average: status.load_average,
                        },
                    );
                }
                Err(e) => warn!(node = %name, error = %e, "failed to collect node status"),
            }
        }
        snapshot
    }

    async fn collect_containers(&self, tracked_vmids: &[u64]) {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CONTAINER_FETCHES));
        let fetches = tracked_vmids.iter().map(|&vmid| {
            let gateway = Arc::clone(&self.gateway);
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                (vmid, Self::collect_one(gateway, vmid).await)
            }
        });

        for (vmid, outcome) in join_all(fetches).await {
            match outcome {
                CollectOutcome::Sample(node, sample) => {
                    let mut entry = self.containers.entry(vmid).or_default();
                    entry.node = node;
                    entry.status = Some(RuntimeStatus::Running);
                    entry.push(sample);
                }
                CollectOutcome::NotRunning(node, status) => {
                    let mut entry = self.containers.entry(vmid).or_default();
                    entry.node = node;
                    entry.status = Some(status);
                }
                CollectOutcome::Removed => {
                    self.containers.remove(&vmid);
                    debug!(vmid, "container no longer present, dropped from tracking");
                }
                CollectOutcome::Skipped(e) => {
                    warn!(vmid, error = %e, "skipped container metrics collection");
                }
            }
        }
    }

    async fn collect_one(gateway: Arc<dyn ClusterGateway>, vmid: u64) -> CollectOutcome {
        let node = match gateway.find_container_node(vmid).await {
            Ok(Some(node)) => node,
            Ok(None) => return CollectOutcome::Removed,
            Err(e) => return CollectOutcome::Skipped(e),
        };

        let status = match gateway.get_container_status(&node, vmid).await {
            Ok(status) => status,
            Err(GatewayError::NotFound(_)) => return CollectOutcome::Removed,
            Err(e) => return CollectOutcome::Skipped(e),
        };

        if status.runtime_status != RuntimeStatus::Running {
            return CollectOutcome::NotRunning(node, status.runtime_status);
        }

        let (config, timeseries) = tokio::join!(
            gateway.get_container_config(&node, vmid),
            gateway.get_container_timeseries(&node, vmid, Timeframe::Hour, Aggregation::Average),
        );

        let config = match config {
            Ok(config) => config,
            Err(e) => return CollectOutcome::Skipped(e),
        };
        let timeseries = match timeseries {
            Ok(timeseries) => timeseries,
            Err(e) => return CollectOutcome::Skipped(e),
        };

        let Some(point) = timeseries.last() else {
            return CollectOutcome::Skipped(GatewayError::OperationFailed(
                "empty timeseries".into(),
            ));
        };

        let memory_used_mb = point.mem_bytes / (1024 * 1024);
        let memory_usage_pct = if point.mem_max_bytes > 0 {
            point.mem_bytes as f64 / point.mem_max_bytes as f64 * 100.0
        } else {
            0.0
        };
        let mem_total_mb = point.mem_max_bytes / (1024 * 1024);

        CollectOutcome::Sample(
            node,
            Sample {
                timestamp: point.timestamp,
                cpu_usage_pct: point.cpu_fraction * 100.0,
                memory_used_mb,
                memory_usage_pct,
                cpu_cores: config.cores.unwrap_or(1),
                mem_total_mb,
            },
        )
    }
}

enum CollectOutcome {
    Sample(String, Sample),
    NotRunning(String, RuntimeStatus),
    Removed,
    Skipped(GatewayError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::gateway::mock::{MockContainer, MockGateway};
    use crate::gateway::{NodeMemory, NodeStatusData, TimeseriesPoint};
    use chrono::Utc;

    fn sample(cpu_pct: f64, mem_pct: f64) -> Sample {
        Sample {
            timestamp: Utc::now(),
            cpu_usage_pct: cpu_pct,
            memory_used_mb: 0,
            memory_usage_pct: mem_pct,
            cpu_cores: 2,
            mem_total_mb: 1024,
        }
    }

    #[test]
    fn ring_buffer_caps_at_max_samples() {
        let mut metrics = ContainerMetrics::default();
        for i in 0..150 {
            metrics.push(sample(i as f64, 0.0));
        }
        assert_eq!(metrics.sample_count(), MAX_SAMPLES_PER_CONTAINER);
        assert_eq!(metrics.latest().unwrap().cpu_usage_pct, 149.0);
    }

    #[test]
    fn average_returns_none_below_period_count() {
        let mut metrics = ContainerMetrics::default();
        metrics.push(sample(10.0, 10.0));
        metrics.push(sample(20.0, 20.0));
        assert!(metrics.average(3).is_none());
        assert!(metrics.average(2).is_some());
    }

    #[test]
    fn average_computes_mean_over_window() {
        let mut metrics = ContainerMetrics::default();
        metrics.push(sample(10.0, 10.0));
        metrics.push(sample(20.0, 30.0));
        metrics.push(sample(30.0, 50.0));
        let avg = metrics.average(2).unwrap();
        assert_eq!(avg.cpu_usage_pct, 25.0);
        assert_eq!(avg.memory_usage_pct, 40.0);
    }

    #[test]
    fn peak_returns_max_over_window() {
        let mut metrics = ContainerMetrics::default();
        metrics.push(sample(10.0, 90.0));
        metrics.push(sample(95.0, 10.0));
        let peak = metrics.peak(2).unwrap();
        assert_eq!(peak.cpu_usage_pct, 95.0);
        assert_eq!(peak.memory_usage_pct, 90.0);
    }

    #[tokio::test]
    async fn collect_skips_non_running_container_without_sample() {
        let gateway = Arc::new(MockGateway::new());
        gateway.add_node(
            "pve1",
            NodeStatusData {
                cpu_fraction: 0.1,
                memory: NodeMemory {
                    used_bytes: 1,
                    total_bytes: 10,
                },
                uptime_seconds: 100,
                load_average: [0.1, 0.1, 0.1],
            },
        );
        gateway.add_container(
            101,
            MockContainer {
                node: "pve1".into(),
                status: RuntimeStatus::Stopped,
                cores: 2,
                memory_mb: 1024,
                hostname: "ct101".into(),
                timeseries: vec![],
            },
        );

        let aggregator = MetricsAggregator::new(gateway, FakeClock::new(Utc::now()));
        aggregator.collect(&[101]).await;

        let container = aggregator.container(101).unwrap();
        assert_eq!(container.status, Some(RuntimeStatus::Stopped));
        assert_eq!(container.sample_count(), 0);
    }

    #[tokio::test]
    async fn collect_appends_sample_for_running_container() {
        let gateway = Arc::new(MockGateway::new());
        gateway.add_node(
            "pve1",
            NodeStatusData {
                cpu_fraction: 0.2,
                memory: NodeMemory {
                    used_bytes: 4,
                    total_bytes: 10,
                },
                uptime_seconds: 100,
                load_average: [0.2, 0.2, 0.2],
            },
        );
        gateway.add_container(
            101,
            MockContainer {
                node: "pve1".into(),
                status: RuntimeStatus::Running,
                cores: 4,
                memory_mb: 2048,
                hostname: "ct101".into(),
                timeseries: vec![TimeseriesPoint {
                    timestamp: Utc::now(),
                    cpu_fraction: 0.5,
                    mem_bytes: 1024 * 1024 * 512,
                    mem_max_bytes: 1024 * 1024 * 1024,
                }],
            },
        );

        let aggregator = MetricsAggregator::new(gateway, FakeClock::new(Utc::now()));
        let snapshot = aggregator.collect(&[101]).await;

        let container = aggregator.container(101).unwrap();
        assert_eq!(container.sample_count(), 1);
        let latest = container.latest().unwrap();
        assert_eq!(latest.cpu_usage_pct, 50.0);
        assert_eq!(latest.memory_usage_pct, 50.0);
        assert!(aggregator.is_recent(chrono::Duration::seconds(5)));
        assert_eq!(snapshot.nodes.len(), 1);
    }
}
