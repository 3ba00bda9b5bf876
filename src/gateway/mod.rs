//! Cluster Gateway - the abstract management-API boundary the core consumes.
//!
//! The core never talks to the virtualization cluster's REST API directly;
//! every read and every mutation goes through this trait. That keeps the
//! evaluation-and-scaling control loop testable against an in-memory mock
//! and keeps transport concerns (auth, retries, rate limiting) out of the
//! decision logic entirely.

pub mod proxmox;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use proxmox::ProxmoxGateway;

/// Errors the Gateway may surface. Deliberately closed and transport-agnostic:
/// callers never see the underlying HTTP status code or client error type.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Status of a node as reported by `list_nodes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Online,
    Offline,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub status: NodeState,
}

/// Runtime status of a container as reported by the cluster API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    Running,
    Stopped,
    Paused,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ContainerListEntry {
    pub vmid: u64,
}

#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub runtime_status: RuntimeStatus,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub cores: Option<u32>,
    pub memory_mb: Option<u64>,
    pub hostname: Option<String>,
}

/// One point on a container's usage time series, as returned by the
/// cluster API. `cpu_fraction` is in `[0, 1]`; `mem_bytes`/`mem_max_bytes`
/// are raw byte counts.
#[derive(Debug, Clone)]
pub struct TimeseriesPoint {
    pub timestamp: DateTime<Utc>,
    pub cpu_fraction: f64,
    pub mem_bytes: u64,
    pub mem_max_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    Hour,
    Day,
    Week,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Average,
    Max,
}

#[derive(Debug, Clone)]
pub struct NodeMemory {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct NodeStatusData {
    pub cpu_fraction: f64,
    pub memory: NodeMemory,
    pub uptime_seconds: u64,
    pub load_average: [f64; 3],
}

/// A resize request. At least one of `cores`/`memory_mb` must be present;
/// the Executor always populates both with the decision's target value
/// for the scaled dimension and the current value for the other, so every
/// call is a complete target state.
#[derive(Debug, Clone)]
pub struct ResizeRequest {
    pub cores: Option<u32>,
    pub memory_mb: Option<u64>,
}

/// Abstract operations the core consumes from the cluster's management API.
///
/// Implementations must bound their own outbound concurrency (a fairness
/// bound of roughly 10 concurrent requests is recommended) and must not
/// leak transport-level errors (HTTP status codes, connection internals)
/// through anything but [`GatewayError`].
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn list_nodes(&self) -> GatewayResult<Vec<NodeInfo>>;

    async fn list_containers(&self, node: &str) -> GatewayResult<Vec<ContainerListEntry>>;

    /// Scans nodes and returns the first one hosting `vmid`, or `None`.
    async fn find_container_node(&self, vmid: u64) -> GatewayResult<Option<String>>;

    async fn get_container_status(&self, node: &str, vmid: u64) -> GatewayResult<ContainerStatus>;

    async fn get_container_config(&self, node: &str, vmid: u64) -> GatewayResult<ContainerConfig>;

    /// Returns sample points ordered oldest-first; callers use the most recent one.
    async fn get_container_timeseries(
        &self,
        node: &str,
        vmid: u64,
        timeframe: Timeframe,
        aggregation: Aggregation,
    ) -> GatewayResult<Vec<TimeseriesPoint>>;

    async fn get_node_status(&self, node: &str) -> GatewayResult<NodeStatusData>;

    /// Applies a resize. `request` must have at least one field set; this
    /// is a caller invariant, not something the Gateway is expected to
    /// validate defensively.
    async fn resize(&self, node: &str, vmid: u64, request: ResizeRequest) -> GatewayResult<()>;

    /// Lightweight liveness probe used by the controller's health loop.
    async fn health_ping(&self) -> GatewayResult<()>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! A fully in-memory [`ClusterGateway`] for unit and scenario tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct MockContainer {
        pub node: String,
        pub status: RuntimeStatus,
        pub cores: u32,
        pub memory_mb: u64,
        pub hostname: String,
        pub timeseries: Vec<TimeseriesPoint>,
    }

    #[derive(Debug, Default)]
    pub struct MockGateway {
        pub nodes: Mutex<Vec<NodeInfo>>,
        pub node_status: Mutex<std::collections::HashMap<String, NodeStatusData>>,
        pub containers: Mutex<std::collections::HashMap<u64, MockContainer>>,
        pub resize_calls: Mutex<Vec<(String, u64, ResizeRequest)>>,
        pub fail_resize: Mutex<bool>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_node(&self, name: &str, status: NodeStatusData) {
            self.nodes.lock().unwrap().push(NodeInfo {
                name: name.to_string(),
                status: NodeState::Online,
            });
            self.node_status
                .lock()
                .unwrap()
                .insert(name.to_string(), status);
        }

        pub fn add_container(&self, vmid: u64, container: MockContainer) {
            self.containers.lock().unwrap().insert(vmid, container);
        }

        pub fn resize_call_count(&self) -> usize {
            self.resize_calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ClusterGateway for MockGateway {
        async fn list_nodes(&self) -> GatewayResult<Vec<NodeInfo>> {
            Ok(self.nodes.lock().unwrap().clone())
        }

        async fn list_containers(&self, _node: &str) -> GatewayResult<Vec<ContainerListEntry>> {
            Ok(self
                .containers
                .lock()
                .unwrap()
                .keys()
                .map(|vmid| ContainerListEntry { vmid: *vmid })
                .collect())
        }

        async fn find_container_node(&self, vmid: u64) -> GatewayResult<Option<String>> {
            Ok(self
                .containers
                .lock()
                .unwrap()
                .get(&vmid)
                .map(|c| c.node.clone()))
        }

        async fn get_container_status(
            &self,
            _node: &str,
            vmid: u64,
        ) -> GatewayResult<ContainerStatus> {
            let containers = self.containers.lock().unwrap();
            let c = containers
                .get(&vmid)
                .ok_or_else(|| GatewayError::NotFound(format!("container {vmid}")))?;
            Ok(ContainerStatus {
                runtime_status: c.status.clone(),
                uptime_seconds: 3600,
            })
        }

        async fn get_container_config(
            &self,
            _node: &str,
            vmid: u64,
        ) -> GatewayResult<ContainerConfig> {
            let containers = self.containers.lock().unwrap();
            let c = containers
                .get(&vmid)
                .ok_or_else(|| GatewayError::NotFound(format!("container {vmid}")))?;
            Ok(ContainerConfig {
                cores: Some(c.cores),
                memory_mb: Some(c.memory_mb),
                hostname: Some(c.hostname.clone()),
            })
        }

        async fn get_container_timeseries(
            &self,
            _node: &str,
            vmid: u64,
            _timeframe: Timeframe,
            _aggregation: Aggregation,
        ) -> GatewayResult<Vec<TimeseriesPoint>> {
            let containers = self.containers.lock().unwrap();
            let c = containers
                .get(&vmid)
                .ok_or_else(|| GatewayError::NotFound(format!("container {vmid}")))?;
            Ok(c.timeseries.clone())
        }

        async fn get_node_status(&self, node: &str) -> GatewayResult<NodeStatusData> {
            self.node_status
                .lock()
                .unwrap()
                .get(node)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(format!("node {node}")))
        }

        async fn resize(
            &self,
            node: &str,
            vmid: u64,
            request: ResizeRequest,
        ) -> GatewayResult<()> {
            self.resize_calls
                .lock()
                .unwrap()
                .push((node.to_string(), vmid, request.clone()));

            if *self.fail_resize.lock().unwrap() {
                return Err(GatewayError::OperationFailed("injected failure".into()));
            }

            if let Some(c) = self.containers.lock().unwrap().get_mut(&vmid) {
                if let Some(cores) = request.cores {
                    c.cores = cores;
                }
                if let Some(mem) = request.memory_mb {
                    c.memory_mb = mem;
                }
            }
            Ok(())
        }

        async fn health_ping(&self) -> GatewayResult<()> {
            Ok(())
        }
    }
}
