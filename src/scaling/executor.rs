//! Applies scaling decisions against the gateway under a cluster-wide
//! safety gate, per-container cooldown, and bounded concurrency.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::models::SafetyConfig;
use crate::gateway::{ClusterGateway, ResizeRequest};
use crate::metrics::ClusterSnapshot;
use crate::scaling::decision::{ScalingAction, ScalingDecision, ScalingReason};

/// History capped per-container, mirroring the metrics ring buffer.
const MAX_HISTORY_PER_CONTAINER: usize = 100;

#[derive(Error, Debug, Clone)]
pub enum ExecutorError {
    #[error("cluster safety threshold exceeded: {0}")]
    SafetyThresholdExceeded(String),
}

#[derive(Debug, Clone)]
pub struct ScalingOperation {
    pub vmid: u64,
    pub decision: ScalingDecision,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
}

impl ScalingOperation {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

#[derive(Debug, Default)]
struct ContainerHistory {
    operations: VecDeque<ScalingOperation>,
    last_scaling_time: Option<DateTime<Utc>>,
}

impl ContainerHistory {
    fn record(&mut self, op: ScalingOperation) {
        if !op.is_completed() {
            return;
        }
        if op.success == Some(true) && op.decision.action != ScalingAction::NoAction {
            self.last_scaling_time = Some(op.started_at);
        }
        self.operations.push_back(op);
        if self.operations.len() > MAX_HISTORY_PER_CONTAINER {
            self.operations.pop_front();
        }
    }

    fn cooldown_remaining(
        &self,
        cooldown: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Option<chrono::Duration> {
        let last = self.last_scaling_time?;
        let elapsed = now - last;
        if elapsed >= cooldown {
            None
        } else {
            Some(cooldown - elapsed)
        }
    }

    fn success_rate(&self) -> f64 {
        if self.operations.is_empty() {
            return 1.0;
        }
        let successes = self
            .operations
            .iter()
            .filter(|op| op.success == Some(true))
            .count();
        successes as f64 / self.operations.len() as f64
    }
}

/// Applies [`ScalingDecision`]s against the gateway. Owns the per-container
/// cooldown state and operation history, and enforces a cluster-wide
/// host-protection gate before any resize is attempted.
pub struct ScalingExecutor<C: Clock> {
    gateway: Arc<dyn ClusterGateway>,
    clock: C,
    safety: SafetyConfig,
    dry_run: bool,
    semaphore: Semaphore,
    history: DashMap<u64, ContainerHistory>,
    active_operations: DashMap<u64, DateTime<Utc>>,
}

impl<C: Clock> ScalingExecutor<C> {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        clock: C,
        safety: SafetyConfig,
        dry_run: bool,
    ) -> Self {
        let permits = safety.max_concurrent_operations;
        Self {
            gateway,
            clock,
            safety,
            dry_run,
            semaphore: Semaphore::new(permits),
            history: DashMap::new(),
            active_operations: DashMap::new(),
        }
    }

    /// Cluster-wide host-protection gate: refuses all scaling when any
    /// node is over its safety threshold or cluster availability has
    /// dropped below 10%.
    pub fn check_cluster_safety(&self, snapshot: &ClusterSnapshot) -> Result<(), ExecutorError> {
        if !self.safety.enable_host_protection {
            return Ok(());
        }
        for (name, node) in &snapshot.nodes {
            if node.cpu_usage_pct >= self.safety.max_cpu_safety_pct {
                return Err(ExecutorError::SafetyThresholdExceeded(format!(
                    "node {name} cpu usage {:.1}% >= safety threshold {:.1}%",
                    node.cpu_usage_pct, self.safety.max_cpu_safety_pct
                )));
            }
            if node.memory_usage_pct >= self.safety.max_mem_safety_pct {
                return Err(ExecutorError::SafetyThresholdExceeded(format!(
                    "node {name} memory usage {:.1}% >= safety threshold {:.1}%",
                    node.memory_usage_pct, self.safety.max_mem_safety_pct
                )));
            }
        }
        if snapshot.cpu_available_pct() < 10.0 || snapshot.mem_available_pct() < 10.0 {
            return Err(ExecutorError::SafetyThresholdExceeded(
                "cluster resource availability below 10%".into(),
            ));
        }
        Ok(())
    }

    /// Cooldown check for a container, regardless of which direction its
    /// last completed scaling operation went.
    pub fn cooldown_remaining(&self, vmid: u64, cooldown: chrono::Duration) -> Option<chrono::Duration> {
        self.history
            .get(&vmid)
            .and_then(|h| h.cooldown_remaining(cooldown, self.clock.now()))
    }

    pub fn has_active_operation(&self, vmid: u64) -> bool {
        self.active_operations.contains_key(&vmid)
    }

    /// Executes a single decision. Returns the completed [`ScalingOperation`]
    /// regardless of success or failure; history and active-operation
    /// bookkeeping are always updated, including on early preflight
    /// rejection, so callers can inspect what happened.
    pub async fn execute(&self, node: &str, decision: ScalingDecision) -> ScalingOperation {
        let vmid = decision.vmid;
        let started_at = self.clock.now();

        if !decision.requires_scaling() {
            return ScalingOperation {
                vmid,
                decision,
                started_at,
                completed_at: Some(started_at),
                success: Some(true),
                error_message: None,
            };
        }

        if self.dry_run {
            info!(vmid, "dry run: would apply scaling decision");
            let op = ScalingOperation {
                vmid,
                decision: decision.clone(),
                started_at,
                completed_at: Some(started_at),
                success: Some(true),
                error_message: Some("dry_run".into()),
            };
            self.record(op.clone());
            return op;
        }

        self.active_operations.insert(vmid, started_at);

        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");

        let request = ResizeRequest {
            cores: Some(decision.target_cores),
            memory_mb: Some(decision.target_memory_mb),
        };

        let result = self.gateway.resize(node, vmid, request).await;
        let completed_at = self.clock.now();

        let op = match result {
            Ok(()) => {
                info!(vmid, ?decision.action, "scaling operation succeeded");
                ScalingOperation {
                    vmid,
                    decision,
                    started_at,
                    completed_at: Some(completed_at),
                    success: Some(true),
                    error_message: None,
                }
            }
            Err(e) => {
                warn!(vmid, error = %e, "scaling operation failed");
                ScalingOperation {
                    vmid,
                    decision,
                    started_at,
                    completed_at: Some(completed_at),
                    success: Some(false),
                    error_message: Some(e.to_string()),
                }
            }
        };

        self.active_operations.remove(&vmid);
        self.record(op.clone());
        op
    }

    fn record(&self, op: ScalingOperation) {
        self.history.entry(op.vmid).or_default().record(op);
    }

    pub fn container_history(&self, vmid: u64) -> Vec<ScalingOperation> {
        self.history
            .get(&vmid)
            .map(|h| h.operations.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn success_rate(&self, vmid: u64) -> f64 {
        self.history
            .get(&vmid)
            .map(|h| h.success_rate())
            .unwrap_or(1.0)
    }

    /// Reason this preflight check failed, suitable for folding into a
    /// no-op [`ScalingDecision`] before a resize is ever attempted.
    pub fn preflight_reject_reason(
        &self,
        vmid: u64,
        cooldown: chrono::Duration,
    ) -> Option<ScalingReason> {
        if self.has_active_operation(vmid) {
            return Some(ScalingReason::CooldownPeriod);
        }
        if self.cooldown_remaining(vmid, cooldown).is_some() {
            return Some(ScalingReason::CooldownPeriod);
        }
        None
    }

    /// A snapshot of executor-wide state for diagnostics/status reporting.
    pub fn status(&self) -> ExecutorStatus {
        let total_operations: usize = self.history.iter().map(|h| h.operations.len()).sum();
        let total_successes: usize = self
            .history
            .iter()
            .map(|h| {
                h.operations
                    .iter()
                    .filter(|op| op.success == Some(true))
                    .count()
            })
            .sum();
        let success_rate_percent = if total_operations == 0 {
            100.0
        } else {
            total_successes as f64 / total_operations as f64 * 100.0
        };

        ExecutorStatus {
            active_operations: self.active_operations.len(),
            monitored_containers: self.history.len(),
            total_operations,
            total_successes,
            success_rate_percent,
            max_concurrent_operations: self.safety.max_concurrent_operations,
        }
    }
}

/// Executor-wide diagnostics, grounded in the original's
/// `get_scaling_status()`.
#[derive(Debug, Clone)]
pub struct ExecutorStatus {
    pub active_operations: usize,
    pub monitored_containers: usize,
    pub total_operations: usize,
    pub total_successes: usize,
    pub success_rate_percent: f64,
    pub max_concurrent_operations: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::gateway::mock::MockGateway;
    use crate::scaling::decision::ScalingDecision;

    fn up_decision(vmid: u64) -> ScalingDecision {
        ScalingDecision {
            vmid,
            action: ScalingAction::ScaleUp,
            reason: ScalingReason::CpuThresholdExceeded,
            current_cores: 2,
            target_cores: 3,
            current_memory_mb: 1024,
            target_memory_mb: 1024,
        }
    }

    #[tokio::test]
    async fn execute_applies_resize_and_records_success() {
        let gateway = Arc::new(MockGateway::new());
        gateway.add_container(
            101,
            crate::gateway::mock::MockContainer {
                node: "pve1".into(),
                status: crate::gateway::RuntimeStatus::Running,
                cores: 2,
                memory_mb: 1024,
                hostname: "ct101".into(),
                timeseries: vec![],
            },
        );
        let clock = FakeClock::new(Utc::now());
        let executor = ScalingExecutor::new(gateway.clone(), clock, SafetyConfig::default(), false);

        let op = executor.execute("pve1", up_decision(101)).await;
        assert_eq!(op.success, Some(true));
        assert_eq!(gateway.resize_call_count(), 1);
        assert_eq!(executor.container_history(101).len(), 1);
    }

    #[tokio::test]
    async fn dry_run_records_history_without_resizing() {
        let gateway = Arc::new(MockGateway::new());
        let clock = FakeClock::new(Utc::now());
        let executor = ScalingExecutor::new(gateway.clone(), clock, SafetyConfig::default(), true);

        let op = executor.execute("pve1", up_decision(101)).await;
        assert_eq!(op.success, Some(true));
        assert_eq!(gateway.resize_call_count(), 0);
    }

    #[tokio::test]
    async fn cooldown_blocks_second_scale_up_until_elapsed() {
        let gateway = Arc::new(MockGateway::new());
        gateway.add_container(
            101,
            crate::gateway::mock::MockContainer {
                node: "pve1".into(),
                status: crate::gateway::RuntimeStatus::Running,
                cores: 2,
                memory_mb: 1024,
                hostname: "ct101".into(),
                timeseries: vec![],
            },
        );
        let clock = FakeClock::new(Utc::now());
        let executor =
            ScalingExecutor::new(gateway.clone(), clock.clone(), SafetyConfig::default(), false);

        executor.execute("pve1", up_decision(101)).await;
        let cooldown = chrono::Duration::seconds(300);
        assert!(executor.cooldown_remaining(101, cooldown).is_some());

        clock.advance(chrono::Duration::seconds(301));
        assert!(executor.cooldown_remaining(101, cooldown).is_none());
    }

    fn down_decision(vmid: u64) -> ScalingDecision {
        ScalingDecision {
            vmid,
            action: ScalingAction::ScaleDown,
            reason: ScalingReason::CpuThresholdUnderutilized,
            current_cores: 3,
            target_cores: 2,
            current_memory_mb: 1024,
            target_memory_mb: 1024,
        }
    }

    #[tokio::test]
    async fn cooldown_blocks_opposite_direction_too() {
        let gateway = Arc::new(MockGateway::new());
        gateway.add_container(
            101,
            crate::gateway::mock::MockContainer {
                node: "pve1".into(),
                status: crate::gateway::RuntimeStatus::Running,
                cores: 2,
                memory_mb: 1024,
                hostname: "ct101".into(),
                timeseries: vec![],
            },
        );
        let clock = FakeClock::new(Utc::now());
        let executor =
            ScalingExecutor::new(gateway.clone(), clock.clone(), SafetyConfig::default(), false);

        // A scale-up just completed; an immediate scale-down attempt must
        // still be blocked by the same container-wide cooldown.
        executor.execute("pve1", up_decision(101)).await;
        let cooldown = chrono::Duration::seconds(300);
        assert!(executor
            .preflight_reject_reason(101, cooldown)
            .is_some());

        clock.advance(chrono::Duration::seconds(301));
        assert!(executor.preflight_reject_reason(101, cooldown).is_none());
        executor.execute("pve1", down_decision(101)).await;
        assert_eq!(executor.container_history(101).len(), 2);
    }

    #[tokio::test]
    async fn status_reflects_recorded_operations() {
        let gateway = Arc::new(MockGateway::new());
        gateway.add_container(
            101,
            crate::gateway::mock::MockContainer {
                node: "pve1".into(),
                status: crate::gateway::RuntimeStatus::Running,
                cores: 2,
                memory_mb: 1024,
                hostname: "ct101".into(),
                timeseries: vec![],
            },
        );
        let clock = FakeClock::new(Utc::now());
        let executor = ScalingExecutor::new(gateway, clock, SafetyConfig::default(), false);

        executor.execute("pve1", up_decision(101)).await;
        let status = executor.status();
        assert_eq!(status.monitored_containers, 1);
        assert_eq!(status.total_operations, 1);
        assert_eq!(status.total_successes, 1);
        assert_eq!(status.success_rate_percent, 100.0);
    }

    #[test]
    fn cluster_safety_rejects_when_node_over_threshold() {
        let gateway = Arc::new(MockGateway::new());
        let clock = FakeClock::new(Utc::now());
        let executor = ScalingExecutor::new(gateway, clock, SafetyConfig::default(), false);

        let mut snapshot = ClusterSnapshot::default();
        snapshot.nodes.insert(
            "pve1".into(),
            crate::metrics::NodeMetrics {
                cpu_usage_pct: 99.0,
                memory_usage_pct: 50.0,
                load_average: [1.0, 1.0, 1.0],
            },
        );

        assert!(executor.check_cluster_safety(&snapshot).is_err());
    }
}
