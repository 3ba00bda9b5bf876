//! Pure decision logic: given current config, current resource allocation,
//! and an averaged usage sample, decide whether and how to scale. Contains
//! no I/O and no clock reads beyond what callers pass in, so it is fully
//! deterministic and unit-testable.

use crate::config::models::{ContainerPolicy, Limits, Thresholds};
use crate::metrics::ContainerMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingReason {
    CpuThresholdExceeded,
    CpuThresholdUnderutilized,
    MemoryThresholdExceeded,
    MemoryThresholdUnderutilized,
    ResourceLimitReached,
    CooldownPeriod,
    InsufficientData,
    ContainerNotRunning,
    SafetyThresholdExceeded,
    DryRunMode,
    NoActionNeeded,
}

#[derive(Debug, Clone)]
pub struct ScalingDecision {
    pub vmid: u64,
    pub action: ScalingAction,
    pub reason: ScalingReason,
    pub current_cores: u32,
    pub target_cores: u32,
    pub current_memory_mb: u64,
    pub target_memory_mb: u64,
}

impl ScalingDecision {
    fn no_action(vmid: u64, reason: ScalingReason, cores: u32, memory_mb: u64) -> Self {
        Self {
            vmid,
            action: ScalingAction::NoAction,
            reason,
            current_cores: cores,
            target_cores: cores,
            current_memory_mb: memory_mb,
            target_memory_mb: memory_mb,
        }
    }

    pub fn requires_scaling(&self) -> bool {
        self.action != ScalingAction::NoAction
    }

    pub fn cpu_change(&self) -> i64 {
        self.target_cores as i64 - self.current_cores as i64
    }

    pub fn memory_change_mb(&self) -> i64 {
        self.target_memory_mb as i64 - self.current_memory_mb as i64
    }
}

/// Preflight + priority-chain evaluation for a single container.
///
/// Preflight order: missing current allocation -> insufficient data,
/// not running -> container not running, fewer than `evaluation_periods`
/// samples -> insufficient data. The priority chain then checks, in
/// order, cpu-scale-up, memory-scale-up, cpu-scale-down, memory-scale-down,
/// stopping at the first threshold that fires.
pub fn decide(
    vmid: u64,
    policy: &ContainerPolicy,
    thresholds: &Thresholds,
    limits: &Limits,
    current_cores: Option<u32>,
    current_memory_mb: Option<u64>,
    is_running: bool,
    metrics: &ContainerMetrics,
) -> ScalingDecision {
    let (Some(current_cores), Some(current_memory_mb)) = (current_cores, current_memory_mb)
    else {
        return ScalingDecision::no_action(
            vmid,
            ScalingReason::InsufficientData,
            current_cores.unwrap_or(0),
            current_memory_mb.unwrap_or(0),
        );
    };

    if !is_running {
        return ScalingDecision::no_action(
            vmid,
            ScalingReason::ContainerNotRunning,
            current_cores,
            current_memory_mb,
        );
    }

    let Some(average) = metrics.average(policy.evaluation_periods) else {
        return ScalingDecision::no_action(
            vmid,
            ScalingReason::InsufficientData,
            current_cores,
            current_memory_mb,
        );
    };

    if average.cpu_usage_pct >= thresholds.cpu_up {
        let target = (current_cores + limits.cpu_step).min(limits.max_cores);
        if target != current_cores {
            return ScalingDecision {
                vmid,
                action: ScalingAction::ScaleUp,
                reason: ScalingReason::CpuThresholdExceeded,
                current_cores,
                target_cores: target,
                current_memory_mb,
                target_memory_mb: current_memory_mb,
            };
        }
        return ScalingDecision::no_action(
            vmid,
            ScalingReason::ResourceLimitReached,
            current_cores,
            current_memory_mb,
        );
    }

    if average.memory_usage_pct >= thresholds.mem_up {
        let target = current_memory_mb
            .saturating_add(limits.mem_step_mb)
            .min(limits.max_mem_mb);
        if target != current_memory_mb {
            return ScalingDecision {
                vmid,
                action: ScalingAction::ScaleUp,
                reason: ScalingReason::MemoryThresholdExceeded,
                current_cores,
                target_cores: current_cores,
                current_memory_mb,
                target_memory_mb: target,
            };
        }
        return ScalingDecision::no_action(
            vmid,
            ScalingReason::ResourceLimitReached,
            current_cores,
            current_memory_mb,
        );
    }

    if average.cpu_usage_pct <= thresholds.cpu_down {
        let target = current_cores.saturating_sub(limits.cpu_step).max(limits.min_cores);
        if target != current_cores {
            return ScalingDecision {
                vmid,
                action: ScalingAction::ScaleDown,
                reason: ScalingReason::CpuThresholdUnderutilized,
                current_cores,
                target_cores: target,
                current_memory_mb,
                target_memory_mb: current_memory_mb,
            };
        }
        return ScalingDecision::no_action(
            vmid,
            ScalingReason::ResourceLimitReached,
            current_cores,
            current_memory_mb,
        );
    }

    if average.memory_usage_pct <= thresholds.mem_down {
        let target = current_memory_mb
            .saturating_sub(limits.mem_step_mb)
            .max(limits.min_mem_mb);
        if target != current_memory_mb {
            return ScalingDecision {
                vmid,
                action: ScalingAction::ScaleDown,
                reason: ScalingReason::MemoryThresholdUnderutilized,
                current_cores,
                target_cores: current_cores,
                current_memory_mb,
                target_memory_mb: target,
            };
        }
        return ScalingDecision::no_action(
            vmid,
            ScalingReason::ResourceLimitReached,
            current_cores,
            current_memory_mb,
        );
    }

    ScalingDecision::no_action(
        vmid,
        ScalingReason::NoActionNeeded,
        current_cores,
        current_memory_mb,
    )
}
