//! The daemon loop: ties the gateway, metrics aggregator, and scaling
//! executor together into a periodic evaluate-and-scale cycle, plus a
//! separate health-probe loop and process lifecycle management.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::models::AutoscalerConfig;
use crate::gateway::ClusterGateway;
use crate::metrics::MetricsAggregator;
use crate::scaling::{decide, executor::ExecutorStatus, ScalingExecutor};

/// Shared runtime state the controller operates over. Config is behind an
/// `RwLock` so a SIGHUP reload can swap it without restarting the loop.
pub struct Runtime<C: Clock> {
    pub gateway: Arc<dyn ClusterGateway>,
    pub config: RwLock<AutoscalerConfig>,
    pub aggregator: MetricsAggregator<C>,
    pub executor: ScalingExecutor<C>,
    pub clock: C,
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
}

/// Controller-wide diagnostics, grounded in the original's `get_status()`.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub executor: ExecutorStatus,
}

impl<C: Clock + Clone> Runtime<C> {
    pub fn new(gateway: Arc<dyn ClusterGateway>, config: AutoscalerConfig, clock: C) -> Self {
        let executor = ScalingExecutor::new(
            Arc::clone(&gateway),
            clock.clone(),
            config.safety.clone(),
            config.global.dry_run,
        );
        let aggregator = MetricsAggregator::new(Arc::clone(&gateway), clock.clone());
        Self {
            gateway,
            config: RwLock::new(config),
            aggregator,
            executor,
            clock,
            cycles_completed: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
        }
    }

    /// Runs a single evaluate-and-scale cycle over every enabled container
    /// in the current config. Applies the cluster-wide safety gate once;
    /// if it fails, every container's decision collapses to a safety
    /// rejection rather than attempting any individual evaluation, and the
    /// cycle is counted as failed.
    pub async fn run_cycle(&self) {
        let config = self.config.read().await;
        let vmids: Vec<u64> = config
            .containers
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.vmid)
            .collect();

        let snapshot = self.aggregator.collect(&vmids).await;
        snapshot.total_cpu_cores.map(|n| debug!(total_cpu_cores = n));

        let safety_ok = self.executor.check_cluster_safety(&snapshot);
        if safety_ok.is_err() {
            self.cycles_failed.fetch_add(1, Ordering::Relaxed);
        }

        for container in config.containers.iter().filter(|c| c.enabled) {
            if let Err(e) = &safety_ok {
                warn!(vmid = container.vmid, error = %e, "skipping evaluation: cluster safety gate tripped");
                continue;
            }
            self.evaluate_container(&config, container).await;
        }

        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    async fn evaluate_container(
        &self,
        config: &AutoscalerConfig,
        policy: &crate::config::models::ContainerPolicy,
    ) {
        let vmid = policy.vmid;

        let Some(metrics) = self.aggregator.container(vmid) else {
            debug!(vmid, "no metrics collected yet");
            return;
        };

        let is_running = metrics.status == Some(crate::gateway::RuntimeStatus::Running);
        let current_cores = metrics.latest().map(|s| s.cpu_cores);
        let current_memory_mb = metrics.latest().map(|s| s.mem_total_mb);

        let thresholds = config.effective_thresholds(policy);
        let limits = config.effective_limits(policy);

        let decision = decide(
            vmid,
            policy,
            &thresholds,
            &limits,
            current_cores,
            current_memory_mb,
            is_running,
            &metrics,
        );

        if !decision.requires_scaling() {
            debug!(vmid, ?decision.reason, "no scaling action");
            return;
        }

        let cooldown = chrono::Duration::seconds(policy.cooldown_seconds as i64);
        if let Some(reason) = self.executor.preflight_reject_reason(vmid, cooldown) {
            debug!(vmid, ?reason, "scaling decision suppressed");
            return;
        }

        let op = self.executor.execute(&metrics.node, decision).await;
        match op.success {
            Some(true) => info!(vmid, action = ?op.decision.action, "applied scaling decision"),
            Some(false) => error!(vmid, error = ?op.error_message, "scaling decision failed"),
            None => {}
        }
    }

    pub async fn reload_config(&self, new_config: AutoscalerConfig) -> Result<(), crate::config::ConfigError> {
        new_config.validate()?;
        *self.config.write().await = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// A snapshot of controller-wide state for diagnostics/status reporting.
    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            executor: self.executor.status(),
        }
    }
}

/// Runs the main evaluate-and-scale loop until `cancellation` fires. Sleeps
/// in 1-second increments between cycles so cancellation is observed
/// promptly even with a long monitoring interval.
pub async fn run_main_loop<C: Clock + Clone>(
    runtime: Arc<Runtime<C>>,
    interval: std::time::Duration,
    cancellation: CancellationToken,
) {
    let mut cycle: u64 = 0;
    while !cancellation.is_cancelled() {
        cycle += 1;
        let started = std::time::Instant::now();
        debug!(cycle, "starting evaluation cycle");
        runtime.run_cycle().await;
        let elapsed = started.elapsed();
        debug!(cycle, elapsed_ms = elapsed.as_millis() as u64, "cycle complete");

        let sleep_for = interval.saturating_sub(elapsed);
        sleep_with_cancellation(sleep_for, &cancellation).await;
    }
    info!("main loop stopped");
}

/// Independent loop that probes gateway connectivity and metrics freshness
/// at a (typically shorter) interval than the scaling cycle.
pub async fn run_health_loop<C: Clock + Clone>(
    runtime: Arc<Runtime<C>>,
    interval: std::time::Duration,
    max_metrics_age: chrono::Duration,
    cancellation: CancellationToken,
) {
    while !cancellation.is_cancelled() {
        match runtime.gateway.health_ping().await {
            Ok(()) => debug!("gateway health check passed"),
            Err(e) => warn!(error = %e, "gateway health check failed"),
        }
        if !runtime.aggregator.is_recent(max_metrics_age) {
            warn!("metrics collection is stale");
        }
        sleep_with_cancellation(interval, &cancellation).await;
    }
}

async fn sleep_with_cancellation(duration: std::time::Duration, cancellation: &CancellationToken) {
    let mut remaining = duration;
    let step = std::time::Duration::from_secs(1);
    while remaining > std::time::Duration::ZERO {
        if cancellation.is_cancelled() {
            return;
        }
        let this_step = remaining.min(step);
        tokio::select! {
            _ = tokio::time::sleep(this_step) => {}
            _ = cancellation.cancelled() => return,
        }
        remaining -= this_step;
    }
}

/// Best-effort PID file creation. Failure is logged, never fatal: a daemon
/// that can't write its PID file can still run correctly.
pub fn create_pid_file(path: &Path) {
    let pid = std::process::id();
    if let Err(e) = std::fs::write(path, pid.to_string()) {
        warn!(path = %path.display(), error = %e, "failed to write pid file");
    }
}

pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove pid file");
        }
    }
}

pub fn pid_file_path(config: &AutoscalerConfig) -> PathBuf {
    PathBuf::from(&config.global.pid_file)
}

/// Installs SIGTERM/SIGINT handling that triggers `cancellation`, and
/// SIGHUP handling that calls back into `on_reload`. Unix-only, matching
/// the target deployment platform.
#[cfg(unix)]
pub async fn run_signal_handlers<F, Fut>(cancellation: CancellationToken, on_reload: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                cancellation.cancel();
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                cancellation.cancel();
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading configuration");
                on_reload().await;
            }
        }
    }
}
