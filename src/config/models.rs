//! Typed configuration sections. Each section validates itself at
//! construction time so an `AutoscalerConfig` is never observed in an
//! invalid state by the rest of the crate.

use serde::Deserialize;

use super::ConfigError;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token_name: Option<String>,
    #[serde(default)]
    pub token_value: Option<String>,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
}

fn default_gateway_port() -> u16 {
    8006
}

fn default_timeout_s() -> u64 {
    30
}

impl GatewayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let has_password = self.password.is_some();
        let has_token = self.token_name.is_some() && self.token_value.is_some();
        if has_password == has_token {
            return Err(ConfigError::Invalid {
                field: "gateway".into(),
                value: "password/token".into(),
                message: "exactly one of password or (token_name, token_value) must be set"
                    .into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval_s: u64,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_monitoring_interval() -> u64 {
    60
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_pid_file() -> String {
    "/tmp/lxc-autoscaler.pid".to_string()
}

impl GlobalConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.monitoring_interval_s < 30 {
            return Err(ConfigError::Invalid {
                field: "global.monitoring_interval_s".into(),
                value: self.monitoring_interval_s.to_string(),
                message: "must be at least 30 seconds".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_operations: usize,
    #[serde(default = "default_max_cpu_safety")]
    pub max_cpu_safety_pct: f64,
    #[serde(default = "default_max_mem_safety")]
    pub max_mem_safety_pct: f64,
    #[serde(default = "default_resource_check_interval")]
    pub resource_check_interval_s: u64,
    #[serde(default = "default_true")]
    pub enable_host_protection: bool,
}

fn default_max_concurrent() -> usize {
    3
}
fn default_max_cpu_safety() -> f64 {
    95.0
}
fn default_max_mem_safety() -> f64 {
    95.0
}
fn default_resource_check_interval() -> u64 {
    30
}

impl SafetyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_operations < 1 {
            return Err(ConfigError::Invalid {
                field: "safety.max_concurrent_operations".into(),
                value: self.max_concurrent_operations.to_string(),
                message: "must be at least 1".into(),
            });
        }
        if !(50.0..=100.0).contains(&self.max_cpu_safety_pct) {
            return Err(ConfigError::Invalid {
                field: "safety.max_cpu_safety_pct".into(),
                value: self.max_cpu_safety_pct.to_string(),
                message: "must be between 50 and 100".into(),
            });
        }
        if !(50.0..=100.0).contains(&self.max_mem_safety_pct) {
            return Err(ConfigError::Invalid {
                field: "safety.max_mem_safety_pct".into(),
                value: self.max_mem_safety_pct.to_string(),
                message: "must be between 50 and 100".into(),
            });
        }
        Ok(())
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: default_max_concurrent(),
            max_cpu_safety_pct: default_max_cpu_safety(),
            max_mem_safety_pct: default_max_mem_safety(),
            resource_check_interval_s: default_resource_check_interval(),
            enable_host_protection: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_cpu_up")]
    pub cpu_up: f64,
    #[serde(default = "default_cpu_down")]
    pub cpu_down: f64,
    #[serde(default = "default_mem_up")]
    pub mem_up: f64,
    #[serde(default = "default_mem_down")]
    pub mem_down: f64,
}

fn default_cpu_up() -> f64 {
    80.0
}
fn default_cpu_down() -> f64 {
    30.0
}
fn default_mem_up() -> f64 {
    85.0
}
fn default_mem_down() -> f64 {
    40.0
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_up: default_cpu_up(),
            cpu_down: default_cpu_down(),
            mem_up: default_mem_up(),
            mem_down: default_mem_down(),
        }
    }
}

impl Thresholds {
    fn validate(&self, field_prefix: &str) -> Result<(), ConfigError> {
        for (name, value) in [
            ("cpu_up", self.cpu_up),
            ("cpu_down", self.cpu_down),
            ("mem_up", self.mem_up),
            ("mem_down", self.mem_down),
        ] {
            if !(0.0 < value && value <= 100.0) {
                return Err(ConfigError::Invalid {
                    field: format!("{field_prefix}.{name}"),
                    value: value.to_string(),
                    message: "must be in (0, 100]".into(),
                });
            }
        }
        if self.cpu_up <= self.cpu_down {
            return Err(ConfigError::Invalid {
                field: format!("{field_prefix}.cpu_up"),
                value: self.cpu_up.to_string(),
                message: "cpu_up must be greater than cpu_down".into(),
            });
        }
        if self.mem_up <= self.mem_down {
            return Err(ConfigError::Invalid {
                field: format!("{field_prefix}.mem_up"),
                value: self.mem_up.to_string(),
                message: "mem_up must be greater than mem_down".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    #[serde(default = "default_min_cores")]
    pub min_cores: u32,
    #[serde(default = "default_max_cores")]
    pub max_cores: u32,
    #[serde(default = "default_cpu_step")]
    pub cpu_step: u32,
    #[serde(default = "default_min_mem_mb")]
    pub min_mem_mb: u64,
    #[serde(default = "default_max_mem_mb")]
    pub max_mem_mb: u64,
    #[serde(default = "default_mem_step_mb")]
    pub mem_step_mb: u64,
}

fn default_min_cores() -> u32 {
    1
}
fn default_max_cores() -> u32 {
    8
}
fn default_cpu_step() -> u32 {
    1
}
fn default_min_mem_mb() -> u64 {
    512
}
fn default_max_mem_mb() -> u64 {
    8192
}
fn default_mem_step_mb() -> u64 {
    256
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min_cores: default_min_cores(),
            max_cores: default_max_cores(),
            cpu_step: default_cpu_step(),
            min_mem_mb: default_min_mem_mb(),
            max_mem_mb: default_max_mem_mb(),
            mem_step_mb: default_mem_step_mb(),
        }
    }
}

impl Limits {
    fn validate(&self, field_prefix: &str) -> Result<(), ConfigError> {
        if self.min_cores >= self.max_cores {
            return Err(ConfigError::Invalid {
                field: format!("{field_prefix}.min_cores"),
                value: self.min_cores.to_string(),
                message: "min_cores must be less than max_cores".into(),
            });
        }
        if self.min_mem_mb >= self.max_mem_mb {
            return Err(ConfigError::Invalid {
                field: format!("{field_prefix}.min_mem_mb"),
                value: self.min_mem_mb.to_string(),
                message: "min_mem_mb must be less than max_mem_mb".into(),
            });
        }
        if self.cpu_step == 0 {
            return Err(ConfigError::Invalid {
                field: format!("{field_prefix}.cpu_step"),
                value: self.cpu_step.to_string(),
                message: "must be positive".into(),
            });
        }
        if self.mem_step_mb == 0 {
            return Err(ConfigError::Invalid {
                field: format!("{field_prefix}.mem_step_mb"),
                value: self.mem_step_mb.to_string(),
                message: "must be positive".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerPolicy {
    pub vmid: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub thresholds: Option<Thresholds>,
    #[serde(default)]
    pub limits: Option<Limits>,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_eval_periods")]
    pub evaluation_periods: usize,
}

fn default_cooldown() -> u64 {
    300
}
fn default_eval_periods() -> usize {
    3
}

impl ContainerPolicy {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(100..=999_999_999).contains(&self.vmid) {
            return Err(ConfigError::Invalid {
                field: "containers[].vmid".into(),
                value: self.vmid.to_string(),
                message: "must be between 100 and 999999999".into(),
            });
        }
        if self.cooldown_seconds < 60 {
            return Err(ConfigError::Invalid {
                field: format!("containers[{}].cooldown_seconds", self.vmid),
                value: self.cooldown_seconds.to_string(),
                message: "must be at least 60 seconds".into(),
            });
        }
        if self.evaluation_periods < 1 {
            return Err(ConfigError::Invalid {
                field: format!("containers[{}].evaluation_periods", self.vmid),
                value: self.evaluation_periods.to_string(),
                message: "must be at least 1".into(),
            });
        }
        if let Some(t) = &self.thresholds {
            t.validate(&format!("containers[{}].thresholds", self.vmid))?;
        }
        if let Some(l) = &self.limits {
            l.validate(&format!("containers[{}].limits", self.vmid))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoscalerConfig {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub default_thresholds: Thresholds,
    #[serde(default)]
    pub default_limits: Limits,
    #[serde(default)]
    pub containers: Vec<ContainerPolicy>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_s: default_monitoring_interval(),
            log_level: default_log_level(),
            log_file: None,
            pid_file: default_pid_file(),
            dry_run: false,
        }
    }
}

impl AutoscalerConfig {
    /// Validates every section plus cross-section invariants, and returns
    /// each container's effective (merged-over-defaults) thresholds/limits
    /// resolved in place is left to callers via [`ContainerPolicy::effective_thresholds`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gateway.validate()?;
        self.global.validate()?;
        self.safety.validate()?;
        self.default_thresholds.validate("default_thresholds")?;
        self.default_limits.validate("default_limits")?;

        let mut seen = std::collections::HashSet::new();
        for container in &self.containers {
            container.validate()?;
            if !seen.insert(container.vmid) {
                return Err(ConfigError::Invalid {
                    field: "containers[].vmid".into(),
                    value: container.vmid.to_string(),
                    message: "duplicate vmid in container list".into(),
                });
            }
        }
        Ok(())
    }

    pub fn effective_thresholds(&self, container: &ContainerPolicy) -> Thresholds {
        container
            .thresholds
            .clone()
            .unwrap_or_else(|| self.default_thresholds.clone())
    }

    pub fn effective_limits(&self, container: &ContainerPolicy) -> Limits {
        container
            .limits
            .clone()
            .unwrap_or_else(|| self.default_limits.clone())
    }
}
