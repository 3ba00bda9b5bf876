//! Thin reqwest-backed [`ClusterGateway`] implementation against the
//! Proxmox VE REST API.
//!
//! This is a working collaborator, not the focus of the crate: it exists
//! so the daemon binary has something real to run against. Transport
//! hardening beyond timeout + auth-failure mapping is out of scope.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::debug;

use super::{
    Aggregation, ClusterGateway, ContainerConfig, ContainerListEntry, ContainerStatus,
    GatewayError, GatewayResult, NodeInfo, NodeMemory, NodeState, NodeStatusData, ResizeRequest,
    RuntimeStatus, Timeframe, TimeseriesPoint,
};
use crate::config::models::GatewayConfig;

/// Fairness bound on outbound requests recommended by the spec.
const MAX_CONCURRENT_REQUESTS: usize = 10;

pub struct ProxmoxGateway {
    client: Client,
    base_url: String,
    auth_header: (String, String),
    timeout: Duration,
    semaphore: Semaphore,
}

impl ProxmoxGateway {
    pub fn new(config: &GatewayConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        let auth_header = if let (Some(name), Some(value)) =
            (&config.token_name, &config.token_value)
        {
            (
                "Authorization".to_string(),
                format!("PVEAPIToken={}!{}={}", config.user, name, value),
            )
        } else if let Some(password) = &config.password {
            // Ticket-based auth is a login round trip; for the purposes of
            // this gateway we accept a pre-obtained ticket passed as the
            // password field, matching how operators script around the
            // cluster's API in practice.
            ("Cookie".to_string(), format!("PVEAuthCookie={password}"))
        } else {
            return Err(GatewayError::Auth(
                "gateway config has neither token nor password authentication".into(),
            ));
        };

        Ok(Self {
            client,
            base_url: format!("https://{}:{}/api2/json", config.host, config.port),
            auth_header,
            timeout: Duration::from_secs(config.timeout_s),
            semaphore: Semaphore::new(MAX_CONCURRENT_REQUESTS),
        })
    }

    async fn get(&self, path: &str) -> GatewayResult<Value> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "gateway GET");

        let resp = self
            .client
            .get(&url)
            .header(self.auth_header.0.as_str(), self.auth_header.1.as_str())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let envelope: Envelope = handle_status(resp).await?;
        Ok(envelope.data)
    }

    async fn put(&self, path: &str, body: Value) -> GatewayResult<()> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "gateway PUT");

        let resp = self
            .client
            .put(&url)
            .header(self.auth_header.0.as_str(), self.auth_header.1.as_str())
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let _: Envelope = handle_status(resp).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
}

fn map_reqwest_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(e.to_string())
    } else if e.is_connect() {
        GatewayError::Connection(e.to_string())
    } else {
        GatewayError::OperationFailed(e.to_string())
    }
}

async fn handle_status(resp: reqwest::Response) -> GatewayResult<Envelope> {
    match resp.status() {
        StatusCode::OK => resp
            .json::<Envelope>()
            .await
            .map_err(|e| GatewayError::OperationFailed(e.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(GatewayError::Auth(resp.status().to_string()))
        }
        StatusCode::NOT_FOUND => Err(GatewayError::NotFound(resp.status().to_string())),
        StatusCode::TOO_MANY_REQUESTS => Err(GatewayError::RateLimited(resp.status().to_string())),
        status => Err(GatewayError::OperationFailed(format!(
            "unexpected status {status}"
        ))),
    }
}

#[async_trait]
impl ClusterGateway for ProxmoxGateway {
    async fn list_nodes(&self) -> GatewayResult<Vec<NodeInfo>> {
        let data = self.get("/nodes").await?;
        let entries = data.as_array().cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|n| NodeInfo {
                name: n
                    .get("node")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                status: match n.get("status").and_then(Value::as_str) {
                    Some("online") => NodeState::Online,
                    Some("offline") => NodeState::Offline,
                    _ => NodeState::Unknown,
                },
            })
            .collect())
    }

    async fn list_containers(&self, node: &str) -> GatewayResult<Vec<ContainerListEntry>> {
        let data = self.get(&format!("/nodes/{node}/lxc")).await?;
        let entries = data.as_array().cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter(|c| c.get("type").and_then(Value::as_str) == Some("lxc"))
            .filter_map(|c| c.get("vmid").and_then(Value::as_u64))
            .map(|vmid| ContainerListEntry { vmid })
            .collect())
    }

    async fn find_container_node(&self, vmid: u64) -> GatewayResult<Option<String>> {
        for node in self.list_nodes().await? {
            match self.list_containers(&node.name).await {
                Ok(containers) => {
                    if containers.iter().any(|c| c.vmid == vmid) {
                        return Ok(Some(node.name));
                    }
                }
                Err(GatewayError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn get_container_status(&self, node: &str, vmid: u64) -> GatewayResult<ContainerStatus> {
        let data = self
            .get(&format!("/nodes/{node}/lxc/{vmid}/status/current"))
            .await?;
        let status = data.get("status").and_then(Value::as_str).unwrap_or("");
        Ok(ContainerStatus {
            runtime_status: match status {
                "running" => RuntimeStatus::Running,
                "stopped" => RuntimeStatus::Stopped,
                "paused" => RuntimeStatus::Paused,
                _ => RuntimeStatus::Unknown,
            },
            uptime_seconds: data.get("uptime").and_then(Value::as_u64).unwrap_or(0),
        })
    }

    async fn get_container_config(&self, node: &str, vmid: u64) -> GatewayResult<ContainerConfig> {
        let data = self.get(&format!("/nodes/{node}/lxc/{vmid}/config")).await?;
        Ok(ContainerConfig {
            cores: data.get("cores").and_then(Value::as_u64).map(|v| v as u32),
            memory_mb: data.get("memory").and_then(Value::as_u64),
            hostname: data
                .get("hostname")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn get_container_timeseries(
        &self,
        node: &str,
        vmid: u64,
        timeframe: Timeframe,
        aggregation: Aggregation,
    ) -> GatewayResult<Vec<TimeseriesPoint>> {
        let timeframe = match timeframe {
            Timeframe::Hour => "hour",
            Timeframe::Day => "day",
            Timeframe::Week => "week",
        };
        let cf = match aggregation {
            Aggregation::Average => "AVERAGE",
            Aggregation::Max => "MAX",
        };

        let data = self
            .get(&format!(
                "/nodes/{node}/lxc/{vmid}/rrddata?timeframe={timeframe}&cf={cf}"
            ))
            .await?;

        let points = data.as_array().cloned().unwrap_or_default();
        Ok(points
            .into_iter()
            .filter_map(|p| {
                let time = p.get("time").and_then(Value::as_i64)?;
                Some(TimeseriesPoint {
                    timestamp: chrono::DateTime::<Utc>::from_timestamp(time, 0)?,
                    cpu_fraction: p.get("cpu").and_then(Value::as_f64).unwrap_or(0.0),
                    mem_bytes: p.get("mem").and_then(Value::as_u64).unwrap_or(0),
                    mem_max_bytes: p.get("maxmem").and_then(Value::as_u64).unwrap_or(1),
                })
            })
            .collect())
    }

    async fn get_node_status(&self, node: &str) -> GatewayResult<NodeStatusData> {
        let data = self.get(&format!("/nodes/{node}/status")).await?;
        let memory = data.get("memory").cloned().unwrap_or_default();
        let loadavg: [f64; 3] = data
            .get("loadavg")
            .and_then(Value::as_array)
            .map(|a| {
                let mut out = [0.0; 3];
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = a
                        .get(i)
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0.0);
                }
                out
            })
            .unwrap_or([0.0, 0.0, 0.0]);

        Ok(NodeStatusData {
            cpu_fraction: data.get("cpu").and_then(Value::as_f64).unwrap_or(0.0),
            memory: NodeMemory {
                used_bytes: memory.get("used").and_then(Value::as_u64).unwrap_or(0),
                total_bytes: memory.get("total").and_then(Value::as_u64).unwrap_or(1),
            },
            uptime_seconds: data.get("uptime").and_then(Value::as_u64).unwrap_or(0),
            load_average: loadavg,
        })
    }

    async fn resize(&self, node: &str, vmid: u64, request: ResizeRequest) -> GatewayResult<()> {
        if request.cores.is_none() && request.memory_mb.is_none() {
            return Err(GatewayError::OperationFailed(
                "resize requires at least one of cores or memory_mb".into(),
            ));
        }

        let mut body = serde_json::Map::new();
        if let Some(cores) = request.cores {
            body.insert("cores".into(), Value::from(cores));
        }
        if let Some(mem) = request.memory_mb {
            body.insert("memory".into(), Value::from(mem));
        }

        self.put(&format!("/nodes/{node}/lxc/{vmid}/config"), Value::Object(body))
            .await
    }

    async fn health_ping(&self) -> GatewayResult<()> {
        self.get("/version").await.map(|_| ())
    }
}
