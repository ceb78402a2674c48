use std::time::Duration;

use async_trait::async_trait;

use crate::model::{Device, ExecutionStatus, Node};

/// Outcome of one probe out-call.
///
/// The coordinator treats the summary as an opaque blob for collaborators to
/// parse; only the status participates in scheduling decisions.
#[derive(Clone, Debug)]
pub struct ProbeReport {
    pub status: ExecutionStatus,
    pub summary: serde_json::Value,
    pub duration: Duration,
}

impl ProbeReport {
    pub fn success(summary: serde_json::Value, duration: Duration) -> Self {
        Self {
            status: ExecutionStatus::Success,
            summary,
            duration,
        }
    }

    pub fn failed(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            summary: serde_json::json!({ "error": message.into() }),
            duration,
        }
    }
}

/// The probe engine boundary.
///
/// For discovery probes the engine walks the device and returns the observed
/// index keys; for get probes it fans out across the known ONUs with its own
/// internal worker pool. Neither concerns the coordinator: implementations
/// must return a report rather than an error, mapping their internal
/// failures to [`ExecutionStatus::Failed`] with the cause in the summary.
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    async fn execute(&self, device: &Device, node: &Node) -> ProbeReport;
}

/// Talks to the probe engine service over HTTP.
///
/// The engine exposes `POST {base}/probe` taking the device and node
/// snapshots and answering with `{status, summary, duration_ms}`.
pub struct HttpProbeExecutor {
    client: reqwest::Client,
    base: reqwest::Url,
}

#[derive(Serialize)]
struct ProbeRequest<'a> {
    device: &'a Device,
    node: &'a Node,
}

#[derive(Deserialize)]
struct ProbeResponse {
    status: ExecutionStatus,
    #[serde(default)]
    summary: serde_json::Value,
    #[serde(default)]
    duration_ms: u64,
}

impl HttpProbeExecutor {
    pub fn new(base: reqwest::Url, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self { client, base })
    }

    async fn call(&self, device: &Device, node: &Node) -> anyhow::Result<ProbeResponse> {
        let url = self.base.join("probe")?;
        let response = self
            .client
            .post(url)
            .json(&ProbeRequest { device, node })
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }
}

#[async_trait]
impl ProbeExecutor for HttpProbeExecutor {
    async fn execute(&self, device: &Device, node: &Node) -> ProbeReport {
        let start = tokio::time::Instant::now();

        match self.call(device, node).await {
            Ok(response) => {
                let status = match response.status {
                    // The engine only ever reports terminal statuses; anything
                    // else is a contract violation we record as a failure.
                    s if s.is_final() => s,
                    _ => ExecutionStatus::Failed,
                };

                ProbeReport {
                    status,
                    summary: response.summary,
                    duration: Duration::from_millis(response.duration_ms),
                }
            }
            Err(e) => {
                tracing::warn!(
                    device_id = device.id,
                    node_id = node.id,
                    "probe engine call failed: {e:#}"
                );

                ProbeReport::failed(format!("{e:#}"), start.elapsed())
            }
        }
    }
}
