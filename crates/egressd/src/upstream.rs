//! The management plane that receives events, statistics, queue
//! depths and limits.
use anyhow::Context;
use async_trait::async_trait;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Events,
    Stats,
    Queue,
    Limits,
}

impl ReportKind {
    pub fn path(self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Stats => "stats",
            Self::Queue => "queue",
            Self::Limits => "limits",
        }
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn post(
        &self,
        kind: ReportKind,
        sink_id: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Posts JSON reports to `<url>/api/<kind>/<sink id>`, adding the
/// access key to every body.
pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
    access_key: String,
}

impl HttpUpstream {
    pub fn new(url: &str, access_key: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            access_key: access_key.to_string(),
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn post(
        &self,
        kind: ReportKind,
        sink_id: &str,
        mut body: serde_json::Value,
    ) -> anyhow::Result<()> {
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                "accesskey".to_string(),
                serde_json::Value::String(self.access_key.clone()),
            );
        }

        let url = format!("{}/api/{}/{sink_id}", self.url, kind.path());
        let response = self.client.post(&url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body_bytes = response.bytes().await.unwrap_or_default();
            anyhow::bail!(
                "{url}: request status {}: {}. Response body: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                String::from_utf8_lossy(&body_bytes)
            );
        }
        Ok(())
    }
}

/// Used when no management plane is configured
pub struct DiscardUpstream;

#[async_trait]
impl Upstream for DiscardUpstream {
    async fn post(
        &self,
        kind: ReportKind,
        _sink_id: &str,
        _body: serde_json::Value,
    ) -> anyhow::Result<()> {
        tracing::trace!("no upstream configured; discarding {} report", kind.path());
        Ok(())
    }
}
