//! HTTP media reachability probe

use async_trait::async_trait;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{MediaProbe, ProbeResult};
use crate::model::MediaUrl;

/// Probe using `HEAD`, falling back to a one-byte ranged `GET`
///
/// Many CDNs reject `HEAD` (405) or unsigned probes (403) while still serving
/// the file, so those statuses are reported as [`ProbeResult::LikelyReachable`]
/// and the caller decides whether to trust them.
#[derive(Debug, Clone)]
pub struct HttpMediaProbe {
    client: Arc<Client>,
    timeout: Duration,
}

impl HttpMediaProbe {
    /// Create a probe with a per-request timeout
    pub fn new(client: Arc<Client>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn head(&self, url: &str) -> Result<StatusCode, String> {
        self.client
            .head(url)
            .timeout(self.timeout)
            .send()
            .await
            .map(|r| r.status())
            .map_err(|e| e.to_string())
    }

    async fn ranged_get(&self, url: &str) -> Result<StatusCode, String> {
        self.client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .timeout(self.timeout)
            .send()
            .await
            .map(|r| r.status())
            .map_err(|e| e.to_string())
    }
}

/// Interpret a probe status code
pub fn classify_probe_status(status: u16) -> ProbeResult {
    match status {
        200..=399 => ProbeResult::Reachable,
        403 | 405 => ProbeResult::LikelyReachable(status),
        _ => ProbeResult::Unreachable(format!("HTTP {status}")),
    }
}

#[async_trait]
impl MediaProbe for HttpMediaProbe {
    async fn probe(&self, url: &MediaUrl) -> ProbeResult {
        let head = match self.head(url.as_str()).await {
            Ok(status) => classify_probe_status(status.as_u16()),
            Err(e) => ProbeResult::Unreachable(e),
        };
        if head == ProbeResult::Reachable {
            return head;
        }

        debug!(url = %url, head = ?head, "HEAD probe inconclusive, trying ranged GET");
        match self.ranged_get(url.as_str()).await {
            Ok(status) => match classify_probe_status(status.as_u16()) {
                ProbeResult::Reachable => ProbeResult::Reachable,
                // Keep the more informative HEAD verdict when GET is no better
                get => match head {
                    ProbeResult::LikelyReachable(_) => head,
                    _ => get,
                },
            },
            Err(e) => match head {
                ProbeResult::LikelyReachable(_) => head,
                _ => ProbeResult::Unreachable(e),
            },
        }
    }
}
