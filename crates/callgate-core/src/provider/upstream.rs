use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::UpstreamError;
use crate::util::http;

use super::{ByteStream, Upstream, UpstreamTarget};

/// HTTP transport over the shared reqwest client.
///
/// Streaming requests are bounded up to the response headers only; once the
/// body starts flowing it is relayed for as long as the vendor keeps
/// sending. JSON requests are bounded end to end.
pub struct HttpUpstream {
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn request(&self, target: &UpstreamTarget, body: &serde_json::Value) -> reqwest::RequestBuilder {
        http::client()
            .post(&target.url)
            .header("Authorization", format!("Bearer {}", target.api_key))
            .header("Content-Type", "application/json")
            .json(body)
    }
}

/// Turn a non-2xx response into an error carrying the vendor's body.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(UpstreamError::Api {
        status: status.as_u16(),
        message: text,
    })
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn open_stream(&self, target: &UpstreamTarget, body: &serde_json::Value) -> Result<ByteStream, UpstreamError> {
        debug!("Opening stream to {}", target.url);
        let send = self
            .request(target, body)
            .header("Accept", "text/event-stream")
            .send();

        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout.as_secs()))??;
        let response = check_status(response).await?;

        let url = target.url.clone();
        let stream = response
            .bytes_stream()
            .map_err(UpstreamError::from)
            .inspect_err(move |e| warn!("Stream from {} broke off: {}", url, e));
        Ok(stream.boxed())
    }

    async fn post_json(
        &self,
        target: &UpstreamTarget,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, UpstreamError> {
        debug!("POST {}", target.url);
        let response = self
            .request(target, body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout(self.timeout.as_secs())
                } else {
                    UpstreamError::Http(e)
                }
            })?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}
