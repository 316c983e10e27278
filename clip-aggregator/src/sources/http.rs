use crate::traits::{ByteStream, ClipFeed};
use crate::types::{AggregatorError, Clip, ClipQuery, ErrorResponse, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::{Client, Response};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Talks to a running clip server over HTTP.
pub struct HttpClipFeed {
    client: Client,
    base_url: Url,
}

impl HttpClipFeed {
    pub fn new(base_url: &str) -> Result<Self> {
        // No overall timeout: the streamed response stays open as long as the
        // slowest channel keeps paging.
        let client = Client::builder()
            .user_agent("Clip-Aggregator-Client/1.0")
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { client, base_url })
    }

    async fn get(&self, path: &str, query: &ClipQuery) -> Result<Response> {
        let url = self.base_url.join(path)?;
        debug!("GET {}", url);
        let response = self.client.get(url).query(&query.to_params()).send().await?;
        check_status(response).await
    }
}

/// Map our server's error body back onto the error kinds.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(error) if error.kind == "auth" => Err(AggregatorError::Auth(error.error)),
        Ok(error) => Err(AggregatorError::Upstream {
            status: Some(status.as_u16()),
            message: format!("{}: {}", error.kind, error.error),
        }),
        Err(_) => Err(AggregatorError::Upstream {
            status: Some(status.as_u16()),
            message: body,
        }),
    }
}

#[async_trait]
impl ClipFeed for HttpClipFeed {
    fn feed_name(&self) -> String {
        format!("clip server at {}", self.base_url)
    }

    async fn preview(&self, query: &ClipQuery) -> Result<Vec<Clip>> {
        let response = self.get("api/clips/preview", query).await?;
        Ok(response.json::<Vec<Clip>>().await?)
    }

    async fn stream(&self, query: &ClipQuery, cancel: CancellationToken) -> Result<ByteStream> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AggregatorError::Cancelled),
            response = self.get("api/clips", query) => response?,
        };

        info!("Clip stream opened ({})", response.status());
        // Ending the byte stream on cancel drops the response and closes the socket.
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(AggregatorError::from))
            .take_until(cancel.cancelled_owned())
            .boxed())
    }
}
