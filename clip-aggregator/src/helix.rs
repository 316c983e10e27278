use crate::traits::HelixApi;
use crate::types::{AggregatorError, Clip, Credential, HelixConfig, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Seconds until the token stops working
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelixUser {
    pub id: String,
    pub login: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserLookup {
    Login(String),
    Id(String),
}

impl UserLookup {
    fn as_query(&self) -> (&'static str, &str) {
        match self {
            UserLookup::Login(login) => ("login", login),
            UserLookup::Id(id) => ("id", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipsRequest {
    pub broadcaster_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub first: u8,
    pub after: Option<String>,
}

/// Clip as the upstream listing returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelixClip {
    pub id: String,
    pub url: String,
    pub embed_url: String,
    pub broadcaster_id: String,
    pub broadcaster_name: String,
    #[serde(default)]
    pub creator_id: String,
    #[serde(default)]
    pub creator_name: String,
    #[serde(default)]
    pub video_id: String,
    #[serde(default)]
    pub game_id: String,
    #[serde(default)]
    pub language: String,
    pub title: String,
    pub view_count: u64,
    pub created_at: DateTime<Utc>,
    pub thumbnail_url: String,
    pub duration: f64,
    #[serde(default)]
    pub vod_offset: Option<u64>,
}

impl From<HelixClip> for Clip {
    fn from(raw: HelixClip) -> Self {
        Self {
            id: raw.id,
            channel_id: raw.broadcaster_id,
            channel_name: raw.broadcaster_name,
            creator_name: raw.creator_name,
            title: raw.title,
            url: raw.url,
            embed_url: raw.embed_url,
            thumbnail_url: raw.thumbnail_url,
            created_at: raw.created_at,
            duration: raw.duration,
            view_count: raw.view_count,
            video_id: raw.video_id,
            vod_offset: raw.vod_offset,
            category_id: raw.game_id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelixPage<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub pagination: Pagination,
}

impl<T> HelixPage<T> {
    /// Next cursor, with the upstream's empty-string "no more pages" folded into `None`.
    pub fn next_cursor(&self) -> Option<String> {
        self.pagination.cursor.clone().filter(|cursor| !cursor.is_empty())
    }
}

/// `reqwest` client for the upstream API.
pub struct HelixClient {
    client: Client,
    config: HelixConfig,
    api_base: Url,
    token_url: Url,
}

impl HelixClient {
    pub fn new(config: HelixConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()?;

        let api_base = Url::parse(config.api_base_url.trim_end_matches('/'))?;
        let token_url = Url::parse(&config.token_url)?;

        Ok(Self {
            client,
            config,
            api_base,
            token_url,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.as_str().trim_end_matches('/'), path)
    }

    fn authorized(&self, request: RequestBuilder, credential: &Credential) -> RequestBuilder {
        request
            .bearer_auth(&credential.token)
            .header("Client-Id", &credential.client_id)
    }

    /// Send with retries on 429/5xx and connection failures. 401 is never retried.
    async fn send_with_retry<F>(&self, label: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let retry_delay = Duration::from_millis(self.config.retry_delay_millis);
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: retry_delay,
            initial_interval: retry_delay,
            max_interval: retry_delay * 32,
            multiplier: 2.0,
            max_elapsed_time: Some(retry_delay * 120),
            ..Default::default()
        };

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match build().send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status == StatusCode::UNAUTHORIZED {
                        return Err(AggregatorError::Auth(format!("{} rejected credentials (HTTP 401)", label)));
                    }

                    let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    let message = response.text().await.unwrap_or_default();
                    let err = AggregatorError::Upstream {
                        status: Some(status.as_u16()),
                        message: format!("{}: {}", label, message.trim()),
                    };

                    if !retryable {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
                Err(e) => {
                    let retryable = e.is_timeout() || e.is_connect();
                    let err = AggregatorError::Http(e);
                    if !retryable {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }

            if attempt < self.config.max_retries {
                if let Some(delay) = backoff.next_backoff() {
                    warn!("Attempt {} for {} failed, retrying in {:?}", attempt + 1, label, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
            break;
        }

        let err = last_error.unwrap_or_else(|| AggregatorError::General(format!("{}: no attempt made", label)));
        error!("Giving up on {} after {} attempts: {}", label, self.config.max_retries + 1, err);
        Err(err)
    }
}

#[async_trait]
impl HelixApi for HelixClient {
    fn client_id(&self) -> &str {
        &self.config.client_id
    }

    async fn request_token(&self) -> Result<TokenGrant> {
        debug!("Requesting app token from {}", self.token_url);
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];
        let response = self
            .send_with_retry("token exchange", || self.client.post(self.token_url.clone()).form(&params))
            .await?;
        Ok(response.json::<TokenGrant>().await?)
    }

    async fn get_users(&self, credential: &Credential, lookup: &UserLookup) -> Result<Vec<HelixUser>> {
        let url = self.endpoint("users");
        let query = [lookup.as_query()];
        let result = self
            .send_with_retry("user lookup", || self.authorized(self.client.get(&url), credential).query(&query))
            .await;

        match result {
            Ok(response) => Ok(response.json::<HelixPage<HelixUser>>().await?.data),
            // The upstream answers 400 for logins it considers malformed.
            Err(AggregatorError::Upstream { status: Some(400), .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn get_clips(&self, credential: &Credential, request: &ClipsRequest) -> Result<HelixPage<HelixClip>> {
        let url = self.endpoint("clips");
        let started_at = request.started_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let ended_at = request.ended_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let first = request.first.to_string();

        let mut query = vec![
            ("broadcaster_id", request.broadcaster_id.as_str()),
            ("started_at", started_at.as_str()),
            ("ended_at", ended_at.as_str()),
            ("first", first.as_str()),
        ];
        if let Some(after) = request.after.as_deref() {
            query.push(("after", after));
        }

        let response = self
            .send_with_retry("clip listing", || self.authorized(self.client.get(&url), credential).query(&query))
            .await?;
        Ok(response.json::<HelixPage<HelixClip>>().await?)
    }
}
