use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
// Use the interfaces crate for the wire types
pub use interfaces::defs::{Clip, ClipQuery, ClipQueryParams, DateWindow, PageResult, QueryError, SortMode};

/// Bearer credential handed to every upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub client_id: String,
}

/// Process-wide token cache. `access_token == None` means "refresh before use".
#[derive(Debug, Clone)]
pub struct TokenState {
    pub access_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Default for TokenState {
    fn default() -> Self {
        Self {
            access_token: None,
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCacheEntry {
    pub channel_id: String,
    /// Login name, lowercase.
    pub channel_name: String,
    pub display_name: String,
    pub expires_at: DateTime<Utc>,
}

/// A requested channel name that resolved to an upstream id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedChannel {
    pub id: String,
    pub name: String,
}

/// Settings for the upstream HTTP client.
#[derive(Debug, Clone)]
pub struct HelixConfig {
    pub api_base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_millis: u64,
}

impl Default for HelixConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.twitch.tv/helix".to_string(),
            token_url: "https://id.twitch.tv/oauth2/token".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            user_agent: "Clip-Aggregator/1.0".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
            retry_delay_millis: 500,
        }
    }
}

/// Tuning for the paging pipeline.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub page_size: u8,
    pub preview_page_size: u8,
    pub identity_ttl_hours: i64,
    pub token_refresh_margin_seconds: i64,
    /// Pages a channel task may run ahead of the fan-in.
    pub channel_buffer: usize,
    pub early_exit: bool,
    /// Turn early exit off for a channel once its pages are seen out of view order.
    pub early_exit_guard: bool,
    pub max_line_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            page_size: interfaces::MAX_PAGE_SIZE,
            preview_page_size: 20,
            identity_ttl_hours: 24,
            token_refresh_margin_seconds: 3600,
            channel_buffer: 1,
            early_exit: true,
            early_exit_guard: true,
            max_line_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Body of every non-2xx response from our own server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub kind: String,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Upstream error (status {status:?}): {message}")]
    Upstream { status: Option<u16>, message: String },

    #[error("Channel not found: {name}")]
    NotFound { name: String },

    #[error("Validation error: {0}")]
    Validation(#[from] QueryError),

    #[error("Malformed stream line '{line}': {source}")]
    StreamParse {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Stream line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("General error: {0}")]
    General(String),
}

impl AggregatorError {
    /// Errors that end a whole query and show up in the consumer's error slot.
    /// Everything else only shrinks the result set.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AggregatorError::Auth(_) | AggregatorError::StreamParse { .. } | AggregatorError::LineTooLong { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AggregatorError::Auth(_) => "auth",
            AggregatorError::Upstream { .. } | AggregatorError::Http(_) => "upstream",
            AggregatorError::NotFound { .. } => "not_found",
            AggregatorError::Validation(_) => "validation",
            AggregatorError::StreamParse { .. } | AggregatorError::LineTooLong { .. } => "stream_parse",
            AggregatorError::Cancelled => "cancelled",
            _ => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
