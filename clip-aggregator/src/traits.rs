use crate::helix::{ClipsRequest, HelixClip, HelixPage, HelixUser, TokenGrant, UserLookup};
use crate::types::{Clip, ClipQuery, Credential, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// The slice of the upstream API the pipeline consumes.
#[async_trait]
pub trait HelixApi: Send + Sync {
    /// Client id sent alongside every bearer token
    fn client_id(&self) -> &str;

    /// Client-credentials grant
    async fn request_token(&self) -> Result<TokenGrant>;

    /// Look a channel up by login or numeric id. An empty vec means the
    /// upstream does not know the channel.
    async fn get_users(&self, credential: &Credential, lookup: &UserLookup) -> Result<Vec<HelixUser>>;

    /// One page of the clip listing
    async fn get_clips(&self, credential: &Credential, request: &ClipsRequest) -> Result<HelixPage<HelixClip>>;
}

/// Raw bytes of the newline-delimited clip stream.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Where a consumer gets its clips from: our HTTP server, or the aggregator
/// running in the same process.
#[async_trait]
pub trait ClipFeed: Send + Sync {
    /// Human-readable name for logs
    fn feed_name(&self) -> String;

    /// Fast bounded query: one page per channel, unfiltered.
    async fn preview(&self, query: &ClipQuery) -> Result<Vec<Clip>>;

    /// Full aggregation as newline-delimited JSON. Cancelling `cancel` tears
    /// the underlying request down.
    async fn stream(&self, query: &ClipQuery, cancel: CancellationToken) -> Result<ByteStream>;
}
