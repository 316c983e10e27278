use crate::channel_stream::{ChannelStream, EarlyExitPolicy};
use crate::clock::Clock;
use crate::fetcher::PageFetcher;
use crate::identity::IdentityResolver;
use crate::token::TokenProvider;
use crate::traits::HelixApi;
use crate::types::{AggregatorError, Clip, ClipQuery, PageResult, ResolvedChannel, Result, StreamConfig};
use bytes::Bytes;
use futures::future::{self, join_all};
use futures::stream::{self, BoxStream, StreamExt};
use interfaces::is_valid_channel_name;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Fans one paging stream per channel out concurrently and multiplexes the
/// pages onto a single newline-delimited JSON byte stream.
pub struct ClipAggregator {
    identity: Arc<IdentityResolver>,
    fetcher: Arc<PageFetcher>,
    config: StreamConfig,
}

impl ClipAggregator {
    pub fn new(identity: Arc<IdentityResolver>, fetcher: Arc<PageFetcher>, config: StreamConfig) -> Self {
        Self {
            identity,
            fetcher,
            config,
        }
    }

    /// Wire up token provider, identity resolver and page fetcher around one upstream client.
    pub fn from_api(api: Arc<dyn HelixApi>, clock: Arc<dyn Clock>, config: StreamConfig) -> Self {
        let tokens = Arc::new(TokenProvider::new(
            api.clone(),
            clock.clone(),
            config.token_refresh_margin_seconds,
        ));
        let identity = Arc::new(IdentityResolver::new(
            api.clone(),
            tokens.clone(),
            clock,
            config.identity_ttl_hours,
        ));
        let fetcher = Arc::new(PageFetcher::new(api, tokens));
        Self::new(identity, fetcher, config)
    }

    pub fn identity(&self) -> &Arc<IdentityResolver> {
        &self.identity
    }

    /// Validate and resolve the requested channel names.
    ///
    /// Malformed and unknown names are dropped, as are names whose lookup
    /// failed upstream. Only a credential failure fails the whole call.
    pub async fn resolve_channels(&self, query: &ClipQuery) -> Result<Vec<ResolvedChannel>> {
        for name in query.channels.iter().filter(|name| !is_valid_channel_name(name.trim())) {
            debug!("Dropping invalid channel name {:?}", name);
        }

        let names = query.valid_channels();
        let lookups = join_all(names.iter().map(|name| self.identity.resolve_id(name))).await;

        let mut channels = Vec::with_capacity(names.len());
        for (name, lookup) in names.into_iter().zip(lookups) {
            match lookup {
                Ok(Some(id)) => channels.push(ResolvedChannel { id, name }),
                Ok(None) => info!("Dropping unknown channel {}", name),
                Err(e @ AggregatorError::Auth(_)) => {
                    error!("Cannot resolve channels without a credential: {}", e);
                    return Err(e);
                }
                Err(e) => warn!("Dropping channel {}, lookup failed: {}", name, e),
            }
        }

        Ok(channels)
    }

    /// Resolve channels, then stream their pages.
    pub async fn stream(&self, query: &ClipQuery, cancel: CancellationToken) -> Result<BoxStream<'static, Bytes>> {
        let channels = self.resolve_channels(query).await?;
        Ok(self.stream_channels(channels, query, cancel))
    }

    /// One line per page, written as soon as any channel produces it. Pages of
    /// one channel keep their order; channels interleave freely.
    ///
    /// The returned stream ends once every channel is done or `cancel` fires.
    /// Dropping it cancels the channel tasks too. Channel tasks and line
    /// encoding log under the caller's current span.
    pub fn stream_channels(
        &self,
        channels: Vec<ResolvedChannel>,
        query: &ClipQuery,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Bytes> {
        let cancel = cancel.child_token();
        let span = Span::current();
        let window = query.window();
        let policy = EarlyExitPolicy {
            min_views: query.min_views,
            enabled: self.config.early_exit,
            guard: self.config.early_exit_guard,
        };

        info!(
            "Streaming {} channels from {} to {} (minViews {})",
            channels.len(),
            query.from,
            query.to,
            query.min_views
        );

        let mut receivers = Vec::with_capacity(channels.len());
        for channel in channels {
            let (tx, rx) = mpsc::channel(self.config.channel_buffer.max(1));
            let pages = ChannelStream::new(
                self.fetcher.clone(),
                channel,
                window,
                self.config.page_size,
                policy,
                cancel.clone(),
            );
            tokio::spawn(forward_pages(pages, tx).instrument(span.clone()));
            receivers.push(ReceiverStream::new(rx));
        }

        let guard = cancel.clone().drop_guard();
        stream::select_all(receivers)
            .take_until(cancel.cancelled_owned())
            .filter_map(move |page| {
                let _cancel_on_drop = &guard;
                let _entered = span.enter();
                future::ready(encode_line(&page))
            })
            .boxed()
    }

    /// First page of every channel, unfiltered and without early exit.
    pub async fn preview(&self, query: &ClipQuery) -> Result<Vec<Clip>> {
        let channels = self.resolve_channels(query).await?;
        let window = query.window();

        let pages = join_all(
            channels
                .iter()
                .map(|channel| self.fetcher.fetch_page(&channel.id, window, self.config.preview_page_size, None)),
        )
        .await;

        let mut clips = Vec::new();
        for (channel, page) in channels.iter().zip(pages) {
            match page {
                Ok(page) => clips.extend(page.clips),
                Err(e @ AggregatorError::Auth(_)) => return Err(e),
                Err(e) => warn!("Preview for channel {} failed: {}", channel.name, e),
            }
        }

        debug!("Preview returned {} clips for {} channels", clips.len(), channels.len());
        Ok(clips)
    }
}

async fn forward_pages(mut pages: ChannelStream, tx: mpsc::Sender<PageResult>) {
    while let Some(page) = pages.next().await {
        if tx.send(page).await.is_err() {
            debug!("Consumer went away, stopping channel {}", pages.channel().name);
            break;
        }
    }
}

/// Serialize a page as one NDJSON line: a JSON array of clips plus `\n`.
pub fn encode_line(page: &PageResult) -> Option<Bytes> {
    match serde_json::to_vec(&page.clips) {
        Ok(mut line) => {
            line.push(b'\n');
            Some(Bytes::from(line))
        }
        Err(e) => {
            error!("Failed to serialize page of {} clips: {}", page.clips.len(), e);
            None
        }
    }
}
