use crate::fetcher::PageFetcher;
use crate::types::{AggregatorError, DateWindow, PageResult, ResolvedChannel};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// When to stop paging a channel before the upstream runs out of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarlyExitPolicy {
    pub min_views: u64,
    pub enabled: bool,
    /// Disable early exit for the channel once pages are seen out of view order.
    pub guard: bool,
}

impl EarlyExitPolicy {
    pub fn new(min_views: u64) -> Self {
        Self {
            min_views,
            enabled: true,
            guard: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            min_views: 0,
            enabled: false,
            guard: false,
        }
    }

    /// Pages are assumed to be sorted by descending views, so once the last
    /// clip of a page is under the threshold nothing after it can qualify.
    pub fn exhausted_by(&self, page: &PageResult) -> bool {
        self.enabled
            && page
                .last_view_count()
                .is_some_and(|views| views < self.min_views)
    }
}

/// Lazy, finite sequence of pages for one channel.
///
/// Ends on an empty page, on a failed fetch (logged, never propagated), when
/// the early-exit policy fires, or when `cancel` is triggered.
pub struct ChannelStream {
    channel: ResolvedChannel,
    inner: BoxStream<'static, PageResult>,
}

impl ChannelStream {
    pub fn new(
        fetcher: Arc<PageFetcher>,
        channel: ResolvedChannel,
        window: DateWindow,
        page_size: u8,
        policy: EarlyExitPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let state = PagingState {
            fetcher,
            channel: channel.clone(),
            window,
            page_size,
            policy,
            cancel,
            next_cursor: None,
            finished: false,
            pages: 0,
            previous_last: None,
        };

        let inner = stream::unfold(state, |mut state| async move {
            let page = state.next_page().await?;
            Some((page, state))
        })
        .boxed();

        Self { channel, inner }
    }

    pub fn channel(&self) -> &ResolvedChannel {
        &self.channel
    }
}

impl Stream for ChannelStream {
    type Item = PageResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

struct PagingState {
    fetcher: Arc<PageFetcher>,
    channel: ResolvedChannel,
    window: DateWindow,
    page_size: u8,
    policy: EarlyExitPolicy,
    cancel: CancellationToken,
    next_cursor: Option<String>,
    finished: bool,
    pages: usize,
    previous_last: Option<u64>,
}

impl PagingState {
    async fn next_page(&mut self) -> Option<PageResult> {
        if self.finished {
            return None;
        }
        if self.cancel.is_cancelled() {
            debug!("Channel {} cancelled after {} pages", self.channel.name, self.pages);
            self.finished = true;
            return None;
        }

        let cursor = self.next_cursor.take();
        let fetched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.fetcher.fetch_page(&self.channel.id, self.window, self.page_size, cursor.as_deref()) => Some(result),
        };

        let result = match fetched {
            Some(result) => result,
            None => {
                debug!("Channel {} cancelled mid-request after {} pages", self.channel.name, self.pages);
                self.finished = true;
                return None;
            }
        };

        let page = match result {
            Ok(page) if page.is_empty() => {
                self.finish("empty page");
                return None;
            }
            Ok(page) => page,
            Err(AggregatorError::Auth(msg)) => {
                error!("Channel {} lost its credential: {}", self.channel.name, msg);
                self.finish("credential failure");
                return None;
            }
            Err(e) => {
                warn!("Page fetch for channel {} failed, keeping {} pages: {}", self.channel.name, self.pages, e);
                self.finish("fetch failure");
                return None;
            }
        };

        self.pages += 1;
        self.check_order(&page);

        match &page.next_cursor {
            Some(cursor) => self.next_cursor = Some(cursor.clone()),
            None => self.finish("no more pages"),
        }

        if !self.finished && self.policy.exhausted_by(&page) {
            debug!(
                "Early exit for channel {}: last clip has {:?} views, threshold {}",
                self.channel.name,
                page.last_view_count(),
                self.policy.min_views
            );
            self.finish("early exit");
        }

        self.previous_last = page.last_view_count();
        Some(page)
    }

    /// The early-exit heuristic relies on the upstream returning clips by
    /// descending views. Stop trusting it for this channel once it doesn't.
    fn check_order(&mut self, page: &PageResult) {
        if !self.policy.guard || !self.policy.enabled {
            return;
        }

        let crosses_previous = match (self.previous_last, page.first_view_count()) {
            (Some(previous), Some(first)) => first > previous,
            _ => false,
        };

        if crosses_previous || !page.is_descending_by_views() {
            warn!(
                "Channel {} returned clips out of view order on page {}; paging to the end",
                self.channel.name, self.pages
            );
            self.policy.enabled = false;
        }
    }

    fn finish(&mut self, reason: &str) {
        self.finished = true;
        info!("Channel {} done after {} pages ({})", self.channel.name, self.pages, reason);
    }
}
