use crate::helix::ClipsRequest;
use crate::token::TokenProvider;
use crate::traits::HelixApi;
use crate::types::{AggregatorError, Clip, DateWindow, PageResult, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Performs one page request against the clip listing.
pub struct PageFetcher {
    api: Arc<dyn HelixApi>,
    tokens: Arc<TokenProvider>,
}

impl PageFetcher {
    pub fn new(api: Arc<dyn HelixApi>, tokens: Arc<TokenProvider>) -> Self {
        Self { api, tokens }
    }

    pub async fn fetch_page(
        &self,
        channel_id: &str,
        window: DateWindow,
        page_size: u8,
        cursor: Option<&str>,
    ) -> Result<PageResult> {
        let start_time = Instant::now();
        let credential = self.tokens.credential().await?;

        let request = ClipsRequest {
            broadcaster_id: channel_id.to_string(),
            started_at: window.started_at,
            ended_at: window.ended_at,
            first: page_size.clamp(1, interfaces::MAX_PAGE_SIZE),
            after: cursor.filter(|c| !c.is_empty()).map(str::to_string),
        };

        let page = match self.api.get_clips(&credential, &request).await {
            Ok(page) => page,
            Err(AggregatorError::Auth(msg)) => {
                self.tokens.invalidate().await;
                return Err(AggregatorError::Auth(msg));
            }
            Err(e) => return Err(e),
        };

        let next_cursor = page.next_cursor();
        let clips: Vec<Clip> = page.data.into_iter().map(Clip::from).collect();

        debug!(
            "Fetched {} clips for channel {} (cursor {:?}) in {}ms",
            clips.len(),
            channel_id,
            cursor,
            start_time.elapsed().as_millis()
        );

        Ok(PageResult { clips, next_cursor })
    }
}
