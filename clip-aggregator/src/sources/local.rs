use crate::aggregator::ClipAggregator;
use crate::traits::{ByteStream, ClipFeed};
use crate::types::{Clip, ClipQuery, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Drives the aggregator in the same process, skipping HTTP entirely.
pub struct LocalClipFeed {
    aggregator: Arc<ClipAggregator>,
}

impl LocalClipFeed {
    pub fn new(aggregator: Arc<ClipAggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl ClipFeed for LocalClipFeed {
    fn feed_name(&self) -> String {
        "in-process aggregator".to_string()
    }

    async fn preview(&self, query: &ClipQuery) -> Result<Vec<Clip>> {
        self.aggregator.preview(query).await
    }

    async fn stream(&self, query: &ClipQuery, cancel: CancellationToken) -> Result<ByteStream> {
        let lines = self.aggregator.stream(query, cancel).await?;
        Ok(lines.map(Ok).boxed())
    }
}
