use crate::decoder::decode_batches;
use crate::traits::ClipFeed;
use crate::types::{AggregatorError, Clip, ClipQuery, Result, SortMode, StreamConfig};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Idle,
    Loading { preview: bool, stream: bool },
    Done,
    Failed,
    Cancelled,
}

/// What a consumer renders: the current clip list plus loading/error flags.
#[derive(Debug, Clone)]
pub struct ClipView {
    pub query_id: u64,
    pub clips: Vec<Clip>,
    pub loading: bool,
    pub error: Option<String>,
    pub phase: QueryPhase,
}

impl Default for ClipView {
    fn default() -> Self {
        Self {
            query_id: 0,
            clips: Vec::new(),
            loading: false,
            error: None,
            phase: QueryPhase::Idle,
        }
    }
}

impl ClipView {
    fn loading(query_id: u64) -> Self {
        Self {
            query_id,
            loading: true,
            phase: QueryPhase::Loading {
                preview: true,
                stream: true,
            },
            ..Self::default()
        }
    }
}

/// Clips merged by id. The latest copy of a clip wins, but it keeps the
/// position where its id first arrived.
#[derive(Debug, Default)]
pub struct ClipSet {
    entries: HashMap<String, (u64, Clip)>,
    next_seq: u64,
}

impl ClipSet {
    pub fn merge(&mut self, clips: impl IntoIterator<Item = Clip>) {
        for clip in clips {
            match self.entries.get_mut(&clip.id) {
                Some(entry) => entry.1 = clip,
                None => {
                    self.entries.insert(clip.id.clone(), (self.next_seq, clip));
                    self.next_seq += 1;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Filter to `min_views` and sort. Sorting is stable over arrival order,
    /// so equal view counts keep the order they came in.
    pub fn materialize(&self, min_views: u64, sort: SortMode) -> Vec<Clip> {
        let mut ordered: Vec<&(u64, Clip)> = self
            .entries
            .values()
            .filter(|(_, clip)| clip.view_count >= min_views)
            .collect();
        ordered.sort_by_key(|(seq, _)| *seq);

        match sort {
            SortMode::Views => ordered.sort_by(|a, b| b.1.view_count.cmp(&a.1.view_count)),
            SortMode::Newest => ordered.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at)),
            SortMode::Oldest => ordered.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at)),
        }

        ordered.into_iter().map(|(_, clip)| clip.clone()).collect()
    }
}

/// Keeps a continuously updated [`ClipView`] for the latest query.
///
/// Every query runs a preview and the full stream side by side and merges
/// both into one deduplicated set. Starting a new query cancels the previous
/// one; its late updates are discarded by query id.
pub struct Reconciler {
    feed: Arc<dyn ClipFeed>,
    view: Arc<watch::Sender<ClipView>>,
    active: Mutex<Option<CancellationToken>>,
    next_query_id: AtomicU64,
    max_line_bytes: usize,
}

impl Reconciler {
    pub fn new(feed: Arc<dyn ClipFeed>) -> Self {
        let (view, _) = watch::channel(ClipView::default());
        Self {
            feed,
            view: Arc::new(view),
            active: Mutex::new(None),
            next_query_id: AtomicU64::new(0),
            max_line_bytes: StreamConfig::default().max_line_bytes,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ClipView> {
        self.view.subscribe()
    }

    pub fn current(&self) -> ClipView {
        self.view.borrow().clone()
    }

    /// Start a fresh query, cancelling whatever was running. Returns its id.
    pub async fn watch(&self, query: ClipQuery, sort: SortMode) -> u64 {
        let query_id = self.next_query_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();

        {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.replace(cancel.clone()) {
                debug!("Query {} supersedes the running query", query_id);
                previous.cancel();
            }
            self.view.send_replace(ClipView::loading(query_id));
        }

        info!(
            "Query {}: {} channels from {} to {} via {}",
            query_id,
            query.channels.len(),
            query.from,
            query.to,
            self.feed.feed_name()
        );

        tokio::spawn(run_query(QueryRun {
            feed: self.feed.clone(),
            query,
            sort,
            query_id,
            cancel,
            view: self.view.clone(),
            max_line_bytes: self.max_line_bytes,
        }));

        query_id
    }

    /// Cancel the running query. Loading stops, the error slot is left alone.
    pub async fn cancel(&self) {
        let mut active = self.active.lock().await;
        if let Some(token) = active.take() {
            token.cancel();
        }
        self.view.send_if_modified(|view| {
            if !view.loading {
                return false;
            }
            view.loading = false;
            view.phase = QueryPhase::Cancelled;
            true
        });
    }

    /// Wait until the current query stops loading and return the final view.
    pub async fn settled(&self) -> Result<ClipView> {
        let mut rx = self.subscribe();
        let view = rx
            .wait_for(|view| !view.loading)
            .await
            .map_err(|e| AggregatorError::General(format!("view channel closed: {}", e)))?;
        Ok(view.clone())
    }
}

struct QueryRun {
    feed: Arc<dyn ClipFeed>,
    query: ClipQuery,
    sort: SortMode,
    query_id: u64,
    cancel: CancellationToken,
    view: Arc<watch::Sender<ClipView>>,
    max_line_bytes: usize,
}

impl QueryRun {
    /// Apply `update` only while this query is still the one on display.
    fn publish(&self, update: impl FnOnce(&mut ClipView)) {
        self.view.send_if_modified(|view| {
            if view.query_id != self.query_id {
                return false;
            }
            update(view);
            true
        });
    }

    fn cancelled(&self) {
        debug!("Query {} cancelled", self.query_id);
        self.publish(|view| {
            view.loading = false;
            view.phase = QueryPhase::Cancelled;
        });
    }

    fn fail(&self, err: AggregatorError) {
        error!("Query {} failed: {}", self.query_id, err);
        self.publish(|view| {
            view.loading = false;
            view.error = Some(err.to_string());
            view.phase = QueryPhase::Failed;
        });
    }
}

fn open_stream(run: &QueryRun) -> BoxStream<'static, Result<Vec<Clip>>> {
    let feed = run.feed.clone();
    let query = run.query.clone();
    let cancel = run.cancel.clone();
    let max_line_bytes = run.max_line_bytes;

    stream::once(async move { feed.stream(&query, cancel).await })
        .flat_map(move |opened| match opened {
            Ok(bytes) => decode_batches(bytes, max_line_bytes),
            Err(e) => stream::iter([Err(e)]).boxed(),
        })
        .boxed()
}

async fn run_query(run: QueryRun) {
    let mut set = ClipSet::default();
    let mut batches = open_stream(&run);
    let preview = run.feed.preview(&run.query);
    tokio::pin!(preview);

    let mut preview_pending = true;
    let mut stream_pending = true;

    while preview_pending || stream_pending {
        tokio::select! {
            biased;
            _ = run.cancel.cancelled() => {
                run.cancelled();
                return;
            }
            result = &mut preview, if preview_pending => {
                preview_pending = false;
                match result {
                    Ok(clips) => {
                        debug!("Query {}: preview returned {} clips", run.query_id, clips.len());
                        set.merge(clips);
                    }
                    Err(e) if e.is_fatal() => {
                        run.fail(e);
                        return;
                    }
                    Err(e) => warn!("Query {}: preview failed: {}", run.query_id, e),
                }
            }
            next = batches.next(), if stream_pending => match next {
                Some(Ok(batch)) => set.merge(batch),
                Some(Err(AggregatorError::Cancelled)) => {
                    run.cancelled();
                    return;
                }
                Some(Err(e)) if e.is_fatal() => {
                    run.fail(e);
                    return;
                }
                Some(Err(e)) => {
                    warn!("Query {}: stream ended early: {}", run.query_id, e);
                    stream_pending = false;
                }
                None => stream_pending = false,
            },
        }

        let clips = set.materialize(run.query.min_views, run.sort);
        let loading = preview_pending || stream_pending;
        run.publish(|view| {
            view.clips = clips;
            view.loading = loading;
            view.phase = if loading {
                QueryPhase::Loading {
                    preview: preview_pending,
                    stream: stream_pending,
                }
            } else {
                QueryPhase::Done
            };
        });
    }

    info!("Query {} done with {} distinct clips", run.query_id, set.len());
}
