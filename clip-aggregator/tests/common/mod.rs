#![allow(dead_code)]

// Shared fixtures: an in-memory upstream and a scripted consumer feed.
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use clip_aggregator::helix::{ClipsRequest, HelixClip, HelixPage, HelixUser, Pagination, TokenGrant, UserLookup};
use clip_aggregator::{
    AggregatorError, ByteStream, Clip, ClipAggregator, ClipFeed, ClipQuery, Credential, HelixApi, IdentityResolver,
    ManualClock, PageFetcher, Result, StreamConfig, TokenProvider,
};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio_util::sync::CancellationToken;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn created(minutes: i64) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn clip(id: &str, channel_id: &str, views: u64) -> Clip {
    clip_at(id, channel_id, views, 0)
}

pub fn clip_at(id: &str, channel_id: &str, views: u64, minutes: i64) -> Clip {
    Clip {
        id: id.to_string(),
        channel_id: channel_id.to_string(),
        channel_name: format!("channel_{}", channel_id),
        creator_name: "clipper".to_string(),
        title: format!("Clip {}", id),
        url: format!("https://clips.example/{}", id),
        embed_url: format!("https://clips.example/embed?clip={}", id),
        thumbnail_url: format!("https://clips.example/{}.jpg", id),
        created_at: created(minutes),
        duration: 30.0,
        view_count: views,
        video_id: String::new(),
        vod_offset: None,
        category_id: "509658".to_string(),
    }
}

fn to_helix(clip: &Clip) -> HelixClip {
    HelixClip {
        id: clip.id.clone(),
        url: clip.url.clone(),
        embed_url: clip.embed_url.clone(),
        broadcaster_id: clip.channel_id.clone(),
        broadcaster_name: clip.channel_name.clone(),
        creator_id: "42".to_string(),
        creator_name: clip.creator_name.clone(),
        video_id: clip.video_id.clone(),
        game_id: clip.category_id.clone(),
        language: "en".to_string(),
        title: clip.title.clone(),
        view_count: clip.view_count,
        created_at: clip.created_at,
        thumbnail_url: clip.thumbnail_url.clone(),
        duration: clip.duration,
        vod_offset: clip.vod_offset,
    }
}

/// Clips for one page with the given view counts, ids `<prefix>-<n>`.
pub fn page(prefix: &str, channel_id: &str, views: &[u64]) -> Vec<Clip> {
    views
        .iter()
        .enumerate()
        .map(|(i, v)| clip_at(&format!("{}-{}", prefix, i), channel_id, *v, i as i64))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipCall {
    pub broadcaster_id: String,
    pub started_at: chrono::DateTime<Utc>,
    pub ended_at: chrono::DateTime<Utc>,
    pub after: Option<String>,
    pub first: u8,
}

/// In-memory upstream. Pages are chained with cursors `<channel_id>:<index>`.
#[derive(Default)]
pub struct FixtureApi {
    users: Mutex<Vec<HelixUser>>,
    pages: Mutex<HashMap<String, Vec<Vec<Clip>>>>,
    failing_pages: Mutex<HashSet<(String, usize)>>,
    held_pages: Mutex<HashSet<(String, usize)>>,
    fail_tokens: AtomicBool,
    pub token_ttl_seconds: i64,
    pub token_calls: AtomicUsize,
    pub user_calls: AtomicUsize,
    pub clip_calls: Mutex<Vec<ClipCall>>,
}

impl FixtureApi {
    pub fn new() -> Self {
        Self {
            token_ttl_seconds: 4 * 3600,
            ..Self::default()
        }
    }

    pub fn with_channel(self, login: &str, id: &str, pages: Vec<Vec<Clip>>) -> Self {
        self.add_user(login, id);
        self.pages.lock().unwrap().insert(id.to_string(), pages);
        self
    }

    pub fn add_user(&self, login: &str, id: &str) {
        self.users.lock().unwrap().push(HelixUser {
            id: id.to_string(),
            login: login.to_string(),
            display_name: login.to_uppercase(),
        });
    }

    pub fn fail_page(&self, channel_id: &str, index: usize) {
        self.failing_pages.lock().unwrap().insert((channel_id.to_string(), index));
    }

    /// Requests for this page never complete.
    pub fn hold_page(&self, channel_id: &str, index: usize) {
        self.held_pages.lock().unwrap().insert((channel_id.to_string(), index));
    }

    pub fn set_token_failure(&self, fail: bool) {
        self.fail_tokens.store(fail, Ordering::SeqCst);
    }

    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }

    pub fn user_calls(&self) -> usize {
        self.user_calls.load(Ordering::SeqCst)
    }

    pub fn clip_calls(&self) -> Vec<ClipCall> {
        self.clip_calls.lock().unwrap().clone()
    }

    pub fn clip_calls_for(&self, channel_id: &str) -> usize {
        self.clip_calls().iter().filter(|call| call.broadcaster_id == channel_id).count()
    }
}

#[async_trait]
impl HelixApi for FixtureApi {
    fn client_id(&self) -> &str {
        "fixture-client"
    }

    async fn request_token(&self) -> Result<TokenGrant> {
        let n = self.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_tokens.load(Ordering::SeqCst) {
            return Err(AggregatorError::Upstream {
                status: Some(403),
                message: "invalid client secret".to_string(),
            });
        }
        Ok(TokenGrant {
            access_token: format!("token-{}", n),
            expires_in: self.token_ttl_seconds,
            token_type: Some("bearer".to_string()),
        })
    }

    async fn get_users(&self, _credential: &Credential, lookup: &UserLookup) -> Result<Vec<HelixUser>> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        let users = self.users.lock().unwrap();
        Ok(users
            .iter()
            .filter(|user| match lookup {
                UserLookup::Login(login) => user.login.eq_ignore_ascii_case(login),
                UserLookup::Id(id) => &user.id == id,
            })
            .cloned()
            .collect())
    }

    async fn get_clips(&self, _credential: &Credential, request: &ClipsRequest) -> Result<HelixPage<HelixClip>> {
        self.clip_calls.lock().unwrap().push(ClipCall {
            broadcaster_id: request.broadcaster_id.clone(),
            started_at: request.started_at,
            ended_at: request.ended_at,
            after: request.after.clone(),
            first: request.first,
        });

        let index = request
            .after
            .as_deref()
            .and_then(|cursor| cursor.rsplit(':').next())
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);
        let key = (request.broadcaster_id.clone(), index);

        let held = self.held_pages.lock().unwrap().contains(&key);
        if held {
            std::future::pending::<()>().await;
        }
        if self.failing_pages.lock().unwrap().contains(&key) {
            return Err(AggregatorError::Upstream {
                status: Some(500),
                message: "fixture failure".to_string(),
            });
        }

        let pages = self.pages.lock().unwrap();
        let channel_pages = pages.get(&request.broadcaster_id).cloned().unwrap_or_default();
        let data = channel_pages
            .get(index)
            .map(|clips| clips.iter().take(request.first as usize).map(to_helix).collect())
            .unwrap_or_default();
        let cursor = (index + 1 < channel_pages.len()).then(|| format!("{}:{}", request.broadcaster_id, index + 1));

        Ok(HelixPage {
            data,
            pagination: Pagination { cursor },
        })
    }
}

/// Everything wired around one fixture and a manual clock.
pub struct Stack {
    pub api: Arc<FixtureApi>,
    pub clock: Arc<ManualClock>,
    pub tokens: Arc<TokenProvider>,
    pub identity: Arc<IdentityResolver>,
    pub fetcher: Arc<PageFetcher>,
    pub aggregator: Arc<ClipAggregator>,
}

pub fn stack(api: FixtureApi) -> Stack {
    stack_with_config(api, StreamConfig::default())
}

pub fn stack_with_config(api: FixtureApi, config: StreamConfig) -> Stack {
    let api = Arc::new(api);
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
    let tokens = Arc::new(TokenProvider::new(api.clone(), clock.clone(), config.token_refresh_margin_seconds));
    let identity = Arc::new(IdentityResolver::new(
        api.clone(),
        tokens.clone(),
        clock.clone(),
        config.identity_ttl_hours,
    ));
    let fetcher = Arc::new(PageFetcher::new(api.clone(), tokens.clone()));
    let aggregator = Arc::new(ClipAggregator::new(identity.clone(), fetcher.clone(), config));
    Stack {
        api,
        clock,
        tokens,
        identity,
        fetcher,
        aggregator,
    }
}

pub fn query(channels: &[&str], min_views: u64) -> ClipQuery {
    ClipQuery::new(
        channels.iter().map(|c| c.to_string()).collect(),
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        min_views,
    )
    .unwrap()
}

pub fn parse_lines(lines: &[Bytes]) -> Vec<Vec<Clip>> {
    lines
        .iter()
        .map(|line| {
            assert_eq!(line.last(), Some(&b'\n'), "every line must be newline-terminated");
            serde_json::from_slice::<Vec<Clip>>(line).unwrap()
        })
        .collect()
}

pub fn ndjson(batches: &[Vec<Clip>]) -> Vec<u8> {
    let mut out = Vec::new();
    for batch in batches {
        out.extend(serde_json::to_vec(batch).unwrap());
        out.push(b'\n');
    }
    out
}

pub fn ids(clips: &[Clip]) -> Vec<String> {
    clips.iter().map(|clip| clip.id.clone()).collect()
}

/// Consumer feed with canned answers.
#[derive(Default)]
pub struct ScriptedFeed {
    pub preview: Vec<Clip>,
    pub preview_error: Mutex<Option<AggregatorError>>,
    pub preview_delay_ms: u64,
    pub chunks: Vec<Vec<u8>>,
    pub stream_error: Mutex<Option<AggregatorError>>,
    /// Keep the stream open after the last chunk.
    pub hold_open: bool,
    /// Token handed to the most recent `stream` call.
    pub stream_token: Mutex<Option<CancellationToken>>,
}

#[async_trait]
impl ClipFeed for ScriptedFeed {
    fn feed_name(&self) -> String {
        "scripted".to_string()
    }

    async fn preview(&self, _query: &ClipQuery) -> Result<Vec<Clip>> {
        if self.preview_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.preview_delay_ms)).await;
        }
        if let Some(err) = self.preview_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.preview.clone())
    }

    async fn stream(&self, _query: &ClipQuery, cancel: CancellationToken) -> Result<ByteStream> {
        *self.stream_token.lock().unwrap() = Some(cancel);
        if let Some(err) = self.stream_error.lock().unwrap().take() {
            return Err(err);
        }
        let chunks: Vec<Result<Bytes>> = self.chunks.iter().map(|c| Ok(Bytes::from(c.clone()))).collect();
        let body = stream::iter(chunks);
        if self.hold_open {
            Ok(body.chain(stream::pending()).boxed())
        } else {
            Ok(body.boxed())
        }
    }
}
