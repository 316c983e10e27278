use crate::clock::Clock;
use crate::helix::{HelixUser, UserLookup};
use crate::token::TokenProvider;
use crate::traits::HelixApi;
use crate::types::{AggregatorError, IdentityCacheEntry, ResolvedChannel, Result};
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Maps channel names to numeric ids and back, with a lazily refreshed TTL cache.
///
/// The cache is keyed by id. Expired entries are treated as absent and
/// overwritten on the next successful lookup; nothing sweeps them.
pub struct IdentityResolver {
    api: Arc<dyn HelixApi>,
    tokens: Arc<TokenProvider>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache: RwLock<HashMap<String, IdentityCacheEntry>>,
}

impl IdentityResolver {
    pub fn new(api: Arc<dyn HelixApi>, tokens: Arc<TokenProvider>, clock: Arc<dyn Clock>, ttl_hours: i64) -> Self {
        Self {
            api,
            tokens,
            clock,
            ttl: Duration::hours(ttl_hours),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Channel id for `name`, or `None` when the upstream has no such channel.
    pub async fn resolve_id(&self, name: &str) -> Result<Option<String>> {
        let name = name.to_ascii_lowercase();
        let now = self.clock.now();

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache
                .values()
                .find(|entry| entry.channel_name == name && now <= entry.expires_at)
            {
                debug!("Identity cache hit for {}", name);
                return Ok(Some(entry.channel_id.clone()));
            }
        }

        debug!("Identity cache miss for {}", name);
        match self.lookup(UserLookup::Login(name.clone())).await? {
            Some(user) => Ok(Some(self.store(user).await.channel_id)),
            None => {
                self.forget_name(&name).await;
                info!("Channel {} does not exist upstream", name);
                Ok(None)
            }
        }
    }

    /// Login name for a channel id, or `None` when the id is unknown.
    pub async fn resolve_name(&self, id: &str) -> Result<Option<String>> {
        let now = self.clock.now();

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(id).filter(|entry| now <= entry.expires_at) {
                debug!("Identity cache hit for id {}", id);
                return Ok(Some(entry.channel_name.clone()));
            }
        }

        match self.lookup(UserLookup::Id(id.to_string())).await? {
            Some(user) => Ok(Some(self.store(user).await.channel_name)),
            None => {
                self.cache.write().await.remove(id);
                info!("Channel id {} does not exist upstream", id);
                Ok(None)
            }
        }
    }

    /// `resolve_id` that reports a missing channel as an error.
    pub async fn require(&self, name: &str) -> Result<ResolvedChannel> {
        match self.resolve_id(name).await? {
            Some(id) => Ok(ResolvedChannel {
                id,
                name: name.to_ascii_lowercase(),
            }),
            None => Err(AggregatorError::NotFound { name: name.to_string() }),
        }
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.read().await.len()
    }

    async fn lookup(&self, lookup: UserLookup) -> Result<Option<HelixUser>> {
        let credential = self.tokens.credential().await?;
        match self.api.get_users(&credential, &lookup).await {
            Ok(users) => Ok(users.into_iter().next()),
            Err(AggregatorError::Auth(msg)) => {
                self.tokens.invalidate().await;
                Err(AggregatorError::Auth(msg))
            }
            Err(e) => Err(e),
        }
    }

    async fn store(&self, user: HelixUser) -> IdentityCacheEntry {
        let entry = IdentityCacheEntry {
            channel_id: user.id,
            channel_name: user.login.to_ascii_lowercase(),
            display_name: user.display_name,
            expires_at: self.clock.now() + self.ttl,
        };
        let mut cache = self.cache.write().await;
        // A login can move to a new id; drop whatever the old mapping was.
        cache.retain(|id, existing| existing.channel_name != entry.channel_name || *id == entry.channel_id);
        cache.insert(entry.channel_id.clone(), entry.clone());
        entry
    }

    async fn forget_name(&self, name: &str) {
        let mut cache = self.cache.write().await;
        cache.retain(|_, entry| entry.channel_name != name);
    }
}
