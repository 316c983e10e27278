use crate::clock::Clock;
use crate::traits::HelixApi;
use crate::types::{AggregatorError, Credential, Result, TokenState};
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Obtains and caches the app access token.
///
/// Refreshes lazily when the cached token is past its (early) expiry. Two
/// callers racing a refresh may both hit the token endpoint; the later write
/// simply wins.
pub struct TokenProvider {
    api: Arc<dyn HelixApi>,
    clock: Arc<dyn Clock>,
    state: RwLock<TokenState>,
    refresh_margin: Duration,
}

impl TokenProvider {
    pub fn new(api: Arc<dyn HelixApi>, clock: Arc<dyn Clock>, refresh_margin_seconds: i64) -> Self {
        Self {
            api,
            clock,
            state: RwLock::new(TokenState::default()),
            refresh_margin: Duration::seconds(refresh_margin_seconds),
        }
    }

    pub async fn credential(&self) -> Result<Credential> {
        {
            let state = self.state.read().await;
            if let Some(token) = &state.access_token {
                if self.clock.now() <= state.expires_at {
                    return Ok(self.credential_for(token));
                }
                debug!("Access token expired at {}, refreshing", state.expires_at);
            }
        }

        self.refresh().await
    }

    async fn refresh(&self) -> Result<Credential> {
        match self.api.request_token().await {
            Ok(grant) => {
                let expires_at = self.clock.now() + Duration::seconds(grant.expires_in) - self.refresh_margin;
                let mut state = self.state.write().await;
                state.access_token = Some(grant.access_token.clone());
                state.expires_at = expires_at;
                info!("Obtained access token, valid until {}", expires_at);
                Ok(self.credential_for(&grant.access_token))
            }
            Err(e) => {
                self.invalidate().await;
                error!("Token refresh failed: {}", e);
                Err(match e {
                    AggregatorError::Auth(msg) => AggregatorError::Auth(msg),
                    other => AggregatorError::Auth(other.to_string()),
                })
            }
        }
    }

    /// Drop the cached token so the next call refreshes. Used after the
    /// upstream rejects a token it previously issued.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        state.access_token = None;
    }

    pub async fn snapshot(&self) -> TokenState {
        self.state.read().await.clone()
    }

    fn credential_for(&self, token: &str) -> Credential {
        Credential {
            token: token.to_string(),
            client_id: self.api.client_id().to_string(),
        }
    }
}
