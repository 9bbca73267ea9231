//! Wiring of the cache layer from configuration
//!
//! Request handlers hold one [`RelayService`] and go through it for
//! candidate assembly, token resolution and cached upstream reads.

use crate::candidates::CandidateTokenProvider;
use crate::config::RelayConfig;
use crate::graph::{graph_key, user_pattern, GraphClient};
use crate::probe::{canonical_id, GraphProbe, TokenProbe};
use crate::storage::{create_store, CacheStore};
use crate::swr::SwrCache;
use crate::token_resolver::{Resolution, TokenResolver};
use crate::types::{ResourceKind, SwrResponse};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

pub struct RelayService {
    config: RelayConfig,
    store: Arc<dyn CacheStore>,
    swr: SwrCache,
    resolver: TokenResolver,
    provider: CandidateTokenProvider,
    graph: GraphClient,
}

/// Outcome of a cached upstream read on behalf of a user
#[derive(Debug)]
pub enum Fetched<T> {
    /// No candidate token grants access to the resource
    NotConnected(Resolution),
    Data(SwrResponse<T>),
}

impl RelayService {
    /// Build every component from configuration, connecting to the cache backend
    pub async fn connect(config: RelayConfig, provider: CandidateTokenProvider) -> Result<Self> {
        config.validate()?;
        let store = create_store(&config.cache).await;
        let probe = Arc::new(GraphProbe::new(&config.graph_base_url, config.probe_timeout())?);
        Self::from_parts(config, store, probe, provider)
    }

    /// Build from an explicit store and probe
    pub fn from_parts(
        config: RelayConfig,
        store: Arc<dyn CacheStore>,
        probe: Arc<dyn TokenProbe>,
        provider: CandidateTokenProvider,
    ) -> Result<Self> {
        let swr = SwrCache::new(Arc::clone(&store)).with_fetch_timeout(config.probe_timeout());
        let resolver = TokenResolver::new(Arc::clone(&store), probe, config.token_ttl());
        let graph = GraphClient::new(&config.graph_base_url, config.probe_timeout())?;

        Ok(Self {
            config,
            store,
            swr,
            resolver,
            provider,
            graph,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn cache_mode(&self) -> &'static str {
        self.store.mode()
    }

    pub fn swr(&self) -> &SwrCache {
        &self.swr
    }

    pub fn resolver(&self) -> &TokenResolver {
        &self.resolver
    }

    /// Resolve a token for a user using every credential they can reach
    pub async fn resolve_for_user(
        &self,
        user_id: &str,
        kind: ResourceKind,
        resource_id: &str,
        session_token: Option<&str>,
    ) -> Result<Resolution> {
        let candidates = self.provider.candidates_for(user_id, session_token).await;
        self.resolver
            .resolve_with_attempts(kind, resource_id, &candidates)
            .await
    }

    /// Campaigns of an ad account, served through the SWR cache
    ///
    /// When upstream refuses the resolved token (401/403) the binding is
    /// dropped, so the next call probes the candidates again. This applies
    /// to background refreshes too.
    pub async fn campaigns(
        &self,
        user_id: &str,
        ad_account_id: &str,
        session_token: Option<&str>,
    ) -> Result<Fetched<Value>> {
        let resolution = self
            .resolve_for_user(user_id, ResourceKind::AdAccount, ad_account_id, session_token)
            .await?;
        let Some(token) = resolution.token.clone() else {
            return Ok(Fetched::NotConnected(resolution));
        };

        let account = canonical_id(ResourceKind::AdAccount, ad_account_id).to_string();
        let key = graph_key("campaigns", user_id, &account);
        let graph = self.graph.clone();
        let resolver = self.resolver.clone();
        let response = self
            .swr
            .get_with_swr(
                &key,
                self.config.fresh_ttl_secs,
                self.config.stale_ttl_secs,
                move || async move {
                    let result = graph.campaigns(&account, &token).await;
                    if let Err(ref e) = result {
                        if e.is_token_rejected() {
                            warn!(account = %account, "Bound token rejected upstream, dropping binding");
                            resolver.forget(ResourceKind::AdAccount, &account).await;
                        }
                    }
                    result
                },
            )
            .await?;

        Ok(Fetched::Data(response))
    }

    /// Drop every cached upstream response of a user
    pub async fn invalidate_user(&self, user_id: &str) -> usize {
        self.swr.invalidate(&user_pattern(user_id)).await
    }

    /// Wait for in-flight background refreshes before exit
    pub async fn shutdown(&self) {
        self.swr.shutdown().await;
    }
}
