//! Token Resolver - pick a working token per resource, with a cached binding
//!
//! - Read path: cached binding → if its token is still among the caller's
//!   candidates, return it without any upstream call
//! - Otherwise: probe candidates in the given order, first success wins and
//!   is cached as `token:{kind}:{resource_id}`
//! - A cached token missing from the candidate list means the credential was
//!   revoked or the team changed: the binding is dropped and re-derived
//!
//! Running out of candidates is not an error; it yields `None` and the
//! caller decides how to tell the user.

use crate::probe::{canonical_id, ProbeOutcome, TokenProbe};
use crate::storage::CacheStore;
use crate::types::{CandidateToken, ResourceKind};
use crate::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a resolved token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Cached binding, no upstream call
    Cached,
    /// Found by probing candidates
    Probed,
    /// No candidate worked
    None,
}

/// One probe made while resolving
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeAttempt {
    pub name: String,
    #[serde(flatten)]
    pub outcome: ProbeOutcome,
}

/// Token resolution with the attempts that led to it
#[derive(Clone, Serialize)]
pub struct Resolution {
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Label of the winning candidate
    pub name: Option<String>,
    pub source: ResolutionSource,
    pub attempts: Vec<ProbeAttempt>,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("token", &self.token.as_deref().map(crate::types::redact))
            .field("name", &self.name)
            .field("source", &self.source)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl Resolution {
    fn none(attempts: Vec<ProbeAttempt>) -> Self {
        Self {
            token: None,
            name: None,
            source: ResolutionSource::None,
            attempts,
        }
    }

    /// True when every failed attempt was a 401/403
    ///
    /// Distinguishes "reconnect your account" from an upstream outage.
    pub fn all_rejected_permanently(&self) -> bool {
        !self.attempts.is_empty() && self.attempts.iter().all(|a| a.outcome.is_permanent())
    }
}

/// Cache key of the binding for a resource
///
/// `act_42` and `42` share one binding.
pub fn binding_key(kind: ResourceKind, resource_id: &str) -> String {
    format!("token:{}:{}", kind, canonical_id(kind, resource_id))
}

/// Resolves and caches the token to use for each resource
#[derive(Clone)]
pub struct TokenResolver {
    store: Arc<dyn CacheStore>,
    probe: Arc<dyn TokenProbe>,
    binding_ttl: Duration,
}

impl TokenResolver {
    /// Create a new TokenResolver
    pub fn new(store: Arc<dyn CacheStore>, probe: Arc<dyn TokenProbe>, binding_ttl: Duration) -> Self {
        Self {
            store,
            probe,
            binding_ttl,
        }
    }

    /// Pick a currently valid token for the resource
    ///
    /// Returns `Ok(None)` when the candidate list is empty or every candidate
    /// fails validation. Errors only for an empty resource id.
    pub async fn resolve_token(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        candidates: &[CandidateToken],
    ) -> Result<Option<String>> {
        Ok(self
            .resolve_with_attempts(kind, resource_id, candidates)
            .await?
            .token)
    }

    /// Like [`resolve_token`](Self::resolve_token), reporting every probe made
    pub async fn resolve_with_attempts(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        candidates: &[CandidateToken],
    ) -> Result<Resolution> {
        if canonical_id(kind, resource_id).trim().is_empty() {
            return Err(RelayError::invalid_input("resource id must not be empty"));
        }

        if candidates.is_empty() {
            debug!(kind = %kind, resource = %resource_id, "no candidate tokens");
            return Ok(Resolution::none(Vec::new()));
        }

        let key = binding_key(kind, resource_id);

        // Try the cached binding first
        if let Some(cached) = self.read_binding(&key).await {
            if let Some(candidate) = candidates.iter().find(|c| c.token == cached) {
                debug!(kind = %kind, resource = %resource_id, name = %candidate.name, "token binding hit");
                return Ok(Resolution {
                    token: Some(cached),
                    name: Some(candidate.name.clone()),
                    source: ResolutionSource::Cached,
                    attempts: Vec::new(),
                });
            }

            info!(
                kind = %kind,
                resource = %resource_id,
                "cached token no longer among candidates, dropping binding"
            );
            if let Err(e) = self.store.delete(&key).await {
                warn!(key = %key, error = %e, "Failed to drop stale token binding");
            }
        }

        // Probe in caller order; first success wins
        let mut attempts = Vec::new();
        let mut seen = HashSet::new();
        for candidate in candidates {
            if candidate.token.is_empty() || !seen.insert(candidate.token.as_str()) {
                continue;
            }

            let outcome = self.probe.probe(kind, resource_id, &candidate.token).await;
            let valid = outcome.is_valid();
            attempts.push(ProbeAttempt {
                name: candidate.name.clone(),
                outcome,
            });

            if valid {
                self.write_binding(&key, &candidate.token).await;
                info!(
                    kind = %kind,
                    resource = %resource_id,
                    name = %candidate.name,
                    tried = attempts.len(),
                    "token resolved"
                );
                return Ok(Resolution {
                    token: Some(candidate.token.clone()),
                    name: Some(candidate.name.clone()),
                    source: ResolutionSource::Probed,
                    attempts,
                });
            }
        }

        warn!(
            kind = %kind,
            resource = %resource_id,
            tried = attempts.len(),
            "no candidate token is valid for resource"
        );
        Ok(Resolution::none(attempts))
    }

    /// Drop the cached binding for a resource
    ///
    /// For callers that saw the bound token fail upstream.
    pub async fn forget(&self, kind: ResourceKind, resource_id: &str) {
        let key = binding_key(kind, resource_id);
        match self.store.delete(&key).await {
            Ok(()) => debug!(key = %key, "token binding dropped"),
            Err(e) => warn!(key = %key, error = %e, "Failed to drop token binding"),
        }
    }

    async fn read_binding(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(Some(bytes)) => match String::from_utf8(bytes) {
                Ok(token) if !token.is_empty() => Some(token),
                _ => {
                    warn!(key = %key, "Ignoring malformed token binding");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Token binding read failed, probing");
                None
            }
        }
    }

    async fn write_binding(&self, key: &str, token: &str) {
        if let Err(e) = self.store.set(key, token.as_bytes(), self.binding_ttl).await {
            warn!(key = %key, error = %e, "Failed to cache token binding");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Probe answering from a fixed table and recording every call
    #[derive(Default)]
    struct MockProbe {
        outcomes: HashMap<String, ProbeOutcome>,
        calls: Mutex<Vec<String>>,
    }

    impl MockProbe {
        fn with(outcomes: &[(&str, ProbeOutcome)]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: outcomes
                    .iter()
                    .map(|(t, o)| (t.to_string(), o.clone()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TokenProbe for MockProbe {
        async fn probe(&self, _kind: ResourceKind, _id: &str, token: &str) -> ProbeOutcome {
            self.calls.lock().unwrap().push(token.to_string());
            self.outcomes
                .get(token)
                .cloned()
                .unwrap_or(ProbeOutcome::Rejected { status: 400 })
        }
    }

    fn resolver(probe: Arc<MockProbe>) -> (TokenResolver, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let resolver = TokenResolver::new(
            Arc::clone(&store) as Arc<dyn CacheStore>,
            probe,
            Duration::from_secs(3600),
        );
        (resolver, store)
    }

    fn candidates(tokens: &[&str]) -> Vec<CandidateToken> {
        tokens
            .iter()
            .map(|t| CandidateToken::new(*t, format!("owner-of-{}", t)))
            .collect()
    }

    #[tokio::test]
    async fn test_empty_candidates_short_circuit() {
        let probe = MockProbe::with(&[]);
        let (resolver, store) = resolver(Arc::clone(&probe));

        let token = resolver
            .resolve_token(ResourceKind::AdAccount, "42", &[])
            .await
            .expect("resolve");
        assert!(token.is_none());
        assert!(probe.calls().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_resource_id_rejected() {
        let probe = MockProbe::with(&[]);
        let (resolver, _store) = resolver(probe);
        let err = resolver
            .resolve_token(ResourceKind::Page, "  ", &candidates(&["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_first_success_wins_and_is_cached() {
        let probe = MockProbe::with(&[
            ("A", ProbeOutcome::Rejected { status: 401 }),
            ("B", ProbeOutcome::Valid),
        ]);
        let (resolver, store) = resolver(Arc::clone(&probe));

        let resolution = resolver
            .resolve_with_attempts(ResourceKind::AdAccount, "42", &candidates(&["A", "B"]))
            .await
            .expect("resolve");
        assert_eq!(resolution.token.as_deref(), Some("B"));
        assert_eq!(resolution.name.as_deref(), Some("owner-of-B"));
        assert_eq!(resolution.source, ResolutionSource::Probed);
        assert_eq!(resolution.attempts.len(), 2);
        assert_eq!(probe.calls(), vec!["A", "B"]);

        let bound = store
            .get(&binding_key(ResourceKind::AdAccount, "42"))
            .await
            .unwrap();
        assert_eq!(bound.as_deref(), Some(&b"B"[..]));
    }

    #[tokio::test]
    async fn test_order_decides_between_valid_tokens() {
        let probe = MockProbe::with(&[("A", ProbeOutcome::Valid), ("B", ProbeOutcome::Valid)]);
        let (resolver, _store) = resolver(Arc::clone(&probe));

        let token = resolver
            .resolve_token(ResourceKind::Page, "p1", &candidates(&["B", "A"]))
            .await
            .unwrap();
        assert_eq!(token.as_deref(), Some("B"));
        assert_eq!(probe.calls(), vec!["B"]);
    }

    #[tokio::test]
    async fn test_cached_binding_skips_probes() {
        let probe = MockProbe::with(&[("A", ProbeOutcome::Valid)]);
        let (resolver, _store) = resolver(Arc::clone(&probe));
        let list = candidates(&["A"]);

        resolver
            .resolve_token(ResourceKind::AdAccount, "42", &list)
            .await
            .unwrap();
        let second = resolver
            .resolve_with_attempts(ResourceKind::AdAccount, "42", &list)
            .await
            .unwrap();

        assert_eq!(second.token.as_deref(), Some("A"));
        assert_eq!(second.source, ResolutionSource::Cached);
        assert_eq!(probe.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_binding_dropped_when_token_leaves_candidates() {
        let probe = MockProbe::with(&[("A", ProbeOutcome::Valid), ("C", ProbeOutcome::Valid)]);
        let (resolver, store) = resolver(Arc::clone(&probe));

        resolver
            .resolve_token(ResourceKind::AdAccount, "42", &candidates(&["A"]))
            .await
            .unwrap();

        // A was revoked: it no longer appears among the caller's candidates
        let token = resolver
            .resolve_token(ResourceKind::AdAccount, "42", &candidates(&["C"]))
            .await
            .unwrap();
        assert_eq!(token.as_deref(), Some("C"));
        assert_eq!(probe.calls(), vec!["A", "C"]);

        let bound = store
            .get(&binding_key(ResourceKind::AdAccount, "42"))
            .await
            .unwrap();
        assert_eq!(bound.as_deref(), Some(&b"C"[..]));
    }

    #[tokio::test]
    async fn test_binding_dropped_even_when_nothing_else_works() {
        let probe = MockProbe::with(&[("A", ProbeOutcome::Valid)]);
        let (resolver, store) = resolver(Arc::clone(&probe));
        resolver
            .resolve_token(ResourceKind::Page, "p", &candidates(&["A"]))
            .await
            .unwrap();

        let token = resolver
            .resolve_token(ResourceKind::Page, "p", &candidates(&["X"]))
            .await
            .unwrap();
        assert!(token.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_all_candidates_fail() {
        let probe = MockProbe::with(&[
            ("A", ProbeOutcome::Rejected { status: 401 }),
            (
                "B",
                ProbeOutcome::Unreachable {
                    reason: "timeout".into(),
                },
            ),
        ]);
        let (resolver, store) = resolver(Arc::clone(&probe));

        let resolution = resolver
            .resolve_with_attempts(ResourceKind::AdAccount, "42", &candidates(&["A", "B"]))
            .await
            .expect("no valid token is not an error");
        assert!(resolution.token.is_none());
        assert_eq!(resolution.source, ResolutionSource::None);
        assert_eq!(resolution.attempts.len(), 2);
        assert!(!resolution.all_rejected_permanently());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_tokens_probed_once() {
        let probe = MockProbe::with(&[("B", ProbeOutcome::Valid)]);
        let (resolver, _store) = resolver(Arc::clone(&probe));
        let list = vec![
            CandidateToken::new("A", "user"),
            CandidateToken::new("A", "team owner"),
            CandidateToken::new("", "empty session"),
            CandidateToken::new("B", "member"),
        ];

        let token = resolver
            .resolve_token(ResourceKind::AdAccount, "42", &list)
            .await
            .unwrap();
        assert_eq!(token.as_deref(), Some("B"));
        assert_eq!(probe.calls(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_kinds_have_separate_bindings() {
        let probe = MockProbe::with(&[("A", ProbeOutcome::Valid)]);
        let (resolver, _store) = resolver(Arc::clone(&probe));
        let list = candidates(&["A"]);

        resolver
            .resolve_token(ResourceKind::AdAccount, "1", &list)
            .await
            .unwrap();
        resolver
            .resolve_token(ResourceKind::Page, "1", &list)
            .await
            .unwrap();
        assert_eq!(probe.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_prefixed_ad_account_id_shares_binding() {
        let probe = MockProbe::with(&[("A", ProbeOutcome::Valid)]);
        let (resolver, store) = resolver(Arc::clone(&probe));
        let list = candidates(&["A"]);

        resolver
            .resolve_token(ResourceKind::AdAccount, "act_42", &list)
            .await
            .unwrap();
        let second = resolver
            .resolve_with_attempts(ResourceKind::AdAccount, "42", &list)
            .await
            .unwrap();

        assert_eq!(second.source, ResolutionSource::Cached);
        assert_eq!(probe.calls().len(), 1);
        assert_eq!(store.keys().await, vec!["token:ad-account:42".to_string()]);

        resolver.forget(ResourceKind::AdAccount, "act_42").await;
        assert!(store.is_empty().await);

        let err = resolver
            .resolve_token(ResourceKind::AdAccount, "act_", &list)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_forget_forces_reprobe() {
        let probe = MockProbe::with(&[("A", ProbeOutcome::Valid)]);
        let (resolver, _store) = resolver(Arc::clone(&probe));
        let list = candidates(&["A"]);

        resolver
            .resolve_token(ResourceKind::Page, "p", &list)
            .await
            .unwrap();
        resolver.forget(ResourceKind::Page, "p").await;
        resolver
            .resolve_token(ResourceKind::Page, "p", &list)
            .await
            .unwrap();
        assert_eq!(probe.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_binding_expires_after_ttl() {
        let probe = MockProbe::with(&[("A", ProbeOutcome::Valid)]);
        let (resolver, _store) = resolver(Arc::clone(&probe));
        let list = candidates(&["A"]);

        resolver
            .resolve_token(ResourceKind::AdAccount, "42", &list)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(3601)).await;
        resolver
            .resolve_token(ResourceKind::AdAccount, "42", &list)
            .await
            .unwrap();
        assert_eq!(probe.calls().len(), 2);
    }

    #[test]
    fn test_resolution_serialization_hides_token() {
        let resolution = Resolution {
            token: Some("EAAsecret".into()),
            name: Some("Owner".into()),
            source: ResolutionSource::Probed,
            attempts: vec![ProbeAttempt {
                name: "Owner".into(),
                outcome: ProbeOutcome::Valid,
            }],
        };
        let json = serde_json::to_string(&resolution).unwrap();
        assert!(!json.contains("EAAsecret"));
        assert!(json.contains("\"source\":\"probed\""));
        assert!(json.contains("\"outcome\":\"valid\""));
    }
}
