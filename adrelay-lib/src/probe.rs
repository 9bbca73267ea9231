//! Token validation probes
//!
//! A probe issues the cheapest possible metadata read on a resource with a
//! candidate token. Only the status code matters; the body is ignored.

use crate::types::{redact, ResourceKind};
use crate::{RelayError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result of probing one token against one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// 2xx response
    Valid,
    /// Non-2xx response
    Rejected { status: u16 },
    /// Network error or timeout
    Unreachable { reason: String },
}

impl ProbeOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ProbeOutcome::Valid)
    }

    /// 401/403: the token itself is bad, retrying it later will not help
    ///
    /// Everything else that isn't `Valid` (5xx, rate limits, timeouts)
    /// may succeed on a later attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProbeOutcome::Rejected { status: 401 | 403 })
    }
}

/// Validation probe against the upstream API
#[async_trait]
pub trait TokenProbe: Send + Sync {
    async fn probe(&self, kind: ResourceKind, resource_id: &str, token: &str) -> ProbeOutcome;
}

/// Resource id without its Graph API prefix
///
/// `act_42` and `42` name the same ad account; cache keys use the bare id.
pub fn canonical_id(kind: ResourceKind, resource_id: &str) -> &str {
    match kind {
        ResourceKind::AdAccount => resource_id.strip_prefix("act_").unwrap_or(resource_id),
        ResourceKind::Page => resource_id,
    }
}

/// Graph API object path for a resource
///
/// Ad accounts are addressed as `act_<id>` whether or not the caller
/// included the prefix.
pub fn resource_path(kind: ResourceKind, resource_id: &str) -> String {
    match kind {
        ResourceKind::AdAccount => format!("act_{}", canonical_id(kind, resource_id)),
        ResourceKind::Page => resource_id.to_string(),
    }
}

/// Probe that reads `?fields=id` on the Graph API object
pub struct GraphProbe {
    client: reqwest::Client,
    base_url: String,
}

impl GraphProbe {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, kind: ResourceKind, resource_id: &str) -> String {
        format!("{}/{}", self.base_url, resource_path(kind, resource_id))
    }
}

#[async_trait]
impl TokenProbe for GraphProbe {
    async fn probe(&self, kind: ResourceKind, resource_id: &str, token: &str) -> ProbeOutcome {
        let response = self
            .client
            .get(self.url(kind, resource_id))
            .query(&[("fields", "id"), ("access_token", token)])
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Valid,
            Ok(resp) => {
                let status = resp.status().as_u16();
                tracing::debug!(
                    kind = %kind,
                    resource = %resource_id,
                    token = %redact(token),
                    status,
                    "probe rejected"
                );
                ProbeOutcome::Rejected { status }
            }
            Err(e) => {
                // reqwest errors embed the URL, which carries the token
                let reason = if e.is_timeout() {
                    "timeout".to_string()
                } else if e.is_connect() {
                    "connection failed".to_string()
                } else {
                    "request failed".to_string()
                };
                tracing::debug!(
                    kind = %kind,
                    resource = %resource_id,
                    token = %redact(token),
                    reason = %reason,
                    "probe unreachable"
                );
                ProbeOutcome::Unreachable { reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_resource_path() {
        assert_eq!(resource_path(ResourceKind::AdAccount, "123"), "act_123");
        assert_eq!(resource_path(ResourceKind::AdAccount, "act_123"), "act_123");
        assert_eq!(resource_path(ResourceKind::Page, "987"), "987");
    }

    #[test]
    fn test_canonical_id() {
        assert_eq!(canonical_id(ResourceKind::AdAccount, "act_123"), "123");
        assert_eq!(canonical_id(ResourceKind::AdAccount, "123"), "123");
        assert_eq!(canonical_id(ResourceKind::Page, "act_9"), "act_9");
    }

    #[test]
    fn test_outcome_classification() {
        assert!(ProbeOutcome::Valid.is_valid());
        assert!(ProbeOutcome::Rejected { status: 401 }.is_permanent());
        assert!(ProbeOutcome::Rejected { status: 403 }.is_permanent());
        assert!(!ProbeOutcome::Rejected { status: 500 }.is_permanent());
        assert!(!ProbeOutcome::Rejected { status: 429 }.is_permanent());
        assert!(!ProbeOutcome::Unreachable {
            reason: "timeout".into()
        }
        .is_permanent());
    }

    #[tokio::test]
    async fn test_ad_account_probe_valid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/act_42"))
            .and(query_param("fields", "id"))
            .and(query_param("access_token", "good"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"id":"act_42"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let probe = GraphProbe::new(server.uri(), Duration::from_secs(5)).unwrap();
        let outcome = probe.probe(ResourceKind::AdAccount, "42", "good").await;
        assert_eq!(outcome, ProbeOutcome::Valid);
    }

    #[tokio::test]
    async fn test_page_probe_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/555"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let probe = GraphProbe::new(format!("{}/", server.uri()), Duration::from_secs(5)).unwrap();
        let outcome = probe.probe(ResourceKind::Page, "555", "revoked").await;
        assert_eq!(outcome, ProbeOutcome::Rejected { status: 403 });
        assert!(outcome.is_permanent());
    }

    #[tokio::test]
    async fn test_probe_timeout_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let probe = GraphProbe::new(server.uri(), Duration::from_millis(100)).unwrap();
        let outcome = probe.probe(ResourceKind::Page, "1", "slow").await;
        assert_eq!(
            outcome,
            ProbeOutcome::Unreachable {
                reason: "timeout".to_string()
            }
        );
    }
}
