//! Graph API access for callers of the cache layer
//!
//! Cache keys for per-user upstream responses follow
//! `meta:{resource}:{user_id}:{scope}`, so everything belonging to a user
//! can be dropped with [`user_pattern`] after a mutating action.

use crate::probe::resource_path;
use crate::types::ResourceKind;
use crate::{RelayError, Result};
use serde_json::Value;
use std::time::Duration;

/// Cache key for a user's view of an upstream collection
pub fn graph_key(resource: &str, user_id: &str, scope: &str) -> String {
    format!("meta:{}:{}:{}", resource, user_id, scope)
}

/// Pattern matching every cached upstream response of a user
///
/// `*` spans `:`, so a resource name containing `:{user_id}:` would also
/// match; resource names are plain words.
pub fn user_pattern(user_id: &str) -> String {
    format!("meta:*:{}:*", user_id)
}

/// Minimal JSON client for Graph API reads
#[derive(Clone)]
pub struct GraphClient {
    client: reqwest::Client,
    base_url: String,
}

impl GraphClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// GET `{base}/{path}` with the token and extra query parameters
    ///
    /// Non-2xx responses become [`RelayError::UpstreamStatus`] carrying the
    /// status and the upstream error message when one is present. A success
    /// response whose body is not JSON is an [`RelayError::Upstream`] error.
    pub async fn get_json(&self, path: &str, token: &str, params: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(params)
            .query(&[("access_token", token)])
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() { "timed out" } else { "failed" };
                RelayError::upstream(format!("GET {} {}", path, kind))
            })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|_| RelayError::upstream(format!("GET {} body read failed", path)))?;

        if !status.is_success() {
            let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            let message = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("no error message");
            return Err(RelayError::upstream_status(
                status.as_u16(),
                format!("GET {} returned {}: {}", path, status.as_u16(), message),
            ));
        }

        serde_json::from_slice(&bytes).map_err(|e| {
            RelayError::upstream(format!(
                "GET {} returned {} with an undecodable body: {}",
                path,
                status.as_u16(),
                e
            ))
        })
    }

    /// Campaign list of an ad account
    pub async fn campaigns(&self, ad_account_id: &str, token: &str) -> Result<Value> {
        let path = format!("{}/campaigns", resource_path(ResourceKind::AdAccount, ad_account_id));
        self.get_json(
            &path,
            token,
            &[("fields", "id,name,status,objective,daily_budget"), ("limit", "100")],
        )
        .await
    }
}
