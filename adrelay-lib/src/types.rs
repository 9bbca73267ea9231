//! Core types shared by the resolver, the SWR wrapper and their callers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::RelayError;

/// Kind of upstream resource a token is resolved for
///
/// The kind selects the cache namespace and the validation probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    #[serde(rename = "ad-account")]
    AdAccount,
    #[serde(rename = "page")]
    Page,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::AdAccount => "ad-account",
            ResourceKind::Page => "page",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ad-account" | "adaccount" | "ad_account" => Ok(ResourceKind::AdAccount),
            "page" => Ok(ResourceKind::Page),
            other => Err(RelayError::invalid_input(format!(
                "Unknown resource kind '{}' (expected 'ad-account' or 'page')",
                other
            ))),
        }
    }
}

/// A bearer token a caller believes may grant access to a resource
///
/// `name` labels the identity the token belongs to and is only used for
/// diagnostics. Equality between candidates is by token value.
#[derive(Clone, Serialize, Deserialize)]
pub struct CandidateToken {
    pub token: String,
    pub name: String,
}

impl CandidateToken {
    pub fn new(token: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            name: name.into(),
        }
    }

    /// Short prefix of the token that is safe to log
    pub fn redacted(&self) -> String {
        redact(&self.token)
    }
}

// Debug must never print the bearer value
impl fmt::Debug for CandidateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateToken")
            .field("token", &self.redacted())
            .field("name", &self.name)
            .finish()
    }
}

/// Redact a token down to its first six characters
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{}…", prefix)
}

/// Envelope returned by the stale-while-revalidate wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwrResponse<T> {
    pub data: T,
    pub is_stale: bool,
    pub revalidating: bool,
}

impl<T> SwrResponse<T> {
    pub fn fresh(data: T) -> Self {
        Self {
            data,
            is_stale: false,
            revalidating: false,
        }
    }

    pub fn stale(data: T) -> Self {
        Self {
            data,
            is_stale: true,
            revalidating: true,
        }
    }
}

/// Freshness of an SWR entry, derived from its stored timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwrState {
    Fresh,
    Stale,
    Missing,
}

impl SwrState {
    /// Classify an entry by age
    ///
    /// `age_ms` of `None` means the timestamp is absent, which is always a miss.
    pub fn from_age(age_ms: Option<i64>, ttl_secs: u64, stale_ttl_secs: u64) -> Self {
        let Some(age_ms) = age_ms else {
            return SwrState::Missing;
        };
        let ttl_ms = (ttl_secs as i64).saturating_mul(1000);
        let stale_ms = (stale_ttl_secs as i64).saturating_mul(1000);

        if age_ms < ttl_ms {
            SwrState::Fresh
        } else if age_ms < stale_ms {
            SwrState::Stale
        } else {
            SwrState::Missing
        }
    }
}
