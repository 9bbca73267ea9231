//! Candidate token assembly
//!
//! Gathers every bearer token that might grant a user access to upstream
//! resources, most specific credential first:
//! 1. the user's own OAuth connection
//! 2. the user's own business (MetaAccount) connection
//! 3. the team owner's connections, when the user is a delegated member
//! 4. the connections of the other team members
//! 5. a session-level fallback token
//!
//! The resulting list is what [`TokenResolver`](crate::token_resolver::TokenResolver)
//! consumes; the resolver itself knows nothing about where tokens come from.

use crate::types::CandidateToken;
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A place credentials are read from
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Candidate tokens for a user, in preference order
    async fn candidates_for(&self, user_id: &str) -> Result<Vec<CandidateToken>>;
}

/// A stored upstream connection
#[derive(Clone)]
pub struct Connection {
    pub token: String,
    /// Display name of the connected identity
    pub display_name: String,
}

impl Connection {
    pub fn new(token: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Clone, Default)]
struct UserConnections {
    oauth: Option<Connection>,
    meta_account: Option<Connection>,
}

impl UserConnections {
    fn push_into(&self, role: &str, out: &mut Vec<CandidateToken>) {
        if let Some(ref c) = self.oauth {
            out.push(CandidateToken::new(
                c.token.clone(),
                format!("{}{} (Facebook)", role, c.display_name),
            ));
        }
        if let Some(ref c) = self.meta_account {
            out.push(CandidateToken::new(
                c.token.clone(),
                format!("{}{} (Meta Business)", role, c.display_name),
            ));
        }
    }
}

#[derive(Default)]
struct DirectoryData {
    users: HashMap<String, UserConnections>,
    /// member id -> team owner id
    owner_of: HashMap<String, String>,
    /// team owner id -> member ids, in the order they joined
    members_of: HashMap<String, Vec<String>>,
}

/// In-memory credential store with team delegation
#[derive(Default)]
pub struct CredentialDirectory {
    data: RwLock<DirectoryData>,
}

impl CredentialDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_oauth(&self, user_id: &str, connection: Connection) {
        let mut data = self.data.write().await;
        data.users.entry(user_id.to_string()).or_default().oauth = Some(connection);
    }

    pub async fn set_meta_account(&self, user_id: &str, connection: Connection) {
        let mut data = self.data.write().await;
        data.users.entry(user_id.to_string()).or_default().meta_account = Some(connection);
    }

    /// Remove every connection of a user (disconnect / revocation)
    pub async fn disconnect(&self, user_id: &str) {
        self.data.write().await.users.remove(user_id);
    }

    /// Make `member_id` a delegated member of `owner_id`'s team
    ///
    /// A member belongs to at most one team; joining another moves them.
    pub async fn add_team_member(&self, owner_id: &str, member_id: &str) {
        let mut data = self.data.write().await;
        if let Some(previous) = data.owner_of.insert(member_id.to_string(), owner_id.to_string()) {
            if let Some(members) = data.members_of.get_mut(&previous) {
                members.retain(|m| m != member_id);
            }
        }
        data.members_of
            .entry(owner_id.to_string())
            .or_default()
            .push(member_id.to_string());
    }

    pub async fn remove_team_member(&self, owner_id: &str, member_id: &str) {
        let mut data = self.data.write().await;
        if data.owner_of.get(member_id).map(String::as_str) == Some(owner_id) {
            data.owner_of.remove(member_id);
        }
        if let Some(members) = data.members_of.get_mut(owner_id) {
            members.retain(|m| m != member_id);
        }
    }
}

#[async_trait]
impl CredentialSource for CredentialDirectory {
    async fn candidates_for(&self, user_id: &str) -> Result<Vec<CandidateToken>> {
        let data = self.data.read().await;
        let mut out = Vec::new();

        if let Some(own) = data.users.get(user_id) {
            own.push_into("", &mut out);
        }

        let owner_id = data
            .owner_of
            .get(user_id)
            .map(String::as_str)
            .unwrap_or(user_id);

        if owner_id != user_id {
            if let Some(owner) = data.users.get(owner_id) {
                owner.push_into("Team owner ", &mut out);
            }
        }

        if let Some(members) = data.members_of.get(owner_id) {
            for member_id in members.iter().filter(|m| m.as_str() != user_id) {
                if let Some(member) = data.users.get(member_id) {
                    member.push_into("Team member ", &mut out);
                }
            }
        }

        Ok(out)
    }
}

/// Builds the ordered candidate list for a user from all credential sources
///
/// Sources are consulted in registration order. Empty tokens are dropped and
/// duplicates keep their first (most specific) position. A failing source is
/// logged and skipped.
#[derive(Clone, Default)]
pub struct CandidateTokenProvider {
    sources: Vec<Arc<dyn CredentialSource>>,
}

impl CandidateTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Candidate tokens for `user_id`, with `session_token` as last resort
    pub async fn candidates_for(
        &self,
        user_id: &str,
        session_token: Option<&str>,
    ) -> Vec<CandidateToken> {
        let mut gathered = Vec::new();
        for source in &self.sources {
            match source.candidates_for(user_id).await {
                Ok(tokens) => gathered.extend(tokens),
                Err(e) => warn!(user = %user_id, error = %e, "Credential source failed, skipping"),
            }
        }

        if let Some(token) = session_token {
            gathered.push(CandidateToken::new(token, "Session"));
        }

        let mut seen = HashSet::new();
        let candidates: Vec<CandidateToken> = gathered
            .into_iter()
            .filter(|c| !c.token.is_empty())
            .filter(|c| seen.insert(c.token.clone()))
            .collect();

        debug!(user = %user_id, count = candidates.len(), "assembled candidate tokens");
        candidates
    }
}
