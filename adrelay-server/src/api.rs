//! HTTP API for adrelay-server
//!
//! Provides endpoints for:
//! - Server status
//! - Credential registration (user connections, team membership)
//! - Token resolution
//! - Cached upstream reads
//! - Cache invalidation

use adrelay_lib::candidates::{Connection, CredentialDirectory};
use adrelay_lib::service::{Fetched, RelayService};
use adrelay_lib::token_resolver::{ProbeAttempt, ResolutionSource};
use adrelay_lib::{RelayError, ResourceKind};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// API server state
#[derive(Clone)]
pub struct ApiState {
    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub service: Arc<RelayService>,
    pub directory: Arc<CredentialDirectory>,
}

impl ApiState {
    pub fn new(service: Arc<RelayService>, directory: Arc<CredentialDirectory>) -> Self {
        Self {
            start_time: std::time::Instant::now(),
            started_at: chrono::Utc::now(),
            service,
            directory,
        }
    }
}

/// API error response
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }

    fn not_connected() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Facebook not connected")
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        let status = match e {
            RelayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RelayError::Upstream(_)
            | RelayError::UpstreamStatus { .. }
            | RelayError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.error })).into_response()
    }
}

/// Status response
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_seconds: u64,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub cache_mode: String,
}

/// Token resolution request
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub user_id: String,
    pub kind: ResourceKind,
    pub resource_id: String,
    pub session_token: Option<String>,
}

/// Token resolution response; the token itself never leaves the server
#[derive(Debug, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub token_name: String,
    pub source: ResolutionSource,
    pub attempts: Vec<ProbeAttempt>,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
    pub session_token: Option<String>,
}

/// Invalidation request: an explicit pattern or everything of one user
#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub pattern: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub deleted: usize,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionRequest {
    pub token: String,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub member_id: String,
}

/// Create the API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/tokens/resolve", post(resolve_token))
        .route("/accounts/:id/campaigns", get(get_campaigns))
        .route("/cache/invalidate", post(invalidate))
        .route("/users/:id/connections", delete(disconnect_user))
        .route("/users/:id/connections/:kind", put(put_connection))
        .route("/teams/:owner/members", post(add_member))
        .route("/teams/:owner/members/:member", delete(remove_member))
        .with_state(state)
}

/// GET /status - Server status
async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        started_at: state.started_at,
        cache_mode: state.service.cache_mode().to_string(),
    })
}

/// POST /tokens/resolve - Pick a working token for a user and resource
async fn resolve_token(
    State(state): State<ApiState>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let resolution = state
        .service
        .resolve_for_user(
            &req.user_id,
            req.kind,
            &req.resource_id,
            req.session_token.as_deref(),
        )
        .await?;

    match resolution.name {
        Some(name) => Ok(Json(ResolveResponse {
            token_name: name,
            source: resolution.source,
            attempts: resolution.attempts,
        })),
        None => Err(ApiError::not_connected()),
    }
}

/// GET /accounts/:id/campaigns - Campaigns through the SWR cache
async fn get_campaigns(
    State(state): State<ApiState>,
    Path(account_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Response, ApiError> {
    let fetched = state
        .service
        .campaigns(&query.user_id, &account_id, query.session_token.as_deref())
        .await?;

    match fetched {
        Fetched::Data(response) => Ok(Json(response).into_response()),
        Fetched::NotConnected(resolution) => {
            if !resolution.attempts.is_empty() && !resolution.all_rejected_permanently() {
                tracing::warn!(
                    account = %account_id,
                    attempts = resolution.attempts.len(),
                    "No token resolved, some failures may be transient"
                );
            }
            Err(ApiError::not_connected())
        }
    }
}

/// POST /cache/invalidate - Delete cached responses
async fn invalidate(
    State(state): State<ApiState>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let deleted = match (req.pattern, req.user_id) {
        (Some(pattern), _) if !pattern.is_empty() => state.service.swr().invalidate(&pattern).await,
        (_, Some(user_id)) if !user_id.is_empty() => state.service.invalidate_user(&user_id).await,
        _ => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "Either pattern or user_id is required",
            ))
        }
    };
    Ok(Json(InvalidateResponse { deleted }))
}

/// PUT /users/:id/connections/:kind - Store an OAuth or business connection
async fn put_connection(
    State(state): State<ApiState>,
    Path((user_id, kind)): Path<(String, String)>,
    Json(req): Json<ConnectionRequest>,
) -> Result<StatusCode, ApiError> {
    if req.token.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "token must not be empty"));
    }
    let connection = Connection::new(req.token, req.display_name);
    match kind.as_str() {
        "oauth" => state.directory.set_oauth(&user_id, connection).await,
        "meta-account" => state.directory.set_meta_account(&user_id, connection).await,
        other => {
            return Err(ApiError::new(
                StatusCode::NOT_FOUND,
                format!("Unknown connection kind '{}'", other),
            ))
        }
    }
    tracing::info!(user = %user_id, kind = %kind, "Connection stored");
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /users/:id/connections - Remove every connection of a user
async fn disconnect_user(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> StatusCode {
    state.directory.disconnect(&user_id).await;
    state.service.invalidate_user(&user_id).await;
    tracing::info!(user = %user_id, "User disconnected");
    StatusCode::NO_CONTENT
}

/// POST /teams/:owner/members - Delegate the owner's credentials to a member
async fn add_member(
    State(state): State<ApiState>,
    Path(owner_id): Path<String>,
    Json(req): Json<AddMemberRequest>,
) -> StatusCode {
    state.directory.add_team_member(&owner_id, &req.member_id).await;
    tracing::info!(owner = %owner_id, member = %req.member_id, "Team member added");
    StatusCode::NO_CONTENT
}

/// DELETE /teams/:owner/members/:member - Revoke delegation
async fn remove_member(
    State(state): State<ApiState>,
    Path((owner_id, member_id)): Path<(String, String)>,
) -> StatusCode {
    state.directory.remove_team_member(&owner_id, &member_id).await;
    state.service.invalidate_user(&member_id).await;
    tracing::info!(owner = %owner_id, member = %member_id, "Team member removed");
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use adrelay_lib::candidates::CandidateTokenProvider;
    use adrelay_lib::config::RelayConfig;
    use adrelay_lib::probe::{ProbeOutcome, TokenProbe};
    use adrelay_lib::storage::{CacheStore, MemoryStore};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt; // for `oneshot`

    /// Accepts exactly one token value
    struct OneTokenProbe(&'static str);

    #[async_trait]
    impl TokenProbe for OneTokenProbe {
        async fn probe(&self, _kind: ResourceKind, _id: &str, token: &str) -> ProbeOutcome {
            if token == self.0 {
                ProbeOutcome::Valid
            } else {
                ProbeOutcome::Rejected { status: 401 }
            }
        }
    }

    fn test_state() -> (ApiState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(CredentialDirectory::new());
        let provider = CandidateTokenProvider::new().with_source(Arc::clone(&directory) as _);
        let service = RelayService::from_parts(
            RelayConfig::default(),
            Arc::clone(&store) as Arc<dyn CacheStore>,
            Arc::new(OneTokenProbe("good")),
            provider,
        )
        .unwrap();
        (ApiState::new(Arc::new(service), directory), store)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn body_json<T: for<'de> Deserialize<'de>>(response: Response) -> T {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_get_status() {
        let (state, _store) = test_state();
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let status: StatusResponse = body_json(response).await;
        assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(status.cache_mode, "memory");
        assert!(status.uptime_seconds < 10);
        assert!(status.started_at <= chrono::Utc::now());
    }

    #[tokio::test]
    async fn test_resolve_through_team_owner() {
        let (state, _store) = test_state();
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/users/owner/connections/meta-account",
                serde_json::json!({"token": "good", "display_name": "Olivia Ads"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        app.clone()
            .oneshot(json_request(
                "PUT",
                "/users/member/connections/oauth",
                serde_json::json!({"token": "expired", "display_name": "Sam"}),
            ))
            .await
            .unwrap();
        app.clone()
            .oneshot(json_request(
                "POST",
                "/teams/owner/members",
                serde_json::json!({"member_id": "member"}),
            ))
            .await
            .unwrap();

        let response = app
            .oneshot(json_request(
                "POST",
                "/tokens/resolve",
                serde_json::json!({"user_id": "member", "kind": "ad-account", "resource_id": "42"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let resolved: ResolveResponse = body_json(response).await;
        assert_eq!(resolved.token_name, "Team owner Olivia Ads (Meta Business)");
        assert_eq!(resolved.source, ResolutionSource::Probed);
        assert_eq!(resolved.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_without_connection() {
        let (state, _store) = test_state();
        let app = create_router(state);

        let response = app
            .oneshot(json_request(
                "POST",
                "/tokens/resolve",
                serde_json::json!({"user_id": "nobody", "kind": "page", "resource_id": "9"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.error, "Facebook not connected");
    }

    #[tokio::test]
    async fn test_campaigns_without_connection() {
        let (state, _store) = test_state();
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/accounts/42/campaigns?user_id=nobody")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalidate_by_user() {
        let (state, store) = test_state();
        let ttl = std::time::Duration::from_secs(60);
        store.set("meta:campaigns:u1:42", b"[]", ttl).await.unwrap();
        store.set("meta:campaigns:u1:42:meta", b"{}", ttl).await.unwrap();
        store.set("meta:campaigns:u2:42", b"[]", ttl).await.unwrap();
        let app = create_router(state);

        let response = app
            .oneshot(json_request(
                "POST",
                "/cache/invalidate",
                serde_json::json!({"user_id": "u1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: InvalidateResponse = body_json(response).await;
        assert_eq!(body.deleted, 2);
        assert_eq!(store.keys().await, vec!["meta:campaigns:u2:42".to_string()]);
    }

    #[tokio::test]
    async fn test_invalidate_requires_target() {
        let (state, _store) = test_state();
        let app = create_router(state);

        let response = app
            .oneshot(json_request("POST", "/cache/invalidate", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_connection_kind() {
        let (state, _store) = test_state();
        let app = create_router(state);

        let response = app
            .oneshot(json_request(
                "PUT",
                "/users/u1/connections/instagram",
                serde_json::json!({"token": "t", "display_name": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
