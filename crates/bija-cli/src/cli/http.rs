use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bija_core::identity::is_hex_key;
use bija_core::models::{ConversationSummary, NoteView, Profile, ThreadedNotes};
use bija_core::{
    BijaError, BijaResult, CoreRuntime, FollowingPage, LoginRequest, LoginState,
    MessageThreadPage, NoteSubmission, PollPage, ProfilePage, SyncResult,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<CoreRuntime>,
    shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(core: Arc<CoreRuntime>) -> Self {
        Self {
            core,
            shutdown: Arc::new(Notify::new()),
        }
    }
}

/// Error body returned by every route: `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<BijaError> for ApiError {
    fn from(err: BijaError) -> Self {
        let status = match &err {
            BijaError::InvalidKeyFormat
            | BijaError::IncorrectCredentials
            | BijaError::NotLoggedIn => StatusCode::UNAUTHORIZED,
            BijaError::Validation(_) => StatusCode::BAD_REQUEST,
            BijaError::NotFound(_) => StatusCode::NOT_FOUND,
            BijaError::Store(_) | BijaError::Background(_) => {
                error!("Request failed: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.user_message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ===== Request / response bodies =====

#[derive(Debug, Serialize)]
struct IndexResponse {
    login_state: LoginState,
    #[serde(skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    feed: Option<ThreadedNotes<NoteView>>,
}

#[derive(Debug, Serialize)]
struct IdentityResponse {
    login_state: LoginState,
    #[serde(skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct PublishedResponse {
    event_id: String,
}

#[derive(Debug, Serialize)]
struct FollowResponse {
    public_key: String,
    following: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<Profile>,
}

#[derive(Debug, Deserialize)]
struct FeedQuery {
    before: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PublicKeyQuery {
    pk: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NoteQuery {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    page: Option<String>,
    pk: Option<String>,
    updated_ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FollowQuery {
    id: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct SubmitMessageRequest {
    #[serde(alias = "pk")]
    recipient: String,
    #[serde(alias = "message")]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct KeysAction {
    #[serde(default)]
    del_keys: bool,
}

// ===== Server =====

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/feed", get(feed))
        .route("/login", post(login))
        .route("/profile", get(profile))
        .route("/note", get(note))
        .route("/messages", get(messages))
        .route("/message", get(message_thread))
        .route("/submit_note", post(submit_note))
        .route("/submit_message", post(submit_message))
        .route("/following", get(following))
        .route("/upd", get(poll))
        .route("/follow", get(follow))
        .route("/keys", get(keys).post(reset_keys))
        .route("/shutdown", get(shutdown))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the JSON surface until `/shutdown` or ctrl-c
pub async fn run_server(bind_addr: &str, core: Arc<CoreRuntime>) -> Result<()> {
    let state = AppState::new(core);
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.notified() => info!("Shutdown requested"),
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        })
        .await?;
    Ok(())
}

/// Core calls touch sqlite and may wait on the worker, so they run off the
/// async executor.
async fn blocking<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&CoreRuntime) -> BijaResult<T> + Send + 'static,
{
    let core = state.core.clone();
    let result = tokio::task::spawn_blocking(move || f(&core))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    result.map(Json).map_err(ApiError::from)
}

// ===== Pages =====

async fn index(State(state): State<AppState>) -> ApiResult<IndexResponse> {
    state.core.close_secondary_subscriptions();
    blocking(&state, |core| {
        let login_state = core.login_state()?;
        let feed = match login_state {
            LoginState::LoggedIn => Some(core.home_feed()?),
            _ => None,
        };
        Ok(IndexResponse {
            login_state,
            public_key: core.public_key(),
            feed,
        })
    })
    .await
}

async fn feed(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
) -> ApiResult<ThreadedNotes<NoteView>> {
    blocking(&state, move |core| core.feed_page(query.before)).await
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<IdentityResponse> {
    state.core.close_secondary_subscriptions();
    blocking(&state, move |core| {
        let public_key = core.login(request)?;
        Ok(IdentityResponse {
            login_state: LoginState::LoggedIn,
            public_key: Some(public_key),
        })
    })
    .await
}

async fn profile(
    State(state): State<AppState>,
    Query(query): Query<PublicKeyQuery>,
) -> ApiResult<ProfilePage> {
    state.core.close_secondary_subscriptions();
    blocking(&state, move |core| core.profile_page(query.pk.as_deref())).await
}

async fn note(
    State(state): State<AppState>,
    Query(query): Query<NoteQuery>,
) -> ApiResult<ThreadedNotes<NoteView>> {
    state.core.close_secondary_subscriptions();
    let Some(id) = query.id else {
        return Ok(Json(ThreadedNotes::default()));
    };
    blocking(&state, move |core| core.note_page(&id)).await
}

async fn messages(State(state): State<AppState>) -> ApiResult<Vec<ConversationSummary>> {
    state.core.close_secondary_subscriptions();
    blocking(&state, |core| core.message_list()).await
}

async fn message_thread(
    State(state): State<AppState>,
    Query(query): Query<PublicKeyQuery>,
) -> ApiResult<MessageThreadPage> {
    state.core.close_secondary_subscriptions();
    blocking(&state, move |core| core.message_thread(query.pk.as_deref())).await
}

async fn following(
    State(state): State<AppState>,
    Query(query): Query<PublicKeyQuery>,
) -> ApiResult<FollowingPage> {
    state.core.close_secondary_subscriptions();
    blocking(&state, move |core| core.following_page(query.pk.as_deref())).await
}

// ===== Actions =====

/// Body is the submitted form as `[name, value]` pairs
async fn submit_note(
    State(state): State<AppState>,
    Json(pairs): Json<Vec<(String, String)>>,
) -> ApiResult<PublishedResponse> {
    let submission = NoteSubmission::from_pairs(pairs);
    blocking(&state, move |core| {
        let event_id = core.submit_note(&submission)?;
        Ok(PublishedResponse { event_id })
    })
    .await
}

async fn submit_message(
    State(state): State<AppState>,
    Json(request): Json<SubmitMessageRequest>,
) -> ApiResult<PublishedResponse> {
    blocking(&state, move |core| {
        let event_id = core.submit_message(&request.recipient, &request.content)?;
        Ok(PublishedResponse { event_id })
    })
    .await
}

async fn poll(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> ApiResult<SyncResult> {
    let page = PollPage::from_params(
        query.page.as_deref(),
        query.pk.as_deref(),
        query.updated_ts.as_deref(),
    );
    blocking(&state, move |core| core.poll(&page)).await
}

async fn follow(
    State(state): State<AppState>,
    Query(query): Query<FollowQuery>,
) -> ApiResult<FollowResponse> {
    let following = query.state == "1" || query.state.eq_ignore_ascii_case("true");
    let public_key = query.id.trim().to_string();
    if !is_hex_key(&public_key) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            BijaError::InvalidKeyFormat.to_string(),
        ));
    }
    blocking(&state, move |core| {
        let profile = core.set_following(&public_key, following)?;
        Ok(FollowResponse {
            public_key,
            following,
            profile,
        })
    })
    .await
}

async fn keys(State(state): State<AppState>) -> ApiResult<IdentityResponse> {
    blocking(&state, |core| {
        Ok(IdentityResponse {
            login_state: core.login_state()?,
            public_key: core.public_key(),
        })
    })
    .await
}

async fn reset_keys(
    State(state): State<AppState>,
    Json(action): Json<KeysAction>,
) -> ApiResult<IdentityResponse> {
    blocking(&state, move |core| {
        if action.del_keys {
            core.reset_identity()?;
        }
        Ok(IdentityResponse {
            login_state: core.login_state()?,
            public_key: core.public_key(),
        })
    })
    .await
}

async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    state.shutdown.notify_one();
    Json(serde_json::json!({ "status": "shutting down" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use bija_core::CoreConfig;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Fixture {
        _dir: TempDir,
        core: Arc<CoreRuntime>,
        app: Router,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = CoreConfig::new(dir.path())
                .with_relays(Vec::new())
                .with_scrypt_log_n(4);
            let core = Arc::new(CoreRuntime::new(config).unwrap());
            let app = router(AppState::new(core.clone()));
            Self {
                _dir: dir,
                core,
                app,
            }
        }

        async fn get(&self, uri: &str) -> (StatusCode, Value) {
            let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
            self.send(request).await
        }

        async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
            let request = Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap();
            self.send(request).await
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, body)
        }

        async fn generate_login(&self) -> String {
            let (status, body) = self
                .post("/login", serde_json::json!({ "type": "generate" }))
                .await;
            assert_eq!(status, StatusCode::OK);
            body["public_key"].as_str().unwrap().to_string()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.core.shutdown();
        }
    }

    #[tokio::test]
    async fn test_index_without_key_has_no_feed() {
        let fixture = Fixture::new();
        let (status, body) = fixture.get("/").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["login_state"], "logged_out_no_key");
        assert!(body.get("feed").is_none());
    }

    #[tokio::test]
    async fn test_login_failures_share_one_message() {
        let fixture = Fixture::new();

        let (status, body) = fixture
            .post(
                "/login",
                serde_json::json!({ "type": "import", "private_key": "not-a-key" }),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Incorrect key or password");

        let (status, body) = fixture
            .post("/login", serde_json::json!({ "type": "unlock", "password": "x" }))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Incorrect key or password");
    }

    #[tokio::test]
    async fn test_submitted_note_appears_in_feed() {
        let fixture = Fixture::new();
        fixture.generate_login().await;

        let (status, body) = fixture
            .post("/submit_note", serde_json::json!([["new_post", "hello relay"]]))
            .await;
        assert_eq!(status, StatusCode::OK);
        let event_id = body["event_id"].as_str().unwrap().to_string();
        assert_eq!(event_id.len(), 64);

        let (status, body) = fixture.get("/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["login_state"], "logged_in");
        let ids = body["feed"]["ids"].as_array().unwrap();
        assert!(ids.iter().any(|id| id == &Value::from(event_id.clone())));
    }

    #[tokio::test]
    async fn test_submit_note_rejections() {
        let fixture = Fixture::new();
        fixture.generate_login().await;

        let (status, body) = fixture
            .post("/submit_note", serde_json::json!([["reply", "   "]]))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid or empty message");

        let (status, body) = fixture
            .post("/submit_note", serde_json::json!([["reply", "hi"]]))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No parent id identified for response");

        let (status, body) = fixture
            .post("/submit_note", serde_json::json!([["other", "hi"]]))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid message");
    }

    #[tokio::test]
    async fn test_submit_message_rejects_bad_recipient() {
        let fixture = Fixture::new();
        fixture.generate_login().await;

        let (status, body) = fixture
            .post(
                "/submit_message",
                serde_json::json!({ "pk": "nope", "message": "hi" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid recipient");
    }

    #[tokio::test]
    async fn test_poll_home_has_base_fields_only() {
        let fixture = Fixture::new();
        fixture.generate_login().await;

        let (status, body) = fixture.get("/upd?page=home").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["unseen_posts"], 0);
        assert_eq!(body["unseen_messages"], 0);
        assert!(body["notices"].as_array().unwrap().is_empty());
        assert!(body.get("profile").is_none());
        assert!(body.get("messages").is_none());
    }

    #[tokio::test]
    async fn test_poll_malformed_profile_page_degrades() {
        let fixture = Fixture::new();

        let (status, body) = fixture.get("/upd?page=profile&pk=zz&updated_ts=abc").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("profile").is_none());
    }

    #[tokio::test]
    async fn test_follow_requires_hex_key() {
        let fixture = Fixture::new();
        fixture.generate_login().await;

        let (status, body) = fixture.get("/follow?id=not-hex&state=1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid key format");
    }

    #[tokio::test]
    async fn test_follow_then_following_page_lists_key() {
        let fixture = Fixture::new();
        fixture.generate_login().await;
        let other = "b".repeat(64);

        let (status, body) = fixture.get(&format!("/follow?id={}&state=1", other)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["following"], true);

        let (status, body) = fixture.get("/following").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.to_string().contains(&other));
    }

    #[tokio::test]
    async fn test_keys_never_expose_private_key() {
        let fixture = Fixture::new();
        let public_key = fixture.generate_login().await;
        let secret = fixture
            .core
            .session()
            .keys()
            .unwrap()
            .secret_key()
            .to_secret_hex();

        let (status, body) = fixture.get("/keys").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["public_key"], Value::from(public_key));
        assert!(!body.to_string().contains(&secret));
    }

    #[tokio::test]
    async fn test_delete_keys_resets_identity() {
        let fixture = Fixture::new();
        fixture
            .post(
                "/login",
                serde_json::json!({ "type": "generate", "save": { "password": "" } }),
            )
            .await;

        let (status, body) = fixture
            .post("/keys", serde_json::json!({ "del_keys": true }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["login_state"], "logged_out_no_key");
        assert!(body.get("public_key").is_none());
    }

    #[tokio::test]
    async fn test_note_without_id_is_an_empty_thread() {
        let fixture = Fixture::new();
        fixture.generate_login().await;

        let (status, body) = fixture.get("/note").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["threads"].as_array().unwrap().is_empty());
        assert!(body["ids"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pages_require_login() {
        let fixture = Fixture::new();

        let (status, body) = fixture.get("/messages").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Not logged in");
    }
}
