use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use concierge_auth::AuthError;
use concierge_core::OrchestrationOutcome;
use concierge_memory::{detect_intent, MemoryError};
use concierge_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use concierge_types::{HistoryTurn, Message, MessageRole, SessionRecord, User, UserProfile, UserSummary};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;

use crate::AppState;

const SESSION_HISTORY_LIMIT: usize = 10;
const DEFAULT_USER_AGENT: &str = "web-client";
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    detail: String,
    code: &'static str,
}

/// An error that renders as `{"detail", "code"}` with the matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
    code: &'static str,
    bearer_challenge: bool,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            code,
            bearer_challenge: false,
        }
    }

    fn challenge(mut self) -> Self {
        self.bearer_challenge = true;
        self
    }

    fn not_authenticated() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "AUTH_REQUIRED", "Not authenticated").challenge()
    }

    fn session_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "SESSION_NOT_FOUND", "Session not found")
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", detail)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => {
                Self::new(StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS", err.to_string())
                    .challenge()
            }
            AuthError::InvalidToken => {
                Self::new(StatusCode::UNAUTHORIZED, "INVALID_TOKEN", err.to_string()).challenge()
            }
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<MemoryError> for ApiError {
    fn from(err: MemoryError) -> Self {
        Self::internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            Json(ErrorEnvelope {
                detail: self.detail,
                code: self.code,
            }),
        )
            .into_response();
        if self.bearer_challenge {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

#[derive(Debug, Deserialize)]
struct LoginInput {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginOutput {
    access_token: String,
    token_type: &'static str,
    user: UserSummary,
}

#[derive(Debug, Deserialize)]
struct QueryInput {
    query: String,
    #[serde(default)]
    conversation_history: Vec<HistoryTurn>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueryOutput {
    content: String,
    response: String,
    role: &'static str,
    timestamp: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    missing_permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let reaper_state = state.clone();
    let app = app_router(state);
    let reaper = tokio::spawn(async move {
        loop {
            tokio::time::sleep(REAPER_INTERVAL).await;
            let purged = reaper_state.kv.purge_expired().await;
            if purged > 0 {
                tracing::debug!("purged {} expired session entries", purged);
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("concierge listening on {}", listener.local_addr()?);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    reaper.abort();
    result?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/auth/me", get(current_user))
        .route("/query", post(run_query))
        .route("/session", post(create_session))
        .route("/session/{id}", get(get_session).delete(end_session))
        .route("/session/{id}/messages", get(session_messages))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_gate));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .merge(protected)
        .layer(cors_layer(&state.settings.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o.trim() == "*") {
        AllowOrigin::mirror_request()
    } else {
        let parsed = origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o.trim()) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("ignoring invalid CORS origin `{}`", o);
                    None
                }
            })
            .collect::<Vec<_>>();
        AllowOrigin::list(parsed)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
}

async fn auth_gate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    let Some(token) = extract_bearer_token(request.headers()) else {
        return ApiError::not_authenticated().into_response();
    };
    match state.auth.authenticate_token(&token).await {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let trimmed = auth.trim();
    let bearer = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?;
    let token = bearer.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"message": format!("{} API is running", state.settings.app_name)}))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

async fn login(
    State(state): State<AppState>,
    Json(input): Json<LoginInput>,
) -> Result<Json<LoginOutput>, ApiError> {
    let redacted = redact_text(&input.email);
    match state.auth.login(&input.email, &input.password).await {
        Ok(grant) => {
            emit_event(
                Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "auth.login",
                    component: "http",
                    user: Some(&redacted),
                    status: Some("ok"),
                    ..Default::default()
                },
            );
            Ok(Json(LoginOutput {
                access_token: grant.access_token,
                token_type: "bearer",
                user: grant.user,
            }))
        }
        Err(err) => {
            emit_event(
                Level::WARN,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "auth.login",
                    component: "http",
                    user: Some(&redacted),
                    status: Some("rejected"),
                    error_code: Some("INVALID_CREDENTIALS"),
                    ..Default::default()
                },
            );
            Err(err.into())
        }
    }
}

async fn current_user(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Json<Value> {
    Json(json!({
        "user": user.summary(),
        "permissions": state.grants.permissions_for(&user.role),
    }))
}

async fn run_query(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Json(input): Json<QueryInput>,
) -> Result<Json<QueryOutput>, ApiError> {
    if input.query.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_QUERY",
            "Query must not be empty",
        ));
    }

    let mut history = input.conversation_history;
    if let Some(session_id) = input.session_id.as_deref() {
        owned_session(&state, session_id, &user).await?;
        if history.is_empty() {
            history = state
                .sessions
                .recent_messages(session_id, SESSION_HISTORY_LIMIT)
                .await?
                .iter()
                .map(Message::as_turn)
                .collect();
        }
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(DEFAULT_USER_AGENT)
        .to_string();
    let context = json!({
        "user": {
            "id": user.id,
            "name": user.name,
            "email": user.email,
            "role": user.role,
        },
        "timestamp": Utc::now().to_rfc3339(),
        "user_agent": user_agent,
    });
    let permissions = state.grants.permissions_for(&user.role);

    let orchestrator = state.orchestrator.clone();
    let query = input.query.clone();
    let outcome = tokio::spawn(async move {
        orchestrator
            .plan_and_execute(&query, &context, &history, &permissions)
            .await
    })
    .await
    .map_err(|err| {
        tracing::error!("query task failed: {}", err);
        ApiError::internal(err.to_string())
    })?;

    let content = outcome.content();
    let redacted_user = redact_text(&user.email);
    emit_event(
        Level::INFO,
        ProcessKind::Server,
        ObservabilityEvent {
            event: "query.completed",
            component: "http",
            user: Some(&redacted_user),
            session_id: input.session_id.as_deref(),
            status: Some(outcome.status()),
            ..Default::default()
        },
    );

    if let Some(session_id) = input.session_id.as_deref() {
        let intent = detect_intent(&input.query);
        state
            .sessions
            .append_message(
                session_id,
                Message::new(MessageRole::User, input.query.clone())
                    .with_metadata("intent", json!(intent)),
            )
            .await?;
        state
            .sessions
            .append_message(
                session_id,
                Message::new(MessageRole::Assistant, content.clone())
                    .with_metadata("status", json!(outcome.status())),
            )
            .await?;
        state.sessions.record_intent(session_id, intent).await?;
    }

    let missing_permissions = match &outcome {
        OrchestrationOutcome::Denied {
            missing_permissions,
            ..
        } => missing_permissions.clone(),
        _ => Vec::new(),
    };
    Ok(Json(QueryOutput {
        response: content.clone(),
        content,
        role: "assistant",
        timestamp: Utc::now().to_rfc3339(),
        status: outcome.status(),
        session_id: input.session_id,
        missing_permissions,
    }))
}

async fn create_session(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, ApiError> {
    let profile = UserProfile {
        user_id: user.id.clone(),
        name: user.name.clone(),
        email: user.email.clone(),
        role: user.role.clone(),
        preferences: Map::new(),
        intents: Vec::new(),
    };
    let session_id = state.sessions.create(&user.id, profile).await?;
    let session = state
        .sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::internal("Session vanished after creation"))?;
    Ok(Json(json!({"session_id": session_id, "session": session})))
}

async fn get_session(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    owned_session(&state, &id, &user).await.map(Json)
}

async fn end_session(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    owned_session(&state, &id, &user).await?;
    state.sessions.end(&id).await?;
    Ok(Json(json!({"ok": true})))
}

async fn session_messages(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
    Query(params): Query<MessagesQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    owned_session(&state, &id, &user).await?;
    let limit = params.limit.unwrap_or(SESSION_HISTORY_LIMIT);
    Ok(Json(state.sessions.recent_messages(&id, limit).await?))
}

/// Someone else's session is reported as missing.
async fn owned_session(
    state: &AppState,
    session_id: &str,
    user: &User,
) -> Result<SessionRecord, ApiError> {
    match state.sessions.get(session_id).await? {
        Some(record) if record.user_profile.user_id == user.id => Ok(record),
        _ => Err(ApiError::session_not_found()),
    }
}
