use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use futures::stream;
use hyper::upgrade::OnUpgrade;
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{debug, warn};

use crate::{
    backend::{BackendError, LifecycleBackend},
    engine::{
        API_VERSION, ContainerCreateRequest, ExecCreateRequest, ExecStartRequest,
        VersionResponse, WaitResponse,
    },
    identity::{IdentityError, IdentityVerifier},
    scope::{PodScope, ScopeError},
    wait::WaitCondition,
};

mod helpers;

use helpers::{encode_wait_body, parse_body, query_flag, redacted_headers};

#[derive(Clone)]
pub struct AppState {
    service_name: String,
    verifier: Arc<IdentityVerifier>,
    backend: LifecycleBackend,
}

impl AppState {
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        verifier: Arc<IdentityVerifier>,
        backend: LifecycleBackend,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            verifier,
            backend,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let engine = Router::new()
        .route("/_ping", get(ping))
        .route("/:version/_ping", get(ping))
        .route("/:version/version", get(version))
        .route("/:version/info", get(info))
        .route("/:version/events", get(events))
        .route("/:version/containers/json", get(list_containers))
        .route("/:version/containers/create", post(create_container))
        .route("/:version/containers/:name/json", get(inspect_container))
        .route("/:version/containers/:name/start", post(start_container))
        .route("/:version/containers/:name/wait", post(wait_container))
        .route("/:version/containers/:name/attach", post(attach_container))
        .route("/:version/containers/:name/exec", post(create_exec))
        .route("/:version/containers/:name", delete(remove_container))
        .route("/:version/exec/:id/start", post(start_exec))
        .route("/:version/exec/:id/json", get(inspect_exec))
        .route("/:version/containers/:name/stop", post(not_implemented))
        .route("/:version/containers/:name/kill", post(not_implemented))
        .route("/:version/containers/:name/restart", post(not_implemented))
        .route("/:version/containers/:name/pause", post(not_implemented))
        .route("/:version/containers/:name/unpause", post(not_implemented))
        .route("/:version/containers/:name/resize", post(not_implemented))
        .route("/:version/containers/:name/logs", get(not_implemented))
        .route("/:version/containers/:name/top", get(not_implemented))
        .route(
            "/:version/containers/:name/archive",
            get(not_implemented)
                .put(not_implemented)
                .head(not_implemented),
        )
        .route("/:version/exec/:id/resize", post(not_implemented))
        .route("/:version/images/json", get(not_implemented))
        .route("/:version/images/create", post(not_implemented))
        .route("/:version/build", post(not_implemented))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_identity,
        ));

    Router::new()
        .route("/healthz", get(health))
        .merge(engine)
        .fallback(unmatched)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

/// Verifies the bearer token and pins the request to the caller's pod.
async fn require_identity(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let identity = match IdentityVerifier::extract_bearer_token(authorization) {
        Ok(token) => state.verifier.verify(token).await,
        Err(error) => Err(error),
    };
    let identity = match identity {
        Ok(identity) => identity,
        Err(error) => return ApiError::from_identity(error).into_response(),
    };
    let scope = match PodScope::resolve(&identity) {
        Ok(scope) => scope,
        Err(error) => return ApiError::from_scope(error).into_response(),
    };
    debug!(
        subject = %identity.subject,
        namespace = %scope.namespace,
        pod = %scope.pod,
        "request authenticated"
    );
    request.extensions_mut().insert(identity);
    request.extensions_mut().insert(scope);
    next.run(request).await
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": state.service_name,
    }))
}

async fn ping() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
        ],
        [
            ("API-Version", API_VERSION),
            ("OSType", "linux"),
            ("Docker-Experimental", "false"),
        ],
        "OK",
    )
}

async fn version() -> impl IntoResponse {
    Json(VersionResponse::current())
}

async fn info(
    State(state): State<AppState>,
    Extension(scope): Extension<PodScope>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state
        .backend
        .info(&scope)
        .await
        .map_err(ApiError::from_backend)?;
    Ok(Json(info))
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    filters: Option<String>,
}

async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let event = state
        .backend
        .destroy_event(query.filters.as_deref())
        .map_err(ApiError::from_backend)?;
    Ok(Json(event))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    all: Option<String>,
}

async fn list_containers(
    State(state): State<AppState>,
    Extension(scope): Extension<PodScope>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let containers = state
        .backend
        .list(&scope, query_flag(query.all.as_deref()))
        .await
        .map_err(ApiError::from_backend)?;
    Ok(Json(containers))
}

#[derive(Debug, Default, Deserialize)]
struct CreateQuery {
    name: Option<String>,
}

async fn create_container(
    State(state): State<AppState>,
    Extension(scope): Extension<PodScope>,
    Query(query): Query<CreateQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: ContainerCreateRequest = parse_body(&body)?;
    if let Some(requested) = query.name.as_deref() {
        debug!(requested, "ignoring requested container name");
    }
    let created = state
        .backend
        .create(&scope, request)
        .await
        .map_err(ApiError::from_backend)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn inspect_container(
    State(state): State<AppState>,
    Extension(scope): Extension<PodScope>,
    Path((_version, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let name = scope.container(&name).map_err(ApiError::from_scope)?;
    let inspect = state
        .backend
        .inspect(&name)
        .await
        .map_err(ApiError::from_backend)?;
    Ok(Json(inspect))
}

async fn start_container(
    State(state): State<AppState>,
    Extension(scope): Extension<PodScope>,
    Path((_version, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let name = scope.container(&name).map_err(ApiError::from_scope)?;
    state
        .backend
        .start(&name)
        .await
        .map_err(ApiError::from_backend)?;
    Ok(StatusCode::NOT_MODIFIED)
}

#[derive(Debug, Default, Deserialize)]
struct WaitQuery {
    condition: Option<String>,
}

/// Answers with headers right away and writes the status body once the
/// container reaches a terminal phase.
async fn wait_container(
    State(state): State<AppState>,
    Extension(scope): Extension<PodScope>,
    Path((_version, name)): Path<(String, String)>,
    Query(query): Query<WaitQuery>,
) -> Result<Response, ApiError> {
    let name = scope.container(&name).map_err(ApiError::from_scope)?;
    let condition: WaitCondition = query
        .condition
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|error| ApiError::from_backend(BackendError::from(error)))?;
    let mut subscription = state
        .backend
        .wait(&name, condition)
        .await
        .map_err(ApiError::from_backend)?;

    let body = stream::once(async move {
        let phase = subscription.terminal().await;
        Ok::<_, std::convert::Infallible>(encode_wait_body(&WaitResponse::from_phase(&phase)))
    });
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(body),
    )
        .into_response())
}

async fn attach_container(
    State(state): State<AppState>,
    Extension(scope): Extension<PodScope>,
    Path((_version, name)): Path<(String, String)>,
    mut request: Request,
) -> Result<Response, ApiError> {
    let name = scope.container(&name).map_err(ApiError::from_scope)?;
    let on_upgrade = request.extensions_mut().remove::<OnUpgrade>();
    state
        .backend
        .attach(&name, request.headers(), on_upgrade)
        .await
        .map_err(ApiError::from_backend)
}

async fn remove_container(
    State(state): State<AppState>,
    Extension(scope): Extension<PodScope>,
    Path((_version, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let name = scope.container(&name).map_err(ApiError::from_scope)?;
    state
        .backend
        .remove(&name)
        .await
        .map_err(ApiError::from_backend)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_exec(
    State(state): State<AppState>,
    Extension(scope): Extension<PodScope>,
    Path((_version, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let name = scope.container(&name).map_err(ApiError::from_scope)?;
    let request: ExecCreateRequest = parse_body(&body)?;
    let created = state
        .backend
        .exec_create(&name, request)
        .map_err(ApiError::from_backend)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn start_exec(
    State(state): State<AppState>,
    Extension(scope): Extension<PodScope>,
    Path((_version, id)): Path<(String, String)>,
    mut request: Request,
) -> Result<Response, ApiError> {
    let id = scope.exec(&id).map_err(ApiError::from_scope)?;
    let on_upgrade = request.extensions_mut().remove::<OnUpgrade>();
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, helpers::MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|error| ApiError::InvalidRequest(format!("unreadable request body: {error}")))?;
    let start: ExecStartRequest = parse_body(&body)?;
    state
        .backend
        .exec_start(&id, start, &parts.headers, on_upgrade)
        .await
        .map_err(ApiError::from_backend)
}

async fn inspect_exec(
    State(state): State<AppState>,
    Extension(scope): Extension<PodScope>,
    Path((_version, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let id = scope.exec(&id).map_err(ApiError::from_scope)?;
    let inspect = state
        .backend
        .exec_inspect(&id)
        .map_err(ApiError::from_backend)?;
    Ok(Json(inspect))
}

async fn not_implemented(method: Method, uri: Uri) -> ApiError {
    ApiError::from_backend(BackendError::Unimplemented(format!(
        "{method} {}",
        uri.path()
    )))
}

async fn unmatched(method: Method, uri: Uri, headers: HeaderMap) -> ApiError {
    warn!(
        method = %method,
        uri = %uri,
        headers = ?redacted_headers(&headers),
        "unmatched engine request"
    );
    ApiError::NotFound(format!("page not found: {}", uri.path()))
}

#[derive(Debug)]
enum ApiError {
    Unauthorized(String),
    InvalidRequest(String),
    NotFound(String),
    Conflict(String),
    NotImplemented(String),
    Internal(String),
}

impl ApiError {
    fn from_identity(error: IdentityError) -> Self {
        let code = error.code();
        if error.is_unauthorized() {
            warn!(reason_code = code, reason = %error, "engine request denied");
            Self::Unauthorized(error.to_string())
        } else {
            warn!(reason_code = code, reason = %error, "identity verification unavailable");
            Self::Internal(error.to_string())
        }
    }

    fn from_scope(error: ScopeError) -> Self {
        warn!(reason_code = error.code(), reason = %error, "engine name rejected");
        Self::InvalidRequest(error.to_string())
    }

    fn from_backend(error: BackendError) -> Self {
        match error {
            BackendError::NotFound(message) => Self::NotFound(message),
            BackendError::Conflict(message) => {
                warn!(reason_code = "conflict", reason = %message, "cluster rejected mutation");
                Self::Conflict(message)
            }
            BackendError::InvalidArgument(message) => Self::InvalidRequest(message),
            error @ BackendError::Unimplemented(_) => Self::NotImplemented(error.to_string()),
            BackendError::Upstream(message) => {
                warn!(reason_code = "upstream", reason = %message, "cluster call failed");
                Self::Internal(message)
            }
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::Unauthorized(message)
            | Self::InvalidRequest(message)
            | Self::NotFound(message)
            | Self::Conflict(message)
            | Self::NotImplemented(message)
            | Self::Internal(message) => message,
        };
        let mut response = (status, Json(json!({ "message": message }))).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}
