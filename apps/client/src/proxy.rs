//! Loopback engine endpoint that forwards every request to the bridge with
//! the pod's bearer credential attached.
//!
//! Upgrade handshakes (exec and attach hijacks) are forwarded like any other
//! request; once both sides switch protocols the two raw connections are
//! spliced together.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use levias_token::FileTokenSource;
use reqwest::Url;
use serde_json::json;
use tracing::{debug, warn};

const MAX_FORWARDED_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid upstream URL {url}: {reason}")]
    InvalidUpstream { url: String, reason: String },
    #[error("failed to read request body: {0}")]
    RequestBody(String),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("upstream switched protocols without an upgrade request")]
    UnexpectedUpgrade,
    #[error("failed to build response: {0}")]
    Response(#[from] axum::http::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::RequestBody(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

struct ProxyInner {
    http: reqwest::Client,
    upstream: Url,
    token: FileTokenSource,
}

#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub fn new(upstream: &str, token: FileTokenSource) -> Result<Self, ProxyError> {
        let invalid = |reason: String| ProxyError::InvalidUpstream {
            url: upstream.to_string(),
            reason,
        };
        let upstream = Url::parse(upstream).map_err(|error| invalid(error.to_string()))?;
        if !matches!(upstream.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", upstream.scheme())));
        }
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            inner: Arc::new(ProxyInner {
                http,
                upstream,
                token,
            }),
        })
    }

    pub fn router(&self) -> Router {
        Router::new().fallback(forward).with_state(self.clone())
    }

    fn bearer(&self) -> Option<String> {
        match self.inner.token.token() {
            Ok(token) => Some(token),
            Err(error) => {
                warn!(error = %error, "forwarding without bearer credential");
                None
            }
        }
    }
}

/// Rebases the request path and query onto the upstream URL, keeping any
/// path prefix the upstream carries.
pub fn upstream_url(base: &Url, uri: &Uri) -> Url {
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{prefix}{}", uri.path()));
    url.set_query(uri.query());
    url
}

/// Copies the caller's headers for forwarding, replacing any credential
/// with ours and leaving framing headers to the outbound client.
pub fn stamp_headers(incoming: &HeaderMap, bearer: Option<&str>) -> HeaderMap {
    let mut headers = incoming.clone();
    for name in [
        header::HOST,
        header::AUTHORIZATION,
        header::CONTENT_LENGTH,
        header::TRANSFER_ENCODING,
    ] {
        headers.remove(name);
    }
    if let Some(value) = bearer.and_then(|token| HeaderValue::from_str(&format!("Bearer {token}")).ok()) {
        headers.insert(header::AUTHORIZATION, value);
    }
    headers
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    *name == header::TRANSFER_ENCODING
        || *name == header::CONNECTION
        || *name == header::UPGRADE
        || name.as_str() == "keep-alive"
}

async fn forward(State(proxy): State<Proxy>, request: Request) -> Response {
    match forward_request(&proxy, request).await {
        Ok(response) => response,
        Err(error) => {
            warn!(error = %error, "engine request forwarding failed");
            error.into_response()
        }
    }
}

async fn forward_request(proxy: &Proxy, mut request: Request) -> Result<Response, ProxyError> {
    let on_upgrade = if request.headers().contains_key(header::UPGRADE) {
        request.extensions_mut().remove::<OnUpgrade>()
    } else {
        None
    };
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_FORWARDED_BODY_BYTES)
        .await
        .map_err(|error| ProxyError::RequestBody(error.to_string()))?;

    let url = upstream_url(&proxy.inner.upstream, &parts.uri);
    let headers = stamp_headers(&parts.headers, proxy.bearer().as_deref());
    debug!(method = %parts.method, url = %url, "forwarding engine request");
    let upstream = proxy
        .inner
        .http
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    if status == StatusCode::SWITCHING_PROTOCOLS {
        let on_upgrade = on_upgrade.ok_or(ProxyError::UnexpectedUpgrade)?;
        for (name, value) in upstream.headers() {
            builder = builder.header(name, value);
        }
        tokio::spawn(splice(on_upgrade, upstream));
        return Ok(builder.body(Body::empty())?);
    }

    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) {
            builder = builder.header(name, value);
        }
    }
    Ok(builder.body(Body::from_stream(upstream.bytes_stream()))?)
}

async fn splice(client: OnUpgrade, upstream: reqwest::Response) {
    let mut upstream = match upstream.upgrade().await {
        Ok(upgraded) => upgraded,
        Err(error) => {
            warn!(error = %error, "upstream upgrade failed");
            return;
        }
    };
    let mut client = match client.await {
        Ok(upgraded) => TokioIo::new(upgraded),
        Err(error) => {
            warn!(error = %error, "client upgrade failed");
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(to_upstream, to_client, "hijacked stream closed");
        }
        Err(error) => debug!(error = %error, "hijacked stream ended with error"),
    }
}
