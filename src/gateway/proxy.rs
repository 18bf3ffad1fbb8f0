//! HTTP front of the gateway: `ANY <prefix>/<service>/<path..>` is
//! forwarded to one registered instance of `<service>`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, Method, Uri};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use serde_json::Value;
use tokio::net::TcpStream;

use super::RoutingTable;
use crate::error::GatewayError;
use crate::types::new_id;

/// Correlation id injected into proxied requests.
pub const REQUEST_ID: &str = "requestId";

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Shared by every handler: the table and the prefix to strip.
struct Gateway {
    table: RoutingTable,
    prefix: String,
}

pub fn router(table: RoutingTable, route_prefix: &str) -> Router {
    let prefix = route_prefix.trim_end_matches('/');
    let state = Arc::new(Gateway {
        table,
        prefix: prefix.to_string(),
    });
    Router::new()
        .route(&format!("{prefix}/{{service}}"), any(forward_root))
        .route(&format!("{prefix}/{{service}}/{{*path}}"), any(forward))
        .with_state(state)
}

async fn forward(
    State(gateway): State<Arc<Gateway>>,
    Path((service, _)): Path<(String, String)>,
    request: Request,
) -> Result<Response, GatewayError> {
    proxy(&gateway, &service, request).await
}

async fn forward_root(
    State(gateway): State<Arc<Gateway>>,
    Path(service): Path<String>,
    request: Request,
) -> Result<Response, GatewayError> {
    proxy(&gateway, &service, request).await
}

/// The part of `raw` after `<prefix>/<service segment>`, still
/// percent-encoded.  Always starts with `/`.
pub fn upstream_path<'a>(raw: &'a str, prefix: &str) -> &'a str {
    let rest = raw.strip_prefix(prefix).unwrap_or(raw);
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    match rest.find('/') {
        Some(at) => &rest[at..],
        None => "/",
    }
}

async fn proxy(
    gateway: &Gateway,
    service: &str,
    request: Request,
) -> Result<Response, GatewayError> {
    let target = gateway.table.select(service).await?;
    let (mut parts, body) = request.into_parts();
    let request_id = new_id();

    let path = upstream_path(parts.uri.path(), &gateway.prefix).to_string();
    let mut query = parts.uri.query().map(str::to_string);
    let body = if parts.method == Method::GET {
        query = Some(query_with_request_id(query.as_deref(), &request_id));
        body
    } else {
        let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        match body_with_request_id(&bytes, &request_id) {
            Some(rewritten) => {
                parts.headers.remove(header::CONTENT_LENGTH);
                Body::from(rewritten)
            }
            None => Body::from(bytes),
        }
    };

    let uri = match query {
        Some(q) => format!("{path}?{q}"),
        None => path,
    };
    parts.uri = uri
        .parse::<Uri>()
        .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
    let host = HeaderValue::from_str(&target.address)
        .map_err(|e| GatewayError::Upstream(format!("bad instance address: {e}")))?;
    parts.headers.insert(header::HOST, host);

    debug!("Forwarding {} {} to {} ({})", parts.method, parts.uri, service, target.address);
    let upstream = hyper::Request::from_parts(parts, body);
    let response = send(&target.address, upstream).await?;
    Ok(response_to_axum(response))
}

async fn send(
    address: &str,
    request: hyper::Request<Body>,
) -> Result<hyper::Response<Incoming>, GatewayError> {
    let stream = tokio::time::timeout(UPSTREAM_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| GatewayError::Upstream(format!("connect to {address} timed out")))?
        .map_err(|e| GatewayError::Upstream(format!("connect to {address}: {e}")))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| GatewayError::Upstream(format!("handshake with {address}: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Upstream connection error: {}", e);
        }
    });

    tokio::time::timeout(UPSTREAM_TIMEOUT, sender.send_request(request))
        .await
        .map_err(|_| GatewayError::Upstream(format!("{address} timed out")))?
        .map_err(|e| GatewayError::Upstream(e.to_string()))
}

fn response_to_axum(response: hyper::Response<Incoming>) -> Response {
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, Body::new(body))
}

/// Adds `requestId` to a query string unless the caller sent a
/// non-empty one.
pub fn query_with_request_id(query: Option<&str>, request_id: &str) -> String {
    let query = query.unwrap_or("");
    let present = query.split('&').any(|pair| {
        pair.split_once('=')
            .is_some_and(|(k, v)| k == REQUEST_ID && !v.is_empty())
    });
    if present {
        query.to_string()
    } else if query.is_empty() {
        format!("{REQUEST_ID}={request_id}")
    } else {
        format!("{query}&{REQUEST_ID}={request_id}")
    }
}

/// Rewrites a JSON object body to carry `requestId`.  `None` means the
/// body is forwarded untouched: it is not a JSON object or already has
/// a non-empty id.
pub fn body_with_request_id(body: &[u8], request_id: &str) -> Option<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object_mut()?;
    let missing = match object.get(REQUEST_ID) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    };
    if !missing {
        return None;
    }
    object.insert(REQUEST_ID.to_string(), Value::String(request_id.to_string()));
    serde_json::to_vec(&value).ok()
}
