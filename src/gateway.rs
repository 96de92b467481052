//! Local HTTP front the browser talks to instead of the origin.
//!
//! Every request except the control endpoint is handed to the offline
//! routes; whatever they produce (live, cached or an error) goes back to
//! the browser with an `x-vaxsync-source` header saying which it was.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_TYPE, LOCATION, ORIGIN, REFERER};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;
use tracing::{error, warn};
use url::Url;

use crate::cache::OfflineStore;
use crate::error::SyncResult;
use crate::messages::{Command, MessageBus};
use crate::routes::{resolve, OfflineRoutes};
use crate::transport::{
  end_to_end, Credentials, OutboundRequest, RedirectMode, RequestBody, Response, Transport,
};

pub const MESSAGES_PATH: &str = "/__vaxsync/messages";
pub const SOURCE_HEADER: &str = "x-vaxsync-source";
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

struct Gateway<S: OfflineStore, T: Transport> {
  routes: Arc<OfflineRoutes<S, T>>,
  bus: MessageBus,
}

impl<S: OfflineStore, T: Transport> Clone for Gateway<S, T> {
  fn clone(&self) -> Self {
    Self {
      routes: Arc::clone(&self.routes),
      bus: self.bus.clone(),
    }
  }
}

pub fn router<S: OfflineStore, T: Transport>(routes: Arc<OfflineRoutes<S, T>>, bus: MessageBus) -> Router {
  Router::new()
    .route(MESSAGES_PATH, post(message::<S, T>))
    .fallback(intercept::<S, T>)
    .with_state(Gateway { routes, bus })
}

async fn message<S: OfflineStore, T: Transport>(
  State(gateway): State<Gateway<S, T>>,
  headers: HeaderMap,
  Json(command): Json<Command>,
) -> HttpResponse {
  let credentials = Credentials::from_headers(&headers);
  match gateway.bus.request(command, credentials).await {
    Some(answer) => Json(answer).into_response(),
    // the command failed and its reply was dropped
    None => StatusCode::GATEWAY_TIMEOUT.into_response(),
  }
}

async fn intercept<S: OfflineStore, T: Transport>(
  State(gateway): State<Gateway<S, T>>,
  request: Request,
) -> HttpResponse {
  let (parts, body) = request.into_parts();
  let body = match to_bytes(body, MAX_BODY_BYTES).await {
    Ok(bytes) => bytes,
    Err(e) => {
      warn!(uri = %parts.uri, error = %e, "could not read request body");
      return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response();
    }
  };

  let origin = gateway.routes.origin();
  let handled = match outbound(origin, &parts, &body) {
    Ok(request) => gateway.routes.handle(request).await,
    Err(e) => Err(e),
  };

  match handled {
    Ok(response) => into_http(origin, response),
    Err(e) => {
      error!(method = %parts.method, uri = %parts.uri, error = %e, "request failed");
      (
        e.status_code(),
        [(SOURCE_HEADER, "error")],
        e.to_string(),
      )
        .into_response()
    }
  }
}

/// Rebuild a browser request as a request against the origin. Headers
/// and body go along unchanged, except that `Origin` and `Referer` are
/// made to name the origin instead of the gateway.
fn outbound(origin: &Url, parts: &Parts, body: &[u8]) -> SyncResult<OutboundRequest> {
  let path = parts
    .uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");
  let url = resolve(origin, path)?;

  let mut headers = end_to_end(&parts.headers);
  let content_type = headers
    .remove(CONTENT_TYPE)
    .and_then(|v| v.to_str().ok().map(String::from));
  rebase_on_origin(origin, &mut headers);

  let mut request = OutboundRequest::get(url);
  request.method = parts.method.clone();
  request.headers = headers;
  if !body.is_empty() {
    request.body = Some(RequestBody {
      content_type,
      bytes: body.to_vec(),
    });
  }
  if !request.is_get() {
    // the browser has to see redirects after writes to navigate itself
    request.redirect = RedirectMode::Manual;
  }
  Ok(request)
}

fn rebase_on_origin(origin: &Url, headers: &mut HeaderMap) {
  if headers.contains_key(ORIGIN) {
    if let Ok(value) = HeaderValue::from_str(&origin.origin().ascii_serialization()) {
      headers.insert(ORIGIN, value);
    }
  }

  let referer = headers
    .get(REFERER)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| Url::parse(v).ok());
  if let Some(referer) = referer {
    let mut rebased = origin.clone();
    rebased.set_path(referer.path());
    rebased.set_query(referer.query());
    if let Ok(value) = HeaderValue::from_str(rebased.as_str()) {
      headers.insert(REFERER, value);
    }
  }
}

fn into_http(origin: &Url, response: Response) -> HttpResponse {
  let Response {
    status,
    content_type,
    location,
    mut headers,
    body,
    source,
  } = response;
  headers.insert(SOURCE_HEADER, HeaderValue::from_static(source.as_str()));

  if let Some(value) = content_type
    .as_deref()
    .and_then(|ct| HeaderValue::from_str(ct).ok())
  {
    headers.insert(CONTENT_TYPE, value);
  }

  if let Some(value) = location
    .as_deref()
    .map(|location| relative_location(origin, location))
    .and_then(|location| HeaderValue::from_str(&location).ok())
  {
    headers.insert(LOCATION, value);
  }

  (status, headers, Body::from(body)).into_response()
}

/// Point absolute redirects at the origin back through the gateway.
fn relative_location(origin: &Url, location: &str) -> String {
  match Url::parse(location) {
    Ok(target) if target.origin() == origin.origin() => {
      let mut relative = target.path().to_string();
      if let Some(query) = target.query() {
        relative.push('?');
        relative.push_str(query);
      }
      relative
    }
    _ => location.to_string(),
  }
}
