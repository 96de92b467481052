//! Per-route offline policies.

use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::{is_numeric_id, resolve, Captures, Route, RoutePattern, RouteTable};
use crate::cache::{CacheRouter, OfflineStore};
use crate::connectivity::ConnectivityState;
use crate::crypto::CryptoContext;
use crate::error::{SyncError, SyncResult, TransportError};
use crate::transport::{Credentials, OutboundRequest, RedirectMode, Response, Transport};

/// Everything an intercepted request needs to be answered, online or not.
pub struct OfflineRoutes<S: OfflineStore, T: Transport> {
  origin: Url,
  table: RouteTable,
  salt: String,
  connectivity: Arc<ConnectivityState>,
  router: CacheRouter<S, T>,
}

impl<S: OfflineStore, T: Transport> OfflineRoutes<S, T> {
  pub fn new(
    origin: Url,
    table: RouteTable,
    salt: String,
    connectivity: Arc<ConnectivityState>,
    router: CacheRouter<S, T>,
  ) -> Self {
    Self {
      origin,
      table,
      salt,
      connectivity,
      router,
    }
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn connectivity(&self) -> &Arc<ConnectivityState> {
    &self.connectivity
  }

  pub fn router(&self) -> &CacheRouter<S, T> {
    &self.router
  }

  /// Dispatch an intercepted request to its policy.
  pub async fn handle(&self, request: OutboundRequest) -> SyncResult<Response> {
    let route = self.table.classify(&request.method, request.url.path());
    debug!(
      method = %request.method,
      url = %request.url,
      ?route,
      online = self.connectivity.is_online(),
      "routing request"
    );

    match route {
      Route::Detail => self.detail_view(request).await,
      Route::RecordSubmission => self.submit_record(request).await,
      Route::SetupOffline => self.setup_offline(request).await,
      Route::Default => self.default_route(request).await,
    }
  }

  /// Live detail page, or the session's cached show template.
  pub async fn detail_view(&self, request: OutboundRequest) -> SyncResult<Response> {
    let captures = match_route(&self.table.detail, &request.url)?;
    let session_id = capture(&captures, "session_id", &self.table.detail, &request.url)?;
    let fallback = self.resolve(&self.table.show_template_path(session_id))?;

    if self.connectivity.is_online() {
      match self.router.network_first(request).await {
        Err(SyncError::Transport(e)) => {
          debug!(error = %e, fallback = %fallback, "detail view unavailable, using template");
        }
        other => return other,
      }
    }

    self.router.cache_only(&fallback).await
  }

  /// Submit live when possible; otherwise queue the form and show the
  /// cached record template.
  pub async fn submit_record(&self, request: OutboundRequest) -> SyncResult<Response> {
    let captures = match_route(&self.table.record, &request.url)?;
    let session_id = capture(&captures, "session_id", &self.table.record, &request.url)?;
    let fallback = self.resolve(&self.table.record_template_path(session_id))?;
    let request = request.with_redirect(RedirectMode::Manual);

    if self.connectivity.is_online() {
      match self.router.transport().send(request.clone()).await {
        Ok(response) => return Ok(response),
        Err(e) => warn!(url = %request.url, error = %e, "live submission failed, queueing"),
      }
    }

    let form = request.form().ok_or_else(|| unsupported_body(&request))?;
    let credentials = Credentials::from_headers(&request.headers);
    let id = self.router.store().enqueue(&request.url, &form, &credentials)?;
    info!(id, url = %request.url, "queued submission for replay");

    self.router.cache_only(&fallback).await
  }

  /// Forward the setup POST; prime the cache only if the origin confirmed
  /// it with a redirect.
  pub async fn setup_offline(&self, request: OutboundRequest) -> SyncResult<Response> {
    let captures = match_route(&self.table.setup_offline, &request.url)?;
    let session_id = capture(&captures, "session_id", &self.table.setup_offline, &request.url)?;

    if !self.connectivity.is_online() {
      return Err(TransportError::Offline(request.url.to_string()).into());
    }

    let form = request.form().ok_or_else(|| unsupported_body(&request));
    let credentials = Credentials::from_headers(&request.headers);
    let response = self
      .router
      .transport()
      .send(request.with_redirect(RedirectMode::Manual))
      .await?;

    if !response.is_opaque_redirect() {
      info!(status = %response.status, "offline setup not confirmed, nothing primed");
      return Ok(response);
    }

    let form = form?;
    let password = form
      .get("password")
      .ok_or(SyncError::MissingField("password"))?;
    let css = form
      .get("assets_css")
      .ok_or(SyncError::MissingField("assets_css"))?;
    let js = form
      .get("assets_js")
      .ok_or(SyncError::MissingField("assets_js"))?;

    self
      .prime(
        password,
        session_id,
        &[css.to_string(), js.to_string()],
        &credentials,
      )
      .await?;
    Ok(response)
  }

  /// Derive a key from `password` and cache the session's offline pages
  /// plus `assets` under it, fetched as the user `credentials` belong to.
  /// Assets must live on the origin.
  pub async fn prime(
    &self,
    password: &str,
    session_id: &str,
    assets: &[String],
    credentials: &Credentials,
  ) -> SyncResult<usize> {
    if !is_numeric_id(session_id) {
      return Err(SyncError::Priming(format!(
        "resource id '{}' is not numeric",
        session_id
      )));
    }
    if !self.connectivity.is_online() {
      return Err(TransportError::Offline(self.origin.to_string()).into());
    }

    let urls = assets
      .iter()
      .cloned()
      .chain(self.table.offline_pages(session_id))
      .map(|path| self.resolve(&path))
      .collect::<SyncResult<Vec<_>>>()?;

    info!(session_id, count = urls.len(), "priming offline cache");
    let ctx = CryptoContext::derive_blocking(password.to_string(), self.salt.clone())
      .await
      .map_err(SyncError::Priming)?;

    self.router.prime(ctx, urls, credentials).await
  }

  /// Network-first for reads while online, cache-only while offline.
  async fn default_route(&self, request: OutboundRequest) -> SyncResult<Response> {
    match (self.connectivity.is_online(), request.is_get()) {
      (true, true) => self.router.network_first(request).await,
      (true, false) => Ok(self.router.transport().send(request).await?),
      (false, true) => self.router.cache_only(&request.url).await,
      (false, false) => Err(TransportError::Offline(request.url.to_string()).into()),
    }
  }

  fn resolve(&self, path: &str) -> SyncResult<Url> {
    resolve(&self.origin, path)
  }
}

fn unsupported_body(request: &OutboundRequest) -> SyncError {
  let content_type = request
    .body
    .as_ref()
    .and_then(|body| body.content_type.clone())
    .unwrap_or_else(|| "untyped".to_string());
  SyncError::UnsupportedBody(content_type)
}

fn match_route(pattern: &RoutePattern, url: &Url) -> SyncResult<Captures> {
  pattern
    .captures(url.path())
    .ok_or_else(|| SyncError::RouteMismatch {
      route: pattern.name(),
      url: url.to_string(),
    })
}

fn capture<'a>(
  captures: &'a Captures,
  name: &str,
  pattern: &RoutePattern,
  url: &Url,
) -> SyncResult<&'a str> {
  captures.get(name).ok_or_else(|| SyncError::RouteMismatch {
    route: pattern.name(),
    url: url.to_string(),
  })
}
