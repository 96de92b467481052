//! Read strategies over the encrypted response cache.

use futures::future::try_join_all;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use super::traits::{CachedEntry, OfflineStore};
use crate::crypto::CryptoContext;
use crate::error::{DecryptionError, SyncError, SyncResult};
use crate::transport::{Credentials, OutboundRequest, Response, Transport};

/// Serves responses from the network or the encrypted cache.
///
/// Holds the in-memory key. Until a key is installed nothing can be
/// cached or read back.
pub struct CacheRouter<S: OfflineStore, T: Transport> {
  store: Arc<S>,
  transport: Arc<T>,
  key: RwLock<Option<Arc<CryptoContext>>>,
}

impl<S: OfflineStore, T: Transport> CacheRouter<S, T> {
  pub fn new(store: Arc<S>, transport: Arc<T>) -> Self {
    Self {
      store,
      transport,
      key: RwLock::new(None),
    }
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  pub fn transport(&self) -> &Arc<T> {
    &self.transport
  }

  /// Replace the active key.
  pub fn install_key(&self, ctx: CryptoContext) {
    info!(key_id = ctx.key_id(), "installing offline key");
    let mut guard = self.key.write().unwrap_or_else(|e| e.into_inner());
    *guard = Some(Arc::new(ctx));
  }

  #[cfg(test)]
  pub fn has_key(&self) -> bool {
    self.current_key().is_some()
  }

  fn current_key(&self) -> Option<Arc<CryptoContext>> {
    self
      .key
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Serve `url` from the cache only.
  pub async fn cache_only(&self, url: &Url) -> SyncResult<Response> {
    let entry = self
      .store
      .get_response(url.as_str())?
      .ok_or_else(|| SyncError::CacheMiss(url.to_string()))?;

    let key = self.current_key().ok_or(DecryptionError::NoKey)?;
    let body = key.open(&entry.payload)?;

    debug!(url = %url, "served from cache");
    Ok(Response::cached(entry.content_type, body))
  }

  /// Try the network; on transport failure fall back to the cached copy.
  ///
  /// Successful GETs are cached in the background. A miss on fallback
  /// surfaces the original transport error.
  pub async fn network_first(&self, request: OutboundRequest) -> SyncResult<Response> {
    let url = request.url.clone();
    let cacheable = request.is_get();

    match self.transport.send(request).await {
      Ok(response) => {
        if cacheable && response.status.is_success() {
          self.remember(&url, &response);
        }
        Ok(response)
      }
      Err(err) => {
        debug!(url = %url, error = %err, "live fetch failed, trying cache");
        match self.cache_only(&url).await {
          Err(SyncError::CacheMiss(_)) => Err(err.into()),
          other => other,
        }
      }
    }
  }

  /// Best-effort cache write that never blocks or fails the caller.
  fn remember(&self, url: &Url, response: &Response) {
    let Some(key) = self.current_key() else {
      debug!(url = %url, "no offline key yet, not caching");
      return;
    };

    let store = Arc::clone(&self.store);
    let url = url.clone();
    let body = response.body.clone();
    let content_type = response.content_type.clone();

    tokio::spawn(async move {
      let written = key
        .seal(&body)
        .map_err(SyncError::from)
        .and_then(|payload| {
          let entry = CachedEntry::new(&url, payload, content_type);
          store.put_response(&entry).map_err(SyncError::from)
        });

      if let Err(e) = written {
        warn!(url = %url, error = %e, "failed to cache response");
      }
    });
  }

  /// Fetch, encrypt and store every URL under `ctx`, then make `ctx` current.
  /// Fetches are made as the user `credentials` belong to.
  ///
  /// All-or-nothing: any failed or non-2xx fetch leaves the cache and the
  /// current key untouched.
  pub async fn prime(
    &self,
    ctx: CryptoContext,
    urls: Vec<Url>,
    credentials: &Credentials,
  ) -> SyncResult<usize> {
    let fetches = urls.into_iter().map(|url| async move {
      let request = OutboundRequest::get(url.clone()).with_credentials(credentials);
      let response = self.transport.send(request).await?;
      if !response.status.is_success() {
        return Err(SyncError::Priming(format!(
          "{} answered {}",
          url, response.status
        )));
      }
      Ok::<_, SyncError>((url, response))
    });
    let responses = try_join_all(fetches).await?;

    let entries = responses
      .into_iter()
      .map(|(url, response)| -> SyncResult<CachedEntry> {
        let payload = ctx.seal(&response.body)?;
        Ok(CachedEntry::new(&url, payload, response.content_type))
      })
      .collect::<SyncResult<Vec<_>>>()?;

    self.store.put_responses(&entries)?;
    self.install_key(ctx);

    info!(count = entries.len(), "offline cache primed");
    Ok(entries.len())
  }
}
