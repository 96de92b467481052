//! Records kept in the offline store and the storage seam.

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::StorageError;
use crate::transport::{Credentials, FormFields};

/// One offline-readable response, keyed by its exact request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  pub url: String,
  /// base64(nonce || ciphertext), see `crypto`
  pub payload: String,
  pub content_type: Option<String>,
  pub cached_at: DateTime<Utc>,
}

impl CachedEntry {
  pub fn new(url: &Url, payload: String, content_type: Option<String>) -> Self {
    Self {
      url: url.to_string(),
      payload,
      content_type,
      cached_at: Utc::now(),
    }
  }
}

/// A form submission that could not be delivered live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMutation {
  /// Assigned by the store, never reused.
  pub id: i64,
  pub url: Url,
  pub form: FormFields,
  /// Cookie and Authorization of the browser that submitted it.
  pub credentials: Credentials,
  pub queued_at: DateTime<Utc>,
}

/// Durable home of the response cache and the mutation queue.
///
/// Every method is its own transaction; nothing spans calls.
pub trait OfflineStore: Send + Sync + 'static {
  /// Insert or overwrite by URL.
  fn put_response(&self, entry: &CachedEntry) -> Result<(), StorageError>;

  /// Insert or overwrite several entries atomically: all land or none do.
  fn put_responses(&self, entries: &[CachedEntry]) -> Result<(), StorageError>;

  fn get_response(&self, url: &str) -> Result<Option<CachedEntry>, StorageError>;

  /// Snapshot of every cached entry, ordered by URL.
  fn all_responses(&self) -> Result<Vec<CachedEntry>, StorageError>;

  /// Idempotent.
  fn delete_response(&self, url: &str) -> Result<(), StorageError>;

  /// Append to the mutation queue, returning the new id.
  fn enqueue(
    &self,
    url: &Url,
    form: &FormFields,
    credentials: &Credentials,
  ) -> Result<i64, StorageError>;

  /// Snapshot of the mutation queue in id order.
  fn queued(&self) -> Result<Vec<QueuedMutation>, StorageError>;

  /// Idempotent.
  fn dequeue(&self, id: i64) -> Result<(), StorageError>;

  fn queue_len(&self) -> Result<usize, StorageError>;
}
