//! Error taxonomy for the offline sync core.
//!
//! Application edges (startup, config) use `color_eyre`; everything a
//! request or sweep can run into is one of these typed errors so callers
//! can tell a cache miss from a decryption failure.

use reqwest::StatusCode;
use thiserror::Error;

/// A live request never produced a response.
#[derive(Debug, Error)]
pub enum TransportError {
  /// Connectivity flag says offline, so no request was attempted.
  #[error("offline: live request to {0} not attempted")]
  Offline(String),
  /// DNS, connect, TLS or body read failure.
  #[error("request to {url} failed: {reason}")]
  Failed { url: String, reason: String },
}

/// The persistent store rejected an operation.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("sqlite: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("failed to encode stored value: {0}")]
  Encoding(#[from] serde_json::Error),
  #[error("corrupt stored value: {0}")]
  Corrupt(String),
  #[error("store lock poisoned")]
  Poisoned,
}

/// Ciphertext could not be authenticated with the current key.
#[derive(Debug, Error)]
pub enum DecryptionError {
  /// No key has been derived in this process yet.
  #[error("no offline key has been derived; set up offline mode first")]
  NoKey,
  #[error("malformed ciphertext: {0}")]
  Malformed(String),
  /// Wrong key or tampered payload.
  #[error("ciphertext failed authentication")]
  Authentication,
}

/// AES-GCM refused to seal a payload (only possible for absurd sizes).
#[derive(Debug, Error)]
#[error("encryption failed")]
pub struct EncryptionError;

#[derive(Debug, Error)]
pub enum SyncError {
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error("no cached response for {0}")]
  CacheMiss(String),
  #[error(transparent)]
  Storage(#[from] StorageError),
  #[error(transparent)]
  Decryption(#[from] DecryptionError),
  #[error(transparent)]
  Encryption(#[from] EncryptionError),
  #[error("{url} does not match the {route} route")]
  RouteMismatch { route: &'static str, url: String },
  #[error("submitted form is missing the `{0}` field")]
  MissingField(&'static str),
  #[error("offline priming failed: {0}")]
  Priming(String),
  #[error("invalid url: {0}")]
  InvalidUrl(String),
  /// Only form submissions can be queued for replay.
  #[error("cannot queue a `{0}` body for replay")]
  UnsupportedBody(String),
}

impl SyncError {
  /// Status the gateway answers with when a request ends in this error.
  pub fn status_code(&self) -> StatusCode {
    match self {
      SyncError::Transport(_) | SyncError::Priming(_) => StatusCode::BAD_GATEWAY,
      SyncError::CacheMiss(_) | SyncError::Decryption(_) => StatusCode::SERVICE_UNAVAILABLE,
      SyncError::RouteMismatch { .. } | SyncError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
      SyncError::MissingField(_) => StatusCode::UNPROCESSABLE_ENTITY,
      SyncError::UnsupportedBody(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
      SyncError::Storage(_) | SyncError::Encryption(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

/// Why one queued mutation could not be delivered.
#[derive(Debug, Error)]
pub enum ReplayError {
  #[error(transparent)]
  Transport(#[from] TransportError),
  /// The origin answered, but not with the redirect that signals success.
  #[error("origin rejected replay with status {0}")]
  Rejected(StatusCode),
  /// Delivered, but the row could not be removed afterwards.
  #[error(transparent)]
  Storage(#[from] StorageError),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
