//! Test doubles shared by the unit tests.

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Mutex;
use url::Url;

use crate::cache::OfflineStore;
use crate::error::TransportError;
use crate::transport::{OutboundRequest, Response, ResponseSource, Transport};

pub const ORIGIN: &str = "http://localhost:3000";

#[derive(Clone)]
enum Scripted {
  Respond(Response),
  Fail,
}

/// Transport that answers from a per-path script and records every request.
///
/// Paths with no script fail like a refused connection.
#[derive(Default)]
pub struct MockTransport {
  script: Mutex<HashMap<String, Scripted>>,
  calls: Mutex<Vec<OutboundRequest>>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, path: &str, status: u16, body: &str) {
    self.script(
      path,
      Scripted::Respond(Response {
        status: StatusCode::from_u16(status).unwrap(),
        content_type: Some("text/html".into()),
        location: None,
        headers: HeaderMap::new(),
        body: body.as_bytes().to_vec(),
        source: ResponseSource::Network,
      }),
    );
  }

  /// Answer with an unfollowed 302 to `location`.
  pub fn redirect(&self, path: &str, location: &str) {
    self.script(
      path,
      Scripted::Respond(Response {
        status: StatusCode::FOUND,
        content_type: None,
        location: Some(location.into()),
        headers: HeaderMap::new(),
        body: Vec::new(),
        source: ResponseSource::Network,
      }),
    );
  }

  pub fn fail(&self, path: &str) {
    self.script(path, Scripted::Fail);
  }

  fn script(&self, path: &str, outcome: Scripted) {
    self
      .script
      .lock()
      .unwrap()
      .insert(path.to_string(), outcome);
  }

  pub fn calls(&self) -> Vec<OutboundRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn calls_to(&self, path: &str) -> usize {
    self
      .calls()
      .iter()
      .filter(|r| r.url.path() == path)
      .count()
  }
}

impl Transport for MockTransport {
  async fn send(&self, request: OutboundRequest) -> Result<Response, TransportError> {
    let path = request.url.path().to_string();
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(request);

    // give other tasks a chance to interleave, like real I/O would
    tokio::task::yield_now().await;

    let outcome = self.script.lock().unwrap().get(&path).cloned();
    match outcome {
      Some(Scripted::Respond(response)) => Ok(response),
      Some(Scripted::Fail) | None => Err(TransportError::Failed {
        url,
        reason: "connection refused".into(),
      }),
    }
  }
}

/// Wait for a background cache write to land.
pub async fn wait_until_cached<S: OfflineStore>(store: &S, url: &Url) {
  for _ in 0..100 {
    if store.get_response(url.as_str()).unwrap().is_some() {
      return;
    }
    tokio::task::yield_now().await;
  }
  panic!("{} was never cached", url);
}
