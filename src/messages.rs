//! Control channel between the host page and the sync process.

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::cache::OfflineStore;
use crate::routes::OfflineRoutes;
use crate::transport::{Credentials, Transport};

const BUS_CAPACITY: usize = 32;

/// A command from the host page. On the wire:
/// `{"type": "SAVE_FOR_OFFLINE", "payload": {...}}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
  ToggleConnection,
  GetConnectionStatus,
  SaveForOffline(SaveForOfflinePayload),
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveForOfflinePayload {
  pub password: String,
  pub resource_id: String,
  #[serde(default)]
  pub additional_asset_urls: Vec<String>,
}

impl fmt::Debug for SaveForOfflinePayload {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SaveForOfflinePayload")
      .field("password", &"<redacted>")
      .field("resource_id", &self.resource_id)
      .field("additional_asset_urls", &self.additional_asset_urls)
      .finish()
  }
}

/// A command and the channel its answer goes back on.
///
/// Dropping `reply` without sending is how a failure is reported.
pub struct Envelope {
  pub command: Command,
  /// Who sent it; priming fetches pages as this user.
  pub credentials: Credentials,
  pub reply: oneshot::Sender<bool>,
}

/// Handle to the task that serves commands.
#[derive(Clone)]
pub struct MessageBus {
  tx: mpsc::Sender<Envelope>,
}

impl MessageBus {
  /// Start serving commands against `routes`. The task stops once every
  /// handle is dropped.
  pub fn spawn<S: OfflineStore, T: Transport>(routes: Arc<OfflineRoutes<S, T>>) -> Self {
    let (tx, mut rx) = mpsc::channel::<Envelope>(BUS_CAPACITY);

    tokio::spawn(async move {
      while let Some(Envelope {
        command,
        credentials,
        reply,
      }) = rx.recv().await
      {
        debug!(?command, "message received");
        match command {
          Command::ToggleConnection => {
            let _ = reply.send(routes.connectivity().toggle());
          }
          Command::GetConnectionStatus => {
            let _ = reply.send(routes.connectivity().is_online());
          }
          Command::SaveForOffline(payload) => {
            // priming is slow; keep answering the other commands meanwhile
            let routes = Arc::clone(&routes);
            tokio::spawn(save_for_offline(routes, payload, credentials, reply));
          }
        }
      }
      debug!("message bus closed");
    });

    Self { tx }
  }

  /// Send `command` and wait for its answer. `None` means the command
  /// failed and no answer will come.
  pub async fn request(&self, command: Command, credentials: Credentials) -> Option<bool> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Envelope {
        command,
        credentials,
        reply,
      })
      .await
      .ok()?;
    rx.await.ok()
  }
}

async fn save_for_offline<S: OfflineStore, T: Transport>(
  routes: Arc<OfflineRoutes<S, T>>,
  payload: SaveForOfflinePayload,
  credentials: Credentials,
  reply: oneshot::Sender<bool>,
) {
  let primed = routes
    .prime(
      &payload.password,
      &payload.resource_id,
      &payload.additional_asset_urls,
      &credentials,
    )
    .await;

  match primed {
    Ok(count) => {
      info!(resource_id = %payload.resource_id, count, "saved for offline");
      let _ = reply.send(true);
    }
    Err(e) => {
      error!(resource_id = %payload.resource_id, error = %e, "save for offline failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheRouter, SqliteStore};
  use crate::connectivity::ConnectivityState;
  use crate::crypto::CryptoContext;
  use crate::routes::RouteTable;
  use crate::testing::{MockTransport, ORIGIN};
  use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
  use url::Url;

  const SALT: &str = "bus-salt";

  fn bus(online: bool) -> (MessageBus, Arc<OfflineRoutes<SqliteStore, MockTransport>>, Arc<MockTransport>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let transport = Arc::new(MockTransport::new());
    let routes = Arc::new(OfflineRoutes::new(
      Url::parse(ORIGIN).unwrap(),
      RouteTable::new("sessions", "vaccinations").unwrap(),
      SALT.to_string(),
      Arc::new(ConnectivityState::new(online)),
      CacheRouter::new(store, Arc::clone(&transport)),
    ));
    (MessageBus::spawn(Arc::clone(&routes)), routes, transport)
  }

  async fn ask(bus: &MessageBus, command: Command) -> Option<bool> {
    bus.request(command, Credentials::default()).await
  }

  fn save(resource_id: &str) -> Command {
    Command::SaveForOffline(SaveForOfflinePayload {
      password: "p".into(),
      resource_id: resource_id.into(),
      additional_asset_urls: vec!["/css".into(), "/js".into()],
    })
  }

  #[test]
  fn test_parse_wire_commands() {
    let toggle: Command = serde_json::from_str(r#"{"type":"TOGGLE_CONNECTION"}"#).unwrap();
    assert!(matches!(toggle, Command::ToggleConnection));

    let status: Command = serde_json::from_str(r#"{"type":"GET_CONNECTION_STATUS"}"#).unwrap();
    assert!(matches!(status, Command::GetConnectionStatus));

    let save: Command = serde_json::from_str(
      r#"{"type":"SAVE_FOR_OFFLINE","payload":{"password":"p","resourceId":"5","additionalAssetUrls":["/css","/js"]}}"#,
    )
    .unwrap();
    match save {
      Command::SaveForOffline(payload) => {
        assert_eq!(payload.resource_id, "5");
        assert_eq!(payload.additional_asset_urls, vec!["/css", "/js"]);
      }
      other => panic!("unexpected {:?}", other),
    }

    assert!(serde_json::from_str::<Command>(r#"{"type":"SELF_DESTRUCT"}"#).is_err());
  }

  #[test]
  fn test_password_not_in_debug_output() {
    let rendered = format!("{:?}", save("5"));
    assert!(rendered.contains("<redacted>"));
    assert!(!rendered.contains("\"p\""));
  }

  #[tokio::test]
  async fn test_toggle_and_status() {
    let (bus, _, _) = bus(true);

    assert_eq!(ask(&bus, Command::ToggleConnection).await, Some(false));
    assert_eq!(ask(&bus, Command::GetConnectionStatus).await, Some(false));
    assert_eq!(ask(&bus, Command::GetConnectionStatus).await, Some(false));
    assert_eq!(ask(&bus, Command::ToggleConnection).await, Some(true));
  }

  #[tokio::test]
  async fn test_save_for_offline_primes_cache() {
    let (bus, routes, transport) = bus(true);
    for path in routes_to_prime() {
      transport.respond(path, 200, path);
    }

    assert_eq!(ask(&bus, save("5")).await, Some(true));

    let store = routes.router().store();
    assert_eq!(store.all_responses().unwrap().len(), routes_to_prime().len());

    let key = CryptoContext::initialize("p", SALT);
    let entry = store
      .get_response(&format!("{}/sessions/5", ORIGIN))
      .unwrap()
      .unwrap();
    assert_eq!(key.decrypt(&entry.payload).unwrap(), "/sessions/5");
  }

  #[tokio::test]
  async fn test_failed_save_sends_no_reply() {
    let (bus, routes, transport) = bus(true);
    transport.respond("/css", 200, "css");

    assert_eq!(ask(&bus, save("5")).await, None);
    assert!(routes.router().store().all_responses().unwrap().is_empty());
    assert!(!routes.router().has_key());

    // the bus keeps serving after a failure
    assert_eq!(ask(&bus, Command::GetConnectionStatus).await, Some(true));
  }

  #[tokio::test]
  async fn test_save_refuses_assets_on_other_hosts() {
    let (bus, routes, transport) = bus(true);
    for path in routes_to_prime() {
      transport.respond(path, 200, path);
    }
    let command = Command::SaveForOffline(SaveForOfflinePayload {
      password: "p".into(),
      resource_id: "5".into(),
      additional_asset_urls: vec!["//evil.example/steal.css".into()],
    });

    assert_eq!(ask(&bus, command).await, None);
    assert!(transport.calls().is_empty());
    assert!(routes.router().store().all_responses().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_save_for_offline_fetches_as_sender() {
    let (bus, _, transport) = bus(true);
    for path in routes_to_prime() {
      transport.respond(path, 200, path);
    }
    let mut headers = HeaderMap::new();
    headers.insert(COOKIE, HeaderValue::from_static("_session=abc"));

    let saved = bus
      .request(save("5"), Credentials::from_headers(&headers))
      .await;
    assert_eq!(saved, Some(true));
    assert!(transport
      .calls()
      .iter()
      .all(|call| call.headers[COOKIE] == "_session=abc"));
  }

  fn routes_to_prime() -> Vec<&'static str> {
    vec![
      "/css",
      "/js",
      "/favicon.ico",
      "/",
      "/dashboard",
      "/sessions",
      "/sessions/5",
      "/sessions/5/vaccinations",
      "/sessions/5/vaccinations/show-template",
      "/sessions/5/vaccinations/record-template",
    ]
  }
}
