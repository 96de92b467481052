//! Live HTTP access to the origin application.

use reqwest::header::{
  HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, CONTENT_TYPE, COOKIE, LOCATION,
};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use url::Url;

use crate::error::TransportError;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Headers never copied between the browser and the origin: hop-by-hop
/// headers, plus the ones each side's HTTP stack sets itself.
const NOT_FORWARDED: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "host",
  "content-length",
  "accept-encoding",
];

/// Copy of `headers` that is safe to pass on to the other side.
pub fn end_to_end(headers: &HeaderMap) -> HeaderMap {
  let listed_in_connection: Vec<String> = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|name| name.trim().to_ascii_lowercase())
    .collect();

  let mut kept = HeaderMap::new();
  for (name, value) in headers {
    let name_str = name.as_str();
    if NOT_FORWARDED.contains(&name_str) || listed_in_connection.iter().any(|n| n == name_str) {
      continue;
    }
    kept.append(name.clone(), value.clone());
  }
  kept
}

/// Submitted form fields, in submission order. Duplicate keys are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormFields(Vec<(String, String)>);

impl FormFields {
  /// Parse an `application/x-www-form-urlencoded` body.
  pub fn parse(body: &[u8]) -> Self {
    Self(
      url::form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect(),
    )
  }

  /// First value submitted under `key`.
  pub fn get(&self, key: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.as_str())
  }

  pub fn encode(&self) -> String {
    url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(self.0.iter())
      .finish()
  }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for FormFields {
  fn from(pairs: [(K, V); N]) -> Self {
    Self(
      pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

/// The browser's `Cookie` and `Authorization` headers.
///
/// Work done later on the browser's behalf (priming, replay) carries
/// these so the origin sees the same signed-in user.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(Vec<(String, String)>);

impl Credentials {
  pub fn from_headers(headers: &HeaderMap) -> Self {
    let mut pairs = Vec::new();
    for name in [COOKIE, AUTHORIZATION] {
      for value in headers.get_all(&name) {
        if let Ok(value) = value.to_str() {
          pairs.push((name.as_str().to_string(), value.to_string()));
        }
      }
    }
    Self(pairs)
  }

  pub fn apply(&self, headers: &mut HeaderMap) {
    for (name, value) in &self.0 {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        headers.append(name, value);
      }
    }
  }
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let names: Vec<&str> = self.0.iter().map(|(name, _)| name.as_str()).collect();
    f.debug_tuple("Credentials").field(&names).finish()
  }
}

/// Whether the transport follows redirects itself or hands them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
  Follow,
  /// Return 3xx responses untouched (an "opaque redirect").
  Manual,
}

/// Raw request body, forwarded byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBody {
  pub content_type: Option<String>,
  pub bytes: Vec<u8>,
}

impl RequestBody {
  pub fn is_form(&self) -> bool {
    self
      .content_type
      .as_deref()
      .is_some_and(|ct| ct.starts_with(FORM_CONTENT_TYPE))
  }
}

/// A request bound for the origin.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
  pub method: Method,
  pub url: Url,
  /// End-to-end headers, see [`end_to_end`].
  pub headers: HeaderMap,
  pub body: Option<RequestBody>,
  pub redirect: RedirectMode,
}

impl OutboundRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: HeaderMap::new(),
      body: None,
      redirect: RedirectMode::Follow,
    }
  }

  pub fn post_form(url: Url, form: FormFields) -> Self {
    Self {
      method: Method::POST,
      url,
      headers: HeaderMap::new(),
      body: Some(RequestBody {
        content_type: Some(FORM_CONTENT_TYPE.to_string()),
        bytes: form.encode().into_bytes(),
      }),
      redirect: RedirectMode::Follow,
    }
  }

  pub fn with_redirect(mut self, redirect: RedirectMode) -> Self {
    self.redirect = redirect;
    self
  }

  pub fn with_credentials(mut self, credentials: &Credentials) -> Self {
    credentials.apply(&mut self.headers);
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// Submitted form fields. No body is an empty form; a body of any
  /// other content type is `None`.
  pub fn form(&self) -> Option<FormFields> {
    match &self.body {
      None => Some(FormFields::default()),
      Some(body) if body.is_form() => Some(FormFields::parse(&body.bytes)),
      Some(_) => None,
    }
  }
}

/// Where a response body came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
}

impl ResponseSource {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
    }
  }
}

#[derive(Debug, Clone)]
pub struct Response {
  pub status: StatusCode,
  pub content_type: Option<String>,
  pub location: Option<String>,
  /// Remaining end-to-end headers from the origin, `Set-Cookie` included.
  pub headers: HeaderMap,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  /// A 200 rebuilt from a cached body.
  pub fn cached(content_type: Option<String>, body: Vec<u8>) -> Self {
    Self {
      status: StatusCode::OK,
      content_type,
      location: None,
      headers: HeaderMap::new(),
      body,
      source: ResponseSource::Cache,
    }
  }

  /// An unfollowed redirect, which the origin uses to signal a successful write.
  pub fn is_opaque_redirect(&self) -> bool {
    self.source == ResponseSource::Network && self.status.is_redirection()
  }

  #[cfg(test)]
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Sends requests to the origin.
///
/// Only failure to get any response is an error; 4xx/5xx come back as
/// ordinary responses.
pub trait Transport: Send + Sync + 'static {
  fn send(
    &self,
    request: OutboundRequest,
  ) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

/// reqwest-backed transport with one client per redirect mode.
#[derive(Clone)]
pub struct ReqwestTransport {
  follow: reqwest::Client,
  manual: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new(connect_timeout: Duration) -> color_eyre::Result<Self> {
    let follow = reqwest::Client::builder()
      .connect_timeout(connect_timeout)
      .build()?;
    let manual = reqwest::Client::builder()
      .connect_timeout(connect_timeout)
      .redirect(reqwest::redirect::Policy::none())
      .build()?;

    Ok(Self { follow, manual })
  }
}

impl Transport for ReqwestTransport {
  async fn send(&self, request: OutboundRequest) -> Result<Response, TransportError> {
    let client = match request.redirect {
      RedirectMode::Follow => &self.follow,
      RedirectMode::Manual => &self.manual,
    };
    let url = request.url.to_string();
    let failed = |e: reqwest::Error| TransportError::Failed {
      url: url.clone(),
      reason: e.to_string(),
    };

    let mut headers = request.headers;
    let mut builder = client.request(request.method, request.url);
    if let Some(body) = request.body {
      if let Some(value) = body
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
      {
        headers.insert(CONTENT_TYPE, value);
      }
      builder = builder.body(body.bytes);
    }

    let response = builder.headers(headers).send().await.map_err(failed)?;
    let status = response.status();
    let mut headers = end_to_end(response.headers());
    let content_type = take_header(&mut headers, CONTENT_TYPE);
    let location = take_header(&mut headers, LOCATION);
    let body = response.bytes().await.map_err(failed)?.to_vec();

    Ok(Response {
      status,
      content_type,
      location,
      headers,
      body,
      source: ResponseSource::Network,
    })
  }
}

fn take_header(headers: &mut HeaderMap, name: HeaderName) -> Option<String> {
  headers
    .remove(name)
    .and_then(|v| v.to_str().ok().map(String::from))
}
