//! Route patterns for the intercepted URL families.
//!
//! Templates look like `/sessions/{session_id}/vaccinations/{patient_id}`.
//! `{name}` segments capture a numeric id; everything else must match
//! literally. Patterns are compiled and validated once, at startup.

mod handlers;

pub use handlers::OfflineRoutes;

use reqwest::Method;
use thiserror::Error;
use url::Url;

use crate::error::SyncError;

pub const SHOW_TEMPLATE: &str = "show-template";
pub const RECORD_TEMPLATE: &str = "record-template";

#[derive(Debug, Error)]
#[error("invalid route template `{template}`: {reason}")]
pub struct RouteError {
  template: String,
  reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
  Literal(String),
  Capture(String),
}

/// A compiled path template.
#[derive(Debug, Clone)]
pub struct RoutePattern {
  name: &'static str,
  segments: Vec<Segment>,
}

/// Values captured from a matching path, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captures(Vec<(String, String)>);

impl Captures {
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k == name)
      .map(|(_, v)| v.as_str())
  }
}

impl RoutePattern {
  pub fn parse(name: &'static str, template: &str) -> Result<Self, RouteError> {
    let invalid = |reason: &str| RouteError {
      template: template.to_string(),
      reason: reason.to_string(),
    };

    let rest = template
      .strip_prefix('/')
      .ok_or_else(|| invalid("must start with '/'"))?;

    let mut segments = Vec::new();
    for raw in rest.split('/') {
      let segment = match raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        Some(capture) => {
          if !is_identifier(capture) {
            return Err(invalid(&format!("bad capture name '{}'", capture)));
          }
          if segments.contains(&Segment::Capture(capture.to_string())) {
            return Err(invalid(&format!("duplicate capture '{}'", capture)));
          }
          Segment::Capture(capture.to_string())
        }
        None => {
          if !is_path_literal(raw) {
            return Err(invalid(&format!("bad literal segment '{}'", raw)));
          }
          Segment::Literal(raw.to_string())
        }
      };
      segments.push(segment);
    }

    Ok(Self { name, segments })
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  /// Match a URL path exactly, capturing numeric ids.
  pub fn captures(&self, path: &str) -> Option<Captures> {
    let rest = path.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() != self.segments.len() {
      return None;
    }

    let mut captures = Vec::new();
    for (segment, part) in self.segments.iter().zip(parts) {
      match segment {
        Segment::Literal(literal) if literal == part => {}
        Segment::Capture(name) if is_numeric_id(part) => {
          captures.push((name.clone(), part.to_string()));
        }
        _ => return None,
      }
    }

    Some(Captures(captures))
  }
}

fn is_identifier(s: &str) -> bool {
  !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_path_literal(s: &str) -> bool {
  !s.is_empty()
    && s
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn is_numeric_id(s: &str) -> bool {
  !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Resolve `target` against `origin`. Absolute and scheme-relative
/// targets that land on any other origin are refused.
pub fn resolve(origin: &Url, target: &str) -> Result<Url, SyncError> {
  let url = origin
    .join(target)
    .map_err(|e| SyncError::InvalidUrl(format!("{}: {}", target, e)))?;
  if url.origin() != origin.origin() {
    return Err(SyncError::InvalidUrl(format!(
      "{} is outside {}",
      target,
      origin.origin().ascii_serialization()
    )));
  }
  Ok(url)
}

/// What an intercepted request is, as far as offline policy goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
  /// GET of one record's detail page.
  Detail,
  /// POST recording an outcome for one record.
  RecordSubmission,
  /// POST that sets up offline use for a session.
  SetupOffline,
  Default,
}

/// The three intercepted URL families for one parent/sub collection pair.
#[derive(Debug, Clone)]
pub struct RouteTable {
  parent: String,
  sub: String,
  pub detail: RoutePattern,
  pub record: RoutePattern,
  pub setup_offline: RoutePattern,
}

impl RouteTable {
  pub fn new(parent: &str, sub: &str) -> Result<Self, RouteError> {
    for collection in [parent, sub] {
      if !is_path_literal(collection) {
        return Err(RouteError {
          template: collection.to_string(),
          reason: "collection names must be a single path segment".to_string(),
        });
      }
    }

    Ok(Self {
      parent: parent.to_string(),
      sub: sub.to_string(),
      detail: RoutePattern::parse(
        "detail",
        &format!("/{}/{{session_id}}/{}/{{patient_id}}", parent, sub),
      )?,
      record: RoutePattern::parse(
        "record",
        &format!("/{}/{{session_id}}/{}/{{patient_id}}/record", parent, sub),
      )?,
      setup_offline: RoutePattern::parse(
        "setup-offline",
        &format!("/{}/{{session_id}}/setup-offline", parent),
      )?,
    })
  }

  pub fn classify(&self, method: &Method, path: &str) -> Route {
    if *method == Method::GET && self.detail.captures(path).is_some() {
      Route::Detail
    } else if *method == Method::POST && self.record.captures(path).is_some() {
      Route::RecordSubmission
    } else if *method == Method::POST && self.setup_offline.captures(path).is_some() {
      Route::SetupOffline
    } else {
      Route::Default
    }
  }

  /// Pre-primed page shown in place of any record's detail view.
  pub fn show_template_path(&self, session_id: &str) -> String {
    format!("/{}/{}/{}/{}", self.parent, session_id, self.sub, SHOW_TEMPLATE)
  }

  /// Pre-primed page shown after a submission was queued.
  pub fn record_template_path(&self, session_id: &str) -> String {
    format!("/{}/{}/{}/{}", self.parent, session_id, self.sub, RECORD_TEMPLATE)
  }

  /// Application pages cached when a session is set up for offline use.
  pub fn offline_pages(&self, session_id: &str) -> Vec<String> {
    vec![
      "/favicon.ico".to_string(),
      "/".to_string(),
      "/dashboard".to_string(),
      format!("/{}", self.parent),
      format!("/{}/{}", self.parent, session_id),
      format!("/{}/{}/{}", self.parent, session_id, self.sub),
      self.show_template_path(session_id),
      self.record_template_path(session_id),
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn table() -> RouteTable {
    RouteTable::new("sessions", "vaccinations").unwrap()
  }

  #[test]
  fn test_detail_captures_ids() {
    let captures = table()
      .detail
      .captures("/sessions/12/vaccinations/345")
      .unwrap();
    assert_eq!(captures.get("session_id"), Some("12"));
    assert_eq!(captures.get("patient_id"), Some("345"));
    assert_eq!(captures.get("missing"), None);
  }

  #[test]
  fn test_templates_are_not_records() {
    let table = table();
    assert!(table
      .detail
      .captures("/sessions/1/vaccinations/show-template")
      .is_none());
    assert_eq!(
      table.classify(&Method::GET, "/sessions/1/vaccinations/record-template"),
      Route::Default
    );
  }

  #[test]
  fn test_shape_must_match_exactly() {
    let table = table();
    for path in [
      "/sessions/1/vaccinations/2/",
      "/sessions/1/vaccinations/2.json",
      "/sessions/x/vaccinations/2",
      "/sessions//vaccinations/2",
      "/campaigns/1/vaccinations/2",
      "sessions/1/vaccinations/2",
    ] {
      assert!(table.detail.captures(path).is_none(), "{} matched", path);
    }
  }

  #[test]
  fn test_classify_by_method() {
    let table = table();
    assert_eq!(
      table.classify(&Method::GET, "/sessions/1/vaccinations/2"),
      Route::Detail
    );
    assert_eq!(
      table.classify(&Method::POST, "/sessions/1/vaccinations/2/record"),
      Route::RecordSubmission
    );
    assert_eq!(
      table.classify(&Method::GET, "/sessions/1/vaccinations/2/record"),
      Route::Default
    );
    assert_eq!(
      table.classify(&Method::POST, "/sessions/5/setup-offline"),
      Route::SetupOffline
    );
    assert_eq!(
      table.classify(&Method::GET, "/sessions/5/setup-offline"),
      Route::Default
    );
  }

  #[test]
  fn test_fallback_paths() {
    let table = table();
    assert_eq!(
      table.show_template_path("1"),
      "/sessions/1/vaccinations/show-template"
    );
    assert_eq!(
      table.record_template_path("1"),
      "/sessions/1/vaccinations/record-template"
    );
  }

  #[test]
  fn test_invalid_templates_rejected_at_startup() {
    assert!(RouteTable::new("", "vaccinations").is_err());
    assert!(RouteTable::new("sessions", "vacc/inations").is_err());
    assert!(RouteTable::new("sessions", "{x}").is_err());
    assert!(RoutePattern::parse("dup", "/a/{id}/b/{id}").is_err());
    assert!(RoutePattern::parse("rel", "a/{id}").is_err());
  }

  #[test]
  fn test_resolve_stays_on_origin() {
    let origin = Url::parse("http://localhost:3000").unwrap();
    assert_eq!(
      resolve(&origin, "/sessions/1?tab=x").unwrap().as_str(),
      "http://localhost:3000/sessions/1?tab=x"
    );
    assert_eq!(
      resolve(&origin, "http://localhost:3000/assets/app.css").unwrap().path(),
      "/assets/app.css"
    );

    for target in [
      "//evil.example/sessions/1/vaccinations/2/record",
      "http://evil.example/app.css",
      "https://localhost:3000/",
      "http://localhost:3001/",
    ] {
      assert!(
        matches!(resolve(&origin, target), Err(SyncError::InvalidUrl(_))),
        "{} resolved",
        target
      );
    }
  }

  #[test]
  fn test_offline_pages_substitute_session() {
    let pages = table().offline_pages("5");
    assert!(pages.contains(&"/sessions/5/vaccinations".to_string()));
    assert!(pages.contains(&"/sessions/5/vaccinations/record-template".to_string()));
    assert!(pages.iter().all(|p| !p.contains("{")));
  }
}
