use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const APP_DIR: &str = "vaxsync";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Root URL of the application being proxied.
  pub origin: Url,
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  #[serde(default)]
  pub routes: RoutesConfig,
  #[serde(default)]
  pub probe: ProbeConfig,
  pub crypto: CryptoConfig,
  /// SQLite file for the offline cache and queue
  /// (defaults to $XDG_DATA_HOME/vaxsync/offline.db)
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub log: LogConfig,
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 4000))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutesConfig {
  #[serde(default = "default_parent")]
  pub parent_collection: String,
  #[serde(default = "default_sub")]
  pub sub_collection: String,
}

fn default_parent() -> String {
  "sessions".to_string()
}

fn default_sub() -> String {
  "vaccinations".to_string()
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      parent_collection: default_parent(),
      sub_collection: default_sub(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
  #[serde(default = "default_probe_path")]
  pub path: String,
  #[serde(default = "default_probe_interval")]
  pub interval_secs: u64,
}

fn default_probe_path() -> String {
  "/up".to_string()
}

fn default_probe_interval() -> u64 {
  10
}

impl Default for ProbeConfig {
  fn default() -> Self {
    Self {
      path: default_probe_path(),
      interval_secs: default_probe_interval(),
    }
  }
}

impl ProbeConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }
}

#[derive(Clone, Deserialize)]
pub struct CryptoConfig {
  /// Installation-wide salt mixed into every derived key
  pub salt: String,
}

impl std::fmt::Debug for CryptoConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CryptoConfig").field("salt", &"<redacted>").finish()
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// `tracing` filter directive; RUST_LOG takes precedence
  #[serde(default = "default_log_filter")]
  pub filter: String,
  pub directory: Option<PathBuf>,
}

fn default_log_filter() -> String {
  "info".to_string()
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      filter: default_log_filter(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./vaxsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/vaxsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/vaxsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("vaxsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  /// Checks serde can't express.
  pub fn validate(&self) -> Result<()> {
    if !matches!(self.origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got {}", self.origin));
    }
    if self.origin.path() != "/" {
      return Err(eyre!(
        "origin must be the application root, without a path: {}",
        self.origin
      ));
    }
    if self.crypto.salt.trim().is_empty() {
      return Err(eyre!("crypto.salt must not be empty"));
    }
    if !self.probe.path.starts_with('/') {
      return Err(eyre!("probe.path must start with '/': {}", self.probe.path));
    }
    if self.probe.interval_secs == 0 {
      return Err(eyre!("probe.interval_secs must be at least 1"));
    }
    Ok(())
  }

  pub fn probe_url(&self) -> Result<Url> {
    self
      .origin
      .join(&self.probe.path)
      .map_err(|e| eyre!("Invalid probe path {}: {}", self.probe.path, e))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Ok(data_dir()?.join("offline.db")),
    }
  }

  pub fn log_directory(&self) -> Result<PathBuf> {
    match &self.log.directory {
      Some(path) => Ok(path.clone()),
      None => Ok(data_dir()?.join("logs")),
    }
  }
}

fn data_dir() -> Result<PathBuf> {
  dirs::data_dir()
    .map(|dir| dir.join(APP_DIR))
    .ok_or_else(|| eyre!("Could not determine a data directory; set `database` and `log.directory`"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse(
      "origin: http://localhost:3000\n\
       crypto:\n  salt: school-42\n",
    )
    .unwrap();

    assert_eq!(config.listen, default_listen());
    assert_eq!(config.routes.parent_collection, "sessions");
    assert_eq!(config.routes.sub_collection, "vaccinations");
    assert_eq!(config.probe.interval(), Duration::from_secs(10));
    assert_eq!(config.log.filter, "info");
    assert_eq!(
      config.probe_url().unwrap().as_str(),
      "http://localhost:3000/up"
    );
  }

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      "origin: https://vax.example.org\n\
       listen: 0.0.0.0:8080\n\
       routes:\n  parent_collection: campaigns\n  sub_collection: patients\n\
       probe:\n  path: /health\n  interval_secs: 3\n\
       crypto:\n  salt: s\n\
       database: /var/lib/vaxsync/db.sqlite\n\
       log:\n  filter: vaxsync=debug\n  directory: /var/log/vaxsync\n",
    )
    .unwrap();

    assert_eq!(config.listen.port(), 8080);
    assert_eq!(config.routes.parent_collection, "campaigns");
    assert_eq!(config.probe.path, "/health");
    assert_eq!(
      config.database_path().unwrap(),
      PathBuf::from("/var/lib/vaxsync/db.sqlite")
    );
    assert_eq!(
      config.log_directory().unwrap(),
      PathBuf::from("/var/log/vaxsync")
    );
  }

  #[test]
  fn test_salt_and_origin_are_required() {
    assert!(Config::parse("origin: http://localhost:3000\n").is_err());
    assert!(Config::parse("crypto:\n  salt: s\n").is_err());
    assert!(Config::parse("origin: http://localhost:3000\ncrypto:\n  salt: '  '\n").is_err());
  }

  #[test]
  fn test_origin_must_be_http_root() {
    assert!(Config::parse("origin: ftp://localhost\ncrypto:\n  salt: s\n").is_err());
    assert!(Config::parse("origin: http://localhost:3000/app\ncrypto:\n  salt: s\n").is_err());
  }

  #[test]
  fn test_salt_not_in_debug_output() {
    let config = Config::parse("origin: http://localhost:3000\ncrypto:\n  salt: hunter2\n").unwrap();
    assert!(!format!("{:?}", config).contains("hunter2"));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.yaml");
    assert!(Config::load(Some(&missing)).is_err());

    let present = dir.path().join("vaxsync.yaml");
    std::fs::write(&present, "origin: http://localhost:3000\ncrypto:\n  salt: s\n").unwrap();
    assert_eq!(
      Config::load(Some(&present)).unwrap().origin.as_str(),
      "http://localhost:3000/"
    );
  }
}
