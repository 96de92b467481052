mod cache;
mod config;
mod connectivity;
mod crypto;
mod error;
mod gateway;
mod messages;
mod replay;
mod routes;
#[cfg(test)]
mod testing;
mod transport;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use cache::{CacheRouter, OfflineStore, SqliteStore};
use config::Config;
use connectivity::{ConnectivityState, LivenessProbe};
use messages::MessageBus;
use replay::ReplaySweeper;
use routes::{OfflineRoutes, RouteTable};
use transport::ReqwestTransport;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "vaxsync")]
#[command(about = "Offline-capable sync gateway for school vaccination sessions")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/vaxsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Application origin to proxy, overriding the config file
  #[arg(short, long)]
  origin: Option<Url>,

  /// Address to listen on, overriding the config file
  #[arg(short, long)]
  listen: Option<SocketAddr>,

  /// Log to stderr instead of the log file
  #[arg(long)]
  log_stderr: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(listen) = args.listen {
    config.listen = listen;
  }
  config.validate()?;

  let _log_guard = init_logging(&config, args.log_stderr)?;

  let table = RouteTable::new(
    &config.routes.parent_collection,
    &config.routes.sub_collection,
  )?;
  let store = Arc::new(SqliteStore::open(&config.database_path()?)?);
  let transport = Arc::new(ReqwestTransport::new(CONNECT_TIMEOUT)?);
  let connectivity = Arc::new(ConnectivityState::default());

  let routes = Arc::new(OfflineRoutes::new(
    config.origin.clone(),
    table,
    config.crypto.salt.clone(),
    Arc::clone(&connectivity),
    CacheRouter::new(Arc::clone(&store), Arc::clone(&transport)),
  ));

  let sweeper = Arc::new(ReplaySweeper::new(Arc::clone(&store), Arc::clone(&transport)));
  let _reconnect = Arc::clone(&sweeper).spawn_on_reconnect(connectivity.subscribe());
  let _probe = LivenessProbe::start(
    Arc::clone(&connectivity),
    transport,
    config.probe_url()?,
    config.probe.interval(),
  );

  // submissions queued before the last shutdown
  let pending = store.queue_len()?;
  if pending > 0 {
    info!(pending, "replaying submissions left from a previous run");
    tokio::spawn(async move {
      if let Err(e) = sweeper.sweep().await {
        error!(error = %e, "startup sweep failed");
      }
    });
  }

  let bus = MessageBus::spawn(Arc::clone(&routes));
  let app = gateway::router(routes, bus);

  let listener = tokio::net::TcpListener::bind(config.listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", config.listen, e))?;
  info!(listen = %config.listen, origin = %config.origin, "vaxsync gateway started");

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  info!("vaxsync gateway stopped");
  Ok(())
}

/// Install the global subscriber. The returned guard flushes the log file
/// on drop, so it has to live until `main` returns.
fn init_logging(config: &Config, to_stderr: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.log.filter))
    .map_err(|e| eyre!("Invalid log filter {}: {}", config.log.filter, e))?;

  if to_stderr {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  }

  let directory = config.log_directory()?;
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&directory, "vaxsync.log"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    error!(error = %e, "failed to listen for ctrl-c");
  }
}
