use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use esmforge::router::build_router;
use esmforge::AppState;
use esmforge::Config;
use esmforge_npm::Installer;
use esmforge_npm::NodeExportAnalyzer;
use esmforge_npm::NpmRc;
use esmforge_npm::RegistryClient;
use esmforge_storage::LocalFileStore;
use esmforge_storage::LocalKvStore;

use esmforge::bundler::sidecar::SidecarBundler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let config = Arc::new(Config::parse());
  initialize_tracing(&config.log_level);

  let npmrc = match &config.npmrc {
    Some(path) => NpmRc::from_json(&std::fs::read_to_string(path)?)?,
    None => NpmRc::new(),
  };

  let registry = Arc::new(RegistryClient::new(npmrc.clone()));
  let installer = Arc::new(Installer::new(
    config.work_dir.clone(),
    npmrc,
    config.pm_bin.clone(),
  ));
  let analyzer = Arc::new(NodeExportAnalyzer::new(
    config.node_bin.clone(),
    config.analyzer_script.clone(),
  ));
  let bundler = Arc::new(SidecarBundler::new(
    config.node_bin.clone(),
    config.bundler_script.clone(),
  ));
  let files = Arc::new(LocalFileStore::new(config.storage_dir.clone())?);
  let kv = Arc::new(LocalKvStore::new(config.db_dir.clone())?);

  let state = AppState::assemble(
    config.clone(),
    registry,
    installer,
    analyzer,
    bundler,
    files,
    kv,
  );

  let app = build_router(state);
  let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
  info!("listening on {}", listener.local_addr()?);
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    let _ = tokio::signal::ctrl_c().await;
  };
  #[cfg(unix)]
  let terminate = async {
    if let Ok(mut signal) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
      signal.recv().await;
    }
  };
  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }
  info!("shutting down");
}

fn initialize_tracing(log_level: &str) {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
  tracing_subscriber::fmt().with_env_filter(filter).init();
}
