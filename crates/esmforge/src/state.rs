use std::sync::Arc;
use std::time::Instant;

use esmforge_npm::ExportAnalyzerRef;
use esmforge_npm::PackageInstallerRef;
use esmforge_npm::PackageRegistryRef;
use esmforge_storage::FileStoreRef;
use esmforge_storage::KvStoreRef;

use crate::build::BuildService;
use crate::bundler::BundlerRef;
use crate::config::Config;
use crate::queue::BuildQueue;

/// Everything a request handler needs, cheap to clone.
#[derive(Clone)]
pub struct AppState {
  pub config: Arc<Config>,
  pub files: FileStoreRef,
  pub kv: KvStoreRef,
  pub registry: PackageRegistryRef,
  pub installer: PackageInstallerRef,
  pub bundler: BundlerRef,
  pub queue: BuildQueue,
  pub started_at: Instant,
}

impl AppState {
  /// Wire the build service and queue together; the service needs the queue
  /// to submit discovered sub-builds, the queue needs the service to run
  /// jobs.
  pub fn assemble(
    config: Arc<Config>,
    registry: PackageRegistryRef,
    installer: PackageInstallerRef,
    analyzer: ExportAnalyzerRef,
    bundler: BundlerRef,
    files: FileStoreRef,
    kv: KvStoreRef,
  ) -> Self {
    let service = Arc::new(BuildService::new(
      config.clone(),
      registry.clone(),
      installer.clone(),
      analyzer,
      bundler.clone(),
      files.clone(),
      kv.clone(),
    ));
    let queue = BuildQueue::new(service.clone(), config.concurrency());
    service.attach_queue(queue.clone());
    Self {
      config,
      files,
      kv,
      registry,
      installer,
      bundler,
      queue,
      started_at: Instant::now(),
    }
  }
}
