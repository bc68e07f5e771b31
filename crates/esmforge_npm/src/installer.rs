use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::automock;
use parking_lot::Mutex;

use esmforge_core::ForgeError;
use esmforge_core::Pkg;
use esmforge_core::PkgOrigin;

use crate::github::CODE_HOST_BASE;
use crate::manifest::PackageManifest;
use crate::npmrc::NpmRc;

pub type PackageInstallerRef = Arc<dyn PackageInstaller + Send + Sync>;

/// Materializes a pinned package's file tree into a working directory.
///
/// Installation is idempotent (marker-checked) and exclusive per
/// package-version key; transitive dependencies are installed lazily by the
/// resolver asking for them, not eagerly here.
#[automock]
#[async_trait]
pub trait PackageInstaller: Send + Sync {
  /// Install the package and return its working directory.
  async fn install(&self, pkg: &Pkg) -> Result<PathBuf, ForgeError>;
  /// Start (or restart) the purge timer for the package's working dir.
  fn schedule_purge(&self, pkg: &Pkg);
}

pub struct Installer {
  work_dir: PathBuf,
  npmrc: NpmRc,
  /// Package-manager CLI, `pnpm`-compatible (`<bin> add <spec>`).
  pm_bin: String,
  purge_after: Duration,
  locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
  purge_timers: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl Installer {
  pub fn new(work_dir: impl Into<PathBuf>, npmrc: NpmRc, pm_bin: impl Into<String>) -> Self {
    Self {
      work_dir: work_dir.into(),
      npmrc,
      pm_bin: pm_bin.into(),
      purge_after: Duration::from_secs(10 * 60),
      locks: Mutex::new(HashMap::new()),
      purge_timers: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_purge_after(mut self, purge_after: Duration) -> Self {
    self.purge_after = purge_after;
    self
  }

  fn key(pkg: &Pkg) -> String {
    format!("{}{}", pkg.origin.path_prefix(), pkg.full_name())
  }

  pub fn working_dir(&self, pkg: &Pkg) -> PathBuf {
    self.work_dir.join("npm").join(Self::key(pkg))
  }

  fn marker(&self, pkg: &Pkg) -> PathBuf {
    self
      .working_dir(pkg)
      .join("node_modules")
      .join(&pkg.name)
      .join("package.json")
  }

  fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
    self
      .locks
      .lock()
      .entry(key.to_string())
      .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
      .clone()
  }

  async fn install_from_registry(&self, pkg: &Pkg, wd: &Path) -> Result<(), ForgeError> {
    let package_json = wd.join("package.json");
    if !package_json.exists() {
      std::fs::write(&package_json, b"{\"name\":\"esmforge-workspace\",\"private\":true}")
        .map_err(|err| internal(pkg, &err.to_string()))?;
    }

    let (npmrc_file, env) = self.npmrc.render_npmrc();
    if !npmrc_file.is_empty() {
      std::fs::write(wd.join(".npmrc"), npmrc_file)
        .map_err(|err| internal(pkg, &err.to_string()))?;
    }

    let mut command = tokio::process::Command::new(&self.pm_bin);
    command
      .arg("add")
      .arg("--prefer-offline")
      .arg(pkg.full_name())
      .current_dir(wd)
      .envs(env)
      .stdin(Stdio::null());
    run(pkg, command).await
  }

  async fn install_from_code_host(&self, pkg: &Pkg, wd: &Path) -> Result<(), ForgeError> {
    let checkout = wd.join("node_modules").join(&pkg.name);
    std::fs::create_dir_all(&checkout).map_err(|err| internal(pkg, &err.to_string()))?;

    let git = |args: &[String]| {
      let mut command = tokio::process::Command::new("git");
      command.args(args).current_dir(&checkout).stdin(Stdio::null());
      command
    };
    let remote = format!("{CODE_HOST_BASE}/{}", pkg.name);
    run(pkg, git(&["init".into()])).await?;
    run(pkg, git(&["remote".into(), "add".into(), "origin".into(), remote])).await?;
    run(
      pkg,
      git(&["fetch".into(), "--depth".into(), "1".into(), "origin".into(), pkg.version.clone()]),
    )
    .await?;
    run(pkg, git(&["checkout".into(), "FETCH_HEAD".into()])).await?;

    // a repository without a manifest still needs the install marker
    let manifest = checkout.join("package.json");
    if !manifest.exists() {
      let stub = serde_json::json!({"name": pkg.name, "version": pkg.version});
      std::fs::write(&manifest, serde_json::to_vec(&stub).unwrap())
        .map_err(|err| internal(pkg, &err.to_string()))?;
    }
    Ok(())
  }
}

async fn run(pkg: &Pkg, mut command: tokio::process::Command) -> Result<(), ForgeError> {
  let output = command
    .output()
    .await
    .map_err(|err| internal(pkg, &err.to_string()))?;
  if !output.status.success() {
    return Err(internal(pkg, String::from_utf8_lossy(&output.stderr).trim()));
  }
  Ok(())
}

fn internal(pkg: &Pkg, detail: &str) -> ForgeError {
  ForgeError::internal(format!("install {}: {detail}", pkg.full_name()))
}

#[async_trait]
impl PackageInstaller for Installer {
  #[tracing::instrument(level = "debug", skip(self), fields(pkg = %pkg))]
  async fn install(&self, pkg: &Pkg) -> Result<PathBuf, ForgeError> {
    let key = Self::key(pkg);
    let lock = self.lock_for(&key);
    let _guard = lock.lock().await;

    // the directory is live again, stop any pending purge
    if let Some(timer) = self.purge_timers.lock().remove(&key) {
      timer.abort();
    }

    let wd = self.working_dir(pkg);
    if self.marker(pkg).exists() {
      return Ok(wd);
    }
    std::fs::create_dir_all(&wd).map_err(|err| internal(pkg, &err.to_string()))?;

    match pkg.origin {
      PkgOrigin::CodeHost => self.install_from_code_host(pkg, &wd).await?,
      _ => self.install_from_registry(pkg, &wd).await?,
    }

    if !self.marker(pkg).exists() {
      return Err(internal(pkg, "package files missing after install"));
    }
    tracing::debug!(wd = %wd.display(), "installed");
    Ok(wd)
  }

  fn schedule_purge(&self, pkg: &Pkg) {
    let key = Self::key(pkg);
    let wd = self.working_dir(pkg);
    let delay = self.purge_after;
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      if let Err(err) = tokio::fs::remove_dir_all(&wd).await {
        if err.kind() != std::io::ErrorKind::NotFound {
          tracing::warn!(wd = %wd.display(), "purge failed: {err}");
        }
      }
    });
    if let Some(previous) = self.purge_timers.lock().insert(key, handle) {
      previous.abort();
    }
  }
}

/// Read the installed package's own manifest out of a working directory.
pub fn read_installed_manifest(wd: &Path, name: &str) -> Result<PackageManifest, ForgeError> {
  let path = wd.join("node_modules").join(name).join("package.json");
  let raw = std::fs::read(&path)
    .map_err(|err| ForgeError::internal(format!("read {}: {err}", path.display())))?;
  serde_json::from_slice(&raw)
    .map_err(|err| ForgeError::internal(format!("parse {}: {err}", path.display())))
}
