use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Version of the build pipeline itself. Bumping it namespaces a fresh
/// artefact tree; existing URLs keep serving the old one.
pub const BUILD_VERSION: u32 = 2;

#[derive(Clone, Debug, Parser)]
#[command(name = "esmforge", about = "A transforming CDN for registry packages")]
pub struct Config {
  /// HTTP port to listen on.
  #[arg(long, default_value_t = 8080)]
  pub port: u16,

  /// Directory for ephemeral package working trees.
  #[arg(long, default_value = ".esmforge/work")]
  pub work_dir: PathBuf,

  /// Directory for the artefact store (local driver).
  #[arg(long, default_value = ".esmforge/storage")]
  pub storage_dir: PathBuf,

  /// Directory for the metadata store (local driver).
  #[arg(long, default_value = ".esmforge/db")]
  pub db_dir: PathBuf,

  /// Base path the CDN is mounted under, e.g. `/esm`.
  #[arg(long, default_value = "")]
  pub base_path: String,

  /// Origin to use in absolute URLs; defaults to the request host.
  #[arg(long)]
  pub cdn_origin: Option<String>,

  /// Maximum number of concurrently running build jobs.
  #[arg(long, default_value_t = 0)]
  pub build_concurrency: usize,

  /// Seconds a request waits for its build before returning 408.
  #[arg(long, default_value_t = 600)]
  pub build_timeout: u64,

  /// Standard-library version pinned for the `deno` target.
  #[arg(long, default_value = "0.177.0")]
  pub deno_std_version: String,

  /// Skip emitting source maps.
  #[arg(long, default_value_t = false)]
  pub disable_source_map: bool,

  /// Packages allowed to build; empty means all.
  #[arg(long = "allow")]
  pub allow_list: Vec<String>,

  /// Packages refused with 403. A `@scope/` entry bans the whole scope.
  #[arg(long = "ban")]
  pub ban_list: Vec<String>,

  /// Package-manager CLI used by the installer.
  #[arg(long, default_value = "pnpm")]
  pub pm_bin: String,

  /// Node binary for the CJS export analyzer child.
  #[arg(long, default_value = "node")]
  pub node_bin: String,

  /// Path to the analyzer child script.
  #[arg(long, default_value = ".esmforge/cjs-lexer.js")]
  pub analyzer_script: PathBuf,

  /// Path to the bundler sidecar script.
  #[arg(long, default_value = ".esmforge/bundler.js")]
  pub bundler_script: PathBuf,

  /// Registry configuration file (JSON, same shape as the X-Npmrc header).
  #[arg(long)]
  pub npmrc: Option<PathBuf>,

  /// Log filter, e.g. `info` or `esmforge=debug`.
  #[arg(long, default_value = "info")]
  pub log_level: String,
}

impl Default for Config {
  fn default() -> Self {
    Config::parse_from(["esmforge"])
  }
}

impl Config {
  pub fn build_timeout(&self) -> Duration {
    Duration::from_secs(self.build_timeout)
  }

  pub fn concurrency(&self) -> usize {
    if self.build_concurrency == 0 {
      crate::queue::BuildQueue::default_concurrency()
    } else {
      self.build_concurrency
    }
  }

  pub fn is_banned(&self, pkg_name: &str) -> bool {
    self.ban_list.iter().any(|entry| {
      entry == pkg_name || (entry.ends_with('/') && pkg_name.starts_with(entry.as_str()))
    })
  }

  pub fn is_allowed(&self, pkg_name: &str) -> bool {
    self.allow_list.is_empty()
      || self.allow_list.iter().any(|entry| {
        entry == pkg_name || (entry.ends_with('/') && pkg_name.starts_with(entry.as_str()))
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ban_list_matches_names_and_scopes() {
    let mut config = Config::default();
    config.ban_list = vec!["left-pad".to_string(), "@evil/".to_string()];
    assert!(config.is_banned("left-pad"));
    assert!(config.is_banned("@evil/anything"));
    assert!(!config.is_banned("left-pad-utils"));
    assert!(!config.is_banned("react"));
  }

  #[test]
  fn empty_allow_list_allows_everything() {
    let mut config = Config::default();
    assert!(config.is_allowed("react"));
    config.allow_list = vec!["react".to_string()];
    assert!(config.is_allowed("react"));
    assert!(!config.is_allowed("preact"));
  }
}
