//! The seam to the underlying JS/TS bundler.
//!
//! The bundler itself is an external collaborator: it takes build options
//! plus resolve/load hooks and returns output files, warnings and errors.
//! Everything the CDN cares about — import classification, externalization,
//! marker rewriting — happens in the [`crate::build`] plugin driving these
//! hooks, so any engine that honors this contract can sit behind the trait.

pub mod sidecar;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use mockall::automock;

use esmforge_core::Target;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
  Browser,
  Node,
}

/// How an import request reached the resolver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResolveKind {
  Entry,
  Import,
  DynamicImport,
  RequireCall,
  RequireResolve,
}

impl ResolveKind {
  pub fn is_require(&self) -> bool {
    matches!(self, ResolveKind::RequireCall | ResolveKind::RequireResolve)
  }
}

#[derive(Clone, Debug)]
pub struct OnResolveArgs {
  /// The specifier as written in the source.
  pub path: String,
  pub importer: String,
  pub resolve_dir: PathBuf,
  pub kind: ResolveKind,
  pub namespace: String,
}

/// `None` from the hook means "let the bundler resolve normally".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OnResolveResult {
  pub path: String,
  pub external: bool,
  pub namespace: Option<String>,
  pub side_effects: Option<bool>,
}

impl OnResolveResult {
  pub fn bundle() -> Self {
    Self::default()
  }

  pub fn external(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      external: true,
      ..Default::default()
    }
  }

  pub fn in_namespace(path: impl Into<String>, namespace: &str) -> Self {
    Self {
      path: path.into(),
      namespace: Some(namespace.to_string()),
      ..Default::default()
    }
  }
}

#[derive(Clone, Debug)]
pub struct OnLoadArgs {
  pub path: String,
  pub namespace: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Loader {
  Js,
  Json,
  DataUrl,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OnLoadResult {
  pub contents: String,
  pub loader: Loader,
}

/// Resolve/load hooks the bundler calls back into during a build.
#[async_trait]
pub trait BundlePlugin: Send + Sync {
  async fn on_resolve(&self, args: &OnResolveArgs) -> anyhow::Result<Option<OnResolveResult>>;
  async fn on_load(&self, args: &OnLoadArgs) -> anyhow::Result<Option<OnLoadResult>>;
}

#[derive(Clone, Debug)]
pub struct StdinInput {
  pub contents: String,
  pub resolve_dir: PathBuf,
  pub source_file: String,
}

#[derive(Clone, Debug)]
pub struct BundleOptions {
  pub entry_point: Option<PathBuf>,
  pub stdin: Option<StdinInput>,
  pub platform: Platform,
  pub target: Target,
  pub conditions: Vec<String>,
  pub minify: bool,
  pub keep_names: bool,
  pub ignore_annotations: bool,
  pub define: BTreeMap<String, String>,
  pub source_map: bool,
}

impl Default for BundleOptions {
  fn default() -> Self {
    Self {
      entry_point: None,
      stdin: None,
      platform: Platform::Browser,
      target: Target::default(),
      conditions: Vec::new(),
      minify: true,
      keep_names: false,
      ignore_annotations: false,
      define: BTreeMap::new(),
      source_map: true,
    }
  }
}

#[derive(Clone, Debug)]
pub struct OutputFile {
  /// Bundler-relative output path; only the extension matters to callers.
  pub path: String,
  pub contents: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct BundleOutput {
  pub files: Vec<OutputFile>,
  pub errors: Vec<String>,
  pub warnings: Vec<String>,
}

pub type BundlerRef = Arc<dyn Bundler + Send + Sync>;

/// The black-box bundler contract: one build in, output files out, with the
/// plugin consulted for every import; plus the one-shot `transform` used by
/// the POST endpoint.
#[automock]
#[async_trait]
pub trait Bundler: Send + Sync {
  async fn build(
    &self,
    options: BundleOptions,
    plugin: Arc<dyn BundlePlugin>,
  ) -> anyhow::Result<BundleOutput>;

  async fn transform(&self, code: &str, loader: &str, target: Target) -> anyhow::Result<String>;
}
