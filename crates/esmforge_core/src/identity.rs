use std::fmt;
use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

use crate::args::encode_args_prefix;
use crate::types::BuildArgs;
use crate::types::Pkg;
use crate::types::Target;

/// How aggressively dependencies are inlined into the artefact.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleMode {
  /// Bundle the package itself, externalize its dependencies.
  #[default]
  Default,
  /// Bundle everything except peer dependencies and `?external`.
  All,
  /// Externalize even the package's own sub-modules.
  None,
}

impl BundleMode {
  fn file_suffix(&self) -> &'static str {
    match self {
      BundleMode::Default => "",
      BundleMode::All => ".bundle",
      BundleMode::None => ".nobundle",
    }
  }
}

/// The canonical cache key of one build.
///
/// Two requests that map to the same identity are one build job, one artefact
/// and one metadata record. The serialized form doubles as the artefact URL
/// path, so every identity field is visible in the URL it produces.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct BuildIdentity {
  /// Pipeline version; bumping it namespaces a disjoint artefact tree.
  pub build_version: u32,
  pub pkg: Pkg,
  pub args: BuildArgs,
  pub target: Target,
  pub dev: bool,
  pub bundle_mode: BundleMode,
}

impl BuildIdentity {
  /// The `X-…` URL segment for this identity's args, or `None` when the
  /// normalized args are empty.
  pub fn args_segment(&self) -> Option<String> {
    let encoded = encode_args_prefix(&self.args, &self.pkg, false);
    if encoded.is_empty() {
      None
    } else {
      Some(format!("X-{encoded}"))
    }
  }

  fn file_stem(&self) -> String {
    let mut stem = self.pkg.module_base_name();
    if self.dev {
      stem.push_str(".development");
    }
    stem.push_str(self.bundle_mode.file_suffix());
    stem
  }

  /// Canonical URL path: `/vN/[gh/]name@version/[X-args/]target/module.mjs`.
  pub fn url_path(&self) -> String {
    let mut path = format!(
      "/v{}/{}{}",
      self.build_version,
      self.pkg.origin.path_prefix(),
      self.pkg.full_name()
    );
    if let Some(args) = self.args_segment() {
      path.push('/');
      path.push_str(&args);
    }
    path.push('/');
    path.push_str(self.target.as_str());
    path.push('/');
    path.push_str(&self.file_stem());
    path.push_str(".mjs");
    path
  }

  /// Storage path of the JS artefact; also the key of its metadata record.
  pub fn save_path(&self) -> String {
    format!("builds{}", self.url_path())
  }

  pub fn css_save_path(&self) -> String {
    let path = self.save_path();
    format!("{}.css", path.trim_end_matches(".mjs"))
  }

  pub fn map_save_path(&self) -> String {
    format!("{}.map", self.save_path())
  }

  /// Storage prefix of this identity's rewritten type definitions.
  pub fn types_prefix(&self) -> String {
    let mut prefix = format!(
      "types/v{}/{}{}",
      self.build_version,
      self.pkg.origin.path_prefix(),
      self.pkg.full_name()
    );
    let encoded = encode_args_prefix(&self.args, &self.pkg, true);
    if !encoded.is_empty() {
      prefix.push_str(&format!("/X-{encoded}"));
    }
    prefix
  }
}

impl Display for BuildIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.url_path())
  }
}
