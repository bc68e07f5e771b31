use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use super::pkg::Pkg;

/// Side-channel modifiers that change a build's output.
///
/// The set-valued fields are kept sorted so that encoding is a pure function
/// of the logical arguments; see the args-prefix codec.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct BuildArgs {
  /// Source specifier → replacement specifier.
  pub alias: BTreeMap<String, String>,
  /// Pinned versions for transitive imports.
  pub deps: Vec<Pkg>,
  /// Specifiers never inlined; `*` externalizes every unresolved import.
  pub external: BTreeSet<String>,
  /// Named exports to keep when tree-shaking a CJS-to-ESM conversion.
  pub exports: BTreeSet<String>,
  /// Export conditions, e.g. `browser`, `react-server`.
  pub conditions: BTreeSet<String>,
  /// Alternative JSX runtime package.
  pub jsx_runtime: Option<Pkg>,
  /// Leave `require()` calls of externals in place.
  pub external_require: bool,
  /// Keep class/function names through minification.
  pub keep_names: bool,
  /// Ignore side-effect annotations in package manifests.
  pub ignore_annotations: bool,
}

impl BuildArgs {
  /// `?external=*` (or a `/*` path prefix): externalize everything.
  pub fn external_all(&self) -> bool {
    self.external.contains("*")
  }

  pub fn is_external(&self, specifier: &str) -> bool {
    self.external.contains(specifier)
  }

  /// Add a dependency pin, first one per name wins.
  pub fn add_dep(&mut self, pkg: Pkg) {
    if !self.deps.iter().any(|d| d.name == pkg.name) {
      self.deps.push(pkg);
      self.deps.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    }
  }

  pub fn dep(&self, name: &str) -> Option<&Pkg> {
    self.deps.iter().find(|d| d.name == name)
  }

  /// Drop entries that cannot affect the build of `host` so that equivalent
  /// requests share one build identity: aliases of the host itself, dep pins
  /// for the host, and — the tie-break rule — a `react` pin when building
  /// `react-dom`, whose react version is always forced to its own.
  pub fn normalize(&mut self, host: &Pkg) {
    self.alias.remove(&host.name);
    let host_name = host.name.clone();
    self
      .deps
      .retain(|d| d.name != host_name && !(host_name == "react-dom" && d.name == "react"));
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn dedupes_deps_by_name() {
    let mut args = BuildArgs::default();
    args.add_dep(Pkg::new("react", "18.0.0"));
    args.add_dep(Pkg::new("react", "17.0.2"));
    args.add_dep(Pkg::new("scheduler", "0.23.0"));
    assert_eq!(args.deps.len(), 2);
    assert_eq!(args.dep("react").unwrap().version, "18.0.0");
  }

  #[test]
  fn normalize_applies_react_dom_tie_break() {
    let mut args = BuildArgs::default();
    args.add_dep(Pkg::new("react", "18.0.0"));
    args.add_dep(Pkg::new("scheduler", "0.23.0"));
    args.alias.insert("react-dom".into(), "preact".into());

    args.normalize(&Pkg::new("react-dom", "18.2.0"));

    assert!(args.dep("react").is_none());
    assert!(args.dep("scheduler").is_some());
    assert!(args.alias.is_empty());
  }
}
