use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// One entry of a `browser` field map: either a replacement path/specifier
/// or `false`, meaning the module is excluded in browser builds.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BrowserReplacement {
  Path(String),
  Exclude(bool),
}

/// The `browser` field: a string replacing the main entry, or a
/// specifier → replacement map.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BrowserField {
  Main(String),
  Map(BTreeMap<String, BrowserReplacement>),
}

/// The `sideEffects` field: a boolean or one-or-more globs.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SideEffects {
  Bool(bool),
  Glob(String),
  Globs(Vec<String>),
}

impl Default for SideEffects {
  fn default() -> Self {
    SideEffects::Bool(true)
  }
}

impl SideEffects {
  /// Globs are treated conservatively as "has side effects".
  pub fn any(&self) -> bool {
    !matches!(self, SideEffects::Bool(false))
  }
}

/// A package version's manifest as the registry serves it. Unknown fields
/// are ignored; absent fields default.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PackageManifest {
  pub name: String,
  pub version: String,
  pub main: Option<String>,
  pub module: Option<String>,
  pub types: Option<String>,
  pub typings: Option<String>,
  pub browser: Option<BrowserField>,
  pub exports: Option<serde_json::Value>,
  pub imports: BTreeMap<String, serde_json::Value>,
  pub dependencies: BTreeMap<String, String>,
  pub peer_dependencies: BTreeMap<String, String>,
  pub side_effects: SideEffects,
  pub deprecated: Option<String>,
  pub dist: Option<DistInfo>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DistInfo {
  pub tarball: String,
  #[serde(default)]
  pub integrity: Option<String>,
}

impl PackageManifest {
  /// The type-definition entry: `types`, `typings`, or a `.d.ts` main.
  pub fn types_entry(&self) -> Option<&str> {
    if let Some(types) = self.types.as_deref() {
      return Some(types);
    }
    if let Some(typings) = self.typings.as_deref() {
      return Some(typings);
    }
    match self.main.as_deref() {
      Some(main) if main.ends_with(".d.ts") => Some(main),
      _ => None,
    }
  }

  /// The package ships type definitions but no runtime entry at all.
  pub fn is_types_only(&self) -> bool {
    self.main.is_none() && self.module.is_none() && self.types_entry().is_some()
  }

  /// The `browser` field normalized to a specifier → replacement map;
  /// `None` values mean "exclude".
  pub fn browser_map(&self) -> BTreeMap<String, Option<String>> {
    match &self.browser {
      Some(BrowserField::Map(map)) => map
        .iter()
        .map(|(from, to)| {
          let to = match to {
            BrowserReplacement::Path(path) if !path.is_empty() => Some(path.clone()),
            _ => None,
          };
          (from.clone(), to)
        })
        .collect(),
      _ => BTreeMap::new(),
    }
  }

  /// The main entry after applying a string-valued `browser` field.
  pub fn browser_main(&self) -> Option<&str> {
    match &self.browser {
      Some(BrowserField::Main(main)) => Some(main),
      _ => None,
    }
  }

  pub fn dependency_version(&self, name: &str) -> Option<&str> {
    self
      .dependencies
      .get(name)
      .or_else(|| self.peer_dependencies.get(name))
      .map(String::as_str)
  }
}

/// The registry's full document for a package name.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Packument {
  pub name: String,
  #[serde(default, rename = "dist-tags")]
  pub dist_tags: BTreeMap<String, String>,
  #[serde(default)]
  pub versions: BTreeMap<String, PackageManifest>,
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn deserializes_browser_field_shapes() {
    let manifest: PackageManifest = serde_json::from_str(
      r#"{
        "name": "ws",
        "version": "8.13.0",
        "main": "index.js",
        "browser": {
          "./lib/stream.js": "./browser.js",
          "bufferutil": false,
          "utf-8-validate": ""
        }
      }"#,
    )
    .unwrap();

    let map = manifest.browser_map();
    assert_eq!(map["./lib/stream.js"].as_deref(), Some("./browser.js"));
    assert_eq!(map["bufferutil"], None);
    assert_eq!(map["utf-8-validate"], None);

    let string_form: PackageManifest = serde_json::from_str(
      r#"{"name":"x","version":"1.0.0","main":"index.js","browser":"browser.js"}"#,
    )
    .unwrap();
    assert_eq!(string_form.browser_main(), Some("browser.js"));
    assert!(string_form.browser_map().is_empty());
  }

  #[test]
  fn deserializes_side_effects_shapes() {
    let cases = [
      (r#"{"sideEffects":false}"#, false),
      (r#"{"sideEffects":true}"#, true),
      (r#"{"sideEffects":"./src/index.js"}"#, true),
      (r#"{"sideEffects":["./a.js","./b.css"]}"#, true),
      (r#"{}"#, true),
    ];
    for (json, expected) in cases {
      let manifest: PackageManifest = serde_json::from_str(json).unwrap();
      assert_eq!(manifest.side_effects.any(), expected, "{json}");
    }
  }

  #[test]
  fn detects_types_only_packages() {
    let types_only: PackageManifest =
      serde_json::from_str(r#"{"name":"@types/react","version":"18.0.28","types":"index.d.ts"}"#)
        .unwrap();
    assert!(types_only.is_types_only());
    assert_eq!(types_only.types_entry(), Some("index.d.ts"));

    let dts_main: PackageManifest =
      serde_json::from_str(r#"{"name":"x","version":"1.0.0","main":"index.d.ts"}"#).unwrap();
    assert_eq!(dts_main.types_entry(), Some("index.d.ts"));

    let runtime: PackageManifest =
      serde_json::from_str(r#"{"name":"react","version":"18.2.0","main":"index.js"}"#).unwrap();
    assert!(!runtime.is_types_only());
    assert_eq!(runtime.types_entry(), None);
  }

  #[test]
  fn dependency_version_checks_peers_too() {
    let manifest: PackageManifest = serde_json::from_str(
      r#"{
        "name": "react-dom",
        "version": "18.2.0",
        "dependencies": {"scheduler": "^0.23.0"},
        "peerDependencies": {"react": "^18.2.0"}
      }"#,
    )
    .unwrap();
    assert_eq!(manifest.dependency_version("scheduler"), Some("^0.23.0"));
    assert_eq!(manifest.dependency_version("react"), Some("^18.2.0"));
    assert_eq!(manifest.dependency_version("preact"), None);
  }
}
