//! Entry resolution and export-shape analysis for an installed package:
//! which file the build starts from, whether it is ESM, and what a CJS
//! module's named exports are (via the out-of-process analyzer).

use std::path::Path;

use esmforge_core::Pkg;
use esmforge_core::Target;
use esmforge_npm::ExportAnalyzerRef;
use esmforge_npm::PackageManifest;

/// What the build job knows about the entry module before bundling.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModuleShape {
  pub entry: Option<String>,
  pub is_esm: bool,
  pub has_default_export: bool,
  pub named_exports: Vec<String>,
  /// The module is a bare re-export of another package.
  pub reexport: Option<String>,
}

/// Condition preference for `exports`/`imports` resolution, most specific
/// first. The requested conditions always come before the defaults.
fn condition_preference(target: Target, requested: &[String]) -> Vec<String> {
  let mut preference: Vec<String> = requested.to_vec();
  if target.is_server() {
    preference.extend(["node", "import", "module", "default", "browser"].map(String::from));
  } else {
    preference.extend(["browser", "import", "module", "default", "node"].map(String::from));
  }
  preference
}

/// Resolve one `exports` value (string or nested condition object) to a
/// relative path, tracking whether an ESM condition selected it.
fn resolve_export_value(value: &serde_json::Value, preference: &[String]) -> Option<(String, bool)> {
  match value {
    serde_json::Value::String(path) => Some((path.clone(), path.ends_with(".mjs"))),
    serde_json::Value::Object(conditions) => {
      for key in preference {
        if let Some(nested) = conditions.get(key) {
          if let Some((path, esm)) = resolve_export_value(nested, preference) {
            let esm = esm || key == "import" || key == "module";
            return Some((path, esm));
          }
        }
      }
      None
    }
    _ => None,
  }
}

/// Resolve the file a `(package, sub-module)` pair builds from.
pub fn resolve_entry(
  manifest: &PackageManifest,
  pkg_dir: &Path,
  sub_module: &str,
  target: Target,
  requested_conditions: &[String],
) -> ModuleShape {
  let preference = condition_preference(target, requested_conditions);
  let mut shape = ModuleShape::default();

  let export_key = if sub_module.is_empty() {
    ".".to_string()
  } else {
    format!("./{sub_module}")
  };
  if let Some(exports) = &manifest.exports {
    let value = match exports.as_object() {
      // sub-path map
      Some(map) if map.keys().any(|k| k.starts_with('.')) => map.get(&export_key),
      // bare string or top-level condition object covers only the root
      _ if sub_module.is_empty() => Some(exports),
      _ => None,
    };
    if let Some((path, esm)) = value.and_then(|v| resolve_export_value(v, &preference)) {
      shape.entry = Some(clean_relative(&path));
      shape.is_esm = esm;
      return shape;
    }
  }

  if sub_module.is_empty() {
    if let Some(module) = &manifest.module {
      shape.entry = Some(clean_relative(module));
      shape.is_esm = true;
      return shape;
    }
    if !target.is_server() {
      if let Some(browser_main) = manifest.browser_main() {
        shape.entry = Some(clean_relative(browser_main));
        shape.is_esm = browser_main.ends_with(".mjs");
        return shape;
      }
    }
    if let Some(main) = &manifest.main {
      shape.entry = Some(clean_relative(main));
      shape.is_esm = main.ends_with(".mjs");
      return shape;
    }
    if pkg_dir.join("index.js").is_file() {
      shape.entry = Some("index.js".to_string());
      return shape;
    }
    return shape;
  }

  // sub-module without an export definition: probe the conventional layouts
  for candidate in [
    format!("{sub_module}.mjs"),
    format!("{sub_module}.js"),
    format!("{sub_module}/index.mjs"),
    format!("{sub_module}/index.js"),
    sub_module.to_string(),
  ] {
    if pkg_dir.join(&candidate).is_file() {
      shape.is_esm = candidate.ends_with(".mjs");
      shape.entry = Some(candidate);
      return shape;
    }
  }
  shape
}

fn clean_relative(path: &str) -> String {
  path.trim_start_matches("./").to_string()
}

/// Determine the export shape of the entry: ESM entries are scanned
/// textually for a default export; CJS entries go through the analyzer
/// child process, degrading to a default-only shape when it fails.
pub async fn analyze_module(
  analyzer: &ExportAnalyzerRef,
  wd: &Path,
  pkg: &Pkg,
  manifest: &PackageManifest,
  target: Target,
  requested_conditions: &[String],
  dev: bool,
) -> ModuleShape {
  let pkg_dir = wd.join("node_modules").join(&pkg.name);
  let mut shape = resolve_entry(manifest, &pkg_dir, &pkg.sub_module, target, requested_conditions);

  if shape.is_esm {
    if let Some(entry) = &shape.entry {
      if let Ok(source) = std::fs::read_to_string(pkg_dir.join(entry)) {
        shape.has_default_export =
          source.contains("export default") || source.contains("export { default");
      }
    }
    return shape;
  }

  let node_env = if dev { "development" } else { "production" };
  match analyzer.analyze(wd, &pkg.import_path(), node_env).await {
    Ok(analysis) => {
      shape.has_default_export = analysis.has_default_export;
      shape.named_exports = analysis.named_exports;
      shape.reexport = analysis.reexport;
    }
    Err(err) => {
      tracing::warn!(pkg = %pkg, error = %err, "export analysis failed, assuming default only");
      shape.has_default_export = true;
    }
  }
  shape
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn manifest(json: &str) -> PackageManifest {
    serde_json::from_str(json).unwrap()
  }

  #[test]
  fn prefers_exports_conditions_over_main() {
    let m = manifest(
      r#"{
        "name": "preact",
        "version": "10.13.0",
        "main": "dist/preact.js",
        "module": "dist/preact.module.js",
        "exports": {
          ".": {"import": "./dist/preact.mjs", "require": "./dist/preact.js"},
          "./hooks": {"import": "./hooks/dist/hooks.mjs"}
        }
      }"#,
    );
    let dir = Path::new("/nonexistent");

    let root = resolve_entry(&m, dir, "", Target::Es2022, &[]);
    assert_eq!(root.entry.as_deref(), Some("dist/preact.mjs"));
    assert!(root.is_esm);

    let hooks = resolve_entry(&m, dir, "hooks", Target::Es2022, &[]);
    assert_eq!(hooks.entry.as_deref(), Some("hooks/dist/hooks.mjs"));
    assert!(hooks.is_esm);
  }

  #[test]
  fn requested_conditions_take_precedence() {
    let m = manifest(
      r#"{
        "name": "react-server-lib",
        "version": "1.0.0",
        "exports": {
          ".": {
            "react-server": "./server.mjs",
            "import": "./index.mjs"
          }
        }
      }"#,
    );
    let shape = resolve_entry(
      &m,
      Path::new("/nonexistent"),
      "",
      Target::Es2022,
      &["react-server".to_string()],
    );
    assert_eq!(shape.entry.as_deref(), Some("server.mjs"));
  }

  #[test]
  fn falls_back_to_module_then_main() {
    let esm = manifest(
      r#"{"name":"a","version":"1.0.0","module":"esm/index.js","main":"cjs/index.js"}"#,
    );
    let shape = resolve_entry(&esm, Path::new("/nonexistent"), "", Target::Es2022, &[]);
    assert_eq!(shape.entry.as_deref(), Some("esm/index.js"));
    assert!(shape.is_esm);

    let cjs = manifest(r#"{"name":"b","version":"1.0.0","main":"lib/index.js"}"#);
    let shape = resolve_entry(&cjs, Path::new("/nonexistent"), "", Target::Es2022, &[]);
    assert_eq!(shape.entry.as_deref(), Some("lib/index.js"));
    assert!(!shape.is_esm);
  }

  #[test]
  fn string_browser_field_replaces_main_for_browsers() {
    let m = manifest(
      r#"{"name":"c","version":"1.0.0","main":"index.js","browser":"browser.js"}"#,
    );
    let browser = resolve_entry(&m, Path::new("/nonexistent"), "", Target::Es2022, &[]);
    assert_eq!(browser.entry.as_deref(), Some("browser.js"));
    let node = resolve_entry(&m, Path::new("/nonexistent"), "", Target::Node, &[]);
    assert_eq!(node.entry.as_deref(), Some("index.js"));
  }

  #[test]
  fn probes_sub_module_layouts_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let pkg_dir = dir.path();
    std::fs::create_dir_all(pkg_dir.join("utils")).unwrap();
    std::fs::write(pkg_dir.join("utils/index.js"), "module.exports = {}").unwrap();

    let m = manifest(r#"{"name":"d","version":"1.0.0","main":"index.js"}"#);
    let shape = resolve_entry(&m, pkg_dir, "utils", Target::Es2022, &[]);
    assert_eq!(shape.entry.as_deref(), Some("utils/index.js"));
    assert!(!shape.is_esm);
  }
}
