//! The resolve/load plugin the build job hands to the bundler: every import
//! encountered during bundling is classified here and either bundled,
//! substituted, or externalized with a marker for post-build rewriting.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use indexmap::IndexSet;
use parking_lot::Mutex;
use parking_lot::RwLock;

use esmforge_core::BuildArgs;
use esmforge_core::BundleMode;
use esmforge_core::Pkg;
use esmforge_core::Target;
use esmforge_npm::PackageManifest;
use esmforge_npm::SideEffects;

use super::polyfills::is_native_node_package;
use super::polyfills::is_node_builtin;
use super::postprocess::EXTERNAL_MARKER;
use crate::bundler::BundlePlugin;
use crate::bundler::Loader;
use crate::bundler::OnLoadArgs;
use crate::bundler::OnLoadResult;
use crate::bundler::OnResolveArgs;
use crate::bundler::OnResolveResult;

pub const NS_WASM: &str = "wasm";
pub const NS_BROWSER_EXCLUDE: &str = "browser-exclude";

/// Build-wide inputs the classifier needs, fixed for one job.
pub struct ResolveContext {
  pub pkg: Pkg,
  pub manifest: PackageManifest,
  pub wd: PathBuf,
  pub args: BuildArgs,
  pub bundle_mode: BundleMode,
  pub target: Target,
  pub base_path: String,
  pub build_version: u32,
}

pub struct ResolvePlugin {
  ctx: ResolveContext,
  /// Specifiers the rebuild-on-miss loop marked external.
  implicit_external: RwLock<HashSet<String>>,
  /// Browser-excluded module path → named exports to synthesize.
  browser_exclude: RwLock<BTreeMap<String, BTreeSet<String>>>,
  /// Externalized specifiers, in first-seen order, for post-processing.
  external_deps: Mutex<IndexSet<String>>,
}

impl ResolvePlugin {
  pub fn new(ctx: ResolveContext) -> Self {
    Self {
      ctx,
      implicit_external: RwLock::new(HashSet::new()),
      browser_exclude: RwLock::new(BTreeMap::new()),
      external_deps: Mutex::new(IndexSet::new()),
    }
  }

  pub fn external_deps(&self) -> Vec<String> {
    self.external_deps.lock().iter().cloned().collect()
  }

  pub fn add_implicit_external(&self, specifier: &str) -> bool {
    self.implicit_external.write().insert(specifier.to_string())
  }

  pub fn add_browser_exclude_export(&self, path: &str, export: &str) -> bool {
    self
      .browser_exclude
      .write()
      .entry(path.to_string())
      .or_default()
      .insert(export.to_string())
  }

  fn package_dir(&self) -> PathBuf {
    self.ctx.wd.join("node_modules").join(&self.ctx.pkg.name)
  }

  fn error_js(&self, kind: &str, name: &str) -> String {
    format!(
      "{}/error.js?type={kind}&name={name}&importer={}",
      self.ctx.base_path, self.ctx.pkg.name
    )
  }

  fn mark_external(&self, specifier: &str, side_effects: Option<bool>) -> OnResolveResult {
    self.external_deps.lock().insert(specifier.to_string());
    OnResolveResult {
      path: format!("{EXTERNAL_MARKER}{specifier}"),
      external: true,
      namespace: None,
      side_effects,
    }
  }

  /// `./relative` in package sources, expressed as a `./`-rooted path
  /// relative to the package directory.
  fn package_relative_spec(&self, resolve_dir: &Path, specifier: &str) -> String {
    let full = normalize_path(&resolve_dir.join(specifier));
    match full.strip_prefix(self.package_dir()) {
      Ok(rel) => format!("./{}", rel.to_string_lossy().replace('\\', "/")),
      Err(_) => specifier.to_string(),
    }
  }

  /// Match a `./`-rooted path against the manifest's sub-path exports,
  /// yielding the public export name it belongs to.
  fn match_defined_export(&self, spec: &str) -> Option<String> {
    let exports = self.ctx.manifest.exports.as_ref()?.as_object()?;
    for (export, paths) in exports {
      if export == "." {
        continue;
      }
      let mut candidates: Vec<&str> = Vec::new();
      match paths {
        serde_json::Value::String(s) => candidates.push(s),
        serde_json::Value::Object(conditions) => {
          candidates.extend(conditions.values().filter_map(|v| v.as_str()));
        }
        _ => {}
      }
      for candidate in candidates {
        if candidate.is_empty() {
          continue;
        }
        let direct = spec == candidate
          || format!("{spec}.js") == candidate
          || format!("{spec}.mjs") == candidate;
        if direct {
          return Some(export.clone());
        }
        let parts: Vec<&str> = candidate.split('*').collect();
        if parts.len() == 2 {
          let (prefix, suffix) = (parts[0], parts[1]);
          let tail_matches = |s: &str| s.starts_with(prefix) && s.ends_with(suffix);
          if tail_matches(spec)
            || tail_matches(&format!("{spec}.js"))
            || tail_matches(&format!("{spec}.mjs"))
          {
            let matched = spec
              .strip_prefix(prefix)
              .map(|rest| {
                rest
                  .strip_suffix(suffix)
                  .or_else(|| format!("{rest}.js").strip_suffix(suffix).map(|_| rest))
                  .unwrap_or(rest)
              })
              .unwrap_or(spec);
            let mut matched = matched.to_string();
            for ext in [".js", ".mjs"] {
              if let Some(stripped) = matched.strip_suffix(ext) {
                matched = stripped.to_string();
              }
            }
            return Some(export.replace('*', &matched));
          }
        }
      }
    }
    None
  }

  fn dependency_side_effects(&self, specifier: &str) -> Option<bool> {
    let manifest_path = self
      .ctx
      .wd
      .join("node_modules")
      .join(specifier)
      .join("package.json");
    let raw = std::fs::read(manifest_path).ok()?;
    let manifest: PackageManifest = serde_json::from_slice(&raw).ok()?;
    match manifest.side_effects {
      SideEffects::Bool(false) => Some(false),
      _ => None,
    }
  }
}

#[async_trait]
impl BundlePlugin for ResolvePlugin {
  async fn on_resolve(&self, args: &OnResolveArgs) -> anyhow::Result<Option<OnResolveResult>> {
    let ctx = &self.ctx;

    if let Some(file) = args.path.strip_prefix("file:") {
      return Ok(Some(OnResolveResult::external(
        self.error_js("unsupported-file-dependency", file),
      )));
    }

    if args.path.starts_with("data:")
      || args.path.starts_with("https:")
      || args.path.starts_with("http:")
    {
      return Ok(Some(OnResolveResult::external(args.path.clone())));
    }

    if args.path.ends_with(".json") {
      let json = normalize_path(&args.resolve_dir.join(&args.path));
      if json.is_file() {
        return Ok(Some(OnResolveResult {
          path: json.to_string_lossy().into_owned(),
          ..Default::default()
        }));
      }
    }

    if args.path.ends_with(".wasm") {
      let wasm = normalize_path(&args.resolve_dir.join(&args.path));
      if wasm.is_file() {
        return Ok(Some(OnResolveResult::in_namespace(
          wasm.to_string_lossy(),
          NS_WASM,
        )));
      }
    }

    if is_native_node_package(&args.path) {
      if ctx.target.is_deno() {
        let (pkg_name, sub_path) = split_pkg_path(&args.path);
        let version = if pkg_name == ctx.pkg.name {
          Some(ctx.pkg.version.as_str())
        } else {
          ctx.manifest.dependency_version(pkg_name)
        };
        let spec = match version {
          Some(version) => format!("npm:{pkg_name}@{version}"),
          None => format!("npm:{pkg_name}"),
        };
        let spec = if sub_path.is_empty() {
          spec
        } else {
          format!("{spec}/{sub_path}")
        };
        return Ok(Some(OnResolveResult::external(spec)));
      }
      return Ok(Some(OnResolveResult::external(
        self.error_js("unsupported-npm-package", &args.path),
      )));
    }

    // `?external-require` leaves require() sites of real modules alone
    if ctx.args.external_require && args.kind.is_require() && ctx.manifest.module.is_some() {
      return Ok(Some(OnResolveResult::external(args.path.clone())));
    }

    let mut specifier = args
      .path
      .trim_end_matches('/')
      .trim_start_matches("node:")
      .trim_start_matches("npm:")
      .to_string();

    // `browser` field substitutions (browser builds only)
    let browser_map = ctx.manifest.browser_map();
    if !browser_map.is_empty() && !ctx.target.is_server() {
      let lookup = if is_relative_specifier(&specifier) {
        self.package_relative_spec(&args.resolve_dir, &specifier)
      } else {
        specifier.clone()
      };
      if let Some(replacement) = browser_map.get(&lookup) {
        match replacement {
          None => {
            return Ok(Some(OnResolveResult::in_namespace(
              args.path.clone(),
              NS_BROWSER_EXCLUDE,
            )));
          }
          Some(to) if to.starts_with("./") => {
            specifier = format!("{}/{}", ctx.pkg.name, to.trim_start_matches("./"));
          }
          Some(to) => {
            specifier = to.clone();
          }
        }
      }
    }

    if let Some(to) = ctx.args.alias.get(&specifier) {
      specifier = to.clone();
    }

    // bundle-everything mode inlines all but peers, externals and builtins
    if ctx.bundle_mode == BundleMode::All
      && !self.implicit_external.read().contains(&specifier)
      && !ctx.args.is_external(&specifier)
    {
      let (pkg_name, _) = split_pkg_path(&specifier);
      if !is_node_builtin(&specifier)
        && !is_node_builtin(pkg_name)
        && !ctx.manifest.peer_dependencies.contains_key(pkg_name)
      {
        return Ok(None);
      }
    }

    // dependencies declared as git URLs route to the code-host origin
    if let Some(version) = ctx.manifest.dependencies.get(&args.path) {
      if version.starts_with("git+ssh://")
        || version.starts_with("git+https://")
        || version.starts_with("git://")
      {
        if let Ok(git_url) = url::Url::parse(version) {
          if git_url.host_str() == Some("github.com") {
            let repo = git_url.path().trim_start_matches('/').trim_end_matches(".git");
            let mut path = format!("{}/v{}/gh/{repo}", ctx.base_path, ctx.build_version);
            if let Some(fragment) = git_url.fragment() {
              path.push('@');
              path.push_str(fragment);
            }
            return Ok(Some(OnResolveResult::external(path)));
          }
        }
      }
    }

    // the `imports` field maps private specifiers to local files
    if let Some(value) = ctx.manifest.imports.get(&args.path) {
      let conditions: &[&str] = if ctx.target.is_server() {
        &["node", "default", "browser"]
      } else {
        &["browser", "default", "node"]
      };
      let resolved = match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => conditions
          .iter()
          .find_map(|c| map.get(*c).and_then(|v| v.as_str()).map(str::to_string)),
        _ => None,
      };
      if let Some(local) = resolved {
        return Ok(Some(OnResolveResult {
          path: self.package_dir().join(local).to_string_lossy().into_owned(),
          ..Default::default()
        }));
      }
    }

    // a sub-entry importing its own package's main shares runtime identity
    // with the main artefact only if that import stays external
    if !ctx.pkg.sub_module.is_empty() && specifier == ctx.pkg.name {
      return Ok(Some(self.mark_external(&specifier, None)));
    }

    // the entry itself bundles
    if specifier == ctx.pkg.import_path()
      || Some(specifier.as_str()) == ctx.manifest.main.as_deref()
      || Some(specifier.as_str()) == ctx.manifest.module.as_deref()
    {
      return Ok(None);
    }

    if is_relative_specifier(&specifier) {
      let spec = self.package_relative_spec(&args.resolve_dir, &specifier);

      // `{name}/{name}.js` is the classic self-file layout
      if spec == format!("./{}.js", ctx.pkg.name) {
        return Ok(None);
      }

      // sub-path exports split into their own artefacts
      if !specifier.ends_with(".js") && !specifier.ends_with(".mjs") && !specifier.ends_with(".json")
      {
        if let Some(export) = self.match_defined_export(&spec) {
          let export_path = join_pkg_path(&ctx.pkg.name, &export);
          if export_path == ctx.pkg.import_path() {
            return Ok(None);
          }
          return Ok(Some(self.mark_external(&export_path, None)));
        }
      }

      if ctx.bundle_mode == BundleMode::None {
        let full = normalize_path(&args.resolve_dir.join(&specifier));
        let external = match full.strip_prefix(ctx.wd.join("node_modules")) {
          Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
          Err(_) => specifier.clone(),
        };
        return Ok(Some(self.mark_external(&external, None)));
      }

      if ctx.pkg.sub_module.is_empty() {
        return Ok(None);
      }
      if ctx.manifest.exports.is_some() {
        return Ok(None);
      }

      // a sub-entry without export definitions externalizes its local deps
      let full = normalize_path(&args.resolve_dir.join(&specifier));
      let external = match full.strip_prefix(ctx.wd.join("node_modules")) {
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => specifier.clone(),
      };
      return Ok(Some(self.mark_external(&external, None)));
    }

    let side_effects = self.dependency_side_effects(&specifier);
    Ok(Some(self.mark_external(&specifier, side_effects)))
  }

  async fn on_load(&self, args: &OnLoadArgs) -> anyhow::Result<Option<OnLoadResult>> {
    match args.namespace.as_str() {
      NS_WASM => {
        let wasm = std::fs::read(&args.path)?;
        let encoded = BASE64_STANDARD.encode(wasm);
        Ok(Some(OnLoadResult {
          contents: format!(
            "export default new WebAssembly.Module(Uint8Array.from(atob('{encoded}'), c => c.charCodeAt(0)))"
          ),
          loader: Loader::Js,
        }))
      }
      NS_BROWSER_EXCLUDE => {
        let mut contents = String::from("export default {};");
        if let Some(exports) = self.browser_exclude.read().get(&args.path) {
          for name in exports {
            contents.push_str(&format!("export const {name} = {{}};"));
          }
        }
        Ok(Some(OnLoadResult {
          contents,
          loader: Loader::Js,
        }))
      }
      _ => Ok(None),
    }
  }
}

fn is_relative_specifier(specifier: &str) -> bool {
  specifier.starts_with("./") || specifier.starts_with("../") || specifier == "." || specifier == ".."
}

/// Split a specifier into package name and sub-path, scope-aware.
pub fn split_pkg_path(specifier: &str) -> (&str, &str) {
  let mut segments = specifier.splitn(
    if specifier.starts_with('@') { 3 } else { 2 },
    '/',
  );
  match specifier.strip_prefix('@') {
    Some(_) => {
      let scope = segments.next().unwrap_or_default();
      match segments.next() {
        Some(name) => {
          let head_len = scope.len() + 1 + name.len();
          let rest = specifier
            .get(head_len + 1..)
            .unwrap_or("");
          (&specifier[..head_len], rest)
        }
        None => (specifier, ""),
      }
    }
    None => {
      let name = segments.next().unwrap_or(specifier);
      let rest = segments.next().unwrap_or("");
      (name, rest)
    }
  }
}

fn join_pkg_path(name: &str, sub: &str) -> String {
  let sub = sub.trim_start_matches("./").trim_start_matches('/');
  if sub.is_empty() {
    name.to_string()
  } else {
    format!("{name}/{sub}")
  }
}

/// Lexically normalize `.` and `..` components.
pub fn normalize_path(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        out.pop();
      }
      other => out.push(other),
    }
  }
  out
}
