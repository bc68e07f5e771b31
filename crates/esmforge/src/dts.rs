//! The types artefact builder: mirrors a package's `.d.ts` tree into the
//! types partition, rewriting every reference directive and import
//! specifier into a CDN URL.
//!
//! This is deliberately not a TypeScript parser — a lexer that understands
//! string literals and the few `/// <reference>` directives is enough, and
//! keeps the rewriter oblivious to language versions.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Captures;
use regex::Regex;

use esmforge_core::BuildIdentity;
use esmforge_core::ForgeError;
use esmforge_npm::PackageManifest;
use esmforge_npm::PackageRegistryRef;
use esmforge_storage::FileStoreRef;

use crate::build::plugin::normalize_path;
use crate::build::plugin::split_pkg_path;
use crate::build::polyfills::is_node_builtin;

/// Placeholder substituted with the live CDN origin at serve time, so the
/// stored types are origin-independent.
pub const ORIGIN_PLACEHOLDER: &str = "__ESMFORGE_ORIGIN__";

static RE_REFERENCE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r#"///\s*<reference\s+(?:path|types)\s*=\s*"([^"]+)""#).unwrap());
static RE_FROM: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\bfrom\s*["']([^"']+)["']"#).unwrap());
static RE_DYNAMIC_IMPORT: Lazy<Regex> =
  Lazy::new(|| Regex::new(r#"\bimport\s*\(\s*["']([^"']+)["']\s*\)"#).unwrap());
static RE_BARE_IMPORT: Lazy<Regex> =
  Lazy::new(|| Regex::new(r#"\bimport\s+["']([^"']+)["']"#).unwrap());
static RE_REQUIRE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r#"\brequire\s*\(\s*["']([^"']+)["']\s*\)"#).unwrap());

pub struct DtsContext {
  pub files: FileStoreRef,
  pub registry: PackageRegistryRef,
  pub base_path: String,
  pub build_version: u32,
  pub identity: BuildIdentity,
  pub manifest: PackageManifest,
  pub wd: PathBuf,
}

/// Collect every import/reference specifier in a `.d.ts` source.
pub fn collect_specifiers(source: &str) -> BTreeSet<String> {
  let mut specifiers = BTreeSet::new();
  for re in [&RE_REFERENCE, &RE_FROM, &RE_DYNAMIC_IMPORT, &RE_BARE_IMPORT, &RE_REQUIRE] {
    for caps in re.captures_iter(source) {
      if let Some(m) = caps.get(1) {
        specifiers.insert(m.as_str().to_string());
      }
    }
  }
  specifiers
}

/// Replace every collected specifier according to `map`, leaving unmapped
/// ones untouched.
pub fn rewrite_specifiers(source: &str, map: &BTreeMap<String, String>) -> String {
  let mut out = source.to_string();
  for re in [&RE_REFERENCE, &RE_FROM, &RE_DYNAMIC_IMPORT, &RE_BARE_IMPORT, &RE_REQUIRE] {
    out = re
      .replace_all(&out, |caps: &Captures| {
        let whole = caps.get(0).unwrap();
        let spec = caps.get(1).unwrap();
        match map.get(spec.as_str()) {
          Some(replacement) => {
            let start = spec.start() - whole.start();
            let end = spec.end() - whole.start();
            let text = whole.as_str();
            format!("{}{}{}", &text[..start], replacement, &text[end..])
          }
          None => whole.as_str().to_string(),
        }
      })
      .into_owned();
  }
  out
}

fn ensure_dts_ext(path: &str) -> String {
  if path.ends_with(".d.ts") || path.ends_with(".d.mts") {
    return path.to_string();
  }
  for ext in [".mjs", ".cjs", ".js", ".ts"] {
    if let Some(stripped) = path.strip_suffix(ext) {
      return format!("{stripped}.d.ts");
    }
  }
  format!("{path}.d.ts")
}

fn is_relative(spec: &str) -> bool {
  spec.starts_with("./") || spec.starts_with("../") || spec == "." || spec == ".."
}

/// Mirror the dts tree rooted at `entry` into the types partition,
/// returning the number of files written.
pub async fn transform_dts(ctx: DtsContext, entry: &str) -> Result<usize, ForgeError> {
  let pkg_dir = ctx.wd.join("node_modules").join(&ctx.identity.pkg.name);
  let types_prefix = ctx.identity.types_prefix();

  let mut queue: VecDeque<String> = VecDeque::new();
  let mut visited: HashSet<String> = HashSet::new();
  let entry = ensure_dts_ext(entry.trim_start_matches("./"));
  queue.push_back(entry);
  let mut written = 0usize;

  while let Some(rel) = queue.pop_front() {
    if !visited.insert(rel.clone()) {
      continue;
    }
    let source = match std::fs::read_to_string(pkg_dir.join(&rel)) {
      Ok(source) => source,
      Err(err) => {
        tracing::warn!(file = %rel, "dts read failed: {err}");
        continue;
      }
    };

    let mut map: BTreeMap<String, String> = BTreeMap::new();
    let current_dir = Path::new(&rel).parent().unwrap_or_else(|| Path::new(""));
    for spec in collect_specifiers(&source) {
      if is_relative(&spec) {
        let (replacement, target) = resolve_relative(&pkg_dir, current_dir, &spec);
        if let Some(target) = target {
          queue.push_back(target);
        }
        if replacement != spec {
          map.insert(spec, replacement);
        }
        continue;
      }
      if spec.starts_with("node:") || is_node_builtin(&spec) {
        continue;
      }
      if let Some(url) = resolve_dependency_types(&ctx, &spec).await {
        map.insert(spec, url);
      }
    }

    let rewritten = rewrite_specifiers(&source, &map);
    ctx
      .files
      .write(&format!("{types_prefix}/{rel}"), rewritten.as_bytes())
      .map_err(|err| ForgeError::internal(err.to_string()))?;
    written += 1;
  }
  Ok(written)
}

/// A relative specifier maps onto the mirrored tree; prefer the flat
/// `x.d.ts` form, falling back to `x/index.d.ts` when only that exists.
fn resolve_relative(pkg_dir: &Path, current_dir: &Path, spec: &str) -> (String, Option<String>) {
  let flat = ensure_dts_ext(spec);
  let flat_rel = normalize_path(&current_dir.join(flat.trim_start_matches("./")))
    .to_string_lossy()
    .replace('\\', "/");
  if pkg_dir.join(&flat_rel).is_file() {
    return (flat, Some(flat_rel));
  }
  let index = format!("{}/index.d.ts", spec.trim_end_matches('/'));
  let index_rel = normalize_path(&current_dir.join(index.trim_start_matches("./")))
    .to_string_lossy()
    .replace('\\', "/");
  if pkg_dir.join(&index_rel).is_file() {
    return (index, Some(index_rel));
  }
  (flat, Some(flat_rel))
}

/// A bare specifier points at another package's published types.
async fn resolve_dependency_types(ctx: &DtsContext, spec: &str) -> Option<String> {
  let (name, sub_path) = split_pkg_path(spec);
  let version_spec = if name == ctx.identity.pkg.name {
    ctx.identity.pkg.version.clone()
  } else {
    ctx
      .manifest
      .dependency_version(name)
      .unwrap_or("latest")
      .to_string()
  };
  let resolved = match ctx.registry.resolve(name, &version_spec).await {
    Ok(resolved) => resolved,
    Err(err) => {
      tracing::warn!(dependency = name, "types resolution failed: {err}");
      return None;
    }
  };
  let file = if sub_path.is_empty() {
    resolved
      .types_entry()
      .map(|t| ensure_dts_ext(t.trim_start_matches("./")))
      .unwrap_or_else(|| "index.d.ts".to_string())
  } else {
    ensure_dts_ext(sub_path)
  };
  Some(format!(
    "{ORIGIN_PLACEHOLDER}{}/v{}/{name}@{}/{file}",
    ctx.base_path, ctx.build_version, resolved.version
  ))
}
