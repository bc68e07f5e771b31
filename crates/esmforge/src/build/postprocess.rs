//! Text-level post-processing of bundler output: external-marker
//! substitution, CJS `require()` lowering, Node global stubs, and
//! runtime-specific fixups.
//!
//! The marker string cannot appear in a legitimate identifier, and the
//! bundler only ever emits it in its own import/require positions, so a
//! byte scan is sufficient — no JS parsing here.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use esmforge_core::Target;

use super::polyfills::builtin_import_path;
use super::polyfills::tiny_shim;

/// Prefix for import specifiers the resolve plugin externalized for
/// post-build rewriting.
pub const EXTERNAL_MARKER: &str = "__ESMFORGE_EXTERNAL:";

static GLOBAL_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"__[a-zA-Z]+\$").unwrap());

/// The export shape of an externalized dependency, used to pick the right
/// lowering for `require()` call sites.
#[derive(Clone, Debug, Default)]
pub struct DepShape {
  pub is_builtin: bool,
  /// The dependency has a real ES module entry.
  pub is_esm: bool,
  pub has_default_export: bool,
  pub named_exports: Vec<String>,
}

fn is_js_ident_char(c: char) -> bool {
  c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Strip a `#!...` first line.
pub fn strip_shebang(content: &str) -> &str {
  if let Some(rest) = content.strip_prefix("#!") {
    match rest.find('\n') {
      Some(i) => &rest[i + 1..],
      None => "",
    }
  } else {
    content
  }
}

/// Replace every `"__ESMFORGE_EXTERNAL:<name>"` occurrence with either the
/// import URL (import positions) or a synthesized binding (require
/// positions), prepending whatever import statements the bindings need.
///
/// `require()` lowering has four shapes, decided per specifier from the
/// dependency's export shape: `*`, `*` wrapped with `__esModule`, `default`,
/// and `default` with a namespace fallback.
pub fn replace_external(
  content: &str,
  name: &str,
  import_path: &str,
  identifier: &str,
  shape: Option<&DepShape>,
  minified: bool,
  nullish_ok: bool,
) -> String {
  let needle = format!("\"{EXTERNAL_MARKER}{name}\"");
  if !content.contains(&needle) {
    return content.to_string();
  }
  let eol = if minified { "" } else { "\n" };
  let segments: Vec<&str> = content.split(needle.as_str()).collect();
  let last = segments.len() - 1;

  let mut out = String::with_capacity(content.len());
  let mut import_names: BTreeSet<String> = BTreeSet::new();
  let mut cjs_context = false;

  for (i, segment) in segments.iter().enumerate() {
    let mut p: &str = segment;
    if cjs_context {
      // this segment starts right after the closing paren of a require()
      p = p.strip_prefix(')').unwrap_or(p);
      let mut marked = false;
      if shape.map(|s| s.is_builtin).unwrap_or(false) {
        import_names.insert("default".to_string());
        marked = true;
      } else if name == "node-fetch" {
        import_names.insert("*".to_string());
        marked = true;
      } else if let Some(shape) = shape {
        // `require("x").member` picks a single named import when possible
        if let Some(rest) = p.strip_prefix('.') {
          let member: String = rest.chars().take_while(|c| is_js_ident_char(*c)).collect();
          if !member.is_empty() && member != "default" && shape.named_exports.contains(&member) {
            import_names.insert(member);
            marked = true;
            p = &p[1..];
          } else if !member.is_empty() {
            import_names.insert("default".to_string());
            marked = true;
          }
        }
        if !marked && shape.is_esm {
          if shape.has_default_export && shape.named_exports.len() == 1 {
            import_names.insert("default".to_string());
          } else if content.contains("__esModule") {
            import_names.insert("*?".to_string());
          } else {
            import_names.insert("*".to_string());
          }
          marked = true;
        }
        if !marked
          && shape.has_default_export
          && shape.named_exports.iter().any(|e| e == "__esModule")
        {
          import_names.insert("*".to_string());
          marked = true;
        }
      }
      if !marked {
        import_names.insert("default?".to_string());
      }
    }

    cjs_context = p.ends_with('(') && !p.ends_with("import(");
    let mut keep = p;
    if cjs_context {
      // strip the require binding the bundler emitted before the paren
      let bytes = keep.as_bytes();
      let mut shift = 0;
      let mut idx = bytes.len() as isize - 2;
      while idx >= 0 && is_js_ident_char(bytes[idx as usize] as char) {
        shift += 1;
        idx -= 1;
      }
      if shift > 0 {
        keep = &keep[..keep.len() - (shift + 1)];
      } else {
        keep = &keep[..keep.len() - 1];
      }
    }
    out.push_str(keep);
    if i < last {
      if cjs_context {
        out.push_str("__");
        out.push_str(identifier);
        out.push('$');
      } else {
        out.push('"');
        out.push_str(import_path);
        out.push('"');
      }
    }
  }

  // a confident answer supersedes its fallback twin
  if import_names.contains("default") {
    import_names.remove("default?");
  }
  if import_names.contains("*") {
    import_names.remove("*?");
  }

  if import_names.is_empty() {
    return out;
  }

  let binding = format!("__{identifier}$");
  let mut header = String::new();
  if let Some(shim) = tiny_shim(name, &binding) {
    header.push_str(&shim);
    header.push_str(eol);
  } else {
    for import_name in &import_names {
      match import_name.as_str() {
        "*" => {
          header.push_str(&format!("import * as {binding} from \"{import_path}\";{eol}"));
        }
        "*?" => {
          header.push_str(&format!("import * as _{identifier}$ from \"{import_path}\";{eol}"));
          header.push_str(&format!(
            "const {binding} = Object.assign({{__esModule:!0}},_{identifier}$);{eol}"
          ));
        }
        "default" => {
          header.push_str(&format!("import {binding} from \"{import_path}\";{eol}"));
        }
        "default?" => {
          header.push_str(&format!("import * as _{identifier}$ from \"{import_path}\";{eol}"));
          if nullish_ok {
            header.push_str(&format!(
              "const {binding} = _{identifier}$.default??_{identifier}$;{eol}"
            ));
          } else {
            header.push_str(&format!(
              "const {binding} = _{identifier}$.default!==void 0?_{identifier}$.default:_{identifier}$;{eol}"
            ));
          }
        }
        named => {
          header.push_str(&format!(
            "import {{ {named} as {binding}{named} }} from \"{import_path}\";{eol}"
          ));
        }
      }
    }
  }
  header.push_str(&out);
  header
}

/// Prepend stub imports for Node globals that survived bundling:
/// `process`, `Buffer`, `global`, `setImmediate`, `require.resolve`.
pub fn inject_node_globals(
  content: &str,
  target: Target,
  base_path: &str,
  build_version: u32,
  deno_std_version: &str,
  minified: bool,
) -> String {
  if target == Target::Node {
    return content.to_string();
  }
  let eol = if minified { "" } else { "\n" };
  let idents: BTreeSet<&str> = GLOBAL_IDENT
    .find_iter(content)
    .map(|m| m.as_str())
    .collect();
  let mut header = String::new();

  if idents.contains("__Process$") {
    match target {
      Target::DenoNext => {
        header.push_str(&format!("import __Process$ from \"node:process\";{eol}"));
      }
      Target::Deno => {
        header.push_str(&format!(
          "import __Process$ from \"https://deno.land/std@{deno_std_version}/node/process.ts\";{eol}"
        ));
      }
      _ => {
        header.push_str(&format!(
          "import __Process$ from \"{base_path}/v{build_version}/node_process.js\";{eol}"
        ));
      }
    }
  }
  if idents.contains("__Buffer$") {
    match target {
      Target::DenoNext => {
        header.push_str(&format!("import {{ Buffer as __Buffer$ }} from \"node:buffer\";{eol}"));
      }
      Target::Deno => {
        header.push_str(&format!(
          "import {{ Buffer as __Buffer$ }} from \"https://deno.land/std@{deno_std_version}/node/buffer.ts\";{eol}"
        ));
      }
      _ => {
        let url = builtin_import_path("buffer", target, base_path, build_version, deno_std_version)
          .unwrap_or_else(|| format!("{base_path}/v{build_version}/node_buffer.js"));
        header.push_str(&format!("import {{ Buffer as __Buffer$ }} from \"{url}\";{eol}"));
      }
    }
  }
  if idents.contains("__global$") {
    header.push_str(&format!(
      "var __global$ = globalThis || (typeof window !== \"undefined\" ? window : self);{eol}"
    ));
  }
  if idents.contains("__setImmediate$") {
    header.push_str(&format!(
      "var __setImmediate$ = (cb, ...args) => setTimeout(cb, 0, ...args);{eol}"
    ));
  }
  if idents.contains("__rResolve$") {
    header.push_str(&format!("var __rResolve$ = p => p;{eol}"));
  }

  if header.is_empty() {
    content.to_string()
  } else {
    format!("{header}{content}")
  }
}

/// Deno exposes `window`, so packages sniffing for a browser via
/// `typeof window` misfire there; rewrite the check to `document`.
pub fn replace_window_checks(content: &str, dev: bool) -> String {
  if dev {
    content.replace(
      "typeof window !== \"undefined\"",
      "typeof document !== \"undefined\"",
    )
  } else {
    content.replace("typeof window<\"u\"", "typeof document<\"u\"")
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  const URL: &str = "/v2/scheduler@0.23.0/es2022/scheduler.mjs";

  fn marker(name: &str) -> String {
    format!("\"{EXTERNAL_MARKER}{name}\"")
  }

  #[test]
  fn strips_shebangs() {
    assert_eq!(strip_shebang("#!/usr/bin/env node\nconsole.log(1);"), "console.log(1);");
    assert_eq!(strip_shebang("console.log(1);"), "console.log(1);");
  }

  #[test]
  fn rewrites_import_positions_to_urls() {
    let content = format!("import {{ unstable_now }} from {};", marker("scheduler"));
    let out = replace_external(&content, "scheduler", URL, "1", None, false, true);
    assert_eq!(out, format!("import {{ unstable_now }} from \"{URL}\";"));
  }

  #[test]
  fn lowers_require_call_with_default_fallback() {
    // esbuild lowers `require("scheduler")` to `<ident>("__MARKER")`
    let content = format!("var S = __require({});", marker("scheduler"));
    let out = replace_external(&content, "scheduler", URL, "1", None, false, true);
    assert_eq!(
      out,
      format!(
        "import * as _1$ from \"{URL}\";\nconst __1$ = _1$.default??_1$;\nvar S = __1$;"
      )
    );
  }

  #[test]
  fn legacy_targets_avoid_nullish_coalescing() {
    let content = format!("var S = __require({});", marker("scheduler"));
    let out = replace_external(&content, "scheduler", URL, "1", None, false, false);
    assert!(out.contains("_1$.default!==void 0?_1$.default:_1$"));
  }

  #[test]
  fn builtins_get_a_default_import() {
    let content = format!("var fs = __require({});", marker("fs"));
    let shape = DepShape {
      is_builtin: true,
      ..Default::default()
    };
    let out = replace_external(&content, "fs", "node:fs", "2", Some(&shape), false, true);
    assert_eq!(out, "import __2$ from \"node:fs\";\nvar fs = __2$;");
  }

  #[test]
  fn member_access_becomes_a_named_import() {
    let content = format!("var P = __require({}).Parser;", marker("htmlparser"));
    let shape = DepShape {
      named_exports: vec!["Parser".to_string()],
      ..Default::default()
    };
    let out = replace_external(&content, "htmlparser", URL, "a", Some(&shape), false, true);
    assert_eq!(
      out,
      format!("import {{ Parser as __a$Parser }} from \"{URL}\";\nvar P = __a$Parser;")
    );
  }

  #[test]
  fn esm_dep_with_esmodule_flag_gets_wrapped_namespace() {
    let content = format!(
      "var m = __require({});m.__esModule;",
      marker("scheduler")
    );
    let shape = DepShape {
      is_esm: true,
      has_default_export: false,
      named_exports: vec!["a".to_string(), "b".to_string()],
      ..Default::default()
    };
    let out = replace_external(&content, "scheduler", URL, "1", Some(&shape), false, true);
    assert!(out.starts_with(&format!("import * as _1$ from \"{URL}\";")));
    assert!(out.contains("const __1$ = Object.assign({__esModule:!0},_1$);"));
  }

  #[test]
  fn dynamic_import_positions_are_not_require_sites() {
    let content = format!("const p = import({});", marker("scheduler"));
    let out = replace_external(&content, "scheduler", URL, "1", None, false, true);
    assert_eq!(out, format!("const p = import(\"{URL}\");"));
  }

  #[test]
  fn tiny_shims_replace_the_import_entirely() {
    let content = format!("var assign = __require({});", marker("object-assign"));
    let out = replace_external(&content, "object-assign", "/unused", "3", None, false, true);
    assert_eq!(out, "const __3$ = Object.assign;\nvar assign = __3$;");
  }

  #[test]
  fn injects_only_the_globals_present() {
    let content = "console.log(__Process$.env, __Buffer$.from([]));";
    let out = inject_node_globals(content, Target::Es2022, "", 2, "0.177.0", false);
    assert!(out.contains("import __Process$ from \"/v2/node_process.js\";"));
    assert!(out.contains("import { Buffer as __Buffer$ } from \"/v2/buffer@6.0.3/es2022/buffer.bundle.mjs\";"));
    assert!(!out.contains("__global$"));

    let untouched = inject_node_globals("console.log(1);", Target::Es2022, "", 2, "0.177.0", false);
    assert_eq!(untouched, "console.log(1);");
  }

  #[test]
  fn node_target_needs_no_stubs() {
    let content = "console.log(__Process$.env);";
    assert_eq!(
      inject_node_globals(content, Target::Node, "", 2, "0.177.0", false),
      content
    );
  }

  #[test]
  fn denonext_uses_node_builtins_for_stubs() {
    let content = "__Process$;__Buffer$;__setImmediate$;";
    let out = inject_node_globals(content, Target::DenoNext, "", 2, "0.177.0", false);
    assert!(out.contains("import __Process$ from \"node:process\";"));
    assert!(out.contains("import { Buffer as __Buffer$ } from \"node:buffer\";"));
    assert!(out.contains("var __setImmediate$"));
  }

  #[test]
  fn window_checks_become_document_checks() {
    assert_eq!(
      replace_window_checks("if (typeof window !== \"undefined\") {}", true),
      "if (typeof document !== \"undefined\") {}"
    );
    assert_eq!(
      replace_window_checks("typeof window<\"u\"&&go()", false),
      "typeof document<\"u\"&&go()"
    );
  }
}
