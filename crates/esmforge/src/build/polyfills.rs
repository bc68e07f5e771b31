//! Constant tables driving import classification: Node builtins, browser
//! polyfills, runtime-specific support sets, and tiny inline shims.

use esmforge_core::Target;

/// Node's builtin module set, including the sub-path builtins.
pub const NODE_BUILTINS: &[&str] = &[
  "assert",
  "assert/strict",
  "async_hooks",
  "buffer",
  "child_process",
  "cluster",
  "console",
  "constants",
  "crypto",
  "dgram",
  "diagnostics_channel",
  "dns",
  "dns/promises",
  "domain",
  "events",
  "fs",
  "fs/promises",
  "http",
  "http2",
  "https",
  "inspector",
  "module",
  "net",
  "os",
  "path",
  "path/posix",
  "path/win32",
  "perf_hooks",
  "process",
  "punycode",
  "querystring",
  "readline",
  "repl",
  "stream",
  "stream/consumers",
  "stream/promises",
  "stream/web",
  "string_decoder",
  "sys",
  "timers",
  "timers/promises",
  "tls",
  "trace_events",
  "tty",
  "url",
  "util",
  "util/types",
  "v8",
  "vm",
  "wasi",
  "worker_threads",
  "zlib",
];

pub fn is_node_builtin(specifier: &str) -> bool {
  NODE_BUILTINS.contains(&specifier)
}

/// Builtins the `denonext` runtime does not ship under `node:`.
pub const DENONEXT_UNSUPPORTED: &[&str] = &[
  "inspector",
  "repl",
  "trace_events",
  "v8",
  "vm",
  "wasi",
];

pub fn denonext_supports(name: &str) -> bool {
  !DENONEXT_UNSUPPORTED.contains(&name)
}

/// Browser polyfill packages for Node builtins, pinned so identical inputs
/// keep producing identical artefacts.
pub const POLYFILLED_BUILTINS: &[(&str, &str)] = &[
  ("assert", "assert@2.1.0"),
  ("buffer", "buffer@6.0.3"),
  ("constants", "constants-browserify@1.0.0"),
  ("crypto", "crypto-browserify@3.12.0"),
  ("domain", "domain-browser@4.22.0"),
  ("events", "events@3.3.0"),
  ("http", "stream-http@3.2.0"),
  ("https", "https-browserify@1.0.0"),
  ("os", "os-browserify@0.3.0"),
  ("path", "path-browserify@1.0.1"),
  ("process", "process@0.11.10"),
  ("punycode", "punycode@2.3.1"),
  ("querystring", "querystring-es3@0.2.1"),
  ("stream", "stream-browserify@3.0.0"),
  ("string_decoder", "string_decoder@1.3.0"),
  ("timers", "timers-browserify@2.0.12"),
  ("tty", "tty-browserify@0.0.1"),
  ("url", "url@0.11.3"),
  ("util", "util@0.12.5"),
  ("vm", "vm-browserify@1.1.2"),
  ("zlib", "browserify-zlib@0.2.0"),
];

pub fn polyfill_package(name: &str) -> Option<&'static str> {
  POLYFILLED_BUILTINS
    .iter()
    .find(|(builtin, _)| *builtin == name)
    .map(|(_, pkg)| *pkg)
}

/// Packages with native bindings the browser can never run.
pub const NATIVE_NODE_PACKAGES: &[&str] = &[
  "bufferutil",
  "canvas",
  "fsevents",
  "node-pty",
  "re2",
  "sharp",
  "utf-8-validate",
];

pub fn is_native_node_package(specifier: &str) -> bool {
  NATIVE_NODE_PACKAGES
    .iter()
    .any(|name| specifier == *name || specifier.starts_with(&format!("{name}/")))
}

/// Packages that are nothing but a main stylesheet; bare requests redirect
/// to it.
pub const CSS_PACKAGES: &[(&str, &str)] = &[
  ("modern-normalize", "modern-normalize.css"),
  ("normalize.css", "normalize.css"),
  ("reset-css", "reset.css"),
];

pub fn css_package_entry(name: &str) -> Option<&'static str> {
  CSS_PACKAGES
    .iter()
    .find(|(pkg, _)| *pkg == name)
    .map(|(_, css)| *css)
}

/// One-liner replacements for packages whose whole point predates a modern
/// platform API; `{id}` is the substituted binding identifier.
pub const TINY_SHIMS: &[(&str, &str)] = &[
  ("abort-controller", "const {id} = globalThis.AbortController;{id}.default = globalThis.AbortController;"),
  ("array-flatten", "const {id} = (a) => a.flat(Infinity);"),
  ("array-includes", "const {id} = (a, p, i) => a.includes(p, i);"),
  ("es6-symbol", "const {id} = Symbol;"),
  ("has", "const {id} = Object.hasOwn;"),
  ("has-symbols", "const {id} = () => !0;"),
  ("object-assign", "const {id} = Object.assign;"),
];

pub fn tiny_shim(name: &str, identifier: &str) -> Option<String> {
  TINY_SHIMS
    .iter()
    .find(|(pkg, _)| *pkg == name)
    .map(|(_, template)| template.replace("{id}", identifier))
}

/// Embedded stub modules served under `/vN/node_<name>.js` for builtins that
/// need only a few lines in the browser.
pub const EMBEDDED_POLYFILLS: &[(&str, &str)] = &[
  (
    "node_process",
    "const env = {};\n\
     const process = {\n\
       env,\n\
       argv: [],\n\
       platform: \"browser\",\n\
       versions: { node: \"0.0.0\" },\n\
       cwd: () => \"/\",\n\
       nextTick: (fn, ...args) => queueMicrotask(() => fn(...args)),\n\
       on: () => process,\n\
       once: () => process,\n\
       off: () => process,\n\
       emit: () => false,\n\
     };\n\
     export default process;\n",
  ),
  (
    "node_fetch",
    "const fetchImpl = globalThis.fetch.bind(globalThis);\n\
     export const Headers = globalThis.Headers;\n\
     export const Request = globalThis.Request;\n\
     export const Response = globalThis.Response;\n\
     export default fetchImpl;\n",
  ),
];

pub fn embedded_polyfill(name: &str) -> Option<&'static str> {
  EMBEDDED_POLYFILLS
    .iter()
    .find(|(polyfill, _)| *polyfill == name)
    .map(|(_, source)| *source)
}

/// The import path a Node builtin resolves to for a target, or `None` when
/// the builtin is unsupported there (the caller emits the error module URL).
pub fn builtin_import_path(
  name: &str,
  target: Target,
  base_path: &str,
  build_version: u32,
  deno_std_version: &str,
) -> Option<String> {
  let bare = name.split('/').next().unwrap_or(name);
  match target {
    Target::Node => Some(format!("node:{name}")),
    Target::DenoNext if denonext_supports(bare) => Some(format!("node:{name}")),
    Target::DenoNext => None,
    Target::Deno => Some(format!(
      "https://deno.land/std@{deno_std_version}/node/{name}.ts"
    )),
    _ => {
      if let Some(pkg) = polyfill_package(bare) {
        // served as a self-contained bundle so the polyfill itself pulls in
        // no further CDN requests
        let (pkg_name, version) = pkg.split_at(pkg.rfind('@').unwrap());
        let version = &version[1..];
        let base_name = pkg_name.rsplit('/').next().unwrap_or(pkg_name);
        Some(format!(
          "{base_path}/v{build_version}/{pkg_name}@{version}/{target}/{base_name}.bundle.mjs"
        ))
      } else if embedded_polyfill(&format!("node_{bare}")).is_some() {
        Some(format!("{base_path}/v{build_version}/node_{bare}.js"))
      } else {
        None
      }
    }
  }
}
