use std::fmt;
use std::fmt::Display;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ForgeError;

static FULL_VERSION: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+[\w\.\+\-]*$").unwrap());
static COMMITISH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{7,40}$").unwrap());
static NPM_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9~][a-z0-9_\.\-~]*$").unwrap());

/// True when `version` is a fully pinned `major.minor.patch[+tail]` version.
pub fn is_full_version(version: &str) -> bool {
  FULL_VERSION.is_match(version)
}

/// True when `spec` looks like an abbreviated or full git commit hash.
pub fn is_commitish(spec: &str) -> bool {
  COMMITISH.is_match(spec)
}

/// Strip a known script extension from a sub-path, yielding the bare module
/// name used as the build entry point.
pub fn to_module_bare_name(sub_path: &str) -> String {
  for ext in [".mjs", ".js", ".cjs", ".jsx", ".mts", ".cts", ".ts", ".tsx"] {
    if let Some(stripped) = sub_path.strip_suffix(ext) {
      return stripped.to_string();
    }
  }
  sub_path.to_string()
}

fn is_valid_npm_name(name: &str) -> bool {
  !name.is_empty() && name.len() <= 214 && NPM_NAME.is_match(name)
}

/// Where a package's sources come from.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PkgOrigin {
  #[default]
  Registry,
  CodeHost,
  UserUploaded,
}

impl PkgOrigin {
  /// URL/storage path prefix distinguishing code-host packages, e.g. the
  /// `gh/` in `/gh/owner/repo@sha/...`.
  pub fn path_prefix(&self) -> &'static str {
    match self {
      PkgOrigin::CodeHost => "gh/",
      _ => "",
    }
  }
}

/// A fully pinned package plus the requested path within it.
///
/// `version` is always a resolved full version (or commit hash for code-host
/// packages) by the time a `Pkg` exists; ranges and tags only appear in
/// [`PkgRequest`].
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Pkg {
  pub origin: PkgOrigin,
  pub name: String,
  pub version: String,
  /// Raw path within the installed package.
  pub sub_path: String,
  /// `sub_path` minus known script extensions; the module bare name.
  pub sub_module: String,
}

impl Pkg {
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    Pkg {
      origin: PkgOrigin::Registry,
      name: name.into(),
      version: version.into(),
      sub_path: String::new(),
      sub_module: String::new(),
    }
  }

  pub fn with_sub_path(mut self, sub_path: impl Into<String>) -> Self {
    self.sub_path = sub_path.into();
    self.sub_module = to_module_bare_name(&self.sub_path);
    self
  }

  /// `name@version`, the directory component used in URLs and storage paths.
  pub fn full_name(&self) -> String {
    format!("{}@{}", self.name, self.version)
  }

  /// The specifier used to import this package from its working directory.
  pub fn import_path(&self) -> String {
    if self.sub_module.is_empty() {
      self.name.clone()
    } else {
      format!("{}/{}", self.name, self.sub_module)
    }
  }

  /// Base file name for the built module: the sub-module, or the package's
  /// own base name for the root entry.
  pub fn module_base_name(&self) -> String {
    if !self.sub_module.is_empty() {
      return self.sub_module.clone();
    }
    let base = self.name.rsplit('/').next().unwrap_or(&self.name);
    base.strip_suffix(".js").unwrap_or(base).to_string()
  }
}

impl Display for Pkg {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}", self.name, self.version)?;
    if !self.sub_module.is_empty() {
      write!(f, "/{}", self.sub_module)?;
    }
    Ok(())
  }
}

/// A parsed, not yet resolved request path: the version may still be a
/// range, a dist-tag, a branch name, or empty.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PkgRequest {
  pub origin: PkgOrigin,
  pub name: String,
  pub spec: String,
  pub sub_path: String,
  /// Modifiers embedded in the version segment after `&`, to be spliced
  /// into the query string, e.g. `/react-dom@18.2.0&dev&target=es2020/client`.
  pub extra_query: Option<String>,
}

impl PkgRequest {
  /// Parse a request pathname into its package coordinates.
  ///
  /// Accepted shapes (leading build-version and `*` prefixes must already
  /// be stripped by the caller):
  ///   `/name[@spec][/sub]`
  ///   `/@scope/name[@spec][/sub]`
  ///   `/gh/owner/repo[@ref][/sub]`
  ///   `/jsr/@scope/name[@spec][/sub]`
  pub fn parse(pathname: &str) -> Result<Self, ForgeError> {
    let mut parts: Vec<&str> = pathname
      .trim_matches('/')
      .split('/')
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .collect();
    if parts.is_empty() {
      return Err(ForgeError::invalid_request("invalid path"));
    }

    let mut origin = PkgOrigin::Registry;
    let mut jsr = false;
    if parts[0] == "gh" {
      origin = PkgOrigin::CodeHost;
      parts.remove(0);
      if parts.len() < 2 {
        return Err(ForgeError::invalid_request("invalid path"));
      }
    } else if parts[0] == "jsr" {
      jsr = true;
      parts.remove(0);
      if parts.is_empty() || !parts[0].starts_with('@') {
        return Err(ForgeError::invalid_request("invalid path"));
      }
    }

    let (name_with_spec, sub_path) = match origin {
      PkgOrigin::CodeHost => (
        format!("{}/{}", parts[0], parts[1]),
        parts[2..].join("/"),
      ),
      _ if parts[0].starts_with('@') => {
        if parts.len() < 2 {
          return Err(ForgeError::invalid_request("invalid path"));
        }
        (
          format!("{}/{}", parts[0], parts[1]),
          parts[2..].join("/"),
        )
      }
      _ => (parts[0].to_string(), parts[1..].join("/")),
    };

    // split off the version spec at the last `@` (skipping a scope's `@`)
    let (mut name, mut spec) = match name_with_spec[1..].rfind('@') {
      Some(i) => {
        let (n, v) = name_with_spec.split_at(i + 1);
        (n.to_string(), v[1..].to_string())
      }
      None => (name_with_spec.clone(), String::new()),
    };

    // modifiers may ride along in the version segment after `&`
    let mut extra_query = None;
    if let Some(i) = spec.find('&') {
      extra_query = Some(spec[i + 1..].to_string());
      spec.truncate(i);
    }

    if jsr {
      // `jsr/@scope/name` maps onto the jsr npm-compatibility registry
      let scoped = name.trim_start_matches('@').replace('/', "__");
      name = format!("@jsr/{scoped}");
    }

    match origin {
      PkgOrigin::CodeHost => {
        // owner/repo: looser naming than the registry
        if name.split('/').any(str::is_empty) {
          return Err(ForgeError::invalid_request("invalid path"));
        }
      }
      _ => {
        let bare = name.strip_prefix('@').unwrap_or(&name);
        if !bare.split('/').all(is_valid_npm_name) {
          return Err(ForgeError::invalid_request(format!(
            "invalid package name '{name}'"
          )));
        }
      }
    }

    if sub_path.split('/').any(|seg| seg == "..") {
      return Err(ForgeError::invalid_request("invalid path"));
    }

    Ok(PkgRequest {
      origin,
      name,
      spec: spec.trim().to_string(),
      sub_path,
      extra_query,
    })
  }

  /// Pin this request to a resolved version.
  pub fn into_pkg(self, version: impl Into<String>) -> Pkg {
    let sub_module = to_module_bare_name(&self.sub_path);
    Pkg {
      origin: self.origin,
      name: self.name,
      version: version.into(),
      sub_path: self.sub_path,
      sub_module,
    }
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn parses_bare_name() {
    let req = PkgRequest::parse("/react").unwrap();
    assert_eq!(req.name, "react");
    assert_eq!(req.spec, "");
    assert_eq!(req.sub_path, "");
  }

  #[test]
  fn parses_versioned_sub_path() {
    let req = PkgRequest::parse("/react-dom@18.2.0/client.js").unwrap();
    assert_eq!(req.name, "react-dom");
    assert_eq!(req.spec, "18.2.0");
    assert_eq!(req.sub_path, "client.js");
    let pkg = req.into_pkg("18.2.0");
    assert_eq!(pkg.sub_module, "client");
    assert_eq!(pkg.import_path(), "react-dom/client");
  }

  #[test]
  fn parses_scoped_package() {
    let req = PkgRequest::parse("/@emotion/react@11.10.6/jsx-runtime").unwrap();
    assert_eq!(req.name, "@emotion/react");
    assert_eq!(req.spec, "11.10.6");
    assert_eq!(req.sub_path, "jsx-runtime");
  }

  #[test]
  fn parses_code_host_path() {
    let req = PkgRequest::parse("/gh/microsoft/fluentui-emoji/assets/Alien.svg").unwrap();
    assert_eq!(req.origin, PkgOrigin::CodeHost);
    assert_eq!(req.name, "microsoft/fluentui-emoji");
    assert_eq!(req.spec, "");
    assert_eq!(req.sub_path, "assets/Alien.svg");
  }

  #[test]
  fn parses_jsr_path() {
    let req = PkgRequest::parse("/jsr/@std/encoding@0.222.0/base64").unwrap();
    assert_eq!(req.name, "@jsr/std__encoding");
    assert_eq!(req.spec, "0.222.0");
    assert_eq!(req.sub_path, "base64");
  }

  #[test]
  fn splits_extra_query_from_version() {
    let req = PkgRequest::parse("/react-dom@18.2.0&dev&target=es2020/client").unwrap();
    assert_eq!(req.spec, "18.2.0");
    assert_eq!(req.extra_query.as_deref(), Some("dev&target=es2020"));
    assert_eq!(req.sub_path, "client");
  }

  #[test]
  fn rejects_traversal_and_bad_names() {
    assert!(PkgRequest::parse("/react/../../../etc/passwd").is_err());
    assert!(PkgRequest::parse("/UPPERCASE").is_err());
    assert!(PkgRequest::parse("/").is_err());
  }

  #[test]
  fn version_shapes() {
    assert!(is_full_version("18.2.0"));
    assert!(is_full_version("1.0.0-beta.1+build5"));
    assert!(!is_full_version("^18.2.0"));
    assert!(!is_full_version("latest"));
    assert!(is_commitish("abc1234"));
    assert!(is_commitish("0123456789abcdef0123456789abcdef01234567"));
    assert!(!is_commitish("main"));
  }

  #[test]
  fn module_bare_names() {
    assert_eq!(to_module_bare_name("client.js"), "client");
    assert_eq!(to_module_bare_name("lib/index.mjs"), "lib/index");
    assert_eq!(to_module_bare_name("styles.css"), "styles.css");
  }

  #[test]
  fn module_base_name_for_root_entry() {
    let pkg = Pkg::new("@emotion/react", "11.10.6");
    assert_eq!(pkg.module_base_name(), "react");
    let odd = Pkg::new("math.js", "11.0.0");
    assert_eq!(odd.module_base_name(), "math");
  }
}
