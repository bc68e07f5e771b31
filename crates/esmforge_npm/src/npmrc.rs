use std::collections::BTreeMap;
use std::fmt::Write;

use serde::Deserialize;
use serde::Serialize;

use esmforge_core::ForgeError;

pub const NPM_REGISTRY: &str = "https://registry.npmjs.org";
pub const JSR_REGISTRY: &str = "https://npm.jsr.io";

/// One registry endpoint plus its credentials.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryAuth {
  pub registry: String,
  pub token: Option<String>,
  pub user: Option<String>,
  pub password: Option<String>,
}

impl Default for RegistryAuth {
  fn default() -> Self {
    Self {
      registry: NPM_REGISTRY.to_string(),
      token: None,
      user: None,
      password: None,
    }
  }
}

impl RegistryAuth {
  pub fn has_credentials(&self) -> bool {
    self.token.is_some() || (self.user.is_some() && self.password.is_some())
  }

  fn host_path(&self) -> &str {
    let url = self.registry.trim_end_matches('/');
    url
      .strip_prefix("https:")
      .or_else(|| url.strip_prefix("http:"))
      .unwrap_or(url)
  }
}

/// Registry configuration: a default registry plus per-scope overrides,
/// the same shape `.npmrc` files express.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NpmRc {
  #[serde(flatten)]
  pub default: RegistryAuth,
  /// Scope (with the leading `@`) → registry override.
  pub registries: BTreeMap<String, RegistryAuth>,
}

impl NpmRc {
  pub fn new() -> Self {
    let mut rc = NpmRc::default();
    rc.registries.insert(
      "@jsr".to_string(),
      RegistryAuth {
        registry: JSR_REGISTRY.to_string(),
        ..Default::default()
      },
    );
    rc
  }

  /// Parse the JSON form carried by the `X-Npmrc` request header.
  pub fn from_json(raw: &str) -> Result<Self, ForgeError> {
    serde_json::from_str(raw).map_err(|_| ForgeError::invalid_request("invalid npmrc header"))
  }

  pub fn registry_for(&self, pkg_name: &str) -> &RegistryAuth {
    if let Some(scope) = pkg_name.split('/').next().filter(|s| s.starts_with('@')) {
      if let Some(auth) = self.registries.get(scope) {
        return auth;
      }
    }
    &self.default
  }

  /// Render an `.npmrc` file for the package-manager CLI. Credentials are
  /// written as environment-variable indirections, never inline; the
  /// returned env map holds the actual values.
  pub fn render_npmrc(&self) -> (String, BTreeMap<String, String>) {
    let mut out = String::new();
    let mut env = BTreeMap::new();
    if self.default.registry != NPM_REGISTRY {
      let _ = writeln!(out, "registry={}", self.default.registry);
    }
    render_auth(&mut out, &mut env, None, &self.default);
    for (scope, auth) in &self.registries {
      let _ = writeln!(out, "{scope}:registry={}", auth.registry);
      render_auth(&mut out, &mut env, Some(scope), auth);
    }
    (out, env)
  }
}

fn render_auth(
  out: &mut String,
  env: &mut BTreeMap<String, String>,
  scope: Option<&str>,
  auth: &RegistryAuth,
) {
  let env_tag = scope
    .map(|s| s.trim_start_matches('@').to_uppercase().replace(['-', '.'], "_"))
    .unwrap_or_else(|| "DEFAULT".to_string());
  if let Some(token) = &auth.token {
    let var = format!("ESMFORGE_NPM_TOKEN_{env_tag}");
    let _ = writeln!(out, "{}:_authToken=${{{var}}}", auth.host_path());
    env.insert(var, token.clone());
  } else if let (Some(user), Some(password)) = (&auth.user, &auth.password) {
    let user_var = format!("ESMFORGE_NPM_USER_{env_tag}");
    let pass_var = format!("ESMFORGE_NPM_PASSWORD_{env_tag}");
    let _ = writeln!(out, "{}:username=${{{user_var}}}", auth.host_path());
    let _ = writeln!(out, "{}:_password=${{{pass_var}}}", auth.host_path());
    env.insert(user_var, user.clone());
    env.insert(pass_var, password.clone());
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn scoped_lookup_falls_back_to_default() {
    let rc = NpmRc::new();
    assert_eq!(rc.registry_for("react").registry, NPM_REGISTRY);
    assert_eq!(rc.registry_for("@emotion/react").registry, NPM_REGISTRY);
    assert_eq!(rc.registry_for("@jsr/std__encoding").registry, JSR_REGISTRY);
  }

  #[test]
  fn parses_header_json() {
    let rc = NpmRc::from_json(
      r#"{
        "registry": "https://npm.corp.example.com",
        "token": "sekret",
        "registries": {
          "@corp": {"registry": "https://npm.corp.example.com/private"}
        }
      }"#,
    )
    .unwrap();
    assert_eq!(rc.default.registry, "https://npm.corp.example.com");
    assert_eq!(rc.registry_for("@corp/ui").registry, "https://npm.corp.example.com/private");
    assert!(NpmRc::from_json("not json").is_err());
  }

  #[test]
  fn renders_credentials_as_env_indirections() {
    let mut rc = NpmRc::default();
    rc.default.registry = "https://npm.corp.example.com".to_string();
    rc.default.token = Some("sekret".to_string());

    let (file, env) = rc.render_npmrc();
    assert!(file.contains("registry=https://npm.corp.example.com"));
    assert!(file.contains("//npm.corp.example.com:_authToken=${ESMFORGE_NPM_TOKEN_DEFAULT}"));
    assert!(!file.contains("sekret"));
    assert_eq!(env["ESMFORGE_NPM_TOKEN_DEFAULT"], "sekret");
  }
}
