use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use mockall::automock;
use parking_lot::Mutex;
use semver::Version;
use semver::VersionReq;

use esmforge_core::is_full_version;
use esmforge_core::ForgeError;

use crate::manifest::PackageManifest;
use crate::manifest::Packument;
use crate::npmrc::NpmRc;
use crate::npmrc::RegistryAuth;

const RESOLVE_TTL: Duration = Duration::from_secs(10 * 60);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

pub type PackageRegistryRef = Arc<dyn PackageRegistry + Send + Sync>;

/// Version resolution against a package registry: spec in (range, tag,
/// full version, or empty for `latest`), pinned manifest out.
#[automock]
#[async_trait]
pub trait PackageRegistry: Send + Sync {
  async fn resolve(&self, name: &str, spec: &str) -> Result<PackageManifest, ForgeError>;
}

pub struct RegistryClient {
  http: reqwest::Client,
  npmrc: NpmRc,
  cache: Mutex<HashMap<(String, String), (Instant, Arc<PackageManifest>)>>,
}

impl RegistryClient {
  pub fn new(npmrc: NpmRc) -> Self {
    let http = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(15))
      .timeout(Duration::from_secs(60))
      .build()
      .expect("registry http client");
    Self {
      http,
      npmrc,
      cache: Mutex::new(HashMap::new()),
    }
  }

  pub fn npmrc(&self) -> &NpmRc {
    &self.npmrc
  }

  fn cache_get(&self, name: &str, spec: &str) -> Option<Arc<PackageManifest>> {
    let cache = self.cache.lock();
    let (at, manifest) = cache.get(&(name.to_string(), spec.to_string()))?;
    // fully pinned versions are immutable on the registry
    if is_full_version(spec) || at.elapsed() < RESOLVE_TTL {
      Some(manifest.clone())
    } else {
      None
    }
  }

  fn cache_put(&self, name: &str, spec: &str, manifest: Arc<PackageManifest>) {
    self
      .cache
      .lock()
      .insert((name.to_string(), spec.to_string()), (Instant::now(), manifest));
  }

  async fn fetch_json<T: serde::de::DeserializeOwned>(
    &self,
    auth: &RegistryAuth,
    url: &str,
    name: &str,
  ) -> Result<T, ForgeError> {
    let mut delay = RETRY_BASE_DELAY;
    let mut last_error = None;
    for attempt in 0..RETRY_ATTEMPTS {
      if attempt > 0 {
        tokio::time::sleep(delay).await;
        delay *= 2;
      }
      let mut request = self.http.get(url);
      if let Some(token) = &auth.token {
        request = request.bearer_auth(token);
      } else if let (Some(user), Some(password)) = (&auth.user, &auth.password) {
        request = request.basic_auth(user, Some(password));
      }
      match request.send().await {
        Ok(response) => {
          let status = response.status();
          if status.as_u16() == 404 {
            return Err(ForgeError::not_found(format!("package \"{name}\" not found")));
          }
          if status.is_server_error() {
            last_error = Some(ForgeError::upstream(format!(
              "registry responded {status} for {name}"
            )));
            continue;
          }
          if !status.is_success() {
            return Err(ForgeError::upstream(format!(
              "registry responded {status} for {name}"
            )));
          }
          return response
            .json::<T>()
            .await
            .map_err(|err| ForgeError::upstream(format!("registry payload for {name}: {err}")));
        }
        Err(err) => {
          last_error = Some(ForgeError::upstream(format!("registry fetch {name}: {err}")));
        }
      }
    }
    Err(last_error.unwrap_or_else(|| ForgeError::upstream(format!("registry fetch {name} failed"))))
  }
}

#[async_trait]
impl PackageRegistry for RegistryClient {
  #[tracing::instrument(level = "debug", skip(self))]
  async fn resolve(&self, name: &str, spec: &str) -> Result<PackageManifest, ForgeError> {
    let spec = if spec.is_empty() { "latest" } else { spec };
    if let Some(cached) = self.cache_get(name, spec) {
      return Ok((*cached).clone());
    }

    let auth = self.npmrc.registry_for(name);
    let registry = auth.registry.trim_end_matches('/');

    let manifest = if is_full_version(spec) {
      self
        .fetch_json::<PackageManifest>(auth, &format!("{registry}/{name}/{spec}"), name)
        .await?
    } else {
      let packument = self
        .fetch_json::<Packument>(auth, &format!("{registry}/{name}"), name)
        .await?;
      let version = select_version(&packument, spec)
        .ok_or_else(|| ForgeError::not_found(format!("package \"{name}@{spec}\" not found")))?;
      packument
        .versions
        .get(&version)
        .cloned()
        .ok_or_else(|| ForgeError::not_found(format!("package \"{name}@{spec}\" not found")))?
    };

    self.cache_put(name, spec, Arc::new(manifest.clone()));
    Ok(manifest)
  }
}

/// Pick the version a spec resolves to: dist-tag first, then the highest
/// version satisfying the range. Prereleases only match when the spec
/// itself mentions one.
fn select_version(packument: &Packument, spec: &str) -> Option<String> {
  if let Some(tagged) = packument.dist_tags.get(spec) {
    return Some(tagged.clone());
  }
  let req = VersionReq::parse(spec).ok()?;
  let allow_prerelease = spec.contains('-');
  packument
    .versions
    .keys()
    .filter_map(|v| Version::parse(v).ok())
    .filter(|v| (allow_prerelease || v.pre.is_empty()) && req.matches(v))
    .max()
    .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn packument(versions: &[&str], tags: &[(&str, &str)]) -> Packument {
    let mut p = Packument {
      name: "demo".into(),
      ..Default::default()
    };
    for v in versions {
      p.versions.insert(
        v.to_string(),
        PackageManifest {
          name: "demo".into(),
          version: v.to_string(),
          ..Default::default()
        },
      );
    }
    for (tag, v) in tags {
      p.dist_tags.insert(tag.to_string(), v.to_string());
    }
    p
  }

  #[test]
  fn dist_tags_win_over_ranges() {
    let p = packument(&["1.0.0", "2.0.0"], &[("latest", "1.0.0")]);
    assert_eq!(select_version(&p, "latest").as_deref(), Some("1.0.0"));
  }

  #[test]
  fn caret_range_selects_highest_satisfying() {
    let p = packument(&["18.0.0", "18.2.0", "18.3.1", "19.0.0"], &[]);
    assert_eq!(select_version(&p, "^18.2.0").as_deref(), Some("18.3.1"));
    assert_eq!(select_version(&p, "~18.0.0").as_deref(), Some("18.0.0"));
    assert_eq!(select_version(&p, "18").as_deref(), Some("18.3.1"));
    assert_eq!(select_version(&p, "^20.0.0"), None);
  }

  #[test]
  fn prereleases_only_match_prerelease_specs() {
    let p = packument(&["1.0.0", "2.0.0-beta.1"], &[]);
    assert_eq!(select_version(&p, "^1.0.0").as_deref(), Some("1.0.0"));
    assert_eq!(select_version(&p, ">=1.0.0").as_deref(), Some("1.0.0"));
    assert_eq!(
      select_version(&p, "2.0.0-beta.1").as_deref(),
      Some("2.0.0-beta.1")
    );
  }
}
