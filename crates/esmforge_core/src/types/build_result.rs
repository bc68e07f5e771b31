use serde::Deserialize;
use serde::Serialize;

fn is_false(b: &bool) -> bool {
  !*b
}

/// Metadata persisted next to a build artefact, keyed by the identity path.
///
/// Field names are deliberately one letter: one record is written per
/// identity and the key-value store holds millions of them.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BuildResult {
  /// External CDN URLs the artefact imports.
  #[serde(rename = "i", default, skip_serializing_if = "Vec::is_empty")]
  pub deps: Vec<String>,
  #[serde(rename = "d", default, skip_serializing_if = "is_false")]
  pub has_default_export: bool,
  #[serde(rename = "c", default, skip_serializing_if = "is_false")]
  pub from_cjs: bool,
  /// CDN-relative path of the companion type definitions.
  #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
  pub dts: Option<String>,
  /// The package ships only type definitions; there is no runtime artefact.
  #[serde(rename = "o", default, skip_serializing_if = "is_false")]
  pub types_only: bool,
  /// A sibling `.css` artefact exists for this identity.
  #[serde(rename = "s", default, skip_serializing_if = "is_false")]
  pub package_css: bool,
  #[serde(skip)]
  pub named_exports: Vec<String>,
}
