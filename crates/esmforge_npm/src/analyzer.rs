use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use esmforge_core::ForgeError;

/// Packages whose exports defeat static analysis (runtime meta-programming,
/// conditional export objects); for these the analyzer child falls back to
/// `require()`-time introspection.
pub const REQUIRE_MODE_ALLOWLIST: &[&str] = &[
  "@babel/types",
  "cheerio",
  "graceful-fs",
  "he",
  "jsbn",
  "netmask",
  "xml2js",
  "keycode",
  "lru_map",
  "lz-string",
  "maplibre-gl",
  "pako",
  "postcss-selector-parser",
  "react-draggable",
  "resolve",
  "safe-buffer",
  "seedrandom",
  "stream-browserify",
  "stream-http",
  "typescript",
  "vscode-oniguruma",
  "web-streams-ponyfill",
];

fn wants_require_mode(specifier: &str) -> bool {
  REQUIRE_MODE_ALLOWLIST
    .iter()
    .any(|name| specifier == *name || specifier.starts_with(&format!("{name}/")))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
  wd: &'a str,
  specifier: &'a str,
  node_env: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  require_mode: Option<u8>,
}

/// What the analyzer child reports for one module.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CjsAnalysis {
  /// The module is a thin `module.exports = require("other")` re-export.
  pub reexport: Option<String>,
  pub has_default_export: bool,
  pub named_exports: Vec<String>,
  pub error: Option<String>,
  pub stack: Option<String>,
}

pub type ExportAnalyzerRef = Arc<dyn ExportAnalyzer + Send + Sync>;

/// Determines the export shape of an installed CJS module.
#[automock]
#[async_trait]
pub trait ExportAnalyzer: Send + Sync {
  async fn analyze(
    &self,
    wd: &Path,
    specifier: &str,
    node_env: &str,
  ) -> Result<CjsAnalysis, ForgeError>;
}

/// Runs the static lexer in a node child process, JSON over stdio, with a
/// hard timeout. The child script is deployed alongside the server.
pub struct NodeExportAnalyzer {
  node_bin: String,
  script: PathBuf,
  timeout: Duration,
}

impl NodeExportAnalyzer {
  pub fn new(node_bin: impl Into<String>, script: impl Into<PathBuf>) -> Self {
    Self {
      node_bin: node_bin.into(),
      script: script.into(),
      timeout: Duration::from_secs(30),
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}

#[async_trait]
impl ExportAnalyzer for NodeExportAnalyzer {
  #[tracing::instrument(level = "debug", skip(self, wd))]
  async fn analyze(
    &self,
    wd: &Path,
    specifier: &str,
    node_env: &str,
  ) -> Result<CjsAnalysis, ForgeError> {
    let request = AnalyzeRequest {
      wd: &wd.to_string_lossy(),
      specifier,
      node_env,
      require_mode: wants_require_mode(specifier).then_some(1),
    };
    let payload = serde_json::to_vec(&request)
      .map_err(|err| ForgeError::internal(format!("analyzer request: {err}")))?;

    let mut child = tokio::process::Command::new(&self.node_bin)
      .arg(&self.script)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|err| ForgeError::internal(format!("spawn analyzer: {err}")))?;

    let run = async {
      let mut stdin = child.stdin.take().expect("piped stdin");
      stdin.write_all(&payload).await?;
      drop(stdin);
      let mut stdout = Vec::new();
      let mut stderr = Vec::new();
      child
        .stdout
        .take()
        .expect("piped stdout")
        .read_to_end(&mut stdout)
        .await?;
      child
        .stderr
        .take()
        .expect("piped stderr")
        .read_to_end(&mut stderr)
        .await?;
      let status = child.wait().await?;
      Ok::<_, std::io::Error>((status, stdout, stderr))
    };

    let (status, stdout, stderr) = match tokio::time::timeout(self.timeout, run).await {
      Ok(result) => result.map_err(|err| ForgeError::internal(format!("analyzer io: {err}")))?,
      Err(_) => {
        let _ = child.kill().await;
        return Err(ForgeError::internal(format!(
          "analyzer timed out after {}s on {specifier}",
          self.timeout.as_secs()
        )));
      }
    };

    if !status.success() {
      return Err(ForgeError::internal(format!(
        "analyzer failed on {specifier}: {}",
        String::from_utf8_lossy(&stderr).trim()
      )));
    }
    let analysis: CjsAnalysis = serde_json::from_slice(&stdout)
      .map_err(|err| ForgeError::internal(format!("analyzer output for {specifier}: {err}")))?;
    if let Some(error) = &analysis.error {
      if let Some(stack) = &analysis.stack {
        tracing::error!(specifier, %error, %stack, "analyzer error");
      } else {
        tracing::error!(specifier, %error, "analyzer error");
      }
      return Err(ForgeError::internal(format!(
        "analyzer failed on {specifier}: {error}"
      )));
    }
    Ok(analysis)
  }
}

#[cfg(test)]
mod tests {
  use std::os::unix::fs::PermissionsExt;

  use pretty_assertions::assert_eq;

  use super::*;

  fn script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("analyzer.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
  }

  #[tokio::test]
  async fn parses_the_child_response() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(
      dir.path(),
      r#"cat > /dev/null; echo '{"hasDefaultExport":true,"namedExports":["render","hydrate"]}'"#,
    );
    let analyzer = NodeExportAnalyzer::new("sh", script);
    let analysis = analyzer
      .analyze(dir.path(), "react-dom", "production")
      .await
      .unwrap();
    assert!(analysis.has_default_export);
    assert_eq!(analysis.named_exports, vec!["render", "hydrate"]);
  }

  #[tokio::test]
  async fn reported_errors_become_failures() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(
      dir.path(),
      r#"cat > /dev/null; echo '{"error":"unexpected token","stack":"at parse (:1:1)"}'"#,
    );
    let analyzer = NodeExportAnalyzer::new("sh", script);
    let err = analyzer.analyze(dir.path(), "broken", "production").await.unwrap_err();
    assert!(err.message.contains("unexpected token"));
  }

  #[tokio::test]
  async fn kills_the_child_on_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(dir.path(), "sleep 60");
    let analyzer =
      NodeExportAnalyzer::new("sh", script).with_timeout(Duration::from_millis(100));
    let err = analyzer.analyze(dir.path(), "slow", "production").await.unwrap_err();
    assert!(err.message.contains("timed out"));
  }

  #[test]
  fn require_mode_matches_sub_paths_too() {
    assert!(wants_require_mode("typescript"));
    assert!(wants_require_mode("typescript/lib/typescript.js"));
    assert!(!wants_require_mode("typescript-eslint"));
    assert!(!wants_require_mode("react"));
  }
}
