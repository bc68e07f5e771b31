//! The production [`Bundler`]: a node child process wrapping the actual
//! bundler library, driven over a JSON-lines stdio protocol. Resolve/load
//! hooks cross the process boundary as request/response pairs keyed by id.
//!
//! One child per build keeps the protocol trivially race-free; builds are
//! already serialized per identity by the queue.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;

use esmforge_core::Target;

use super::BundleOptions;
use super::BundleOutput;
use super::BundlePlugin;
use super::Bundler;
use super::Loader;
use super::OnResolveArgs;
use super::OutputFile;
use super::Platform;
use super::ResolveKind;

pub struct SidecarBundler {
  node_bin: String,
  script: PathBuf,
}

impl SidecarBundler {
  pub fn new(node_bin: impl Into<String>, script: impl Into<PathBuf>) -> Self {
    Self {
      node_bin: node_bin.into(),
      script: script.into(),
    }
  }

  async fn spawn(&self) -> anyhow::Result<tokio::process::Child> {
    Ok(
      tokio::process::Command::new(&self.node_bin)
        .arg(&self.script)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?,
    )
  }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum SidecarMessage {
  Resolve {
    id: u64,
    args: SidecarResolveArgs,
  },
  Load {
    id: u64,
    args: SidecarLoadArgs,
  },
  Done {
    #[serde(default)]
    files: Vec<SidecarFile>,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default)]
    code: Option<String>,
  },
  Error {
    message: String,
  },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SidecarResolveArgs {
  path: String,
  #[serde(default)]
  importer: String,
  #[serde(default)]
  resolve_dir: String,
  #[serde(default)]
  kind: String,
  #[serde(default)]
  namespace: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SidecarLoadArgs {
  path: String,
  #[serde(default)]
  namespace: String,
}

#[derive(Debug, Deserialize)]
struct SidecarFile {
  path: String,
  /// Base64 so binary (sourcemap, wasm-adjacent) content survives JSON.
  contents: String,
}

fn resolve_kind(kind: &str) -> ResolveKind {
  match kind {
    "entry-point" => ResolveKind::Entry,
    "dynamic-import" => ResolveKind::DynamicImport,
    "require-call" => ResolveKind::RequireCall,
    "require-resolve" => ResolveKind::RequireResolve,
    _ => ResolveKind::Import,
  }
}

fn loader_name(loader: Loader) -> &'static str {
  match loader {
    Loader::Js => "js",
    Loader::Json => "json",
    Loader::DataUrl => "dataurl",
  }
}

fn options_json(options: &BundleOptions) -> serde_json::Value {
  serde_json::json!({
    "entryPoint": options.entry_point.as_ref().map(|p| p.to_string_lossy()),
    "stdin": options.stdin.as_ref().map(|stdin| serde_json::json!({
      "contents": stdin.contents,
      "resolveDir": stdin.resolve_dir.to_string_lossy(),
      "sourcefile": stdin.source_file,
    })),
    "platform": match options.platform {
      Platform::Browser => "browser",
      Platform::Node => "node",
    },
    "target": options.target.as_str(),
    "conditions": options.conditions,
    "minify": options.minify,
    "keepNames": options.keep_names,
    "ignoreAnnotations": options.ignore_annotations,
    "define": options.define,
    "sourcemap": options.source_map,
  })
}

#[async_trait]
impl Bundler for SidecarBundler {
  async fn build(
    &self,
    options: BundleOptions,
    plugin: Arc<dyn BundlePlugin>,
  ) -> anyhow::Result<BundleOutput> {
    let mut child = self.spawn().await?;
    let mut stdin = child.stdin.take().expect("piped stdin");
    let stdout = child.stdout.take().expect("piped stdout");
    let mut lines = BufReader::new(stdout).lines();

    let request = serde_json::json!({"type": "build", "options": options_json(&options)});
    stdin
      .write_all(format!("{request}\n").as_bytes())
      .await?;

    while let Some(line) = lines.next_line().await? {
      if line.trim().is_empty() {
        continue;
      }
      let message: SidecarMessage = serde_json::from_str(&line)?;
      match message {
        SidecarMessage::Resolve { id, args } => {
          let result = plugin
            .on_resolve(&OnResolveArgs {
              path: args.path,
              importer: args.importer,
              resolve_dir: PathBuf::from(args.resolve_dir),
              kind: resolve_kind(&args.kind),
              namespace: args.namespace,
            })
            .await?;
          let reply = serde_json::json!({
            "type": "resolve-result",
            "id": id,
            "result": result.map(|r| serde_json::json!({
              "path": r.path,
              "external": r.external,
              "namespace": r.namespace,
              "sideEffects": r.side_effects,
            })),
          });
          stdin.write_all(format!("{reply}\n").as_bytes()).await?;
        }
        SidecarMessage::Load { id, args } => {
          let result = plugin
            .on_load(&super::OnLoadArgs {
              path: args.path,
              namespace: args.namespace,
            })
            .await?;
          let reply = serde_json::json!({
            "type": "load-result",
            "id": id,
            "result": result.map(|r| serde_json::json!({
              "contents": r.contents,
              "loader": loader_name(r.loader),
            })),
          });
          stdin.write_all(format!("{reply}\n").as_bytes()).await?;
        }
        SidecarMessage::Done {
          files,
          errors,
          warnings,
          ..
        } => {
          let files = files
            .into_iter()
            .map(|file| {
              Ok(OutputFile {
                path: file.path,
                contents: BASE64_STANDARD.decode(file.contents)?,
              })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
          let _ = child.wait().await;
          return Ok(BundleOutput {
            files,
            errors,
            warnings,
          });
        }
        SidecarMessage::Error { message } => {
          let _ = child.kill().await;
          anyhow::bail!("bundler sidecar: {message}");
        }
      }
    }
    let _ = child.kill().await;
    anyhow::bail!("bundler sidecar exited before reporting a result");
  }

  async fn transform(&self, code: &str, loader: &str, target: Target) -> anyhow::Result<String> {
    let mut child = self.spawn().await?;
    let mut stdin = child.stdin.take().expect("piped stdin");
    let stdout = child.stdout.take().expect("piped stdout");
    let mut lines = BufReader::new(stdout).lines();

    let request = serde_json::json!({
      "type": "transform",
      "code": code,
      "loader": loader,
      "target": target.as_str(),
    });
    stdin.write_all(format!("{request}\n").as_bytes()).await?;

    while let Some(line) = lines.next_line().await? {
      if line.trim().is_empty() {
        continue;
      }
      match serde_json::from_str::<SidecarMessage>(&line)? {
        SidecarMessage::Done { code: Some(code), .. } => {
          let _ = child.wait().await;
          return Ok(code);
        }
        SidecarMessage::Done { errors, .. } => {
          let _ = child.wait().await;
          anyhow::bail!(
            "transform failed: {}",
            errors.first().cloned().unwrap_or_default()
          );
        }
        SidecarMessage::Error { message } => {
          let _ = child.kill().await;
          anyhow::bail!("bundler sidecar: {message}");
        }
        _ => {}
      }
    }
    let _ = child.kill().await;
    anyhow::bail!("bundler sidecar exited before reporting a result");
  }
}

#[cfg(test)]
mod tests {
  use std::os::unix::fs::PermissionsExt;
  use std::path::Path;

  use pretty_assertions::assert_eq;

  use super::*;

  struct NoopPlugin;

  #[async_trait]
  impl BundlePlugin for NoopPlugin {
    async fn on_resolve(
      &self,
      _args: &OnResolveArgs,
    ) -> anyhow::Result<Option<super::super::OnResolveResult>> {
      Ok(None)
    }

    async fn on_load(
      &self,
      _args: &super::super::OnLoadArgs,
    ) -> anyhow::Result<Option<super::super::OnLoadResult>> {
      Ok(None)
    }
  }

  fn fake_sidecar(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("sidecar.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
  }

  #[tokio::test]
  async fn collects_done_output() {
    let dir = tempfile::tempdir().unwrap();
    // "ZXhwb3J0IHt9" is base64 for "export {}"
    let script = fake_sidecar(
      dir.path(),
      r#"read line; echo '{"type":"done","files":[{"path":"out.js","contents":"ZXhwb3J0IHt9"}],"errors":[],"warnings":[]}'"#,
    );
    let bundler = SidecarBundler::new("sh", script);
    let output = bundler
      .build(BundleOptions::default(), Arc::new(NoopPlugin))
      .await
      .unwrap();
    assert_eq!(output.files.len(), 1);
    assert_eq!(output.files[0].contents, b"export {}");
  }

  #[tokio::test]
  async fn surfaces_sidecar_errors() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_sidecar(
      dir.path(),
      r#"read line; echo '{"type":"error","message":"engine exploded"}'"#,
    );
    let bundler = SidecarBundler::new("sh", script);
    let err = bundler
      .build(BundleOptions::default(), Arc::new(NoopPlugin))
      .await
      .unwrap_err();
    assert!(err.to_string().contains("engine exploded"));
  }

  #[tokio::test]
  async fn transform_round_trips_code() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_sidecar(
      dir.path(),
      r#"read line; echo '{"type":"done","code":"1+1;"}'"#,
    );
    let bundler = SidecarBundler::new("sh", script);
    let code = bundler.transform("1+1", "js", Target::Es2022).await.unwrap();
    assert_eq!(code, "1+1;");
  }
}
