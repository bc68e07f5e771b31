//! The build job: install sources, analyze the entry, drive the bundler
//! with the resolve/load plugin, rewrite externals into CDN URLs, and
//! persist artefacts plus metadata.

pub mod analysis;
pub mod plugin;
pub mod polyfills;
pub mod postprocess;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;

use esmforge_core::to_module_bare_name;
use esmforge_core::BuildArgs;
use esmforge_core::BuildIdentity;
use esmforge_core::BuildResult;
use esmforge_core::BundleMode;
use esmforge_core::ForgeError;
use esmforge_core::Pkg;
use esmforge_core::PkgOrigin;
use esmforge_core::Target;
use esmforge_npm::installer::read_installed_manifest;
use esmforge_npm::ExportAnalyzerRef;
use esmforge_npm::PackageInstallerRef;
use esmforge_npm::PackageManifest;
use esmforge_npm::PackageRegistryRef;
use esmforge_storage::FileStoreRef;
use esmforge_storage::KvStoreRef;

use crate::bundler::BundleOptions;
use crate::bundler::BundlePlugin;
use crate::bundler::BundlerRef;
use crate::bundler::Loader;
use crate::bundler::OnLoadArgs;
use crate::bundler::OnLoadResult;
use crate::bundler::OnResolveArgs;
use crate::bundler::OnResolveResult;
use crate::bundler::Platform;
use crate::bundler::StdinInput;
use crate::config::Config;
use crate::queue::BuildQueue;
use crate::queue::JobKind;
use crate::queue::JobOutcome;
use crate::queue::JobRunner;
use crate::queue::JobSpec;
use crate::queue::Stage;
use analysis::analyze_module;
use analysis::ModuleShape;
use plugin::split_pkg_path;
use plugin::ResolveContext;
use plugin::ResolvePlugin;
use polyfills::builtin_import_path;
use polyfills::embedded_polyfill;
use polyfills::is_node_builtin;
use postprocess::inject_node_globals;
use postprocess::replace_external;
use postprocess::replace_window_checks;
use postprocess::strip_shebang;
use postprocess::DepShape;
use postprocess::EXTERNAL_MARKER;

/// Bounded retry count for the rebuild-on-miss loop.
const MAX_REBUILDS: usize = 16;

/// Runs queued jobs: the module build pipeline and the types rewriter.
pub struct BuildService {
  pub config: Arc<Config>,
  pub registry: PackageRegistryRef,
  pub installer: PackageInstallerRef,
  pub analyzer: ExportAnalyzerRef,
  pub bundler: BundlerRef,
  pub files: FileStoreRef,
  pub kv: KvStoreRef,
  /// Set once the queue exists; used to submit discovered sub-builds.
  queue: OnceCell<BuildQueue>,
}

impl BuildService {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    config: Arc<Config>,
    registry: PackageRegistryRef,
    installer: PackageInstallerRef,
    analyzer: ExportAnalyzerRef,
    bundler: BundlerRef,
    files: FileStoreRef,
    kv: KvStoreRef,
  ) -> Self {
    Self {
      config,
      registry,
      installer,
      analyzer,
      bundler,
      files,
      kv,
      queue: OnceCell::new(),
    }
  }

  pub fn attach_queue(&self, queue: BuildQueue) {
    let _ = self.queue.set(queue);
  }

  fn store_result(&self, identity: &BuildIdentity, result: &BuildResult) {
    match serde_json::to_vec(result) {
      Ok(record) => {
        if let Err(err) = self.kv.put(&identity.save_path(), &record) {
          tracing::error!(identity = %identity, "metadata write failed: {err}");
        }
      }
      Err(err) => tracing::error!(identity = %identity, "metadata encode failed: {err}"),
    }
  }

  /// Absolute-path URL of a (sub)package artefact under this CDN.
  fn artefact_url(&self, host: &BuildIdentity, pkg: Pkg, args: BuildArgs) -> String {
    let identity = BuildIdentity {
      build_version: host.build_version,
      pkg,
      args,
      target: host.target,
      dev: host.dev,
      bundle_mode: BundleMode::Default,
    };
    format!("{}{}", self.config.base_path, identity.url_path())
  }

  fn error_js_url(&self, kind: &str, name: &str, importer: &str) -> String {
    format!(
      "{}/error.js?type={kind}&name={name}&importer={importer}",
      self.config.base_path
    )
  }

  /// Map one externalized specifier to its import URL, submitting builds
  /// for referenced sub-packages as a side effect.
  async fn resolve_external_url(
    &self,
    id: &BuildIdentity,
    manifest: &PackageManifest,
    name: &str,
  ) -> Result<String, ForgeError> {
    if name.starts_with("http://")
      || name.starts_with("https://")
      || name.starts_with("data:")
      || name.starts_with("/")
      || id.args.is_external(name)
    {
      return Ok(name.to_string());
    }

    // the package's own main or sub-modules become sibling artefacts
    if name == id.pkg.name {
      let root = Pkg {
        origin: id.pkg.origin,
        name: id.pkg.name.clone(),
        version: id.pkg.version.clone(),
        sub_path: String::new(),
        sub_module: String::new(),
      };
      return Ok(self.artefact_url(id, root, id.args.clone()));
    }
    if let Some(sub) = name.strip_prefix(&format!("{}/", id.pkg.name)) {
      let sub_pkg = Pkg {
        origin: id.pkg.origin,
        name: id.pkg.name.clone(),
        version: id.pkg.version.clone(),
        sub_path: sub.to_string(),
        sub_module: to_module_bare_name(sub),
      };
      return Ok(self.artefact_url(id, sub_pkg, id.args.clone()));
    }

    if is_node_builtin(name) {
      return Ok(
        builtin_import_path(
          name,
          id.target,
          &self.config.base_path,
          id.build_version,
          &self.config.deno_std_version,
        )
        .unwrap_or_else(|| {
          self.error_js_url("unsupported-node-builtin-module", name, &id.pkg.name)
        }),
      );
    }

    if id.args.external_all() {
      return Ok(name.to_string());
    }

    if name == "node-fetch" && id.target != Target::Node {
      return Ok(format!(
        "{}/v{}/node_fetch.js",
        self.config.base_path, id.build_version
      ));
    }

    // `?deps` pins win over the manifest's own ranges
    for dep in &id.args.deps {
      if name == dep.name || name.starts_with(&format!("{}/", dep.name)) {
        let sub = name.strip_prefix(&format!("{}/", dep.name)).unwrap_or("");
        let pkg = Pkg::new(dep.name.clone(), dep.version.clone()).with_sub_path(sub);
        return Ok(self.artefact_url(id, pkg, sub_build_args(id)));
      }
    }

    // react's version is always equalized to react-dom's
    if id.pkg.name == "react-dom" && name == "react" {
      let pkg = Pkg::new("react", id.pkg.version.clone());
      return Ok(self.artefact_url(id, pkg, BuildArgs::default()));
    }

    let (pkg_name, sub_path) = split_pkg_path(name);
    let spec = if pkg_name == id.pkg.name {
      id.pkg.version.clone()
    } else {
      manifest
        .dependency_version(pkg_name)
        .unwrap_or("latest")
        .to_string()
    };
    let resolved = self.registry.resolve(pkg_name, &spec).await?;
    let pkg = Pkg::new(pkg_name, resolved.version.clone()).with_sub_path(sub_path);
    let args = sub_build_args(id);

    let sub_identity = BuildIdentity {
      build_version: id.build_version,
      pkg: pkg.clone(),
      args: args.clone(),
      target: id.target,
      dev: id.dev,
      bundle_mode: BundleMode::Default,
    };
    let already_built = self
      .kv
      .get(&sub_identity.save_path())
      .ok()
      .flatten()
      .is_some();
    if !already_built {
      if let Some(queue) = self.queue.get() {
        // asynchronous on purpose: two packages may depend on each other,
        // so the parent must never wait for the child build
        let _ = queue.add(JobSpec::module(sub_identity.clone()), "builder");
      }
    }
    Ok(self.artefact_url(id, pkg, args))
  }

  /// Export shape of an externalized dependency, for require() lowering.
  /// Only computed when the output actually contains a require call site.
  async fn dep_shape_for(
    &self,
    id: &BuildIdentity,
    wd: &Path,
    name: &str,
    content: &str,
  ) -> Option<DepShape> {
    let bare = name.split('/').next().unwrap_or(name);
    if is_node_builtin(name) || is_node_builtin(bare) {
      return Some(DepShape {
        is_builtin: true,
        ..Default::default()
      });
    }
    let call_site = format!("(\"{EXTERNAL_MARKER}{name}\")");
    if !content.contains(&call_site) {
      return None;
    }
    let (pkg_name, sub_path) = split_pkg_path(name);
    let manifest = read_installed_manifest(wd, pkg_name).ok()?;
    let dep_pkg = Pkg::new(pkg_name, manifest.version.clone()).with_sub_path(sub_path);
    let shape = analyze_module(
      &self.analyzer,
      wd,
      &dep_pkg,
      &manifest,
      id.target,
      &conditions_vec(&id.args),
      id.dev,
    )
    .await;
    Some(DepShape {
      is_builtin: false,
      is_esm: shape.is_esm,
      has_default_export: shape.has_default_export,
      named_exports: shape.named_exports,
    })
  }

  async fn check_dts(&self, id: &BuildIdentity, manifest: &PackageManifest, result: &mut BuildResult) {
    let args_segment = {
      let encoded = esmforge_core::encode_args_prefix(&id.args, &id.pkg, true);
      if encoded.is_empty() {
        String::new()
      } else {
        format!("X-{encoded}/")
      }
    };
    if let Some(types) = manifest.types_entry() {
      result.dts = Some(format!(
        "/v{}/{}{}/{args_segment}{}",
        id.build_version,
        id.pkg.origin.path_prefix(),
        id.pkg.full_name(),
        dts_file_name(types)
      ));
      return;
    }
    if id.pkg.name.starts_with("@types/") {
      return;
    }

    let types_pkg_name = to_types_package_name(&id.pkg.name);
    let mut specs: Vec<String> = Vec::new();
    if let Some(pin) = id.args.dep(&types_pkg_name) {
      specs.push(pin.version.clone());
    }
    let parts: Vec<&str> = id.pkg.version.split('.').collect();
    if parts.len() > 2 {
      specs.push(format!("~{}.{}", parts[0], parts[1]));
      specs.push(format!("^{}", parts[0]));
    }
    specs.push("latest".to_string());

    for spec in specs {
      if let Ok(types_manifest) = self.registry.resolve(&types_pkg_name, &spec).await {
        let entry = types_manifest.types_entry().unwrap_or("index.d.ts");
        result.dts = Some(format!(
          "/v{}/{}@{}/{args_segment}{}",
          id.build_version,
          types_pkg_name,
          types_manifest.version,
          dts_file_name(entry)
        ));
        return;
      }
    }
  }

  async fn build_module(&self, id: &BuildIdentity, stage: Stage) -> JobOutcome {
    let deprecated = if id.pkg.origin == PkgOrigin::Registry {
      self
        .registry
        .resolve(&id.pkg.name, &id.pkg.version)
        .await
        .ok()
        .and_then(|m| m.deprecated)
    } else {
      None
    };

    stage.set("install");
    let wd = self.installer.install(&id.pkg).await?;

    stage.set("build");
    let outcome = self.bundle(id, &wd, deprecated, &stage).await;
    self.installer.schedule_purge(&id.pkg);
    outcome
  }

  async fn bundle(
    &self,
    id: &BuildIdentity,
    wd: &Path,
    deprecated: Option<String>,
    stage: &Stage,
  ) -> JobOutcome {
    let manifest = read_installed_manifest(wd, &id.pkg.name)?;
    let pkg_dir = wd.join("node_modules").join(&id.pkg.name);

    // raw JSON sub-modules skip the bundler entirely
    if id.pkg.sub_path.ends_with(".json") {
      let json = std::fs::read_to_string(pkg_dir.join(&id.pkg.sub_path))
        .map_err(|err| ForgeError::not_found(format!("{}: {err}", id.pkg.import_path())))?;
      let content = format!("export default {json}");
      self
        .files
        .write(&id.save_path(), content.as_bytes())
        .map_err(|err| ForgeError::internal(err.to_string()))?;
      let result = BuildResult {
        has_default_export: true,
        ..Default::default()
      };
      self.store_result(id, &result);
      return Ok(result);
    }

    let conditions = conditions_vec(&id.args);
    let shape = analyze_module(
      &self.analyzer,
      wd,
      &id.pkg,
      &manifest,
      id.target,
      &conditions,
      id.dev,
    )
    .await;

    if manifest.is_types_only() {
      let mut result = BuildResult {
        types_only: true,
        ..Default::default()
      };
      self.check_dts(id, &manifest, &mut result).await;
      self.store_result(id, &result);
      return Ok(result);
    }

    if let Some(reexport) = &shape.reexport {
      let result = self.build_reexport(id, wd, &manifest, &shape, reexport).await?;
      return Ok(result);
    }

    let output = self.run_bundler(id, wd, &manifest, &shape, &conditions).await?;
    let result = self
      .post_process(id, wd, &manifest, &shape, deprecated, output, stage)
      .await?;
    Ok(result)
  }

  /// A package that is a bare re-export of another becomes a forwarding
  /// module pointing at that package's own artefact.
  async fn build_reexport(
    &self,
    id: &BuildIdentity,
    wd: &Path,
    _manifest: &PackageManifest,
    shape: &ModuleShape,
    reexport: &str,
  ) -> JobOutcome {
    let (dep_name, dep_sub) = split_pkg_path(reexport);
    let dep_manifest = match read_installed_manifest(wd, dep_name) {
      Ok(m) => m,
      Err(_) => self.registry.resolve(dep_name, "latest").await?,
    };
    let dep_pkg = Pkg::new(dep_name, dep_manifest.version.clone()).with_sub_path(dep_sub);
    let dep_shape = analyze_module(
      &self.analyzer,
      wd,
      &dep_pkg,
      &dep_manifest,
      id.target,
      &conditions_vec(&id.args),
      id.dev,
    )
    .await;
    let import_url = self.artefact_url(id, dep_pkg, id.args.clone());

    let mut content = format!("export * from \"{import_url}\";\n");
    if dep_shape.has_default_export {
      content.push_str(&format!("export {{ default }} from \"{import_url}\";\n"));
    }
    self
      .files
      .write(&id.save_path(), content.as_bytes())
      .map_err(|err| ForgeError::internal(err.to_string()))?;

    let mut result = BuildResult {
      deps: vec![import_url],
      has_default_export: dep_shape.has_default_export,
      from_cjs: !shape.is_esm,
      ..Default::default()
    };
    self.check_dts(id, &read_installed_manifest(wd, &id.pkg.name)?, &mut result).await;
    self.store_result(id, &result);
    Ok(result)
  }

  fn bundle_options(
    &self,
    id: &BuildIdentity,
    wd: &Path,
    manifest: &PackageManifest,
    shape: &ModuleShape,
    conditions: &[String],
  ) -> BundleOptions {
    let node_env = if id.dev { "development" } else { "production" };
    let mut define = BTreeMap::new();
    if id.target != Target::Node {
      let virtual_name = format!("/_virtual{}", id.url_path());
      let virtual_dir = virtual_name.rsplit_once('/').map(|(d, _)| d.to_string()).unwrap_or_default();
      define.insert("__filename".into(), format!("\"{virtual_name}\""));
      define.insert("__dirname".into(), format!("\"{virtual_dir}\""));
      define.insert("Buffer".into(), "__Buffer$".into());
      define.insert("process".into(), "__Process$".into());
      define.insert("setImmediate".into(), "__setImmediate$".into());
      define.insert("clearImmediate".into(), "clearTimeout".into());
      define.insert("require.resolve".into(), "__rResolve$".into());
      define.insert("global".into(), "__global$".into());
      define.insert("global.Buffer".into(), "__Buffer$".into());
      define.insert("global.process".into(), "__Process$".into());
      define.insert("process.env.NODE_ENV".into(), format!("\"{node_env}\""));
      define.insert(
        "global.process.env.NODE_ENV".into(),
        format!("\"{node_env}\""),
      );
    }

    let mut options = BundleOptions {
      platform: if id.target == Target::Node {
        Platform::Node
      } else {
        Platform::Browser
      },
      target: id.target,
      conditions: conditions.to_vec(),
      minify: !id.dev,
      keep_names: id.args.keep_names,
      ignore_annotations: id.args.ignore_annotations,
      define,
      source_map: !self.config.disable_source_map,
      ..Default::default()
    };

    let import_path = id.pkg.import_path();
    if !shape.is_esm {
      // normalize CJS to ESM through a synthetic entry that re-exports the
      // analyzed named exports and keeps the default-vs-namespace split
      let mut entry = format!("import * as __module from \"{import_path}\";");
      let mut named: Vec<&str> = Vec::new();
      for export in &shape.named_exports {
        if export == "__esModule" {
          entry.push_str("export const __esModule = true;");
        } else {
          named.push(export);
        }
      }
      if !named.is_empty() {
        entry.push_str(&format!("export const {{ {} }} = __module;", named.join(",")));
      }
      entry.push_str("const { default: __default, ...__rest } = __module;");
      entry.push_str("export default (__default !== undefined ? __default : __rest);");
      entry.push_str(&format!("export * from \"{import_path}\";"));
      options.stdin = Some(StdinInput {
        contents: entry,
        resolve_dir: wd.to_path_buf(),
        source_file: "_entry.js".to_string(),
      });
    } else if !id.args.exports.is_empty() {
      // tree-shake an ESM entry down to the requested exports
      let exports: Vec<&str> = id.args.exports.iter().map(String::as_str).collect();
      options.stdin = Some(StdinInput {
        contents: format!(
          "export {{ {} }} from \"{import_path}\";",
          exports.join(",")
        ),
        resolve_dir: wd.to_path_buf(),
        source_file: "_entry.js".to_string(),
      });
    } else {
      let entry = shape.entry.clone().unwrap_or_else(|| {
        manifest.module.clone().unwrap_or_else(|| "index.js".to_string())
      });
      options.entry_point = Some(
        wd.join("node_modules")
          .join(&id.pkg.name)
          .join(entry.trim_start_matches("./")),
      );
    }
    options
  }

  async fn run_bundler(
    &self,
    id: &BuildIdentity,
    wd: &Path,
    manifest: &PackageManifest,
    shape: &ModuleShape,
    conditions: &[String],
  ) -> Result<(crate::bundler::BundleOutput, Arc<ResolvePlugin>), ForgeError> {
    let options = self.bundle_options(id, wd, manifest, shape, conditions);
    let plugin = Arc::new(ResolvePlugin::new(ResolveContext {
      pkg: id.pkg.clone(),
      manifest: manifest.clone(),
      wd: wd.to_path_buf(),
      args: id.args.clone(),
      bundle_mode: id.bundle_mode,
      target: id.target,
      base_path: self.config.base_path.clone(),
      build_version: id.build_version,
    }));

    for _ in 0..MAX_REBUILDS {
      let output = self
        .bundler
        .build(options.clone(), plugin.clone())
        .await
        .map_err(|err| ForgeError::internal(format!("bundler: {err}")))?;

      if let Some(message) = output.errors.first() {
        if let Some(name) = quoted_after(message, "Could not resolve \"") {
          if name == id.pkg.import_path() {
            return Err(ForgeError::not_found(format!("could not resolve \"{name}\"")));
          }
          if plugin.add_implicit_external(&name) {
            continue;
          }
        }
        if let Some(path) = quoted_after(message, "No matching export in \"") {
          if let Some(export) = nth_quoted(message, 1) {
            if export != "default" {
              if let Some(stripped) = path.strip_prefix("browser-exclude:") {
                if plugin.add_browser_exclude_export(stripped, &export) {
                  continue;
                }
              }
            }
          }
        }
        return Err(ForgeError::internal(format!("bundler: {message}")));
      }

      for warning in &output.warnings {
        if warning.starts_with("Could not resolve") {
          tracing::warn!(identity = %id, "bundler: {warning}");
        }
      }
      return Ok((output, plugin));
    }
    Err(ForgeError::internal("bundler: rebuild loop did not converge"))
  }

  #[allow(clippy::too_many_arguments)]
  async fn post_process(
    &self,
    id: &BuildIdentity,
    wd: &Path,
    manifest: &PackageManifest,
    shape: &ModuleShape,
    deprecated: Option<String>,
    (output, plugin): (crate::bundler::BundleOutput, Arc<ResolvePlugin>),
    stage: &Stage,
  ) -> JobOutcome {
    let node_env = if id.dev { "development" } else { "production" };
    let minified = !id.dev;
    let nullish_ok = id.target.supports_nullish_coalescing();
    let externals = plugin.external_deps();

    let mut result = BuildResult {
      has_default_export: shape.has_default_export || !shape.is_esm,
      from_cjs: !shape.is_esm,
      ..Default::default()
    };

    for file in &output.files {
      if file.path.ends_with(".css") {
        self
          .files
          .write(&id.css_save_path(), &file.contents)
          .map_err(|err| ForgeError::internal(err.to_string()))?;
        result.package_css = true;
      } else if file.path.ends_with(".map") {
        if !self.config.disable_source_map {
          self
            .files
            .write(&id.map_save_path(), &file.contents)
            .map_err(|err| ForgeError::internal(err.to_string()))?;
        }
      } else if file.path.ends_with(".js") || file.path.ends_with(".mjs") {
        let raw = String::from_utf8_lossy(&file.contents).into_owned();
        let mut content = strip_shebang(&raw).to_string();

        for (index, name) in externals.iter().enumerate() {
          let identifier = format!("{:x}", externals.len() - index);
          let import_url = self.resolve_external_url(id, manifest, name).await?;
          let dep_shape = self.dep_shape_for(id, wd, name, &content).await;
          content = replace_external(
            &content,
            name,
            &import_url,
            &identifier,
            dep_shape.as_ref(),
            minified,
            nullish_ok,
          );
          let is_error_module = import_url.contains("/error.js?");
          if (import_url.starts_with('/') || import_url.starts_with("http")) && !is_error_module {
            result.deps.push(import_url);
          }
        }

        content = inject_node_globals(
          &content,
          id.target,
          &self.config.base_path,
          id.build_version,
          &self.config.deno_std_version,
          minified,
        );
        if id.target.is_deno() {
          content = replace_window_checks(&content, id.dev);
        }

        if id.bundle_mode == BundleMode::All && !id.target.is_deno() {
          stage.set("bundle");
          content = self.second_pass(id, wd, content).await?;
        }

        let mut final_content = format!(
          "/* esmforge - {} {} {} */\n{}",
          id.pkg,
          id.target.as_str(),
          node_env,
          content
        );
        if let Some(message) = &deprecated {
          final_content.push_str(&format!(
            "console.warn(\"[npm] %cdeprecated%c {}@{}: {}\", \"color:red\", \"\");\n",
            id.pkg.name, id.pkg.version, message
          ));
        }
        if !self.config.disable_source_map {
          let map_name = id
            .save_path()
            .rsplit('/')
            .next()
            .map(|n| format!("{n}.map"))
            .unwrap_or_default();
          final_content.push_str(&format!("//# sourceMappingURL={map_name}"));
        }

        self
          .files
          .write(&id.save_path(), final_content.as_bytes())
          .map_err(|err| ForgeError::internal(err.to_string()))?;
      }
    }

    self.check_dts(id, manifest, &mut result).await;
    self.store_result(id, &result);
    Ok(result)
  }

  /// Second bundling pass for `?bundle`: inline the embedded polyfills,
  /// keep everything else external.
  async fn second_pass(
    &self,
    id: &BuildIdentity,
    wd: &Path,
    content: String,
  ) -> Result<String, ForgeError> {
    let options = BundleOptions {
      stdin: Some(StdinInput {
        contents: content.clone(),
        resolve_dir: wd.to_path_buf(),
        source_file: "_output.js".to_string(),
      }),
      platform: Platform::Browser,
      target: id.target,
      minify: !id.dev,
      source_map: false,
      ..Default::default()
    };
    let plugin = Arc::new(EmbedInlinePlugin {
      base_path: self.config.base_path.clone(),
      build_version: id.build_version,
    });
    let output = self
      .bundler
      .build(options, plugin)
      .await
      .map_err(|err| ForgeError::internal(format!("bundler: {err}")))?;
    if let Some(message) = output.errors.first() {
      return Err(ForgeError::internal(format!("bundler: {message}")));
    }
    for file in output.files {
      if file.path.ends_with(".js") || file.path.ends_with(".mjs") {
        return Ok(String::from_utf8_lossy(&file.contents).into_owned());
      }
    }
    Ok(content)
  }

  async fn build_types(&self, id: &BuildIdentity, stage: Stage) -> JobOutcome {
    stage.set("install");
    let wd = self.installer.install(&id.pkg).await?;

    stage.set("transform-dts");
    let manifest = read_installed_manifest(&wd, &id.pkg.name)?;
    let entry = if id.pkg.sub_path.ends_with(".d.ts") || id.pkg.sub_path.ends_with(".d.mts") {
      id.pkg.sub_path.clone()
    } else {
      manifest
        .types_entry()
        .map(|t| t.trim_start_matches("./").to_string())
        .ok_or_else(|| ForgeError::not_found("types not found"))?
    };

    let count = crate::dts::transform_dts(crate::dts::DtsContext {
      files: self.files.clone(),
      registry: self.registry.clone(),
      base_path: self.config.base_path.clone(),
      build_version: id.build_version,
      identity: id.clone(),
      manifest: manifest.clone(),
      wd: wd.clone(),
    }, &entry)
    .await?;
    tracing::debug!(identity = %id, count, "types transformed");

    self.installer.schedule_purge(&id.pkg);
    Ok(BuildResult::default())
  }
}

#[async_trait]
impl JobRunner for BuildService {
  #[tracing::instrument(level = "info", skip(self, stage), fields(identity = %spec.identity))]
  async fn run(&self, spec: &JobSpec, stage: Stage) -> JobOutcome {
    match spec.kind {
      JobKind::Module => self.build_module(&spec.identity, stage).await,
      JobKind::Types => self.build_types(&spec.identity, stage).await,
    }
  }
}

/// Args a discovered dependency build inherits: pins and externals carry
/// over, per-entry options (exports, conditions, jsx runtime) do not.
fn sub_build_args(id: &BuildIdentity) -> BuildArgs {
  BuildArgs {
    deps: id.args.deps.clone(),
    external: id.args.external.clone(),
    ..Default::default()
  }
}

fn conditions_vec(args: &BuildArgs) -> Vec<String> {
  args.conditions.iter().cloned().collect()
}

fn to_types_package_name(name: &str) -> String {
  match name.strip_prefix('@') {
    Some(rest) => format!("@types/{}", rest.replacen('/', "__", 1)),
    None => format!("@types/{name}"),
  }
}

fn dts_file_name(entry: &str) -> String {
  let entry = entry.trim_start_matches("./");
  if entry.ends_with(".d.ts") || entry.ends_with(".d.mts") {
    return entry.to_string();
  }
  for ext in [".mjs", ".cjs", ".js"] {
    if let Some(stripped) = entry.strip_suffix(ext) {
      return format!("{stripped}.d.ts");
    }
  }
  format!("{entry}.d.ts")
}

/// First quoted string after a prefix: `Could not resolve "<here>"`.
fn quoted_after(message: &str, prefix: &str) -> Option<String> {
  let rest = message.strip_prefix(prefix)?;
  rest.split('"').next().map(str::to_string)
}

/// The n-th quoted string of a message (0-based).
fn nth_quoted(message: &str, n: usize) -> Option<String> {
  message
    .split('"')
    .skip(1)
    .step_by(2)
    .nth(n)
    .map(str::to_string)
}

struct EmbedInlinePlugin {
  base_path: String,
  build_version: u32,
}

#[async_trait]
impl BundlePlugin for EmbedInlinePlugin {
  async fn on_resolve(&self, args: &OnResolveArgs) -> anyhow::Result<Option<OnResolveResult>> {
    let prefix = format!("{}/v{}/", self.base_path, self.build_version);
    if let Some(rest) = args.path.strip_prefix(&prefix) {
      let name = rest.trim_end_matches(".js");
      if embedded_polyfill(name).is_some() {
        return Ok(Some(OnResolveResult::in_namespace(name, "embed")));
      }
    }
    Ok(Some(OnResolveResult::external(args.path.clone())))
  }

  async fn on_load(&self, args: &OnLoadArgs) -> anyhow::Result<Option<OnLoadResult>> {
    if args.namespace == "embed" {
      if let Some(source) = embedded_polyfill(&args.path) {
        return Ok(Some(OnLoadResult {
          contents: source.to_string(),
          loader: Loader::Js,
        }));
      }
    }
    Ok(None)
  }
}
