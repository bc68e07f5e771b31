//! The request router: URL → cache hit, queued build, redirect, or error.
//!
//! Stateless per request; every mutating effect goes through the queue or
//! the stores. The handler follows one long classification pipeline, the
//! same order for every request: ban check → base path → meta routes →
//! build-version prefix → package parse → policy → response type.

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::http::HeaderMap;
use axum::http::Method;
use axum::http::StatusCode;
use axum::http::Uri;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use sha1::Digest;
use sha1::Sha1;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use esmforge_core::is_full_version;
use esmforge_core::target_from_ua;
use esmforge_core::to_module_bare_name;
use esmforge_core::BuildArgs;
use esmforge_core::BuildIdentity;
use esmforge_core::BuildResult;
use esmforge_core::BundleMode;
use esmforge_core::ErrorKind;
use esmforge_core::ForgeError;
use esmforge_core::Pkg;
use esmforge_core::PkgOrigin;
use esmforge_core::PkgRequest;
use esmforge_core::Target;
use esmforge_npm::github;
use esmforge_npm::NpmRc;
use esmforge_npm::PackageRegistry;
use esmforge_npm::RegistryClient;

use crate::build::polyfills::css_package_entry;
use crate::build::polyfills::embedded_polyfill;
use crate::config::BUILD_VERSION;
use crate::dts::ORIGIN_PLACEHOLDER;
use crate::queue::JobSpec;
use crate::state::AppState;

const CC_MUST_REVALIDATE: &str = "public, max-age=0, must-revalidate";
const CC_NO_STORE: &str = "private, no-store, no-cache, must-revalidate";
const CC_10MIN: &str = "public, max-age=600";
const CC_IMMUTABLE: &str = "public, max-age=31536000, immutable";
const CT_JAVASCRIPT: &str = "application/javascript; charset=utf-8";
const CT_TYPESCRIPT: &str = "application/typescript; charset=utf-8";
const CT_JSON: &str = "application/json; charset=utf-8";
const CT_CSS: &str = "text/css; charset=utf-8";
const CT_HTML: &str = "text/html; charset=utf-8";

const RAW_FILE_LIMIT: u64 = 50 * 1024 * 1024;
const TRANSFORM_CODE_LIMIT: usize = 1024 * 1024;

static RE_LOC_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r":\d+:\d+$").unwrap());
static RE_BUILD_VERSION_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/v(\d+)(/|$)").unwrap());
static RE_JS_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z_$][\w$]*$").unwrap());

pub fn build_router(state: AppState) -> Router {
  Router::new()
    .route("/transform", post(handle_transform))
    .route("/purge", post(handle_purge))
    .fallback(handle_request)
    .layer(TraceLayer::new_for_http())
    .layer(
      CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .expose_headers([header::HeaderName::from_static("x-typescript-types")]),
    )
    .with_state(state)
}

/// Parsed query string preserving the raw form for redirects.
#[derive(Clone, Debug, Default)]
struct Query {
  raw: String,
  pairs: Vec<(String, String)>,
}

impl Query {
  fn parse(raw: &str) -> Self {
    let pairs = url::form_urlencoded::parse(raw.as_bytes())
      .map(|(k, v)| (k.into_owned(), v.into_owned()))
      .collect();
    Self {
      raw: raw.to_string(),
      pairs,
    }
  }

  fn splice(&mut self, extra: &str) {
    let mut merged = extra.to_string();
    if !self.raw.is_empty() {
      merged.push('&');
      merged.push_str(&self.raw);
    }
    *self = Query::parse(&merged);
  }

  fn get(&self, key: &str) -> Option<&str> {
    self
      .pairs
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.as_str())
  }

  fn has(&self, key: &str) -> bool {
    self.pairs.iter().any(|(k, _)| k == key)
  }

  fn list(&self, key: &str) -> Vec<String> {
    self
      .get(key)
      .map(|v| {
        v.split(',')
          .map(str::trim)
          .filter(|s| !s.is_empty())
          .map(str::to_string)
          .collect()
      })
      .unwrap_or_default()
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ResType {
  /// Module bare name: responds with the wrapper module.
  Bare,
  /// A compiled js/css artefact under a target segment.
  Build,
  /// A compiled source map.
  BuildMap,
  /// A `.d.ts`/`.d.mts` types artefact.
  Types,
  /// A raw file from the package sources.
  Raw,
}

struct RequestContext {
  state: AppState,
  user_agent: String,
  cdn_origin: String,
  if_none_match: Option<String>,
  query: Query,
}

impl RequestContext {
  fn origin_base(&self) -> String {
    format!("{}{}", self.cdn_origin, self.state.config.base_path)
  }
}

fn response(status: StatusCode, content_type: &str, cache: &str, body: Vec<u8>) -> Response {
  Response::builder()
    .status(status)
    .header(header::CONTENT_TYPE, content_type)
    .header(header::CACHE_CONTROL, cache)
    .body(Body::from(body))
    .unwrap()
}

fn text(status: StatusCode, cache: &str, body: impl Into<String>) -> Response {
  response(status, "text/plain; charset=utf-8", cache, body.into().into_bytes())
}

fn redirect(location: String, cache: &str) -> Response {
  Response::builder()
    .status(StatusCode::FOUND)
    .header(header::LOCATION, location)
    .header(header::CACHE_CONTROL, cache)
    .body(Body::empty())
    .unwrap()
}

fn add_vary_user_agent(response: &mut Response) {
  response
    .headers_mut()
    .append(header::VARY, header::HeaderValue::from_static("User-Agent"));
}

/// A 500 whose body is itself a module throwing at evaluation time, so
/// browser importers see a readable error without a second fetch.
fn throw_error_js(message: &str, cacheable: bool) -> Response {
  let body = format!(
    "/* esmforge - error */\nthrow new Error({});\nexport default null;\n",
    serde_json::to_string(&format!("[esmforge] {message}")).unwrap_or_default()
  );
  response(
    StatusCode::INTERNAL_SERVER_ERROR,
    CT_JAVASCRIPT,
    if cacheable { CC_10MIN } else { CC_NO_STORE },
    body.into_bytes(),
  )
}

fn error_response(err: &ForgeError) -> Response {
  let status = StatusCode::from_u16(err.kind.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  let cache = match err.kind {
    ErrorKind::Timeout => CC_MUST_REVALIDATE,
    ErrorKind::Internal | ErrorKind::Upstream => CC_NO_STORE,
    _ => CC_MUST_REVALIDATE,
  };
  text(status, cache, err.message.clone())
}

fn finish(method: &Method, mut response: Response) -> Response {
  if method == Method::HEAD {
    *response.body_mut() = Body::empty();
  }
  response
}

async fn handle_request(
  State(state): State<AppState>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
) -> Response {
  if method != Method::GET && method != Method::HEAD {
    return text(StatusCode::NOT_FOUND, CC_MUST_REVALIDATE, "not found");
  }
  let user_agent = headers
    .get(header::USER_AGENT)
    .and_then(|v| v.to_str().ok())
    .unwrap_or_default()
    .to_string();
  let cdn_origin = headers
    .get("x-real-origin")
    .and_then(|v| v.to_str().ok())
    .map(str::to_string)
    .or_else(|| state.config.cdn_origin.clone())
    .or_else(|| {
      headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|host| format!("http://{host}"))
    })
    .unwrap_or_default();

  let mut ctx = RequestContext {
    state,
    user_agent,
    cdn_origin,
    if_none_match: headers
      .get(header::IF_NONE_MATCH)
      .and_then(|v| v.to_str().ok())
      .map(str::to_string),
    query: Query::parse(uri.query().unwrap_or_default()),
  };

  let npmrc_header = headers.get("x-npmrc").and_then(|v| v.to_str().ok());
  match route(&mut ctx, uri.path(), npmrc_header).await {
    Ok(response) => finish(&method, response),
    Err(err) => finish(&method, error_response(&err)),
  }
}

async fn route(
  ctx: &mut RequestContext,
  pathname: &str,
  npmrc_header: Option<&str>,
) -> Result<Response, ForgeError> {
  let config = ctx.state.config.clone();
  let mut pathname = pathname.to_string();

  // malicious probes never reach the parser
  if pathname.starts_with("/.") || pathname.ends_with(".php") {
    return Ok(text(StatusCode::NOT_FOUND, CC_MUST_REVALIDATE, "not found"));
  }

  // strip a base path, redirecting requests that lack it
  if !config.base_path.is_empty() {
    match pathname.strip_prefix(&config.base_path) {
      Some(rest) if rest.is_empty() => pathname = "/".to_string(),
      Some(rest) if rest.starts_with('/') => pathname = rest.to_string(),
      _ => {
        return Ok(redirect(
          format!("{}{}{pathname}", ctx.cdn_origin, config.base_path),
          CC_10MIN,
        ));
      }
    }
  }

  // editor pastes carry a `:line:column` suffix
  if pathname.contains(':') {
    pathname = RE_LOC_SUFFIX.replace(&pathname, "").into_owned();
  }

  match pathname.as_str() {
    "/" => return Ok(index_page(ctx)),
    "/status.json" => return Ok(status_json(ctx)),
    "/esma-target" => {
      let mut res = text(
        StatusCode::OK,
        CC_MUST_REVALIDATE,
        target_from_ua(&ctx.user_agent).as_str(),
      );
      add_vary_user_agent(&mut res);
      return Ok(res);
    }
    "/error.js" => return Ok(error_js(ctx)),
    "/favicon.ico" => return Ok(text(StatusCode::NOT_FOUND, CC_MUST_REVALIDATE, "not found")),
    _ => {}
  }

  // modules stored by POST /transform
  if let Some(rest) = pathname.strip_prefix("/+") {
    return serve_transformed_module(ctx, rest);
  }

  // build-version prefix: /stable/ or /vN/
  let mut build_version = BUILD_VERSION;
  let mut has_version_prefix = false;
  if let Some(rest) = pathname.strip_prefix("/stable") {
    if rest.is_empty() || rest.starts_with('/') {
      pathname = if rest.is_empty() { "/".into() } else { rest.to_string() };
      has_version_prefix = true;
    }
  } else if let Some(caps) = RE_BUILD_VERSION_PREFIX.captures(&pathname) {
    let v: u32 = caps[1].parse().unwrap_or(0);
    if v == 0 || v > BUILD_VERSION {
      return Err(ForgeError::invalid_request("unsupported build version"));
    }
    build_version = v;
    let prefix_len = caps.get(0).unwrap().end() - usize::from(caps[0].ends_with('/'));
    pathname = pathname[prefix_len..].to_string();
    if pathname.is_empty() {
      pathname = "/".to_string();
    }
    has_version_prefix = true;
  }

  // embedded polyfill stubs live directly under the version prefix
  if has_version_prefix && pathname.matches('/').count() == 1 {
    if let Some(name) = pathname
      .strip_prefix("/node_")
      .and_then(|rest| rest.strip_suffix(".js"))
    {
      let source = embedded_polyfill(&format!("node_{name}")).unwrap_or("export default {};\n");
      return Ok(response(
        StatusCode::OK,
        CT_JAVASCRIPT,
        CC_IMMUTABLE,
        source.as_bytes().to_vec(),
      ));
    }
  }

  // `/*pkg` and `/gh/*owner/repo` mean "externalize everything"
  let mut external_all = false;
  if let Some(rest) = pathname.strip_prefix("/*") {
    external_all = true;
    pathname = format!("/{rest}");
  } else if let Some(rest) = pathname.strip_prefix("/gh/*") {
    external_all = true;
    pathname = format!("/gh/{rest}");
  }

  // a request may carry its own registry configuration
  let request_registry: Option<RegistryClient> = match npmrc_header {
    Some(raw) => Some(RegistryClient::new(NpmRc::from_json(raw)?)),
    None => None,
  };

  let mut request = PkgRequest::parse(&pathname)?;
  if let Some(extra) = request.extra_query.take() {
    ctx.query.splice(&extra);
  }

  if !config.is_allowed(&request.name) || config.is_banned(&request.name) {
    return Err(ForgeError::forbidden("forbidden"));
  }

  // `?path=$SUB` overrides the sub-path
  if let Some(path) = ctx.query.get("path") {
    request.sub_path = path.trim_matches('/').to_string();
  }

  // `https://host/react?dev/jsx-runtime` style query suffixes
  for jsx in ["jsx-runtime", "jsx-dev-runtime"] {
    let suffix = format!("/{jsx}");
    if ctx.query.raw.ends_with(&suffix) {
      request.sub_path = if request.sub_path.is_empty() {
        jsx.to_string()
      } else {
        format!("{}/{jsx}", request.sub_path)
      };
      let trimmed = ctx.query.raw.trim_end_matches(&suffix).to_string();
      ctx.query = Query::parse(&trimmed);
    }
  }

  // resolve the version spec to a pinned version
  let resolved_version = resolve_version(ctx, request_registry.as_ref(), &request).await?;
  let caret = request.spec.starts_with('^');
  let pinned_in_path = pathname.contains(&format!("@{resolved_version}"));
  let pkg = request.clone().into_pkg(resolved_version.clone());

  // `@types/x` bare requests go straight to the types file
  if pkg.name.starts_with("@types/") && pkg.sub_path.is_empty() {
    let manifest = lookup(ctx, request_registry.as_ref(), &pkg.name, &pkg.version).await?;
    let types = manifest.types_entry().unwrap_or("index.d.ts");
    return Ok(redirect(
      format!(
        "{}/{}/{}",
        ctx.origin_base(),
        pkg.full_name(),
        types.trim_start_matches("./")
      ),
      CC_10MIN,
    ));
  }

  // pure-CSS packages redirect to their stylesheet
  if pkg.sub_path.is_empty() {
    if let Some(css) = css_package_entry(&pkg.name) {
      return Ok(redirect(
        format!("{}/{}/{css}", ctx.origin_base(), pkg.full_name()),
        CC_10MIN,
      ));
    }
  }

  // classify the response type
  let mut res_type = ResType::Bare;
  if !pkg.sub_path.is_empty() {
    let name = pkg.sub_path.rsplit('/').next().unwrap_or_default();
    if name.ends_with(".d.ts") || name.ends_with(".d.mts") {
      res_type = ResType::Types;
    } else if name.ends_with(".mjs.map") || name.ends_with(".js.map") {
      res_type = if has_version_prefix { ResType::BuildMap } else { ResType::Raw };
    } else if name.ends_with(".mjs") || name.ends_with(".js") {
      res_type = if has_version_prefix { ResType::Build } else { ResType::Bare };
    } else if name.ends_with(".css") {
      res_type = if has_version_prefix { ResType::Build } else { ResType::Raw };
    } else if name.contains('.') {
      res_type = ResType::Raw;
    }
  }
  if ctx.query.has("raw") {
    res_type = ResType::Raw;
  }

  // redirect to the canonical URL carrying the full version
  if !pinned_in_path {
    let skip = caret && res_type == ResType::Bare && pkg.origin == PkgOrigin::Registry;
    if !skip {
      return Ok(canonical_redirect(ctx, &pkg, external_all, has_version_prefix, build_version));
    }
  }

  match res_type {
    ResType::Raw => serve_raw(ctx, &pkg).await,
    ResType::Types => serve_types(ctx, pkg, build_version).await,
    ResType::BuildMap | ResType::Build => {
      serve_build(ctx, pkg, build_version, &pathname, res_type).await
    }
    ResType::Bare => serve_bare(ctx, pkg, build_version, has_version_prefix, external_all, caret).await,
  }
}

async fn resolve_version(
  ctx: &RequestContext,
  request_registry: Option<&RegistryClient>,
  request: &PkgRequest,
) -> Result<String, ForgeError> {
  if request.origin == PkgOrigin::CodeHost {
    return github::resolve_ref(&request.name, &request.spec).await;
  }
  if is_full_version(&request.spec) {
    return Ok(request.spec.clone());
  }
  let manifest = lookup(ctx, request_registry, &request.name, &request.spec).await?;
  Ok(manifest.version)
}

async fn lookup(
  ctx: &RequestContext,
  request_registry: Option<&RegistryClient>,
  name: &str,
  spec: &str,
) -> Result<esmforge_npm::PackageManifest, ForgeError> {
  match request_registry {
    Some(registry) => registry.resolve(name, spec).await,
    None => ctx.state.registry.resolve(name, spec).await,
  }
}

fn canonical_redirect(
  ctx: &RequestContext,
  pkg: &Pkg,
  external_all: bool,
  has_version_prefix: bool,
  build_version: u32,
) -> Response {
  let mut url = ctx.origin_base();
  if has_version_prefix {
    url.push_str(&format!("/v{build_version}"));
  }
  url.push('/');
  if pkg.origin == PkgOrigin::CodeHost {
    url.push_str("gh/");
  }
  if external_all {
    url.push('*');
  }
  url.push_str(&pkg.full_name());
  if !pkg.sub_path.is_empty() {
    url.push('/');
    url.push_str(&pkg.sub_path);
  }
  if !ctx.query.raw.is_empty() {
    url.push('?');
    url.push_str(&ctx.query.raw);
  }
  redirect(url, CC_10MIN)
}

fn index_page(ctx: &RequestContext) -> Response {
  let etag = format!("W/\"v{BUILD_VERSION}\"");
  if ctx.if_none_match.as_deref() == Some(etag.as_str()) {
    return Response::builder()
      .status(StatusCode::NOT_MODIFIED)
      .header(header::ETAG, &etag)
      .body(Body::empty())
      .unwrap();
  }
  let body = format!(
    "<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>esmforge</title></head>\n\
     <body>\n<h1>esmforge</h1>\n<p>A transforming CDN for registry packages \
     (build v{BUILD_VERSION}).</p>\n<pre>GET {}/react@18.2.0</pre>\n</body>\n</html>\n",
    ctx.origin_base()
  );
  let mut res = response(StatusCode::OK, CT_HTML, CC_MUST_REVALIDATE, body.into_bytes());
  res
    .headers_mut()
    .insert(header::ETAG, header::HeaderValue::from_str(&etag).unwrap());
  res
}

fn status_json(ctx: &RequestContext) -> Response {
  #[derive(Serialize)]
  #[serde(rename_all = "camelCase")]
  struct Status {
    build_queue: Vec<crate::queue::TaskStatus>,
    version: u32,
    uptime: String,
  }
  let status = Status {
    build_queue: ctx.state.queue.status(),
    version: BUILD_VERSION,
    uptime: format!("{}s", ctx.state.started_at.elapsed().as_secs()),
  };
  response(
    StatusCode::OK,
    CT_JSON,
    CC_MUST_REVALIDATE,
    serde_json::to_vec(&status).unwrap_or_default(),
  )
}

fn error_js(ctx: &RequestContext) -> Response {
  let name = ctx.query.get("name").unwrap_or("?");
  let importer = ctx.query.get("importer").unwrap_or("?");
  let message = match ctx.query.get("type") {
    Some("resolve") => format!("Could not resolve \"{name}\" (Imported by \"{importer}\")"),
    Some("unsupported-node-builtin-module") => {
      format!("Unsupported Node builtin module \"{name}\" (Imported by \"{importer}\")")
    }
    Some("unsupported-node-native-module") => {
      format!("Unsupported node native module \"{name}\" (Imported by \"{importer}\")")
    }
    Some("unsupported-npm-package") => {
      format!("Unsupported NPM package \"{name}\" (Imported by \"{importer}\")")
    }
    Some("unsupported-file-dependency") => {
      format!("Unsupported file dependency \"{name}\" (Imported by \"{importer}\")")
    }
    _ => "Unknown error".to_string(),
  };
  throw_error_js(&message, true)
}

fn serve_transformed_module(ctx: &RequestContext, rest: &str) -> Result<Response, ForgeError> {
  let (hash, ext) = rest.rsplit_once('.').unwrap_or((rest, ""));
  if hash.len() != 40 || ext != "mjs" || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
    return Err(ForgeError::not_found("not found"));
  }
  let target = target_from_ua(&ctx.user_agent);
  let save_path = format!("modules/{hash}.{target}.mjs");
  let data = ctx
    .state
    .files
    .read(&save_path)
    .map_err(|err| match err.kind() {
      std::io::ErrorKind::NotFound => ForgeError::not_found("not found"),
      _ => ForgeError::internal(err.to_string()),
    })?;
  let mut res = response(StatusCode::OK, CT_JAVASCRIPT, CC_IMMUTABLE, data);
  add_vary_user_agent(&mut res);
  Ok(res)
}

async fn serve_raw(ctx: &RequestContext, pkg: &Pkg) -> Result<Response, ForgeError> {
  let wd = ctx.state.installer.install(pkg).await?;
  let file = wd.join("node_modules").join(&pkg.name).join(&pkg.sub_path);
  let meta = std::fs::metadata(&file)
    .map_err(|_| ForgeError::not_found("file not found"))?;
  if !meta.is_file() {
    return Err(ForgeError::not_found("file not found"));
  }
  if meta.len() > RAW_FILE_LIMIT {
    return Err(ForgeError::forbidden("file too large"));
  }
  let data = std::fs::read(&file).map_err(|err| ForgeError::internal(err.to_string()))?;
  ctx.state.installer.schedule_purge(pkg);

  // `?module` wraps a wasm file as an importable module
  if pkg.sub_path.ends_with(".wasm") && ctx.query.has("module") {
    let wasm_url = format!("{}/{}/{}", ctx.origin_base(), pkg.full_name(), pkg.sub_path);
    let body = format!(
      "/* esmforge - wasm module */\nconst data = await fetch({}).then(r => r.arrayBuffer());\nexport default new WebAssembly.Module(data);\n",
      serde_json::to_string(&wasm_url).unwrap_or_default()
    );
    return Ok(response(StatusCode::OK, CT_JAVASCRIPT, CC_IMMUTABLE, body.into_bytes()));
  }

  Ok(response(
    StatusCode::OK,
    raw_content_type(&pkg.sub_path),
    CC_IMMUTABLE,
    data,
  ))
}

fn raw_content_type(path: &str) -> &'static str {
  let ext = path.rsplit('.').next().unwrap_or_default();
  match ext {
    "js" | "mjs" | "cjs" | "jsx" => CT_JAVASCRIPT,
    "ts" | "mts" | "tsx" => CT_TYPESCRIPT,
    "css" => CT_CSS,
    "json" | "map" => CT_JSON,
    "svg" => "image/svg+xml",
    "png" => "image/png",
    "jpg" | "jpeg" => "image/jpeg",
    "webp" => "image/webp",
    "gif" => "image/gif",
    "wasm" => "application/wasm",
    "woff" => "font/woff",
    "woff2" => "font/woff2",
    "ttf" => "font/ttf",
    "otf" => "font/otf",
    "eot" => "application/vnd.ms-fontobject",
    _ => "application/octet-stream",
  }
}

/// Strip and decode a leading `X-…` args segment from the sub-path.
fn take_args_segment(pkg: &mut Pkg) -> Result<BuildArgs, ForgeError> {
  let mut segments: Vec<&str> = pkg.sub_path.split('/').collect();
  if segments.len() > 1 && segments[0].starts_with("X-") {
    let args = esmforge_core::decode_args_prefix(segments[0].trim_start_matches("X-"))?;
    segments.remove(0);
    pkg.sub_path = segments.join("/");
    pkg.sub_module = to_module_bare_name(&pkg.sub_path);
    return Ok(args);
  }
  Ok(BuildArgs::default())
}

async fn serve_types(
  ctx: &RequestContext,
  mut pkg: Pkg,
  build_version: u32,
) -> Result<Response, ForgeError> {
  let args = take_args_segment(&mut pkg)?;
  let identity = BuildIdentity {
    build_version,
    pkg,
    args,
    target: Target::default(),
    dev: false,
    bundle_mode: BundleMode::Default,
  };
  let save_path = format!("{}/{}", identity.types_prefix(), identity.pkg.sub_path);

  if ctx.state.files.stat(&save_path).is_err() {
    let handle = ctx.state.queue.add(JobSpec::types(identity.clone()), &ctx.user_agent);
    ctx
      .state
      .queue
      .wait(handle, ctx.state.config.build_timeout())
      .await?;
  }

  let data = ctx
    .state
    .files
    .read(&save_path)
    .map_err(|_| ForgeError::not_found("types not found"))?;
  let body = String::from_utf8_lossy(&data).replace(ORIGIN_PLACEHOLDER, &ctx.origin_base());
  Ok(response(
    StatusCode::OK,
    CT_TYPESCRIPT,
    CC_IMMUTABLE,
    body.into_bytes(),
  ))
}

/// Parse the target segment and file-name suffixes of an artefact URL into
/// a build identity.
fn build_identity_from_path(
  mut pkg: Pkg,
  build_version: u32,
  mut args: BuildArgs,
) -> Result<BuildIdentity, ForgeError> {
  args.normalize(&pkg);
  let segments: Vec<&str> = pkg.sub_path.split('/').collect();
  if segments.len() < 2 {
    return Err(ForgeError::invalid_request("invalid build path"));
  }
  let target: Target = segments[0]
    .parse()
    .map_err(|_| ForgeError::invalid_request("invalid build target"))?;

  let file = segments[1..].join("/");
  let mut stem = file.clone();
  for ext in [".mjs.map", ".js.map", ".mjs", ".js", ".css"] {
    if let Some(stripped) = stem.strip_suffix(ext) {
      stem = stripped.to_string();
      break;
    }
  }
  let mut bundle_mode = BundleMode::Default;
  if let Some(stripped) = stem.strip_suffix(".bundle") {
    stem = stripped.to_string();
    bundle_mode = BundleMode::All;
  } else if let Some(stripped) = stem.strip_suffix(".nobundle") {
    stem = stripped.to_string();
    bundle_mode = BundleMode::None;
  }
  let mut dev = false;
  if let Some(stripped) = stem.strip_suffix(".development") {
    stem = stripped.to_string();
    dev = true;
  }

  let base = pkg.module_base_name();
  if stem == base {
    pkg.sub_path = String::new();
    pkg.sub_module = String::new();
  } else {
    pkg.sub_path = stem.clone();
    pkg.sub_module = stem;
  }

  Ok(BuildIdentity {
    build_version,
    pkg,
    args,
    target,
    dev,
    bundle_mode,
  })
}

async fn serve_build(
  ctx: &RequestContext,
  mut pkg: Pkg,
  build_version: u32,
  pathname: &str,
  res_type: ResType,
) -> Result<Response, ForgeError> {
  let direct_path = format!("builds/v{build_version}{pathname}");
  let is_css = pkg.sub_path.ends_with(".css");
  let content_type = if res_type == ResType::BuildMap {
    CT_JSON
  } else if is_css {
    CT_CSS
  } else {
    CT_JAVASCRIPT
  };

  if let Ok(data) = ctx.state.files.read(&direct_path) {
    return Ok(build_file_response(ctx, pathname, content_type, data));
  }
  if res_type == ResType::BuildMap {
    return Err(ForgeError::not_found("not found"));
  }

  // miss: reconstruct the identity and build it
  let args = take_args_segment(&mut pkg)?;
  let sub_path_before = pkg.sub_path.clone();
  let identity = build_identity_from_path(pkg, build_version, args)?;

  let handle = ctx
    .state
    .queue
    .add(JobSpec::module(identity.clone()), &ctx.user_agent);
  let outcome = ctx
    .state
    .queue
    .wait(handle, ctx.state.config.build_timeout())
    .await;
  if let Err(err) = outcome {
    if err.kind == ErrorKind::NotFound {
      // the classic `.js` → `.mjs` migration: retry under the new extension
      if sub_path_before.ends_with(".js") && !sub_path_before.ends_with(".min.js") {
        let url = format!(
          "{}{}.mjs",
          ctx.origin_base(),
          pathname.trim_end_matches(".js")
        );
        return Ok(redirect(url, CC_10MIN));
      }
      return Err(err);
    }
    if err.kind == ErrorKind::Timeout {
      return Err(err);
    }
    return Ok(throw_error_js(&err.message, false));
  }

  let save_path = if is_css {
    identity.css_save_path()
  } else {
    identity.save_path()
  };
  let data = ctx
    .state
    .files
    .read(&save_path)
    .map_err(|_| ForgeError::not_found("file not found"))?;

  // a non-canonical args encoding lands on a different identity path
  if save_path != direct_path {
    return Ok(redirect(
      format!("{}{}", ctx.origin_base(), identity.url_path()),
      CC_10MIN,
    ));
  }
  Ok(build_file_response(ctx, pathname, content_type, data))
}

fn build_file_response(
  ctx: &RequestContext,
  pathname: &str,
  content_type: &str,
  data: Vec<u8>,
) -> Response {
  if ctx.query.has("worker") && content_type == CT_JAVASCRIPT {
    let module_url = format!("{}{pathname}", ctx.origin_base());
    return response(
      StatusCode::OK,
      CT_JAVASCRIPT,
      CC_IMMUTABLE,
      worker_factory(&module_url).into_bytes(),
    );
  }
  response(StatusCode::OK, content_type, CC_IMMUTABLE, data)
}

fn worker_factory(module_url: &str) -> String {
  format!(
    "export default function workerFactory(injectOrOptions) {{ \
     const options = typeof injectOrOptions === \"string\" ? {{ inject: injectOrOptions }} : injectOrOptions ?? {{}}; \
     const {{ inject, name = \"{module_url}\" }} = options; \
     const blob = new Blob(['import * as $module from \"{module_url}\";', inject].filter(Boolean), {{ type: \"application/javascript\" }}); \
     return new Worker(URL.createObjectURL(blob), {{ type: \"module\", name }}) }}"
  )
}

#[allow(clippy::too_many_arguments)]
async fn serve_bare(
  ctx: &RequestContext,
  pkg: Pkg,
  build_version: u32,
  has_version_prefix: bool,
  external_all: bool,
  caret: bool,
) -> Result<Response, ForgeError> {
  let query = &ctx.query;
  let mut args = BuildArgs::default();

  if external_all {
    args.external.insert("*".to_string());
  }
  for entry in query.list("external") {
    if entry == "*" {
      args.external.clear();
      args.external.insert("*".to_string());
      break;
    }
    args.external.insert(entry);
  }
  if let Some(alias) = query.get("alias") {
    for pair in alias.split(',') {
      if let Some((name, to)) = pair.trim().split_once(':') {
        let (name, to) = (name.trim(), to.trim());
        if !name.is_empty() && !to.is_empty() && name != pkg.name {
          args.alias.insert(name.to_string(), to.to_string());
        }
      }
    }
  }
  for dep in query.list("deps") {
    let request = PkgRequest::parse(&format!("/{dep}"))
      .map_err(|_| ForgeError::invalid_request(format!("invalid deps query: {dep}")))?;
    if !is_full_version(&request.spec) {
      let manifest = ctx.state.registry.resolve(&request.name, &request.spec).await?;
      args.add_dep(Pkg::new(request.name, manifest.version));
    } else {
      let version = request.spec.clone();
      args.add_dep(request.into_pkg(version));
    }
  }
  for export in query.list("exports") {
    if RE_JS_IDENT.is_match(&export) {
      args.exports.insert(export);
    }
  }
  for condition in query.list("conditions") {
    args.conditions.insert(condition);
  }
  if let Some(jsx) = query.get("jsx-runtime") {
    let request = PkgRequest::parse(&format!("/{jsx}"))
      .map_err(|_| ForgeError::invalid_request(format!("invalid jsx-runtime query: {jsx}")))?;
    let manifest = ctx.state.registry.resolve(&request.name, &request.spec).await?;
    args.jsx_runtime = Some(Pkg::new(request.name, manifest.version));
  }
  args.external_require = query.has("external-require");
  args.keep_names = query.has("keep-names");
  args.ignore_annotations = query.has("ignore-annotations");

  let bundle_mode = if (query.has("bundle") && query.get("bundle") != Some("false"))
    || query.has("bundle-all")
    || query.has("bundle-deps")
    || query.has("standalone")
  {
    BundleMode::All
  } else if query.get("bundle") == Some("false") || query.has("no-bundle") {
    BundleMode::None
  } else {
    BundleMode::Default
  };

  let mut dev = query.has("dev");
  if (pkg.name == "react" && pkg.sub_module == "jsx-dev-runtime") || pkg.name == "react-refresh" {
    dev = true;
  }
  let is_worker = query.has("worker");
  let no_dts = query.has("no-dts") || query.has("no-check");
  let want_css = query.has("css");

  let explicit_target = query
    .get("target")
    .map(str::to_ascii_lowercase)
    .and_then(|t| t.parse::<Target>().ok());
  let target_via_ua = explicit_target.is_none();
  let target = explicit_target.unwrap_or_else(|| target_from_ua(&ctx.user_agent));

  // drop pins that cannot affect this build, e.g. a `react` pin on a
  // react-dom build (its react version is always equalized)
  args.normalize(&pkg);

  let pinned = has_version_prefix
    || query
      .get("pin")
      .map(|pin| pin.starts_with('v'))
      .unwrap_or(false);
  let build_version = match query.get("pin") {
    Some(pin) if pin.starts_with('v') => match pin[1..].parse::<u32>() {
      Ok(v) if v > 0 && v <= BUILD_VERSION => v,
      _ => build_version,
    },
    _ => build_version,
  };

  let identity = BuildIdentity {
    build_version,
    pkg,
    args,
    target,
    dev,
    bundle_mode,
  };

  // cache probe, then single-flight build
  let result: BuildResult = match ctx
    .state
    .kv
    .get(&identity.save_path())
    .ok()
    .flatten()
    .and_then(|raw| serde_json::from_slice(&raw).ok())
  {
    Some(result) => result,
    None => {
      let handle = ctx
        .state
        .queue
        .add(JobSpec::module(identity.clone()), &ctx.user_agent);
      match ctx
        .state
        .queue
        .wait(handle, ctx.state.config.build_timeout())
        .await
      {
        Ok(result) => result,
        Err(err) if err.kind == ErrorKind::Timeout => return Err(err),
        Err(err) if err.kind == ErrorKind::NotFound => return Err(err),
        Err(err) => return Ok(throw_error_js(&err.message, false)),
      }
    }
  };

  let esm_path = format!("{}{}", ctx.state.config.base_path, identity.url_path());

  if result.types_only {
    let mut res = response(
      StatusCode::OK,
      CT_JAVASCRIPT,
      CC_IMMUTABLE,
      b"export default null;\n".to_vec(),
    );
    if let Some(dts) = &result.dts {
      set_types_header(&mut res, ctx, dts);
    }
    return Ok(res);
  }

  if want_css && identity.pkg.sub_module.is_empty() {
    if !result.package_css {
      return Err(ForgeError::not_found("package CSS not found"));
    }
    let css_url = format!(
      "{}{}.css",
      ctx.cdn_origin,
      esm_path.trim_end_matches(".mjs")
    );
    return Ok(redirect(css_url, CC_10MIN));
  }

  let mut body = format!("/* esmforge - {} */\n", identity.pkg);
  if is_worker {
    let module_url = format!("{}{}", ctx.cdn_origin, esm_path);
    body.push_str(&worker_factory(&module_url));
    body.push('\n');
  } else {
    for dep in &result.deps {
      body.push_str(&format!("import \"{}\";\n", absolute_url(ctx, dep)));
    }
    let module_url = format!("{}{}", ctx.cdn_origin, esm_path);
    body.push_str(&format!("export * from \"{module_url}\";\n"));
    if (result.from_cjs || result.has_default_export)
      && (identity.args.exports.is_empty() || identity.args.exports.contains("default"))
    {
      body.push_str(&format!("export {{ default }} from \"{module_url}\";\n"));
    }
    if result.from_cjs && !identity.args.exports.is_empty() {
      let exports: Vec<&str> = identity.args.exports.iter().map(String::as_str).collect();
      body.push_str(&format!("import __cjs_exports$ from \"{module_url}\";\n"));
      body.push_str(&format!(
        "export const {{ {} }} = __cjs_exports$;\n",
        exports.join(", ")
      ));
    }
  }

  let cache = if caret || !pinned { CC_10MIN } else { CC_IMMUTABLE };
  let mut res = response(StatusCode::OK, CT_JAVASCRIPT, cache, body.into_bytes());
  res.headers_mut().insert(
    header::HeaderName::from_static("x-esm-path"),
    header::HeaderValue::from_str(&esm_path)
      .unwrap_or(header::HeaderValue::from_static("")),
  );
  if let Some(dts) = &result.dts {
    if !no_dts && !is_worker {
      set_types_header(&mut res, ctx, dts);
    }
  }
  if target_via_ua {
    add_vary_user_agent(&mut res);
  }
  Ok(res)
}

fn absolute_url(ctx: &RequestContext, path: &str) -> String {
  if path.starts_with('/') {
    format!("{}{path}", ctx.cdn_origin)
  } else {
    path.to_string()
  }
}

fn set_types_header(res: &mut Response, ctx: &RequestContext, dts: &str) {
  let url = format!("{}{}", ctx.origin_base(), dts);
  if let Ok(value) = header::HeaderValue::from_str(&url) {
    res
      .headers_mut()
      .insert(header::HeaderName::from_static("x-typescript-types"), value);
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransformInput {
  code: String,
  #[serde(default)]
  filename: Option<String>,
  #[serde(default)]
  target: Option<String>,
  #[serde(default)]
  import_map: Option<String>,
}

async fn handle_transform(
  State(state): State<AppState>,
  headers: HeaderMap,
  body: axum::body::Bytes,
) -> Response {
  let input: TransformInput = match serde_json::from_slice(&body) {
    Ok(input) => input,
    Err(_) => {
      return text(StatusCode::BAD_REQUEST, CC_NO_STORE, "require valid json body");
    }
  };
  if input.code.is_empty() {
    return text(StatusCode::BAD_REQUEST, CC_NO_STORE, "code is required");
  }
  if input.code.len() > TRANSFORM_CODE_LIMIT {
    return text(StatusCode::TOO_MANY_REQUESTS, CC_NO_STORE, "code is too large");
  }

  let user_agent = headers
    .get(header::USER_AGENT)
    .and_then(|v| v.to_str().ok())
    .unwrap_or_default();
  let target = input
    .target
    .as_deref()
    .and_then(|t| t.parse::<Target>().ok())
    .unwrap_or_else(|| target_from_ua(user_agent));

  let loader = input
    .filename
    .as_deref()
    .and_then(|f| f.rsplit('.').next())
    .filter(|ext| ["js", "jsx", "ts", "tsx"].contains(ext))
    .unwrap_or("js")
    .to_string();

  let mut hasher = Sha1::new();
  hasher.update(loader.as_bytes());
  hasher.update(input.code.as_bytes());
  if let Some(import_map) = &input.import_map {
    hasher.update(import_map.as_bytes());
  }
  let hash = hex::encode(hasher.finalize());
  let save_path = format!("modules/{hash}.{target}.mjs");

  if let Ok(code) = state.files.read(&save_path) {
    return response(
      StatusCode::OK,
      CT_JSON,
      CC_MUST_REVALIDATE,
      serde_json::to_vec(&serde_json::json!({"code": String::from_utf8_lossy(&code)}))
        .unwrap_or_default(),
    );
  }

  let code = match state.bundler.transform(&input.code, &loader, target).await {
    Ok(code) => code,
    Err(err) => {
      return text(StatusCode::BAD_REQUEST, CC_NO_STORE, format!("transform: {err}"));
    }
  };
  if let Err(err) = state.files.write(&save_path, code.as_bytes()) {
    tracing::error!("transform write failed: {err}");
  }
  response(
    StatusCode::OK,
    CT_JSON,
    CC_MUST_REVALIDATE,
    serde_json::to_vec(&serde_json::json!({"code": code})).unwrap_or_default(),
  )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PurgeInput {
  package: String,
  #[serde(default)]
  version: Option<String>,
  #[serde(default)]
  github: bool,
}

async fn handle_purge(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
  let input: PurgeInput = match serde_json::from_slice(&body) {
    Ok(input) => input,
    Err(_) => {
      return text(StatusCode::BAD_REQUEST, CC_NO_STORE, "require valid json body");
    }
  };
  if input.package.is_empty() {
    return text(StatusCode::BAD_REQUEST, CC_NO_STORE, "package is required");
  }

  let core = if input.github {
    format!("gh/{}", input.package)
  } else {
    match &input.version {
      Some(version) => format!("{}@{version}", input.package),
      None => format!("{}@", input.package),
    }
  };

  let mut removed: Vec<String> = Vec::new();
  for v in 1..=BUILD_VERSION {
    for partition in ["builds", "types"] {
      let prefix = format!("{partition}/v{v}/{core}");
      match state.kv.delete_prefix(&prefix) {
        Ok(records) => removed.extend(records.into_iter().map(|(key, _)| key)),
        Err(err) => tracing::error!("purge metadata {prefix}: {err}"),
      }
      match state.files.remove_prefix(&prefix) {
        Ok(files) => {
          for file in files {
            if !removed.contains(&file) {
              removed.push(file);
            }
          }
        }
        Err(err) => tracing::error!("purge files {prefix}: {err}"),
      }
    }
  }
  removed.sort();
  removed.dedup();
  tracing::info!(package = %input.package, count = removed.len(), "purged");
  (
    StatusCode::OK,
    [(header::CONTENT_TYPE, CT_JSON)],
    serde_json::to_vec(&removed).unwrap_or_default(),
  )
    .into_response()
}

#[cfg(test)]
mod tests;
