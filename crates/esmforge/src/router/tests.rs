use std::sync::Arc;

use axum::body::Body;
use axum::http::header;
use axum::http::Request;
use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use sha1::Digest;
use tower::ServiceExt;

use esmforge_core::BuildIdentity;
use esmforge_core::BuildResult;
use esmforge_core::Pkg;
use esmforge_core::Target;
use esmforge_npm::CjsAnalysis;
use esmforge_npm::MockExportAnalyzer;
use esmforge_npm::MockPackageInstaller;
use esmforge_npm::MockPackageRegistry;
use esmforge_npm::PackageManifest;
use esmforge_storage::FileStore;
use esmforge_storage::KvStore;
use esmforge_storage::MemoryFileStore;
use esmforge_storage::MemoryKvStore;

use super::*;
use crate::bundler::MockBundler;
use crate::config::Config;

const CHROME_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36";

struct Harness {
  files: Arc<MemoryFileStore>,
  kv: Arc<MemoryKvStore>,
  state: AppState,
}

fn harness(configure: impl FnOnce(&mut Config)) -> Harness {
  let mut config = Config::default();
  configure(&mut config);

  let mut registry = MockPackageRegistry::new();
  registry.expect_resolve().returning(|name, spec| match name {
    "react" => Ok(PackageManifest {
      name: "react".into(),
      version: if is_full_version(spec) { spec.to_string() } else { "18.2.0".into() },
      main: Some("index.js".into()),
      ..Default::default()
    }),
    _ => Err(ForgeError::not_found(format!("package \"{name}\" not found"))),
  });

  let mut installer = MockPackageInstaller::new();
  installer
    .expect_install()
    .returning(|pkg| Err(ForgeError::internal(format!("no sources for {pkg} in tests"))));
  installer.expect_schedule_purge().returning(|_| ());

  let mut analyzer = MockExportAnalyzer::new();
  analyzer
    .expect_analyze()
    .returning(|_, _, _| Ok(CjsAnalysis::default()));

  let mut bundler = MockBundler::new();
  bundler
    .expect_transform()
    .returning(|code, _, _| Ok(format!("{code};")));

  let files = Arc::new(MemoryFileStore::new());
  let kv = Arc::new(MemoryKvStore::new());
  let state = AppState::assemble(
    Arc::new(config),
    Arc::new(registry),
    Arc::new(installer),
    Arc::new(analyzer),
    Arc::new(bundler),
    files.clone(),
    kv.clone(),
  );
  Harness { files, kv, state }
}

async fn send(harness: &Harness, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
  let response = build_router(harness.state.clone())
    .oneshot(request)
    .await
    .unwrap();
  let status = response.status();
  let headers = response.headers().clone();
  let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
    .await
    .unwrap();
  (status, headers, String::from_utf8_lossy(&body).into_owned())
}

fn get(path: &str) -> Request<Body> {
  Request::builder()
    .uri(path)
    .header(header::HOST, "cdn.test")
    .header(header::USER_AGENT, CHROME_UA)
    .body(Body::empty())
    .unwrap()
}

fn vary_includes_user_agent(headers: &HeaderMap) -> bool {
  headers
    .get_all(header::VARY)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .any(|v| v.split(',').any(|part| part.trim() == "User-Agent"))
}

fn react_identity() -> BuildIdentity {
  BuildIdentity {
    build_version: BUILD_VERSION,
    pkg: Pkg::new("react", "18.2.0"),
    target: Target::Es2022,
    ..Default::default()
  }
}

fn seed_build(harness: &Harness, identity: &BuildIdentity, result: &BuildResult, content: &str) {
  harness
    .kv
    .put(&identity.save_path(), &serde_json::to_vec(result).unwrap())
    .unwrap();
  harness
    .files
    .write(&identity.save_path(), content.as_bytes())
    .unwrap();
}

#[tokio::test]
async fn unpinned_request_redirects_to_resolved_version() {
  let harness = harness(|_| {});
  let (status, headers, _) = send(&harness, get("/react")).await;
  assert_eq!(status, StatusCode::FOUND);
  assert_eq!(
    headers.get(header::LOCATION).unwrap(),
    "http://cdn.test/react@18.2.0"
  );
  assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), CC_10MIN);
}

#[tokio::test]
async fn pinned_bare_request_serves_the_wrapper() {
  let harness = harness(|_| {});
  let identity = react_identity();
  seed_build(
    &harness,
    &identity,
    &BuildResult {
      has_default_export: true,
      from_cjs: true,
      dts: Some("/v2/@types/react@18.2.0/index.d.ts".into()),
      ..Default::default()
    },
    "// artefact",
  );

  let (status, headers, body) = send(&harness, get("/react@18.2.0")).await;
  assert_eq!(status, StatusCode::OK);
  assert!(body.contains("export * from \"http://cdn.test/v2/react@18.2.0/es2022/react.mjs\";"));
  assert!(body.contains("export { default } from"));
  assert_eq!(headers.get("x-esm-path").unwrap(), "/v2/react@18.2.0/es2022/react.mjs");
  assert_eq!(
    headers.get("x-typescript-types").unwrap(),
    "http://cdn.test/v2/@types/react@18.2.0/index.d.ts"
  );
  // the target came from the user agent
  assert!(vary_includes_user_agent(&headers));
  // pinned version but no build-version prefix: short cache
  assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), CC_10MIN);
}

#[tokio::test]
async fn weak_agents_fall_back_to_es2015() {
  let harness = harness(|_| {});
  let identity = BuildIdentity {
    target: Target::Es2015,
    ..react_identity()
  };
  seed_build(&harness, &identity, &BuildResult::default(), "// artefact");

  let request = Request::builder()
    .uri("/react@18.2.0")
    .header(header::HOST, "cdn.test")
    .header(header::USER_AGENT, "curl/8.0.1")
    .body(Body::empty())
    .unwrap();
  let (status, _, body) = send(&harness, request).await;
  assert_eq!(status, StatusCode::OK);
  assert!(body.contains("/v2/react@18.2.0/es2015/react.mjs"));
}

#[tokio::test]
async fn artefact_urls_serve_immutable_bytes() {
  let harness = harness(|_| {});
  let identity = react_identity();
  seed_build(&harness, &identity, &BuildResult::default(), "export const version = 1;");

  let (status, headers, body) = send(&harness, get("/v2/react@18.2.0/es2022/react.mjs")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body, "export const version = 1;");
  assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), CC_IMMUTABLE);
  assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), CT_JAVASCRIPT);
}

#[tokio::test]
async fn head_requests_carry_headers_without_a_body() {
  let harness = harness(|_| {});
  let identity = react_identity();
  seed_build(&harness, &identity, &BuildResult::default(), "export const version = 1;");

  let request = Request::builder()
    .method(Method::HEAD)
    .uri("/v2/react@18.2.0/es2022/react.mjs")
    .header(header::HOST, "cdn.test")
    .header(header::USER_AGENT, CHROME_UA)
    .body(Body::empty())
    .unwrap();
  let (status, headers, body) = send(&harness, request).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), CC_IMMUTABLE);
  assert_eq!(body, "");
}

#[tokio::test]
async fn react_dep_pins_are_equalized_for_react_dom() {
  let harness = harness(|_| {});
  let identity = BuildIdentity {
    build_version: BUILD_VERSION,
    pkg: Pkg::new("react-dom", "18.2.0"),
    target: Target::Es2022,
    ..Default::default()
  };
  seed_build(&harness, &identity, &BuildResult::default(), "// artefact");

  // the react pin is dropped, so this hits the same identity as no pin
  let (status, headers, _) =
    send(&harness, get("/react-dom@18.2.0?deps=react@18.0.0")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(
    headers.get("x-esm-path").unwrap(),
    "/v2/react-dom@18.2.0/es2022/react-dom.mjs"
  );
}

#[tokio::test]
async fn banned_packages_are_forbidden() {
  let harness = harness(|config| config.ban_list = vec!["left-pad".to_string()]);
  let (status, _, _) = send(&harness, get("/left-pad@1.3.0")).await;
  assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn status_endpoint_reports_the_queue() {
  let harness = harness(|_| {});
  let (status, headers, body) = send(&harness, get("/status.json")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), CC_MUST_REVALIDATE);
  let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
  assert_eq!(parsed["version"], serde_json::json!(BUILD_VERSION));
  assert!(parsed["buildQueue"].is_array());
}

#[tokio::test]
async fn esma_target_reflects_the_user_agent() {
  let harness = harness(|_| {});
  let (status, headers, body) = send(&harness, get("/esma-target")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body, "es2022");
  assert!(vary_includes_user_agent(&headers));
}

#[tokio::test]
async fn error_module_throws_at_evaluation_time() {
  let harness = harness(|_| {});
  let (status, headers, body) = send(
    &harness,
    get("/error.js?type=resolve&name=left-pad&importer=react"),
  )
  .await;
  assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
  assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), CT_JAVASCRIPT);
  assert!(body.contains("throw new Error"));
  assert!(body.contains("[esmforge] Could not resolve \\\"left-pad\\\""));
  assert!(body.ends_with("export default null;\n"));
}

#[tokio::test]
async fn transform_caches_by_content_hash() {
  let harness = harness(|_| {});
  let request = Request::builder()
    .method(Method::POST)
    .uri("/transform")
    .header(header::HOST, "cdn.test")
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(r#"{"code":"1+1","target":"es2022"}"#))
    .unwrap();
  let (status, _, body) = send(&harness, request).await;
  assert_eq!(status, StatusCode::OK);
  let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
  assert_eq!(parsed["code"], "1+1;");

  // the stored module is addressable under its content hash
  let mut hasher = sha1::Sha1::new();
  hasher.update(b"js");
  hasher.update(b"1+1");
  let hash = hex::encode(hasher.finalize());
  let (status, headers, body) = send(&harness, get(&format!("/+{hash}.mjs"))).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body, "1+1;");
  assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), CC_IMMUTABLE);
  assert!(vary_includes_user_agent(&headers));
}

#[tokio::test]
async fn purge_removes_artefacts_and_metadata() {
  let harness = harness(|_| {});
  let identity = react_identity();
  seed_build(&harness, &identity, &BuildResult::default(), "// artefact");

  let request = Request::builder()
    .method(Method::POST)
    .uri("/purge")
    .header(header::HOST, "cdn.test")
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(r#"{"package":"react","version":"18.2.0"}"#))
    .unwrap();
  let (status, _, body) = send(&harness, request).await;
  assert_eq!(status, StatusCode::OK);
  let removed: Vec<String> = serde_json::from_str(&body).unwrap();
  assert!(removed.contains(&identity.save_path()));

  assert!(harness.files.stat(&identity.save_path()).is_err());
  assert!(harness.kv.get(&identity.save_path()).unwrap().is_none());

  // purging again is a clean no-op
  let request = Request::builder()
    .method(Method::POST)
    .uri("/purge")
    .header(header::HOST, "cdn.test")
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(r#"{"package":"react","version":"18.2.0"}"#))
    .unwrap();
  let (status, _, body) = send(&harness, request).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body, "[]");
}

#[tokio::test]
async fn unknown_build_versions_are_rejected() {
  let harness = harness(|_| {});
  let (status, _, _) = send(&harness, get("/v99/react@18.2.0/es2022/react.mjs")).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn embedded_polyfills_are_served_under_the_version_prefix() {
  let harness = harness(|_| {});
  let (status, headers, body) = send(&harness, get("/v2/node_process.js")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), CC_IMMUTABLE);
  assert!(body.contains("export default process"));

  // unknown builtins degrade to an empty module
  let (status, _, body) = send(&harness, get("/v2/node_unobtainium.js")).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body, "export default {};\n");
}

#[tokio::test]
async fn dotfiles_and_php_probes_are_rejected() {
  let harness = harness(|_| {});
  let (status, _, _) = send(&harness, get("/.env")).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  let (status, _, _) = send(&harness, get("/index.php")).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn base_path_requests_redirect_into_the_base() {
  let harness = harness(|config| config.base_path = "/esm".to_string());
  let (status, headers, _) = send(&harness, get("/react@18.2.0")).await;
  assert_eq!(status, StatusCode::FOUND);
  assert_eq!(
    headers.get(header::LOCATION).unwrap(),
    "http://cdn.test/esm/react@18.2.0"
  );
}

#[tokio::test]
async fn worker_query_wraps_the_artefact_in_a_factory() {
  let harness = harness(|_| {});
  let identity = react_identity();
  seed_build(&harness, &identity, &BuildResult::default(), "// artefact");

  let (status, _, body) =
    send(&harness, get("/v2/react@18.2.0/es2022/react.mjs?worker")).await;
  assert_eq!(status, StatusCode::OK);
  assert!(body.starts_with("export default function workerFactory"));
  assert!(body.contains("new Worker(URL.createObjectURL(blob)"));
}

#[tokio::test]
async fn source_maps_404_instead_of_building() {
  let harness = harness(|_| {});
  let (status, _, _) = send(&harness, get("/v2/react@18.2.0/es2022/react.mjs.map")).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}
