//! The registry client and the built-in copier against a registry speaking
//! HTTP on a local socket: token exchange and renewal, tag pagination,
//! denied listings, platform selection and blob uploads.

mod common;

use common::{MockRegistry, Reply, Request};
use docker_image_sync::copier::{CopyOptions, DistributionCopier, ImageCopier};
use docker_image_sync::image::manifest::{DOCKER_MANIFEST_LIST_V2, DOCKER_MANIFEST_V2};
use docker_image_sync::image::{DigestUtils, DockerReference, Platform};
use docker_image_sync::logging::Logger;
use docker_image_sync::registry::{RegistryClient, RegistryTagLister, RepositoryTags, TagLister};
use docker_image_sync::transport::{AuthContext, ImageReference, TlsVerify};
use docker_image_sync::{OperationContext, SyncError};
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const CONFIG: &[u8] = br#"{"architecture":"amd64","os":"linux"}"#;
const LAYER: &[u8] = b"layer-content";

fn plain_http() -> Arc<AuthContext> {
    Arc::new(AuthContext::anonymous().with_tls_verify(TlsVerify::Disabled))
}

fn client(registry: &MockRegistry, logger: Logger) -> RegistryClient {
    RegistryClient::builder(&registry.domain(), plain_http(), logger)
        .build()
        .unwrap()
}

fn bearer_challenge(request: &Request) -> Reply {
    Reply::status(401).header(
        "WWW-Authenticate",
        format!(
            r#"Bearer realm="{}/token",service="mock-registry""#,
            request.origin()
        ),
    )
}

fn unauthorized(message: &str) -> Reply {
    Reply::json(401, json!({"errors": [{"code": "UNAUTHORIZED", "message": message}]}))
}

/// Issues `token-1`, `token-2`, ... with the given lifetime
fn token_reply(issued: &AtomicUsize, expires_in: u64) -> Reply {
    let n = issued.fetch_add(1, Ordering::SeqCst) + 1;
    Reply::json(200, json!({"token": format!("token-{}", n), "expires_in": expires_in}))
}

fn image_manifest(config: &[u8], layer: &[u8]) -> String {
    format!(
        r#"{{"schemaVersion":2,"mediaType":"{}","config":{{"mediaType":"application/vnd.docker.container.image.v1+json","digest":"{}","size":{}}},"layers":[{{"mediaType":"application/vnd.docker.image.rootfs.diff.tar.gzip","digest":"{}","size":{}}}]}}"#,
        DOCKER_MANIFEST_V2,
        DigestUtils::compute_docker_digest(config),
        config.len(),
        DigestUtils::compute_docker_digest(layer),
        layer.len()
    )
}

/// A dir image whose layer file holds `layer_bytes` instead of `LAYER`
fn write_dir_image(root: &Path, layer_bytes: &[u8]) -> String {
    let hex = |data: &[u8]| DigestUtils::compute_sha256(data);
    std::fs::create_dir_all(root).unwrap();
    std::fs::write(root.join(hex(CONFIG)), CONFIG).unwrap();
    std::fs::write(root.join(hex(LAYER)), layer_bytes).unwrap();
    let manifest = image_manifest(CONFIG, LAYER);
    std::fs::write(root.join("manifest.json"), &manifest).unwrap();
    manifest
}

#[tokio::test]
async fn bearer_challenge_is_exchanged_for_a_scoped_token() {
    let issued = Arc::new(AtomicUsize::new(0));
    let tokens = issued.clone();
    let registry = MockRegistry::start(move |request| {
        if request.is("GET", "/v2/") {
            return bearer_challenge(request);
        }
        if request.is("GET", "/token") {
            return token_reply(&tokens, 300);
        }
        if request.is("GET", "/v2/team/app/tags/list") {
            return match request.bearer() {
                Some("token-1") => Reply::json(200, json!({"name": "team/app", "tags": ["1.0", "1.1"]})),
                _ => unauthorized("authentication required"),
            };
        }
        Reply::status(404)
    })
    .await;

    let client = client(&registry, Logger::new_quiet());
    let ctx = OperationContext::background();
    assert_eq!(client.list_tags(&ctx, "team/app").await.unwrap(), vec!["1.0", "1.1"]);
    assert_eq!(client.list_tags(&ctx, "team/app").await.unwrap(), vec!["1.0", "1.1"]);

    // the second listing reuses the cached token
    assert_eq!(issued.load(Ordering::SeqCst), 1);
    let token_request = registry
        .requests()
        .into_iter()
        .find(|request| request.is("GET", "/token"))
        .unwrap();
    assert_eq!(token_request.query("scope").as_deref(), Some("repository:team/app:pull"));
    assert_eq!(token_request.query("service").as_deref(), Some("mock-registry"));
}

#[tokio::test]
async fn rejected_token_is_replaced_once() {
    let issued = Arc::new(AtomicUsize::new(0));
    let tokens = issued.clone();
    // every token is good for exactly one request
    let used = Mutex::new(HashSet::new());
    let registry = MockRegistry::start(move |request| {
        if request.is("GET", "/v2/") {
            return bearer_challenge(request);
        }
        if request.is("GET", "/token") {
            return token_reply(&tokens, 300);
        }
        if request.is("GET", "/v2/app/tags/list") {
            let fresh = request
                .bearer()
                .is_some_and(|token| used.lock().unwrap().insert(token.to_string()));
            return if fresh {
                Reply::json(200, json!({"name": "app", "tags": ["1.0"]}))
            } else {
                unauthorized("token expired")
            };
        }
        Reply::status(404)
    })
    .await;

    let (logger, capture) = Logger::capturing();
    let client = client(&registry, logger);
    let ctx = OperationContext::background();
    assert_eq!(client.list_tags(&ctx, "app").await.unwrap(), vec!["1.0"]);
    assert_eq!(client.list_tags(&ctx, "app").await.unwrap(), vec!["1.0"]);

    assert_eq!(issued.load(Ordering::SeqCst), 2);
    assert_eq!(registry.count("GET", "/v2/app/tags/list"), 3);
    assert!(capture
        .warnings()
        .iter()
        .any(|w| w.contains("401 Unauthorized") && w.contains("refreshing token")));
}

#[tokio::test]
async fn token_refresh_is_attempted_only_once() {
    let issued = Arc::new(AtomicUsize::new(0));
    let tokens = issued.clone();
    let registry = MockRegistry::start(move |request| {
        if request.is("GET", "/v2/") {
            return bearer_challenge(request);
        }
        if request.is("GET", "/token") {
            return token_reply(&tokens, 300);
        }
        unauthorized("insufficient scope")
    })
    .await;

    let client = client(&registry, Logger::new_quiet());
    let err = client
        .list_tags(&OperationContext::background(), "app")
        .await
        .unwrap_err();
    assert!(matches!(err.root(), SyncError::TagListingDenied { .. }));
    assert_eq!(issued.load(Ordering::SeqCst), 2);
    assert_eq!(registry.count("GET", "/v2/app/tags/list"), 2);
}

#[tokio::test]
async fn expired_token_is_renewed_before_the_next_request() {
    let issued = Arc::new(AtomicUsize::new(0));
    let tokens = issued.clone();
    let registry = MockRegistry::start(move |request| {
        if request.is("GET", "/v2/") {
            return bearer_challenge(request);
        }
        if request.is("GET", "/token") {
            return token_reply(&tokens, 1);
        }
        if request.is("GET", "/v2/app/tags/list") && request.bearer().is_some() {
            return Reply::json(200, json!({"name": "app", "tags": ["1.0"]}));
        }
        unauthorized("authentication required")
    })
    .await;

    let client = client(&registry, Logger::new_quiet());
    let ctx = OperationContext::background();
    client.list_tags(&ctx, "app").await.unwrap();
    assert_eq!(issued.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    client.list_tags(&ctx, "app").await.unwrap();
    assert_eq!(issued.load(Ordering::SeqCst), 2);
    // the expired token was never sent
    assert_eq!(registry.count("GET", "/v2/app/tags/list"), 2);
}

#[tokio::test]
async fn tag_listing_follows_link_pagination() {
    let registry = MockRegistry::start(|request| {
        if request.is("GET", "/v2/") {
            return Reply::status(200);
        }
        if request.is("GET", "/v2/app/tags/list") {
            return match request.query("last").as_deref() {
                None => Reply::json(200, json!({"name": "app", "tags": ["a", "b"]}))
                    .header("Link", r#"</v2/app/tags/list?last=b&n=2>; rel="next""#),
                Some("b") => Reply::json(200, json!({"name": "app", "tags": ["c"]})),
                Some(_) => Reply::status(400),
            };
        }
        Reply::status(404)
    })
    .await;

    let client = client(&registry, Logger::new_quiet());
    let tags = client
        .list_tags(&OperationContext::background(), "app")
        .await
        .unwrap();
    assert_eq!(tags, vec!["a", "b", "c"]);
    assert_eq!(registry.count("GET", "/v2/app/tags/list"), 2);
}

#[tokio::test]
async fn looping_pagination_stops() {
    let registry = MockRegistry::start(|request| {
        if request.is("GET", "/v2/") {
            return Reply::status(200);
        }
        if request.is("GET", "/v2/self/tags/list") {
            return Reply::json(200, json!({"name": "self", "tags": ["a"]}))
                .header("Link", r#"</v2/self/tags/list>; rel="next""#);
        }
        if request.is("GET", "/v2/cycle/tags/list") {
            let (tags, next) = match request.query("page").as_deref() {
                None => (vec!["a"], "/v2/cycle/tags/list?page=2"),
                _ => (vec!["b"], "/v2/cycle/tags/list"),
            };
            return Reply::json(200, json!({"name": "cycle", "tags": tags}))
                .header("Link", format!(r#"<{}>; rel="next""#, next));
        }
        Reply::status(404)
    })
    .await;

    let (logger, capture) = Logger::capturing();
    let client = client(&registry, logger);
    let ctx = OperationContext::background();

    assert_eq!(client.list_tags(&ctx, "self").await.unwrap(), vec!["a"]);
    assert_eq!(registry.count("GET", "/v2/self/tags/list"), 1);

    assert_eq!(client.list_tags(&ctx, "cycle").await.unwrap(), vec!["a", "b"]);
    assert_eq!(registry.count("GET", "/v2/cycle/tags/list"), 2);

    assert_eq!(
        capture
            .warnings()
            .iter()
            .filter(|w| w.contains("loops back"))
            .count(),
        2
    );
}

#[tokio::test]
async fn denied_listing_is_reported_as_tag_listing_denied() {
    let registry = MockRegistry::start(|request| {
        if request.is("GET", "/v2/") {
            return Reply::status(200);
        }
        match request.path() {
            "/v2/private/tags/list" => unauthorized("authentication required"),
            "/v2/forbidden/tags/list" => Reply::json(
                403,
                json!({"errors": [{"code": "DENIED", "message": "requested access to the resource is denied"}]}),
            ),
            "/v2/broken/tags/list" => Reply::status(500),
            _ => Reply::status(404),
        }
    })
    .await;

    let lister = RegistryTagLister::new(Logger::new_quiet());
    let ctx = OperationContext::background();
    let auth = plain_http();
    let repository = |name: &str| {
        DockerReference::parse_normalized(&format!("{}/{}", registry.domain(), name)).unwrap()
    };

    for name in ["private", "forbidden"] {
        let err = lister.list_tags(&ctx, &auth, &repository(name)).await.unwrap_err();
        assert!(
            matches!(err.root(), SyncError::TagListingDenied { .. }),
            "{}: {}",
            name,
            err.chain()
        );
    }

    let err = lister
        .list_tags(&ctx, &auth, &repository("broken"))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), SyncError::Registry(_)));
}

#[tokio::test]
async fn repository_tags_lists_every_page() {
    let registry = MockRegistry::start(|request| {
        if request.is("GET", "/v2/") {
            return Reply::status(200);
        }
        if request.is("GET", "/v2/team/app/tags/list") {
            return match request.query("last") {
                None => Reply::json(200, json!({"name": "team/app", "tags": ["1.0"]}))
                    .header("Link", r#"</v2/team/app/tags/list?last=1.0>; rel="next""#),
                Some(_) => Reply::json(200, json!({"name": "team/app", "tags": ["latest"]})),
            };
        }
        Reply::status(404)
    })
    .await;

    let repository =
        DockerReference::parse_normalized(&format!("{}/team/app", registry.domain())).unwrap();
    let listing = RepositoryTags::fetch(
        &OperationContext::background(),
        &RegistryTagLister::new(Logger::new_quiet()),
        &plain_http(),
        &repository,
    )
    .await
    .unwrap();

    assert_eq!(listing.repository, format!("{}/team/app", registry.domain()));
    assert_eq!(listing.tags, vec!["1.0", "latest"]);
    let printed: serde_json::Value = serde_json::from_str(&listing.to_json().unwrap()).unwrap();
    assert_eq!(printed["Tags"], json!(["1.0", "latest"]));
}

#[tokio::test]
async fn manifest_list_resolves_to_the_requested_platform() {
    let amd64 = image_manifest(CONFIG, LAYER);
    let arm64 = image_manifest(br#"{"architecture":"arm64","os":"linux"}"#, b"arm-layer");
    let amd64_digest = DigestUtils::compute_docker_digest(amd64.as_bytes());
    let arm64_digest = DigestUtils::compute_docker_digest(arm64.as_bytes());
    let index = json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST_LIST_V2,
        "manifests": [
            {"mediaType": DOCKER_MANIFEST_V2, "digest": arm64_digest, "size": arm64.len(),
             "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}},
            {"mediaType": DOCKER_MANIFEST_V2, "digest": amd64_digest, "size": amd64.len(),
             "platform": {"architecture": "amd64", "os": "linux"}}
        ]
    })
    .to_string();

    let served = (index, amd64.clone(), arm64, amd64_digest, arm64_digest.clone());
    let registry = MockRegistry::start(move |request| {
        let (index, amd64, arm64, amd64_digest, arm64_digest) = &served;
        let path = request.path();
        if request.is("GET", "/v2/") {
            return Reply::status(200);
        }
        if path == "/v2/app/manifests/latest" {
            return Reply::bytes(200, index.as_bytes(), DOCKER_MANIFEST_LIST_V2);
        }
        if path == format!("/v2/app/manifests/{}", amd64_digest) {
            return Reply::bytes(200, amd64.as_bytes(), DOCKER_MANIFEST_V2);
        }
        if path == format!("/v2/app/manifests/{}", arm64_digest) {
            return Reply::bytes(200, arm64.as_bytes(), DOCKER_MANIFEST_V2);
        }
        if path == format!("/v2/app/blobs/{}", DigestUtils::compute_docker_digest(CONFIG)) {
            return Reply::bytes(200, CONFIG, "application/octet-stream");
        }
        if path == format!("/v2/app/blobs/{}", DigestUtils::compute_docker_digest(LAYER)) {
            return Reply::bytes(200, LAYER, "application/octet-stream");
        }
        Reply::status(404)
    })
    .await;

    let tmp = TempDir::new().unwrap();
    let destination = tmp.path().join("app");
    let source = ImageReference::parse(&format!("docker://{}/app:latest", registry.domain())).unwrap();
    let options = CopyOptions {
        source_auth: plain_http(),
        ..CopyOptions::default()
    };

    DistributionCopier::new(Logger::new_quiet(), Platform::default())
        .copy(
            &OperationContext::background(),
            &source,
            &ImageReference::dir(&destination),
            &options,
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(destination.join("manifest.json")).unwrap(), amd64);
    assert!(destination.join(DigestUtils::compute_sha256(LAYER)).is_file());
    assert_eq!(
        registry.count("GET", &format!("/v2/app/manifests/{}", arm64_digest)),
        0
    );
}

/// Registry accepting uploads, verifying each pushed blob against its digest
fn upload_target(present: Vec<String>) -> impl Fn(&Request) -> Reply + Send + Sync + 'static {
    move |request| {
        let path = request.path();
        if request.is("GET", "/v2/") {
            return Reply::status(200);
        }
        if request.method == "HEAD" {
            let found = present
                .iter()
                .any(|digest| path == format!("/v2/app/blobs/{}", digest));
            return Reply::status(if found { 200 } else { 404 });
        }
        if request.is("POST", "/v2/app/blobs/uploads/") {
            return Reply::status(202).header("Location", "/v2/app/blobs/uploads/session-1");
        }
        if request.is("PUT", "/v2/app/blobs/uploads/session-1") {
            let actual = DigestUtils::compute_docker_digest(&request.body);
            return if request.query("digest") == Some(actual) {
                Reply::status(201)
            } else {
                Reply::json(400, json!({"errors": [{"code": "DIGEST_INVALID", "message": "digest did not match"}]}))
            };
        }
        if request.is("PUT", "/v2/app/manifests/1.0") {
            return Reply::status(201);
        }
        Reply::status(404)
    }
}

#[tokio::test]
async fn existing_blobs_are_not_uploaded_again() {
    let tmp = TempDir::new().unwrap();
    let manifest = write_dir_image(&tmp.path().join("src"), LAYER);
    let config_digest = DigestUtils::compute_docker_digest(CONFIG);
    let layer_digest = DigestUtils::compute_docker_digest(LAYER);
    let registry = MockRegistry::start(upload_target(vec![config_digest.clone()])).await;

    let destination = ImageReference::parse(&format!("docker://{}/app:1.0", registry.domain())).unwrap();
    let options = CopyOptions {
        destination_auth: plain_http(),
        ..CopyOptions::default()
    };
    DistributionCopier::new(Logger::new_quiet(), Platform::default())
        .copy(
            &OperationContext::background(),
            &ImageReference::dir(tmp.path().join("src")),
            &destination,
            &options,
        )
        .await
        .unwrap();

    assert_eq!(registry.count("HEAD", &format!("/v2/app/blobs/{}", config_digest)), 1);
    assert_eq!(registry.count("POST", "/v2/app/blobs/uploads/"), 1);

    let requests = registry.requests();
    let upload = requests
        .iter()
        .find(|request| request.is("PUT", "/v2/app/blobs/uploads/session-1"))
        .unwrap();
    assert_eq!(upload.query("digest"), Some(layer_digest));
    assert_eq!(upload.body, LAYER);

    let pushed = requests
        .iter()
        .find(|request| request.is("PUT", "/v2/app/manifests/1.0"))
        .unwrap();
    assert_eq!(pushed.body, manifest.as_bytes());
    assert_eq!(pushed.header("content-type"), Some(DOCKER_MANIFEST_V2));
}

#[tokio::test]
async fn corrupted_upload_stream_fails_before_the_manifest() {
    let tmp = TempDir::new().unwrap();
    // shorter than the size the manifest declares
    write_dir_image(&tmp.path().join("src"), b"short");
    let registry = MockRegistry::start(upload_target(Vec::new())).await;

    let destination = ImageReference::parse(&format!("docker://{}/app:1.0", registry.domain())).unwrap();
    let options = CopyOptions {
        destination_auth: plain_http(),
        ..CopyOptions::default()
    };
    let err = DistributionCopier::new(Logger::new_quiet(), Platform::default())
        .copy(
            &OperationContext::background(),
            &ImageReference::dir(tmp.path().join("src")),
            &destination,
            &options,
        )
        .await
        .unwrap_err();

    assert!(err.is_digest_mismatch(), "{}", err.chain());
    assert_eq!(registry.count("PUT", "/v2/app/manifests/1.0"), 0);
}
