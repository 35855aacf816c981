//! Registry HTTP API v2 client
//!
//! One [`RegistryClient`] talks to one registry host with one
//! [`AuthContext`]. The endpoint (scheme and auth challenge) is discovered
//! lazily on first use; tokens are cached per repository scope until they
//! expire, and a bearer token the registry rejects is replaced once.

use crate::context::OperationContext;
use crate::error::handlers::HttpErrorHandler;
use crate::error::{RegistryErrorCode, Result, ResultExt, SyncError};
use crate::image::manifest::ACCEPTED_MANIFEST_TYPES;
use crate::logging::Logger;
use crate::registry::auth::{Auth, AuthChallenge, Authorization, TokenInfo, repository_scope};
use crate::transport::AuthContext;
use futures_util::TryStreamExt;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, LINK, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Body, Certificate, Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::OnceCell;
use tokio_util::io::{ReaderStream, StreamReader};
use url::Url;

/// Blob content being streamed from a source
pub type BlobStream = Pin<Box<dyn AsyncRead + Send>>;

const DOCKER_HUB_DOMAIN: &str = "docker.io";
const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
const PULL: &str = "pull";
const PUSH: &str = "pull,push";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug)]
struct Endpoint {
    base_url: Url,
    challenge: Option<AuthChallenge>,
}

/// A fetched manifest and the content type the registry reported for it
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub digest: Option<String>,
}

pub struct RegistryClientBuilder {
    domain: String,
    auth: Arc<AuthContext>,
    logger: Logger,
}

impl RegistryClientBuilder {
    pub fn new(domain: &str, auth: Arc<AuthContext>, logger: Logger) -> Self {
        Self {
            domain: domain.to_string(),
            auth,
            logger,
        }
    }

    pub fn build(self) -> Result<RegistryClient> {
        let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);

        if self.auth.tls_verify.skip_verification() {
            self.logger.warning(&format!(
                "TLS certificate verification disabled for {}",
                self.domain
            ));
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        if let Some(cert_dir) = &self.auth.cert_dir {
            for certificate in load_certificates(cert_dir, &self.logger)? {
                builder = builder.add_root_certificate(certificate);
            }
        }

        let client = builder.build()?;
        Ok(RegistryClient {
            auth_flow: Auth::new(client.clone(), self.logger.clone()),
            client,
            domain: self.domain,
            auth: self.auth,
            logger: self.logger,
            endpoint: OnceCell::new(),
            tokens: Mutex::new(HashMap::new()),
        })
    }
}

/// Every `*.crt` file in `cert_dir`, as trusted roots
fn load_certificates(cert_dir: &Path, logger: &Logger) -> Result<Vec<Certificate>> {
    let mut certificates = Vec::new();
    let entries = std::fs::read_dir(cert_dir)
        .with_context(|| format!("Reading certificate directory {}", cert_dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "crt") {
            logger.detail(&format!("Trusting CA certificate {}", path.display()));
            let pem = std::fs::read(&path)?;
            certificates.push(Certificate::from_pem(&pem)?);
        }
    }
    Ok(certificates)
}

pub struct RegistryClient {
    client: Client,
    auth_flow: Auth,
    domain: String,
    auth: Arc<AuthContext>,
    logger: Logger,
    endpoint: OnceCell<Endpoint>,
    tokens: Mutex<HashMap<String, TokenInfo>>,
}

impl RegistryClient {
    pub fn builder(domain: &str, auth: Arc<AuthContext>, logger: Logger) -> RegistryClientBuilder {
        RegistryClientBuilder::new(domain, auth, logger)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn auth_context(&self) -> &Arc<AuthContext> {
        &self.auth
    }

    fn host(&self) -> &str {
        if self.domain == DOCKER_HUB_DOMAIN {
            DOCKER_HUB_REGISTRY
        } else {
            &self.domain
        }
    }

    /// Probe `/v2/` over HTTPS, falling back to plain HTTP only when TLS
    /// verification was explicitly disabled
    async fn endpoint(&self) -> Result<&Endpoint> {
        self.endpoint
            .get_or_try_init(|| async {
                let mut schemes = vec!["https"];
                if self.auth.tls_verify.skip_verification() {
                    schemes.push("http");
                }

                let mut last_error = None;
                for scheme in schemes {
                    let base_url = Url::parse(&format!("{}://{}/", scheme, self.host()))
                        .map_err(|e| SyncError::InvalidReference {
                            input: self.domain.clone(),
                            reason: e.to_string(),
                        })?;
                    let ping = base_url.join("v2/").map_err(|e| SyncError::InvalidReference {
                        input: self.domain.clone(),
                        reason: e.to_string(),
                    })?;
                    self.logger.detail(&format!("Pinging registry at {}", ping));

                    match self.client.get(ping).send().await {
                        Ok(response) => {
                            let challenge = if response.status() == StatusCode::UNAUTHORIZED {
                                response
                                    .headers()
                                    .get(WWW_AUTHENTICATE)
                                    .and_then(|value| value.to_str().ok())
                                    .and_then(AuthChallenge::parse)
                            } else {
                                None
                            };
                            self.logger.detail(&format!(
                                "Registry {} responded with {} (challenge: {:?})",
                                self.domain,
                                response.status(),
                                challenge
                            ));
                            return Ok(Endpoint { base_url, challenge });
                        }
                        Err(e) => {
                            self.logger
                                .debug(&format!("Ping over {} failed: {}", scheme, e));
                            last_error = Some(e);
                        }
                    }
                }

                Err(match last_error {
                    Some(e) => SyncError::Http(e)
                        .context(format!("Pinging registry {}", self.domain)),
                    None => SyncError::Validation(format!("No endpoint for {}", self.domain)),
                })
            })
            .await
    }

    async fn authorization(&self, repository: &str, actions: &str) -> Result<Authorization> {
        let scope = repository_scope(repository, actions);
        if let Some(cached) = self.cached_token(&scope) {
            return Ok(cached);
        }

        let endpoint = self.endpoint().await?;
        let token = self
            .auth_flow
            .authorize(endpoint.challenge.as_ref(), &scope, self.auth.credentials.as_ref())
            .await?;
        let authorization = token.authorization.clone();
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(scope, token);
        }
        Ok(authorization)
    }

    fn cached_token(&self, scope: &str) -> Option<Authorization> {
        let tokens = self.tokens.lock().ok()?;
        let token = tokens.get(scope)?;
        if token.is_expired() {
            self.logger
                .detail(&format!("Token for {} expired, refreshing", scope));
            return None;
        }
        Some(token.authorization.clone())
    }

    fn invalidate_token(&self, repository: &str, actions: &str) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(&repository_scope(repository, actions));
        }
    }

    fn url(&self, endpoint: &Endpoint, path: &str) -> Result<Url> {
        endpoint
            .base_url
            .join(path)
            .map_err(|e| SyncError::InvalidReference {
                input: path.to_string(),
                reason: e.to_string(),
            })
    }

    fn authorized(&self, method: Method, url: Url, authorization: &Authorization) -> RequestBuilder {
        self.logger.trace(&format!("{} {}", method, url));
        authorization.apply(self.client.request(method, url))
    }

    /// A single authorized request; the body may only be sent once
    async fn request_url(
        &self,
        method: Method,
        repository: &str,
        actions: &str,
        url: Url,
    ) -> Result<RequestBuilder> {
        let authorization = self.authorization(repository, actions).await?;
        Ok(self.authorized(method, url, &authorization))
    }

    /// Send a request built by `build`
    ///
    /// A 401 to a request that carried a bearer token drops the cached token
    /// and sends the request once more with a fresh one.
    async fn send<F>(
        &self,
        method: Method,
        repository: &str,
        actions: &str,
        url: Url,
        build: F,
    ) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let authorization = self.authorization(repository, actions).await?;
        let response = build(self.authorized(method.clone(), url.clone(), &authorization))
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED || !authorization.is_bearer() {
            return Ok(response);
        }

        self.logger.warning(&format!(
            "Received 401 Unauthorized for {}, refreshing token",
            repository
        ));
        self.invalidate_token(repository, actions);
        let authorization = self.authorization(repository, actions).await?;
        Ok(build(self.authorized(method, url, &authorization)).send().await?)
    }

    async fn send_path<F>(
        &self,
        method: Method,
        repository: &str,
        actions: &str,
        path: &str,
        build: F,
    ) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let endpoint = self.endpoint().await?;
        let url = self.url(endpoint, path)?;
        self.send(method, repository, actions, url, build).await
    }

    /// List every tag of `repository`, following `Link` pagination
    pub async fn list_tags(&self, ctx: &OperationContext, repository: &str) -> Result<Vec<String>> {
        ctx.guard(async {
            self.logger
                .verbose(&format!("Listing tags for repository: {}", repository));
            let endpoint = self.endpoint().await?;
            let mut next = Some(self.url(endpoint, &format!("v2/{}/tags/list", repository))?);
            let mut visited = HashSet::new();
            let mut tags = Vec::new();

            while let Some(url) = next.take() {
                visited.insert(url.clone());
                let response = self
                    .send(Method::GET, repository, PULL, url.clone(), |request| request)
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(HttpErrorHandler::tag_listing_error(status, &body, repository));
                }

                next = next_page(response.headers(), &url);
                if let Some(link) = next.as_ref().filter(|link| visited.contains(*link)) {
                    self.logger.warning(&format!(
                        "Tag list pagination for {} loops back to {}, stopping",
                        repository, link
                    ));
                    next = None;
                }
                let page: TagList = response.json().await?;
                tags.extend(page.tags.unwrap_or_default());
            }

            self.logger.detail(&format!(
                "Found {} tags for repository {}",
                tags.len(),
                repository
            ));
            Ok(tags)
        })
        .await
    }

    pub async fn get_manifest(
        &self,
        ctx: &OperationContext,
        repository: &str,
        reference: &str,
    ) -> Result<ManifestResponse> {
        ctx.guard(async {
            let accept = ACCEPTED_MANIFEST_TYPES.join(", ");
            let response = self
                .send_path(
                    Method::GET,
                    repository,
                    PULL,
                    &format!("v2/{}/manifests/{}", repository, reference),
                    |request| request.header(ACCEPT, accept.as_str()),
                )
                .await?;
            let response = check(response, "manifest fetch", Some(RegistryErrorCode::ManifestUnknown)).await?;
            let content_type = header_string(response.headers(), CONTENT_TYPE.as_str())
                .map(|value| value.split(';').next().unwrap_or_default().trim().to_string());
            let digest = header_string(response.headers(), DOCKER_CONTENT_DIGEST);
            let bytes = response.bytes().await?.to_vec();
            Ok(ManifestResponse {
                bytes,
                content_type,
                digest,
            })
        })
        .await
    }

    pub async fn put_manifest(
        &self,
        ctx: &OperationContext,
        repository: &str,
        reference: &str,
        bytes: Vec<u8>,
        media_type: &str,
    ) -> Result<()> {
        ctx.guard(async {
            let response = self
                .send_path(
                    Method::PUT,
                    repository,
                    PUSH,
                    &format!("v2/{}/manifests/{}", repository, reference),
                    |request| request.header(CONTENT_TYPE, media_type).body(bytes.clone()),
                )
                .await?;
            check(response, "manifest upload", None).await?;
            Ok(())
        })
        .await
    }

    pub async fn blob_exists(&self, ctx: &OperationContext, repository: &str, digest: &str) -> Result<bool> {
        ctx.guard(async {
            let response = self
                .send_path(
                    Method::HEAD,
                    repository,
                    PUSH,
                    &format!("v2/{}/blobs/{}", repository, digest),
                    |request| request,
                )
                .await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(false),
                _ => check(response, "blob check", None).await.map(|_| true),
            }
        })
        .await
    }

    /// Open a blob for streaming; the body is read lazily by the caller
    pub async fn get_blob(&self, ctx: &OperationContext, repository: &str, digest: &str) -> Result<BlobStream> {
        ctx.guard(async {
            let response = self
                .send_path(
                    Method::GET,
                    repository,
                    PULL,
                    &format!("v2/{}/blobs/{}", repository, digest),
                    |request| request,
                )
                .await?;
            let response = check(response, "blob fetch", Some(RegistryErrorCode::BlobUnknown)).await?;
            let stream = response.bytes_stream().map_err(io::Error::other);
            Ok(Box::pin(StreamReader::new(stream)) as BlobStream)
        })
        .await
    }

    /// Monolithic upload: `POST` an upload session, then `PUT` the content
    pub async fn push_blob(
        &self,
        ctx: &OperationContext,
        repository: &str,
        digest: &str,
        size: u64,
        content: BlobStream,
    ) -> Result<()> {
        ctx.guard(async {
            let response = self
                .send_path(
                    Method::POST,
                    repository,
                    PUSH,
                    &format!("v2/{}/blobs/uploads/", repository),
                    |request| request.header(CONTENT_LENGTH, 0),
                )
                .await?;
            let response = check(response, "blob upload start", None).await?;
            let location = header_string(response.headers(), LOCATION.as_str()).ok_or_else(|| {
                SyncError::Validation("Registry did not return an upload location".to_string())
            })?;

            let endpoint = self.endpoint().await?;
            let mut upload_url = endpoint.base_url.join(&location).map_err(|e| SyncError::InvalidReference {
                input: location.clone(),
                reason: e.to_string(),
            })?;
            upload_url.query_pairs_mut().append_pair("digest", digest);

            let body = Body::wrap_stream(ReaderStream::new(content));
            let response = self
                .request_url(Method::PUT, repository, PUSH, upload_url)
                .await?
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, size)
                .body(body)
                .send()
                .await?;
            check(response, "blob upload", None).await?;
            Ok(())
        })
        .await
    }
}

/// Turn a non-success response into a typed registry error
///
/// Bodiless 404s (HEAD requests) get `missing_code` so that an absent
/// resource is still recognized as such.
async fn check(response: Response, operation: &str, missing_code: Option<RegistryErrorCode>) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let mut error = HttpErrorHandler::registry_error(status, &body, operation);
    if error.code.is_none() && status == StatusCode::NOT_FOUND {
        error.code = missing_code;
    }
    Err(error.into())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// The `rel="next"` target of a `Link` header, resolved against `current`
fn next_page(headers: &HeaderMap, current: &Url) -> Option<Url> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|entry| {
        let (target, params) = entry.split_once(';')?;
        if !params.replace(' ', "").contains("rel=\"next\"") {
            return None;
        }
        let target = target.trim().trim_start_matches('<').trim_end_matches('>');
        current.join(target).ok()
    })
}

/// Clients shared per (registry, auth context) pair
#[derive(Clone)]
pub struct RegistryClients {
    logger: Logger,
    clients: Arc<Mutex<Vec<Arc<RegistryClient>>>>,
}

impl RegistryClients {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger,
            clients: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn get(&self, domain: &str, auth: &Arc<AuthContext>) -> Result<Arc<RegistryClient>> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| SyncError::Validation("registry client pool poisoned".to_string()))?;
        if let Some(existing) = clients
            .iter()
            .find(|client| client.domain == domain && *client.auth == **auth)
        {
            return Ok(existing.clone());
        }

        let client = Arc::new(RegistryClient::builder(domain, auth.clone(), self.logger.clone()).build()?);
        clients.push(client.clone());
        Ok(client)
    }
}
