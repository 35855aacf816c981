//! Authentication for Docker Registry HTTP API v2
//!
//! Registries announce their scheme in the `WWW-Authenticate` header of a
//! 401 response to `GET /v2/`. Basic challenges are answered by sending the
//! credentials on every request; bearer challenges by exchanging the
//! credentials (or nothing, for anonymous pulls) for a token scoped to one
//! repository.

use crate::error::handlers::HttpErrorHandler;
use crate::error::{Result, SyncError};
use crate::logging::Logger;
use crate::transport::Credentials;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// Lifetime assumed for a token whose response carries no `expires_in`
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl AuthChallenge {
    /// Parse a `WWW-Authenticate` header value
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(AuthChallenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut params = parse_params(params);
        let realm = params.remove("realm")?;
        Some(AuthChallenge::Bearer {
            realm,
            service: params.remove("service"),
            scope: params.remove("scope"),
        })
    }
}

/// Split `key="value",key2=value2`, keeping commas inside quotes
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in input.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    for part in parts {
        if let Some((key, value)) = part.split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// How requests to one repository scope are authorized
#[derive(Clone, PartialEq, Eq)]
pub enum Authorization {
    Anonymous,
    Basic(Credentials),
    Bearer(String),
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authorization::Anonymous => f.write_str("Anonymous"),
            Authorization::Basic(credentials) => f.debug_tuple("Basic").field(credentials).finish(),
            Authorization::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

impl Authorization {
    pub fn is_bearer(&self) -> bool {
        matches!(self, Authorization::Bearer(_))
    }

    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Authorization::Anonymous => request,
            Authorization::Basic(credentials) => {
                request.basic_auth(&credentials.username, Some(&credentials.password))
            }
            Authorization::Bearer(token) => request.bearer_auth(token),
        }
    }
}

/// An [`Authorization`] together with the moment it stops being valid
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub authorization: Authorization,
    pub expires_at: Option<Instant>,
}

impl TokenInfo {
    /// Authorization that never expires (anonymous or basic)
    pub fn permanent(authorization: Authorization) -> Self {
        Self {
            authorization,
            expires_at: None,
        }
    }

    pub fn bearer(token: String, lifetime: Duration) -> Self {
        Self {
            authorization: Authorization::Bearer(token),
            expires_at: Some(Instant::now() + lifetime),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }
}

/// `repository:<name>:<actions>` token scope
pub fn repository_scope(repository: &str, actions: &str) -> String {
    format!("repository:{}:{}", repository, actions)
}

#[derive(Debug, Clone)]
pub struct Auth {
    client: Client,
    logger: Logger,
}

impl Auth {
    pub fn new(client: Client, logger: Logger) -> Self {
        Self { client, logger }
    }

    /// Answer `challenge` for `scope`
    pub async fn authorize(
        &self,
        challenge: Option<&AuthChallenge>,
        scope: &str,
        credentials: Option<&Credentials>,
    ) -> Result<TokenInfo> {
        match challenge {
            None => Ok(TokenInfo::permanent(Authorization::Anonymous)),
            Some(AuthChallenge::Basic) => Ok(TokenInfo::permanent(
                credentials
                    .cloned()
                    .map(Authorization::Basic)
                    .unwrap_or(Authorization::Anonymous),
            )),
            Some(AuthChallenge::Bearer { realm, service, .. }) => {
                let (token, lifetime) = self
                    .request_token(realm, service.as_deref(), scope, credentials)
                    .await?;
                Ok(TokenInfo::bearer(token, lifetime))
            }
        }
    }

    async fn request_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        credentials: Option<&Credentials>,
    ) -> Result<(String, Duration)> {
        let mut url = Url::parse(realm).map_err(|e| {
            SyncError::Config(format!("Invalid token realm {:?}: {}", realm, e))
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            query.append_pair("scope", scope);
        }

        self.logger.detail(&format!("Requesting token from: {}", url));

        let mut request = self.client.get(url);
        if let Some(credentials) = credentials {
            self.logger
                .verbose(&format!("Authenticating as user: {}", credentials.username));
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::registry_error(status, &body, "token request").into());
        }

        let token_response: TokenResponse = response.json().await?;
        let token = token_response
            .token
            .or(token_response.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                SyncError::Config("Token response did not contain a token".to_string())
            })?;

        let lifetime = token_response
            .expires_in
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        self.logger
            .detail(&format!("Token obtained (length: {} chars)", token.len()));
        self.logger
            .detail(&format!("Token expires in {} seconds", lifetime.as_secs()));
        Ok((token, lifetime))
    }
}
