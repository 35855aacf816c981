//! Transports, image references and per-registry authentication context

use crate::error::{Result, SyncError};
use crate::image::DockerReference;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DOCKER_TRANSPORT: &str = "docker";
pub const DIR_TRANSPORT: &str = "dir";
pub const YAML_TRANSPORT: &str = "yaml";

/// Where a sync job reads images from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTransport {
    Docker,
    Dir,
    Yaml,
}

impl SourceTransport {
    pub fn name(&self) -> &'static str {
        match self {
            SourceTransport::Docker => DOCKER_TRANSPORT,
            SourceTransport::Dir => DIR_TRANSPORT,
            SourceTransport::Yaml => YAML_TRANSPORT,
        }
    }
}

impl FromStr for SourceTransport {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            DOCKER_TRANSPORT => Ok(SourceTransport::Docker),
            DIR_TRANSPORT => Ok(SourceTransport::Dir),
            YAML_TRANSPORT => Ok(SourceTransport::Yaml),
            other => Err(SyncError::UnsupportedTransport(other.to_string())),
        }
    }
}

impl fmt::Display for SourceTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a sync job writes images to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationTransport {
    Docker,
    Dir,
}

impl DestinationTransport {
    pub fn name(&self) -> &'static str {
        match self {
            DestinationTransport::Docker => DOCKER_TRANSPORT,
            DestinationTransport::Dir => DIR_TRANSPORT,
        }
    }
}

impl FromStr for DestinationTransport {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            DOCKER_TRANSPORT => Ok(DestinationTransport::Docker),
            DIR_TRANSPORT => Ok(DestinationTransport::Dir),
            other => Err(SyncError::UnsupportedTransport(other.to_string())),
        }
    }
}

impl fmt::Display for DestinationTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A transport-qualified locator for one image
///
/// References are immutable and only ever compared through their serialized
/// form (`docker://...`, `dir:...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageReference {
    Docker(DockerReference),
    Dir(PathBuf),
}

impl ImageReference {
    /// Parse `transport:reference`, e.g. `docker://busybox:latest` or `dir:/tmp/img`
    pub fn parse(input: &str) -> Result<Self> {
        let (transport, within) = input.split_once(':').ok_or_else(|| SyncError::InvalidReference {
            input: input.to_string(),
            reason: "expected transport:reference".to_string(),
        })?;
        match transport {
            DOCKER_TRANSPORT => {
                let name = within.strip_prefix("//").ok_or_else(|| SyncError::InvalidReference {
                    input: input.to_string(),
                    reason: "docker references must start with //".to_string(),
                })?;
                Ok(ImageReference::Docker(DockerReference::parse_normalized(name)?))
            }
            DIR_TRANSPORT => Ok(ImageReference::dir(within)),
            other => Err(SyncError::UnsupportedTransport(other.to_string())),
        }
    }

    pub fn dir(path: impl AsRef<Path>) -> Self {
        ImageReference::Dir(path.as_ref().to_path_buf())
    }

    pub fn transport_name(&self) -> &'static str {
        match self {
            ImageReference::Docker(_) => DOCKER_TRANSPORT,
            ImageReference::Dir(_) => DIR_TRANSPORT,
        }
    }

    /// The reference without its transport prefix
    pub fn string_within_transport(&self) -> String {
        match self {
            ImageReference::Docker(reference) => format!("//{}", reference),
            ImageReference::Dir(path) => path.display().to_string(),
        }
    }

    pub fn docker_reference(&self) -> Option<&DockerReference> {
        match self {
            ImageReference::Docker(reference) => Some(reference),
            ImageReference::Dir(_) => None,
        }
    }

    pub fn dir_path(&self) -> Option<&Path> {
        match self {
            ImageReference::Dir(path) => Some(path),
            ImageReference::Docker(_) => None,
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport_name(), self.string_within_transport())
    }
}

/// Registry username and password
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse `USERNAME[:PASSWORD]`
    pub fn parse(creds: &str) -> Result<Self> {
        if creds.is_empty() {
            return Err(SyncError::Validation("credentials can't be empty".to_string()));
        }
        match creds.split_once(':') {
            None => Ok(Self::new(creds, "")),
            Some(("", _)) => Err(SyncError::Validation("username can't be empty".to_string())),
            Some((username, password)) => Ok(Self::new(username, password)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// TLS certificate verification mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVerify {
    Enabled,
    Disabled,
    #[default]
    Unspecified,
}

impl TlsVerify {
    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            Some(true) => TlsVerify::Enabled,
            Some(false) => TlsVerify::Disabled,
            None => TlsVerify::Unspecified,
        }
    }

    /// Only an explicit opt-out disables verification
    pub fn skip_verification(&self) -> bool {
        matches!(self, TlsVerify::Disabled)
    }
}

/// Credentials and TLS policy used for one registry's requests
///
/// Shared behind an `Arc` by every repository resolved from the same source
/// entry and never mutated afterwards; use [`AuthContext::derive`] to build a
/// modified copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub credentials: Option<Credentials>,
    pub tls_verify: TlsVerify,
    pub cert_dir: Option<PathBuf>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Copy-on-write: a new context starting from this one
    pub fn derive(&self) -> Self {
        self.clone()
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials.filter(|c| !c.is_empty());
        self
    }

    pub fn with_tls_verify(mut self, tls_verify: TlsVerify) -> Self {
        self.tls_verify = tls_verify;
        self
    }

    pub fn with_cert_dir(mut self, cert_dir: Option<PathBuf>) -> Self {
        self.cert_dir = cert_dir;
        self
    }
}
