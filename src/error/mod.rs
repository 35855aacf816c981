//! Error types for image synchronization
//!
//! Every fallible operation in the crate returns [`SyncError`]. Errors coming
//! from collaborators (registry HTTP calls, filesystem, YAML parsing) are kept
//! as typed sources so the retry classifier can inspect their shape instead of
//! matching on message text.

pub mod handlers;

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad transport combination or malformed job, reported before any I/O
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0:?} is not a supported transport")]
    UnsupportedTransport(String),

    #[error("Invalid image reference {input:?}: {reason}")]
    InvalidReference { input: String, reason: String },

    #[error("Invalid digest specification {0}")]
    InvalidDigestSpec(String),

    /// Content read from a blob stream does not hash to the declared digest
    #[error("Digest did not match, expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("No images to sync found in {0:?}")]
    NoImagesFound(String),

    #[error("Refusing to overwrite destination directory {}", .0.display())]
    DestinationExists(PathBuf),

    /// Source configuration could not be loaded or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// The registry refused to enumerate tags for a repository
    #[error("Registry disallows tag list retrieval for {repository}: {reason}")]
    TagListingDenied { repository: String, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryApiError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    /// Several independent failures collected from one multi-step operation
    #[error("{} errors occurred: {}", .0.len(), join_messages(.0))]
    Multiple(Vec<SyncError>),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Wrap this error with a higher-level description
    pub fn context(self, context: impl Into<String>) -> Self {
        SyncError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Render the full cause chain as `outer: inner: root`
    pub fn chain(&self) -> String {
        let mut rendered = self.to_string();
        let mut current: Option<&(dyn std::error::Error + 'static)> =
            std::error::Error::source(self);
        while let Some(cause) = current {
            let message = cause.to_string();
            // transparent and #[from] variants repeat their source message
            if !rendered.ends_with(&message) {
                rendered.push_str(": ");
                rendered.push_str(&message);
            }
            current = cause.source();
        }
        rendered
    }

    /// The innermost error once all `Context` layers are peeled off
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_digest_mismatch(&self) -> bool {
        matches!(self.root(), SyncError::DigestMismatch { .. })
    }
}

fn join_messages(errors: &[SyncError]) -> String {
    errors
        .iter()
        .map(|e| e.chain())
        .collect::<Vec<_>>()
        .join("; ")
}

/// The next cause of `err`, looking inside custom I/O errors whose payload
/// `source()` does not expose
pub fn next_cause<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a (dyn std::error::Error + 'static)> {
    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
        if let Some(inner) = io_err.get_ref() {
            return Some(inner);
        }
    }
    err.source()
}

/// `err` as a [`SyncError`], whether referenced directly or through a box
pub fn as_sync_error<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a SyncError> {
    err.downcast_ref::<SyncError>()
        .or_else(|| err.downcast_ref::<Box<SyncError>>().map(|boxed| boxed.as_ref()))
}

/// The first digest mismatch anywhere in the cause chain of `err`
pub fn find_digest_mismatch(err: &(dyn std::error::Error + 'static)) -> Option<SyncError> {
    let mut current = Some(err);
    while let Some(level) = current {
        if let Some(SyncError::DigestMismatch { expected, actual }) = as_sync_error(level) {
            return Some(SyncError::DigestMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            });
        }
        current = next_cause(level);
    }
    None
}

/// Add context to any result whose error converts into [`SyncError`]
pub trait ResultExt<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T>;

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T, E: Into<SyncError>> ResultExt<T> for std::result::Result<T, E> {
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().context(f()))
    }
}

/// Docker Registry HTTP API v2 error codes relevant to sync decisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryErrorCode {
    Unauthorized,
    Denied,
    ManifestUnknown,
    NameUnknown,
    BlobUnknown,
    TooManyRequests,
    Unsupported,
    Other(String),
}

impl RegistryErrorCode {
    pub fn parse(code: &str) -> Self {
        match code {
            "UNAUTHORIZED" => RegistryErrorCode::Unauthorized,
            "DENIED" => RegistryErrorCode::Denied,
            "MANIFEST_UNKNOWN" => RegistryErrorCode::ManifestUnknown,
            "NAME_UNKNOWN" => RegistryErrorCode::NameUnknown,
            "BLOB_UNKNOWN" => RegistryErrorCode::BlobUnknown,
            "TOOMANYREQUESTS" => RegistryErrorCode::TooManyRequests,
            "UNSUPPORTED" => RegistryErrorCode::Unsupported,
            other => RegistryErrorCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RegistryErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryErrorCode::Unauthorized => write!(f, "UNAUTHORIZED"),
            RegistryErrorCode::Denied => write!(f, "DENIED"),
            RegistryErrorCode::ManifestUnknown => write!(f, "MANIFEST_UNKNOWN"),
            RegistryErrorCode::NameUnknown => write!(f, "NAME_UNKNOWN"),
            RegistryErrorCode::BlobUnknown => write!(f, "BLOB_UNKNOWN"),
            RegistryErrorCode::TooManyRequests => write!(f, "TOOMANYREQUESTS"),
            RegistryErrorCode::Unsupported => write!(f, "UNSUPPORTED"),
            RegistryErrorCode::Other(code) => write!(f, "{}", code),
        }
    }
}

/// A protocol-level error reported by a registry
#[derive(Debug, Clone, Error)]
#[error("Registry error (status {status}){}: {message}", code_suffix(.code))]
pub struct RegistryApiError {
    pub status: u16,
    pub code: Option<RegistryErrorCode>,
    pub message: String,
}

fn code_suffix(code: &Option<RegistryErrorCode>) -> String {
    code.as_ref()
        .map(|c| format!(" [{}]", c))
        .unwrap_or_default()
}

impl RegistryApiError {
    pub fn new(status: u16, code: Option<RegistryErrorCode>, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401 || self.code == Some(RegistryErrorCode::Unauthorized)
    }

    pub fn is_unknown_resource(&self) -> bool {
        matches!(
            self.code,
            Some(RegistryErrorCode::ManifestUnknown) | Some(RegistryErrorCode::NameUnknown)
        )
    }
}
