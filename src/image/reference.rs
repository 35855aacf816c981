//! Parsed Docker-style image references
//!
//! [`DockerReference`] follows Docker's normalization rules: a first path
//! component containing a dot or a colon (or exactly `localhost`) names the
//! registry; otherwise the reference lives on `docker.io`, and single
//! component names are placed under `library/`.

use crate::error::{Result, SyncError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_DOMAIN: &str = "docker.io";
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";
pub const DEFAULT_TAG: &str = "latest";
const NAME_TOTAL_LENGTH_MAX: usize = 255;

static DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        "^",
        "(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])",
        "(?:\\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*",
        "(?::[0-9]+)?",
        "$",
    ))
    .expect("domain pattern is valid")
});

static PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        "^",
        "[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*",
        "(?:/[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*)*",
        "$",
    ))
    .expect("path pattern is valid")
});

static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[\\w][\\w.-]{0,127}$").expect("tag pattern is valid"));

static DIGEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}$")
        .expect("digest pattern is valid")
});

/// A fully normalized registry image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DockerReference {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
}

fn invalid(input: &str, reason: impl Into<String>) -> SyncError {
    SyncError::InvalidReference {
        input: input.to_string(),
        reason: reason.into(),
    }
}

impl DockerReference {
    /// Parse a possibly short (`busybox`, `team/app:1.0`) reference into its
    /// normalized form
    pub fn parse_normalized(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(invalid(input, "repository name must have at least one component"));
        }

        let (remainder, digest) = match input.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (input, None),
        };
        let last_slash = remainder.rfind('/');
        let (name, tag) = match remainder.rfind(':') {
            Some(colon) if last_slash.is_none_or(|slash| colon > slash) => {
                (&remainder[..colon], Some(&remainder[colon + 1..]))
            }
            _ => (remainder, None),
        };

        let (domain, path) = split_domain(name);
        if domain.is_empty() || path.is_empty() {
            return Err(invalid(input, "repository name must have at least one component"));
        }
        if !DOMAIN.is_match(&domain) {
            return Err(invalid(input, format!("invalid registry domain {:?}", domain)));
        }
        if path.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid(input, "repository name must be lowercase"));
        }
        if !PATH.is_match(&path) {
            return Err(invalid(input, "invalid reference format"));
        }
        if domain.len() + 1 + path.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(invalid(
                input,
                format!("repository name must not be more than {} characters", NAME_TOTAL_LENGTH_MAX),
            ));
        }
        if let Some(tag) = tag {
            if !TAG.is_match(tag) {
                return Err(invalid(input, format!("invalid tag {:?}", tag)));
            }
        }
        if let Some(digest) = digest {
            if !DIGEST.is_match(digest) {
                return Err(invalid(input, format!("invalid digest {:?}", digest)));
            }
        }

        Ok(Self {
            domain,
            path,
            tag: tag.map(str::to_string),
            digest: digest.map(str::to_string),
        })
    }

    /// Parse a reference that must name a repository, not a tagged image
    pub fn parse_repository(input: &str) -> Result<Self> {
        let reference = Self::parse_normalized(input)?;
        if !reference.is_name_only() {
            return Err(invalid(input, "input names a reference, not a repository"));
        }
        Ok(reference)
    }

    /// `domain/path`, without tag or digest
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Repository path within the registry (`library/busybox`)
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    pub fn is_name_only(&self) -> bool {
        self.tag.is_none() && self.digest.is_none()
    }

    /// A copy of this repository reference pointing at `tag`
    pub fn with_tag(&self, tag: &str) -> Result<Self> {
        if !TAG.is_match(tag) {
            return Err(invalid(&format!("{}:{}", self.name(), tag), format!("invalid tag {:?}", tag)));
        }
        Ok(Self {
            domain: self.domain.clone(),
            path: self.path.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        })
    }

    /// Name-only references get the `latest` tag; others are returned as-is
    pub fn tag_name_only(&self) -> Self {
        if self.is_name_only() {
            let mut tagged = self.clone();
            tagged.tag = Some(DEFAULT_TAG.to_string());
            tagged
        } else {
            self.clone()
        }
    }

    /// The manifest reference to request from the registry: digest, else tag
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }
}

fn split_domain(name: &str) -> (String, String) {
    let (mut domain, mut path) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.')
                || first.contains(':')
                || first == "localhost"
                || first.to_lowercase() != first =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    };
    if domain == LEGACY_DEFAULT_DOMAIN {
        domain = DEFAULT_DOMAIN.to_string();
    }
    if domain == DEFAULT_DOMAIN && !path.contains('/') {
        path = format!("{}{}", OFFICIAL_REPO_PREFIX, path);
    }
    (domain, path)
}

impl fmt::Display for DockerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for DockerReference {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_normalized(s)
    }
}
