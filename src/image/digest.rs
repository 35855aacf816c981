//! Digest utilities and streaming blob verification
//!
//! [`DigestUtils`] covers the small helpers used when naming and logging blobs.
//! [`DigestVerifyingReader`] authenticates a blob while it streams: every byte
//! is hashed as it passes through, and end-of-stream is only reported once the
//! running hash matches the expected digest.

use crate::error::{Result, SyncError};
use once_cell::sync::Lazy;
use sha2::digest::DynDigest;
use sha2::{Sha256, Sha512};
use std::collections::HashMap;
use std::io::{self, Read};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, ReadBuf};

/// Utilities for working with digests in registry context
pub struct DigestUtils;

impl DigestUtils {
    /// Compute SHA256 digest from byte data
    pub fn compute_sha256(data: &[u8]) -> String {
        let mut hasher = Sha256::default();
        DynDigest::update(&mut hasher, data);
        hex::encode(DynDigest::finalize_reset(&mut hasher))
    }

    /// Compute full digest (with sha256: prefix) from byte data
    pub fn compute_docker_digest(data: &[u8]) -> String {
        format!("sha256:{}", Self::compute_sha256(data))
    }

    /// Split `algorithm:hex` into its two parts
    pub fn split(digest: &str) -> Result<(&str, &str)> {
        digest
            .split_once(':')
            .filter(|(algorithm, hex)| !algorithm.is_empty() && !hex.is_empty())
            .ok_or_else(|| SyncError::InvalidDigestSpec(digest.to_string()))
    }

    /// The encoded part of a digest, used as the blob file name in `dir` images
    pub fn encoded_part(digest: &str) -> Result<&str> {
        let (_, encoded) = Self::split(digest)?;
        if encoded.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(encoded)
        } else {
            Err(SyncError::InvalidDigestSpec(digest.to_string()))
        }
    }

    /// Format digest for display (truncated for readability)
    ///
    /// Digests come from untrusted manifests, so the cut is made on a
    /// character boundary.
    pub fn format_digest_short(digest: &str) -> String {
        match digest.char_indices().nth(19) {
            Some((end, _)) => format!("{}...", &digest[..end]),
            None => digest.to_string(),
        }
    }
}

pub type HasherFactory = fn() -> Box<dyn DynDigest + Send + Sync>;

fn sha256_hasher() -> Box<dyn DynDigest + Send + Sync> {
    Box::new(Sha256::default())
}

fn sha512_hasher() -> Box<dyn DynDigest + Send + Sync> {
    Box::new(Sha512::default())
}

/// Named digest algorithms that blob digests may use
///
/// New algorithms are added with [`DigestAlgorithms::register`]; readers look
/// them up by the prefix of the digest string, so call sites never change.
#[derive(Clone)]
pub struct DigestAlgorithms {
    factories: HashMap<String, HasherFactory>,
}

static DEFAULT_ALGORITHMS: Lazy<DigestAlgorithms> = Lazy::new(DigestAlgorithms::default);

impl Default for DigestAlgorithms {
    fn default() -> Self {
        let mut algorithms = Self::empty();
        algorithms.register("sha256", sha256_hasher);
        algorithms.register("sha512", sha512_hasher);
        algorithms
    }
}

impl DigestAlgorithms {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Algorithms known to every reader created with [`DigestVerifyingReader::new`]
    pub fn standard() -> &'static DigestAlgorithms {
        &DEFAULT_ALGORITHMS
    }

    pub fn register(&mut self, name: &str, factory: HasherFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn hasher(&self, name: &str) -> Option<Box<dyn DynDigest + Send + Sync>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

enum Verification {
    Pending,
    Verified,
    Mismatch { actual: String },
}

/// Wraps a byte stream and fails at end-of-stream unless its content matches
/// an expected digest
///
/// The failure flag is owned by the caller. A consumer that stops reading
/// early (for instance because the destination already has the blob) never
/// reaches end-of-stream, so verification never runs; checking the flag alone
/// is therefore not proof of success, only proof of failure.
pub struct DigestVerifyingReader<R> {
    source: R,
    hasher: Box<dyn DynDigest + Send + Sync>,
    expected: Vec<u8>,
    expected_digest: String,
    failure: Arc<AtomicBool>,
    state: Verification,
}

impl<R> DigestVerifyingReader<R> {
    /// Create a reader for `expected_digest` (`<algorithm>:<hex>`) using the
    /// standard algorithm set
    pub fn new(source: R, expected_digest: &str, failure: Arc<AtomicBool>) -> Result<Self> {
        Self::with_algorithms(source, expected_digest, failure, DigestAlgorithms::standard())
    }

    pub fn with_algorithms(
        source: R,
        expected_digest: &str,
        failure: Arc<AtomicBool>,
        algorithms: &DigestAlgorithms,
    ) -> Result<Self> {
        let (algorithm, encoded) = DigestUtils::split(expected_digest)?;
        let hasher = algorithms.hasher(algorithm).ok_or_else(|| {
            SyncError::InvalidDigestSpec(format!(
                "{}: unknown digest type {}",
                expected_digest, algorithm
            ))
        })?;
        let expected = hex::decode(encoded).map_err(|e| {
            SyncError::InvalidDigestSpec(format!("{}: {}", expected_digest, e))
        })?;
        if expected.len() != hasher.output_size() {
            return Err(SyncError::InvalidDigestSpec(format!(
                "{}: length {} does not match {}",
                expected_digest,
                expected.len(),
                hasher.output_size()
            )));
        }

        Ok(Self {
            source,
            hasher,
            expected,
            expected_digest: expected_digest.to_string(),
            failure,
            state: Verification::Pending,
        })
    }

    pub fn expected_digest(&self) -> &str {
        &self.expected_digest
    }

    /// Whether end-of-stream was reached with a matching digest
    pub fn is_verified(&self) -> bool {
        matches!(self.state, Verification::Verified)
    }

    fn mismatch_error(&self, actual: &str) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            SyncError::DigestMismatch {
                expected: self.expected_digest.clone(),
                actual: actual.to_string(),
            },
        )
    }

    fn finish(&mut self) -> io::Result<()> {
        match &self.state {
            Verification::Verified => Ok(()),
            Verification::Mismatch { actual } => Err(self.mismatch_error(actual)),
            Verification::Pending => {
                let computed = self.hasher.finalize_reset();
                if bool::from(computed.as_ref().ct_eq(self.expected.as_slice())) {
                    self.state = Verification::Verified;
                    return Ok(());
                }
                let algorithm = self
                    .expected_digest
                    .split_once(':')
                    .map(|(algorithm, _)| algorithm)
                    .unwrap_or_default();
                let actual = format!("{}:{}", algorithm, hex::encode(computed));
                self.failure.store(true, Ordering::SeqCst);
                let err = self.mismatch_error(&actual);
                self.state = Verification::Mismatch { actual };
                Err(err)
            }
        }
    }
}

impl<R: Read> Read for DigestVerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Verification::Mismatch { actual } = &self.state {
            return Err(self.mismatch_error(actual));
        }
        let n = self.source.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
            return Ok(n);
        }
        if !buf.is_empty() {
            self.finish()?;
        }
        Ok(0)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestVerifyingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Verification::Mismatch { actual } = &this.state {
            return Poll::Ready(Err(this.mismatch_error(actual)));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.source).poll_read(cx, buf))?;
        let filled = &buf.filled()[before..];
        if filled.is_empty() {
            this.finish()?;
        } else {
            this.hasher.update(filled);
        }
        Poll::Ready(Ok(()))
    }
}

/// Recover the typed error carried by an I/O error from a verifying reader
pub fn verification_error(err: io::Error) -> SyncError {
    if err
        .get_ref()
        .is_some_and(|inner| inner.downcast_ref::<SyncError>().is_some())
    {
        if let Some(inner) = err.into_inner() {
            if let Ok(sync_err) = inner.downcast::<SyncError>() {
                return *sync_err;
            }
        }
        return SyncError::Io(io::Error::other("verification error lost its payload"));
    }
    SyncError::Io(err)
}
