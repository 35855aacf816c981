//! Decide whether a failed operation is worth another attempt
//!
//! Classification walks the error's cause chain. At every level an ordered
//! list of predicates is consulted; the first predicate that recognizes the
//! shape of the error decides. Errors nobody recognizes are not retried.

use crate::error::{RegistryApiError, SyncError, as_sync_error, next_cause};
use std::error::Error;
use std::io;

/// A predicate returns `Some(verdict)` when it recognizes the error shape
pub type Predicate = fn(&(dyn Error + 'static)) -> Option<bool>;

/// Predicates in evaluation order
pub const PREDICATES: &[(&str, Predicate)] = &[
    ("caller context", caller_context),
    ("aggregate", aggregate),
    ("integrity", integrity),
    ("registry protocol", registry_protocol),
    ("http transport", http_transport),
    ("connection", connection),
];

pub fn is_retryable(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(level) = current {
        for (_, predicate) in PREDICATES {
            if let Some(verdict) = predicate(level) {
                return verdict;
            }
        }
        current = next_cause(level);
    }
    false
}

/// Cancellation and deadlines come from the caller and must be respected
pub fn caller_context(err: &(dyn Error + 'static)) -> Option<bool> {
    match as_sync_error(err)? {
        SyncError::Cancelled | SyncError::DeadlineExceeded => Some(false),
        _ => None,
    }
}

/// One permanent cause makes the whole aggregate permanent
pub fn aggregate(err: &(dyn Error + 'static)) -> Option<bool> {
    match as_sync_error(err)? {
        SyncError::Multiple(causes) => Some(
            !causes.is_empty() && causes.iter().all(|cause| is_retryable(cause)),
        ),
        _ => None,
    }
}

/// A corrupted blob will not fix itself on the next attempt
pub fn integrity(err: &(dyn Error + 'static)) -> Option<bool> {
    match as_sync_error(err)? {
        SyncError::DigestMismatch { .. } | SyncError::InvalidDigestSpec(_) => Some(false),
        _ => None,
    }
}

pub fn registry_protocol(err: &(dyn Error + 'static)) -> Option<bool> {
    let api = match as_sync_error(err) {
        Some(SyncError::Registry(api)) => api,
        Some(SyncError::TagListingDenied { .. }) => return Some(false),
        Some(_) => return None,
        None => err.downcast_ref::<RegistryApiError>()?,
    };
    Some(!(api.is_unauthorized() || api.is_unknown_resource()))
}

pub fn http_transport(err: &(dyn Error + 'static)) -> Option<bool> {
    let http = err.downcast_ref::<reqwest::Error>()?;
    if http.is_connect() {
        return Some(!chain_has_io_kind(err, io::ErrorKind::ConnectionRefused));
    }
    if http.is_timeout() {
        return Some(true);
    }
    if let Some(status) = http.status() {
        let code = status.as_u16();
        return Some(code == 429 || code == 408 || status.is_server_error());
    }
    // request/body failures are decided by the I/O error underneath, if any
    None
}

pub fn connection(err: &(dyn Error + 'static)) -> Option<bool> {
    let io_err = err.downcast_ref::<io::Error>()?;
    match io_err.kind() {
        io::ErrorKind::ConnectionRefused => Some(false),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::Interrupted => Some(true),
        _ => None,
    }
}

fn chain_has_io_kind(err: &(dyn Error + 'static), kind: io::ErrorKind) -> bool {
    let mut current = Some(err);
    while let Some(level) = current {
        if level
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == kind)
        {
            return true;
        }
        current = next_cause(level);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryErrorCode;

    fn io(kind: io::ErrorKind) -> SyncError {
        SyncError::Io(io::Error::new(kind, "simulated"))
    }

    #[test]
    fn test_unauthorized_is_permanent() {
        let err = SyncError::Registry(RegistryApiError::new(401, None, "unauthorized"));
        assert!(!is_retryable(&err));
        let coded = SyncError::Registry(RegistryApiError::new(
            403,
            Some(RegistryErrorCode::Unauthorized),
            "unauthorized",
        ));
        assert!(!is_retryable(&coded));
    }

    #[test]
    fn test_unknown_manifest_and_name_are_permanent() {
        for code in [RegistryErrorCode::ManifestUnknown, RegistryErrorCode::NameUnknown] {
            let err = SyncError::Registry(RegistryApiError::new(404, Some(code), "unknown"));
            assert!(!is_retryable(&err));
        }
    }

    #[test]
    fn test_other_registry_errors_are_retryable() {
        let err = SyncError::Registry(RegistryApiError::new(
            429,
            Some(RegistryErrorCode::TooManyRequests),
            "slow down",
        ));
        assert!(is_retryable(&err));
        let err = SyncError::Registry(RegistryApiError::new(503, None, "unavailable"));
        assert!(is_retryable(&err));
    }

    #[test]
    fn test_connection_reset_is_retryable_refused_is_not() {
        assert!(is_retryable(&io(io::ErrorKind::ConnectionReset)));
        assert!(!is_retryable(&io(io::ErrorKind::ConnectionRefused)));
    }

    #[test]
    fn test_context_wrapping_is_transparent() {
        let err = io(io::ErrorKind::ConnectionReset)
            .context("blob upload")
            .context("Error copying tag");
        assert!(is_retryable(&err));
        let err = SyncError::Cancelled.context("Error copying tag");
        assert!(!is_retryable(&err));
    }

    #[test]
    fn test_aggregate_requires_every_cause_retryable() {
        let mixed = SyncError::Multiple(vec![
            io(io::ErrorKind::ConnectionReset),
            SyncError::Registry(RegistryApiError::new(401, None, "unauthorized")),
        ]);
        assert!(!is_retryable(&mixed));

        let all_transient = SyncError::Multiple(vec![
            io(io::ErrorKind::ConnectionReset),
            io(io::ErrorKind::TimedOut),
        ]);
        assert!(is_retryable(&all_transient));
        assert!(!is_retryable(&SyncError::Multiple(Vec::new())));
    }

    #[test]
    fn test_digest_mismatch_inside_io_error_is_permanent() {
        let inner = SyncError::DigestMismatch {
            expected: "sha256:aa".into(),
            actual: "sha256:bb".into(),
        };
        let err = SyncError::Io(io::Error::new(io::ErrorKind::InvalidData, inner));
        assert!(!is_retryable(&err));
    }

    #[test]
    fn test_unknown_shapes_fail_closed() {
        assert!(!is_retryable(&SyncError::Validation("bad".into())));
        assert!(!is_retryable(&io(io::ErrorKind::PermissionDenied)));
        let foreign = std::fmt::Error;
        assert!(!is_retryable(&foreign));
    }

    #[test]
    fn test_predicates_are_individually_usable() {
        let err = SyncError::DeadlineExceeded;
        assert_eq!(caller_context(&err), Some(false));
        assert_eq!(integrity(&err), None);
        assert_eq!(connection(&io::Error::from(io::ErrorKind::BrokenPipe)), Some(true));
    }
}
