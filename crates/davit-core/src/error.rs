use thiserror::Error;

pub type Result<T> = std::result::Result<T, DavitError>;

/// A reportable per-entry failure collected by the pipelines.
#[derive(Debug, Clone)]
pub struct EntryError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum DavitError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("repository not found at '{0}'")]
    RepoNotFound(String),

    #[error("repository already exists at '{0}'")]
    RepoAlreadyExists(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("MAC verification failed: data has been tampered with or the key is wrong")]
    MacMismatch,

    #[error("wrong passphrase: no key could be decrypted")]
    WrongPassphrase,

    #[error("corrupt {kind} {id}: {detail}")]
    Corrupt {
        kind: &'static str,
        id: String,
        detail: String,
    },

    #[error("key parameters rejected by local policy: {0}")]
    PolicyRejection(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("unsupported repository version: {0}")]
    UnsupportedVersion(u32),

    #[error("repository is locked by another process ({0})")]
    Locked(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid pattern: {0}")]
    Pattern(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("keep-tags {tags:?} matched no snapshot in group '{group}', refusing to remove all")]
    RetentionWouldEmptyGroup { group: String, tags: Vec<String> },

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("{files} files could not be read")]
    PartialBackup { files: u64 },

    #[error("{0}")]
    Other(String),
}

impl DavitError {
    /// Returns `true` for per-file I/O conditions the backup pipeline records
    /// on the node and continues past (permission denied, vanished file).
    pub fn is_soft_file_error(&self) -> bool {
        match self {
            DavitError::Io(e) => io_error_is_soft(e),
            _ => false,
        }
    }

    /// Exit code for the conventional process-level mapping.
    pub fn exit_code(&self) -> i32 {
        match self {
            DavitError::PartialBackup { .. } => 3,
            DavitError::RepoNotFound(_) => 10,
            DavitError::Locked(_) => 11,
            DavitError::WrongPassphrase => 12,
            _ => 1,
        }
    }
}

/// Soft I/O conditions: safe to skip a single file and keep going.
pub fn io_error_is_soft(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
    )
}

/// Fatal I/O conditions that must abort the whole pipeline (e.g. disk full).
pub fn io_error_is_fatal(e: &std::io::Error) -> bool {
    // ENOSPC has no stable ErrorKind on all toolchains; match the raw errno.
    #[cfg(unix)]
    {
        if e.raw_os_error() == Some(libc::ENOSPC) {
            return true;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = e;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(DavitError::WrongPassphrase.exit_code(), 12);
        assert_eq!(DavitError::Locked("host".into()).exit_code(), 11);
        assert_eq!(DavitError::RepoNotFound("/r".into()).exit_code(), 10);
        assert_eq!(DavitError::PartialBackup { files: 2 }.exit_code(), 3);
        assert_eq!(DavitError::MacMismatch.exit_code(), 1);
    }

    #[test]
    fn soft_errors() {
        let perm = DavitError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(perm.is_soft_file_error());
        assert!(!DavitError::Cancelled.is_soft_file_error());
    }
}
