pub mod local;

use std::fmt;

use crate::error::Result;

/// The six kinds of named objects a repository stores. Packs live under
/// `data/`, everything else under its own prefix; `config` is a single
/// fixed-name file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Config,
    Key,
    Lock,
    Snapshot,
    Index,
    Pack,
}

impl FileKind {
    pub fn dirname(self) -> &'static str {
        match self {
            FileKind::Config => "",
            FileKind::Key => "keys",
            FileKind::Lock => "locks",
            FileKind::Snapshot => "snapshots",
            FileKind::Index => "index",
            FileKind::Pack => "data",
        }
    }

    /// Overwriting an existing name must fail durably for these kinds.
    /// Lock objects may be rewritten (heartbeats); pack saves are idempotent
    /// because a pack's name is the hash of its contents.
    pub fn must_not_overwrite(self) -> bool {
        matches!(
            self,
            FileKind::Config | FileKind::Key | FileKind::Snapshot | FileKind::Index
        )
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileKind::Config => "config",
            FileKind::Key => "key",
            FileKind::Lock => "lock",
            FileKind::Snapshot => "snapshot",
            FileKind::Index => "index",
            FileKind::Pack => "pack",
        };
        write!(f, "{s}")
    }
}

/// Relative object path inside the store. Pack names are sharded by their
/// first two hex characters: `data/<xx>/<name>`.
pub fn object_path(kind: FileKind, name: &str) -> String {
    match kind {
        FileKind::Config => "config".to_string(),
        FileKind::Pack => format!("data/{}/{}", &name[..2.min(name.len())], name),
        other => format!("{}/{}", other.dirname(), name),
    }
}

/// Minimal object-store abstraction: named immutable byte blobs with ranged
/// reads. Implementations must be safe for concurrent use on distinct names
/// and must give `save` write-temp-then-rename atomicity.
pub trait BlobStore: Send + Sync {
    /// Store an object. Fails if the name exists and the kind forbids
    /// overwrite (see [`FileKind::must_not_overwrite`]).
    fn save(&self, kind: FileKind, name: &str, data: &[u8]) -> Result<()>;

    /// Read `length` bytes at `offset`; `length == 0` means to the end.
    /// A short read is an error, not a truncation.
    fn load(&self, kind: FileKind, name: &str, offset: u64, length: u32) -> Result<Vec<u8>>;

    /// Size of an object in bytes.
    fn stat(&self, kind: FileKind, name: &str) -> Result<u64>;

    /// All `(name, size)` pairs of a kind.
    fn list(&self, kind: FileKind) -> Result<Vec<(String, u64)>>;

    /// Remove an object. Removing a missing object is an error.
    fn remove(&self, kind: FileKind, name: &str) -> Result<()>;

    /// Whether an object exists (default: via `stat`).
    fn exists(&self, kind: FileKind, name: &str) -> Result<bool> {
        match self.stat(kind, name) {
            Ok(_) => Ok(true),
            Err(crate::error::DavitError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl<T: BlobStore + ?Sized> BlobStore for std::sync::Arc<T> {
    fn save(&self, kind: FileKind, name: &str, data: &[u8]) -> Result<()> {
        (**self).save(kind, name, data)
    }
    fn load(&self, kind: FileKind, name: &str, offset: u64, length: u32) -> Result<Vec<u8>> {
        (**self).load(kind, name, offset, length)
    }
    fn stat(&self, kind: FileKind, name: &str) -> Result<u64> {
        (**self).stat(kind, name)
    }
    fn list(&self, kind: FileKind) -> Result<Vec<(String, u64)>> {
        (**self).list(kind)
    }
    fn remove(&self, kind: FileKind, name: &str) -> Result<()> {
        (**self).remove(kind, name)
    }
    fn exists(&self, kind: FileKind, name: &str) -> Result<bool> {
        (**self).exists(kind, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_paths_are_sharded() {
        assert_eq!(
            object_path(FileKind::Pack, "ab01cd"),
            "data/ab/ab01cd".to_string()
        );
        assert_eq!(object_path(FileKind::Config, "config"), "config");
        assert_eq!(object_path(FileKind::Index, "0011"), "index/0011");
    }

    #[test]
    fn overwrite_rules() {
        assert!(FileKind::Config.must_not_overwrite());
        assert!(FileKind::Snapshot.must_not_overwrite());
        assert!(!FileKind::Lock.must_not_overwrite());
        assert!(!FileKind::Pack.must_not_overwrite());
    }
}
