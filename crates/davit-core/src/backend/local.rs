use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::debug;

use super::{object_path, BlobStore, FileKind};
use crate::error::{DavitError, Result};

/// Local-filesystem blob store. Objects are plain files under `root`; writes
/// go to a temp file in the target directory, are fsynced, then renamed into
/// place so readers never observe partial objects.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Open an existing repository directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.join("config").is_file() {
            return Err(DavitError::RepoNotFound(root.display().to_string()));
        }
        Ok(LocalBackend { root })
    }

    /// Create the directory skeleton for a new repository.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.join("config").exists() {
            return Err(DavitError::RepoAlreadyExists(root.display().to_string()));
        }
        for dir in ["keys", "locks", "snapshots", "index", "data"] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(LocalBackend { root })
    }

    fn full_path(&self, kind: FileKind, name: &str) -> PathBuf {
        self.root.join(object_path(kind, name))
    }

    fn not_found(kind: FileKind, name: &str) -> DavitError {
        DavitError::NotFound {
            kind: kind_str(kind),
            id: name.to_string(),
        }
    }
}

fn kind_str(kind: FileKind) -> &'static str {
    match kind {
        FileKind::Config => "config",
        FileKind::Key => "key",
        FileKind::Lock => "lock",
        FileKind::Snapshot => "snapshot",
        FileKind::Index => "index",
        FileKind::Pack => "pack",
    }
}

impl BlobStore for LocalBackend {
    fn save(&self, kind: FileKind, name: &str, data: &[u8]) -> Result<()> {
        let path = self.full_path(kind, name);
        if kind.must_not_overwrite() && path.exists() {
            return Err(DavitError::AlreadyExists(path.display().to_string()));
        }
        let parent = path
            .parent()
            .ok_or_else(|| DavitError::Other(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent)?;

        // Write-temp-then-rename in the same directory so the rename is atomic.
        let tmp = parent.join(format!(".tmp-{:016x}", rand::thread_rng().gen::<u64>()));
        let result = (|| -> Result<()> {
            let mut f = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result?;

        // Sync the directory entry so the rename survives a crash.
        #[cfg(unix)]
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }

        debug!(kind = %kind, name, bytes = data.len(), "saved object");
        Ok(())
    }

    fn load(&self, kind: FileKind, name: &str, offset: u64, length: u32) -> Result<Vec<u8>> {
        let path = self.full_path(kind, name);
        let mut f = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Self::not_found(kind, name))
            }
            Err(e) => return Err(e.into()),
        };

        if offset > 0 {
            f.seek(SeekFrom::Start(offset))?;
        }
        if length == 0 {
            let mut out = Vec::new();
            f.read_to_end(&mut out)?;
            return Ok(out);
        }

        let mut out = vec![0u8; length as usize];
        f.read_exact(&mut out).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                DavitError::Corrupt {
                    kind: kind_str(kind),
                    id: name.to_string(),
                    detail: format!("short read at offset {offset} (wanted {length} bytes)"),
                }
            } else {
                e.into()
            }
        })?;
        Ok(out)
    }

    fn stat(&self, kind: FileKind, name: &str) -> Result<u64> {
        match fs::metadata(self.full_path(kind, name)) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Self::not_found(kind, name))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, kind: FileKind) -> Result<Vec<(String, u64)>> {
        let mut out = Vec::new();
        if kind == FileKind::Config {
            if let Ok(m) = fs::metadata(self.root.join("config")) {
                out.push(("config".to_string(), m.len()));
            }
            return Ok(out);
        }

        let base = self.root.join(kind.dirname());
        if !base.is_dir() {
            return Ok(out);
        }
        if kind == FileKind::Pack {
            for shard in read_dir_sorted(&base)? {
                if shard.is_dir() {
                    collect_files(&shard, &mut out)?;
                }
            }
        } else {
            collect_files(&base, &mut out)?;
        }
        Ok(out)
    }

    fn remove(&self, kind: FileKind, name: &str) -> Result<()> {
        match fs::remove_file(self.full_path(kind, name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Self::not_found(kind, name))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    entries.sort();
    Ok(entries)
}

fn collect_files(dir: &Path, out: &mut Vec<(String, u64)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(".tmp-") {
            continue;
        }
        out.push((name, meta.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_list_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(tmp.path()).unwrap();

        backend.save(FileKind::Index, "aabb", b"index data").unwrap();
        assert_eq!(backend.load(FileKind::Index, "aabb", 0, 0).unwrap(), b"index data");
        assert_eq!(backend.load(FileKind::Index, "aabb", 6, 4).unwrap(), b"data");
        assert_eq!(backend.stat(FileKind::Index, "aabb").unwrap(), 10);

        let listed = backend.list(FileKind::Index).unwrap();
        assert_eq!(listed, vec![("aabb".to_string(), 10)]);

        backend.remove(FileKind::Index, "aabb").unwrap();
        assert!(matches!(
            backend.load(FileKind::Index, "aabb", 0, 0),
            Err(DavitError::NotFound { .. })
        ));
    }

    #[test]
    fn refuses_overwrite_for_immutable_kinds() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(tmp.path()).unwrap();

        backend.save(FileKind::Snapshot, "ff00", b"one").unwrap();
        assert!(matches!(
            backend.save(FileKind::Snapshot, "ff00", b"two"),
            Err(DavitError::AlreadyExists(_))
        ));

        // Lock objects may be rewritten (heartbeats).
        backend.save(FileKind::Lock, "ff00", b"one").unwrap();
        backend.save(FileKind::Lock, "ff00", b"two").unwrap();
        assert_eq!(backend.load(FileKind::Lock, "ff00", 0, 0).unwrap(), b"two");
    }

    #[test]
    fn packs_are_sharded_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(tmp.path()).unwrap();
        backend.save(FileKind::Pack, "ab01cd", b"pack bytes").unwrap();
        assert!(tmp.path().join("data/ab/ab01cd").is_file());
        assert_eq!(
            backend.list(FileKind::Pack).unwrap(),
            vec![("ab01cd".to_string(), 10)]
        );
    }

    #[test]
    fn short_range_read_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(tmp.path()).unwrap();
        backend.save(FileKind::Index, "aa", b"12345").unwrap();
        assert!(matches!(
            backend.load(FileKind::Index, "aa", 0, 10),
            Err(DavitError::Corrupt { .. })
        ));
    }

    #[test]
    fn open_missing_repo() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            LocalBackend::open(tmp.path().join("nope")),
            Err(DavitError::RepoNotFound(_))
        ));
    }
}
