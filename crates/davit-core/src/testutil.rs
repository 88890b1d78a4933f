use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backend::{object_path, BlobStore, FileKind};
use crate::chunker::ChunkerConfig;
use crate::config::RepoOptions;
use crate::crypto::kdf::KdfParams;
use crate::error::{DavitError, Result};
use crate::repo::Repository;

/// In-memory blob store for tests. Cloning shares the underlying map, so a
/// repository can be closed and reopened against the same state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }
}

impl BlobStore for MemoryBackend {
    fn save(&self, kind: FileKind, name: &str, data: &[u8]) -> Result<()> {
        let path = object_path(kind, name);
        let mut map = self.data.lock().unwrap();
        if kind.must_not_overwrite() && map.contains_key(&path) {
            return Err(DavitError::AlreadyExists(path));
        }
        map.insert(path, data.to_vec());
        Ok(())
    }

    fn load(&self, kind: FileKind, name: &str, offset: u64, length: u32) -> Result<Vec<u8>> {
        let map = self.data.lock().unwrap();
        let data = map
            .get(&object_path(kind, name))
            .ok_or(DavitError::NotFound {
                kind: "object",
                id: name.to_string(),
            })?;
        let start = offset as usize;
        if start > data.len() {
            return Err(DavitError::Corrupt {
                kind: "object",
                id: name.to_string(),
                detail: format!("offset {offset} past end ({})", data.len()),
            });
        }
        if length == 0 {
            return Ok(data[start..].to_vec());
        }
        let end = start + length as usize;
        if end > data.len() {
            return Err(DavitError::Corrupt {
                kind: "object",
                id: name.to_string(),
                detail: format!("short read at offset {offset} (wanted {length} bytes)"),
            });
        }
        Ok(data[start..end].to_vec())
    }

    fn stat(&self, kind: FileKind, name: &str) -> Result<u64> {
        let map = self.data.lock().unwrap();
        map.get(&object_path(kind, name))
            .map(|d| d.len() as u64)
            .ok_or(DavitError::NotFound {
                kind: "object",
                id: name.to_string(),
            })
    }

    fn list(&self, kind: FileKind) -> Result<Vec<(String, u64)>> {
        let map = self.data.lock().unwrap();
        let mut out = Vec::new();
        for (path, data) in map.iter() {
            let matches = match kind {
                FileKind::Config => path == "config",
                FileKind::Pack => path.starts_with("data/"),
                other => path.starts_with(&format!("{}/", other.dirname())),
            };
            if matches {
                let name = path.rsplit('/').next().unwrap_or(path).to_string();
                out.push((name, data.len() as u64));
            }
        }
        out.sort();
        Ok(out)
    }

    fn remove(&self, kind: FileKind, name: &str) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.remove(&object_path(kind, name))
            .map(|_| ())
            .ok_or(DavitError::NotFound {
                kind: "object",
                id: name.to_string(),
            })
    }
}

pub fn shared_memory_backend() -> MemoryBackend {
    MemoryBackend::new()
}

/// Options tuned for tests: cheap KDF, small chunks, no on-disk cache.
pub fn test_options() -> RepoOptions {
    RepoOptions {
        kdf: KdfParams { n: 1024, r: 8, p: 1 },
        chunker: ChunkerConfig {
            min_size: 1024,
            avg_size: 4096,
            max_size: 32 * 1024,
        },
        no_cache: true,
        ..Default::default()
    }
}

/// A fresh in-memory repository with passphrase "test".
pub fn test_repo() -> Repository {
    Repository::init(Box::new(MemoryBackend::new()), "test", test_options())
        .expect("failed to init test repo")
}

/// Deterministic pseudo-random bytes (xorshift64).
pub fn gen_bytes(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}
