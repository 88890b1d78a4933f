use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::id::Id;

/// Default in-memory cache weight.
pub const DEFAULT_CACHE_BYTES: usize = 32 * 1024 * 1024;

/// FIFO blob cache bounded by total weight in bytes, optionally spilling to a
/// local on-disk directory. Holds decrypted, decompressed plaintext; the
/// repository re-verifies the content address on every hit before using it.
pub struct BlobCache {
    entries: HashMap<Id, Vec<u8>>,
    order: VecDeque<Id>,
    current_bytes: usize,
    max_bytes: usize,
    disk: Option<PathBuf>,
}

impl BlobCache {
    pub fn new(max_bytes: usize, disk: Option<PathBuf>) -> Self {
        if let Some(dir) = &disk {
            let _ = fs::create_dir_all(dir.join("blobs"));
        }
        BlobCache {
            entries: HashMap::new(),
            order: VecDeque::new(),
            current_bytes: 0,
            max_bytes,
            disk,
        }
    }

    pub fn get(&self, id: &Id) -> Option<Vec<u8>> {
        if let Some(data) = self.entries.get(id) {
            return Some(data.clone());
        }
        let dir = self.disk.as_ref()?;
        fs::read(disk_path(dir, id)).ok()
    }

    pub fn insert(&mut self, id: Id, data: Vec<u8>) {
        if let Some(dir) = &self.disk {
            // Best-effort spill; a failed write only costs a future re-read.
            let path = disk_path(dir, &id);
            if !path.exists() {
                if let Some(parent) = path.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if let Err(e) = fs::write(&path, &data) {
                    debug!(id = %id, "disk cache write failed: {e}");
                }
            }
        }

        let len = data.len();
        if len > self.max_bytes {
            return;
        }
        if self.entries.contains_key(&id) {
            return;
        }
        while self.current_bytes + len > self.max_bytes {
            match self.order.pop_front() {
                Some(evicted) => {
                    if let Some(old) = self.entries.remove(&evicted) {
                        self.current_bytes -= old.len();
                    }
                }
                None => break,
            }
        }
        self.current_bytes += len;
        self.entries.insert(id, data);
        self.order.push_back(id);
    }

    /// Drop a (corrupt) entry from both layers.
    pub fn evict(&mut self, id: &Id) {
        if let Some(old) = self.entries.remove(id) {
            self.current_bytes -= old.len();
            self.order.retain(|x| x != id);
        }
        if let Some(dir) = &self.disk {
            let _ = fs::remove_file(disk_path(dir, id));
        }
    }
}

fn disk_path(dir: &std::path::Path, id: &Id) -> PathBuf {
    dir.join("blobs").join(id.shard_prefix()).join(id.to_hex())
}
