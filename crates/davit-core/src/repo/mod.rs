pub mod cache;
pub mod lock;

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{BlobStore, FileKind};
use crate::chunker::polynomial::Pol;
use crate::compress;
use crate::config::RepoOptions;
use crate::crypto::{key as keyfile, Key};
use crate::error::{DavitError, Result};
use crate::id::Id;
use crate::index::{Index, IndexFile};
use crate::pack::{BlobKind, PackedBlob, Packer};

use self::cache::BlobCache;
use self::lock::Lock;

/// Newly created repositories use version 2 (zstd compression enabled).
pub const REPO_VERSION: u32 = 2;

/// Repository config plaintext, stored encrypted at the fixed name `config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: String,
    pub chunker_polynomial: String,
}

/// Result of a `save_blob` call.
#[derive(Debug, Clone, Copy)]
pub struct SavedBlob {
    pub id: Id,
    /// `false` when the blob was already present (dedup hit).
    pub new: bool,
    /// On-disk (encrypted, possibly compressed) size.
    pub stored_size: u32,
}

/// A handle to an opened repository: key, index, in-progress packs, cache.
/// All mutating entry points take `&self`; interior locks make the repository
/// shareable across pipeline workers.
pub struct Repository {
    backend: Arc<dyn BlobStore>,
    key: Key,
    key_id: Id,
    config: RepoConfig,
    pol: Pol,
    options: RepoOptions,
    index: RwLock<Index>,
    data_packer: Mutex<Option<Packer>>,
    tree_packer: Mutex<Option<Packer>>,
    /// Packs sealed and uploaded since the last flush, pending index write.
    finalized: Mutex<Vec<(Id, Vec<PackedBlob>)>>,
    blob_cache: Mutex<BlobCache>,
}

impl Repository {
    /// Create a new repository: fresh master key, random repository id and
    /// chunking polynomial, encrypted config.
    pub fn init(
        backend: Box<dyn BlobStore>,
        passphrase: &str,
        options: RepoOptions,
    ) -> Result<Repository> {
        let backend: Arc<dyn BlobStore> = Arc::from(backend);
        if backend.exists(FileKind::Config, "config")? {
            return Err(DavitError::RepoAlreadyExists("repository".into()));
        }
        options.chunker.validate()?;

        let (key_id, key) = keyfile::create(backend.as_ref(), passphrase, options.kdf, None)?;

        let mut repo_id = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut repo_id);
        let pol = Pol::random()?;
        let config = RepoConfig {
            version: REPO_VERSION,
            id: hex::encode(repo_id),
            chunker_polynomial: pol.to_hex(),
        };

        let config_plain = serde_json::to_vec(&config)?;
        let config_encrypted = key.encrypt(&config_plain)?;
        backend.save(FileKind::Config, "config", &config_encrypted)?;
        info!(repo = %&config.id[..8], "initialized repository");

        Ok(Self::assemble(backend, key, key_id, config, pol, options))
    }

    /// Open an existing repository with a passphrase.
    pub fn open(
        backend: Box<dyn BlobStore>,
        passphrase: &str,
        options: RepoOptions,
    ) -> Result<Repository> {
        let backend: Arc<dyn BlobStore> = Arc::from(backend);
        let (key_id, key) = keyfile::search(backend.as_ref(), passphrase)?;

        let config_encrypted = backend.load(FileKind::Config, "config", 0, 0)?;
        let config_plain = key.decrypt(&config_encrypted).map_err(|_| DavitError::Corrupt {
            kind: "config",
            id: "config".into(),
            detail: "MAC verification failed".into(),
        })?;
        let config: RepoConfig = serde_json::from_slice(&config_plain)?;

        if config.version != 1 && config.version != 2 {
            return Err(DavitError::UnsupportedVersion(config.version));
        }
        let pol = Pol::from_hex(&config.chunker_polynomial)?;
        options.chunker.validate()?;

        debug!(repo = %&config.id[..8], key = %key_id, "opened repository");
        Ok(Self::assemble(backend, key, key_id, config, pol, options))
    }

    fn assemble(
        backend: Arc<dyn BlobStore>,
        key: Key,
        key_id: Id,
        config: RepoConfig,
        pol: Pol,
        options: RepoOptions,
    ) -> Repository {
        let cache_dir = options.resolved_cache_dir(&config.id);
        Repository {
            backend,
            key,
            key_id,
            config,
            pol,
            options,
            index: RwLock::new(Index::new()),
            data_packer: Mutex::new(None),
            tree_packer: Mutex::new(None),
            finalized: Mutex::new(Vec::new()),
            blob_cache: Mutex::new(BlobCache::new(cache::DEFAULT_CACHE_BYTES, cache_dir)),
        }
    }

    // ----- accessors -----

    pub fn backend(&self) -> &dyn BlobStore {
        self.backend.as_ref()
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn key_id(&self) -> Id {
        self.key_id
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn options(&self) -> &RepoOptions {
        &self.options
    }

    pub fn polynomial(&self) -> Pol {
        self.pol
    }

    pub fn index(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap()
    }

    pub fn has_blob(&self, id: &Id) -> bool {
        self.index.read().unwrap().has(id)
    }

    /// Replace the in-memory index (rebuild-index, prune).
    pub fn set_index(&self, index: Index) {
        *self.index.write().unwrap() = index;
    }

    // ----- locks -----

    pub fn lock_shared(&self) -> Result<Lock> {
        Lock::acquire(self.backend.as_ref(), &self.key, false)
    }

    pub fn lock_exclusive(&self) -> Result<Lock> {
        Lock::acquire(self.backend.as_ref(), &self.key, true)
    }

    pub fn unlock(&self, lock: Lock) -> Result<()> {
        lock.release(self.backend.as_ref())
    }

    // ----- index persistence -----

    /// Stream all index files from the store, merging into memory.
    /// Duplicate entries (same blob in several packs) are kept. Entries for
    /// packs sealed by this process but not yet covered by an index file are
    /// preserved, so concurrent writers never lose in-session state.
    pub fn load_index(&self) -> Result<()> {
        let mut merged = Index::new();
        for (name, _size) in self.backend.list(FileKind::Index)? {
            let file = self.load_index_file(&name)?;
            file.apply_to(&mut merged);
        }
        debug!(blobs = merged.len(), packs = merged.pack_count(), "loaded index");
        let mut index = self.index.write().unwrap();
        let in_session = std::mem::take(&mut *index);
        merged.merge(in_session);
        *index = merged;
        Ok(())
    }

    pub fn load_index_file(&self, name: &str) -> Result<IndexFile> {
        let plaintext = self.load_unpacked(FileKind::Index, name)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Serialize and store an index file covering `packs`. Returns its id.
    pub fn save_index_for_packs<'a>(
        &self,
        packs: impl Iterator<Item = &'a Id>,
    ) -> Result<Id> {
        let file = {
            let index = self.index.read().unwrap();
            IndexFile::for_packs(&index, packs)
        };
        let plaintext = serde_json::to_vec(&file)?;
        self.save_unpacked(FileKind::Index, &plaintext)
    }

    // ----- packed blobs -----

    fn packer_slot(&self, kind: BlobKind) -> &Mutex<Option<Packer>> {
        match kind {
            BlobKind::Data => &self.data_packer,
            BlobKind::Tree => &self.tree_packer,
        }
    }

    /// Whether compression is in effect for this repository.
    fn compression_level(&self) -> Option<i32> {
        if self.config.version < 2 {
            return None;
        }
        self.options.compression.zstd_level()
    }

    /// Compress (per policy) and encrypt one blob's plaintext.
    fn prepare_blob(&self, data: &[u8]) -> Result<(Vec<u8>, Option<u32>)> {
        if let Some(level) = self.compression_level() {
            let compressed = compress::compress(data, level)?;
            if compressed.len() < data.len() {
                let encrypted = self.key.encrypt(&compressed)?;
                return Ok((encrypted, Some(data.len() as u32)));
            }
        }
        Ok((self.key.encrypt(data)?, None))
    }

    /// Store one blob, deduplicating by content address. The index lookup
    /// under the packer mutex is the serialization point: concurrent savers
    /// of identical bytes may both encrypt, but only one copy is kept.
    pub fn save_blob(&self, kind: BlobKind, data: &[u8]) -> Result<SavedBlob> {
        let id = Id::hash(data);

        if let Some(entry) = self.index.read().unwrap().lookup(&id) {
            return Ok(SavedBlob {
                id,
                new: false,
                stored_size: entry.length,
            });
        }

        let (encrypted, uncompressed_length) = self.prepare_blob(data)?;
        self.commit_blob(kind, id, encrypted, uncompressed_length)
    }

    /// Append an already-prepared blob under the packer lock, re-checking for
    /// a racing duplicate, and seal the pack once it exceeds the soft bound.
    fn commit_blob(
        &self,
        kind: BlobKind,
        id: Id,
        encrypted: Vec<u8>,
        uncompressed_length: Option<u32>,
    ) -> Result<SavedBlob> {
        let stored_size = encrypted.len() as u32;
        let mut slot = self.packer_slot(kind).lock().unwrap();

        if let Some(entry) = self.index.read().unwrap().lookup(&id) {
            return Ok(SavedBlob {
                id,
                new: false,
                stored_size: entry.length,
            });
        }
        let packer = slot.get_or_insert_with(Packer::new);
        if packer.contains(&id) {
            return Ok(SavedBlob {
                id,
                new: false,
                stored_size,
            });
        }

        packer.add(kind, id, &encrypted, uncompressed_length);
        if packer.size() >= self.options.pack_size as usize {
            let full = slot.take().expect("packer present");
            self.upload_pack(full)?;
        }

        Ok(SavedBlob {
            id,
            new: true,
            stored_size,
        })
    }

    /// Store a blob during repack, bypassing the index dedup check (the blob
    /// is in the index by definition; it is moving to a new pack).
    pub fn repack_blob(&self, kind: BlobKind, data: &[u8]) -> Result<SavedBlob> {
        let id = Id::hash(data);
        let (encrypted, uncompressed_length) = self.prepare_blob(data)?;
        let stored_size = encrypted.len() as u32;
        let mut slot = self.packer_slot(kind).lock().unwrap();
        let packer = slot.get_or_insert_with(Packer::new);
        if packer.contains(&id) {
            return Ok(SavedBlob {
                id,
                new: false,
                stored_size,
            });
        }
        packer.add(kind, id, &encrypted, uncompressed_length);
        if packer.size() >= self.options.pack_size as usize {
            let full = slot.take().expect("packer present");
            self.upload_pack(full)?;
        }
        Ok(SavedBlob {
            id,
            new: true,
            stored_size,
        })
    }

    fn upload_pack(&self, packer: Packer) -> Result<()> {
        let (pack_id, bytes, blobs) = packer.finalize(&self.key)?;
        let size = bytes.len();
        self.backend
            .save(FileKind::Pack, &pack_id.to_hex(), &bytes)?;
        debug!(pack = %pack_id, blobs = blobs.len(), bytes = size, "uploaded pack");

        self.index.write().unwrap().add_pack(pack_id, &blobs);
        self.finalized.lock().unwrap().push((pack_id, blobs));
        Ok(())
    }

    /// Seal and upload all open packs and write an index file enumerating the
    /// packs finalized since the last flush. A returned blob id is durable
    /// only after this completes. Idempotent.
    pub fn flush(&self) -> Result<Vec<(Id, Vec<PackedBlob>)>> {
        for kind in [BlobKind::Data, BlobKind::Tree] {
            let packer = self.packer_slot(kind).lock().unwrap().take();
            if let Some(packer) = packer {
                if !packer.is_empty() {
                    self.upload_pack(packer)?;
                }
            }
        }

        let finalized: Vec<(Id, Vec<PackedBlob>)> =
            std::mem::take(&mut *self.finalized.lock().unwrap());
        if finalized.is_empty() {
            return Ok(finalized);
        }

        let index_id = self.save_index_for_packs(finalized.iter().map(|(id, _)| id))?;
        debug!(index = %index_id, packs = finalized.len(), "wrote index file");
        Ok(finalized)
    }

    /// Read, decrypt and verify one packed blob.
    pub fn load_blob(&self, kind: BlobKind, id: &Id) -> Result<Vec<u8>> {
        // Take the cached bytes out before verifying, so the cache mutex is
        // not held while hashing (or re-taken on the eviction path).
        let cached = self.blob_cache.lock().unwrap().get(id);
        if let Some(data) = cached {
            if Id::hash(&data) == *id {
                return Ok(data);
            }
            warn!(blob = %id, "cache entry failed verification, evicting");
            self.blob_cache.lock().unwrap().evict(id);
        }

        let entry = {
            let index = self.index.read().unwrap();
            match index.lookup(id) {
                Some(e) if e.kind == kind => *e,
                Some(_) | None => {
                    return Err(DavitError::NotFound {
                        kind: "blob",
                        id: id.to_hex(),
                    })
                }
            }
        };

        let raw = crate::pack::read_blob(
            self.backend.as_ref(),
            &entry.pack,
            entry.offset,
            entry.length,
        )?;
        let decrypted = self.key.decrypt(&raw).map_err(|_| DavitError::Corrupt {
            kind: "blob",
            id: id.to_hex(),
            detail: format!("MAC verification failed (pack {})", entry.pack),
        })?;
        let plaintext = match entry.uncompressed_length {
            Some(unc) => compress::decompress(&decrypted, Some(unc as usize))?,
            None => decrypted,
        };

        if Id::hash(&plaintext) != *id {
            return Err(DavitError::Corrupt {
                kind: "blob",
                id: id.to_hex(),
                detail: format!("plaintext hash mismatch (pack {})", entry.pack),
            });
        }

        self.blob_cache.lock().unwrap().insert(*id, plaintext.clone());
        Ok(plaintext)
    }

    // ----- unpacked objects (config, snapshots, indexes, locks) -----

    /// Encrypt and store a top-level object, named by the SHA-256 of the
    /// stored (encrypted) bytes.
    pub fn save_unpacked(&self, kind: FileKind, plaintext: &[u8]) -> Result<Id> {
        let encrypted = self.key.encrypt(plaintext)?;
        let id = Id::hash(&encrypted);
        self.backend.save(kind, &id.to_hex(), &encrypted)?;
        Ok(id)
    }

    /// Load and decrypt a top-level object by name.
    pub fn load_unpacked(&self, kind: FileKind, name: &str) -> Result<Vec<u8>> {
        let encrypted = self.backend.load(kind, name, 0, 0)?;
        self.key.decrypt(&encrypted).map_err(|_| DavitError::Corrupt {
            kind: kind_label(kind),
            id: name.to_string(),
            detail: "MAC verification failed".into(),
        })
    }

    pub fn remove_unpacked(&self, kind: FileKind, id: &Id) -> Result<()> {
        self.backend.remove(kind, &id.to_hex())
    }
}

fn kind_label(kind: FileKind) -> &'static str {
    match kind {
        FileKind::Config => "config",
        FileKind::Key => "key",
        FileKind::Lock => "lock",
        FileKind::Snapshot => "snapshot",
        FileKind::Index => "index",
        FileKind::Pack => "pack",
    }
}
