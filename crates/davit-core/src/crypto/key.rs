use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::kdf::{self, KdfParams, SALT_LEN};
use super::Key;
use crate::backend::{BlobStore, FileKind};
use crate::error::{DavitError, Result};
use crate::id::Id;
use crate::platform;

/// Upper bound on key records tried during open, so a vandalized `keys/`
/// directory cannot turn a wrong passphrase into an unbounded scrypt loop.
const MAX_KEYS_TRIED: usize = 20;

/// On-disk wrapped master key, stored at `keys/<hex-id>` where the id is the
/// SHA-256 of the file bytes. A repository may hold several of these (one per
/// passphrase), all wrapping the same master key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub hostname: String,
    pub username: String,
    pub kdf: String,
    #[serde(flatten)]
    pub params: KdfParams,
    pub created: DateTime<Utc>,
    #[serde(with = "crate::serde_util::base64_vec")]
    pub data: Vec<u8>,
    #[serde(with = "crate::serde_util::base64_vec")]
    pub salt: Vec<u8>,
}

/// Wrap `master` (or a freshly generated key) under `passphrase` and store
/// the record. Returns the record's id and the master key.
pub fn create(
    backend: &dyn BlobStore,
    passphrase: &str,
    params: KdfParams,
    master: Option<&Key>,
) -> Result<(Id, Key)> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let wrapping = kdf::derive(passphrase, &salt, &params)?;
    let master = match master {
        Some(k) => k.clone(),
        None => Key::generate(),
    };

    let plaintext = Zeroizing::new(serde_json::to_vec(&master)?);
    let data = wrapping.encrypt(&plaintext)?;

    let record = KeyFile {
        hostname: platform::hostname(),
        username: platform::username(),
        kdf: "scrypt".to_string(),
        params,
        created: Utc::now(),
        data,
        salt,
    };

    let bytes = serde_json::to_vec(&record)?;
    let id = Id::hash(&bytes);
    backend.save(FileKind::Key, &id.to_hex(), &bytes)?;
    debug!(key = %id, "stored wrapped master key");
    Ok((id, master))
}

/// Try to unwrap one key record with the given passphrase.
fn open_record(record: &KeyFile, passphrase: &str) -> Result<Key> {
    if record.kdf != "scrypt" {
        return Err(DavitError::UnsupportedFormat(format!(
            "unknown kdf '{}' in key record",
            record.kdf
        )));
    }
    let wrapping = kdf::derive(passphrase, &record.salt, &record.params)?;
    let plaintext = Zeroizing::new(
        wrapping
            .decrypt(&record.data)
            .map_err(|_| DavitError::WrongPassphrase)?,
    );
    let master: Key = serde_json::from_slice(&plaintext).map_err(|_| DavitError::WrongPassphrase)?;
    Ok(master)
}

/// Search all key records for one that the passphrase unwraps.
pub fn search(backend: &dyn BlobStore, passphrase: &str) -> Result<(Id, Key)> {
    let names = backend.list(FileKind::Key)?;
    if names.is_empty() {
        return Err(DavitError::NotFound {
            kind: "key",
            id: "*".into(),
        });
    }

    let mut deferred: Option<DavitError> = None;
    for (name, _size) in names.into_iter().take(MAX_KEYS_TRIED) {
        let id = match Id::from_hex(&name) {
            Ok(id) => id,
            Err(_) => {
                warn!(name, "ignoring key record with malformed name");
                continue;
            }
        };
        let bytes = backend.load(FileKind::Key, &name, 0, 0)?;
        let record: KeyFile = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!(key = %id, "ignoring unparseable key record: {e}");
                continue;
            }
        };
        match open_record(&record, passphrase) {
            Ok(master) => {
                debug!(key = %id, "opened repository key");
                return Ok((id, master));
            }
            Err(e @ DavitError::UnsupportedFormat(_)) | Err(e @ DavitError::PolicyRejection(_)) => {
                // Remember the most specific failure in case no key opens.
                deferred.get_or_insert(e);
            }
            Err(_) => {}
        }
    }

    Err(deferred.unwrap_or(DavitError::WrongPassphrase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryBackend;

    fn fast_params() -> KdfParams {
        KdfParams { n: 1024, r: 8, p: 1 }
    }

    #[test]
    fn create_and_search() {
        let backend = MemoryBackend::new();
        let (id, master) = create(&backend, "correct horse", fast_params(), None).unwrap();

        let (found_id, found) = search(&backend, "correct horse").unwrap();
        assert_eq!(found_id, id);
        assert_eq!(found.encrypt, master.encrypt);
        assert_eq!(found.mac.k, master.mac.k);
    }

    #[test]
    fn wrong_passphrase() {
        let backend = MemoryBackend::new();
        create(&backend, "correct horse", fast_params(), None).unwrap();
        assert!(matches!(
            search(&backend, "battery staple"),
            Err(DavitError::WrongPassphrase)
        ));
    }

    #[test]
    fn second_passphrase_wraps_same_master() {
        let backend = MemoryBackend::new();
        let (_, master) = create(&backend, "first", fast_params(), None).unwrap();
        create(&backend, "second", fast_params(), Some(&master)).unwrap();

        let (_, via_second) = search(&backend, "second").unwrap();
        assert_eq!(via_second.encrypt, master.encrypt);
    }

    #[test]
    fn unknown_kdf_is_unsupported() {
        let backend = MemoryBackend::new();
        let (id, _) = create(&backend, "pass", fast_params(), None).unwrap();

        // Rewrite the record with an unknown kdf name.
        let bytes = backend.load(FileKind::Key, &id.to_hex(), 0, 0).unwrap();
        let mut record: KeyFile = serde_json::from_slice(&bytes).unwrap();
        record.kdf = "argon2id".to_string();
        let bytes = serde_json::to_vec(&record).unwrap();
        backend.remove(FileKind::Key, &id.to_hex()).unwrap();
        backend
            .save(FileKind::Key, &Id::hash(&bytes).to_hex(), &bytes)
            .unwrap();

        assert!(matches!(
            search(&backend, "pass"),
            Err(DavitError::UnsupportedFormat(_))
        ));
    }
}
