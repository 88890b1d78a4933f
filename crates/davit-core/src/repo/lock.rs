use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{BlobStore, FileKind};
use crate::crypto::Key;
use crate::error::{DavitError, Result};
use crate::id::Id;
use crate::platform;

/// Locks older than this are considered abandoned regardless of their pid.
const STALE_TIMEOUT_MINUTES: i64 = 30;

/// How often a long-running operation should rewrite its lock object.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

// Backoff: an increasing sequence with a per-try cap and a bounded number of
// attempts. The exact schedule is not part of the wire contract.
const RETRY_COUNT: u32 = 5;
const BACKOFF_INITIAL: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Lock object plaintext, stored encrypted at `locks/<hex-id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub time: DateTime<Utc>,
    pub exclusive: bool,
    pub hostname: String,
    pub username: String,
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl LockFile {
    fn new(exclusive: bool) -> Self {
        LockFile {
            time: Utc::now(),
            exclusive,
            hostname: platform::hostname(),
            username: platform::username(),
            pid: std::process::id(),
            uid: platform::euid(),
            gid: platform::egid(),
        }
    }

    /// A lock is stale when its heartbeat is old, or when it was taken by a
    /// process on this host that no longer exists.
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if now.signed_duration_since(self.time) > chrono::Duration::minutes(STALE_TIMEOUT_MINUTES) {
            return true;
        }
        if self.hostname == platform::hostname() && !platform::pid_alive(self.pid) {
            return true;
        }
        false
    }
}

/// Handle to a held repository lock. Release it with [`Lock::release`]; a
/// leaked lock goes stale after [`STALE_TIMEOUT`].
#[derive(Debug)]
pub struct Lock {
    id: Id,
    data: LockFile,
}

impl Lock {
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn exclusive(&self) -> bool {
        self.data.exclusive
    }

    /// Acquire a shared or exclusive lock, retrying with growing backoff on
    /// contention. Transient failures to read a competing lock also retry.
    pub fn acquire(backend: &dyn BlobStore, key: &Key, exclusive: bool) -> Result<Lock> {
        let mut backoff = BACKOFF_INITIAL;
        let mut last_err = None;
        for attempt in 0..RETRY_COUNT {
            match Self::try_acquire(backend, key, exclusive) {
                Ok(lock) => return Ok(lock),
                Err(e @ DavitError::Locked(_)) => {
                    debug!(attempt, "lock contention: {e}");
                    last_err = Some(e);
                }
                Err(e) => {
                    // Reading or writing lock objects can fail transiently;
                    // treat it like contention rather than aborting.
                    warn!(attempt, "lock check failed, retrying: {e}");
                    last_err = Some(e);
                }
            }
            if attempt + 1 < RETRY_COUNT {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
        Err(match last_err {
            Some(DavitError::Locked(holder)) => DavitError::Locked(holder),
            Some(e) => e,
            None => DavitError::Locked("unknown holder".into()),
        })
    }

    fn try_acquire(backend: &dyn BlobStore, key: &Key, exclusive: bool) -> Result<Lock> {
        let data = LockFile::new(exclusive);
        let id = write_lock(backend, key, &data)?;

        match check_conflicts(backend, key, id, &data) {
            Ok(()) => Ok(Lock { id, data }),
            Err(e) => {
                let _ = backend.remove(FileKind::Lock, &id.to_hex());
                Err(e)
            }
        }
    }

    /// Rewrite the lock object with a fresh timestamp (heartbeat).
    pub fn refresh(&mut self, backend: &dyn BlobStore, key: &Key) -> Result<()> {
        let old = self.id;
        let mut data = self.data.clone();
        data.time = Utc::now();
        let id = write_lock(backend, key, &data)?;
        self.id = id;
        self.data = data;
        let _ = backend.remove(FileKind::Lock, &old.to_hex());
        Ok(())
    }

    pub fn release(self, backend: &dyn BlobStore) -> Result<()> {
        backend.remove(FileKind::Lock, &self.id.to_hex())
    }
}

fn write_lock(backend: &dyn BlobStore, key: &Key, data: &LockFile) -> Result<Id> {
    let plaintext = serde_json::to_vec(data)?;
    let encrypted = key.encrypt(&plaintext)?;
    let id = Id::hash(&encrypted);
    backend.save(FileKind::Lock, &id.to_hex(), &encrypted)?;
    Ok(id)
}

/// Check all other lock objects for an incompatible, non-stale holder.
/// When two candidates race, the deterministic winner is the one with the
/// earlier (time, id) pair, so exactly one of them proceeds.
fn check_conflicts(
    backend: &dyn BlobStore,
    key: &Key,
    own_id: Id,
    own: &LockFile,
) -> Result<()> {
    let now = Utc::now();
    for (name, _size) in backend.list(FileKind::Lock)? {
        let other_id = match Id::from_hex(&name) {
            Ok(id) => id,
            Err(_) => continue,
        };
        if other_id == own_id {
            continue;
        }

        let bytes = backend.load(FileKind::Lock, &name, 0, 0)?;
        let plaintext = match key.decrypt(&bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(lock = %other_id, "ignoring undecryptable lock object: {e}");
                continue;
            }
        };
        let other: LockFile = match serde_json::from_slice(&plaintext) {
            Ok(l) => l,
            Err(e) => {
                warn!(lock = %other_id, "ignoring unparseable lock object: {e}");
                continue;
            }
        };

        if other.is_stale(now) {
            debug!(lock = %other_id, "removing stale lock");
            let _ = backend.remove(FileKind::Lock, &name);
            continue;
        }

        let incompatible = own.exclusive || other.exclusive;
        if !incompatible {
            continue;
        }

        // Deterministic tie-break so racing acquirers cannot both retreat.
        let own_key = (own.time, own_id);
        let other_key = (other.time, other_id);
        if own_key < other_key {
            continue;
        }
        return Err(DavitError::Locked(format!(
            "{}@{} pid {} since {}",
            other.username, other.hostname, other.pid, other.time
        )));
    }
    Ok(())
}

/// Remove every lock object (recovery after crashed processes).
pub fn break_all(backend: &dyn BlobStore) -> Result<usize> {
    let mut removed = 0;
    for (name, _size) in backend.list(FileKind::Lock)? {
        backend.remove(FileKind::Lock, &name)?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryBackend;

    fn test_key() -> Key {
        let mut material = [0u8; 64];
        for (i, b) in material.iter_mut().enumerate() {
            *b = (i * 3) as u8;
        }
        Key::from_derived(&material)
    }

    #[test]
    fn shared_locks_coexist() {
        let backend = MemoryBackend::new();
        let key = test_key();
        let a = Lock::acquire(&backend, &key, false).unwrap();
        let b = Lock::acquire(&backend, &key, false).unwrap();
        a.release(&backend).unwrap();
        b.release(&backend).unwrap();
        assert!(backend.list(FileKind::Lock).unwrap().is_empty());
    }

    #[test]
    fn exclusive_blocks_everything() {
        let backend = MemoryBackend::new();
        let key = test_key();
        let excl = Lock::acquire(&backend, &key, true).unwrap();

        assert!(matches!(
            Lock::try_acquire(&backend, &key, false),
            Err(DavitError::Locked(_))
        ));
        assert!(matches!(
            Lock::try_acquire(&backend, &key, true),
            Err(DavitError::Locked(_))
        ));

        excl.release(&backend).unwrap();
        Lock::acquire(&backend, &key, true)
            .unwrap()
            .release(&backend)
            .unwrap();
    }

    #[test]
    fn shared_blocks_exclusive() {
        let backend = MemoryBackend::new();
        let key = test_key();
        let shared = Lock::acquire(&backend, &key, false).unwrap();
        assert!(matches!(
            Lock::try_acquire(&backend, &key, true),
            Err(DavitError::Locked(_))
        ));
        shared.release(&backend).unwrap();
    }

    #[test]
    fn stale_lock_is_swept() {
        let backend = MemoryBackend::new();
        let key = test_key();

        // Plant a lock whose heartbeat is far in the past.
        let stale = LockFile {
            time: Utc::now() - chrono::Duration::hours(2),
            exclusive: true,
            hostname: "elsewhere".into(),
            username: "ghost".into(),
            pid: 1,
            uid: 0,
            gid: 0,
        };
        write_lock(&backend, &key, &stale).unwrap();

        let lock = Lock::try_acquire(&backend, &key, true).unwrap();
        lock.release(&backend).unwrap();
    }

    #[test]
    fn refresh_replaces_object() {
        let backend = MemoryBackend::new();
        let key = test_key();
        let mut lock = Lock::acquire(&backend, &key, false).unwrap();
        let before = lock.id();
        lock.refresh(&backend, &key).unwrap();
        assert_ne!(lock.id(), before);
        assert_eq!(backend.list(FileKind::Lock).unwrap().len(), 1);
        lock.release(&backend).unwrap();
    }
}
