use std::collections::HashSet;

use tracing::debug;

use crate::backend::FileKind;
use crate::compress;
use crate::error::Result;
use crate::id::Id;
use crate::pack::parse_header;
use crate::repo::Repository;
use crate::snapshot::Snapshot;
use crate::tree::{NodeKind, Tree};

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOptions {
    /// Also decrypt and re-hash every blob (pack file hashes and headers are
    /// always verified; this adds the per-blob plaintext verification).
    pub read_data: bool,
}

#[derive(Debug)]
pub struct CheckError {
    pub context: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct CheckResult {
    pub packs_checked: usize,
    pub blobs_checked: usize,
    pub snapshots_checked: usize,
    pub duplicate_blobs: usize,
    pub errors: Vec<CheckError>,
}

impl CheckResult {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Verify repository integrity: pack hashes and headers, blob plaintext
/// addresses, index consistency (orphans, duplicates, missing packs), and the
/// reachability of every blob referenced from snapshots.
pub fn check(repo: &Repository, options: &CheckOptions) -> Result<CheckResult> {
    let lock = repo.lock_shared()?;
    let result = check_locked(repo, options);
    if let Err(e) = repo.unlock(lock) {
        tracing::warn!("failed to release check lock: {e}");
    }
    result
}

fn check_locked(repo: &Repository, options: &CheckOptions) -> Result<CheckResult> {
    repo.load_index()?;
    let mut errors: Vec<CheckError> = Vec::new();
    let mut packs_checked = 0usize;
    let mut snapshots_checked = 0usize;

    // Pass 1: every pack on storage. The pack id covers the whole file, so a
    // single flipped bit anywhere fails this hash.
    let listed = repo.backend().list(FileKind::Pack)?;
    let mut on_storage: HashSet<Id> = HashSet::new();
    for (name, _size) in &listed {
        let pack_id = match Id::from_hex(name) {
            Ok(id) => id,
            Err(_) => {
                errors.push(CheckError {
                    context: "storage".into(),
                    message: format!("pack with malformed name '{name}'"),
                });
                continue;
            }
        };
        on_storage.insert(pack_id);
        check_one_pack(repo, pack_id, options, &mut errors)?;
        packs_checked += 1;
    }

    // Index entries referencing packs that are gone, and duplicate entries.
    let (blobs_checked, duplicate_blobs) = {
        let index = repo.index();
        for pack in index.packs() {
            if !on_storage.contains(pack) {
                errors.push(CheckError {
                    context: "index".into(),
                    message: format!("pack {pack} referenced by index but missing from storage"),
                });
            }
        }
        (index.len(), index.duplicates().count())
    };

    // Pass 2: snapshot graph reachability.
    let mut visited_trees: HashSet<Id> = HashSet::new();
    for (snapshot_id, snapshot) in Snapshot::list(repo)? {
        check_snapshot_graph(repo, snapshot_id, &snapshot, &mut visited_trees, &mut errors)?;
        snapshots_checked += 1;
    }

    debug!(
        packs = packs_checked,
        snapshots = snapshots_checked,
        errors = errors.len(),
        "check finished"
    );
    Ok(CheckResult {
        packs_checked,
        blobs_checked,
        snapshots_checked,
        duplicate_blobs,
        errors,
    })
}

fn check_one_pack(
    repo: &Repository,
    pack_id: Id,
    options: &CheckOptions,
    errors: &mut Vec<CheckError>,
) -> Result<()> {
    let context = format!("pack {pack_id}");
    let mut fail = |message: String| {
        errors.push(CheckError {
            context: context.clone(),
            message,
        })
    };

    let bytes = repo
        .backend()
        .load(FileKind::Pack, &pack_id.to_hex(), 0, 0)?;

    if Id::hash(&bytes) != pack_id {
        fail("file hash does not match pack id".into());
        return Ok(());
    }

    if bytes.len() < 4 + crate::crypto::EXTENSION {
        fail("pack too small for a header".into());
        return Ok(());
    }
    let header_len =
        u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().expect("4 bytes")) as usize;
    if header_len + 4 > bytes.len() {
        fail(format!("header length {header_len} exceeds pack size"));
        return Ok(());
    }
    let header_start = bytes.len() - 4 - header_len;
    let header = match repo.key().decrypt(&bytes[header_start..bytes.len() - 4]) {
        Ok(h) => h,
        Err(e) => {
            fail(format!("header decryption failed: {e}"));
            return Ok(());
        }
    };
    let entries = match parse_header(&pack_id, &header) {
        Ok(e) => e,
        Err(e) => {
            fail(format!("header parse failed: {e}"));
            return Ok(());
        }
    };

    for entry in &entries {
        let indexed_here = {
            let index = repo.index();
            index
                .lookup_all(&entry.id)
                .map(|all| all.iter().any(|e| e.pack == pack_id))
                .unwrap_or(false)
        };
        if !indexed_here {
            fail(format!(
                "orphan blob {} not covered by any index",
                entry.id
            ));
        }

        if !options.read_data {
            continue;
        }
        let end = entry.offset as usize + entry.length as usize;
        if end > header_start {
            fail(format!("blob {} extends past blob area", entry.id));
            continue;
        }
        let raw = &bytes[entry.offset as usize..end];
        let decrypted = match repo.key().decrypt(raw) {
            Ok(d) => d,
            Err(e) => {
                fail(format!("blob {} decryption failed: {e}", entry.id));
                continue;
            }
        };
        let plaintext = match entry.uncompressed_length {
            Some(unc) => match compress::decompress(&decrypted, Some(unc as usize)) {
                Ok(p) => p,
                Err(e) => {
                    fail(format!("blob {} decompression failed: {e}", entry.id));
                    continue;
                }
            },
            None => decrypted,
        };
        if Id::hash(&plaintext) != entry.id {
            fail(format!("blob {} plaintext hash mismatch", entry.id));
        }
    }
    Ok(())
}

/// Walk a snapshot's tree graph and verify every referenced blob is indexed.
fn check_snapshot_graph(
    repo: &Repository,
    snapshot_id: Id,
    snapshot: &Snapshot,
    visited: &mut HashSet<Id>,
    errors: &mut Vec<CheckError>,
) -> Result<()> {
    let context = format!("snapshot {snapshot_id}");
    let mut stack = vec![snapshot.tree];
    while let Some(tree_id) = stack.pop() {
        if !visited.insert(tree_id) {
            continue;
        }
        if !repo.has_blob(&tree_id) {
            errors.push(CheckError {
                context: context.clone(),
                message: format!("tree {tree_id} missing from index"),
            });
            continue;
        }
        let tree = match Tree::load(repo, &tree_id) {
            Ok(t) => t,
            Err(e) => {
                errors.push(CheckError {
                    context: context.clone(),
                    message: format!("tree {tree_id} unreadable: {e}"),
                });
                continue;
            }
        };
        for node in &tree.nodes {
            match node.kind {
                NodeKind::Dir => {
                    if let Some(subtree) = node.subtree {
                        stack.push(subtree);
                    }
                }
                NodeKind::File => {
                    for blob in &node.content {
                        if !repo.has_blob(blob) {
                            errors.push(CheckError {
                                context: context.clone(),
                                message: format!(
                                    "data blob {blob} of '{}' missing from index",
                                    node.name
                                ),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}
