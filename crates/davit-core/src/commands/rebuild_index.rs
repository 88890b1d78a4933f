use tracing::{info, warn};

use crate::backend::FileKind;
use crate::error::Result;
use crate::id::Id;
use crate::index::Index;
use crate::pack;
use crate::repo::Repository;

#[derive(Debug, Default)]
pub struct RebuildIndexStats {
    pub packs_indexed: usize,
    pub packs_unreadable: usize,
    pub old_indexes_removed: usize,
}

/// Rebuild the index from scratch by reading every pack header, then remove
/// the obsolete index files. Runs under an exclusive lock.
pub fn rebuild_index(repo: &Repository) -> Result<RebuildIndexStats> {
    let lock = repo.lock_exclusive()?;
    let result = rebuild_locked(repo);
    if let Err(e) = repo.unlock(lock) {
        warn!("failed to release rebuild-index lock: {e}");
    }
    result
}

fn rebuild_locked(repo: &Repository) -> Result<RebuildIndexStats> {
    let mut stats = RebuildIndexStats::default();
    let old_names: Vec<String> = repo
        .backend()
        .list(FileKind::Index)?
        .into_iter()
        .map(|(name, _)| name)
        .collect();

    let mut index = Index::new();
    for (name, _size) in repo.backend().list(FileKind::Pack)? {
        let pack_id = match Id::from_hex(&name) {
            Ok(id) => id,
            Err(_) => {
                warn!(name, "skipping pack with malformed name");
                stats.packs_unreadable += 1;
                continue;
            }
        };
        match pack::list_blobs(repo.backend(), repo.key(), &pack_id) {
            Ok(blobs) => {
                index.add_pack(pack_id, &blobs);
                stats.packs_indexed += 1;
            }
            Err(e) => {
                // An unreadable header is reported but must not block
                // recovery of the remaining packs.
                warn!(pack = %pack_id, "cannot read pack header: {e}");
                stats.packs_unreadable += 1;
            }
        }
    }

    let packs: Vec<Id> = index.packs().copied().collect();
    repo.set_index(index);
    let new_id = if packs.is_empty() {
        None
    } else {
        Some(repo.save_index_for_packs(packs.iter())?)
    };

    for name in old_names {
        if Some(name.as_str()) == new_id.map(|id| id.to_hex()).as_deref() {
            continue;
        }
        match repo.backend().remove(FileKind::Index, &name) {
            Ok(()) => stats.old_indexes_removed += 1,
            Err(e) => warn!(name, "failed to remove old index file: {e}"),
        }
    }

    info!(
        packs = stats.packs_indexed,
        unreadable = stats.packs_unreadable,
        removed = stats.old_indexes_removed,
        "index rebuilt"
    );
    Ok(stats)
}
