use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::backend::FileKind;
use crate::error::Result;
use crate::id::Id;
use crate::index::Index;
use crate::repo::Repository;
use crate::snapshot::Snapshot;
use crate::tree::{NodeKind, Tree};

#[derive(Debug, Clone, Copy)]
pub struct PruneOptions {
    /// A pack whose dead-byte share exceeds this fraction is repacked; a pack
    /// with no live blobs at all is removed outright.
    pub repack_threshold: f64,
}

impl Default for PruneOptions {
    fn default() -> Self {
        PruneOptions {
            repack_threshold: 0.3,
        }
    }
}

#[derive(Debug, Default)]
pub struct PruneStats {
    pub packs_kept: usize,
    pub packs_repacked: usize,
    pub packs_removed: usize,
    pub blobs_moved: usize,
    pub bytes_freed: u64,
}

/// Reclaim storage: compute the set of blobs reachable from the remaining
/// snapshots, repack packs whose dead ratio exceeds the threshold, drop fully
/// dead packs, and rewrite the index. Runs under an exclusive lock.
pub fn prune(repo: &Repository, options: &PruneOptions) -> Result<PruneStats> {
    let lock = repo.lock_exclusive()?;
    let result = prune_locked(repo, options);
    if let Err(e) = repo.unlock(lock) {
        warn!("failed to release prune lock: {e}");
    }
    result
}

fn prune_locked(repo: &Repository, options: &PruneOptions) -> Result<PruneStats> {
    repo.load_index()?;
    let live = live_blob_set(repo)?;
    debug!(live = live.len(), "computed live blob set");

    // Classify packs by their live/dead byte ratio.
    let mut keep_packs: Vec<Id> = Vec::new();
    let mut repack_packs: Vec<Id> = Vec::new();
    let mut remove_packs: Vec<Id> = Vec::new();
    {
        let index = repo.index();
        for pack in index.packs() {
            let mut live_bytes = 0u64;
            let mut dead_bytes = 0u64;
            for blob_id in unique_blobs(&index, pack) {
                let length = index
                    .lookup_all(&blob_id)
                    .into_iter()
                    .flatten()
                    .find(|e| e.pack == *pack)
                    .map(|e| e.length as u64)
                    .unwrap_or(0);
                if live.contains(&blob_id) {
                    live_bytes += length;
                } else {
                    dead_bytes += length;
                }
            }
            let total = live_bytes + dead_bytes;
            if live_bytes == 0 {
                remove_packs.push(*pack);
            } else if total > 0 && (dead_bytes as f64 / total as f64) > options.repack_threshold {
                repack_packs.push(*pack);
            } else {
                keep_packs.push(*pack);
            }
        }
    }
    info!(
        keep = keep_packs.len(),
        repack = repack_packs.len(),
        remove = remove_packs.len(),
        "classified packs"
    );

    // Move live blobs out of packs slated for repacking, unless a kept pack
    // already holds a copy.
    let keep_set: HashSet<Id> = keep_packs.iter().copied().collect();
    let mut moved: HashSet<Id> = HashSet::new();
    let mut stats = PruneStats {
        packs_kept: keep_packs.len(),
        packs_repacked: repack_packs.len(),
        packs_removed: remove_packs.len(),
        ..Default::default()
    };
    for pack in &repack_packs {
        let blobs: Vec<(Id, crate::pack::BlobKind)> = {
            let index = repo.index();
            unique_blobs(&index, pack)
                .into_iter()
                .filter(|id| live.contains(id) && !moved.contains(id))
                .filter(|id| {
                    // Already safe in a kept pack?
                    !index
                        .lookup_all(id)
                        .into_iter()
                        .flatten()
                        .any(|e| keep_set.contains(&e.pack))
                })
                .filter_map(|id| index.lookup(&id).map(|e| (id, e.kind)))
                .collect()
        };
        for (blob_id, kind) in blobs {
            let data = repo.load_blob(kind, &blob_id)?;
            repo.repack_blob(kind, &data)?;
            moved.insert(blob_id);
            stats.blobs_moved += 1;
        }
    }

    let new_packs = repo.flush()?;

    // Rewrite the index from scratch: kept packs plus the repack targets.
    let old_index_names: Vec<String> = repo
        .backend()
        .list(FileKind::Index)?
        .into_iter()
        .map(|(name, _)| name)
        .collect();

    let mut new_index = Index::new();
    {
        let index = repo.index();
        for pack in &keep_packs {
            for blob_id in unique_blobs(&index, pack) {
                if let Some(entry) = index
                    .lookup_all(&blob_id)
                    .into_iter()
                    .flatten()
                    .find(|e| e.pack == *pack)
                {
                    new_index.insert(blob_id, *entry);
                }
            }
        }
    }
    for (pack_id, blobs) in &new_packs {
        new_index.add_pack(*pack_id, blobs);
    }
    let all_packs: Vec<Id> = new_index.packs().copied().collect();
    repo.set_index(new_index);

    let new_index_id = if all_packs.is_empty() {
        None
    } else {
        Some(repo.save_index_for_packs(all_packs.iter())?)
    };
    for name in old_index_names {
        if Some(name.as_str()) == new_index_id.map(|id| id.to_hex()).as_deref() {
            continue;
        }
        if let Err(e) = repo.backend().remove(FileKind::Index, &name) {
            warn!(name, "failed to remove old index file: {e}");
        }
    }

    // Finally drop the dead and repacked packs.
    for pack in remove_packs.iter().chain(&repack_packs) {
        match repo.backend().stat(FileKind::Pack, &pack.to_hex()) {
            Ok(size) => stats.bytes_freed += size,
            Err(_) => {}
        }
        repo.backend().remove(FileKind::Pack, &pack.to_hex())?;
    }

    info!(
        moved = stats.blobs_moved,
        freed = stats.bytes_freed,
        "prune finished"
    );
    Ok(stats)
}

/// All blob ids reachable from any snapshot: tree blobs and file contents.
fn live_blob_set(repo: &Repository) -> Result<HashSet<Id>> {
    let mut live: HashSet<Id> = HashSet::new();
    for (_, snapshot) in Snapshot::list(repo)? {
        let mut stack = vec![snapshot.tree];
        while let Some(tree_id) = stack.pop() {
            if !live.insert(tree_id) {
                continue;
            }
            let tree = Tree::load(repo, &tree_id)?;
            for node in &tree.nodes {
                match node.kind {
                    NodeKind::Dir => {
                        if let Some(subtree) = node.subtree {
                            stack.push(subtree);
                        }
                    }
                    NodeKind::File => {
                        live.extend(node.content.iter().copied());
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(live)
}

/// Distinct blob ids recorded for one pack.
fn unique_blobs(index: &Index, pack: &Id) -> Vec<Id> {
    let mut seen = HashSet::new();
    index
        .blobs_of_pack(pack)
        .iter()
        .filter(|id| seen.insert(**id))
        .copied()
        .collect()
}
