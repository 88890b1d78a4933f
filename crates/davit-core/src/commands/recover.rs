use std::collections::HashSet;

use tracing::{info, warn};

use crate::error::Result;
use crate::id::Id;
use crate::pack::BlobKind;
use crate::repo::Repository;
use crate::snapshot::Snapshot;
use crate::tree::{Node, NodeKind, Tree};

/// Find root trees no snapshot references anymore (e.g. after a lost
/// snapshot object) and attach them to a new snapshot so their data becomes
/// reachable again. Returns `None` when there is nothing to recover.
pub fn recover(repo: &Repository) -> Result<Option<(Id, Snapshot)>> {
    let lock = repo.lock_shared()?;
    let result = recover_locked(repo);
    if let Err(e) = repo.unlock(lock) {
        warn!("failed to release recover lock: {e}");
    }
    result
}

fn recover_locked(repo: &Repository) -> Result<Option<(Id, Snapshot)>> {
    repo.load_index()?;

    let tree_ids: Vec<Id> = {
        let index = repo.index();
        index
            .iter()
            .filter(|(_, entry)| entry.kind == BlobKind::Tree)
            .map(|(id, _)| *id)
            .collect()
    };

    // A tree is a root candidate when no other tree points at it and no
    // snapshot already uses it.
    let mut referenced: HashSet<Id> = HashSet::new();
    for tree_id in &tree_ids {
        let tree = match Tree::load(repo, tree_id) {
            Ok(t) => t,
            Err(e) => {
                warn!(tree = %tree_id, "skipping unreadable tree: {e}");
                continue;
            }
        };
        for node in &tree.nodes {
            if let Some(subtree) = node.subtree {
                referenced.insert(subtree);
            }
        }
    }
    for (_, snapshot) in Snapshot::list(repo)? {
        referenced.insert(snapshot.tree);
    }

    let mut roots: Vec<Id> = tree_ids
        .into_iter()
        .filter(|id| !referenced.contains(id))
        .collect();
    roots.sort();
    if roots.is_empty() {
        info!("no orphaned root trees found");
        return Ok(None);
    }
    info!(roots = roots.len(), "attaching orphaned root trees");

    // One directory node per orphaned root, named by its tree id.
    let mut recovery_root = Tree::new();
    for root in &roots {
        let mut node = Node::placeholder(&root.to_hex(), NodeKind::Dir);
        node.mode = 0o755;
        node.subtree = Some(*root);
        recovery_root.insert(node)?;
    }
    let saved = recovery_root.save(repo)?;
    repo.flush()?;

    let mut snapshot = Snapshot::new(saved.id, vec!["/recover".to_string()]);
    snapshot.tags = Some(vec!["recovered".to_string()]);
    let snapshot_id = snapshot.save(repo)?;
    Ok(Some((snapshot_id, snapshot)))
}
