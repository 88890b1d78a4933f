use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::backend::FileKind;
use crate::error::Result;
use crate::id::Id;
use crate::repo::Repository;
use crate::retention::{apply_policy, PolicyDecision, RetentionPolicy};
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, Default)]
pub struct ForgetOptions {
    /// Evaluate the policy and report, but delete nothing.
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct ForgetResult {
    pub kept: Vec<Id>,
    pub removed: Vec<Id>,
    /// Per-group decisions, keyed by the (hostname, path set) group.
    pub decisions: BTreeMap<String, Vec<PolicyDecision>>,
}

/// Apply a retention policy per (hostname, path set) group and remove the
/// snapshot objects that fall out. Data reclamation happens in a subsequent
/// prune. All groups are evaluated before anything is deleted, so a policy
/// rejected for one group (e.g. keep-tags matching nothing) removes nothing.
pub fn forget(
    repo: &Repository,
    policy: &RetentionPolicy,
    options: &ForgetOptions,
) -> Result<ForgetResult> {
    let lock = repo.lock_exclusive()?;
    let result = forget_locked(repo, policy, options);
    if let Err(e) = repo.unlock(lock) {
        warn!("failed to release forget lock: {e}");
    }
    result
}

fn forget_locked(
    repo: &Repository,
    policy: &RetentionPolicy,
    options: &ForgetOptions,
) -> Result<ForgetResult> {
    let mut groups: BTreeMap<String, Vec<(Id, Snapshot)>> = BTreeMap::new();
    for (id, snapshot) in Snapshot::list(repo)? {
        groups.entry(snapshot.group_key()).or_default().push((id, snapshot));
    }

    // Evaluate everything first; a policy error must not leave the
    // repository partially forgotten.
    let mut result = ForgetResult::default();
    for (group, snapshots) in &groups {
        let decisions = apply_policy(group, snapshots, policy)?;
        for decision in &decisions {
            if decision.keep {
                result.kept.push(decision.id);
            } else {
                result.removed.push(decision.id);
            }
        }
        result.decisions.insert(group.clone(), decisions);
    }

    if options.dry_run {
        info!(
            kept = result.kept.len(),
            would_remove = result.removed.len(),
            "forget dry run"
        );
        return Ok(result);
    }

    for id in &result.removed {
        repo.backend().remove(FileKind::Snapshot, &id.to_hex())?;
    }
    info!(
        kept = result.kept.len(),
        removed = result.removed.len(),
        "forget finished"
    );
    Ok(result)
}
