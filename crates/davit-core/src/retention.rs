use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::error::{DavitError, Result};
use crate::id::Id;
use crate::snapshot::Snapshot;

/// Retention rules applied per snapshot group by `forget`.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    pub keep_last: Option<usize>,
    pub keep_hourly: Option<usize>,
    pub keep_daily: Option<usize>,
    pub keep_weekly: Option<usize>,
    pub keep_monthly: Option<usize>,
    pub keep_yearly: Option<usize>,
    /// Keep every snapshot carrying at least one of these tags.
    pub keep_tags: Vec<String>,
}

impl RetentionPolicy {
    pub fn is_empty(&self) -> bool {
        self.keep_last.is_none()
            && self.keep_hourly.is_none()
            && self.keep_daily.is_none()
            && self.keep_weekly.is_none()
            && self.keep_monthly.is_none()
            && self.keep_yearly.is_none()
            && self.keep_tags.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub id: Id,
    pub keep: bool,
    pub reasons: Vec<String>,
}

/// Keep the newest snapshot in each time bucket, for up to `max_buckets`
/// distinct buckets. Snapshots already kept by another rule still consume
/// their bucket.
fn apply_bucket_rule<K: Eq + std::hash::Hash>(
    order: &[usize],
    times: &[DateTime<Utc>],
    kept: &mut HashSet<usize>,
    reasons: &mut HashMap<usize, Vec<String>>,
    max_buckets: usize,
    key_fn: impl Fn(&DateTime<Utc>) -> K,
    rule: &str,
) {
    let mut seen: HashSet<K> = HashSet::new();
    let mut used = 0usize;
    for &idx in order {
        if used >= max_buckets {
            break;
        }
        let bucket = key_fn(&times[idx]);
        if !seen.insert(bucket) {
            continue;
        }
        kept.insert(idx);
        reasons
            .entry(idx)
            .or_default()
            .push(format!("{rule} #{}", used + 1));
        used += 1;
    }
}

/// Evaluate the policy over one group of snapshots. Returns one decision per
/// snapshot. Fails when `keep_tags` names tags matching nothing in the group,
/// because applying such a policy would silently empty the group.
pub fn apply_policy(
    group: &str,
    snapshots: &[(Id, Snapshot)],
    policy: &RetentionPolicy,
) -> Result<Vec<PolicyDecision>> {
    if policy.is_empty() {
        return Err(DavitError::Config(
            "refusing to forget: retention policy keeps nothing".into(),
        ));
    }

    if !policy.keep_tags.is_empty() {
        let any_match = snapshots
            .iter()
            .any(|(_, sn)| policy.keep_tags.iter().any(|t| sn.has_tag(t)));
        if !any_match {
            return Err(DavitError::RetentionWouldEmptyGroup {
                group: group.to_string(),
                tags: policy.keep_tags.clone(),
            });
        }
    }

    // Newest first.
    let mut order: Vec<usize> = (0..snapshots.len()).collect();
    order.sort_by(|&a, &b| snapshots[b].1.time.cmp(&snapshots[a].1.time));
    let times: Vec<DateTime<Utc>> = snapshots.iter().map(|(_, sn)| sn.time).collect();

    let mut kept: HashSet<usize> = HashSet::new();
    let mut reasons: HashMap<usize, Vec<String>> = HashMap::new();

    for (idx, (_, sn)) in snapshots.iter().enumerate() {
        for tag in &policy.keep_tags {
            if sn.has_tag(tag) {
                kept.insert(idx);
                reasons.entry(idx).or_default().push(format!("tag {tag}"));
            }
        }
    }

    if let Some(n) = policy.keep_last {
        for (rank, &idx) in order.iter().take(n).enumerate() {
            kept.insert(idx);
            reasons
                .entry(idx)
                .or_default()
                .push(format!("last #{}", rank + 1));
        }
    }
    if let Some(n) = policy.keep_hourly {
        apply_bucket_rule(&order, &times, &mut kept, &mut reasons, n, |t| {
            (t.year(), t.ordinal(), t.hour())
        }, "hourly");
    }
    if let Some(n) = policy.keep_daily {
        apply_bucket_rule(&order, &times, &mut kept, &mut reasons, n, |t| {
            (t.year(), t.ordinal())
        }, "daily");
    }
    if let Some(n) = policy.keep_weekly {
        apply_bucket_rule(&order, &times, &mut kept, &mut reasons, n, |t| {
            let week = t.iso_week();
            (week.year(), week.week())
        }, "weekly");
    }
    if let Some(n) = policy.keep_monthly {
        apply_bucket_rule(&order, &times, &mut kept, &mut reasons, n, |t| {
            (t.year(), t.month())
        }, "monthly");
    }
    if let Some(n) = policy.keep_yearly {
        apply_bucket_rule(&order, &times, &mut kept, &mut reasons, n, |t| t.year(), "yearly");
    }

    Ok(snapshots
        .iter()
        .enumerate()
        .map(|(idx, (id, _))| PolicyDecision {
            id: *id,
            keep: kept.contains(&idx),
            reasons: reasons.remove(&idx).unwrap_or_default(),
        })
        .collect())
}
