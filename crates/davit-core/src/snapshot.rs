use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::FileKind;
use crate::error::{DavitError, Result};
use crate::id::Id;
use crate::platform;
use crate::repo::Repository;

pub fn program_version() -> String {
    format!("davit {}", env!("CARGO_PKG_VERSION"))
}

/// Tree-walk counters recorded on a finished snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub backup_start: Option<DateTime<Utc>>,
    pub backup_end: Option<DateTime<Utc>>,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unchanged: u64,
    pub dirs_new: u64,
    pub dirs_changed: u64,
    pub dirs_unchanged: u64,
    pub data_blobs: u64,
    pub tree_blobs: u64,
    /// Plaintext bytes newly added to the repository.
    pub data_added: u64,
    pub total_files_processed: u64,
    pub total_bytes_processed: u64,
}

/// One immutable backup: a root tree id plus context. Stored as a single
/// encrypted JSON object under `snapshots/`, named by the hash of the stored
/// bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Id>,
    pub tree: Id,
    pub paths: Vec<String>,
    pub hostname: String,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excludes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub program_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SnapshotSummary>,
}

impl Snapshot {
    pub fn new(tree: Id, paths: Vec<String>) -> Snapshot {
        Snapshot {
            time: Utc::now(),
            parent: None,
            tree,
            paths,
            hostname: platform::hostname(),
            username: platform::username(),
            uid: platform::euid(),
            gid: platform::egid(),
            excludes: None,
            tags: None,
            program_version: program_version(),
            summary: None,
        }
    }

    pub fn save(&self, repo: &Repository) -> Result<Id> {
        let json = serde_json::to_vec(self)?;
        repo.save_unpacked(FileKind::Snapshot, &json)
    }

    pub fn load(repo: &Repository, id: &Id) -> Result<Snapshot> {
        let plaintext = repo.load_unpacked(FileKind::Snapshot, &id.to_hex())?;
        serde_json::from_slice(&plaintext).map_err(|e| DavitError::Corrupt {
            kind: "snapshot",
            id: id.to_hex(),
            detail: format!("unparseable snapshot JSON: {e}"),
        })
    }

    /// All snapshots in the repository, newest first.
    pub fn list(repo: &Repository) -> Result<Vec<(Id, Snapshot)>> {
        let mut out = Vec::new();
        for (name, _size) in repo.backend().list(FileKind::Snapshot)? {
            let id = match Id::from_hex(&name) {
                Ok(id) => id,
                Err(_) => continue,
            };
            out.push((id, Snapshot::load(repo, &id)?));
        }
        out.sort_by(|a, b| b.1.time.cmp(&a.1.time));
        Ok(out)
    }

    /// Resolve `latest` or a hex id prefix.
    pub fn find(repo: &Repository, spec: &str) -> Result<(Id, Snapshot)> {
        if spec == "latest" {
            return Self::latest(repo, None, &[])?.ok_or(DavitError::NotFound {
                kind: "snapshot",
                id: "latest".into(),
            });
        }

        let matching: Vec<(Id, Snapshot)> = Snapshot::list(repo)?
            .into_iter()
            .filter(|(id, _)| id.has_prefix(spec))
            .collect();
        match matching.len() {
            0 => Err(DavitError::NotFound {
                kind: "snapshot",
                id: spec.to_string(),
            }),
            1 => Ok(matching.into_iter().next().expect("one element")),
            n => Err(DavitError::Other(format!(
                "snapshot id prefix '{spec}' is ambiguous ({n} matches)"
            ))),
        }
    }

    /// The newest snapshot, optionally restricted to a hostname and path set.
    pub fn latest(
        repo: &Repository,
        hostname: Option<&str>,
        paths: &[String],
    ) -> Result<Option<(Id, Snapshot)>> {
        let snapshots = Snapshot::list(repo)?;
        Ok(snapshots.into_iter().find(|(_, sn)| {
            if let Some(host) = hostname {
                if sn.hostname != host {
                    return false;
                }
            }
            if !paths.is_empty() && sn.paths != paths {
                return false;
            }
            true
        }))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags
            .as_deref()
            .map(|tags| tags.iter().any(|t| t == tag))
            .unwrap_or(false)
    }

    /// Snapshots are grouped for retention by (hostname, path set).
    pub fn group_key(&self) -> String {
        format!("{}:{}", self.hostname, self.paths.join(","))
    }
}
