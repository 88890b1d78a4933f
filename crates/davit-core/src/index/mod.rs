use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::crypto;
use crate::id::Id;
use crate::pack::{BlobKind, PackedBlob};

/// Where a blob lives: pack, offset, stored length, plaintext length hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub pack: Id,
    pub kind: BlobKind,
    pub offset: u32,
    pub length: u32,
    pub uncompressed_length: Option<u32>,
}

impl IndexEntry {
    /// Plaintext length of the blob this entry points at.
    pub fn plaintext_length(&self) -> u32 {
        match self.uncompressed_length {
            Some(unc) => unc,
            None => self.length.saturating_sub(crypto::EXTENSION as u32),
        }
    }
}

/// In-memory union of all index files: blob id → entries (first entry is
/// canonical; duplicates from racing writers are kept for duplicate
/// detection), plus the reverse pack → blob map used by prune.
#[derive(Debug, Default)]
pub struct Index {
    blobs: HashMap<Id, SmallVec<[IndexEntry; 1]>>,
    packs: HashMap<Id, Vec<Id>>,
}

impl Index {
    pub fn new() -> Self {
        Index::default()
    }

    pub fn has(&self, id: &Id) -> bool {
        self.blobs.contains_key(id)
    }

    /// The canonical (first-inserted) entry for a blob.
    pub fn lookup(&self, id: &Id) -> Option<&IndexEntry> {
        self.blobs.get(id).and_then(|v| v.first())
    }

    pub fn lookup_all(&self, id: &Id) -> Option<&[IndexEntry]> {
        self.blobs.get(id).map(|v| v.as_slice())
    }

    pub fn insert(&mut self, id: Id, entry: IndexEntry) {
        let entries = self.blobs.entry(id).or_default();
        // Merging index files and in-memory state must be idempotent: the
        // same (pack, offset) entry is recorded once. Entries from other
        // packs are kept for duplicate detection.
        if entries
            .iter()
            .any(|e| e.pack == entry.pack && e.offset == entry.offset)
        {
            return;
        }
        entries.push(entry);
        self.packs.entry(entry.pack).or_default().push(id);
    }

    /// Record a freshly sealed pack's blobs.
    pub fn add_pack(&mut self, pack: Id, blobs: &[PackedBlob]) {
        for blob in blobs {
            self.insert(
                blob.id,
                IndexEntry {
                    pack,
                    kind: blob.kind,
                    offset: blob.offset,
                    length: blob.length,
                    uncompressed_length: blob.uncompressed_length,
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Id, &IndexEntry)> {
        self.blobs
            .iter()
            .filter_map(|(id, entries)| entries.first().map(|e| (id, e)))
    }

    /// Blob ids with more than one entry (the same plaintext stored in
    /// several packs by racing writers).
    pub fn duplicates(&self) -> impl Iterator<Item = &Id> {
        self.blobs
            .iter()
            .filter(|(_, entries)| entries.len() > 1)
            .map(|(id, _)| id)
    }

    pub fn packs(&self) -> impl Iterator<Item = &Id> {
        self.packs.keys()
    }

    pub fn pack_count(&self) -> usize {
        self.packs.len()
    }

    pub fn blobs_of_pack(&self, pack: &Id) -> &[Id] {
        self.packs.get(pack).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Merge another index into this one (used when streaming index files).
    pub fn merge(&mut self, other: Index) {
        for (id, entries) in other.blobs {
            for entry in entries {
                self.insert(id, entry);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Persistent form: JSON documents enumerating packs and their blobs.
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexFile {
    pub packs: Vec<IndexPack>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexPack {
    pub id: Id,
    pub blobs: Vec<IndexBlob>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexBlob {
    pub id: Id,
    #[serde(rename = "type")]
    pub kind: BlobKind,
    pub offset: u32,
    pub length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncompressed_length: Option<u32>,
}

impl IndexFile {
    /// Serialize the subset of `index` covering exactly `packs`.
    pub fn for_packs<'a>(index: &Index, packs: impl Iterator<Item = &'a Id>) -> IndexFile {
        let mut out = Vec::new();
        for pack in packs {
            let mut blobs = Vec::new();
            let mut seen = HashSet::new();
            for blob_id in index.blobs_of_pack(pack) {
                if !seen.insert(*blob_id) {
                    continue;
                }
                let entries = index.lookup_all(blob_id).unwrap_or(&[]);
                for entry in entries.iter().filter(|e| e.pack == *pack) {
                    blobs.push(IndexBlob {
                        id: *blob_id,
                        kind: entry.kind,
                        offset: entry.offset,
                        length: entry.length,
                        uncompressed_length: entry.uncompressed_length,
                    });
                }
            }
            out.push(IndexPack { id: *pack, blobs });
        }
        IndexFile { packs: out }
    }

    /// Fold this file's contents into an in-memory index.
    pub fn apply_to(&self, index: &mut Index) {
        for pack in &self.packs {
            for blob in &pack.blobs {
                index.insert(
                    blob.id,
                    IndexEntry {
                        pack: pack.id,
                        kind: blob.kind,
                        offset: blob.offset,
                        length: blob.length,
                        uncompressed_length: blob.uncompressed_length,
                    },
                );
            }
        }
    }
}
