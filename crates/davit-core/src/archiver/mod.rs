use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use crossbeam_channel as channel;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};

use crate::chunker::Chunker;
use crate::error::{io_error_is_fatal, io_error_is_soft, DavitError, EntryError, Result};
use crate::id::Id;
use crate::pack::BlobKind;
use crate::repo::Repository;
use crate::snapshot::{Snapshot, SnapshotSummary};
use crate::tree::{Node, NodeKind, Tree};

/// How the pipeline treats one entry's I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Record on the node's error field and continue.
    Reportable,
    /// Abort the whole pipeline.
    Fatal,
}

/// Injected classification of per-entry I/O errors.
pub type ErrorPolicy = Arc<dyn Fn(&Path, &std::io::Error) -> ErrorClass + Send + Sync>;

/// Default policy: permission and read errors on individual entries are
/// reportable; out-of-space is fatal.
pub fn default_error_policy(_path: &Path, err: &std::io::Error) -> ErrorClass {
    if io_error_is_fatal(err) {
        ErrorClass::Fatal
    } else if io_error_is_soft(err) || err.kind() == std::io::ErrorKind::InvalidData {
        ErrorClass::Reportable
    } else {
        // Unclassified read errors: keep the backup going, record the node.
        ErrorClass::Reportable
    }
}

#[derive(Clone)]
pub struct BackupOptions {
    /// Glob patterns excluded from the walk, recorded on the snapshot.
    pub excludes: Vec<String>,
    pub tags: Vec<String>,
    /// Explicit parent snapshot; `None` auto-detects the latest snapshot for
    /// the same hostname and path set.
    pub parent: Option<Id>,
    /// Disable parent detection (full rechunk).
    pub no_parent: bool,
    /// Data-path worker count; 0 means the machine's CPU count.
    pub workers: usize,
    pub error_policy: ErrorPolicy,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            excludes: Vec::new(),
            tags: Vec::new(),
            parent: None,
            no_parent: false,
            workers: 0,
            error_policy: Arc::new(default_error_policy),
        }
    }
}

/// Progress events emitted (in walk order) while the pipeline runs.
#[derive(Debug, Clone)]
pub enum BackupEvent {
    File {
        path: String,
        bytes: u64,
        unchanged: bool,
    },
    Dir {
        path: String,
    },
    Error {
        path: String,
        message: String,
    },
}

#[derive(Debug)]
pub struct BackupResult {
    pub snapshot_id: Id,
    pub snapshot: Snapshot,
    /// Reportable per-entry failures; non-empty means partial success
    /// (conventionally exit code 3).
    pub errors: Vec<EntryError>,
}

// ---------------------------------------------------------------------------
// Pipeline plumbing
// ---------------------------------------------------------------------------

/// Per-node accounting produced by workers and folded into the summary.
#[derive(Debug, Clone, Copy, Default)]
struct LeafStats {
    is_file: bool,
    unchanged: bool,
    had_prev: bool,
    bytes: u64,
    new_data_blobs: u64,
    data_added: u64,
    reported_error: bool,
}

/// Events produced by the walker, in depth-first walk order. File entries
/// carry the path for the chunking workers; everything else passes through.
enum WalkEntry {
    EnterDir {
        node: Box<Node>,
        path: String,
        prev_subtree: Option<Id>,
    },
    LeaveDir,
    File {
        node: Box<Node>,
        path: PathBuf,
        had_prev: bool,
    },
    UnchangedFile {
        node: Box<Node>,
        path: String,
    },
    Leaf {
        node: Box<Node>,
        path: String,
    },
    SoftError {
        path: String,
        message: String,
    },
}

/// Worker output, reordered by sequence number before consumption.
enum Processed {
    EnterDir {
        node: Box<Node>,
        path: String,
        prev_subtree: Option<Id>,
    },
    LeaveDir,
    Node {
        node: Box<Node>,
        path: String,
        stats: LeafStats,
    },
    SoftError {
        path: String,
        message: String,
    },
}

enum PipelineMsg {
    Ok(usize, Box<Processed>),
    WorkerErr(usize, DavitError),
    WalkErr(DavitError),
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| DavitError::Pattern(e.to_string()))?;
        builder.add(glob);
    }
    Ok(Some(
        builder
            .build()
            .map_err(|e| DavitError::Pattern(e.to_string()))?,
    ))
}

struct WalkCtx<'a> {
    repo: &'a Repository,
    excludes: Option<GlobSet>,
    policy: ErrorPolicy,
    cancel: Option<&'a AtomicBool>,
    work_tx: channel::Sender<(usize, WalkEntry)>,
    seq: usize,
}

impl<'a> WalkCtx<'a> {
    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|f| f.load(Ordering::Relaxed))
    }

    fn send(&mut self, entry: WalkEntry) -> std::result::Result<(), ()> {
        let seq = self.seq;
        self.seq += 1;
        self.work_tx.send((seq, entry)).map_err(|_| ())
    }

    /// Apply the error policy to a walk-side I/O error on `path`.
    /// Reportable errors become SoftError entries; fatal ones bubble up.
    fn handle_io_error(&mut self, path: &Path, err: std::io::Error) -> Result<()> {
        match (self.policy)(path, &err) {
            ErrorClass::Reportable => {
                let _ = self.send(WalkEntry::SoftError {
                    path: path.display().to_string(),
                    message: err.to_string(),
                });
                Ok(())
            }
            ErrorClass::Fatal => Err(err.into()),
        }
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.excludes
            .as_ref()
            .is_some_and(|set| set.is_match(path))
    }

    /// Walk one directory: sorted entries, recursing into subdirectories.
    /// `prev_tree` is the parent snapshot's tree for this directory, used for
    /// the (size, mtime, ctime, inode) change short-circuit.
    fn walk_dir(&mut self, dir: &Path, prev_tree: Option<&Tree>) -> Result<()> {
        let read_dir = match std::fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) => return self.handle_io_error(dir, e),
        };
        let mut entries: Vec<(Vec<u8>, PathBuf)> = Vec::new();
        for entry in read_dir {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    self.handle_io_error(dir, e)?;
                    continue;
                }
            };
            entries.push((name_bytes(&entry.file_name()), entry.path()));
        }
        // Directory children sorted by byte-wise name: required for
        // reproducible tree ids.
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (name_bytes, path) in entries {
            if self.cancelled() {
                return Err(DavitError::Cancelled);
            }
            if self.is_excluded(&path) {
                continue;
            }
            let name = String::from_utf8_lossy(&name_bytes).into_owned();
            self.walk_one(&path, name, prev_tree)?;
        }
        Ok(())
    }

    /// Emit events for a single filesystem entry.
    fn walk_one(&mut self, path: &Path, name: String, prev_tree: Option<&Tree>) -> Result<()> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) => return self.handle_io_error(path, e),
        };
        let node = match Node::from_path(path, &meta, name.clone()) {
            Ok(n) => n,
            Err(DavitError::Io(e)) => return self.handle_io_error(path, e),
            Err(e) => return Err(e),
        };
        let prev_node = prev_tree.and_then(|t| t.find(&name));

        match node.kind {
            NodeKind::Dir => {
                let prev_subtree = prev_node
                    .filter(|p| p.kind == NodeKind::Dir)
                    .and_then(|p| p.subtree);
                let prev_loaded = prev_subtree.and_then(|id| match Tree::load(self.repo, &id) {
                    Ok(t) => Some(t),
                    Err(e) => {
                        warn!(tree = %id, "parent snapshot tree unreadable, rechunking: {e}");
                        None
                    }
                });
                if self
                    .send(WalkEntry::EnterDir {
                        node: Box::new(node),
                        path: path.display().to_string(),
                        prev_subtree,
                    })
                    .is_err()
                {
                    return Err(DavitError::Cancelled);
                }
                self.walk_dir(path, prev_loaded.as_ref())?;
                if self.send(WalkEntry::LeaveDir).is_err() {
                    return Err(DavitError::Cancelled);
                }
            }
            NodeKind::File => {
                let unchanged = prev_node
                    .filter(|prev| node.unchanged_from(prev))
                    .filter(|prev| prev.content.iter().all(|id| self.repo.has_blob(id)));
                let entry = match unchanged {
                    // Reuse the previous node wholesale: content list and
                    // recorded metadata. Re-statting would pick up access
                    // times churned by the previous backup run and defeat
                    // tree-level deduplication.
                    Some(prev) => WalkEntry::UnchangedFile {
                        node: Box::new(prev.clone()),
                        path: path.display().to_string(),
                    },
                    None => WalkEntry::File {
                        node: Box::new(node),
                        path: path.to_path_buf(),
                        had_prev: prev_node.is_some(),
                    },
                };
                if self.send(entry).is_err() {
                    return Err(DavitError::Cancelled);
                }
            }
            _ => {
                if self
                    .send(WalkEntry::Leaf {
                        node: Box::new(node),
                        path: path.display().to_string(),
                    })
                    .is_err()
                {
                    return Err(DavitError::Cancelled);
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn name_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn name_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    name.to_string_lossy().as_bytes().to_vec()
}

/// Why chunking a file stopped early.
enum FileFailure {
    /// Reading the source file failed; the error policy decides.
    Read(std::io::Error),
    /// The repository refused the data; never converted to per-file.
    Repo(DavitError),
    Cancelled,
}

/// Chunk one file and store its chunks; runs on a pipeline worker.
fn process_file(
    repo: &Repository,
    mut node: Box<Node>,
    path: &Path,
    had_prev: bool,
    policy: &ErrorPolicy,
    cancel: Option<&AtomicBool>,
) -> Result<Processed> {
    let display_path = path.display().to_string();

    let mut stats = LeafStats {
        is_file: true,
        had_prev,
        ..Default::default()
    };
    let result = (|| -> std::result::Result<Vec<Id>, FileFailure> {
        let file = File::open(path).map_err(FileFailure::Read)?;
        let chunker = Chunker::new(file, repo.polynomial(), &repo.options().chunker)
            .map_err(FileFailure::Repo)?;

        let mut content = Vec::new();
        for chunk in chunker {
            if cancel.is_some_and(|f| f.load(Ordering::Relaxed)) {
                return Err(FileFailure::Cancelled);
            }
            let chunk = chunk.map_err(|e| match e {
                DavitError::Io(io) => FileFailure::Read(io),
                other => FileFailure::Repo(other),
            })?;
            let saved = repo
                .save_blob(BlobKind::Data, &chunk.data)
                .map_err(FileFailure::Repo)?;
            if saved.new {
                stats.new_data_blobs += 1;
                stats.data_added += chunk.data.len() as u64;
            }
            stats.bytes += chunk.data.len() as u64;
            content.push(saved.id);
        }
        Ok(content)
    })();

    match result {
        Ok(content) => {
            node.content = content;
            node.size = Some(stats.bytes);
            Ok(Processed::Node {
                node,
                path: display_path,
                stats,
            })
        }
        Err(FileFailure::Cancelled) => Err(DavitError::Cancelled),
        Err(FileFailure::Repo(e)) => Err(e),
        Err(FileFailure::Read(e)) => match policy(path, &e) {
            ErrorClass::Reportable => {
                warn!(path = %display_path, "recording per-file error: {e}");
                node.error = Some(e.to_string());
                node.content = Vec::new();
                Ok(Processed::Node {
                    node,
                    path: display_path,
                    stats: LeafStats {
                        is_file: true,
                        had_prev,
                        reported_error: true,
                        ..Default::default()
                    },
                })
            }
            ErrorClass::Fatal => Err(e.into()),
        },
    }
}

// ---------------------------------------------------------------------------
// Consumer: tree assembly
// ---------------------------------------------------------------------------

struct DirFrame {
    node: Box<Node>,
    path: String,
    tree: Tree,
    prev_subtree: Option<Id>,
}

struct Consumer<'a, 'b> {
    repo: &'a Repository,
    stack: Vec<DirFrame>,
    root: Tree,
    summary: SnapshotSummary,
    errors: Vec<EntryError>,
    progress: Option<&'b mut dyn FnMut(BackupEvent)>,
}

impl<'a, 'b> Consumer<'a, 'b> {
    fn emit(&mut self, event: BackupEvent) {
        if let Some(cb) = self.progress.as_deref_mut() {
            cb(event);
        }
    }

    fn insert(&mut self, node: Node) -> Result<()> {
        match self.stack.last_mut() {
            Some(frame) => frame.tree.insert(node),
            None => self.root.insert(node),
        }
    }

    fn consume(&mut self, entry: Processed) -> Result<()> {
        match entry {
            Processed::EnterDir {
                node,
                path,
                prev_subtree,
            } => {
                self.stack.push(DirFrame {
                    node,
                    path,
                    tree: Tree::new(),
                    prev_subtree,
                });
            }
            Processed::LeaveDir => {
                let frame = self
                    .stack
                    .pop()
                    .ok_or_else(|| DavitError::Other("tree stack underflow".into()))?;
                let saved = frame.tree.save(self.repo)?;
                if saved.new {
                    self.summary.tree_blobs += 1;
                    self.summary.data_added += frame.tree.to_json()?.len() as u64;
                }
                match frame.prev_subtree {
                    Some(prev) if prev == saved.id => self.summary.dirs_unchanged += 1,
                    Some(_) => self.summary.dirs_changed += 1,
                    None => self.summary.dirs_new += 1,
                }
                let mut dir_node = frame.node;
                dir_node.subtree = Some(saved.id);
                self.insert(*dir_node)?;
                self.emit(BackupEvent::Dir { path: frame.path });
            }
            Processed::Node { node, path, stats } => {
                if stats.is_file {
                    self.summary.total_files_processed += 1;
                    self.summary.total_bytes_processed += stats.bytes;
                    if stats.reported_error {
                        let message = node
                            .error
                            .clone()
                            .unwrap_or_else(|| "unreadable".to_string());
                        self.errors.push(EntryError {
                            path: path.clone(),
                            message: message.clone(),
                        });
                        self.emit(BackupEvent::Error {
                            path: path.clone(),
                            message,
                        });
                    } else if stats.unchanged {
                        self.summary.files_unchanged += 1;
                    } else if stats.had_prev {
                        self.summary.files_changed += 1;
                    } else {
                        self.summary.files_new += 1;
                    }
                    self.summary.data_blobs += stats.new_data_blobs;
                    self.summary.data_added += stats.data_added;
                    self.emit(BackupEvent::File {
                        path,
                        bytes: stats.bytes,
                        unchanged: stats.unchanged,
                    });
                }
                self.insert(*node)?;
            }
            Processed::SoftError { path, message } => {
                self.errors.push(EntryError {
                    path: path.clone(),
                    message: message.clone(),
                });
                self.emit(BackupEvent::Error { path, message });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run a backup of `targets` and produce a snapshot. Walk → worker pool
/// (chunk + store) → ordered consumer (tree assembly), over bounded queues.
pub fn backup(
    repo: &Repository,
    targets: &[PathBuf],
    options: &BackupOptions,
    progress: Option<&mut dyn FnMut(BackupEvent)>,
    cancel: Option<&AtomicBool>,
) -> Result<BackupResult> {
    if targets.is_empty() {
        return Err(DavitError::Config("no backup targets given".into()));
    }
    let excludes = build_globset(&options.excludes)?;

    let lock = repo.lock_shared()?;
    let result = backup_locked(repo, targets, options, excludes, progress, cancel);
    // Release the lock on both paths; a failed release only leaves a lock
    // that will go stale.
    if let Err(e) = repo.unlock(lock) {
        warn!("failed to release backup lock: {e}");
    }
    result
}

fn backup_locked(
    repo: &Repository,
    targets: &[PathBuf],
    options: &BackupOptions,
    excludes: Option<GlobSet>,
    progress: Option<&mut dyn FnMut(BackupEvent)>,
    cancel: Option<&AtomicBool>,
) -> Result<BackupResult> {
    let start_time = Utc::now();
    repo.load_index()?;

    // Canonical target paths, recorded on the snapshot and used for parent
    // detection.
    let mut paths: Vec<String> = Vec::new();
    for target in targets {
        let canon = target
            .canonicalize()
            .map_err(|e| DavitError::Config(format!("target '{}': {e}", target.display())))?;
        paths.push(canon.display().to_string());
    }

    let parent = if options.no_parent {
        None
    } else if let Some(explicit) = options.parent {
        Some(explicit)
    } else {
        let host = crate::platform::hostname();
        Snapshot::latest(repo, Some(host.as_str()), &paths)?.map(|(id, _)| id)
    };
    let prev_root = parent
        .and_then(|id| Snapshot::load(repo, &id).ok())
        .and_then(|sn| match Tree::load(repo, &sn.tree) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("parent snapshot root tree unreadable, full scan: {e}");
                None
            }
        });
    if let Some(parent_id) = parent {
        debug!(parent = %parent_id, "using parent snapshot for change detection");
    }

    let workers = if options.workers > 0 {
        options.workers
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    };
    let work_cap = workers * 2;
    let result_cap = workers * 2 + 16;

    let mut consumer = Consumer {
        repo,
        stack: Vec::new(),
        root: Tree::new(),
        summary: SnapshotSummary {
            backup_start: Some(start_time),
            ..Default::default()
        },
        errors: Vec::new(),
        progress,
    };

    let pipeline_result: Result<()> = std::thread::scope(|scope| {
        let (work_tx, work_rx) = channel::bounded::<(usize, WalkEntry)>(work_cap);
        let (result_tx, result_rx) = channel::bounded::<PipelineMsg>(result_cap);

        // --- Walker ---
        let walk_result_tx = result_tx.clone();
        let policy = options.error_policy.clone();
        let targets: Vec<PathBuf> = targets.to_vec();
        let prev_root_ref = &prev_root;
        scope.spawn(move || {
            let mut ctx = WalkCtx {
                repo,
                excludes,
                policy,
                cancel,
                work_tx,
                seq: 0,
            };
            for target in &targets {
                if ctx.cancelled() {
                    let _ = walk_result_tx.send(PipelineMsg::WalkErr(DavitError::Cancelled));
                    return;
                }
                let name = target_node_name(target);
                if let Err(e) = ctx.walk_one(target, name, prev_root_ref.as_ref()) {
                    let _ = walk_result_tx.send(PipelineMsg::WalkErr(e));
                    return;
                }
            }
            // Dropping work_tx lets workers drain and exit.
        });

        // --- Workers ---
        for _ in 0..workers {
            let rx = work_rx.clone();
            let tx = result_tx.clone();
            let policy = options.error_policy.clone();
            scope.spawn(move || {
                for (seq, entry) in rx {
                    let processed = match entry {
                        WalkEntry::File {
                            node,
                            path,
                            had_prev,
                        } => process_file(repo, node, &path, had_prev, &policy, cancel),
                        WalkEntry::UnchangedFile { node, path } => {
                            let bytes = node.size.unwrap_or(0);
                            Ok(Processed::Node {
                                node,
                                path,
                                stats: LeafStats {
                                    is_file: true,
                                    unchanged: true,
                                    had_prev: true,
                                    bytes,
                                    ..Default::default()
                                },
                            })
                        }
                        WalkEntry::Leaf { node, path } => Ok(Processed::Node {
                            node,
                            path,
                            stats: LeafStats::default(),
                        }),
                        WalkEntry::EnterDir {
                            node,
                            path,
                            prev_subtree,
                        } => Ok(Processed::EnterDir {
                            node,
                            path,
                            prev_subtree,
                        }),
                        WalkEntry::LeaveDir => Ok(Processed::LeaveDir),
                        WalkEntry::SoftError { path, message } => {
                            Ok(Processed::SoftError { path, message })
                        }
                    };
                    let msg = match processed {
                        Ok(p) => PipelineMsg::Ok(seq, Box::new(p)),
                        Err(e) => PipelineMsg::WorkerErr(seq, e),
                    };
                    if tx.send(msg).is_err() {
                        return;
                    }
                }
            });
        }
        drop(work_rx);
        drop(result_tx);

        // --- Ordered consumer ---
        let mut next_expected = 0usize;
        let mut pending: BTreeMap<usize, std::result::Result<Box<Processed>, DavitError>> =
            BTreeMap::new();
        for msg in &result_rx {
            if cancel.is_some_and(|f| f.load(Ordering::Relaxed)) {
                return Err(DavitError::Cancelled);
            }
            match msg {
                PipelineMsg::Ok(seq, processed) => {
                    pending.insert(seq, Ok(processed));
                }
                PipelineMsg::WorkerErr(seq, e) => {
                    pending.insert(seq, Err(e));
                }
                PipelineMsg::WalkErr(e) => return Err(e),
            }
            while let Some(result) = pending.remove(&next_expected) {
                next_expected += 1;
                consumer.consume(*result?)?;
            }
        }
        if !pending.is_empty() {
            return Err(DavitError::Other(
                "pipeline ended with out-of-order entries unconsumed".into(),
            ));
        }
        Ok(())
    });
    pipeline_result?;

    if !consumer.stack.is_empty() {
        return Err(DavitError::Other(
            "pipeline ended inside an unfinished directory".into(),
        ));
    }

    // Root tree, flush, snapshot. A snapshot is only written after flush has
    // made every referenced blob durable.
    let root_saved = consumer.root.save(repo)?;
    if root_saved.new {
        consumer.summary.tree_blobs += 1;
    }
    repo.flush()?;

    let mut snapshot = Snapshot::new(root_saved.id, paths);
    snapshot.parent = parent;
    if !options.excludes.is_empty() {
        snapshot.excludes = Some(options.excludes.clone());
    }
    if !options.tags.is_empty() {
        snapshot.tags = Some(options.tags.clone());
    }
    let mut summary = consumer.summary;
    summary.backup_end = Some(Utc::now());
    snapshot.summary = Some(summary);

    let snapshot_id = snapshot.save(repo)?;
    debug!(snapshot = %snapshot_id, "backup complete");

    Ok(BackupResult {
        snapshot_id,
        snapshot,
        errors: consumer.errors,
    })
}

/// Node name for a top-level target: its final path component.
fn target_node_name(target: &Path) -> String {
    target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}
