//! End-to-end scenarios against a local-filesystem repository.

use std::path::{Path, PathBuf};

use davit_core::archiver::{backup, BackupOptions, BackupResult};
use davit_core::backend::{local::LocalBackend, FileKind};
use davit_core::chunker::ChunkerConfig;
use davit_core::commands::check::{check, CheckOptions};
use davit_core::commands::forget::{forget, ForgetOptions};
use davit_core::commands::prune::{prune, PruneOptions};
use davit_core::config::RepoOptions;
use davit_core::crypto::kdf::KdfParams;
use davit_core::restorer::{restore, RestoreOptions};
use davit_core::retention::RetentionPolicy;
use davit_core::snapshot::Snapshot;
use davit_core::{DavitError, Repository};

const PASSPHRASE: &str = "integration-passphrase";

fn options() -> RepoOptions {
    RepoOptions {
        kdf: KdfParams { n: 1024, r: 8, p: 1 },
        chunker: ChunkerConfig {
            min_size: 4 * 1024,
            avg_size: 16 * 1024,
            max_size: 64 * 1024,
        },
        no_cache: true,
        ..Default::default()
    }
}

fn init_repo(dir: &Path) -> Repository {
    let backend = LocalBackend::create(dir).unwrap();
    Repository::init(Box::new(backend), PASSPHRASE, options()).unwrap()
}

fn open_repo(dir: &Path) -> Repository {
    let backend = LocalBackend::open(dir).unwrap();
    Repository::open(Box::new(backend), PASSPHRASE, options()).unwrap()
}

fn run_backup(repo: &Repository, target: &Path) -> BackupResult {
    backup(
        repo,
        &[target.to_path_buf()],
        &BackupOptions::default(),
        None,
        None,
    )
    .unwrap()
}

/// Deterministic pseudo-random bytes.
fn gen_bytes(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}

fn count_data_blobs(repo: &Repository) -> usize {
    repo.load_index().unwrap();
    let index = repo.index();
    index
        .iter()
        .filter(|(_, e)| e.kind == davit_core::pack::BlobKind::Data)
        .count()
}

#[test]
fn empty_file_produces_no_data_blobs() {
    let repo_dir = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a"), b"").unwrap();

    let repo = init_repo(repo_dir.path());
    let result = run_backup(&repo, src.path());

    assert_eq!(count_data_blobs(&repo), 0);

    // Restore yields a zero-length file.
    let dst = tempfile::tempdir().unwrap();
    restore(
        &repo,
        &result.snapshot_id.to_hex(),
        dst.path(),
        &RestoreOptions::default(),
        None,
    )
    .unwrap();
    let restored = dst
        .path()
        .join(src.path().file_name().unwrap())
        .join("a");
    assert_eq!(std::fs::metadata(&restored).unwrap().len(), 0);
}

#[test]
fn identical_twins_share_all_data_blobs() {
    let repo_dir = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let content = gen_bytes(256 * 1024, 0xfeed);
    std::fs::write(src.path().join("a"), &content).unwrap();
    std::fs::write(src.path().join("b"), &content).unwrap();

    let repo = init_repo(repo_dir.path());
    let result = run_backup(&repo, src.path());
    let summary = result.snapshot.summary.as_ref().unwrap();

    // Twice the bytes processed, but each distinct chunk stored once.
    assert_eq!(summary.total_bytes_processed, 2 * content.len() as u64);
    let distinct = count_data_blobs(&repo);
    assert!(distinct > 0);
    assert!(
        summary.data_blobs as usize == distinct,
        "every stored blob accounted once: {} vs {}",
        summary.data_blobs,
        distinct
    );

    // Both file nodes carry the same content list.
    let root = davit_core::tree::Tree::load(&repo, &result.snapshot.tree).unwrap();
    let dir = davit_core::tree::Tree::load(&repo, &root.nodes[0].subtree.unwrap()).unwrap();
    let a = dir.find("a").unwrap();
    let b = dir.find("b").unwrap();
    assert_eq!(a.content, b.content);
}

#[test]
fn append_adds_only_tail_chunks() {
    let repo_dir = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let base = gen_bytes(500 * 1024, 0xbeef);
    std::fs::write(src.path().join("grow.bin"), &base).unwrap();

    let repo = init_repo(repo_dir.path());
    run_backup(&repo, src.path());
    let blobs_before = count_data_blobs(&repo);

    // Append a kilobyte; content-defined boundaries keep the prefix chunks.
    let mut grown = base.clone();
    grown.extend_from_slice(&gen_bytes(1024, 0xd00d));
    std::fs::write(src.path().join("grow.bin"), &grown).unwrap();

    let second = run_backup(&repo, src.path());
    let blobs_after = count_data_blobs(&repo);
    let summary = second.snapshot.summary.as_ref().unwrap();

    assert_eq!(summary.files_changed, 1);
    let new_blobs = blobs_after - blobs_before;
    assert!(
        new_blobs <= 2,
        "append should add at most the re-cut tail, got {new_blobs} new blobs"
    );
}

#[test]
fn tampered_pack_fails_check_with_pack_id() {
    let repo_dir = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f"), gen_bytes(64 * 1024, 77)).unwrap();

    let repo = init_repo(repo_dir.path());
    run_backup(&repo, src.path());

    let clean = check(&repo, &CheckOptions { read_data: true }).unwrap();
    assert!(clean.ok());

    // Flip one byte of one pack, bypassing the backend.
    let (name, _) = repo.backend().list(FileKind::Pack).unwrap()[0].clone();
    let pack_path = repo_dir
        .path()
        .join("data")
        .join(&name[..2])
        .join(&name);
    let mut bytes = std::fs::read(&pack_path).unwrap();
    bytes[100] ^= 0x01;
    std::fs::write(&pack_path, &bytes).unwrap();

    let result = check(&repo, &CheckOptions { read_data: true }).unwrap();
    assert!(!result.ok());
    let short = &name[..8];
    assert!(
        result.errors.iter().any(|e| e.context.contains(short)),
        "check must name the tampered pack: {:?}",
        result.errors
    );
}

#[test]
fn wrong_passphrase_is_rejected_with_exit_code_12() {
    let repo_dir = tempfile::tempdir().unwrap();
    init_repo(repo_dir.path());

    let backend = LocalBackend::open(repo_dir.path()).unwrap();
    let err = match Repository::open(Box::new(backend), "not the passphrase", options()) {
        Ok(_) => panic!("expected the wrong passphrase to be rejected"),
        Err(e) => e,
    };
    assert!(matches!(err, DavitError::WrongPassphrase));
    assert_eq!(err.exit_code(), 12);
}

#[test]
fn parallel_backups_of_identical_content_store_data_once() {
    let repo_dir = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("big.bin"), gen_bytes(512 * 1024, 31)).unwrap();

    let repo = init_repo(repo_dir.path());

    std::thread::scope(|scope| {
        for _ in 0..2 {
            let repo = &repo;
            let target = src.path().to_path_buf();
            scope.spawn(move || {
                backup(
                    repo,
                    &[target],
                    &BackupOptions::default(),
                    None,
                    None,
                )
                .unwrap();
            });
        }
    });

    // Two valid snapshots, the data stored at most once per distinct chunk:
    // the repository holds exactly the blobs one snapshot references.
    let snapshots = Snapshot::list(&repo).unwrap();
    assert_eq!(snapshots.len(), 2);

    repo.load_index().unwrap();
    let root = davit_core::tree::Tree::load(&repo, &snapshots[0].1.tree).unwrap();
    let dir = davit_core::tree::Tree::load(&repo, &root.nodes[0].subtree.unwrap()).unwrap();
    let referenced: std::collections::HashSet<_> =
        dir.find("big.bin").unwrap().content.iter().copied().collect();
    assert!(!referenced.is_empty());
    assert_eq!(count_data_blobs(&repo), referenced.len());

    let result = check(&repo, &CheckOptions { read_data: true }).unwrap();
    assert!(result.ok(), "errors: {:?}", result.errors);
}

#[test]
fn full_lifecycle_backup_forget_prune_restore() {
    let repo_dir = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(src.path().join("docs")).unwrap();
    let payload = gen_bytes(200 * 1024, 5);
    std::fs::write(src.path().join("docs/report.bin"), &payload).unwrap();
    std::fs::write(src.path().join("notes.txt"), b"some notes").unwrap();

    // Backup via one handle, reopen with the passphrase for the rest.
    {
        let repo = init_repo(repo_dir.path());
        run_backup(&repo, src.path());
    }
    let repo = open_repo(repo_dir.path());

    // Change and back up again.
    std::fs::write(src.path().join("notes.txt"), b"some newer notes").unwrap();
    let second = run_backup(&repo, src.path());

    // Keep only the latest snapshot, reclaim, verify.
    forget(
        &repo,
        &RetentionPolicy {
            keep_last: Some(1),
            ..Default::default()
        },
        &ForgetOptions::default(),
    )
    .unwrap();
    prune(&repo, &PruneOptions::default()).unwrap();
    let result = check(&repo, &CheckOptions { read_data: true }).unwrap();
    assert!(result.ok(), "errors: {:?}", result.errors);

    // Restore the surviving snapshot and compare bytes.
    let dst = tempfile::tempdir().unwrap();
    let stats = restore(&repo, "latest", dst.path(), &RestoreOptions::default(), None).unwrap();
    assert!(stats.errors.is_empty());

    let base = dst.path().join(src.path().file_name().unwrap());
    assert_eq!(std::fs::read(base.join("docs/report.bin")).unwrap(), payload);
    assert_eq!(
        std::fs::read(base.join("notes.txt")).unwrap(),
        b"some newer notes"
    );
    assert_eq!(
        Snapshot::list(&repo).unwrap()[0].0,
        second.snapshot_id
    );
}

#[test]
fn exclusive_lock_blocks_concurrent_operations() {
    let repo_dir = tempfile::tempdir().unwrap();
    let repo = init_repo(repo_dir.path());

    let lock = repo.lock_exclusive().unwrap();
    // A backup needs at least a shared lock and must fail while the
    // exclusive lock is held.
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f"), b"x").unwrap();
    let err = backup(
        &repo,
        &[src.path().to_path_buf()],
        &BackupOptions::default(),
        None,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, DavitError::Locked(_)));
    assert_eq!(err.exit_code(), 11);

    repo.unlock(lock).unwrap();
    run_backup(&repo, src.path());
}

#[test]
fn snapshots_list_and_resolve_by_prefix() {
    let repo_dir = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f"), b"data").unwrap();

    let repo = init_repo(repo_dir.path());
    let result = run_backup(&repo, src.path());

    let (resolved, _) = Snapshot::find(&repo, &result.snapshot_id.to_hex()[..10]).unwrap();
    assert_eq!(resolved, result.snapshot_id);

    let missing_dir = tempfile::tempdir().unwrap();
    let mut target: PathBuf = missing_dir.path().to_path_buf();
    target.push("does-not-exist");
    let err = backup(
        &repo,
        &[target],
        &BackupOptions::default(),
        None,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, DavitError::Config(_)));
}

#[test]
fn second_key_record_opens_the_same_repository() {
    let repo_dir = tempfile::tempdir().unwrap();
    let repo = init_repo(repo_dir.path());
    let repo_id = repo.config().id.clone();

    // Add a second passphrase wrapping the same master key.
    davit_core::crypto::key::create(
        repo.backend(),
        "second passphrase",
        KdfParams { n: 1024, r: 8, p: 1 },
        Some(repo.key()),
    )
    .unwrap();
    drop(repo);

    let backend = LocalBackend::open(repo_dir.path()).unwrap();
    let reopened = Repository::open(Box::new(backend), "second passphrase", options()).unwrap();
    assert_eq!(reopened.config().id, repo_id);
}
