use std::path::PathBuf;

use crate::chunker::ChunkerConfig;
use crate::compress::Compression;
use crate::crypto::kdf::KdfParams;
use crate::error::{DavitError, Result};

/// Environment variables recognized by convention.
pub const ENV_REPOSITORY: &str = "DAVIT_REPOSITORY";
pub const ENV_PASSWORD: &str = "DAVIT_PASSWORD";
pub const ENV_PASSWORD_FILE: &str = "DAVIT_PASSWORD_FILE";
pub const ENV_CACHE_DIR: &str = "DAVIT_CACHE_DIR";

pub const DEFAULT_PACK_SIZE: u32 = 16 * 1024 * 1024;
pub const DEFAULT_READ_CONCURRENCY: usize = 2;

/// Engine options resolved by the front-end and handed to the repository.
#[derive(Debug, Clone)]
pub struct RepoOptions {
    /// Soft upper bound on pack-file size in bytes; a pack closes once it
    /// exceeds this.
    pub pack_size: u32,
    pub compression: Compression,
    /// Worker count for data reads during restore and check.
    pub read_concurrency: usize,
    /// Disable the local cache directory entirely.
    pub no_cache: bool,
    /// Override the cache directory (defaults to the platform cache dir).
    pub cache_dir: Option<PathBuf>,
    /// Chunking bounds; must match across runs for dedup to line up.
    pub chunker: ChunkerConfig,
    /// KDF cost for newly created key records.
    pub kdf: KdfParams,
}

impl Default for RepoOptions {
    fn default() -> Self {
        RepoOptions {
            pack_size: DEFAULT_PACK_SIZE,
            compression: Compression::default(),
            read_concurrency: DEFAULT_READ_CONCURRENCY,
            no_cache: false,
            cache_dir: None,
            chunker: ChunkerConfig::default(),
            kdf: KdfParams::default(),
        }
    }
}

impl RepoOptions {
    /// Apply a `pack-size` option value given in MiB.
    pub fn with_pack_size_mib(mut self, mib: u32) -> Result<Self> {
        if mib == 0 || mib > 128 {
            return Err(DavitError::Config(format!(
                "pack-size {mib} MiB outside [1, 128]"
            )));
        }
        self.pack_size = mib * 1024 * 1024;
        Ok(self)
    }

    /// Resolved cache directory, honoring `no_cache` and `DAVIT_CACHE_DIR`.
    pub fn resolved_cache_dir(&self, repo_id: &str) -> Option<PathBuf> {
        if self.no_cache {
            return None;
        }
        let base = self
            .cache_dir
            .clone()
            .or_else(|| std::env::var_os(ENV_CACHE_DIR).map(PathBuf::from))
            .or_else(default_cache_base)?;
        Some(base.join(repo_id))
    }
}

fn default_cache_base() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME") {
        return Some(PathBuf::from(xdg).join("davit"));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache").join("davit"))
}

/// Repository location from the environment.
pub fn repository_from_env() -> Option<String> {
    std::env::var(ENV_REPOSITORY).ok().filter(|s| !s.is_empty())
}

/// Passphrase from `DAVIT_PASSWORD` or, failing that, the first line of the
/// file named by `DAVIT_PASSWORD_FILE`.
pub fn password_from_env() -> Result<Option<String>> {
    if let Ok(pw) = std::env::var(ENV_PASSWORD) {
        if !pw.is_empty() {
            return Ok(Some(pw));
        }
    }
    if let Ok(path) = std::env::var(ENV_PASSWORD_FILE) {
        let contents = std::fs::read_to_string(&path)?;
        let line = contents.lines().next().unwrap_or("").to_string();
        if line.is_empty() {
            return Err(DavitError::Config(format!(
                "password file '{path}' is empty"
            )));
        }
        return Ok(Some(line));
    }
    Ok(None)
}
