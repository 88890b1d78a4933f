use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{DavitError, Result};

/// Concurrency-safe writer for partially restored files.
///
/// Restore workers may deliver chunks of the same file out of order and in
/// parallel; offsets are explicit, so concurrent positional writes through a
/// shared handle are safe. Open handles live in a hash-bucketed map keyed by
/// path, each carrying the count of writes still owed; the handle closes when
/// the last write lands.
pub struct FilesWriter {
    buckets: Vec<Mutex<HashMap<PathBuf, PartialFile>>>,
}

struct PartialFile {
    file: Arc<File>,
    remaining: usize,
}

/// All-zero chunks of a sparse restore are skipped; truncation to the final
/// size has already produced the holes.
pub fn is_all_zero(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

impl FilesWriter {
    pub fn new(bucket_count: usize) -> Self {
        let buckets = (0..bucket_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        FilesWriter { buckets }
    }

    fn bucket(&self, path: &Path) -> &Mutex<HashMap<PathBuf, PartialFile>> {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        &self.buckets[(hasher.finish() as usize) % self.buckets.len()]
    }

    /// Write one chunk at its offset. The first write to a path opens the
    /// file and truncates it to `create_size` (best-effort preallocation and
    /// the basis for sparse holes); the `total_writes`-th write closes it.
    pub fn write_at(
        &self,
        path: &Path,
        offset: u64,
        data: &[u8],
        create_size: u64,
        total_writes: usize,
        sparse: bool,
    ) -> Result<()> {
        debug_assert!(total_writes > 0, "zero-write files bypass the writer");

        let file = {
            let mut bucket = self.bucket(path).lock().unwrap();
            match bucket.get(path) {
                Some(partial) => Arc::clone(&partial.file),
                None => {
                    let file = Arc::new(open_output(path, create_size)?);
                    bucket.insert(
                        path.to_path_buf(),
                        PartialFile {
                            file: Arc::clone(&file),
                            remaining: total_writes,
                        },
                    );
                    file
                }
            }
        };

        // The bucket lock is not held across I/O.
        let write_result = if sparse && is_all_zero(data) {
            Ok(())
        } else {
            write_all_at(&file, data, offset)
        };

        let mut bucket = self.bucket(path).lock().unwrap();
        if let Some(partial) = bucket.get_mut(path) {
            partial.remaining -= 1;
            if partial.remaining == 0 {
                bucket.remove(path);
                debug!(path = %path.display(), "restored file complete");
            }
        }
        write_result.map_err(DavitError::Io)
    }

    /// Number of files still open (diagnostics and tests).
    pub fn open_files(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().unwrap().len()).sum()
    }
}

/// Create the output file, sized to its final length. A permission-denied
/// open clears a read-only mode left by a previous restore and retries once.
fn open_output(path: &Path, create_size: u64) -> Result<File> {
    let open = || OpenOptions::new().write(true).create(true).open(path);
    let file = match open() {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            let _ = crate::platform::set_mode(path, 0o600);
            open().map_err(DavitError::Io)?
        }
        Err(e) => return Err(e.into()),
    };
    file.set_len(create_size)?;
    Ok(file)
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}
