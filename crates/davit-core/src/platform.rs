//! Thin platform layer: stat summaries for backup, metadata application for
//! restore, and the process-wide uid/gid name caches.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::OnceLock;

use crate::error::Result;

/// Hostname of this machine, or "localhost" when it cannot be determined.
pub fn hostname() -> String {
    platform_hostname().unwrap_or_else(|| {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    })
}

#[cfg(unix)]
fn platform_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = std::str::from_utf8(&buf[..end]).ok()?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

#[cfg(not(unix))]
fn platform_hostname() -> Option<String> {
    None
}

/// Name of the current user, falling back to the numeric uid.
#[cfg(unix)]
pub fn username() -> String {
    let uid = unsafe { libc::geteuid() };
    lookup_username(uid).unwrap_or_else(|| uid.to_string())
}

#[cfg(not(unix))]
pub fn username() -> String {
    std::env::var("USERNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(unix)]
pub fn euid() -> u32 {
    unsafe { libc::geteuid() }
}

#[cfg(not(unix))]
pub fn euid() -> u32 {
    0
}

#[cfg(unix)]
pub fn egid() -> u32 {
    unsafe { libc::getegid() }
}

#[cfg(not(unix))]
pub fn egid() -> u32 {
    0
}

// ---------------------------------------------------------------------------
// uid/gid name caches (process-wide singletons)
// ---------------------------------------------------------------------------

fn uid_cache() -> &'static Mutex<HashMap<u32, Option<String>>> {
    static CACHE: OnceLock<Mutex<HashMap<u32, Option<String>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn gid_cache() -> &'static Mutex<HashMap<u32, Option<String>>> {
    static CACHE: OnceLock<Mutex<HashMap<u32, Option<String>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Cached user name lookup by uid. Returns `None` when no name can be found.
pub fn lookup_username(uid: u32) -> Option<String> {
    if let Some(cached) = uid_cache().lock().unwrap().get(&uid) {
        return cached.clone();
    }
    let name = lookup_username_uncached(uid);
    uid_cache().lock().unwrap().insert(uid, name.clone());
    name
}

/// Cached group name lookup by gid. Returns `None` when no name can be found.
pub fn lookup_group(gid: u32) -> Option<String> {
    if let Some(cached) = gid_cache().lock().unwrap().get(&gid) {
        return cached.clone();
    }
    let name = lookup_group_uncached(gid);
    gid_cache().lock().unwrap().insert(gid, name.clone());
    name
}

#[cfg(unix)]
fn lookup_username_uncached(uid: u32) -> Option<String> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; 2048];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwuid_r(
            uid,
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
    name.to_str().ok().map(|s| s.to_string())
}

#[cfg(not(unix))]
fn lookup_username_uncached(_uid: u32) -> Option<String> {
    None
}

#[cfg(unix)]
fn lookup_group_uncached(gid: u32) -> Option<String> {
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; 2048];
    let mut result: *mut libc::group = std::ptr::null_mut();
    let rc = unsafe {
        libc::getgrgid_r(
            gid,
            &mut grp,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr(grp.gr_name) };
    name.to_str().ok().map(|s| s.to_string())
}

#[cfg(not(unix))]
fn lookup_group_uncached(_gid: u32) -> Option<String> {
    None
}

// ---------------------------------------------------------------------------
// Restore-side metadata application
// ---------------------------------------------------------------------------

/// Change ownership without following symlinks. Best-effort by design: the
/// caller decides whether a permission error is worth reporting (only when
/// running as root).
#[cfg(unix)]
pub fn lchown(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    let c_path = path_cstring(path)?;
    let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn lchown(_path: &Path, _uid: u32, _gid: u32) -> std::io::Result<()> {
    Ok(())
}

/// Set atime/mtime with nanosecond precision, not following symlinks.
#[cfg(unix)]
pub fn set_times(path: &Path, atime_ns: i64, mtime_ns: i64) -> std::io::Result<()> {
    let c_path = path_cstring(path)?;
    let times = [timespec_from_ns(atime_ns), timespec_from_ns(mtime_ns)];
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn set_times(_path: &Path, _atime_ns: i64, _mtime_ns: i64) -> std::io::Result<()> {
    Ok(())
}

/// Set permission bits (not applied to symlinks by the caller).
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    std::fs::set_permissions(path, perms)
}

/// Create a device node.
#[cfg(unix)]
pub fn mknod(path: &Path, mode: u32, dev: u64) -> std::io::Result<()> {
    let c_path = path_cstring(path)?;
    let rc = unsafe { libc::mknod(c_path.as_ptr(), mode as libc::mode_t, dev as libc::dev_t) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
pub fn mkfifo(path: &Path, mode: u32) -> std::io::Result<()> {
    mknod(path, mode | libc::S_IFIFO as u32, 0)
}

/// Whether a pid is alive on this host (used for stale-lock detection).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

// ---------------------------------------------------------------------------
// Extended attributes
// ---------------------------------------------------------------------------

#[cfg(unix)]
pub fn list_xattrs(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    for name in xattr::list(path)? {
        let Some(name_str) = name.to_str() else {
            continue;
        };
        if let Some(value) = xattr::get(path, &name)? {
            out.push((name_str.to_string(), value));
        }
    }
    Ok(out)
}

#[cfg(not(unix))]
pub fn list_xattrs(_path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    Ok(Vec::new())
}

#[cfg(unix)]
pub fn set_xattr(path: &Path, name: &str, value: &[u8]) -> std::io::Result<()> {
    xattr::set(path, name, value)
}

#[cfg(not(unix))]
pub fn set_xattr(_path: &Path, _name: &str, _value: &[u8]) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn path_cstring(path: &Path) -> std::io::Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))
}

#[cfg(unix)]
fn timespec_from_ns(ns: i64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (ns % 1_000_000_000) as libc::c_long,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_is_nonempty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn uid_lookup_is_cached() {
        // Whatever the answer, asking twice must agree (and hit the cache).
        let a = lookup_username(0);
        let b = lookup_username(0);
        assert_eq!(a, b);
    }

    #[cfg(unix)]
    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn times_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        set_times(&path, 1_600_000_000_123_456_789, 1_600_000_001_987_654_321).unwrap();

        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.mtime(), 1_600_000_001);
        assert_eq!(meta.mtime_nsec(), 987_654_321);
    }
}
