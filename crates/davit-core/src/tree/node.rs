use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DavitError, Result};
use crate::id::Id;

/// A named byte value: extended attributes, and the platform-neutral generic
/// attribute carrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(with = "crate::serde_util::base64_vec")]
    pub value: Vec<u8>,
}

// Recognized generic attribute keys. Values under unknown keys round-trip
// untouched and trigger a single warning per key per process on restore.
pub const GA_WIN_FILE_ATTRIB: &str = "WinFileAttrib";
pub const GA_WIN_CREATION_TIME: &str = "WinCreationTime";
pub const GA_WIN_SECURITY_DESC: &str = "WinSecurityDesc";
pub const GA_WIN_HAS_ADS: &str = "WinHasADS";
pub const GA_WIN_IS_ADS: &str = "WinIsADS";

/// Whether this platform's restore path knows how to apply the attribute.
pub fn generic_attribute_known_here(name: &str) -> bool {
    #[cfg(windows)]
    {
        matches!(
            name,
            GA_WIN_FILE_ATTRIB
                | GA_WIN_CREATION_TIME
                | GA_WIN_SECURITY_DESC
                | GA_WIN_HAS_ADS
                | GA_WIN_IS_ADS
        )
    }
    #[cfg(not(windows))]
    {
        let _ = name;
        false
    }
}

fn warned_attributes() -> &'static Mutex<HashSet<String>> {
    static WARNED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    WARNED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Emit one warning per unknown generic attribute key per process lifetime.
/// Returns `true` when this call actually warned.
pub fn warn_unknown_generic_attribute(name: &str) -> bool {
    let mut warned = warned_attributes().lock().unwrap();
    if !warned.insert(name.to_string()) {
        return false;
    }
    warn!(attribute = name, "ignoring unrecognized generic attribute (possibly from another platform or a newer version)");
    true
}

/// One filesystem entry inside a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
    Dev,
    Chardev,
    Fifo,
    Socket,
    Irregular,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub mode: u32,
    pub mtime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub inode: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub device_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub links: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linktarget: Option<String>,
    /// Raw link target for byte sequences that are not valid UTF-8; when
    /// present it wins over `linktarget` on decode.
    #[serde(
        with = "crate::serde_util::base64_opt_vec",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub linktarget_raw: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_attributes: Option<Vec<Attribute>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic_attributes: Option<Vec<Attribute>>,
    /// Device number (st_rdev) for dev/chardev nodes.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub device: u64,
    /// Ordered data blob ids making up a file's content.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtree: Option<Id>,
    /// Reportable per-file error recorded by the backup pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Node {
    /// Skeleton node with zeroed metadata (tests, synthetic entries).
    pub fn placeholder(name: &str, kind: NodeKind) -> Node {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        Node {
            name: name.to_string(),
            kind,
            mode: 0,
            mtime: epoch,
            atime: epoch,
            ctime: epoch,
            uid: 0,
            gid: 0,
            user: None,
            group: None,
            inode: 0,
            device_id: 0,
            size: None,
            links: 0,
            linktarget: None,
            linktarget_raw: None,
            extended_attributes: None,
            generic_attributes: None,
            device: 0,
            content: Vec::new(),
            subtree: None,
            error: None,
        }
    }

    /// Build a node from a filesystem entry. Does not read file contents.
    /// `meta` must come from `symlink_metadata` so symlinks are not followed.
    pub fn from_path(path: &Path, meta: &std::fs::Metadata, name: String) -> Result<Node> {
        let kind = kind_from_file_type(&meta.file_type());
        let mut node = Node::placeholder(&name, kind);
        node.name = name;
        fill_platform(&mut node, path, meta, kind)?;
        node.mtime = fix_time(node.mtime);
        node.atime = fix_time(node.atime);
        node.ctime = fix_time(node.ctime);
        Ok(node)
    }

    /// Change detection against the node recorded by the parent snapshot:
    /// same kind, size, mtime, ctime and inode means the content list can be
    /// reused without rechunking.
    pub fn unchanged_from(&self, prev: &Node) -> bool {
        self.kind == prev.kind
            && self.size == prev.size
            && self.mtime == prev.mtime
            && self.ctime == prev.ctime
            && self.inode == prev.inode
    }

    pub fn generic_attribute(&self, name: &str) -> Option<&[u8]> {
        self.generic_attributes
            .as_deref()?
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_slice())
    }

    /// Effective link target bytes; the raw field wins when present.
    pub fn link_target_bytes(&self) -> Option<Vec<u8>> {
        if let Some(raw) = &self.linktarget_raw {
            return Some(raw.clone());
        }
        self.linktarget.as_ref().map(|s| s.as_bytes().to_vec())
    }
}

fn kind_from_file_type(ft: &std::fs::FileType) -> NodeKind {
    if ft.is_file() {
        return NodeKind::File;
    }
    if ft.is_dir() {
        return NodeKind::Dir;
    }
    if ft.is_symlink() {
        return NodeKind::Symlink;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_block_device() {
            return NodeKind::Dev;
        }
        if ft.is_char_device() {
            return NodeKind::Chardev;
        }
        if ft.is_fifo() {
            return NodeKind::Fifo;
        }
        if ft.is_socket() {
            return NodeKind::Socket;
        }
    }
    NodeKind::Irregular
}

#[cfg(unix)]
fn fill_platform(
    node: &mut Node,
    path: &Path,
    meta: &std::fs::Metadata,
    kind: NodeKind,
) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::MetadataExt;

    node.mode = meta.mode() & 0o7777;
    node.uid = meta.uid();
    node.gid = meta.gid();
    node.user = crate::platform::lookup_username(meta.uid());
    node.group = crate::platform::lookup_group(meta.gid());
    node.inode = meta.ino();
    node.device_id = meta.dev();
    node.mtime = timestamp_ns(meta.mtime(), meta.mtime_nsec());
    node.atime = timestamp_ns(meta.atime(), meta.atime_nsec());
    node.ctime = timestamp_ns(meta.ctime(), meta.ctime_nsec());

    match kind {
        NodeKind::File => {
            node.size = Some(meta.len());
            node.links = meta.nlink();
        }
        NodeKind::Symlink => {
            let target = std::fs::read_link(path)?;
            let bytes = target.as_os_str().as_bytes();
            match std::str::from_utf8(bytes) {
                Ok(s) => node.linktarget = Some(s.to_string()),
                Err(_) => {
                    node.linktarget = Some(String::from_utf8_lossy(bytes).into_owned());
                    node.linktarget_raw = Some(bytes.to_vec());
                }
            }
            node.links = meta.nlink();
        }
        NodeKind::Dev | NodeKind::Chardev => {
            node.device = meta.rdev();
            node.links = meta.nlink();
        }
        _ => {}
    }
    Ok(())
}

#[cfg(not(unix))]
fn fill_platform(
    node: &mut Node,
    path: &Path,
    meta: &std::fs::Metadata,
    kind: NodeKind,
) -> Result<()> {
    node.mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };
    if kind == NodeKind::File {
        node.size = Some(meta.len());
    }
    if kind == NodeKind::Symlink {
        let target = std::fs::read_link(path)?;
        node.linktarget = Some(target.to_string_lossy().into_owned());
    }
    if let Ok(modified) = meta.modified() {
        node.mtime = DateTime::<Utc>::from(modified);
        node.ctime = node.mtime;
    }
    if let Ok(accessed) = meta.accessed() {
        node.atime = DateTime::<Utc>::from(accessed);
    }
    Ok(())
}

#[cfg(unix)]
fn timestamp_ns(secs: i64, nsecs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, nsecs as u32)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

/// Clamp a timestamp into the range JSON timestamps can express: years 0
/// through 9999. Only the year is adjusted.
pub fn fix_time(t: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::Datelike;
    let year = t.year();
    if (0..=9999).contains(&year) {
        return t;
    }
    let clamped_year = year.clamp(0, 9999);
    t.with_year(clamped_year)
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

/// Decode a node kind into a summary character (listing helpers).
impl NodeKind {
    pub fn summary_char(&self) -> char {
        match self {
            NodeKind::File => '-',
            NodeKind::Dir => 'd',
            NodeKind::Symlink => 'l',
            NodeKind::Dev => 'b',
            NodeKind::Chardev => 'c',
            NodeKind::Fifo => 'p',
            NodeKind::Socket => 's',
            NodeKind::Irregular => '?',
        }
    }
}

/// Validate a node name: tree entries must be single path components.
pub fn validate_node_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(DavitError::Other(format!("invalid node name '{name}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip_with_omitted_fields() {
        let mut node = Node::placeholder("hello.txt", NodeKind::File);
        node.size = Some(42);
        node.content = vec![Id::hash(b"chunk")];

        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"type\":\"file\""));
        assert!(!json.contains("linktarget"));
        assert!(!json.contains("subtree"));
        assert!(!json.contains("error"));

        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn raw_link_target_wins() {
        let mut node = Node::placeholder("link", NodeKind::Symlink);
        node.linktarget = Some("lossy\u{fffd}".into());
        node.linktarget_raw = Some(vec![0x6c, 0x80, 0xff]);

        let json = serde_json::to_vec(&node).unwrap();
        let back: Node = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.link_target_bytes().unwrap(), vec![0x6c, 0x80, 0xff]);
    }

    #[test]
    fn unknown_generic_attribute_warns_once() {
        let key = format!("FutureAttr-{}", std::process::id());
        assert!(warn_unknown_generic_attribute(&key));
        assert!(!warn_unknown_generic_attribute(&key));
        assert!(!warn_unknown_generic_attribute(&key));
    }

    #[test]
    fn generic_attributes_roundtrip_untouched() {
        let mut node = Node::placeholder("f", NodeKind::File);
        node.generic_attributes = Some(vec![Attribute {
            name: "SomethingNew".into(),
            value: vec![1, 2, 3, 255],
        }]);
        let json = serde_json::to_vec(&node).unwrap();
        let back: Node = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.generic_attribute("SomethingNew").unwrap(), &[1, 2, 3, 255]);
    }

    #[test]
    fn time_clamping() {
        use chrono::Datelike;
        let far_future = Utc.with_ymd_and_hms(12000, 5, 1, 2, 3, 4).unwrap();
        assert_eq!(fix_time(far_future).year(), 9999);
        let ancient = Utc.with_ymd_and_hms(-50, 5, 1, 2, 3, 4).unwrap();
        assert_eq!(fix_time(ancient).year(), 0);
        let normal = Utc.with_ymd_and_hms(2024, 5, 1, 2, 3, 4).unwrap();
        assert_eq!(fix_time(normal), normal);
    }

    #[test]
    fn nanosecond_precision_survives_json() {
        let mut node = Node::placeholder("f", NodeKind::File);
        node.mtime = Utc.timestamp_opt(1_600_000_000, 123_456_789).unwrap();
        let json = serde_json::to_vec(&node).unwrap();
        let back: Node = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.mtime, node.mtime);
    }

    #[test]
    fn name_validation() {
        assert!(validate_node_name("ok.txt").is_ok());
        assert!(validate_node_name("").is_err());
        assert!(validate_node_name(".").is_err());
        assert!(validate_node_name("..").is_err());
        assert!(validate_node_name("a/b").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn from_path_captures_unix_metadata() {
        use std::os::unix::fs::MetadataExt;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("file.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let meta = std::fs::symlink_metadata(&path).unwrap();
        let node = Node::from_path(&path, &meta, "file.bin".into()).unwrap();
        assert_eq!(node.kind, NodeKind::File);
        assert_eq!(node.size, Some(10));
        assert_eq!(node.inode, meta.ino());
        assert_eq!(node.uid, meta.uid());
        assert!(node.links >= 1);
    }
}
