//! Canonical serialization of dirmeta, dirtree, and commit objects,
//! plus the archive-mode file header framing.
//!
//! This is a hand-rolled canonical binary codec, not a reimplementation
//! of GVariant's framing; see `DESIGN.md` for why.

use crate::error::CoreError;
use crate::objects::Checksum;
use crate::xattrs::{self, Xattr};
use std::collections::BTreeMap;

pub(crate) struct Writer(Vec<u8>);

impl Writer {
    pub(crate) fn new() -> Self {
        Self(Vec::new())
    }
    pub(crate) fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    pub(crate) fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    pub(crate) fn bool(&mut self, v: bool) {
        self.0.push(v as u8);
    }
    pub(crate) fn bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.0.extend_from_slice(b);
    }
    pub(crate) fn string(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }
    fn checksum(&mut self, c: &Checksum) {
        self.0.extend_from_slice(c.as_bytes());
    }
    fn xattrs(&mut self, x: &[Xattr]) {
        self.bytes(&xattrs::canonicalize(x.to_vec()));
    }
    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        if self.buf.len() - self.pos < n {
            return Err(CoreError::invalid_format("length exceeds remaining buffer"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CoreError> {
        let s: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(u32::from_be_bytes(s))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, CoreError> {
        let s: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(u64::from_be_bytes(s))
    }

    pub(crate) fn bool(&mut self) -> Result<bool, CoreError> {
        let b = self.take(1)?[0];
        match b {
            0 => Ok(false),
            1 => Ok(true),
            o => Err(CoreError::invalid_format(format!("invalid bool byte {o}"))),
        }
    }

    pub(crate) fn bytes(&mut self) -> Result<Vec<u8>, CoreError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub(crate) fn string(&mut self) -> Result<String, CoreError> {
        let b = self.bytes()?;
        String::from_utf8(b).map_err(|e| CoreError::invalid_format(e.to_string()))
    }

    fn checksum(&mut self) -> Result<Checksum, CoreError> {
        let s: [u8; 32] = self.take(32)?.try_into().unwrap();
        Ok(Checksum::from_bytes(s))
    }

    fn xattrs(&mut self) -> Result<Vec<Xattr>, CoreError> {
        let blob = self.bytes()?;
        decode_xattr_blob(&blob)
    }

    pub(crate) fn remaining(&self) -> bool {
        self.pos < self.buf.len()
    }
}

fn decode_xattr_blob(mut blob: &[u8]) -> Result<Vec<Xattr>, CoreError> {
    let mut out = Vec::new();
    while !blob.is_empty() {
        let nul = blob
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| CoreError::invalid_format("xattr name missing NUL terminator"))?;
        let name = blob[..nul].to_vec();
        blob = &blob[nul + 1..];
        if blob.len() < 4 {
            return Err(CoreError::invalid_format("truncated xattr length"));
        }
        let len = u32::from_be_bytes(blob[..4].try_into().unwrap()) as usize;
        blob = &blob[4..];
        if blob.len() < len {
            return Err(CoreError::invalid_format("xattr value length exceeds buffer"));
        }
        let value = blob[..len].to_vec();
        blob = &blob[len..];
        out.push((name, value));
    }
    Ok(out)
}

/// A parsed directory metadata object: `(uid, gid, mode, xattrs)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirMeta {
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Permission bits, entry bits excluded (entries live in the dirtree).
    pub mode: u32,
    /// Canonicalized (but not yet sorted at this point; sorted on encode) xattrs.
    pub xattrs: Vec<Xattr>,
}

/// Encode a [`DirMeta`] using its fixed field order:
/// `u32be(uid) | u32be(gid) | u32be(mode) | xattrs`.
pub fn encode_dirmeta(meta: &DirMeta) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(meta.uid);
    w.u32(meta.gid);
    w.u32(meta.mode);
    w.xattrs(&meta.xattrs);
    w.into_bytes()
}

/// Decode a [`DirMeta`] produced by [`encode_dirmeta`].
pub fn decode_dirmeta(buf: &[u8]) -> Result<DirMeta, CoreError> {
    let mut r = Reader::new(buf);
    let uid = r.u32()?;
    let gid = r.u32()?;
    let mode = r.u32()?;
    let xattrs = r.xattrs()?;
    Ok(DirMeta { uid, gid, mode, xattrs })
}

/// A parsed directory tree object: `files` and `dirs`, each sorted and
/// deduplicated by name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirTree {
    /// `(name, file checksum)`, sorted by name.
    pub files: Vec<(String, Checksum)>,
    /// `(name, dirtree checksum, dirmeta checksum)`, sorted by name.
    pub dirs: Vec<(String, Checksum, Checksum)>,
}

pub(crate) fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() || name.contains('/') || name.contains('\0') || name == "." || name == ".." {
        return Err(CoreError::invalid_format(format!("invalid tree entry name {name:?}")));
    }
    Ok(())
}

impl DirTree {
    /// Validate the invariants this format requires: non-empty
    /// well-formed names, uniqueness within `files`, within `dirs`, and
    /// across both.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = BTreeMap::new();
        for (name, _) in &self.files {
            validate_name(name)?;
            if seen.insert(name.as_str(), ()).is_some() {
                return Err(CoreError::invalid_format(format!("duplicate name {name}")));
            }
        }
        for (name, _, _) in &self.dirs {
            validate_name(name)?;
            if seen.insert(name.as_str(), ()).is_some() {
                return Err(CoreError::invalid_format(format!("duplicate name {name}")));
            }
        }
        Ok(())
    }
}

/// Encode a [`DirTree`], sorting `files` and `dirs` by name first: any
/// sequence whose semantic is a set sorts by name.
pub fn encode_dirtree(tree: &DirTree) -> Result<Vec<u8>, CoreError> {
    tree.validate()?;
    let mut files = tree.files.clone();
    files.sort_by(|a, b| a.0.cmp(&b.0));
    let mut dirs = tree.dirs.clone();
    dirs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut w = Writer::new();
    w.u32(files.len() as u32);
    for (name, checksum) in &files {
        w.string(name);
        w.checksum(checksum);
    }
    w.u32(dirs.len() as u32);
    for (name, tree_checksum, meta_checksum) in &dirs {
        w.string(name);
        w.checksum(tree_checksum);
        w.checksum(meta_checksum);
    }
    Ok(w.into_bytes())
}

/// Decode a [`DirTree`] produced by [`encode_dirtree`].
pub fn decode_dirtree(buf: &[u8]) -> Result<DirTree, CoreError> {
    let mut r = Reader::new(buf);
    let nfiles = r.u32()? as usize;
    let mut files = Vec::with_capacity(nfiles);
    for _ in 0..nfiles {
        files.push((r.string()?, r.checksum()?));
    }
    let ndirs = r.u32()? as usize;
    let mut dirs = Vec::with_capacity(ndirs);
    for _ in 0..ndirs {
        dirs.push((r.string()?, r.checksum()?, r.checksum()?));
    }
    if r.remaining() {
        return Err(CoreError::invalid_format("trailing bytes after dirtree"));
    }
    let tree = DirTree { files, dirs };
    tree.validate()?;
    Ok(tree)
}

/// A commit's well-known metadata keys, plus an `Other` arm preserving
/// any key this implementation doesn't special-case. Re-expresses what
/// would otherwise be an `a{sv}` envelope as a tagged union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    /// `ostree.composefs.v0`: the composefs image's fsverity digest.
    ComposefsDigest(Vec<u8>),
    /// `ostree.endoflife`: a human-readable end-of-life message.
    EndOfLife(String),
    /// `ostree.source-title`: a human-readable provenance description.
    SourceTitle(String),
    /// Any other key, preserved verbatim as raw bytes for forward
    /// compatibility.
    Other(Vec<u8>),
}

const KEY_COMPOSEFS: &str = "ostree.composefs.v0";
const KEY_ENDOFLIFE: &str = "ostree.endoflife";
const KEY_SOURCE_TITLE: &str = "ostree.source-title";

impl MetadataValue {
    fn tag(&self) -> u32 {
        match self {
            MetadataValue::ComposefsDigest(_) => 0,
            MetadataValue::EndOfLife(_) => 1,
            MetadataValue::SourceTitle(_) => 2,
            MetadataValue::Other(_) => 3,
        }
    }

    fn raw(&self) -> Vec<u8> {
        match self {
            MetadataValue::ComposefsDigest(b) => b.clone(),
            MetadataValue::EndOfLife(s) => s.as_bytes().to_vec(),
            MetadataValue::SourceTitle(s) => s.as_bytes().to_vec(),
            MetadataValue::Other(b) => b.clone(),
        }
    }

    fn from_tag(tag: u32, raw: Vec<u8>) -> Result<Self, CoreError> {
        Ok(match tag {
            0 => MetadataValue::ComposefsDigest(raw),
            1 => MetadataValue::EndOfLife(
                String::from_utf8(raw).map_err(|e| CoreError::invalid_format(e.to_string()))?,
            ),
            2 => MetadataValue::SourceTitle(
                String::from_utf8(raw).map_err(|e| CoreError::invalid_format(e.to_string()))?,
            ),
            3 => MetadataValue::Other(raw),
            o => return Err(CoreError::invalid_format(format!("unknown metadata tag {o}"))),
        })
    }

    /// Construct the typed arm for a well-known key, or `Other` otherwise.
    pub fn for_key(key: &str, raw: Vec<u8>) -> Result<Self, CoreError> {
        Ok(match key {
            KEY_COMPOSEFS => MetadataValue::ComposefsDigest(raw),
            KEY_ENDOFLIFE => {
                MetadataValue::EndOfLife(String::from_utf8(raw).map_err(|e| CoreError::invalid_format(e.to_string()))?)
            }
            KEY_SOURCE_TITLE => {
                MetadataValue::SourceTitle(String::from_utf8(raw).map_err(|e| CoreError::invalid_format(e.to_string()))?)
            }
            _ => MetadataValue::Other(raw),
        })
    }
}

/// A parsed commit object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Metadata map; well-known keys decode to typed arms of
    /// [`MetadataValue`]; unrecognized keys decode untouched.
    pub metadata: Vec<(String, MetadataValue)>,
    /// Parent commit, or `None` for a root commit.
    pub parent: Option<Checksum>,
    /// Related commits (e.g. alternate architectures of the same build).
    pub related: Vec<(String, Checksum)>,
    /// One-line summary.
    pub subject: String,
    /// Free-form extended description.
    pub body: String,
    /// Seconds since the Unix epoch, big-endian on the wire.
    pub timestamp: u64,
    /// Root dirtree checksum.
    pub root_tree: Checksum,
    /// Root dirmeta checksum.
    pub root_meta: Checksum,
}

impl Commit {
    /// Look up a well-known metadata value by key.
    pub fn metadata_get(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// The `ostree.composefs.v0` digest, if present.
    pub fn composefs_digest(&self) -> Option<&[u8]> {
        match self.metadata_get(KEY_COMPOSEFS) {
            Some(MetadataValue::ComposefsDigest(b)) => Some(b.as_slice()),
            _ => None,
        }
    }
}

/// Encode a [`Commit`] in its fixed tuple order.
pub fn encode_commit(commit: &Commit) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(commit.metadata.len() as u32);
    for (key, value) in &commit.metadata {
        w.string(key);
        w.u32(value.tag());
        w.bytes(&value.raw());
    }
    match &commit.parent {
        Some(p) => {
            w.u32(1);
            w.checksum(p);
        }
        None => w.u32(0),
    }
    w.u32(commit.related.len() as u32);
    for (name, checksum) in &commit.related {
        w.string(name);
        w.checksum(checksum);
    }
    w.string(&commit.subject);
    w.string(&commit.body);
    w.u64(commit.timestamp);
    w.checksum(&commit.root_tree);
    w.checksum(&commit.root_meta);
    w.into_bytes()
}

/// Decode a [`Commit`] produced by [`encode_commit`].
pub fn decode_commit(buf: &[u8]) -> Result<Commit, CoreError> {
    let mut r = Reader::new(buf);
    let nmeta = r.u32()? as usize;
    let mut metadata = Vec::with_capacity(nmeta);
    for _ in 0..nmeta {
        let key = r.string()?;
        let tag = r.u32()?;
        let raw = r.bytes()?;
        metadata.push((key, MetadataValue::from_tag(tag, raw)?));
    }
    let has_parent = r.u32()?;
    let parent = match has_parent {
        0 => None,
        1 => Some(r.checksum()?),
        o => return Err(CoreError::invalid_format(format!("invalid parent flag {o}"))),
    };
    let nrelated = r.u32()? as usize;
    let mut related = Vec::with_capacity(nrelated);
    for _ in 0..nrelated {
        related.push((r.string()?, r.checksum()?));
    }
    let subject = r.string()?;
    let body = r.string()?;
    let timestamp = r.u64()?;
    let root_tree = r.checksum()?;
    let root_meta = r.checksum()?;
    if r.remaining() {
        return Err(CoreError::invalid_format("trailing bytes after commit"));
    }
    Ok(Commit {
        metadata,
        parent,
        related,
        subject,
        body,
        timestamp,
        root_tree,
        root_meta,
    })
}

/// The archive-mode file header: `u32be(metadata_len) |
/// metadata(u32,u32,u32,u32,xattrs,u64)` , where the four
/// leading `u32`s are `uid, gid, mode, rdev` and the trailing `u64` is
/// the content length that follows the header.
#[derive(Debug)]
pub struct ArchiveFileHeader {
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Full mode, including file-type bits (unlike the checksum preamble).
    pub mode: u32,
    /// Device number, meaningful only for device nodes.
    pub rdev: u32,
    /// Canonicalized xattrs.
    pub xattrs: Vec<Xattr>,
    /// Length of the content that follows the header (file content or
    /// symlink target bytes).
    pub content_len: u64,
}

/// Encode an [`ArchiveFileHeader`], with its `u32be` length prefix.
pub fn encode_archive_header(h: &ArchiveFileHeader) -> Vec<u8> {
    let mut body = Writer::new();
    body.u32(h.uid);
    body.u32(h.gid);
    body.u32(h.mode);
    body.u32(h.rdev);
    body.xattrs(&h.xattrs);
    body.u64(h.content_len);
    let body = body.into_bytes();
    let mut out = Writer::new();
    out.u32(body.len() as u32);
    out.0.extend_from_slice(&body);
    out.into_bytes()
}

/// Decode an [`ArchiveFileHeader`] from the start of a buffer, returning
/// the header and the number of bytes it consumed.
pub fn decode_archive_header(buf: &[u8]) -> Result<(ArchiveFileHeader, usize), CoreError> {
    let mut outer = Reader::new(buf);
    let metadata_len = outer.u32()? as usize;
    let body = outer.take(metadata_len)?;
    let mut r = Reader::new(body);
    let uid = r.u32()?;
    let gid = r.u32()?;
    let mode = r.u32()?;
    let rdev = r.u32()?;
    let xattrs = r.xattrs()?;
    let content_len = r.u64()?;
    Ok((
        ArchiveFileHeader {
            uid,
            gid,
            mode,
            rdev,
            xattrs,
            content_len,
        },
        4 + metadata_len,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csum(byte: u8) -> Checksum {
        Checksum::from_bytes([byte; 32])
    }

    #[test]
    fn dirmeta_roundtrip() {
        let meta = DirMeta {
            uid: 0,
            gid: 0,
            mode: 0o755,
            xattrs: vec![(b"user.a".to_vec(), b"1".to_vec())],
        };
        let enc = encode_dirmeta(&meta);
        assert_eq!(decode_dirmeta(&enc).unwrap(), meta);
    }

    #[test]
    fn empty_dirtree_roundtrip() {
        let tree = DirTree::default();
        let enc = encode_dirtree(&tree).unwrap();
        assert_eq!(decode_dirtree(&enc).unwrap(), tree);
    }

    #[test]
    fn dirtree_sorts_on_encode() {
        let tree = DirTree {
            files: vec![("b".into(), csum(2)), ("a".into(), csum(1))],
            dirs: vec![],
        };
        let enc = encode_dirtree(&tree).unwrap();
        let decoded = decode_dirtree(&enc).unwrap();
        assert_eq!(decoded.files[0].0, "a");
        assert_eq!(decoded.files[1].0, "b");
    }

    #[test]
    fn dirtree_rejects_duplicate_across_files_and_dirs() {
        let tree = DirTree {
            files: vec![("x".into(), csum(1))],
            dirs: vec![("x".into(), csum(2), csum(3))],
        };
        assert!(encode_dirtree(&tree).is_err());
    }

    #[test]
    fn dirtree_rejects_bad_names() {
        for bad in [".", "..", "a/b", "", "a\0b"] {
            let tree = DirTree {
                files: vec![(bad.into(), csum(1))],
                dirs: vec![],
            };
            assert!(encode_dirtree(&tree).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn commit_roundtrip() {
        let commit = Commit {
            metadata: vec![("ostree.composefs.v0".into(), MetadataValue::ComposefsDigest(vec![1, 2, 3]))],
            parent: Some(csum(9)),
            related: vec![("x86_64".into(), csum(4))],
            subject: "init".into(),
            body: "".into(),
            timestamp: 1700000000,
            root_tree: csum(5),
            root_meta: csum(6),
        };
        let enc = encode_commit(&commit);
        assert_eq!(decode_commit(&enc).unwrap(), commit);
    }

    #[test]
    fn commit_with_no_parent_roundtrips() {
        let commit = Commit {
            metadata: vec![],
            parent: None,
            related: vec![],
            subject: "init".into(),
            body: "".into(),
            timestamp: 0,
            root_tree: csum(0),
            root_meta: csum(0),
        };
        let enc = encode_commit(&commit);
        let decoded = decode_commit(&enc).unwrap();
        assert_eq!(decoded.parent, None);
    }

    #[test]
    fn archive_header_roundtrip() {
        let h = ArchiveFileHeader {
            uid: 1000,
            gid: 1000,
            mode: 0o100644,
            rdev: 0,
            xattrs: vec![],
            content_len: 3,
        };
        let enc = encode_archive_header(&h);
        let (decoded, consumed) = decode_archive_header(&enc).unwrap();
        assert_eq!(consumed, enc.len());
        assert_eq!(decoded.content_len, 3);
        assert_eq!(decoded.mode, 0o100644);
    }

    #[test]
    fn truncated_buffer_is_invalid_format() {
        let meta = DirMeta { uid: 0, gid: 0, mode: 0, xattrs: vec![] };
        let mut enc = encode_dirmeta(&meta);
        enc.truncate(enc.len() - 1);
        assert!(decode_dirmeta(&enc).is_err());
    }
}
