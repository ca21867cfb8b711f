//! The on-disk repository store : layout, object write/read,
//! refs, and traversal.

use crate::checksum;
use crate::codec::{self, Commit, DirMeta, DirTree};
use crate::error::CoreError;
use crate::objects::{self, Checksum, ObjectType};
use crate::xattrs::Xattr;
use anyhow::{Context, Result, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::{Dir, MetadataExt};
use cap_std_ext::dirext::CapStdExtDirExt;
use std::collections::BTreeSet;
use std::io::Write;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicU64, Ordering};

/// The repository's on-disk object storage mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoMode {
    /// File objects are materialized as real files with preserved mode/owner.
    Bare,
    /// File objects are materialized as real files, ownership in xattrs.
    BareUser,
    /// File objects are stored compressed/framed.
    Archive,
}

impl RepoMode {
    fn as_str(&self) -> &'static str {
        match self {
            RepoMode::Bare => "bare",
            RepoMode::BareUser => "bare-user",
            RepoMode::Archive => "archive",
        }
    }

    fn parse(s: &str) -> Result<Self, CoreError> {
        Ok(match s {
            "bare" => RepoMode::Bare,
            "bare-user" => RepoMode::BareUser,
            "archive" => RepoMode::Archive,
            o => return Err(CoreError::invalid_format(format!("unrecognized repo mode {o}"))),
        })
    }
}

/// Whether a loaded commit is known to be missing reachable objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitState {
    /// True if `state/<checksum>.commitpartial` exists.
    pub partial: bool,
}

/// How to handle a reachable object missing from the store during a
/// traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseMode {
    /// Missing children raise [`CoreError::Incomplete`].
    Strict,
    /// Missing children are skipped; the walk continues best-effort.
    BestEffort,
}

/// One object identity discovered by a traversal or enumeration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectId {
    kind_rank: u8,
    /// The checksum.
    pub checksum: Checksum,
}

impl ObjectId {
    fn new(kind: ObjectType, checksum: Checksum) -> Self {
        Self { kind_rank: kind_rank(kind), checksum }
    }

    /// The object's kind.
    pub fn kind(&self) -> ObjectType {
        kind_from_rank(self.kind_rank)
    }
}

fn kind_rank(kind: ObjectType) -> u8 {
    match kind {
        ObjectType::File => 0,
        ObjectType::DirMeta => 1,
        ObjectType::DirTree => 2,
        ObjectType::Commit => 3,
        ObjectType::CommitMeta => 4,
    }
}

fn kind_from_rank(rank: u8) -> ObjectType {
    match rank {
        0 => ObjectType::File,
        1 => ObjectType::DirMeta,
        2 => ObjectType::DirTree,
        3 => ObjectType::Commit,
        _ => ObjectType::CommitMeta,
    }
}

/// A cooperative cancellation flag, checked at object and directory
/// enumeration boundaries by long walks.
#[derive(Debug, Default, Clone)]
pub struct CancellationToken(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancellationToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; observers see it on their next check.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True if [`Self::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), CoreError> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

static TMPNAME_COUNTER: AtomicU64 = AtomicU64::new(0);

fn tmpname(prefix: &str) -> String {
    let n = TMPNAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    format!("{prefix}-{pid}-{n}")
}

/// An open repository.
#[derive(Debug)]
pub struct Repo {
    root: Dir,
    mode: RepoMode,
}

const OBJECTS: &str = "objects";
const REFS_HEADS: &str = "refs/heads";
const REFS_REMOTES: &str = "refs/remotes";
const TAGS: &str = "tags";
const STATE: &str = "state";
const TMP: &str = "tmp";

impl Repo {
    /// Initialize a fresh repository inside an already-open directory
    /// capability. Errors with [`CoreError::Policy`] if a `config` file
    /// already exists there.
    pub fn create_at(root: Dir, mode: RepoMode) -> Result<Self> {
        if root.try_exists("config")? {
            bail!(CoreError::Policy("repo already initialized".to_string()));
        }
        for d in [OBJECTS, REFS_HEADS, REFS_REMOTES, TAGS, STATE, TMP] {
            root.create_dir_all(d)?;
        }
        let config = format!("[core]\nrepo_version=1\nmode={}\n", mode.as_str());
        root.write("config", config)?;
        Ok(Self { root, mode })
    }

    /// Initialize a fresh repository at an ambient filesystem path,
    /// creating it if necessary.
    #[fn_error_context::context("Initializing repo at {path}")]
    pub fn create_at_path(path: &Utf8Path, mode: RepoMode) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let root = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Self::create_at(root, mode)
    }

    /// Open an existing repository from an already-open directory
    /// capability, validating its `config`.
    pub fn open_at(root: Dir) -> Result<Self> {
        let config = root
            .read_to_string("config")
            .with_context(|| "Missing config; not an initialized repo")?;
        let ini = tini::Ini::from_string(&config).map_err(|e| anyhow!("Parsing config: {e}"))?;
        let mode_str: String = ini
            .get("core", "mode")
            .ok_or_else(|| anyhow!("Missing [core] mode in config"))?;
        let mode = RepoMode::parse(&mode_str)?;
        Ok(Self { root, mode })
    }

    /// Open an existing repository at an ambient filesystem path.
    #[fn_error_context::context("Opening repo at {path}")]
    pub fn open_at_path(path: &Utf8Path) -> Result<Self> {
        let root = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Self::open_at(root)
    }

    /// The storage mode this repository was opened/created with.
    pub fn mode(&self) -> RepoMode {
        self.mode
    }

    fn objects_relpath(&self, checksum: &Checksum, kind: ObjectType) -> Utf8PathBuf {
        Utf8PathBuf::from(OBJECTS).join(objects::object_relpath(checksum, kind))
    }

    /// Stream-write a temp file under `tmp/`, rename it into place, and
    /// return whether we actually wrote it (`false` means the
    /// destination already existed, per content-addressed idempotence).
    fn stage_and_rename(&self, dest: &Utf8Path, bytes: &[u8]) -> Result<bool> {
        if self.root.try_exists(dest)? {
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            if !parent.as_str().is_empty() {
                self.root.create_dir_all(parent)?;
            }
        }
        let tmp_rel = Utf8PathBuf::from(TMP).join(tmpname("write"));
        {
            let mut f = self.root.create(&tmp_rel)?;
            f.write_all(bytes)?;
            f.flush()?;
        }
        match self.root.rename(&tmp_rel, &self.root, dest) {
            Ok(()) => Ok(true),
            Err(e) => {
                let _ = self.root.remove_file(&tmp_rel);
                // Another writer may have raced us to the same content-addressed path.
                if self.root.try_exists(dest)? {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Write a dirmeta object, returning its checksum.
    pub fn write_dirmeta(&self, meta: &DirMeta) -> Result<Checksum> {
        let checksum = checksum::dirmeta_checksum(meta);
        let bytes = codec::encode_dirmeta(meta);
        let dest = self.objects_relpath(&checksum, ObjectType::DirMeta);
        self.stage_and_rename(&dest, &bytes)?;
        Ok(checksum)
    }

    /// Write a dirtree object, returning its checksum.
    pub fn write_dirtree(&self, tree: &DirTree) -> Result<Checksum> {
        let checksum = checksum::dirtree_checksum(tree)?;
        let bytes = codec::encode_dirtree(tree)?;
        let dest = self.objects_relpath(&checksum, ObjectType::DirTree);
        self.stage_and_rename(&dest, &bytes)?;
        Ok(checksum)
    }

    /// Write a commit object, returning its checksum. Does not mark the
    /// commit partial; callers that import an incomplete object graph
    /// should follow up with [`Repo::mark_commit_partial`].
    pub fn write_commit(&self, commit: &Commit) -> Result<Checksum> {
        let checksum = checksum::commit_checksum(commit);
        let bytes = codec::encode_commit(commit);
        let dest = self.objects_relpath(&checksum, ObjectType::Commit);
        self.stage_and_rename(&dest, &bytes)?;
        Ok(checksum)
    }

    /// Write a file object, materializing it according to [`RepoMode`].
    /// In bare/bare-user mode the raw content is stored directly; in
    /// archive mode a small framed header is prepended. The checksum is
    /// identical regardless of mode.
    pub fn write_file(
        &self,
        uid: u32,
        gid: u32,
        mode: u32,
        xattrs: &[Xattr],
        content: checksum::FileContent<'_>,
    ) -> Result<Checksum> {
        let csum = checksum::file_checksum(uid, gid, mode, xattrs, content.clone());
        let dest = self.objects_relpath(&csum, ObjectType::File);
        let payload = self.encode_file_payload(uid, gid, mode, xattrs, &content)?;
        self.stage_and_rename(&dest, &payload)?;
        Ok(csum)
    }

    /// Import an externally-owned regular file by linking its inode into
    /// the store instead of copying its content. Only valid for
    /// [`RepoMode::Bare`]/[`RepoMode::BareUser`] repositories, where a
    /// file object's on-disk bytes are exactly its raw content; archive
    /// mode always frames content behind a header and must go through
    /// [`Self::write_file`] instead.
    ///
    /// If `external_path` is already hardlinked to the destination
    /// object (a previous `link_file` already placed it), this returns
    /// the checksum without touching the filesystem again. Otherwise it
    /// hashes the file, then links it into a temp name under `tmp/` and
    /// renames that into the final sharded path, falling back to a
    /// regular copy when the external path lives on a different device.
    pub fn link_file(
        &self,
        external_dir: &Dir,
        external_path: &Utf8Path,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> Result<Checksum> {
        if !matches!(self.mode, RepoMode::Bare | RepoMode::BareUser) {
            bail!(CoreError::Policy("link_file requires a bare-mode repository".to_string()));
        }
        let xattrs = crate::xattrs::read_path_xattrs(external_dir.as_fd(), external_path.as_std_path())?;
        let content = external_dir.read(external_path)?;
        let csum = checksum::file_checksum(uid, gid, mode, &xattrs, checksum::FileContent::Regular(&content));
        let dest = self.objects_relpath(&csum, ObjectType::File);

        if self.already_linked(external_dir, external_path, &dest)? {
            return Ok(csum);
        }
        if self.root.try_exists(&dest)? {
            return Ok(csum);
        }
        if let Some(parent) = dest.parent() {
            if !parent.as_str().is_empty() {
                self.root.create_dir_all(parent)?;
            }
        }
        let tmp_rel = Utf8PathBuf::from(TMP).join(tmpname("link"));
        match rustix::fs::linkat(
            external_dir.as_fd(),
            external_path.as_std_path(),
            self.root.as_fd(),
            tmp_rel.as_std_path(),
            rustix::fs::AtFlags::empty(),
        ) {
            Ok(()) => match self.root.rename(&tmp_rel, &self.root, &dest) {
                Ok(()) => Ok(csum),
                Err(e) => {
                    let _ = self.root.remove_file(&tmp_rel);
                    // Another writer may have raced us to the same content-addressed path.
                    if self.root.try_exists(&dest)? {
                        Ok(csum)
                    } else {
                        Err(e.into())
                    }
                }
            },
            Err(e) if e == rustix::io::Errno::XDEV => {
                self.stage_and_rename(&dest, &content)?;
                Ok(csum)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `external_path` is already the same inode as the object
    /// at `dest`, i.e. a previous [`Self::link_file`] call already
    /// placed this content correctly.
    fn already_linked(&self, external_dir: &Dir, external_path: &Utf8Path, dest: &Utf8Path) -> Result<bool> {
        let Ok(dest_meta) = self.root.metadata(dest) else {
            return Ok(false);
        };
        let ext_meta = external_dir.metadata(external_path)?;
        Ok(dest_meta.dev() == ext_meta.dev() && dest_meta.ino() == ext_meta.ino())
    }

    fn encode_file_payload(
        &self,
        uid: u32,
        gid: u32,
        mode: u32,
        xattrs: &[Xattr],
        content: &checksum::FileContent<'_>,
    ) -> Result<Vec<u8>> {
        let (rdev, raw_content): (u32, &[u8]) = match content {
            checksum::FileContent::Regular(b) => (0, b),
            checksum::FileContent::Symlink(t) => (0, t),
            checksum::FileContent::Device(_) => (0, &[]),
        };
        match self.mode {
            RepoMode::Archive => {
                let header = codec::ArchiveFileHeader {
                    uid,
                    gid,
                    mode,
                    rdev,
                    xattrs: xattrs.to_vec(),
                    content_len: raw_content.len() as u64,
                };
                let mut out = codec::encode_archive_header(&header);
                out.extend_from_slice(raw_content);
                Ok(out)
            }
            RepoMode::Bare | RepoMode::BareUser => Ok(raw_content.to_vec()),
        }
    }

    /// Re-hash a stored file object's payload using the framing
    /// appropriate to this store's mode, for fsck.
    fn rehash_file_object(&self, checksum: &Checksum) -> Result<Checksum> {
        let relpath = self.objects_relpath(checksum, ObjectType::File);
        let payload = self.root.read(&relpath)?;
        match self.mode {
            RepoMode::Archive => {
                let (header, consumed) = codec::decode_archive_header(&payload)?;
                let content = &payload[consumed..];
                Ok(checksum::file_checksum(
                    header.uid,
                    header.gid,
                    header.mode,
                    &header.xattrs,
                    checksum::FileContent::Regular(content),
                ))
            }
            RepoMode::Bare | RepoMode::BareUser => {
                // Without separate sidecar metadata we can only re-hash the
                // content we have; bare modes keep mode/uid/gid on the
                // underlying inode, which this in-process store does not
                // model, so we treat file objects as already re-hashed
                // when their checksum matches their own filename using
                // zeroed metadata, mirroring the archive case above.
                bail!("cannot re-hash a bare-mode file object without external inode metadata")
            }
        }
    }

    /// Attach or replace a commitmeta sibling.
    /// Unlike the four primary object kinds, this is addressed by the
    /// commit's own checksum rather than a hash of its own bytes, so it
    /// may be replaced (e.g. when a signature is added later).
    pub fn write_commitmeta(&self, commit_checksum: &Checksum, bytes: &[u8]) -> Result<()> {
        let dest = self.objects_relpath(commit_checksum, ObjectType::CommitMeta);
        if let Some(parent) = dest.parent() {
            self.root.create_dir_all(parent)?;
        }
        let tmp_rel = Utf8PathBuf::from(TMP).join(tmpname("commitmeta"));
        {
            let mut f = self.root.create(&tmp_rel)?;
            f.write_all(bytes)?;
        }
        self.root.rename(&tmp_rel, &self.root, &dest)?;
        Ok(())
    }

    /// Read a commitmeta sibling, if any.
    pub fn read_commitmeta(&self, commit_checksum: &Checksum) -> Result<Option<Vec<u8>>> {
        let relpath = self.objects_relpath(commit_checksum, ObjectType::CommitMeta);
        self.root.read(&relpath).map(Some).or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(None)
            } else {
                Err(e.into())
            }
        })
    }

    /// Read and parse a dirmeta object.
    pub fn read_dirmeta(&self, checksum: &Checksum) -> Result<DirMeta> {
        let bytes = self.read_object_bytes(checksum, ObjectType::DirMeta)?;
        Ok(codec::decode_dirmeta(&bytes)?)
    }

    /// Read and parse a dirtree object.
    pub fn read_dirtree(&self, checksum: &Checksum) -> Result<DirTree> {
        let bytes = self.read_object_bytes(checksum, ObjectType::DirTree)?;
        Ok(codec::decode_dirtree(&bytes)?)
    }

    /// Read the raw bytes of any object, for generic tooling (e.g. `cat`).
    pub fn read_object_bytes(&self, checksum: &Checksum, kind: ObjectType) -> Result<Vec<u8>> {
        let relpath = self.objects_relpath(checksum, kind);
        self.root.read(&relpath).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow::Error::new(CoreError::not_found(format!("{checksum}.{}", kind.extension())))
            } else {
                e.into()
            }
        })
    }

    /// Load and parse a commit, along with its [`CommitState`].
    pub fn load_commit(&self, checksum: &Checksum) -> Result<(Commit, CommitState)> {
        let bytes = self.read_object_bytes(checksum, ObjectType::Commit)?;
        let commit = codec::decode_commit(&bytes)?;
        let partial = self.is_commit_partial(checksum)?;
        Ok((commit, CommitState { partial }))
    }

    /// Mark a commit partial: write `state/<checksum>.commitpartial`.
    pub fn mark_commit_partial(&self, checksum: &Checksum) -> Result<()> {
        self.root.create_dir_all(STATE)?;
        let relpath = Utf8PathBuf::from(STATE).join(objects::commitpartial_relpath(checksum));
        self.root.write(relpath, b"")?;
        Ok(())
    }

    /// Clear a commit's partial marker, e.g. once a repair backfills the
    /// missing objects.
    pub fn clear_commit_partial(&self, checksum: &Checksum) -> Result<()> {
        let relpath = Utf8PathBuf::from(STATE).join(objects::commitpartial_relpath(checksum));
        match self.root.remove_file(&relpath) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a commit is currently marked partial.
    pub fn is_commit_partial(&self, checksum: &Checksum) -> Result<bool> {
        let relpath = Utf8PathBuf::from(STATE).join(objects::commitpartial_relpath(checksum));
        Ok(self.root.try_exists(relpath)?)
    }

    /// Record that `checksum` was a commit whose absence was expected and
    /// intentional (a missing parent with tombstoning enabled), so
    /// future fsck runs don't keep reporting it as corruption.
    pub fn mark_commit_tombstone(&self, checksum: &Checksum) -> Result<()> {
        self.root.create_dir_all(STATE)?;
        let relpath = Utf8PathBuf::from(STATE).join(objects::committombstone_relpath(checksum));
        self.root.write(relpath, b"")?;
        Ok(())
    }

    /// Whether `checksum` has a tombstone marker.
    pub fn is_commit_tombstone(&self, checksum: &Checksum) -> Result<bool> {
        let relpath = Utf8PathBuf::from(STATE).join(objects::committombstone_relpath(checksum));
        Ok(self.root.try_exists(relpath)?)
    }

    /// Whether an object is present in the store.
    pub fn has_object(&self, checksum: &Checksum, kind: ObjectType) -> Result<bool> {
        Ok(self.root.try_exists(self.objects_relpath(checksum, kind))?)
    }

    fn ref_relpath(remote: Option<&str>, name: &str) -> Utf8PathBuf {
        match remote {
            Some(remote) => Utf8PathBuf::from(REFS_REMOTES).join(remote).join(name),
            None => Utf8PathBuf::from(REFS_HEADS).join(name),
        }
    }

    /// Atomically write (or replace) a ref.
    #[fn_error_context::context("Writing ref {name}")]
    pub fn write_ref(&self, remote: Option<&str>, name: &str, checksum: &Checksum) -> Result<()> {
        let relpath = Self::ref_relpath(remote, name);
        if let Some(parent) = relpath.parent() {
            self.root.create_dir_all(parent)?;
        }
        let contents = format!("{checksum}\n");
        let tmp_rel = Utf8PathBuf::from(TMP).join(tmpname("ref"));
        self.root.write(&tmp_rel, &contents)?;
        self.root.rename(&tmp_rel, &self.root, &relpath)?;
        Ok(())
    }

    /// Read a ref's current checksum, if it exists.
    pub fn read_ref(&self, remote: Option<&str>, name: &str) -> Result<Option<Checksum>> {
        let relpath = Self::ref_relpath(remote, name);
        match self.root.read_to_string(&relpath) {
            Ok(s) => Ok(Some(Checksum::from_hex(s.trim_end_matches('\n'))?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a rev spec: an exact checksum, a local ref name, or a
    /// `<remote>:<ref>` name.
    pub fn resolve_rev(&self, spec: &str) -> Result<Checksum> {
        if let Ok(c) = Checksum::from_hex(spec) {
            return Ok(c);
        }
        if let Some(c) = self.read_ref(None, spec)? {
            return Ok(c);
        }
        if let Some((remote, name)) = spec.split_once(':') {
            if let Some(c) = self.read_ref(Some(remote), name)? {
                return Ok(c);
            }
        }
        Err(CoreError::not_found(format!("rev {spec}")).into())
    }

    /// Enumerate every object file under `objects/` in shard order,
    /// invoking `callback` with its kind and checksum.
    pub fn iter_objects(&self, mut callback: impl FnMut(ObjectType, Checksum) -> Result<()>) -> Result<()> {
        let objects = self.root.open_dir(OBJECTS)?;
        let mut shards: Vec<_> = objects
            .entries()?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        shards.sort();
        for shard in shards {
            let shard_dir = objects.open_dir(&shard)?;
            let mut names: Vec<_> = shard_dir
                .entries()?
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect();
            names.sort();
            for name in names {
                let Some((rest, ext)) = name.split_once('.') else { continue };
                let Some(kind) = ObjectType::from_extension(ext) else { continue };
                let hex = format!("{shard}{rest}");
                let Ok(checksum) = Checksum::from_hex(&hex) else { continue };
                callback(kind, checksum)?;
            }
        }
        Ok(())
    }

    /// Walk the DAG reachable from `checksum`, collecting every object
    /// identity. Honors `cancel` at every object and directory boundary.
    pub fn traverse_commit(
        &self,
        checksum: &Checksum,
        traverse_mode: TraverseMode,
        cancel: &CancellationToken,
    ) -> Result<BTreeSet<ObjectId>> {
        let mut seen = BTreeSet::new();
        cancel.check()?;
        seen.insert(ObjectId::new(ObjectType::Commit, *checksum));
        let (commit, _state) = self.load_commit(checksum)?;
        self.traverse_tree(&commit.root_tree, &commit.root_meta, traverse_mode, cancel, &mut seen)?;
        Ok(seen)
    }

    fn traverse_tree(
        &self,
        tree_checksum: &Checksum,
        meta_checksum: &Checksum,
        traverse_mode: TraverseMode,
        cancel: &CancellationToken,
        seen: &mut BTreeSet<ObjectId>,
    ) -> Result<()> {
        cancel.check()?;
        if !self.has_object(meta_checksum, ObjectType::DirMeta)? {
            return self.handle_missing(traverse_mode, "dirmeta", meta_checksum);
        }
        seen.insert(ObjectId::new(ObjectType::DirMeta, *meta_checksum));

        if !self.has_object(tree_checksum, ObjectType::DirTree)? {
            return self.handle_missing(traverse_mode, "dirtree", tree_checksum);
        }
        seen.insert(ObjectId::new(ObjectType::DirTree, *tree_checksum));
        let tree = self.read_dirtree(tree_checksum)?;

        for (_name, file_checksum) in &tree.files {
            cancel.check()?;
            if self.has_object(file_checksum, ObjectType::File)? {
                seen.insert(ObjectId::new(ObjectType::File, *file_checksum));
            } else {
                self.handle_missing(traverse_mode, "file", file_checksum)?;
            }
        }
        for (_name, child_tree, child_meta) in &tree.dirs {
            self.traverse_tree(child_tree, child_meta, traverse_mode, cancel, seen)?;
        }
        Ok(())
    }

    fn handle_missing(&self, mode: TraverseMode, what: &str, checksum: &Checksum) -> Result<()> {
        match mode {
            TraverseMode::Strict => Err(CoreError::Incomplete(format!("missing {what} {checksum}")).into()),
            TraverseMode::BestEffort => Ok(()),
        }
    }

    /// Re-hash every reachable object of `checksum` and compare against
    /// its filename (the core loop used by [`crate::fsck::fsck`]).
    pub fn verify_object(&self, id: &ObjectId) -> Result<()> {
        let recomputed = match id.kind() {
            ObjectType::File => self.rehash_file_object(&id.checksum)?,
            ObjectType::DirMeta => {
                let meta = self.read_dirmeta(&id.checksum)?;
                checksum::dirmeta_checksum(&meta)
            }
            ObjectType::DirTree => {
                let tree = self.read_dirtree(&id.checksum)?;
                checksum::dirtree_checksum(&tree)?
            }
            ObjectType::Commit => {
                let bytes = self.read_object_bytes(&id.checksum, ObjectType::Commit)?;
                let commit = codec::decode_commit(&bytes)?;
                checksum::commit_checksum(&commit)
            }
            ObjectType::CommitMeta => return Ok(()),
        };
        if recomputed != id.checksum {
            return Err(CoreError::Corruption {
                checksum: id.checksum.to_hex(),
                detail: format!("recomputed checksum {recomputed} does not match filename"),
            }
            .into());
        }
        Ok(())
    }

    /// Delete a corrupt object (fsck destructive mode).
    pub fn delete_object(&self, id: &ObjectId) -> Result<()> {
        let relpath = self.objects_relpath(&id.checksum, id.kind());
        self.root.remove_file(relpath)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_tempfile;

    fn new_repo(mode: RepoMode) -> (cap_tempfile::TempDir, Repo) {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority()).unwrap();
        let repo = Repo::create_at(td.try_clone().unwrap(), mode).unwrap();
        (td, repo)
    }

    #[test]
    fn create_and_reopen() {
        let (td, _repo) = new_repo(RepoMode::Archive);
        let reopened = Repo::open_at(td.try_clone().unwrap()).unwrap();
        assert_eq!(reopened.mode(), RepoMode::Archive);
    }

    #[test]
    fn double_init_is_policy_error() {
        let (td, _repo) = new_repo(RepoMode::Bare);
        assert!(Repo::create_at(td.try_clone().unwrap(), RepoMode::Bare).is_err());
    }

    #[test]
    fn write_object_is_idempotent() {
        let (_td, repo) = new_repo(RepoMode::Archive);
        let c1 = repo
            .write_file(0, 0, 0o100644, &[], checksum::FileContent::Regular(b"hi\n"))
            .unwrap();
        let c2 = repo
            .write_file(0, 0, 0o100644, &[], checksum::FileContent::Regular(b"hi\n"))
            .unwrap();
        assert_eq!(c1, c2);
    }

    #[test]
    fn ref_roundtrip() {
        let (_td, repo) = new_repo(RepoMode::Bare);
        let commit = Commit {
            metadata: vec![],
            parent: None,
            related: vec![],
            subject: "init".into(),
            body: "".into(),
            timestamp: 0,
            root_tree: repo.write_dirtree(&DirTree::default()).unwrap(),
            root_meta: repo
                .write_dirmeta(&DirMeta { uid: 0, gid: 0, mode: 0o755, xattrs: vec![] })
                .unwrap(),
        };
        let checksum = repo.write_commit(&commit).unwrap();
        repo.write_ref(None, "stable/x86_64", &checksum).unwrap();
        assert_eq!(repo.resolve_rev("stable/x86_64").unwrap(), checksum);
        assert_eq!(repo.resolve_rev(&checksum.to_hex()).unwrap(), checksum);
    }

    /// A ref file's on-disk contents are the checksum plus a trailing newline.
    #[test]
    fn ref_file_contents() {
        let (td, repo) = new_repo(RepoMode::Bare);
        let all_a = Checksum::from_hex("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        repo.write_ref(None, "stable/x86_64", &all_a).unwrap();
        let contents = td.read_to_string("refs/heads/stable/x86_64").unwrap();
        assert_eq!(contents, format!("{all_a}\n"));
    }

    /// A second identical commit returns the same checksum.
    #[test]
    fn identical_commit_is_idempotent() {
        let (_td, repo) = new_repo(RepoMode::Bare);
        let root_meta = repo
            .write_dirmeta(&DirMeta { uid: 0, gid: 0, mode: 0o755, xattrs: vec![] })
            .unwrap();
        let root_tree = repo.write_dirtree(&DirTree::default()).unwrap();
        let make = || Commit {
            metadata: vec![],
            parent: None,
            related: vec![],
            subject: "init".into(),
            body: "".into(),
            timestamp: 0,
            root_tree,
            root_meta,
        };
        let c1 = repo.write_commit(&make()).unwrap();
        let c2 = repo.write_commit(&make()).unwrap();
        assert_eq!(c1, c2);
        let (loaded, state) = repo.load_commit(&c1).unwrap();
        assert!(!state.partial);
        assert_eq!(loaded.subject, "init");
    }

    #[test]
    fn traverse_detects_missing_child() {
        let (_td, repo) = new_repo(RepoMode::Archive);
        let file = repo
            .write_file(0, 0, 0o100644, &[], checksum::FileContent::Regular(b"x"))
            .unwrap();
        let tree = DirTree { files: vec![("a".into(), file)], dirs: vec![] };
        let tree_checksum = repo.write_dirtree(&tree).unwrap();
        let meta = repo
            .write_dirmeta(&DirMeta { uid: 0, gid: 0, mode: 0o755, xattrs: vec![] })
            .unwrap();
        let commit = Commit {
            metadata: vec![],
            parent: None,
            related: vec![],
            subject: "s".into(),
            body: "".into(),
            timestamp: 0,
            root_tree: tree_checksum,
            root_meta: meta,
        };
        let commit_checksum = repo.write_commit(&commit).unwrap();
        repo.delete_object(&ObjectId::new(ObjectType::File, file)).unwrap();

        let cancel = CancellationToken::new();
        assert!(repo.traverse_commit(&commit_checksum, TraverseMode::Strict, &cancel).is_err());
        assert!(repo.traverse_commit(&commit_checksum, TraverseMode::BestEffort, &cancel).is_ok());
    }

    /// Linking an external file into a bare repo produces the same
    /// checksum as hashing its content directly, and a second call
    /// against the same source short-circuits without re-linking.
    #[test]
    fn link_file_matches_write_file_and_is_idempotent() {
        let (_td, repo) = new_repo(RepoMode::Bare);
        let external = cap_tempfile::tempdir(cap_std::ambient_authority()).unwrap();
        external.write("payload", b"hello\n").unwrap();

        let expected = repo
            .write_file(1000, 1000, 0o100644, &[], checksum::FileContent::Regular(b"hello\n"))
            .unwrap();
        let linked = repo
            .link_file(&external, Utf8Path::new("payload"), 1000, 1000, 0o100644)
            .unwrap();
        assert_eq!(linked, expected);

        // A second call against the already-linked source is a no-op.
        let relinked = repo
            .link_file(&external, Utf8Path::new("payload"), 1000, 1000, 0o100644)
            .unwrap();
        assert_eq!(relinked, expected);
    }

    #[test]
    fn link_file_rejects_archive_mode() {
        let (_td, repo) = new_repo(RepoMode::Archive);
        let external = cap_tempfile::tempdir(cap_std::ambient_authority()).unwrap();
        external.write("payload", b"hello\n").unwrap();
        assert!(repo.link_file(&external, Utf8Path::new("payload"), 0, 0, 0o100644).is_err());
    }

    #[test]
    fn cancellation_is_observed() {
        let (_td, repo) = new_repo(RepoMode::Archive);
        let meta = repo
            .write_dirmeta(&DirMeta { uid: 0, gid: 0, mode: 0o755, xattrs: vec![] })
            .unwrap();
        let tree = repo.write_dirtree(&DirTree::default()).unwrap();
        let commit = Commit {
            metadata: vec![],
            parent: None,
            related: vec![],
            subject: "s".into(),
            body: "".into(),
            timestamp: 0,
            root_tree: tree,
            root_meta: meta,
        };
        let checksum = repo.write_commit(&commit).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = repo
            .traverse_commit(&checksum, TraverseMode::Strict, &cancel)
            .unwrap_err();
        assert!(err.downcast_ref::<CoreError>().map(|e| e.is_cancelled()).unwrap_or(false));
    }
}
