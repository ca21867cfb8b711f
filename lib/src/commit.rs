//! Commit serialization: recursively flush a [`MutableTree`] to the
//! store as dirmeta/dirtree objects, assemble and write the commit
//! tuple, and optionally sign it.
//!
//! Also carries the pre-commit filesystem cleanup a container-derived
//! root needs before committing: recursively clear `run/`, `tmp/`,
//! `var/tmp/`, and `var/cache/`, refusing to cross mount points.

use crate::codec::{Commit, DirTree, MetadataValue};
use crate::error::CoreError;
use crate::mutabletree::MutableTree;
use crate::repo::Repo;
use crate::sign::{self, Signature, SigningKey};
use anyhow::{Context, Result};
use cap_std::fs::Dir;
use cap_std::fs::MetadataExt;
use cap_std_ext::cap_std;
use cap_std_ext::dirext::CapStdExtDirExt;
use std::path::{Path, PathBuf};

/// Directories whose entire contents are always discarded before a
/// commit: transient runtime state a container or chroot leaves behind
/// that has no business being hashed into a tree object.
const FORCE_CLEAN_PATHS: &[&str] = &["run", "tmp", "var/tmp", "var/cache"];

/// Whether a removal failure while clearing a force-clean path aborts
/// the whole pass or is logged and left in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strictness {
    /// Any removal failure is propagated to the caller.
    Strict,
    /// A removal failure is logged via `tracing::warn` and the
    /// offending entry is left uncommitted-clean rather than aborting.
    Tolerant,
}

/// Recursively clear `path`'s contents, refusing to descend into a
/// child on a different device. Returns whether anything under `path`
/// was left behind (a foreign-device child, or — in [`Strictness::Tolerant`]
/// mode — something that failed to remove), in which case `path` itself
/// is left in place rather than removed.
fn clear_subtree(root: &Dir, rootdev: u64, path: &Path, strictness: Strictness) -> Result<bool> {
    let entries = match root.read_dir(path) {
        Ok(entries) => entries,
        Err(e) if strictness == Strictness::Tolerant => {
            tracing::warn!("Leaving {path:?} in place, could not list it: {e}");
            return Ok(true);
        }
        Err(e) => return Err(e).with_context(|| format!("Reading {path:?}")),
    };

    let mut left_behind = false;
    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.dev() != rootdev {
            left_behind = true;
            continue;
        }
        let child = path.join(entry.file_name());
        let result = if metadata.is_dir() {
            clear_subtree(root, rootdev, &child, strictness)
        } else {
            root.remove_file(&child).with_context(|| format!("Removing {child:?}")).map(|()| false)
        };
        match result {
            Ok(child_left_behind) => left_behind |= child_left_behind,
            Err(e) if strictness == Strictness::Tolerant => {
                tracing::warn!("Leaving {child:?} in place: {e:#}");
                left_behind = true;
            }
            Err(e) => return Err(e),
        }
    }
    if !left_behind {
        if let Err(e) = root.remove_dir(path) {
            match strictness {
                Strictness::Tolerant => tracing::warn!("Leaving {path:?} in place: {e}"),
                Strictness::Strict => return Err(e).with_context(|| format!("Removing {path:?}")),
            }
        }
    }
    Ok(left_behind)
}

fn clear_force_clean_dir(root: &Dir, rootdev: u64, strictness: Strictness) -> Result<()> {
    for entry in root.entries()? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let path = PathBuf::from(entry.file_name());
        // A container runtime (or the host) may have injected a foreign
        // mount under here, e.g. podman's /run/.containerenv.
        if metadata.dev() != rootdev {
            tracing::trace!("Skipping entry on foreign device {path:?}");
            continue;
        }
        if root.is_mountpoint(&path)?.unwrap_or_default() {
            tracing::trace!("Skipping mount point {path:?}");
            continue;
        }
        let result = if metadata.is_dir() {
            clear_subtree(root, rootdev, &path, strictness).map(|_| ())
        } else {
            root.remove_file(&path).with_context(|| format!("Removing {path:?}"))
        };
        if let Err(e) = result {
            match strictness {
                Strictness::Tolerant => tracing::warn!("Leaving {path:?} in place: {e:#}"),
                Strictness::Strict => return Err(e),
            }
        }
    }
    Ok(())
}

fn clear_force_clean_paths(root: &Dir, rootdev: u64, strictness: Strictness) -> Result<()> {
    for path in FORCE_CLEAN_PATHS {
        let Some(subdir) = root.open_dir_optional(path)? else {
            continue;
        };
        clear_force_clean_dir(&subdir, rootdev, strictness).with_context(|| format!("Cleaning {path}"))?;
    }
    Ok(())
}

/// Given a candidate commit root, recursively clear `run/`, `tmp/`,
/// `var/tmp/`, and `var/cache/`, refusing to cross mount points. Any
/// removal failure aborts the commit.
pub fn prepare_commit_root(root: &Dir) -> Result<()> {
    let rootdev = root.dir_metadata()?.dev();
    clear_force_clean_paths(root, rootdev, Strictness::Strict)
}

/// Like [`prepare_commit_root`], but a removal failure on one entry
/// (a file a container left immutable, a directory that vanished
/// mid-walk) is logged and that entry is left in the committed tree
/// rather than aborting the whole commit.
pub fn prepare_commit_root_nonstrict(root: &Dir) -> Result<()> {
    let rootdev = root.dir_metadata()?.dev();
    clear_force_clean_paths(root, rootdev, Strictness::Tolerant)
}

/// Recursively flush `node` to the store, writing a dirtree object for
/// it and every descendant. Each node's dirmeta must already be written
/// and cached on it: importers write dirmeta up front and record the
/// checksum via [`MutableTree::set_metadata_checksum`]. Returns
/// `(dirtree checksum, dirmeta checksum)`.
fn serialize_dirtree(repo: &Repo, node: &MutableTree) -> Result<(crate::objects::Checksum, crate::objects::Checksum)> {
    let meta_checksum = node
        .metadata_checksum()
        .ok_or_else(|| CoreError::invalid_format("directory node has no dirmeta checksum set"))?;

    let files = node.files().iter().map(|(name, checksum)| (name.clone(), *checksum)).collect();
    let mut dirs = Vec::with_capacity(node.dirs().len());
    for (name, child) in node.dirs() {
        let (child_tree, child_meta) = serialize_dirtree(repo, child)?;
        dirs.push((name.clone(), child_tree, child_meta));
    }

    let tree_checksum = repo.write_dirtree(&DirTree { files, dirs })?;
    Ok((tree_checksum, meta_checksum))
}

/// Everything but the tree and timestamp needed to assemble a commit.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// The commit this one descends from, if any.
    pub parent: Option<crate::objects::Checksum>,
    /// One-line summary.
    pub subject: String,
    /// Free-form extended description.
    pub body: String,
    /// Well-known or opaque metadata entries.
    pub metadata: Vec<(String, MetadataValue)>,
    /// Related commits (alternate builds of the same logical content).
    pub related: Vec<(String, crate::objects::Checksum)>,
}

/// Serialize `tree` into `repo` and write the resulting commit. The
/// root node's dirmeta must already be set, same
/// as every other node in the tree.
pub fn write_commit(repo: &Repo, tree: &MutableTree, options: CommitOptions) -> Result<crate::objects::Checksum> {
    let (root_tree, root_meta) = serialize_dirtree(repo, tree)?;
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let commit = Commit {
        metadata: options.metadata,
        parent: options.parent,
        related: options.related,
        subject: options.subject,
        body: options.body,
        timestamp,
        root_tree,
        root_meta,
    };
    let checksum = repo.write_commit(&commit)?;
    Ok(checksum)
}

/// Sign a previously-written commit and write the sibling `.commitmeta`
/// file. Signs the commit object's encoded bytes, matching what a
/// verifier re-reads from the store.
pub fn sign_commit(repo: &Repo, commit_checksum: &crate::objects::Checksum, keys: &[SigningKey]) -> Result<Vec<Signature>> {
    let bytes = repo.read_object_bytes(commit_checksum, crate::objects::ObjectType::Commit)?;
    let sigs = sign::sign_with(&bytes, keys)?;
    let commitmeta = sign::encode_commitmeta(&sigs);
    repo.write_commitmeta(commit_checksum, &commitmeta)?;
    Ok(sigs)
}
