//! Repository consistency checking : for every commit, walk
//! its reachable object set, re-hash each one against its filename, and
//! either report or repair what doesn't match.

use crate::error::CoreError;
use crate::objects::{Checksum, ObjectType};
use crate::repo::{CancellationToken, ObjectId, Repo, TraverseMode};
use anyhow::Result;

/// Whether a mismatched object is deleted on sight or left in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsckMode {
    /// Corrupt objects are reported but kept.
    ReportOnly,
    /// Corrupt objects are deleted as they're found.
    Destructive,
}

/// Whether a commit whose parent is missing gets a tombstone marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstonePolicy {
    /// Missing parents are reported as incomplete commits, nothing more.
    Disabled,
    /// A missing parent gets a `committombstone` marker so later runs
    /// stop reporting it.
    Enabled,
}

/// One discrepancy found by [`fsck`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// A reachable object's content didn't hash to its filename.
    Corrupt {
        /// The commit this object was reachable from.
        commit: Checksum,
        /// The corrupt object's identity.
        object: ObjectId,
        /// What went wrong recomputing its checksum.
        detail: String,
    },
    /// A commit's parent checksum isn't present in the store.
    MissingParent {
        /// The commit with the missing parent.
        commit: Checksum,
        /// The missing parent's checksum.
        parent: Checksum,
        /// Whether a tombstone marker was written for `parent`.
        tombstoned: bool,
    },
    /// A commit reported partial by its `commitpartial` marker; skipped.
    Partial {
        /// The partial commit's checksum.
        commit: Checksum,
    },
    /// Destructive mode removed an object reachable from this commit,
    /// leaving it short of its full object graph.
    Incomplete {
        /// The commit left incomplete by the deletion.
        commit: Checksum,
    },
}

/// The outcome of a full repository pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    /// Every discrepancy found, in commit enumeration order.
    pub findings: Vec<Finding>,
    /// How many corrupt objects were deleted (always 0 in report-only mode).
    pub deleted: usize,
}

impl Report {
    /// True if every commit in the repository was fully intact.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Walk every commit in `repo`, verifying its reachable objects.
/// Partial commits are reported but not content-verified. A missing
/// parent is reported, and tombstoned if `tombstones` allows it.
pub fn fsck(
    repo: &Repo,
    mode: FsckMode,
    tombstones: TombstonePolicy,
    cancel: &CancellationToken,
) -> Result<Report> {
    let mut commits = Vec::new();
    repo.iter_objects(|kind, checksum| {
        if kind == ObjectType::Commit {
            commits.push(checksum);
        }
        Ok(())
    })?;

    let mut report = Report::default();
    for commit_checksum in commits {
        fsck_one(repo, &commit_checksum, mode, tombstones, cancel, &mut report)?;
    }
    Ok(report)
}

fn fsck_one(
    repo: &Repo,
    commit_checksum: &Checksum,
    mode: FsckMode,
    tombstones: TombstonePolicy,
    cancel: &CancellationToken,
    report: &mut Report,
) -> Result<()> {
    if repo.is_commit_partial(commit_checksum)? {
        report.findings.push(Finding::Partial { commit: *commit_checksum });
        return Ok(());
    }

    let (commit, _state) = repo.load_commit(commit_checksum)?;
    if let Some(parent) = commit.parent {
        if !repo.has_object(&parent, ObjectType::Commit)? {
            let tombstoned = matches!(tombstones, TombstonePolicy::Enabled);
            if tombstoned {
                repo.mark_commit_tombstone(&parent)?;
            }
            report.findings.push(Finding::MissingParent { commit: *commit_checksum, parent, tombstoned });
        }
    }

    let reachable = repo.traverse_commit(commit_checksum, TraverseMode::BestEffort, cancel)?;
    let mut left_incomplete = false;
    for object in reachable {
        match repo.verify_object(&object) {
            Ok(()) => {}
            Err(e) => {
                let detail = match e.downcast_ref::<CoreError>() {
                    Some(CoreError::Corruption { detail, .. }) => detail.clone(),
                    _ => e.to_string(),
                };
                if mode == FsckMode::Destructive {
                    repo.delete_object(&object)?;
                    report.deleted += 1;
                    left_incomplete = true;
                }
                report.findings.push(Finding::Corrupt { commit: *commit_checksum, object, detail });
            }
        }
    }
    if left_incomplete {
        repo.mark_commit_partial(commit_checksum)?;
        report.findings.push(Finding::Incomplete { commit: *commit_checksum });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::codec::{Commit, DirMeta, DirTree};
    use crate::repo::RepoMode;
    use cap_std_ext::cap_std;
    use cap_std_ext::cap_tempfile;

    fn new_repo() -> (cap_tempfile::TempDir, Repo) {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority()).unwrap();
        let repo = Repo::create_at(td.try_clone().unwrap(), RepoMode::Archive).unwrap();
        (td, repo)
    }

    fn empty_commit(repo: &Repo, subject: &str, parent: Option<Checksum>) -> Checksum {
        let root_meta = repo.write_dirmeta(&DirMeta { uid: 0, gid: 0, mode: 0o755, xattrs: vec![] }).unwrap();
        let root_tree = repo.write_dirtree(&DirTree::default()).unwrap();
        let commit = Commit {
            metadata: vec![],
            parent,
            related: vec![],
            subject: subject.into(),
            body: String::new(),
            timestamp: 0,
            root_tree,
            root_meta,
        };
        repo.write_commit(&commit).unwrap()
    }

    #[test]
    fn clean_repo_has_no_findings() {
        let (_td, repo) = new_repo();
        empty_commit(&repo, "init", None);
        let report = fsck(&repo, FsckMode::ReportOnly, TombstonePolicy::Disabled, &CancellationToken::new()).unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn corrupt_file_object_is_reported() {
        let (td, repo) = new_repo();
        let file = repo.write_file(0, 0, 0o100644, &[], checksum::FileContent::Regular(b"hi")).unwrap();
        let tree = DirTree { files: vec![("a".into(), file)], dirs: vec![] };
        let tree_checksum = repo.write_dirtree(&tree).unwrap();
        let meta = repo.write_dirmeta(&DirMeta { uid: 0, gid: 0, mode: 0o755, xattrs: vec![] }).unwrap();
        let commit = Commit {
            metadata: vec![],
            parent: None,
            related: vec![],
            subject: "s".into(),
            body: String::new(),
            timestamp: 0,
            root_tree: tree_checksum,
            root_meta: meta,
        };
        let commit_checksum = repo.write_commit(&commit).unwrap();

        let relpath = crate::objects::object_relpath(&file, ObjectType::File);
        td.write(format!("objects/{relpath}"), b"corrupted").unwrap();

        let report = fsck(&repo, FsckMode::ReportOnly, TombstonePolicy::Disabled, &CancellationToken::new()).unwrap();
        assert_eq!(report.deleted, 0);
        assert!(report.findings.iter().any(|f| matches!(f, Finding::Corrupt { commit, .. } if *commit == commit_checksum)));
    }

    #[test]
    fn destructive_mode_deletes_corrupt_objects() {
        let (td, repo) = new_repo();
        let file = repo.write_file(0, 0, 0o100644, &[], checksum::FileContent::Regular(b"hi")).unwrap();
        let tree = DirTree { files: vec![("a".into(), file)], dirs: vec![] };
        let tree_checksum = repo.write_dirtree(&tree).unwrap();
        let meta = repo.write_dirmeta(&DirMeta { uid: 0, gid: 0, mode: 0o755, xattrs: vec![] }).unwrap();
        let commit = Commit {
            metadata: vec![],
            parent: None,
            related: vec![],
            subject: "s".into(),
            body: String::new(),
            timestamp: 0,
            root_tree: tree_checksum,
            root_meta: meta,
        };
        let commit_checksum = repo.write_commit(&commit).unwrap();

        let relpath = crate::objects::object_relpath(&file, ObjectType::File);
        td.write(format!("objects/{relpath}"), b"corrupted").unwrap();

        let report = fsck(&repo, FsckMode::Destructive, TombstonePolicy::Disabled, &CancellationToken::new()).unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!repo.has_object(&file, ObjectType::File).unwrap());
        assert!(report
            .findings
            .iter()
            .any(|f| matches!(f, Finding::Incomplete { commit } if *commit == commit_checksum)));
        assert!(repo.is_commit_partial(&commit_checksum).unwrap());
    }

    #[test]
    fn missing_parent_is_reported_and_optionally_tombstoned() {
        let (_td, repo) = new_repo();
        let bogus_parent = Checksum::from_hex(&"b".repeat(64)).unwrap();
        let child = empty_commit(&repo, "child", Some(bogus_parent));

        let report = fsck(&repo, FsckMode::ReportOnly, TombstonePolicy::Enabled, &CancellationToken::new()).unwrap();
        assert!(report.findings.iter().any(
            |f| matches!(f, Finding::MissingParent { commit, parent, tombstoned } if *commit == child && *parent == bogus_parent && *tombstoned)
        ));
        assert!(repo.is_commit_tombstone(&bogus_parent).unwrap());
    }

    #[test]
    fn partial_commit_is_reported_but_not_content_verified() {
        let (_td, repo) = new_repo();
        let commit_checksum = empty_commit(&repo, "partial-one", None);
        repo.mark_commit_partial(&commit_checksum).unwrap();

        let report = fsck(&repo, FsckMode::ReportOnly, TombstonePolicy::Disabled, &CancellationToken::new()).unwrap();
        assert_eq!(report.findings, vec![Finding::Partial { commit: commit_checksum }]);
    }
}
