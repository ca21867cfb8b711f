//! The command-line front end over `ostree-core`: repo init, writing and
//! inspecting commits, refs, fsck, signing, and driving `prepare_root`
//! at boot.

use anyhow::{Context, Result, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::{Dir, MetadataExt};
use cap_std_ext::dirext::CapStdExtDirExt;
use clap::{Parser, Subcommand};
use ostree_core::checksum::FileContent;
use ostree_core::codec::{DirMeta, DirTree};
use ostree_core::commit::CommitOptions;
use ostree_core::fsck::{FsckMode, TombstonePolicy};
use ostree_core::mutabletree::MutableTree;
use ostree_core::objects::ObjectType;
use ostree_core::prepareroot::{self, PrepareRootContext};
use ostree_core::repo::{CancellationToken, Repo, RepoMode};
use ostree_core::sign::{self, RevokedKeys};
use std::os::unix::ffi::OsStrExt;

#[derive(Debug, Parser)]
#[command(name = "ostree-core", about = "A content-addressed object store and deployment runtime")]
struct Opt {
    /// Increase log verbosity; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Create a new repository.
    Init {
        /// Storage mode.
        #[arg(long, default_value = "bare")]
        mode: String,
        /// Where to create it.
        path: Utf8PathBuf,
    },
    /// Commit a directory tree into a repository.
    Commit {
        #[arg(long)]
        repo: Utf8PathBuf,
        #[arg(long = "branch")]
        branch: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        parent: Option<String>,
        root_dir: Utf8PathBuf,
    },
    /// Print a commit's raw object bytes to stdout.
    Cat {
        #[arg(long)]
        repo: Utf8PathBuf,
        rev: String,
    },
    /// List a commit's root directory, or a path inside it.
    Ls {
        #[arg(long)]
        repo: Utf8PathBuf,
        rev: String,
        path: Option<String>,
    },
    /// List every ref in the repository.
    Refs {
        #[arg(long)]
        repo: Utf8PathBuf,
    },
    /// Resolve a rev spec to a checksum.
    RevParse {
        #[arg(long)]
        repo: Utf8PathBuf,
        spec: String,
    },
    /// Check every commit's reachable object set for corruption.
    Fsck {
        #[arg(long)]
        repo: Utf8PathBuf,
        /// Delete corrupt objects instead of only reporting them.
        #[arg(long)]
        delete: bool,
    },
    /// Sign a commit with an ed25519 secret key.
    Sign {
        #[arg(long)]
        repo: Utf8PathBuf,
        rev: String,
        /// Path to a raw 32-byte ed25519 secret key.
        #[arg(long)]
        key: Utf8PathBuf,
    },
    /// Run the boot-time prepare-root sequence against a sysroot.
    PrepareRoot {
        #[arg(long)]
        sysroot: Utf8PathBuf,
        /// Validate and print the plan without mounting or pivoting anything.
        #[arg(long)]
        dry_run: bool,
    },
}

fn open_repo(path: &Utf8PathBuf) -> Result<Repo> {
    Repo::open_at_path(path).with_context(|| format!("Opening repo at {path}"))
}

/// Recursively import `dir`'s contents into `node`, writing file and
/// dirmeta objects as it goes, matching the importer-writes-dirmeta-first
/// contract [`ostree_core::commit::write_commit`] expects.
fn import_dir_into(repo: &Repo, dir: &Dir, node: &mut MutableTree) -> Result<()> {
    let meta = dir.dir_metadata()?;
    let dirmeta = repo.write_dirmeta(&DirMeta {
        uid: meta.uid(),
        gid: meta.gid(),
        mode: meta.mode() & 0o7777,
        xattrs: vec![],
    })?;
    node.set_metadata_checksum(dirmeta);

    let mut entries: Vec<_> = dir.entries()?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry
            .file_name()
            .into_string()
            .map_err(|n| anyhow!("non-utf8 entry name {n:?}"))?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let child_dir = dir.open_dir(&name)?;
            let child_node = node.ensure_dir(&name)?;
            import_dir_into(repo, &child_dir, child_node)?;
        } else if file_type.is_symlink() {
            let target = dir.read_link_contents(&name)?;
            let checksum = repo.write_file(0, 0, 0o120777, &[], FileContent::Symlink(target.as_os_str().as_bytes()))?;
            node.replace_file(&name, checksum)?;
        } else {
            let file_meta = entry.metadata()?;
            let checksum = if matches!(repo.mode(), RepoMode::Bare | RepoMode::BareUser) {
                repo.link_file(dir, Utf8Path::new(&name), file_meta.uid(), file_meta.gid(), file_meta.mode())?
            } else {
                let content = dir.read(&name)?;
                repo.write_file(file_meta.uid(), file_meta.gid(), file_meta.mode(), &[], FileContent::Regular(&content))?
            };
            node.replace_file(&name, checksum)?;
        }
    }
    Ok(())
}

fn cmd_init(mode: &str, path: &Utf8PathBuf) -> Result<()> {
    let mode = match mode {
        "bare" => RepoMode::Bare,
        "bare-user" => RepoMode::BareUser,
        "archive" => RepoMode::Archive,
        o => bail!("unrecognized repo mode {o}"),
    };
    Repo::create_at_path(path, mode)?;
    println!("Initialized {mode:?} repository at {path}");
    Ok(())
}

fn cmd_commit(repo_path: &Utf8PathBuf, branch: &str, subject: &str, parent: Option<&str>, root_dir: &Utf8PathBuf) -> Result<()> {
    let repo = open_repo(repo_path)?;
    let root = Dir::open_ambient_dir(root_dir, cap_std::ambient_authority())
        .with_context(|| format!("Opening {root_dir}"))?;
    let mut tree = MutableTree::new();
    import_dir_into(&repo, &root, &mut tree)?;

    let parent = parent.map(|p| repo.resolve_rev(p)).transpose()?;
    let checksum = ostree_core::commit::write_commit(
        &repo,
        &tree,
        CommitOptions { parent, subject: subject.to_string(), ..Default::default() },
    )?;
    repo.write_ref(None, branch, &checksum)?;
    println!("{checksum}");
    Ok(())
}

fn cmd_cat(repo_path: &Utf8PathBuf, rev: &str) -> Result<()> {
    let repo = open_repo(repo_path)?;
    let checksum = repo.resolve_rev(rev)?;
    let bytes = repo.read_object_bytes(&checksum, ObjectType::Commit)?;
    let (commit, state) = repo.load_commit(&checksum)?;
    println!("commit {checksum}");
    println!("subject: {}", commit.subject);
    if !commit.body.is_empty() {
        println!("\n{}", commit.body);
    }
    if let Some(parent) = commit.parent {
        println!("parent: {parent}");
    }
    if state.partial {
        println!("(partial)");
    }
    println!("root: {} {}", commit.root_tree, commit.root_meta);
    println!("encoded size: {} bytes", bytes.len());
    Ok(())
}

fn print_tree(tree: &DirTree, prefix: &str) {
    for (name, checksum, _meta) in &tree.dirs {
        println!("d {checksum} {prefix}{name}/");
    }
    for (name, checksum) in &tree.files {
        println!("f {checksum} {prefix}{name}");
    }
}

fn cmd_ls(repo_path: &Utf8PathBuf, rev: &str, path: Option<&str>) -> Result<()> {
    let repo = open_repo(repo_path)?;
    let checksum = repo.resolve_rev(rev)?;
    let (commit, _state) = repo.load_commit(&checksum)?;
    let mut tree = repo.read_dirtree(&commit.root_tree)?;
    if let Some(path) = path {
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let entry = tree
                .dirs
                .iter()
                .find(|(name, _, _)| name == component)
                .ok_or_else(|| anyhow!("no such directory entry {component}"))?;
            tree = repo.read_dirtree(&entry.1)?;
        }
    }
    print_tree(&tree, "");
    Ok(())
}

fn cmd_refs(repo_path: &Utf8PathBuf) -> Result<()> {
    let repo = open_repo(repo_path)?;
    let root = Dir::open_ambient_dir(repo_path, cap_std::ambient_authority())?;
    let Some(heads) = root.open_dir_optional("refs/heads")? else {
        return Ok(());
    };
    let mut names = Vec::new();
    collect_refs(&heads, "", &mut names)?;
    names.sort();
    for name in names {
        let checksum = repo.read_ref(None, &name)?.ok_or_else(|| anyhow!("ref {name} vanished"))?;
        println!("{name} {checksum}");
    }
    Ok(())
}

fn collect_refs(dir: &Dir, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    for entry in dir.entries()? {
        let entry = entry?;
        let name = entry.file_name().into_string().map_err(|n| anyhow!("non-utf8 ref component {n:?}"))?;
        if entry.file_type()?.is_dir() {
            let subdir = dir.open_dir(&name)?;
            collect_refs(&subdir, &format!("{prefix}{name}/"), out)?;
        } else {
            out.push(format!("{prefix}{name}"));
        }
    }
    Ok(())
}

fn cmd_rev_parse(repo_path: &Utf8PathBuf, spec: &str) -> Result<()> {
    let repo = open_repo(repo_path)?;
    println!("{}", repo.resolve_rev(spec)?);
    Ok(())
}

fn cmd_fsck(repo_path: &Utf8PathBuf, delete: bool) -> Result<()> {
    let repo = open_repo(repo_path)?;
    let mode = if delete { FsckMode::Destructive } else { FsckMode::ReportOnly };
    let report = ostree_core::fsck::fsck(&repo, mode, TombstonePolicy::Disabled, &CancellationToken::new())?;
    for finding in &report.findings {
        println!("{finding:?}");
    }
    if report.deleted > 0 {
        println!("deleted {} corrupt object(s)", report.deleted);
    }
    if report.is_clean() {
        println!("repository is clean");
        Ok(())
    } else {
        bail!("fsck found {} issue(s)", report.findings.len());
    }
}

fn cmd_sign(repo_path: &Utf8PathBuf, rev: &str, key_path: &Utf8PathBuf) -> Result<()> {
    let repo = open_repo(repo_path)?;
    let checksum = repo.resolve_rev(rev)?;
    let key_bytes = std::fs::read(key_path).with_context(|| format!("Reading {key_path}"))?;
    let secret: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("{key_path} is not a 32-byte ed25519 secret key"))?;
    ostree_core::commit::sign_commit(&repo, &checksum, &[sign::SigningKey::Ed25519(secret)])?;
    println!("signed {checksum}");
    Ok(())
}

fn cmd_prepare_root(sysroot: &Utf8PathBuf, dry_run: bool) -> Result<()> {
    let physical_root = Dir::open_ambient_dir(sysroot, cap_std::ambient_authority())
        .with_context(|| format!("Opening sysroot {sysroot}"))?;
    let repo_root = physical_root.open_dir("ostree/repo")?;
    let repo = Repo::open_at(repo_root)?;
    let cmdline = std::fs::read_to_string("/proc/cmdline").unwrap_or_default();

    if dry_run {
        let config = prepareroot::PrepareRootConfig::load(&physical_root)?;
        config.validate()?;
        let deploy_path = prepareroot::parse_cmdline(&cmdline)?;
        let resolved = prepareroot::resolve_deploy(&physical_root, &deploy_path)?;
        println!("would pivot to {}", resolved.relpath);
        return Ok(());
    }

    let staging = Utf8PathBuf::from("sysroot/staging");
    let ctx = PrepareRootContext {
        physical_root: &physical_root,
        repo: &repo,
        cmdline: &cmdline,
        staging: &staging,
        trusted_keys: &[],
        revoked_keys: &RevokedKeys::none(),
        pid1: prepareroot::running_as_pid1(),
        init: "/sbin/init",
    };
    let report = prepareroot::prepare_root(&ctx)?;
    println!("booted composefs={} verity={}", report.composefs, report.verity);
    Ok(())
}

fn run() -> Result<()> {
    let opt = Opt::parse();
    ostree_core_utils::initialize_tracing(opt.verbose);
    match &opt.cmd {
        Cmd::Init { mode, path } => cmd_init(mode, path),
        Cmd::Commit { repo, branch, subject, parent, root_dir } => {
            cmd_commit(repo, branch, subject, parent.as_deref(), root_dir)
        }
        Cmd::Cat { repo, rev } => cmd_cat(repo, rev),
        Cmd::Ls { repo, rev, path } => cmd_ls(repo, rev, path.as_deref()),
        Cmd::Refs { repo } => cmd_refs(repo),
        Cmd::RevParse { repo, spec } => cmd_rev_parse(repo, spec),
        Cmd::Fsck { repo, delete } => cmd_fsck(repo, *delete),
        Cmd::Sign { repo, rev, key } => cmd_sign(repo, rev, key),
        Cmd::PrepareRoot { sysroot, dry_run } => cmd_prepare_root(sysroot, *dry_run),
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
