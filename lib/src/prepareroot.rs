//! Deployment prepare-root : parse the kernel cmdline
//! to pick a deployment, load `prepare-root.conf`, and run the boot-time
//! mount/pivot sequence that swaps the staged deployment in as `/`.
//!
//! This runs either in an initramfs (physical root at `/sysroot`) or as
//! PID 1 on a statically linked kernel (physical root at `/`). Every
//! failure here is [`CoreError::Fatal`]: there is no retry and no
//! partial success, because a half-initialized root is worse than a
//! refusal to boot.

use crate::codec;
use crate::error::CoreError;
use crate::iniext;
use crate::mountutil;
use crate::objects::Checksum;
use crate::sign;
use crate::task::Task;
use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

const CONF_RELPATH: &str = "ostree/prepare-root.conf";
/// Where the boot-report metadata dictionary is written for a normal boot.
pub const BOOTED_PATH: &str = "run/ostree-booted";
/// Where it's written instead during a soft-reboot flow.
pub const NEXTROOT_BOOTED_PATH: &str = "run/ostree/nextroot-booted";

/// The `yes|no|maybe` vocabulary shared by the boolean-ish prepare-root
/// keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tristate {
    /// `yes` / `true` / `1`.
    Enabled,
    /// `no` / `false` / `0`.
    #[default]
    Disabled,
    /// `maybe`: enabled if the kernel/hardware supports it, otherwise
    /// silently skipped rather than failing.
    Maybe,
}

impl Tristate {
    fn parse(s: &str) -> Result<Self, CoreError> {
        Ok(match s {
            "yes" | "true" | "1" => Tristate::Enabled,
            "no" | "false" | "0" => Tristate::Disabled,
            "maybe" => Tristate::Maybe,
            o => return Err(CoreError::invalid_format(format!("not a tristate value: {o}"))),
        })
    }

    /// True unless explicitly disabled.
    pub fn maybe_enabled(&self) -> bool {
        !matches!(self, Tristate::Disabled)
    }
}

/// `[composefs] enabled` : a tristate, plus the two
/// policy values that additionally require fsverity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposefsState {
    /// Require a verified signature over the commit and a matching
    /// fsverity digest.
    Signed,
    /// Require fsverity, no signature check.
    Verity,
    /// No extra verification required.
    Tristate(Tristate),
}

impl Default for ComposefsState {
    fn default() -> Self {
        ComposefsState::Tristate(Tristate::default())
    }
}

impl ComposefsState {
    fn parse(s: &str) -> Result<Self, CoreError> {
        Ok(match s {
            "signed" => ComposefsState::Signed,
            "verity" => ComposefsState::Verity,
            o => ComposefsState::Tristate(Tristate::parse(o)?),
        })
    }

    /// True unless the tristate arm is explicitly disabled.
    pub fn maybe_enabled(&self) -> bool {
        match self {
            ComposefsState::Signed | ComposefsState::Verity => true,
            ComposefsState::Tristate(t) => t.maybe_enabled(),
        }
    }

    /// Whether this policy requires the mounted image carry fsverity.
    pub fn requires_fsverity(&self) -> bool {
        matches!(self, ComposefsState::Signed | ComposefsState::Verity)
    }

    /// Whether this policy requires a verified signature before mount.
    pub fn requires_signature(&self) -> bool {
        matches!(self, ComposefsState::Signed)
    }
}

/// Select the deployment path from a kernel command line.
/// `androidboot.slot_suffix=_a|_b` wins if present; any other
/// `androidboot.*` token implies slot A; otherwise `ostree=<path>`.
/// Absence of all three is fatal.
pub fn parse_cmdline(cmdline: &str) -> Result<Utf8PathBuf, CoreError> {
    let mut ostree_path = None;
    let mut saw_androidboot = false;
    let mut slot_suffix = None;
    for token in cmdline.split_whitespace() {
        if let Some(v) = token.strip_prefix("ostree=") {
            ostree_path = Some(v.to_string());
        } else if let Some(v) = token.strip_prefix("androidboot.slot_suffix=") {
            saw_androidboot = true;
            slot_suffix = Some(v.to_string());
        } else if token.starts_with("androidboot.") {
            saw_androidboot = true;
        }
    }
    if let Some(suffix) = slot_suffix {
        return match suffix.as_str() {
            "_a" => Ok(Utf8PathBuf::from("/ostree/root.a")),
            "_b" => Ok(Utf8PathBuf::from("/ostree/root.b")),
            o => Err(CoreError::Fatal(format!("unsupported androidboot.slot_suffix value {o}"))),
        };
    }
    if saw_androidboot {
        return Ok(Utf8PathBuf::from("/ostree/root.a"));
    }
    match ostree_path {
        Some(p) => Ok(Utf8PathBuf::from(p)),
        None => Err(CoreError::Fatal("no ostree= or androidboot.* argument on the kernel cmdline".to_string())),
    }
}

/// The parsed, per-key-overlaid contents of `prepare-root.conf`:
/// `/etc/ostree/prepare-root.conf` overrides
/// `/usr/lib/ostree/prepare-root.conf` key by key, not file by file.
#[derive(Debug, Clone, Default)]
pub struct PrepareRootConfig {
    sysroot_readonly: Option<bool>,
    root_transient: Option<bool>,
    root_transient_ro: Option<bool>,
    etc_transient: Option<bool>,
    composefs: Option<ComposefsState>,
    composefs_keypath: Option<Utf8PathBuf>,
}

impl PrepareRootConfig {
    /// Load and overlay both config files under `physical_root`. Either
    /// or both may be absent; a wholly absent config is just defaults.
    pub fn load(physical_root: &Dir) -> Result<Self> {
        let usrlib = Self::read_ini(physical_root, &Utf8PathBuf::from("usr/lib").join(CONF_RELPATH))?;
        let etc = Self::read_ini(physical_root, &Utf8PathBuf::from("etc").join(CONF_RELPATH))?;
        Self::from_inis(usrlib.as_ref(), etc.as_ref())
    }

    fn read_ini(root: &Dir, path: &Utf8Path) -> Result<Option<tini::Ini>> {
        match root.read_to_string(path) {
            Ok(s) => {
                let ini = tini::Ini::from_string(&s).map_err(|e| anyhow::anyhow!("parsing {path}: {e}"))?;
                Ok(Some(ini))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn from_inis(usrlib: Option<&tini::Ini>, etc: Option<&tini::Ini>) -> Result<Self> {
        let bool_key = |section: &str, key: &str| -> Result<Option<bool>> {
            if let Some(etc) = etc {
                if let Some(v) = iniext::optional_bool(etc, section, key)? {
                    return Ok(Some(v));
                }
            }
            if let Some(usrlib) = usrlib {
                if let Some(v) = iniext::optional_bool(usrlib, section, key)? {
                    return Ok(Some(v));
                }
            }
            Ok(None)
        };
        let string_key = |section: &str, key: &str| -> Option<String> {
            etc.and_then(|i| iniext::optional_string(i, section, key))
                .or_else(|| usrlib.and_then(|i| iniext::optional_string(i, section, key)))
        };

        let composefs = string_key("composefs", "enabled").map(|v| ComposefsState::parse(&v)).transpose()?;

        Ok(Self {
            sysroot_readonly: bool_key("sysroot", "readonly")?,
            root_transient: bool_key("root", "transient")?,
            root_transient_ro: bool_key("root", "transient-ro")?,
            etc_transient: bool_key("etc", "transient")?,
            composefs,
            composefs_keypath: string_key("composefs", "keypath").map(Utf8PathBuf::from),
        })
    }

    /// `[sysroot] readonly`, default `false`.
    pub fn sysroot_readonly(&self) -> bool {
        self.sysroot_readonly.unwrap_or(false)
    }

    /// `[root] transient`, default `false`.
    pub fn root_transient(&self) -> bool {
        self.root_transient.unwrap_or(false)
    }

    /// `[root] transient-ro`, default `false`.
    pub fn root_transient_ro(&self) -> bool {
        self.root_transient_ro.unwrap_or(false)
    }

    /// `[etc] transient`, default `false`.
    pub fn etc_transient(&self) -> bool {
        self.etc_transient.unwrap_or(false)
    }

    /// `[composefs] enabled`, default `maybe`'s tristate-default-disabled arm.
    pub fn composefs(&self) -> ComposefsState {
        self.composefs.unwrap_or_default()
    }

    /// `[composefs] keypath`, if set.
    pub fn composefs_keypath(&self) -> Option<&Utf8Path> {
        self.composefs_keypath.as_deref()
    }

    /// Reject configuration combinations that can never mount successfully.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.root_transient() && self.root_transient_ro() {
            return Err(CoreError::Policy("root.transient and root.transient-ro are mutually exclusive".to_string()));
        }
        if self.composefs().requires_signature() && self.composefs_keypath().is_none() {
            return Err(CoreError::Policy("composefs.enabled=signed requires composefs.keypath".to_string()));
        }
        Ok(())
    }
}

/// The state recorded once, at the end of a successful prepare-root
/// run. A plain tagged struct rather than a variant map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootReport {
    /// Whether a composefs image was mounted.
    pub composefs: bool,
    /// Whether fsverity enforcement was active on that image.
    pub verity: bool,
    /// The signing public key path used, if `composefs.enabled=signed`.
    pub signing_keypath: Option<String>,
    /// Whether `/` is a transient (tmpfs-backed) overlay.
    pub root_transient: bool,
    /// Whether that overlay is additionally read-only.
    pub root_transient_ro: bool,
    /// Whether the physical sysroot was mounted read-only.
    pub sysroot_readonly: bool,
    /// The backing device number of the physical sysroot.
    pub backing_device: u64,
    /// The backing inode number of the deploy directory.
    pub backing_inode: u64,
    /// The transient `/etc` overlay's upperdir path, if `etc.transient`.
    pub transient_etc_path: Option<String>,
}

impl BootReport {
    /// Encode using the same length-prefixed big-endian primitives as
    /// the object codec , not a GVariant `a{sv}`.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = codec::Writer::new();
        w.bool(self.composefs);
        w.bool(self.verity);
        write_optional_string(&mut w, self.signing_keypath.as_deref());
        w.bool(self.root_transient);
        w.bool(self.root_transient_ro);
        w.bool(self.sysroot_readonly);
        w.u64(self.backing_device);
        w.u64(self.backing_inode);
        write_optional_string(&mut w, self.transient_etc_path.as_deref());
        w.into_bytes()
    }

    /// Decode bytes produced by [`BootReport::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self, CoreError> {
        let mut r = codec::Reader::new(buf);
        let composefs = r.bool()?;
        let verity = r.bool()?;
        let signing_keypath = read_optional_string(&mut r)?;
        let root_transient = r.bool()?;
        let root_transient_ro = r.bool()?;
        let sysroot_readonly = r.bool()?;
        let backing_device = r.u64()?;
        let backing_inode = r.u64()?;
        let transient_etc_path = read_optional_string(&mut r)?;
        if r.remaining() {
            return Err(CoreError::invalid_format("trailing bytes after boot report"));
        }
        Ok(Self {
            composefs,
            verity,
            signing_keypath,
            root_transient,
            root_transient_ro,
            sysroot_readonly,
            backing_device,
            backing_inode,
            transient_etc_path,
        })
    }

    /// Write this report to `path` under `root`, replacing any existing
    /// file.
    pub fn write(&self, root: &Dir, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            root.create_dir_all(parent)?;
        }
        root.write(path, self.encode())?;
        Ok(())
    }
}

fn write_optional_string(w: &mut codec::Writer, s: Option<&str>) {
    match s {
        Some(s) => {
            w.bool(true);
            w.string(s);
        }
        None => w.bool(false),
    }
}

fn read_optional_string(r: &mut codec::Reader<'_>) -> Result<Option<String>, CoreError> {
    if r.bool()? { Ok(Some(r.string()?)) } else { Ok(None) }
}

/// Whether this process is PID 1 (statically linked kernel boot),
/// versus running inside a generic initramfs.
pub fn running_as_pid1() -> bool {
    rustix::process::getpid().is_init()
}

/// The result of resolving a kernel cmdline's deployment selector
/// against the physical root: the path, its backing device, and inode.
#[derive(Debug, Clone)]
pub struct ResolvedDeploy {
    /// Path of the deployment relative to the physical root.
    pub relpath: Utf8PathBuf,
    /// The deployment directory's backing device number.
    pub device: u64,
    /// The deployment directory's inode number.
    pub inode: u64,
}

/// Resolve `deploy_path` (as produced by [`parse_cmdline`], an absolute
/// path meaningful relative to the physical root) and `stat` it,
/// failing if it is missing.
pub fn resolve_deploy(physical_root: &Dir, deploy_path: &Utf8Path) -> Result<ResolvedDeploy> {
    let relpath = Utf8PathBuf::from(deploy_path.as_str().trim_start_matches('/'));
    let meta = physical_root
        .metadata(&relpath)
        .with_context(|| format!("deployment {relpath} not present under physical root"))?;
    use cap_std_ext::cap_std::fs::MetadataExt;
    Ok(ResolvedDeploy { relpath, device: meta.dev(), inode: meta.ino() })
}

/// Make the root mount private so nothing we do below leaks into the
/// host's other mount namespaces (`mount --make-rprivate /`).
fn make_root_private() -> Result<()> {
    Task::new_and_run("Making / mount propagation private", "mount", ["--make-rprivate", "/"])
}

/// Bind-mount `/boot` into the staged root when `<deploy>/boot/loader`
/// is a symlink: the deployment carries its own `/boot` only when
/// bootloader config lives there.
fn maybe_bind_boot(physical_root: &Dir, deploy: &Utf8Path, staging: &Utf8Path) -> Result<()> {
    let loader = deploy.join("boot/loader");
    let is_symlink = physical_root.symlink_metadata_optional(&loader)?.map(|m| m.is_symlink()).unwrap_or(false);
    if !is_symlink {
        return Ok(());
    }
    bind_mount(physical_root, "boot", &staging.join("boot"))
}

fn bind_mount(physical_root: &Dir, source_relpath: &str, target: &Utf8Path) -> Result<()> {
    Task::new(format!("Bind mounting {source_relpath}"), "mount")
        .root(physical_root)?
        .args(["--bind", source_relpath, target.as_str()])
        .quiet_output()
        .run()
}

/// Set up `/etc` in the staged root : a transient
/// overlay with an upperdir under `/run/ostree`, or a writable bind
/// mount of the deployment's own `etc`.
fn setup_etc(physical_root: &Dir, deploy: &Utf8Path, staging: &Utf8Path, transient: bool) -> Result<Option<Utf8PathBuf>> {
    let target = staging.join("etc");
    if !transient {
        bind_mount(physical_root, deploy.join("etc").as_str(), &target)?;
        Task::new("Remounting /etc writable", "mount")
            .root(physical_root)?
            .args(["-o", "remount,rw", target.as_str()])
            .quiet_output()
            .run()?;
        return Ok(None);
    }
    let tempdir = Utf8PathBuf::from("run/ostree").join(format!("etc-overlay.{}", std::process::id()));
    physical_root.create_dir_all(tempdir.join("upper"))?;
    physical_root.create_dir_all(tempdir.join("work"))?;
    let lowerdir = staging.join("usr/etc");
    let overlay_opts = format!(
        "lowerdir={},upperdir={},workdir={}",
        lowerdir,
        tempdir.join("upper"),
        tempdir.join("work"),
    );
    Task::new("Mounting transient /etc overlay", "mount")
        .root(physical_root)?
        .args(["-t", "overlay", "-o", &overlay_opts, "overlay", target.as_str()])
        .quiet_output()
        .run()?;
    Ok(Some(tempdir))
}

/// Bind-mount the stateroot's `var` read-write: always bind-mount
/// `../../var`.
fn bind_var(physical_root: &Dir, deploy: &Utf8Path, staging: &Utf8Path) -> Result<()> {
    let var_source = deploy
        .parent()
        .and_then(Utf8Path::parent)
        .map(|stateroot| stateroot.join("var"))
        .ok_or_else(|| anyhow::anyhow!("deploy path {deploy} too shallow to locate its stateroot's var"))?;
    bind_mount(physical_root, var_source.as_str(), &staging.join("var"))
}

/// Mount a composefs (erofs + fsverity) image of the deployment via the
/// `mount.composefs` helper, lowering into the repo's `objects/`
/// directory. Requires fsverity when `require_verity` is set and pins
/// the mount to `expected_digest` if one is given.
fn mount_composefs(
    physical_root: &Dir,
    image_relpath: &Utf8Path,
    objects_relpath: &Utf8Path,
    target: &Utf8Path,
    require_verity: bool,
    expected_digest: Option<&[u8]>,
    writable: bool,
) -> Result<()> {
    let mut opts = vec![format!("basedir={objects_relpath}")];
    if require_verity {
        opts.push("verity".to_string());
    }
    if let Some(digest) = expected_digest {
        opts.push(format!("digest={}", hex::encode(digest)));
    }
    if !writable {
        opts.push("ro".to_string());
    }
    Task::new(format!("Mounting composefs image {image_relpath}"), "mount.composefs")
        .root(physical_root)?
        .args([image_relpath.as_str(), target.as_str(), "-o", &opts.join(",")])
        .quiet_output()
        .run()
        .with_context(|| format!("mounting composefs image {image_relpath}"))
}

/// Resolve the fsverity digest a `signed` composefs policy must pin the
/// mount to: `ostree.composefs.v0` on the deploy commit itself, falling
/// back to its parent's (a bootc base commit) if the deploy commit
/// doesn't carry one.
pub fn resolve_expected_digest(repo: &crate::repo::Repo, commit: &codec::Commit) -> Result<Option<Vec<u8>>> {
    if let Some(digest) = commit.composefs_digest() {
        return Ok(Some(digest.to_vec()));
    }
    let Some(parent) = commit.parent else { return Ok(None) };
    let (parent_commit, _state) = repo.load_commit(&parent)?;
    Ok(parent_commit.composefs_digest().map(|d| d.to_vec()))
}

/// Finish the boot: either pivot into the staged root directly (PID 1,
/// statically linked kernel) or hand it off via `mount --move` for an
/// initramfs + systemd to complete the switch.
///
/// The PID-1 path uses `switch_root`, the standard initramfs utility
/// that performs `chdir`/`pivot_root`/`chroot`/`execve` as one atomic
/// step and unmounts the old root's remaining contents; the non-PID-1
/// path moves the staged mount onto `/sysroot` and returns, leaving the
/// final switch to whatever orchestrates the rest of boot.
pub fn pivot(staging: &Utf8Path, pid1: bool, init: &str) -> Result<()> {
    if pid1 {
        Task::new(format!("Switching root to {staging}"), "switch_root")
            .args([staging.as_str(), init])
            .run()
    } else {
        Task::new_and_run("Moving staged root onto /sysroot", "mount", ["--move", staging.as_str(), "/sysroot"])
    }
}

/// Validate kernel/mount-API prerequisites: refuse loudly rather than
/// mount without the safety properties policy requires, instead of
/// silently degrading. Verity mounts rely on the same `statx` attribute
/// surface [`mountutil::is_mountpoint`] probes.
pub fn require_fsverity_capable(physical_root: &Dir) -> Result<()> {
    match mountutil::is_mountpoint(physical_root, ".")? {
        Some(_) => Ok(()),
        None => bail!(CoreError::Fatal(
            "kernel does not support the statx() attribute surface composefs verity needs".to_string()
        )),
    }
}

/// The deploy directory name is `<commit checksum>.<N>` (glossary:
/// "a materialized filesystem tree at
/// `/ostree/deploy/<stateroot>/deploy/<commit>.<N>`"); pull the checksum
/// back out of it.
fn commit_from_deploy_path(relpath: &Utf8Path) -> Result<Checksum> {
    let name = relpath.file_name().ok_or_else(|| anyhow::anyhow!("deploy path {relpath} has no file name"))?;
    let (checksum, _n) = name
        .split_once('.')
        .ok_or_else(|| anyhow::anyhow!("deploy directory name {name} is not <commit>.<N>"))?;
    Checksum::from_hex(checksum).map_err(|e| anyhow::anyhow!("deploy directory name {name}: {e}"))
}

/// Everything a [`prepare_root`] run needs: where to read from, what to
/// trust, and where the new root lands.
#[derive(Debug)]
pub struct PrepareRootContext<'a> {
    /// The physical sysroot: `/` when running as PID 1, `/sysroot` from
    /// an initramfs.
    pub physical_root: &'a Dir,
    /// The store backing the deployment being booted.
    pub repo: &'a crate::repo::Repo,
    /// The raw kernel command line (e.g. the contents of `/proc/cmdline`).
    pub cmdline: &'a str,
    /// Staging mount point the new root is assembled at before the final
    /// pivot, relative to `physical_root` (`sysroot.tmp`, or
    /// `run/nextroot` for a soft-reboot flow).
    pub staging: &'a Utf8Path,
    /// Public keys trusted for `composefs.enabled=signed` verification.
    pub trusted_keys: &'a [sign::PublicKey],
    /// Keys that must not be trusted even if a signature against them
    /// would otherwise verify.
    pub revoked_keys: &'a sign::RevokedKeys,
    /// True if this process is PID 1.
    pub pid1: bool,
    /// The init binary to `execve` into once pivoted (PID-1 path only).
    pub init: &'a str,
}

/// Run the full boot-time sequence: parse the cmdline, load config,
/// mount the deployment (composefs or a plain bind mount), wire up
/// `/etc` and `/var`, record the outcome, and pivot.
pub fn prepare_root(ctx: &PrepareRootContext<'_>) -> Result<BootReport> {
    let deploy_path = parse_cmdline(ctx.cmdline)?;
    let config = PrepareRootConfig::load(ctx.physical_root)?;
    config.validate()?;
    let resolved = resolve_deploy(ctx.physical_root, &deploy_path)?;

    make_root_private()?;
    ctx.physical_root.create_dir_all(ctx.staging)?;

    let mut report = BootReport {
        sysroot_readonly: config.sysroot_readonly(),
        root_transient: config.root_transient(),
        root_transient_ro: config.root_transient_ro(),
        backing_device: resolved.device,
        backing_inode: resolved.inode,
        ..Default::default()
    };

    let composefs_state = config.composefs();
    if composefs_state.maybe_enabled() {
        let require_verity = composefs_state.requires_fsverity();
        if require_verity {
            require_fsverity_capable(ctx.physical_root)?;
        }

        let image_relpath = resolved.relpath.join(".ostree.cfs");
        let image_present = ctx.physical_root.try_exists(&image_relpath)?;
        if image_present {
            let mut expected_digest = None;
            if composefs_state.requires_signature() {
                let commit_checksum = commit_from_deploy_path(&resolved.relpath)?;
                let (commit, _state) = ctx.repo.load_commit(&commit_checksum)?;
                let commitmeta = ctx
                    .repo
                    .read_commitmeta(&commit_checksum)?
                    .ok_or_else(|| CoreError::Fatal("composefs.enabled=signed but commit has no commitmeta".to_string()))?;
                let sigs = sign::decode_commitmeta(&commitmeta)?;
                let commit_bytes = ctx.repo.read_object_bytes(&commit_checksum, crate::objects::ObjectType::Commit)?;
                let verdict = sign::verify(&commit_bytes, &sigs, ctx.trusted_keys, ctx.revoked_keys)?;
                if verdict != sign::Verdict::Valid {
                    bail!(CoreError::Fatal(format!("composefs signature check failed: {verdict:?}")));
                }
                report.signing_keypath = config.composefs_keypath().map(|p| p.to_string());
                expected_digest = resolve_expected_digest(ctx.repo, &commit)?;
            }
            let objects_relpath = Utf8Path::new("objects");
            mount_composefs(
                ctx.physical_root,
                &image_relpath,
                objects_relpath,
                ctx.staging,
                require_verity,
                expected_digest.as_deref(),
                config.root_transient(),
            )?;
            report.composefs = true;
            report.verity = require_verity;
        } else if matches!(composefs_state, ComposefsState::Tristate(Tristate::Maybe)) {
            bind_mount(ctx.physical_root, resolved.relpath.as_str(), ctx.staging)?;
        } else {
            bail!(CoreError::Fatal(format!("composefs image {image_relpath} missing")));
        }
    } else {
        bind_mount(ctx.physical_root, resolved.relpath.as_str(), ctx.staging)?;
    }

    maybe_bind_boot(ctx.physical_root, &resolved.relpath, ctx.staging)?;
    report.transient_etc_path = setup_etc(ctx.physical_root, &resolved.relpath, ctx.staging, config.etc_transient())?
        .map(|p| p.to_string());
    bind_var(ctx.physical_root, &resolved.relpath, ctx.staging)?;

    let booted_path = Utf8Path::new(BOOTED_PATH);
    report.write(ctx.physical_root, booted_path)?;

    pivot(ctx.staging, ctx.pid1, ctx.init)?;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ini(s: &str) -> tini::Ini {
        tini::Ini::from_string(s).unwrap()
    }

    #[test]
    fn test_tristate() {
        assert_eq!(Tristate::parse("yes").unwrap(), Tristate::Enabled);
        assert_eq!(Tristate::parse("no").unwrap(), Tristate::Disabled);
        assert_eq!(Tristate::parse("maybe").unwrap(), Tristate::Maybe);
        assert!(Tristate::parse("whatever").is_err());
        assert!(Tristate::default().maybe_enabled() == false);
        assert!(Tristate::Maybe.maybe_enabled());
    }

    #[test]
    fn test_composefs_state() {
        assert_eq!(ComposefsState::parse("signed").unwrap(), ComposefsState::Signed);
        assert_eq!(ComposefsState::parse("verity").unwrap(), ComposefsState::Verity);
        assert_eq!(ComposefsState::parse("yes").unwrap(), ComposefsState::Tristate(Tristate::Enabled));
        assert!(ComposefsState::Signed.requires_fsverity());
        assert!(ComposefsState::Signed.requires_signature());
        assert!(ComposefsState::Verity.requires_fsverity());
        assert!(!ComposefsState::Verity.requires_signature());
    }

    /// An Android-style `androidboot.slot_suffix` boot.
    #[test]
    fn androidboot_cmdline_selects_slot() {
        assert_eq!(
            parse_cmdline("root=/dev/sda1 ostree=/ostree/deploy/os/deploy/abc.0 quiet").unwrap(),
            Utf8PathBuf::from("/ostree/deploy/os/deploy/abc.0")
        );
        assert_eq!(parse_cmdline("androidboot.slot_suffix=_b").unwrap(), Utf8PathBuf::from("/ostree/root.b"));
        assert!(parse_cmdline("androidboot.slot_suffix=_c").is_err());
    }

    #[test]
    fn cmdline_other_androidboot_token_implies_slot_a() {
        assert_eq!(parse_cmdline("androidboot.hardware=qemu").unwrap(), Utf8PathBuf::from("/ostree/root.a"));
    }

    #[test]
    fn cmdline_absence_is_fatal() {
        assert!(parse_cmdline("root=/dev/sda1 quiet").is_err());
    }

    #[test]
    fn config_overlay_prefers_etc_per_key() {
        let usrlib = ini("[sysroot]\nreadonly = no\n[root]\ntransient = no\n");
        let etc = ini("[sysroot]\nreadonly = yes\n");
        let cfg = PrepareRootConfig::from_inis(Some(&usrlib), Some(&etc)).unwrap();
        // etc overrides this key...
        assert!(cfg.sysroot_readonly());
        // ...but a key etc doesn't mention still falls back to usr/lib.
        assert!(!cfg.root_transient());
    }

    #[test]
    fn config_defaults_are_all_disabled() {
        let cfg = PrepareRootConfig::default();
        assert!(!cfg.sysroot_readonly());
        assert!(!cfg.root_transient());
        assert!(!cfg.root_transient_ro());
        assert_eq!(cfg.composefs(), ComposefsState::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn transient_and_transient_ro_conflict() {
        let mut cfg = PrepareRootConfig::default();
        cfg.root_transient = Some(true);
        cfg.root_transient_ro = Some(true);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn signed_without_keypath_is_a_policy_error() {
        let mut cfg = PrepareRootConfig::default();
        cfg.composefs = Some(ComposefsState::Signed);
        assert!(cfg.validate().is_err());
        cfg.composefs_keypath = Some(Utf8PathBuf::from("/etc/ostree/composefs.pub"));
        cfg.validate().unwrap();
    }

    #[test]
    fn boot_report_roundtrip() {
        let report = BootReport {
            composefs: true,
            verity: true,
            signing_keypath: Some("/etc/ostree/composefs.pub".to_string()),
            root_transient: false,
            root_transient_ro: false,
            sysroot_readonly: true,
            backing_device: 42,
            backing_inode: 7,
            transient_etc_path: None,
        };
        let decoded = BootReport::decode(&report.encode()).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn boot_report_with_no_optional_fields_roundtrips() {
        let report = BootReport::default();
        let decoded = BootReport::decode(&report.encode()).unwrap();
        assert_eq!(decoded, report);
    }
}
