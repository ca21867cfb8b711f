//! A thin wrapper around [`std::process::Command`] for the handful of
//! external binaries prepare-root shells out to (`mount`, `umount`) for
//! operations the kernel doesn't expose as a single in-process syscall
//! we'd rather hand-roll.

use std::ffi::OsStr;
use std::io::Seek;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::prelude::CapStdExtCommandExt;

pub(crate) struct Task {
    description: String,
    quiet: bool,
    quiet_output: bool,
    cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        let mut cmd = Command::new(exe.as_ref());
        cmd.stdin(Stdio::null());
        Self { description: description.as_ref().to_string(), quiet: false, quiet_output: false, cmd }
    }

    /// Run with `dir` as the child's working directory.
    pub(crate) fn root(mut self, dir: &Dir) -> Result<Self> {
        self.cmd.cwd_dir(dir.try_clone()?);
        Ok(self)
    }

    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub(crate) fn quiet_output(mut self) -> Self {
        self.quiet_output = true;
        self
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Run, failing with the captured description and exit status if the
    /// child does not exit successfully.
    pub(crate) fn run(self) -> Result<()> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            tracing::info!("{description}");
        }
        let mut output = None;
        if self.quiet_output {
            let tmpf = tempfile::tempfile()?;
            cmd.stdout(Stdio::from(tmpf.try_clone()?));
            cmd.stderr(Stdio::from(tmpf.try_clone()?));
            output = Some(tmpf);
        }
        tracing::debug!("exec: {cmd:?}");
        let st = cmd.status()?;
        if !st.success() {
            if let Some(mut output) = output {
                output.seek(std::io::SeekFrom::Start(0))?;
                let mut stderr = std::io::stderr().lock();
                std::io::copy(&mut output, &mut stderr)?;
            }
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(())
    }

    /// Like [`Task::run`], but capture and return stdout.
    pub(crate) fn read(self) -> Result<String> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            tracing::debug!("{description}");
        }
        tracing::debug!("exec: {cmd:?}");
        cmd.stdout(Stdio::piped());
        let child = cmd.spawn().with_context(|| format!("spawning {description}"))?;
        let o = child.wait_with_output().with_context(|| format!("executing {description}"))?;
        if !o.status.success() {
            anyhow::bail!("Task {description} failed: {:?}", o.status);
        }
        Ok(String::from_utf8(o.stdout)?)
    }

    pub(crate) fn new_and_run<'a>(
        description: impl AsRef<str>,
        exe: impl AsRef<str>,
        args: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        Self::new(description, exe).args(args).run()
    }
}
