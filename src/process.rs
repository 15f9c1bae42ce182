//! External command execution.
//!
//! Every external tool (btrfs, pacstrap, pacman, mount, grub-install, ...)
//! is invoked through [`Cmd`], which captures stderr and turns non-zero
//! exits into [`Error::CommandFailed`] carrying the argv vector, the exit
//! code, and the tail of stderr. Commands are always argv vectors; no shell
//! is involved unless a caller explicitly runs one.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::Error;

/// Number of stderr lines preserved in a failure report.
const STDERR_TAIL_LINES: usize = 20;

/// Builder for an external command invocation.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    allow_fail: bool,
    error_msg: Option<String>,
}

/// Captured result of a [`Cmd::run`].
#[derive(Debug)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stdout with surrounding whitespace removed.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: None,
            allow_fail: false,
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for a in args {
            self.args.push(a.as_ref().to_os_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// A non-zero exit is returned in the output instead of failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Extra context attached to a failure.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    fn argv_strings(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        v
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run with stdout/stderr captured and stdin closed.
    pub fn run(self) -> Result<CmdOutput> {
        let argv = self.argv_strings();
        debug!("running: {}", argv.join(" "));

        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        let result = CmdOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            return Err(self.failure(argv, result.status, &result.stderr));
        }
        Ok(result)
    }

    /// Run with inherited stdio so the user sees live progress
    /// (pacstrap, pacman, qemu). Stderr is not captured on this path.
    pub fn run_interactive(self) -> Result<()> {
        let argv = self.argv_strings();
        debug!("running (interactive): {}", argv.join(" "));

        let status = self
            .command()
            .status()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        if !status.success() && !self.allow_fail {
            return Err(self.failure(argv, status, ""));
        }
        Ok(())
    }

    fn failure(self, argv: Vec<String>, status: ExitStatus, stderr: &str) -> anyhow::Error {
        let err = Error::CommandFailed {
            argv,
            code: status.code(),
            stderr_tail: stderr_tail(stderr),
        };
        match self.error_msg {
            Some(msg) => anyhow::Error::from(err).context(msg),
            None => err.into(),
        }
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Run a command inside a chroot. The caller is responsible for having the
/// API filesystems bound (see [`crate::mount::ChrootEnv`]).
pub fn chroot_run<I, S>(root: &Path, args: I) -> Result<CmdOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Cmd::new("chroot").arg_path(root).args(args).run()
}

/// Interactive variant of [`chroot_run`] for long package operations.
pub fn chroot_run_interactive<I, S>(root: &Path, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Cmd::new("chroot").arg_path(root).args(args).run_interactive()
}
