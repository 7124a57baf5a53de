//! Running requests against child images.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::request::{self, ChildRequest, ChildResponse};
use crate::cmdutils::{stderr_tail, ChildCommandExt};
use crate::config::{ENV_BE_ROOTS, ENV_CHILD_RUNNER, ENV_LIVE_ROOT};
use crate::context::OpContext;
use crate::errors::LinkedError;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{Seek, Write};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Executes a request in the context of a child image.
pub trait ChildRunner: std::fmt::Debug + Send + Sync {
    fn run(&self, ctx: &OpContext, root: &str, req: &ChildRequest) -> Result<ChildResponse>;
}

/// Operate on children within this process.
#[derive(Debug, Default)]
pub struct InlineRunner;

impl ChildRunner for InlineRunner {
    fn run(&self, ctx: &OpContext, root: &str, req: &ChildRequest) -> Result<ChildResponse> {
        Ok(request::handle(
            &ctx.for_child(),
            Utf8Path::new(root),
            req,
        ))
    }
}

/// Re-execute ourselves as `imgpkg -R <child> child-op`, passing the
/// request on stdin and reading the response from stdout.
#[derive(Debug)]
pub struct ExecRunner {
    /// Binary to run; defaults to the current executable.
    pub exe: Option<Utf8PathBuf>,
    /// How long a canceled child gets to exit after SIGTERM.
    pub grace: Duration,
}

impl Default for ExecRunner {
    fn default() -> Self {
        Self {
            exe: None,
            grace: Duration::from_secs(5),
        }
    }
}

impl ExecRunner {
    fn command(&self, ctx: &OpContext, root: &str) -> Result<Command> {
        let exe = match self.exe.as_ref() {
            Some(e) => e.clone().into_std_path_buf(),
            None => std::env::current_exe().context("Finding current executable")?,
        };
        let mut cmd = Command::new(exe);
        cmd.args(["-R", root, "child-op"])
            .env(ENV_LIVE_ROOT, &ctx.config.live_root)
            .env(ENV_BE_ROOTS, ctx.config.be_roots.join(":"))
            .env(ENV_CHILD_RUNNER, "exec");
        Ok(cmd)
    }

    /// Wait for the child, stopping it if the operation is canceled.
    fn wait(&self, ctx: &OpContext, child: &mut Child) -> Result<std::process::ExitStatus> {
        if let Some(st) = poll_exit(child, || ctx.is_canceled())? {
            return Ok(st);
        }
        let pid = Pid::from_raw(child.id().try_into()?);
        tracing::debug!("Operation canceled; stopping child process {pid}");
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            tracing::warn!("Failed to signal child process {pid}: {e}");
        }
        let deadline = Instant::now() + self.grace;
        if poll_exit(child, || Instant::now() >= deadline)?.is_none() {
            tracing::warn!("Child process {pid} did not exit; killing it");
            child.kill()?;
            child.wait()?;
        }
        Err(LinkedError::Canceled.into())
    }
}

/// Poll until the child exits or `stop` returns true; `None` if we
/// stopped first.
fn poll_exit(
    child: &mut Child,
    stop: impl Fn() -> bool,
) -> Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(st) = child.try_wait()? {
            return Ok(Some(st));
        }
        if stop() {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

impl ChildRunner for ExecRunner {
    fn run(&self, ctx: &OpContext, root: &str, req: &ChildRequest) -> Result<ChildResponse> {
        ctx.check_canceled()?;
        let mut stdin = tempfile::tempfile()?;
        serde_json::to_writer(&mut stdin, req)?;
        stdin.flush()?;
        stdin.seek(std::io::SeekFrom::Start(0))?;
        let mut stdout = tempfile::tempfile()?;
        let stderr = tempfile::tempfile()?;

        let mut cmd = self.command(ctx, root)?;
        cmd.stdin(Stdio::from(stdin))
            .stdout(stdout.try_clone()?)
            .stderr(stderr.try_clone()?)
            .bind_to_parent()
            .log_debug();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Spawning child operation for {root}"))?;
        let st = self.wait(ctx, &mut child)?;

        stdout.seek(std::io::SeekFrom::Start(0))?;
        match serde_json::from_reader::<_, ChildResponse>(std::io::BufReader::new(stdout)) {
            Ok(r) => Ok(r),
            Err(e) => {
                let tail = stderr_tail(stderr);
                anyhow::bail!("Child operation for {root} failed ({st}): {e}\n{tail}")
            }
        }
    }
}
