//! Helpers for running child processes with timeouts, cancellation and
//! bounded output.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::cancel::CancelToken;

/// Bounded channel capacity between a streaming reader thread and its consumer.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Resource limits for one child process.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and counted.
    pub output_limit_bytes: usize,
    /// How often the cancel token is checked while waiting.
    pub poll_interval: Duration,
}

/// Why a child stopped before exiting on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    TimedOut,
    Cancelled,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    /// Exit code, or `None` if the process was killed or died by signal.
    pub fn exit_code(&self) -> Option<i32> {
        if self.timed_out || self.cancelled {
            return None;
        }
        self.status.code()
    }

    pub fn stdout_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        text
    }

    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        if self.timed_out {
            text.push_str("\n[command timed out]\n");
        }
        text
    }
}

/// Outcome of [`stream_command_lines`].
#[derive(Debug)]
pub struct StreamOutcome {
    pub status: ExitStatus,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Build a `sh -c` command rooted at `workdir`.
pub fn shell_command(script: &str, workdir: &std::path::Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(workdir);
    cmd
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. If `cancel` fires, the
/// child (and its process group) is killed and the output is marked cancelled.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command(
    cmd: Command,
    stdin: Option<&[u8]>,
    limits: &RunLimits,
    cancel: Option<&CancelToken>,
) -> Result<CommandOutput> {
    let mut child = spawn_piped(cmd, stdin.is_some())?;
    write_stdin(&mut child, stdin)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let (status, interrupt) = wait_with_limits(&mut child, limits, cancel)?;

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), ?interrupt, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out: interrupt == Some(Interrupt::TimedOut),
        cancelled: interrupt == Some(Interrupt::Cancelled),
    })
}

/// Run a command and hand each stdout line to `on_line` as it arrives.
///
/// A reader thread feeds lines through a bounded channel that this thread
/// consumes synchronously, so a fast producer blocks instead of growing an
/// unbounded buffer. `on_line` returns `false` to stop keeping lines; the
/// pipe is still drained until the child exits.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs()))]
pub fn stream_command_lines<F>(
    cmd: Command,
    stdin: Option<&[u8]>,
    limits: &RunLimits,
    cancel: Option<&CancelToken>,
    mut on_line: F,
) -> Result<StreamOutcome>
where
    F: FnMut(&str) -> bool,
{
    let mut child = spawn_piped(cmd, stdin.is_some())?;
    write_stdin(&mut child, stdin)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::sync_channel::<String>(STREAM_CHANNEL_CAPACITY);
    let reader = thread::spawn(move || -> Result<()> {
        for line in BufReader::new(stdout).lines() {
            let line = line.context("read stdout line")?;
            if tx.send(line).is_err() {
                break;
            }
        }
        Ok(())
    });
    let limit = limits.output_limit_bytes;
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let deadline = Instant::now() + limits.timeout;
    let mut interrupt = None;
    let mut keep = true;
    loop {
        match rx.recv_timeout(limits.poll_interval) {
            Ok(line) => {
                if keep {
                    keep = on_line(&line);
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if interrupt.is_none() {
            if Instant::now() >= deadline {
                warn!(timeout_secs = limits.timeout.as_secs(), "command timed out, killing");
                kill_child(&mut child)?;
                interrupt = Some(Interrupt::TimedOut);
            } else if cancel.is_some_and(CancelToken::is_cancelled) {
                warn!("command cancelled, killing");
                kill_child(&mut child)?;
                interrupt = Some(Interrupt::Cancelled);
            }
        }
    }

    match reader.join() {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("stdout reader thread panicked")),
    }
    let status = child.wait().context("wait for command")?;
    let (stderr, _) = join_output(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), ?interrupt, "streamed command finished");
    Ok(StreamOutcome {
        status,
        stderr,
        timed_out: interrupt == Some(Interrupt::TimedOut),
        cancelled: interrupt == Some(Interrupt::Cancelled),
    })
}

fn spawn_piped(mut cmd: Command, pipe_stdin: bool) -> Result<Child> {
    if pipe_stdin {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    match cmd.spawn() {
        Ok(child) => Ok(child),
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            Err(e).context("spawn command")
        }
    }
}

fn write_stdin(child: &mut Child, stdin: Option<&[u8]>) -> Result<()> {
    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }
    Ok(())
}

fn wait_with_limits(
    child: &mut Child,
    limits: &RunLimits,
    cancel: Option<&CancelToken>,
) -> Result<(ExitStatus, Option<Interrupt>)> {
    let deadline = Instant::now() + limits.timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            warn!(timeout_secs = limits.timeout.as_secs(), "command timed out, killing");
            kill_child(child)?;
            let status = child.wait().context("wait command after kill")?;
            return Ok((status, Some(Interrupt::TimedOut)));
        }
        let slice = limits.poll_interval.min(deadline - now);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            return Ok((status, None));
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("command cancelled, killing");
            kill_child(child)?;
            let status = child.wait().context("wait command after kill")?;
            return Ok((status, Some(Interrupt::Cancelled)));
        }
    }
}

/// Kill the child and anything it spawned into its process group.
fn kill_child(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        let _ = Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    match child.kill() {
        Ok(()) => Ok(()),
        // Already reaped by the group kill.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e).context("kill command"),
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
