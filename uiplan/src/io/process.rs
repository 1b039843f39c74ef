//! Runs an external recognizer: input bytes in on stdin, bounded output back.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// What a piped child produced before it exited or was killed.
#[derive(Debug)]
pub struct PipedOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    /// Bytes of stdout drained but not kept.
    pub stdout_dropped: usize,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl PipedOutput {
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Feed `input` to `cmd` on stdin and collect its output, killing it after
/// `timeout`.
///
/// Stdin, stdout and stderr are serviced on their own threads so a child that
/// writes before it finishes reading cannot deadlock. At most `keep_bytes` of
/// each stream are held; the rest is drained and counted.
#[instrument(skip_all, fields(input_bytes = input.len(), timeout_ms = timeout.as_millis() as u64))]
pub fn run_piped(
    mut cmd: Command,
    input: &[u8],
    timeout: Duration,
    keep_bytes: usize,
) -> Result<PipedOutput> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        error!(err = %e, program = ?cmd.get_program(), "failed to spawn");
        anyhow!(e).context(format!("spawn {:?}", cmd.get_program()))
    })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("stdin was not piped"))?;
    let input = input.to_vec();
    let writer = thread::spawn(move || {
        // Early exit closes the pipe; the exit status reports it.
        if let Err(e) = stdin.write_all(&input) {
            debug!(err = %e, "stdin closed early");
        }
    });
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_reader = thread::spawn(move || drain_capped(stdout, keep_bytes));
    let stderr_reader = thread::spawn(move || drain_capped(stderr, keep_bytes));

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for child")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "child timed out, killing");
            child.kill().context("kill child")?;
            (child.wait().context("reap killed child")?, true)
        }
    };

    if writer.join().is_err() {
        warn!("stdin writer panicked");
    }
    let (stdout, stdout_dropped) = join_reader(stdout_reader).context("collect stdout")?;
    let (stderr, _) = join_reader(stderr_reader).context("collect stderr")?;
    if stdout_dropped > 0 {
        warn!(stdout_dropped, "child output exceeded limit");
    }

    debug!(exit_code = ?status.code(), timed_out, stdout_bytes = stdout.len(), "child finished");
    Ok(PipedOutput {
        status,
        stdout,
        stdout_dropped,
        stderr,
        timed_out,
    })
}

fn join_reader(handle: JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader panicked"))?
}

/// Read `reader` to EOF, keeping the first `cap` bytes. Returns the kept
/// bytes and how many were dropped.
fn drain_capped<R: Read>(mut reader: R, cap: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read child output")?;
        if n == 0 {
            return Ok((kept, dropped));
        }
        let room = cap.saturating_sub(kept.len()).min(n);
        kept.extend_from_slice(&chunk[..room]);
        dropped += n - room;
    }
}
