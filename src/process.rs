//! Running external tools with a deadline
//!
//! Every external invocation (docker, git, clamscan, sigtool) goes through
//! [`run`], which kills the child once the timeout elapses.

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of a finished child process
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Exit code, or -1 when the process was terminated by a signal
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Fail unless the process exited successfully
    pub fn check(self, what: &str) -> Result<Self> {
        if self.status.success() {
            return Ok(self);
        }
        Err(anyhow!(
            "{} exited with status {}: {}",
            what,
            self.code(),
            self.stderr.trim()
        ))
    }
}

/// Run `cmd` to completion, optionally feeding `input` on stdin.
///
/// stdout and stderr are drained on helper threads so a chatty child cannot
/// block on a full pipe while we poll for exit.
pub fn run(cmd: &mut Command, input: Option<&str>, timeout: Duration) -> Result<CommandOutput> {
    let program = format!("{:?}", cmd.get_program());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() });

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to start {}", program))?;

    if let Some(input) = input {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .with_context(|| format!("Failed to write to stdin of {}", program))?;
        }
    }

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let start = Instant::now();
    let status = wait_with_deadline(&mut child, timeout, &program)?;
    debug!(program = %program, elapsed_ms = start.elapsed().as_millis() as u64, "command finished");

    Ok(CommandOutput {
        status,
        stdout: join(stdout),
        stderr: join(stderr),
    })
}

fn wait_with_deadline(child: &mut Child, timeout: Duration, program: &str) -> Result<ExitStatus> {
    let start = Instant::now();
    loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("Failed to wait for {}", program))?
        {
            return Ok(status);
        }
        if start.elapsed() >= timeout {
            warn!(program = %program, timeout_secs = timeout.as_secs(), "command timed out, killing");
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!("{} timed out after {}s", program, timeout.as_secs()));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}
