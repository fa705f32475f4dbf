//! Blocking subprocess execution with a hard timeout.
//!
//! stdout is collected and stderr is drained line by line on background
//! threads so a chatty child never blocks on a full pipe. The last few stderr
//! lines are kept for error messages.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::debug;

use crate::error::UpscaleError;

pub const STDERR_TARGET: &str = "child_stderr";
const STDERR_TAIL_LINES: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr_tail: String,
}

/// Forward stderr lines to tracing and return the tail once the pipe closes.
pub fn spawn_stderr_drain(stderr: ChildStderr, program: String) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) if !line.trim().is_empty() => {
                    debug!(target: "child_stderr", program = %program, "{}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Err(e) => {
                    debug!(target: "child_stderr", program = %program, "read error: {}", e);
                    break;
                }
                _ => {}
            }
        }
        Vec::from(tail).join("\n")
    })
}

pub fn spawn_piped(cmd: &mut Command, program: &str) -> Result<Child> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            UpscaleError::ExternalProcess {
                program: program.to_string(),
                reason: format!("failed to launch: {e}"),
            }
            .into()
        })
}

/// Wait for `child` with a deadline, killing it when the deadline passes.
pub fn wait_with_timeout(child: &mut Child, program: &str, timeout: Duration) -> Result<ExitStatus> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(UpscaleError::Timeout {
                program: program.to_string(),
                timeout,
            }
            .into());
        }
        thread::sleep(POLL_INTERVAL);
    }
}

pub fn run_with_timeout(mut cmd: Command, program: &str, timeout: Duration) -> Result<ProcessOutput> {
    debug!(program, ?timeout, "Running {:?}", cmd);
    let mut child = spawn_piped(&mut cmd, program)?;

    let stderr_thread = child
        .stderr
        .take()
        .map(|stderr| spawn_stderr_drain(stderr, program.to_string()));
    let stdout_thread = child.stdout.take().map(|mut stdout| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf);
            buf
        })
    });

    let status = wait_with_timeout(&mut child, program, timeout);
    let stdout = stdout_thread
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr_tail = stderr_thread
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    Ok(ProcessOutput {
        status: status?,
        stdout,
        stderr_tail,
    })
}

/// Like [`run_with_timeout`] but a non-zero exit is an `ExternalProcess` error.
pub fn run_checked(cmd: Command, program: &str, timeout: Duration) -> Result<ProcessOutput> {
    let output = run_with_timeout(cmd, program, timeout)?;
    if !output.status.success() {
        let reason = if output.stderr_tail.is_empty() {
            format!("exited with {}", output.status)
        } else {
            format!("exited with {}: {}", output.status, output.stderr_tail)
        };
        return Err(UpscaleError::ExternalProcess {
            program: program.to_string(),
            reason,
        }
        .into());
    }
    Ok(output)
}
