//! Child processes with a wall-clock timeout and bounded, concurrently drained output.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How to run one child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest<'a> {
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and dropped.
    pub output_limit_bytes: usize,
    /// Tee raw stdout to this file as it arrives.
    pub stdout_stream: Option<PathBuf>,
    /// Tee raw stderr to this file as it arrives.
    pub stderr_stream: Option<PathBuf>,
}

/// Captured child process output.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_dropped_bytes: usize,
    pub stderr_dropped_bytes: usize,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessOutput {
    /// Exit code, or `None` when the process timed out or died from a signal.
    pub fn exit_code(&self) -> Option<i32> {
        if self.timed_out {
            None
        } else {
            self.status.code()
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Platform shell invocation for a single command string.
pub fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let shell = if which_on_path("pwsh") {
            "pwsh"
        } else {
            "powershell"
        };
        let mut cmd = Command::new(shell);
        cmd.arg("-NoProfile").arg("-Command").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-lc").arg(command);
        cmd
    }
}

fn which_on_path(program: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        dir.join(program).is_file() || dir.join(format!("{program}.exe")).is_file()
    })
}

/// Run `cmd` to completion or until `request.timeout`, then kill it.
///
/// stdin is written and stdout/stderr are read on their own threads, so the
/// timeout runs even when the child never reads its input.
#[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), output_limit_bytes = request.output_limit_bytes))]
pub fn run_bounded(mut cmd: Command, request: &ProcessRequest<'_>) -> Result<ProcessOutput> {
    if request.stdin.is_some() {
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

    let stdout_tee = open_stream(request.stdout_stream.as_deref())?;
    let stderr_tee = open_stream(request.stderr_stream.as_deref())?;

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = request.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit, stdout_tee));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit, stderr_tee));

    let stdin_handle = match request.stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // Dropping `child_stdin` at the end of the write closes the pipe.
            Some(thread::spawn(move || {
                if let Err(e) = child_stdin.write_all(&input) {
                    debug!(err = %e, "child stdin closed before input was written");
                }
            }))
        }
        None => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(request.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(child.id());
            if let Err(e) = child.kill() {
                debug!(err = %e, "child already gone after group kill");
            }
            child.wait().context("wait command after kill")?
        }
    };
    let duration = started.elapsed();

    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }
    let (stdout, stdout_dropped_bytes) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_dropped_bytes) = join_output(stderr_handle).context("join stderr")?;

    if stdout_dropped_bytes > 0 || stderr_dropped_bytes > 0 {
        debug!(
            stdout_dropped_bytes,
            stderr_dropped_bytes, "output beyond memory limit dropped"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, duration_ms = duration.as_millis() as u64, "command finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        stdout_dropped_bytes,
        stderr_dropped_bytes,
        timed_out,
        duration,
    })
}

/// Kill the whole process group so grandchildren holding the output pipes die too.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let result = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        warn!(err = %e, pid, "failed to kill process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn open_stream(path: Option<&Path>) -> Result<Option<BufWriter<File>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create stream dir {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("create stream file {}", path.display()))?;
    Ok(Some(BufWriter::new(file)))
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    mut tee: Option<BufWriter<File>>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let tee_error = match tee.as_mut() {
            Some(writer) => writer
                .write_all(&chunk[..n])
                .and_then(|()| writer.flush())
                .err(),
            None => None,
        };
        if let Some(e) = tee_error {
            warn!(err = %e, "failed to write stream file");
            tee = None;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }

    Ok((buf, dropped))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(timeout: Duration) -> ProcessRequest<'static> {
        ProcessRequest {
            timeout,
            output_limit_bytes: 1024,
            ..ProcessRequest::default()
        }
    }

    #[test]
    fn captures_exit_code_and_output() {
        let output = run_bounded(
            shell_command("echo out; echo err >&2; exit 3"),
            &request(Duration::from_secs(5)),
        )
        .expect("run");
        assert_eq!(output.exit_code(), Some(3));
        assert_eq!(output.stdout_lossy(), "out\n");
        assert_eq!(output.stderr_lossy(), "err\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn kills_on_timeout() {
        let output = run_bounded(
            shell_command("sleep 5"),
            &request(Duration::from_millis(200)),
        )
        .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.exit_code(), None);
        assert!(output.duration < Duration::from_secs(5));
    }

    #[test]
    fn bounds_memory_and_tees_full_stream() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stream = temp.path().join("logs").join("stdout.log");
        let req = ProcessRequest {
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10,
            stdout_stream: Some(stream.clone()),
            ..ProcessRequest::default()
        };
        let output = run_bounded(shell_command("printf '%050d' 0"), &req).expect("run");
        assert_eq!(output.stdout.len(), 10);
        assert_eq!(output.stdout_dropped_bytes, 40);
        assert_eq!(fs::read_to_string(stream).expect("read").len(), 50);
    }

    #[test]
    fn feeds_stdin() {
        let req = ProcessRequest {
            stdin: Some(b"hello"),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 100,
            ..ProcessRequest::default()
        };
        let output = run_bounded(shell_command("cat"), &req).expect("run");
        assert_eq!(output.stdout_lossy(), "hello");
    }

    /// Verifies the timeout holds when the child never drains a large stdin.
    #[test]
    fn timeout_holds_with_unread_large_stdin() {
        let input = vec![b'x'; 1024 * 1024];
        let req = ProcessRequest {
            stdin: Some(&input),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 100,
            ..ProcessRequest::default()
        };
        let started = Instant::now();
        let output = run_bounded(shell_command("exec sleep 6"), &req).expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }
}
