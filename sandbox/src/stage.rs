//! The stage runner (C2): executes one child process inside a sandbox under
//! a [`ProcessResourceLimits`] and produces a [`StageResult`] no matter how
//! the child ends — normal exit, signal, or a limit tripping.

use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::time::timeout;

use crate::process::{ProcessBuilder, ProcessRedirection};
use crate::{ProcessResourceLimits, ProcessResourceUsage, Result};

/// Grace window between a graceful termination signal and an unconditional
/// kill.
const KILL_GRACE_PERIOD: Duration = Duration::from_millis(250);

/// How often the resource-accounting task samples CPU time and RSS while the
/// child is running.
const USAGE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// High-level outcome tag carried on [`StageResult::status`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StageStatus {
    Ok,
    TimeLimit,
    MemoryLimit,
    OutputLimit,
    RuntimeError,
    KilledBySignal,
}

impl StageStatus {
    fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Ok => "OK",
            StageStatus::TimeLimit => "TimeLimit",
            StageStatus::MemoryLimit => "MemoryLimit",
            StageStatus::OutputLimit => "OutputLimit",
            StageStatus::RuntimeError => "RuntimeError",
            StageStatus::KilledBySignal => "KilledBySignal",
        }
    }
}

/// The structured outcome of one child execution.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StageResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_bytes: u64,
    pub status: Option<String>,
    pub message: Option<String>,
}

impl StageResult {
    fn from_limit(
        reason: StageStatus,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        signal: &str,
        wall_time_ms: u64,
        usage: &ProcessResourceUsage,
        message: impl Into<String>,
    ) -> StageResult {
        StageResult {
            stdout,
            stderr,
            exit_code: None,
            signal: Some(signal.to_owned()),
            wall_time_ms,
            cpu_time_ms: usage.cpu_time().as_millis() as u64,
            memory_bytes: usage.peak_memory.bytes() as u64,
            status: Some(reason.as_str().to_owned()),
            message: Some(message.into()),
        }
    }
}

/// Run `program`/`args` inside `sandbox` under `limits`, feeding it
/// `stdin_bytes` and capping each of stdout/stderr at `output_cap` bytes.
///
/// Guarantees a [`StageResult`] even when the child is killed by limit
/// enforcement, and never returns with the child still alive.
pub async fn run_stage(
    program: &str,
    args: &[String],
    working_dir_sandbox: impl FnOnce(&mut ProcessBuilder),
    stdin_bytes: &[u8],
    limits: ProcessResourceLimits,
    output_cap: usize,
) -> Result<StageResult> {
    let mut builder = ProcessBuilder::new(program);
    builder.add_args(args.iter().cloned())?;
    builder.limits(limits);
    builder.stdin(ProcessRedirection::Piped);
    builder.stdout(ProcessRedirection::Piped);
    builder.stderr(ProcessRedirection::Piped);
    working_dir_sandbox(&mut builder);

    let mut child = builder.start()?;

    let mut stdin = child.stdin.take().expect("stdin is piped");
    let stdin_bytes = stdin_bytes.to_vec();
    let feed = tokio::spawn(async move {
        // A child that never reads stdin (or exits immediately) makes this
        // write fail; that's expected and not an error for the stage.
        let _ = stdin.write_all(&stdin_bytes).await;
        drop(stdin);
    });

    let mut stdout_pipe = child.stdout.take().expect("stdout is piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr is piped");

    let start = Instant::now();

    let wall_time_limit = limits.wall_time_limit;
    let mut usage = ProcessResourceUsage::empty();

    let outcome = run_until_done(
        &mut child,
        &mut stdout_pipe,
        &mut stderr_pipe,
        output_cap,
        wall_time_limit,
        limits,
        &mut usage,
    )
    .await;

    let _ = feed.await;
    let wall_time_ms = start.elapsed().as_millis() as u64;

    Ok(finish(outcome, wall_time_ms, &usage))
}

/// What made the run loop stop.
enum RunOutcome {
    Exited(std::process::ExitStatus),
    OutputCapped,
    WallTimeExceeded,
    MemoryExceeded,
}

async fn run_until_done(
    child: &mut Child,
    stdout_pipe: &mut (impl AsyncRead + Unpin),
    stderr_pipe: &mut (impl AsyncRead + Unpin),
    output_cap: usize,
    wall_time_limit: Option<Duration>,
    limits: ProcessResourceLimits,
    usage: &mut ProcessResourceUsage,
) -> (RunOutcome, Vec<u8>, Vec<u8>) {
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout_done = false;
    let mut stderr_done = false;

    let deadline_sleep = async {
        match wall_time_limit {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline_sleep);

    let mut poll_usage = tokio::time::interval(USAGE_POLL_INTERVAL);
    let mut exited = false;

    loop {
        if exited && stdout_done && stderr_done {
            // Child has exited and both streams hit EOF: nothing left to
            // race on, just report it.
            let status = child.wait().await.expect("waiting on a reaped child does not fail");
            return (RunOutcome::Exited(status), stdout_buf, stderr_buf);
        }

        // `biased` makes tokio poll these branches top-to-bottom instead of
        // in random order, so when two conditions trip on the same wake
        // (e.g. a child both over wall time and over memory at once) the
        // higher-priority outcome wins deterministically rather than
        // whichever branch the random picker happened to favor. Priority
        // order: signal/exit > output cap > wall time > memory (a CPU-limit
        // kill surfaces as a signal here too — RLIMIT_CPU sends SIGXCPU,
        // which `finish`'s `Exited` branch reclassifies as `TimeLimit` — so
        // it already wins over output/wall-time/memory by virtue of being
        // reported through the first branch).
        tokio::select! {
            biased;

            status = child.wait(), if !exited => {
                let _ = status.expect("waiting on child does not fail");
                exited = true;
                // Don't return yet: drain whatever the child already wrote
                // before its pipes close, rather than racing the exit
                // notification against buffered output.
            }

            n = read_capped(stdout_pipe, &mut stdout_buf, output_cap), if !stdout_done => {
                match n {
                    Ok(0) => stdout_done = true,
                    Ok(_) => {}
                    Err(()) => {
                        kill_with_grace(child).await;
                        drain_to_cap(stdout_pipe, &mut stdout_buf, output_cap).await;
                        drain_to_cap(stderr_pipe, &mut stderr_buf, output_cap).await;
                        return (RunOutcome::OutputCapped, stdout_buf, stderr_buf);
                    }
                }
            }

            n = read_capped(stderr_pipe, &mut stderr_buf, output_cap), if !stderr_done => {
                match n {
                    Ok(0) => stderr_done = true,
                    Ok(_) => {}
                    Err(()) => {
                        kill_with_grace(child).await;
                        drain_to_cap(stdout_pipe, &mut stdout_buf, output_cap).await;
                        drain_to_cap(stderr_pipe, &mut stderr_buf, output_cap).await;
                        return (RunOutcome::OutputCapped, stdout_buf, stderr_buf);
                    }
                }
            }

            _ = &mut deadline_sleep, if !exited => {
                kill_with_grace(child).await;
                drain_to_cap(stdout_pipe, &mut stdout_buf, output_cap).await;
                drain_to_cap(stderr_pipe, &mut stderr_buf, output_cap).await;
                return (RunOutcome::WallTimeExceeded, stdout_buf, stderr_buf);
            }

            _ = poll_usage.tick(), if !exited => {
                if let Some(pid) = child.id() {
                    if let Some(sample) = sample_usage(pid) {
                        usage.update(&sample);
                        if let Some(limit) = limits.memory_limit {
                            if usage.peak_memory > limit {
                                kill_with_grace(child).await;
                                drain_to_cap(stdout_pipe, &mut stdout_buf, output_cap).await;
                                drain_to_cap(stderr_pipe, &mut stderr_buf, output_cap).await;
                                return (RunOutcome::MemoryExceeded, stdout_buf, stderr_buf);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Read into `buf` up to `cap` total bytes. Returns `Ok(n)` for a normal read
/// of `n` bytes (`0` at EOF), or `Err(())` once the stream actually has more
/// than `cap` bytes to give — the caller is responsible for killing the
/// child and is not expected to keep reading from this side after that.
///
/// A program that produces exactly `cap` bytes and then exits cleanly must
/// not be reported as truncated, so reaching `buf.len() == cap` alone is not
/// enough to decide overflow: every read asks for one byte more than the
/// remaining budget, so a read that returns nothing beyond the budget (or
/// hits EOF) is distinguishable from one that proves there was more to come.
async fn read_capped(
    reader: &mut (impl AsyncRead + Unpin),
    buf: &mut Vec<u8>,
    cap: usize,
) -> std::result::Result<usize, ()> {
    if buf.len() > cap {
        return Err(());
    }

    let remaining = cap - buf.len();
    let mut chunk = [0u8; 4096];
    let want = chunk.len().min(remaining + 1);
    let n = reader.read(&mut chunk[..want]).await.unwrap_or(0);
    if n == 0 {
        return Ok(0);
    }

    if n > remaining {
        buf.extend_from_slice(&chunk[..remaining]);
        return Err(());
    }

    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

/// Drain whatever is immediately available on `reader` into `buf`, up to
/// `cap`, without blocking for more. Used after the child has been killed to
/// pick up any output it produced before the kill landed.
async fn drain_to_cap(reader: &mut (impl AsyncRead + Unpin), buf: &mut Vec<u8>, cap: usize) {
    if buf.len() >= cap {
        return;
    }
    let mut chunk = vec![0u8; cap - buf.len()];
    if let Ok(Ok(n)) = timeout(Duration::from_millis(50), reader.read(&mut chunk)).await {
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn kill_with_grace(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }

    if timeout(KILL_GRACE_PERIOD, child.wait()).await.is_err() {
        // Graceful shutdown didn't land in time; tokio's `kill_on_drop` is
        // also armed, but we don't want to wait for a drop to reap this.
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

fn sample_usage(pid: u32) -> Option<ProcessResourceUsage> {
    let process = procfs::process::Process::new(pid as i32).ok()?;
    let stat = process.stat().ok()?;
    let status = process.status().ok()?;

    let user = crate::misc::duration_from_clocks(stat.utime as libc::clock_t);
    let kernel = crate::misc::duration_from_clocks(stat.stime as libc::clock_t);
    let rss_bytes = status.vmrss.unwrap_or(0) * 1024;

    Some(ProcessResourceUsage {
        user_cpu_time: user,
        kernel_cpu_time: kernel,
        peak_memory: crate::MemorySize::Bytes(rss_bytes as usize),
    })
}

/// Turn a raw run outcome plus the accumulated usage sample into the
/// contract-facing [`StageResult`], applying the termination-priority order
/// signal > output limit > wall time > CPU time > memory.
fn finish(
    outcome: (RunOutcome, Vec<u8>, Vec<u8>),
    wall_time_ms: u64,
    usage: &ProcessResourceUsage,
) -> StageResult {
    let (outcome, stdout, stderr) = outcome;

    match outcome {
        RunOutcome::OutputCapped => StageResult::from_limit(
            StageStatus::OutputLimit,
            stdout,
            stderr,
            "SIGTERM",
            wall_time_ms,
            usage,
            "output exceeded the configured cap",
        ),

        RunOutcome::WallTimeExceeded => StageResult::from_limit(
            StageStatus::TimeLimit,
            stdout,
            stderr,
            "SIGKILL",
            wall_time_ms,
            usage,
            "wall time limit exceeded",
        ),

        RunOutcome::MemoryExceeded => StageResult::from_limit(
            StageStatus::MemoryLimit,
            stdout,
            stderr,
            "SIGKILL",
            wall_time_ms,
            usage,
            "memory limit exceeded",
        ),

        RunOutcome::Exited(status) => {
            use std::os::unix::process::ExitStatusExt;

            if let Some(sig) = status.signal() {
                let name = signal_name(sig);
                // A process that exhausted its CPU rlimit is killed with
                // SIGXCPU (or SIGKILL if the hard limit is reached first);
                // surface that distinctly from an arbitrary crash signal.
                let status_tag = if sig == libc::SIGXCPU {
                    StageStatus::TimeLimit
                } else {
                    StageStatus::KilledBySignal
                };
                StageResult {
                    stdout,
                    stderr,
                    exit_code: None,
                    signal: Some(name),
                    wall_time_ms,
                    cpu_time_ms: usage.cpu_time().as_millis() as u64,
                    memory_bytes: usage.peak_memory.bytes() as u64,
                    status: Some(status_tag.as_str().to_owned()),
                    message: None,
                }
            } else {
                let code = status.code().unwrap_or(-1);
                let status_tag = if code == 0 {
                    StageStatus::Ok
                } else {
                    StageStatus::RuntimeError
                };
                StageResult {
                    stdout,
                    stderr,
                    exit_code: Some(code),
                    signal: None,
                    wall_time_ms,
                    cpu_time_ms: usage.cpu_time().as_millis() as u64,
                    memory_bytes: usage.peak_memory.bytes() as u64,
                    status: Some(status_tag.as_str().to_owned()),
                    message: None,
                }
            }
        }
    }
}

fn signal_name(sig: i32) -> String {
    match nix::sys::signal::Signal::from_c_int(sig) {
        Ok(signal) => signal.as_str().to_owned(),
        Err(_) => format!("SIG{}", sig),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_stage_captures_stdout_within_cap() {
        let result = run_stage(
            "/bin/sh",
            &["-c".to_owned(), "echo hello".to_owned()],
            |_b| {},
            b"",
            ProcessResourceLimits::default(),
            1024,
        )
        .await
        .expect("stage runs");

        assert_eq!(b"hello\n", result.stdout.as_slice());
        assert_eq!(Some(0), result.exit_code);
        assert_eq!(None, result.signal);
        assert_eq!(Some("OK".to_owned()), result.status);
    }

    #[tokio::test]
    async fn test_run_stage_enforces_wall_time_limit() {
        let result = run_stage(
            "/bin/sh",
            &["-c".to_owned(), "sleep 5".to_owned()],
            |_b| {},
            b"",
            ProcessResourceLimits {
                wall_time_limit: Some(Duration::from_millis(100)),
                ..Default::default()
            },
            1024,
        )
        .await
        .expect("stage runs");

        assert_eq!(Some("TimeLimit".to_owned()), result.status);
        assert!(result.signal.is_some());
        assert_eq!(None, result.exit_code);
        assert!(result.wall_time_ms < 2000);
    }

    #[tokio::test]
    async fn test_run_stage_truncates_output_and_kills_child() {
        let result = run_stage(
            "/bin/sh",
            &[
                "-c".to_owned(),
                "yes | head -c 1000000".to_owned(),
            ],
            |_b| {},
            b"",
            ProcessResourceLimits::default(),
            64,
        )
        .await
        .expect("stage runs");

        assert!(result.stdout.len() <= 65);
        assert_eq!(Some("OutputLimit".to_owned()), result.status);
    }

    #[tokio::test]
    async fn test_run_stage_output_exactly_at_cap_is_not_truncated() {
        let result = run_stage(
            "/bin/sh",
            &["-c".to_owned(), "head -c 64 /dev/zero".to_owned()],
            |_b| {},
            b"",
            ProcessResourceLimits::default(),
            64,
        )
        .await
        .expect("stage runs");

        assert_eq!(64, result.stdout.len());
        assert_eq!(Some(0), result.exit_code);
        assert_eq!(None, result.signal);
        assert_eq!(Some("OK".to_owned()), result.status);
    }

    #[tokio::test]
    async fn test_run_stage_reports_nonzero_exit() {
        let result = run_stage(
            "/bin/sh",
            &["-c".to_owned(), "exit 7".to_owned()],
            |_b| {},
            b"",
            ProcessResourceLimits::default(),
            1024,
        )
        .await
        .expect("stage runs");

        assert_eq!(Some(7), result.exit_code);
        assert_eq!(Some("RuntimeError".to_owned()), result.status);
    }

    #[tokio::test]
    async fn test_run_stage_feeds_stdin() {
        let result = run_stage(
            "/bin/sh",
            &["-c".to_owned(), "read x && echo \"got:$x\"".to_owned()],
            |_b| {},
            b"5\n",
            ProcessResourceLimits::default(),
            1024,
        )
        .await
        .expect("stage runs");

        assert_eq!(b"got:5\n", result.stdout.as_slice());
    }
}
