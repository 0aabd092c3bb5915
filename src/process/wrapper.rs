//! Supervised execution of one external command.
//!
//! Both entry points race the child's exit against the cancellation
//! signal. When the signal wins the child is killed and then still reaped,
//! so neither function returns while the child is alive.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::ExecError;
use super::invocation::{Invocation, OutputBinding};
use crate::cancel::CancelSignal;

/// Exit status and combined stdout/stderr of a finished command.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub output: String,
}

enum Race {
    Exited(io::Result<ExitStatus>),
    Cancelled,
}

/// How the child is stopped when the signal fires.
#[derive(Clone, Copy)]
enum KillScope {
    /// The child runs in its own process group; kill the whole group.
    Group,
    /// The child shares our process group; kill only the child.
    Child,
}

/// Run a command with stdout and stderr captured into one buffer.
///
/// Fails with [`ExecError::OutputAlreadyBound`] without starting anything
/// if either output stream was already bound.
pub async fn run(invocation: &Invocation, signal: &CancelSignal) -> Result<ProcessOutput, ExecError> {
    let command_line = invocation.command_line();
    for (stream, binding) in [
        ("stdout", invocation.stdout_binding()),
        ("stderr", invocation.stderr_binding()),
    ] {
        if binding != OutputBinding::Unbound {
            return Err(ExecError::OutputAlreadyBound {
                command: command_line,
                stream,
            });
        }
    }
    refuse_if_cancelled(&command_line, signal)?;

    let mut command = invocation.command();
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        command: command_line.clone(),
        source,
    })?;
    debug!(command = %command_line, pid = ?child.id(), "spawned");

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let mut readers: Vec<JoinHandle<io::Result<()>>> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(stdout, buffer.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(stderr, buffer.clone())));
    }
    let feeder = feed_input(&mut child, invocation);
    // The group outlives the child while any descendant is still running.
    let pgid = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok());

    let status = supervise(&mut child, signal, KillScope::Group, &command_line).await;
    let descendants_killed = drain_output(readers, pgid, signal, &command_line).await;

    if let Some(feeder) = feeder {
        // A child that exits without draining stdin breaks the pipe.
        let _ = feeder.await;
    }
    let output = String::from_utf8_lossy(&buffer.lock().unwrap_or_else(PoisonError::into_inner))
        .into_owned();

    if descendants_killed {
        return Err(ExecError::Cancelled {
            command: command_line,
            reason: reason_text(signal),
            output,
        });
    }
    finish(command_line, status, output, signal)
}

/// Wait for the output pipes to close. Descendants that outlive the child
/// keep them open, so cancellation is still watched here: when it fires the
/// whole group is killed. Returns whether that kill happened.
async fn drain_output(
    readers: Vec<JoinHandle<io::Result<()>>>,
    pgid: Option<libc::pid_t>,
    signal: &CancelSignal,
    command_line: &str,
) -> bool {
    let drain = async {
        for reader in readers {
            if let Ok(Err(err)) = reader.await {
                debug!(command = %command_line, error = %err, "output reader stopped early");
            }
        }
    };
    tokio::pin!(drain);

    tokio::select! {
        biased;
        () = &mut drain => false,
        _ = signal.cancelled() => {
            debug!(command = %command_line, "cancellation requested while output is held open, killing process group");
            if let Some(pgid) = pgid {
                if let Err(err) = kill_group(pgid) {
                    warn!(command = %command_line, error = %err, "kill failed");
                }
            }
            drain.await;
            true
        }
    }
}

/// Run a command attached to this process's stdin, stdout and stderr.
pub async fn run_attached(
    invocation: &Invocation,
    signal: &CancelSignal,
) -> Result<ProcessOutput, ExecError> {
    let command_line = invocation.command_line();
    refuse_if_cancelled(&command_line, signal)?;

    let mut command = invocation.command();
    if invocation.stdin_input().is_none() {
        command.stdin(Stdio::inherit());
    }
    command
        .stdout(invocation.stdout_stdio())
        .stderr(invocation.stderr_stdio())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        command: command_line.clone(),
        source,
    })?;
    debug!(command = %command_line, pid = ?child.id(), "spawned attached");

    let feeder = feed_input(&mut child, invocation);
    let status = supervise(&mut child, signal, KillScope::Child, &command_line).await;
    if let Some(feeder) = feeder {
        let _ = feeder.await;
    }
    finish(command_line, status, String::new(), signal)
}

fn refuse_if_cancelled(command_line: &str, signal: &CancelSignal) -> Result<(), ExecError> {
    if signal.is_cancelled() {
        return Err(ExecError::Cancelled {
            command: command_line.to_string(),
            reason: reason_text(signal),
            output: String::new(),
        });
    }
    Ok(())
}

/// Wait for the child, killing it first if the signal fires. Returns the
/// exit status and whether a kill was issued.
async fn supervise(
    child: &mut Child,
    signal: &CancelSignal,
    scope: KillScope,
    command_line: &str,
) -> (io::Result<ExitStatus>, bool) {
    let race = tokio::select! {
        status = child.wait() => Race::Exited(status),
        _ = signal.cancelled() => Race::Cancelled,
    };

    match race {
        Race::Exited(status) => (status, false),
        Race::Cancelled => {
            debug!(command = %command_line, "cancellation requested, killing");
            if let Err(err) = kill(child, scope) {
                warn!(command = %command_line, error = %err, "kill failed");
            }
            (child.wait().await, true)
        }
    }
}

fn finish(
    command: String,
    status: (io::Result<ExitStatus>, bool),
    output: String,
    signal: &CancelSignal,
) -> Result<ProcessOutput, ExecError> {
    let (status, killed) = status;
    let status = status.map_err(|source| ExecError::Wait {
        command: command.clone(),
        source,
    })?;

    if status.success() {
        return Ok(ProcessOutput { status, output });
    }
    if killed && status.signal() == Some(libc::SIGKILL) {
        return Err(ExecError::Cancelled {
            command,
            reason: reason_text(signal),
            output,
        });
    }
    Err(ExecError::Failed {
        command,
        status,
        output,
    })
}

fn kill(child: &mut Child, scope: KillScope) -> io::Result<()> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return Ok(());
    };
    match scope {
        KillScope::Child => child.start_kill(),
        KillScope::Group => {
            let pgid = libc::pid_t::try_from(pid)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
            kill_group(pgid).or_else(|_| child.start_kill())
        }
    }
}

/// SIGKILL every process in the group. A group that is already gone is
/// not an error.
fn kill_group(pgid: libc::pid_t) -> io::Result<()> {
    // SAFETY: killpg has no memory-safety preconditions.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

fn feed_input(child: &mut Child, invocation: &Invocation) -> Option<JoinHandle<io::Result<()>>> {
    let input = invocation.stdin_input()?.to_vec();
    let stdin: ChildStdin = child.stdin.take()?;
    Some(tokio::spawn(async move {
        let mut stdin = stdin;
        stdin.write_all(&input).await?;
        stdin.shutdown().await
    }))
}

async fn pump<R>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(&chunk[..n]);
    }
}

fn reason_text(signal: &CancelSignal) -> String {
    signal
        .reason()
        .map(|reason| reason.to_string())
        .unwrap_or_else(|| "cancelled".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_captures_stdout_and_stderr_together() {
        let inv = Invocation::new("sh").args(["-c", "echo out; echo err >&2"]);
        let out = run(&inv, &CancelSignal::new()).await.unwrap();

        assert!(out.status.success());
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[tokio::test]
    async fn test_failure_carries_command_and_output() {
        let inv = Invocation::new("sh").args(["-c", "echo nope; exit 3"]);
        let err = run(&inv, &CancelSignal::new()).await.unwrap_err();

        let ExecError::Failed { status, output, command } = &err else {
            panic!("expected Failed, got {err}");
        };
        assert_eq!(status.code(), Some(3));
        assert_eq!(output.trim(), "nope");
        assert!(command.starts_with("sh -c"));
        assert!(err.to_string().ends_with("\nnope"));
    }

    #[tokio::test]
    async fn test_bound_output_is_refused_before_spawning() {
        let inv = Invocation::new("touch")
            .arg("/nonexistent/should-not-run")
            .stdout(OutputBinding::Inherit);
        let err = run(&inv, &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::OutputAlreadyBound { stream: "stdout", .. }
        ));

        let inv = Invocation::new("true").stderr(OutputBinding::Null);
        let err = run(&inv, &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::OutputAlreadyBound { stream: "stderr", .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_error() {
        let inv = Invocation::new("summon-no-such-program-xyz");
        let err = run(&inv, &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_input_reaches_stdin() {
        let inv = Invocation::new("cat").input("secret\n");
        let out = run(&inv, &CancelSignal::new()).await.unwrap();
        assert_eq!(out.output, "secret\n");
    }

    #[tokio::test]
    async fn test_cancel_kills_and_reaps() {
        let signal = CancelSignal::new();
        let canceller = {
            let signal = signal.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                signal.cancel(CancelReason::Interrupted);
            })
        };

        let started = Instant::now();
        let inv = Invocation::new("sh").args(["-c", "echo started; sleep 30; echo never"]);
        let err = run(&inv, &signal).await.unwrap_err();
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        let ExecError::Cancelled { reason, output, .. } = &err else {
            panic!("expected Cancelled, got {err}");
        };
        assert_eq!(reason, "interrupted by operator");
        assert!(output.contains("started"));
        assert!(!output.contains("never"));
    }

    #[tokio::test]
    async fn test_already_cancelled_signal_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let signal = CancelSignal::new();
        signal.cancel(CancelReason::Requested("shutting down".to_string()));

        let inv = Invocation::new("touch").arg(marker.to_string_lossy());
        let err = run(&inv, &signal).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(err.to_string().contains("shutting down"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_attached_run_reports_exit_status() {
        let inv = Invocation::new("sh")
            .args(["-c", "exit 4"])
            .stdout(OutputBinding::Null);
        let err = run_attached(&inv, &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(err, ExecError::Failed { status, .. } if status.code() == Some(4)));
    }

    #[tokio::test]
    async fn test_attached_run_is_cancellable() {
        let signal = CancelSignal::new();
        let canceller = {
            let signal = signal.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                signal.cancel(CancelReason::Interrupted);
            })
        };

        let inv = Invocation::new("sleep").arg("30");
        let err = run_attached(&inv, &signal).await.unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_cancelled());
    }
}
