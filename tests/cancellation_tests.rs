//! Cancellation and concurrency behavior against real processes.
//!
//! These spawn `sh` and `sleep`, so they need a unix host.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use summon::process::{self, ExecError, Invocation};
use summon::{CancelReason, CancelSignal, Runner, Step, Task};

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn record(&self, entry: &str) {
        self.0.lock().unwrap().push(entry.to_string());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

fn cancel_after(signal: &CancelSignal, delay: Duration) {
    let signal = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        signal.cancel(CancelReason::Requested("test cancelled the run".to_string()));
    });
}

#[tokio::test]
async fn test_cancelled_command_is_killed_and_reaped() {
    let signal = CancelSignal::new();
    cancel_after(&signal, Duration::from_millis(300));

    let started = Instant::now();
    let err = process::run(
        &Invocation::new("sh").args(["-c", "echo $$; sleep 30"]),
        &signal,
    )
    .await
    .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(err.is_cancelled(), "unexpected error: {err}");
    assert!(err.to_string().contains("test cancelled the run"));

    let pid: libc::pid_t = err.output().unwrap().trim().parse().unwrap();
    let alive = unsafe { libc::kill(pid, 0) };
    let errno = std::io::Error::last_os_error().raw_os_error();
    assert_eq!(alive, -1);
    assert_eq!(errno, Some(libc::ESRCH));
}

#[tokio::test]
async fn test_grandchildren_do_not_hold_up_cancellation() {
    let signal = CancelSignal::new();
    cancel_after(&signal, Duration::from_millis(200));

    let started = Instant::now();
    let err = process::run(
        &Invocation::new("sh").args(["-c", "sleep 30 & sleep 30 & wait"]),
        &signal,
    )
    .await
    .unwrap_err();

    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_background_child_holding_output_does_not_block_cancellation() {
    let signal = CancelSignal::new();
    cancel_after(&signal, Duration::from_millis(200));

    let started = Instant::now();
    let err = process::run(
        &Invocation::new("sh").args(["-c", "sleep 5 & echo hi"]),
        &signal,
    )
    .await
    .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(err.is_cancelled(), "unexpected error: {err}");
    assert!(err.to_string().contains("test cancelled the run"));
    assert!(err.output().unwrap().contains("hi"));
}

#[tokio::test]
async fn test_interrupted_step_still_unwinds_earlier_cleanups() {
    let journal = Journal::default();

    let j = journal.clone();
    let jd = journal.clone();
    let setup = Step::new("setup")
        .action(move |_| {
            let j = j.clone();
            async move {
                j.record("do:setup");
                Ok(())
            }
        })
        .cleanup(move |signal| {
            let jd = jd.clone();
            async move {
                assert!(!signal.is_cancelled());
                jd.record("defer:setup");
                Ok(())
            }
        });

    let j = journal.clone();
    let blocked = Step::new("blocked").action(move |signal| {
        let j = j.clone();
        async move {
            j.record("do:blocked");
            process::run(&Invocation::new("sleep").arg("30"), &signal).await?;
            j.record("finished:blocked");
            Ok::<(), anyhow::Error>(())
        }
    });

    let j = journal.clone();
    let never = Step::new("never").action(move |_| {
        let j = j.clone();
        async move {
            j.record("do:never");
            Ok(())
        }
    });

    let signal = CancelSignal::new();
    cancel_after(&signal, Duration::from_millis(200));
    let task = Task::serial("run", [Task::from(setup), Task::from(blocked), Task::from(never)]);

    let started = Instant::now();
    let err = Runner::new(signal).run(&task).await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(err.task(), Some("blocked"));
    assert!(err.source_as::<ExecError>().is_some_and(ExecError::is_cancelled));
    assert_eq!(
        journal.entries(),
        vec!["do:setup", "do:blocked", "defer:setup"]
    );
}

#[tokio::test]
async fn test_parallel_failure_does_not_cancel_siblings() {
    let journal = Journal::default();

    let j = journal.clone();
    let slow = Step::new("slow").action(move |signal| {
        let j = j.clone();
        async move {
            process::run(&Invocation::new("sleep").arg("0.3"), &signal).await?;
            j.record("slow finished");
            Ok::<(), anyhow::Error>(())
        }
    });
    let fast = Step::new("fast").action(|_| async { Err(anyhow!("fast broke")) });

    let started = Instant::now();
    let err = Runner::default()
        .run(&Task::parallel("both", [Task::from(slow), Task::from(fast)]))
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(err.task(), Some("fast"));
    assert_eq!(journal.entries(), vec!["slow finished"]);
}
