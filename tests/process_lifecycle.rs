//! End-to-end lifecycle tests for childproc
//!
//! Covers exit delivery through both the blocking wait and the SIGCHLD
//! dispatcher, stdin/stdout streaming, and idempotent teardown.

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use childproc::{Process, ProcessConfig, ProcessError, INVALID_ID, INVALID_STATUS};
use childproc_integration_tests::{init_tracing, ExitRecorder, OutputSink};

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn exit_zero_is_reported() {
    init_tracing();
    let exits = ExitRecorder::new();
    let process = Process::spawn(ProcessConfig::new("exit 0").on_exit(exits.callback()));

    assert_eq!(exits.next(TIMEOUT), Some(0));
    assert_eq!(process.wait(), 0);
}

#[test]
fn exit_code_is_reported_without_wait() {
    init_tracing();
    let exits = ExitRecorder::new();
    let _process =
        Process::spawn(ProcessConfig::new("sleep 0.2; exit 7").on_exit(exits.callback()));

    assert_eq!(exits.next(TIMEOUT), Some(7));
}

#[test]
fn echo_streams_stdout_then_ends() {
    init_tracing();
    let stdout = OutputSink::new();
    let stderr = OutputSink::new();
    let process = Process::spawn(
        ProcessConfig::new("echo hello")
            .on_stdout(stdout.callback())
            .on_stderr(stderr.callback()),
    );

    assert_eq!(process.wait(), 0);
    assert_eq!(stdout.text(), "hello\n");
    assert!(stderr.contents().is_empty());
}

#[test]
fn stderr_is_an_independent_stream() {
    init_tracing();
    let stdout = OutputSink::new();
    let stderr = OutputSink::new();
    let process = Process::spawn(
        ProcessConfig::new("echo out; echo err >&2")
            .on_stdout(stdout.callback())
            .on_stderr(stderr.callback()),
    );

    assert_eq!(process.wait(), 0);
    assert_eq!(stdout.text(), "out\n");
    assert_eq!(stderr.text(), "err\n");
}

#[test]
fn stdin_is_echoed_back() {
    init_tracing();
    let stdout = OutputSink::new();
    let process = Process::spawn(
        ProcessConfig::new("cat")
            .open_stdin(true)
            .on_stdout(stdout.callback()),
    );

    // The stdout reader drains concurrently, so cat never blocks on a full pipe.
    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(4096) {
        assert!(process.write(chunk).unwrap());
    }
    process.close_stdin();

    assert_eq!(process.wait(), 0);
    assert_eq!(stdout.contents(), payload);
}

#[test]
fn small_buffer_chunks_output() {
    init_tracing();
    let stdout = OutputSink::new();
    let process = Process::spawn(
        ProcessConfig::new("printf abcdefghij")
            .buffer_size(4)
            .on_stdout(stdout.callback()),
    );

    assert_eq!(process.wait(), 0);
    assert_eq!(stdout.text(), "abcdefghij");
    assert!(stdout.chunk_count() >= 3);
}

#[test]
fn write_without_open_stdin_is_a_precondition_error() {
    init_tracing();
    let process = Process::spawn(ProcessConfig::new("exit 0"));

    for _ in 0..3 {
        assert!(matches!(process.write(b"x"), Err(ProcessError::StdinNotOpen)));
    }
    assert_eq!(process.wait(), 0);
    assert!(matches!(process.write(b"x"), Err(ProcessError::StdinNotOpen)));
}

#[test]
fn repeated_teardown_notifies_once() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let stdout = OutputSink::new();
    let process = Process::spawn(
        ProcessConfig::new("echo done; exit 3")
            .open_stdin(true)
            .on_stdout(stdout.callback())
            .on_exit(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
    );

    process.kill(false);
    process.kill(false);
    let first = process.wait();
    assert_eq!(process.wait(), first);
    process.close();
    process.close_stdin();
    process.kill(true);
    drop(process);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_wait_and_kill_from_many_threads() {
    init_tracing();
    let exits = ExitRecorder::new();
    let process = Arc::new(Process::spawn(
        ProcessConfig::new("sleep 30")
            .on_stdout(|_| {})
            .on_exit(exits.callback()),
    ));

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let process = Arc::clone(&process);
            thread::spawn(move || process.wait())
        })
        .collect();

    thread::sleep(Duration::from_millis(100));
    for _ in 0..3 {
        process.kill(true);
    }

    let statuses: Vec<i32> = waiters.into_iter().map(|w| w.join().unwrap()).collect();
    assert!(statuses.iter().all(|s| *s == statuses[0] && *s != 0));
    assert_eq!(exits.next(TIMEOUT), Some(statuses[0]));
    assert!(exits.drain().is_empty());
}

#[test]
fn concurrent_processes_get_their_own_codes() {
    init_tracing();
    const COUNT: i32 = 8;
    let (tx, rx) = mpsc::channel();

    let processes: Vec<Process> = (0..COUNT)
        .map(|i| {
            let tx = tx.clone();
            let code = 10 + i;
            let command = format!(
                "n={}; while [ $n -gt 0 ]; do n=$((n-1)); done; exit {}",
                i * 50,
                code
            );
            Process::spawn(ProcessConfig::new(command).on_exit(move |status| {
                let _ = tx.send((code, status));
            }))
        })
        .collect();
    drop(tx);

    let mut seen = Vec::new();
    for _ in 0..COUNT {
        let (expected, status) = rx
            .recv_timeout(TIMEOUT)
            .expect("missing exit notification");
        assert_eq!(expected, status);
        seen.push(status);
    }
    seen.sort_unstable();
    assert_eq!(seen, (10..10 + COUNT).collect::<Vec<_>>());

    // Every child was already reaped by the dispatcher; wait replays the recorded status.
    for process in &processes {
        let status = process.wait();
        assert!(seen.contains(&status));
    }
}

#[test]
fn children_outlive_the_threads_that_spawned_them() {
    init_tracing();
    let exits = ExitRecorder::new();

    let processes: Vec<Process> = (0..4)
        .map(|i| {
            let on_exit = exits.callback();
            thread::spawn(move || {
                Process::spawn(
                    ProcessConfig::new(format!("sleep 0.3; exit {}", 20 + i)).on_exit(on_exit),
                )
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|worker| worker.join().unwrap())
        .collect();

    for (i, process) in processes.iter().enumerate() {
        assert_eq!(process.wait(), 20 + i as i32);
    }
    let mut statuses: Vec<i32> = (0..4).filter_map(|_| exits.next(TIMEOUT)).collect();
    statuses.sort_unstable();
    assert_eq!(statuses, vec![20, 21, 22, 23]);
}

#[test]
fn killed_by_signal_reports_offset_status() {
    init_tracing();
    let process = Process::spawn(ProcessConfig::new("exec sleep 30"));
    assert!(process.id() > 0);

    Process::kill_id(process.id(), true);
    assert_eq!(process.wait(), 128 + 15);
}

#[test]
fn spawn_failure_returns_sentinels() {
    init_tracing();
    let exits = ExitRecorder::new();
    let process = Process::spawn(
        ProcessConfig::new("exit 0")
            .shell("/nonexistent/childproc-shell")
            .on_stdout(|_| panic!("no reader should run"))
            .on_exit(exits.callback()),
    );

    assert_eq!(process.id(), INVALID_ID);
    assert_eq!(process.wait(), INVALID_STATUS);
    assert!(matches!(process.write(b"x"), Err(ProcessError::StdinNotOpen)));
    process.kill(false);
    drop(process);

    assert!(exits.drain().is_empty());
}

#[test]
fn environment_is_passed_through() {
    init_tracing();
    let stdout = OutputSink::new();
    let process = Process::spawn(
        ProcessConfig::new("printf %s \"$CHILDPROC_TEST_VAR\"")
            .env("CHILDPROC_TEST_VAR", "value with spaces")
            .on_stdout(stdout.callback()),
    );

    assert_eq!(process.wait(), 0);
    assert_eq!(stdout.text(), "value with spaces");
}

#[test]
fn inherited_descriptors_are_not_leaked() {
    init_tracing();
    if !std::path::Path::new("/proc/self/fd").exists() {
        return;
    }

    let stdout = OutputSink::new();
    // 0, 1, 2 and the directory handle ls opens to list them.
    let process = Process::spawn(
        ProcessConfig::new("ls /proc/self/fd | wc -l").on_stdout(stdout.callback()),
    );

    assert_eq!(process.wait(), 0);
    let count: usize = stdout.text().trim().parse().unwrap();
    assert!(count <= 4, "child saw {} descriptors", count);
}
