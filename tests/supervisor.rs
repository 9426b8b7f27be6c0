//! Supervisor behavior against real processes.
//!
//! Readiness here is satisfied by a listener owned by the test (the
//! supervised commands are plain `sleep`/`sh` processes, not servers), so
//! the process-lifecycle paths can be exercised without a real HTTP server.

use servtest::process::{
    wait_for_port, ExitOutcome, ProcFsTree, SignalKind, Supervisor, SupervisorError,
    SupervisorState,
};
use std::net::TcpListener;
use std::time::{Duration, Instant};

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// A listening port the readiness probe can hit, held open for the test's
/// duration.
fn readiness_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    (listener, port)
}

/// A port with nothing behind it.
fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
    // listener drops here; the port refuses connections afterwards
}

#[test]
fn wait_for_port_sees_a_live_listener() {
    let (_listener, port) = readiness_listener();
    assert!(wait_for_port(port, Duration::from_secs(2)));
}

#[test]
fn startup_times_out_when_the_port_never_opens() {
    let port = dead_port();
    let start = Instant::now();
    let err = Supervisor::start(
        &cmd(&["sleep", "30"]),
        port,
        Duration::from_millis(500),
        100,
    )
    .unwrap_err();
    assert!(matches!(err, SupervisorError::StartupTimeout { .. }));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn wrapped_command_resolves_worker_behind_the_wrapper() {
    let (_listener, port) = readiness_listener();
    // `sh -c 'a && b'` keeps the first command as a child, standing in for
    // an instrumentation wrapper forking the real server.
    let mut supervisor = Supervisor::start(
        &cmd(&["/bin/sh", "-c", "sleep 30 && sleep 30"]),
        port,
        Duration::from_secs(2),
        100,
    )
    .expect("start");

    assert_eq!(supervisor.state(), SupervisorState::Running);
    let worker = supervisor.resolve_worker(&ProcFsTree, Duration::from_secs(2));
    let handle = supervisor.handle();
    assert!(handle.is_wrapped(), "expected a distinct worker pid");
    assert_eq!(handle.worker_pid, worker);
    assert_ne!(handle.worker_pid, handle.wrapper_pid);

    // Terminating the worker must bring the whole thing down within the
    // deadline.
    supervisor.signal(SignalKind::Terminate).expect("signal");
    assert_eq!(supervisor.state(), SupervisorState::SignalSent);
    let start = Instant::now();
    let outcome = supervisor
        .await_exit(Duration::from_secs(5))
        .expect("await exit");
    assert!(start.elapsed() < Duration::from_secs(5));
    // The shell reports the signaled child's status; what matters is that
    // it exited rather than being force-killed.
    assert!(matches!(outcome, ExitOutcome::Failed(_)));
    assert_eq!(supervisor.state(), SupervisorState::Exited);
}

#[test]
fn unwrapped_command_is_its_own_worker() {
    let (_listener, port) = readiness_listener();
    let mut supervisor = Supervisor::start(
        &cmd(&["sleep", "30"]),
        port,
        Duration::from_secs(2),
        100,
    )
    .expect("start");

    let worker = supervisor.resolve_worker(&ProcFsTree, Duration::from_millis(300));
    let handle = supervisor.handle();
    assert!(!handle.is_wrapped());
    assert_eq!(worker, handle.wrapper_pid);

    supervisor.signal(SignalKind::Interrupt).expect("signal");
    let outcome = supervisor
        .await_exit(Duration::from_secs(5))
        .expect("await exit");
    // `sleep` has no handler; death by SIGINT is a non-zero outcome.
    assert!(matches!(outcome, ExitOutcome::Failed(_)));
}

#[test]
fn clean_exit_is_classified_as_clean() {
    let (_listener, port) = readiness_listener();
    let mut supervisor = Supervisor::start(
        &cmd(&["/bin/sh", "-c", "sleep 0.2"]),
        port,
        Duration::from_secs(2),
        100,
    )
    .expect("start");
    let outcome = supervisor
        .await_exit(Duration::from_secs(5))
        .expect("await exit");
    assert_eq!(outcome, ExitOutcome::Clean);
}

#[test]
fn sentinel_exit_code_is_an_instrumentation_fault() {
    let (_listener, port) = readiness_listener();
    let mut supervisor = Supervisor::start(
        &cmd(&["/bin/sh", "-c", "exit 100"]),
        port,
        Duration::from_secs(2),
        100,
    )
    .expect("start");
    let outcome = supervisor
        .await_exit(Duration::from_secs(5))
        .expect("await exit");
    assert_eq!(outcome, ExitOutcome::InstrumentationFault(100));
}

#[test]
fn deadline_overrun_is_force_killed() {
    let (_listener, port) = readiness_listener();
    let mut supervisor = Supervisor::start(
        &cmd(&["sleep", "30"]),
        port,
        Duration::from_secs(2),
        100,
    )
    .expect("start");

    let start = Instant::now();
    let outcome = supervisor
        .await_exit(Duration::from_millis(300))
        .expect("await exit");
    assert_eq!(outcome, ExitOutcome::ForceKilled);
    assert_eq!(supervisor.state(), SupervisorState::ForceKilled);
    assert!(start.elapsed() < Duration::from_secs(5));
}
