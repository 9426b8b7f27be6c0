//! Process supervision for the server under test.
//!
//! Launches the (possibly instrumentation-wrapped) server in its own process
//! group, waits for TCP readiness, resolves the real worker pid behind the
//! wrapper, delivers lifecycle signals, and enforces exit deadlines. Signals
//! must reach the worker, not the wrapper: signaling valgrind instead of the
//! server would not exercise the server's own signal handling.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Poll interval for readiness, worker resolution, and exit waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-attempt connect timeout while probing readiness.
const CONNECT_ATTEMPT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("server did not accept connections on port {port} within {timeout:?}")]
    StartupTimeout { port: u16, timeout: Duration },

    #[error("failed to deliver {signal} to pid {pid}: {source}")]
    Signal {
        signal: SignalKind,
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// The two lifecycle signals the scenarios deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Interrupt,
    Terminate,
}

impl SignalKind {
    fn as_raw(self) -> libc::c_int {
        match self {
            Self::Interrupt => libc::SIGINT,
            Self::Terminate => libc::SIGTERM,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Capability to inspect parent/child process relationships. The supervisor
/// depends only on this interface; platforms without /proc substitute their
/// own backend.
pub trait ProcessTreeQuery {
    fn children_of(&self, pid: u32) -> io::Result<Vec<u32>>;
}

/// Linux backend reading `/proc/<pid>/task/<pid>/children`.
pub struct ProcFsTree;

impl ProcessTreeQuery for ProcFsTree {
    fn children_of(&self, pid: u32) -> io::Result<Vec<u32>> {
        let path = format!("/proc/{pid}/task/{pid}/children");
        let content = std::fs::read_to_string(path)?;
        Ok(content
            .split_whitespace()
            .filter_map(|token| token.parse().ok())
            .collect())
    }
}

/// Pids of the launched process and of the process that must receive
/// signals. Equal only when no wrapping instrumentation layer is interposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub wrapper_pid: u32,
    pub worker_pid: u32,
}

impl ProcessHandle {
    pub fn is_wrapped(&self) -> bool {
        self.wrapper_pid != self.worker_pid
    }
}

/// How the supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit code 0.
    Clean,
    /// The instrumentation tool's sentinel exit code: it detected a fault.
    InstrumentationFault(i32),
    /// Any other non-zero exit code (or death by an unexpected signal).
    Failed(i32),
    /// The process ignored its deadline and was force-killed. A server that
    /// fails to exit promptly after a termination signal is a correctness
    /// violation, not a tolerated slow path.
    ForceKilled,
}

impl ExitOutcome {
    pub fn is_clean(self) -> bool {
        self == Self::Clean
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    SignalSent,
    Exited,
    ForceKilled,
}

/// Supervises one launched server process for the duration of a scenario.
#[derive(Debug)]
pub struct Supervisor {
    child: Child,
    handle: ProcessHandle,
    fault_exit_code: i32,
    state: SupervisorState,
}

impl Supervisor {
    /// Launch `command` in a new process group and wait until
    /// `readiness_port` accepts a TCP connection.
    ///
    /// The process group isolates the server from the harness's own signal
    /// handling and lets a force-kill take the whole tree down at once.
    pub fn start(
        command: &[String],
        readiness_port: u16,
        startup_timeout: Duration,
        fault_exit_code: i32,
    ) -> Result<Self, SupervisorError> {
        let (program, args) = command.split_first().ok_or_else(|| SupervisorError::Spawn {
            command: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command line"),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args).stdout(Stdio::null()).stderr(Stdio::null());
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        tracing::debug!(command = ?command, "launching server under test");
        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: command.join(" "),
            source,
        })?;

        let pid = child.id();
        let mut supervisor = Self {
            child,
            handle: ProcessHandle {
                wrapper_pid: pid,
                worker_pid: pid,
            },
            fault_exit_code,
            state: SupervisorState::Running,
        };

        if !wait_for_port(readiness_port, startup_timeout) {
            supervisor.force_kill();
            return Err(SupervisorError::StartupTimeout {
                port: readiness_port,
                timeout: startup_timeout,
            });
        }

        tracing::info!(pid, port = readiness_port, "server ready");
        Ok(supervisor)
    }

    pub fn handle(&self) -> ProcessHandle {
        self.handle
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Resolve the worker pid behind the wrapper, polling `tree` until a
    /// child appears or `timeout` elapses. With no child within the bound
    /// the wrapper itself is the worker (direct, un-wrapped execution).
    /// Must be called before [`Supervisor::signal`].
    pub fn resolve_worker(&mut self, tree: &dyn ProcessTreeQuery, timeout: Duration) -> u32 {
        let worker = resolve_worker_pid(tree, self.handle.wrapper_pid, timeout);
        self.handle.worker_pid = worker;
        if self.handle.is_wrapped() {
            tracing::info!(
                wrapper = self.handle.wrapper_pid,
                worker,
                "resolved worker behind instrumentation wrapper"
            );
        } else {
            tracing::debug!(pid = worker, "no child process; wrapper is the worker");
        }
        worker
    }

    /// Deliver `kind` to the resolved worker pid. Does not block.
    pub fn signal(&mut self, kind: SignalKind) -> Result<(), SupervisorError> {
        let pid = self.handle.worker_pid;
        tracing::info!(pid, signal = %kind, "delivering signal");
        let ret = unsafe { libc::kill(pid as libc::pid_t, kind.as_raw()) };
        if ret != 0 {
            return Err(SupervisorError::Signal {
                signal: kind,
                pid,
                source: io::Error::last_os_error(),
            });
        }
        self.state = SupervisorState::SignalSent;
        Ok(())
    }

    /// Block until the wrapper process (and with it the whole group) exits,
    /// or `timeout` elapses. On timeout the group is force-killed and
    /// [`ExitOutcome::ForceKilled`] is returned.
    pub fn await_exit(&mut self, timeout: Duration) -> io::Result<ExitOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.state = SupervisorState::Exited;
                let outcome = self.classify(status);
                tracing::info!(?outcome, "server exited");
                return Ok(outcome);
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    pid = self.handle.wrapper_pid,
                    ?timeout,
                    "process did not exit in time; force-killing"
                );
                self.force_kill();
                self.state = SupervisorState::ForceKilled;
                return Ok(ExitOutcome::ForceKilled);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn classify(&self, status: std::process::ExitStatus) -> ExitOutcome {
        match status.code() {
            Some(0) => ExitOutcome::Clean,
            Some(code) if code == self.fault_exit_code => ExitOutcome::InstrumentationFault(code),
            Some(code) => ExitOutcome::Failed(code),
            None => {
                use std::os::unix::process::ExitStatusExt;
                ExitOutcome::Failed(-status.signal().unwrap_or(0))
            }
        }
    }

    fn force_kill(&mut self) {
        // Negative pid addresses the whole process group.
        unsafe {
            libc::kill(-(self.handle.wrapper_pid as libc::pid_t), libc::SIGKILL);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // No scenario may start while the previous server still holds the
        // port; make sure nothing outlives its supervisor.
        if matches!(self.child.try_wait(), Ok(None)) {
            tracing::warn!(
                pid = self.handle.wrapper_pid,
                "supervisor dropped with process still running; force-killing"
            );
            self.force_kill();
        }
    }
}

/// Poll `127.0.0.1:port` with short connect attempts until one succeeds or
/// `timeout` elapses.
pub fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect_timeout(&addr, CONNECT_ATTEMPT) {
            Ok(_) => return true,
            Err(_) => {
                if Instant::now() >= deadline {
                    return false;
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Poll `tree` for a child of `wrapper_pid`; fall back to the wrapper pid
/// itself when none appears within `timeout`.
fn resolve_worker_pid(tree: &dyn ProcessTreeQuery, wrapper_pid: u32, timeout: Duration) -> u32 {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(children) = tree.children_of(wrapper_pid) {
            if let Some(&first) = children.first() {
                return first;
            }
        }
        if Instant::now() >= deadline {
            return wrapper_pid;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeTree {
        children: HashMap<u32, Vec<u32>>,
    }

    impl ProcessTreeQuery for FakeTree {
        fn children_of(&self, pid: u32) -> io::Result<Vec<u32>> {
            Ok(self.children.get(&pid).cloned().unwrap_or_default())
        }
    }

    #[test]
    fn wrapped_process_resolves_to_child() {
        let tree = FakeTree {
            children: HashMap::from([(100, vec![101])]),
        };
        let worker = resolve_worker_pid(&tree, 100, Duration::from_millis(200));
        assert_eq!(worker, 101);
    }

    #[test]
    fn unwrapped_process_resolves_to_itself() {
        let tree = FakeTree {
            children: HashMap::new(),
        };
        let worker = resolve_worker_pid(&tree, 100, Duration::from_millis(50));
        assert_eq!(worker, 100);
    }

    #[test]
    fn tree_query_errors_fall_back_to_wrapper() {
        struct FailingTree;
        impl ProcessTreeQuery for FailingTree {
            fn children_of(&self, _pid: u32) -> io::Result<Vec<u32>> {
                Err(io::Error::new(io::ErrorKind::NotFound, "no proc entry"))
            }
        }
        let worker = resolve_worker_pid(&FailingTree, 42, Duration::from_millis(50));
        assert_eq!(worker, 42);
    }

    #[test]
    fn signal_kind_maps_to_raw() {
        assert_eq!(SignalKind::Interrupt.as_raw(), libc::SIGINT);
        assert_eq!(SignalKind::Terminate.as_raw(), libc::SIGTERM);
        assert_eq!(SignalKind::Interrupt.to_string(), "SIGINT");
        assert_eq!(SignalKind::Terminate.to_string(), "SIGTERM");
    }

    #[test]
    fn wait_for_port_times_out_on_dead_port() {
        // Port 1 on loopback should refuse; the probe must give up promptly.
        let start = Instant::now();
        assert!(!wait_for_port(1, Duration::from_millis(300)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
