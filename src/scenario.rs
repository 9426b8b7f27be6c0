//! End-to-end scenarios and the sequential driver.
//!
//! Each scenario owns the listening port and the instrumentation log for
//! its whole lifetime: start the server, exchange bytes, deliver a signal,
//! confirm exit, analyze the log, and only then let the next scenario
//! start. The continue-vs-abort policy after a failure is decided
//! explicitly by the caller, not by terminating the process.

use crate::config::ScenarioConfig;
use crate::decoder::{DecodedResponse, FramingError, ResponseDecoder, ResponseFraming};
use crate::process::{ExitOutcome, ProcFsTree, SignalKind, Supervisor, SupervisorError};
use crate::request;
use crate::valgrind;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Pause between sending bytes and delivering a signal, long enough for the
/// server to have entered the targeted processing window.
const WINDOW_SETTLE: Duration = Duration::from_secs(1);

/// Pacing between upload slices so the body is still in flight when the
/// signal lands.
const UPLOAD_SLICE_PAUSE: Duration = Duration::from_millis(200);
const UPLOAD_SLICE_BYTES: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("connection to server failed: {0}")]
    Connection(#[source] io::Error),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("server failed to exit within the deadline after the signal")]
    ExitTimeout,

    #[error("instrumentation tool detected a fault (exit code {0})")]
    InstrumentationFault(i32),

    #[error("server exited with unexpected status {0}")]
    UnexpectedExit(i32),

    #[error("descriptor leak: {0}")]
    DescriptorLeak(String),

    #[error("memory leak: {0}")]
    MemoryLeak(String),

    #[error("{0}")]
    Assertion(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of one scenario. Never shared across scenarios.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub name: String,
    pub passed: bool,
    pub diagnostics: Vec<String>,
}

/// A named, self-contained test case over one fresh server process.
pub struct Scenario {
    name: String,
    run: Box<dyn Fn(&ScenarioConfig) -> Result<(), ScenarioError>>,
}

impl Scenario {
    pub fn new(
        name: impl Into<String>,
        run: impl Fn(&ScenarioConfig) -> Result<(), ScenarioError> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(&self, config: &ScenarioConfig) -> ScenarioResult {
        match (self.run)(config) {
            Ok(()) => {
                tracing::info!(scenario = %self.name, "passed");
                ScenarioResult {
                    name: self.name.clone(),
                    passed: true,
                    diagnostics: Vec::new(),
                }
            }
            Err(err) => {
                tracing::error!(scenario = %self.name, error = %err, "failed");
                ScenarioResult {
                    name: self.name.clone(),
                    passed: false,
                    diagnostics: error_chain(&err),
                }
            }
        }
    }
}

/// What to do after a scenario fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPolicy {
    AbortOnFailure,
    KeepGoing,
}

/// Run scenarios strictly sequentially. Teardown is complete before each
/// next start: the supervisor confirms process exit (or force-kills) before
/// its scenario returns.
pub fn run_all(
    scenarios: &[Scenario],
    config: &ScenarioConfig,
    policy: RunPolicy,
) -> Vec<ScenarioResult> {
    let mut results = Vec::new();
    for scenario in scenarios {
        tracing::info!(scenario = scenario.name(), "starting");
        let result = scenario.run(config);
        let passed = result.passed;
        results.push(result);
        if !passed && policy == RunPolicy::AbortOnFailure {
            tracing::error!("aborting run after first failure");
            break;
        }
    }
    results
}

/// The point in the request lifecycle at which a signal is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingWindow {
    /// No connection open.
    Idle,
    /// Header block started but never terminated.
    MidHeader,
    /// Large fixed-length body partially streamed.
    MidUpload,
    /// Slow CGI request in flight.
    MidCgi,
}

impl TimingWindow {
    fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::MidHeader => "mid-header",
            Self::MidUpload => "mid-upload",
            Self::MidCgi => "mid-cgi",
        }
    }
}

/// The full scenario list, protocol conformance first, then fault
/// injection: each timing window under both signals.
pub fn all_scenarios() -> Vec<Scenario> {
    let mut scenarios = vec![
        Scenario::new("keep-alive", run_keep_alive),
        Scenario::new("incomplete-request", run_incomplete_request),
        Scenario::new("chunked-stream", run_chunked_stream),
        Scenario::new("cookie-round-trip", run_cookie_round_trip),
        Scenario::new("http10-default-close", run_http10_default_close),
        Scenario::new("http10-keep-alive", run_http10_keep_alive),
        Scenario::new("http10-explicit-close", run_http10_explicit_close),
        Scenario::new("http10-cgi-close", |config: &ScenarioConfig| {
            run_http10_cgi_close(config, false)
        }),
        Scenario::new("http10-cgi-close-keep-alive", |config: &ScenarioConfig| {
            run_http10_cgi_close(config, true)
        }),
        Scenario::new("http10-unsupported-method", run_http10_unsupported_method),
    ];
    for signal in [SignalKind::Interrupt, SignalKind::Terminate] {
        for window in [
            TimingWindow::Idle,
            TimingWindow::MidHeader,
            TimingWindow::MidUpload,
            TimingWindow::MidCgi,
        ] {
            scenarios.push(Scenario::new(
                format!("signal-{}-{}", window.label(), signal.to_string().to_lowercase()),
                move |config: &ScenarioConfig| run_signal_scenario(config, window, signal),
            ));
        }
    }
    scenarios
}

// ── Scenario bodies ────────────────────────────────────────────────

/// Deliver `signal` while the server sits in `window`, then require a clean
/// exit and a clean instrumentation log.
fn run_signal_scenario(
    config: &ScenarioConfig,
    window: TimingWindow,
    signal: SignalKind,
) -> Result<(), ScenarioError> {
    let mut supervisor = launch(config)?;

    // The connection must stay open across the signal so the server is
    // genuinely mid-window when it arrives.
    let conn = match window {
        TimingWindow::Idle => None,
        TimingWindow::MidHeader => {
            let mut stream = connect(config)?;
            stream.write_all(&request::partial_get("/", &config.host))?;
            thread::sleep(WINDOW_SETTLE);
            Some(stream)
        }
        TimingWindow::MidUpload => {
            let mut stream = connect(config)?;
            stream.write_all(&request::post_prelude(
                &config.fixtures.upload_path,
                &config.host,
                config.fixtures.upload_total_bytes,
            ))?;
            let slice = vec![b'A'; UPLOAD_SLICE_BYTES];
            let mut sent = 0;
            while sent < config.fixtures.upload_sent_bytes {
                let take = slice.len().min(config.fixtures.upload_sent_bytes - sent);
                stream.write_all(&slice[..take])?;
                sent += take;
                thread::sleep(UPLOAD_SLICE_PAUSE);
            }
            Some(stream)
        }
        TimingWindow::MidCgi => {
            let mut stream = connect(config)?;
            stream.write_all(&request::get(&config.fixtures.cgi_sleep_path, &config.host))?;
            thread::sleep(WINDOW_SETTLE);
            Some(stream)
        }
    };

    supervisor.signal(signal)?;
    let outcome = supervisor.await_exit(config.timeouts.exit())?;
    drop(conn);
    verify_shutdown(config, outcome)
}

/// Two identical requests on one connection must both decode to 200, and
/// the first must not announce `Connection: close`.
fn run_keep_alive(config: &ScenarioConfig) -> Result<(), ScenarioError> {
    with_server(config, |config| {
        let decoder = ResponseDecoder::new(config.max_header_size);
        let mut stream = connect(config)?;
        let req = request::get(&config.fixtures.index_path, &config.host);

        let first = exchange(&mut stream, &decoder, &req)?;
        ensure_status(&first, 200)?;
        ensure_no_connection_close(&first)?;

        // Give the server a beat to get back to reading before reusing the
        // connection.
        thread::sleep(Duration::from_millis(100));

        // An empty second read means the server silently closed the
        // connection; exchange reports that as a failure.
        let second = exchange(&mut stream, &decoder, &req)?;
        ensure_status(&second, 200)
    })
}

/// A bare CRLF is not a request: the server must stay silent within the
/// quiet window, and a valid request on the same connection must still
/// work afterwards.
fn run_incomplete_request(config: &ScenarioConfig) -> Result<(), ScenarioError> {
    with_server(config, |config| {
        let mut stream = connect(config)?;
        stream.write_all(b"\r\n")?;

        stream.set_read_timeout(Some(config.timeouts.quiet()))?;
        let mut byte = [0u8; 1];
        match stream.read(&mut byte) {
            Ok(0) => {
                return Err(ScenarioError::Assertion(
                    "server closed the connection on incomplete input".to_string(),
                ))
            }
            Ok(_) => {
                return Err(ScenarioError::Assertion(
                    "server responded to an incomplete request".to_string(),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
            }
            Err(e) => return Err(ScenarioError::Io(e)),
        }
        stream.set_read_timeout(Some(config.timeouts.read()))?;

        let decoder = ResponseDecoder::new(config.max_header_size);
        let req = request::get(&config.fixtures.index_path, &config.host);
        let resp = exchange(&mut stream, &decoder, &req)?;
        ensure_status(&resp, 200)
    })
}

/// A streaming CGI resource with no declared length must come back chunked
/// and keep the connection alive for a following static request.
fn run_chunked_stream(config: &ScenarioConfig) -> Result<(), ScenarioError> {
    with_server(config, |config| {
        let decoder = ResponseDecoder::new(config.max_header_size);
        let mut stream = connect(config)?;

        let first = exchange(
            &mut stream,
            &decoder,
            &request::get(&config.fixtures.cgi_stream_path, &config.host),
        )?;
        ensure_status(&first, 200)?;
        if first.framing != ResponseFraming::Chunked {
            return Err(ScenarioError::Assertion(format!(
                "expected chunked framing for unknown-length CGI output, got {:?}",
                first.framing
            )));
        }
        ensure_no_connection_close(&first)?;

        thread::sleep(Duration::from_millis(100));

        let second = exchange(
            &mut stream,
            &decoder,
            &request::get(&config.fixtures.index_path, &config.host),
        )?;
        ensure_status(&second, 200)
    })
}

/// First request gets a cookie issued; replaying its value must be
/// acknowledged as an existing session. Every configured cookie resource
/// gets the round trip against the same server.
fn run_cookie_round_trip(config: &ScenarioConfig) -> Result<(), ScenarioError> {
    with_server(config, |config| {
        let decoder = ResponseDecoder::new(config.max_header_size);
        for path in &config.fixtures.cgi_cookie_paths {
            round_trip_cookie(config, &decoder, path)?;
        }
        Ok(())
    })
}

fn round_trip_cookie(
    config: &ScenarioConfig,
    decoder: &ResponseDecoder,
    path: &str,
) -> Result<(), ScenarioError> {
    let cookie_name = &config.fixtures.cookie_name;

    let mut stream = connect(config)?;
    let first = exchange(&mut stream, decoder, &request::get(path, &config.host))?;
    ensure_status(&first, 200)?;
    let id = issued_cookie(&first, cookie_name)?;
    ensure_body_contains(&first, "new=1")?;
    ensure_body_contains(&first, &format!("id={id}"))?;

    // Fresh connection; only the cookie carries the session over.
    let mut stream = connect(config)?;
    let req = request::get_with_headers(
        path,
        &config.host,
        &[("Cookie", &format!("{cookie_name}={id}"))],
    );
    let second = exchange(&mut stream, decoder, &req)?;
    ensure_status(&second, 200)?;
    ensure_body_contains(&second, "new=0")?;
    ensure_body_contains(&second, &format!("id={id}"))
}

/// The issued `Set-Cookie` for `name` must carry a non-empty value and a
/// `Max-Age` attribute, so the session survives the browser default of
/// discarding it on exit.
fn issued_cookie(resp: &DecodedResponse, name: &str) -> Result<String, ScenarioError> {
    let set_cookies = resp.header_values("set-cookie");
    let set_cookie = request::pick_set_cookie(&set_cookies, name)
        .ok_or_else(|| ScenarioError::Assertion(format!("missing Set-Cookie for {name}")))?;
    if !set_cookie.contains("Max-Age=") {
        return Err(ScenarioError::Assertion(format!(
            "missing Max-Age in Set-Cookie {set_cookie:?}"
        )));
    }
    let id = request::cookie_value(set_cookie, name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ScenarioError::Assertion(format!("empty cookie value in {set_cookie:?}"))
        })?;
    Ok(id.to_string())
}

/// HTTP/1.0 requires no Host header, must not chunk, and without a
/// `Connection` header the server closes the connection after responding.
fn run_http10_default_close(config: &ScenarioConfig) -> Result<(), ScenarioError> {
    with_server(config, |config| {
        let decoder = ResponseDecoder::new(config.max_header_size);
        let mut stream = connect(config)?;
        let resp = exchange(
            &mut stream,
            &decoder,
            &request::method_http10("GET", &config.fixtures.index_path),
        )?;
        ensure_status(&resp, 200)?;
        ensure_not_chunked(&resp)?;
        if resp.body.is_empty() {
            return Err(ScenarioError::Assertion(
                "static body was empty on a Host-less HTTP/1.0 request".to_string(),
            ));
        }
        ensure_closed(&mut stream, config.timeouts.quiet())
    })
}

/// `Connection: keep-alive` opts an HTTP/1.0 connection into reuse: two
/// static requests on the same socket must both answer.
fn run_http10_keep_alive(config: &ScenarioConfig) -> Result<(), ScenarioError> {
    with_server(config, |config| {
        let decoder = ResponseDecoder::new(config.max_header_size);
        let mut stream = connect(config)?;
        let req = request::get_http10_with_headers(
            &config.fixtures.index_path,
            &config.host,
            &[("Connection", "keep-alive")],
        );

        let first = exchange(&mut stream, &decoder, &req)?;
        ensure_status(&first, 200)?;
        ensure_not_chunked(&first)?;

        thread::sleep(Duration::from_millis(100));

        let second = exchange(&mut stream, &decoder, &req)?;
        ensure_status(&second, 200)?;
        ensure_not_chunked(&second)
    })
}

/// Even on a connection kept alive so far, an explicit `Connection: close`
/// must disconnect after the response.
fn run_http10_explicit_close(config: &ScenarioConfig) -> Result<(), ScenarioError> {
    with_server(config, |config| {
        let decoder = ResponseDecoder::new(config.max_header_size);
        let mut stream = connect(config)?;
        let path = &config.fixtures.index_path;

        let first = exchange(
            &mut stream,
            &decoder,
            &request::get_http10_with_headers(path, &config.host, &[("Connection", "keep-alive")]),
        )?;
        ensure_status(&first, 200)?;
        ensure_not_chunked(&first)?;

        let second = exchange(
            &mut stream,
            &decoder,
            &request::get_http10_with_headers(path, &config.host, &[("Connection", "close")]),
        )?;
        ensure_status(&second, 200)?;
        ensure_not_chunked(&second)?;

        ensure_closed(&mut stream, config.timeouts.quiet())
    })
}

/// Unknown-length CGI output under HTTP/1.0 must not be chunked and must
/// end with the server closing the connection, whether or not the client
/// asked for keep-alive.
fn run_http10_cgi_close(config: &ScenarioConfig, keep_alive: bool) -> Result<(), ScenarioError> {
    with_server(config, |config| {
        let decoder = ResponseDecoder::new(config.max_header_size);
        let mut stream = connect(config)?;
        let path = &config.fixtures.cgi_stream_path;
        let req = if keep_alive {
            request::get_http10_with_headers(path, &config.host, &[("Connection", "keep-alive")])
        } else {
            request::get_http10(path, &config.host)
        };

        let resp = exchange(&mut stream, &decoder, &req)?;
        ensure_status(&resp, 200)?;
        ensure_not_chunked(&resp)?;
        if !keep_alive && resp.framing != ResponseFraming::CloseDelimited {
            return Err(ScenarioError::Assertion(format!(
                "expected close-delimited framing for HTTP/1.0 CGI output, got {:?}",
                resp.framing
            )));
        }
        if resp.body.is_empty() {
            return Err(ScenarioError::Assertion(
                "close-delimited body was empty".to_string(),
            ));
        }
        ensure_closed(&mut stream, config.timeouts.quiet())
    })
}

/// A method the server does not implement gets `405` with an `Allow`
/// header listing what it does implement.
fn run_http10_unsupported_method(config: &ScenarioConfig) -> Result<(), ScenarioError> {
    with_server(config, |config| {
        let decoder = ResponseDecoder::new(config.max_header_size);
        let mut stream = connect(config)?;
        let resp = exchange(
            &mut stream,
            &decoder,
            &request::method_http10("HEAD", &config.fixtures.index_path),
        )?;
        ensure_status(&resp, 405)?;
        if resp.header_value("allow").is_none() {
            return Err(ScenarioError::Assertion(
                "405 response missing the Allow header".to_string(),
            ));
        }
        Ok(())
    })
}

// ── Shared plumbing ────────────────────────────────────────────────

fn launch(config: &ScenarioConfig) -> Result<Supervisor, ScenarioError> {
    // A stale log from the previous scenario must not leak findings into
    // this one.
    if config.instrumentation.enabled {
        let _ = std::fs::remove_file(&config.instrumentation.log_file);
    }
    let mut supervisor = Supervisor::start(
        &config.server_command(),
        config.port,
        config.timeouts.startup(),
        config.instrumentation.fault_exit_code,
    )?;
    supervisor.resolve_worker(&ProcFsTree, config.timeouts.worker_resolve());
    Ok(supervisor)
}

/// Run `body` against a freshly launched server, then terminate it and
/// verify shutdown. A protocol failure takes precedence over any teardown
/// finding, but teardown always happens.
fn with_server<F>(config: &ScenarioConfig, body: F) -> Result<(), ScenarioError>
where
    F: FnOnce(&ScenarioConfig) -> Result<(), ScenarioError>,
{
    let mut supervisor = launch(config)?;
    let result = body(config);

    let teardown = supervisor
        .signal(SignalKind::Terminate)
        .map_err(ScenarioError::from)
        .and_then(|()| {
            let outcome = supervisor.await_exit(config.timeouts.exit())?;
            verify_shutdown(config, outcome)
        });

    result.and(teardown)
}

/// Map the exit outcome and the instrumentation log to pass/fail.
fn verify_shutdown(config: &ScenarioConfig, outcome: ExitOutcome) -> Result<(), ScenarioError> {
    match outcome {
        ExitOutcome::Clean => {}
        ExitOutcome::InstrumentationFault(code) => {
            return Err(ScenarioError::InstrumentationFault(code))
        }
        ExitOutcome::Failed(code) => return Err(ScenarioError::UnexpectedExit(code)),
        ExitOutcome::ForceKilled => return Err(ScenarioError::ExitTimeout),
    }

    if !config.instrumentation.enabled {
        return Ok(());
    }
    let log = std::fs::read_to_string(&config.instrumentation.log_file).unwrap_or_default();
    let analysis = valgrind::analyze(&log, &config.markers);
    if let Some(finding) = analysis.descriptor_leaks().first() {
        return Err(ScenarioError::DescriptorLeak(finding.raw.clone()));
    }
    if let Some(finding) = analysis.memory_leaks().first() {
        return Err(ScenarioError::MemoryLeak(finding.raw.clone()));
    }
    Ok(())
}

fn connect(config: &ScenarioConfig) -> Result<TcpStream, ScenarioError> {
    let addr = format!("{}:{}", config.host, config.port)
        .to_socket_addrs()
        .map_err(ScenarioError::Connection)?
        .next()
        .ok_or_else(|| {
            ScenarioError::Connection(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no address resolved",
            ))
        })?;
    let stream =
        TcpStream::connect_timeout(&addr, config.timeouts.connect()).map_err(ScenarioError::Connection)?;
    stream.set_read_timeout(Some(config.timeouts.read()))?;
    Ok(stream)
}

/// Send one request and decode exactly one response.
fn exchange(
    stream: &mut TcpStream,
    decoder: &ResponseDecoder,
    request: &[u8],
) -> Result<DecodedResponse, ScenarioError> {
    stream.write_all(request)?;
    decoder.decode(stream)?.ok_or_else(|| {
        ScenarioError::Assertion("no response before the connection closed".to_string())
    })
}

fn ensure_status(resp: &DecodedResponse, expected: u16) -> Result<(), ScenarioError> {
    match resp.status_code() {
        Some(code) if code == expected => Ok(()),
        other => Err(ScenarioError::Assertion(format!(
            "expected status {expected}, got {other:?}"
        ))),
    }
}

fn ensure_no_connection_close(resp: &DecodedResponse) -> Result<(), ScenarioError> {
    if let Some(value) = resp.header_value("connection") {
        if value.to_ascii_lowercase().contains("close") {
            return Err(ScenarioError::Assertion(
                "server announced Connection: close on a keep-alive exchange".to_string(),
            ));
        }
    }
    Ok(())
}

fn ensure_not_chunked(resp: &DecodedResponse) -> Result<(), ScenarioError> {
    if resp.framing == ResponseFraming::Chunked {
        return Err(ScenarioError::Assertion(
            "chunked transfer coding is not valid for an HTTP/1.0 client".to_string(),
        ));
    }
    Ok(())
}

/// The peer must have closed: a read within `quiet` must report
/// end-of-stream, not data and not a still-open timeout.
fn ensure_closed(stream: &mut TcpStream, quiet: Duration) -> Result<(), ScenarioError> {
    stream.set_read_timeout(Some(quiet))?;
    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) => Ok(()),
        Ok(_) => Err(ScenarioError::Assertion(
            "server sent data after the connection should have closed".to_string(),
        )),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
            Err(ScenarioError::Assertion(
                "server left the connection open after it should have closed".to_string(),
            ))
        }
        Err(e) => Err(ScenarioError::Io(e)),
    }
}

fn ensure_body_contains(resp: &DecodedResponse, needle: &str) -> Result<(), ScenarioError> {
    let body = String::from_utf8_lossy(&resp.body);
    if body.contains(needle) {
        Ok(())
    } else {
        Err(ScenarioError::Assertion(format!(
            "body missing {needle:?}: {body:?}"
        )))
    }
}

fn error_chain(err: &ScenarioError) -> Vec<String> {
    let mut diagnostics = vec![err.to_string()];
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        diagnostics.push(cause.to_string());
        source = cause.source();
    }
    diagnostics
}
