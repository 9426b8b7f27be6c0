//! Harness configuration, loaded from TOML.
//!
//! One immutable [`ScenarioConfig`] is passed into every scenario; nothing
//! about ports, timeouts, or paths lives in global state.

use crate::valgrind::MarkerGrammar;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config {0}: {1}")]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

/// Everything a scenario needs to know: where the server lives, how to wrap
/// it, which port to probe, which paths to request, and every deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Address the server under test listens on.
    pub host: String,
    pub port: u16,
    pub server: ServerConfig,
    pub instrumentation: InstrumentationConfig,
    pub timeouts: TimeoutConfig,
    pub fixtures: FixtureConfig,
    /// Log markers recognized by the analyzer; override when the
    /// instrumentation tool's wording differs.
    pub markers: MarkerGrammar,
    /// Cap on accumulated response-header bytes.
    pub max_header_size: usize,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18099,
            server: ServerConfig::default(),
            instrumentation: InstrumentationConfig::default(),
            timeouts: TimeoutConfig::default(),
            fixtures: FixtureConfig::default(),
            markers: MarkerGrammar::default(),
            max_header_size: 16 * 1024,
        }
    }
}

/// The server binary and its own config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub binary: PathBuf,
    pub config_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("./webserv"),
            config_file: None,
        }
    }
}

/// The wrapping memory/descriptor instrumentation tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// Run the server un-wrapped when false (worker == wrapper).
    pub enabled: bool,
    pub binary: String,
    pub log_file: PathBuf,
    /// Sentinel exit code meaning the tool itself detected a fault.
    pub fault_exit_code: i32,
    /// Extra arguments appended after the standard set.
    pub extra_args: Vec<String>,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "valgrind".to_string(),
            log_file: PathBuf::from("valgrind.log"),
            fault_exit_code: 100,
            extra_args: Vec::new(),
        }
    }
}

/// Every blocking wait in the harness carries one of these deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Overall deadline for the readiness probe after launch.
    pub startup_ms: u64,
    /// How long to poll for a child pid before treating the wrapper as the
    /// worker.
    pub worker_resolve_ms: u64,
    /// Deadline for process exit after a signal.
    pub exit_ms: u64,
    /// Socket read timeout while decoding responses.
    pub read_ms: u64,
    /// Window in which an incomplete request must produce no bytes.
    pub quiet_ms: u64,
    /// Per-connection connect timeout.
    pub connect_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_ms: 10_000,
            worker_resolve_ms: 500,
            exit_ms: 5_000,
            read_ms: 5_000,
            quiet_ms: 300,
            connect_ms: 2_000,
        }
    }
}

impl TimeoutConfig {
    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }
    pub fn worker_resolve(&self) -> Duration {
        Duration::from_millis(self.worker_resolve_ms)
    }
    pub fn exit(&self) -> Duration {
        Duration::from_millis(self.exit_ms)
    }
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }
    pub fn quiet(&self) -> Duration {
        Duration::from_millis(self.quiet_ms)
    }
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }
}

/// Request paths (and the cookie name) the scenarios exercise. These name
/// resources the server under test must serve, including the CGI
/// collaborators; the harness never implements them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    pub index_path: String,
    pub upload_path: String,
    pub cgi_sleep_path: String,
    pub cgi_stream_path: String,
    /// Every cookie-issuing CGI resource gets the full round trip.
    pub cgi_cookie_paths: Vec<String>,
    pub cookie_name: String,
    /// Size of the mid-upload body declared in Content-Length.
    pub upload_total_bytes: usize,
    /// Bytes streamed before the signal lands.
    pub upload_sent_bytes: usize,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            index_path: "/index.html".to_string(),
            upload_path: "/upload".to_string(),
            cgi_sleep_path: "/cgi/sleep.py".to_string(),
            cgi_stream_path: "/cgi/stream.py".to_string(),
            cgi_cookie_paths: vec!["/cgi/cookie.py".to_string(), "/cgi/cookie.php".to_string()],
            cookie_name: "WEBSERV_ID".to_string(),
            upload_total_bytes: 10 * 1024 * 1024,
            upload_sent_bytes: 5 * 1024 * 1024,
        }
    }
}

impl ScenarioConfig {
    /// Load config from a TOML file. Returns `Ok(None)` if the file does
    /// not exist so callers can fall back to defaults.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// The full argv used to launch the server, wrapped in the
    /// instrumentation tool when enabled.
    pub fn server_command(&self) -> Vec<String> {
        let mut cmd = Vec::new();
        if self.instrumentation.enabled {
            cmd.push(self.instrumentation.binary.clone());
            cmd.push("--leak-check=full".to_string());
            cmd.push("--show-leak-kinds=all".to_string());
            cmd.push("--track-fds=yes".to_string());
            cmd.push(format!(
                "--error-exitcode={}",
                self.instrumentation.fault_exit_code
            ));
            cmd.push(format!(
                "--log-file={}",
                self.instrumentation.log_file.display()
            ));
            cmd.extend(self.instrumentation.extra_args.iter().cloned());
        }
        cmd.push(self.server.binary.display().to_string());
        if let Some(conf) = &self.server.config_file {
            cmd.push(conf.display().to_string());
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_none() {
        let loaded = ScenarioConfig::load(Path::new("/nonexistent/servtest.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "port = 8123\n\n[server]\nbinary = \"/opt/webserv\"\n\n[timeouts]\nexit_ms = 2000\n"
        )
        .unwrap();
        let config = ScenarioConfig::load(file.path()).unwrap().unwrap();
        assert_eq!(config.port, 8123);
        assert_eq!(config.server.binary, PathBuf::from("/opt/webserv"));
        assert_eq!(config.timeouts.exit(), Duration::from_secs(2));
        // Untouched sections keep defaults.
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.instrumentation.fault_exit_code, 100);
        assert_eq!(config.fixtures.cookie_name, "WEBSERV_ID");
        assert_eq!(
            config.fixtures.cgi_cookie_paths,
            vec!["/cgi/cookie.py", "/cgi/cookie.php"]
        );
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "port = \"not a number\"").unwrap();
        let err = ScenarioConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_, _)));
    }

    #[test]
    fn instrumented_command_wraps_server() {
        let mut config = ScenarioConfig::default();
        config.server.config_file = Some(PathBuf::from("webserv.conf"));
        let cmd = config.server_command();
        assert_eq!(cmd[0], "valgrind");
        assert!(cmd.contains(&"--track-fds=yes".to_string()));
        assert!(cmd.contains(&"--error-exitcode=100".to_string()));
        assert_eq!(cmd[cmd.len() - 2], "./webserv");
        assert_eq!(cmd[cmd.len() - 1], "webserv.conf");
    }

    #[test]
    fn uninstrumented_command_is_bare() {
        let mut config = ScenarioConfig::default();
        config.instrumentation.enabled = false;
        assert_eq!(config.server_command(), vec!["./webserv".to_string()]);
    }

    #[test]
    fn marker_grammar_is_configurable_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[markers]\ninherited = \"(passed down)\"\n").unwrap();
        let config = ScenarioConfig::load(file.path()).unwrap().unwrap();
        assert_eq!(config.markers.inherited, "(passed down)");
        assert_eq!(config.markers.lookahead_lines, 5);
    }
}
