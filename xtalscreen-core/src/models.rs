use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A single request to run one external command to completion or timeout
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInvocation {
    pub command: Vec<String>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    pub env: Vec<(String, String)>,
    pub working_directory: Option<PathBuf>,
    /// Echo the command and its captured output to the debug log
    pub debug: bool,
    pub echo_stdout: bool,
    pub echo_stderr: bool,
}

impl ProcessInvocation {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            stdin: None,
            timeout: None,
            env: Vec::new(),
            working_directory: None,
            debug: false,
            echo_stdout: false,
            echo_stderr: false,
        }
    }

    pub fn with_stdin<S: Into<String>>(mut self, payload: S) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_work_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.working_directory = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_echo(mut self, stdout: bool, stderr: bool) -> Self {
        self.echo_stdout = stdout;
        self.echo_stderr = stderr;
        self
    }

    /// Name of the executable, used in log messages and errors
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("")
    }

    pub fn display(&self) -> String {
        self.command.join(" ")
    }
}

/// Outcome of one invocation.
///
/// The serialized field names are relied upon by anything consuming the
/// JSON form of a result, so they must not change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessResult {
    pub command: Vec<String>,
    /// Exit code of the child. A child killed by signal `N` reports `-N`.
    pub exitcode: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock runtime in seconds
    pub runtime: f64,
    pub timeout: bool,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exitcode == 0 && !self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.runtime.max(0.0))
    }
}

/// Values read back from a successful profile modelling run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ProfileEstimate {
    pub num_images: u64,
    /// Oscillation width per image, in degrees
    pub oscillation: f64,
    pub sigma_m: f64,
}

/// Mosaicity estimates gathered from the basic and extended profile models.
///
/// Produced by the profile modelling step and handed on to the intensity
/// check.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileModel {
    pub oscillation: f64,
    pub num_images: u64,
    pub sigma_m_basic: Option<f64>,
    pub sigma_m_extended: Option<f64>,
}

impl ProfileModel {
    pub fn is_available(&self) -> bool {
        self.sigma_m_basic.is_some() || self.sigma_m_extended.is_some()
    }
}

/// Primitive indexing solution reported by the indexer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexingSolution {
    pub reflections: u64,
    pub unit_cell: String,
    pub space_group: String,
}

/// Contents of the pixel intensity survey written by the overload tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverloadData {
    pub scale_factor: f64,
    #[serde(default)]
    pub overload_limit: Option<f64>,
    #[serde(default)]
    pub bin_count: Option<usize>,
    #[serde(default)]
    pub bins: Option<Vec<u64>>,
    #[serde(default)]
    pub counts: Option<BTreeMap<String, u64>>,
}
