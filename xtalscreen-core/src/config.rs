use crate::error::{Result, XtalscreenError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default name of the configuration file looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "xtalscreen.toml";

/// Top-level configuration, read from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScreenConfig {
    pub runner: RunnerConfig,
    pub plot: PlotConfig,
}

/// Timing of the bounded process runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Delay between two checks for child exit
    pub poll_interval_ms: u64,
    /// How long a child gets to exit after SIGTERM before SIGKILL is sent
    pub termination_grace_ms: u64,
    /// How long stream readers get to drain once the child is gone
    pub reader_grace_ms: u64,
    /// Echo every command and its captured output to the debug log
    pub debug: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            termination_grace_ms: 500,
            reader_grace_ms: 2000,
            debug: false,
        }
    }
}

impl RunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn reader_grace(&self) -> Duration {
        Duration::from_millis(self.reader_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlotConfig {
    pub max_columns: usize,
    pub timeout_secs: f64,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            max_columns: 120,
            timeout_secs: 120.0,
        }
    }
}

/// Longest gnuplot run accepted from a config file
pub const MAX_PLOT_TIMEOUT_SECS: f64 = 3600.0;

impl PlotConfig {
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs.min(MAX_PLOT_TIMEOUT_SECS))
            .unwrap_or(Duration::from_secs_f64(MAX_PLOT_TIMEOUT_SECS))
    }
}

impl ScreenConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ScreenConfig = toml::from_str(content)
            .map_err(|e| XtalscreenError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Load `path` if given, else `xtalscreen.toml` in `dir` if it exists,
    /// else the defaults.
    pub fn load<P: AsRef<Path>>(path: Option<&Path>, dir: P) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        let candidate = dir.as_ref().join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            Self::from_file(candidate)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.runner.poll_interval_ms == 0 {
            return Err(XtalscreenError::InvalidConfiguration(
                "runner.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.plot.max_columns < 20 {
            return Err(XtalscreenError::InvalidConfiguration(
                "plot.max_columns must be at least 20".to_string(),
            ));
        }
        let timeout = self.plot.timeout_secs;
        if !(timeout.is_finite() && timeout > 0.0 && timeout <= MAX_PLOT_TIMEOUT_SECS) {
            return Err(XtalscreenError::InvalidConfiguration(format!(
                "plot.timeout_secs must be a positive number of at most {}",
                MAX_PLOT_TIMEOUT_SECS
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScreenConfig::default();
        assert_eq!(config.runner.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.runner.termination_grace(), Duration::from_millis(500));
        assert_eq!(config.plot.max_columns, 120);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ScreenConfig::from_toml_str(
            r#"
[runner]
termination_grace_ms = 1000
debug = true
"#,
        )
        .unwrap();
        assert_eq!(config.runner.termination_grace_ms, 1000);
        assert!(config.runner.debug);
        assert_eq!(config.runner.poll_interval_ms, 50);
        assert_eq!(config.plot, PlotConfig::default());
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        let err = ScreenConfig::from_toml_str("[runner\n").unwrap_err();
        assert!(matches!(err, XtalscreenError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let err = ScreenConfig::from_toml_str("[runner]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, XtalscreenError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_oversized_plot_timeout_is_rejected() {
        let err = ScreenConfig::from_toml_str("[plot]\ntimeout_secs = 1e19\n").unwrap_err();
        assert!(matches!(err, XtalscreenError::InvalidConfiguration(_)));
        assert!(ScreenConfig::from_toml_str("[plot]\ntimeout_secs = 600.0\n").is_ok());
    }

    #[test]
    fn test_plot_timeout_is_capped() {
        let plot = PlotConfig {
            timeout_secs: 1e19,
            ..PlotConfig::default()
        };
        assert_eq!(plot.timeout(), Duration::from_secs(3600));
        assert_eq!(PlotConfig::default().timeout(), Duration::from_secs(120));
    }
}
