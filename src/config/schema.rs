//! Configuration schema definitions.
//!
//! All types here deserialize from the TOML configuration file. Every table
//! is optional and falls back to its defaults, so an empty file is a valid
//! (if useless) configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── OrchestratorConfig     - parallelism, retries, timeout, base URL, debug
//! ├── Vec<UnitConfig>        - the registered test units ([[units]])
//! ├── ReportConfig           - JSON / JUnit output settings
//! └── ObservabilityConfig    - tagged enum selecting the observer
//!     ├── None               - discard spans and summaries
//!     ├── Tracing            - structured log events
//!     └── Http               - POST to a collector endpoint
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::unit::UnitParams;

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [orchestrator]
/// max_parallel = 4
/// max_retries = 2
/// timeout_secs = 60
/// base_url = "http://localhost:3000"
///
/// [[units]]
/// id = "checkout/guest"
/// command = "node tests/checkout.js --guest"
/// params = { locale = "en-GB" }
///
/// [report]
/// output_dir = "test-results"
/// junit = true
///
/// [observability]
/// type = "tracing"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Core scheduling settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Registered test units, in run order.
    #[serde(default)]
    pub units: Vec<UnitConfig>,

    /// Report output settings.
    #[serde(default)]
    pub report: ReportConfig,

    /// Where spans and run summaries are forwarded.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Core scheduling settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_parallel` | available parallelism − 1 (at least 1) |
/// | `max_retries` | 2 |
/// | `timeout_secs` | 60 |
/// | `base_url` | `http://localhost:3000` |
/// | `debug` | false |
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Maximum number of units running at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Retries per unit after its first attempt. `0` disables retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-attempt timeout in seconds. An attempt that runs longer is killed
    /// and counted as a crash.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Base URL of the system under test, handed to every unit.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Debug flag handed to every unit. Also echoes unit output.
    #[serde(default)]
    pub debug: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            base_url: default_base_url(),
            debug: false,
        }
    }
}

fn default_max_parallel() -> usize {
    crate::scheduler::default_concurrency()
}

fn default_max_retries() -> u32 {
    2
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

/// One registered test unit, run as a child process.
///
/// Exactly one of `command` (a shell-style command line) or `program`
/// (with optional `args`) must be set.
///
/// ```toml
/// [[units]]
/// id = "search"
/// program = "python3"
/// args = ["tests/search.py"]
/// working_dir = "e2e"
/// env = { HEADLESS = "1" }
/// params = { query = "shoes", pages = 2 }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UnitConfig {
    /// Unit identifier, unique within the file.
    pub id: String,

    /// Shell-style command line, split with shell quoting rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Program to execute, as an alternative to `command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,

    /// Arguments for `program`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Working directory for the process (`~` is expanded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Extra environment variables for the process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Custom parameters, passed to the unit as `E2E_PARAMS`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: UnitParams,
}

/// Report output settings.
///
/// # Example
///
/// ```toml
/// [report]
/// output_dir = "~/e2e-results"
/// prefix = "nightly"
/// junit = true
/// junit_file = "junit.xml"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory for report files, created if missing. `~` is expanded.
    ///
    /// Default: `"test-results"`
    #[serde(default = "default_report_dir")]
    pub output_dir: String,

    /// Filename prefix of the JSON report.
    ///
    /// Default: `"e2e-report"`
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Whether to also write JUnit XML.
    ///
    /// Default: `false`
    #[serde(default)]
    pub junit: bool,

    /// JUnit XML filename, written to `{output_dir}/{junit_file}`.
    ///
    /// Default: `"junit.xml"`
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            prefix: default_prefix(),
            junit: false,
            junit_file: default_junit_file(),
        }
    }
}

impl ReportConfig {
    /// `output_dir` with `~` expanded.
    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.output_dir).into_owned())
    }
}

fn default_report_dir() -> String {
    "test-results".to_string()
}

fn default_prefix() -> String {
    "e2e-report".to_string()
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

/// Observer selection.
///
/// ```toml
/// [observability]
/// type = "http"
/// endpoint = "http://collector:8126/e2e"
/// service = "storefront-e2e"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ObservabilityConfig {
    /// Discard spans and summaries.
    #[default]
    None,

    /// Emit spans and summaries as `tracing` events.
    Tracing,

    /// POST spans and summaries as JSON to a collector.
    Http {
        endpoint: String,
        #[serde(default = "default_service")]
        service: String,
    },
}

fn default_service() -> String {
    "e2e".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.orchestrator.max_retries, 2);
        assert_eq!(config.orchestrator.timeout_secs, 60);
        assert_eq!(config.orchestrator.base_url, "http://localhost:3000");
        assert!(config.orchestrator.max_parallel >= 1);
        assert!(config.units.is_empty());
        assert_eq!(config.report.prefix, "e2e-report");
        assert!(!config.report.junit);
        assert_eq!(config.observability, ObservabilityConfig::None);
    }

    #[test]
    fn test_units_with_params() {
        let config: Config = toml::from_str(
            r#"
            [[units]]
            id = "login"
            command = "node login.js"
            params = { user = "admin", retries = 3, headless = true }

            [[units]]
            id = "search"
            program = "python3"
            args = ["search.py", "--fast"]
            env = { HEADLESS = "1" }
            "#,
        )
        .unwrap();

        assert_eq!(config.units.len(), 2);
        assert_eq!(config.units[0].params["user"], "admin");
        assert_eq!(config.units[0].params["retries"], 3);
        assert_eq!(config.units[0].params["headless"], true);
        assert_eq!(config.units[1].args, vec!["search.py", "--fast"]);
        assert_eq!(config.units[1].env["HEADLESS"], "1");
    }

    #[test]
    fn test_http_observability() {
        let config: Config = toml::from_str(
            r#"
            [observability]
            type = "http"
            endpoint = "http://collector:8126"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.observability,
            ObservabilityConfig::Http {
                endpoint: "http://collector:8126".to_string(),
                service: "e2e".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_observability_type_is_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [observability]
            type = "carrier-pigeon"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_report_output_path_expands_tilde() {
        let report = ReportConfig {
            output_dir: "~/results".to_string(),
            ..ReportConfig::default()
        };
        assert!(!report.output_path().to_string_lossy().starts_with('~'));
    }
}
