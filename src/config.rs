//! Configuration loading and conversion into runtime types.
//!
//! A [`Config`] is read from TOML (see [`schema`]), optionally overridden
//! from the environment or command line ([`Overrides`]), validated, and then
//! turned into the pieces a run needs: a [`SchedulerConfig`], a
//! [`UnitRegistry`], the [`TestUnit`]s to run, [`ReportOptions`] and an
//! [`Observer`].

pub mod schema;

pub use schema::*;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::context::ProcessUnit;
use crate::observe::{HttpObserver, NoopObserver, Observer, TracingObserver};
use crate::registry::UnitRegistry;
use crate::report::ReportOptions;
use crate::scheduler::{DEFAULT_KILL_GRACE, SchedulerConfig};
use crate::unit::TestUnit;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "e2e.toml";

/// Configuration written by `e2e-orchestrator init`.
pub const STARTER_CONFIG: &str = r#"# End-to-end test orchestrator configuration.

[orchestrator]
# max_parallel = 4            # default: available parallelism - 1
max_retries = 2
timeout_secs = 60
base_url = "http://localhost:3000"
debug = false

# Each unit runs as a child process. It receives its launch parameters in
# E2E_* environment variables and reports back with one JSON line on stdout:
#   {"success": true, "duration": 812.4}
#   {"success": false, "duration": 90.1, "error": {"message": "..."}}
[[units]]
id = "smoke"
program = "echo"
args = ['{"success": true, "duration": 1}']

[report]
output_dir = "test-results"
prefix = "e2e-report"
junit = false
junit_file = "junit.xml"

[observability]
type = "none"
"#;

/// Loads configuration from a TOML file.
///
/// # Example
///
/// ```no_run
/// use e2e_orchestrator::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("e2e.toml"))?;
/// println!("Max parallel: {}", config.orchestrator.max_parallel);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// ```
/// use e2e_orchestrator::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [orchestrator]
///     max_parallel = 4
///
///     [[units]]
///     id = "login"
///     command = "node tests/login.js"
/// "#)?;
///
/// assert_eq!(config.orchestrator.max_parallel, 4);
/// assert_eq!(config.units[0].id, "login");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Settings that take precedence over the file, from flags or `E2E_*` variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub max_parallel: Option<usize>,
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub base_url: Option<String>,
    pub debug: Option<bool>,
    pub output_dir: Option<PathBuf>,
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) {
        let orchestrator = &mut config.orchestrator;
        if let Some(n) = self.max_parallel {
            orchestrator.max_parallel = n;
        }
        if let Some(n) = self.max_retries {
            orchestrator.max_retries = n;
        }
        if let Some(secs) = self.timeout_secs {
            orchestrator.timeout_secs = secs;
        }
        if let Some(url) = &self.base_url {
            orchestrator.base_url = url.clone();
        }
        if let Some(debug) = self.debug {
            orchestrator.debug = debug;
        }
        if let Some(dir) = &self.output_dir {
            config.report.output_dir = dir.to_string_lossy().into_owned();
        }
    }
}

impl UnitConfig {
    /// Builds the process executable for this unit.
    pub fn executable(&self) -> Result<ProcessUnit> {
        let mut unit = match (&self.command, &self.program) {
            (Some(command), None) => ProcessUnit::from_command_line(command)
                .with_context(|| format!("Invalid command for unit '{}'", self.id))?,
            (None, Some(program)) => ProcessUnit::new(program).args(&self.args),
            (Some(_), Some(_)) => bail!("Unit '{}' sets both `command` and `program`", self.id),
            (None, None) => bail!("Unit '{}' needs either `command` or `program`", self.id),
        };

        if let Some(dir) = &self.working_dir {
            unit = unit.working_dir(shellexpand::tilde(dir).into_owned());
        }
        for (key, value) in &self.env {
            unit = unit.env(key, value);
        }
        Ok(unit)
    }

    /// The schedulable unit for this entry.
    pub fn to_unit(&self) -> TestUnit {
        TestUnit::new(&self.id).with_params(self.params.clone())
    }
}

impl Config {
    /// Checks everything that can be checked before a run.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_parallel == 0 {
            bail!("orchestrator.max_parallel must be at least 1");
        }
        if self.orchestrator.timeout_secs == 0 {
            bail!("orchestrator.timeout_secs must be at least 1");
        }
        if let ObservabilityConfig::Http { endpoint, .. } = &self.observability
            && endpoint.trim().is_empty()
        {
            bail!("observability.endpoint must not be empty");
        }
        self.registry().map(|_| ())
    }

    /// Scheduling settings for this configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let orchestrator = &self.orchestrator;
        SchedulerConfig {
            max_concurrency: orchestrator.max_parallel,
            max_retries: orchestrator.max_retries,
            timeout: Duration::from_secs(orchestrator.timeout_secs),
            base_url: orchestrator.base_url.clone(),
            debug: orchestrator.debug,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Registers every configured unit.
    pub fn registry(&self) -> Result<UnitRegistry> {
        let mut registry = UnitRegistry::new();
        for unit in &self.units {
            if unit.id.trim().is_empty() {
                bail!("Unit ids must not be empty");
            }
            registry.register(&unit.id, unit.executable()?)?;
        }
        Ok(registry)
    }

    /// Units to run, in file order.
    ///
    /// With a non-empty `only`, just those units are returned; naming a unit
    /// that is not configured is an error.
    pub fn units(&self, only: &[String]) -> Result<Vec<TestUnit>> {
        if only.is_empty() {
            return Ok(self.units.iter().map(UnitConfig::to_unit).collect());
        }

        let known: BTreeSet<&str> = self.units.iter().map(|u| u.id.as_str()).collect();
        if let Some(missing) = only.iter().find(|id| !known.contains(id.as_str())) {
            bail!("Unknown unit: {}", missing);
        }

        let wanted: BTreeSet<&str> = only.iter().map(String::as_str).collect();
        Ok(self
            .units
            .iter()
            .filter(|u| wanted.contains(u.id.as_str()))
            .map(UnitConfig::to_unit)
            .collect())
    }

    /// Report output options.
    pub fn report_options(&self) -> ReportOptions {
        ReportOptions {
            output_dir: self.report.output_path(),
            prefix: self.report.prefix.clone(),
            junit_file: self
                .report
                .junit
                .then(|| PathBuf::from(&self.report.junit_file)),
            suite_name: match &self.observability {
                ObservabilityConfig::Http { service, .. } => service.clone(),
                _ => "e2e".to_string(),
            },
            print_summary: true,
        }
    }

    /// The configured observer.
    pub fn observer(&self) -> Result<Arc<dyn Observer>> {
        Ok(match &self.observability {
            ObservabilityConfig::None => Arc::new(NoopObserver),
            ObservabilityConfig::Tracing => Arc::new(TracingObserver),
            ObservabilityConfig::Http { endpoint, service } => Arc::new(
                HttpObserver::new(endpoint, service).context("Failed to create HTTP observer")?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [orchestrator]
        max_parallel = 3
        max_retries = 1
        timeout_secs = 10

        [[units]]
        id = "login"
        command = "node 'tests/log in.js'"

        [[units]]
        id = "search"
        program = "python3"
        args = ["search.py"]
        params = { query = "shoes" }

        [report]
        junit = true
    "#;

    #[test]
    fn test_starter_config_is_valid() {
        let config = load_config_str(STARTER_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.units.len(), 1);
    }

    #[test]
    fn test_scheduler_config() {
        let config = load_config_str(SAMPLE).unwrap();
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.max_concurrency, 3);
        assert_eq!(scheduler.max_retries, 1);
        assert_eq!(scheduler.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_registry_and_units() {
        let config = load_config_str(SAMPLE).unwrap();
        let registry = config.registry().unwrap();
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["login", "search"]);

        let units = config.units(&[]).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].params["query"], "shoes");
    }

    #[test]
    fn test_only_selects_subset_in_file_order() {
        let config = load_config_str(SAMPLE).unwrap();
        let units = config
            .units(&["search".to_string(), "login".to_string()])
            .unwrap();
        assert_eq!(units.iter().map(|u| u.id.as_str()).collect::<Vec<_>>(), vec!["login", "search"]);

        assert!(config.units(&["checkout".to_string()]).is_err());
    }

    #[test]
    fn test_duplicate_unit_ids_are_invalid() {
        let config = load_config_str(
            r#"
            [[units]]
            id = "a"
            command = "true"

            [[units]]
            id = "a"
            command = "false"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unit_needs_exactly_one_entry_point() {
        let both = UnitConfig {
            id: "x".to_string(),
            command: Some("true".to_string()),
            program: Some("true".to_string()),
            args: Vec::new(),
            working_dir: None,
            env: Default::default(),
            params: Default::default(),
        };
        assert!(both.executable().is_err());

        let neither = UnitConfig {
            command: None,
            program: None,
            ..both
        };
        assert!(neither.executable().is_err());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = load_config_str(SAMPLE).unwrap();
        Overrides {
            max_parallel: Some(8),
            base_url: Some("https://staging.example.com".to_string()),
            debug: Some(true),
            ..Overrides::default()
        }
        .apply(&mut config);

        assert_eq!(config.orchestrator.max_parallel, 8);
        assert_eq!(config.orchestrator.max_retries, 1);
        assert_eq!(config.orchestrator.base_url, "https://staging.example.com");
        assert!(config.orchestrator.debug);
    }

    #[test]
    fn test_report_options_junit() {
        let config = load_config_str(SAMPLE).unwrap();
        let options = config.report_options();
        assert_eq!(options.junit_file, Some(PathBuf::from("junit.xml")));
        assert_eq!(options.output_dir, PathBuf::from("test-results"));
    }

    #[test]
    fn test_zero_parallelism_is_invalid() {
        let config = load_config_str("[orchestrator]\nmax_parallel = 0").unwrap();
        assert!(config.validate().is_err());
    }
}
