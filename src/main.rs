//! e2e-orchestrator CLI - concurrent end-to-end test runner.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::builder::FalseyValueParser;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use e2e_orchestrator::config::{self, Config, DEFAULT_CONFIG_FILE, ObservabilityConfig, Overrides};
use e2e_orchestrator::report::{self, ConsoleReporter};
use e2e_orchestrator::scheduler::Scheduler;

#[derive(Parser)]
#[command(name = "e2e-orchestrator")]
#[command(about = "Concurrent end-to-end test orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "E2E_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that override the configuration file.
#[derive(Args, Debug, Default)]
struct SettingsArgs {
    /// Maximum number of units running at once
    #[arg(short = 'j', long, env = "E2E_MAX_PARALLEL")]
    max_parallel: Option<usize>,

    /// Retries per unit after the first attempt
    #[arg(long, env = "E2E_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Per-attempt timeout in seconds
    #[arg(long, env = "E2E_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Base URL of the system under test
    #[arg(long, env = "E2E_BASE_URL")]
    base_url: Option<String>,

    /// Pass the debug flag to units and echo their output
    #[arg(long, env = "E2E_DEBUG", value_parser = FalseyValueParser::new())]
    debug: bool,
}

impl SettingsArgs {
    fn overrides(&self, output_dir: Option<PathBuf>) -> Overrides {
        Overrides {
            max_parallel: self.max_parallel,
            max_retries: self.max_retries,
            timeout_secs: self.timeout_secs,
            base_url: self.base_url.clone(),
            debug: self.debug.then_some(true),
            output_dir,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run test units
    Run {
        #[command(flatten)]
        settings: SettingsArgs,

        /// Only run this unit (repeatable)
        #[arg(long = "only", value_name = "ID")]
        only: Vec<String>,

        /// Also write JUnit XML
        #[arg(long)]
        junit: bool,

        /// Override the report output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// List configured units
    List,

    /// Validate configuration file
    Validate {
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Initialize a new configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let debug = match &cli.command {
        Commands::Run { settings, .. } | Commands::Validate { settings } => settings.debug,
        _ => false,
    };
    init_logging(cli.verbose || debug)?;

    match cli.command {
        Commands::Run {
            settings,
            only,
            junit,
            output_dir,
        } => {
            let code = run_units(&cli.config, &settings, &only, junit, output_dir, cli.verbose).await?;
            std::process::exit(code);
        }
        Commands::List => list_units(&cli.config),
        Commands::Validate { settings } => validate_config(&cli.config, &settings),
        Commands::Init { force } => init_config(&cli.config, force),
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Loads the file, applies overrides and validates the result.
fn load(config_path: &Path, overrides: &Overrides) -> Result<Config> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

async fn run_units(
    config_path: &Path,
    settings: &SettingsArgs,
    only: &[String],
    junit: bool,
    output_dir: Option<PathBuf>,
    verbose: bool,
) -> Result<i32> {
    let config = load(config_path, &settings.overrides(output_dir))?;
    info!("Loaded configuration from {}", config_path.display());

    let units = config.units(only)?;
    if units.is_empty() {
        bail!("No units configured in {}", config_path.display());
    }

    let registry = config.registry()?;
    let observer = config.observer()?;
    let mut options = config.report_options();
    if junit {
        options.junit_file = Some(PathBuf::from(&config.report.junit_file));
    }

    let scheduler = Scheduler::new(config.scheduler_config(), registry)
        .with_observer(observer.clone())
        .with_reporter(ConsoleReporter::new(verbose));
    let report = scheduler.run_all(units).await?;

    match report::emit(&report, &options, observer.as_ref()).await {
        Ok(persisted) => {
            println!();
            println!("Report: {}", persisted.path.display());
            if let Some(junit) = persisted.junit_path {
                println!("JUnit:  {}", junit.display());
            }
        }
        Err(e) => error!("Failed to store report: {}", e),
    }

    Ok(report.exit_code())
}

fn list_units(config_path: &Path) -> Result<()> {
    let config = load(config_path, &Overrides::default())?;

    for unit in &config.units {
        let executable = unit.executable()?;
        println!("{}  {}", unit.id, console::style(executable.command_line()).dim());
    }
    println!();
    println!("{} units", config.units.len());
    Ok(())
}

fn validate_config(config_path: &Path, settings: &SettingsArgs) -> Result<()> {
    match load(config_path, &settings.overrides(None)) {
        Ok(config) => {
            let orchestrator = &config.orchestrator;
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Max parallel: {}", orchestrator.max_parallel);
            println!("  Max retries: {}", orchestrator.max_retries);
            println!("  Timeout: {}s", orchestrator.timeout_secs);
            println!("  Base URL: {}", orchestrator.base_url);
            println!("  Debug: {}", orchestrator.debug);
            println!("  Units: {}", config.units.len());
            println!("  Report dir: {}", config.report.output_path().display());

            let observer = match &config.observability {
                ObservabilityConfig::None => "none".to_string(),
                ObservabilityConfig::Tracing => "tracing".to_string(),
                ObservabilityConfig::Http { endpoint, .. } => format!("http ({})", endpoint),
            };
            println!("  Observability: {}", observer);

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    std::fs::write(config_path, config::STARTER_CONFIG)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Created {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Add your units as [[units]] entries");
    println!("  2. Run: e2e-orchestrator run");

    Ok(())
}
