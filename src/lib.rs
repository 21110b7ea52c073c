//! e2e-orchestrator: a concurrent end-to-end test orchestrator.
//!
//! Runs independent, potentially flaky test units in parallel across a
//! bounded pool of isolated execution contexts, retries failures up to a
//! limit, and produces one aggregated report.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Units** ([`unit`]): what to run, plus free-form params
//! - **Contexts** ([`context`]): isolated threads or processes running one attempt each
//! - **Registry** ([`registry`]): unit id to entry point, resolved up front
//! - **Scheduler** ([`scheduler`]): the bounded run loop and outcome reconciliation
//! - **Retry** ([`retry`]) and **Aggregation** ([`aggregate`]): requeue or finalize, then count
//! - **Report** ([`report`]) and **Observe** ([`observe`]): JSON/JUnit output and telemetry
//!
//! # Example
//!
//! ```no_run
//! use e2e_orchestrator::context::ThreadUnit;
//! use e2e_orchestrator::registry::UnitRegistry;
//! use e2e_orchestrator::scheduler::{Scheduler, SchedulerConfig};
//! use e2e_orchestrator::unit::TestUnit;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = UnitRegistry::new().with(
//!         "home",
//!         ThreadUnit::new(|ctx| {
//!             ctx.pass();
//!             0
//!         }),
//!     );
//!
//!     let scheduler = Scheduler::new(SchedulerConfig::default(), registry);
//!     let report = scheduler.run_all(vec![TestUnit::new("home")]).await?;
//!
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod aggregate;
pub mod config;
pub mod context;
pub mod observe;
pub mod outcome;
pub mod registry;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod unit;

// Re-export commonly used types
pub use aggregate::{Report, ResultAggregator, Summary, UnitResult};
pub use config::{Config, load_config};
pub use context::{Executable, ProcessUnit, ThreadUnit};
pub use observe::Observer;
pub use outcome::{Outcome, UnitMessage};
pub use registry::UnitRegistry;
pub use report::Reporter;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use unit::TestUnit;
