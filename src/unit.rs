//! Test units and the launch parameters handed to execution contexts.
//!
//! A [`TestUnit`] is the schedulable piece of work: an identifier that the
//! [`UnitRegistry`](crate::registry::UnitRegistry) resolves to an entry point,
//! plus free-form parameters. The orchestrator never looks inside a unit; it
//! only counts attempts and routes outcomes.
//!
//! # Example
//!
//! ```
//! use e2e_orchestrator::unit::TestUnit;
//!
//! let unit = TestUnit::new("checkout/guest")
//!     .with_param("locale", "en-GB")
//!     .with_param("viewport", 1280);
//!
//! assert_eq!(unit.id, "checkout/guest");
//! assert_eq!(unit.retry_count, 0);
//! assert_eq!(unit.params.len(), 2);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Custom parameters attached to a unit.
///
/// Ordered so that reports and environment payloads are deterministic.
pub type UnitParams = BTreeMap<String, Value>;

/// One independently schedulable, potentially retried piece of test work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestUnit {
    /// Identifier of the executable test, resolved through the registry.
    pub id: String,

    /// Arbitrary configuration forwarded to the unit on every attempt.
    #[serde(default)]
    pub params: UnitParams,

    /// Number of times this unit has been requeued after a failed attempt.
    #[serde(default)]
    pub retry_count: u32,
}

impl TestUnit {
    /// Creates a unit with no params that has not been attempted yet.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: UnitParams::new(),
            retry_count: 0,
        }
    }

    /// Adds a custom parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Replaces all custom parameters.
    pub fn with_params(mut self, params: UnitParams) -> Self {
        self.params = params;
        self
    }

    /// The 1-based attempt number the next launch of this unit represents.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Returns the identity recorded in reports for this unit.
    pub fn identity(&self) -> UnitIdentity {
        UnitIdentity {
            id: self.id.clone(),
            params: self.params.clone(),
        }
    }
}

/// The part of a unit that identifies it in a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: UnitParams,
}

/// Everything an execution context receives when it is launched.
///
/// Ambient settings (base URL, debug flag, timeout) come from the run
/// configuration; `worker_ordinal` is the 1-based capacity slot the attempt
/// occupies and is meant for human-readable logs. `run_id` and `launch_id`
/// let a unit key its own scratch files (screenshots, traces) without
/// colliding with concurrently running units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchContext {
    pub unit_id: String,
    pub base_url: String,
    pub debug: bool,
    pub timeout_ms: u64,
    pub worker_ordinal: usize,
    pub attempt: u32,
    pub run_id: String,
    pub launch_id: u64,
    #[serde(default)]
    pub params: UnitParams,
}

impl LaunchContext {
    /// Looks up a custom parameter by name.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// A directory-safe key that is unique per launch within a run.
    pub fn scratch_key(&self) -> String {
        let unit: String = self
            .unit_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{}-{}-{}", self.run_id, unit, self.launch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(unit_id: &str) -> LaunchContext {
        LaunchContext {
            unit_id: unit_id.to_string(),
            base_url: "http://localhost:3000".to_string(),
            debug: false,
            timeout_ms: 1_000,
            worker_ordinal: 1,
            attempt: 1,
            run_id: "run1".to_string(),
            launch_id: 7,
            params: UnitParams::new(),
        }
    }

    #[test]
    fn test_attempt_follows_retry_count() {
        let mut unit = TestUnit::new("a");
        assert_eq!(unit.attempt(), 1);
        unit.retry_count = 2;
        assert_eq!(unit.attempt(), 3);
    }

    #[test]
    fn test_identity_keeps_params() {
        let unit = TestUnit::new("login").with_param("user", "admin");
        let identity = unit.identity();
        assert_eq!(identity.id, "login");
        assert_eq!(identity.params["user"], "admin");
    }

    #[test]
    fn test_scratch_key_is_path_safe() {
        let ctx = launch("flows/checkout page");
        assert_eq!(ctx.scratch_key(), "run1-flows_checkout_page-7");
    }

    #[test]
    fn test_launch_context_serializes_camel_case() {
        let json = serde_json::to_value(launch("a")).unwrap();
        assert_eq!(json["baseUrl"], "http://localhost:3000");
        assert_eq!(json["workerOrdinal"], 1);
        assert_eq!(json["timeoutMs"], 1_000);
    }
}
