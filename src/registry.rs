//! Mapping from unit identifiers to their entry points.
//!
//! Units are registered once at startup and resolved before the first
//! launch, so a typo in a unit id fails the run up front instead of showing
//! up as a crash on every attempt.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::Executable;

/// Errors from registering or resolving units.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unit already registered: {0}")]
    Duplicate(String),

    #[error("Unknown unit: {0}")]
    Unknown(String),
}

/// Registered units, keyed by identifier.
#[derive(Default, Clone)]
pub struct UnitRegistry {
    entries: BTreeMap<String, Arc<dyn Executable>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entry point under `id`.
    pub fn register<E>(&mut self, id: impl Into<String>, executable: E) -> Result<(), RegistryError>
    where
        E: Executable + 'static,
    {
        self.register_arc(id, Arc::new(executable))
    }

    /// Registers an already shared entry point under `id`.
    pub fn register_arc(
        &mut self,
        id: impl Into<String>,
        executable: Arc<dyn Executable>,
    ) -> Result<(), RegistryError> {
        let id = id.into();
        if self.entries.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.entries.insert(id, executable);
        Ok(())
    }

    /// Builder-style registration for tests and small setups.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered.
    pub fn with<E>(mut self, id: impl Into<String>, executable: E) -> Self
    where
        E: Executable + 'static,
    {
        let id = id.into();
        if let Err(e) = self.register(id, executable) {
            panic!("{e}");
        }
        self
    }

    /// Looks up the entry point for `id`.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Executable>, RegistryError> {
        self.entries
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Registered identifiers in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Registered identifiers with their context kind.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &'static str)> {
        self.entries.iter().map(|(id, e)| (id.as_str(), e.kind()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.entries()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ProcessUnit, ThreadUnit};

    #[test]
    fn test_register_and_resolve() {
        let registry = UnitRegistry::new()
            .with("login", ThreadUnit::new(|_| 0))
            .with("search", ProcessUnit::new("true"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("search").unwrap().kind(), "process");
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["login", "search"]);
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let mut registry = UnitRegistry::new();
        registry.register("a", ThreadUnit::new(|_| 0)).unwrap();
        assert!(matches!(
            registry.register("a", ThreadUnit::new(|_| 1)),
            Err(RegistryError::Duplicate(id)) if id == "a"
        ));
    }

    #[test]
    fn test_unknown_unit() {
        let registry = UnitRegistry::new();
        assert!(matches!(
            registry.resolve("missing"),
            Err(RegistryError::Unknown(_))
        ));
    }
}
