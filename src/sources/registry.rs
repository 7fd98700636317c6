use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::{FrameSource, SharedSource};

/// Returned when a switch request names a source that is not registered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownSource(pub String);

impl fmt::Display for UnknownSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown frame source '{}'", self.0)
    }
}

impl std::error::Error for UnknownSource {}

/// Name-indexed arena of frame sources.
///
/// Populated once at startup; registration order is preserved for listing.
pub struct SourceRegistry {
    sources: Vec<(String, SharedSource)>,
    by_name: HashMap<String, usize>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Register a source under its own name. Duplicate names are rejected.
    pub fn register<S: FrameSource + 'static>(&mut self, source: S) -> Result<()> {
        let name = source.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(anyhow!("frame source '{}' already registered", name));
        }
        self.by_name.insert(name.clone(), self.sources.len());
        self.sources.push((name, Arc::new(Mutex::new(source))));
        Ok(())
    }

    /// Look up a source by name.
    pub fn get(&self, name: &str) -> Option<SharedSource> {
        self.by_name
            .get(name)
            .map(|&index| Arc::clone(&self.sources[index].1))
    }

    /// Look up a source, failing with `UnknownSource` when absent.
    pub fn resolve(&self, name: &str) -> Result<SharedSource> {
        self.get(name)
            .ok_or_else(|| UnknownSource(name.to_string()).into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.sources.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Dimensions;
    use crate::sources::{CountSource, MovingSquareSource};

    #[test]
    fn registry_lists_in_registration_order() -> Result<()> {
        let mut registry = SourceRegistry::new();
        registry.register(MovingSquareSource::new(Dimensions::default()))?;
        registry.register(CountSource::new(Dimensions::default()))?;

        assert_eq!(registry.names(), vec!["Square", "Count"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("Count"));
        Ok(())
    }

    #[test]
    fn duplicate_names_are_rejected() -> Result<()> {
        let mut registry = SourceRegistry::new();
        registry.register(CountSource::new(Dimensions::default()))?;
        assert!(registry
            .register(CountSource::new(Dimensions::default()))
            .is_err());
        Ok(())
    }

    #[test]
    fn resolve_unknown_is_typed() {
        let registry = SourceRegistry::new();
        let err = registry.resolve("Nope").err().expect("unknown source");
        assert_eq!(
            err.downcast_ref::<UnknownSource>(),
            Some(&UnknownSource("Nope".to_string()))
        );
    }
}
