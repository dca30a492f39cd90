//! Stage kind lookup.

use std::collections::BTreeMap;

use serde_yaml::Value;

use super::Stage;
use crate::error::BuildError;
use crate::stages;

/// Builds a stage from its raw options, validating them.
pub type StageFactory = Box<dyn Fn(&Value) -> Result<Box<dyn Stage>, BuildError> + Send + Sync>;

struct Registration {
    summary: &'static str,
    factory: StageFactory,
}

/// Name → factory table.
pub struct StageRegistry {
    kinds: BTreeMap<String, Registration>,
}

impl StageRegistry {
    /// Registry with no kinds.
    pub fn empty() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    /// Registry holding every built-in stage kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for builtin in stages::BUILTINS {
            registry.register(builtin.kind, builtin.summary, builtin.create);
        }
        registry
    }

    /// Add or replace a kind.
    pub fn register<F>(&mut self, kind: &str, summary: &'static str, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn Stage>, BuildError> + Send + Sync + 'static,
    {
        if self
            .kinds
            .insert(
                kind.to_string(),
                Registration {
                    summary,
                    factory: Box::new(factory),
                },
            )
            .is_some()
        {
            tracing::debug!(kind, "replacing registered stage kind");
        }
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        self.kinds.keys().map(String::as_str).collect()
    }

    /// Kinds with their one-line summaries, sorted.
    pub fn summaries(&self) -> Vec<(&str, &'static str)> {
        self.kinds
            .iter()
            .map(|(k, r)| (k.as_str(), r.summary))
            .collect()
    }

    /// Instantiate `kind` with `options`.
    ///
    /// Unknown kinds are a [`BuildError::Config`] listing what is available;
    /// bad options are a [`BuildError::Schema`].
    pub fn create(&self, kind: &str, options: &Value) -> Result<Box<dyn Stage>, BuildError> {
        let registration = self.kinds.get(kind).ok_or_else(|| {
            BuildError::config(format!(
                "unknown stage kind '{}'. Available kinds: {}",
                kind,
                self.kinds().join(", ")
            ))
        })?;
        tracing::debug!(kind, "creating stage instance");
        (registration.factory)(options)
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
