// ABOUTME: Registry pattern for runtime engine selection.
// ABOUTME: Engines register factories, the composition root creates by name from config.

use crate::engine::TurnEngine;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory function that creates a TurnEngine from config.
pub type EngineFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn TurnEngine>> + Send + Sync>;

/// Registry for runtime engine selection.
pub struct EngineRegistry {
    factories: HashMap<String, EngineFactory>,
}

impl EngineRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register an engine factory by name.
    pub fn register<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<Arc<dyn TurnEngine>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
        self
    }

    /// Create an engine by name with the given config.
    pub fn create(&self, name: &str, config: &Value) -> Result<Arc<dyn TurnEngine>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("Unknown engine: {}", name))?;
        factory(config)
    }

    /// List available engine names.
    pub fn available(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        use crate::testing::mock::MockEngine;

        Self::new().register("mock", |_config| Ok(MockEngine::echo()))
    }
}
