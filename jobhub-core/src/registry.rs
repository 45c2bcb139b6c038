//! In-memory registry of job definitions

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::definition::JobDefinition;
use crate::error::{DefinitionError, JobError, JobResult};

/// Registry mapping job names to their definitions
#[derive(Debug, Default)]
pub struct JobRegistry {
    definitions: RwLock<HashMap<String, Arc<JobDefinition>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition; names are unique
    pub fn register(&self, definition: JobDefinition) -> JobResult<()> {
        let mut definitions = self.definitions.write();
        let name = definition.name().to_string();
        if definitions.contains_key(&name) {
            return Err(DefinitionError::AlreadyRegistered { name }.into());
        }

        debug!(job_name = %name, "Job definition registered");
        definitions.insert(name, Arc::new(definition));
        Ok(())
    }

    /// Builder-style registration
    pub fn with(self, definition: JobDefinition) -> JobResult<Self> {
        self.register(definition)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> JobResult<Arc<JobDefinition>> {
        self.definitions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::not_found(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.read().contains_key(name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.read().is_empty()
    }
}
