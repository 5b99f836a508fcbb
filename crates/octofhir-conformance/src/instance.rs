//! Cache of module instances for one run.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::EngineError;
use crate::module::TestModule;

/// Holds at most one live instance per module type.
///
/// State a module accumulates in one case (created ids, version ids) stays
/// visible to its later cases until [`InstanceRegistry::clear`] is called.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached instance of `M`, created with `M::default()` on first access.
    pub fn get_or_create<M: TestModule>(&mut self) -> Result<Arc<M>, EngineError> {
        let entry = self
            .instances
            .entry(TypeId::of::<M>())
            .or_insert_with(|| {
                debug!(module = %M::descriptor().name, "Creating module instance");
                Arc::new(M::default()) as Arc<dyn Any + Send + Sync>
            })
            .clone();
        entry
            .downcast::<M>()
            .map_err(|_| EngineError::InstanceType(M::descriptor().name))
    }

    pub fn contains<M: TestModule>(&self) -> bool {
        self.instances.contains_key(&TypeId::of::<M>())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Drop every cached instance so the next run starts fresh.
    pub fn clear(&mut self) {
        if !self.instances.is_empty() {
            debug!(count = self.instances.len(), "Clearing module instances");
        }
        self.instances.clear();
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.instances.len())
            .finish()
    }
}
