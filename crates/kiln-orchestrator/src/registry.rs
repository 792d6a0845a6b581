//! Resource-class registry holding the active engine for each lane.
//!
//! Handles are last-writer-wins: `create_instance` replaces whatever was
//! stored without disposing it, and `reset` only forgets the handle.

use kiln_training::{
    EngineFactory, ResourceClass, TrainingEngine, TrainingError, TrainingParameters, TrainingResult,
};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// The engine bound to one lane.
#[derive(Clone)]
pub struct EngineHandle {
    id: u64,
    class: ResourceClass,
    engine: Arc<dyn TrainingEngine>,
}

impl EngineHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn TrainingEngine> {
        &self.engine
    }

    #[must_use]
    pub fn is_training(&self) -> bool {
        self.engine.is_training()
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("engine", &self.engine.id())
            .finish()
    }
}

pub struct ResourceClassRegistry {
    lanes: BTreeSet<ResourceClass>,
    factory: Arc<dyn EngineFactory>,
    handles: Mutex<HashMap<ResourceClass, EngineHandle>>,
    next_id: AtomicU64,
}

impl fmt::Debug for ResourceClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceClassRegistry")
            .field("lanes", &self.lanes)
            .field("active", &self.handles().len())
            .finish_non_exhaustive()
    }
}

impl ResourceClassRegistry {
    pub fn new(lanes: impl IntoIterator<Item = ResourceClass>, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            lanes: lanes.into_iter().collect(),
            factory,
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registry serving every resource class.
    pub fn with_all_lanes(factory: Arc<dyn EngineFactory>) -> Self {
        Self::new(ResourceClass::ALL, factory)
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<ResourceClass, EngineHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build(&self, class: ResourceClass, params: &TrainingParameters) -> TrainingResult<EngineHandle> {
        let engine = self.factory.create(class, params)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(class = %class, handle = id, engine = engine.id(), "Engine created");
        Ok(EngineHandle { id, class, engine })
    }

    #[must_use]
    pub fn serves(&self, class: ResourceClass) -> bool {
        self.lanes.contains(&class)
    }

    #[must_use]
    pub fn lanes(&self) -> Vec<ResourceClass> {
        self.lanes.iter().copied().collect()
    }

    /// Existing handle for `class`, or a new one built from `params`. On a hit
    /// `params` is ignored.
    pub fn instance(&self, class: ResourceClass, params: &TrainingParameters) -> TrainingResult<EngineHandle> {
        if !self.serves(class) {
            return Err(TrainingError::InvalidArgument(format!("unrecognized resource class: {class}")));
        }
        let mut handles = self.handles();
        if let Some(handle) = handles.get(&class) {
            return Ok(handle.clone());
        }
        let handle = self.build(class, params)?;
        handles.insert(class, handle.clone());
        Ok(handle)
    }

    /// Builds and stores a new handle, replacing any existing one. Returns
    /// `Ok(None)` for a lane this registry does not serve.
    pub fn create_instance(
        &self,
        class: ResourceClass,
        params: &TrainingParameters,
    ) -> TrainingResult<Option<EngineHandle>> {
        if !self.serves(class) {
            warn!(class = %class, "create_instance on unserved resource class");
            return Ok(None);
        }
        let handle = self.build(class, params)?;
        if let Some(previous) = self.handles().insert(class, handle.clone()) {
            debug!(class = %class, replaced = previous.id, "Engine handle replaced");
        }
        Ok(Some(handle))
    }

    #[must_use]
    pub fn get_instance(&self, class: ResourceClass) -> Option<EngineHandle> {
        self.handles().get(&class).cloned()
    }

    pub fn reset(&self, class: ResourceClass) {
        if self.handles().remove(&class).is_some() {
            debug!(class = %class, "Engine handle cleared");
        }
    }

    /// Whether the lane's current engine reports it is training.
    #[must_use]
    pub fn is_training(&self, class: ResourceClass) -> bool {
        self.get_instance(class).is_some_and(|h| h.is_training())
    }
}
