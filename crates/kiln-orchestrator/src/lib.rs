//! Kiln Orchestrator
//!
//! Admits training jobs one at a time and drives them through
//! load → configure → train → persist on a dedicated worker thread.
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_orchestrator::{MemoryProcessGate, ResourceClassRegistry, TrainingOrchestrator};
//! use kiln_training::{EngineFactory, MemoryProgressSink, ModelUploadTarget, TrainingLayout};
//! use std::sync::Arc;
//!
//! # fn build(factory: Arc<dyn EngineFactory>, uploader: Arc<dyn ModelUploadTarget>) {
//! let registry = Arc::new(ResourceClassRegistry::with_all_lanes(factory));
//! let orchestrator = TrainingOrchestrator::new(
//!     Arc::new(MemoryProcessGate::new()),
//!     registry,
//!     Arc::new(MemoryProgressSink::new()),
//!     uploader,
//!     TrainingLayout::new("artifacts".into()),
//! );
//! # let _ = orchestrator;
//! # }
//! ```

pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod registry;
pub mod worker;

pub use error::{JobError, JobResult};
pub use gate::{FileProcessGate, GateLease, MemoryProcessGate, ProcessGate};
pub use orchestrator::{JobHandle, JobOutcome, TrainingOrchestrator};
pub use registry::{EngineHandle, ResourceClassRegistry};
pub use worker::JobWorker;
