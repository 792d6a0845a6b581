//! Kiln Training
//!
//! Backend-agnostic training primitives for:
//! - Describing training jobs (`TrainingParameters`, `TrainingJob`)
//! - Reporting progress (`TrainingProgress`, `ProgressSnapshot`, `ProgressSink`)
//! - Recording job artifacts (saved models, confusion cells)
//! - Implementing training backends (`TrainingEngine`)
//! - Running the in-process engine with its plateau stop (`LocalEngine`)

pub mod artifacts;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod job;
pub mod layout;
pub mod local;
pub mod plateau;
pub mod progress;
pub mod sink;

pub use artifacts::{
    sha256_file, ConfusionCell, LabelAccuracy, ModelRecord, ModelUploadTarget, TrainingReport,
    UploadOutcome,
};
pub use dataset::{count_images, label_set, resolve_category_dirs, CategoryDirs, IMAGE_EXTENSIONS, OK_CATEGORY};
pub use engine::{EngineFactory, ProgressCallback, TrainingEngine};
pub use error::{TrainingError, TrainingResult};
pub use job::{
    AugmentationConfig, ClassifierConfig, DeviceTarget, JobStatus, ResourceClass, TrainingJob,
    TrainingJobId, TrainingParameters,
};
pub use layout::TrainingLayout;
pub use local::{IterationReport, LocalEngine, NativeRuntime};
pub use plateau::{PlateauDetector, PLATEAU_THRESHOLD};
pub use progress::{ProgressSink, ProgressSnapshot, TrainingProgress};
pub use sink::{JsonlProgressSink, MemoryProgressSink};
