use crate::error::{TrainingError, TrainingResult};
use crate::progress::TrainingProgress;
use crate::artifacts::LabelAccuracy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Identifier for a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainingJobId(pub String);

impl TrainingJobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TrainingJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrainingJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A mutually-exclusive training lane. At most one engine trains per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceClass {
    Small,
    Medium,
    Large,
}

impl ResourceClass {
    pub const ALL: [Self; 3] = [Self::Small, Self::Medium, Self::Large];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Small => "Small",
            Self::Medium => "Medium",
            Self::Large => "Large",
        }
    }
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceClass {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| TrainingError::InvalidArgument(format!("unknown resource class: {s}")))
    }
}

/// Job lifecycle status. `Idle` is implicit: a job that has no record yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Loading,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    #[allow(clippy::match_same_arms)]
    pub fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::Loading, Self::Running | Self::Failed) => true,
            (Self::Running, Self::Completed | Self::Failed) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    pub rotation_degrees: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub scale: f64,
    pub noise: f64,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            flip_horizontal: true,
            flip_vertical: false,
            rotation_degrees: 0.0,
            brightness: 0.0,
            contrast: 0.0,
            scale: 0.0,
            noise: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub architecture: String,
    pub image_size: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { architecture: "resnet18".to_string(), image_size: 224, batch_size: 16, learning_rate: 1e-3 }
    }
}

/// A device that receives the trained model after the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTarget {
    pub name: String,
    /// Host (optionally `host:port`) serving `/api/model/upload`.
    pub ip: String,
    /// Directory on the device the model is written into.
    pub model_dir: String,
}

impl DeviceTarget {
    /// Destination path on the device for the given process.
    #[must_use]
    pub fn model_path(&self, process_name: &str) -> String {
        format!("{}/{process_name}.onnl", self.model_dir.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParameters {
    pub categories: Vec<String>,
    #[serde(default)]
    pub process_names: Vec<String>,
    #[serde(default = "default_train_proportion")]
    pub train_proportion: f64,
    #[serde(default = "default_validation_proportion")]
    pub validation_proportion: f64,
    pub iterations: u32,
    #[serde(default)]
    pub augmentation: AugmentationConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub use_pretrained: bool,
    #[serde(default)]
    pub devices: Vec<DeviceTarget>,
}

fn default_train_proportion() -> f64 {
    0.8
}

fn default_validation_proportion() -> f64 {
    0.2
}

impl TrainingParameters {
    #[must_use]
    pub fn new(categories: Vec<String>, iterations: u32) -> Self {
        Self {
            categories,
            process_names: Vec::new(),
            train_proportion: default_train_proportion(),
            validation_proportion: default_validation_proportion(),
            iterations,
            augmentation: AugmentationConfig::default(),
            classifier: ClassifierConfig::default(),
            use_pretrained: false,
            devices: Vec::new(),
        }
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.categories.iter().all(|c| c.trim().is_empty()) {
            return Err(TrainingError::InvalidSpec("at least one category is required".to_string()));
        }
        if self.iterations == 0 {
            return Err(TrainingError::InvalidSpec("iterations must be >= 1".to_string()));
        }
        for (name, value) in [("train_proportion", self.train_proportion), ("validation_proportion", self.validation_proportion)] {
            if !value.is_finite() || value <= 0.0 || value > 1.0 {
                return Err(TrainingError::InvalidSpec(format!("{name} must be in (0, 1]")));
            }
        }
        if self.train_proportion + self.validation_proportion > 1.0 + f64::EPSILON {
            return Err(TrainingError::InvalidSpec(
                "train_proportion + validation_proportion must not exceed 1".to_string(),
            ));
        }
        if self.classifier.image_size == 0 {
            return Err(TrainingError::InvalidSpec("classifier.image_size must be >= 1".to_string()));
        }
        if self.classifier.batch_size == 0 {
            return Err(TrainingError::InvalidSpec("classifier.batch_size must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// One training job, owned by the orchestrator for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub job_id: TrainingJobId,
    pub resource_class: ResourceClass,
    pub parameters: TrainingParameters,
    pub status: JobStatus,
    pub progress: f64,
    pub best_iteration: u32,
    pub accuracy: f64,
    pub loss: f64,
    #[serde(default)]
    pub label_accuracies: Vec<LabelAccuracy>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TrainingJob {
    #[must_use]
    pub fn new(resource_class: ResourceClass, parameters: TrainingParameters) -> Self {
        Self {
            job_id: TrainingJobId::new(),
            resource_class,
            parameters,
            status: JobStatus::Loading,
            progress: 0.0,
            best_iteration: 0,
            accuracy: 0.0,
            loss: 0.0,
            label_accuracies: Vec::new(),
            error: None,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
        }
    }

    pub fn transition(&mut self, to: JobStatus) -> TrainingResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(TrainingError::InvalidArgument(format!(
                "job {} cannot move from {:?} to {to:?}",
                self.job_id, self.status
            )));
        }
        self.status = to;
        Ok(())
    }

    /// Folds one engine report into the live fields. Progress is clamped to
    /// `[0, 1]` and never moves backwards.
    pub fn apply_progress(&mut self, report: &TrainingProgress) {
        let reported = if report.progress.is_finite() { report.progress.clamp(0.0, 1.0) } else { 0.0 };
        self.progress = self.progress.max(reported);
        self.best_iteration = report.best_iteration;
        self.accuracy = report.best_accuracy;
        if let Some(loss) = report.loss {
            self.loss = loss;
        } else {
            self.loss = report.validation_error;
        }
    }

    #[must_use]
    pub fn duration_secs(&self) -> Option<f64> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}
