//! Building the start request: category resolution, image counting and
//! optional staging into a temporary working copy.

use crate::wire::BridgeRequest;
use kiln_training::dataset::is_image;
use kiln_training::{count_images, resolve_category_dirs, ResourceClass, TrainingParameters, TrainingResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Bridge settings that are not part of a single job's parameters.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub base_url: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub base_image_dir: Option<PathBuf>,
    pub new_image_dir: Option<PathBuf>,
    /// Copy the resolved images into a temporary directory before starting.
    pub stage_to_temp: bool,
    /// Checkpoint to export instead of asking the service for the best one.
    pub best_model_path: Option<String>,
    pub pretrained_models: BTreeMap<ResourceClass, PathBuf>,
    pub out_dir: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            base_image_dir: None,
            new_image_dir: None,
            stage_to_temp: false,
            best_model_path: None,
            pretrained_models: BTreeMap::new(),
            out_dir: None,
        }
    }
}

impl BridgeConfig {
    fn image_roots(&self) -> Vec<PathBuf> {
        [&self.base_image_dir, &self.new_image_dir].into_iter().flatten().cloned().collect()
    }
}

/// Image data resolved for one job.
#[derive(Debug)]
pub struct PreparedData {
    pub class_dirs: BTreeMap<String, Vec<PathBuf>>,
    pub image_count: usize,
    /// Owned working copy; removed when dropped.
    pub staging: Option<TempDir>,
}

impl PreparedData {
    #[must_use]
    pub fn data_root(&self) -> Option<&Path> {
        self.staging.as_ref().map(TempDir::path)
    }
}

/// Resolve the job's categories to image directories and count what they hold.
pub fn prepare_data(
    config: &BridgeConfig,
    params: &TrainingParameters,
    process_names: &[String],
) -> TrainingResult<PreparedData> {
    let resolved = resolve_category_dirs(&config.image_roots(), process_names, &params.categories);

    if !config.stage_to_temp {
        let mut class_dirs = BTreeMap::new();
        let mut image_count = 0;
        for entry in resolved {
            image_count += entry.dirs.iter().map(|d| count_images(d)).sum::<usize>();
            class_dirs.insert(entry.category, entry.dirs);
        }
        debug!(classes = class_dirs.len(), image_count, "Resolved image directories");
        return Ok(PreparedData { class_dirs, image_count, staging: None });
    }

    let staging = tempfile::Builder::new().prefix("kiln-stage-").tempdir()?;
    let mut class_dirs = BTreeMap::new();
    let mut image_count = 0;
    for entry in resolved {
        let target = staging.path().join(&entry.category);
        std::fs::create_dir_all(&target)?;
        let copied = stage_images(&entry.dirs, &target)?;
        if copied == 0 {
            continue;
        }
        image_count += copied;
        class_dirs.insert(entry.category, vec![target]);
    }
    info!(staging = %staging.path().display(), image_count, "Staged training images");
    Ok(PreparedData { class_dirs, image_count, staging: Some(staging) })
}

fn stage_images(sources: &[PathBuf], target: &Path) -> TrainingResult<usize> {
    let mut copied = 0;
    for (index, source) in sources.iter().enumerate() {
        for entry in WalkDir::new(source).follow_links(true).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() || !is_image(entry.path()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            std::fs::copy(entry.path(), target.join(format!("{index}_{copied}_{name}")))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[must_use]
pub fn build_request(
    config: &BridgeConfig,
    params: &TrainingParameters,
    data: &PreparedData,
    pretrained: Option<&Path>,
) -> BridgeRequest {
    let class_dirs: BTreeMap<String, Vec<String>> = data
        .class_dirs
        .iter()
        .map(|(class, dirs)| (class.clone(), dirs.iter().map(|d| d.display().to_string()).collect()))
        .collect();

    BridgeRequest {
        data_root: data.data_root().map(|p| p.display().to_string()),
        classes: class_dirs.keys().cloned().collect(),
        class_dirs,
        img_size: params.classifier.image_size,
        epochs: params.iterations,
        batch_size: params.classifier.batch_size,
        val_split: params.validation_proportion,
        lr: params.classifier.learning_rate,
        model: params.classifier.architecture.clone(),
        augment: params.augmentation.clone(),
        pretrained: pretrained.map(|p| p.display().to_string()),
        out_dir: config.out_dir.clone(),
    }
}
