//! CLI configuration loading and merging.
//!
//! Configuration precedence:
//! 1. CLI arguments (handled by clap)
//! 2. Environment variables (`KILN_*`)
//! 3. Explicit `--config` file, or local `./kiln.toml` over global `~/.kiln/config.toml`
//! 4. Defaults

use anyhow::Context;
use kiln_bridge::BridgeConfig;
use kiln_training::{ResourceClass, TrainingParameters};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_SERVICE_URL: &str = "KILN_SERVICE_URL";
pub const ENV_GATE_FILE: &str = "KILN_GATE_FILE";
pub const ENV_ARTIFACTS_DIR: &str = "KILN_ARTIFACTS_DIR";
pub const ENV_LOG_LEVEL: &str = "KILN_LOG_LEVEL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSection {
    pub base_url: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    /// Checkpoint to export instead of the service's best model.
    pub best_model_path: Option<String>,
    pub out_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSection {
    pub base_image_dir: Option<PathBuf>,
    pub new_image_dir: Option<PathBuf>,
    pub stage_to_temp: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactsSection {
    pub root: Option<PathBuf>,
    pub upload_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub log_level: Option<String>,

    /// Resource classes this host trains. All of them when unset.
    #[serde(default)]
    pub lanes: Option<Vec<String>>,

    #[serde(default)]
    pub service: ServiceSection,

    #[serde(default)]
    pub data: DataSection,

    #[serde(default)]
    pub gate: GateSection,

    #[serde(default)]
    pub artifacts: ArtifactsSection,

    /// Pretrained checkpoint per resource class name.
    #[serde(default)]
    pub pretrained: BTreeMap<String, PathBuf>,
}

fn kiln_home() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(".")).join(".kiln")
}

impl KilnConfig {
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    pub fn default_global_path() -> PathBuf {
        kiln_home().join("config.toml")
    }

    pub fn default_local_path() -> PathBuf {
        PathBuf::from("kiln.toml")
    }

    /// Global config, then local config over it. Missing files are skipped;
    /// unparsable ones are reported.
    pub fn discover_and_load() -> ConfigResult<Self> {
        let mut config = Self::default();
        for path in [Self::default_global_path(), Self::default_local_path()] {
            match Self::load_from_file(&path) {
                Ok(found) => config.merge(&found),
                Err(ConfigError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(config)
    }

    /// An explicit path must exist; otherwise discovery applies.
    pub fn load(explicit: Option<&Path>) -> ConfigResult<Self> {
        match explicit {
            Some(path) => Self::load_from_file(path),
            None => Self::discover_and_load(),
        }
    }

    /// Values set in `other` override values in `self`.
    pub fn merge(&mut self, other: &Self) {
        fn take<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if let Some(value) = src {
                *dst = Some(value.clone());
            }
        }

        take(&mut self.log_level, &other.log_level);
        take(&mut self.lanes, &other.lanes);
        take(&mut self.service.base_url, &other.service.base_url);
        take(&mut self.service.poll_interval_ms, &other.service.poll_interval_ms);
        take(&mut self.service.request_timeout_secs, &other.service.request_timeout_secs);
        take(&mut self.service.best_model_path, &other.service.best_model_path);
        take(&mut self.service.out_dir, &other.service.out_dir);
        take(&mut self.data.base_image_dir, &other.data.base_image_dir);
        take(&mut self.data.new_image_dir, &other.data.new_image_dir);
        take(&mut self.data.stage_to_temp, &other.data.stage_to_temp);
        take(&mut self.gate.path, &other.gate.path);
        take(&mut self.artifacts.root, &other.artifacts.root);
        take(&mut self.artifacts.upload_timeout_secs, &other.artifacts.upload_timeout_secs);
        self.pretrained.extend(other.pretrained.clone());
    }

    /// Applies `KILN_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = lookup(ENV_SERVICE_URL) {
            self.service.base_url = Some(url);
        }
        if let Some(path) = lookup(ENV_GATE_FILE) {
            self.gate.path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup(ENV_ARTIFACTS_DIR) {
            self.artifacts.root = Some(PathBuf::from(path));
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = Some(level);
        }
    }

    pub fn base_url(&self) -> String {
        self.service.base_url.clone().unwrap_or_else(|| BridgeConfig::default().base_url)
    }

    pub fn request_timeout(&self) -> Duration {
        self.service.request_timeout_secs.map_or_else(|| BridgeConfig::default().request_timeout, Duration::from_secs)
    }

    pub fn gate_path(&self) -> PathBuf {
        self.gate.path.clone().unwrap_or_else(|| kiln_home().join("gate"))
    }

    pub fn artifacts_root(&self) -> PathBuf {
        self.artifacts.root.clone().unwrap_or_else(|| kiln_home().join("artifacts"))
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.artifacts.upload_timeout_secs.unwrap_or(60))
    }

    pub fn lanes(&self) -> ConfigResult<Vec<ResourceClass>> {
        match &self.lanes {
            None => Ok(ResourceClass::ALL.to_vec()),
            Some(names) => names
                .iter()
                .map(|name| name.parse().map_err(|_| ConfigError::InvalidValue(format!("lanes: {name}"))))
                .collect(),
        }
    }

    pub fn bridge_config(&self) -> ConfigResult<BridgeConfig> {
        let defaults = BridgeConfig::default();
        let mut pretrained_models = BTreeMap::new();
        for (name, path) in &self.pretrained {
            let class: ResourceClass =
                name.parse().map_err(|_| ConfigError::InvalidValue(format!("pretrained.{name}")))?;
            pretrained_models.insert(class, path.clone());
        }

        Ok(BridgeConfig {
            base_url: self.base_url(),
            poll_interval: self.service.poll_interval_ms.map_or(defaults.poll_interval, Duration::from_millis),
            request_timeout: self.request_timeout(),
            base_image_dir: self.data.base_image_dir.clone(),
            new_image_dir: self.data.new_image_dir.clone(),
            stage_to_temp: self.data.stage_to_temp.unwrap_or(false),
            best_model_path: self.service.best_model_path.clone(),
            pretrained_models,
            out_dir: self.service.out_dir.clone(),
        })
    }
}

/// Reads a job description (`TrainingParameters` as TOML).
pub fn load_job(path: &Path) -> anyhow::Result<TrainingParameters> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading job file {}", path.display()))?;
    let params: TrainingParameters =
        toml::from_str(&content).with_context(|| format!("parsing job file {}", path.display()))?;
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
log_level = "debug"
lanes = ["Medium", "large"]

[service]
base_url = "http://trainer:8000"
poll_interval_ms = 250

[data]
base_image_dir = "/data/base"
stage_to_temp = true

[pretrained]
Medium = "/models/medium.ckpt"
"#;

    #[test]
    fn test_parse_sample_config() {
        let config: KilnConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.lanes().unwrap(), vec![ResourceClass::Medium, ResourceClass::Large]);

        let bridge = config.bridge_config().unwrap();
        assert_eq!(bridge.base_url, "http://trainer:8000");
        assert_eq!(bridge.poll_interval, Duration::from_millis(250));
        assert!(bridge.stage_to_temp);
        assert_eq!(
            bridge.pretrained_models.get(&ResourceClass::Medium).map(PathBuf::as_path),
            Some(Path::new("/models/medium.ckpt"))
        );
    }

    #[test]
    fn test_merge_prefers_other() {
        let mut global: KilnConfig = toml::from_str(SAMPLE).unwrap();
        let local: KilnConfig = toml::from_str("[service]\nbase_url = \"http://localhost:9000\"\n").unwrap();
        global.merge(&local);
        assert_eq!(global.base_url(), "http://localhost:9000");
        assert_eq!(global.service.poll_interval_ms, Some(250));
        assert_eq!(global.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config: KilnConfig = toml::from_str(SAMPLE).unwrap();
        config.apply_env(|key| match key {
            ENV_SERVICE_URL => Some("http://override:1".to_string()),
            ENV_GATE_FILE => Some("/tmp/kiln-gate".to_string()),
            ENV_LOG_LEVEL => Some(" ".to_string()),
            _ => None,
        });
        assert_eq!(config.base_url(), "http://override:1");
        assert_eq!(config.gate_path(), PathBuf::from("/tmp/kiln-gate"));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_bad_lane_is_rejected() {
        let config: KilnConfig = toml::from_str("lanes = [\"Huge\"]").unwrap();
        assert!(matches!(config.lanes(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_explicit_missing_config_is_error() {
        let temp = TempDir::new().unwrap();
        let err = KilnConfig::load(Some(&temp.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_job_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("job.toml");
        std::fs::write(
            &path,
            r#"
categories = ["SCRATCH", "DENT"]
process_names = ["weld"]
iterations = 30
use_pretrained = true

[classifier]
image_size = 160

[[devices]]
name = "line-1"
ip = "10.0.0.5"
model_dir = "/opt/models"
"#,
        )
        .unwrap();

        let params = load_job(&path).unwrap();
        assert_eq!(params.iterations, 30);
        assert_eq!(params.classifier.image_size, 160);
        assert_eq!(params.classifier.batch_size, 16);
        assert_eq!(params.devices[0].model_path("weld"), "/opt/models/weld.onnl");
    }
}
