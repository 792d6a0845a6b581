use crate::bridge::HttpTrainingBridge;
use crate::request::BridgeConfig;
use kiln_training::{EngineFactory, ResourceClass, TrainingEngine, TrainingParameters, TrainingResult};
use std::sync::Arc;
use tracing::debug;

/// Builds one [`HttpTrainingBridge`] per job, all sharing the same service settings.
#[derive(Debug, Clone)]
pub struct HttpBridgeFactory {
    config: BridgeConfig,
}

impl HttpBridgeFactory {
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl EngineFactory for HttpBridgeFactory {
    fn create(&self, class: ResourceClass, params: &TrainingParameters) -> TrainingResult<Arc<dyn TrainingEngine>> {
        debug!(class = %class, base_url = %self.config.base_url, "Creating training bridge");
        let bridge = HttpTrainingBridge::new(self.config.clone(), class, params.clone())?;
        Ok(Arc::new(bridge))
    }
}
