use crate::config::AppConfig;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Read-only view of the loaded configuration handed to modules.
pub trait ConfigProvider: Send + Sync {
    /// Raw section under `modules.<module_name>`.
    fn get_module_config(&self, module_name: &str) -> Option<&Value>;

    /// Global section (`server`, `container`, `logging`) as JSON.
    fn get_config_raw(&self, key: &str) -> Option<Value>;
}

/// Typed module section; an absent section yields `T::default()`.
pub fn module_config_or_default<T: DeserializeOwned + Default>(
    provider: &dyn ConfigProvider,
    module_name: &str,
) -> anyhow::Result<T> {
    let Some(raw) = provider.get_module_config(module_name) else {
        return Ok(T::default());
    };
    serde_json::from_value(raw.clone())
        .map_err(|e| anyhow::anyhow!("invalid config for module '{module_name}': {e}"))
}

/// [`ConfigProvider`] over a shared [`AppConfig`].
#[derive(Clone)]
pub struct AppConfigProvider(Arc<AppConfig>);

impl AppConfigProvider {
    pub fn new(config: AppConfig) -> Self {
        Self(Arc::new(config))
    }

    pub fn from_arc(config: Arc<AppConfig>) -> Self {
        Self(config)
    }

    pub fn inner(&self) -> &AppConfig {
        &self.0
    }
}

impl ConfigProvider for AppConfigProvider {
    fn get_module_config(&self, module_name: &str) -> Option<&Value> {
        self.0.modules.get(module_name)
    }

    fn get_config_raw(&self, key: &str) -> Option<Value> {
        let section = match key {
            "server" => serde_json::to_value(&self.0.server),
            "container" => serde_json::to_value(&self.0.container),
            "logging" => serde_json::to_value(self.0.logging.as_ref()?),
            _ => return None,
        };
        section.ok()
    }
}
