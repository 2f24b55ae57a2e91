//! Built-in canary policies and the catalogue that resolves config names.

use std::collections::BTreeMap;

use cutover_core::DeploymentConfig;
use cutover_core::config::BUILTIN_CONFIG_NAMES;

use crate::error::{ShiftError, ShiftResult};

/// The built-in configs, in the order of [`BUILTIN_CONFIG_NAMES`].
pub fn builtin_configs() -> Vec<DeploymentConfig> {
    let [h48, m2, m5, all] = BUILTIN_CONFIG_NAMES;
    vec![
        DeploymentConfig::new(h48, 50, 48 * 60),
        DeploymentConfig::new(m2, 50, 2),
        DeploymentConfig::new(m5, 10, 5),
        DeploymentConfig::new(all, 100, 0),
    ]
}

/// Named configs available to deployment groups.
///
/// Custom configs shadow built-ins of the same name.
#[derive(Debug, Clone)]
pub struct ConfigCatalog {
    configs: BTreeMap<String, DeploymentConfig>,
}

impl ConfigCatalog {
    pub fn new(custom: &[DeploymentConfig]) -> ShiftResult<Self> {
        let mut configs: BTreeMap<String, DeploymentConfig> = builtin_configs()
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();
        for cfg in custom {
            cfg.validate()?;
            configs.insert(cfg.name.clone(), cfg.clone());
        }
        Ok(Self { configs })
    }

    pub fn resolve(&self, name: &str) -> ShiftResult<DeploymentConfig> {
        self.configs
            .get(name)
            .cloned()
            .ok_or_else(|| ShiftError::UnknownConfig(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.configs.keys().map(String::as_str).collect()
    }
}

impl Default for ConfigCatalog {
    fn default() -> Self {
        Self {
            configs: builtin_configs()
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
        }
    }
}
