use crate::errors::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the optional YAML config file.
pub const CONFIG_ENV: &str = "CONSENSUSSET_CONFIG";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// resync period of a healthy set
    pub requeue_after_secs: u64,
    pub error_requeue_secs: u64,
    /// image for action jobs that configure none
    pub default_action_image: String,
    pub controller_name: String,
    pub backup_api_group: String,
    pub backup_api_version: String,
    /// watch a single namespace instead of the whole cluster
    pub namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            requeue_after_secs: 300,
            error_requeue_secs: 60,
            default_action_image: "busybox:latest".to_string(),
            controller_name: "consensusset-controller".to_string(),
            backup_api_group: "dataprotection.pikach.us".to_string(),
            backup_api_version: "v1alpha1".to_string(),
            namespace: None,
        }
    }
}

impl OperatorConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .chain_err(|| format!("unable to read config {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Reads the file named by [`CONFIG_ENV`], or the defaults if it is unset.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn requeue_after(&self) -> Duration {
        Duration::from_secs(self.requeue_after_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }
}
