//! Operator settings.
//!
//! Settings are read from an optional YAML file. Anything missing falls back to
//! the defaults below; `main` applies command line and environment overrides on
//! top.

use crate::errors::*;
use crate::reconcile::LoopConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PROVISIONER_PORT: u16 = 8929;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    pub namespace: String,
    pub pod_name: String,
    pub service_account: String,
    pub provisioner_image: String,
    pub provisioner_port: u16,
    pub event_queue_size: usize,
    pub min_inspection_interval_secs: u64,
    pub max_inspection_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub failed_status_retry_days: u64,
    pub reclaim_age_hours: u64,
    pub metrics_address: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            namespace: "default".to_string(),
            pod_name: "dbkeeper".to_string(),
            service_account: "default".to_string(),
            provisioner_image: "dbkeeper:latest".to_string(),
            provisioner_port: DEFAULT_PROVISIONER_PORT,
            event_queue_size: 100,
            min_inspection_interval_secs: 1,
            max_inspection_interval_secs: 60,
            request_timeout_secs: 120,
            failed_status_retry_days: 365,
            reclaim_age_hours: 24,
            metrics_address: "0.0.0.0:8528".to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .chain_err(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let cfg: OperatorConfig = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_queue_size == 0 {
            bail!(invalid("eventQueueSize must be positive"));
        }
        if self.min_inspection_interval_secs == 0
            || self.min_inspection_interval_secs > self.max_inspection_interval_secs
        {
            bail!(invalid(
                "minInspectionIntervalSecs must be positive and not exceed maxInspectionIntervalSecs"
            ));
        }
        Ok(())
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            queue_size: self.event_queue_size,
            min_interval: Duration::from_secs(self.min_inspection_interval_secs),
            max_interval: Duration::from_secs(self.max_inspection_interval_secs),
            failed_status_retry: Duration::from_secs(self.failed_status_retry_days * 24 * 3600),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reclaim_age(&self) -> Duration {
        Duration::from_secs(self.reclaim_age_hours * 3600)
    }
}
