//! cutover.toml configuration parser.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::types::{DeploymentConfig, ServiceRef, TargetRef};

/// Names of the deployment configs that are always available.
pub const BUILTIN_CONFIG_NAMES: [&str; 4] = [
    "Canary50Percent48Hours",
    "Canary50Percent2Minutes",
    "Canary10Percent5Minutes",
    "AllAtOnce",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutoverConfig {
    pub daemon: Option<DaemonConfig>,
    pub rollout: Option<RolloutConfig>,
    pub approval: Option<ApprovalConfig>,
    pub source: Option<SourceConfig>,
    pub pipeline: Option<PipelineConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployment_configs: Vec<DeploymentConfig>,
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutConfig {
    pub hook_timeout: Option<String>,
    pub propagation_delay: Option<String>,
    pub write_attempts: Option<u32>,
    pub backoff_base: Option<String>,
    pub backoff_max: Option<String>,
    pub bake_overrun_limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Unset means an approval waits indefinitely.
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory holding `taskdef.json` and `appspec-<group>.yaml` files.
    pub path: PathBuf,
    pub image: String,
    /// Account id substituted into ARNs of the task spec template.
    pub account: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub latest_group: String,
    pub stable_group: String,
    pub readiness_timeout: Option<String>,
    pub readiness_poll: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: String,
    pub cluster: String,
    pub service: String,
    /// The two target groups of the pair; the first starts as primary.
    pub targets: [String; 2],
    pub deployment_config: String,
    pub hook: Option<HookConfig>,
    pub promotion: Option<PromotionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// `host:port` of the hook endpoint.
    pub address: String,
    pub path: String,
    /// Checkpoints the hook is consulted at; all of them when unset.
    pub checkpoints: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionConfig {
    pub checkpoint: String,
    pub rules: Vec<RulePriorityConfig>,
    pub scale_down: Option<ServiceTargetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulePriorityConfig {
    pub rule: String,
    pub priority: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceTargetConfig {
    pub cluster: String,
    pub service: String,
}

impl GroupConfig {
    pub fn service_ref(&self) -> ServiceRef {
        ServiceRef::new(&self.cluster, &self.service)
    }

    pub fn target_refs(&self) -> (TargetRef, TargetRef) {
        (
            TargetRef::new(&self.targets[0]),
            TargetRef::new(&self.targets[1]),
        )
    }
}

impl CutoverConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: CutoverConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-references and value ranges.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for cfg in &self.deployment_configs {
            if cfg.canary_percentage > 100 {
                bail!(
                    "deployment config {}: canary_percentage {} exceeds 100",
                    cfg.name,
                    cfg.canary_percentage
                );
            }
            if !seen.insert(cfg.name.as_str()) {
                bail!("duplicate deployment config: {}", cfg.name);
            }
        }

        let mut group_ids = HashSet::new();
        for group in &self.groups {
            if !group_ids.insert(group.id.as_str()) {
                bail!("duplicate group: {}", group.id);
            }
            if group.targets[0] == group.targets[1] {
                bail!("group {}: both targets are {}", group.id, group.targets[0]);
            }
            let known = BUILTIN_CONFIG_NAMES.contains(&group.deployment_config.as_str())
                || seen.contains(group.deployment_config.as_str());
            if !known {
                bail!(
                    "group {}: unknown deployment config {}",
                    group.id,
                    group.deployment_config
                );
            }
        }

        if let Some(pipeline) = &self.pipeline {
            for id in [&pipeline.latest_group, &pipeline.stable_group] {
                if !group_ids.contains(id.as_str()) {
                    bail!("pipeline {}: unknown group {id}", pipeline.name);
                }
            }
            if pipeline.latest_group == pipeline.stable_group {
                bail!("pipeline {}: latest and stable group are the same", pipeline.name);
            }
        }

        for (name, value) in self.duration_fields() {
            if let Some(v) = value {
                if parse_duration(v).is_none() {
                    bail!("{name}: invalid duration {v:?}");
                }
            }
        }
        Ok(())
    }

    fn duration_fields(&self) -> Vec<(&'static str, Option<&str>)> {
        let rollout = self.rollout.as_ref();
        let pipeline = self.pipeline.as_ref();
        vec![
            ("rollout.hook_timeout", rollout.and_then(|r| r.hook_timeout.as_deref())),
            ("rollout.propagation_delay", rollout.and_then(|r| r.propagation_delay.as_deref())),
            ("rollout.backoff_base", rollout.and_then(|r| r.backoff_base.as_deref())),
            ("rollout.backoff_max", rollout.and_then(|r| r.backoff_max.as_deref())),
            ("rollout.bake_overrun_limit", rollout.and_then(|r| r.bake_overrun_limit.as_deref())),
            ("approval.timeout", self.approval.as_ref().and_then(|a| a.timeout.as_deref())),
            ("pipeline.readiness_timeout", pipeline.and_then(|p| p.readiness_timeout.as_deref())),
            ("pipeline.readiness_poll", pipeline.and_then(|p| p.readiness_poll.as_deref())),
        ]
    }

    pub fn port(&self) -> u16 {
        self.daemon.as_ref().and_then(|d| d.port).unwrap_or(8480)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.daemon
            .as_ref()
            .and_then(|d| d.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from("/var/lib/cutover"))
    }

    /// Approval timeout, `None` when approvals wait indefinitely.
    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval
            .as_ref()
            .and_then(|a| a.timeout.as_deref())
            .and_then(parse_duration)
    }

    pub fn group(&self, id: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Scaffold the two-group latest/stable layout.
    pub fn scaffold(image: &str) -> Self {
        let group = |id: &str, cfg: &str| GroupConfig {
            id: id.to_string(),
            cluster: "main".to_string(),
            service: id.to_string(),
            targets: [
                format!("{id}-target-a"),
                format!("{id}-target-b"),
            ],
            deployment_config: cfg.to_string(),
            hook: None,
            promotion: None,
        };

        CutoverConfig {
            daemon: Some(DaemonConfig {
                port: Some(8480),
                data_dir: Some(PathBuf::from("/var/lib/cutover")),
            }),
            rollout: Some(RolloutConfig {
                hook_timeout: Some("30s".to_string()),
                propagation_delay: Some("5s".to_string()),
                write_attempts: Some(5),
                backoff_base: Some("1s".to_string()),
                backoff_max: Some("30s".to_string()),
                bake_overrun_limit: Some("15m".to_string()),
            }),
            approval: Some(ApprovalConfig {
                timeout: Some("72h".to_string()),
            }),
            source: Some(SourceConfig {
                path: PathBuf::from("./assets"),
                image: image.to_string(),
                account: None,
            }),
            pipeline: Some(PipelineConfig {
                name: "multi-stage-canary".to_string(),
                latest_group: "latest".to_string(),
                stable_group: "stable".to_string(),
                readiness_timeout: Some("5m".to_string()),
                readiness_poll: Some("5s".to_string()),
            }),
            deployment_configs: Vec::new(),
            groups: vec![
                group("latest", "Canary50Percent2Minutes"),
                group("stable", "Canary50Percent2Minutes"),
            ],
        }
    }
}
