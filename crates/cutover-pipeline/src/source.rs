//! Artifact sources: where a run's revision comes from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};
use walkdir::WalkDir;

use cutover_core::RevisionArtifacts;
use cutover_core::artifacts::substitute_account;
use cutover_core::config::SourceConfig;

/// Task spec template file inside a source directory.
pub const TASK_SPEC_FILE: &str = "taskdef.json";

/// Produces the artifacts of the revision to roll out.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch_revision(&self) -> anyhow::Result<RevisionArtifacts>;
}

/// Always returns the same artifacts.
#[derive(Debug, Clone)]
pub struct StaticSource {
    artifacts: RevisionArtifacts,
}

impl StaticSource {
    pub fn new(artifacts: RevisionArtifacts) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl ArtifactSource for StaticSource {
    async fn fetch_revision(&self) -> anyhow::Result<RevisionArtifacts> {
        Ok(self.artifacts.clone())
    }
}

/// Reads `taskdef.json` and `appspec-<group>.yaml` files from a directory.
///
/// The task spec is rendered with the configured image, and ARN account
/// segments are rewritten when an account is configured.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    image: String,
    account: Option<String>,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, image: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            image: image.into(),
            account: None,
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            dir: config.path.clone(),
            image: config.image.clone(),
            account: config.account.clone(),
        }
    }

    fn load(&self) -> anyhow::Result<RevisionArtifacts> {
        let task_path = self.dir.join(TASK_SPEC_FILE);
        let mut template = std::fs::read_to_string(&task_path)
            .with_context(|| format!("reading {}", task_path.display()))?;
        if let Some(account) = &self.account {
            template = substitute_account(&template, account)?;
        }
        let task_spec: serde_json::Value = serde_json::from_str(&template)
            .with_context(|| format!("parsing {}", task_path.display()))?;

        let app_specs = read_app_specs(&self.dir)?;
        Ok(RevisionArtifacts::new(&self.image, task_spec, app_specs))
    }
}

#[async_trait]
impl ArtifactSource for DirectorySource {
    async fn fetch_revision(&self) -> anyhow::Result<RevisionArtifacts> {
        let source = self.clone();
        let artifacts = tokio::task::spawn_blocking(move || source.load()).await??;
        info!(
            dir = %self.dir.display(),
            revision = %artifacts.revision,
            image = %artifacts.image,
            app_specs = artifacts.app_specs.len(),
            "revision fetched"
        );
        Ok(artifacts)
    }
}

/// `appspec-<group>.yaml` files directly inside `dir`, keyed by group.
fn read_app_specs(dir: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let mut specs = BTreeMap::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let Some(group) = name
            .strip_prefix("appspec-")
            .and_then(|rest| rest.strip_suffix(".yaml"))
        else {
            continue;
        };
        let content = std::fs::read_to_string(entry.path())
            .with_context(|| format!("reading {}", entry.path().display()))?;
        debug!(group, path = %entry.path().display(), "app spec found");
        specs.insert(group.to_string(), content);
    }
    Ok(specs)
}
