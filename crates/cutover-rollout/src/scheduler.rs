//! Service scheduler interface: registers revisions and scales services.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use cutover_core::{RevisionArtifacts, ServiceRef, TargetRef};

/// The container scheduler that runs a service's revisions.
#[async_trait]
pub trait ServiceScheduler: Send + Sync {
    /// Start `artifacts` on the service's idle `target`, using the
    /// group's own app spec when the source provided one.
    async fn register_revision(
        &self,
        service: &ServiceRef,
        target: &TargetRef,
        artifacts: &RevisionArtifacts,
        app_spec: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Whether the last registered revision is running and healthy.
    async fn revision_ready(&self, service: &ServiceRef) -> anyhow::Result<bool>;

    async fn set_desired_count(&self, service: &ServiceRef, count: u32) -> anyhow::Result<()>;
}

/// What the local scheduler knows about one service.
#[derive(Debug, Clone, Default)]
pub struct ServiceEntry {
    pub target: Option<TargetRef>,
    pub revision: Option<String>,
    pub app_spec: Option<String>,
    pub desired_count: Option<u32>,
    polls_until_ready: u32,
}

/// In-process scheduler. Revisions become ready after a configurable
/// number of readiness polls.
#[derive(Clone, Default)]
pub struct LocalScheduler {
    services: Arc<RwLock<HashMap<String, ServiceEntry>>>,
    ready_after: Arc<RwLock<u32>>,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report newly registered revisions as not ready for `polls` polls.
    pub fn set_ready_after(&self, polls: u32) {
        *self.ready_after.write().expect("scheduler lock") = polls;
    }

    pub fn service(&self, service: &ServiceRef) -> Option<ServiceEntry> {
        let services = self.services.read().expect("services lock");
        services.get(&service.key()).cloned()
    }
}

#[async_trait]
impl ServiceScheduler for LocalScheduler {
    async fn register_revision(
        &self,
        service: &ServiceRef,
        target: &TargetRef,
        artifacts: &RevisionArtifacts,
        app_spec: Option<&str>,
    ) -> anyhow::Result<()> {
        let polls = *self.ready_after.read().expect("scheduler lock");
        let mut services = self.services.write().expect("services lock");
        let entry = services.entry(service.key()).or_default();
        entry.target = Some(target.clone());
        entry.revision = Some(artifacts.revision.clone());
        entry.app_spec = app_spec.map(str::to_string);
        entry.polls_until_ready = polls;
        info!(
            service = %service,
            target = %target,
            revision = %artifacts.revision,
            image = %artifacts.image,
            app_spec = app_spec.is_some(),
            "revision registered"
        );
        Ok(())
    }

    async fn revision_ready(&self, service: &ServiceRef) -> anyhow::Result<bool> {
        let mut services = self.services.write().expect("services lock");
        let Some(entry) = services.get_mut(&service.key()) else {
            anyhow::bail!("service {service} has no registered revision");
        };
        if entry.polls_until_ready == 0 {
            return Ok(true);
        }
        entry.polls_until_ready -= 1;
        Ok(false)
    }

    async fn set_desired_count(&self, service: &ServiceRef, count: u32) -> anyhow::Result<()> {
        let mut services = self.services.write().expect("services lock");
        services.entry(service.key()).or_default().desired_count = Some(count);
        debug!(service = %service, count, "desired count set");
        Ok(())
    }
}
