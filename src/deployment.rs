use crate::errors::*;
use crate::events::Notification;
use crate::reconcile::{
    impl_managed_resource, Context, DesiredState, FinalizerCheck, FinalizerRegistry, Inspection,
    Reconciler, ResourceStatus,
};
use crate::replication::DeploymentReplication;
use crate::store::VersionedStore;
use async_trait::async_trait;
use kube::ResourceExt;
use kube_derive::CustomResource;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const FINALIZER_REPLICATIONS_DRAINED: &str = "database.dbkeeper.io/replications-drained";
pub const DEFAULT_STORAGE_ENGINE: &str = "rocksdb";
pub const STORAGE_ENGINES: &[&str] = &["rocksdb", "memory"];

#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "database.dbkeeper.io",
    version = "v1",
    kind = "DatabaseDeployment",
    status = "DatabaseDeploymentStatus",
    shortname = "dbd",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDeploymentSpec {
    #[serde(default)]
    pub mode: DeploymentMode,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub storage_engine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncSpec>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum DeploymentMode {
    #[default]
    Single,
    Cluster,
}

/// Settings of the sync master running next to a deployment.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ca_secret_name: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum DeploymentPhase {
    #[default]
    Creating,
    Running,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDeploymentStatus {
    #[serde(default)]
    pub phase: DeploymentPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The last spec that passed validation and was acted upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_spec: Option<DatabaseDeploymentSpec>,
}

impl_managed_resource!(
    DatabaseDeployment,
    DatabaseDeploymentSpec,
    DatabaseDeploymentStatus
);

impl DesiredState for DatabaseDeploymentSpec {
    fn set_defaults(&mut self, _name: &str) {
        if self.storage_engine.is_empty() {
            self.storage_engine = DEFAULT_STORAGE_ENGINE.to_string();
        }
        if self.replicas == 0 {
            self.replicas = match self.mode {
                DeploymentMode::Single => 1,
                DeploymentMode::Cluster => 3,
            };
        }
    }

    fn validate(&self) -> Result<()> {
        if self.image.is_empty() {
            bail!(invalid("image must be set"));
        }
        if self.replicas < 1 {
            bail!(invalid(format!("replicas must be positive, got {}", self.replicas)));
        }
        if !STORAGE_ENGINES.contains(&self.storage_engine.as_str()) {
            bail!(invalid(format!(
                "unknown storage engine '{}'",
                self.storage_engine
            )));
        }
        Ok(())
    }

    fn reset_immutable_fields(&self, target: &mut Self) -> Vec<String> {
        let mut reset = vec![];
        if self.mode != target.mode {
            target.mode = self.mode;
            reset.push("mode".to_string());
        }
        if self.storage_engine != target.storage_engine {
            target.storage_engine = self.storage_engine.clone();
            reset.push("storageEngine".to_string());
        }
        reset
    }
}

impl ResourceStatus for DatabaseDeploymentStatus {
    fn is_failed(&self) -> bool {
        self.phase == DeploymentPhase::Failed
    }

    fn mark_failed(&mut self, reason: &str) {
        self.phase = DeploymentPhase::Failed;
        self.reason = Some(reason.to_string());
    }
}

impl DatabaseDeployment {
    /// DNS name of the sync master service of this deployment.
    pub fn sync_master_url(&self) -> String {
        sync_master_url(&self.name_any(), &self.namespace().unwrap_or_default())
    }

    #[cfg(test)]
    pub(crate) fn example(name: &str, namespace: &str) -> Self {
        let mut d = DatabaseDeployment::new(
            name,
            DatabaseDeploymentSpec {
                mode: DeploymentMode::Single,
                replicas: 1,
                image: "db:3.11".to_string(),
                storage_engine: DEFAULT_STORAGE_ENGINE.to_string(),
                sync: None,
            },
        );
        d.metadata.namespace = Some(namespace.to_string());
        d
    }
}

pub const SYNC_MASTER_PORT: u16 = 8629;

pub fn sync_master_url(name: &str, namespace: &str) -> String {
    format!("https://{}-sync.{}.svc:{}", name, namespace, SYNC_MASTER_PORT)
}

/// Keeps a deployment alive while replications still point at it.
pub struct ReplicationsDrained {
    replications: Arc<dyn VersionedStore<DeploymentReplication>>,
}

impl ReplicationsDrained {
    pub fn new(replications: Arc<dyn VersionedStore<DeploymentReplication>>) -> Self {
        ReplicationsDrained { replications }
    }
}

#[async_trait]
impl FinalizerCheck<DatabaseDeployment> for ReplicationsDrained {
    async fn removable(&self, deployment: &DatabaseDeployment) -> Result<bool> {
        let name = deployment.name_any();
        let blocking: Vec<String> = self
            .replications
            .list()
            .await?
            .into_iter()
            .filter(|r| r.references_deployment(&name))
            .filter(|r| r.metadata.deletion_timestamp.is_none())
            .map(|r| r.name_any())
            .collect();
        if !blocking.is_empty() {
            info!(
                "deployment {} is still referenced by replications {:?}",
                name, blocking
            );
        }
        Ok(blocking.is_empty())
    }
}

pub struct DeploymentReconciler {
    finalizers: FinalizerRegistry<DatabaseDeployment>,
}

impl DeploymentReconciler {
    pub fn new(replications: Arc<dyn VersionedStore<DeploymentReplication>>) -> Self {
        DeploymentReconciler {
            finalizers: FinalizerRegistry::new().register(
                FINALIZER_REPLICATIONS_DRAINED,
                ReplicationsDrained::new(replications),
            ),
        }
    }
}

#[async_trait]
impl Reconciler<DatabaseDeployment> for DeploymentReconciler {
    async fn inspect(&mut self, ctx: &mut Context<DatabaseDeployment>) -> Inspection {
        let spec = ctx.object().spec.clone();
        let was_running = ctx
            .object()
            .status
            .as_ref()
            .map_or(false, |s| s.phase == DeploymentPhase::Running);
        let res = ctx
            .updater
            .update_status(|s| {
                s.phase = DeploymentPhase::Running;
                s.reason = None;
                s.accepted_spec = Some(spec.clone());
            })
            .await;
        match res {
            Ok(_) => {
                if !was_running {
                    info!("{}: running", ctx.key);
                    ctx.notify(Notification::normal("Running", "deployment is running"))
                        .await;
                }
                Inspection::ok()
            }
            Err(err) => {
                warn!("{}: updating status failed: {}", ctx.key, err);
                Inspection::error()
            }
        }
    }

    fn finalizers(&self) -> &FinalizerRegistry<DatabaseDeployment> {
        &self.finalizers
    }
}
