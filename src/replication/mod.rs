//! Replication links between two database deployments.

mod finalizers;
pub mod sync_client;
mod sync_inspector;
#[cfg(test)]
pub(crate) mod testing;

pub use finalizers::{StopSync, ABORT_TIMEOUT, CANCELLATION_TIMEOUT, FINALIZER_STOP_SYNC};
pub use sync_inspector::{endpoint_status_from_shards, SyncStatusInspector};

use crate::errors::*;
use crate::reconcile::{
    impl_managed_resource, Context, DesiredState, FinalizerRegistry, Inspection, Reconciler,
    ResourceStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use kube_derive::CustomResource;
use log::warn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sync_client::SyncConnector;

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "replication.dbkeeper.io",
    version = "v1",
    kind = "DeploymentReplication",
    status = "DeploymentReplicationStatus",
    shortname = "dbr",
    namespaced
)]
pub struct DeploymentReplicationSpec {
    pub source: EndpointSpec,
    pub destination: EndpointSpec,
    #[serde(default)]
    pub cancellation: CancellationSpec,
}

/// How synchronization is stopped when the replication is deleted.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancellationSpec {
    /// Wait until the destination has caught up before stopping. Defaults to true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure_in_sync: Option<bool>,
    /// Leave the source read-only once synchronization has stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_read_only: Option<bool>,
}

impl CancellationSpec {
    pub fn ensure_in_sync(&self) -> bool {
        self.ensure_in_sync.unwrap_or(true)
    }

    pub fn source_read_only(&self) -> bool {
        self.source_read_only.unwrap_or(false)
    }
}

/// One side of a replication: either a deployment managed in the same
/// namespace or explicit sync master endpoints.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub master_endpoint: Vec<String>,
    #[serde(default)]
    pub authentication: EndpointAuthentication,
    #[serde(default)]
    pub tls: EndpointTls,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAuthentication {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile_secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_secret_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointTls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_secret_name: Option<String>,
}

impl EndpointSpec {
    fn validate(&self, side: &str, is_source: bool) -> Result<()> {
        match (&self.deployment_name, self.master_endpoint.is_empty()) {
            (Some(_), false) => bail!(invalid(format!(
                "{}: deploymentName and masterEndpoint are mutually exclusive",
                side
            ))),
            (None, true) => bail!(invalid(format!(
                "{}: one of deploymentName or masterEndpoint is required",
                side
            ))),
            (Some(name), true) if name.is_empty() => {
                bail!(invalid(format!("{}: deploymentName is empty", side)))
            }
            _ => {}
        }
        for ep in &self.master_endpoint {
            if !(ep.starts_with("https://") || ep.starts_with("http://")) {
                bail!(invalid(format!("{}: invalid master endpoint '{}'", side, ep)));
            }
        }
        if !self.master_endpoint.is_empty() && self.tls.ca_secret_name.is_none() {
            bail!(invalid(format!(
                "{}: tls.caSecretName is required for explicit endpoints",
                side
            )));
        }
        if is_source && self.authentication.keyfile_secret_name.is_none() {
            bail!(invalid(format!(
                "{}: authentication.keyfileSecretName is required",
                side
            )));
        }
        Ok(())
    }
}

impl DesiredState for DeploymentReplicationSpec {
    fn set_defaults(&mut self, _name: &str) {}

    fn validate(&self) -> Result<()> {
        self.source.validate("source", true)?;
        self.destination.validate("destination", false)?;
        if self.source.deployment_name.is_some()
            && self.source.deployment_name == self.destination.deployment_name
        {
            bail!(invalid("source and destination must be different deployments"));
        }
        Ok(())
    }

    fn reset_immutable_fields(&self, target: &mut Self) -> Vec<String> {
        let mut reset = vec![];
        if self.source.deployment_name != target.source.deployment_name {
            target.source.deployment_name = self.source.deployment_name.clone();
            reset.push("source.deploymentName".to_string());
        }
        if self.destination.deployment_name != target.destination.deployment_name {
            target.destination.deployment_name = self.destination.deployment_name.clone();
            reset.push("destination.deploymentName".to_string());
        }
        reset
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ReplicationPhase {
    #[default]
    Running,
    Failed,
}

pub const CONDITION_CONFIGURED: &str = "Configured";

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Conditions(pub Vec<Condition>);

impl Conditions {
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_).map_or(false, |c| c.status)
    }

    /// Set a condition. Returns true when anything changed.
    pub fn update(&mut self, type_: &str, status: bool, reason: &str, message: &str) -> bool {
        let now = Some(Utc::now().to_rfc3339());
        match self.0.iter_mut().find(|c| c.type_ == type_) {
            Some(c) if c.status == status && c.reason == reason && c.message == message => false,
            Some(c) => {
                if c.status != status {
                    c.last_transition_time = now;
                }
                c.status = status;
                c.reason = reason.to_string();
                c.message = message.to_string();
                true
            }
            None => {
                self.0.push(Condition {
                    type_: type_.to_string(),
                    status,
                    reason: reason.to_string(),
                    message: message.to_string(),
                    last_transition_time: now,
                });
                true
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct EndpointStatus {
    #[serde(default)]
    pub databases: Vec<DatabaseStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DatabaseStatus {
    pub name: String,
    #[serde(default)]
    pub collections: Vec<CollectionStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct CollectionStatus {
    pub name: String,
    #[serde(default)]
    pub shards: Vec<ShardStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ShardStatus {
    #[serde(default)]
    pub status: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentReplicationStatus {
    #[serde(default)]
    pub phase: ReplicationPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EndpointStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<EndpointStatus>,
}

impl ResourceStatus for DeploymentReplicationStatus {
    fn is_failed(&self) -> bool {
        self.phase == ReplicationPhase::Failed
    }

    fn mark_failed(&mut self, reason: &str) {
        self.phase = ReplicationPhase::Failed;
        self.reason = Some(reason.to_string());
    }
}

impl_managed_resource!(
    DeploymentReplication,
    DeploymentReplicationSpec,
    DeploymentReplicationStatus
);

impl DeploymentReplication {
    pub fn references_deployment(&self, name: &str) -> bool {
        self.spec.source.deployment_name.as_deref() == Some(name)
            || self.spec.destination.deployment_name.as_deref() == Some(name)
    }

    #[cfg(test)]
    pub(crate) fn example(name: &str, namespace: &str, source: &str, destination: &str) -> Self {
        let mut r = DeploymentReplication::new(
            name,
            DeploymentReplicationSpec {
                source: EndpointSpec {
                    deployment_name: Some(source.to_string()),
                    authentication: EndpointAuthentication {
                        keyfile_secret_name: Some("src-keyfile".to_string()),
                        user_secret_name: None,
                    },
                    ..EndpointSpec::default()
                },
                destination: EndpointSpec {
                    deployment_name: Some(destination.to_string()),
                    ..EndpointSpec::default()
                },
                cancellation: CancellationSpec::default(),
            },
        );
        r.metadata.namespace = Some(namespace.to_string());
        r
    }
}

pub struct ReplicationReconciler {
    inspector: SyncStatusInspector,
    finalizers: FinalizerRegistry<DeploymentReplication>,
}

impl ReplicationReconciler {
    pub fn new(connector: Arc<SyncConnector>) -> Self {
        ReplicationReconciler {
            inspector: SyncStatusInspector::new(connector.clone()),
            finalizers: FinalizerRegistry::new()
                .register(FINALIZER_STOP_SYNC, StopSync::new(connector)),
        }
    }
}

#[async_trait]
impl Reconciler<DeploymentReplication> for ReplicationReconciler {
    async fn inspect(&mut self, ctx: &mut Context<DeploymentReplication>) -> Inspection {
        let spec = ctx.object().spec.clone();
        let mut status = ctx.object().status.clone().unwrap_or_default();
        let inspection = self.inspector.inspect(&ctx.key, &spec, &mut status).await;
        status.phase = ReplicationPhase::Running;
        match ctx.updater.update_status(|s| *s = status.clone()).await {
            Ok(_) => inspection,
            Err(err) => {
                warn!("{}: updating status failed: {}", ctx.key, err);
                inspection.with_error(true)
            }
        }
    }

    fn finalizers(&self) -> &FinalizerRegistry<DeploymentReplication> {
        &self.finalizers
    }
}
