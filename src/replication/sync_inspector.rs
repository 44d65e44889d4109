use super::sync_client::{
    endpoints_intersect, CancelSynchronizationRequest, ShardSyncInfo, SyncConnector,
    SynchronizationRequest,
};
use super::{
    CollectionStatus, DatabaseStatus, DeploymentReplicationSpec, DeploymentReplicationStatus,
    EndpointStatus, ShardStatus, CONDITION_CONFIGURED,
};
use crate::reconcile::Inspection;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Delay before checking again after asking the destination to change.
pub const RECONFIGURE_INTERVAL: Duration = Duration::from_secs(10);

/// Drives the destination sync master of a replication toward pulling from
/// the desired source. Only the destination's state leads to actions; the
/// source is queried for observability.
pub struct SyncStatusInspector {
    connector: Arc<SyncConnector>,
}

impl SyncStatusInspector {
    pub fn new(connector: Arc<SyncConnector>) -> Self {
        SyncStatusInspector { connector }
    }

    pub async fn inspect(
        &self,
        key: &str,
        spec: &DeploymentReplicationSpec,
        status: &mut DeploymentReplicationStatus,
    ) -> Inspection {
        let mut has_error = false;
        let mut next_interval = None;

        let dest = match self.connector.client(&spec.destination).await {
            Ok(client) => client,
            Err(err) => {
                warn!("{}: creating destination sync master client failed: {}", key, err);
                return Inspection::error();
            }
        };
        match dest.version().await {
            Ok(v) => debug!("{}: destination sync master version {}", key, v.version),
            Err(err) => {
                warn!("{}: fetching destination version failed: {}", key, err);
                has_error = true;
            }
        }
        let dest_endpoints = match dest.endpoints().await {
            Ok(eps) => eps,
            Err(err) => {
                warn!("{}: fetching destination endpoints failed: {}", key, err);
                has_error = true;
                vec![]
            }
        };

        let mut configure = false;
        let mut cancel = false;
        match dest.status().await {
            Err(err) => {
                warn!("{}: fetching destination status failed: {}", key, err);
                has_error = true;
            }
            Ok(info) if info.status.is_active() => {
                match self.connector.endpoint(&spec.source).await {
                    Err(err) => {
                        warn!("{}: resolving source endpoint failed: {}", key, err);
                        has_error = true;
                    }
                    Ok(source) if endpoints_intersect(&info.source, &source) => {
                        status.conditions.update(
                            CONDITION_CONFIGURED,
                            true,
                            "Active",
                            "Destination sync master is configured correctly and active",
                        );
                        status.destination = Some(endpoint_status_from_shards(&info.shards));
                    }
                    Ok(_) => {
                        warn!("{}: destination is synchronizing from another source", key);
                        cancel = true;
                        status.conditions.update(
                            CONDITION_CONFIGURED,
                            false,
                            "Invalid",
                            "Destination sync master is configured for a different source",
                        );
                    }
                }
            }
            Ok(_) => {
                configure = true;
                status.conditions.update(
                    CONDITION_CONFIGURED,
                    false,
                    "Inactive",
                    "Destination sync master is not synchronizing",
                );
            }
        }

        match self.connector.client(&spec.source).await {
            Err(err) => {
                warn!("{}: creating source sync master client failed: {}", key, err);
                has_error = true;
            }
            Ok(source) => match source.status().await {
                Err(err) => warn!("{}: fetching source status failed: {}", key, err),
                Ok(info) => {
                    let mut wanted = self
                        .connector
                        .endpoint(&spec.destination)
                        .await
                        .unwrap_or_default();
                    wanted.extend(dest_endpoints.iter().cloned());
                    match info
                        .outgoing
                        .iter()
                        .find(|o| endpoints_intersect(&o.endpoint, &wanted))
                    {
                        Some(outgoing) => {
                            status.source = Some(endpoint_status_from_shards(&outgoing.shards))
                        }
                        None => debug!("{}: destination not yet known to source", key),
                    }
                }
            },
        }

        if cancel {
            info!("{}: cancelling synchronization", key);
            match dest
                .cancel_synchronization(&CancelSynchronizationRequest::default())
                .await
            {
                Ok(_) => next_interval = Some(RECONFIGURE_INTERVAL),
                Err(err) => {
                    warn!("{}: cancelling synchronization failed: {}", key, err);
                    has_error = true;
                }
            }
        }

        if configure {
            match self.configure(spec).await {
                Ok(req) => {
                    info!("{}: configuring synchronization from {:?}", key, req.source);
                    match dest.synchronize(&req).await {
                        Ok(()) => next_interval = Some(RECONFIGURE_INTERVAL),
                        Err(err) => {
                            warn!("{}: configuring synchronization failed: {}", key, err);
                            has_error = true;
                        }
                    }
                }
                Err(err) => {
                    warn!("{}: preparing synchronization request failed: {}", key, err);
                    has_error = true;
                }
            }
        }

        Inspection {
            has_error,
            next_interval,
            fatal: None,
        }
    }

    async fn configure(
        &self,
        spec: &DeploymentReplicationSpec,
    ) -> crate::errors::Result<SynchronizationRequest> {
        let source = self.connector.endpoint(&spec.source).await?;
        let authentication = self.connector.tls_authentication(&spec.source).await?;
        Ok(SynchronizationRequest {
            source,
            authentication,
        })
    }
}

/// Arrange shard reports into a database/collection/shard tree sorted by
/// name. Gaps in shard indexes are filled with empty entries.
pub fn endpoint_status_from_shards(shards: &[ShardSyncInfo]) -> EndpointStatus {
    let mut tree: BTreeMap<&str, BTreeMap<&str, Vec<&ShardSyncInfo>>> = BTreeMap::new();
    for s in shards {
        tree.entry(s.database.as_str())
            .or_default()
            .entry(s.collection.as_str())
            .or_default()
            .push(s);
    }
    let databases = tree
        .into_iter()
        .map(|(db, collections)| DatabaseStatus {
            name: db.to_string(),
            collections: collections
                .into_iter()
                .map(|(name, mut list)| {
                    list.sort_by_key(|s| s.shard_index);
                    let mut shards: Vec<ShardStatus> = vec![];
                    for s in list {
                        while shards.len() < s.shard_index {
                            shards.push(ShardStatus::default());
                        }
                        shards.push(ShardStatus {
                            status: s.status.as_str().to_string(),
                        });
                    }
                    CollectionStatus {
                        name: name.to_string(),
                        shards,
                    }
                })
                .collect(),
        })
        .collect();
    EndpointStatus { databases }
}
