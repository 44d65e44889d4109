use super::sync_client::{CancelSynchronizationRequest, SyncConnector, SyncStatus};
use super::DeploymentReplication;
use crate::errors::*;
use crate::reconcile::{is_deleting, FinalizerCheck};
use async_trait::async_trait;
use chrono::Utc;
use kube::ResourceExt;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const FINALIZER_STOP_SYNC: &str = "replication.dbkeeper.io/stop-sync";

/// After this long in deletion, cancellation no longer waits for the source.
pub const CANCELLATION_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const ABORT_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Holds a replication until its destination has stopped synchronizing.
pub struct StopSync {
    connector: Arc<SyncConnector>,
    abort_sent: AtomicBool,
}

impl StopSync {
    pub fn new(connector: Arc<SyncConnector>) -> Self {
        StopSync {
            connector,
            abort_sent: AtomicBool::new(false),
        }
    }

    /// None when the endpoint is not a deployment. Otherwise whether that
    /// deployment is gone or being deleted.
    async fn deployment_going(&self, name: Option<&String>) -> Result<Option<bool>> {
        let name = match name {
            Some(name) => name,
            None => return Ok(None),
        };
        match self.connector.deployments().get(name).await {
            Ok(d) => Ok(Some(is_deleting(&d))),
            Err(err) if err.is_not_found() => Ok(Some(true)),
            Err(err) => Err(err),
        }
    }
}

fn deletion_exceeded(repl: &DeploymentReplication, timeout: Duration) -> bool {
    match &repl.metadata.deletion_timestamp {
        Some(t) => Utc::now()
            .signed_duration_since(t.0)
            .to_std()
            .map_or(false, |age| age > timeout),
        None => false,
    }
}

#[async_trait]
impl FinalizerCheck<DeploymentReplication> for StopSync {
    async fn removable(&self, repl: &DeploymentReplication) -> Result<bool> {
        let name = repl.name_any();
        let mut abort = deletion_exceeded(repl, CANCELLATION_TIMEOUT);
        if self
            .deployment_going(repl.spec.source.deployment_name.as_ref())
            .await?
            == Some(true)
        {
            debug!("{}: source deployment is going away, aborting", name);
            abort = true;
        }
        if self
            .deployment_going(repl.spec.destination.deployment_name.as_ref())
            .await?
            == Some(true)
        {
            debug!("{}: destination deployment is going away", name);
            return Ok(true);
        }

        let dest = self.connector.client(&repl.spec.destination).await?;
        let info = dest.status().await?;
        match info.status {
            SyncStatus::Inactive if info.source.is_empty() => return Ok(true),
            SyncStatus::Inactive => bail!(ErrorKind::Internal(
                "inactive destination is still configured with a source".to_string()
            )),
            SyncStatus::Failed if !abort => bail!(ErrorKind::Internal(
                "destination synchronization has failed".to_string()
            )),
            SyncStatus::Cancelling if !abort || self.abort_sent.load(Ordering::SeqCst) => {
                debug!("{}: synchronization is still cancelling", name);
                return Ok(false);
            }
            _ => {}
        }

        let cancellation = &repl.spec.cancellation;
        let req = CancelSynchronizationRequest {
            wait_timeout: Duration::from_secs(0),
            force: abort,
            force_timeout: ABORT_TIMEOUT,
            ensure_in_sync: !abort && info.status.is_active() && cancellation.ensure_in_sync(),
            source_server_read_only: cancellation.source_read_only(),
        };
        info!(
            "{}: stopping synchronization (abort: {}, ensure in sync: {})",
            name, abort, req.ensure_in_sync
        );
        dest.cancel_synchronization(&req).await?;
        if abort {
            self.abort_sent.store(true, Ordering::SeqCst);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::DatabaseDeployment;
    use crate::replication::sync_client::SyncInfo;
    use crate::replication::testing::{connector_over, SRC};
    use crate::store::{MemoryStore, VersionedStore};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    async fn deployments() -> Arc<MemoryStore<DatabaseDeployment>> {
        let store = Arc::new(MemoryStore::new());
        for name in ["src", "dst"] {
            let mut d = DatabaseDeployment::example(name, "default");
            d.metadata.finalizers = Some(vec!["hold".to_string()]);
            store.create(&d).await.unwrap();
        }
        store
    }

    fn deleting_repl() -> DeploymentReplication {
        let mut r = DeploymentReplication::example("r", "default", "src", "dst");
        r.metadata.deletion_timestamp = Some(Time(Utc::now()));
        r
    }

    #[tokio::test]
    async fn running_sync_is_cancelled_then_released() {
        let store = deployments().await;
        let (connector, _, dst) = connector_over(store);
        let check = StopSync::new(connector);
        *dst.info.lock().unwrap() = SyncInfo {
            source: vec![SRC.to_string()],
            status: SyncStatus::Running,
            ..SyncInfo::default()
        };

        assert!(!check.removable(&deleting_repl()).await.unwrap());
        {
            let cancelled = dst.cancelled.lock().unwrap();
            assert_eq!(cancelled.len(), 1);
            assert!(!cancelled[0].force);
            assert!(cancelled[0].ensure_in_sync);
            assert!(!cancelled[0].source_server_read_only);
        }

        dst.info.lock().unwrap().status = SyncStatus::Cancelling;
        assert!(!check.removable(&deleting_repl()).await.unwrap());
        assert_eq!(dst.cancelled.lock().unwrap().len(), 1);

        *dst.info.lock().unwrap() = SyncInfo::default();
        assert!(check.removable(&deleting_repl()).await.unwrap());
    }

    #[tokio::test]
    async fn vanished_source_forces_abort_once() {
        let store = deployments().await;
        store.delete("src").await.unwrap();
        let (connector, _, dst) = connector_over(store);
        let check = StopSync::new(connector);
        dst.info.lock().unwrap().status = SyncStatus::Cancelling;
        dst.info.lock().unwrap().source = vec![SRC.to_string()];

        assert!(!check.removable(&deleting_repl()).await.unwrap());
        assert!(!check.removable(&deleting_repl()).await.unwrap());
        let cancelled = dst.cancelled.lock().unwrap();
        assert_eq!(cancelled.len(), 1);
        assert!(cancelled[0].force);
        assert!(!cancelled[0].ensure_in_sync);
        assert_eq!(cancelled[0].force_timeout, ABORT_TIMEOUT);
    }

    #[tokio::test]
    async fn cancellation_options_follow_spec_until_abort() {
        let store = deployments().await;
        let (connector, _, dst) = connector_over(store);
        let check = StopSync::new(connector);
        *dst.info.lock().unwrap() = SyncInfo {
            source: vec![SRC.to_string()],
            status: SyncStatus::Running,
            ..SyncInfo::default()
        };
        let mut repl = deleting_repl();
        repl.spec.cancellation.ensure_in_sync = Some(false);
        repl.spec.cancellation.source_read_only = Some(true);
        assert!(!check.removable(&repl).await.unwrap());

        // once the cancellation window has passed the stop is forced
        let mut repl = deleting_repl();
        repl.metadata.deletion_timestamp =
            Some(Time(Utc::now() - chrono::Duration::minutes(16)));
        assert!(!check.removable(&repl).await.unwrap());

        let cancelled = dst.cancelled.lock().unwrap();
        assert_eq!(cancelled.len(), 2);
        assert!(!cancelled[0].force);
        assert!(!cancelled[0].ensure_in_sync);
        assert!(cancelled[0].source_server_read_only);
        assert!(cancelled[1].force);
        assert!(!cancelled[1].ensure_in_sync);
        assert!(!cancelled[1].source_server_read_only);
    }

    #[tokio::test]
    async fn destination_gone_releases_immediately() {
        let store = deployments().await;
        store.delete("dst").await.unwrap();
        let (connector, _, dst) = connector_over(store);
        let check = StopSync::new(connector);
        assert!(check.removable(&deleting_repl()).await.unwrap());
        assert!(dst.cancelled.lock().unwrap().is_empty());
    }

    #[test]
    fn old_deletions_exceed_timeout() {
        let mut r = deleting_repl();
        assert!(!deletion_exceeded(&r, CANCELLATION_TIMEOUT));
        r.metadata.deletion_timestamp = Some(Time(Utc::now() - chrono::Duration::minutes(16)));
        assert!(deletion_exceeded(&r, CANCELLATION_TIMEOUT));
    }
}
