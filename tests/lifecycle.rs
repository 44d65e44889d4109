use dbkeeper::deployment::{
    DatabaseDeployment, DatabaseDeploymentSpec, DeploymentMode, DeploymentPhase,
    DeploymentReconciler, FINALIZER_REPLICATIONS_DRAINED,
};
use dbkeeper::errors::*;
use dbkeeper::events::MemoryRecorder;
use dbkeeper::manager::LoopRegistry;
use dbkeeper::metrics::{Metric, MetricsRegistry};
use dbkeeper::reconcile::{Dependencies, LoopConfig};
use dbkeeper::replication::{
    CancellationSpec, DeploymentReplication, DeploymentReplicationSpec, EndpointSpec,
};
use dbkeeper::store::{MemoryStore, VersionedStore};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;

fn fast() -> LoopConfig {
    LoopConfig {
        queue_size: 8,
        min_interval: Duration::from_millis(10),
        max_interval: Duration::from_millis(40),
        failed_status_retry: Duration::from_millis(100),
    }
}

fn deployment(name: &str, image: &str) -> DatabaseDeployment {
    let mut d = DatabaseDeployment::new(
        name,
        DatabaseDeploymentSpec {
            mode: DeploymentMode::Cluster,
            replicas: 3,
            image: image.to_string(),
            storage_engine: String::new(),
            sync: None,
        },
    );
    d.metadata.namespace = Some("default".to_string());
    d
}

fn replication(name: &str, source: &str, destination: &str) -> DeploymentReplication {
    let mut r = DeploymentReplication::new(
        name,
        DeploymentReplicationSpec {
            source: EndpointSpec {
                deployment_name: Some(source.to_string()),
                ..EndpointSpec::default()
            },
            destination: EndpointSpec {
                deployment_name: Some(destination.to_string()),
                ..EndpointSpec::default()
            },
            cancellation: CancellationSpec::default(),
        },
    );
    r.metadata.namespace = Some("default".to_string());
    r
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn deployment_lifecycle() {
    let deployments = Arc::new(MemoryStore::<DatabaseDeployment>::new());
    let replications = Arc::new(MemoryStore::<DeploymentReplication>::new());
    let recorder = Arc::new(MemoryRecorder::new());
    let metrics = Arc::new(MetricsRegistry::new());

    let mut registry = {
        let (deployments, replications, recorder, metrics) = (
            deployments.clone(),
            replications.clone(),
            recorder.clone(),
            metrics.clone(),
        );
        LoopRegistry::new(fast(), move |_: &DatabaseDeployment| -> Result<_> {
            let deps = Dependencies {
                store: deployments.clone() as Arc<dyn VersionedStore<DatabaseDeployment>>,
                recorder: recorder.clone(),
                metrics: metrics.clone(),
            };
            Ok((DeploymentReconciler::new(replications.clone()), deps))
        })
    };

    // creation: the loop takes over and the resource starts running
    let created = deployments.create(&deployment("db-1", "v1")).await.unwrap();
    registry.apply(created).await;
    assert_eq!(registry.len(), 1);
    eventually("running status", || {
        deployments
            .snapshot("db-1")
            .and_then(|d| d.status)
            .map_or(false, |s| s.phase == DeploymentPhase::Running)
    })
    .await;
    let running = deployments.snapshot("db-1").unwrap();
    assert!(running.finalizers().contains(&FINALIZER_REPLICATIONS_DRAINED.to_string()));
    assert_eq!(recorder.count("Running"), 1);

    // an update is accepted and shows up in the status after an inspection
    let mut changed = running.clone();
    changed.spec.image = "v2".to_string();
    let changed = deployments.update(&changed).await.unwrap();
    registry.apply(changed).await;
    eventually("accepted image v2", || {
        deployments
            .snapshot("db-1")
            .and_then(|d| d.status)
            .and_then(|s| s.accepted_spec)
            .map_or(false, |spec| spec.image == "v2")
    })
    .await;
    let stored = deployments.snapshot("db-1").unwrap();
    assert_eq!(stored.spec.replicas, 3);
    assert_eq!(stored.spec.storage_engine, "rocksdb");
    assert_eq!(recorder.count("ImmutableFieldChanged"), 0);

    // deletion waits for the replication that still uses the deployment
    replications
        .create(&replication("r-1", "db-0", "db-1"))
        .await
        .unwrap();
    deployments.delete("db-1").await.unwrap();
    let deleting = deployments.snapshot("db-1").unwrap();
    assert!(deleting.metadata.deletion_timestamp.is_some());
    registry.apply(deleting.clone()).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(deployments.contains("db-1"));

    replications.delete("r-1").await.unwrap();
    eventually("deployment erased", || !deployments.contains("db-1")).await;
    assert!(metrics.get(Metric::FinalizerRemoved) >= 1);

    registry.delete(deleting).await;
    assert!(registry.is_empty());
    assert_eq!(recorder.count("ValidationFailed"), 0);
}

#[tokio::test]
async fn invalid_deployment_is_never_managed() {
    let deployments = Arc::new(MemoryStore::<DatabaseDeployment>::new());
    let replications = Arc::new(MemoryStore::<DeploymentReplication>::new());
    let recorder = Arc::new(MemoryRecorder::new());
    let mut registry = {
        let (deployments, recorder) = (deployments.clone(), recorder.clone());
        LoopRegistry::new(fast(), move |_: &DatabaseDeployment| -> Result<_> {
            let deps = Dependencies {
                store: deployments.clone() as Arc<dyn VersionedStore<DatabaseDeployment>>,
                recorder: recorder.clone(),
                metrics: Arc::new(MetricsRegistry::new()),
            };
            Ok((DeploymentReconciler::new(replications.clone()), deps))
        })
    };

    let created = deployments.create(&deployment("db-2", "")).await.unwrap();
    registry.apply(created).await;
    assert!(registry.is_empty());
    assert_eq!(recorder.count("ValidationFailed"), 1);
    assert!(deployments.snapshot("db-2").unwrap().status.is_none());
}
