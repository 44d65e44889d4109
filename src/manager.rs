use crate::config::OperatorConfig;
use crate::deployment::{DatabaseDeployment, DeploymentReconciler};
use crate::errors::*;
use crate::events::{EventRecorder, KubeRecorder, Notification};
use crate::metrics::MetricsRegistry;
use crate::reconcile::{
    key_of, Dependencies, LoopConfig, ManagedResource, ReconcileHandle, ReconcileLoop, Reconciler,
};
use crate::replication::sync_client::{HttpSyncMasterFactory, KubeSecrets, SyncConnector};
use crate::replication::{DeploymentReplication, ReplicationReconciler};
use crate::storage::provisioner::EndpointsFleet;
use crate::storage::{
    claim_awaits_volume, is_local_volume, provisioner_name, KubeClaims, KubeInfrastructure,
    LocalStorage, LocalStorageReconciler, StorageServices,
};
use crate::store::{KubeStore, VersionedStore};
use futures::stream::{self, BoxStream};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::Api;
use kube::{Client, CustomResourceExt, Resource, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Manifests of every custom resource the operator serves.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        DatabaseDeployment::crd(),
        DeploymentReplication::crd(),
        LocalStorage::crd(),
    ]
}

/// Owns one [`ReconcileLoop`] per resource of a kind and routes watch events
/// to it. `factory` builds the reconciler and dependencies for a new resource.
pub struct LoopRegistry<K: ManagedResource, R, F> {
    loops: HashMap<String, ReconcileHandle<K>>,
    factory: F,
    config: LoopConfig,
    seen: Option<BTreeSet<String>>,
    _reconciler: std::marker::PhantomData<fn() -> R>,
}

impl<K, R, F> LoopRegistry<K, R, F>
where
    K: ManagedResource,
    R: Reconciler<K>,
    F: Fn(&K) -> Result<(R, Dependencies<K>)> + Send + Sync,
{
    pub fn new(config: LoopConfig, factory: F) -> Self {
        LoopRegistry {
            loops: HashMap::new(),
            factory,
            config,
            seen: None,
            _reconciler: std::marker::PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn handle(&self, key: &str) -> Option<&ReconcileHandle<K>> {
        self.loops.get(key)
    }

    /// The resource was added or changed.
    pub async fn apply(&mut self, object: K) {
        let key = key_of(&object);
        if let Some(seen) = &mut self.seen {
            seen.insert(key.clone());
        }
        if let Some(handle) = self.loops.get(&key) {
            if !handle.is_stopped() && handle.update(object.clone()).await {
                return;
            }
            debug!("{}: loop has exited, starting a new one", key);
            self.loops.remove(&key);
        }
        self.spawn(key, object).await;
    }

    async fn spawn(&mut self, key: String, object: K) {
        let (reconciler, deps) = match (self.factory)(&object) {
            Ok(parts) => parts,
            Err(err) => {
                warn!("{}: cannot build reconciler: {}", key, err);
                return;
            }
        };
        let recorder = deps.recorder.clone();
        match ReconcileLoop::new(object.clone(), reconciler, deps, self.config.clone()) {
            Ok((lp, handle)) => {
                lp.spawn();
                self.loops.insert(key, handle);
            }
            Err(err) => {
                warn!("{}", err);
                let reference = object.object_ref(&());
                let reason = err
                    .iter()
                    .last()
                    .map_or_else(|| err.to_string(), |e| e.to_string());
                recorder
                    .record(&reference, Notification::error("ValidationFailed", reason))
                    .await;
            }
        }
    }

    /// The resource is gone from the API server.
    pub async fn delete(&mut self, object: K) {
        let key = key_of(&object);
        if let Some(handle) = self.loops.remove(&key) {
            handle.delete(object).await;
        }
    }

    /// A full list follows. Loops of resources missing from it are stopped
    /// by [`finish_resync`](Self::finish_resync).
    pub fn begin_resync(&mut self) {
        self.seen = Some(BTreeSet::new());
    }

    pub fn finish_resync(&mut self) {
        let seen = match self.seen.take() {
            Some(seen) => seen,
            None => return,
        };
        self.loops.retain(|key, handle| {
            if seen.contains(key) {
                return true;
            }
            info!("{}: vanished while not watching, stopping its loop", key);
            handle.stop();
            false
        });
    }

    /// Ask every loop for an inspection soon.
    pub fn trigger_all(&self) {
        for handle in self.loops.values() {
            handle.trigger();
        }
    }

    pub fn stop_all(&mut self) {
        for (_, handle) in self.loops.drain() {
            handle.stop();
        }
    }

    /// Feed watch events into the registry until the stream ends.
    pub async fn drive(self, api: Api<K>)
    where
        K: DeserializeOwned + Serialize,
    {
        self.drive_with(api, stream::pending::<()>().boxed()).await
    }

    /// Like [`drive`](Self::drive). Every item of `wakes` also triggers an
    /// inspection of all resources.
    pub async fn drive_with(mut self, api: Api<K>, mut wakes: BoxStream<'static, ()>)
    where
        K: DeserializeOwned + Serialize,
    {
        let kind = K::kind(&()).to_string();
        let mut events = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        loop {
            tokio::select! {
                event = events.next() => match event {
                    None => break,
                    Some(Ok(watcher::Event::Init)) => self.begin_resync(),
                    Some(Ok(watcher::Event::InitApply(obj))) | Some(Ok(watcher::Event::Apply(obj))) => {
                        self.apply(obj).await
                    }
                    Some(Ok(watcher::Event::InitDone)) => self.finish_resync(),
                    Some(Ok(watcher::Event::Delete(obj))) => self.delete(obj).await,
                    Some(Err(err)) => warn!("watching {} failed: {}", kind, err),
                },
                Some(()) = wakes.next() => self.trigger_all(),
            }
        }
        warn!("watch of {} ended", kind);
        self.stop_all();
    }
}

/// Changes of claims waiting for a volume and of local volumes. Either may
/// give a local storage something to do.
fn volume_changes(client: &Client) -> BoxStream<'static, ()> {
    let claims = watcher(
        Api::<PersistentVolumeClaim>::all(client.clone()),
        watcher::Config::default(),
    )
    .default_backoff()
    .applied_objects()
    .filter_map(|res| async move {
        match res {
            Ok(claim) if claim_awaits_volume(&claim) => {
                debug!("claim {} waits for a volume", key_of(&claim));
                Some(())
            }
            Ok(_) => None,
            Err(err) => {
                warn!("watching claims failed: {}", err);
                None
            }
        }
    });
    let volumes = watcher(
        Api::<PersistentVolume>::all(client.clone()),
        watcher::Config::default(),
    )
    .default_backoff()
    .applied_objects()
    .filter_map(|res| async move {
        match res {
            Ok(pv) if is_local_volume(&pv) => Some(()),
            Ok(_) => None,
            Err(err) => {
                warn!("watching volumes failed: {}", err);
                None
            }
        }
    });
    stream::select(claims, volumes).boxed()
}

fn kube_store<K>(api: Api<K>, timeout: Duration) -> Arc<dyn VersionedStore<K>>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    Arc::new(KubeStore::new(api).with_timeout(timeout))
}

pub struct Manager {
    pub metrics: Arc<MetricsRegistry>,
}

impl Manager {
    /// Check the CRDs are installed and build the watch loops. The returned
    /// future drives all of them and has to be awaited by the caller.
    pub async fn new(
        client: Client,
        config: OperatorConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<(Self, BoxFuture<'static, ()>)> {
        let installed: Api<CustomResourceDefinition> = Api::all(client.clone());
        for crd in crds() {
            let name = crd.name_any();
            installed
                .get(&name)
                .await
                .chain_err(|| format!("CRD {} is not installed, apply `dbkeeper crd` first", name))?;
        }

        let recorder: Arc<dyn EventRecorder> = Arc::new(KubeRecorder::new(
            client.clone(),
            "dbkeeper",
            Some(config.pod_name.clone()),
        ));
        let timeout = config.request_timeout();
        let loop_config = config.loop_config();

        let deployments = {
            let (client, recorder, metrics) = (client.clone(), recorder.clone(), metrics.clone());
            LoopRegistry::new(loop_config.clone(), move |d: &DatabaseDeployment| {
                let ns = d.namespace().unwrap_or_default();
                let replications = kube_store(Api::namespaced(client.clone(), &ns), timeout);
                let deps = Dependencies {
                    store: kube_store(Api::namespaced(client.clone(), &ns), timeout),
                    recorder: recorder.clone(),
                    metrics: metrics.clone(),
                };
                Ok((DeploymentReconciler::new(replications), deps))
            })
        };

        let replications = {
            let (client, recorder, metrics) = (client.clone(), recorder.clone(), metrics.clone());
            LoopRegistry::new(loop_config.clone(), move |r: &DeploymentReplication| {
                let ns = r.namespace().unwrap_or_default();
                let connector = SyncConnector::new(
                    kube_store(Api::namespaced(client.clone(), &ns), timeout),
                    Arc::new(
                        KubeSecrets::new(Api::namespaced(client.clone(), &ns)).with_timeout(timeout),
                    ),
                    Arc::new(HttpSyncMasterFactory),
                );
                let deps = Dependencies {
                    store: kube_store(Api::namespaced(client.clone(), &ns), timeout),
                    recorder: recorder.clone(),
                    metrics: metrics.clone(),
                };
                Ok((ReplicationReconciler::new(Arc::new(connector)), deps))
            })
        };

        let storages = {
            let (client, recorder, metrics, config) = (
                client.clone(),
                recorder.clone(),
                metrics.clone(),
                config.clone(),
            );
            LoopRegistry::new(loop_config, move |ls: &LocalStorage| {
                let services = StorageServices {
                    volumes: kube_store(Api::<PersistentVolume>::all(client.clone()), timeout),
                    claims: Arc::new(KubeClaims::new(client.clone()).with_timeout(timeout)),
                    fleet: Arc::new(EndpointsFleet::new(
                        Api::namespaced(client.clone(), &config.namespace),
                        &provisioner_name(&ls.name_any()),
                        config.provisioner_port,
                    )),
                    infrastructure: Arc::new(KubeInfrastructure::new(client.clone(), config.clone())),
                    reclaim_age: config.reclaim_age(),
                };
                let deps = Dependencies {
                    store: kube_store(Api::all(client.clone()), timeout),
                    recorder: recorder.clone(),
                    metrics: metrics.clone(),
                };
                Ok((LocalStorageReconciler::new(services, metrics.clone()), deps))
            })
        };

        info!("watching deployments, replications, local storages and their volumes");
        let drainer = async move {
            futures::join!(
                deployments.drive(Api::<DatabaseDeployment>::all(client.clone())),
                replications.drive(Api::<DeploymentReplication>::all(client.clone())),
                storages.drive_with(Api::<LocalStorage>::all(client.clone()), volume_changes(&client)),
            );
        }
        .boxed();

        Ok((Manager { metrics }, drainer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::DeploymentPhase;
    use crate::events::MemoryRecorder;
    use crate::metrics::Metric;
    use crate::replication::DeploymentReplication;
    use crate::store::MemoryStore;

    fn fast() -> LoopConfig {
        LoopConfig {
            queue_size: 4,
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
            failed_status_retry: Duration::from_millis(100),
        }
    }

    type Factory = Box<
        dyn Fn(&DatabaseDeployment) -> Result<(DeploymentReconciler, Dependencies<DatabaseDeployment>)>
            + Send
            + Sync,
    >;

    struct Setup {
        store: Arc<MemoryStore<DatabaseDeployment>>,
        recorder: Arc<MemoryRecorder>,
        metrics: Arc<MetricsRegistry>,
        registry: LoopRegistry<DatabaseDeployment, DeploymentReconciler, Factory>,
    }

    fn setup() -> Setup {
        setup_with(fast())
    }

    fn setup_with(config: LoopConfig) -> Setup {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(MemoryRecorder::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let replications = Arc::new(MemoryStore::<DeploymentReplication>::new());
        let deps = Dependencies {
            store: store.clone() as Arc<dyn VersionedStore<DatabaseDeployment>>,
            recorder: recorder.clone() as Arc<dyn EventRecorder>,
            metrics: metrics.clone(),
        };
        let registry = LoopRegistry::new(
            config,
            Box::new(move |_: &DatabaseDeployment| {
                Ok((DeploymentReconciler::new(replications.clone()), deps.clone()))
            }) as Factory,
        );
        Setup {
            store,
            recorder,
            metrics,
            registry,
        }
    }

    #[test]
    fn crds_cover_every_kind() {
        let names: Vec<String> = crds().iter().map(|c| c.name_any()).collect();
        assert_eq!(
            names,
            vec![
                "databasedeployments.database.dbkeeper.io",
                "deploymentreplications.replication.dbkeeper.io",
                "localstorages.storage.dbkeeper.io",
            ]
        );
        assert_eq!(crds()[2].spec.scope, "Cluster");
    }

    #[tokio::test]
    async fn spawns_one_loop_per_resource() {
        let mut s = setup();
        let created = s
            .store
            .create(&DatabaseDeployment::example("db-1", "default"))
            .await
            .unwrap();
        s.registry.apply(created.clone()).await;
        s.registry.apply(created.clone()).await;
        assert_eq!(s.registry.len(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stored = s.store.get("db-1").await.unwrap();
        assert_eq!(stored.status.as_ref().unwrap().phase, DeploymentPhase::Running);

        let handle = s.registry.handle("default/db-1").unwrap().clone();
        s.registry.delete(stored).await;
        assert!(s.registry.is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn invalid_resources_are_refused_with_a_notification() {
        let mut s = setup();
        let mut bad = DatabaseDeployment::example("db-1", "default");
        bad.spec.image = String::new();
        s.registry.apply(bad).await;
        assert!(s.registry.is_empty());
        assert_eq!(s.recorder.count("ValidationFailed"), 1);
    }

    #[tokio::test]
    async fn trigger_all_inspects_every_resource() {
        let mut s = setup_with(LoopConfig {
            min_interval: Duration::from_secs(3600),
            max_interval: Duration::from_secs(3600),
            ..fast()
        });
        for name in ["a", "b"] {
            let created = s
                .store
                .create(&DatabaseDeployment::example(name, "default"))
                .await
                .unwrap();
            s.registry.apply(created).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = s.metrics.get(Metric::Inspection);
        assert!(settled >= 2);

        s.registry.trigger_all();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(s.metrics.get(Metric::Inspection), settled + 2);
        s.registry.stop_all();
    }

    #[tokio::test]
    async fn resync_stops_loops_of_vanished_resources() {
        let mut s = setup();
        let a = s.store.create(&DatabaseDeployment::example("a", "default")).await.unwrap();
        let b = s.store.create(&DatabaseDeployment::example("b", "default")).await.unwrap();
        s.registry.apply(a.clone()).await;
        s.registry.apply(b).await;
        let b_handle = s.registry.handle("default/b").unwrap().clone();

        s.registry.begin_resync();
        s.registry.apply(a).await;
        s.registry.finish_resync();

        assert_eq!(s.registry.len(), 1);
        assert!(s.registry.handle("default/a").is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b_handle.is_stopped());
        s.registry.stop_all();
    }
}
