//! Node local persistent volumes.
//!
//! A `LocalStorage` names directories on the nodes (the local path roots).
//! Its loop keeps a StorageClass and a provisioner on every selected node in
//! place, creates a volume for every pending claim of the class and hands
//! released volumes to the [`VolumeReclaimer`].

pub mod placement;
pub mod provisioner;
pub mod reclaimer;
pub mod resources;
#[cfg(test)]
pub(crate) mod testing;

pub use placement::VolumePlacementScheduler;
pub use reclaimer::VolumeReclaimer;
pub use resources::{Infrastructure, KubeInfrastructure};

use crate::errors::*;
use crate::events::Notification;
use crate::metrics::MetricsRegistry;
use crate::reconcile::{
    impl_managed_resource, is_deleting, Context, DesiredState, FinalizerRegistry, Inspection,
    Reconciler, ResourceStatus, StopSignal, MAX_UPDATE_ATTEMPTS,
};
use crate::store::{bounded, VersionedStore, DEFAULT_STORE_TIMEOUT};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};
use kube_derive::CustomResource;
use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const PROVISIONER_NAME: &str = "storage.dbkeeper.io/localstorage";
pub const ANNOTATION_NODE_NAME: &str = "storage.dbkeeper.io/node-name";
pub const ANNOTATION_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";
pub const ANNOTATION_ENFORCE_ANTI_AFFINITY: &str = "dbkeeper.io/enforce-anti-affinity";
pub const LABEL_DEPLOYMENT: &str = "dbkeeper.io/deployment";
pub const LABEL_ROLE: &str = "dbkeeper.io/role";

/// How long to wait for existing volumes to be picked up before creating
/// new ones anyway.
pub const MAX_PLACEMENT_DEFERRAL: Duration = Duration::from_secs(30);

#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "storage.dbkeeper.io",
    version = "v1",
    kind = "LocalStorage",
    status = "LocalStorageStatus",
    shortname = "dbls"
)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorageSpec {
    #[serde(default)]
    pub storage_class: StorageClassSpec,
    #[serde(default)]
    pub local_path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum LocalStorageState {
    #[default]
    Creating,
    Running,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorageStatus {
    #[serde(default)]
    pub state: LocalStorageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl_managed_resource!(LocalStorage, LocalStorageSpec, LocalStorageStatus);

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

impl DesiredState for LocalStorageSpec {
    fn set_defaults(&mut self, name: &str) {
        if self.storage_class.name.is_empty() {
            self.storage_class.name = name.to_string();
        }
    }

    fn validate(&self) -> Result<()> {
        if !is_dns_label(&self.storage_class.name) {
            bail!(invalid(format!(
                "storageClass.name '{}' is not a valid name",
                self.storage_class.name
            )));
        }
        if self.local_path.is_empty() {
            bail!(invalid("localPath needs at least one entry"));
        }
        for p in &self.local_path {
            let path = Path::new(p);
            if !path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
                bail!(invalid(format!("localPath '{}' must be an absolute path", p)));
            }
        }
        Ok(())
    }

    fn reset_immutable_fields(&self, target: &mut Self) -> Vec<String> {
        let mut reset = vec![];
        if self.storage_class.name != target.storage_class.name {
            target.storage_class.name = self.storage_class.name.clone();
            reset.push("storageClass.name".to_string());
        }
        if self.local_path != target.local_path {
            target.local_path = self.local_path.clone();
            reset.push("localPath".to_string());
        }
        reset
    }
}

impl ResourceStatus for LocalStorageStatus {
    fn is_failed(&self) -> bool {
        self.state == LocalStorageState::Failed
    }

    fn mark_failed(&mut self, reason: &str) {
        self.state = LocalStorageState::Failed;
        self.reason = Some(reason.to_string());
    }
}

impl LocalStorage {
    #[cfg(test)]
    pub(crate) fn example(name: &str) -> Self {
        let mut ls = LocalStorage::new(
            name,
            LocalStorageSpec {
                storage_class: StorageClassSpec {
                    name: "fast-local".to_string(),
                    is_default: false,
                },
                local_path: vec!["/mnt/disks".to_string()],
                node_selector: None,
            },
        );
        ls.metadata.uid = Some(format!("{}-uid", name));
        ls
    }
}

/// Name of the provisioner DaemonSet and Service of a `LocalStorage`.
pub fn provisioner_name(storage: &str) -> String {
    format!("{}-provisioner", storage)
}

/// Whether any owner reference of the volume points at `uid`.
pub fn is_owned_by(volume: &PersistentVolume, uid: &str) -> bool {
    volume.owner_references().iter().any(|o| o.uid == uid)
}

/// Claims of a storage class still waiting for a volume.
pub fn unbound_claims(claims: Vec<PersistentVolumeClaim>, class: &str) -> Vec<PersistentVolumeClaim> {
    claims
        .into_iter()
        .filter(|c| {
            let spec = c.spec.as_ref();
            spec.and_then(|s| s.storage_class_name.as_deref()) == Some(class)
                && spec.and_then(|s| s.volume_name.as_deref()).map_or(true, str::is_empty)
                && c.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Pending")
                && !is_deleting(c)
        })
        .collect()
}

/// Whether a change to the claim may give a local storage work: it names a
/// storage class and has no volume yet.
pub fn claim_awaits_volume(claim: &PersistentVolumeClaim) -> bool {
    let spec = claim.spec.as_ref();
    spec.and_then(|s| s.storage_class_name.as_deref())
        .map_or(false, |c| !c.is_empty())
        && spec.and_then(|s| s.volume_name.as_deref()).map_or(true, str::is_empty)
}

/// Whether the volume was created by a local storage.
pub fn is_local_volume(volume: &PersistentVolume) -> bool {
    volume.annotations().get(ANNOTATION_PROVISIONED_BY).map(String::as_str) == Some(PROVISIONER_NAME)
}

/// Claims across all namespaces.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn list(&self) -> Result<Vec<PersistentVolumeClaim>>;
    /// Point the claim at `volume`, retrying on conflicts.
    async fn bind(&self, claim: &PersistentVolumeClaim, volume: &str) -> Result<()>;
}

/// Whether `current` still has to be pointed at `volume`. A claim already
/// bound to `volume` needs nothing; one bound elsewhere is a conflict.
pub fn needs_binding(current: &PersistentVolumeClaim, volume: &str) -> Result<bool> {
    match current.spec.as_ref().and_then(|s| s.volume_name.as_deref()) {
        None | Some("") => Ok(true),
        Some(bound) if bound == volume => Ok(false),
        Some(bound) => bail!(ErrorKind::Conflict(format!(
            "claim {}/{} is already bound to {}",
            current.namespace().unwrap_or_default(),
            current.name_any(),
            bound
        ))),
    }
}

pub struct KubeClaims {
    client: Client,
    timeout: Duration,
}

impl KubeClaims {
    pub fn new(client: Client) -> Self {
        KubeClaims {
            client,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ClaimStore for KubeClaims {
    async fn list(&self) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        let list = bounded(self.timeout, "list", "claims", api.list(&ListParams::default())).await?;
        Ok(list.items)
    }

    async fn bind(&self, claim: &PersistentVolumeClaim, volume: &str) -> Result<()> {
        let name = claim.name_any();
        let ns = claim.namespace().unwrap_or_default();
        let key = format!("claim {}/{}", ns, name);
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &ns);
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let mut current = bounded(self.timeout, "get", &key, api.get(&name)).await?;
            if current.uid() != claim.uid() {
                bail!(ErrorKind::NotFound(format!("{} was replaced", key)));
            }
            if !needs_binding(&current, volume)? {
                return Ok(());
            }
            current.spec.get_or_insert_with(Default::default).volume_name = Some(volume.to_string());
            let params = PostParams::default();
            let replaced = api.replace(&name, &params, &current);
            match bounded(self.timeout, "update", &key, replaced).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_conflict() => debug!("conflict binding {}, retrying", key),
                Err(err) => return Err(err),
            }
        }
        bail!(ErrorKind::Conflict(key))
    }
}

/// What a `LocalStorage` loop works with besides its own object.
#[derive(Clone)]
pub struct StorageServices {
    pub volumes: Arc<dyn VersionedStore<PersistentVolume>>,
    pub claims: Arc<dyn ClaimStore>,
    pub fleet: Arc<dyn provisioner::ProvisionerFleet>,
    pub infrastructure: Arc<dyn Infrastructure>,
    /// Unclaimed volumes older than this are reclaimed.
    pub reclaim_age: Duration,
}

/// Result of looking at the volumes of the storage class.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct VolumeSurvey {
    pub available: usize,
    pub reclaimable: Vec<String>,
}

pub struct LocalStorageReconciler {
    services: StorageServices,
    placement: VolumePlacementScheduler,
    reclaimer: Arc<VolumeReclaimer>,
    reclaimer_stop: Arc<StopSignal>,
    needed_since: Option<Instant>,
    finalizers: FinalizerRegistry<LocalStorage>,
}

impl LocalStorageReconciler {
    pub fn new(services: StorageServices, metrics: Arc<MetricsRegistry>) -> Self {
        let placement = VolumePlacementScheduler::new(
            services.fleet.clone(),
            services.volumes.clone(),
            services.claims.clone(),
            metrics.clone(),
        );
        let reclaimer = Arc::new(VolumeReclaimer::new(
            services.fleet.clone(),
            services.volumes.clone(),
            metrics,
        ));
        LocalStorageReconciler {
            services,
            placement,
            reclaimer,
            reclaimer_stop: Arc::new(StopSignal::new()),
            needed_since: None,
            finalizers: FinalizerRegistry::new(),
        }
    }

    pub fn reclaimer(&self) -> &Arc<VolumeReclaimer> {
        &self.reclaimer
    }

    /// Queue owned volumes that are no longer needed and count the ones
    /// still waiting for a claim.
    pub async fn survey_volumes(&self, storage: &LocalStorage) -> Result<VolumeSurvey> {
        let class = &storage.spec.storage_class.name;
        let uid = storage.uid().unwrap_or_default();
        let mut survey = VolumeSurvey::default();
        for pv in self.services.volumes.list().await? {
            let in_class = pv.spec.as_ref().and_then(|s| s.storage_class_name.as_ref()) == Some(class);
            if !in_class || is_deleting(&pv) {
                continue;
            }
            let owned = is_owned_by(&pv, &uid);
            let phase = pv.status.as_ref().and_then(|s| s.phase.as_deref());
            let reclaim = match phase {
                Some("Released") => owned,
                Some("Available") => {
                    let expired = pv.creation_timestamp().map_or(false, |t| {
                        Utc::now()
                            .signed_duration_since(t.0)
                            .to_std()
                            .map_or(false, |age| age > self.services.reclaim_age)
                    });
                    if !(expired && owned) {
                        survey.available += 1;
                    }
                    expired && owned
                }
                _ => false,
            };
            if reclaim {
                survey.reclaimable.push(pv.name_any());
                self.reclaimer.add(pv);
            }
        }
        Ok(survey)
    }

    /// Create volumes for unbound claims, unless enough unclaimed volumes
    /// exist and they have not been waiting too long.
    async fn provide_volumes(&mut self, ctx: &Context<LocalStorage>, available: usize) -> Result<()> {
        let storage = ctx.object();
        let pending = unbound_claims(
            self.services.claims.list().await?,
            &storage.spec.storage_class.name,
        );
        if pending.is_empty() {
            self.needed_since = None;
            return Ok(());
        }
        let overdue = self
            .needed_since
            .map_or(false, |t| t.elapsed() > MAX_PLACEMENT_DEFERRAL);
        if !overdue && available >= pending.len() {
            debug!(
                "{}: {} unbound claims, {} volumes available, waiting",
                ctx.key,
                pending.len(),
                available
            );
            self.needed_since.get_or_insert_with(Instant::now);
            return Ok(());
        }

        let mut failed = 0;
        for (index, claim) in pending.iter().enumerate() {
            if let Err(err) = self.placement.place(storage, claim, index).await {
                warn!(
                    "{}: no volume for claim {}/{}: {}",
                    ctx.key,
                    claim.namespace().unwrap_or_default(),
                    claim.name_any(),
                    err
                );
                failed += 1;
            }
        }
        if failed > 0 {
            bail!(ErrorKind::Internal(format!(
                "{} of {} claims could not be placed",
                failed,
                pending.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler<LocalStorage> for LocalStorageReconciler {
    /// A missing status reads as `Creating` until the first clean inspection.
    async fn start(&mut self, ctx: &mut Context<LocalStorage>) -> Result<()> {
        self.services.infrastructure.ensure(ctx.object()).await?;
        tokio::spawn(self.reclaimer.clone().run(self.reclaimer_stop.clone()));
        Ok(())
    }

    async fn inspect(&mut self, ctx: &mut Context<LocalStorage>) -> Inspection {
        let mut has_error = false;
        let storage = ctx.object().clone();

        let available = match self.survey_volumes(&storage).await {
            Ok(survey) => survey.available,
            Err(err) => {
                warn!("{}: volume inspection failed: {}", ctx.key, err);
                ctx.notify(Notification::error("VolumeInspectionFailed", err.to_string()))
                    .await;
                has_error = true;
                0
            }
        };
        if let Err(err) = self.provide_volumes(ctx, available).await {
            warn!("{}: volume creation failed: {}", ctx.key, err);
            ctx.notify(Notification::error("VolumeCreationFailed", err.to_string()))
                .await;
            has_error = true;
        }

        let creating = ctx
            .object()
            .status
            .as_ref()
            .map_or(true, |s| s.state == LocalStorageState::Creating);
        if !has_error && creating {
            match ctx
                .updater
                .update_status(|s| {
                    s.state = LocalStorageState::Running;
                    s.reason = None;
                })
                .await
            {
                Ok(_) => {
                    info!("{}: running", ctx.key);
                    ctx.notify(Notification::normal("Running", "local storage is running"))
                        .await;
                }
                Err(err) => {
                    warn!("{}: updating state failed: {}", ctx.key, err);
                    has_error = true;
                }
            }
        }
        Inspection::ok().with_error(has_error)
    }

    async fn shutdown(&mut self, _ctx: &mut Context<LocalStorage>) {
        self.reclaimer_stop.stop();
    }

    fn finalizers(&self) -> &FinalizerRegistry<LocalStorage> {
        &self.finalizers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryRecorder;
    use crate::reconcile::{Dependencies, LoopConfig, LoopState, ReconcileLoop};
    use crate::storage::testing::{
        claim, pending, volume, FakeFleet, FakeInfrastructure, FakeProvisioner, MemoryClaims,
    };
    use crate::store::MemoryStore;
    use k8s_openapi::api::core::v1::PersistentVolumeStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    struct Setup {
        reconciler: LocalStorageReconciler,
        volumes: Arc<MemoryStore<PersistentVolume>>,
        claims: Arc<MemoryClaims>,
        infrastructure: Arc<FakeInfrastructure>,
        node: Arc<FakeProvisioner>,
    }

    fn setup() -> Setup {
        let volumes = Arc::new(MemoryStore::new());
        let claims = Arc::new(MemoryClaims::default());
        let infrastructure = Arc::new(FakeInfrastructure::default());
        let node = FakeProvisioner::new("node-a", 1 << 40);
        let services = StorageServices {
            volumes: volumes.clone(),
            claims: claims.clone(),
            fleet: Arc::new(FakeFleet(vec![node.clone()])),
            infrastructure: infrastructure.clone(),
            reclaim_age: Duration::from_secs(24 * 3600),
        };
        Setup {
            reconciler: LocalStorageReconciler::new(services, Arc::new(MetricsRegistry::new())),
            volumes,
            claims,
            infrastructure,
            node,
        }
    }

    fn with_phase(mut pv: PersistentVolume, phase: &str) -> PersistentVolume {
        pv.status = Some(PersistentVolumeStatus {
            phase: Some(phase.to_string()),
            ..PersistentVolumeStatus::default()
        });
        pv
    }

    #[test]
    fn defaults_validation_and_immutables() {
        let mut spec = LocalStorage::example("ls").spec;
        spec.storage_class.name.clear();
        spec.set_defaults("ls");
        assert_eq!(spec.storage_class.name, "ls");
        assert!(spec.validate().is_ok());

        let mut bad = spec.clone();
        bad.local_path = vec!["relative".to_string()];
        assert!(bad.validate().is_err());
        bad.local_path.clear();
        assert!(bad.validate().is_err());

        let mut changed = spec.clone();
        changed.storage_class.name = "other".to_string();
        changed.storage_class.is_default = true;
        changed.local_path.push("/mnt/more".to_string());
        let reset = spec.reset_immutable_fields(&mut changed);
        assert_eq!(reset, vec!["storageClass.name", "localPath"]);
        assert!(changed.storage_class.is_default);
        assert_eq!(changed.local_path, spec.local_path);
    }

    #[test]
    fn only_pending_claims_of_the_class_are_unbound() {
        let mut bound = pending(claim("bound", "ns", None));
        bound.spec.as_mut().unwrap().volume_name = Some("pv".to_string());
        let mut other = pending(claim("other", "ns", None));
        other.spec.as_mut().unwrap().storage_class_name = Some("slow".to_string());
        let unbound = unbound_claims(
            vec![pending(claim("a", "ns", None)), bound, other, claim("new", "ns", None)],
            "fast-local",
        );
        let names: Vec<String> = unbound.iter().map(|c| c.name_any()).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn volume_events_worth_an_inspection() {
        let waiting = claim("data", "ns", None);
        assert!(claim_awaits_volume(&waiting));
        let mut bound = waiting.clone();
        bound.spec.as_mut().unwrap().volume_name = Some("pv-1".to_string());
        assert!(!claim_awaits_volume(&bound));
        let mut classless = waiting;
        classless.spec.as_mut().unwrap().storage_class_name = None;
        assert!(!claim_awaits_volume(&classless));

        let mut pv = volume("pv-1", "node-a", "ls-uid");
        assert!(!is_local_volume(&pv));
        pv.annotations_mut().insert(
            ANNOTATION_PROVISIONED_BY.to_string(),
            PROVISIONER_NAME.to_string(),
        );
        assert!(is_local_volume(&pv));
    }

    #[test]
    fn binding_respects_existing_binds() {
        let mut c = claim("data", "ns", None);
        assert!(needs_binding(&c, "pv-1").unwrap());
        c.spec.as_mut().unwrap().volume_name = Some("pv-1".to_string());
        assert!(!needs_binding(&c, "pv-1").unwrap());
        assert!(needs_binding(&c, "pv-2").unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn survey_reclaims_only_owned_volumes() {
        let s = setup();
        let storage = LocalStorage::example("ls");
        let old = Time(Utc::now() - chrono::Duration::hours(25));

        let mut old_available = with_phase(volume("old", "node-a", "ls-uid"), "Available");
        old_available.metadata.creation_timestamp = Some(old.clone());
        let mut foreign_old = with_phase(volume("foreign", "node-a", "other-uid"), "Available");
        foreign_old.metadata.creation_timestamp = Some(old);
        for pv in [
            with_phase(volume("released", "node-a", "ls-uid"), "Released"),
            with_phase(volume("foreign-released", "node-a", "other-uid"), "Released"),
            with_phase(volume("fresh", "node-a", "ls-uid"), "Available"),
            with_phase(volume("bound", "node-a", "ls-uid"), "Bound"),
            old_available,
            foreign_old,
        ] {
            s.volumes.create(&pv).await.unwrap();
        }

        let survey = s.reconciler.survey_volumes(&storage).await.unwrap();
        let mut reclaimable = survey.reclaimable.clone();
        reclaimable.sort();
        assert_eq!(reclaimable, vec!["old", "released"]);
        assert_eq!(survey.available, 2);
        assert_eq!(s.reconciler.reclaimer().len(), 2);

        // a second survey does not queue anything twice
        s.reconciler.survey_volumes(&storage).await.unwrap();
        assert_eq!(s.reconciler.reclaimer().len(), 2);
    }

    fn fast() -> LoopConfig {
        LoopConfig {
            queue_size: 4,
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
            failed_status_retry: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn loop_provisions_claims_and_becomes_running() {
        let s = setup();
        let store = Arc::new(MemoryStore::<LocalStorage>::new());
        let recorder = Arc::new(MemoryRecorder::new());
        let created = store.create(&LocalStorage::example("ls")).await.unwrap();
        s.claims.add(pending(claim("data", "ns", Some("1Gi"))));
        let deps = Dependencies {
            store: store.clone(),
            recorder: recorder.clone(),
            metrics: Arc::new(MetricsRegistry::new()),
        };

        let (lp, handle) = ReconcileLoop::new(created, s.reconciler, deps, fast()).unwrap();
        let task = lp.spawn();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(s.infrastructure.ensured(), 1);
        let pv_name = s.claims.bound("ns", "data").expect("claim bound");
        assert!(s.volumes.contains(&pv_name));
        assert_eq!(s.node.prepared().len(), 1);
        let stored = store.get("ls").await.unwrap();
        assert_eq!(stored.status.unwrap().state, LocalStorageState::Running);
        assert_eq!(recorder.count("Running"), 1);

        handle.stop();
        task.await.unwrap();
        assert_eq!(handle.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn infrastructure_failure_fails_the_storage() {
        let s = setup();
        s.infrastructure.fail();
        let store = Arc::new(MemoryStore::<LocalStorage>::new());
        let created = store.create(&LocalStorage::example("ls")).await.unwrap();
        let deps = Dependencies {
            store: store.clone(),
            recorder: Arc::new(MemoryRecorder::new()),
            metrics: Arc::new(MetricsRegistry::new()),
        };

        let (lp, handle) = ReconcileLoop::new(created, s.reconciler, deps, fast()).unwrap();
        let task = lp.spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = store.get("ls").await.unwrap().status.unwrap();
        assert_eq!(status.state, LocalStorageState::Failed);
        assert!(status.reason.unwrap().contains("start failed"));
        assert_eq!(handle.state(), LoopState::Draining);

        handle.stop();
        task.await.unwrap();
    }
}
