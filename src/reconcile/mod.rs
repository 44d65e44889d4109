//! The per-resource control loop.
//!
//! Every managed resource gets its own [`ReconcileLoop`] running as a tokio
//! task. The loop is the only writer of the resource's status. It takes
//! change notifications from a bounded [`EventSender`] queue and coalesced
//! inspection triggers, and sleeps between unsolicited inspections for a
//! duration chosen by the [`InspectionScheduler`].

mod finalizer;
mod queue;
mod trigger;
mod updater;

pub use finalizer::{
    add_finalizers, remove_finalizers, FinalizerCheck, FinalizerPass, FinalizerRegistry,
};
pub use queue::{event_queue, Event, EventSender, StopSignal};
pub use trigger::{Inspection, InspectionScheduler, Trigger};
pub use updater::{OptimisticUpdater, MAX_UPDATE_ATTEMPTS};

use crate::errors::*;
use crate::events::{EventRecorder, Notification};
use crate::metrics::{Metric, MetricsRegistry};
use crate::retry::RetryPolicy;
use crate::store::VersionedStore;
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use log::{debug, error, info, warn};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// The user owned, desired state of a resource.
pub trait DesiredState: Clone + PartialEq + Debug + Send + Sync {
    fn set_defaults(&mut self, name: &str);
    fn validate(&self) -> Result<()>;
    /// Copy every field of `self` that may not change after creation into
    /// `target` when they differ, returning the names of those fields.
    fn reset_immutable_fields(&self, target: &mut Self) -> Vec<String>;
}

/// The operator owned, observed state of a resource.
pub trait ResourceStatus: Clone + PartialEq + Default + Debug + Send + Sync {
    fn is_failed(&self) -> bool;
    fn mark_failed(&mut self, reason: &str);
}

pub trait ManagedResource:
    Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static
{
    type Spec: DesiredState;
    type Status: ResourceStatus;

    fn spec(&self) -> &Self::Spec;
    fn spec_mut(&mut self) -> &mut Self::Spec;
    fn status(&self) -> Option<&Self::Status>;
    fn status_mut(&mut self) -> &mut Self::Status;

    fn is_failed(&self) -> bool {
        self.status().map_or(false, |s| s.is_failed())
    }
}

/// Implement [`ManagedResource`] for a custom resource with `spec` and `status` fields.
macro_rules! impl_managed_resource {
    ($kind:ty, $spec:ty, $status:ty) => {
        impl $crate::reconcile::ManagedResource for $kind {
            type Spec = $spec;
            type Status = $status;

            fn spec(&self) -> &$spec {
                &self.spec
            }

            fn spec_mut(&mut self) -> &mut $spec {
                &mut self.spec
            }

            fn status(&self) -> Option<&$status> {
                self.status.as_ref()
            }

            fn status_mut(&mut self) -> &mut $status {
                self.status.get_or_insert_with(Default::default)
            }
        }
    };
}
pub(crate) use impl_managed_resource;

/// `namespace/name`, or just the name for cluster scoped resources.
pub fn key_of<K: Resource>(object: &K) -> String {
    let name = object.meta().name.clone().unwrap_or_default();
    match &object.meta().namespace {
        Some(ns) => format!("{}/{}", ns, name),
        None => name,
    }
}

pub fn is_deleting<K: Resource>(object: &K) -> bool {
    object.meta().deletion_timestamp.is_some()
}

/// Domain logic plugged into a [`ReconcileLoop`].
#[async_trait]
pub trait Reconciler<K: ManagedResource>: Send + Sync + 'static {
    /// Called once before the first event. An error fails the resource.
    async fn start(&mut self, _ctx: &mut Context<K>) -> Result<()> {
        Ok(())
    }

    /// Compare desired against observed state and act on the difference.
    async fn inspect(&mut self, ctx: &mut Context<K>) -> Inspection;

    /// Called once when the loop stops doing domain work.
    async fn shutdown(&mut self, _ctx: &mut Context<K>) {}

    fn finalizers(&self) -> &FinalizerRegistry<K>;
}

/// What a reconciler sees of its loop.
pub struct Context<K: ManagedResource> {
    pub key: String,
    pub updater: OptimisticUpdater<K>,
    pub recorder: Arc<dyn EventRecorder>,
    pub metrics: Arc<MetricsRegistry>,
    pub trigger: Arc<Trigger>,
}

impl<K: ManagedResource> Context<K> {
    pub fn object(&self) -> &K {
        self.updater.object()
    }

    pub async fn notify(&self, notification: Notification) {
        let reference = self.object().object_ref(&());
        self.recorder.record(&reference, notification).await
    }
}

#[derive(Clone, Debug)]
pub struct LoopConfig {
    pub queue_size: usize,
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// How long to keep trying to persist a `Failed` status.
    pub failed_status_retry: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            queue_size: 100,
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            failed_status_retry: Duration::from_secs(365 * 24 * 3600),
        }
    }
}

/// Shared services every loop needs.
pub struct Dependencies<K> {
    pub store: Arc<dyn VersionedStore<K>>,
    pub recorder: Arc<dyn EventRecorder>,
    pub metrics: Arc<MetricsRegistry>,
}

impl<K> Clone for Dependencies<K> {
    fn clone(&self) -> Self {
        Dependencies {
            store: self.store.clone(),
            recorder: self.recorder.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Running: full reconciliation. Draining: the resource was deleted or failed
/// and only deletion is still served. Stopped: the task has exited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug)]
struct StateCell(Mutex<LoopState>);

impl StateCell {
    fn get(&self) -> LoopState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, state: LoopState) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

/// Cheap handle for feeding and stopping a loop.
pub struct ReconcileHandle<K> {
    sender: EventSender<K>,
    stop: Arc<StopSignal>,
    state: Arc<StateCell>,
    deleted: Arc<AtomicBool>,
    trigger: Arc<Trigger>,
}

impl<K> Clone for ReconcileHandle<K> {
    fn clone(&self) -> Self {
        ReconcileHandle {
            sender: self.sender.clone(),
            stop: self.stop.clone(),
            state: self.state.clone(),
            deleted: self.deleted.clone(),
            trigger: self.trigger.clone(),
        }
    }
}

impl<K> ReconcileHandle<K> {
    /// Waits while the queue is full. Returns false when the loop is gone.
    pub async fn update(&self, object: K) -> bool {
        self.sender.send(Event::Updated(object)).await
    }

    /// The resource disappeared. Calling this more than once has no effect.
    pub async fn delete(&self, last: K) {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.sender.send(Event::Deleted(last)).await {
            self.stop.stop();
        }
    }

    /// Something the resource depends on changed; inspect it soon.
    pub fn trigger(&self) {
        self.trigger.trigger();
    }

    /// Stop the loop without waiting for queued events.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == LoopState::Stopped
    }
}

pub struct ReconcileLoop<K: ManagedResource, R> {
    ctx: Context<K>,
    reconciler: R,
    events: tokio::sync::mpsc::Receiver<Event<K>>,
    stop: Arc<StopSignal>,
    state: Arc<StateCell>,
    scheduler: InspectionScheduler,
    config: LoopConfig,
    shut_down: bool,
}

impl<K: ManagedResource, R: Reconciler<K>> ReconcileLoop<K, R> {
    /// Build a loop for `object`. Refuses resources whose spec is invalid
    /// even after defaults have been applied.
    pub fn new(
        object: K,
        reconciler: R,
        deps: Dependencies<K>,
        config: LoopConfig,
    ) -> Result<(Self, ReconcileHandle<K>)> {
        let key = key_of(&object);
        let mut spec = object.spec().clone();
        spec.set_defaults(&object.name_any());
        spec.validate()
            .chain_err(|| format!("{}: refusing to manage invalid resource", key))?;

        let stop = Arc::new(StopSignal::new());
        let (sender, events) = event_queue(&key, config.queue_size, stop.clone());
        let initial = if object.is_failed() {
            LoopState::Draining
        } else {
            LoopState::Running
        };
        let state = Arc::new(StateCell(Mutex::new(initial)));
        let trigger = Arc::new(Trigger::new());
        let handle = ReconcileHandle {
            sender,
            stop: stop.clone(),
            state: state.clone(),
            deleted: Arc::new(AtomicBool::new(false)),
            trigger: trigger.clone(),
        };
        let ctx = Context {
            key,
            updater: OptimisticUpdater::new(deps.store, object, deps.metrics.clone()),
            recorder: deps.recorder,
            metrics: deps.metrics,
            trigger,
        };
        let lp = ReconcileLoop {
            ctx,
            reconciler,
            events,
            stop,
            state,
            scheduler: InspectionScheduler::new(config.min_interval, config.max_interval),
            config,
            shut_down: false,
        };
        Ok((lp, handle))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let key = self.ctx.key.clone();
        if self.state.get() == LoopState::Running {
            info!("{}: starting", key);
            if let Err(err) = self.reconciler.start(&mut self.ctx).await {
                self.fail(&format!("start failed: {}", err)).await;
            }
        } else {
            info!("{}: resource has failed, serving deletion only", key);
            // a failed resource never started, so there is nothing to shut down
            self.shut_down = true;
        }
        self.ctx.trigger.trigger();

        loop {
            let interval = self.scheduler.interval();
            tokio::select! {
                biased;
                _ = self.stop.stopped() => break,
                event = self.events.recv() => match event {
                    Some(Event::Updated(object)) => self.handle_updated(object).await,
                    Some(Event::Deleted(_)) | None => {
                        info!("{}: resource deleted", key);
                        break;
                    }
                },
                _ = self.ctx.trigger.triggered() => self.inspect().await,
                _ = tokio::time::sleep(interval) => {
                    self.scheduler.on_timeout();
                    self.ctx.trigger.trigger();
                }
            }
        }

        self.stop.stop();
        self.enter_draining().await;
        self.state.set(LoopState::Stopped);
        info!("{}: stopped", key);
    }

    async fn handle_updated(&mut self, _notified: K) {
        self.ctx.metrics.record(Metric::Event);
        let mut accepted = self.ctx.object().spec().clone();
        accepted.set_defaults(&self.ctx.object().name_any());
        match self.ctx.updater.reload().await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                debug!("{}: gone, ignoring update", self.ctx.key);
                return;
            }
            Err(err) => {
                warn!("{}: reloading failed: {}", self.ctx.key, err);
                self.ctx.trigger.trigger();
                return;
            }
        }
        if self.state.get() != LoopState::Running || self.ctx.object().is_failed() {
            // still pick up deletion requests
            self.ctx.trigger.trigger();
            return;
        }

        let mut spec = self.ctx.object().spec().clone();
        spec.set_defaults(&self.ctx.object().name_any());
        for field in accepted.reset_immutable_fields(&mut spec) {
            info!("{}: reset change of immutable field {}", self.ctx.key, field);
            self.ctx.notify(Notification::immutable_field(&field)).await;
        }
        if let Err(err) = spec.validate() {
            warn!("{}: rejected invalid spec: {}", self.ctx.key, err);
            self.ctx
                .notify(Notification::error("ValidationFailed", err.to_string()))
                .await;
            spec = accepted;
        }
        if let Err(err) = self.ctx.updater.update_spec(|s| *s = spec.clone()).await {
            warn!("{}: persisting spec failed: {}", self.ctx.key, err);
        }
        self.ctx.trigger.trigger();
    }

    async fn inspect(&mut self) {
        self.ctx.metrics.record(Metric::Inspection);
        let inspection = if is_deleting(self.ctx.object()) {
            self.run_finalizers().await
        } else if self.state.get() != LoopState::Running {
            Inspection::ok()
        } else {
            match self.reconciler.finalizers().add_all(&mut self.ctx.updater).await {
                Err(err) => {
                    warn!("{}: adding finalizers failed: {}", self.ctx.key, err);
                    Inspection::error()
                }
                Ok(_) => self.reconciler.inspect(&mut self.ctx).await,
            }
        };
        if inspection.has_error {
            self.ctx.metrics.record(Metric::InspectionError);
        }
        if let Some(reason) = &inspection.fatal {
            self.fail(reason).await;
        }
        self.scheduler.record(&inspection);
        debug!(
            "{}: next inspection in {:?}",
            self.ctx.key,
            self.scheduler.interval()
        );
    }

    async fn run_finalizers(&mut self) -> Inspection {
        match self.reconciler.finalizers().run(&mut self.ctx.updater).await {
            Ok(pass) => {
                self.ctx
                    .metrics
                    .add(Metric::FinalizerRemoved, pass.removed.len() as u64);
                Inspection::ok().with_error(!pass.is_done())
            }
            Err(err) => {
                warn!("{}: running finalizers failed: {}", self.ctx.key, err);
                Inspection::error()
            }
        }
    }

    /// Persist the `Failed` status and stop domain work. Keeps retrying the
    /// write until the retry budget is spent or the loop is stopped.
    async fn fail(&mut self, reason: &str) {
        error!("{}: failed: {}", self.ctx.key, reason);
        self.ctx.metrics.record(Metric::FailedResource);
        self.ctx
            .notify(Notification::error("Failed", reason.to_string()))
            .await;
        let policy = RetryPolicy::long(self.config.failed_status_retry);
        let mut backoff = policy.start();
        loop {
            match self.ctx.updater.update_status(|s| s.mark_failed(reason)).await {
                Ok(_) => break,
                Err(err) if err.is_not_found() => break,
                Err(err) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!("{}: persisting failed status: {}", self.ctx.key, err);
                        tokio::select! {
                            _ = self.stop.stopped() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        error!("{}: giving up persisting failed status: {}", self.ctx.key, err);
                        break;
                    }
                },
            }
        }
        self.enter_draining().await;
    }

    async fn enter_draining(&mut self) {
        if self.state.get() == LoopState::Running {
            self.state.set(LoopState::Draining);
        }
        if !self.shut_down {
            self.shut_down = true;
            self.reconciler.shutdown(&mut self.ctx).await;
        }
    }
}
