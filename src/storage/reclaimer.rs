//! Removes released volumes together with their directories.

use super::provisioner::ProvisionerFleet;
use super::ANNOTATION_NODE_NAME;
use crate::errors::*;
use crate::metrics::{Metric, MetricsRegistry};
use crate::reconcile::{StopSignal, Trigger};
use crate::store::VersionedStore;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Delay before retrying when a volume could not be reclaimed and others wait.
pub const RETRY_DELAY: Duration = Duration::from_millis(5);
/// Delay when there is nothing to do or the only queued volume keeps failing.
pub const IDLE_DELAY: Duration = Duration::from_secs(3600);

pub struct VolumeReclaimer {
    queue: Mutex<VecDeque<PersistentVolume>>,
    trigger: Trigger,
    fleet: Arc<dyn ProvisionerFleet>,
    volumes: Arc<dyn VersionedStore<PersistentVolume>>,
    metrics: Arc<MetricsRegistry>,
}

impl VolumeReclaimer {
    pub fn new(
        fleet: Arc<dyn ProvisionerFleet>,
        volumes: Arc<dyn VersionedStore<PersistentVolume>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        VolumeReclaimer {
            queue: Mutex::new(VecDeque::new()),
            trigger: Trigger::new(),
            fleet,
            volumes,
            metrics,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PersistentVolume>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a volume unless one with the same uid is already queued.
    pub fn add(&self, volume: PersistentVolume) -> bool {
        {
            let mut queue = self.lock();
            if queue.iter().any(|v| v.uid() == volume.uid()) {
                return false;
            }
            debug!("queueing volume {} for reclaim", volume.name_any());
            queue.push_back(volume);
        }
        self.trigger.trigger();
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Work through the queue until it is empty or the head fails. Returns
    /// the delay before the next pass.
    pub async fn pass(&self) -> Duration {
        loop {
            let head = match self.lock().front().cloned() {
                Some(v) => v,
                None => return IDLE_DELAY,
            };
            match self.reclaim(&head).await {
                Ok(()) => {
                    let mut queue = self.lock();
                    if queue.front().map(|v| v.uid()) == Some(head.uid()) {
                        queue.pop_front();
                    }
                }
                Err(err) => {
                    warn!("reclaiming volume {} failed: {}", head.name_any(), err);
                    return if self.len() > 1 { RETRY_DELAY } else { IDLE_DELAY };
                }
            }
        }
    }

    /// Re-read the volume and wipe it only if it is still the same, unused
    /// volume. Anything else drops it from the queue untouched.
    async fn reclaim(&self, queued: &PersistentVolume) -> Result<()> {
        let name = queued.name_any();
        let uid = queued.uid().unwrap_or_default();
        let volume = match self.volumes.get(&name).await {
            Ok(v) => v,
            Err(err) if err.is_not_found() => {
                debug!("volume {} is already gone", name);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if volume.uid().unwrap_or_default() != uid {
            debug!("volume {} was replaced, not reclaiming", name);
            return Ok(());
        }
        let phase = volume.status.as_ref().and_then(|s| s.phase.as_deref());
        if !matches!(phase, Some("Released") | Some("Available")) {
            info!("volume {} is {:?} now, not reclaiming", name, phase);
            return Ok(());
        }

        let path = volume
            .spec
            .as_ref()
            .and_then(|s| s.local.as_ref())
            .map(|l| l.path.clone())
            .ok_or_else(|| invalid(format!("volume {} has no local source", name)))?;
        let node = volume
            .annotations()
            .get(ANNOTATION_NODE_NAME)
            .cloned()
            .ok_or_else(|| invalid(format!("volume {} has no node name annotation", name)))?;

        let client = self.fleet.for_node(&node).await?;
        client.remove(&path).await?;
        match self.volumes.delete_uid(&name, &uid).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        info!("reclaimed volume {} ({} on {})", name, path, node);
        self.metrics.record(Metric::VolumeReclaimed);
        Ok(())
    }

    /// Process the queue whenever something is added, until `stop` fires.
    pub async fn run(self: Arc<Self>, stop: Arc<StopSignal>) {
        let mut delay = IDLE_DELAY;
        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                _ = self.trigger.triggered() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.pass().await;
        }
        debug!("volume reclaimer stopped");
    }
}
