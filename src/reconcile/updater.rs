use super::{key_of, ManagedResource};
use crate::errors::*;
use crate::metrics::{Metric, MetricsRegistry};
use crate::store::VersionedStore;
use kube::ResourceExt;
use log::debug;
use std::sync::Arc;

pub const MAX_UPDATE_ATTEMPTS: usize = 10;

/// Holds the last known representation of one resource and writes changes to
/// it with optimistic concurrency.
///
/// Every write is expressed as a mutation of the cached object. When the store
/// reports a conflict the object is reloaded and the mutation applied again, up
/// to [`MAX_UPDATE_ATTEMPTS`] times.
pub struct OptimisticUpdater<K> {
    store: Arc<dyn VersionedStore<K>>,
    object: K,
    metrics: Arc<MetricsRegistry>,
    max_attempts: usize,
}

enum Target {
    Object,
    Status,
}

impl<K: ManagedResource> OptimisticUpdater<K> {
    pub fn new(store: Arc<dyn VersionedStore<K>>, object: K, metrics: Arc<MetricsRegistry>) -> Self {
        OptimisticUpdater {
            store,
            object,
            metrics,
            max_attempts: MAX_UPDATE_ATTEMPTS,
        }
    }

    pub fn object(&self) -> &K {
        &self.object
    }

    pub fn store(&self) -> &Arc<dyn VersionedStore<K>> {
        &self.store
    }

    pub fn replace(&mut self, object: K) {
        self.object = object;
    }

    /// Fetch the authoritative representation and cache it.
    pub async fn reload(&mut self) -> Result<&K> {
        let fresh = self.store.get(&self.object.name_any()).await?;
        self.object = fresh;
        Ok(&self.object)
    }

    /// Returns true when a write happened.
    pub async fn update_status<F>(&mut self, mut mutate: F) -> Result<bool>
    where
        F: FnMut(&mut K::Status) + Send,
    {
        self.write(Target::Status, |current: &K| {
            let before = current.status().cloned().unwrap_or_default();
            let mut status = before.clone();
            mutate(&mut status);
            if status == before {
                return None;
            }
            let mut next = current.clone();
            *next.status_mut() = status;
            Some(next)
        })
        .await
    }

    pub async fn update_spec<F>(&mut self, mut mutate: F) -> Result<bool>
    where
        F: FnMut(&mut K::Spec) + Send,
    {
        self.write(Target::Object, |current: &K| {
            let mut spec = current.spec().clone();
            mutate(&mut spec);
            if &spec == current.spec() {
                return None;
            }
            let mut next = current.clone();
            *next.spec_mut() = spec;
            Some(next)
        })
        .await
    }

    /// Mutate any part of the object. The closure returns false to skip the write.
    pub async fn update_object<F>(&mut self, mut mutate: F) -> Result<bool>
    where
        F: FnMut(&mut K) -> bool + Send,
    {
        self.write(Target::Object, |current: &K| {
            let mut next = current.clone();
            if mutate(&mut next) {
                Some(next)
            } else {
                None
            }
        })
        .await
    }

    async fn write<F>(&mut self, target: Target, mut build: F) -> Result<bool>
    where
        F: FnMut(&K) -> Option<K> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let next = match build(&self.object) {
                Some(next) => next,
                None => return Ok(false),
            };
            let res = match target {
                Target::Status => self.store.update_status(&next).await,
                Target::Object => self.store.update(&next).await,
            };
            match res {
                Ok(written) => {
                    if let Target::Status = target {
                        self.metrics.record(Metric::StatusWrite);
                    }
                    self.object = written;
                    return Ok(true);
                }
                Err(err) if err.is_conflict() => {
                    self.metrics.record(Metric::UpdateConflict);
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    debug!(
                        "{}: conflict on attempt {}, reloading",
                        key_of(&self.object),
                        attempt
                    );
                    self.reload().await?;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
