use super::{is_deleting, key_of, ManagedResource, OptimisticUpdater};
use crate::errors::*;
use async_trait::async_trait;
use kube::ResourceExt;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Decides whether a finalizer marker can be removed from a resource that is
/// being deleted. A check may kick off teardown work and answer false until
/// that work has finished.
#[async_trait]
pub trait FinalizerCheck<K>: Send + Sync {
    async fn removable(&self, object: &K) -> Result<bool>;
}

/// Outcome of one deletion pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FinalizerPass {
    pub removed: Vec<String>,
    pub remaining: Vec<String>,
    pub errors: usize,
}

impl FinalizerPass {
    pub fn is_done(&self) -> bool {
        self.remaining.is_empty() && self.errors == 0
    }
}

/// The finalizer markers a reconciler owns, each with the check that guards
/// its removal. Markers not in the registry belong to someone else and are
/// never touched.
pub struct FinalizerRegistry<K> {
    checks: BTreeMap<String, Arc<dyn FinalizerCheck<K>>>,
}

impl<K> Default for FinalizerRegistry<K> {
    fn default() -> Self {
        FinalizerRegistry {
            checks: BTreeMap::new(),
        }
    }
}

impl<K: ManagedResource> FinalizerRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C>(mut self, marker: &str, check: C) -> Self
    where
        C: FinalizerCheck<K> + 'static,
    {
        self.checks.insert(marker.to_string(), Arc::new(check));
        self
    }

    pub fn markers(&self) -> impl Iterator<Item = &str> {
        self.checks.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Make sure every registered marker is present on the object.
    pub async fn add_all(&self, updater: &mut OptimisticUpdater<K>) -> Result<bool> {
        let markers: Vec<String> = self.checks.keys().cloned().collect();
        add_finalizers(updater, &markers).await
    }

    /// Unknown markers are never removable.
    pub async fn evaluate(&self, marker: &str, object: &K) -> Result<bool> {
        match self.checks.get(marker) {
            Some(check) => check.removable(object).await,
            None => Ok(false),
        }
    }

    /// Evaluate every registered marker on the object and drop all removable
    /// ones in a single write.
    pub async fn run(&self, updater: &mut OptimisticUpdater<K>) -> Result<FinalizerPass> {
        let object = updater.object().clone();
        let key = key_of(&object);
        let mut pass = FinalizerPass::default();
        for marker in object.finalizers() {
            if !self.checks.contains_key(marker) {
                continue;
            }
            match self.evaluate(marker, &object).await {
                Ok(true) => pass.removed.push(marker.clone()),
                Ok(false) => {
                    debug!("{}: finalizer {} not removable yet", key, marker);
                    pass.remaining.push(marker.clone())
                }
                Err(err) => {
                    warn!("{}: evaluating finalizer {} failed: {}", key, marker, err);
                    pass.errors += 1;
                    pass.remaining.push(marker.clone());
                }
            }
        }
        if !pass.removed.is_empty() {
            remove_finalizers(updater, &pass.removed).await?;
            info!("{}: removed finalizers {:?}", key, pass.removed);
        }
        Ok(pass)
    }
}

/// No-op for markers already present and for objects that are being deleted.
pub async fn add_finalizers<K: ManagedResource>(
    updater: &mut OptimisticUpdater<K>,
    markers: &[String],
) -> Result<bool> {
    updater
        .update_object(|obj| {
            if is_deleting(obj) {
                return false;
            }
            let finalizers = obj.meta_mut().finalizers.get_or_insert_with(Vec::new);
            let mut changed = false;
            for marker in markers {
                if !finalizers.contains(marker) {
                    finalizers.push(marker.clone());
                    changed = true;
                }
            }
            changed
        })
        .await
}

/// Drop the given markers in one write. A resource that no longer exists
/// has nothing left to finalize.
pub async fn remove_finalizers<K: ManagedResource>(
    updater: &mut OptimisticUpdater<K>,
    markers: &[String],
) -> Result<()> {
    let res = updater
        .update_object(|obj| {
            let finalizers = match obj.meta_mut().finalizers.as_mut() {
                Some(f) => f,
                None => return false,
            };
            let before = finalizers.len();
            finalizers.retain(|f| !markers.contains(f));
            finalizers.len() != before
        })
        .await;
    match res {
        Err(err) if err.is_not_found() => Ok(()),
        other => other.map(|_| ()),
    }
}
