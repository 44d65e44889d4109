//! Versioned object storage.
//!
//! Every write carries the resource version it was based on. The store rejects
//! writes based on a stale version with [`ErrorKind::Conflict`], which is the
//! only signal callers use to reload and retry.

use crate::errors::*;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, ListParams, PostParams, Preconditions};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Upper bound for a single call to the API server.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
pub trait VersionedStore<K>: Send + Sync {
    async fn get(&self, name: &str) -> Result<K>;
    async fn list(&self) -> Result<Vec<K>>;
    async fn create(&self, object: &K) -> Result<K>;
    /// Replace the object. Fails with a conflict when its resource version is stale.
    async fn update(&self, object: &K) -> Result<K>;
    /// Replace only the status part of the object.
    async fn update_status(&self, object: &K) -> Result<K>;
    async fn delete(&self, name: &str) -> Result<()>;
    /// Delete only while the stored object still carries `uid`. A different
    /// uid fails with a conflict.
    async fn delete_uid(&self, name: &str, uid: &str) -> Result<()>;
}

/// A [`VersionedStore`] backed by the Kubernetes API server.
pub struct KubeStore<K> {
    api: Api<K>,
    timeout: Duration,
}

impl<K> KubeStore<K> {
    pub fn new(api: Api<K>) -> Self {
        KubeStore {
            api,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call<T, F>(&self, op: &str, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = kube::Result<T>>,
    {
        bounded(self.timeout, op, name, fut).await
    }
}

/// Run an API call with a deadline. Timeouts, 404 and 409 map to their
/// error kinds; `op` is `create` when a 409 means the object exists.
pub async fn bounded<T, F>(timeout: Duration, op: &str, name: &str, fut: F) -> Result<T>
where
    F: Future<Output = kube::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Err(_) => Err(ErrorKind::Timeout(format!("{} of '{}'", op, name)).into()),
        Ok(Err(err)) => Err(map_kube_error(err, op, name)),
        Ok(Ok(value)) => Ok(value),
    }
}

fn map_kube_error(err: kube::Error, op: &str, name: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => ErrorKind::NotFound(name.to_string()).into(),
        kube::Error::Api(resp) if resp.code == 409 && op == "create" => {
            ErrorKind::AlreadyExists(name.to_string()).into()
        }
        kube::Error::Api(resp) if resp.code == 409 => ErrorKind::Conflict(name.to_string()).into(),
        _ => err.into(),
    }
}

#[async_trait]
impl<K> VersionedStore<K> for KubeStore<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    async fn get(&self, name: &str) -> Result<K> {
        self.call("get", name, self.api.get(name)).await
    }

    async fn list(&self) -> Result<Vec<K>> {
        let lp = ListParams::default();
        let list = self.call("list", "*", self.api.list(&lp)).await?;
        Ok(list.items)
    }

    async fn create(&self, object: &K) -> Result<K> {
        let name = object.name_any();
        let pp = PostParams::default();
        self.call("create", &name, self.api.create(&pp, object)).await
    }

    async fn update(&self, object: &K) -> Result<K> {
        let name = object.name_any();
        let pp = PostParams::default();
        self.call("update", &name, self.api.replace(&name, &pp, object))
            .await
    }

    async fn update_status(&self, object: &K) -> Result<K> {
        let name = object.name_any();
        let pp = PostParams::default();
        let data = serde_json::to_vec(object)?;
        self.call(
            "status update",
            &name,
            self.api.replace_status(&name, &pp, data),
        )
        .await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let dp = DeleteParams::default();
        self.call("delete", name, self.api.delete(name, &dp))
            .await
            .map(|_| ())
    }

    async fn delete_uid(&self, name: &str, uid: &str) -> Result<()> {
        let dp = DeleteParams {
            preconditions: Some(Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..DeleteParams::default()
        };
        self.call("delete", name, self.api.delete(name, &dp))
            .await
            .map(|_| ())
    }
}

/// An in-process [`VersionedStore`] with the same versioning and finalizer
/// semantics as the API server: deleting an object that still carries
/// finalizers only sets its deletion timestamp, and the object disappears once
/// an update leaves it without finalizers.
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<String, K>>,
    version: AtomicUsize,
    pending_conflicts: AtomicUsize,
    writes: AtomicUsize,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        MemoryStore {
            objects: Mutex::new(BTreeMap::new()),
            version: AtomicUsize::new(0),
            pending_conflicts: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` updates with a conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    /// Number of successful create/update/delete calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Peek at an object without going through the versioned API.
    pub fn snapshot(&self, name: &str) -> Option<K> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, K>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn replace(&self, object: &K) -> Result<K> {
        let name = object.meta().name.clone().unwrap_or_default();
        if self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!(ErrorKind::Conflict(name));
        }
        let mut objects = self.lock();
        let current = objects
            .get(&name)
            .ok_or_else(|| Error::from(ErrorKind::NotFound(name.clone())))?;
        if current.meta().resource_version != object.meta().resource_version {
            bail!(ErrorKind::Conflict(name));
        }
        let mut stored = object.clone();
        stored.meta_mut().uid = current.meta().uid.clone();
        stored.meta_mut().creation_timestamp = current.meta().creation_timestamp.clone();
        stored.meta_mut().deletion_timestamp = current.meta().deletion_timestamp.clone();
        stored.meta_mut().resource_version = Some(self.next_version());
        self.writes.fetch_add(1, Ordering::SeqCst);
        let erased = stored.meta().deletion_timestamp.is_some()
            && stored.meta().finalizers.as_ref().map_or(true, |f| f.is_empty());
        if erased {
            objects.remove(&name);
        } else {
            objects.insert(name, stored.clone());
        }
        Ok(stored)
    }
}

#[async_trait]
impl<K> VersionedStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K> {
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ErrorKind::NotFound(name.to_string()).into())
    }

    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn create(&self, object: &K) -> Result<K> {
        let name = object.meta().name.clone().unwrap_or_default();
        let mut objects = self.lock();
        if objects.contains_key(&name) {
            bail!(ErrorKind::AlreadyExists(name));
        }
        let mut stored = object.clone();
        let version = self.next_version();
        let meta = stored.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", version));
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(Utc::now()));
        }
        meta.deletion_timestamp = None;
        meta.resource_version = Some(version);
        self.writes.fetch_add(1, Ordering::SeqCst);
        objects.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update(&self, object: &K) -> Result<K> {
        self.replace(object)
    }

    async fn update_status(&self, object: &K) -> Result<K> {
        self.replace(object)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.remove(name, None)
    }

    async fn delete_uid(&self, name: &str, uid: &str) -> Result<()> {
        self.remove(name, Some(uid))
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Send + Sync,
{
    fn remove(&self, name: &str, uid: Option<&str>) -> Result<()> {
        let mut objects = self.lock();
        let has_finalizers = match objects.get(name) {
            None => bail!(ErrorKind::NotFound(name.to_string())),
            Some(obj) if uid.is_some() && obj.meta().uid.as_deref() != uid => {
                bail!(ErrorKind::Conflict(name.to_string()))
            }
            Some(obj) => obj.meta().finalizers.as_ref().map_or(false, |f| !f.is_empty()),
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        if !has_finalizers {
            objects.remove(name);
            return Ok(());
        }
        let version = self.next_version();
        if let Some(obj) = objects.get_mut(name) {
            let meta = obj.meta_mut();
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = Some(Time(Utc::now()));
            }
            meta.resource_version = Some(version);
        }
        Ok(())
    }
}
