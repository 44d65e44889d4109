//! In-process stand-ins for provisioners and the claim API.

use super::provisioner::{Info, NodeInfo, ProvisionerApi, ProvisionerFleet};
use super::resources::Infrastructure;
use super::{needs_binding, ClaimStore, LocalStorage, ANNOTATION_NODE_NAME};
use crate::errors::*;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    LocalVolumeSource, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, PersistentVolumeSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct FakeProvisioner {
    node: String,
    available: u64,
    prepared: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl FakeProvisioner {
    pub fn new(node: &str, available: u64) -> Arc<Self> {
        Arc::new(FakeProvisioner {
            node: node.to_string(),
            available,
            prepared: Mutex::new(vec![]),
            removed: Mutex::new(vec![]),
        })
    }

    pub fn prepared(&self) -> Vec<String> {
        self.prepared.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProvisionerApi for FakeProvisioner {
    async fn node_info(&self) -> Result<NodeInfo> {
        Ok(NodeInfo {
            node_name: self.node.clone(),
        })
    }

    async fn info(&self, _local_path: &str) -> Result<Info> {
        Ok(Info {
            node_info: self.node_info().await?,
            available: self.available,
            capacity: self.available.max(1 << 30),
        })
    }

    async fn prepare(&self, local_path: &str) -> Result<()> {
        self.prepared.lock().unwrap().push(local_path.to_string());
        Ok(())
    }

    async fn remove(&self, local_path: &str) -> Result<()> {
        self.removed.lock().unwrap().push(local_path.to_string());
        Ok(())
    }
}

pub struct FakeFleet(pub Vec<Arc<FakeProvisioner>>);

#[async_trait]
impl ProvisionerFleet for FakeFleet {
    async fn members(&self) -> Result<Vec<Arc<dyn ProvisionerApi>>> {
        Ok(self
            .0
            .iter()
            .map(|p| p.clone() as Arc<dyn ProvisionerApi>)
            .collect())
    }
}

/// Claims keyed by `namespace/name`.
#[derive(Default)]
pub struct MemoryClaims(Mutex<BTreeMap<String, PersistentVolumeClaim>>);

impl MemoryClaims {
    pub fn add(&self, claim: PersistentVolumeClaim) -> PersistentVolumeClaim {
        let key = format!("{}/{}", claim.namespace().unwrap_or_default(), claim.name_any());
        self.0.lock().unwrap().insert(key, claim.clone());
        claim
    }

    pub fn bound(&self, ns: &str, name: &str) -> Option<String> {
        self.0
            .lock()
            .unwrap()
            .get(&format!("{}/{}", ns, name))
            .and_then(|c| c.spec.as_ref())
            .and_then(|s| s.volume_name.clone())
    }
}

#[async_trait]
impl ClaimStore for MemoryClaims {
    async fn list(&self) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self.0.lock().unwrap().values().cloned().collect())
    }

    async fn bind(&self, claim: &PersistentVolumeClaim, volume: &str) -> Result<()> {
        let key = format!("{}/{}", claim.namespace().unwrap_or_default(), claim.name_any());
        let mut claims = self.0.lock().unwrap();
        let stored = claims
            .get_mut(&key)
            .ok_or_else(|| Error::from(ErrorKind::NotFound(key.clone())))?;
        if needs_binding(stored, volume)? {
            stored.spec.get_or_insert_with(Default::default).volume_name = Some(volume.to_string());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeInfrastructure {
    ensured: AtomicUsize,
    failing: AtomicBool,
}

impl FakeInfrastructure {
    pub fn ensured(&self) -> usize {
        self.ensured.load(Ordering::SeqCst)
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Infrastructure for FakeInfrastructure {
    async fn ensure(&self, _storage: &LocalStorage) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!(ErrorKind::Internal("storage class quota exceeded".to_string()));
        }
        self.ensured.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A claim of the `fast-local` class, optionally requesting `size`.
pub fn claim(name: &str, ns: &str, size: Option<&str>) -> PersistentVolumeClaim {
    let requests = size.map(|s| {
        let mut r = BTreeMap::new();
        r.insert("storage".to_string(), Quantity(s.to_string()));
        r
    });
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            uid: Some(format!("{}-{}-uid", ns, name)),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: Some("fast-local".to_string()),
            resources: Some(VolumeResourceRequirements {
                requests,
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        status: None,
    }
}

pub fn pending(mut claim: PersistentVolumeClaim) -> PersistentVolumeClaim {
    claim.status = Some(PersistentVolumeClaimStatus {
        phase: Some("Pending".to_string()),
        ..PersistentVolumeClaimStatus::default()
    });
    claim
}

/// A `fast-local` volume at `/mnt/disks/<name>` on `node`, owned by `owner_uid`.
pub fn volume(name: &str, node: &str, owner_uid: &str) -> PersistentVolume {
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_NODE_NAME.to_string(), node.to_string());
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: Some(annotations),
            owner_references: Some(vec![OwnerReference {
                api_version: "storage.dbkeeper.io/v1".to_string(),
                kind: "LocalStorage".to_string(),
                name: "ls".to_string(),
                uid: owner_uid.to_string(),
                ..OwnerReference::default()
            }]),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeSpec {
            local: Some(LocalVolumeSource {
                path: format!("/mnt/disks/{}", name),
                fs_type: None,
            }),
            storage_class_name: Some("fast-local".to_string()),
            ..PersistentVolumeSpec::default()
        }),
        status: None,
    }
}
