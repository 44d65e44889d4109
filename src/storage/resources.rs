//! Kubernetes objects every `LocalStorage` needs: its StorageClass and the
//! provisioner DaemonSet with the Service in front of it.

use super::{provisioner_name, LocalStorage, PROVISIONER_NAME};
use crate::config::OperatorConfig;
use crate::errors::*;
use crate::store::{KubeStore, VersionedStore};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HostPathVolumeSource, ObjectFieldSelector,
    PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta};
use kube::{Client, Resource, ResourceExt};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;

pub const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";
pub const LABEL_APP: &str = "app";
pub const LABEL_LOCAL_STORAGE: &str = "storage.dbkeeper.io/local-storage";
const APP_NAME: &str = "dbkeeper-provisioner";

#[async_trait]
pub trait Infrastructure: Send + Sync {
    /// Create whatever is missing. Existing objects are left alone.
    async fn ensure(&self, storage: &LocalStorage) -> Result<()>;
}

pub struct KubeInfrastructure {
    client: Client,
    config: OperatorConfig,
}

impl KubeInfrastructure {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        KubeInfrastructure { client, config }
    }
}

async fn ensure_created<K>(api: Api<K>, object: K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let name = object.name_any();
    match KubeStore::new(api).create(&object).await {
        Ok(_) => {
            info!("created {} {}", K::kind(&K::DynamicType::default()), name);
            Ok(())
        }
        Err(err) if err.is_already_exists() => {
            debug!("{} {} already exists", K::kind(&K::DynamicType::default()), name);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[async_trait]
impl Infrastructure for KubeInfrastructure {
    async fn ensure(&self, storage: &LocalStorage) -> Result<()> {
        let ns = &self.config.namespace;
        ensure_created(Api::all(self.client.clone()), storage_class(storage))
            .await
            .chain_err(|| "creating storage class")?;
        ensure_created(
            Api::namespaced(self.client.clone(), ns),
            daemon_set(storage, &self.config),
        )
        .await
        .chain_err(|| "creating provisioner daemon set")?;
        ensure_created(
            Api::namespaced(self.client.clone(), ns),
            service(storage, &self.config),
        )
        .await
        .chain_err(|| "creating provisioner service")?;
        Ok(())
    }
}

fn owned_meta(storage: &LocalStorage, name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(selector_labels(storage)),
        owner_references: storage.controller_owner_ref(&()).map(|o| vec![o]),
        ..ObjectMeta::default()
    }
}

pub fn selector_labels(storage: &LocalStorage) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP.to_string(), APP_NAME.to_string());
    labels.insert(LABEL_LOCAL_STORAGE.to_string(), storage.name_any());
    labels
}

pub fn storage_class(storage: &LocalStorage) -> StorageClass {
    let class = &storage.spec.storage_class;
    let mut meta = owned_meta(storage, &class.name, None);
    if class.is_default {
        let mut annotations = BTreeMap::new();
        annotations.insert(DEFAULT_CLASS_ANNOTATION.to_string(), "true".to_string());
        meta.annotations = Some(annotations);
    }
    StorageClass {
        metadata: meta,
        provisioner: PROVISIONER_NAME.to_string(),
        reclaim_policy: Some("Retain".to_string()),
        // volumes are created once the pod, and with it the node, is known
        volume_binding_mode: Some("WaitForFirstConsumer".to_string()),
        ..StorageClass::default()
    }
}

fn volume_name(index: usize) -> String {
    format!("local-path-{}", index)
}

pub fn daemon_set(storage: &LocalStorage, config: &OperatorConfig) -> DaemonSet {
    let name = provisioner_name(&storage.name_any());
    let labels = selector_labels(storage);
    let roots = &storage.spec.local_path;

    let mut args = vec![
        "provisioner".to_string(),
        "--port".to_string(),
        config.provisioner_port.to_string(),
    ];
    for root in roots {
        args.push("--local-path".to_string());
        args.push(root.clone());
    }
    let container = Container {
        name: "provisioner".to_string(),
        image: Some(config.provisioner_image.clone()),
        args: Some(args),
        env: Some(vec![EnvVar {
            name: "NODE_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "spec.nodeName".to_string(),
                    ..ObjectFieldSelector::default()
                }),
                ..EnvVarSource::default()
            }),
            ..EnvVar::default()
        }]),
        ports: Some(vec![ContainerPort {
            name: Some("provisioner".to_string()),
            container_port: config.provisioner_port as i32,
            ..ContainerPort::default()
        }]),
        volume_mounts: Some(
            roots
                .iter()
                .enumerate()
                .map(|(i, root)| VolumeMount {
                    name: volume_name(i),
                    mount_path: root.clone(),
                    ..VolumeMount::default()
                })
                .collect(),
        ),
        ..Container::default()
    };
    let volumes = roots
        .iter()
        .enumerate()
        .map(|(i, root)| Volume {
            name: volume_name(i),
            host_path: Some(HostPathVolumeSource {
                path: root.clone(),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Volume::default()
        })
        .collect();

    DaemonSet {
        metadata: owned_meta(storage, &name, Some(&config.namespace)),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    node_selector: storage.spec.node_selector.clone(),
                    service_account_name: Some(config.service_account.clone()),
                    ..PodSpec::default()
                }),
            },
            ..DaemonSetSpec::default()
        }),
        status: None,
    }
}

pub fn service(storage: &LocalStorage, config: &OperatorConfig) -> Service {
    let name = provisioner_name(&storage.name_any());
    Service {
        metadata: owned_meta(storage, &name, Some(&config.namespace)),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(storage)),
            cluster_ip: Some("None".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("provisioner".to_string()),
                port: config.provisioner_port as i32,
                target_port: Some(IntOrString::Int(config.provisioner_port as i32)),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        status: None,
    }
}
