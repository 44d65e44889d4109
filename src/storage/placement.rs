//! Choosing a node and directory for a pending claim.

use super::provisioner::{ProvisionerApi, ProvisionerFleet};
use super::{
    ClaimStore, LocalStorage, ANNOTATION_ENFORCE_ANTI_AFFINITY, ANNOTATION_NODE_NAME,
    ANNOTATION_PROVISIONED_BY, LABEL_DEPLOYMENT, LABEL_ROLE, PROVISIONER_NAME,
};
use crate::errors::*;
use crate::metrics::{Metric, MetricsRegistry};
use crate::store::VersionedStore;
use k8s_openapi::api::core::v1::{
    LocalVolumeSource, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, ObjectReference,
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec, VolumeNodeAffinity,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Size used for claims that do not request any storage.
pub const DEFAULT_VOLUME_SIZE: u64 = 8 * 1024 * 1024 * 1024;
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
const VOLUME_NAME_LEN: usize = 16;

pub struct VolumePlacementScheduler {
    fleet: Arc<dyn ProvisionerFleet>,
    volumes: Arc<dyn VersionedStore<PersistentVolume>>,
    claims: Arc<dyn ClaimStore>,
    metrics: Arc<MetricsRegistry>,
}

struct Candidate {
    node: String,
    client: Arc<dyn ProvisionerApi>,
}

impl VolumePlacementScheduler {
    pub fn new(
        fleet: Arc<dyn ProvisionerFleet>,
        volumes: Arc<dyn VersionedStore<PersistentVolume>>,
        claims: Arc<dyn ClaimStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        VolumePlacementScheduler {
            fleet,
            volumes,
            claims,
            metrics,
        }
    }

    /// Create a volume for `claim` and bind the claim to it. `index` is the
    /// position of the claim in the current batch and spreads concurrent
    /// claims over different nodes.
    pub async fn place(
        &self,
        storage: &LocalStorage,
        claim: &PersistentVolumeClaim,
        index: usize,
    ) -> Result<PersistentVolume> {
        let claim_key = format!(
            "{}/{}",
            claim.namespace().unwrap_or_default(),
            claim.name_any()
        );
        let size = claim_size(claim)?;
        let candidates = self.candidates(claim, index).await?;

        for candidate in &candidates {
            for root in &storage.spec.local_path {
                match self.try_node(storage, claim, candidate, root, size).await {
                    Ok(Some(pv)) => {
                        info!(
                            "{}: created volume {} on node {}",
                            claim_key,
                            pv.name_any(),
                            candidate.node
                        );
                        self.metrics.record(Metric::VolumeCreated);
                        return Ok(pv);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(
                        "{}: placing on {}:{} failed: {}",
                        claim_key, candidate.node, root, err
                    ),
                }
            }
        }
        self.metrics.record(Metric::PlacementFailure);
        bail!(ErrorKind::NoEligibleNode(size))
    }

    /// Reachable provisioners in shuffled order, rotated by `index`, with
    /// anti-affinity applied.
    async fn candidates(&self, claim: &PersistentVolumeClaim, index: usize) -> Result<Vec<Candidate>> {
        let mut all = vec![];
        for client in self.fleet.members().await? {
            match client.node_info().await {
                Ok(info) => all.push(Candidate {
                    node: info.node_name,
                    client,
                }),
                Err(err) => debug!("skipping unreachable provisioner: {}", err),
            }
        }
        all.shuffle(&mut rand::thread_rng());
        if !all.is_empty() {
            let shift = index % all.len();
            all.rotate_left(shift);
        }

        let (deployment, role) = match (claim.labels().get(LABEL_DEPLOYMENT), claim.labels().get(LABEL_ROLE)) {
            (Some(d), Some(r)) => (d.clone(), r.clone()),
            _ => return Ok(all),
        };
        let taken: BTreeSet<String> = self
            .volumes
            .list()
            .await?
            .iter()
            .filter(|pv| {
                pv.labels().get(LABEL_DEPLOYMENT) == Some(&deployment)
                    && pv.labels().get(LABEL_ROLE) == Some(&role)
            })
            .filter_map(|pv| pv.annotations().get(ANNOTATION_NODE_NAME).cloned())
            .collect();
        let (free, busy): (Vec<Candidate>, Vec<Candidate>) =
            all.into_iter().partition(|c| !taken.contains(&c.node));
        if free.is_empty() && !enforces_anti_affinity(claim) {
            debug!(
                "no node without a {}/{} volume left, ignoring anti-affinity",
                deployment, role
            );
            return Ok(busy);
        }
        Ok(free)
    }

    /// `Ok(None)` when the root has too little space.
    async fn try_node(
        &self,
        storage: &LocalStorage,
        claim: &PersistentVolumeClaim,
        candidate: &Candidate,
        root: &str,
        size: u64,
    ) -> Result<Option<PersistentVolume>> {
        let info = candidate.client.info(root).await?;
        if info.available < size {
            debug!(
                "node {} has {} bytes available in {}, need {}",
                candidate.node, info.available, root, size
            );
            return Ok(None);
        }
        let name = random_name();
        let path = format!("{}/{}", root.trim_end_matches('/'), name);
        candidate.client.prepare(&path).await?;

        let volume = build_volume(storage, claim, &candidate.node, &path, &name, size);
        let created = match self.volumes.create(&volume).await {
            Ok(pv) => pv,
            Err(err) => {
                self.cleanup_dir(candidate, &path).await;
                return Err(err);
            }
        };
        if let Err(err) = self.claims.bind(claim, &created.name_any()).await {
            warn!("binding claim to {} failed, removing volume", created.name_any());
            if let Err(err) = self.volumes.delete(&created.name_any()).await {
                if !err.is_not_found() {
                    warn!("removing volume {}: {}", created.name_any(), err);
                }
            }
            self.cleanup_dir(candidate, &path).await;
            return Err(err);
        }
        Ok(Some(created))
    }

    async fn cleanup_dir(&self, candidate: &Candidate, path: &str) {
        if let Err(err) = candidate.client.remove(path).await {
            warn!("removing {} on {}: {}", path, candidate.node, err);
        }
    }
}

fn enforces_anti_affinity(claim: &PersistentVolumeClaim) -> bool {
    claim
        .annotations()
        .get(ANNOTATION_ENFORCE_ANTI_AFFINITY)
        .map_or(false, |v| v.eq_ignore_ascii_case("true"))
}

/// Requested storage of a claim, or the default size when none is requested.
pub fn claim_size(claim: &PersistentVolumeClaim) -> Result<u64> {
    let requested = claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"));
    match requested {
        None => Ok(DEFAULT_VOLUME_SIZE),
        Some(q) => match parse_quantity(&q.0)? {
            0 => Ok(DEFAULT_VOLUME_SIZE),
            n => Ok(n),
        },
    }
}

/// Parse a Kubernetes quantity such as `512Mi`, `10G` or `1.5Gi` into bytes,
/// rounding fractional bytes up.
pub fn parse_quantity(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let multiplier: u128 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => bail!(invalid(format!("unsupported quantity suffix in '{}'", raw))),
    };
    let (whole, fraction) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') || fraction.len() > 18
    {
        bail!(invalid(format!("malformed quantity '{}'", raw)));
    }
    let parse = |digits: &str| -> Result<u128> {
        if digits.is_empty() {
            return Ok(0);
        }
        digits
            .parse::<u128>()
            .map_err(|_| invalid(format!("malformed quantity '{}'", raw)))
    };
    let too_large = || invalid(format!("quantity '{}' is too large", raw));
    let scale = 10u128.pow(fraction.len() as u32);
    let whole_bytes = parse(whole)?.checked_mul(multiplier).ok_or_else(too_large)?;
    let fraction_bytes = parse(fraction)?
        .checked_mul(multiplier)
        .and_then(|f| f.checked_add(scale - 1))
        .map(|f| f / scale)
        .ok_or_else(too_large)?;
    let bytes = whole_bytes.checked_add(fraction_bytes).ok_or_else(too_large)?;
    u64::try_from(bytes).map_err(|_| too_large())
}

pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    (0..VOLUME_NAME_LEN)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect()
}

/// Stable 8 hex digit FNV-1a digest, used to keep volume names short.
pub fn short_hash(value: &str) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for b in value.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("{:08x}", hash)
}

pub fn build_volume(
    storage: &LocalStorage,
    claim: &PersistentVolumeClaim,
    node: &str,
    path: &str,
    dir_name: &str,
    size: u64,
) -> PersistentVolume {
    let name = format!("{}-{}-{}", storage.name_any(), short_hash(node), dir_name).to_lowercase();

    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_PROVISIONED_BY.to_string(), PROVISIONER_NAME.to_string());
    annotations.insert(ANNOTATION_NODE_NAME.to_string(), node.to_string());
    let labels: BTreeMap<String, String> = [LABEL_DEPLOYMENT, LABEL_ROLE]
        .iter()
        .filter_map(|l| claim.labels().get(*l).map(|v| (l.to_string(), v.clone())))
        .collect();

    let mut capacity = BTreeMap::new();
    capacity.insert("storage".to_string(), Quantity(size.to_string()));

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name),
            annotations: Some(annotations),
            labels: Some(labels),
            owner_references: storage.controller_owner_ref(&()).map(|o| vec![o]),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            capacity: Some(capacity),
            claim_ref: Some(ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("PersistentVolumeClaim".to_string()),
                name: claim.metadata.name.clone(),
                namespace: claim.metadata.namespace.clone(),
                uid: claim.metadata.uid.clone(),
                ..ObjectReference::default()
            }),
            local: Some(LocalVolumeSource {
                path: path.to_string(),
                fs_type: None,
            }),
            node_affinity: Some(VolumeNodeAffinity {
                required: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: HOSTNAME_LABEL.to_string(),
                            operator: "In".to_string(),
                            values: Some(vec![node.to_string()]),
                        }]),
                        match_fields: None,
                    }],
                }),
            }),
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            storage_class_name: Some(storage.spec.storage_class.name.clone()),
            volume_mode: Some("Filesystem".to_string()),
            ..PersistentVolumeSpec::default()
        }),
        status: None,
    }
}
