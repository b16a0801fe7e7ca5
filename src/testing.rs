/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/testing.rs
*
* In-memory doubles for the cloud and cluster collaborators, plus builders for
* the Kubernetes objects the tests need. Only compiled for tests.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::cloud::{BlockStorage, CloudError, CreateVolumeRequest, Tag, VolumeDescription};
use crate::cluster::manifest::{ebs_volume_handle, short_volume_id, RebindManifests};
use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::model::{OwnerKind, OwnerRef, SnapshotRecord, SnapshotState};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{
    AWSElasticBlockStoreVolumeSource, CSIPersistentVolumeSource, ObjectReference,
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, Pod, PodSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

// --- Object builders ---

pub fn ebs_pv(name: &str, handle: &str, claim: Option<(&str, &str)>) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            aws_elastic_block_store: Some(AWSElasticBlockStoreVolumeSource {
                volume_id: handle.to_string(),
                fs_type: Some("ext4".to_string()),
                ..Default::default()
            }),
            claim_ref: claim.map(|(namespace, claim_name)| ObjectReference {
                kind: Some("PersistentVolumeClaim".to_string()),
                namespace: Some(namespace.to_string()),
                name: Some(claim_name.to_string()),
                ..Default::default()
            }),
            persistent_volume_reclaim_policy: Some("Delete".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn csi_pv(name: &str, handle: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            csi: Some(CSIPersistentVolumeSource {
                driver: "ebs.csi.aws.com".to_string(),
                volume_handle: handle.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn claim(namespace: &str, name: &str, pv_name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: Some(pv_name.to_string()),
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            ..Default::default()
        }),
        status: None,
    }
}

fn owner_reference(kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("{}-uid", name),
        controller: Some(true),
        ..Default::default()
    }
}

/// A pod mounting the given claims, optionally owned by `(kind, name)`.
pub fn pod(namespace: &str, name: &str, claims: &[&str], owner: Option<(&str, &str)>) -> Pod {
    let volumes = claims
        .iter()
        .enumerate()
        .map(|(i, claim_name)| Volume {
            name: format!("vol-{}", i),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.to_string(),
                read_only: None,
            }),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: owner.map(|(kind, owner_name)| vec![owner_reference(kind, owner_name)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            ..Default::default()
        }),
        status: None,
    }
}

pub fn replica_set(namespace: &str, name: &str, owner: Option<(&str, &str)>) -> ReplicaSet {
    ReplicaSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: owner.map(|(kind, owner_name)| vec![owner_reference(kind, owner_name)]),
            ..Default::default()
        },
        spec: None,
        status: None,
    }
}

pub fn owner(kind: OwnerKind, namespace: &str, name: &str) -> OwnerRef {
    OwnerRef {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

// --- Cloud double ---

#[derive(Default)]
struct CloudInner {
    volumes: HashMap<String, VolumeDescription>,
    snapshots: HashMap<String, SnapshotRecord>,
    snapshot_tags: HashMap<String, Vec<Tag>>,
    /// Remaining describe results per snapshot; the last one repeats.
    progressions: HashMap<String, VecDeque<(u8, SnapshotState)>>,
    /// Progressions handed to the next created snapshots, in creation order.
    next_progressions: VecDeque<Vec<(u8, SnapshotState)>>,
    next_id: usize,
    fail_create_snapshot: bool,
    fail_copy_snapshot: bool,
    fail_create_volume: bool,
    unencrypted_volumes: bool,
    create_snapshot_calls: Vec<String>,
    copy_snapshot_calls: Vec<String>,
    create_volume_calls: Vec<CreateVolumeRequest>,
    describe_snapshot_calls: usize,
}

#[derive(Default)]
pub struct FakeCloud {
    inner: Mutex<CloudInner>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_volume(&self, volume_id: &str, encrypted: bool, zone: &str) {
        self.inner.lock().unwrap().volumes.insert(
            volume_id.to_string(),
            VolumeDescription {
                volume_id: volume_id.to_string(),
                encrypted,
                availability_zone: zone.to_string(),
                volume_type: Some("gp2".to_string()),
                size_gib: Some(10),
                state: Some("available".to_string()),
                tags: Vec::new(),
            },
        );
    }

    /// Sets the attachment state reported for `volume_id` (`in-use`, `available`).
    pub fn set_volume_state(&self, volume_id: &str, state: &str) {
        if let Some(volume) = self.inner.lock().unwrap().volumes.get_mut(volume_id) {
            volume.state = Some(state.to_string());
        }
    }

    /// Queues the describe results of the next snapshot created or copied.
    pub fn push_snapshot_progression(&self, steps: Vec<(u8, SnapshotState)>) {
        self.inner.lock().unwrap().next_progressions.push_back(steps);
    }

    /// Makes every following describe of `snapshot_id` report completion.
    pub fn complete_snapshot(&self, snapshot_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .progressions
            .insert(snapshot_id.to_string(), VecDeque::from([(100, SnapshotState::Completed)]));
    }

    pub fn fail_create_snapshot(&self) {
        self.inner.lock().unwrap().fail_create_snapshot = true;
    }

    pub fn fail_copy_snapshot(&self) {
        self.inner.lock().unwrap().fail_copy_snapshot = true;
    }

    pub fn fail_create_volume(&self) {
        self.inner.lock().unwrap().fail_create_volume = true;
    }

    /// Volumes created from now on come back unencrypted, whatever their snapshot.
    pub fn create_unencrypted_volumes(&self) {
        self.inner.lock().unwrap().unencrypted_volumes = true;
    }

    pub fn create_snapshot_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().create_snapshot_calls.clone()
    }

    pub fn copy_snapshot_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().copy_snapshot_calls.clone()
    }

    pub fn create_volume_calls(&self) -> Vec<CreateVolumeRequest> {
        self.inner.lock().unwrap().create_volume_calls.clone()
    }

    pub fn describe_snapshot_calls(&self) -> usize {
        self.inner.lock().unwrap().describe_snapshot_calls
    }

    pub fn volume(&self, volume_id: &str) -> Option<VolumeDescription> {
        self.inner.lock().unwrap().volumes.get(volume_id).cloned()
    }

    pub fn snapshot_tags(&self, snapshot_id: &str) -> Vec<Tag> {
        self.inner
            .lock()
            .unwrap()
            .snapshot_tags
            .get(snapshot_id)
            .cloned()
            .unwrap_or_default()
    }

    fn insert_snapshot(inner: &mut CloudInner, volume_id: &str, encrypted: bool, tags: &[Tag]) -> String {
        inner.next_id += 1;
        let snapshot_id = format!("snap-{}", inner.next_id);
        let progression: VecDeque<(u8, SnapshotState)> = inner
            .next_progressions
            .pop_front()
            .unwrap_or_else(|| vec![(100, SnapshotState::Completed)])
            .into();
        let (progress_percent, state) = progression
            .front()
            .cloned()
            .unwrap_or((100, SnapshotState::Completed));

        inner.snapshots.insert(
            snapshot_id.clone(),
            SnapshotRecord {
                snapshot_id: snapshot_id.clone(),
                volume_id: volume_id.to_string(),
                encrypted,
                progress_percent,
                state,
            },
        );
        inner.progressions.insert(snapshot_id.clone(), progression);
        inner.snapshot_tags.insert(snapshot_id.clone(), tags.to_vec());
        snapshot_id
    }
}

fn has_tag(tags: &[Tag], key: &str, value: &str) -> bool {
    tags.iter().any(|t| t.key == key && t.value == value)
}

#[async_trait]
impl BlockStorage for FakeCloud {
    async fn describe_volume(&self, volume_id: &str) -> std::result::Result<VolumeDescription, CloudError> {
        self.inner
            .lock()
            .unwrap()
            .volumes
            .get(volume_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound {
                resource: "volume",
                id: volume_id.to_string(),
            })
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> std::result::Result<SnapshotRecord, CloudError> {
        let mut inner = self.inner.lock().unwrap();
        inner.describe_snapshot_calls += 1;
        let current = inner
            .progressions
            .get_mut(snapshot_id)
            .and_then(|steps| {
                let step = steps.front().cloned();
                if steps.len() > 1 {
                    steps.pop_front();
                }
                step
            });
        let record = inner.snapshots.get_mut(snapshot_id).ok_or_else(|| CloudError::NotFound {
            resource: "snapshot",
            id: snapshot_id.to_string(),
        })?;
        if let Some((progress, state)) = current {
            record.progress_percent = progress;
            record.state = state;
        }
        Ok(record.clone())
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        _description: &str,
        tags: &[Tag],
    ) -> std::result::Result<String, CloudError> {
        let mut inner = self.inner.lock().unwrap();
        inner.create_snapshot_calls.push(volume_id.to_string());
        if inner.fail_create_snapshot {
            return Err(CloudError::Rejected {
                operation: "create-snapshot",
                id: volume_id.to_string(),
                message: "SnapshotLimitExceeded".to_string(),
            });
        }
        let encrypted = inner.volumes.get(volume_id).map(|v| v.encrypted).unwrap_or(false);
        Ok(Self::insert_snapshot(&mut inner, volume_id, encrypted, tags))
    }

    async fn copy_snapshot(
        &self,
        snapshot_id: &str,
        _description: &str,
        tags: &[Tag],
    ) -> std::result::Result<String, CloudError> {
        let mut inner = self.inner.lock().unwrap();
        inner.copy_snapshot_calls.push(snapshot_id.to_string());
        if inner.fail_copy_snapshot {
            return Err(CloudError::Rejected {
                operation: "copy-snapshot",
                id: snapshot_id.to_string(),
                message: "InvalidSnapshot.InUse".to_string(),
            });
        }
        let source_volume = inner
            .snapshots
            .get(snapshot_id)
            .map(|s| s.volume_id.clone())
            .ok_or_else(|| CloudError::NotFound {
                resource: "snapshot",
                id: snapshot_id.to_string(),
            })?;
        Ok(Self::insert_snapshot(&mut inner, &source_volume, true, tags))
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> std::result::Result<String, CloudError> {
        let mut inner = self.inner.lock().unwrap();
        inner.create_volume_calls.push(request.clone());
        if inner.fail_create_volume {
            return Err(CloudError::Rejected {
                operation: "create-volume",
                id: request.snapshot_id.clone(),
                message: "InsufficientVolumeCapacity".to_string(),
            });
        }
        let encrypted = !inner.unencrypted_volumes
            && inner
                .snapshots
                .get(&request.snapshot_id)
                .map(|s| s.encrypted)
                .unwrap_or(false);
        inner.next_id += 1;
        let volume_id = format!("vol-new{}", inner.next_id);
        inner.volumes.insert(
            volume_id.clone(),
            VolumeDescription {
                volume_id: volume_id.clone(),
                encrypted,
                availability_zone: request.availability_zone.clone(),
                volume_type: Some(request.volume_type.clone()),
                size_gib: Some(10),
                state: Some("available".to_string()),
                tags: request.tags.clone(),
            },
        );
        Ok(volume_id)
    }

    async fn find_snapshots_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> std::result::Result<Vec<SnapshotRecord>, CloudError> {
        let inner = self.inner.lock().unwrap();
        let mut found: Vec<SnapshotRecord> = inner
            .snapshots
            .values()
            .filter(|s| {
                inner
                    .snapshot_tags
                    .get(&s.snapshot_id)
                    .map(|tags| has_tag(tags, key, value))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        Ok(found)
    }

    async fn find_volumes_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> std::result::Result<Vec<VolumeDescription>, CloudError> {
        let inner = self.inner.lock().unwrap();
        let mut found: Vec<VolumeDescription> = inner
            .volumes
            .values()
            .filter(|v| has_tag(&v.tags, key, value))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        Ok(found)
    }
}

// --- Cluster double ---

#[derive(Default)]
struct ClusterInner {
    pvs: Vec<PersistentVolume>,
    pods: Vec<Pod>,
    claims: HashMap<(String, String), PersistentVolumeClaim>,
    replica_sets: HashMap<(String, String), ReplicaSet>,
    replicas: HashMap<OwnerRef, i32>,
    scale_failures: u32,
    fail_scale_up: bool,
    fail_rebind: bool,
    fail_rebind_after_delete: bool,
    replica_set_lookups: usize,
    scale_calls: Vec<(OwnerRef, i32)>,
    rebind_calls: Vec<(String, String)>,
}

#[derive(Default)]
pub struct FakeCluster {
    inner: Mutex<ClusterInner>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pv(&self, pv: PersistentVolume) {
        self.inner.lock().unwrap().pvs.push(pv);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.inner.lock().unwrap().pods.push(pod);
    }

    pub fn add_claim(&self, namespace: &str, name: &str, pv_name: &str) {
        self.inner
            .lock()
            .unwrap()
            .claims
            .insert((namespace.to_string(), name.to_string()), claim(namespace, name, pv_name));
    }

    pub fn add_replica_set(&self, rs: ReplicaSet) {
        let key = (
            rs.metadata.namespace.clone().unwrap_or_default(),
            rs.metadata.name.clone().unwrap_or_default(),
        );
        self.inner.lock().unwrap().replica_sets.insert(key, rs);
    }

    pub fn set_replicas(&self, owner: &OwnerRef, replicas: i32) {
        self.inner.lock().unwrap().replicas.insert(owner.clone(), replicas);
    }

    pub fn replicas(&self, owner: &OwnerRef) -> Option<i32> {
        self.inner.lock().unwrap().replicas.get(owner).copied()
    }

    /// The next `n` scale calls fail.
    pub fn fail_next_scales(&self, n: u32) {
        self.inner.lock().unwrap().scale_failures = n;
    }

    /// Every scale to a non-zero replica count fails.
    pub fn fail_scale_up(&self) {
        self.inner.lock().unwrap().fail_scale_up = true;
    }

    pub fn fail_rebind(&self) {
        self.inner.lock().unwrap().fail_rebind = true;
    }

    /// The next rebind deletes the old PV and claim, then fails before
    /// recreating them.
    pub fn fail_rebind_after_delete(&self) {
        self.inner.lock().unwrap().fail_rebind_after_delete = true;
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.inner.lock().unwrap().pods.retain(|p| {
            p.metadata.namespace.as_deref() != Some(namespace) || p.metadata.name.as_deref() != Some(name)
        });
    }

    pub fn has_claim(&self, namespace: &str, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .claims
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    pub fn replica_set_lookups(&self) -> usize {
        self.inner.lock().unwrap().replica_set_lookups
    }

    pub fn scale_calls(&self) -> Vec<(OwnerRef, i32)> {
        self.inner.lock().unwrap().scale_calls.clone()
    }

    pub fn rebind_calls(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().rebind_calls.clone()
    }

    pub fn pv_handle(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .pvs
            .iter()
            .find(|pv| pv.metadata.name.as_deref() == Some(name))
            .and_then(|pv| pv.spec.as_ref()?.aws_elastic_block_store.as_ref())
            .map(|ebs| ebs.volume_id.clone())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolume>> {
        Ok(self.inner.lock().unwrap().pvs.clone())
    }

    async fn list_running_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.inner.lock().unwrap().pods.clone())
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume> {
        self.inner
            .lock()
            .unwrap()
            .pvs
            .iter()
            .find(|pv| pv.metadata.name.as_deref() == Some(name))
            .cloned()
            .ok_or_else(|| Error::not_found("PersistentVolume", name))
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        self.inner
            .lock()
            .unwrap()
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found("PersistentVolumeClaim", format!("{}/{}", namespace, name)))
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet> {
        let mut inner = self.inner.lock().unwrap();
        inner.replica_set_lookups += 1;
        inner
            .replica_sets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found("ReplicaSet", format!("{}/{}", namespace, name)))
    }

    async fn get_replicas(&self, owner: &OwnerRef) -> Result<i32> {
        self.inner
            .lock()
            .unwrap()
            .replicas
            .get(owner)
            .copied()
            .ok_or_else(|| Error::not_found("owner", owner.to_string()))
    }

    async fn scale(&self, owner: &OwnerRef, replicas: i32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.scale_calls.push((owner.clone(), replicas));
        if inner.scale_failures > 0 {
            inner.scale_failures -= 1;
            return Err(Error::Malformed(format!("injected scale failure for {}", owner)));
        }
        if inner.fail_scale_up && replicas > 0 {
            return Err(Error::Malformed(format!("injected scale-up failure for {}", owner)));
        }
        if !inner.replicas.contains_key(owner) {
            return Err(Error::not_found("owner", owner.to_string()));
        }
        inner.replicas.insert(owner.clone(), replicas);
        if replicas == 0 {
            let replica_sets = inner.replica_sets.clone();
            inner.pods.retain(|pod| !owned_by(pod, owner, &replica_sets));
        }
        Ok(())
    }

    async fn rebind_volume(&self, manifests: &RebindManifests) -> Result<()> {
        let pv_name = manifests.volume.metadata.name.clone().unwrap_or_default();
        let handle = ebs_volume_handle(&manifests.volume)
            .map(str::to_string)
            .ok_or_else(|| Error::Malformed(format!("PV '{}' is not EBS backed", pv_name)))?;

        let mut inner = self.inner.lock().unwrap();
        inner.rebind_calls.push((pv_name.clone(), short_volume_id(&handle)?.to_string()));
        if inner.fail_rebind {
            return Err(Error::Malformed(format!("injected rebind failure for {}", pv_name)));
        }

        let claim_key = manifests.claim.as_ref().map(|c| {
            (
                c.metadata.namespace.clone().unwrap_or_default(),
                c.metadata.name.clone().unwrap_or_default(),
            )
        });
        let current = inner.pvs.iter().position(|pv| pv.metadata.name.as_deref() == Some(pv_name.as_str()));
        let rebound = current.is_some_and(|i| ebs_volume_handle(&inner.pvs[i]) == Some(handle.as_str()));
        if !rebound {
            if let Some(i) = current {
                inner.pvs.remove(i);
            }
            if let Some(key) = &claim_key {
                inner.claims.remove(key);
            }
            if inner.fail_rebind_after_delete {
                inner.fail_rebind_after_delete = false;
                return Err(Error::Malformed(format!("injected failure after deleting {}", pv_name)));
            }
            inner.pvs.push(manifests.volume.clone());
        }
        if let (Some(key), Some(claim)) = (claim_key, &manifests.claim) {
            inner.claims.entry(key).or_insert_with(|| claim.clone());
        }
        Ok(())
    }
}

/// Whether `pod` belongs to `owner`, directly or through one of its ReplicaSets.
fn owned_by(pod: &Pod, owner: &OwnerRef, replica_sets: &HashMap<(String, String), ReplicaSet>) -> bool {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    if namespace != owner.namespace {
        return false;
    }
    let Some(reference) = pod.metadata.owner_references.as_ref().and_then(|refs| refs.first()) else {
        return false;
    };
    if OwnerKind::from_kind(&reference.kind) == owner.kind && reference.name == owner.name {
        return true;
    }
    reference.kind == "ReplicaSet"
        && replica_sets
            .get(&(namespace, reference.name.clone()))
            .and_then(|rs| rs.metadata.owner_references.as_ref()?.first().cloned())
            .is_some_and(|parent| OwnerKind::from_kind(&parent.kind) == owner.kind && parent.name == owner.name)
}
