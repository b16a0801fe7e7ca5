/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/resolver.rs
*
* The workload resolver maps unencrypted volumes to the running pods that
* mount their claims, and those pods to the controller that must be paused
* before the volume can be swapped.
*
* Ownership cases:
* - StatefulSet -> Pod
* - Deployment -> ReplicaSet -> Pod
* Only the first owner reference of an object is consulted; objects with
* several owners are not supported. Pods owned by anything else are reported
* and left for the operator to scale down by hand.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::model::{
    ClaimRef, MigrationPlan, MountedBy, OwnerKind, OwnerRef, PodMatch, UnsupportedVolume,
    VolumeRecord,
};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{info, warn};

/// Finds the running pods that mount the claim of one of `volumes`.
///
/// An empty `pods` list is an error; zero matches is not, it means the
/// workloads have already been scaled down.
pub fn find_pods_using_volumes(pods: &[Pod], volumes: &[VolumeRecord]) -> Result<Vec<PodMatch>> {
    if pods.is_empty() {
        return Err(Error::NoQualifyingPods);
    }

    let by_claim: HashMap<&ClaimRef, usize> = volumes
        .iter()
        .enumerate()
        .filter_map(|(idx, volume)| volume.claim.as_ref().map(|claim| (claim, idx)))
        .collect();

    let mut matches = Vec::new();
    for pod in pods {
        for claim in mounted_claims(pod)? {
            if let Some(&idx) = by_claim.get(&claim) {
                let record = &volumes[idx];
                matches.push(PodMatch {
                    pod: pod.clone(),
                    claim,
                    volume_index: idx,
                    volume_id: record.volume_id.clone(),
                    pv_name: record.pv_name.clone(),
                });
            }
        }
    }

    info!("Count of Pods with unencrypted PVCs attached: {}", matches.len());
    Ok(matches)
}

/// The claims a pod mounts, qualified with the pod's namespace.
fn mounted_claims(pod: &Pod) -> Result<Vec<ClaimRef>> {
    let spec = pod
        .spec
        .as_ref()
        .ok_or_else(|| Error::Malformed(format!("pod '{}' has no spec", pod.name_any())))?;
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());

    Ok(spec
        .volumes
        .iter()
        .flatten()
        .filter_map(|volume| volume.persistent_volume_claim.as_ref())
        .map(|pvc| ClaimRef::new(namespace.clone(), pvc.claim_name.clone()))
        .collect())
}

/// Names of the pods in `pods` that still mount `claim`.
pub fn pods_mounting_claim(pods: &[Pod], claim: &ClaimRef) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for pod in pods {
        if mounted_claims(pod)?.contains(claim) {
            names.push(pod.name_any());
        }
    }
    Ok(names)
}

/// Resolves the controller responsible for a pod.
///
/// A ReplicaSet owner is looked up and its own first owner is returned; any
/// other owner is returned as-is. A ReplicaSet without an owner is reported as
/// an unsupported `ReplicaSet` owner.
pub async fn resolve_owner(cluster: &dyn ClusterApi, pod: &Pod) -> Result<OwnerRef> {
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let first = pod
        .owner_references()
        .first()
        .ok_or_else(|| Error::MissingOwner {
            namespace: namespace.clone(),
            name: pod.name_any(),
        })?;

    if first.kind != "ReplicaSet" {
        return Ok(OwnerRef {
            kind: OwnerKind::from_kind(&first.kind),
            namespace,
            name: first.name.clone(),
        });
    }

    let rs = cluster.get_replica_set(&namespace, &first.name).await?;
    Ok(match rs.owner_references().first() {
        Some(owner) => OwnerRef {
            kind: OwnerKind::from_kind(&owner.kind),
            namespace,
            name: owner.name.clone(),
        },
        None => OwnerRef {
            kind: OwnerKind::Other("ReplicaSet".to_string()),
            namespace,
            name: first.name.clone(),
        },
    })
}

/// Matches bucketed by owner.
#[derive(Debug, Default)]
pub struct OwnerGroups {
    /// Deployment and StatefulSet owners.
    pub supported: BTreeMap<OwnerRef, Vec<PodMatch>>,
    /// Matches whose owner cannot be paused automatically.
    pub unsupported: Vec<(OwnerRef, PodMatch)>,
}

impl OwnerGroups {
    pub fn of_kind<'a>(&'a self, kind: &'a OwnerKind) -> impl Iterator<Item = (&'a OwnerRef, &'a Vec<PodMatch>)> + 'a {
        self.supported.iter().filter(move |(owner, _)| &owner.kind == kind)
    }

    pub fn total_matches(&self) -> usize {
        self.supported.values().map(Vec::len).sum::<usize>() + self.unsupported.len()
    }

    /// Every owner resolved for the volume at `volume_index`.
    fn owners_of(&self, volume_index: usize) -> (BTreeSet<&OwnerRef>, Vec<&PodMatch>) {
        let mut owners = BTreeSet::new();
        let mut mounts = Vec::new();
        for (owner, matches) in &self.supported {
            for m in matches.iter().filter(|m| m.volume_index == volume_index) {
                owners.insert(owner);
                mounts.push(m);
            }
        }
        for (owner, m) in self.unsupported.iter().filter(|(_, m)| m.volume_index == volume_index) {
            owners.insert(owner);
            mounts.push(m);
        }
        (owners, mounts)
    }
}

/// Resolves the owner of every match and buckets the matches by owner.
pub async fn group_by_owner(cluster: &dyn ClusterApi, matches: Vec<PodMatch>) -> Result<OwnerGroups> {
    let mut groups = OwnerGroups::default();
    let mut resolved: HashMap<(String, String, String), OwnerRef> = HashMap::new();

    for m in matches {
        let key = m
            .pod
            .owner_references()
            .first()
            .map(|o| (m.claim.namespace.clone(), o.kind.clone(), o.name.clone()));

        let owner = match key.as_ref().and_then(|k| resolved.get(k)) {
            Some(owner) => owner.clone(),
            None => {
                let owner = resolve_owner(cluster, &m.pod).await?;
                if let Some(key) = key {
                    resolved.insert(key, owner.clone());
                }
                owner
            }
        };

        if owner.kind.is_supported() {
            groups.supported.entry(owner).or_default().push(m);
        } else {
            warn!(
                "The owner of pod {} in the {} namespace is a {}, which isn't supported. \
                 Please ensure you scale this down correctly before proceeding. PV Index: {}",
                m.pod_name(),
                m.claim.namespace,
                owner.kind,
                m.volume_index
            );
            groups.unsupported.push((owner, m));
        }
    }

    info!(
        "Number of qualifying Deployments: {}",
        groups.of_kind(&OwnerKind::Deployment).count()
    );
    info!(
        "Number of qualifying StatefulSets: {}",
        groups.of_kind(&OwnerKind::StatefulSet).count()
    );
    Ok(groups)
}

#[derive(Debug, Clone, Default)]
pub struct PlanSet {
    pub plans: Vec<MigrationPlan>,
    pub unsupported: Vec<UnsupportedVolume>,
}

/// Builds one plan per unencrypted volume, in volume order.
///
/// Volumes mounted through an unsupported owner, or through more than one
/// owner, are returned in `unsupported` instead.
pub async fn build_plans(
    cluster: &dyn ClusterApi,
    volumes: &[VolumeRecord],
    groups: &OwnerGroups,
) -> Result<PlanSet> {
    let mut set = PlanSet::default();
    let mut replicas: HashMap<OwnerRef, i32> = HashMap::new();

    for (idx, volume) in volumes.iter().enumerate() {
        let (owners, matched) = groups.owners_of(idx);
        let mounts: Vec<MountedBy> = matched
            .iter()
            .map(|m| MountedBy {
                pod: m.pod_name().to_string(),
                claim: m.claim.clone(),
            })
            .collect();
        let owners: Vec<OwnerRef> = owners.into_iter().cloned().collect();

        if let Some(other) = owners.iter().find(|o| !o.kind.is_supported()) {
            set.unsupported.push(UnsupportedVolume {
                volume: volume.clone(),
                reason: format!("mounted by a pod owned by unsupported kind {}", other.kind),
                owners,
            });
            continue;
        }
        if owners.len() > 1 {
            set.unsupported.push(UnsupportedVolume {
                volume: volume.clone(),
                reason: format!("mounted by pods of {} different owners", owners.len()),
                owners,
            });
            continue;
        }

        let owner = owners.into_iter().next();
        let original_replicas = match &owner {
            Some(owner) => match replicas.get(owner) {
                Some(count) => Some(*count),
                None => {
                    let count = cluster.get_replicas(owner).await?;
                    replicas.insert(owner.clone(), count);
                    Some(count)
                }
            },
            None => None,
        };

        set.plans.push(MigrationPlan {
            volume: volume.clone(),
            volume_index: idx,
            mounts,
            owner,
            original_replicas,
        });
    }

    Ok(set)
}
