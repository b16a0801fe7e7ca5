/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/model.rs
*
* Domain records shared by the discovery and migration stages: volumes,
* snapshots, pod ownership and migration plans.
*
* SPDX-License-Identifier: Apache-2.0
*/

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespaced reference to a PersistentVolumeClaim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimRef {
    pub namespace: String,
    pub name: String,
}

impl ClaimRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClaimRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// An EBS volume backing a cluster PersistentVolume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// The short EBS ID (`vol-...`).
    pub volume_id: String,
    pub encrypted: bool,
    pub availability_zone: String,
    pub pv_name: String,
    /// `None` when the PV has no claimRef.
    pub claim: Option<ClaimRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
    Recoverable,
    Recovering,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotState::Pending => "pending",
            SnapshotState::Completed => "completed",
            SnapshotState::Error => "error",
            SnapshotState::Recoverable => "recoverable",
            SnapshotState::Recovering => "recovering",
            SnapshotState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub volume_id: String,
    pub encrypted: bool,
    pub progress_percent: u8,
    pub state: SnapshotState,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OwnerKind {
    Deployment,
    StatefulSet,
    Other(String),
}

impl OwnerKind {
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "Deployment" => OwnerKind::Deployment,
            "StatefulSet" => OwnerKind::StatefulSet,
            other => OwnerKind::Other(other.to_string()),
        }
    }

    /// Deployments and StatefulSets are the only owners that can be scaled here.
    pub fn is_supported(&self) -> bool {
        !matches!(self, OwnerKind::Other(_))
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerKind::Deployment => f.write_str("Deployment"),
            OwnerKind::StatefulSet => f.write_str("StatefulSet"),
            OwnerKind::Other(kind) => f.write_str(kind),
        }
    }
}

/// The controller ultimately responsible for a pod. Also used as the grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: OwnerKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A running pod that mounts the claim of an unencrypted volume.
#[derive(Debug, Clone)]
pub struct PodMatch {
    pub pod: Pod,
    pub claim: ClaimRef,
    /// Position of the volume in the unencrypted list.
    pub volume_index: usize,
    pub volume_id: String,
    pub pv_name: String,
}

impl PodMatch {
    pub fn pod_name(&self) -> &str {
        self.pod.metadata.name.as_deref().unwrap_or("unknown")
    }
}

/// A pod mounted by the plan's volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountedBy {
    pub pod: String,
    pub claim: ClaimRef,
}

/// Everything the state machine needs to migrate one volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub volume: VolumeRecord,
    pub volume_index: usize,
    pub mounts: Vec<MountedBy>,
    /// `None` when no running pod mounts the volume.
    pub owner: Option<OwnerRef>,
    /// Replica count read from the owner while building the plan.
    pub original_replicas: Option<i32>,
}

impl MigrationPlan {
    pub fn volume_id(&self) -> &str {
        &self.volume.volume_id
    }
}

/// A volume that cannot be migrated automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsupportedVolume {
    pub volume: VolumeRecord,
    pub owners: Vec<OwnerRef>,
    pub reason: String,
}
