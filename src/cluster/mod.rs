/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/cluster/mod.rs
*
* The contract between the pipeline and the Kubernetes API. Discovery and
* migration only depend on `ClusterApi`; `kube_api.rs` implements it with
* `kube-rs` and the tests use an in-memory double.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::error::Result;
use crate::model::OwnerRef;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use manifest::{claim_ref, RebindManifests};
use tracing::{error, warn};

pub mod kube_api;
pub mod manifest;

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolume>>;

    /// Lists pods in phase `Running` across all namespaces.
    async fn list_running_pods(&self) -> Result<Vec<Pod>>;

    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume>;

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim>;

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet>;

    /// Returns the desired replica count of a Deployment or StatefulSet.
    async fn get_replicas(&self, owner: &OwnerRef) -> Result<i32>;

    /// Patches the scale subresource of a Deployment or StatefulSet.
    async fn scale(&self, owner: &OwnerRef, replicas: i32) -> Result<()>;

    /// Replaces a PV and its claim with `manifests`.
    ///
    /// Must be safe to call again after any partial failure: a PV that already
    /// carries the new handle is kept, a missing PV or claim is created from
    /// the manifests.
    async fn rebind_volume(&self, manifests: &RebindManifests) -> Result<()>;
}

/// Reads the PV and its bound claim and builds their replacements for
/// `new_volume_id`. Nothing is modified.
pub async fn prepare_rebind(
    cluster: &dyn ClusterApi,
    pv_name: &str,
    new_volume_id: &str,
) -> Result<RebindManifests> {
    let pv = cluster.get_persistent_volume(pv_name).await?;
    let claim = match claim_ref(&pv) {
        Some(claim) => match cluster.get_claim(&claim.namespace, &claim.name).await {
            Ok(pvc) => Some(pvc),
            Err(e) if e.is_not_found() => {
                warn!(pv = pv_name, pvc = %claim, "Bound claim no longer exists; only the PV will be replaced");
                None
            }
            Err(e) => return Err(e),
        },
        None => None,
    };
    RebindManifests::new(&pv, claim.as_ref(), new_volume_id)
}

/// Checks whether a PV exists. See [`crate::cloud::volume_exists`] for `fail_fast`.
pub async fn pv_exists(cluster: &dyn ClusterApi, name: &str, fail_fast: bool) -> Result<bool> {
    match cluster.get_persistent_volume(name).await {
        Ok(_) => Ok(true),
        Err(e) => {
            error!(pv = name, error = %e, "Error when checking on the status of the PV");
            if fail_fast {
                Err(e)
            } else {
                Ok(false)
            }
        }
    }
}

/// Checks whether a PVC exists. See [`crate::cloud::volume_exists`] for `fail_fast`.
pub async fn claim_exists(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    fail_fast: bool,
) -> Result<bool> {
    match cluster.get_claim(namespace, name).await {
        Ok(_) => Ok(true),
        Err(e) => {
            error!(pvc = name, namespace, error = %e, "Error when checking on the status of the PVC");
            if fail_fast {
                Err(e)
            } else {
                Ok(false)
            }
        }
    }
}
