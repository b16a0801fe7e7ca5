/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/directory.rs
*
* The volume directory: finds the PVs backed by in-tree EBS volumes and asks
* the cloud provider whether each volume is encrypted. PVs provisioned by the
* EBS CSI driver are not considered, since that driver is expected to create
* encrypted volumes.
*
* The unencrypted list keeps PV-list order; plans and reports refer to volumes
* by their position in it.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::cloud::BlockStorage;
use crate::cluster::manifest::{claim_ref, ebs_volume_handle, short_volume_id};
use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::model::VolumeRecord;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;
use serde::Serialize;
use tracing::{error, info};

/// A PV that could not be resolved to a volume record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedVolume {
    pub pv_name: String,
    pub volume_handle: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VolumeInventory {
    pub total_pvs: usize,
    pub ebs_backed: usize,
    pub encrypted: Vec<VolumeRecord>,
    pub unencrypted: Vec<VolumeRecord>,
    pub skipped: Vec<SkippedVolume>,
}

/// Returns the PVs backed by an in-tree EBS volume, in list order.
pub fn ebs_backed_pvs(pvs: &[PersistentVolume]) -> Result<Vec<&PersistentVolume>> {
    if pvs.is_empty() {
        return Err(Error::EmptyInventory);
    }

    let ebs: Vec<&PersistentVolume> = pvs.iter().filter(|pv| ebs_volume_handle(pv).is_some()).collect();
    info!("Count of PVs backed by EBS volumes: {}", ebs.len());
    Ok(ebs)
}

/// Lists every EBS-backed PV and partitions it by encryption status.
pub async fn audit_volumes(cluster: &dyn ClusterApi, cloud: &dyn BlockStorage) -> Result<VolumeInventory> {
    let pvs = cluster.list_persistent_volumes().await?;
    let ebs = ebs_backed_pvs(&pvs)?;

    let mut inventory = VolumeInventory {
        total_pvs: pvs.len(),
        ebs_backed: ebs.len(),
        ..Default::default()
    };

    for pv in ebs {
        let pv_name = pv.name_any();
        let handle = ebs_volume_handle(pv).unwrap_or_default();
        let claim = claim_ref(pv);

        let volume_id = match short_volume_id(handle) {
            Ok(id) => id,
            Err(e) => {
                error!(pv = %pv_name, handle, "Malformed EBS volume handle");
                inventory.skipped.push(SkippedVolume {
                    pv_name,
                    volume_handle: handle.to_string(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let details = match cloud.describe_volume(volume_id).await {
            Ok(details) => details,
            Err(e) if e.is_not_found() => {
                match &claim {
                    Some(claim) => error!(volume_id, pv = %pv_name, pvc = %claim, "Error with volume: not found in AWS"),
                    None => error!(volume_id, pv = %pv_name, "Error with volume: not found in AWS"),
                }
                inventory.skipped.push(SkippedVolume {
                    pv_name,
                    volume_handle: handle.to_string(),
                    reason: e.to_string(),
                });
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let record = VolumeRecord {
            volume_id: volume_id.to_string(),
            encrypted: details.encrypted,
            availability_zone: details.availability_zone,
            pv_name,
            claim,
        };
        if record.encrypted {
            inventory.encrypted.push(record);
        } else {
            inventory.unencrypted.push(record);
        }
    }

    info!("Count of encrypted EBS PVs: {}", inventory.encrypted.len());
    info!("Count of unencrypted EBS PVs: {}", inventory.unencrypted.len());
    Ok(inventory)
}

/// The unencrypted EBS volumes of the cluster, in PV-list order.
pub async fn list_unencrypted_ebs_volumes(
    cluster: &dyn ClusterApi,
    cloud: &dyn BlockStorage,
) -> Result<Vec<VolumeRecord>> {
    Ok(audit_volumes(cluster, cloud).await?.unencrypted)
}
