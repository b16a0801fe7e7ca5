/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/cluster/manifest.rs
*
* Pure helpers for reading and rewriting PV/PVC manifests. The in-tree EBS
* volume source of a PV is immutable, so rebinding a claim to a new volume
* means recreating both objects from cleaned copies of the originals. Those
* copies are built once, before anything is deleted, and kept in the
* migration state so an interrupted rebind can be finished later.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::error::{Error, Result};
use crate::model::ClaimRef;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};

const VOLUME_ID_PREFIX: &str = "vol-";

/// The volume handle of an in-tree EBS PV (`aws://<zone>/vol-...`), if any.
pub fn ebs_volume_handle(pv: &PersistentVolume) -> Option<&str> {
    pv.spec
        .as_ref()
        .and_then(|spec| spec.aws_elastic_block_store.as_ref())
        .map(|ebs| ebs.volume_id.as_str())
}

/// Strips the `aws://<zone>/` prefix from a PV volume handle.
pub fn short_volume_id(handle: &str) -> Result<&str> {
    handle
        .find(VOLUME_ID_PREFIX)
        .map(|idx| &handle[idx..])
        .ok_or_else(|| Error::Malformed(format!("volume handle '{}' has no EBS volume ID", handle)))
}

/// Replaces the `vol-...` suffix of a handle, keeping any `aws://<zone>/` prefix.
pub fn rewrite_volume_handle(handle: &str, new_volume_id: &str) -> Result<String> {
    let idx = handle
        .find(VOLUME_ID_PREFIX)
        .ok_or_else(|| Error::Malformed(format!("volume handle '{}' has no EBS volume ID", handle)))?;
    Ok(format!("{}{}", &handle[..idx], new_volume_id))
}

pub fn claim_ref(pv: &PersistentVolume) -> Option<ClaimRef> {
    let claim = pv.spec.as_ref()?.claim_ref.as_ref()?;
    Some(ClaimRef::new(
        claim.namespace.clone().unwrap_or_else(|| "default".to_string()),
        claim.name.clone()?,
    ))
}

/// Keeps only the identity of an object, dropping server-populated metadata.
fn clean_metadata(meta: &ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        name: meta.name.clone(),
        namespace: meta.namespace.clone(),
        labels: meta.labels.clone(),
        ..Default::default()
    }
}

/// Builds the PV that replaces `pv`, pointing at `new_volume_id`.
///
/// The claimRef keeps its name and namespace but loses uid and resourceVersion
/// so the recreated claim can bind to it.
pub fn replacement_volume(pv: &PersistentVolume, new_volume_id: &str) -> Result<PersistentVolume> {
    let mut spec = pv
        .spec
        .clone()
        .ok_or_else(|| Error::Malformed(format!("PV '{}' has no spec", pv.metadata.name.as_deref().unwrap_or(""))))?;

    let ebs = spec.aws_elastic_block_store.as_mut().ok_or_else(|| {
        Error::Malformed(format!(
            "PV '{}' is not backed by an in-tree EBS volume",
            pv.metadata.name.as_deref().unwrap_or("")
        ))
    })?;
    ebs.volume_id = rewrite_volume_handle(&ebs.volume_id, new_volume_id)?;

    if let Some(claim) = spec.claim_ref.as_mut() {
        claim.uid = None;
        claim.resource_version = None;
    }

    Ok(PersistentVolume {
        metadata: clean_metadata(&pv.metadata),
        spec: Some(spec),
        status: None,
    })
}

/// Builds the claim that replaces `pvc`, pinned to the PV named `pv_name`.
pub fn replacement_claim(pvc: &PersistentVolumeClaim, pv_name: &str) -> PersistentVolumeClaim {
    let mut spec = pvc.spec.clone().unwrap_or_default();
    spec.volume_name = Some(pv_name.to_string());

    PersistentVolumeClaim {
        metadata: clean_metadata(&pvc.metadata),
        spec: Some(spec),
        status: None,
    }
}

/// The objects that replace a PV and its claim once the PV points at the
/// encrypted volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebindManifests {
    pub volume: PersistentVolume,
    /// `None` when the PV had no bound claim left to recreate.
    pub claim: Option<PersistentVolumeClaim>,
}

impl RebindManifests {
    /// Builds the replacements of `pv` and its bound `claim` for `new_volume_id`.
    pub fn new(pv: &PersistentVolume, claim: Option<&PersistentVolumeClaim>, new_volume_id: &str) -> Result<Self> {
        let pv_name = pv.metadata.name.clone().unwrap_or_default();
        Ok(Self {
            volume: replacement_volume(pv, new_volume_id)?,
            claim: claim.map(|c| replacement_claim(c, &pv_name)),
        })
    }

    pub fn pv_name(&self) -> &str {
        self.volume.metadata.name.as_deref().unwrap_or("")
    }

    /// The handle the recreated PV carries.
    pub fn volume_handle(&self) -> Result<&str> {
        ebs_volume_handle(&self.volume).ok_or_else(|| {
            Error::Malformed(format!("replacement of PV '{}' has no EBS volume handle", self.pv_name()))
        })
    }

    pub fn claim_ref(&self) -> Option<ClaimRef> {
        let claim = self.claim.as_ref()?;
        Some(ClaimRef::new(
            claim.metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
            claim.metadata.name.clone()?,
        ))
    }
}
