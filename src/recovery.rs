/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/recovery.rs
*
* Finds every snapshot and volume this tool created for a source volume, using
* the provenance tags alone. This is the way back when a run crashed between a
* create call and the state write, or when the state directory was lost.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::cloud::{volume_exists, BlockStorage, VolumeDescription, SOURCE_VOLUME_TAG};
use crate::cluster::{claim_exists, pv_exists, ClusterApi};
use crate::error::Result;
use crate::migration::state::MigrationState;
use crate::migration::store::StateStore;
use crate::model::SnapshotRecord;
use std::fmt::Write;
use tracing::info;

#[derive(Debug, Clone)]
pub struct RecoveryListing {
    pub source_volume: String,
    pub snapshots: Vec<SnapshotRecord>,
    pub volumes: Vec<VolumeDescription>,
    pub source_present: bool,
    pub state: Option<MigrationState>,
    /// Whether the recorded PV and claim still exist in the cluster.
    pub pv_present: Option<bool>,
    pub claim_present: Option<bool>,
}

pub async fn list_artifacts(
    cloud: &dyn BlockStorage,
    cluster: &dyn ClusterApi,
    store: &dyn StateStore,
    source_volume: &str,
) -> Result<RecoveryListing> {
    let snapshots = cloud.find_snapshots_by_tag(SOURCE_VOLUME_TAG, source_volume).await?;
    let volumes = cloud.find_volumes_by_tag(SOURCE_VOLUME_TAG, source_volume).await?;
    info!(
        source_volume,
        snapshots = snapshots.len(),
        volumes = volumes.len(),
        "Found resources created for source volume"
    );

    let source_present = volume_exists(cloud, source_volume, false).await?;

    let state = store.load(source_volume).await?;
    let (pv_present, claim_present) = match &state {
        Some(state) => {
            let pv = pv_exists(cluster, &state.pv_name, false).await?;
            let claim = match &state.claim {
                Some(claim) => Some(claim_exists(cluster, &claim.namespace, &claim.name, false).await?),
                None => None,
            };
            (Some(pv), claim)
        }
        None => (None, None),
    };

    Ok(RecoveryListing {
        source_volume: source_volume.to_string(),
        snapshots,
        volumes,
        source_present,
        state,
        pv_present,
        claim_present,
    })
}

impl RecoveryListing {
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Resources created for {}", self.source_volume);
        if !self.source_present {
            out.push_str("The source volume no longer exists\n");
        }

        out.push_str("\nSnapshots\n");
        let _ = writeln!(out, "{:<26} {:<10} {:<9} {}", "Snapshot ID", "Encrypted", "Progress", "State");
        for s in &self.snapshots {
            let _ = writeln!(
                out,
                "{:<26} {:<10} {:<9} {}",
                s.snapshot_id,
                s.encrypted,
                format!("{}%", s.progress_percent),
                s.state
            );
        }

        out.push_str("\nVolumes\n");
        let _ = writeln!(out, "{:<24} {:<10} {:<14} {}", "Volume ID", "Encrypted", "Zone", "State");
        for v in &self.volumes {
            let _ = writeln!(
                out,
                "{:<24} {:<10} {:<14} {}",
                v.volume_id,
                v.encrypted,
                v.availability_zone,
                v.state.as_deref().unwrap_or("-")
            );
        }

        match &self.state {
            Some(state) => {
                let _ = writeln!(
                    out,
                    "\nRecorded state: {:?}, last completed step {}",
                    state.status,
                    state
                        .last_completed
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "none".to_string())
                );
                if let Some(error) = &state.last_error {
                    let _ = writeln!(out, "Last error: {}", error);
                }
                if self.pv_present == Some(false) {
                    let _ = writeln!(out, "PV {} is missing from the cluster", state.pv_name);
                }
                if let (Some(false), Some(claim)) = (self.claim_present, &state.claim) {
                    let _ = writeln!(out, "PVC {} is missing from the cluster", claim);
                }
                let incomplete = self.pv_present == Some(false) || self.claim_present == Some(false);
                if incomplete && state.rebind.is_some() {
                    out.push_str("The replacement PV and claim are recorded; rerun the migration to recreate them\n");
                }
            }
            None => out.push_str("\nNo recorded migration state\n"),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{provenance_tags, CreateVolumeRequest};
    use crate::cluster::manifest::RebindManifests;
    use crate::migration::state::{MigrationState, MigrationStep};
    use crate::migration::store::MemoryStore;
    use crate::model::{ClaimRef, MigrationPlan, VolumeRecord};
    use crate::testing::{claim, ebs_pv, FakeCloud, FakeCluster};

    #[tokio::test]
    async fn test_lists_only_artifacts_of_the_source_volume() {
        let cloud = FakeCloud::new();
        let store = MemoryStore::new();
        cloud.add_volume("vol-a", false, "us-east-1a");
        cloud.add_volume("vol-b", false, "us-east-1a");

        let snap = cloud
            .create_snapshot("vol-a", "d", &provenance_tags("create_ebs_snapshot", ("volume", "vol-a"), "vol-a"))
            .await
            .unwrap();
        let copy = cloud
            .copy_snapshot(&snap, "d", &provenance_tags("encrypt_ebs_snapshot", ("snapshot", &snap), "vol-a"))
            .await
            .unwrap();
        let new_volume = cloud
            .create_volume(&CreateVolumeRequest {
                snapshot_id: copy.clone(),
                availability_zone: "us-east-1a".into(),
                volume_type: "gp3".into(),
                tags: provenance_tags("create_ebs_volume_from_snapshot", ("snapshot", &copy), "vol-a"),
            })
            .await
            .unwrap();
        cloud
            .create_snapshot("vol-b", "d", &provenance_tags("create_ebs_snapshot", ("volume", "vol-b"), "vol-b"))
            .await
            .unwrap();

        let cluster = FakeCluster::new();
        let listing = list_artifacts(&cloud, &cluster, &store, "vol-a").await.unwrap();
        let snapshot_ids: Vec<&str> = listing.snapshots.iter().map(|s| s.snapshot_id.as_str()).collect();
        assert_eq!(snapshot_ids, vec![snap.as_str(), copy.as_str()]);
        assert_eq!(listing.volumes.len(), 1);
        assert_eq!(listing.volumes[0].volume_id, new_volume);
        assert!(listing.state.is_none());
        assert!(listing.source_present);
        assert_eq!(listing.pv_present, None);

        let text = listing.render_text();
        assert!(text.contains(&new_volume));
        assert!(text.contains("No recorded migration state"));
    }

    #[tokio::test]
    async fn test_reports_missing_cluster_objects() {
        let cloud = FakeCloud::new();
        let cluster = FakeCluster::new();
        let store = MemoryStore::new();
        cluster.add_pv(ebs_pv("pv-a", "aws://us-east-1a/vol-new1", Some(("default", "data-0"))));

        let mut state = MigrationState::new(&MigrationPlan {
            volume: VolumeRecord {
                volume_id: "vol-a".into(),
                encrypted: false,
                availability_zone: "us-east-1a".into(),
                pv_name: "pv-a".into(),
                claim: Some(ClaimRef::new("default", "data-0")),
            },
            volume_index: 0,
            mounts: Vec::new(),
            owner: None,
            original_replicas: None,
        });
        state.advance(MigrationStep::PauseOwner, |_| {}).unwrap();
        let pv = ebs_pv("pv-a", "aws://us-east-1a/vol-a", Some(("default", "data-0")));
        let pvc = claim("default", "data-0", "pv-a");
        state.rebind = Some(RebindManifests::new(&pv, Some(&pvc), "vol-new1").unwrap());
        state.fail("rebind interrupted", true);
        store.save(&state).await.unwrap();

        let listing = list_artifacts(&cloud, &cluster, &store, "vol-a").await.unwrap();
        assert!(!listing.source_present);
        assert_eq!(listing.pv_present, Some(true));
        assert_eq!(listing.claim_present, Some(false));

        let text = listing.render_text();
        assert!(text.contains("The source volume no longer exists"));
        assert!(text.contains("PVC default/data-0 is missing from the cluster"));
        assert!(text.contains("Last error: rebind interrupted"));
        assert!(text.contains("rerun the migration to recreate them"));
    }
}
