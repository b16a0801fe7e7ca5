/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/report.rs
*
* Renders the audit and migration results for the operator, either as
* aligned text tables or as JSON. Rendering returns strings; printing is left
* to the binary.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::directory::{SkippedVolume, VolumeInventory};
use crate::migration::runner::{MigrationSummary, VolumeOutcome};
use crate::model::{OwnerKind, UnsupportedVolume, VolumeRecord};
use crate::resolver::OwnerGroups;
use serde::Serialize;
use std::fmt::Write;

/// One row of an owner table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRow {
    pub namespace: String,
    pub name: String,
    pub pods: usize,
    pub claims: Vec<String>,
    pub pvs: Vec<String>,
    /// Positions of the volumes in the unencrypted list.
    pub pv_indexes: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub total_pvs: usize,
    pub ebs_backed: usize,
    pub encrypted: usize,
    pub unencrypted: Vec<VolumeRecord>,
    pub skipped: Vec<SkippedVolume>,
    pub deployments: Vec<OwnerRow>,
    pub stateful_sets: Vec<OwnerRow>,
    pub unsupported: Vec<UnsupportedVolume>,
}

fn owner_rows(groups: &OwnerGroups, kind: &OwnerKind) -> Vec<OwnerRow> {
    groups
        .of_kind(kind)
        .map(|(owner, matches)| OwnerRow {
            namespace: owner.namespace.clone(),
            name: owner.name.clone(),
            pods: matches.len(),
            claims: matches.iter().map(|m| m.claim.name.clone()).collect(),
            pvs: matches.iter().map(|m| m.pv_name.clone()).collect(),
            pv_indexes: matches.iter().map(|m| m.volume_index).collect(),
        })
        .collect()
}

impl AuditReport {
    pub fn new(inventory: &VolumeInventory, groups: &OwnerGroups, unsupported: &[UnsupportedVolume]) -> Self {
        Self {
            total_pvs: inventory.total_pvs,
            ebs_backed: inventory.ebs_backed,
            encrypted: inventory.encrypted.len(),
            unencrypted: inventory.unencrypted.clone(),
            skipped: inventory.skipped.clone(),
            deployments: owner_rows(groups, &OwnerKind::Deployment),
            stateful_sets: owner_rows(groups, &OwnerKind::StatefulSet),
            unsupported: unsupported.to_vec(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "PVs: {}  EBS-backed: {}  Encrypted: {}  Unencrypted: {}  Skipped: {}",
            self.total_pvs,
            self.ebs_backed,
            self.encrypted,
            self.unencrypted.len(),
            self.skipped.len()
        );

        out.push_str("\nUnencrypted EBS volumes\n");
        let _ = writeln!(out, "{:<6} {:<24} {:<14} {:<40} {}", "Index", "Volume ID", "Zone", "PV", "PVC");
        for (i, volume) in self.unencrypted.iter().enumerate() {
            let claim = volume
                .claim
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:<6} {:<24} {:<14} {:<40} {}",
                i, volume.volume_id, volume.availability_zone, volume.pv_name, claim
            );
        }

        render_owner_table(&mut out, "Qualifying Deployments", &self.deployments);
        render_owner_table(&mut out, "Qualifying StatefulSets", &self.stateful_sets);

        if !self.unsupported.is_empty() {
            out.push_str("\nVolumes that need manual handling\n");
            for u in &self.unsupported {
                let owners: Vec<String> = u.owners.iter().map(|o| o.to_string()).collect();
                let _ = writeln!(out, "{:<24} {:<40} {}: {}", u.volume.volume_id, u.volume.pv_name, u.reason, owners.join(", "));
            }
        }
        if !self.skipped.is_empty() {
            out.push_str("\nSkipped PVs\n");
            for s in &self.skipped {
                let _ = writeln!(out, "{:<40} {:<40} {}", s.pv_name, s.volume_handle, s.reason);
            }
        }
        out
    }
}

fn list<T: ToString>(items: &[T]) -> String {
    items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",")
}

fn render_owner_table(out: &mut String, title: &str, rows: &[OwnerRow]) {
    let _ = writeln!(out, "\n{}", title);
    let _ = writeln!(
        out,
        "{:<6} {:<16} {:<24} {:<7} {:<32} {:<40} {}",
        "Index", "Namespace", "Name", "# Pods", "PVC Names", "PV Names", "PV Index"
    );
    for (i, row) in rows.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:<6} {:<16} {:<24} {:<7} {:<32} {:<40} {}",
            i,
            row.namespace,
            row.name,
            row.pods,
            list(&row.claims),
            list(&row.pvs),
            list(&row.pv_indexes)
        );
    }
    let total: usize = rows.iter().map(|r| r.pods).sum();
    let _ = writeln!(
        out,
        "{:<6} {:<16} {:<24} {:<7} {:<32} {:<40} {}",
        "Total", "---", "---", total, "---", "---", "---"
    );
}

fn outcome_text(outcome: &VolumeOutcome) -> String {
    match outcome {
        VolumeOutcome::Succeeded => "succeeded".to_string(),
        VolumeOutcome::Failed(reason) => format!("failed: {}", reason),
        VolumeOutcome::Incomplete(step) => format!("incomplete, resumes at {}", step),
        VolumeOutcome::Aborted => "aborted".to_string(),
        VolumeOutcome::ManualResumeRequired(reason) => format!("manual resume required: {}", reason),
        VolumeOutcome::Unsupported(reason) => format!("unsupported: {}", reason),
    }
}

pub fn render_summary_text(summary: &MigrationSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<24} {:<32} {:<36} {:<24} {}",
        "Volume ID", "PV", "Owner", "New Volume", "Result"
    );
    for v in &summary.volumes {
        let owner = v.owner.as_ref().map(|o| o.to_string()).unwrap_or_else(|| "-".to_string());
        let mut result = outcome_text(&v.outcome);
        if v.owner_left_paused {
            result.push_str(" (owner left at 0 replicas)");
        }
        let _ = writeln!(
            out,
            "{:<24} {:<32} {:<36} {:<24} {}",
            v.volume_id,
            v.pv_name,
            owner,
            v.new_volume_id.as_deref().unwrap_or("-"),
            result
        );
    }
    let _ = writeln!(
        out,
        "\nSucceeded: {}  Failed: {}  Incomplete: {}  Manual resume: {}  Unsupported: {}",
        summary.count(|o| matches!(o, VolumeOutcome::Succeeded)),
        summary.count(|o| matches!(o, VolumeOutcome::Failed(_))),
        summary.count(|o| matches!(o, VolumeOutcome::Incomplete(_) | VolumeOutcome::Aborted)),
        summary.count(|o| matches!(o, VolumeOutcome::ManualResumeRequired(_))),
        summary.count(|o| matches!(o, VolumeOutcome::Unsupported(_))),
    );
    out
}
