/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/migration/state.rs
*
* The per-volume migration record. Steps are recorded strictly in order and
* each one carries the identifier it produced, so a rerun can pick up from the
* last completed step without repeating a create call.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::cluster::manifest::RebindManifests;
use crate::error::{Error, Result};
use crate::model::{ClaimRef, MigrationPlan, OwnerRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MigrationStep {
    PauseOwner,
    SnapshotSource,
    WaitSnapshotReady,
    EncryptCopy,
    WaitCopyReady,
    CreateVolume,
    RebindClaim,
    ResumeOwner,
}

impl MigrationStep {
    pub const ALL: [MigrationStep; 8] = [
        MigrationStep::PauseOwner,
        MigrationStep::SnapshotSource,
        MigrationStep::WaitSnapshotReady,
        MigrationStep::EncryptCopy,
        MigrationStep::WaitCopyReady,
        MigrationStep::CreateVolume,
        MigrationStep::RebindClaim,
        MigrationStep::ResumeOwner,
    ];

    /// The step that follows `last`, or the first step when nothing is recorded.
    pub fn after(last: Option<MigrationStep>) -> Option<MigrationStep> {
        match last {
            None => Some(MigrationStep::PauseOwner),
            Some(step) => {
                let idx = Self::ALL.iter().position(|s| *s == step)?;
                Self::ALL.get(idx + 1).copied()
            }
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    InProgress,
    Succeeded,
    Failed,
    /// Everything but the final scale-up succeeded.
    ManualResumeRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    pub volume_id: String,
    pub pv_name: String,
    pub availability_zone: String,
    pub claim: Option<ClaimRef>,
    pub owner: Option<OwnerRef>,
    pub last_completed: Option<MigrationStep>,
    pub status: MigrationStatus,
    pub snapshot_id: Option<String>,
    pub encrypted_snapshot_id: Option<String>,
    pub new_volume_id: Option<String>,
    /// Replacement PV and claim, recorded before the originals are deleted.
    #[serde(default)]
    pub rebind: Option<RebindManifests>,
    /// Replica count the owner is restored to. `None` when the owner was
    /// already at zero when it was paused.
    pub original_replicas: Option<i32>,
    pub last_error: Option<String>,
    /// Whether a failed migration may be resumed by a later run.
    pub retryable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationState {
    pub fn new(plan: &MigrationPlan) -> Self {
        let now = Utc::now();
        Self {
            volume_id: plan.volume.volume_id.clone(),
            pv_name: plan.volume.pv_name.clone(),
            availability_zone: plan.volume.availability_zone.clone(),
            claim: plan.volume.claim.clone(),
            owner: plan.owner.clone(),
            last_completed: None,
            status: MigrationStatus::InProgress,
            snapshot_id: None,
            encrypted_snapshot_id: None,
            new_volume_id: None,
            rebind: None,
            original_replicas: None,
            last_error: None,
            retryable: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn next_step(&self) -> Option<MigrationStep> {
        MigrationStep::after(self.last_completed)
    }

    pub fn has_completed(&self, step: MigrationStep) -> bool {
        self.last_completed.is_some_and(|last| last >= step)
    }

    /// Records `step` as completed after applying `record` to the state.
    ///
    /// Fails with `StepOrder`, leaving the state untouched, unless `step` is
    /// exactly the next step.
    pub fn advance(&mut self, step: MigrationStep, record: impl FnOnce(&mut Self)) -> Result<()> {
        if self.next_step() != Some(step) {
            return Err(Error::StepOrder {
                volume_id: self.volume_id.clone(),
                last: self.last_completed,
                attempted: step,
            });
        }
        record(self);
        self.last_completed = Some(step);
        self.last_error = None;
        self.status = if step == MigrationStep::ResumeOwner {
            MigrationStatus::Succeeded
        } else {
            MigrationStatus::InProgress
        };
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, error: impl fmt::Display, retryable: bool) {
        self.status = MigrationStatus::Failed;
        self.last_error = Some(error.to_string());
        self.retryable = retryable;
        self.updated_at = Utc::now();
    }

    /// Notes a problem that leaves the migration resumable as-is.
    pub fn note(&mut self, error: impl fmt::Display) {
        self.last_error = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    pub fn require_manual_resume(&mut self, error: impl fmt::Display) {
        self.status = MigrationStatus::ManualResumeRequired;
        self.last_error = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    /// Reopens a retryable failed state for another run.
    pub fn reopen(&mut self) -> bool {
        match self.status {
            MigrationStatus::Failed if !self.retryable => false,
            MigrationStatus::Succeeded => false,
            _ => {
                self.status = MigrationStatus::InProgress;
                self.retryable = true;
                true
            }
        }
    }
}
