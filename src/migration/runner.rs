/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/migration/runner.rs
*
* Orchestrates a migration run across many volumes.
*
* Volumes are grouped by the owner that has to be paused for them. Groups run
* concurrently (bounded by the configured concurrency); volumes inside a group
* run one after another so two volumes of the same StatefulSet never scale it
* independently. For each group:
* 1. The owner is scaled to zero once and PauseOwner is recorded for every
*    volume of the group, together with the original replica count.
* 2. Each volume is driven through the encrypt-and-swap sequence.
* 3. If no volume stopped mid-rebind, timed out or was aborted, the owner is
*    scaled back once and ResumeOwner is recorded for every rebound volume.
*    Otherwise the owner is left paused and the run reports it.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::machine::{run_to_rebind, MigrationContext, VolumeProgress};
use super::retry::retry_with_backoff;
use super::state::{MigrationState, MigrationStatus, MigrationStep};
use crate::error::Result;
use crate::model::{MigrationPlan, OwnerRef, VolumeRecord};
use crate::resolver::PlanSet;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "detail")]
pub enum VolumeOutcome {
    Succeeded,
    Failed(String),
    /// Stopped before `step`; the next run continues from there.
    Incomplete(MigrationStep),
    Aborted,
    ManualResumeRequired(String),
    Unsupported(String),
}

impl VolumeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, VolumeOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReport {
    pub volume_id: String,
    pub pv_name: String,
    pub owner: Option<OwnerRef>,
    pub new_volume_id: Option<String>,
    pub outcome: VolumeOutcome,
    /// The owner was scaled down and deliberately not scaled back up.
    pub owner_left_paused: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationSummary {
    pub volumes: Vec<VolumeReport>,
}

impl MigrationSummary {
    pub fn all_succeeded(&self) -> bool {
        self.volumes.iter().all(|v| v.outcome.is_success())
    }

    pub fn count(&self, pred: impl Fn(&VolumeOutcome) -> bool) -> usize {
        self.volumes.iter().filter(|v| pred(&v.outcome)).count()
    }
}

struct Slot {
    plan: MigrationPlan,
    state: MigrationState,
    outcome: Option<VolumeOutcome>,
}

impl Slot {
    fn report(self, owner_left_paused: bool) -> VolumeReport {
        let outcome = self
            .outcome
            .unwrap_or_else(|| VolumeOutcome::Failed("migration did not finish".to_string()));
        VolumeReport {
            volume_id: self.plan.volume.volume_id,
            pv_name: self.plan.volume.pv_name,
            owner: self.state.owner,
            new_volume_id: self.state.new_volume_id,
            outcome,
            owner_left_paused,
        }
    }
}

/// A volume whose rebind started in an earlier run. Its PV may be gone or
/// already point at the encrypted volume, so discovery no longer lists it and
/// the plan is rebuilt from its record.
fn plan_from_state(state: &MigrationState) -> MigrationPlan {
    MigrationPlan {
        volume: VolumeRecord {
            volume_id: state.volume_id.clone(),
            encrypted: false,
            availability_zone: state.availability_zone.clone(),
            pv_name: state.pv_name.clone(),
            claim: state.claim.clone(),
        },
        volume_index: usize::MAX,
        mounts: Vec::new(),
        owner: state.owner.clone(),
        original_replicas: state.original_replicas,
    }
}

pub struct MigrationRunner {
    ctx: MigrationContext,
    concurrency: usize,
}

impl MigrationRunner {
    pub fn new(ctx: MigrationContext, concurrency: usize) -> Self {
        Self {
            ctx,
            concurrency: concurrency.max(1),
        }
    }

    /// Migrates the planned volumes, restricted to `selection` when it is not
    /// empty. Every selected volume gets exactly one report.
    pub async fn run(&self, set: PlanSet, selection: &[String]) -> Result<MigrationSummary> {
        let selected = |id: &str| selection.is_empty() || selection.iter().any(|s| s == id);
        let mut reports = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for unsupported in set.unsupported.iter().filter(|u| selected(&u.volume.volume_id)) {
            seen.insert(unsupported.volume.volume_id.clone());
            reports.push(VolumeReport {
                volume_id: unsupported.volume.volume_id.clone(),
                pv_name: unsupported.volume.pv_name.clone(),
                owner: unsupported.owners.first().cloned(),
                new_volume_id: None,
                outcome: VolumeOutcome::Unsupported(unsupported.reason.clone()),
                owner_left_paused: false,
            });
        }

        let mut slots = Vec::new();
        for plan in set.plans.into_iter().filter(|p| selected(p.volume_id())) {
            seen.insert(plan.volume_id().to_string());
            let state = match self.ctx.store.load(plan.volume_id()).await? {
                Some(state) => state,
                None => MigrationState::new(&plan),
            };
            slots.push(Slot {
                plan,
                state,
                outcome: None,
            });
        }

        for state in self.ctx.store.list().await? {
            if seen.contains(&state.volume_id) || !selected(&state.volume_id) {
                continue;
            }
            if state.status != MigrationStatus::Succeeded && state.has_completed(MigrationStep::CreateVolume) {
                info!(volume_id = %state.volume_id, "Resuming a volume whose rebind started in an earlier run");
                seen.insert(state.volume_id.clone());
                slots.push(Slot {
                    plan: plan_from_state(&state),
                    state,
                    outcome: None,
                });
            }
        }

        for id in selection.iter().filter(|id| !seen.contains(*id)) {
            reports.push(self.report_unplanned(id).await?);
        }

        let order: HashMap<String, usize> = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (slot.plan.volume_id().to_string(), i))
            .collect();

        let groups = group_slots(slots);
        info!("Migrating {} owner group(s), {} at a time", groups.len(), self.concurrency);

        let mut migrated: Vec<VolumeReport> = stream::iter(groups)
            .map(|(owner, slots)| self.run_group(owner, slots))
            .buffer_unordered(self.concurrency)
            .collect::<Vec<Vec<VolumeReport>>>()
            .await
            .into_iter()
            .flatten()
            .collect();
        migrated.sort_by_key(|r| order.get(&r.volume_id).copied().unwrap_or(usize::MAX));

        migrated.extend(reports);
        Ok(MigrationSummary { volumes: migrated })
    }

    async fn report_unplanned(&self, volume_id: &str) -> Result<VolumeReport> {
        let state = self.ctx.store.load(volume_id).await?;
        let (pv_name, owner, new_volume_id, outcome) = match state {
            Some(s) if s.status == MigrationStatus::Succeeded => {
                (s.pv_name, s.owner, s.new_volume_id, VolumeOutcome::Succeeded)
            }
            Some(s) => {
                let reason = s
                    .last_error
                    .unwrap_or_else(|| "the volume is no longer an unencrypted EBS volume of this cluster".into());
                (s.pv_name, s.owner, s.new_volume_id, VolumeOutcome::Failed(reason))
            }
            None => (
                String::new(),
                None,
                None,
                VolumeOutcome::Failed("not an unencrypted EBS volume of this cluster".into()),
            ),
        };
        Ok(VolumeReport {
            volume_id: volume_id.to_string(),
            pv_name,
            owner,
            new_volume_id,
            outcome,
            owner_left_paused: false,
        })
    }

    async fn run_group(&self, owner: Option<OwnerRef>, mut slots: Vec<Slot>) -> Vec<VolumeReport> {
        let left_paused = match self.drive_group(owner.as_ref(), &mut slots).await {
            Ok(left_paused) => left_paused,
            Err(e) => {
                error!(error = %e, "Migration state could not be persisted; stopping this group");
                for slot in slots.iter_mut().filter(|s| s.outcome.is_none()) {
                    slot.outcome = Some(VolumeOutcome::Failed(e.to_string()));
                }
                owner.is_some()
            }
        };
        slots.into_iter().map(|slot| slot.report(left_paused)).collect()
    }

    /// Returns whether the owner was left paused.
    async fn drive_group(&self, owner: Option<&OwnerRef>, slots: &mut [Slot]) -> Result<bool> {
        for slot in slots.iter_mut() {
            let state = &mut slot.state;
            if state.status == MigrationStatus::Succeeded {
                slot.outcome = Some(VolumeOutcome::Succeeded);
            } else if !state.reopen() {
                let reason = state.last_error.clone().unwrap_or_else(|| "failed in an earlier run".into());
                warn!(volume_id = %state.volume_id, "Skipping volume that failed permanently: {}", reason);
                slot.outcome = Some(VolumeOutcome::Failed(reason));
            } else if !state.has_completed(MigrationStep::PauseOwner) {
                state.owner = owner.cloned();
            }
        }
        if slots.iter().all(|s| s.outcome.is_some()) {
            return Ok(false);
        }

        if self.ctx.abort.is_requested() {
            for slot in slots.iter_mut().filter(|s| s.outcome.is_none()) {
                slot.outcome = Some(VolumeOutcome::Aborted);
            }
            return Ok(false);
        }

        match owner {
            Some(owner) => {
                if let Some(message) = self.pause_owner(owner, slots).await? {
                    for slot in slots.iter_mut().filter(|s| s.outcome.is_none()) {
                        slot.state.fail(&message, true);
                        self.ctx.store.save(&slot.state).await?;
                        slot.outcome = Some(VolumeOutcome::Failed(message.clone()));
                    }
                    return Ok(false);
                }
            }
            None => {
                for slot in slots.iter_mut().filter(|s| s.outcome.is_none()) {
                    if slot.state.next_step() == Some(MigrationStep::PauseOwner) {
                        slot.state.advance(MigrationStep::PauseOwner, |s| s.original_replicas = None)?;
                        self.ctx.store.save(&slot.state).await?;
                    }
                }
            }
        }

        let original = slots
            .iter()
            .filter(|s| s.outcome.is_none())
            .find(|s| s.state.has_completed(MigrationStep::PauseOwner))
            .and_then(|s| s.state.original_replicas);

        let mut blocked = false;
        for slot in slots.iter_mut().filter(|s| s.outcome.is_none()) {
            let progress = run_to_rebind(&self.ctx, &mut slot.state).await?;
            match progress {
                VolumeProgress::Rebound => {}
                VolumeProgress::Failed => {
                    let reason = slot.state.last_error.clone().unwrap_or_default();
                    // A failed rebind may have removed the claim already.
                    if slot.state.last_completed == Some(MigrationStep::CreateVolume) {
                        blocked = true;
                    }
                    slot.outcome = Some(VolumeOutcome::Failed(reason));
                }
                VolumeProgress::Incomplete(step) => {
                    blocked = true;
                    slot.outcome = Some(VolumeOutcome::Incomplete(step));
                }
                VolumeProgress::Aborted => {
                    blocked = true;
                    slot.outcome = Some(VolumeOutcome::Aborted);
                }
            }
        }

        if blocked {
            if let Some(owner) = owner {
                warn!(owner = %owner, "Leaving owner scaled to zero; rerun the migration to finish it");
            }
            for slot in slots.iter_mut().filter(|s| s.outcome.is_none()) {
                slot.outcome = Some(VolumeOutcome::Incomplete(MigrationStep::ResumeOwner));
            }
            return Ok(owner.is_some());
        }

        let resumed = match owner {
            Some(owner) => self.resume_owner(owner, original).await,
            None => Ok(()),
        };

        for slot in slots.iter_mut().filter(|s| s.outcome.is_none()) {
            match &resumed {
                Ok(()) => {
                    slot.state.advance(MigrationStep::ResumeOwner, |_| {})?;
                    info!(
                        volume_id = %slot.state.volume_id,
                        new_volume_id = ?slot.state.new_volume_id,
                        "Migration complete"
                    );
                    slot.outcome = Some(VolumeOutcome::Succeeded);
                }
                Err(message) => {
                    slot.state.require_manual_resume(message);
                    slot.outcome = Some(VolumeOutcome::ManualResumeRequired(message.clone()));
                }
            }
            self.ctx.store.save(&slot.state).await?;
        }
        Ok(false)
    }

    /// Scales `owner` to zero unless it already is, and records PauseOwner for
    /// every volume of the group that has not recorded it yet. Returns the
    /// failure message when the owner could not be paused.
    async fn pause_owner(&self, owner: &OwnerRef, slots: &mut [Slot]) -> Result<Option<String>> {
        if slots
            .iter()
            .filter(|s| s.outcome.is_none())
            .all(|s| s.state.has_completed(MigrationStep::RebindClaim))
        {
            return Ok(None);
        }
        let recorded = slots
            .iter()
            .filter(|s| s.outcome.is_none())
            .find(|s| s.state.has_completed(MigrationStep::PauseOwner))
            .map(|s| s.state.original_replicas);

        let current = match retry_with_backoff(&self.ctx.retry, "read replicas", || {
            self.ctx.cluster.get_replicas(owner)
        })
        .await
        {
            Ok(current) => current,
            Err(e) => return Ok(Some(format!("Failed to read replicas of {}: {}", owner, e))),
        };

        let original = match recorded.flatten() {
            Some(original) => {
                if current > 0 {
                    warn!(owner = %owner, current, "Owner was scaled up since it was paused; pausing it again");
                }
                Some(original)
            }
            None if current > 0 => Some(current),
            None => {
                info!(owner = %owner, "Owner is already scaled to zero");
                None
            }
        };

        if current > 0 {
            info!(owner = %owner, from = current, "Scaling owner to zero");
            if let Err(e) = retry_with_backoff(&self.ctx.retry, "scale down", || self.ctx.cluster.scale(owner, 0)).await
            {
                return Ok(Some(format!("Failed to scale {} to zero: {}", owner, e)));
            }
        }

        for slot in slots.iter_mut().filter(|s| s.outcome.is_none()) {
            if slot.state.next_step() == Some(MigrationStep::PauseOwner) {
                slot.state.advance(MigrationStep::PauseOwner, |s| s.original_replicas = original)?;
                self.ctx.store.save(&slot.state).await?;
            } else if slot.state.original_replicas.is_none() && original.is_some() {
                // Paused at zero earlier, scaled up since: restore to the new count.
                slot.state.original_replicas = original;
                self.ctx.store.save(&slot.state).await?;
            }
        }
        Ok(None)
    }

    async fn resume_owner(&self, owner: &OwnerRef, original: Option<i32>) -> std::result::Result<(), String> {
        let Some(replicas) = original else {
            warn!(owner = %owner, "No original replica count recorded; leaving owner at zero");
            return Ok(());
        };

        info!(owner = %owner, replicas, "Scaling owner back up");
        retry_with_backoff(&self.ctx.retry, "scale up", || self.ctx.cluster.scale(owner, replicas))
            .await
            .map_err(|e| format!("Failed to scale {} back to {} replicas: {}", owner, replicas, e))
    }
}

/// Groups slots by the owner to pause. A recorded pause wins over the plan,
/// since a paused owner has no running pods left to resolve it from. Volumes
/// without an owner each get their own group.
fn group_slots(slots: Vec<Slot>) -> Vec<(Option<OwnerRef>, Vec<Slot>)> {
    let mut owned: BTreeMap<OwnerRef, Vec<Slot>> = BTreeMap::new();
    let mut groups = Vec::new();

    for slot in slots {
        let owner = if slot.state.has_completed(MigrationStep::PauseOwner) {
            slot.state.owner.clone()
        } else {
            slot.plan.owner.clone()
        };
        match owner {
            Some(owner) => owned.entry(owner).or_default().push(slot),
            None => groups.push((None, vec![slot])),
        }
    }

    let mut all: Vec<(Option<OwnerRef>, Vec<Slot>)> = owned.into_iter().map(|(o, s)| (Some(o), s)).collect();
    all.extend(groups);
    all
}
