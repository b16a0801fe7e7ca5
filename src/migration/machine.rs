/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/migration/machine.rs
*
* The encrypt-and-swap sequence for a single volume, from SnapshotSource to
* RebindClaim. Pausing and resuming the owner are owner-group operations and
* live in the runner.
*
* Every step follows the same shape:
* 1. Issue the cloud or cluster call.
* 2. Record the returned identifier and advance the state.
* 3. Persist the state before moving on.
* Cloud failures never raise past this module: they mark the state Failed and
* stop the sequence for this volume only. Only persistence errors propagate.
*
* The source snapshot is only taken once no running pod mounts the claim and
* EC2 reports the volume `available`. The rebind works from replacement
* manifests that are recorded before the original PV and claim are deleted.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::state::{MigrationState, MigrationStep};
use super::store::StateStore;
use crate::cloud::{provenance_tags, BlockStorage, CreateVolumeRequest, SOURCE_VOLUME_TAG};
use crate::cluster::{prepare_rebind, ClusterApi};
use crate::config::{RetryPolicy, WaitPolicy};
use crate::error::{Error, Result};
use crate::progress::{wait_for_snapshots, WaitOutcome};
use crate::resolver::pods_mounting_claim;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Operator request to stop issuing new steps. Calls already sent are left to
/// finish server-side.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Collaborators and policies shared by every migration in a run.
#[derive(Clone)]
pub struct MigrationContext {
    pub cloud: Arc<dyn BlockStorage>,
    pub cluster: Arc<dyn ClusterApi>,
    pub store: Arc<dyn StateStore>,
    pub wait: WaitPolicy,
    pub retry: RetryPolicy,
    pub volume_type: String,
    pub abort: AbortSignal,
}

/// Where the sequence stopped for one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeProgress {
    /// The claim now points at the encrypted volume; only the resume is left.
    Rebound,
    Failed,
    /// A wait hit its deadline; the step is retried on the next run.
    Incomplete(MigrationStep),
    Aborted,
}

enum Flow {
    Continue,
    Stop(VolumeProgress),
}

pub fn snapshot_description(volume_id: &str, info: &str) -> String {
    format!("A snapshot of volume: {}.\n\nAdditional information: {}", volume_id, info)
}

pub fn copy_description(snapshot_id: &str, info: &str) -> String {
    format!("A copy of snapshot: {}.\n\nAdditional information: {}", snapshot_id, info)
}

fn additional_info(state: &MigrationState) -> String {
    match &state.claim {
        Some(claim) => format!("PV {} bound to PVC {}", state.pv_name, claim),
        None => format!("PV {}", state.pv_name),
    }
}

fn recorded(id: &Option<String>, what: &str, state: &MigrationState) -> Result<String> {
    id.clone().ok_or_else(|| {
        Error::Malformed(format!(
            "state of {} is at {:?} but has no {} recorded",
            state.volume_id, state.last_completed, what
        ))
    })
}

/// Drives `state` from its next step up to and including RebindClaim.
///
/// PauseOwner must already be recorded.
pub async fn run_to_rebind(ctx: &MigrationContext, state: &mut MigrationState) -> Result<VolumeProgress> {
    while let Some(step) = state.next_step() {
        if step == MigrationStep::ResumeOwner {
            break;
        }
        if step == MigrationStep::PauseOwner {
            return Err(Error::StepOrder {
                volume_id: state.volume_id.clone(),
                last: state.last_completed,
                attempted: MigrationStep::SnapshotSource,
            });
        }
        if ctx.abort.is_requested() {
            warn!(volume_id = %state.volume_id, next = %step, "Abort requested; stopping before next step");
            return Ok(VolumeProgress::Aborted);
        }

        let flow = match step {
            MigrationStep::SnapshotSource => match wait_detached(ctx, state).await? {
                Flow::Continue => snapshot_source(ctx, state).await?,
                stop => stop,
            },
            MigrationStep::WaitSnapshotReady | MigrationStep::WaitCopyReady => wait_ready(ctx, state, step).await?,
            MigrationStep::EncryptCopy => encrypt_copy(ctx, state).await?,
            MigrationStep::CreateVolume => create_volume(ctx, state).await?,
            MigrationStep::RebindClaim => rebind_claim(ctx, state).await?,
            MigrationStep::PauseOwner | MigrationStep::ResumeOwner => Flow::Continue,
        };
        if let Flow::Stop(progress) = flow {
            return Ok(progress);
        }
    }
    Ok(VolumeProgress::Rebound)
}

async fn fail(
    ctx: &MigrationContext,
    state: &mut MigrationState,
    message: String,
    retryable: bool,
) -> Result<Flow> {
    error!(volume_id = %state.volume_id, pv = %state.pv_name, "{}", message);
    state.fail(message, retryable);
    ctx.store.save(state).await?;
    Ok(Flow::Stop(VolumeProgress::Failed))
}

/// Describes what still holds the source volume, or `None` once it is free.
async fn detach_blocker(ctx: &MigrationContext, state: &MigrationState) -> Result<Option<String>> {
    if let Some(claim) = &state.claim {
        let pods = ctx.cluster.list_running_pods().await?;
        let mounting = pods_mounting_claim(&pods, claim)?;
        if !mounting.is_empty() {
            return Ok(Some(format!("is mounted by pod(s) {}", mounting.join(", "))));
        }
    }
    let volume = ctx.cloud.describe_volume(&state.volume_id).await?;
    match volume.state.as_deref() {
        Some("available") => Ok(None),
        Some(other) => Ok(Some(format!("is {}", other))),
        None => Ok(Some("has no reported state".to_string())),
    }
}

/// Polls until the source volume is detached, bounded by the wait policy.
async fn wait_detached(ctx: &MigrationContext, state: &mut MigrationState) -> Result<Flow> {
    let deadline = ctx.wait.deadline()?;
    loop {
        let blocker = match detach_blocker(ctx, state).await {
            Ok(None) => return Ok(Flow::Continue),
            Ok(Some(blocker)) => blocker,
            Err(e) => {
                let message = format!("Failed to check that volume {} is detached: {}", state.volume_id, e);
                return fail(ctx, state, message, true).await;
            }
        };

        let now = Instant::now();
        if now >= deadline {
            let message = format!(
                "Volume {} {} after {:?}; it is not snapshotted while in use",
                state.volume_id, blocker, ctx.wait.max_wait
            );
            warn!(volume_id = %state.volume_id, "{}", message);
            state.note(message);
            ctx.store.save(state).await?;
            return Ok(Flow::Stop(VolumeProgress::Incomplete(MigrationStep::SnapshotSource)));
        }
        if ctx.abort.is_requested() {
            warn!(volume_id = %state.volume_id, "Abort requested while waiting for the volume to detach");
            return Ok(Flow::Stop(VolumeProgress::Aborted));
        }
        debug!(volume_id = %state.volume_id, "Volume {}; waiting for it to detach", blocker);
        sleep(ctx.wait.poll_interval.min(deadline - now)).await;
    }
}

async fn snapshot_source(ctx: &MigrationContext, state: &mut MigrationState) -> Result<Flow> {
    let volume_id = state.volume_id.clone();
    let description = snapshot_description(&volume_id, &additional_info(state));
    let tags = provenance_tags("create_ebs_snapshot", ("volume", &volume_id), &volume_id);

    match ctx.cloud.create_snapshot(&volume_id, &description, &tags).await {
        Ok(snapshot_id) => {
            info!(volume_id = %volume_id, snapshot_id = %snapshot_id, "Created snapshot of source volume");
            state.advance(MigrationStep::SnapshotSource, |s| s.snapshot_id = Some(snapshot_id))?;
            ctx.store.save(state).await?;
            Ok(Flow::Continue)
        }
        Err(e) => fail(ctx, state, format!("Failed to create snapshot of {}: {}", volume_id, e), true).await,
    }
}

async fn wait_ready(ctx: &MigrationContext, state: &mut MigrationState, step: MigrationStep) -> Result<Flow> {
    let snapshot_id = if step == MigrationStep::WaitSnapshotReady {
        recorded(&state.snapshot_id, "snapshot", state)?
    } else {
        recorded(&state.encrypted_snapshot_id, "encrypted snapshot", state)?
    };
    info!(volume_id = %state.volume_id, snapshot_id = %snapshot_id, "Waiting for snapshot to complete");

    match wait_for_snapshots(ctx.cloud.as_ref(), std::slice::from_ref(&snapshot_id), &ctx.wait).await {
        Ok(WaitOutcome::Completed(_)) => {
            state.advance(step, |_| {})?;
            ctx.store.save(state).await?;
            Ok(Flow::Continue)
        }
        Ok(WaitOutcome::Errored { .. }) => {
            fail(
                ctx,
                state,
                format!("Snapshot {} ended in the error state", snapshot_id),
                false,
            )
            .await
        }
        Ok(WaitOutcome::Incomplete(report)) => {
            let message = format!(
                "Snapshot {} still at {:.0}% after {:?}",
                snapshot_id, report.average_percent, ctx.wait.max_wait
            );
            warn!(volume_id = %state.volume_id, "{}", message);
            state.note(message);
            ctx.store.save(state).await?;
            Ok(Flow::Stop(VolumeProgress::Incomplete(step)))
        }
        Err(e) => fail(ctx, state, format!("Failed to poll snapshot {}: {}", snapshot_id, e), true).await,
    }
}

async fn encrypt_copy(ctx: &MigrationContext, state: &mut MigrationState) -> Result<Flow> {
    let snapshot_id = recorded(&state.snapshot_id, "snapshot", state)?;
    let description = copy_description(&snapshot_id, &additional_info(state));
    let tags = provenance_tags("encrypt_ebs_snapshot", ("snapshot", &snapshot_id), &state.volume_id);

    match ctx.cloud.copy_snapshot(&snapshot_id, &description, &tags).await {
        Ok(copy_id) => {
            info!(volume_id = %state.volume_id, snapshot_id = %snapshot_id, encrypted_snapshot_id = %copy_id, "Started encrypted snapshot copy");
            state.advance(MigrationStep::EncryptCopy, |s| s.encrypted_snapshot_id = Some(copy_id))?;
            ctx.store.save(state).await?;
            Ok(Flow::Continue)
        }
        Err(e) => {
            let message = format!(
                "Failed to copy snapshot {} with encryption: {}. The unencrypted snapshot is kept for recovery",
                snapshot_id, e
            );
            fail(ctx, state, message, true).await
        }
    }
}

async fn create_volume(ctx: &MigrationContext, state: &mut MigrationState) -> Result<Flow> {
    let encrypted_snapshot_id = recorded(&state.encrypted_snapshot_id, "encrypted snapshot", state)?;
    let request = CreateVolumeRequest {
        snapshot_id: encrypted_snapshot_id.clone(),
        availability_zone: state.availability_zone.clone(),
        volume_type: ctx.volume_type.clone(),
        tags: provenance_tags(
            "create_ebs_volume_from_snapshot",
            ("snapshot", &encrypted_snapshot_id),
            &state.volume_id,
        ),
    };

    match ctx.cloud.create_volume(&request).await {
        Ok(new_volume_id) => {
            info!(
                volume_id = %state.volume_id,
                new_volume_id = %new_volume_id,
                zone = %state.availability_zone,
                "Created encrypted volume"
            );
            state.advance(MigrationStep::CreateVolume, |s| s.new_volume_id = Some(new_volume_id))?;
            ctx.store.save(state).await?;
            Ok(Flow::Continue)
        }
        Err(e) => {
            let message = format!("Failed to create volume from snapshot {}: {}", encrypted_snapshot_id, e);
            fail(ctx, state, message, true).await
        }
    }
}

async fn rebind_claim(ctx: &MigrationContext, state: &mut MigrationState) -> Result<Flow> {
    let new_volume_id = recorded(&state.new_volume_id, "new volume", state)?;

    match ctx.cloud.describe_volume(&new_volume_id).await {
        Ok(volume) if volume.encrypted => {}
        Ok(_) => {
            let message = format!("Volume {} was created without encryption; refusing to rebind", new_volume_id);
            return fail(ctx, state, message, false).await;
        }
        Err(e) => {
            let message = format!("Failed to describe new volume {}: {}", new_volume_id, e);
            return fail(ctx, state, message, true).await;
        }
    }

    let manifests = match state.rebind.clone() {
        Some(manifests) => {
            info!(pv = %state.pv_name, "Finishing rebind from the recorded manifests");
            manifests
        }
        None => match prepare_rebind(ctx.cluster.as_ref(), &state.pv_name, &new_volume_id).await {
            Ok(manifests) => {
                state.rebind = Some(manifests.clone());
                ctx.store.save(state).await?;
                manifests
            }
            Err(e) => {
                let message = format!("Failed to read PV {} for rebind: {}", state.pv_name, e);
                return fail(ctx, state, message, true).await;
            }
        },
    };

    match ctx.cluster.rebind_volume(&manifests).await {
        Ok(()) => {
            info!(
                pv = %state.pv_name,
                old_volume_id = %state.volume_id,
                new_volume_id = %new_volume_id,
                "Rebound PV to encrypted volume"
            );
            state.advance(MigrationStep::RebindClaim, |_| {})?;
            ctx.store.save(state).await?;
            Ok(Flow::Continue)
        }
        Err(e) => {
            let message = format!(
                "Failed to rebind PV {} to {}: {}. The replacement PV and claim are recorded and a rerun \
                 finishes the rebind; volume {} (tag {}={}) holds the encrypted data",
                state.pv_name, new_volume_id, e, new_volume_id, SOURCE_VOLUME_TAG, state.volume_id
            );
            fail(ctx, state, message, true).await
        }
    }
}
