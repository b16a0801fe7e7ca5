/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/progress.rs
*
* Progress tracking for batches of in-flight snapshots. `poll_progress` is a
* single query per snapshot with no retry; `wait_for_snapshots` layers a
* bounded poll loop on top of it and returns `Incomplete` once the configured
* maximum wait has elapsed.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::cloud::BlockStorage;
use crate::config::WaitPolicy;
use crate::error::{Error, Result};
use crate::model::SnapshotState;
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotProgress {
    pub snapshot_id: String,
    pub percent: u8,
    pub state: SnapshotState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    pub per_snapshot: Vec<SnapshotProgress>,
    pub average_percent: f64,
}

impl ProgressReport {
    pub fn all_completed(&self) -> bool {
        self.per_snapshot.iter().all(|s| s.state == SnapshotState::Completed)
    }

    pub fn errored(&self) -> Vec<String> {
        self.per_snapshot
            .iter()
            .filter(|s| s.state == SnapshotState::Error)
            .map(|s| s.snapshot_id.clone())
            .collect()
    }
}

/// Queries the state of every snapshot in the batch once.
pub async fn poll_progress(cloud: &dyn BlockStorage, snapshot_ids: &[String]) -> Result<ProgressReport> {
    if snapshot_ids.is_empty() {
        return Err(Error::EmptyBatch);
    }

    let mut per_snapshot = Vec::with_capacity(snapshot_ids.len());
    for id in snapshot_ids {
        let record = cloud.describe_snapshot(id).await?;
        debug!(snapshot_id = %id, progress = record.progress_percent, state = %record.state, "Polled snapshot");
        per_snapshot.push(SnapshotProgress {
            snapshot_id: id.clone(),
            percent: record.progress_percent,
            state: record.state,
        });
    }

    let total: u32 = per_snapshot.iter().map(|s| u32::from(s.percent)).sum();
    let average_percent = f64::from(total) / per_snapshot.len() as f64;

    Ok(ProgressReport {
        per_snapshot,
        average_percent,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Completed(ProgressReport),
    /// At least one snapshot reached the `error` state.
    Errored {
        snapshot_ids: Vec<String>,
        report: ProgressReport,
    },
    /// The maximum wait elapsed before every snapshot completed.
    Incomplete(ProgressReport),
}

/// Polls the batch until every snapshot completes, one errors, or
/// `policy.max_wait` elapses.
pub async fn wait_for_snapshots(
    cloud: &dyn BlockStorage,
    snapshot_ids: &[String],
    policy: &WaitPolicy,
) -> Result<WaitOutcome> {
    let deadline = policy.deadline()?;

    loop {
        let report = poll_progress(cloud, snapshot_ids).await?;
        info!("Snapshot progress: {:.1}%", report.average_percent);

        let errored = report.errored();
        if !errored.is_empty() {
            return Ok(WaitOutcome::Errored {
                snapshot_ids: errored,
                report,
            });
        }
        if report.all_completed() {
            return Ok(WaitOutcome::Completed(report));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(WaitOutcome::Incomplete(report));
        }
        sleep(policy.poll_interval.min(deadline - now)).await;
    }
}
