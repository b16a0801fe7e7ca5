/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/cloud/mod.rs
*
* This module defines the contract for the block-storage provider. The
* migration pipeline only ever talks to a `BlockStorage`; the AWS
* implementation lives in `aws.rs` and tests plug in an in-memory double.
*
* Every mutating call takes a set of provenance tags. They are the audit trail
* that lets an operator find snapshots and volumes created by this tool even if
* the local migration state is lost.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::model::SnapshotRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

pub mod aws;

pub const CREATED_BY: &str = "pv_encrypter";
pub const SOURCE_VOLUME_TAG: &str = "source_volume";

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("{resource} '{id}' was not found")]
    NotFound { resource: &'static str, id: String },

    #[error("{operation} was rejected for '{id}': {message}")]
    Rejected {
        operation: &'static str,
        id: String,
        message: String,
    },

    #[error("Failed to invoke the cloud provider: {0}")]
    Invocation(String),

    #[error("Unexpected response from the cloud provider: {0}")]
    Parse(String),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The standard tag set applied to every resource created by this tool.
///
/// `reference` names the resource the new one was derived from, e.g.
/// `("volume", "vol-123")` for a snapshot or `("snapshot", "snap-1")` for a copy.
pub fn provenance_tags(
    source_function: &str,
    reference: (&str, &str),
    source_volume: &str,
) -> Vec<Tag> {
    let mut tags = vec![
        Tag::new("created_by", CREATED_BY),
        Tag::new("source_function", source_function),
        Tag::new(reference.0, reference.1),
    ];
    if reference != (SOURCE_VOLUME_TAG, source_volume) {
        tags.push(Tag::new(SOURCE_VOLUME_TAG, source_volume));
    }
    tags
}

/// The subset of a volume description used by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeDescription {
    pub volume_id: String,
    pub encrypted: bool,
    pub availability_zone: String,
    pub volume_type: Option<String>,
    pub size_gib: Option<i64>,
    pub state: Option<String>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateVolumeRequest {
    pub snapshot_id: String,
    pub availability_zone: String,
    pub volume_type: String,
    pub tags: Vec<Tag>,
}

/// The block-storage operations the pipeline relies on.
///
/// Copies and new volumes are always requested with encryption enabled, and
/// copies always stay in the configured region.
#[async_trait]
pub trait BlockStorage: Send + Sync {
    async fn describe_volume(&self, volume_id: &str) -> Result<VolumeDescription, CloudError>;

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<SnapshotRecord, CloudError>;

    /// Returns the new snapshot ID.
    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
        tags: &[Tag],
    ) -> Result<String, CloudError>;

    /// Creates an encrypted same-region copy and returns its snapshot ID.
    async fn copy_snapshot(
        &self,
        snapshot_id: &str,
        description: &str,
        tags: &[Tag],
    ) -> Result<String, CloudError>;

    /// Creates an encrypted volume and returns its ID.
    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<String, CloudError>;

    async fn find_snapshots_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<SnapshotRecord>, CloudError>;

    async fn find_volumes_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<VolumeDescription>, CloudError>;
}

/// Checks whether a volume exists.
///
/// With `fail_fast` the lookup error is returned; otherwise it is logged and
/// reported as `Ok(false)`.
pub async fn volume_exists(
    cloud: &dyn BlockStorage,
    volume_id: &str,
    fail_fast: bool,
) -> Result<bool, CloudError> {
    match cloud.describe_volume(volume_id).await {
        Ok(_) => Ok(true),
        Err(e) => {
            if e.is_not_found() {
                error!(volume_id, "The volume was not found in AWS.");
            } else {
                error!(volume_id, error = %e, "Error when checking on the status of the volume");
            }
            if fail_fast {
                Err(e)
            } else {
                Ok(false)
            }
        }
    }
}
