/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/cloud/aws.rs
*
* Implements `BlockStorage` for AWS EBS by shelling out to the `aws ec2` CLI.
* Every invocation pins `--region` (and `--profile` when configured) and asks
* for JSON output, which is then deserialized into typed response structs.
* Tag specifications and filters are passed as JSON documents, which the CLI
* accepts for any list-typed parameter.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{BlockStorage, CloudError, CreateVolumeRequest, Tag, VolumeDescription};
use crate::model::{SnapshotRecord, SnapshotState};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, error};

pub struct AwsCliBlockStorage {
    region: String,
    profile: Option<String>,
}

impl AwsCliBlockStorage {
    pub fn new(region: impl Into<String>, profile: Option<String>) -> Self {
        Self {
            region: region.into(),
            profile,
        }
    }

    /// Runs `aws ec2 <command> <args>` and deserializes its JSON output.
    async fn run_aws_command<T: DeserializeOwned>(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<T, CloudError> {
        let mut cmd = Command::new("aws");
        cmd.arg("ec2")
            .arg(command)
            .args(args)
            .arg("--region")
            .arg(&self.region)
            .arg("--output")
            .arg("json");
        if let Some(profile) = &self.profile {
            cmd.arg("--profile").arg(profile);
        }

        debug!(command, "Invoking aws ec2");
        let output = cmd.output().await.map_err(|e| {
            CloudError::Invocation(format!(
                "failed to run 'aws': {}. Is the AWS CLI installed and in your PATH?",
                e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CloudError::Invocation(stderr.trim().to_string()));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| CloudError::Parse(format!("aws ec2 {}: {}", command, e)))
    }
}

/// The service error code of a CLI failure message, as in
/// `An error occurred (InvalidVolume.NotFound) when calling ...`.
fn error_code(message: &str) -> Option<&str> {
    let rest = &message[message.find("An error occurred (")? + "An error occurred (".len()..];
    rest.find(')').map(|end| &rest[..end])
}

/// Maps a failed invocation onto `NotFound` when the CLI reported a missing resource.
fn classify(
    err: CloudError,
    not_found_code: &str,
    resource: &'static str,
    id: &str,
) -> CloudError {
    match err {
        CloudError::Invocation(message) if error_code(&message) == Some(not_found_code) => {
            CloudError::NotFound {
                resource,
                id: id.to_string(),
            }
        }
        other => other,
    }
}

/// Maps a failed mutating invocation onto `Rejected`, keeping the CLI message.
fn rejected(err: CloudError, operation: &'static str, id: &str) -> CloudError {
    match err {
        CloudError::Invocation(message) => CloudError::Rejected {
            operation,
            id: id.to_string(),
            message,
        },
        other => other,
    }
}

fn tag_specifications(resource_type: &str, tags: &[Tag]) -> String {
    json!([{ "ResourceType": resource_type, "Tags": tags }]).to_string()
}

fn tag_filter(key: &str, value: &str) -> String {
    json!([
        { "Name": format!("tag:{}", key), "Values": [value] },
        { "Name": "tag:created_by", "Values": [super::CREATED_BY] },
    ])
    .to_string()
}

// --- Response shapes ---

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct DescribeVolumesResponse {
    #[serde(default)]
    volumes: Vec<AwsVolume>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct AwsVolume {
    volume_id: String,
    #[serde(default)]
    encrypted: bool,
    availability_zone: String,
    volume_type: Option<String>,
    size: Option<i64>,
    state: Option<String>,
    #[serde(default)]
    tags: Vec<Tag>,
}

impl From<AwsVolume> for VolumeDescription {
    fn from(v: AwsVolume) -> Self {
        VolumeDescription {
            volume_id: v.volume_id,
            encrypted: v.encrypted,
            availability_zone: v.availability_zone,
            volume_type: v.volume_type,
            size_gib: v.size,
            state: v.state,
            tags: v.tags,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct DescribeSnapshotsResponse {
    #[serde(default)]
    snapshots: Vec<AwsSnapshot>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct AwsSnapshot {
    snapshot_id: String,
    #[serde(default)]
    volume_id: String,
    #[serde(default)]
    encrypted: bool,
    progress: Option<String>,
    state: SnapshotState,
}

impl AwsSnapshot {
    fn into_record(self) -> Result<SnapshotRecord, CloudError> {
        let progress_percent = match self.progress.as_deref() {
            Some(p) => parse_progress(p)?,
            None => 0,
        };
        Ok(SnapshotRecord {
            snapshot_id: self.snapshot_id,
            volume_id: self.volume_id,
            encrypted: self.encrypted,
            progress_percent,
            state: self.state,
        })
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct SnapshotIdResponse {
    snapshot_id: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct VolumeIdResponse {
    volume_id: String,
}

/// Parses the `Progress` field (e.g. `"45%"`) into a percentage.
pub fn parse_progress(raw: &str) -> Result<u8, CloudError> {
    let trimmed = raw.trim().trim_end_matches('%').trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse::<u8>()
        .ok()
        .filter(|p| *p <= 100)
        .ok_or_else(|| CloudError::Parse(format!("invalid snapshot progress '{}'", raw)))
}

#[async_trait]
impl BlockStorage for AwsCliBlockStorage {
    async fn describe_volume(&self, volume_id: &str) -> Result<VolumeDescription, CloudError> {
        let args = vec!["--volume-ids".to_string(), volume_id.to_string()];
        let response: DescribeVolumesResponse = self
            .run_aws_command("describe-volumes", &args)
            .await
            .map_err(|e| classify(e, "InvalidVolume.NotFound", "volume", volume_id))?;

        response
            .volumes
            .into_iter()
            .next()
            .map(VolumeDescription::from)
            .ok_or_else(|| CloudError::NotFound {
                resource: "volume",
                id: volume_id.to_string(),
            })
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<SnapshotRecord, CloudError> {
        let args = vec!["--snapshot-ids".to_string(), snapshot_id.to_string()];
        let response: DescribeSnapshotsResponse = self
            .run_aws_command("describe-snapshots", &args)
            .await
            .map_err(|e| classify(e, "InvalidSnapshot.NotFound", "snapshot", snapshot_id))?;

        response
            .snapshots
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::NotFound {
                resource: "snapshot",
                id: snapshot_id.to_string(),
            })?
            .into_record()
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
        tags: &[Tag],
    ) -> Result<String, CloudError> {
        let args = vec![
            "--volume-id".to_string(),
            volume_id.to_string(),
            "--description".to_string(),
            description.to_string(),
            "--tag-specifications".to_string(),
            tag_specifications("snapshot", tags),
        ];
        let response: SnapshotIdResponse = self
            .run_aws_command("create-snapshot", &args)
            .await
            .map_err(|e| {
                error!(volume_id, error = %e, "Snapshot creation failed");
                rejected(e, "create-snapshot", volume_id)
            })?;
        Ok(response.snapshot_id)
    }

    async fn copy_snapshot(
        &self,
        snapshot_id: &str,
        description: &str,
        tags: &[Tag],
    ) -> Result<String, CloudError> {
        let args = vec![
            "--source-region".to_string(),
            self.region.clone(),
            "--source-snapshot-id".to_string(),
            snapshot_id.to_string(),
            "--encrypted".to_string(),
            "--description".to_string(),
            description.to_string(),
            "--tag-specifications".to_string(),
            tag_specifications("snapshot", tags),
        ];
        let response: SnapshotIdResponse = self
            .run_aws_command("copy-snapshot", &args)
            .await
            .map_err(|e| {
                error!(snapshot_id, error = %e, "Snapshot copy failed");
                rejected(e, "copy-snapshot", snapshot_id)
            })?;
        Ok(response.snapshot_id)
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<String, CloudError> {
        let args = vec![
            "--snapshot-id".to_string(),
            request.snapshot_id.clone(),
            "--availability-zone".to_string(),
            request.availability_zone.clone(),
            "--encrypted".to_string(),
            "--volume-type".to_string(),
            request.volume_type.clone(),
            "--tag-specifications".to_string(),
            tag_specifications("volume", &request.tags),
        ];
        let response: VolumeIdResponse = self
            .run_aws_command("create-volume", &args)
            .await
            .map_err(|e| {
                error!(
                    snapshot_id = %request.snapshot_id,
                    availability_zone = %request.availability_zone,
                    error = %e,
                    "Volume creation failed"
                );
                rejected(e, "create-volume", &request.snapshot_id)
            })?;
        Ok(response.volume_id)
    }

    async fn find_snapshots_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<SnapshotRecord>, CloudError> {
        let args = vec!["--filters".to_string(), tag_filter(key, value)];
        let response: DescribeSnapshotsResponse =
            self.run_aws_command("describe-snapshots", &args).await?;
        response
            .snapshots
            .into_iter()
            .map(AwsSnapshot::into_record)
            .collect()
    }

    async fn find_volumes_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<VolumeDescription>, CloudError> {
        let args = vec!["--filters".to_string(), tag_filter(key, value)];
        let response: DescribeVolumesResponse =
            self.run_aws_command("describe-volumes", &args).await?;
        Ok(response.volumes.into_iter().map(VolumeDescription::from).collect())
    }
}
