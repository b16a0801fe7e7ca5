/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/error.rs
*
* Crate-wide error type. Cloud failures keep their own `CloudError` type and are
* wrapped here so a single `Result` flows through discovery and migration.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::cloud::CloudError;
use crate::migration::state::MigrationStep;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Cloud provider error: {0}")]
    Cloud(#[from] CloudError),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("No persistent volumes were returned by the cluster")]
    EmptyInventory,

    #[error("No running pods were returned by the cluster")]
    NoQualifyingPods,

    #[error("Cannot compute progress for an empty snapshot batch")]
    EmptyBatch,

    #[error("Pod '{namespace}/{name}' has no owner reference")]
    MissingOwner { namespace: String, name: String },

    #[error("Malformed cluster state: {0}")]
    Malformed(String),

    #[error("Step {attempted:?} cannot be recorded after {last:?} for volume {volume_id}")]
    StepOrder {
        volume_id: String,
        last: Option<MigrationStep>,
        attempted: MigrationStep,
    },

    #[error("Timed out after {0:?} waiting for {1}")]
    Timeout(std::time::Duration, String),

    #[error("Invalid duration format: {0}")]
    InvalidDuration(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// True for missing-object failures, whether reported by the cluster or the cloud.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            Error::Cloud(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
