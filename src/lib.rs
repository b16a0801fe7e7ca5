/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/lib.rs
*
* Library crate behind the `pv_encrypter` binary. It audits the cluster's
* persistent volumes for unencrypted EBS volumes, resolves the workloads that
* mount them and migrates each volume to an encrypted copy.
*
* Pipeline:
* - `directory`: PVs backed by in-tree EBS, partitioned by encryption.
* - `resolver`: running pods, their owners and the per-volume plans.
* - `migration`: the resumable per-volume state machine and the runner that
*   pauses and resumes each owner once.
* - `progress`: snapshot polling and the bounded wait.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod cloud;
pub mod cluster;
pub mod config;
pub mod directory;
pub mod error;
pub mod migration;
pub mod model;
pub mod progress;
pub mod recovery;
pub mod report;
pub mod resolver;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
