/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/cli.rs
*
* This file defines the command-line interface of `pv_encrypter` with the
* `clap` derive API. Global flags configure the AWS and Kubernetes clients;
* each subcommand maps to one stage of the pipeline.
*
* SPDX-License-Identifier: Apache-2.0
*/

use clap::{Args, Parser, Subcommand, ValueEnum};
use pv_encrypter::telemetry::LogFormat;
use std::path::PathBuf;

/// Finds Kubernetes PVs backed by unencrypted EBS volumes and migrates them
/// to encrypted copies.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The AWS region of the cluster's volumes.
    #[arg(long, env = "AWS_REGION", global = true)]
    pub region: Option<String>,

    /// The AWS CLI profile to use.
    #[arg(long, env = "AWS_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Path to a kubeconfig file. Defaults to the standard lookup.
    #[arg(long, env = "KUBECONFIG", global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// A JSON settings file. Flags take precedence over its values.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormatArg::Text, global = true)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Report unencrypted EBS volumes and the workloads using them.
    Status(StatusArgs),

    /// Migrate unencrypted volumes to encrypted ones.
    Migrate(MigrateArgs),

    /// List the snapshots and volumes created for a source volume.
    Recover(RecoverArgs),
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub output: OutputFormat,
}

#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Only migrate these volume IDs. May be repeated. Defaults to all.
    #[arg(long = "volume", value_name = "VOLUME_ID")]
    pub volumes: Vec<String>,

    /// Skip the confirmation prompt.
    #[arg(long)]
    pub yes: bool,

    /// Print the migration plan and exit.
    #[arg(long)]
    pub dry_run: bool,

    /// Directory holding per-volume migration state.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// How often to poll snapshot progress (e.g. "15s").
    #[arg(long)]
    pub poll_interval: Option<String>,

    /// Maximum time to wait for a snapshot (e.g. "2h").
    #[arg(long)]
    pub max_wait: Option<String>,

    /// Number of owner groups migrated at the same time.
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Args, Debug)]
pub struct RecoverArgs {
    /// The original (unencrypted) volume ID.
    #[arg(long = "volume", value_name = "VOLUME_ID")]
    pub volume: String,

    /// Directory holding per-volume migration state.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}
