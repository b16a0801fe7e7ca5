/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/main.rs
*
* Entry point of the `pv_encrypter` binary. It parses the command line,
* installs the tracing subscriber, resolves the settings and dispatches to the
* audit, migration and recovery stages of the library.
*
* Architecture:
* 1.  **Settings**: defaults, then the optional JSON settings file, then flags.
* 2.  **Discovery**: directory -> pod listing -> resolver -> plan set. This
*     part never mutates the cluster or the cloud account.
* 3.  **Migration**: after confirmation, the runner drives every owner group
*     through the state machine. Ctrl-C requests an abort that is honoured
*     between steps.
*
* SPDX-License-Identifier: Apache-2.0
*/

use anyhow::{Context, Result};
use clap::Parser;
use pv_encrypter::cloud::aws::AwsCliBlockStorage;
use pv_encrypter::cloud::BlockStorage;
use pv_encrypter::cluster::kube_api::{initialize_client, KubeCluster};
use pv_encrypter::cluster::ClusterApi;
use pv_encrypter::config::{parse_duration_str, Settings, SettingsFile};
use pv_encrypter::directory::{audit_volumes, VolumeInventory};
use pv_encrypter::migration::machine::{AbortSignal, MigrationContext};
use pv_encrypter::migration::runner::MigrationRunner;
use pv_encrypter::migration::store::JsonFileStore;
use pv_encrypter::report::{render_summary_text, AuditReport};
use pv_encrypter::resolver::{build_plans, find_pods_using_volumes, group_by_owner, OwnerGroups, PlanSet};
use pv_encrypter::telemetry::init_tracing;
use pv_encrypter::{recovery, telemetry, Error};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

mod cli;

use cli::{Cli, Commands, MigrateArgs, OutputFormat};

fn resolve_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::new("");
    if let Some(path) = &cli.config {
        let file = SettingsFile::load(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        settings = settings.merge_file(file)?;
    }
    if let Some(region) = &cli.region {
        settings.region = region.clone();
    }
    if cli.profile.is_some() {
        settings.profile = cli.profile.clone();
    }
    if cli.kubeconfig.is_some() {
        settings.kubeconfig = cli.kubeconfig.clone();
    }

    match &cli.command {
        Commands::Migrate(args) => apply_migrate_args(&mut settings, args)?,
        Commands::Recover(args) => {
            if let Some(dir) = &args.state_dir {
                settings.state_dir = dir.clone();
            }
        }
        Commands::Status(_) => {}
    }

    settings.validate()?;
    Ok(settings)
}

fn apply_migrate_args(settings: &mut Settings, args: &MigrateArgs) -> Result<()> {
    if let Some(dir) = &args.state_dir {
        settings.state_dir = dir.clone();
    }
    if let Some(s) = args.poll_interval.as_deref() {
        settings.wait.poll_interval = parse_duration_str(s).context("Invalid --poll-interval")?;
    }
    if let Some(s) = args.max_wait.as_deref() {
        settings.wait.max_wait = parse_duration_str(s).context("Invalid --max-wait")?;
    }
    if let Some(n) = args.concurrency {
        settings.concurrency = n;
    }
    Ok(())
}

struct Discovery {
    inventory: VolumeInventory,
    groups: OwnerGroups,
    plans: PlanSet,
}

async fn discover(cluster: &dyn ClusterApi, cloud: &dyn BlockStorage) -> Result<Discovery> {
    let inventory = audit_volumes(cluster, cloud)
        .await
        .context("Failed to audit persistent volumes")?;
    if inventory.unencrypted.is_empty() {
        return Ok(Discovery {
            inventory,
            groups: OwnerGroups::default(),
            plans: PlanSet::default(),
        });
    }

    let pods = cluster.list_running_pods().await.context("Failed to list running pods")?;
    info!("Found {} running pod(s)", pods.len());
    let matches = match find_pods_using_volumes(&pods, &inventory.unencrypted) {
        Ok(matches) => matches,
        Err(Error::NoQualifyingPods) => {
            warn!("No running pods found; every volume is treated as unmounted");
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };
    let groups = group_by_owner(cluster, matches).await?;
    for (owner, m) in &groups.unsupported {
        warn!(
            owner = %owner,
            pod = %m.pod_name(),
            "Pod is owned by an unsupported controller and will not be paused automatically"
        );
    }
    let plans = build_plans(cluster, &inventory.unencrypted, &groups).await?;
    Ok(Discovery {
        inventory,
        groups,
        plans,
    })
}

async fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{} [y/N] ", prompt);
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read confirmation")?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = resolve_settings(&cli)?;
    let cloud: Arc<dyn BlockStorage> = Arc::new(AwsCliBlockStorage::new(
        settings.region.clone(),
        settings.profile.clone(),
    ));
    let client = initialize_client(settings.kubeconfig.as_deref())
        .await
        .context("Failed to create Kubernetes client")?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client, settings.deletion_timeout));

    match cli.command {
        Commands::Status(args) => {
            let discovery = discover(cluster.as_ref(), cloud.as_ref()).await?;
            let report = AuditReport::new(&discovery.inventory, &discovery.groups, &discovery.plans.unsupported);
            match args.output {
                OutputFormat::Table => print!("{}", report.render_text()),
                OutputFormat::Json => println!("{}", report.to_json()?),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Migrate(args) => {
            let discovery = discover(cluster.as_ref(), cloud.as_ref()).await?;
            let report = AuditReport::new(&discovery.inventory, &discovery.groups, &discovery.plans.unsupported);
            print!("{}", report.render_text());

            if args.dry_run {
                println!("\nDry run: no changes made.");
                return Ok(ExitCode::SUCCESS);
            }
            if !args.yes && !confirm("Migrate the volumes listed above?").await? {
                println!("Aborted by operator.");
                return Ok(ExitCode::FAILURE);
            }

            let abort = AbortSignal::new();
            let on_ctrl_c = abort.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Abort requested, stopping after the current step");
                    on_ctrl_c.request();
                }
            });

            let store = JsonFileStore::new(settings.state_dir.clone());
            info!(state_dir = %store.dir().display(), "Recording migration state");
            let ctx = MigrationContext {
                cloud,
                cluster,
                store: Arc::new(store),
                wait: settings.wait,
                retry: settings.retry,
                volume_type: settings.volume_type.clone(),
                abort,
            };
            let summary = MigrationRunner::new(ctx, settings.concurrency)
                .run(discovery.plans, &args.volumes)
                .await
                .context("Migration run failed")?;

            println!();
            print!("{}", render_summary_text(&summary));
            if summary.all_succeeded() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }

        Commands::Recover(args) => {
            let store = JsonFileStore::new(settings.state_dir.clone());
            info!(state_dir = %store.dir().display(), "Reading migration state");
            let listing = recovery::list_artifacts(cloud.as_ref(), cluster.as_ref(), &store, &args.volume)
                .await
                .with_context(|| format!("Failed to list resources for {}", args.volume))?;
            print!("{}", listing.render_text());
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(telemetry::LogFormat::from(cli.log_format)) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
