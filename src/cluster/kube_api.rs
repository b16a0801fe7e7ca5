/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/cluster/kube_api.rs
*
* `ClusterApi` backed by `kube-rs`. One `Client` is created at process start
* and shared by every typed `Api` built here.
*
* Rebinding a claim recreates the PV and its PVC from manifests built and
* persisted before this module is called:
* 1. The old PV is switched to the `Retain` reclaim policy so deleting it can
*    never delete the original EBS volume.
* 2. The claim and the PV are deleted and awaited until they are gone.
* 3. The PV is recreated with the new volume handle and its original reclaim
*    policy, then the claim is recreated pinned to it.
* A repeated call skips whatever an earlier attempt already finished.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::manifest::{ebs_volume_handle, RebindManifests};
use super::ClusterApi;
use crate::error::{Error, Result};
use crate::model::{OwnerKind, OwnerRef};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    runtime::wait::{await_condition, conditions},
    Client, Config, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Initializes a Kubernetes client from a kubeconfig path or the default chain.
pub async fn initialize_client(kubeconfig_path: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig_path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::Config(format!("failed to read kubeconfig: {}", e)))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Config(format!("failed to load Kubernetes config: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::Config(format!("failed to load Kubernetes config: {}", e)))?,
    };

    Ok(Client::try_from(config)?)
}

pub struct KubeCluster {
    client: Client,
    deletion_timeout: Duration,
}

impl KubeCluster {
    pub fn new(client: Client, deletion_timeout: Duration) -> Self {
        Self {
            client,
            deletion_timeout,
        }
    }

    fn pvs(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Deletes an object and blocks until the API server no longer returns it.
    async fn delete_and_wait<K>(&self, api: &Api<K>, name: &str) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let current = match api.get_opt(name).await? {
            Some(obj) => obj,
            None => return Ok(()),
        };
        let uid = current.uid().unwrap_or_default();

        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let deleted = await_condition(api.clone(), name, conditions::is_deleted(&uid));
        match tokio::time::timeout(self.deletion_timeout, deleted).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::Malformed(format!("watch on '{}' failed: {}", name, e))),
            Err(_) => Err(Error::Timeout(self.deletion_timeout, format!("deletion of '{}'", name))),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolume>> {
        let pvs = self.pvs().list(&ListParams::default()).await?;
        info!("Count of Persistent Volumes (PVs): {}", pvs.items.len());
        Ok(pvs.items)
    }

    async fn list_running_pods(&self) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields("status.phase=Running");
        let pods = pods.list(&lp).await?;
        info!("Count of Pods: {}", pods.items.len());
        Ok(pods.items)
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume> {
        self.pvs()
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found("PersistentVolume", name))
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        self.claims(namespace)
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found("PersistentVolumeClaim", format!("{}/{}", namespace, name)))
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found("ReplicaSet", format!("{}/{}", namespace, name)))
    }

    async fn get_replicas(&self, owner: &OwnerRef) -> Result<i32> {
        let display = format!("{}/{}", owner.namespace, owner.name);
        match owner.kind {
            OwnerKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &owner.namespace);
                let deployment = api
                    .get_opt(&owner.name)
                    .await?
                    .ok_or_else(|| Error::not_found("Deployment", display))?;
                Ok(deployment.spec.and_then(|s| s.replicas).unwrap_or(1))
            }
            OwnerKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &owner.namespace);
                let sts = api
                    .get_opt(&owner.name)
                    .await?
                    .ok_or_else(|| Error::not_found("StatefulSet", display))?;
                Ok(sts.spec.and_then(|s| s.replicas).unwrap_or(1))
            }
            OwnerKind::Other(ref kind) => Err(Error::Malformed(format!(
                "cannot read replicas of unsupported owner kind {}",
                kind
            ))),
        }
    }

    async fn scale(&self, owner: &OwnerRef, replicas: i32) -> Result<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        let pp = PatchParams::default();
        match owner.kind {
            OwnerKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &owner.namespace);
                api.patch_scale(&owner.name, &pp, &Patch::Merge(&patch)).await?;
            }
            OwnerKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &owner.namespace);
                api.patch_scale(&owner.name, &pp, &Patch::Merge(&patch)).await?;
            }
            OwnerKind::Other(ref kind) => {
                return Err(Error::Malformed(format!("cannot scale unsupported owner kind {}", kind)))
            }
        }
        info!(owner = %owner, replicas, "Scaled owner");
        Ok(())
    }

    async fn rebind_volume(&self, manifests: &RebindManifests) -> Result<()> {
        let pv_name = manifests.pv_name();
        let new_handle = manifests.volume_handle()?;
        let claim = manifests.claim_ref();

        match self.pvs().get_opt(pv_name).await? {
            Some(pv) if ebs_volume_handle(&pv) == Some(new_handle) => {
                info!(pv = pv_name, handle = new_handle, "PV already references the new volume");
            }
            Some(_) => {
                let retain = json!({ "spec": { "persistentVolumeReclaimPolicy": "Retain" } });
                self.pvs()
                    .patch(pv_name, &PatchParams::default(), &Patch::Merge(&retain))
                    .await?;

                match &claim {
                    Some(claim) => {
                        info!(pvc = %claim, "Deleting claim for rebind");
                        self.delete_and_wait(&self.claims(&claim.namespace), &claim.name).await?;
                    }
                    None => warn!(pv = pv_name, "PV has no bound claim; only the PV will be replaced"),
                }

                info!(pv = pv_name, "Deleting PV for rebind");
                self.delete_and_wait(&self.pvs(), pv_name).await?;
                self.pvs().create(&PostParams::default(), &manifests.volume).await?;
                info!(pv = pv_name, handle = new_handle, "Recreated PV");
            }
            None => {
                warn!(pv = pv_name, "PV is missing after an interrupted rebind; recreating it");
                self.pvs().create(&PostParams::default(), &manifests.volume).await?;
                info!(pv = pv_name, handle = new_handle, "Recreated PV");
            }
        }

        if let (Some(claim), Some(new_claim)) = (&claim, &manifests.claim) {
            let api = self.claims(&claim.namespace);
            if api.get_opt(&claim.name).await?.is_none() {
                api.create(&PostParams::default(), new_claim).await?;
                info!(pvc = %claim, "Recreated claim");
            }
        }

        Ok(())
    }
}
