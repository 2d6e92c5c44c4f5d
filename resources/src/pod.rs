// Copyright (c) The NotebookValidator Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The validation pod.
//!
//! When the image was produced by a build, the checkout is already baked
//! into it and the pod runs a single container. Only the no-build path gets
//! a git-sync init container that pulls the source into a shared workspace.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, Pod, PodSpec, SecretKeySelector, Volume, VolumeMount,
};
use kube::api::{DeleteParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Client, Resource, ResourceExt};
use nbv_crds::{NotebookValidationJob, ValidationPolicy, WorkPhase};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::{args, labels};

/// Marker label on validation pods, used to assert the build/validate
/// ordering from the outside.
pub const VALIDATION_LABEL: &str = "mlops.nbvalidator.dev/validation";

const GIT_SYNC_IMAGE: &str = "registry.k8s.io/git-sync/git-sync:v4.0.0";
const BUILT_APP_DIR: &str = "/opt/app-root/src";
const WORKSPACE_DIR: &str = "/workspace/app";

pub fn pod_name(job: &NotebookValidationJob, attempt: i32) -> String {
    format!("{}-validate-{}", job.name_any(), attempt)
}

/// Shape the validation pod around the resolved image. `from_build` marks
/// an image that already carries the checkout; such pods never get a
/// source-cloning init step.
pub fn new(job: &NotebookValidationJob, image: &str, from_build: bool, attempt: i32) -> Result<Pod> {
    let owner_reference = job.controller_owner_ref(&()).unwrap();
    let mut pod_labels = labels(job);
    pod_labels.insert(VALIDATION_LABEL.into(), "true".into());

    let mut init_containers = vec![];
    let mut volumes: Vec<Volume> = vec![];
    let mut mounts: Vec<VolumeMount> = vec![];

    if !from_build {
        init_containers.push(syncer(job));
        volumes.push(workspace_volume());
        mounts.push(workspace_mount());
    }

    if let Some(extra) = &job.spec.pod.volumes {
        for volume in extra {
            mounts.push(VolumeMount {
                name: volume.name.clone(),
                mount_path: format!("/mnt/{}", volume.name),
                ..Default::default()
            });
            volumes.push(volume.clone());
        }
    }

    let container = Container {
        name: "notebook-validator".to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        working_dir: Some(if from_build { BUILT_APP_DIR } else { WORKSPACE_DIR }.to_string()),
        env: Some(environment(job)),
        resources: job.spec.pod.resources.clone(),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(job, attempt)),
            labels: Some(pod_labels),
            owner_references: Some(vec![owner_reference]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            service_account_name: job.spec.pod.service_account_name.clone(),
            init_containers: (!init_containers.is_empty()).then_some(init_containers),
            containers: vec![container],
            volumes: (!volumes.is_empty()).then_some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Environment the in-pod tool reads its policy from.
fn environment(job: &NotebookValidationJob) -> Vec<EnvVar> {
    let policy = job.spec.validation.clone().unwrap_or_default();
    let mut env = vec![
        plain("NOTEBOOK_PATH", &job.spec.source.path),
        plain("VALIDATION_LEVEL", if policy.strict() { "strict" } else { "lax" }),
        plain("VALIDATION_CHECK_STDERR", if policy.strict() { "true" } else { "false" }),
        plain("VALIDATION_EDUCATIONAL", if policy.educational() { "true" } else { "false" }),
    ];

    if let Some(expected) = expected_outputs(&policy) {
        env.push(plain("VALIDATION_EXPECTED_OUTPUTS", &expected));
    }

    if let Some(user_env) = &job.spec.pod.env {
        for (name, value) in user_env {
            env.push(plain(name, value));
        }
    }

    env
}

fn expected_outputs(policy: &ValidationPolicy) -> Option<String> {
    let outputs = policy.expected_outputs.as_ref()?;
    serde_json::to_string(outputs).ok()
}

#[inline]
fn plain(name: &str, value: &str) -> EnvVar {
    EnvVar { name: name.to_string(), value: Some(value.to_string()), value_from: None }
}

/// Build and return the container spec for the git-sync init step.
fn syncer(job: &NotebookValidationJob) -> Container {
    let source = &job.spec.source;
    let revision = source.rev();
    let arguments = vec![
        ("depth", "1"),
        ("one-time", "true"),
        ("ref", revision.as_str()),
        ("repo", source.url.as_str()),
        ("root", "/workspace/src"),
        ("link", WORKSPACE_DIR),
    ];

    let env = source.credentials_secret.as_ref().map(|secret| {
        vec![
            from_secret("GITSYNC_USERNAME", secret, "username"),
            from_secret("GITSYNC_PASSWORD", secret, "password"),
        ]
    });

    Container {
        name: "syncer".to_string(),
        image: Some(GIT_SYNC_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(args(&arguments, 2)),
        env,
        volume_mounts: Some(vec![workspace_mount()]),
        ..Default::default()
    }
}

#[inline]
fn from_secret(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
    }
}

/// volume for /workspace based on k8s emptyDir
#[inline]
fn workspace_volume() -> Volume {
    Volume { name: "workspace".to_string(), empty_dir: Some(Default::default()), ..Default::default() }
}

#[inline]
fn workspace_mount() -> VolumeMount {
    VolumeMount { name: "workspace".to_string(), mount_path: "/workspace".to_string(), ..Default::default() }
}

pub async fn get(client: &Client, namespace: &str, name: &str) -> Result<Option<Pod>> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    api.get_opt(name).await.map_err(Error::KubeError)
}

pub async fn create(client: &Client, namespace: &str, resource: Pod) -> Result<Pod> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let name = resource.name_any();

    match api.create(&PostParams::default(), &resource).await {
        Ok(pod) => {
            info!("Created validation Pod: {}/{}", namespace, pod.name_any());
            Ok(pod)
        }
        Err(kube::Error::Api(response)) if response.code == 409 => {
            debug!("Validation Pod {} already exists", name);
            api.get(&name).await.map_err(Error::KubeError)
        }
        Err(err) => Err(Error::KubeError(err)),
    }
}

/// Delete every validation pod owned by the job. Used when a spec change
/// re-plans a settled job, so stale attempts cannot be mistaken for fresh
/// results.
pub async fn delete_all(client: &Client, namespace: &str, job: &NotebookValidationJob) -> Result<()> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = kube::api::ListParams::default()
        .labels(&format!("app={},{VALIDATION_LABEL}=true", job.name_any()));

    for pod in api.list(&params).await.map_err(Error::KubeError)?.items {
        api.delete(&pod.name_any(), &DeleteParams::default()).await.map_err(Error::KubeError)?;
        info!("Deleted validation Pod: {}/{}", namespace, pod.name_any());
    }

    Ok(())
}

pub async fn delete(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    if api.get_opt(name).await.map_err(Error::KubeError)?.is_some() {
        api.delete(name, &DeleteParams::default()).await.map_err(Error::KubeError)?;
        info!("Deleted validation Pod: {}/{}", namespace, name);
    }
    Ok(())
}

/// Normalize a pod into the work-status phases the reconciler drives on.
pub fn phase(pod: &Pod) -> WorkPhase {
    match pod.status.as_ref().and_then(|status| status.phase.as_deref()) {
        Some("Pending") => WorkPhase::Pending,
        Some("Running") => WorkPhase::Running,
        Some("Succeeded") => WorkPhase::Complete,
        Some("Failed") => WorkPhase::Failed,
        _ => WorkPhase::Unknown,
    }
}

/// A human-readable reason for the pod's current state.
pub fn message(pod: &Pod) -> String {
    let status = match &pod.status {
        Some(status) => status,
        None => return String::new(),
    };

    if let Some(message) = &status.message {
        return message.clone();
    }

    status
        .container_statuses
        .iter()
        .flatten()
        .filter_map(|container| container.state.as_ref())
        .filter_map(|state| state.terminated.as_ref())
        .map(|terminated| {
            let reason = terminated.reason.clone().unwrap_or_else(|| "Terminated".into());
            format!("{} (exit code {})", reason, terminated.exit_code)
        })
        .collect::<Vec<_>>()
        .join("; ")
}
