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

//! Tekton pipeline build driver.
//!
//! Each job gets one `Pipeline` (the recipe) and one `PipelineRun` per
//! attempt. The pipeline chains fetch-repository, generate-dockerfile and
//! build-image over a per-run workspace volume. Both objects are read back
//! by name after create-or-get; a create that cannot be confirmed is an
//! error, never a success.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, LogParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::{Api, Client, Resource, ResourceExt};
use nbv_crds::{BuildSettings, NotebookValidationJob, WorkPhase, DEFAULT_BASE_IMAGE};
use serde_json::{from_value, json, Value};
use tracing::{debug, info};

use super::{kind_served, select_latest, status_time, tasks, BuildInfo, BuildStrategy};
use crate::error::{Error, Result};
use crate::{dockerfile, labels, secret};

const TEKTON_GROUP: &str = "tekton.dev";
const VERSION: &str = "v1beta1";

/// Our linkage label from a run back to its recipe.
const PIPELINE_LABEL: &str = "mlops.nbvalidator.dev/pipeline";

/// Group id the per-run workspace volume is chowned to, so non-root build
/// steps can write it.
const WORKSPACE_FS_GROUP: i64 = 65532;

const GENERATE_STEP_IMAGE: &str = "registry.access.redhat.com/ubi9/ubi-minimal:latest";

pub struct PipelineStrategy {
    system_namespace: String,
}

impl PipelineStrategy {
    pub fn new(system_namespace: &str) -> Self {
        Self { system_namespace: system_namespace.to_string() }
    }
}

#[async_trait]
impl BuildStrategy for PipelineStrategy {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    fn recipe_name(&self, job: &NotebookValidationJob) -> String {
        format!("{}-pipeline", job.name_any())
    }

    async fn detect(&self, client: &Client) -> Result<bool> {
        kind_served(client, &pipeline_resource()).await
    }

    fn validate_config(&self, build: &BuildSettings) -> Result<()> {
        if let Some(path) = &build.dockerfile {
            dockerfile::ensure_relative(path)?;
        }
        if let Some(path) = &build.requirements_file {
            dockerfile::ensure_relative(path)?;
        }
        for source in build.requirements_sources.iter().flatten() {
            dockerfile::ensure_relative(source)?;
        }
        if build.config("imageRepository").map_or(false, str::is_empty) {
            return Err(Error::InvalidBuildConfig("strategyConfig.imageRepository must not be empty".into()));
        }
        Ok(())
    }

    async fn create_build(&self, client: &Client, job: &NotebookValidationJob) -> Result<BuildInfo> {
        let namespace = job.namespace().ok_or_else(|| Error::MissingObjectKey(".metadata.namespace"))?;
        let recipe = self.recipe_name(job);

        tasks::ensure(client, &self.system_namespace, &namespace).await?;

        if let Some(source_secret) = &job.spec.source.credentials_secret {
            secret::ensure_workspace_secret(client, &namespace, source_secret, job).await?;
        }

        ensure_pipeline(client, &namespace, job, &recipe).await?;

        self.trigger_build(client, job).await
    }

    async fn get_build(&self, client: &Client, namespace: &str, name: &str) -> Result<Option<BuildInfo>> {
        let run = pipeline_runs(client, namespace).get_opt(name).await.map_err(Error::KubeError)?;
        Ok(run.as_ref().map(build_info))
    }

    async fn get_latest_build(&self, client: &Client, namespace: &str, recipe: &str) -> Result<Option<BuildInfo>> {
        let runs = list_runs(client, namespace, recipe).await?;
        Ok(select_latest(runs.iter().map(build_info).collect()))
    }

    async fn trigger_build(&self, client: &Client, job: &NotebookValidationJob) -> Result<BuildInfo> {
        let namespace = job.namespace().ok_or_else(|| Error::MissingObjectKey(".metadata.namespace"))?;
        let recipe = self.recipe_name(job);
        let name = run_name(&recipe, job);

        // The workspace-shape secret was derived when the recipe was set up;
        // only its name is needed to bind the workspace.
        let credentials_workspace = job
            .spec
            .source
            .credentials_secret
            .as_ref()
            .map(|source| format!("{source}{}", secret::WORKSPACE_SECRET_SUFFIX));

        let api = pipeline_runs(client, &namespace);
        if api.get_opt(&name).await.map_err(Error::KubeError)?.is_none() {
            let resource = new_pipeline_run(job, &recipe, &name, credentials_workspace.as_deref())?;
            match api.create(&PostParams::default(), &resource).await {
                Ok(_) => info!("Created PipelineRun: {}/{}", namespace, name),
                Err(kube::Error::Api(response)) if response.code == 409 => {}
                Err(err) => return Err(Error::KubeError(err)),
            }
        } else {
            debug!("PipelineRun {} already exists, reusing it", name);
        }

        // Confirm the run actually landed before reporting success.
        let run = api
            .get_opt(&name)
            .await
            .map_err(Error::KubeError)?
            .ok_or(Error::VerificationFailed { kind: "PipelineRun", name: name.clone() })?;

        Ok(build_info(&run))
    }

    async fn cleanup_old_builds(&self, client: &Client, namespace: &str, recipe: &str, keep: usize) -> Result<()> {
        let mut runs = list_runs(client, namespace, recipe).await?;
        runs.sort_by_key(|run| std::cmp::Reverse(run.creation_timestamp().map(|time| time.0)));

        let api = pipeline_runs(client, namespace);
        for run in runs.iter().skip(keep) {
            if build_info(run).status == WorkPhase::Running {
                continue;
            }
            api.delete(&run.name_any(), &DeleteParams::default()).await.map_err(Error::KubeError)?;
            info!("Deleted old PipelineRun: {}/{}", namespace, run.name_any());
        }

        Ok(())
    }

    async fn delete_build(&self, client: &Client, namespace: &str, name: &str) -> Result<()> {
        let api = pipeline_runs(client, namespace);
        if api.get_opt(name).await.map_err(Error::KubeError)?.is_some() {
            api.delete(name, &DeleteParams::default()).await.map_err(Error::KubeError)?;
            info!("Deleted PipelineRun: {}/{}", namespace, name);
        }
        Ok(())
    }

    async fn build_logs(&self, client: &Client, namespace: &str, name: &str) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
        let params = ListParams::default().labels(&format!("tekton.dev/pipelineRun={name}"));
        let mut logs = String::new();

        for pod in pods.list(&params).await.map_err(Error::KubeError)?.items {
            let pod_name = pod.name_any();
            let text = pods.logs(&pod_name, &LogParams::default()).await.map_err(Error::KubeError)?;
            logs.push_str(&format!("--- {pod_name} ---\n{text}\n"));
        }

        Ok(logs)
    }
}

#[inline]
fn pipeline_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(TEKTON_GROUP, VERSION, "Pipeline"))
}

/// The run kind, exposed so the controller can watch owned PipelineRuns.
#[inline]
pub fn pipeline_run_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(TEKTON_GROUP, VERSION, "PipelineRun"))
}

fn pipelines(client: &Client, namespace: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client.clone(), namespace, &pipeline_resource())
}

fn pipeline_runs(client: &Client, namespace: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client.clone(), namespace, &pipeline_run_resource())
}

async fn list_runs(client: &Client, namespace: &str, recipe: &str) -> Result<Vec<DynamicObject>> {
    let params = ListParams::default().labels(&format!("{PIPELINE_LABEL}={recipe}"));
    let runs = pipeline_runs(client, namespace).list(&params).await.map_err(Error::KubeError)?;
    Ok(runs.items)
}

async fn ensure_pipeline(client: &Client, namespace: &str, job: &NotebookValidationJob, recipe: &str) -> Result<()> {
    let api = pipelines(client, namespace);

    if api.get_opt(recipe).await.map_err(Error::KubeError)?.is_none() {
        let resource = new_pipeline(job, recipe)?;
        match api.create(&PostParams::default(), &resource).await {
            Ok(_) => info!("Created Pipeline: {}/{}", namespace, recipe),
            Err(kube::Error::Api(response)) if response.code == 409 => {}
            Err(err) => return Err(Error::KubeError(err)),
        }
    }

    // Confirm before reporting success.
    api.get_opt(recipe)
        .await
        .map_err(Error::KubeError)?
        .ok_or(Error::VerificationFailed { kind: "Pipeline", name: recipe.to_string() })?;

    Ok(())
}

/// The image the run pushes to: an explicit repository from the strategy
/// config, or the in-cluster registry.
fn image_reference(job: &NotebookValidationJob, namespace: &str) -> String {
    let build = job.spec.build.clone().unwrap_or_default();
    match build.config("imageRepository") {
        Some(repository) => format!("{repository}:latest"),
        None => format!(
            "image-registry.openshift-image-registry.svc:5000/{}/{}:latest",
            namespace,
            job.name_any()
        ),
    }
}

/// The recipe: a three-task pipeline chained by `runAfter`.
fn new_pipeline(job: &NotebookValidationJob, recipe: &str) -> Result<DynamicObject> {
    let owner_reference = job.controller_owner_ref(&()).unwrap();

    from_value(json!({
        "apiVersion": format!("{TEKTON_GROUP}/{VERSION}"),
        "kind": "Pipeline",
        "metadata": {
            "name": recipe,
            "labels": labels(job),
            "ownerReferences": vec![owner_reference],
        },
        "spec": {
            "params": [
                { "name": "git-url", "type": "string" },
                { "name": "git-revision", "type": "string", "default": "main" },
                { "name": "image-reference", "type": "string" },
                { "name": "base-image", "type": "string", "default": DEFAULT_BASE_IMAGE },
                { "name": "dockerfile-path", "type": "string", "default": "" },
            ],
            "workspaces": [
                { "name": "shared-workspace" },
                { "name": "git-credentials", "optional": true },
            ],
            "tasks": [
                {
                    "name": "fetch-repository",
                    "taskRef": { "name": "git-clone", "kind": "Task" },
                    "workspaces": [
                        { "name": "output", "workspace": "shared-workspace" },
                        { "name": "basic-auth", "workspace": "git-credentials" },
                    ],
                    "params": [
                        { "name": "url", "value": "$(params.git-url)" },
                        { "name": "revision", "value": "$(params.git-revision)" },
                        { "name": "deleteExisting", "value": "true" },
                    ],
                },
                {
                    "name": "generate-dockerfile",
                    "runAfter": ["fetch-repository"],
                    "workspaces": [
                        { "name": "source", "workspace": "shared-workspace" },
                    ],
                    "params": [
                        { "name": "base-image", "value": "$(params.base-image)" },
                        { "name": "dockerfile-path", "value": "$(params.dockerfile-path)" },
                    ],
                    "taskSpec": {
                        "params": [
                            { "name": "base-image", "type": "string" },
                            { "name": "dockerfile-path", "type": "string", "default": "" },
                        ],
                        "workspaces": [ { "name": "source" } ],
                        "steps": [
                            {
                                "name": "generate",
                                "image": GENERATE_STEP_IMAGE,
                                "script": dockerfile::task_script(),
                            },
                        ],
                    },
                },
                {
                    "name": "build-image",
                    "runAfter": ["generate-dockerfile"],
                    "taskRef": { "name": "buildah", "kind": "Task" },
                    "workspaces": [
                        { "name": "source", "workspace": "shared-workspace" },
                    ],
                    "params": [
                        { "name": "IMAGE", "value": "$(params.image-reference)" },
                        { "name": "DOCKERFILE", "value": "./Dockerfile" },
                    ],
                },
            ],
        },
    }))
    .map_err(Error::SerializationError)
}

/// One attempt: a run referencing the recipe, with a fresh 1 GiB workspace
/// volume and the credential workspace when the source needs auth.
fn new_pipeline_run(
    job: &NotebookValidationJob,
    recipe: &str,
    name: &str,
    credentials_workspace: Option<&str>,
) -> Result<DynamicObject> {
    let namespace = job.namespace().ok_or_else(|| Error::MissingObjectKey(".metadata.namespace"))?;
    let build = job.spec.build.clone().unwrap_or_default();
    let owner_reference = job.controller_owner_ref(&()).unwrap();

    let mut run_labels = labels(job);
    run_labels.insert(PIPELINE_LABEL.into(), recipe.to_string());

    let mut workspaces = vec![json!({
        "name": "shared-workspace",
        "volumeClaimTemplate": {
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "resources": { "requests": { "storage": "1Gi" } },
            },
        },
    })];
    if let Some(secret_name) = credentials_workspace {
        workspaces.push(json!({
            "name": "git-credentials",
            "secret": { "secretName": secret_name },
        }));
    }

    from_value(json!({
        "apiVersion": format!("{TEKTON_GROUP}/{VERSION}"),
        "kind": "PipelineRun",
        "metadata": {
            "name": name,
            "labels": run_labels,
            "ownerReferences": vec![owner_reference],
        },
        "spec": {
            "pipelineRef": { "name": recipe },
            "params": [
                { "name": "git-url", "value": job.spec.source.url },
                { "name": "git-revision", "value": job.spec.source.rev() },
                { "name": "image-reference", "value": image_reference(job, &namespace) },
                { "name": "base-image", "value": build.base_image() },
                { "name": "dockerfile-path", "value": build.dockerfile.clone().unwrap_or_default() },
            ],
            "podTemplate": {
                "securityContext": { "fsGroup": WORKSPACE_FS_GROUP },
            },
            "workspaces": workspaces,
        },
    }))
    .map_err(Error::SerializationError)
}

fn build_info(run: &DynamicObject) -> BuildInfo {
    let (status, message) = match succeeded_condition(&run.data) {
        Some(condition) => {
            let phase = match condition.get("status").and_then(Value::as_str) {
                Some("True") => WorkPhase::Complete,
                Some("False") => WorkPhase::Failed,
                _ => WorkPhase::Running,
            };
            let message = condition
                .get("message")
                .or_else(|| condition.get("reason"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (phase, message)
        }
        None => (WorkPhase::Pending, String::new()),
    };

    // The pushed image is whatever the run was parameterized with.
    let image_reference = (status == WorkPhase::Complete)
        .then(|| run_param(&run.data, "image-reference"))
        .flatten();

    BuildInfo {
        name: run.name_any(),
        status,
        message,
        image_reference,
        start_time: status_time(run, "/status/startTime"),
        completion_time: status_time(run, "/status/completionTime"),
        created: run.creation_timestamp(),
    }
}

fn succeeded_condition(data: &Value) -> Option<&Value> {
    data.pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|condition| condition.get("type").and_then(Value::as_str) == Some("Succeeded"))
}

fn run_param(data: &Value, name: &str) -> Option<String> {
    data.pointer("/spec/params")?
        .as_array()?
        .iter()
        .find(|param| param.get("name").and_then(Value::as_str) == Some(name))?
        .get("value")
        .and_then(Value::as_str)
        .map(String::from)
}

/// Attempt-keyed run name; retries advance the index through the status, so
/// repeating a trigger for the same attempt reattaches instead of
/// duplicating.
fn run_name(recipe: &str, job: &NotebookValidationJob) -> String {
    let attempt = job.status.as_ref().map(|status| status.build_retry_count).unwrap_or(0) + 1;
    format!("{recipe}-run-{attempt}")
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;
    use nbv_crds::{NotebookSource, NotebookValidationJobSpec};

    use super::*;

    fn test_job(credentials: Option<&str>) -> NotebookValidationJob {
        NotebookValidationJob {
            metadata: ObjectMeta {
                name: Some("demo".into()),
                namespace: Some("workspace".into()),
                uid: Some("uid-demo".into()),
                ..Default::default()
            },
            spec: NotebookValidationJobSpec {
                source: NotebookSource {
                    url: "https://github.com/acme/notebooks.git".into(),
                    reference: Some("develop".into()),
                    path: "nb.ipynb".into(),
                    credentials_secret: credentials.map(String::from),
                },
                build: Some(BuildSettings { enabled: true, ..Default::default() }),
                ..Default::default()
            },
            status: None,
        }
    }

    fn param_value(object: &DynamicObject, name: &str) -> Option<String> {
        run_param(&object.data, name)
    }

    #[test]
    fn test_pipeline_tasks_are_chained() {
        let pipeline = new_pipeline(&test_job(None), "demo-pipeline").unwrap();
        let tasks = pipeline.data.pointer("/spec/tasks").and_then(Value::as_array).unwrap();

        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].get("name").and_then(Value::as_str), Some("fetch-repository"));
        assert_eq!(tasks[1].pointer("/runAfter/0").and_then(Value::as_str), Some("fetch-repository"));
        assert_eq!(tasks[2].pointer("/runAfter/0").and_then(Value::as_str), Some("generate-dockerfile"));

        // Task references are namespace-scoped.
        assert_eq!(tasks[0].pointer("/taskRef/kind").and_then(Value::as_str), Some("Task"));
        assert_eq!(tasks[2].pointer("/taskRef/kind").and_then(Value::as_str), Some("Task"));
    }

    #[test]
    fn test_pipeline_declares_expected_params() {
        let pipeline = new_pipeline(&test_job(None), "demo-pipeline").unwrap();
        let params: Vec<&str> = pipeline
            .data
            .pointer("/spec/params")
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .filter_map(|param| param.get("name").and_then(Value::as_str))
            .collect();

        assert_eq!(params, vec!["git-url", "git-revision", "image-reference", "base-image", "dockerfile-path"]);
    }

    #[test]
    fn test_run_workspace_and_pod_template() {
        let run = new_pipeline_run(&test_job(None), "demo-pipeline", "demo-pipeline-run-1", None).unwrap();

        assert_eq!(
            run.data
                .pointer("/spec/workspaces/0/volumeClaimTemplate/spec/resources/requests/storage")
                .and_then(Value::as_str),
            Some("1Gi")
        );
        assert_eq!(
            run.data.pointer("/spec/podTemplate/securityContext/fsGroup").and_then(Value::as_i64),
            Some(WORKSPACE_FS_GROUP)
        );
        assert_eq!(run.data.pointer("/spec/workspaces").and_then(Value::as_array).unwrap().len(), 1);
    }

    #[test]
    fn test_run_binds_credential_workspace() {
        let run = new_pipeline_run(
            &test_job(Some("git-creds")),
            "demo-pipeline",
            "demo-pipeline-run-1",
            Some("git-creds-tekton"),
        )
        .unwrap();

        assert_eq!(
            run.data.pointer("/spec/workspaces/1/secret/secretName").and_then(Value::as_str),
            Some("git-creds-tekton")
        );
    }

    #[test]
    fn test_run_params_come_from_the_job() {
        let run = new_pipeline_run(&test_job(None), "demo-pipeline", "demo-pipeline-run-1", None).unwrap();

        assert_eq!(param_value(&run, "git-url").as_deref(), Some("https://github.com/acme/notebooks.git"));
        assert_eq!(param_value(&run, "git-revision").as_deref(), Some("develop"));
        assert_eq!(
            param_value(&run, "image-reference").as_deref(),
            Some("image-registry.openshift-image-registry.svc:5000/workspace/demo:latest")
        );
    }

    #[test]
    fn test_image_repository_override() {
        let mut job = test_job(None);
        job.spec.build.as_mut().unwrap().strategy_config =
            Some([("imageRepository".to_string(), "quay.io/acme/demo".to_string())].into());

        assert_eq!(image_reference(&job, "workspace"), "quay.io/acme/demo:latest");
    }

    #[test]
    fn test_status_mapping_from_succeeded_condition() {
        let run_with = |status: &str| -> DynamicObject {
            from_value(json!({
                "apiVersion": "tekton.dev/v1beta1",
                "kind": "PipelineRun",
                "metadata": { "name": "demo-pipeline-run-1" },
                "spec": { "params": [ { "name": "image-reference", "value": "quay.io/acme/demo:latest" } ] },
                "status": {
                    "conditions": [ { "type": "Succeeded", "status": status, "message": "m" } ],
                },
            }))
            .unwrap()
        };

        assert_eq!(build_info(&run_with("True")).status, WorkPhase::Complete);
        assert_eq!(build_info(&run_with("False")).status, WorkPhase::Failed);
        assert_eq!(build_info(&run_with("Unknown")).status, WorkPhase::Running);

        // Image reference only surfaces once complete.
        assert_eq!(build_info(&run_with("True")).image_reference.as_deref(), Some("quay.io/acme/demo:latest"));
        assert!(build_info(&run_with("Unknown")).image_reference.is_none());
    }

    #[test]
    fn test_no_conditions_means_pending() {
        let run: DynamicObject = from_value(json!({
            "apiVersion": "tekton.dev/v1beta1",
            "kind": "PipelineRun",
            "metadata": { "name": "demo-pipeline-run-1" },
            "spec": {},
        }))
        .unwrap();

        assert_eq!(build_info(&run).status, WorkPhase::Pending);
    }

    #[test]
    fn test_validate_config_rejects_traversal() {
        let strategy = PipelineStrategy::new("nbv-system");

        let bad = BuildSettings {
            enabled: true,
            dockerfile: Some("../../etc/shadow".into()),
            ..Default::default()
        };
        assert!(strategy.validate_config(&bad).is_err());

        let empty_repository = BuildSettings {
            enabled: true,
            strategy_config: Some([("imageRepository".to_string(), String::new())].into()),
            ..Default::default()
        };
        assert!(strategy.validate_config(&empty_repository).is_err());

        let good = BuildSettings {
            enabled: true,
            dockerfile: Some("docker/Dockerfile".into()),
            ..Default::default()
        };
        assert!(strategy.validate_config(&good).is_ok());
    }

    #[test]
    fn test_run_name_follows_the_attempt_index() {
        let mut job = test_job(None);
        assert_eq!(run_name("demo-pipeline", &job), "demo-pipeline-run-1");

        job.status =
            Some(nbv_crds::NotebookValidationJobStatus { build_retry_count: 1, ..Default::default() });
        assert_eq!(run_name("demo-pipeline", &job), "demo-pipeline-run-2");
    }
}
