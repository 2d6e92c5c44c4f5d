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

//! Source-to-image build driver.
//!
//! The recipe is an OpenShift `BuildConfig`, each run is a `Build`, and the
//! output lands in an `ImageStream` tag in the job's namespace.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::{Api, Client, Resource, ResourceExt};
use nbv_crds::{BuildSettings, NotebookValidationJob, WorkPhase};
use serde_json::{from_value, json};
use tracing::{debug, info};

use super::{kind_served, select_latest, status_time, BuildInfo, BuildStrategy};
use crate::error::{Error, Result};
use crate::{hash, labels, LAST_APPLIED_HASH_KEY};

const BUILD_GROUP: &str = "build.openshift.io";
const IMAGE_GROUP: &str = "image.openshift.io";
const VERSION: &str = "v1";

/// Label OpenShift itself uses to link a Build back to its BuildConfig.
const BUILD_CONFIG_LABEL: &str = "openshift.io/build-config.name";

#[derive(Default)]
pub struct S2iStrategy;

#[async_trait]
impl BuildStrategy for S2iStrategy {
    fn name(&self) -> &'static str {
        "s2i"
    }

    fn recipe_name(&self, job: &NotebookValidationJob) -> String {
        format!("{}-build", job.name_any())
    }

    async fn detect(&self, client: &Client) -> Result<bool> {
        kind_served(client, &build_config_resource()).await
    }

    fn validate_config(&self, build: &BuildSettings) -> Result<()> {
        if build.base_image.as_deref().map_or(true, str::is_empty) {
            return Err(Error::InvalidBuildConfig("baseImage is required for s2i builds".into()));
        }
        Ok(())
    }

    async fn create_build(&self, client: &Client, job: &NotebookValidationJob) -> Result<BuildInfo> {
        let namespace = job.namespace().ok_or_else(|| Error::MissingObjectKey(".metadata.namespace"))?;
        let recipe = self.recipe_name(job);

        ensure_image_stream(client, &namespace, job).await?;
        ensure_build_config(client, &namespace, job, &recipe).await?;

        self.trigger_build(client, job).await
    }

    async fn get_build(&self, client: &Client, namespace: &str, name: &str) -> Result<Option<BuildInfo>> {
        let build = builds(client, namespace).get_opt(name).await.map_err(Error::KubeError)?;
        Ok(build.as_ref().map(build_info))
    }

    async fn get_latest_build(&self, client: &Client, namespace: &str, recipe: &str) -> Result<Option<BuildInfo>> {
        let runs = list_runs(client, namespace, recipe).await?;
        Ok(select_latest(runs.iter().map(build_info).collect()))
    }

    async fn trigger_build(&self, client: &Client, job: &NotebookValidationJob) -> Result<BuildInfo> {
        let namespace = job.namespace().ok_or_else(|| Error::MissingObjectKey(".metadata.namespace"))?;
        let recipe = self.recipe_name(job);

        let name = run_name(&recipe, job);
        let api = builds(client, &namespace);

        if let Some(existing) = api.get_opt(&name).await.map_err(Error::KubeError)? {
            debug!("Build {} already exists, reusing it", name);
            return Ok(build_info(&existing));
        }

        let resource = new_build(job, &recipe, &name)?;
        let build = match api.create(&PostParams::default(), &resource).await {
            Ok(created) => created,
            Err(kube::Error::Api(response)) if response.code == 409 => {
                api.get(&name).await.map_err(Error::KubeError)?
            }
            Err(err) => return Err(Error::KubeError(err)),
        };
        info!("Created Build: {}/{}", namespace, build.name_any());

        Ok(build_info(&build))
    }

    async fn cleanup_old_builds(&self, client: &Client, namespace: &str, recipe: &str, keep: usize) -> Result<()> {
        let mut runs = list_runs(client, namespace, recipe).await?;
        runs.sort_by_key(|run| std::cmp::Reverse(run.creation_timestamp().map(|time| time.0)));

        let api = builds(client, namespace);
        for run in runs.iter().skip(keep) {
            let info = build_info(run);
            if info.status == WorkPhase::Running {
                continue;
            }
            api.delete(&run.name_any(), &DeleteParams::default()).await.map_err(Error::KubeError)?;
            info!("Deleted old Build: {}/{}", namespace, run.name_any());
        }

        Ok(())
    }

    async fn delete_build(&self, client: &Client, namespace: &str, name: &str) -> Result<()> {
        let api = builds(client, namespace);
        let Some(run) = api.get_opt(name).await.map_err(Error::KubeError)? else {
            return Ok(());
        };

        let recipe = run.labels().get(BUILD_CONFIG_LABEL).cloned();
        api.delete(name, &DeleteParams::default()).await.map_err(Error::KubeError)?;
        info!("Deleted Build: {}/{}", namespace, name);

        // The recipe goes with its last run.
        if let Some(recipe) = recipe {
            if list_runs(client, namespace, &recipe).await?.is_empty() {
                let configs = build_configs(client, namespace);
                if configs.get_opt(&recipe).await.map_err(Error::KubeError)?.is_some() {
                    configs.delete(&recipe, &DeleteParams::default()).await.map_err(Error::KubeError)?;
                    info!("Deleted BuildConfig: {}/{}", namespace, recipe);
                }
            }
        }

        Ok(())
    }

    async fn build_logs(&self, client: &Client, namespace: &str, name: &str) -> Result<String> {
        // s2i runs execute in a companion pod named after the build.
        let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
        pods.logs(&format!("{name}-build"), &LogParams::default()).await.map_err(Error::KubeError)
    }
}

#[inline]
fn build_config_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(BUILD_GROUP, VERSION, "BuildConfig"))
}

/// The run kind, exposed so the controller can watch owned Builds.
#[inline]
pub fn build_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(BUILD_GROUP, VERSION, "Build"))
}

#[inline]
fn image_stream_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(IMAGE_GROUP, VERSION, "ImageStream"))
}

fn builds(client: &Client, namespace: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client.clone(), namespace, &build_resource())
}

fn build_configs(client: &Client, namespace: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client.clone(), namespace, &build_config_resource())
}

async fn list_runs(client: &Client, namespace: &str, recipe: &str) -> Result<Vec<DynamicObject>> {
    let params = ListParams::default().labels(&format!("{BUILD_CONFIG_LABEL}={recipe}"));
    let runs = builds(client, namespace).list(&params).await.map_err(Error::KubeError)?;
    Ok(runs.items)
}

async fn ensure_image_stream(client: &Client, namespace: &str, job: &NotebookValidationJob) -> Result<()> {
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &image_stream_resource());
    let name = job.name_any();

    if api.get_opt(&name).await.map_err(Error::KubeError)?.is_some() {
        return Ok(());
    }

    let resource = from_value(json!({
        "apiVersion": format!("{IMAGE_GROUP}/{VERSION}"),
        "kind": "ImageStream",
        "metadata": {
            "name": name,
            "labels": labels(job),
            "ownerReferences": vec![job.controller_owner_ref(&()).unwrap()],
        },
        "spec": {
            "lookupPolicy": { "local": true },
        },
    }))
    .map_err(Error::SerializationError)?;

    match api.create(&PostParams::default(), &resource).await {
        Ok(stream) => info!("Created ImageStream: {}/{}", namespace, stream.name_any()),
        Err(kube::Error::Api(response)) if response.code == 409 => {}
        Err(err) => return Err(Error::KubeError(err)),
    }

    Ok(())
}

async fn ensure_build_config(
    client: &Client,
    namespace: &str,
    job: &NotebookValidationJob,
    recipe: &str,
) -> Result<()> {
    let api = build_configs(client, namespace);
    let resource = new_build_config(job, recipe)?;

    match api.get_opt(recipe).await.map_err(Error::KubeError)? {
        None => match api.create(&PostParams::default(), &resource).await {
            Ok(config) => info!("Created BuildConfig: {}/{}", namespace, config.name_any()),
            Err(kube::Error::Api(response)) if response.code == 409 => {}
            Err(err) => return Err(Error::KubeError(err)),
        },
        Some(existing) => {
            let expected = hash(&job.spec)?;
            let found = existing.annotations().get(LAST_APPLIED_HASH_KEY).cloned().unwrap_or_default();
            if found != expected {
                api.patch(recipe, &PatchParams::apply("nbv-controllers").force(), &Patch::Apply(&resource))
                    .await
                    .map_err(Error::KubeError)?;
                info!("Updated BuildConfig: {}/{}", namespace, recipe);
            }
        }
    }

    Ok(())
}

/// The long-lived recipe: git source, s2i strategy from the base image, and
/// an image-stream tag as output.
fn new_build_config(job: &NotebookValidationJob, recipe: &str) -> Result<DynamicObject> {
    let build = job.spec.build.clone().unwrap_or_default();
    let owner_reference = job.controller_owner_ref(&()).unwrap();

    let mut source = json!({
        "type": "Git",
        "git": {
            "uri": job.spec.source.url,
            "ref": job.spec.source.rev(),
        },
    });
    if let Some(secret) = &job.spec.source.credentials_secret {
        source["sourceSecret"] = json!({ "name": secret });
    }

    from_value(json!({
        "apiVersion": format!("{BUILD_GROUP}/{VERSION}"),
        "kind": "BuildConfig",
        "metadata": {
            "name": recipe,
            "labels": labels(job),
            "annotations": { (LAST_APPLIED_HASH_KEY): hash(&job.spec)? },
            "ownerReferences": vec![owner_reference],
        },
        "spec": {
            "runPolicy": "Serial",
            "source": source,
            "strategy": {
                "type": "Source",
                "sourceStrategy": {
                    "from": { "kind": "DockerImage", "name": build.base_image() },
                },
            },
            "output": {
                "to": { "kind": "ImageStreamTag", "name": format!("{}:latest", job.name_any()) },
            },
        },
    }))
    .map_err(Error::SerializationError)
}

/// A single run: the recipe's spec stamped with the run name and the
/// back-link label OpenShift uses for its own builds.
fn new_build(job: &NotebookValidationJob, recipe: &str, name: &str) -> Result<DynamicObject> {
    let config = new_build_config(job, recipe)?;
    let mut run_labels = labels(job);
    run_labels.insert(BUILD_CONFIG_LABEL.into(), recipe.to_string());

    from_value(json!({
        "apiVersion": format!("{BUILD_GROUP}/{VERSION}"),
        "kind": "Build",
        "metadata": {
            "name": name,
            "labels": run_labels,
            "ownerReferences": vec![job.controller_owner_ref(&()).unwrap()],
        },
        "spec": config.data.pointer("/spec").cloned().unwrap_or_default(),
    }))
    .map_err(Error::SerializationError)
}

fn build_info(build: &DynamicObject) -> BuildInfo {
    let phase = build.data.pointer("/status/phase").and_then(|value| value.as_str()).unwrap_or_default();
    let message =
        build.data.pointer("/status/message").and_then(|value| value.as_str()).unwrap_or_default().to_string();
    let image_reference = build
        .data
        .pointer("/status/outputDockerImageReference")
        .and_then(|value| value.as_str())
        .map(String::from);

    BuildInfo {
        name: build.name_any(),
        status: phase_from(phase),
        message,
        image_reference,
        start_time: status_time(build, "/status/startTimestamp"),
        completion_time: status_time(build, "/status/completionTimestamp"),
        created: build.creation_timestamp(),
    }
}

/// Attempt-keyed run name; retries advance the index through the status, so
/// repeating a trigger for the same attempt reattaches instead of
/// duplicating.
fn run_name(recipe: &str, job: &NotebookValidationJob) -> String {
    let attempt = job.status.as_ref().map(|status| status.build_retry_count).unwrap_or(0) + 1;
    format!("{recipe}-{attempt}")
}

fn phase_from(phase: &str) -> WorkPhase {
    match phase {
        "New" | "Pending" => WorkPhase::Pending,
        "Running" => WorkPhase::Running,
        "Complete" => WorkPhase::Complete,
        "Failed" | "Error" => WorkPhase::Failed,
        "Cancelled" => WorkPhase::Cancelled,
        _ => WorkPhase::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;
    use nbv_crds::{NotebookSource, NotebookValidationJobSpec, PodOverrides};

    use super::*;

    fn test_job() -> NotebookValidationJob {
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
                    path: "nb.ipynb".into(),
                    ..Default::default()
                },
                pod: PodOverrides::default(),
                build: Some(BuildSettings {
                    enabled: true,
                    base_image: Some("registry.access.redhat.com/ubi9/python-311".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(phase_from("New"), WorkPhase::Pending);
        assert_eq!(phase_from("Pending"), WorkPhase::Pending);
        assert_eq!(phase_from("Running"), WorkPhase::Running);
        assert_eq!(phase_from("Complete"), WorkPhase::Complete);
        assert_eq!(phase_from("Failed"), WorkPhase::Failed);
        assert_eq!(phase_from("Error"), WorkPhase::Failed);
        assert_eq!(phase_from("Cancelled"), WorkPhase::Cancelled);
        assert_eq!(phase_from("Bogus"), WorkPhase::Unknown);
    }

    #[test]
    fn test_recipe_manifest_shape() {
        let job = test_job();
        let config = new_build_config(&job, "demo-build").unwrap();

        assert_eq!(config.name_any(), "demo-build");
        assert_eq!(
            config.data.pointer("/spec/source/git/uri").and_then(|v| v.as_str()),
            Some("https://github.com/acme/notebooks.git")
        );
        assert_eq!(config.data.pointer("/spec/source/git/ref").and_then(|v| v.as_str()), Some("main"));
        assert_eq!(
            config.data.pointer("/spec/strategy/sourceStrategy/from/name").and_then(|v| v.as_str()),
            Some("registry.access.redhat.com/ubi9/python-311")
        );
        assert_eq!(
            config.data.pointer("/spec/output/to/name").and_then(|v| v.as_str()),
            Some("demo:latest")
        );
        assert!(config.data.pointer("/spec/source/sourceSecret").is_none());
    }

    #[test]
    fn test_recipe_carries_source_secret() {
        let mut job = test_job();
        job.spec.source.credentials_secret = Some("git-creds".into());

        let config = new_build_config(&job, "demo-build").unwrap();
        assert_eq!(
            config.data.pointer("/spec/source/sourceSecret/name").and_then(|v| v.as_str()),
            Some("git-creds")
        );
    }

    #[test]
    fn test_run_links_back_to_recipe() {
        let job = test_job();
        let run = new_build(&job, "demo-build", "demo-build-1").unwrap();

        assert_eq!(run.name_any(), "demo-build-1");
        assert_eq!(run.labels().get(BUILD_CONFIG_LABEL).map(String::as_str), Some("demo-build"));
        assert_eq!(
            run.labels().get("mlops.nbvalidator.dev/notebook-validation").map(String::as_str),
            Some("true")
        );
        assert!(run.data.pointer("/spec/source/git").is_some());
    }

    #[test]
    fn test_validate_config_requires_base_image() {
        let strategy = S2iStrategy;

        let missing = BuildSettings { enabled: true, ..Default::default() };
        assert!(strategy.validate_config(&missing).is_err());

        let present = BuildSettings { enabled: true, base_image: Some("python:3.11".into()), ..Default::default() };
        assert!(strategy.validate_config(&present).is_ok());
    }

    #[test]
    fn test_run_name_follows_the_attempt_index() {
        let mut job = test_job();
        assert_eq!(run_name("demo-build", &job), "demo-build-1");

        job.status = Some(nbv_crds::NotebookValidationJobStatus { build_retry_count: 2, ..Default::default() });
        assert_eq!(run_name("demo-build", &job), "demo-build-3");
    }
}
