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

//! The NotebookValidationJob reconciler.
//!
//! Each invocation performs one idempotent step against the observed state
//! and either settles or asks to be re-queued. Waiting on builds and pods is
//! done through watches and re-queues, never by blocking. Validation is only
//! reachable from BuildComplete (or directly from Initializing when no build
//! is configured), which is what enforces the build-before-validate
//! ordering.

use std::sync::Arc;
use std::time::Duration;

use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::{Duration as TimeDelta, Utc};
use kube::api::{DynamicObject, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::events::Recorder;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::{watcher, Controller};
use kube::{Api, Resource, ResourceExt};
use nbv_crds::{JobPhase, JobState, NotebookValidationJob, NotebookValidationJobStatus, WorkPhase, WorkStatus};
use nbv_resources::error::Error as ResourceError;
use nbv_resources::job::patch_status;
use nbv_resources::strategy::{pipeline, s2i, BuildInfo, BuildStrategy};
use nbv_resources::{dockerfile, event, pod, security, service_account};
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::context::Context;
use crate::errors::{Error, Result};

const FINALIZER_NAME: &str = "notebookvalidationjobs.mlops.nbvalidator.dev/finalizer";

pub async fn new(ctx: &Arc<Context>) {
    let api = Api::<NotebookValidationJob>::all(ctx.k8s.clone());

    // Ensure the CRD is installed before loop-watching
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("NotebookValidationJob CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: nbv-crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let mut controller = Controller::new(api, watcher::Config::default())
        .owns(Api::<Pod>::all(ctx.k8s.clone()), watcher::Config::default());

    // Watch the backend run kinds where their CRDs are actually served, so
    // build progress resumes reconciliation without polling.
    if ctx.cluster.capabilities.build {
        let resource = s2i::build_resource();
        let api = Api::<DynamicObject>::all_with(ctx.k8s.clone(), &resource);
        controller = controller.owns_with(api, resource, watcher::Config::default());
    }
    if ctx.cluster.capabilities.pipelines {
        let resource = pipeline::pipeline_run_resource();
        let api = Api::<DynamicObject>::all_with(ctx.k8s.clone(), &resource);
        controller = controller.owns_with(api, resource, watcher::Config::default());
    }

    controller.run(reconcile, error_policy, ctx.clone()).for_each(|_| future::ready(())).await
}

/// The reconciler that will be called when either object change
pub async fn reconcile(job: Arc<NotebookValidationJob>, ctx: Arc<Context>) -> Result<Action> {
    info!("Reconciling NotebookValidationJob \"{}\"", job.name_any());

    let ns = job.namespace().unwrap(); // job is namespace scoped
    let api: Api<NotebookValidationJob> = Api::namespaced(ctx.k8s.clone(), &ns);

    finalizer(&api, FINALIZER_NAME, job, |event| async {
        match event {
            FinalizerEvent::Apply(job) => apply(&job, &ctx).await,
            FinalizerEvent::Cleanup(job) => cleanup(&job, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

/// an error handler that will be called when the reconciler fails with access to both the
/// object that caused the failure and the actual error
pub fn error_policy(_job: Arc<NotebookValidationJob>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!("reconcile failed: {:?}", error);
    Action::requeue(Duration::from_secs(60))
}

async fn apply(job: &NotebookValidationJob, ctx: &Arc<Context>) -> Result<Action> {
    let recorder = ctx.recorder(reference(job));
    let status = job.status.clone().unwrap_or_default();

    // A spec edit after a terminal phase re-plans the job from scratch. An
    // edit mid-build is deliberately left alone; the running build finishes
    // and its output is re-evaluated on the next pass through here.
    if status.phase.terminal() && status.observed_generation != job.metadata.generation {
        event::publish(&recorder, "SpecChanged", "spec changed, re-planning the job", false).await;
        reset_attempts(job, ctx).await?;

        let status = NotebookValidationJobStatus {
            observed_generation: job.metadata.generation,
            ..Default::default()
        };
        patch_status(&ctx.k8s, job, &status).await.map_err(Error::ResourceError)?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    match status.phase {
        JobPhase::Initializing => init(job, ctx, &recorder, status).await,
        JobPhase::Building => building(job, ctx, &recorder, status).await,
        JobPhase::BuildComplete => build_complete(job, ctx, status).await,
        JobPhase::ValidationRunning => validating(job, ctx, &recorder, status).await,
        JobPhase::Succeeded | JobPhase::Failed => Ok(Action::await_change()),
    }
}

/// Validate the spec and decide the first real phase. Validation may only be
/// entered directly from here when no build is configured.
async fn init(
    job: &NotebookValidationJob,
    ctx: &Arc<Context>,
    recorder: &Recorder,
    mut status: NotebookValidationJobStatus,
) -> Result<Action> {
    status.observed_generation = job.metadata.generation;

    if let Err(message) = validate(job) {
        return fail(job, ctx, recorder, status, "SpecInvalid", message).await;
    }

    status.record(JobState::initialized());
    if job.spec.build_enabled() {
        status.phase = JobPhase::Building;
        event::publish(recorder, "Initialized", "spec accepted, starting the build", false).await;
    } else {
        status.phase = JobPhase::ValidationRunning;
        event::publish(recorder, "Initialized", "spec accepted, starting validation", false).await;
    }

    patch_status(&ctx.k8s, job, &status).await.map_err(Error::ResourceError)?;
    Ok(Action::requeue(Duration::from_secs(1)))
}

async fn building(
    job: &NotebookValidationJob,
    ctx: &Arc<Context>,
    recorder: &Recorder,
    mut status: NotebookValidationJobStatus,
) -> Result<Action> {
    let namespace = job.namespace().unwrap();
    let build = job.spec.build.clone().unwrap_or_default();

    // Resolve the strategy before touching anything: a cluster without the
    // requested backend is terminal and must not leave resources behind.
    let strategy = match ctx.registry.select(&ctx.k8s, &build).await {
        Ok(strategy) => strategy,
        Err(
            err @ (ResourceError::StrategyNotFound(_)
            | ResourceError::StrategyUnavailable(_)
            | ResourceError::NoStrategyAvailable),
        ) => {
            return fail(job, ctx, recorder, status, "StrategyUnavailable", err.to_string()).await;
        }
        Err(err) => return Err(Error::ResourceError(err)),
    };

    if let Err(err) = strategy.validate_config(&build) {
        return fail(job, ctx, recorder, status, "SpecInvalid", err.to_string()).await;
    }

    // Prerequisites for build pods in the user namespace.
    service_account::ensure(&ctx.k8s, &namespace, &ctx.config.service_account_name)
        .await
        .map_err(Error::ResourceError)?;
    if ctx.cluster.capabilities.security {
        security::ensure_scc_user(
            &ctx.k8s,
            &ctx.config.security_context_constraint,
            &namespace,
            &ctx.config.service_account_name,
        )
        .await
        .map_err(Error::ResourceError)?;
    } else {
        debug!("Cluster has no security-context-constraint support, skipping the grant");
    }

    // Reattach to whatever run already exists (operator restarts land
    // here). A leftover terminal run means the recipe is already in place,
    // so the current attempt's run is triggered against it directly; only
    // the first contact sets the recipe up from scratch.
    let recipe = strategy.recipe_name(job);
    let latest = strategy.get_latest_build(&ctx.k8s, &namespace, &recipe).await.map_err(Error::ResourceError)?;
    let info = match latest {
        Some(info) if info.status == WorkPhase::Complete || info.status.active() => info,
        Some(_) => strategy.trigger_build(&ctx.k8s, job).await.map_err(Error::ResourceError)?,
        None => strategy.create_build(&ctx.k8s, job).await.map_err(Error::ResourceError)?,
    };

    let mut work = status.build.clone().unwrap_or_default();
    if work.start_time.is_none() {
        work.start_time = info.start_time.clone().or_else(|| Some(Time(Utc::now())));
        status.record(JobState::build_in_progress(Some(format!("run {}", info.name))));
        event::publish(recorder, "BuildStarted", format!("build run {} started", info.name), false).await;
    }
    work.phase = info.status;
    work.message = info.message.clone();
    work.completion_time = info.completion_time.clone();

    match info.status {
        WorkPhase::Complete => {
            let Some(image) = info.image_reference.clone() else {
                // A finished run without an image reference has not settled
                // in the backend yet; read again shortly.
                status.build = Some(work);
                patch_status(&ctx.k8s, job, &status).await.map_err(Error::ResourceError)?;
                return Ok(Action::requeue(Duration::from_secs(10)));
            };

            work.image_reference = Some(image.clone());
            status.build = Some(work);
            status.phase = JobPhase::BuildComplete;
            status.record(JobState::build_complete(&image));
            event::publish(recorder, "BuildSucceeded", format!("image {} is ready", image), false).await;

            if let Err(err) =
                strategy.cleanup_old_builds(&ctx.k8s, &namespace, &recipe, ctx.config.keep_builds).await
            {
                warn!("Failed to clean up old build runs: {}", err);
            }

            patch_status(&ctx.k8s, job, &status).await.map_err(Error::ResourceError)?;
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        WorkPhase::Failed | WorkPhase::Cancelled => {
            build_failure(job, ctx, recorder, status, work, strategy.as_ref(), &info, "BuildFailed").await
        }
        _ => {
            if deadline_exceeded(work.start_time.as_ref(), job.spec.build_timeout_seconds()) {
                return build_failure(job, ctx, recorder, status, work, strategy.as_ref(), &info, "BuildTimeout")
                    .await;
            }

            status.build = Some(work);
            patch_status(&ctx.k8s, job, &status).await.map_err(Error::ResourceError)?;
            Ok(Action::requeue(Duration::from_secs(30)))
        }
    }
}

/// A failed, cancelled or timed-out build run: spend one unit of the build
/// retry budget, or give up.
#[allow(clippy::too_many_arguments)]
async fn build_failure(
    job: &NotebookValidationJob,
    ctx: &Arc<Context>,
    recorder: &Recorder,
    mut status: NotebookValidationJobStatus,
    mut work: WorkStatus,
    strategy: &dyn BuildStrategy,
    info: &BuildInfo,
    reason: &str,
) -> Result<Action> {
    let namespace = job.namespace().unwrap();
    let limit = job.spec.build_retry_limit();
    status.build_retry_count += 1;

    if status.build_retry_count >= limit {
        work.phase = WorkPhase::Failed;
        status.build = Some(work);
        return fail(
            job,
            ctx,
            recorder,
            status,
            "BuildExhausted",
            format!("build failed {limit} time(s): {}", info.message),
        )
        .await;
    }

    status.record(JobState::retrying(reason, status.build_retry_count, limit));
    event::publish(
        recorder,
        reason,
        format!("build run {} failed, retrying ({}/{})", info.name, status.build_retry_count, limit),
        true,
    )
    .await;

    // Clean up the failed run and re-enter Building with a fresh attempt.
    strategy.delete_build(&ctx.k8s, &namespace, &info.name).await.map_err(Error::ResourceError)?;
    status.build = Some(WorkStatus { message: info.message.clone(), ..Default::default() });
    patch_status(&ctx.k8s, job, &status).await.map_err(Error::ResourceError)?;

    Ok(Action::requeue(backoff(status.build_retry_count)))
}

/// An intermediate phase with no work of its own; it exists so the ordering
/// between build completion and validation start is visible in the status
/// history.
async fn build_complete(
    job: &NotebookValidationJob,
    ctx: &Arc<Context>,
    mut status: NotebookValidationJobStatus,
) -> Result<Action> {
    status.phase = JobPhase::ValidationRunning;
    patch_status(&ctx.k8s, job, &status).await.map_err(Error::ResourceError)?;
    Ok(Action::requeue(Duration::from_secs(1)))
}

async fn validating(
    job: &NotebookValidationJob,
    ctx: &Arc<Context>,
    recorder: &Recorder,
    mut status: NotebookValidationJobStatus,
) -> Result<Action> {
    let namespace = job.namespace().unwrap();

    // A job with a build must never validate ahead of it. This is
    // unreachable through the state graph; if a hand-edited status gets
    // here anyway, route it back instead of starting a pod.
    let built_image = status.build.as_ref().and_then(|build| build.image_reference.clone());
    if job.spec.build_enabled() && (status.build_phase() != WorkPhase::Complete || built_image.is_none()) {
        warn!("Validation requested before the build completed, re-entering Building");
        status.phase = JobPhase::Building;
        patch_status(&ctx.k8s, job, &status).await.map_err(Error::ResourceError)?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let from_build = job.spec.build_enabled();
    let image = if from_build { built_image.unwrap() } else { job.spec.pod.container_image.clone() };

    let attempt = status.validation_retry_count + 1;
    let name = pod::pod_name(job, attempt);

    let mut work = status.validation.clone().unwrap_or_default();
    if work.start_time.is_none() {
        work.start_time = Some(Time(Utc::now()));
        status.record(JobState::validation_in_progress(Some(format!("pod {name}"))));
        event::publish(recorder, "ValidationStarted", format!("validation pod {name} starting"), false).await;
    }

    let Some(current) = pod::get(&ctx.k8s, &namespace, &name).await.map_err(Error::ResourceError)? else {
        let resource = pod::new(job, &image, from_build, attempt).map_err(Error::ResourceError)?;
        pod::create(&ctx.k8s, &namespace, resource).await.map_err(Error::ResourceError)?;

        work.phase = WorkPhase::Pending;
        status.validation = Some(work);
        patch_status(&ctx.k8s, job, &status).await.map_err(Error::ResourceError)?;
        return Ok(Action::requeue(Duration::from_secs(10)));
    };

    work.phase = pod::phase(&current);
    work.message = pod::message(&current);

    match work.phase {
        WorkPhase::Complete => {
            work.completion_time = Some(Time(Utc::now()));
            status.validation = Some(work);
            status.phase = JobPhase::Succeeded;
            status.record(JobState::succeeded(Some(format!("notebook {} validated", job.spec.source.path))));
            event::publish(recorder, "ValidationSucceeded", "notebook validated successfully", false).await;

            patch_status(&ctx.k8s, job, &status).await.map_err(Error::ResourceError)?;
            Ok(Action::await_change())
        }
        WorkPhase::Failed => {
            validation_failure(job, ctx, recorder, status, work, &name, "ValidationFailed").await
        }
        _ => {
            let started = current.creation_timestamp();
            if deadline_exceeded(started.as_ref(), job.spec.validation_timeout_seconds()) {
                return validation_failure(job, ctx, recorder, status, work, &name, "ValidationTimeout").await;
            }

            status.validation = Some(work);
            patch_status(&ctx.k8s, job, &status).await.map_err(Error::ResourceError)?;
            Ok(Action::requeue(Duration::from_secs(15)))
        }
    }
}

/// A failed or timed-out validation pod: spend one unit of the validation
/// retry budget, or give up.
async fn validation_failure(
    job: &NotebookValidationJob,
    ctx: &Arc<Context>,
    recorder: &Recorder,
    mut status: NotebookValidationJobStatus,
    mut work: WorkStatus,
    pod_name: &str,
    reason: &str,
) -> Result<Action> {
    let namespace = job.namespace().unwrap();
    let limit = job.spec.validation_retry_limit();
    status.validation_retry_count += 1;

    // The pod goes either way; retries get a fresh one under the next name.
    pod::delete(&ctx.k8s, &namespace, pod_name).await.map_err(Error::ResourceError)?;

    if status.validation_retry_count >= limit {
        work.phase = WorkPhase::Failed;
        let message = format!("validation failed {limit} time(s): {}", work.message);
        status.validation = Some(work);
        return fail(job, ctx, recorder, status, "ValidationExhausted", message).await;
    }

    status.record(JobState::retrying(reason, status.validation_retry_count, limit));
    event::publish(
        recorder,
        reason,
        format!("validation pod {pod_name} failed, retrying ({}/{})", status.validation_retry_count, limit),
        true,
    )
    .await;

    status.validation = Some(WorkStatus { message: work.message, ..Default::default() });
    patch_status(&ctx.k8s, job, &status).await.map_err(Error::ResourceError)?;

    Ok(Action::requeue(backoff(status.validation_retry_count)))
}

/// Terminal failure: record the condition, publish the event, stop.
async fn fail(
    job: &NotebookValidationJob,
    ctx: &Arc<Context>,
    recorder: &Recorder,
    mut status: NotebookValidationJobStatus,
    reason: &str,
    message: String,
) -> Result<Action> {
    status.phase = JobPhase::Failed;
    status.record(JobState::failed(reason, Some(message.clone())));
    event::publish(recorder, reason, message, true).await;

    patch_status(&ctx.k8s, job, &status).await.map_err(Error::ResourceError)?;
    Ok(Action::await_change())
}

pub async fn cleanup(job: &NotebookValidationJob, _ctx: &Arc<Context>) -> Result<Action> {
    // Everything the operator created for this job carries a controller
    // reference, so deletion cascades without any work here. The shared
    // service account and copied tasks stay for the namespace's other jobs.
    info!("Delete NotebookValidationJob `{}`", job.name_any());

    Ok(Action::await_change())
}

/// Drop run and pod leftovers of a settled job before re-planning it, so a
/// fresh pass cannot reattach to results built from the previous spec. Runs
/// still in flight are left to finish.
async fn reset_attempts(job: &NotebookValidationJob, ctx: &Arc<Context>) -> Result<()> {
    let namespace = job.namespace().unwrap();

    pod::delete_all(&ctx.k8s, &namespace, job).await.map_err(Error::ResourceError)?;

    for name in ctx.registry.names() {
        let Some(strategy) = ctx.registry.get(name) else { continue };
        if !strategy.detect(&ctx.k8s).await.map_err(Error::ResourceError)? {
            continue;
        }
        let recipe = strategy.recipe_name(job);
        if let Err(err) = strategy.cleanup_old_builds(&ctx.k8s, &namespace, &recipe, 0).await {
            warn!("Failed to drop old build runs for {}: {}", recipe, err);
        }
    }

    Ok(())
}

/// Spec-level validation, before any cluster resources are touched.
fn validate(job: &NotebookValidationJob) -> std::result::Result<(), String> {
    if let Err(errors) = job.spec.validate() {
        return Err(errors.to_string());
    }

    dockerfile::ensure_relative(&job.spec.source.path).map_err(|err| err.to_string())?;

    if !job.spec.build_enabled() && job.spec.pod.container_image.is_empty() {
        return Err("pod.containerImage is required when no build is configured".to_string());
    }

    Ok(())
}

/// Capped exponential backoff for the retry back-edges.
fn backoff(attempt: i32) -> Duration {
    let exponent = (attempt - 1).clamp(0, 5) as u32;
    Duration::from_secs((10u64 << exponent).min(300))
}

fn deadline_exceeded(start: Option<&Time>, seconds: i64) -> bool {
    match start {
        Some(start) => start.0 + TimeDelta::seconds(seconds) < Utc::now(),
        None => false,
    }
}

#[inline]
fn reference(job: &NotebookValidationJob) -> ObjectReference {
    job.object_ref(&())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::chrono::TimeZone;
    use kube::api::ObjectMeta;
    use nbv_crds::{NotebookSource, NotebookValidationJobSpec, PodOverrides};

    use super::*;

    fn test_job(image: &str, build_enabled: bool) -> NotebookValidationJob {
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
                pod: PodOverrides { container_image: image.into(), ..Default::default() },
                build: build_enabled.then(|| nbv_crds::BuildSettings { enabled: true, ..Default::default() }),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_secs(10));
        assert_eq!(backoff(2), Duration::from_secs(20));
        assert_eq!(backoff(3), Duration::from_secs(40));
        assert_eq!(backoff(6), Duration::from_secs(300));
        assert_eq!(backoff(50), Duration::from_secs(300));
    }

    #[test]
    fn test_deadline() {
        let past = Time(Utc.timestamp_opt(1_000, 0).unwrap());
        assert!(deadline_exceeded(Some(&past), 60));

        let now = Time(Utc::now());
        assert!(!deadline_exceeded(Some(&now), 3600));
        assert!(!deadline_exceeded(None, 0));
    }

    #[test]
    fn test_validate_requires_an_image_without_build() {
        let job = test_job("", false);
        assert!(validate(&job).is_err());

        let job = test_job("python:3.11", false);
        assert!(validate(&job).is_ok());

        // With a build the fallback image may be empty.
        let job = test_job("", true);
        assert!(validate(&job).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_source() {
        let mut job = test_job("python:3.11", false);
        job.spec.source.url = "not a url".into();
        assert!(validate(&job).is_err());

        let mut job = test_job("python:3.11", false);
        job.spec.source.path = "../../etc/passwd".into();
        assert!(validate(&job).is_err());
    }
}
