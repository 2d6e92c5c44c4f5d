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

//! The narrow waist between the reconciler and the build backends.

pub mod pipeline;
pub mod s2i;
pub mod tasks;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::api::ListParams;
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Api, Client};
use nbv_crds::{BuildSettings, NotebookValidationJob, WorkPhase};

use crate::error::{Error, Result};

pub use pipeline::PipelineStrategy;
pub use s2i::S2iStrategy;

/// Observed state of one build run, normalized across backends.
#[derive(Clone, Debug, Default)]
pub struct BuildInfo {
    pub name: String,
    pub status: WorkPhase,
    pub message: String,
    pub image_reference: Option<String>,
    pub start_time: Option<Time>,
    pub completion_time: Option<Time>,
    pub created: Option<Time>,
}

impl BuildInfo {
    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created.as_ref().map(|time| time.0)
    }
}

/// A pluggable build backend. All run and recipe names are deterministic so
/// that repeating an operation against unchanged inputs is a no-op.
#[async_trait]
pub trait BuildStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// The stable name of the long-lived build recipe for a job.
    fn recipe_name(&self, job: &NotebookValidationJob) -> String;

    /// Probe whether the backend's primary kind is served. A missing kind is
    /// `false`, not an error; forbidden or transport failures propagate.
    async fn detect(&self, client: &Client) -> Result<bool>;

    fn validate_config(&self, build: &BuildSettings) -> Result<()>;

    /// Create the recipe and its prerequisites, then start the run for the
    /// job's current attempt. Calling this again with the same observed
    /// state returns the existing run.
    async fn create_build(&self, client: &Client, job: &NotebookValidationJob) -> Result<BuildInfo>;

    async fn get_build(&self, client: &Client, namespace: &str, name: &str) -> Result<Option<BuildInfo>>;

    /// Find the authoritative run for a recipe: highest status class under
    /// Complete > Running > Pending > Failed, newest creation wins a tie.
    async fn get_latest_build(&self, client: &Client, namespace: &str, recipe: &str) -> Result<Option<BuildInfo>>;

    /// Start, or reattach to, the run for the job's current attempt against
    /// a recipe that already exists. Run names are keyed by the attempt
    /// index, so repeating this call cannot produce a duplicate run.
    async fn trigger_build(&self, client: &Client, job: &NotebookValidationJob) -> Result<BuildInfo>;

    /// Delete all but the newest `keep` runs of a recipe; running ones stay.
    async fn cleanup_old_builds(&self, client: &Client, namespace: &str, recipe: &str, keep: usize) -> Result<()>;

    async fn delete_build(&self, client: &Client, namespace: &str, name: &str) -> Result<()>;

    async fn build_logs(&self, client: &Client, namespace: &str, name: &str) -> Result<String>;
}

/// Name-keyed collection of the known strategies.
#[derive(Clone, Default)]
pub struct Registry {
    strategies: Vec<Arc<dyn BuildStrategy>>,
}

impl Registry {
    /// A registry with the built-in variants registered.
    pub fn builtin(system_namespace: &str) -> Self {
        let mut registry = Registry::default();
        registry.register(Arc::new(S2iStrategy::default()));
        registry.register(Arc::new(PipelineStrategy::new(system_namespace)));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn BuildStrategy>) {
        self.strategies.retain(|existing| existing.name() != strategy.name());
        self.strategies.push(strategy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BuildStrategy>> {
        self.strategies.iter().find(|strategy| strategy.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|strategy| strategy.name()).collect()
    }

    /// Resolve the strategy for a build: the named one when given, otherwise
    /// the first one whose backend is served by the cluster.
    pub async fn select(&self, client: &Client, build: &BuildSettings) -> Result<Arc<dyn BuildStrategy>> {
        if let Some(name) = build.strategy() {
            let strategy = self.get(name).ok_or_else(|| Error::StrategyNotFound(name.to_string()))?;
            if !strategy.detect(client).await? {
                return Err(Error::StrategyUnavailable(name.to_string()));
            }
            return Ok(strategy);
        }

        for strategy in &self.strategies {
            if strategy.detect(client).await? {
                return Ok(strategy.clone());
            }
        }

        Err(Error::NoStrategyAvailable)
    }
}

/// Pick the authoritative run among several, per the priority order above.
pub fn select_latest(builds: Vec<BuildInfo>) -> Option<BuildInfo> {
    builds.into_iter().max_by(|a, b| {
        a.status
            .priority()
            .cmp(&b.status.priority())
            .then_with(|| a.created_at().cmp(&b.created_at()))
    })
}

/// List-probe for a kind; a 404 means the kind is not registered.
pub(crate) async fn kind_served(client: &Client, resource: &ApiResource) -> Result<bool> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), resource);
    match api.list(&ListParams::default().limit(1)).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
        Err(err) => Err(Error::KubeError(err)),
    }
}

/// Parse a metadata timestamp out of a dynamic object's status block.
pub(crate) fn status_time(object: &DynamicObject, pointer: &str) -> Option<Time> {
    object
        .data
        .pointer(pointer)
        .and_then(|value| value.as_str())
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|parsed| Time(parsed.with_timezone(&Utc)))
}
