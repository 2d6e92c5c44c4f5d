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

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ResourceRequirements, Volume};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::status::NotebookValidationJobStatus;

/// Fallback branch when the notebook source does not pin one.
pub const DEFAULT_GIT_REFERENCE: &str = "main";

/// Base image used for synthesized Dockerfiles unless the build overrides it.
pub const DEFAULT_BASE_IMAGE: &str = "registry.access.redhat.com/ubi9/python-311:latest";

const DEFAULT_BUILD_TIMEOUT_SECONDS: i64 = 1800;
const DEFAULT_VALIDATION_TIMEOUT_SECONDS: i64 = 600;
const DEFAULT_MAX_BUILD_RETRIES: i32 = 1;
const DEFAULT_MAX_VALIDATION_RETRIES: i32 = 3;

#[derive(CustomResource, Default, Deserialize, Serialize, Clone, Debug, JsonSchema, Validate)]
#[kube(
    group = "mlops.nbvalidator.dev",
    version = "v1alpha1",
    kind = "NotebookValidationJob",
    status = "NotebookValidationJobStatus",
    namespaced,
    shortname = "nvj"
)]
#[serde(rename_all = "camelCase")]
pub struct NotebookValidationJobSpec {
    /// Where the notebook lives and how to check it out
    #[validate]
    pub source: NotebookSource,
    /// Runtime settings for the validation pod
    #[serde(default)]
    pub pod: PodOverrides,
    /// Optional custom image build for the validation run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSettings>,
    /// How strictly the executed notebook is judged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationPolicy>,
    /// Per-attempt deadline for the build phase, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_timeout: Option<i64>,
    /// Per-attempt deadline for the validation phase, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_timeout: Option<i64>,
    /// Legacy single deadline, used when the phase-specific ones are unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_build_retries: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_validation_retries: Option<i32>,
}

impl NotebookValidationJobSpec {
    pub fn build_enabled(&self) -> bool {
        self.build.as_ref().map_or(false, |build| build.enabled)
    }

    pub fn build_timeout_seconds(&self) -> i64 {
        self.build_timeout.or(self.timeout).unwrap_or(DEFAULT_BUILD_TIMEOUT_SECONDS)
    }

    pub fn validation_timeout_seconds(&self) -> i64 {
        self.validation_timeout.or(self.timeout).unwrap_or(DEFAULT_VALIDATION_TIMEOUT_SECONDS)
    }

    pub fn build_retry_limit(&self) -> i32 {
        self.max_build_retries.unwrap_or(DEFAULT_MAX_BUILD_RETRIES).max(1)
    }

    pub fn validation_retry_limit(&self) -> i32 {
        self.max_validation_retries.unwrap_or(DEFAULT_MAX_VALIDATION_RETRIES).max(1)
    }
}

/// A notebook inside a git checkout.
#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotebookSource {
    /// The git URL of the repository
    #[validate(url)]
    pub url: String,
    /// Branch, tag or commit; the platform default branch when unset
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Path of the notebook file inside the checkout
    #[validate(length(min = 1))]
    pub path: String,
    /// Name of a basic-auth secret in the same namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,
}

impl NotebookSource {
    pub fn rev(&self) -> String {
        self.reference.clone().unwrap_or_else(|| DEFAULT_GIT_REFERENCE.to_string())
    }
}

/// Pod-level knobs for the validation run. `container_image` is only a
/// fallback for jobs that do not build a custom image.
#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodOverrides {
    #[serde(default)]
    pub container_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

/// How (and whether) to build a custom image before validation.
#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Strategy name ("s2i", "pipeline"); auto-detected when blank
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    /// Relative path of a Dockerfile inside the checkout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_generate_requirements: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements_file: Option<String>,
    /// Ordered candidate paths consulted before auto-detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements_sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer_dockerfile: Option<bool>,
    /// Backend-specific settings, passed through to the selected strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_config: Option<BTreeMap<String, String>>,
}

impl BuildSettings {
    pub fn base_image(&self) -> String {
        self.base_image.clone().unwrap_or_else(|| DEFAULT_BASE_IMAGE.to_string())
    }

    pub fn strategy(&self) -> Option<&str> {
        self.strategy.as_deref().filter(|name| !name.is_empty())
    }

    pub fn prefer_dockerfile(&self) -> bool {
        self.prefer_dockerfile.unwrap_or(false)
    }

    pub fn auto_generate_requirements(&self) -> bool {
        self.auto_generate_requirements.unwrap_or(true)
    }

    pub fn config(&self, key: &str) -> Option<&str> {
        self.strategy_config.as_ref().and_then(|config| config.get(key)).map(String::as_str)
    }
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    #[default]
    Lax,
    Strict,
}

/// One expectation against an executed cell, forwarded verbatim to the
/// in-pod tool.
#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedOutput {
    pub cell: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strictness: Option<Strictness>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outputs: Option<Vec<ExpectedOutput>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub educational_mode: Option<bool>,
}

impl ValidationPolicy {
    pub fn strict(&self) -> bool {
        self.strictness == Some(Strictness::Strict)
    }

    pub fn educational(&self) -> bool {
        self.educational_mode.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec = NotebookValidationJobSpec::default();

        assert!(!spec.build_enabled());
        assert_eq!(spec.build_timeout_seconds(), 1800);
        assert_eq!(spec.validation_timeout_seconds(), 600);
        assert_eq!(spec.build_retry_limit(), 1);
        assert_eq!(spec.validation_retry_limit(), 3);
    }

    #[test]
    fn test_legacy_timeout_fallback() {
        let spec = NotebookValidationJobSpec { timeout: Some(120), ..Default::default() };

        assert_eq!(spec.build_timeout_seconds(), 120);
        assert_eq!(spec.validation_timeout_seconds(), 120);

        let spec = NotebookValidationJobSpec {
            timeout: Some(120),
            build_timeout: Some(900),
            ..Default::default()
        };
        assert_eq!(spec.build_timeout_seconds(), 900);
        assert_eq!(spec.validation_timeout_seconds(), 120);
    }

    #[test]
    fn test_source_rev() {
        let mut source = NotebookSource { url: "https://example.com/repo.git".into(), ..Default::default() };
        assert_eq!(source.rev(), "main");

        source.reference = Some("v1.2.3".into());
        assert_eq!(source.rev(), "v1.2.3");
    }

    #[test]
    fn test_build_settings_helpers() {
        let mut build = BuildSettings { enabled: true, ..Default::default() };
        assert_eq!(build.base_image(), DEFAULT_BASE_IMAGE);
        assert!(build.strategy().is_none());
        assert!(build.auto_generate_requirements());

        build.strategy = Some("".into());
        assert!(build.strategy().is_none());

        build.strategy = Some("pipeline".into());
        assert_eq!(build.strategy(), Some("pipeline"));

        build.strategy_config = Some(std::collections::BTreeMap::from([(
            "imageRepository".to_string(),
            "quay.io/acme/nb".to_string(),
        )]));
        assert_eq!(build.config("imageRepository"), Some("quay.io/acme/nb"));
        assert_eq!(build.config("missing"), None);
    }
}
