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

//! Cluster capability probing.
//!
//! Everything here is answered from a single discovery walk performed at
//! startup; the result is cached in the controller context for the lifetime
//! of the process. A discovery failure is reported as an error so callers
//! treat capabilities as unknown rather than absent.

use std::fmt::Display;
use std::str::FromStr;

use kube::{Client, Discovery};
use tracing::debug;

use crate::error::{Error, Result};

const BUILD_GROUP: &str = "build.openshift.io";
const IMAGE_GROUP: &str = "image.openshift.io";
const ROUTE_GROUP: &str = "route.openshift.io";
const SECURITY_GROUP: &str = "security.openshift.io";
const PROJECT_GROUP: &str = "project.openshift.io";
const APPS_GROUP: &str = "apps.openshift.io";
const PIPELINES_GROUP: &str = "tekton.dev";
const SERVING_GROUP: &str = "serving.kserve.io";

/// API groups whose presence identifies an OpenShift cluster.
const OPENSHIFT_GROUPS: [&str; 4] = [BUILD_GROUP, ROUTE_GROUP, SECURITY_GROUP, PROJECT_GROUP];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub build: bool,
    pub image: bool,
    pub route: bool,
    pub security: bool,
    pub project: bool,
    pub apps: bool,
    pub pipelines: bool,
}

/// What the cluster looked like at startup.
#[derive(Clone, Debug, Default)]
pub struct Cluster {
    pub openshift: bool,
    pub capabilities: Capabilities,
    serving_groups: Vec<String>,
}

impl Cluster {
    /// Walk the discovery API once and derive every capability from it.
    pub async fn detect(client: &Client) -> Result<Cluster> {
        let discovery = Discovery::new(client.clone()).run().await.map_err(Error::KubeError)?;

        let capabilities = Capabilities {
            build: discovery.has_group(BUILD_GROUP),
            image: discovery.has_group(IMAGE_GROUP),
            route: discovery.has_group(ROUTE_GROUP),
            security: discovery.has_group(SECURITY_GROUP),
            project: discovery.has_group(PROJECT_GROUP),
            apps: discovery.has_group(APPS_GROUP),
            pipelines: discovery.has_group(PIPELINES_GROUP),
        };
        let openshift = OPENSHIFT_GROUPS.iter().any(|group| discovery.has_group(group));

        let serving_groups = discovery
            .groups()
            .filter(|group| group.name() == SERVING_GROUP)
            .flat_map(|group| group.recommended_resources())
            .map(|(resource, _)| format!("{}.{}", resource.plural, SERVING_GROUP))
            .collect();

        debug!("Detected cluster capabilities: openshift={openshift}, {capabilities:?}");

        Ok(Cluster { openshift, capabilities, serving_groups })
    }

    /// Detect which model-serving platform the cluster carries. A hint names
    /// a platform directly and skips discovery entirely.
    pub fn detect_serving_platform(&self, hint: Option<&str>) -> Result<ServingDetection> {
        if let Some(hint) = hint {
            let platform = ServingPlatform::from_str(hint)?;
            return Ok(ServingDetection { platform, detected: false, available: true, crds: vec![] });
        }

        let crds = self.serving_groups.clone();
        let platform = if crds.iter().any(|crd| crd.starts_with("predictors.")) {
            ServingPlatform::ModelMesh
        } else {
            ServingPlatform::KServe
        };

        Ok(ServingDetection { platform, detected: !crds.is_empty(), available: !crds.is_empty(), crds })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServingPlatform {
    KServe,
    ModelMesh,
}

impl FromStr for ServingPlatform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "kserve" => Ok(ServingPlatform::KServe),
            "modelmesh" => Ok(ServingPlatform::ModelMesh),
            other => Err(Error::UnknownServingPlatform(other.to_string())),
        }
    }
}

impl Display for ServingPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServingPlatform::KServe => f.write_str("kserve"),
            ServingPlatform::ModelMesh => f.write_str("modelmesh"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServingDetection {
    pub platform: ServingPlatform,
    pub detected: bool,
    pub available: bool,
    pub crds: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_skips_discovery() {
        let cluster = Cluster::default();
        let detection = cluster.detect_serving_platform(Some("modelmesh")).unwrap();

        assert_eq!(detection.platform, ServingPlatform::ModelMesh);
        assert!(!detection.detected);
        assert!(detection.available);
        assert!(detection.crds.is_empty());
    }

    #[test]
    fn test_unknown_hint_is_an_error() {
        let cluster = Cluster::default();
        assert!(cluster.detect_serving_platform(Some("seldon")).is_err());
    }

    #[test]
    fn test_detection_from_served_crds() {
        let cluster = Cluster {
            serving_groups: vec!["inferenceservices.serving.kserve.io".into()],
            ..Default::default()
        };
        let detection = cluster.detect_serving_platform(None).unwrap();
        assert_eq!(detection.platform, ServingPlatform::KServe);
        assert!(detection.detected);

        let cluster = Cluster {
            serving_groups: vec!["predictors.serving.kserve.io".into()],
            ..Default::default()
        };
        let detection = cluster.detect_serving_platform(None).unwrap();
        assert_eq!(detection.platform, ServingPlatform::ModelMesh);
    }

    #[test]
    fn test_empty_cluster_has_nothing() {
        let cluster = Cluster::default();
        let detection = cluster.detect_serving_platform(None).unwrap();
        assert!(!detection.detected);
        assert!(!detection.available);
    }
}
