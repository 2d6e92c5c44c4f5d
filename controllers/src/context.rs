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

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::Recorder;
use nbv_resources::platform::Cluster;
use nbv_resources::strategy::Registry;
use tracing::info;

use crate::config::Config;

/// The state shared by every reconciliation: the client, the parsed
/// configuration, and the cluster facts computed once at startup.
pub struct Context {
    pub k8s: kube::Client,
    pub config: Arc<Config>,
    pub cluster: Cluster,
    pub registry: Registry,
}

impl Context {
    pub async fn new(config: Config) -> anyhow::Result<Context> {
        let k8s = kube::Client::try_default().await?;

        // Capabilities are probed once; a cluster reshaped underneath a
        // running operator gets picked up on restart.
        let cluster = Cluster::detect(&k8s).await?;
        info!(
            "Cluster: openshift={}, pipelines={}, builds={}",
            cluster.openshift, cluster.capabilities.pipelines, cluster.capabilities.build
        );

        let serving = cluster.detect_serving_platform(config.serving_platform.as_deref())?;
        info!("Serving platform: {} (detected: {})", serving.platform, serving.detected);

        let registry = Registry::builtin(&config.namespace);

        Ok(Context { k8s, config: Arc::new(config), cluster, registry })
    }

    pub fn recorder(&self, reference: ObjectReference) -> Recorder {
        Recorder::new(self.k8s.clone(), "nbv-controllers".into(), reference)
    }
}
