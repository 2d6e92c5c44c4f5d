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

/// The configuration parameters for the operator.
///
/// These can either be passed on the command line, or pulled from environment
/// variables. The latter is preferred as environment variables are one of the
/// recommended ways to get configuration from Kubernetes Secrets in
/// deployment.
///
/// For development convenience, these can also be read from a `.env` file in
/// the working directory where the application is started.
#[derive(clap::Parser)]
pub struct Config {
    /// The namespace the operator runs in and reads its reference Tekton
    /// task definitions from, the default is `nbv-system`.
    #[clap(long, env = "NBV_NAMESPACE", default_value = "nbv-system")]
    pub namespace: String,

    /// The name of the ServiceAccount build pods run as in user
    /// namespaces, the default is `notebook-builder`.
    #[clap(long, env = "NBV_SERVICE_ACCOUNT_NAME", default_value = "notebook-builder")]
    pub service_account_name: String,

    /// The SecurityContextConstraints the build service account is granted
    /// on clusters that have them.
    #[clap(long, env = "NBV_SECURITY_CONTEXT_CONSTRAINT", default_value = "pipelines-scc")]
    pub security_context_constraint: String,

    /// Force a model-serving platform instead of detecting one.
    #[clap(long, env = "NBV_SERVING_PLATFORM")]
    pub serving_platform: Option<String>,

    /// How many finished build runs to keep per job for diagnostics.
    #[clap(long, env = "NBV_KEEP_BUILDS", default_value = "2")]
    pub keep_builds: usize,
}
