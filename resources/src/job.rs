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

use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use nbv_crds::{NotebookValidationJob, NotebookValidationJobStatus};
use serde_json::json;
use tracing::debug;

use super::error::{Error, Result};

/// Write the whole observed status back. The status subresource is owned by
/// the reconciler, so a merge of the full object is safe and idempotent.
pub async fn patch_status(
    client: &Client,
    job: &NotebookValidationJob,
    status: &NotebookValidationJobStatus,
) -> Result<()> {
    let namespace = job.namespace().ok_or_else(|| Error::MissingObjectKey(".metadata.namespace"))?;
    let api: Api<NotebookValidationJob> = Api::namespaced(client.clone(), &namespace);

    let patch = json!({ "status": status });
    let job = api
        .patch_status(job.name_any().as_str(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;

    debug!("Patched status {} for NotebookValidationJob {}", status.phase, job.name_any());

    Ok(())
}
