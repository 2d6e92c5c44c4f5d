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

//! Materialization of the Tekton tasks a pipeline build needs.
//!
//! The reference definitions live in the operator's system namespace and are
//! copied into each user namespace as namespace-scoped `Task`s. Copies are
//! labeled operator-managed and carry a version annotation; tasks that are
//! not operator-labeled are never touched.

use std::collections::BTreeMap;

use kube::api::PostParams;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::{Api, Client, ResourceExt};
use serde_json::{from_value, json};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::{MANAGED_BY, OWNED_LABEL};

pub const TASK_VERSION_KEY: &str = "mlops.nbvalidator.dev/task-version";

/// Tasks every pipeline build references.
pub const REQUIRED_TASKS: [&str; 2] = ["git-clone", "buildah"];

const TASK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[inline]
pub(crate) fn task_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("tekton.dev", "v1beta1", "Task"))
}

/// Make sure every required task exists in the target namespace.
pub async fn ensure(client: &Client, system_namespace: &str, namespace: &str) -> Result<()> {
    for name in REQUIRED_TASKS {
        ensure_one(client, system_namespace, namespace, name).await?;
    }
    Ok(())
}

async fn ensure_one(client: &Client, system_namespace: &str, namespace: &str, name: &str) -> Result<()> {
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &task_resource());

    if let Some(existing) = api.get_opt(name).await.map_err(Error::KubeError)? {
        if !operator_managed(existing.labels()) {
            debug!("Task {}/{} exists but is not operator-managed, leaving it alone", namespace, name);
            return Ok(());
        }
        if !version_mismatch(existing.annotations()) {
            return Ok(());
        }
        // Stale operator copy: fall through and replace the spec.
        api.delete(name, &Default::default()).await.map_err(Error::KubeError)?;
        info!("Replacing outdated Task copy {}/{}", namespace, name);
    }

    let system: Api<DynamicObject> = Api::namespaced_with(client.clone(), system_namespace, &task_resource());
    let source = system.get_opt(name).await.map_err(Error::KubeError)?.ok_or_else(|| Error::MissingTask {
        name: name.to_string(),
        namespace: system_namespace.to_string(),
    })?;

    let resource = copy_of(name, &source)?;
    match api.create(&PostParams::default(), &resource).await {
        Ok(task) => info!("Copied Task {} into {}", task.name_any(), namespace),
        Err(kube::Error::Api(response)) if response.code == 409 => {}
        Err(err) => return Err(Error::KubeError(err)),
    }

    Ok(())
}

/// A fresh namespace-scoped copy of a task: same spec, our metadata.
fn copy_of(name: &str, source: &DynamicObject) -> Result<DynamicObject> {
    from_value(json!({
        "apiVersion": "tekton.dev/v1beta1",
        "kind": "Task",
        "metadata": {
            "name": name,
            "labels": {
                (OWNED_LABEL): "true",
                "app.kubernetes.io/managed-by": MANAGED_BY,
            },
            "annotations": { (TASK_VERSION_KEY): TASK_VERSION },
        },
        "spec": source.data.pointer("/spec").cloned().unwrap_or_default(),
    }))
    .map_err(Error::SerializationError)
}

fn operator_managed(labels: &BTreeMap<String, String>) -> bool {
    labels.get("app.kubernetes.io/managed-by").map(String::as_str) == Some(MANAGED_BY)
}

fn version_mismatch(annotations: &BTreeMap<String, String>) -> bool {
    annotations.get(TASK_VERSION_KEY).map(String::as_str) != Some(TASK_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_managed_label() {
        let ours = BTreeMap::from([("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string())]);
        let theirs = BTreeMap::from([("app.kubernetes.io/managed-by".to_string(), "Helm".to_string())]);

        assert!(operator_managed(&ours));
        assert!(!operator_managed(&theirs));
        assert!(!operator_managed(&BTreeMap::new()));
    }

    #[test]
    fn test_version_gate() {
        let current = BTreeMap::from([(TASK_VERSION_KEY.to_string(), TASK_VERSION.to_string())]);
        let stale = BTreeMap::from([(TASK_VERSION_KEY.to_string(), "0.0.1-old".to_string())]);

        assert!(!version_mismatch(&current));
        assert!(version_mismatch(&stale));
        assert!(version_mismatch(&BTreeMap::new()));
    }

    #[test]
    fn test_copy_strips_source_metadata() {
        let source: DynamicObject = from_value(json!({
            "apiVersion": "tekton.dev/v1beta1",
            "kind": "Task",
            "metadata": {
                "name": "git-clone",
                "namespace": "nbv-system",
                "resourceVersion": "12345",
                "uid": "aaaa-bbbb",
            },
            "spec": { "steps": [{ "name": "clone" }] },
        }))
        .unwrap();

        let copy = copy_of("git-clone", &source).unwrap();
        assert_eq!(copy.name_any(), "git-clone");
        assert!(copy.metadata.resource_version.is_none());
        assert!(copy.metadata.uid.is_none());
        assert_eq!(copy.annotations().get(TASK_VERSION_KEY).map(String::as_str), Some(TASK_VERSION));
        assert_eq!(copy.data.pointer("/spec/steps/0/name").and_then(|v| v.as_str()), Some("clone"));
    }
}
