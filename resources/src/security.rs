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

//! Security-context-constraint grants for build pods.
//!
//! Reads and writes go straight to the API server rather than through a
//! watch cache, since SCCs are privileged cluster-scoped objects the
//! operator has no business watching.

use kube::api::{Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::{Api, Client};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{Error, Result};

#[inline]
fn scc_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("security.openshift.io", "v1", "SecurityContextConstraints"))
}

/// Add the build service account to the users of the given SCC. Returns
/// whether a grant was added; a missing policy object is logged and skipped
/// rather than failing the build.
pub async fn ensure_scc_user(client: &Client, scc: &str, namespace: &str, service_account: &str) -> Result<bool> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &scc_resource());

    let Some(existing) = api.get_opt(scc).await.map_err(Error::KubeError)? else {
        warn!("SecurityContextConstraints {} not found, skipping the grant", scc);
        return Ok(false);
    };

    let user = scc_user(namespace, service_account);
    let users = existing
        .data
        .pointer("/users")
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default();

    let Some(users) = with_user(users, &user) else {
        return Ok(false);
    };

    let patch = json!({ "users": users });
    api.patch(scc, &PatchParams::default(), &Patch::Merge(&patch)).await.map_err(Error::KubeError)?;
    info!("Granted SCC {} to {}", scc, user);

    Ok(true)
}

#[inline]
fn scc_user(namespace: &str, service_account: &str) -> String {
    format!("system:serviceaccount:{namespace}:{service_account}")
}

/// The users list with the entry appended, or None when already present.
fn with_user(mut users: Vec<String>, user: &str) -> Option<Vec<String>> {
    if users.iter().any(|existing| existing == user) {
        return None;
    }
    users.push(user.to_string());
    Some(users)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scc_user_format() {
        assert_eq!(scc_user("workspace", "notebook-builder"), "system:serviceaccount:workspace:notebook-builder");
    }

    #[test]
    fn test_with_user_is_idempotent() {
        let users = vec!["system:serviceaccount:a:b".to_string()];

        let updated = with_user(users.clone(), "system:serviceaccount:workspace:notebook-builder").unwrap();
        assert_eq!(updated.len(), 2);

        assert!(with_user(updated.clone(), "system:serviceaccount:workspace:notebook-builder").is_none());
    }
}
