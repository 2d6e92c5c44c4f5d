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

use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::PostParams;
use kube::core::ObjectMeta;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info};

use super::error::{Error, Result};
use crate::{MANAGED_BY, OWNED_LABEL};

/// Ensure the shared build service account exists in a namespace. It is
/// shared across every job in the namespace, so it carries no owner
/// reference and survives individual job deletion.
pub async fn ensure(client: &Client, namespace: &str, name: &str) -> Result<ServiceAccount> {
    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);

    if let Some(existing) = api.get_opt(name).await.map_err(Error::KubeError)? {
        debug!("ServiceAccount {}/{} already exists", namespace, name);
        return Ok(existing);
    }

    let resource = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([
                (OWNED_LABEL.into(), "true".into()),
                ("app.kubernetes.io/managed-by".into(), MANAGED_BY.into()),
            ])),
            ..Default::default()
        },
        ..Default::default()
    };

    let account = match api.create(&PostParams::default(), &resource).await {
        Ok(created) => created,
        Err(kube::Error::Api(response)) if response.code == 409 => {
            api.get(name).await.map_err(Error::KubeError)?
        }
        Err(err) => return Err(Error::KubeError(err)),
    };
    info!("Created ServiceAccount: {}/{}", namespace, account.name_any());

    Ok(account)
}
