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

use kube::ResourceExt;
use nbv_crds::NotebookValidationJob;
use serde::Serialize;
use serde_json::to_string;
use sha2::{Digest, Sha256};

use self::error::{Error, Result};

pub mod dockerfile;
pub mod error;
pub mod event;
pub mod job;
pub mod platform;
pub mod pod;
pub mod secret;
pub mod security;
pub mod service_account;
pub mod strategy;

pub const LAST_APPLIED_HASH_KEY: &str = "mlops.nbvalidator.dev/last-applied-hash";

/// Marker carried by every auxiliary object the operator creates.
pub const OWNED_LABEL: &str = "mlops.nbvalidator.dev/notebook-validation";

pub const MANAGED_BY: &str = "NotebookValidator";

pub fn hash<T>(resource: &T) -> Result<String>
where
    T: Serialize,
{
    let data = to_string(resource).map_err(Error::SerializationError)?;
    let hash = Sha256::digest(data);

    Ok(format!("{hash:x}"))
}

/// Labels stamped on every auxiliary resource owned by the given job.
pub fn labels(job: &NotebookValidationJob) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNED_LABEL.into(), "true".into()),
        ("app".into(), job.name_any()),
        ("app.kubernetes.io/managed-by".into(), MANAGED_BY.into()),
    ])
}

/// Returns a list of arguments in one-dash or two-dash style.
#[inline]
pub fn args(args: &[(&str, &str)], dash: i8) -> Vec<String> {
    args.iter()
        .map(|(key, value)| if dash == 1 { format!("-{key}={value}") } else { format!("--{key}={value}") })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_dash_styles() {
        let pairs = vec![("ref", "main"), ("depth", "1")];
        assert_eq!(args(&pairs, 2), vec!["--ref=main", "--depth=1"]);
        assert_eq!(args(&pairs, 1), vec!["-ref=main", "-depth=1"]);
    }

    #[test]
    fn test_hash_is_stable() {
        let a = hash(&serde_json::json!({"x": 1})).unwrap();
        let b = hash(&serde_json::json!({"x": 1})).unwrap();
        let c = hash(&serde_json::json!({"x": 2})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
