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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),

    #[error("UrlParseError: {0}")]
    UrlParseError(#[source] url::ParseError),

    #[error("IoError: {0}")]
    IoError(#[source] std::io::Error),

    #[error("Unknown build strategy: {0}")]
    StrategyNotFound(String),

    #[error("Build strategy {0} is not available in this cluster")]
    StrategyUnavailable(String),

    #[error("No build strategy is available in this cluster")]
    NoStrategyAvailable,

    #[error("Invalid build configuration: {0}")]
    InvalidBuildConfig(String),

    #[error("Path escapes the checkout root: {0}")]
    UnsafePath(String),

    #[error("Task {name} not found in namespace {namespace}")]
    MissingTask { name: String, namespace: String },

    #[error("Credential secret {0} is missing or malformed")]
    InvalidCredentialSecret(String),

    #[error("Created {kind} {name} but it cannot be read back")]
    VerificationFailed { kind: &'static str, name: String },

    #[error("Unknown serving platform: {0}")]
    UnknownServingPlatform(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
