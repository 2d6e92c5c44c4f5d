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

pub mod job;
pub mod status;

pub use job::{
    BuildSettings, ExpectedOutput, NotebookSource, NotebookValidationJob, NotebookValidationJobSpec,
    PodOverrides, Strictness, ValidationPolicy, DEFAULT_BASE_IMAGE, DEFAULT_GIT_REFERENCE,
};
pub use status::{JobPhase, JobState, NotebookValidationJobStatus, WorkPhase, WorkStatus};

/// The API group all NotebookValidator resources and labels live under.
pub const GROUP: &str = "mlops.nbvalidator.dev";
