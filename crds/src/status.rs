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

use std::fmt::Display;

use convert_case::{Case, Casing};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Summary phase of a NotebookValidationJob.
#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum JobPhase {
    #[default]
    Initializing,
    Building,
    BuildComplete,
    ValidationRunning,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }
}

impl Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Initializing => f.write_str("Initializing"),
            JobPhase::Building => f.write_str("Building"),
            JobPhase::BuildComplete => f.write_str("BuildComplete"),
            JobPhase::ValidationRunning => f.write_str("ValidationRunning"),
            JobPhase::Succeeded => f.write_str("Succeeded"),
            JobPhase::Failed => f.write_str("Failed"),
        }
    }
}

/// Phase of a single build run or validation pod.
#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum WorkPhase {
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
    #[default]
    Unknown,
}

impl WorkPhase {
    pub fn terminal(&self) -> bool {
        matches!(self, WorkPhase::Complete | WorkPhase::Failed | WorkPhase::Cancelled)
    }

    pub fn active(&self) -> bool {
        matches!(self, WorkPhase::Pending | WorkPhase::Running)
    }

    /// Rank used when choosing the authoritative run among several:
    /// Complete > Running > Pending > everything else.
    pub fn priority(&self) -> u8 {
        match self {
            WorkPhase::Complete => 3,
            WorkPhase::Running => 2,
            WorkPhase::Pending => 1,
            WorkPhase::Failed | WorkPhase::Cancelled | WorkPhase::Unknown => 0,
        }
    }
}

impl Display for WorkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkPhase::Pending => f.write_str("Pending"),
            WorkPhase::Running => f.write_str("Running"),
            WorkPhase::Complete => f.write_str("Complete"),
            WorkPhase::Failed => f.write_str("Failed"),
            WorkPhase::Cancelled => f.write_str("Cancelled"),
            WorkPhase::Unknown => f.write_str("Unknown"),
        }
    }
}

/// Observed state of one build or validation attempt.
#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkStatus {
    #[serde(default)]
    pub phase: WorkPhase,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotebookValidationJobStatus {
    #[serde(default)]
    pub phase: JobPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<WorkStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<WorkStatus>,
    #[serde(default)]
    pub build_retry_count: i32,
    #[serde(default)]
    pub validation_retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NotebookValidationJobStatus {
    /// Insert or replace the condition of the same type, preserving the
    /// transition time when nothing but the timestamp changed.
    pub fn record(&mut self, condition: Condition) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            if existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message
            {
                return;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    pub fn build_phase(&self) -> WorkPhase {
        self.build.as_ref().map(|b| b.phase).unwrap_or_default()
    }

    pub fn validation_phase(&self) -> WorkPhase {
        self.validation.as_ref().map(|v| v.phase).unwrap_or_default()
    }
}

/// Condition constructors for the NotebookValidationJob status.
pub enum JobState {
    Initialized,
    BuildInProgress,
    BuildComplete,
    ValidationInProgress,
    Succeeded,
    Failed,
    Retrying,
}

impl JobState {
    pub fn initialized() -> Condition {
        JobState::create(JobState::Initialized, true, "Initialized", None)
    }

    pub fn build_in_progress(message: Option<String>) -> Condition {
        JobState::create(JobState::BuildInProgress, true, "BuildStarted", message)
    }

    pub fn build_complete(image: &str) -> Condition {
        JobState::create(JobState::BuildComplete, true, "BuildSucceeded", Some(format!("built {image}")))
    }

    pub fn validation_in_progress(message: Option<String>) -> Condition {
        JobState::create(JobState::ValidationInProgress, true, "ValidationStarted", message)
    }

    pub fn succeeded(message: Option<String>) -> Condition {
        JobState::create(JobState::Succeeded, true, "ValidationSucceeded", message)
    }

    pub fn failed(reason: &str, message: Option<String>) -> Condition {
        JobState::create(JobState::Failed, true, reason, message)
    }

    pub fn retrying(reason: &str, attempt: i32, limit: i32) -> Condition {
        JobState::create(
            JobState::Retrying,
            true,
            reason,
            Some(format!("attempt {attempt} of {limit} failed")),
        )
    }

    #[inline]
    fn create(state: JobState, status: bool, reason: &str, message: Option<String>) -> Condition {
        Condition {
            type_: state.to_string(),
            status: status.to_string().to_case(Case::Pascal),
            last_transition_time: Time(Utc::now()),
            reason: reason.to_case(Case::Pascal),
            observed_generation: None,
            message: message.unwrap_or_default(),
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Initialized => f.write_str("Initialized"),
            JobState::BuildInProgress => f.write_str("BuildInProgress"),
            JobState::BuildComplete => f.write_str("BuildComplete"),
            JobState::ValidationInProgress => f.write_str("ValidationInProgress"),
            JobState::Succeeded => f.write_str("Succeeded"),
            JobState::Failed => f.write_str("Failed"),
            JobState::Retrying => f.write_str("Retrying"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_defaults_and_terminality() {
        assert_eq!(JobPhase::default(), JobPhase::Initializing);
        assert!(!JobPhase::Building.terminal());
        assert!(JobPhase::Succeeded.terminal());
        assert!(JobPhase::Failed.terminal());

        assert!(WorkPhase::Complete.terminal());
        assert!(WorkPhase::Cancelled.terminal());
        assert!(!WorkPhase::Running.terminal());
        assert!(WorkPhase::Pending.active());
        assert!(!WorkPhase::Unknown.active());
    }

    #[test]
    fn test_work_phase_priority_order() {
        assert!(WorkPhase::Complete.priority() > WorkPhase::Running.priority());
        assert!(WorkPhase::Running.priority() > WorkPhase::Pending.priority());
        assert!(WorkPhase::Pending.priority() > WorkPhase::Failed.priority());
        assert_eq!(WorkPhase::Failed.priority(), WorkPhase::Cancelled.priority());
    }

    #[test]
    fn test_record_replaces_same_type() {
        let mut status = NotebookValidationJobStatus::default();

        status.record(JobState::initialized());
        status.record(JobState::build_in_progress(None));
        assert_eq!(status.conditions.len(), 2);

        // Same type again with a new reason replaces in place.
        status.record(JobState::create(JobState::BuildInProgress, true, "BuildRetry", None));
        assert_eq!(status.conditions.len(), 2);
        let build = status.conditions.iter().find(|c| c.type_ == "BuildInProgress").unwrap();
        assert_eq!(build.reason, "BuildRetry");
    }

    #[test]
    fn test_record_keeps_unchanged_transition_time() {
        let mut status = NotebookValidationJobStatus::default();
        status.record(JobState::initialized());
        let first = status.conditions[0].last_transition_time.clone();

        status.record(JobState::initialized());
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_transition_time, first);
    }

    #[test]
    fn test_condition_reason_casing() {
        let condition = JobState::failed("BuildExhausted", Some("budget spent".into()));
        assert_eq!(condition.type_, "Failed");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, "BuildExhausted");
        assert_eq!(condition.message, "budget spent");
    }
}
