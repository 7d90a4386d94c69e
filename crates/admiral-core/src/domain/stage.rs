//! Coarse task stage and the combined task state.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::sub_stage::SubStage;

/// Coarse lifecycle stage shared by every task.
///
/// Declaration order is the progression order:
/// CREATED < STARTED < FINISHED < FAILED < CANCELLED.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStage {
    #[default]
    Created,
    Started,
    Finished,
    Failed,
    Cancelled,
}

impl TaskStage {
    /// FINISHED, FAILED and CANCELLED accept no further work.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Started => "STARTED",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted stage information of a task document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    #[serde(default)]
    pub stage: TaskStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl TaskInfo {
    pub fn new(stage: TaskStage) -> Self {
        Self {
            stage,
            failure_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            stage: TaskStage::Failed,
            failure_message: Some(message.into()),
        }
    }
}

/// Snapshot of `(stage, sub-stage, failure message)`.
///
/// Transition checks compare two of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState<S> {
    pub stage: TaskStage,
    pub sub_stage: S,
    pub failure_message: Option<String>,
}

impl<S: SubStage> TaskState<S> {
    pub fn new(stage: TaskStage, sub_stage: S) -> Self {
        Self {
            stage,
            sub_stage,
            failure_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

impl<S: SubStage> fmt::Display for TaskState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stage, self.sub_stage.name())
    }
}
