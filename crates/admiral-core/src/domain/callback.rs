//! Parent notification descriptor.
//!
//! A child task carries a [`ServiceTaskCallback`] naming its parent and the
//! `(stage, sub-stage)` the parent should be patched into when the child
//! finishes or fails. The response body is shaped like a task patch, so the
//! parent's engine consumes it like any other patch.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::stage::TaskStage;
use super::sub_stage::SubStage;
use crate::error::{AdmiralError, Result};

/// Where the parent should land on one outcome of the child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackTarget {
    pub stage: TaskStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_stage: Option<Value>,
}

impl CallbackTarget {
    pub fn new<S: SubStage>(stage: TaskStage, sub_stage: S) -> Self {
        Self {
            stage,
            sub_stage: serde_json::to_value(sub_stage).ok(),
        }
    }

    pub fn stage_only(stage: TaskStage) -> Self {
        Self {
            stage,
            sub_stage: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceTaskCallback {
    /// Nobody is waiting on the task.
    #[default]
    Empty,
    Parent {
        service_self_link: String,
        task_state_finished: CallbackTarget,
        task_state_failed: CallbackTarget,
    },
}

impl ServiceTaskCallback {
    pub fn create_empty() -> Self {
        Self::Empty
    }

    pub fn create<S: SubStage>(
        service_self_link: impl Into<String>,
        finished_stage: TaskStage,
        finished_sub_stage: S,
        failed_stage: TaskStage,
        failed_sub_stage: S,
    ) -> Self {
        Self::Parent {
            service_self_link: service_self_link.into(),
            task_state_finished: CallbackTarget::new(finished_stage, finished_sub_stage),
            task_state_failed: CallbackTarget::new(failed_stage, failed_sub_stage),
        }
    }

    /// Callback into a parent without a sub-stage (counter sub-tasks).
    pub fn create_with_stages(
        service_self_link: impl Into<String>,
        finished_stage: TaskStage,
        failed_stage: TaskStage,
    ) -> Self {
        Self::Parent {
            service_self_link: service_self_link.into(),
            task_state_finished: CallbackTarget::stage_only(finished_stage),
            task_state_failed: CallbackTarget::stage_only(failed_stage),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn service_self_link(&self) -> Option<&str> {
        match self {
            Self::Empty => None,
            Self::Parent {
                service_self_link, ..
            } => Some(service_self_link),
        }
    }

    /// Link to notify. A non-empty callback must name a parent.
    pub fn target_link(&self) -> Result<&str> {
        match self {
            Self::Empty => Err(AdmiralError::PreconditionViolation(
                "callback has no parent to notify".to_string(),
            )),
            Self::Parent {
                service_self_link, ..
            } if service_self_link.trim().is_empty() => Err(AdmiralError::PreconditionViolation(
                "callback parent link is blank".to_string(),
            )),
            Self::Parent {
                service_self_link, ..
            } => Ok(service_self_link),
        }
    }

    pub fn finished_response(&self) -> ServiceTaskCallbackResponse {
        match self {
            Self::Empty => ServiceTaskCallbackResponse::new(TaskStage::Finished, None),
            Self::Parent {
                task_state_finished,
                ..
            } => ServiceTaskCallbackResponse::new(
                task_state_finished.stage,
                task_state_finished.sub_stage.clone(),
            ),
        }
    }

    pub fn failed_response(&self, failure_message: Option<String>) -> ServiceTaskCallbackResponse {
        let mut response = match self {
            Self::Empty => ServiceTaskCallbackResponse::new(TaskStage::Failed, None),
            Self::Parent {
                task_state_failed, ..
            } => ServiceTaskCallbackResponse::new(
                task_state_failed.stage,
                task_state_failed.sub_stage.clone(),
            ),
        };
        response.failure_message = failure_message;
        response
    }
}

/// Body sent to the parent.
///
/// Field names match [`TaskPatch`](super::document::TaskPatch) so the
/// parent deserializes it as a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTaskCallbackResponse {
    pub stage: TaskStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_stage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub resource_links: BTreeSet<String>,
}

impl ServiceTaskCallbackResponse {
    pub fn new(stage: TaskStage, sub_stage: Option<Value>) -> Self {
        Self {
            stage,
            sub_stage,
            failure_message: None,
            custom_properties: BTreeMap::new(),
            resource_links: BTreeSet::new(),
        }
    }

    pub fn with_resource_links<I, L>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.resource_links.extend(links.into_iter().map(Into::into));
        self
    }

    pub fn is_failure(&self) -> bool {
        self.stage == TaskStage::Failed || self.failure_message.is_some()
    }
}
