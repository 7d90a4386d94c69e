//! The persisted task document and the patch that advances it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::callback::ServiceTaskCallback;
use super::stage::{TaskInfo, TaskStage, TaskState};
use super::sub_stage::SubStage;

/// Task-specific fields of a document.
///
/// `Patch` is what a self-patch may carry for these fields. Set-valued
/// fields should union, single-assignment fields should be set once.
pub trait TaskBody: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Patch: Clone + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn merge(&mut self, patch: Self::Patch);
}

/// Body of tasks without task-specific fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyBody {}

impl TaskBody for EmptyBody {
    type Patch = EmptyBody;

    fn merge(&mut self, _patch: Self::Patch) {}
}

fn created_sub_stage<S: SubStage>() -> S {
    S::CREATED
}

/// A task document: common fields plus the task-specific body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "S: Serialize, B: Serialize",
    deserialize = "S: SubStage, B: DeserializeOwned"
))]
pub struct TaskDocument<S, B> {
    #[serde(default)]
    pub document_self_link: String,
    #[serde(default)]
    pub document_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub task_info: TaskInfo,
    #[serde(default = "created_sub_stage")]
    pub task_sub_stage: S,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
    /// Links of resources produced by the task. Read-only once terminal.
    #[serde(default)]
    pub resource_links: BTreeSet<String>,
    #[serde(default)]
    pub service_task_callback: ServiceTaskCallback,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_tracker_link: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tenant_links: Vec<String>,
    #[serde(flatten)]
    pub body: B,
}

impl<S: SubStage, B: TaskBody + Default> TaskDocument<S, B> {
    pub fn new() -> Self {
        Self::with_body(B::default())
    }
}

impl<S: SubStage, B: TaskBody + Default> Default for TaskDocument<S, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SubStage, B: TaskBody> TaskDocument<S, B> {
    pub fn with_body(body: B) -> Self {
        Self {
            document_self_link: String::new(),
            document_version: 0,
            document_update_time: None,
            task_info: TaskInfo::default(),
            task_sub_stage: S::CREATED,
            custom_properties: BTreeMap::new(),
            resource_links: BTreeSet::new(),
            service_task_callback: ServiceTaskCallback::default(),
            request_tracker_link: None,
            tenant_links: Vec::new(),
            body,
        }
    }

    pub fn stage(&self) -> TaskStage {
        self.task_info.stage
    }

    pub fn task_state(&self) -> TaskState<S> {
        TaskState {
            stage: self.task_info.stage,
            sub_stage: self.task_sub_stage,
            failure_message: self.task_info.failure_message.clone(),
        }
    }

    /// Merge the data carried by a patch without touching the stage.
    pub fn merge_data(&mut self, patch: &TaskPatch<S, B::Patch>) {
        self.resource_links
            .extend(patch.resource_links.iter().cloned());
        self.custom_properties.extend(
            patch
                .custom_properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self.body.merge(patch.body.clone());
    }

    /// Move to the patch's `(stage, sub-stage)` and merge its data.
    pub fn apply(&mut self, patch: &TaskPatch<S, B::Patch>) {
        self.task_info.stage = patch.stage;
        if let Some(sub_stage) = patch.sub_stage {
            self.task_sub_stage = sub_stage;
        }
        if let Some(message) = &patch.failure_message {
            self.task_info.failure_message = Some(message.clone());
        }
        self.merge_data(patch);
    }
}

/// A request to move a task to `(stage, sub_stage)` and merge data.
///
/// Also the shape of a [`ServiceTaskCallbackResponse`](super::callback::ServiceTaskCallbackResponse),
/// so parents receive child notifications through the same path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "S: Serialize, P: Serialize",
    deserialize = "S: SubStage, P: DeserializeOwned"
))]
pub struct TaskPatch<S, P> {
    pub stage: TaskStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_stage: Option<S>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub resource_links: BTreeSet<String>,
    #[serde(flatten)]
    pub body: P,
}

impl<S: SubStage, P: Default> TaskPatch<S, P> {
    pub fn new(stage: TaskStage, sub_stage: Option<S>) -> Self {
        Self {
            stage,
            sub_stage,
            failure_message: None,
            custom_properties: BTreeMap::new(),
            resource_links: BTreeSet::new(),
            body: P::default(),
        }
    }

    /// `(STARTED, sub_stage)`
    pub fn started(sub_stage: S) -> Self {
        Self::new(TaskStage::Started, Some(sub_stage))
    }

    /// `(FINISHED, COMPLETED)`
    pub fn finished() -> Self {
        Self::new(TaskStage::Finished, Some(S::COMPLETED))
    }

    /// `(FAILED, ERROR)` with a failure message.
    pub fn failed(message: impl Into<String>) -> Self {
        let mut patch = Self::new(TaskStage::Failed, Some(S::ERROR));
        patch.failure_message = Some(message.into());
        patch
    }
}

impl<S, P> TaskPatch<S, P> {
    pub fn with_body(mut self, body: P) -> Self {
        self.body = body;
        self
    }

    pub fn with_resource_links<I, L>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.resource_links.extend(links.into_iter().map(Into::into));
        self
    }

    pub fn with_custom_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }
}
