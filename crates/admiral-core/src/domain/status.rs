//! Read-only progress view of a task, used for request tracking.

use serde::{Deserialize, Serialize};

use super::document::{TaskBody, TaskDocument};
use super::stage::TaskStage;
use super::sub_stage::SubStage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub document_self_link: String,
    /// Display name of the task type.
    pub phase: String,
    pub stage: TaskStage,
    pub sub_stage: String,
    /// 0..=100
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_links: Vec<String>,
}

impl TaskStatusView {
    pub fn from_task<S: SubStage, B: TaskBody>(phase: &str, doc: &TaskDocument<S, B>) -> Self {
        Self {
            document_self_link: doc.document_self_link.clone(),
            phase: phase.to_string(),
            stage: doc.task_info.stage,
            sub_stage: doc.task_sub_stage.name(),
            progress: progress_of(doc.task_info.stage, doc.task_sub_stage),
            failure_message: doc.task_info.failure_message.clone(),
            resource_links: doc.resource_links.iter().cloned().collect(),
        }
    }
}

/// Percentage derived from the sub-stage ordinal.
///
/// The last two members (`COMPLETED`, `ERROR`) are excluded from the
/// denominator, so `COMPLETED` maps to 100.
pub fn progress_of<S: SubStage>(stage: TaskStage, sub_stage: S) -> u8 {
    if stage == TaskStage::Finished {
        return 100;
    }
    let steps = S::ALL.len().saturating_sub(2);
    if steps == 0 {
        return 0;
    }
    let pct = 100 * sub_stage.ordinal() / steps;
    pct.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::document::EmptyBody;
    use crate::domain::sub_stage::DefaultSubStage;

    #[test]
    fn progress_is_capped_and_finished_is_full() {
        assert_eq!(progress_of(TaskStage::Started, DefaultSubStage::Created), 0);
        assert_eq!(progress_of(TaskStage::Started, DefaultSubStage::Error), 100);
        assert_eq!(progress_of(TaskStage::Finished, DefaultSubStage::Completed), 100);
    }

    #[test]
    fn view_copies_the_task_fields() {
        let mut doc: TaskDocument<DefaultSubStage, EmptyBody> = TaskDocument::new();
        doc.document_self_link = "/tasks/a".into();
        doc.task_info.stage = TaskStage::Started;
        doc.resource_links.insert("/resources/compute/h".into());
        let view = TaskStatusView::from_task("Demo", &doc);
        assert_eq!(view.phase, "Demo");
        assert_eq!(view.sub_stage, "CREATED");
        assert_eq!(view.resource_links, vec!["/resources/compute/h".to_string()]);
    }
}
