//! Validation of a requested `(stage, sub-stage)` against the current one.
//!
//! Pure function so the rules can be tested without an engine.

use super::stage::{TaskStage, TaskState};
use super::sub_stage::SubStage;

/// What the engine should do with an incoming patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Commit the new state and dispatch it.
    Apply,
    /// Same `(stage, sub-stage)`: merge the data, do not dispatch again.
    MergeOnly,
    /// Drop silently (logged at debug/info).
    Ignore(String),
    /// Refuse the patch; the task keeps its state.
    Reject(String),
    /// The task tried a move its transition table forbids; fail it.
    Violation(String),
}

pub fn evaluate<S: SubStage>(
    current: &TaskState<S>,
    stage: TaskStage,
    sub_stage: Option<S>,
) -> Transition {
    if current.stage == TaskStage::Failed && stage == TaskStage::Failed {
        return Transition::Ignore("task already failed".to_string());
    }

    if current.stage > stage {
        return if current.stage == TaskStage::Failed {
            Transition::Ignore(format!(
                "task already failed, dropping patch to {stage}"
            ))
        } else {
            Transition::Reject(format!(
                "stage can not move backwards from {} to {stage}",
                current.stage
            ))
        };
    }

    if current.is_terminal() {
        return Transition::Ignore(format!(
            "task already reached {}, dropping patch to {stage}",
            current.stage
        ));
    }

    if let Some(next) = sub_stage
        && current.sub_stage > next
    {
        return if current.stage == stage && !next.is_transient() {
            Transition::Reject(format!(
                "sub-stage can not move backwards from {} to {}",
                current.sub_stage.name(),
                next.name()
            ))
        } else {
            Transition::Ignore(format!(
                "late patch to {} while in {}",
                next.name(),
                current.sub_stage.name()
            ))
        };
    }

    let same_sub_stage = sub_stage.is_none_or(|next| next == current.sub_stage);
    if stage == current.stage && same_sub_stage {
        return Transition::MergeOnly;
    }

    if !stage.is_terminal()
        && let Some(next) = sub_stage
        && next != current.sub_stage
        && next != S::ERROR
        && next != S::COMPLETED
        && !current.sub_stage.allows(next)
    {
        return Transition::Violation(format!(
            "sub-stage {} may not advance to {}",
            current.sub_stage.name(),
            next.name()
        ));
    }

    Transition::Apply
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde::{Deserialize, Serialize};

    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    enum Step {
        Created,
        Fetching,
        Fetched,
        Cleanup,
        Completed,
        Error,
    }

    impl SubStage for Step {
        const CREATED: Self = Self::Created;
        const COMPLETED: Self = Self::Completed;
        const ERROR: Self = Self::Error;
        const ALL: &'static [Self] = &[
            Self::Created,
            Self::Fetching,
            Self::Fetched,
            Self::Cleanup,
            Self::Completed,
            Self::Error,
        ];

        fn is_transient(self) -> bool {
            match self {
                Self::Fetching => true,
                Self::Created | Self::Fetched | Self::Cleanup | Self::Completed | Self::Error => {
                    false
                }
            }
        }

        fn allows(self, next: Self) -> bool {
            !matches!((self, next), (Self::Created, Self::Cleanup))
        }
    }

    fn state(stage: TaskStage, sub: Step) -> TaskState<Step> {
        TaskState::new(stage, sub)
    }

    #[rstest]
    #[case(TaskStage::Started, Step::Created, TaskStage::Started, Some(Step::Fetching))]
    #[case(TaskStage::Started, Step::Fetched, TaskStage::Started, Some(Step::Error))]
    #[case(TaskStage::Started, Step::Fetched, TaskStage::Finished, Some(Step::Completed))]
    #[case(TaskStage::Started, Step::Fetched, TaskStage::Failed, Some(Step::Error))]
    #[case(TaskStage::Created, Step::Created, TaskStage::Started, Some(Step::Created))]
    fn forward_moves_apply(
        #[case] stage: TaskStage,
        #[case] sub: Step,
        #[case] next_stage: TaskStage,
        #[case] next_sub: Option<Step>,
    ) {
        assert_eq!(
            evaluate(&state(stage, sub), next_stage, next_sub),
            Transition::Apply
        );
    }

    #[test]
    fn repeated_failure_is_ignored() {
        let t = evaluate(&state(TaskStage::Failed, Step::Error), TaskStage::Failed, Some(Step::Error));
        assert!(matches!(t, Transition::Ignore(_)));
    }

    #[test]
    fn stage_regression_after_failure_is_ignored() {
        let t = evaluate(
            &state(TaskStage::Failed, Step::Error),
            TaskStage::Started,
            Some(Step::Cleanup),
        );
        assert!(matches!(t, Transition::Ignore(_)));
    }

    #[test]
    fn stage_regression_after_finish_is_rejected() {
        let t = evaluate(
            &state(TaskStage::Finished, Step::Completed),
            TaskStage::Started,
            Some(Step::Cleanup),
        );
        assert!(matches!(t, Transition::Reject(_)));
    }

    #[test]
    fn nothing_moves_a_finished_task_to_failed() {
        let t = evaluate(
            &state(TaskStage::Finished, Step::Completed),
            TaskStage::Failed,
            Some(Step::Error),
        );
        assert!(matches!(t, Transition::Ignore(_)));
    }

    #[test]
    fn late_transient_sub_stage_is_ignored() {
        let t = evaluate(
            &state(TaskStage::Started, Step::Cleanup),
            TaskStage::Started,
            Some(Step::Fetching),
        );
        assert!(matches!(t, Transition::Ignore(_)));
    }

    #[test]
    fn non_transient_sub_stage_regression_is_rejected() {
        let t = evaluate(
            &state(TaskStage::Started, Step::Cleanup),
            TaskStage::Started,
            Some(Step::Fetched),
        );
        assert!(matches!(t, Transition::Reject(_)));
    }

    #[test]
    fn duplicate_state_only_merges() {
        let current = state(TaskStage::Started, Step::Fetched);
        assert_eq!(
            evaluate(&current, TaskStage::Started, Some(Step::Fetched)),
            Transition::MergeOnly
        );
        assert_eq!(
            evaluate(&current, TaskStage::Started, None),
            Transition::MergeOnly
        );
    }

    #[test]
    fn forbidden_skip_is_a_violation() {
        let t = evaluate(
            &state(TaskStage::Started, Step::Created),
            TaskStage::Started,
            Some(Step::Cleanup),
        );
        assert!(matches!(t, Transition::Violation(_)));
    }
}
