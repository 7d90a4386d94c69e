//! Domain events emitted by the engine.
//!
//! Observers subscribe through the host; nothing in the engine depends on
//! anyone listening.

use serde::Serialize;

use super::stage::TaskStage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskCreated {
        link: String,
        factory_link: String,
    },
    /// A patch was committed.
    StateChanged {
        link: String,
        from_stage: TaskStage,
        from_sub_stage: String,
        from_ordinal: usize,
        to_stage: TaskStage,
        to_sub_stage: String,
        to_ordinal: usize,
    },
    PatchIgnored {
        link: String,
        reason: String,
    },
    PatchRejected {
        link: String,
        reason: String,
    },
    /// The parent named in the callback was notified.
    ParentNotified {
        link: String,
        parent_link: String,
        stage: TaskStage,
    },
    TaskDeleted {
        link: String,
    },
}

impl DomainEvent {
    pub fn link(&self) -> &str {
        match self {
            Self::TaskCreated { link, .. }
            | Self::StateChanged { link, .. }
            | Self::PatchIgnored { link, .. }
            | Self::PatchRejected { link, .. }
            | Self::ParentNotified { link, .. }
            | Self::TaskDeleted { link } => link,
        }
    }
}
