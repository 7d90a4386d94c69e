//! Task model: stages, documents, callbacks and the transition rules.

pub mod callback;
pub mod document;
pub mod events;
pub mod links;
pub mod stage;
pub mod status;
pub mod sub_stage;
pub mod transition;

pub use callback::{CallbackTarget, ServiceTaskCallback, ServiceTaskCallbackResponse};
pub use document::{EmptyBody, TaskBody, TaskDocument, TaskPatch};
pub use events::DomainEvent;
pub use stage::{TaskInfo, TaskStage, TaskState};
pub use status::TaskStatusView;
pub use sub_stage::{DefaultSubStage, SubStage};
pub use transition::Transition;
