//! Task-specific sub-stages.
//!
//! Every task type declares its own sub-stage enum. The declaration order
//! (derived `Ord`) is the progression order, and three members are
//! mandatory: `CREATED` first, `COMPLETED` and `ERROR` last.

use std::fmt::Debug;
use std::hash::Hash;

use serde::{Serialize, de::DeserializeOwned};

/// Ordered sub-stage of a task's state machine.
///
/// # Transient sub-stages
/// A transient sub-stage is one that may legitimately be re-entered or
/// arrive out of order (typically because several asynchronous operations
/// patch it concurrently). Late patches into a transient sub-stage are
/// dropped instead of treated as a violation. Implementors decide this in
/// [`SubStage::is_transient`] with an exhaustive `match`, so a new variant
/// cannot be added without deciding.
pub trait SubStage:
    Copy + Eq + Ord + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const CREATED: Self;
    const COMPLETED: Self;
    const ERROR: Self;

    /// All members in declaration order.
    const ALL: &'static [Self];

    fn is_transient(self) -> bool;

    /// Optional transition table. Returning `false` for a forward move makes
    /// the engine fail the task instead of applying the patch.
    fn allows(self, _next: Self) -> bool {
        true
    }

    fn ordinal(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }

    /// Wire name (`SCREAMING_SNAKE_CASE` for the enums in this crate).
    fn name(self) -> String {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::String(s)) => s,
            _ => format!("{self:?}"),
        }
    }
}

/// Sub-stage set for tasks whose whole work happens in one step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefaultSubStage {
    Created,
    Completed,
    Error,
}

impl SubStage for DefaultSubStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[Self::Created, Self::Completed, Self::Error];

    fn is_transient(self) -> bool {
        match self {
            Self::Created | Self::Completed | Self::Error => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_follows_declaration_order() {
        assert_eq!(DefaultSubStage::Created.ordinal(), 0);
        assert_eq!(DefaultSubStage::Completed.ordinal(), 1);
        assert_eq!(DefaultSubStage::Error.ordinal(), 2);
        assert!(DefaultSubStage::CREATED < DefaultSubStage::COMPLETED);
        assert!(DefaultSubStage::COMPLETED < DefaultSubStage::ERROR);
    }

    #[test]
    fn name_uses_the_wire_form() {
        assert_eq!(DefaultSubStage::Completed.name(), "COMPLETED");
    }
}
