//! Entity records and lifecycle enums stored in the state store.

pub mod records;

pub use records::{
    ActionItem, CeremonySummary, Epic, LearningEntry, NewActionItem, NewCeremony, NewLearning,
    Story,
};

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}

/// Error returned when a lifecycle transition is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition<S> {
    pub from: S,
    pub to: S,
    pub reason: &'static str,
}

fn normalize(input: &str) -> String {
    input.trim().to_ascii_lowercase().replace('-', "_")
}

/// Declares a text-backed enum with `as_str`, `ALL`, `Display` and `FromStr`.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $label:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every value, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Stored text form.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match normalize(s).as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(ParseEnumError {
                        expected: $label,
                        got: s.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(
    /// Epic lifecycle. Everything but `archived` is derived from the epic's stories.
    EpicState, "epic state" {
        Planning => "planning",
        Active => "active",
        Complete => "complete",
        Archived => "archived",
    }
);

text_enum!(
    /// Story lifecycle.
    StoryState, "story state" {
        Todo => "todo",
        InProgress => "in_progress",
        Review => "review",
        Done => "done",
    }
);

text_enum!(
    /// Action item lifecycle.
    ActionItemState, "action item state" {
        Todo => "todo",
        InProgress => "in_progress",
        Done => "done",
    }
);

text_enum!(
    Priority, "priority" {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
);

text_enum!(
    CeremonyKind, "ceremony kind" {
        Standup => "standup",
        Retrospective => "retrospective",
        Planning => "planning",
        Review => "review",
    }
);

text_enum!(
    Relevance, "relevance" {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
);

text_enum!(
    /// Learning entry lifecycle; `obsolete` is terminal.
    LearningState, "learning state" {
        Active => "active",
        Obsolete => "obsolete",
    }
);

impl EpicState {
    /// Whether the epic accepts further mutation outside repair.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Archived)
    }
}

impl StoryState {
    /// Validate whether a transition from self to `target` is allowed.
    ///
    /// Valid transitions:
    /// - `todo -> in_progress`
    /// - `in_progress -> review`
    /// - `review -> done`
    /// - `review -> in_progress` (rework)
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] for no-op edges and any other edge.
    pub fn can_transition_to(self, target: Self) -> Result<(), InvalidTransition<Self>> {
        if self == target {
            return Err(InvalidTransition {
                from: self,
                to: target,
                reason: "no-op transition is not allowed",
            });
        }

        let allowed = matches!(
            (self, target),
            (Self::Todo, Self::InProgress)
                | (Self::InProgress, Self::Review)
                | (Self::Review, Self::Done)
                | (Self::Review, Self::InProgress)
        );

        if allowed {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self,
                to: target,
                reason: "transition not allowed by story lifecycle rules",
            })
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done)
    }
}

impl ActionItemState {
    /// Validate whether a transition from self to `target` is allowed.
    ///
    /// `todo -> in_progress`, `todo -> done` and `in_progress -> done`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] for every other edge.
    pub fn can_transition_to(self, target: Self) -> Result<(), InvalidTransition<Self>> {
        let allowed = matches!(
            (self, target),
            (Self::Todo, Self::InProgress | Self::Done) | (Self::InProgress, Self::Done)
        );

        if allowed {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self,
                to: target,
                reason: "transition not allowed by action item lifecycle rules",
            })
        }
    }
}

impl Priority {
    /// Sort rank, higher is more urgent.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl Relevance {
    /// Sort rank, higher is more relevant.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }
}

impl Default for Relevance {
    fn default() -> Self {
        Self::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn story_forward_path_is_allowed() {
        assert!(StoryState::Todo.can_transition_to(StoryState::InProgress).is_ok());
        assert!(StoryState::InProgress.can_transition_to(StoryState::Review).is_ok());
        assert!(StoryState::Review.can_transition_to(StoryState::Done).is_ok());
    }

    #[test]
    fn review_may_return_to_in_progress() {
        assert!(StoryState::Review.can_transition_to(StoryState::InProgress).is_ok());
    }

    #[test]
    fn story_shortcuts_and_backward_edges_are_rejected() {
        for (from, to) in [
            (StoryState::Todo, StoryState::Done),
            (StoryState::Todo, StoryState::Review),
            (StoryState::InProgress, StoryState::Done),
            (StoryState::InProgress, StoryState::Todo),
            (StoryState::Review, StoryState::Todo),
        ] {
            assert!(from.can_transition_to(to).is_err(), "{from} -> {to}");
        }
    }

    #[test]
    fn done_is_terminal() {
        for target in StoryState::ALL {
            let err = StoryState::Done.can_transition_to(*target).unwrap_err();
            assert_eq!(err.from, StoryState::Done);
        }
    }

    #[test]
    fn no_op_transition_is_rejected() {
        let err = StoryState::Review.can_transition_to(StoryState::Review).unwrap_err();
        assert_eq!(err.reason, "no-op transition is not allowed");
    }

    #[test]
    fn action_item_transitions() {
        assert!(ActionItemState::Todo.can_transition_to(ActionItemState::Done).is_ok());
        assert!(ActionItemState::Done.can_transition_to(ActionItemState::Todo).is_err());
        assert!(
            ActionItemState::InProgress
                .can_transition_to(ActionItemState::Todo)
                .is_err()
        );
    }

    #[test]
    fn enums_parse_case_insensitively() {
        assert_eq!("In-Progress".parse::<StoryState>(), Ok(StoryState::InProgress));
        assert_eq!(" CRITICAL ".parse::<Priority>(), Ok(Priority::Critical));
        assert_eq!("retrospective".parse::<CeremonyKind>(), Ok(CeremonyKind::Retrospective));
        let err = "blocked".parse::<StoryState>().unwrap_err();
        assert_eq!(err.to_string(), "invalid story state: 'blocked'");
    }

    #[test]
    fn display_round_trips_stored_text() {
        for state in EpicState::ALL {
            assert_eq!(state.to_string().parse::<EpicState>(), Ok(*state));
        }
        assert_eq!(StoryState::InProgress.as_str(), "in_progress");
    }

    #[test]
    fn ranks_order_priority_and_relevance() {
        assert!(Priority::Critical.rank() > Priority::High.rank());
        assert!(Priority::Medium.rank() > Priority::Low.rank());
        assert!(Relevance::High.rank() > Relevance::Low.rank());
    }
}
