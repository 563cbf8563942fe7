/// Stage state definitions for tracking task progress
///
/// A task moves through two independent stages, each with its own state.
use std::fmt;

/// The two stages every harvest task runs through, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Walking the search feed and recording parent references
    Discovery,

    /// Fetching each discovered parent and its children
    Content,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Content => "content",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Represents the current state of one stage of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageState {
    /// Stage has never been entered
    NotStarted,

    /// Stage is running, or was running when the process stopped
    InProgress,

    /// Stage finished successfully
    Completed,

    /// Stage stopped on an error; may be resumed
    Failed,
}

impl StageState {
    /// Returns true once the stage has finished successfully
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Checks whether moving from this state to `to` is allowed
    ///
    /// `InProgress -> InProgress` is accepted: it is how a stage that was
    /// running when the process died gets picked up again.
    pub fn can_transition_to(&self, to: StageState) -> bool {
        matches!(
            (self, to),
            (Self::NotStarted, Self::InProgress)
                | (Self::InProgress, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::Failed, Self::InProgress)
        )
    }

    /// Converts the stage state to a database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses a stage state from a database string representation
    ///
    /// Returns None if the string doesn't match any known state.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(Self::NotStarted),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns all possible stage states
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::NotStarted,
            Self::InProgress,
            Self::Completed,
            Self::Failed,
        ]
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(StageState::NotStarted.can_transition_to(StageState::InProgress));
        assert!(StageState::InProgress.can_transition_to(StageState::Completed));
        assert!(StageState::InProgress.can_transition_to(StageState::Failed));
        assert!(StageState::Failed.can_transition_to(StageState::InProgress));
    }

    #[test]
    fn test_crash_resume_reenters_in_progress() {
        assert!(StageState::InProgress.can_transition_to(StageState::InProgress));
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(!StageState::NotStarted.can_transition_to(StageState::Completed));
        assert!(!StageState::NotStarted.can_transition_to(StageState::Failed));
        assert!(!StageState::Completed.can_transition_to(StageState::InProgress));
        assert!(!StageState::Completed.can_transition_to(StageState::NotStarted));
        assert!(!StageState::Failed.can_transition_to(StageState::Completed));
    }

    #[test]
    fn test_roundtrip_db_string() {
        for state in StageState::all_states() {
            let parsed = StageState::from_db_string(state.to_db_string());
            assert_eq!(Some(state), parsed, "Failed roundtrip for {:?}", state);
        }
        assert_eq!(StageState::from_db_string("paused"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", StageState::InProgress), "in_progress");
        assert_eq!(format!("{}", Stage::Content), "content");
    }
}
