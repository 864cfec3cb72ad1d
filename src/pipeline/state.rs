//! Stage identifiers, workflow states and the fixed transition table

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the four fixed pipeline stages, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Plan,
    Gather,
    Strategize,
    Compile,
}

impl Stage {
    /// Every stage in pipeline order
    pub const ALL: [Stage; 4] = [Stage::Plan, Stage::Gather, Stage::Strategize, Stage::Compile];

    /// Number of stages in the pipeline
    pub const COUNT: u32 = 4;

    /// Zero-based position in the pipeline
    pub fn index(self) -> usize {
        match self {
            Stage::Plan => 0,
            Stage::Gather => 1,
            Stage::Strategize => 2,
            Stage::Compile => 3,
        }
    }

    /// The stage after this one, `None` after `Compile`
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Plan => Some(Stage::Gather),
            Stage::Gather => Some(Stage::Strategize),
            Stage::Strategize => Some(Stage::Compile),
            Stage::Compile => None,
        }
    }

    /// Workflow state the session is in while this stage runs
    pub fn state(self) -> WorkflowState {
        match self {
            Stage::Plan => WorkflowState::Planning,
            Stage::Gather => WorkflowState::Gathering,
            Stage::Strategize => WorkflowState::Strategizing,
            Stage::Compile => WorkflowState::Compiling,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::Gather => "gather",
            Stage::Strategize => "strategize",
            Stage::Compile => "compile",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Initialized,
    Planning,
    Gathering,
    Strategizing,
    Compiling,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    /// Stage running in this state, if any
    pub fn stage(self) -> Option<Stage> {
        match self {
            WorkflowState::Planning => Some(Stage::Plan),
            WorkflowState::Gathering => Some(Stage::Gather),
            WorkflowState::Strategizing => Some(Stage::Strategize),
            WorkflowState::Compiling => Some(Stage::Compile),
            _ => None,
        }
    }

    /// Whether the state machine permits moving from `self` to `to`.
    ///
    /// Any non-terminal state may end in `Failed` or `Cancelled`; a stage
    /// state may be re-entered for a retry; `Completed` is only reachable
    /// from `Compiling`.
    pub fn can_transition_to(self, to: WorkflowState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            WorkflowState::Initialized => false,
            WorkflowState::Failed | WorkflowState::Cancelled => true,
            WorkflowState::Completed => self == WorkflowState::Compiling,
            WorkflowState::Planning => self == WorkflowState::Initialized || self == to,
            next => {
                let prev = next.stage().map(Stage::index).unwrap_or(0);
                self == next || self.stage().map(Stage::index) == prev.checked_sub(1)
            }
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Initialized => "INITIALIZED",
            WorkflowState::Planning => "PLANNING",
            WorkflowState::Gathering => "GATHERING",
            WorkflowState::Strategizing => "STRATEGIZING",
            WorkflowState::Compiling => "COMPILING",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Failed => "FAILED",
            WorkflowState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_fixed() {
        let mut stage = Stage::Plan;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen, Stage::ALL.to_vec());
        assert!(Stage::Plan < Stage::Compile);
    }

    #[test]
    fn test_stage_states_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(stage.state().stage(), Some(stage));
        }
        assert_eq!(WorkflowState::Initialized.stage(), None);
        assert_eq!(WorkflowState::Completed.stage(), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(WorkflowState::Completed.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(WorkflowState::Cancelled.is_terminal());
        assert!(!WorkflowState::Initialized.is_terminal());
        assert!(!WorkflowState::Compiling.is_terminal());
    }

    #[test]
    fn test_transition_table() {
        use WorkflowState::*;

        assert!(Initialized.can_transition_to(Planning));
        assert!(Planning.can_transition_to(Gathering));
        assert!(Gathering.can_transition_to(Gathering));
        assert!(Strategizing.can_transition_to(Compiling));
        assert!(Compiling.can_transition_to(Completed));
        assert!(Initialized.can_transition_to(Cancelled));
        assert!(Gathering.can_transition_to(Failed));

        assert!(!Initialized.can_transition_to(Gathering));
        assert!(!Planning.can_transition_to(Compiling));
        assert!(!Gathering.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Planning));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Compiling.can_transition_to(Initialized));
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&WorkflowState::Strategizing).unwrap(),
            "\"STRATEGIZING\""
        );
        assert_eq!(serde_json::to_string(&Stage::Gather).unwrap(), "\"gather\"");
    }
}
