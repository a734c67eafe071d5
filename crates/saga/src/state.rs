//! Instance and step state machines.

use serde::{Deserialize, Serialize};

/// The status of a workflow instance.
///
/// State transitions:
/// ```text
/// Running ──┬──► Running            (step succeeded, more steps)
///           ├──► AwaitingEvent ──┬──► Running       (matching event)
///           │                    └──► Compensating  (timeout / cancel)
///           ├──► Completed          (last step succeeded)
///           └──► Compensating ──┬──► Failed               (all compensations ok)
///                               └──► CompensationFailed   (manual intervention)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Steps are being executed.
    #[default]
    Running,

    /// Parked on an asynchronous step until a resume event or its timeout.
    AwaitingEvent,

    /// Every step succeeded (terminal).
    Completed,

    /// Completed steps are being compensated in reverse order.
    Compensating,

    /// Compensation finished cleanly after a failure (terminal).
    Failed,

    /// At least one compensation failed or a step needs reconciliation
    /// (terminal, requires an operator).
    CompensationFailed,
}

impl InstanceStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::CompensationFailed
        )
    }

    /// Returns true if a cancel request is accepted in this state.
    pub fn can_cancel(&self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::AwaitingEvent)
    }

    /// Returns true if a worker should keep driving the instance.
    pub fn needs_drive(&self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::Compensating)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::AwaitingEvent => "AWAITING_EVENT",
            InstanceStatus::Completed => "COMPLETED",
            InstanceStatus::Compensating => "COMPENSATING",
            InstanceStatus::Failed => "FAILED",
            InstanceStatus::CompensationFailed => "COMPENSATION_FAILED",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The status of one step execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Succeeded => "SUCCEEDED",
            StepStatus::Failed => "FAILED",
            StepStatus::Compensated => "COMPENSATED",
            StepStatus::CompensationFailed => "COMPENSATION_FAILED",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_running() {
        assert_eq!(InstanceStatus::default(), InstanceStatus::Running);
    }

    #[test]
    fn terminal_states() {
        assert!(!InstanceStatus::Running.is_terminal());
        assert!(!InstanceStatus::AwaitingEvent.is_terminal());
        assert!(!InstanceStatus::Compensating.is_terminal());
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(InstanceStatus::CompensationFailed.is_terminal());
    }

    #[test]
    fn cancel_only_while_running_or_waiting() {
        assert!(InstanceStatus::Running.can_cancel());
        assert!(InstanceStatus::AwaitingEvent.can_cancel());
        assert!(!InstanceStatus::Compensating.can_cancel());
        assert!(!InstanceStatus::Completed.can_cancel());
        assert!(!InstanceStatus::Failed.can_cancel());
        assert!(!InstanceStatus::CompensationFailed.can_cancel());
    }

    #[test]
    fn serializes_in_wire_form() {
        let json = serde_json::to_string(&InstanceStatus::AwaitingEvent).unwrap();
        assert_eq!(json, "\"AWAITING_EVENT\"");
        let back: InstanceStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, InstanceStatus::AwaitingEvent);

        assert_eq!(
            serde_json::to_string(&StepStatus::CompensationFailed).unwrap(),
            "\"COMPENSATION_FAILED\""
        );
    }

    #[test]
    fn display_matches_wire_form() {
        assert_eq!(InstanceStatus::CompensationFailed.to_string(), "COMPENSATION_FAILED");
        assert_eq!(StepStatus::Succeeded.to_string(), "SUCCEEDED");
    }
}
