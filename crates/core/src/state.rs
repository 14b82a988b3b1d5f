//! Policy instance state - the persisted progress of one resource through its policy.

use crate::Time;
use serde::{Deserialize, Serialize};

/// Placeholder step name of a state that has not entered any step yet.
pub const NO_STEP: &str = "none";

/// Synthetic step name used to record engine-level failures.
pub const UNKNOWN_STEP: &str = "unknown";

/// Status of a policy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Created, no step entered yet
    NotStarted,
    /// An execution pass is in flight
    Running,
    /// Conditions of the current step are not met yet
    Waiting,
    /// All steps executed
    Finished,
    /// A condition, action or the engine failed
    Failed,
    /// The resource is no longer managed
    Deleted,
}

impl InstanceStatus {
    /// Terminal statuses are never resumed by a tick.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Finished | InstanceStatus::Deleted)
    }

    /// Transient statuses are not worth an audit record.
    pub fn is_transient(self) -> bool {
        matches!(self, InstanceStatus::Waiting | InstanceStatus::Running)
    }

    /// Upper-case name as stored in documents.
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::NotStarted => "NOT_STARTED",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Waiting => "WAITING",
            InstanceStatus::Finished => "FINISHED",
            InstanceStatus::Failed => "FAILED",
            InstanceStatus::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = StateValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NOT_STARTED" => Ok(InstanceStatus::NotStarted),
            "RUNNING" => Ok(InstanceStatus::Running),
            "WAITING" => Ok(InstanceStatus::Waiting),
            "FINISHED" => Ok(InstanceStatus::Finished),
            "FAILED" => Ok(InstanceStatus::Failed),
            "DELETED" => Ok(InstanceStatus::Deleted),
            other => Err(StateValidationError::UnknownStatus(other.to_string())),
        }
    }
}

/// A captured failure: a kind and a message, never the fault object itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Failure {
    /// Failure kind (e.g. the error type name)
    #[serde(rename = "type")]
    pub kind: String,

    /// Human readable message
    pub message: String,
}

impl Failure {
    /// Create a failure.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}

/// Outcome of the most recent step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepState {
    /// Step name
    pub name: String,

    /// When the attempt started
    pub start_time: Time,

    /// Retry count of the attempt
    pub retry_count: u32,

    /// Failure, if the attempt failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

impl StepState {
    /// Create a step record.
    pub fn new(name: impl Into<String>, start_time: Time, retry_count: u32, error: Option<Failure>) -> Self {
        Self {
            name: name.into(),
            start_time,
            retry_count,
            error,
        }
    }

    /// Whether the attempt failed.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of the most recent condition evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionState {
    /// Condition type
    #[serde(rename = "type")]
    pub condition_type: String,

    /// When the evaluation started
    pub start_time: Time,

    /// Evaluation result (absent if it failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<bool>,

    /// Failure, if the evaluation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

impl ConditionState {
    /// Create a condition record.
    pub fn new(condition_type: impl Into<String>, start_time: Time, result: Option<bool>, error: Option<Failure>) -> Self {
        Self {
            condition_type: condition_type.into(),
            start_time,
            result,
            error,
        }
    }

    /// Whether the evaluation failed.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of the most recent action execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionState {
    /// Action type
    #[serde(rename = "type")]
    pub action_type: String,

    /// When the execution started
    pub start_time: Time,

    /// Retry count of the execution
    pub retries: u32,

    /// Failure, if the execution failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

impl ActionState {
    /// Create an action record.
    pub fn new(action_type: impl Into<String>, start_time: Time, retries: u32, error: Option<Failure>) -> Self {
        Self {
            action_type: action_type.into(),
            start_time,
            retries,
            error,
        }
    }

    /// Whether the execution failed.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Errors raised when a persisted state document is invalid.
#[derive(Debug, thiserror::Error)]
pub enum StateValidationError {
    /// Document is not valid JSON or has the wrong shape
    #[error("invalid state document: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Required field is empty
    #[error("required field '{0}' is empty")]
    Empty(&'static str),

    /// Unknown status name
    #[error("unknown status '{0}'")]
    UnknownStatus(String),
}

/// The persisted state of one managed resource.
///
/// Equality is structural: two states are equal iff every field is equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    policy_name: String,

    /// Current status
    pub status: InstanceStatus,

    /// The step the resource is at or about to (re)enter
    pub current_step: String,

    /// Most recent step attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_step: Option<StepState>,

    /// Most recent condition evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_condition: Option<ConditionState>,

    /// Most recent action execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_action: Option<ActionState>,

    /// Snapshot name stashed by snapshot actions for later conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,
}

impl InstanceState {
    /// Create a fresh, not started state for a policy.
    pub fn new(policy_name: impl Into<String>) -> Self {
        Self {
            policy_name: policy_name.into(),
            status: InstanceStatus::NotStarted,
            current_step: NO_STEP.to_string(),
            last_executed_step: None,
            last_executed_condition: None,
            last_executed_action: None,
            snapshot_name: None,
        }
    }

    /// Name of the policy this state belongs to.
    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }

    /// Whether the failed action of the last attempt is recorded.
    pub fn last_action_failed(&self) -> bool {
        self.last_executed_action.as_ref().is_some_and(ActionState::has_error)
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<(), StateValidationError> {
        if self.policy_name.trim().is_empty() {
            return Err(StateValidationError::Empty("policy_name"));
        }
        if self.current_step.trim().is_empty() {
            return Err(StateValidationError::Empty("current_step"));
        }
        Ok(())
    }

    /// Parse and validate a state document.
    pub fn from_json(json: &str) -> Result<Self, StateValidationError> {
        let state: InstanceState = serde_json::from_str(json)?;
        state.validate()?;
        Ok(state)
    }

    /// Parse and validate a state document given as a JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, StateValidationError> {
        let state: InstanceState = serde_json::from_value(value)?;
        state.validate()?;
        Ok(state)
    }

    /// Canonical document form.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
