//! Requests, results and phases of a pattern execution.

use serde::Serialize;
use tracing::{info, warn};

use mosaic_core::PatternKind;

use crate::model::ModelSpec;

/// One multi-model request.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub request_id: String,
    pub pattern: PatternKind,
    /// Stages (sequential) or branches (ensemble, voting), in order.
    pub models: Vec<ModelSpec>,
    /// Required for ensemble, rejected otherwise.
    pub aggregator: Option<ModelSpec>,
    pub input: String,
}

impl ExecutionRequest {
    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.models.is_empty() {
            return Err(ExecutorError::invalid(format!(
                "{} needs at least one model",
                self.pattern
            )));
        }
        match (self.pattern, &self.aggregator) {
            (PatternKind::Ensemble, None) => {
                Err(ExecutorError::invalid("ensemble needs an aggregator model"))
            }
            (PatternKind::Sequential | PatternKind::Voting, Some(_)) => Err(
                ExecutorError::invalid(format!("{} takes no aggregator", self.pattern)),
            ),
            _ => Ok(()),
        }
    }
}

/// Terminal state of a single branch or stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Succeeded,
    /// Placement or backend error.
    Failed,
    TimedOut,
    Cancelled,
    /// Sequential stage never reached.
    Skipped,
}

impl BranchStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchResult {
    /// Position in the request's model list.
    pub index: usize,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub status: BranchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    /// Order in which this branch finished among its siblings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_order: Option<usize>,
}

impl BranchResult {
    pub(crate) fn skipped(index: usize, model_id: &str) -> Self {
        Self {
            index,
            model_id: model_id.to_string(),
            device_id: None,
            status: BranchStatus::Skipped,
            output: None,
            error: None,
            latency_ms: 0,
            completion_order: None,
        }
    }

    pub const fn succeeded(&self) -> bool {
        matches!(self.status, BranchStatus::Succeeded)
    }
}

/// Overall outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    PartiallyFailed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteCount {
    pub value: String,
    pub count: usize,
}

/// Composite result of one request. Branch outcomes are always kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub request_id: String,
    pub pattern: PatternKind,
    pub status: ExecutionStatus,
    /// Final payload, or the last good output of a failed sequential chain.
    pub output: Option<String>,
    pub branches: Vec<BranchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregator: Option<BranchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub votes: Option<Vec<VoteCount>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn failed_branches(&self) -> impl Iterator<Item = &BranchResult> {
        self.branches
            .iter()
            .filter(|b| !matches!(b.status, BranchStatus::Succeeded | BranchStatus::Skipped))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("Invalid topology: {reason}")]
    InvalidTopology { reason: String },

    #[error("Invalid voting extraction rule: {0}")]
    InvalidExtraction(String),
}

impl ExecutorError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidTopology {
            reason: reason.into(),
        }
    }
}

/// Lifecycle of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Start,
    Acquiring,
    Dispatching,
    Aggregating,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl Phase {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallyFailed | Self::Failed)
    }

    /// Sequential chains go back to `Acquiring` for each stage.
    pub const fn can_advance(self, to: Self) -> bool {
        match (self, to) {
            (Self::Start, Self::Acquiring)
            | (Self::Acquiring, Self::Dispatching)
            | (Self::Dispatching, Self::Acquiring | Self::Aggregating)
            | (Self::Aggregating, Self::Acquiring) => true,
            (from, to) => !from.is_terminal() && to.is_terminal(),
        }
    }
}

impl From<ExecutionStatus> for Phase {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Succeeded => Self::Succeeded,
            ExecutionStatus::PartiallyFailed => Self::PartiallyFailed,
            ExecutionStatus::Failed => Self::Failed,
        }
    }
}

/// Tracks and logs phase transitions for one request.
#[derive(Debug)]
pub(crate) struct PhaseTracker {
    request_id: String,
    phase: Phase,
}

impl PhaseTracker {
    pub(crate) fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            phase: Phase::Start,
        }
    }

    pub(crate) fn advance(&mut self, to: Phase) {
        if self.phase == to {
            return;
        }
        if !self.phase.can_advance(to) {
            warn!(request_id = %self.request_id, from = ?self.phase, to = ?to, "Unexpected phase transition");
        }
        info!(request_id = %self.request_id, from = ?self.phase, to = ?to, "Phase transition");
        self.phase = to;
    }

    pub(crate) const fn phase(&self) -> Phase {
        self.phase
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(pattern: PatternKind, models: usize, aggregator: bool) -> ExecutionRequest {
        ExecutionRequest {
            request_id: "r".to_string(),
            pattern,
            models: (0..models)
                .map(|i| ModelSpec::new(format!("m{i}"), 1, "echo"))
                .collect(),
            aggregator: aggregator.then(|| ModelSpec::new("agg", 1, "echo")),
            input: String::new(),
        }
    }

    #[test]
    fn topology_validation() {
        assert!(request(PatternKind::Voting, 0, false).validate().is_err());
        assert!(request(PatternKind::Sequential, 0, false).validate().is_err());
        assert!(request(PatternKind::Ensemble, 2, false).validate().is_err());
        assert!(request(PatternKind::Voting, 2, true).validate().is_err());
        assert!(request(PatternKind::Ensemble, 2, true).validate().is_ok());
        assert!(request(PatternKind::Voting, 3, false).validate().is_ok());
        assert!(request(PatternKind::Sequential, 1, false).validate().is_ok());
    }

    #[test]
    fn terminal_phases_do_not_advance() {
        assert!(Phase::Start.can_advance(Phase::Acquiring));
        assert!(Phase::Dispatching.can_advance(Phase::Aggregating));
        assert!(Phase::Acquiring.can_advance(Phase::Failed));
        assert!(!Phase::Succeeded.can_advance(Phase::Acquiring));
        assert!(!Phase::Failed.can_advance(Phase::Succeeded));
        assert!(!Phase::Start.can_advance(Phase::Aggregating));
    }

    #[test]
    fn tracker_follows_transitions() {
        let mut tracker = PhaseTracker::new("r1");
        tracker.advance(Phase::Acquiring);
        tracker.advance(Phase::Dispatching);
        tracker.advance(Phase::Aggregating);
        tracker.advance(Phase::Succeeded);
        assert_eq!(tracker.phase(), Phase::Succeeded);
    }
}
