//! Multi-model pattern execution.
//!
//! - [`PatternExecutor`]: drives placements and backend calls for sequential,
//!   ensemble and voting requests.
//! - [`Extractor`]: reduces voting outputs to comparable answers.

pub mod executor;
pub mod types;
pub mod voting;

pub use executor::PatternExecutor;
pub use types::{
    BranchResult, BranchStatus, ExecutionRequest, ExecutionResult, ExecutionStatus,
    ExecutorError, Phase, VoteCount,
};
pub use voting::Extractor;
