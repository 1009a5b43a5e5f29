//! Pattern executor: sequential chains, ensembles and votes.
//!
//! Every branch owns its placement handle for exactly as long as its backend
//! call runs. Handles are released on every exit path: success, failure,
//! timeout, abort, or the whole request future being dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mosaic_core::PatternKind;
use mosaic_core::config::{ExtractionRule, PatternsConfig};

use crate::backend::{BackendError, BackendRegistry, BackendRequest, InvokeOptions};
use crate::model::ModelSpec;
use crate::session::{ModelSessionManager, PlacementHandle};
use crate::telemetry;

use super::types::{
    BranchResult, BranchStatus, ExecutionRequest, ExecutionResult, ExecutionStatus,
    ExecutorError, Phase, PhaseTracker,
};
use super::voting::{self, Extractor};

/// Per-request execution state shared by its branches.
struct RunContext {
    request_id: String,
    pattern: PatternKind,
    cancel: CancellationToken,
    branch_timeout: Option<Duration>,
    request_deadline: Option<Instant>,
    completions: AtomicUsize,
}

impl RunContext {
    /// Branch deadline, capped by the request deadline.
    fn branch_deadline(&self) -> Option<Instant> {
        let own = self.branch_timeout.map(|t| Instant::now() + t);
        match (own, self.request_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Aggregation runs after the request deadline has done its work, so it
    /// only answers to the branch timeout.
    fn aggregator_deadline(&self) -> Option<Instant> {
        self.branch_timeout.map(|t| Instant::now() + t)
    }
}

enum Interrupt {
    Cancelled,
    DeadlinePassed,
}

async fn interrupted(cancel: &CancellationToken, deadline: Option<Instant>) -> Interrupt {
    match deadline {
        Some(deadline) => tokio::select! {
            () = cancel.cancelled() => Interrupt::Cancelled,
            () = sleep_until(deadline) => Interrupt::DeadlinePassed,
        },
        None => {
            cancel.cancelled().await;
            Interrupt::Cancelled
        }
    }
}

pub struct PatternExecutor {
    sessions: Arc<ModelSessionManager>,
    backends: BackendRegistry,
    patterns: PatternsConfig,
    extractor: Extractor,
}

impl PatternExecutor {
    pub fn new(
        sessions: Arc<ModelSessionManager>,
        backends: BackendRegistry,
        patterns: PatternsConfig,
        extraction: &ExtractionRule,
    ) -> Result<Self, ExecutorError> {
        Ok(Self {
            sessions,
            backends,
            patterns,
            extractor: Extractor::new(extraction)?,
        })
    }

    pub const fn sessions(&self) -> &Arc<ModelSessionManager> {
        &self.sessions
    }

    pub const fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Run one request to a terminal state.
    ///
    /// Only a malformed request is an error. Placement and backend failures
    /// are reported per branch inside the result.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutorError> {
        request.validate()?;

        let timeouts = self.patterns.timeouts(request.pattern);
        let ctx = RunContext {
            request_id: request.request_id.clone(),
            pattern: request.pattern,
            cancel,
            branch_timeout: timeouts.branch_timeout(),
            request_deadline: timeouts.request_timeout().map(|t| Instant::now() + t),
            completions: AtomicUsize::new(0),
        };
        let mut tracker = PhaseTracker::new(&request.request_id);

        info!(
            request_id = %request.request_id,
            pattern = %request.pattern,
            models = request.models.len(),
            "Execution started"
        );

        let result = match request.pattern {
            PatternKind::Sequential => self.run_sequential(&ctx, &mut tracker, &request).await,
            PatternKind::Ensemble => self.run_ensemble(&ctx, &mut tracker, &request).await,
            PatternKind::Voting => self.run_voting(&ctx, &mut tracker, &request).await,
        };

        tracker.advance(Phase::from(result.status));
        info!(
            request_id = %result.request_id,
            phase = ?tracker.phase(),
            failed = result.failed_branches().count(),
            "Execution finished"
        );
        Ok(result)
    }

    async fn run_sequential(
        &self,
        ctx: &RunContext,
        tracker: &mut PhaseTracker,
        request: &ExecutionRequest,
    ) -> ExecutionResult {
        let mut branches = Vec::with_capacity(request.models.len());
        let mut carry = request.input.clone();
        let mut last_good: Option<String> = None;
        let mut failure: Option<String> = None;

        for (index, spec) in request.models.iter().enumerate() {
            if failure.is_some() {
                branches.push(BranchResult::skipped(index, &spec.id));
                continue;
            }
            tracker.advance(Phase::Acquiring);
            let branch = match self
                .acquire_branch(ctx, index, spec, ctx.request_deadline)
                .await
            {
                Ok(handle) => {
                    tracker.advance(Phase::Dispatching);
                    self.dispatch(ctx, index, spec, handle, carry.clone(), ctx.branch_deadline())
                        .await
                }
                Err(failed) => failed,
            };
            match (&branch.status, &branch.output) {
                (BranchStatus::Succeeded, Some(output)) => {
                    carry.clone_from(output);
                    last_good = Some(output.clone());
                }
                _ => {
                    failure = Some(format!(
                        "stage {index} ({}) {}: {}",
                        spec.id,
                        branch.status.as_str(),
                        branch.error.as_deref().unwrap_or("no output")
                    ));
                }
            }
            branches.push(branch);
        }

        let (status, output) = if failure.is_some() {
            (ExecutionStatus::Failed, last_good)
        } else {
            tracker.advance(Phase::Aggregating);
            (ExecutionStatus::Succeeded, Some(carry))
        };
        ExecutionResult {
            request_id: ctx.request_id.clone(),
            pattern: ctx.pattern,
            status,
            output,
            branches,
            aggregator: None,
            votes: None,
            error: failure,
        }
    }

    async fn run_ensemble(
        &self,
        ctx: &RunContext,
        tracker: &mut PhaseTracker,
        request: &ExecutionRequest,
    ) -> ExecutionResult {
        let branches = self.fan_out(ctx, tracker, request).await;
        let mut result = ExecutionResult {
            request_id: ctx.request_id.clone(),
            pattern: ctx.pattern,
            status: ExecutionStatus::Failed,
            output: None,
            branches,
            aggregator: None,
            votes: None,
            error: None,
        };

        let outputs: Vec<&str> = result
            .branches
            .iter()
            .filter(|b| b.succeeded())
            .filter_map(|b| b.output.as_deref())
            .collect();
        if outputs.is_empty() {
            result.error = Some("no branch succeeded".to_string());
            return result;
        }
        let Some(aggregator) = request.aggregator.as_ref() else {
            result.error = Some("ensemble has no aggregator".to_string());
            return result;
        };
        let index = request.models.len();
        if ctx.cancel.is_cancelled() {
            result.aggregator = Some(BranchResult::skipped(index, &aggregator.id));
            result.error = Some("aborted before aggregation".to_string());
            return result;
        }

        tracker.advance(Phase::Aggregating);
        let combined = outputs.join("\n\n");
        debug!(request_id = %ctx.request_id, inputs = outputs.len(), "Invoking aggregator");
        let agg = match self.acquire_branch(ctx, index, aggregator, None).await {
            Ok(handle) => {
                self.dispatch(ctx, index, aggregator, handle, combined, ctx.aggregator_deadline())
                    .await
            }
            Err(failed) => failed,
        };

        if agg.succeeded() {
            result.output.clone_from(&agg.output);
            result.status = if result.branches.iter().all(BranchResult::succeeded) {
                ExecutionStatus::Succeeded
            } else {
                ExecutionStatus::PartiallyFailed
            };
        } else {
            result.error = Some(format!(
                "aggregator {} {}: {}",
                aggregator.id,
                agg.status.as_str(),
                agg.error.as_deref().unwrap_or("no output")
            ));
        }
        result.aggregator = Some(agg);
        result
    }

    async fn run_voting(
        &self,
        ctx: &RunContext,
        tracker: &mut PhaseTracker,
        request: &ExecutionRequest,
    ) -> ExecutionResult {
        let branches = self.fan_out(ctx, tracker, request).await;
        let mut result = ExecutionResult {
            request_id: ctx.request_id.clone(),
            pattern: ctx.pattern,
            status: ExecutionStatus::Failed,
            output: None,
            branches,
            aggregator: None,
            votes: None,
            error: None,
        };

        if !result.branches.iter().any(BranchResult::succeeded) {
            result.error = Some("no branch succeeded".to_string());
            return result;
        }

        tracker.advance(Phase::Aggregating);
        let Some(decision) = voting::decide(&self.extractor, &result.branches) else {
            result.error = Some("no branch produced a vote".to_string());
            return result;
        };
        debug!(request_id = %ctx.request_id, winner = %decision.winner, "Vote decided");

        result.status = if result.branches.iter().all(BranchResult::succeeded) {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::PartiallyFailed
        };
        result.output = Some(decision.output);
        result.votes = Some(decision.tally);
        result
    }

    /// Acquire every branch concurrently, then dispatch every placed branch
    /// concurrently, and wait for all of them to finish.
    async fn fan_out(
        &self,
        ctx: &RunContext,
        tracker: &mut PhaseTracker,
        request: &ExecutionRequest,
    ) -> Vec<BranchResult> {
        tracker.advance(Phase::Acquiring);
        let acquired = join_all(
            request
                .models
                .iter()
                .enumerate()
                .map(|(index, spec)| self.acquire_branch(ctx, index, spec, ctx.request_deadline)),
        )
        .await;

        tracker.advance(Phase::Dispatching);
        join_all(
            acquired
                .into_iter()
                .zip(&request.models)
                .enumerate()
                .map(|(index, (slot, spec))| {
                    let input = request.input.clone();
                    async move {
                        match slot {
                            Ok(handle) => {
                                self.dispatch(ctx, index, spec, handle, input, ctx.branch_deadline())
                                    .await
                            }
                            Err(failed) => failed,
                        }
                    }
                }),
        )
        .await
    }

    async fn acquire_branch(
        &self,
        ctx: &RunContext,
        index: usize,
        spec: &ModelSpec,
        deadline: Option<Instant>,
    ) -> Result<PlacementHandle, BranchResult> {
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            stop = interrupted(&ctx.cancel, deadline) => Err(stop),
            acquired = self.sessions.acquire(spec) => Ok(acquired),
        };
        let (status, error) = match outcome {
            Ok(Ok(handle)) => return Ok(handle),
            Ok(Err(e)) => (BranchStatus::Failed, e.to_string()),
            Err(Interrupt::Cancelled) => (
                BranchStatus::Cancelled,
                "cancelled before placement".to_string(),
            ),
            Err(Interrupt::DeadlinePassed) => (
                BranchStatus::TimedOut,
                "request deadline passed before placement".to_string(),
            ),
        };
        Err(finish(ctx, index, spec, None, started, Err((status, error))))
    }

    async fn dispatch(
        &self,
        ctx: &RunContext,
        index: usize,
        spec: &ModelSpec,
        handle: PlacementHandle,
        input: String,
        deadline: Option<Instant>,
    ) -> BranchResult {
        let started = Instant::now();
        let device_id = handle.device_id().to_string();

        let backend = match self.backends.get(&spec.backend) {
            Ok(backend) => backend,
            Err(e) => {
                drop(handle);
                return finish(ctx, index, spec, Some(device_id), started, Err(classify(&e)));
            }
        };

        let call_cancel = ctx.cancel.child_token();
        let options = InvokeOptions {
            deadline,
            cancel: call_cancel.clone(),
        };
        let backend_request = BackendRequest {
            request_id: ctx.request_id.clone(),
            model_id: spec.id.clone(),
            device_id: device_id.clone(),
            input,
        };
        let call = async move { backend.invoke(backend_request, options).await?.collect().await };
        let bounded = async move {
            match deadline {
                Some(deadline) => timeout_at(deadline, call)
                    .await
                    .unwrap_or(Err(BackendError::Timeout)),
                None => call.await,
            }
        };

        let outcome = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => Err(BackendError::Cancelled),
            reply = bounded => reply,
        };
        call_cancel.cancel();
        drop(handle);

        let outcome = outcome.map_err(|e| classify(&e));
        finish(ctx, index, spec, Some(device_id), started, outcome)
    }
}

fn classify(error: &BackendError) -> (BranchStatus, String) {
    let status = match error {
        BackendError::Timeout => BranchStatus::TimedOut,
        BackendError::Cancelled => BranchStatus::Cancelled,
        BackendError::Failure { .. } | BackendError::Unknown { .. } => BranchStatus::Failed,
    };
    (status, error.to_string())
}

fn finish(
    ctx: &RunContext,
    index: usize,
    spec: &ModelSpec,
    device_id: Option<String>,
    started: Instant,
    outcome: Result<String, (BranchStatus, String)>,
) -> BranchResult {
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let completion_order = Some(ctx.completions.fetch_add(1, Ordering::SeqCst));
    let (status, output, error) = match outcome {
        Ok(text) => (BranchStatus::Succeeded, Some(text), None),
        Err((status, message)) => (status, None, Some(message)),
    };

    telemetry::branch(ctx.pattern.as_str(), status.as_str(), latency_ms);
    if status == BranchStatus::Succeeded {
        debug!(
            request_id = %ctx.request_id,
            model_id = %spec.id,
            index,
            latency_ms,
            "Branch succeeded"
        );
    } else {
        warn!(
            request_id = %ctx.request_id,
            model_id = %spec.id,
            index,
            status = status.as_str(),
            error = error.as_deref().unwrap_or_default(),
            "Branch did not succeed"
        );
    }

    BranchResult {
        index,
        model_id: spec.id.clone(),
        device_id,
        status,
        output,
        error,
        latency_ms,
        completion_order,
    }
}
