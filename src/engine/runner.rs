//! Batch runner: claim, process, record, wait, until the queue drains or
//! the run is aborted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::claim::ClaimStrategy;
use crate::backoff::{BackoffScheduler, sleep_cancellable};
use crate::error::Error;
use crate::model::{FailureKind, Status, WorkItem};
use crate::step::{self, ErrorClass, ProcessingResult, ProcessingStep};
use crate::store::{Resolution, WorkStore};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_item_span};

/// Default attempt bound for items without their own.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default age after which a claim counts as abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub default_max_attempts: u32,
    /// Claims older than this are returned to Pending before each claim.
    /// Keep it well above the step timeout.
    pub stale_after: Duration,
    /// Bound on non-empty claim cycles.
    pub max_iterations: Option<u64>,
    pub max_runtime: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            stale_after: DEFAULT_STALE_AFTER,
            max_iterations: None,
            max_runtime: None,
        }
    }
}

/// Where the runner is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Claiming,
    Processing,
    Recording,
    Waiting,
    Drained,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The store failed; the message is the underlying error.
    Store(String),
    MaxIterations,
    MaxRuntime,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A claim came back empty and nothing is waiting for a retry.
    Drained,
    Aborted(AbortReason),
}

impl RunOutcome {
    /// Process exit code: 0 for a drained or cancelled run, 2 when a
    /// configured bound stopped it, 1 when the store failed.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Drained | RunOutcome::Aborted(AbortReason::Cancelled) => 0,
            RunOutcome::Aborted(AbortReason::MaxIterations | AbortReason::MaxRuntime) => 2,
            RunOutcome::Aborted(AbortReason::Store(_)) => 1,
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Non-empty claims.
    pub batches: u64,
    /// Step invocations that ran to completion.
    pub processed: u64,
    pub done: u64,
    pub failed: u64,
    pub skipped: u64,
    pub requeued: u64,
    /// Claims given back on cancellation.
    pub released: u64,
    pub claims_lost: u64,
    /// Stale claims swept by this runner.
    pub reclaimed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub summary: RunSummary,
}

/// Runs one processing step over one queue.
pub struct BatchRunner {
    store: Arc<dyn WorkStore>,
    step: Arc<dyn ProcessingStep>,
    strategy: ClaimStrategy,
    backoff: BackoffScheduler,
    config: RunnerConfig,
    cancel: CancellationToken,
    state: watch::Sender<RunState>,
}

impl BatchRunner {
    pub fn new(
        store: Arc<dyn WorkStore>,
        step: Arc<dyn ProcessingStep>,
        strategy: ClaimStrategy,
        backoff: BackoffScheduler,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            step,
            strategy,
            backoff,
            config,
            cancel: CancellationToken::new(),
            state: watch::Sender::new(RunState::Idle),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Request a cooperative stop. The in-flight item and the rest of its
    /// batch are released back to Pending.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Run until drained or aborted. Never returns an error: store failures
    /// end the run as `Aborted(Store)`.
    pub async fn run(&self) -> RunReport {
        let started = Instant::now();
        let mut summary = RunSummary::default();

        info!(
            queue = %self.strategy.queue,
            step = self.step.name(),
            batch_size = self.strategy.limit,
            "runner started"
        );

        let outcome = self.run_loop(started, &mut summary).await;

        match &outcome {
            RunOutcome::Drained => {
                self.set_state(RunState::Drained);
                info!(queue = %self.strategy.queue, ?summary, "queue drained");
            }
            RunOutcome::Aborted(reason) => {
                self.set_state(RunState::Aborted);
                match reason {
                    AbortReason::Store(msg) => {
                        error!(queue = %self.strategy.queue, error = %msg, ?summary, "run aborted")
                    }
                    other => {
                        info!(queue = %self.strategy.queue, reason = ?other, ?summary, "run stopped")
                    }
                }
            }
        }

        RunReport { outcome, summary }
    }

    async fn run_loop(&self, started: Instant, summary: &mut RunSummary) -> RunOutcome {
        let mut iterations = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return RunOutcome::Aborted(AbortReason::Cancelled);
            }
            if self.config.max_iterations.is_some_and(|max| iterations >= max) {
                return RunOutcome::Aborted(AbortReason::MaxIterations);
            }
            let remaining = self.remaining_runtime(started);
            if remaining.is_some_and(|r| r.is_zero()) {
                return RunOutcome::Aborted(AbortReason::MaxRuntime);
            }

            self.set_state(RunState::Claiming);
            let batch = match self.claim(summary).await {
                Ok(batch) => batch,
                Err(e) => return store_abort(e),
            };

            if batch.is_empty() {
                let next = match self.store.next_available_at(&self.strategy).await {
                    Ok(next) => next,
                    Err(e) => return store_abort(e),
                };
                let Some(at) = next else {
                    return RunOutcome::Drained;
                };

                // Deferred retries only: wait for the earliest one.
                let mut wait = until(at);
                if let Some(remaining) = remaining {
                    wait = wait.min(remaining);
                }
                debug!(wait_ms = wait.as_millis() as u64, "waiting for deferred retries");
                self.set_state(RunState::Waiting);
                if !sleep_cancellable(wait, &self.cancel).await {
                    return RunOutcome::Aborted(AbortReason::Cancelled);
                }
                continue;
            }

            iterations += 1;
            summary.batches += 1;

            if let Err(reason) = self.process_batch(batch, started, summary).await {
                return RunOutcome::Aborted(reason);
            }

            self.set_state(RunState::Waiting);
            if !sleep_cancellable(self.backoff.between_items(), &self.cancel).await {
                return RunOutcome::Aborted(AbortReason::Cancelled);
            }
        }
    }

    /// Sweep stale claims, then claim the next batch.
    async fn claim(&self, summary: &mut RunSummary) -> crate::error::Result<Vec<WorkItem>> {
        let queue = self.strategy.queue.as_str();

        let cutoff = chrono::Duration::from_std(self.config.stale_after)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        if let Some(cutoff) = cutoff {
            let reclaimed = self
                .store
                .reclaim_stale(Some(queue), cutoff, self.config.default_max_attempts)
                .await?;
            if reclaimed.total() > 0 {
                summary.reclaimed += reclaimed.total();
                let counter = metrics::items_reclaimed();
                counter.add(
                    reclaimed.requeued,
                    &[
                        KeyValue::new("queue", queue.to_string()),
                        KeyValue::new("result", "requeued"),
                    ],
                );
                counter.add(
                    reclaimed.exhausted,
                    &[
                        KeyValue::new("queue", queue.to_string()),
                        KeyValue::new("result", "exhausted"),
                    ],
                );
                warn!(
                    queue,
                    requeued = reclaimed.requeued,
                    exhausted = reclaimed.exhausted,
                    "reclaimed stale claims"
                );
            }
        }

        let batch = self.store.claim_next(&self.strategy, Utc::now()).await?;
        if !batch.is_empty() {
            metrics::items_claimed()
                .add(batch.len() as u64, &[KeyValue::new("queue", queue.to_string())]);
            debug!(queue, count = batch.len(), "claimed batch");
        }
        Ok(batch)
    }

    /// Process a claimed batch strictly in claim order. Unprocessed items
    /// are released when the run stops mid-batch.
    async fn process_batch(
        &self,
        batch: Vec<WorkItem>,
        started: Instant,
        summary: &mut RunSummary,
    ) -> Result<(), AbortReason> {
        let mut items = batch.into_iter();

        while let Some(item) = items.next() {
            let stop = if self.cancel.is_cancelled() {
                Some(AbortReason::Cancelled)
            } else if self
                .remaining_runtime(started)
                .is_some_and(|r| r.is_zero())
            {
                Some(AbortReason::MaxRuntime)
            } else {
                None
            };
            if let Some(reason) = stop {
                self.release_all(std::iter::once(item).chain(items), summary)
                    .await?;
                return Err(reason);
            }

            // Earlier items in the batch may have used up the stale window.
            match self.store.touch(&item).await {
                Ok(()) => {}
                Err(Error::ClaimLost(id)) => {
                    summary.claims_lost += 1;
                    metrics::claims_lost().add(1, &[KeyValue::new("queue", item.queue.clone())]);
                    warn!(id = %id, "claim lost before processing, skipping item");
                    continue;
                }
                Err(e) => {
                    self.release_all(std::iter::once(item).chain(items), summary)
                        .await?;
                    return Err(AbortReason::Store(e.to_string()));
                }
            }

            self.set_state(RunState::Processing);
            let span = start_item_span(self.step.name(), &item);

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = step::execute(self.step.as_ref(), &item).instrument(span.clone()) => Some(result),
            };
            let Some(result) = result else {
                span.in_scope(|| info!("cancelled mid-item, releasing claim"));
                self.release_all(std::iter::once(item).chain(items), summary)
                    .await?;
                return Err(AbortReason::Cancelled);
            };
            summary.processed += 1;

            self.set_state(RunState::Recording);
            self.record(&item, result, &span, summary).await?;

            if items.len() > 0 {
                self.set_state(RunState::Waiting);
                if !sleep_cancellable(self.backoff.between_items(), &self.cancel).await {
                    self.release_all(items, summary).await?;
                    return Err(AbortReason::Cancelled);
                }
            }
        }
        Ok(())
    }

    async fn record(
        &self,
        item: &WorkItem,
        result: ProcessingResult,
        span: &Span,
        summary: &mut RunSummary,
    ) -> Result<(), AbortReason> {
        let resolution = resolve(
            item,
            result,
            Utc::now(),
            &self.backoff,
            self.config.default_max_attempts,
        );
        let to = resolution.status();

        match self.store.record_result(item, &resolution).await {
            Ok(_) => {
                record_state_transition(span, Status::Claimed, to);
                match to {
                    Status::Done => summary.done += 1,
                    Status::Skipped => summary.skipped += 1,
                    Status::Failed(_) => summary.failed += 1,
                    Status::Pending => summary.requeued += 1,
                    Status::Claimed => {}
                }
                metrics::item_results().add(
                    1,
                    &[
                        KeyValue::new("queue", item.queue.clone()),
                        KeyValue::new("status", to.name().as_str()),
                    ],
                );
                match &resolution {
                    Resolution::Requeue { available_at, error } => span.in_scope(|| {
                        warn!(attempt = item.attempts, %available_at, error = %error, "requeued for retry")
                    }),
                    Resolution::Failed { error, .. } => {
                        span.in_scope(|| warn!(status = %to, error = %error, "item failed"))
                    }
                    _ => {}
                }
                Ok(())
            }
            Err(Error::ClaimLost(id)) => {
                summary.claims_lost += 1;
                metrics::claims_lost().add(1, &[KeyValue::new("queue", item.queue.clone())]);
                span.in_scope(|| warn!(id = %id, "claim lost before recording, result discarded"));
                Ok(())
            }
            Err(e) => Err(AbortReason::Store(e.to_string())),
        }
    }

    async fn release_all(
        &self,
        items: impl IntoIterator<Item = WorkItem>,
        summary: &mut RunSummary,
    ) -> Result<(), AbortReason> {
        for item in items {
            match self.store.release(&item).await {
                Ok(()) => summary.released += 1,
                Err(Error::ClaimLost(id)) => {
                    summary.claims_lost += 1;
                    warn!(id = %id, "claim lost before release");
                }
                Err(e) => return Err(AbortReason::Store(e.to_string())),
            }
        }
        Ok(())
    }

    fn remaining_runtime(&self, started: Instant) -> Option<Duration> {
        self.config
            .max_runtime
            .map(|max| max.saturating_sub(started.elapsed()))
    }

    fn set_state(&self, state: RunState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "runner state");
        }
    }
}

/// Map a step result to the write-back for its item.
///
/// Retryable results requeue with capped exponential backoff until the
/// item's attempt bound is reached, then fail as `RetriesExhausted`.
pub fn resolve(
    item: &WorkItem,
    result: ProcessingResult,
    now: DateTime<Utc>,
    backoff: &BackoffScheduler,
    default_max_attempts: u32,
) -> Resolution {
    match result {
        ProcessingResult::Success(output) => Resolution::Done {
            output: output.data,
            artifacts: output.artifacts,
        },
        ProcessingResult::Skipped(reason) => Resolution::Skipped { reason },
        ProcessingResult::Fatal { class, reason } => Resolution::Failed {
            kind: match class {
                ErrorClass::MalformedResult => FailureKind::MalformedResult,
                _ => FailureKind::Fatal,
            },
            error: reason,
        },
        ProcessingResult::Retryable { class, reason }
            if item.attempts < item.attempt_limit(default_max_attempts) =>
        {
            let delay = backoff.retry_delay(item.attempts.saturating_sub(1), class);
            let available_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(now);
            Resolution::Requeue {
                available_at,
                error: format!("{}: {reason}", class.as_str()),
            }
        }
        ProcessingResult::Retryable { reason, .. } => Resolution::Failed {
            kind: FailureKind::RetriesExhausted,
            error: reason,
        },
    }
}

fn store_abort(e: Error) -> RunOutcome {
    RunOutcome::Aborted(AbortReason::Store(e.to_string()))
}

fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
