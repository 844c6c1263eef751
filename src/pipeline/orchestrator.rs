//! Pipeline orchestrator.
//!
//! Drives retrieve → dedupe → governed extraction → finalize. Dispatches
//! fan out as tasks, but every completion is finalized here, one at a
//! time, so the checkpoint and sink never see interleaved writes. Within a
//! completion the sink row (for `ok`) is appended before the checkpoint
//! mark; the startup sink-id union covers the crash window between the two.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channel::Message;
use crate::checkpoint::CheckpointStore;
use crate::error::{Error, GovernorError, PipelineError};
use crate::extract::{ExtractionClient, ExtractionResult, ExtractionStatus};
use crate::governor::Governor;
use crate::pipeline::RunStats;
use crate::retriever::{MessageRetriever, RetrievalStrategy};
use crate::sink::{CsvSink, SinkRow};

/// How long an interrupt or fatal abort waits for in-flight items before
/// abandoning them to the next run.
const DRAIN_GRACE: Duration = Duration::from_secs(20);

/// Completion channel capacity.
const COMPLETION_BUFFER: usize = 64;

/// Everything the orchestrator owns for one run.
pub struct OrchestratorDeps {
    pub retriever: MessageRetriever,
    pub extractor: Arc<ExtractionClient>,
    pub governor: Arc<Governor>,
    pub checkpoint: CheckpointStore,
    pub sink: CsvSink,
    /// Flips to true on an external stop signal.
    pub shutdown: watch::Receiver<bool>,
}

/// One finished dispatch, reported back for serialized finalization.
struct Completion {
    message: Message,
    outcome: Outcome,
}

enum Outcome {
    Finished(ExtractionResult),
    Exhausted { attempts: u32, reason: String },
    Fatal(String),
}

/// Single coordinating flow of control for one run.
pub struct Orchestrator {
    retriever: MessageRetriever,
    extractor: Arc<ExtractionClient>,
    governor: Arc<Governor>,
    checkpoint: CheckpointStore,
    sink: CsvSink,
    shutdown: watch::Receiver<bool>,
    /// Dispatches outstanding before the loop blocks on completions.
    dispatch_window: usize,
    drain_grace: Duration,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps, max_concurrent: usize) -> Self {
        Self {
            retriever: deps.retriever,
            extractor: deps.extractor,
            governor: deps.governor,
            checkpoint: deps.checkpoint,
            sink: deps.sink,
            shutdown: deps.shutdown,
            dispatch_window: max_concurrent.max(1) * 2,
            drain_grace: DRAIN_GRACE,
        }
    }

    #[cfg(test)]
    fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Run the pipeline to completion, interrupt or fatal abort.
    ///
    /// Always logs the outcome counters. A fatal abort comes back as
    /// [`PipelineError`] after finalizing whatever completed in time.
    pub async fn run(mut self) -> Result<RunStats, Error> {
        let mut stats = RunStats::default();
        let (tx, mut rx) = mpsc::channel::<Completion>(COMPLETION_BUFFER);

        let mut outstanding: usize = 0;
        // Dispatched, not yet terminal. Bounds how far the iteration cursor
        // may advance: nothing newer than a pending id is ever skipped.
        let mut pending: BTreeSet<i64> = BTreeSet::new();
        let mut fatal: Option<PipelineError> = None;
        let mut interrupted = false;

        'dispatch: loop {
            if *self.shutdown.borrow() {
                interrupted = true;
                break;
            }

            let batch = match self.retriever.next_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(err) => {
                    fatal = Some(PipelineError::Retrieval(err));
                    break;
                }
            };

            for message in batch {
                stats.found += 1;
                if self.checkpoint.is_processed(message.id) {
                    debug!(id = message.id, "Already processed, skipping");
                    stats.already_processed += 1;
                    continue;
                }
                // A mid-run search→iteration fallback can re-yield a message
                // that is still in flight; never dispatch it twice.
                if pending.contains(&message.id) {
                    debug!(id = message.id, "Already in flight, skipping");
                    continue;
                }

                // Opportunistically finalize completions that are ready.
                while let Ok(completion) = rx.try_recv() {
                    outstanding -= 1;
                    self.finalize(completion, &mut stats, &mut pending, &mut fatal)?;
                }

                // Backpressure: block on completions once the window fills.
                while outstanding >= self.dispatch_window && fatal.is_none() {
                    let Some(completion) = rx.recv().await else {
                        break;
                    };
                    outstanding -= 1;
                    self.finalize(completion, &mut stats, &mut pending, &mut fatal)?;
                }

                if fatal.is_some() {
                    interrupted = true;
                    break 'dispatch;
                }
                if *self.shutdown.borrow() {
                    interrupted = true;
                    break 'dispatch;
                }

                pending.insert(message.id);
                outstanding += 1;
                self.dispatch(message, tx.clone());
            }
        }

        // No new dispatches from here on.
        drop(tx);

        let mut deadline: Option<Instant> = None;
        let mut watch_closed = false;
        while outstanding > 0 {
            if deadline.is_none() && (interrupted || fatal.is_some()) {
                info!(
                    in_flight = outstanding,
                    grace_secs = self.drain_grace.as_secs(),
                    "Stopped dispatching, draining in-flight items"
                );
                deadline = Some(Instant::now() + self.drain_grace);
            }

            let received = match deadline {
                Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                    Ok(completion) => completion,
                    Err(_) => {
                        stats.abandoned = outstanding;
                        warn!(
                            abandoned = outstanding,
                            "Grace period elapsed; unfinished items stay unmarked and retry next run"
                        );
                        break;
                    }
                },
                None if watch_closed => rx.recv().await,
                None => {
                    tokio::select! {
                        completion = rx.recv() => completion,
                        changed = self.shutdown.changed() => {
                            match changed {
                                Ok(()) if *self.shutdown.borrow() => interrupted = true,
                                Ok(()) => {}
                                Err(_) => watch_closed = true,
                            }
                            continue;
                        }
                    }
                }
            };

            let Some(completion) = received else { break };
            outstanding -= 1;
            self.finalize(completion, &mut stats, &mut pending, &mut fatal)?;
        }

        self.sink.flush()?;
        info!(%stats, "Run finished");

        match fatal {
            Some(err) => Err(err.into()),
            None => Ok(stats),
        }
    }

    /// Fan one message out through the governor.
    fn dispatch(&self, message: Message, tx: mpsc::Sender<Completion>) {
        let extractor = Arc::clone(&self.extractor);
        let governor = Arc::clone(&self.governor);

        tokio::spawn(async move {
            let label = format!("message {}", message.id);
            let outcome = match governor.run(&label, || extractor.extract(&message)).await {
                Ok(result) => Outcome::Finished(result),
                Err(GovernorError::Exhausted {
                    attempts,
                    last_error,
                }) => Outcome::Exhausted {
                    attempts,
                    reason: last_error,
                },
                Err(GovernorError::Fatal(reason)) => Outcome::Fatal(reason),
            };
            // The orchestrator may already be gone after an abandon.
            let _ = tx.send(Completion { message, outcome }).await;
        });
    }

    /// Handle one terminal outcome. Only ever called from the run loop, so
    /// checkpoint and sink writes are never interleaved.
    fn finalize(
        &mut self,
        completion: Completion,
        stats: &mut RunStats,
        pending: &mut BTreeSet<i64>,
        fatal: &mut Option<PipelineError>,
    ) -> Result<(), Error> {
        let Completion { message, outcome } = completion;

        match outcome {
            Outcome::Fatal(reason) => {
                // Deliberately not marked processed and left pending: the
                // item retries on the next run and the cursor cannot pass it.
                error!(id = message.id, %reason, "Fatal failure, aborting run");
                if fatal.is_none() {
                    *fatal = Some(PipelineError::Fatal { reason });
                }
            }
            Outcome::Exhausted { attempts, reason } => {
                warn!(
                    id = message.id,
                    attempts,
                    reason = %reason,
                    "Retry budget exhausted, recording as failed-permanent"
                );
                let result = ExtractionResult::failed(message.id, reason);
                self.commit(&message, &result, stats)?;
                pending.remove(&message.id);
                self.advance_cursor(pending)?;
            }
            Outcome::Finished(result) => {
                self.commit(&message, &result, stats)?;
                pending.remove(&message.id);
                self.advance_cursor(pending)?;
            }
        }
        Ok(())
    }

    /// Record one terminal result: sink row first (ok only), then the
    /// checkpoint mark.
    fn commit(
        &mut self,
        message: &Message,
        result: &ExtractionResult,
        stats: &mut RunStats,
    ) -> Result<(), Error> {
        match result.status {
            ExtractionStatus::Ok => {
                let row = SinkRow::from_extraction(message, result, self.extractor.model_name());
                self.sink.append(&row)?;
                self.checkpoint.mark_processed(message.id)?;
                stats.ok += 1;
                info!(id = message.id, "Extracted and recorded");
            }
            ExtractionStatus::SkippedNonMatching => {
                self.checkpoint.mark_processed(message.id)?;
                stats.skipped += 1;
                debug!(id = message.id, "No attack data, recorded without a row");
            }
            ExtractionStatus::FailedPermanent => {
                self.checkpoint.mark_processed(message.id)?;
                stats.failed += 1;
                warn!(id = message.id, "Recorded as failed-permanent");
            }
        }
        Ok(())
    }

    /// Advance the iteration cursor to the newest point below which nothing
    /// is still pending. Everything above it is terminal, so a resume from
    /// the cursor can never strand an in-flight message.
    fn advance_cursor(&mut self, pending: &BTreeSet<i64>) -> Result<(), Error> {
        if self.retriever.strategy() != RetrievalStrategy::Iteration {
            return Ok(());
        }
        let Some(floor) = self.retriever.oldest_fetched() else {
            return Ok(());
        };
        let safe = match pending.iter().next_back() {
            Some(&newest_pending) => newest_pending + 1,
            None => floor,
        };
        self.checkpoint.advance_cursor(safe)?;
        Ok(())
    }
}
