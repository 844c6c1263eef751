//! Message retrieval with a two-strategy fallback.
//!
//! Search asks the backend to match the phrase server-side and only ships
//! matches; iteration walks the whole history newest-first and filters
//! locally. Search is fast but some backends restrict it and substring
//! search can miss phrase-splitting formatting; iteration is strictly
//! correct but fetches everything. If search turns out to be unsupported,
//! the retriever downgrades to iteration for the rest of the run.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::channel::{ChannelClient, Message};
use crate::error::ChannelError;

/// Messages fetched per gateway call.
const FETCH_PAGE_SIZE: usize = 100;

/// Transient failures tolerated per page before falling back (search) or
/// giving up (iteration).
const TRANSIENT_RETRIES: u32 = 3;

/// Base delay between transient retries; scaled linearly per attempt.
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// The closed set of retrieval strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalStrategy {
    /// Server-side phrase search, newest-first.
    Search,
    /// Full reverse-chronological walk with local filtering.
    Iteration,
}

impl RetrievalStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Iteration => "iteration",
        }
    }
}

/// Lazy, finite, forward-only source of matching messages.
///
/// Not restartable: resume across runs happens at the orchestrator level
/// via the checkpoint, never by re-running a retriever.
pub struct MessageRetriever {
    client: Arc<dyn ChannelClient>,
    channel: String,
    phrase: String,
    strategy: RetrievalStrategy,
    page_size: usize,
    /// Paging position within this run: fetch below this id.
    offset_id: Option<i64>,
    /// Checkpoint cursor; iteration (initial or after fallback) starts here.
    resume_cursor: Option<i64>,
    /// Matching messages still allowed to be yielded.
    remaining: Option<usize>,
    /// Oldest id fetched while iterating; feeds cursor advancement.
    oldest_fetched: Option<i64>,
    done: bool,
}

impl MessageRetriever {
    pub fn new(
        client: Arc<dyn ChannelClient>,
        channel: impl Into<String>,
        phrase: impl Into<String>,
        strategy: RetrievalStrategy,
        limit: Option<usize>,
        resume_cursor: Option<i64>,
    ) -> Self {
        let offset_id = match strategy {
            RetrievalStrategy::Search => None,
            RetrievalStrategy::Iteration => resume_cursor,
        };
        Self {
            client,
            channel: channel.into(),
            phrase: phrase.into(),
            strategy,
            page_size: FETCH_PAGE_SIZE,
            offset_id,
            resume_cursor,
            remaining: limit,
            oldest_fetched: None,
            done: false,
        }
    }

    /// Currently active strategy.
    pub fn strategy(&self) -> RetrievalStrategy {
        self.strategy
    }

    /// Whether the active strategy still uses server-side search.
    pub fn supports_search(&self) -> bool {
        self.strategy == RetrievalStrategy::Search
    }

    /// Oldest id reached while iterating, if any.
    pub fn oldest_fetched(&self) -> Option<i64> {
        self.oldest_fetched
    }

    /// Yield the next batch of matching messages, or `None` once the
    /// history (or the configured cap) is exhausted. End-of-sequence is a
    /// sentinel, never an error, and is sticky.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Message>>, ChannelError> {
        if self.done || self.remaining == Some(0) {
            return Ok(None);
        }

        loop {
            let page = self.fetch_page().await?;
            if page.is_empty() {
                self.done = true;
                return Ok(None);
            }

            // Pages are newest-first; the last entry is the next offset.
            self.offset_id = page.last().map(|m| m.id);

            let mut matches: Vec<Message> = match self.strategy {
                RetrievalStrategy::Search => page,
                RetrievalStrategy::Iteration => {
                    self.oldest_fetched = self.offset_id;
                    page.into_iter()
                        .filter(|m| m.text.contains(&self.phrase))
                        .collect()
                }
            };

            if let Some(remaining) = self.remaining.as_mut() {
                if matches.len() >= *remaining {
                    matches.truncate(*remaining);
                    *remaining = 0;
                    self.done = true;
                } else {
                    *remaining -= matches.len();
                }
            }

            if !matches.is_empty() {
                debug!(
                    strategy = self.strategy.label(),
                    count = matches.len(),
                    "Yielding matching messages"
                );
                return Ok(Some(matches));
            }
            if self.done {
                return Ok(None);
            }
            // Nothing matched in this page; keep walking.
        }
    }

    /// Fetch one page with the active strategy, applying the retry and
    /// fallback policy.
    async fn fetch_page(&mut self) -> Result<Vec<Message>, ChannelError> {
        let mut transient_failures: u32 = 0;

        loop {
            let result = match self.strategy {
                RetrievalStrategy::Search => {
                    self.client
                        .search_messages(&self.channel, &self.phrase, self.offset_id, self.page_size)
                        .await
                }
                RetrievalStrategy::Iteration => {
                    self.client
                        .iter_messages(&self.channel, self.offset_id, self.page_size)
                        .await
                }
            };

            match result {
                Ok(page) => return Ok(page),

                // Not a retry case: the backend cannot search at all.
                Err(ChannelError::SearchUnsupported { reason, .. })
                    if self.strategy == RetrievalStrategy::Search =>
                {
                    warn!(
                        %reason,
                        "Server-side search unavailable, switching to full iteration for the rest of the run"
                    );
                    self.downgrade();
                    transient_failures = 0;
                }

                Err(err) if err.is_transient() => {
                    transient_failures += 1;
                    if transient_failures >= TRANSIENT_RETRIES {
                        if self.strategy == RetrievalStrategy::Search {
                            warn!(
                                error = %err,
                                failures = transient_failures,
                                "Search keeps failing, switching to full iteration for the rest of the run"
                            );
                            self.downgrade();
                            transient_failures = 0;
                            continue;
                        }
                        return Err(err);
                    }

                    let delay = match &err {
                        ChannelError::RateLimited {
                            retry_after: Some(wait),
                            ..
                        } => *wait,
                        _ => TRANSIENT_RETRY_DELAY * transient_failures,
                    };
                    debug!(
                        error = %err,
                        attempt = transient_failures,
                        delay_ms = delay.as_millis() as u64,
                        "Transient fetch failure, retrying same strategy"
                    );
                    tokio::time::sleep(delay).await;
                }

                Err(err) => return Err(err),
            }
        }
    }

    /// Permanent switch to iteration; restart paging from the checkpoint
    /// cursor so nothing between it and the search position is missed.
    fn downgrade(&mut self) {
        self.strategy = RetrievalStrategy::Iteration;
        self.offset_id = self.resume_cursor;
    }
}
