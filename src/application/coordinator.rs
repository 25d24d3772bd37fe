//! Single-flight generation: budget, lock, call, validate.
//!
//! A successful attempt hands the still-held lease back to the caller so the
//! result can be persisted before the lock is released. Every other exit path
//! releases the lock here.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use time::{Date, OffsetDateTime};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    application::{
        error::LibraryError,
        ports::{GenerationError, NarrativeGenerator, PromptPayload},
        repos::{CoordinationError, CoordinationStore},
    },
    domain::{Book, error::DomainError},
};

const BUDGET_KEY_TTL: Duration = Duration::from_secs(48 * 3600);

#[derive(Debug, Clone)]
pub struct BudgetPolicy {
    /// Tokens (input + output) allowed per UTC day across all instances.
    pub daily_token_limit: u64,
}

#[derive(Debug, Clone)]
pub struct LockPolicy {
    pub ttl: Duration,
    /// Used when the holder's remaining TTL cannot be read.
    pub retry_hint: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(120),
            retry_hint: Duration::from_secs(5),
        }
    }
}

/// What is being generated for a book; each kind locks independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GenerationKind {
    Narrative,
    Section(String),
}

impl GenerationKind {
    pub fn label(&self) -> String {
        match self {
            GenerationKind::Narrative => "narrative".to_string(),
            GenerationKind::Section(name) => format!("section:{name}"),
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            GenerationKind::Narrative => "narrative",
            GenerationKind::Section(_) => "section",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Why a generation attempt produced nothing cacheable.
#[derive(Debug)]
pub enum GenerationFailure {
    Upstream(GenerationError),
    Timeout(Duration),
    InvalidOutput(DomainError),
}

impl GenerationFailure {
    pub fn code(&self) -> &'static str {
        match self {
            GenerationFailure::Upstream(_) => "generation_failed",
            GenerationFailure::Timeout(_) => "timeout",
            GenerationFailure::InvalidOutput(_) => "invalid_output",
        }
    }
}

/// A validated result whose lock is still held.
pub struct Generated<T> {
    pub value: T,
    pub usage: TokenUsage,
    pub lease: GenerationLease,
}

pub enum Attempt<T> {
    Generated(Generated<T>),
    Failed(GenerationFailure),
}

/// Ownership of a generation lock.
///
/// Dropping an unreleased lease schedules a best-effort release; the TTL
/// reclaims the lock if even that never runs.
pub struct GenerationLease {
    store: Arc<dyn CoordinationStore>,
    key: String,
    token: String,
    released: bool,
}

impl GenerationLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) {
        self.released = true;
        match self.store.release(&self.key, &self.token).await {
            Ok(true) => {}
            Ok(false) => warn!(
                lock = %self.key,
                "generation lock expired before release"
            ),
            Err(err) => warn!(
                lock = %self.key,
                error = %err,
                "failed to release generation lock; ttl will reclaim it"
            ),
        }
    }
}

impl Drop for GenerationLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(err) = store.release(&key, &token).await {
                warn!(lock = %key, error = %err, "deferred lock release failed");
            }
        });
    }
}

#[derive(Clone)]
pub struct GenerationCoordinator {
    store: Arc<dyn CoordinationStore>,
    generator: Arc<dyn NarrativeGenerator>,
    budget: BudgetPolicy,
    locks: LockPolicy,
    timeout: Duration,
}

impl GenerationCoordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        generator: Arc<dyn NarrativeGenerator>,
        budget: BudgetPolicy,
        locks: LockPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            generator,
            budget,
            locks,
            timeout,
        }
    }

    /// Run one generation attempt for `book`.
    ///
    /// Capacity problems (budget, lock held, store down) are errors. Upstream
    /// failures, timeouts and invalid output are reported as
    /// [`Attempt::Failed`] with nothing persisted and the lock released.
    pub async fn generate<T, F>(
        &self,
        book: &Book,
        kind: GenerationKind,
        prompt: PromptPayload,
        validate: F,
    ) -> Result<Attempt<T>, LibraryError>
    where
        F: FnOnce(&str) -> Result<T, DomainError>,
    {
        self.ensure_budget().await?;
        let lease = self.acquire(book, &kind).await?;

        if let Err(err) = self.ensure_budget().await {
            lease.release().await;
            return Err(err);
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.generator.generate(&prompt)).await;
        histogram!("almanac_generation_ms", "kind" => kind.metric_label())
            .record(started.elapsed().as_secs_f64() * 1000.0);

        let generation = match outcome {
            Ok(Ok(generation)) => generation,
            Ok(Err(err)) => {
                return Ok(self
                    .fail(book, &kind, lease, GenerationFailure::Upstream(err))
                    .await);
            }
            Err(_) => {
                let failure = GenerationFailure::Timeout(self.timeout);
                return Ok(self.fail(book, &kind, lease, failure).await);
            }
        };

        // Tokens were spent whether or not the output validates.
        let usage = TokenUsage {
            input_tokens: generation.input_tokens,
            output_tokens: generation.output_tokens,
        };
        self.charge(usage).await;

        match validate(&generation.text) {
            Ok(value) => {
                info!(
                    library = %book.library,
                    book_key = %book.key,
                    kind = %kind.label(),
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "generation succeeded"
                );
                Ok(Attempt::Generated(Generated {
                    value,
                    usage,
                    lease,
                }))
            }
            Err(err) => Ok(self
                .fail(book, &kind, lease, GenerationFailure::InvalidOutput(err))
                .await),
        }
    }

    /// Tokens spent today, as seen by the shared counter.
    pub async fn spent_today(&self) -> Result<u64, LibraryError> {
        let spent = self
            .store
            .get(&budget_key(OffsetDateTime::now_utc().date()))
            .await
            .map_err(|err| self.store_failure(err))?;
        Ok(spent.unwrap_or(0).max(0) as u64)
    }

    async fn ensure_budget(&self) -> Result<(), LibraryError> {
        let spent = self.spent_today().await?;
        if spent >= self.budget.daily_token_limit {
            counter!("almanac_budget_exceeded_total").increment(1);
            warn!(
                spent,
                limit = self.budget.daily_token_limit,
                "daily generation budget exhausted"
            );
            return Err(LibraryError::BudgetExceeded {
                retry_after: until_next_utc_day(OffsetDateTime::now_utc()),
            });
        }
        Ok(())
    }

    async fn acquire(
        &self,
        book: &Book,
        kind: &GenerationKind,
    ) -> Result<GenerationLease, LibraryError> {
        let key = format!("lock:{}:{}:{}", book.library, book.key, kind.label());
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .store
            .try_acquire(&key, &token, self.locks.ttl)
            .await
            .map_err(|err| self.store_failure(err))?;

        if !acquired {
            let retry_after = match self.store.remaining_ttl(&key).await {
                Ok(Some(remaining)) if !remaining.is_zero() => {
                    remaining.min(self.locks.retry_hint)
                }
                _ => self.locks.retry_hint,
            };
            info!(
                library = %book.library,
                book_key = %book.key,
                kind = %kind.label(),
                "generation already in progress"
            );
            return Err(LibraryError::LockUnavailable { retry_after });
        }

        Ok(GenerationLease {
            store: self.store.clone(),
            key,
            token,
            released: false,
        })
    }

    async fn charge(&self, usage: TokenUsage) {
        let total = usage.total();
        if total == 0 {
            return;
        }
        counter!("almanac_generation_tokens_total").increment(total);
        let key = budget_key(OffsetDateTime::now_utc().date());
        let by = i64::try_from(total).unwrap_or(i64::MAX);
        if let Err(err) = self.store.increment(&key, by, BUDGET_KEY_TTL).await {
            warn!(error = %err, tokens = total, "failed to record generation spend");
        }
    }

    async fn fail<T>(
        &self,
        book: &Book,
        kind: &GenerationKind,
        lease: GenerationLease,
        failure: GenerationFailure,
    ) -> Attempt<T> {
        lease.release().await;
        counter!(
            "almanac_generation_failed_total",
            "kind" => kind.metric_label(),
            "reason" => failure.code()
        )
        .increment(1);
        let detail = match &failure {
            GenerationFailure::Upstream(err) => err.to_string(),
            GenerationFailure::Timeout(after) => format!("timed out after {after:?}"),
            GenerationFailure::InvalidOutput(err) => err.to_string(),
        };
        warn!(
            library = %book.library,
            book_key = %book.key,
            kind = %kind.label(),
            reason = failure.code(),
            detail = %detail,
            "generation failed; nothing cached"
        );
        Attempt::Failed(failure)
    }

    fn store_failure(&self, err: CoordinationError) -> LibraryError {
        warn!(error = %err, "coordination store failed during generation");
        LibraryError::CoordinationUnavailable {
            source: err,
            retry_after: self.locks.retry_hint,
        }
    }
}

fn budget_key(day: Date) -> String {
    format!("budget:tokens:{day}")
}

fn until_next_utc_day(now: OffsetDateTime) -> Duration {
    let elapsed =
        u64::from(now.hour()) * 3600 + u64::from(now.minute()) * 60 + u64::from(now.second());
    Duration::from_secs((86_400 - elapsed).max(1))
}
