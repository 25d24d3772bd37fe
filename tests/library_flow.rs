mod support;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use time::OffsetDateTime;
use tokio::sync::Notify;

use almanac::application::error::LibraryError;
use almanac::application::narrative::NarrativeStatus;
use almanac::application::ports::{
    Generation, GenerationError, NarrativeGenerator, PromptPayload,
};
use almanac::application::repos::{
    BooksRepo, CoordinationError, CoordinationStore, InsertOutcome, NewBook, RepoError,
};
use almanac::domain::{
    Book, BookKey, CachedNarrative, LibraryKind, NarrativeSection, RawInput,
};
use almanac::infra::memory::{InMemoryBooks, InMemoryCoordination};

use support::{
    FakeEngine, Harness, HarnessOptions, ScriptedGenerator, build_library, narrative_request,
    narrative_text, natal_raw, numerology_raw, sections_request,
};

fn budget_key() -> String {
    format!("budget:tokens:{}", OffsetDateTime::now_utc().date())
}

fn narrative_lock(book: &Book) -> String {
    format!("lock:{}:{}:narrative", book.library, book.key)
}

#[tokio::test]
async fn geometry_requests_never_touch_the_generator() {
    let generator = Arc::new(ScriptedGenerator::new());
    let harness = Harness::new(generator.clone());

    let first = harness
        .library
        .get_or_compute_book(&natal_raw(), &harness.config)
        .await
        .expect("first compute");
    let second = harness
        .library
        .get_or_compute_book(&natal_raw(), &harness.config)
        .await
        .expect("cached read");

    assert_eq!(first.key, second.key);
    assert_eq!(first.access_count, 1);
    assert_eq!(second.access_count, 2);
    assert!(first.narrative.is_none());
    assert_eq!(harness.engine.calls(), 1);
    assert_eq!(generator.calls(), 0);
    assert_eq!(harness.books.len(), 1);
}

#[tokio::test]
async fn rounding_shares_a_book_and_schema_bumps_split_it() {
    let harness = Harness::new(Arc::new(ScriptedGenerator::new()));

    let k1 = harness
        .library
        .get_or_compute_book(&natal_raw(), &harness.config)
        .await
        .expect("k1");

    let nudged = RawInput {
        latitude: Some(40.712_800_1),
        ..natal_raw()
    };
    let same = harness
        .library
        .get_or_compute_book(&nudged, &harness.config)
        .await
        .expect("k1 again");
    assert_eq!(same.key, k1.key);
    assert_eq!(same.access_count, k1.access_count + 1);
    assert_eq!(harness.engine.calls(), 1);

    let bumped = harness.config.clone().with_schema_version(9);
    let k2 = harness
        .library
        .get_or_compute_book(&natal_raw(), &bumped)
        .await
        .expect("k2");
    assert_ne!(k2.key, k1.key);
    assert_eq!(k2.engine.schema_version, 9);
    assert_eq!(k2.access_count, 1);
    assert_eq!(harness.engine.calls(), 2);
    assert_eq!(harness.books.len(), 2);
}

#[tokio::test]
async fn same_fields_in_another_library_are_distinct_books() {
    let harness = Harness::new(Arc::new(ScriptedGenerator::new()));

    let numerology = harness
        .library
        .get_or_compute_book(&numerology_raw("Ada Lovelace"), &harness.config)
        .await
        .expect("numerology");
    let natal = harness
        .library
        .get_or_compute_book(&natal_raw(), &harness.config)
        .await
        .expect("natal");

    assert_eq!(numerology.library, LibraryKind::Numerology);
    assert_eq!(natal.library, LibraryKind::Natal);
    assert_ne!(numerology.key, natal.key);
}

#[tokio::test]
async fn incomplete_input_is_rejected_before_any_computation() {
    let harness = Harness::new(Arc::new(ScriptedGenerator::new()));
    let raw = RawInput {
        time: None,
        ..natal_raw()
    };

    let err = harness
        .library
        .get_or_compute_book(&raw, &harness.config)
        .await
        .expect_err("missing time");
    assert_eq!(err.code(), "incomplete_input");
    assert!(err.is_caller_error());
    assert_eq!(harness.engine.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_requests_converge_on_one_book() {
    let books = InMemoryBooks::new();
    let engine = Arc::new(FakeEngine::with_delay(Duration::from_millis(25)));
    let library = build_library(
        Arc::new(books.clone()),
        Arc::new(InMemoryCoordination::new()),
        engine.clone(),
        Arc::new(ScriptedGenerator::new()),
        HarnessOptions::default(),
    );
    let config = almanac::domain::EngineConfig::default();

    let results = join_all((0..8).map(|_| {
        let library = library.clone();
        let config = config.clone();
        async move { library.get_or_compute_book(&natal_raw(), &config).await }
    }))
    .await;

    let returned: Vec<Book> = results
        .into_iter()
        .map(|result| result.expect("every caller gets the book"))
        .collect();
    let first = &returned[0];
    assert!(returned.iter().all(|book| book.key == first.key));
    assert!(returned.iter().all(|book| book.geometry == first.geometry));
    assert_eq!(books.len(), 1);
    assert!(engine.calls() >= 1);
}

#[tokio::test]
async fn narratives_are_generated_once_and_shared_across_callers() {
    let generator = Arc::new(ScriptedGenerator::new());
    let harness = Harness::new(generator.clone());

    let miss = harness
        .library
        .get_book_with_narrative(
            &natal_raw(),
            &harness.config,
            &narrative_request("alice", "en", 3),
        )
        .await
        .expect("generated");
    assert_eq!(miss.status, NarrativeStatus::Generated);
    assert!(miss.narrative_available());
    let narrative = miss.book.narrative.as_ref().expect("narrative attached");
    assert_eq!(narrative.prompt_version, 3);
    assert_eq!(narrative.document.highlights.len(), 3);

    let hit = harness
        .library
        .get_book_with_narrative(&natal_raw(), &harness.config, &narrative_request("bob", "en", 3))
        .await
        .expect("cached");
    assert_eq!(hit.status, NarrativeStatus::Cached);
    assert_eq!(hit.book.narrative, miss.book.narrative);
    assert_eq!(generator.calls(), 1);

    let stored = harness
        .books
        .find_book(LibraryKind::Natal, &miss.book.key)
        .await
        .expect("read")
        .expect("stored");
    assert_eq!(stored.narrative, miss.book.narrative);
}

#[tokio::test]
async fn language_or_prompt_changes_invalidate_the_narrative() {
    let generator = Arc::new(ScriptedGenerator::new());
    let harness = Harness::new(generator.clone());
    let raw = numerology_raw("Ada Lovelace");

    harness
        .library
        .get_book_with_narrative(&raw, &harness.config, &narrative_request("a", "en", 1))
        .await
        .expect("en v1");

    let spanish = harness
        .library
        .get_book_with_narrative(&raw, &harness.config, &narrative_request("b", "es", 1))
        .await
        .expect("es v1");
    assert_eq!(spanish.status, NarrativeStatus::Generated);
    assert_eq!(
        spanish.book.narrative.as_ref().map(|n| n.language.as_str()),
        Some("es")
    );

    let bumped = harness
        .library
        .get_book_with_narrative(&raw, &harness.config, &narrative_request("c", "es", 2))
        .await
        .expect("es v2");
    assert_eq!(bumped.status, NarrativeStatus::Generated);
    assert_eq!(generator.calls(), 3);

    // Only one narrative slot: the English copy is gone.
    let english = harness
        .library
        .get_book_with_narrative(&raw, &harness.config, &narrative_request("d", "en", 2))
        .await
        .expect("en v2");
    assert_eq!(english.status, NarrativeStatus::Generated);
    assert_eq!(generator.calls(), 4);
}

#[tokio::test]
async fn invalid_output_is_never_cached_but_still_charged() {
    let generator = Arc::new(ScriptedGenerator::with_tokens(100));
    generator.push_text("Sorry, I cannot help with that.").await;
    let harness = Harness::new(generator.clone());

    let outcome = harness
        .library
        .get_book_with_narrative(
            &natal_raw(),
            &harness.config,
            &narrative_request("alice", "en", 1),
        )
        .await
        .expect("degrades to geometry");
    assert_eq!(outcome.status, NarrativeStatus::InvalidOutput);
    assert!(!outcome.narrative_available());
    assert!(outcome.book.narrative.is_none());

    let stored = harness
        .books
        .find_book(LibraryKind::Natal, &outcome.book.key)
        .await
        .expect("read")
        .expect("geometry stored");
    assert!(stored.narrative.is_none());
    assert_eq!(
        harness.coordination.get(&budget_key()).await.expect("store"),
        Some(100)
    );

    // The lock was released on failure, so the next caller generates.
    let retry = harness
        .library
        .get_book_with_narrative(&natal_raw(), &harness.config, &narrative_request("bob", "en", 1))
        .await
        .expect("retry");
    assert_eq!(retry.status, NarrativeStatus::Generated);
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn upstream_errors_degrade_to_geometry() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator
        .push(Err(GenerationError::Status {
            status: 500,
            body: "overloaded".to_string(),
        }))
        .await;
    let harness = Harness::new(generator.clone());

    let outcome = harness
        .library
        .get_book_with_narrative(
            &natal_raw(),
            &harness.config,
            &narrative_request("alice", "en", 1),
        )
        .await
        .expect("degrades");
    assert_eq!(outcome.status, NarrativeStatus::GenerationFailed);
    assert!(outcome.book.narrative.is_none());
    assert_eq!(
        harness.coordination.get(&budget_key()).await.expect("store"),
        None
    );
}

#[tokio::test]
async fn failed_regeneration_hides_a_narrative_cached_for_another_language() {
    let generator = Arc::new(ScriptedGenerator::new());
    let harness = Harness::new(generator.clone());

    let english = harness
        .library
        .get_book_with_narrative(&natal_raw(), &harness.config, &narrative_request("a", "en", 1))
        .await
        .expect("en v1");
    assert_eq!(english.status, NarrativeStatus::Generated);

    generator.push_text("no narrative today").await;
    let spanish = harness
        .library
        .get_book_with_narrative(&natal_raw(), &harness.config, &narrative_request("b", "es", 1))
        .await
        .expect("degrades");
    assert_eq!(spanish.status, NarrativeStatus::InvalidOutput);
    assert!(!spanish.narrative_available());
    assert!(spanish.book.narrative.is_none());

    let stored = harness
        .books
        .find_book(LibraryKind::Natal, &english.book.key)
        .await
        .expect("read")
        .expect("stored");
    assert_eq!(
        stored.narrative.as_ref().map(|n| n.language.as_str()),
        Some("en")
    );
}

#[tokio::test(start_paused = true)]
async fn slow_generation_times_out_without_caching() {
    let generator = Arc::new(ScriptedGenerator::with_delay(Duration::from_secs(120)));
    let harness = Harness::with_options(
        generator.clone(),
        HarnessOptions {
            generation_timeout: Duration::from_secs(5),
            ..HarnessOptions::default()
        },
    );

    let outcome = harness
        .library
        .get_book_with_narrative(
            &natal_raw(),
            &harness.config,
            &narrative_request("alice", "en", 1),
        )
        .await
        .expect("degrades");
    assert_eq!(outcome.status, NarrativeStatus::Timeout);
    assert!(outcome.book.narrative.is_none());
}

#[tokio::test]
async fn exhausted_budget_blocks_generation_but_not_hits() {
    let generator = Arc::new(ScriptedGenerator::with_tokens(150));
    let harness = Harness::with_options(
        generator.clone(),
        HarnessOptions {
            daily_token_limit: 100,
            ..HarnessOptions::default()
        },
    );

    let first = harness
        .library
        .get_book_with_narrative(&natal_raw(), &harness.config, &narrative_request("a", "en", 1))
        .await
        .expect("under budget");
    assert_eq!(first.status, NarrativeStatus::Generated);

    let err = harness
        .library
        .get_book_with_narrative(
            &numerology_raw("Ada Lovelace"),
            &harness.config,
            &narrative_request("b", "en", 1),
        )
        .await
        .expect_err("budget spent");
    assert!(matches!(err, LibraryError::BudgetExceeded { .. }));
    let retry = err.retry_after().expect("retry hint");
    assert!(retry > Duration::ZERO && retry <= Duration::from_secs(86_400));

    let hit = harness
        .library
        .get_book_with_narrative(&natal_raw(), &harness.config, &narrative_request("c", "en", 1))
        .await
        .expect("hits ignore the budget");
    assert_eq!(hit.status, NarrativeStatus::Cached);

    harness
        .library
        .get_or_compute_book(&numerology_raw("Ada Lovelace"), &harness.config)
        .await
        .expect("geometry ignores the budget");
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn repeated_misses_from_one_caller_are_throttled() {
    let generator = Arc::new(ScriptedGenerator::new());
    let harness = Harness::new(generator.clone());

    harness
        .library
        .get_book_with_narrative(
            &natal_raw(),
            &harness.config,
            &narrative_request("alice", "en", 1),
        )
        .await
        .expect("first miss");
    let err = harness
        .library
        .get_book_with_narrative(
            &numerology_raw("Ada Lovelace"),
            &harness.config,
            &narrative_request("alice", "en", 1),
        )
        .await
        .expect_err("cooldown");
    assert!(matches!(err, LibraryError::RateLimited { .. }));
    assert_eq!(generator.calls(), 1);

    // Hits are free even inside the cooldown.
    let hit = harness
        .library
        .get_book_with_narrative(
            &natal_raw(),
            &harness.config,
            &narrative_request("alice", "en", 1),
        )
        .await
        .expect("hit");
    assert_eq!(hit.status, NarrativeStatus::Cached);
}

/// Holds every generation open until the test lets it finish.
#[derive(Default)]
struct BlockingGenerator {
    started: Notify,
    proceed: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl NarrativeGenerator for BlockingGenerator {
    async fn generate(&self, _prompt: &PromptPayload) -> Result<Generation, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.proceed.notified().await;
        Ok(Generation {
            text: narrative_text(),
            input_tokens: 10,
            output_tokens: 10,
        })
    }
}

#[tokio::test]
async fn second_caller_backs_off_while_generation_is_in_flight() {
    let generator = Arc::new(BlockingGenerator::default());
    let harness = Harness::new(generator.clone());

    let library = harness.library.clone();
    let config = harness.config.clone();
    let first = tokio::spawn(async move {
        library
            .get_book_with_narrative(&natal_raw(), &config, &narrative_request("alice", "en", 1))
            .await
    });
    generator.started.notified().await;

    let err = harness
        .library
        .get_book_with_narrative(&natal_raw(), &harness.config, &narrative_request("bob", "en", 1))
        .await
        .expect_err("lock held");
    match err {
        LibraryError::LockUnavailable { retry_after } => {
            assert!(retry_after > Duration::ZERO);
            assert!(retry_after <= Duration::from_secs(5));
        }
        other => panic!("expected lock_unavailable, got {other:?}"),
    }

    generator.proceed.notify_one();
    let outcome = first.await.expect("join").expect("generated");
    assert_eq!(outcome.status, NarrativeStatus::Generated);

    let waiting = harness
        .library
        .get_book_with_narrative(
            &natal_raw(),
            &harness.config,
            &narrative_request("carol", "en", 1),
        )
        .await
        .expect("persisted before release");
    assert_eq!(waiting.status, NarrativeStatus::Cached);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn aborted_caller_frees_the_lock_before_its_ttl() {
    let generator = Arc::new(BlockingGenerator::default());
    let harness = Harness::new(generator.clone());
    let book = harness
        .library
        .get_or_compute_book(&natal_raw(), &harness.config)
        .await
        .expect("book");
    let lock = narrative_lock(&book);

    let library = harness.library.clone();
    let config = harness.config.clone();
    let caller = tokio::spawn(async move {
        library
            .get_book_with_narrative(&natal_raw(), &config, &narrative_request("alice", "en", 1))
            .await
    });
    generator.started.notified().await;
    assert!(
        harness
            .coordination
            .remaining_ttl(&lock)
            .await
            .expect("store")
            .is_some()
    );

    caller.abort();
    assert!(caller.await.expect_err("aborted").is_cancelled());

    let mut reacquired = false;
    for _ in 0..50 {
        if harness
            .coordination
            .try_acquire(&lock, "next", Duration::from_secs(30))
            .await
            .expect("store")
        {
            reacquired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reacquired, "lock still held after the caller went away");
}

/// Spends the whole daily budget the moment a generation lock is taken,
/// as another instance finishing a generation would.
struct SpendOnAcquire {
    inner: InMemoryCoordination,
    spend: i64,
}

#[async_trait]
impl CoordinationStore for SpendOnAcquire {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let acquired = self.inner.try_acquire(key, token, ttl).await?;
        if acquired && key.starts_with("lock:") {
            self.inner
                .increment(&budget_key(), self.spend, Duration::from_secs(3600))
                .await?;
        }
        Ok(acquired)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, CoordinationError> {
        self.inner.release(key, token).await
    }

    async fn increment(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, CoordinationError> {
        self.inner.increment(key, by, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, CoordinationError> {
        self.inner.get(key).await
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, CoordinationError> {
        self.inner.remaining_ttl(key).await
    }
}

#[tokio::test]
async fn budget_spent_while_acquiring_releases_the_lock() {
    let generator = Arc::new(ScriptedGenerator::new());
    let coordination = Arc::new(SpendOnAcquire {
        inner: InMemoryCoordination::new(),
        spend: 1_000,
    });
    let library = build_library(
        Arc::new(InMemoryBooks::new()),
        coordination.clone(),
        Arc::new(FakeEngine::default()),
        generator.clone(),
        HarnessOptions {
            daily_token_limit: 1_000,
            ..HarnessOptions::default()
        },
    );
    let config = almanac::domain::EngineConfig::default();
    let book = library
        .get_or_compute_book(&natal_raw(), &config)
        .await
        .expect("book");

    let err = library
        .get_book_with_narrative(&natal_raw(), &config, &narrative_request("alice", "en", 1))
        .await
        .expect_err("budget spent after the first check");
    assert!(matches!(err, LibraryError::BudgetExceeded { .. }));
    assert_eq!(generator.calls(), 0);

    let lock = narrative_lock(&book);
    assert_eq!(
        coordination.remaining_ttl(&lock).await.expect("store"),
        None
    );
    assert!(
        coordination
            .inner
            .try_acquire(&lock, "next", Duration::from_secs(30))
            .await
            .expect("store")
    );
}

#[tokio::test]
async fn only_stale_sections_are_regenerated() {
    let generator = Arc::new(ScriptedGenerator::new());
    let harness = Harness::new(generator.clone());

    let first = harness
        .library
        .get_book_with_sections(
            &natal_raw(),
            &harness.config,
            &sections_request("a", &[("career", 1), ("love", 1)]),
        )
        .await
        .expect("sections");
    assert!(first.unavailable_sections.is_empty());
    assert_eq!(first.book.sections.len(), 2);
    assert_eq!(generator.calls(), 2);

    let second = harness
        .library
        .get_book_with_sections(
            &natal_raw(),
            &harness.config,
            &sections_request("b", &[("career", 1), ("love", 2)]),
        )
        .await
        .expect("sections");
    assert_eq!(generator.calls(), 3);
    assert_eq!(second.book.sections["love"].version, 2);
    assert_eq!(
        second.book.sections["career"].generated_at,
        first.book.sections["career"].generated_at
    );

    let current = harness
        .library
        .get_book_with_sections(
            &natal_raw(),
            &harness.config,
            &sections_request("b", &[("career", 1), ("love", 2)]),
        )
        .await
        .expect("all current");
    assert!(current.unavailable_sections.is_empty());
    assert_eq!(generator.calls(), 3);

    let stored = harness
        .books
        .find_book(LibraryKind::Natal, &first.book.key)
        .await
        .expect("read")
        .expect("stored");
    assert_eq!(stored.sections.len(), 2);
    assert_eq!(stored.sections["love"].version, 2);
}

#[tokio::test]
async fn failed_sections_are_reported_and_the_rest_kept() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.push_text(r#"{"body": "too short"}"#).await;
    let harness = Harness::new(generator.clone());

    let outcome = harness
        .library
        .get_book_with_sections(
            &natal_raw(),
            &harness.config,
            &sections_request("a", &[("career", 1), ("love", 1)]),
        )
        .await
        .expect("partial");

    assert_eq!(outcome.unavailable_sections, vec!["career".to_string()]);
    assert!(outcome.book.sections.contains_key("love"));
    assert!(!outcome.book.sections.contains_key("career"));
}

#[tokio::test]
async fn failed_section_upgrade_drops_the_stale_copy_from_the_response() {
    let generator = Arc::new(ScriptedGenerator::new());
    let harness = Harness::new(generator.clone());

    harness
        .library
        .get_book_with_sections(
            &natal_raw(),
            &harness.config,
            &sections_request("a", &[("career", 1)]),
        )
        .await
        .expect("career v1");

    generator.push_text(r#"{"body": "too short"}"#).await;
    let upgrade = harness
        .library
        .get_book_with_sections(
            &natal_raw(),
            &harness.config,
            &sections_request("b", &[("career", 2)]),
        )
        .await
        .expect("degrades");
    assert_eq!(upgrade.unavailable_sections, vec!["career".to_string()]);
    assert!(!upgrade.book.sections.contains_key("career"));

    let stored = harness
        .books
        .find_book(LibraryKind::Natal, &upgrade.book.key)
        .await
        .expect("read")
        .expect("stored");
    assert_eq!(stored.sections["career"].version, 1);
}

#[tokio::test]
async fn malformed_section_names_are_caller_errors() {
    let harness = Harness::new(Arc::new(ScriptedGenerator::new()));

    let err = harness
        .library
        .get_book_with_sections(
            &natal_raw(),
            &harness.config,
            &sections_request("a", &[("Career Path", 1)]),
        )
        .await
        .expect_err("bad name");
    assert_eq!(err.code(), "invalid_format");
}

/// Coordination store that is always down.
struct DownCoordination;

#[async_trait]
impl CoordinationStore for DownCoordination {
    async fn try_acquire(&self, _: &str, _: &str, _: Duration) -> Result<bool, CoordinationError> {
        Err(CoordinationError::unavailable("connection refused"))
    }

    async fn release(&self, _: &str, _: &str) -> Result<bool, CoordinationError> {
        Err(CoordinationError::unavailable("connection refused"))
    }

    async fn increment(&self, _: &str, _: i64, _: Duration) -> Result<i64, CoordinationError> {
        Err(CoordinationError::unavailable("connection refused"))
    }

    async fn get(&self, _: &str) -> Result<Option<i64>, CoordinationError> {
        Err(CoordinationError::unavailable("connection refused"))
    }

    async fn remaining_ttl(&self, _: &str) -> Result<Option<Duration>, CoordinationError> {
        Err(CoordinationError::unavailable("connection refused"))
    }
}

#[tokio::test]
async fn unreachable_coordination_fails_closed_for_generation_only() {
    let generator = Arc::new(ScriptedGenerator::new());
    let library = build_library(
        Arc::new(InMemoryBooks::new()),
        Arc::new(DownCoordination),
        Arc::new(FakeEngine::default()),
        generator.clone(),
        HarnessOptions::default(),
    );
    let config = almanac::domain::EngineConfig::default();

    library
        .get_or_compute_book(&natal_raw(), &config)
        .await
        .expect("geometry does not need coordination");

    let err = library
        .get_book_with_narrative(&natal_raw(), &config, &narrative_request("a", "en", 1))
        .await
        .expect_err("fails closed");
    assert_eq!(err.code(), "coordination_unavailable");
    assert!(err.retry_after().is_some());
    assert_eq!(generator.calls(), 0);
}

/// Reports every insert as a conflict but never has the row.
struct VanishingBooks;

#[async_trait]
impl BooksRepo for VanishingBooks {
    async fn find_book(&self, _: LibraryKind, _: &BookKey) -> Result<Option<Book>, RepoError> {
        Ok(None)
    }

    async fn insert_if_absent(&self, _: NewBook) -> Result<InsertOutcome, RepoError> {
        Ok(InsertOutcome::Conflict)
    }

    async fn record_access(
        &self,
        _: LibraryKind,
        _: &BookKey,
        _: OffsetDateTime,
    ) -> Result<(), RepoError> {
        Err(RepoError::NotFound)
    }

    async fn save_narrative(
        &self,
        _: LibraryKind,
        _: &BookKey,
        _: &CachedNarrative,
    ) -> Result<(), RepoError> {
        Err(RepoError::NotFound)
    }

    async fn merge_sections(
        &self,
        _: LibraryKind,
        _: &BookKey,
        _: &BTreeMap<String, NarrativeSection>,
    ) -> Result<(), RepoError> {
        Err(RepoError::NotFound)
    }
}

#[tokio::test]
async fn conflict_without_a_readable_row_is_an_integrity_error() {
    let library = build_library(
        Arc::new(VanishingBooks),
        Arc::new(InMemoryCoordination::new()),
        Arc::new(FakeEngine::default()),
        Arc::new(ScriptedGenerator::new()),
        HarnessOptions::default(),
    );

    let err = library
        .get_or_compute_book(&natal_raw(), &almanac::domain::EngineConfig::default())
        .await
        .expect_err("integrity");
    assert!(matches!(
        err,
        LibraryError::Persistence(RepoError::Integrity { .. })
    ));
}
