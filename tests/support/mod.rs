#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use almanac::application::coordinator::{BudgetPolicy, GenerationCoordinator, LockPolicy};
use almanac::application::gate::{CallerId, RatePolicy, RequestGate};
use almanac::application::geometry::GeometryStore;
use almanac::application::library::Library;
use almanac::application::narrative::{NarrativeCache, NarrativeRequest, SectionsRequest};
use almanac::application::ports::{
    EngineError, GeometryEngine, Generation, GenerationError, NarrativeGenerator, PromptPayload,
};
use almanac::application::prompt::{PersonalizationContext, PromptBuilder};
use almanac::application::repos::{BooksRepo, CoordinationStore};
use almanac::domain::{
    EngineConfig, GeometryPayload, Language, LibraryKind, NarrativeRules, NormalizedInput,
    RawInput, SectionRequest,
};
use almanac::infra::memory::{InMemoryBooks, InMemoryCoordination};

pub const SUMMARY: &str = "A patient chart with a long horizon. Saturn anchors the early years. \
     Venus softens the second half with generous friendships.";

pub fn narrative_text() -> String {
    json!({
        "headline": "Steady Capricorn sun",
        "summary": SUMMARY,
        "highlights": ["Discipline", "Ambition", "Warmth"],
    })
    .to_string()
}

pub fn section_text(topic: &str) -> String {
    let body = format!(
        "The {topic} section reads the tenth house through a long, deliberate lens. \
         Progress arrives late but stays, and partnerships matter more than titles."
    );
    json!({ "body": body }).to_string()
}

pub fn natal_raw() -> RawInput {
    RawInput {
        library: LibraryKind::Natal,
        date: Some("1990-01-01".to_string()),
        time: Some("08:30".to_string()),
        latitude: Some(40.7128),
        longitude: Some(-74.006),
        timezone: Some("America/New_York".to_string()),
        name: None,
    }
}

pub fn numerology_raw(name: &str) -> RawInput {
    RawInput {
        library: LibraryKind::Numerology,
        name: Some(name.to_string()),
        date: Some("1815-12-10".to_string()),
        ..RawInput::default()
    }
}

pub fn language(tag: &str) -> Language {
    Language::parse(tag).expect("valid language tag")
}

pub fn narrative_request(caller: &str, tag: &str, prompt_version: u32) -> NarrativeRequest {
    NarrativeRequest {
        caller: CallerId::new(caller),
        language: language(tag),
        prompt_version,
        context: PersonalizationContext::default(),
    }
}

pub fn sections_request(caller: &str, sections: &[(&str, u32)]) -> SectionsRequest {
    SectionsRequest {
        caller: CallerId::new(caller),
        language: language("en"),
        sections: sections
            .iter()
            .map(|(name, version)| SectionRequest {
                name: (*name).to_string(),
                version: *version,
            })
            .collect(),
        context: PersonalizationContext::default(),
    }
}

/// Deterministic engine that echoes the key-relevant parts of its input.
#[derive(Default)]
pub struct FakeEngine {
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl FakeEngine {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeometryEngine for FakeEngine {
    async fn compute(
        &self,
        input: &NormalizedInput,
        engine: &EngineConfig,
    ) -> Result<GeometryPayload, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(GeometryPayload(json!({
            "library": input.library().as_str(),
            "fields": input.key_fields(),
            "schema_version": engine.schema_version,
        })))
    }
}

/// Replays queued responses, then answers every prompt with valid output.
#[derive(Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Generation, GenerationError>>>,
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub tokens_per_call: u64,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            tokens_per_call: 40,
            ..Self::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn with_tokens(tokens_per_call: u64) -> Self {
        Self {
            tokens_per_call,
            ..Self::default()
        }
    }

    pub async fn push(&self, response: Result<Generation, GenerationError>) {
        self.script.lock().await.push_back(response);
    }

    pub async fn push_text(&self, text: &str) {
        let generation = self.generation(text.to_string());
        self.push(Ok(generation)).await;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn generation(&self, text: String) -> Generation {
        Generation {
            text,
            input_tokens: self.tokens_per_call / 2,
            output_tokens: self.tokens_per_call - self.tokens_per_call / 2,
        }
    }
}

#[async_trait]
impl NarrativeGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &PromptPayload) -> Result<Generation, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(response) = self.script.lock().await.pop_front() {
            return response;
        }
        let text = if prompt.system.contains("\"body\"") {
            section_text("career")
        } else {
            narrative_text()
        };
        Ok(self.generation(text))
    }
}

pub struct HarnessOptions {
    pub rate: RatePolicy,
    pub daily_token_limit: u64,
    pub locks: LockPolicy,
    pub generation_timeout: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            rate: RatePolicy::default(),
            daily_token_limit: 1_000_000,
            locks: LockPolicy::default(),
            generation_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Harness {
    pub library: Library,
    pub books: InMemoryBooks,
    pub coordination: Arc<InMemoryCoordination>,
    pub engine: Arc<FakeEngine>,
    pub config: EngineConfig,
}

impl Harness {
    pub fn new(generator: Arc<dyn NarrativeGenerator>) -> Self {
        Self::with_options(generator, HarnessOptions::default())
    }

    pub fn with_options(generator: Arc<dyn NarrativeGenerator>, options: HarnessOptions) -> Self {
        let books = InMemoryBooks::new();
        let coordination = Arc::new(InMemoryCoordination::new());
        let engine = Arc::new(FakeEngine::default());
        let library = build_library(
            Arc::new(books.clone()),
            coordination.clone(),
            engine.clone(),
            generator,
            options,
        );
        Self {
            library,
            books,
            coordination,
            engine,
            config: EngineConfig::default(),
        }
    }
}

pub fn build_library(
    books: Arc<dyn BooksRepo>,
    coordination: Arc<dyn CoordinationStore>,
    engine: Arc<dyn GeometryEngine>,
    generator: Arc<dyn NarrativeGenerator>,
    options: HarnessOptions,
) -> Library {
    let gate = RequestGate::new(coordination.clone(), options.rate);
    let coordinator = GenerationCoordinator::new(
        coordination,
        generator,
        BudgetPolicy {
            daily_token_limit: options.daily_token_limit,
        },
        options.locks,
        options.generation_timeout,
    );
    let prompts = PromptBuilder::new(NarrativeRules::default(), 512);
    Library::new(
        GeometryStore::new(books.clone(), engine),
        NarrativeCache::new(books, coordinator, gate, prompts),
    )
}
