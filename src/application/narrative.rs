//! Narrative reuse and regeneration on top of stored books.

use std::{collections::BTreeMap, sync::Arc};

use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{
    application::{
        coordinator::{
            Attempt, GenerationCoordinator, GenerationFailure, GenerationKind, Generated,
        },
        error::LibraryError,
        gate::{CallerId, OperationKind, RequestGate},
        prompt::{PersonalizationContext, PromptBuilder},
        repos::BooksRepo,
    },
    domain::{
        Book, CachedNarrative, Language, NarrativeDocument, NarrativeSection, SectionRequest,
        narrative::section_body_from_generated,
    },
};

/// The cache-validity predicate: narrative present, same prompt version,
/// same language.
pub fn is_valid(book: &Book, requested_language: &Language, current_prompt_version: u32) -> bool {
    book.has_valid_narrative(requested_language, current_prompt_version)
}

#[derive(Debug, Clone)]
pub struct NarrativeRequest {
    pub caller: CallerId,
    pub language: Language,
    pub prompt_version: u32,
    pub context: PersonalizationContext,
}

#[derive(Debug, Clone)]
pub struct SectionsRequest {
    pub caller: CallerId,
    pub language: Language,
    pub sections: Vec<SectionRequest>,
    pub context: PersonalizationContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeStatus {
    Cached,
    Generated,
    GenerationFailed,
    InvalidOutput,
    Timeout,
}

impl NarrativeStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, NarrativeStatus::Cached | NarrativeStatus::Generated)
    }
}

impl From<&GenerationFailure> for NarrativeStatus {
    fn from(failure: &GenerationFailure) -> Self {
        match failure {
            GenerationFailure::Upstream(_) => NarrativeStatus::GenerationFailed,
            GenerationFailure::Timeout(_) => NarrativeStatus::Timeout,
            GenerationFailure::InvalidOutput(_) => NarrativeStatus::InvalidOutput,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NarrativeOutcome {
    pub book: Book,
    pub status: NarrativeStatus,
}

impl NarrativeOutcome {
    pub fn narrative_available(&self) -> bool {
        self.status.is_available()
    }
}

#[derive(Debug, Clone)]
pub struct SectionsOutcome {
    pub book: Book,
    pub unavailable_sections: Vec<String>,
}

#[derive(Clone)]
pub struct NarrativeCache {
    books: Arc<dyn BooksRepo>,
    coordinator: GenerationCoordinator,
    gate: RequestGate,
    prompts: PromptBuilder,
}

impl NarrativeCache {
    pub fn new(
        books: Arc<dyn BooksRepo>,
        coordinator: GenerationCoordinator,
        gate: RequestGate,
        prompts: PromptBuilder,
    ) -> Self {
        Self {
            books,
            coordinator,
            gate,
            prompts,
        }
    }

    /// Return `book` with a narrative valid for the request, generating one
    /// on a miss. Generation failures degrade to a book without narrative;
    /// only capacity problems are errors.
    pub async fn ensure_narrative(
        &self,
        mut book: Book,
        request: &NarrativeRequest,
    ) -> Result<NarrativeOutcome, LibraryError> {
        if is_valid(&book, &request.language, request.prompt_version) {
            counter!("almanac_narrative_hit_total").increment(1);
            return Ok(NarrativeOutcome {
                book,
                status: NarrativeStatus::Cached,
            });
        }
        counter!("almanac_narrative_miss_total").increment(1);

        self.gate
            .authorize(&request.caller, OperationKind::Narrative)
            .await?;

        let prompt = self.prompts.narrative(
            &book,
            &request.language,
            request.prompt_version,
            &request.context,
        );
        let rules = self.prompts.rules();
        let attempt = self
            .coordinator
            .generate(&book, GenerationKind::Narrative, prompt, |text| {
                NarrativeDocument::from_generated(text, rules)
            })
            .await?;

        let Generated { value, lease, .. } = match attempt {
            Attempt::Generated(generated) => generated,
            Attempt::Failed(failure) => {
                // The stored narrative stays in place for requests it still
                // matches; this caller gets none.
                book.narrative = None;
                return Ok(NarrativeOutcome {
                    book,
                    status: NarrativeStatus::from(&failure),
                });
            }
        };

        let narrative = CachedNarrative {
            document: value,
            prompt_version: request.prompt_version,
            language: request.language.clone(),
            generated_at: OffsetDateTime::now_utc(),
        };
        if let Some(previous) = book.narrative.as_ref()
            && previous.language != narrative.language
        {
            debug!(
                book_key = %book.key,
                replaced = %previous.language,
                language = %narrative.language,
                "narrative language replaced"
            );
        }

        // Persist before releasing so waiting callers find the new narrative.
        if let Err(err) = self
            .books
            .save_narrative(book.library, &book.key, &narrative)
            .await
        {
            warn!(
                library = %book.library,
                book_key = %book.key,
                error = %err,
                "failed to persist generated narrative; serving it uncached"
            );
        }
        lease.release().await;

        book.narrative = Some(narrative);
        Ok(NarrativeOutcome {
            book,
            status: NarrativeStatus::Generated,
        })
    }

    /// Regenerate only the requested sections that are stale and merge them
    /// into the book; current sections are left untouched.
    pub async fn ensure_sections(
        &self,
        mut book: Book,
        request: &SectionsRequest,
    ) -> Result<SectionsOutcome, LibraryError> {
        for section in &request.sections {
            section.validate()?;
        }

        let stale: Vec<SectionRequest> = book
            .stale_sections(&request.sections, &request.language)
            .into_iter()
            .cloned()
            .collect();
        if stale.is_empty() {
            counter!("almanac_narrative_hit_total").increment(1);
            return Ok(SectionsOutcome {
                book,
                unavailable_sections: Vec::new(),
            });
        }
        counter!("almanac_narrative_miss_total").increment(1);

        self.gate
            .authorize(&request.caller, OperationKind::Section)
            .await?;

        let mut unavailable = Vec::new();
        for section in stale {
            let prompt = self
                .prompts
                .section(&book, &section, &request.language, &request.context);
            let rules = self.prompts.rules();
            let kind = GenerationKind::Section(section.name.clone());

            let attempt = match self
                .coordinator
                .generate(&book, kind, prompt, |text| {
                    section_body_from_generated(text, rules)
                })
                .await
            {
                Ok(attempt) => attempt,
                Err(LibraryError::LockUnavailable { .. }) => {
                    unavailable.push(section.name);
                    continue;
                }
                Err(err) => return Err(err),
            };

            let Generated { value, lease, .. } = match attempt {
                Attempt::Generated(generated) => generated,
                Attempt::Failed(_) => {
                    unavailable.push(section.name);
                    continue;
                }
            };

            let fresh = NarrativeSection {
                version: section.version,
                language: request.language.clone(),
                body: value,
                generated_at: OffsetDateTime::now_utc(),
            };
            let merged = BTreeMap::from([(section.name.clone(), fresh.clone())]);
            if let Err(err) = self
                .books
                .merge_sections(book.library, &book.key, &merged)
                .await
            {
                warn!(
                    library = %book.library,
                    book_key = %book.key,
                    section = %section.name,
                    error = %err,
                    "failed to persist generated section; serving it uncached"
                );
            }
            lease.release().await;

            book.sections.insert(section.name, fresh);
        }

        for name in &unavailable {
            book.sections.remove(name);
        }
        Ok(SectionsOutcome {
            book,
            unavailable_sections: unavailable,
        })
    }
}
