//! Public entry points combining geometry storage and narrative caching.

use tracing::{info, instrument};

use crate::{
    application::{
        error::LibraryError,
        geometry::GeometryStore,
        narrative::{
            NarrativeCache, NarrativeOutcome, NarrativeRequest, SectionsOutcome, SectionsRequest,
        },
    },
    domain::{Book, EngineConfig, RawInput},
};

#[derive(Clone)]
pub struct Library {
    geometry: GeometryStore,
    narratives: NarrativeCache,
}

impl Library {
    pub fn new(geometry: GeometryStore, narratives: NarrativeCache) -> Self {
        Self {
            geometry,
            narratives,
        }
    }

    /// Geometry only. Never reaches the gate or the generator.
    #[instrument(skip_all, fields(library = %raw.library))]
    pub async fn get_or_compute_book(
        &self,
        raw: &RawInput,
        config: &EngineConfig,
    ) -> Result<Book, LibraryError> {
        self.geometry.get_or_compute(raw, config).await
    }

    /// Geometry plus a narrative valid for the requested language and prompt
    /// version. Generation failures are reported through the outcome status,
    /// not as errors.
    #[instrument(skip_all, fields(library = %raw.library, caller = %request.caller))]
    pub async fn get_book_with_narrative(
        &self,
        raw: &RawInput,
        config: &EngineConfig,
        request: &NarrativeRequest,
    ) -> Result<NarrativeOutcome, LibraryError> {
        let book = self.geometry.get_or_compute(raw, config).await?;
        let outcome = self.narratives.ensure_narrative(book, request).await?;
        if !outcome.narrative_available() {
            info!(
                book_key = %outcome.book.key,
                result = ?outcome.status,
                "serving geometry without narrative"
            );
        }
        Ok(outcome)
    }

    #[instrument(skip_all, fields(library = %raw.library, caller = %request.caller))]
    pub async fn get_book_with_sections(
        &self,
        raw: &RawInput,
        config: &EngineConfig,
        request: &SectionsRequest,
    ) -> Result<SectionsOutcome, LibraryError> {
        let book = self.geometry.get_or_compute(raw, config).await?;
        self.narratives.ensure_sections(book, request).await
    }
}
