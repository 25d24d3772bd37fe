//! Pure domain model: normalization, key derivation, validity rules.

pub mod book;
pub mod engine;
pub mod error;
pub mod input;
pub mod narrative;

pub use book::{Book, BookKey, CachedNarrative, GeometryPayload};
pub use engine::EngineConfig;
pub use input::{LibraryKind, NormalizedInput, RawInput, normalize};
pub use narrative::{Language, NarrativeDocument, NarrativeRules, NarrativeSection, SectionRequest};
