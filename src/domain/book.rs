//! Books: the unit of deduplication, keyed by a hash of input and engine.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use super::{
    engine::EngineConfig,
    error::DomainError,
    input::{LibraryKind, NormalizedInput},
    narrative::{Language, NarrativeDocument, NarrativeSection, SectionRequest},
};

/// Joins key material. Changing it requires a schema version bump.
pub const KEY_DELIMITER: &str = "|";

const KEY_HEX_LEN: usize = 64;

/// Lowercase hex SHA-256 over library, input fields and engine fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookKey(String);

impl BookKey {
    pub fn derive(input: &NormalizedInput, engine: &EngineConfig) -> Self {
        let mut material = vec![input.library().as_str().to_string()];
        material.extend(input.key_fields());
        material.extend(engine.key_fields());

        let mut hasher = Sha256::new();
        hasher.update(material.join(KEY_DELIMITER).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Rehydrate a key read back from storage.
    pub fn from_stored(value: String) -> Result<Self, DomainError> {
        let well_formed = value.len() == KEY_HEX_LEN
            && value
                .bytes()
                .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
        if !well_formed {
            return Err(DomainError::format("book_key", value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque output of the math engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeometryPayload(pub Value);

/// A narrative together with the axes that decide whether it may be reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedNarrative {
    pub document: NarrativeDocument,
    pub prompt_version: u32,
    pub language: Language,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

impl CachedNarrative {
    pub fn is_current(&self, language: &Language, prompt_version: u32) -> bool {
        self.prompt_version == prompt_version && &self.language == language
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub key: BookKey,
    pub library: LibraryKind,
    pub input: NormalizedInput,
    pub geometry: GeometryPayload,
    pub engine: EngineConfig,
    pub narrative: Option<CachedNarrative>,
    pub sections: BTreeMap<String, NarrativeSection>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed_at: OffsetDateTime,
    pub access_count: i64,
}

impl Book {
    /// A stored narrative is reusable only when every validity axis matches.
    /// Schema changes never reach here: they produce a different key.
    pub fn has_valid_narrative(&self, language: &Language, prompt_version: u32) -> bool {
        self.narrative
            .as_ref()
            .is_some_and(|narrative| narrative.is_current(language, prompt_version))
    }

    /// Requested sections whose stored copy is missing, outdated or in
    /// another language.
    pub fn stale_sections<'a>(
        &self,
        requested: &'a [SectionRequest],
        language: &Language,
    ) -> Vec<&'a SectionRequest> {
        requested
            .iter()
            .filter(|request| {
                !self
                    .sections
                    .get(&request.name)
                    .is_some_and(|section| section.is_current(request.version, language))
            })
            .collect()
    }
}
