use serde::{Deserialize, Serialize};

use crate::application::narrative::NarrativeStatus;
use crate::application::prompt::PersonalizationContext;
use crate::domain::{Book, RawInput, SectionRequest};

#[derive(Debug, Deserialize, Serialize)]
pub struct BookRequest {
    pub input: RawInput,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NarrativeRequestBody {
    pub input: RawInput,
    pub language: Option<String>,
    #[serde(default)]
    pub context: PersonalizationContext,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SectionsRequestBody {
    pub input: RawInput,
    pub language: Option<String>,
    pub sections: Vec<SectionRequest>,
    #[serde(default)]
    pub context: PersonalizationContext,
}

#[derive(Debug, Serialize)]
pub struct BookResponse {
    pub book: Book,
}

#[derive(Debug, Serialize)]
pub struct NarrativeResponse {
    pub book: Book,
    pub narrative_available: bool,
    pub narrative_status: NarrativeStatus,
}

#[derive(Debug, Serialize)]
pub struct SectionsResponse {
    pub book: Book,
    pub unavailable_sections: Vec<String>,
}
