//! Generated narrative content and the strict schema it must satisfy.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::error::DomainError;

const MAX_LANGUAGE_LEN: usize = 35;

/// Lower-cased BCP 47 style language tag (`en`, `pt-br`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Language(String);

impl Language {
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let tag = value.trim().to_ascii_lowercase();
        let well_formed = !tag.is_empty()
            && tag.len() <= MAX_LANGUAGE_LEN
            && tag.split('-').all(|part| {
                !part.is_empty() && part.bytes().all(|byte| byte.is_ascii_alphanumeric())
            });
        if !well_formed {
            return Err(DomainError::format("language", value));
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Language {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Language::parse(&value)
    }
}

impl From<Language> for String {
    fn from(value: Language) -> Self {
        value.0
    }
}

/// Thresholds applied to every generated response before it may be cached.
#[derive(Debug, Clone)]
pub struct NarrativeRules {
    pub min_headline_chars: usize,
    pub min_summary_chars: usize,
    pub highlight_count: usize,
    pub min_section_chars: usize,
}

impl Default for NarrativeRules {
    fn default() -> Self {
        Self {
            min_headline_chars: 8,
            min_summary_chars: 80,
            highlight_count: 3,
            min_section_chars: 120,
        }
    }
}

/// The validated body of a book's main narrative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeDocument {
    pub headline: String,
    pub summary: String,
    pub highlights: Vec<String>,
}

impl NarrativeDocument {
    /// Parse and validate raw generator output.
    ///
    /// Missing or short text fields reject the whole response. The highlight
    /// list is padded or truncated to exactly `rules.highlight_count`.
    pub fn from_generated(text: &str, rules: &NarrativeRules) -> Result<Self, DomainError> {
        let object = json_object(text)?;

        let headline = required_text(&object, "headline", rules.min_headline_chars)?;
        let summary = required_text(&object, "summary", rules.min_summary_chars)?;

        let mut highlights: Vec<String> = match object.get("highlights") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
            Some(_) => return Err(DomainError::output("`highlights` must be a list")),
            None => return Err(DomainError::output("missing `highlights`")),
        };

        highlights.truncate(rules.highlight_count);
        if highlights.len() < rules.highlight_count {
            pad_highlights(&mut highlights, &summary, &headline, rules.highlight_count);
        }

        Ok(Self {
            headline,
            summary,
            highlights,
        })
    }
}

/// One independently versioned deep-dive section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeSection {
    pub version: u32,
    pub language: Language,
    pub body: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

impl NarrativeSection {
    pub fn is_current(&self, version: u32, language: &Language) -> bool {
        self.version == version && &self.language == language
    }
}

/// A caller's request for one section at a given version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRequest {
    pub name: String,
    pub version: u32,
}

impl SectionRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        let name = self.name.as_str();
        let well_formed = !name.is_empty()
            && name.len() <= 64
            && name
                .bytes()
                .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'_');
        if well_formed {
            Ok(())
        } else {
            Err(DomainError::format("section", name))
        }
    }
}

/// Validate a section response (`{"body": "..."}`) and return its body.
pub fn section_body_from_generated(
    text: &str,
    rules: &NarrativeRules,
) -> Result<String, DomainError> {
    let object = json_object(text)?;
    required_text(&object, "body", rules.min_section_chars)
}

fn json_object(text: &str) -> Result<serde_json::Map<String, Value>, DomainError> {
    // Generators sometimes wrap JSON in prose or code fences.
    let start = text.find('{');
    let end = text.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(DomainError::output("response is not a JSON object"));
    };
    if end < start {
        return Err(DomainError::output("response is not a JSON object"));
    }

    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(DomainError::output("response is not a JSON object")),
        Err(err) => Err(DomainError::output(format!("invalid JSON: {err}"))),
    }
}

fn required_text(
    object: &serde_json::Map<String, Value>,
    key: &str,
    min_chars: usize,
) -> Result<String, DomainError> {
    let value = object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .ok_or_else(|| DomainError::output(format!("missing `{key}`")))?;

    let chars = value.chars().count();
    if chars < min_chars {
        return Err(DomainError::output(format!(
            "`{key}` has {chars} characters, expected at least {min_chars}"
        )));
    }
    Ok(value.to_string())
}

fn pad_highlights(highlights: &mut Vec<String>, summary: &str, headline: &str, count: usize) {
    let candidates = summary
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .chain(std::iter::once(headline));

    for candidate in candidates {
        if highlights.len() >= count {
            return;
        }
        if !highlights.iter().any(|existing| existing == candidate) {
            highlights.push(candidate.to_string());
        }
    }

    while highlights.len() < count {
        let filler = highlights
            .last()
            .cloned()
            .unwrap_or_else(|| headline.to_string());
        highlights.push(filler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> NarrativeRules {
        NarrativeRules {
            min_headline_chars: 5,
            min_summary_chars: 20,
            highlight_count: 3,
            min_section_chars: 10,
        }
    }

    #[test]
    fn accepts_fenced_json_and_keeps_exact_highlights() {
        let text = r#"```json
        {"headline": "Steady Capricorn sun",
         "summary": "A patient chart with a long horizon.",
         "highlights": ["Discipline", "Ambition", "Warmth"]}
        ```"#;

        let document = NarrativeDocument::from_generated(text, &rules()).expect("valid");
        assert_eq!(document.headline, "Steady Capricorn sun");
        assert_eq!(document.highlights, vec!["Discipline", "Ambition", "Warmth"]);
    }

    #[test]
    fn highlights_are_truncated_to_cardinality() {
        let text = r#"{"headline": "Steady sun", "summary": "A patient chart with a long horizon.",
            "highlights": ["a", "b", "c", "d", "e"]}"#;

        let document = NarrativeDocument::from_generated(text, &rules()).expect("valid");
        assert_eq!(document.highlights, vec!["a", "b", "c"]);
    }

    #[test]
    fn highlights_are_padded_from_summary_sentences() {
        let text = r#"{"headline": "Steady sun", "summary": "Patient by nature. Builds slowly!",
            "highlights": ["Discipline"]}"#;

        let document = NarrativeDocument::from_generated(text, &rules()).expect("valid");
        assert_eq!(
            document.highlights,
            vec!["Discipline", "Patient by nature.", "Builds slowly!"]
        );
    }

    #[test]
    fn missing_or_short_fields_are_rejected() {
        let missing = r#"{"headline": "Steady sun", "highlights": []}"#;
        assert!(matches!(
            NarrativeDocument::from_generated(missing, &rules()),
            Err(DomainError::InvalidOutput { .. })
        ));

        let summary = "A patient chart with a long horizon.";
        let short = format!(r#"{{"headline": "Hi", "summary": "{summary}", "highlights": []}}"#);
        assert!(NarrativeDocument::from_generated(&short, &rules()).is_err());

        let no_list = format!(r#"{{"headline": "Steady sun", "summary": "{summary}"}}"#);
        assert!(NarrativeDocument::from_generated(&no_list, &rules()).is_err());
    }

    #[test]
    fn non_json_output_is_rejected() {
        assert!(NarrativeDocument::from_generated("I cannot help with that.", &rules()).is_err());
        assert!(section_body_from_generated("[1, 2]", &rules()).is_err());
    }

    #[test]
    fn section_body_requires_minimum_length() {
        assert_eq!(
            section_body_from_generated(r#"{"body": "  Long enough body.  "}"#, &rules())
                .expect("valid"),
            "Long enough body."
        );
        assert!(section_body_from_generated(r#"{"body": "short"}"#, &rules()).is_err());
    }

    #[test]
    fn language_tags_are_normalized() {
        assert_eq!(Language::parse(" PT-BR ").expect("valid").as_str(), "pt-br");
        assert!(Language::parse("").is_err());
        assert!(Language::parse("en_US").is_err());
        assert!(Language::parse("en--us").is_err());
    }

    #[test]
    fn section_names_are_restricted() {
        let ok = SectionRequest {
            name: "career_path".to_string(),
            version: 2,
        };
        assert!(ok.validate().is_ok());

        let bad = SectionRequest {
            name: "Career Path".to_string(),
            version: 2,
        };
        assert!(bad.validate().is_err());
    }
}
