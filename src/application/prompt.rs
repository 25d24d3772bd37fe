//! Prompt construction from geometry and personalization context.

use serde::{Deserialize, Serialize};

use crate::{
    application::ports::PromptPayload,
    domain::{Book, Language, NarrativeRules, SectionRequest},
};

const MAX_CONTEXT_CHARS: usize = 200;

/// Hints that shape a freshly generated narrative.
///
/// Narratives are shared by every caller with the same book, so the context
/// only steers a miss; it is never a validity axis and must not carry
/// identifying data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalizationContext {
    pub focus: Option<String>,
    pub tone: Option<String>,
}

impl PersonalizationContext {
    fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(focus) = clipped(self.focus.as_deref()) {
            lines.push(format!("Emphasize: {focus}"));
        }
        if let Some(tone) = clipped(self.tone.as_deref()) {
            lines.push(format!("Tone: {tone}"));
        }
        lines
    }
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    rules: NarrativeRules,
    max_output_tokens: u32,
}

impl PromptBuilder {
    pub fn new(rules: NarrativeRules, max_output_tokens: u32) -> Self {
        Self {
            rules,
            max_output_tokens,
        }
    }

    pub fn rules(&self) -> &NarrativeRules {
        &self.rules
    }

    pub fn narrative(
        &self,
        book: &Book,
        language: &Language,
        prompt_version: u32,
        context: &PersonalizationContext,
    ) -> PromptPayload {
        let system = format!(
            "You write {library} readings (prompt v{prompt_version}). \
             Respond with a single JSON object and nothing else, using the keys \
             \"headline\" (at least {headline} characters), \
             \"summary\" (at least {summary} characters) \
             and \"highlights\" (a list of exactly {count} short strings). \
             Write in the language with tag \"{language}\".",
            library = book.library,
            headline = self.rules.min_headline_chars,
            summary = self.rules.min_summary_chars,
            count = self.rules.highlight_count,
        );

        PromptPayload {
            system,
            user: self.user_message(book, context, None),
            max_output_tokens: self.max_output_tokens,
        }
    }

    pub fn section(
        &self,
        book: &Book,
        section: &SectionRequest,
        language: &Language,
        context: &PersonalizationContext,
    ) -> PromptPayload {
        let system = format!(
            "You write the \"{name}\" section of a {library} reading (section v{version}). \
             Respond with a single JSON object with one key, \"body\", holding at least \
             {min} characters of prose. Write in the language with tag \"{language}\".",
            name = section.name,
            library = book.library,
            version = section.version,
            min = self.rules.min_section_chars,
        );

        PromptPayload {
            system,
            user: self.user_message(book, context, Some(&section.name)),
            max_output_tokens: self.max_output_tokens,
        }
    }

    fn user_message(
        &self,
        book: &Book,
        context: &PersonalizationContext,
        section: Option<&str>,
    ) -> String {
        let mut message = String::from("Chart geometry:\n");
        message.push_str(&book.geometry.0.to_string());
        if let Some(section) = section {
            message.push_str(&format!("\nSection topic: {section}"));
        }
        for line in context.lines() {
            message.push('\n');
            message.push_str(&line);
        }
        message
    }
}

fn clipped(value: Option<&str>) -> Option<String> {
    let value = value.map(str::trim).filter(|value| !value.is_empty())?;
    Some(value.chars().take(MAX_CONTEXT_CHARS).collect())
}
