//! Repository and shared-store traits describing persistence adapters.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::{
    Book, BookKey, CachedNarrative, EngineConfig, GeometryPayload, LibraryKind, NarrativeSection,
    NormalizedInput,
};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }
}

/// Everything needed to create a book row; narrative fields start empty.
#[derive(Debug, Clone)]
pub struct NewBook {
    pub key: BookKey,
    pub input: NormalizedInput,
    pub geometry: GeometryPayload,
    pub engine: EngineConfig,
    pub created_at: OffsetDateTime,
}

impl NewBook {
    pub fn library(&self) -> LibraryKind {
        self.input.library()
    }

    pub fn into_book(self) -> Book {
        Book {
            library: self.input.library(),
            key: self.key,
            input: self.input,
            geometry: self.geometry,
            engine: self.engine,
            narrative: None,
            sections: BTreeMap::new(),
            created_at: self.created_at,
            last_accessed_at: self.created_at,
            access_count: 1,
        }
    }
}

/// Result of an insert-if-absent.
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(Book),
    /// Another writer already stored this key; re-read it.
    Conflict,
}

#[async_trait]
pub trait BooksRepo: Send + Sync {
    async fn find_book(
        &self,
        library: LibraryKind,
        key: &BookKey,
    ) -> Result<Option<Book>, RepoError>;

    /// Store a new book unless the key exists. A uniqueness conflict is
    /// reported as [`InsertOutcome::Conflict`], never as an error.
    async fn insert_if_absent(&self, book: NewBook) -> Result<InsertOutcome, RepoError>;

    async fn record_access(
        &self,
        library: LibraryKind,
        key: &BookKey,
        at: OffsetDateTime,
    ) -> Result<(), RepoError>;

    /// Overwrite the narrative fields as one unit.
    async fn save_narrative(
        &self,
        library: LibraryKind,
        key: &BookKey,
        narrative: &CachedNarrative,
    ) -> Result<(), RepoError>;

    /// Merge sections by key, last write wins per section.
    async fn merge_sections(
        &self,
        library: LibraryKind,
        key: &BookKey,
        sections: &BTreeMap<String, NarrativeSection>,
    ) -> Result<(), RepoError>;
}

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

impl CoordinationError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Shared TTL'd counters and tokens visible to every instance.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Claim `key` for `token` unless a live entry exists.
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError>;

    /// Delete `key` only while it is still held by `token`.
    async fn release(&self, key: &str, token: &str) -> Result<bool, CoordinationError>;

    /// Add `by` to a fixed-window counter, starting a fresh window with `ttl`
    /// when none is live. Returns the new total.
    async fn increment(&self, key: &str, by: i64, ttl: Duration)
    -> Result<i64, CoordinationError>;

    async fn get(&self, key: &str) -> Result<Option<i64>, CoordinationError>;

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, CoordinationError>;
}
