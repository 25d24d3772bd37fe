//! In-process adapters for single-instance deployments and tests.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::{
    application::repos::{
        BooksRepo, CoordinationError, CoordinationStore, InsertOutcome, NewBook, RepoError,
    },
    domain::{Book, BookKey, CachedNarrative, LibraryKind, NarrativeSection},
};

type BookId = (LibraryKind, BookKey);

#[derive(Debug, Clone, Default)]
pub struct InMemoryBooks {
    books: Arc<DashMap<BookId, Book>>,
}

impl InMemoryBooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    fn with_book<F>(&self, library: LibraryKind, key: &BookKey, update: F) -> Result<(), RepoError>
    where
        F: FnOnce(&mut Book),
    {
        let mut book = self
            .books
            .get_mut(&(library, key.clone()))
            .ok_or(RepoError::NotFound)?;
        update(&mut book);
        Ok(())
    }
}

#[async_trait]
impl BooksRepo for InMemoryBooks {
    async fn find_book(
        &self,
        library: LibraryKind,
        key: &BookKey,
    ) -> Result<Option<Book>, RepoError> {
        Ok(self
            .books
            .get(&(library, key.clone()))
            .map(|book| book.value().clone()))
    }

    async fn insert_if_absent(&self, book: NewBook) -> Result<InsertOutcome, RepoError> {
        match self.books.entry((book.library(), book.key.clone())) {
            Entry::Occupied(_) => Ok(InsertOutcome::Conflict),
            Entry::Vacant(slot) => {
                let stored = book.into_book();
                slot.insert(stored.clone());
                Ok(InsertOutcome::Inserted(stored))
            }
        }
    }

    async fn record_access(
        &self,
        library: LibraryKind,
        key: &BookKey,
        at: OffsetDateTime,
    ) -> Result<(), RepoError> {
        self.with_book(library, key, |book| {
            book.access_count = book.access_count.saturating_add(1);
            book.last_accessed_at = at;
        })
    }

    async fn save_narrative(
        &self,
        library: LibraryKind,
        key: &BookKey,
        narrative: &CachedNarrative,
    ) -> Result<(), RepoError> {
        self.with_book(library, key, |book| {
            book.narrative = Some(narrative.clone());
        })
    }

    async fn merge_sections(
        &self,
        library: LibraryKind,
        key: &BookKey,
        sections: &BTreeMap<String, NarrativeSection>,
    ) -> Result<(), RepoError> {
        self.with_book(library, key, |book| {
            for (name, section) in sections {
                book.sections.insert(name.clone(), section.clone());
            }
        })
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Token(String),
    Count(i64),
}

#[derive(Debug, Clone)]
struct Held {
    slot: Slot,
    expires_at: Instant,
}

impl Held {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// TTL'd counters and tokens held in one process.
///
/// Uses tokio's clock so paused-time tests can step through windows.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCoordination {
    entries: Arc<DashMap<String, Held>>,
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.live(now));
        before.saturating_sub(self.entries.len())
    }

    fn live_entry(&self, key: &str) -> Option<Held> {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(|entry| entry.live(now))
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordination {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let now = Instant::now();
        let fresh = Held {
            slot: Slot::Token(token.to_string()),
            expires_at: now + ttl,
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live(now) {
                    return Ok(false);
                }
                occupied.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, CoordinationError> {
        let now = Instant::now();
        let removed = self.entries.remove_if(key, |_, entry| {
            entry.live(now) && matches!(&entry.slot, Slot::Token(held) if held == token)
        });
        Ok(removed.is_some())
    }

    async fn increment(
        &self,
        key: &str,
        by: i64,
        ttl: Duration,
    ) -> Result<i64, CoordinationError> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Held {
            slot: Slot::Count(0),
            expires_at: now + ttl,
        });
        if !entry.live(now) {
            *entry = Held {
                slot: Slot::Count(0),
                expires_at: now + ttl,
            };
        }
        let total = match &entry.slot {
            Slot::Count(current) => current.saturating_add(by),
            Slot::Token(_) => {
                return Err(CoordinationError::unavailable(format!(
                    "key `{key}` holds a token, not a counter"
                )));
            }
        };
        entry.slot = Slot::Count(total);
        Ok(total)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, CoordinationError> {
        Ok(self.live_entry(key).and_then(|entry| match entry.slot {
            Slot::Count(value) => Some(value),
            Slot::Token(_) => None,
        }))
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, CoordinationError> {
        let now = Instant::now();
        Ok(self
            .live_entry(key)
            .map(|entry| entry.expires_at.saturating_duration_since(now)))
    }
}
