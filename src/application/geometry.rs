//! Content-addressed geometry storage.
//!
//! Books are computed at most once per key and never locked: concurrent
//! first requests may both compute, but only one row survives and every
//! caller ends up with that row.

use std::sync::Arc;

use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    application::{
        error::LibraryError,
        ports::GeometryEngine,
        repos::{BooksRepo, InsertOutcome, NewBook, RepoError},
    },
    domain::{Book, BookKey, EngineConfig, RawInput, normalize},
};

#[derive(Clone)]
pub struct GeometryStore {
    books: Arc<dyn BooksRepo>,
    engine: Arc<dyn GeometryEngine>,
}

impl GeometryStore {
    pub fn new(books: Arc<dyn BooksRepo>, engine: Arc<dyn GeometryEngine>) -> Self {
        Self { books, engine }
    }

    /// Return the stored book for this input, computing and storing it on
    /// first sight. Never calls the narrative generator.
    pub async fn get_or_compute(
        &self,
        raw: &RawInput,
        config: &EngineConfig,
    ) -> Result<Book, LibraryError> {
        let input = normalize(raw)?;
        let key = BookKey::derive(&input, config);
        let library = input.library();

        if let Some(book) = self.books.find_book(library, &key).await? {
            counter!("almanac_book_hit_total", "library" => library.as_str()).increment(1);
            debug!(library = %library, book_key = %key, "book hit");
            return Ok(self.track_access(book));
        }
        counter!("almanac_book_miss_total", "library" => library.as_str()).increment(1);

        let geometry = self
            .engine
            .compute(&input, config)
            .await
            .map_err(|err| {
                warn!(
                    library = %library,
                    book_key = %key,
                    error = %err,
                    "geometry computation failed"
                );
                LibraryError::ComputationFailed(err)
            })?;

        let new_book = NewBook {
            key: key.clone(),
            input,
            geometry,
            engine: config.clone(),
            created_at: OffsetDateTime::now_utc(),
        };

        match self.books.insert_if_absent(new_book).await? {
            InsertOutcome::Inserted(book) => {
                info!(library = %library, book_key = %key, "book stored");
                Ok(book)
            }
            InsertOutcome::Conflict => {
                debug!(library = %library, book_key = %key, "concurrent insert won; re-reading");
                let Some(book) = self.books.find_book(library, &key).await? else {
                    return Err(RepoError::integrity(format!(
                        "book {key} conflicted on insert but cannot be read back"
                    ))
                    .into());
                };
                Ok(self.track_access(book))
            }
        }
    }

    /// Bump access stats on the returned copy and persist them without
    /// holding up the caller.
    fn track_access(&self, mut book: Book) -> Book {
        let now = OffsetDateTime::now_utc();
        book.access_count = book.access_count.saturating_add(1);
        book.last_accessed_at = now;

        let books = self.books.clone();
        let library = book.library;
        let key = book.key.clone();
        tokio::spawn(async move {
            if let Err(err) = books.record_access(library, &key, now).await {
                warn!(
                    library = %library,
                    book_key = %key,
                    error = %err,
                    "failed to record book access"
                );
            }
        });

        book
    }
}
