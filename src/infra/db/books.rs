use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use crate::application::repos::{BooksRepo, InsertOutcome, NewBook, RepoError};
use crate::domain::{
    Book, BookKey, CachedNarrative, EngineConfig, GeometryPayload, LibraryKind, NarrativeSection,
    NormalizedInput,
};

use super::{
    PostgresRepositories, map_sqlx_error,
    util::{decode_json, encode_json},
};

const BOOK_COLUMNS: &str = "library, book_key, input_json, geometry_json, engine_json, \
    narrative_json, sections_json, created_at, last_accessed_at, access_count";

#[derive(sqlx::FromRow)]
struct BookRow {
    library: String,
    book_key: String,
    input_json: Value,
    geometry_json: Value,
    engine_json: Value,
    narrative_json: Option<Value>,
    sections_json: Value,
    created_at: OffsetDateTime,
    last_accessed_at: OffsetDateTime,
    access_count: i64,
}

impl TryFrom<BookRow> for Book {
    type Error = RepoError;

    fn try_from(row: BookRow) -> Result<Self, Self::Error> {
        let library: LibraryKind = row
            .library
            .parse()
            .map_err(|_| RepoError::integrity(format!("unknown library `{}`", row.library)))?;
        let key = BookKey::from_stored(row.book_key)
            .map_err(|err| RepoError::integrity(err.to_string()))?;
        let input: NormalizedInput = decode_json("input_json", row.input_json)?;
        if input.library() != library {
            return Err(RepoError::integrity(format!(
                "book {key} stored under {library} holds {} input",
                input.library()
            )));
        }
        let engine: EngineConfig = decode_json("engine_json", row.engine_json)?;
        let narrative: Option<CachedNarrative> = row
            .narrative_json
            .map(|value| decode_json("narrative_json", value))
            .transpose()?;
        let sections: BTreeMap<String, NarrativeSection> =
            decode_json("sections_json", row.sections_json)?;

        Ok(Book {
            key,
            library,
            input,
            geometry: GeometryPayload(row.geometry_json),
            engine,
            narrative,
            sections,
            created_at: row.created_at,
            last_accessed_at: row.last_accessed_at,
            access_count: row.access_count,
        })
    }
}

#[async_trait]
impl BooksRepo for PostgresRepositories {
    async fn find_book(
        &self,
        library: LibraryKind,
        key: &BookKey,
    ) -> Result<Option<Book>, RepoError> {
        let row: Option<BookRow> = sqlx::query_as::<_, BookRow>(&format!(
            "SELECT {BOOK_COLUMNS} FROM library_books WHERE library = $1 AND book_key = $2"
        ))
        .bind(library.as_str())
        .bind(key.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(Book::try_from).transpose()
    }

    async fn insert_if_absent(&self, book: NewBook) -> Result<InsertOutcome, RepoError> {
        let input = encode_json("input_json", &book.input)?;
        let engine = encode_json("engine_json", &book.engine)?;
        let schema_version = i32::try_from(book.engine.schema_version)
            .map_err(|_| RepoError::integrity("schema version exceeds supported range"))?;

        let inserted = sqlx::query_as::<_, BookRow>(&format!(
            r#"
            INSERT INTO library_books (
                library, book_key, input_json, geometry_json, engine_json, schema_version,
                created_at, last_accessed_at, access_count
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $7, 1)
            ON CONFLICT (library, book_key) DO NOTHING
            RETURNING {BOOK_COLUMNS}
            "#
        ))
        .bind(book.library().as_str())
        .bind(book.key.as_str())
        .bind(input)
        .bind(&book.geometry.0)
        .bind(engine)
        .bind(schema_version)
        .bind(book.created_at)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error);

        match inserted {
            Ok(Some(row)) => Ok(InsertOutcome::Inserted(Book::try_from(row)?)),
            Ok(None) | Err(RepoError::Duplicate { .. }) => Ok(InsertOutcome::Conflict),
            Err(err) => Err(err),
        }
    }

    async fn record_access(
        &self,
        library: LibraryKind,
        key: &BookKey,
        at: OffsetDateTime,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            UPDATE library_books
            SET access_count = access_count + 1,
                last_accessed_at = GREATEST(last_accessed_at, $3)
            WHERE library = $1 AND book_key = $2
            "#,
        )
        .bind(library.as_str())
        .bind(key.as_str())
        .bind(at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn save_narrative(
        &self,
        library: LibraryKind,
        key: &BookKey,
        narrative: &CachedNarrative,
    ) -> Result<(), RepoError> {
        let document = encode_json("narrative_json", narrative)?;
        let prompt_version = i32::try_from(narrative.prompt_version)
            .map_err(|_| RepoError::integrity("prompt version exceeds supported range"))?;

        let result = sqlx::query(
            r#"
            UPDATE library_books
            SET narrative_json = $3,
                narrative_prompt_version = $4,
                narrative_language = $5,
                narrative_generated_at = $6
            WHERE library = $1 AND book_key = $2
            "#,
        )
        .bind(library.as_str())
        .bind(key.as_str())
        .bind(document)
        .bind(prompt_version)
        .bind(narrative.language.as_str())
        .bind(narrative.generated_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn merge_sections(
        &self,
        library: LibraryKind,
        key: &BookKey,
        sections: &BTreeMap<String, NarrativeSection>,
    ) -> Result<(), RepoError> {
        let patch = encode_json("sections_json", sections)?;

        let result = sqlx::query(
            r#"
            UPDATE library_books
            SET sections_json = sections_json || $3
            WHERE library = $1 AND book_key = $2
            "#,
        )
        .bind(library.as_str())
        .bind(key.as_str())
        .bind(patch)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }
}
