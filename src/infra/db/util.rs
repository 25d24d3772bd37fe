use crate::application::repos::{CoordinationError, RepoError};

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::Database(db) if db.message().contains("duplicate key") => {
            RepoError::Duplicate {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            }
        }
        sqlx::Error::Database(db) if db.message().contains("violates") => RepoError::Integrity {
            message: db.message().to_string(),
        },
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            RepoError::Timeout
        }
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        other => RepoError::from_persistence(other),
    }
}

pub fn map_coordination_error(err: sqlx::Error) -> CoordinationError {
    CoordinationError::unavailable(err)
}

/// Decode a JSONB column into a typed value, reporting which column broke.
pub fn decode_json<T: serde::de::DeserializeOwned>(
    column: &'static str,
    value: serde_json::Value,
) -> Result<T, RepoError> {
    serde_json::from_value(value)
        .map_err(|err| RepoError::integrity(format!("column `{column}` does not decode: {err}")))
}

pub fn encode_json<T: serde::Serialize>(
    column: &'static str,
    value: &T,
) -> Result<serde_json::Value, RepoError> {
    serde_json::to_value(value)
        .map_err(|err| RepoError::integrity(format!("column `{column}` does not encode: {err}")))
}
