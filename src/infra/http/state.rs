use std::sync::Arc;

use crate::application::library::Library;
use crate::domain::{EngineConfig, Language};
use crate::infra::db::PostgresRepositories;

#[derive(Clone)]
pub struct ApiState {
    pub library: Arc<Library>,
    /// Engine configuration every book is computed with.
    pub engine: EngineConfig,
    pub prompt_version: u32,
    pub default_language: Language,
    /// Present when books are stored in Postgres; used by the health check.
    pub db: Option<Arc<PostgresRepositories>>,
}
