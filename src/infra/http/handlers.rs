use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::application::error::LibraryError;
use crate::application::gate::CallerId;
use crate::application::narrative::{NarrativeRequest, SectionsRequest};
use crate::domain::Language;

use super::error::ApiError;
use super::models::{
    BookRequest, BookResponse, NarrativeRequestBody, NarrativeResponse, SectionsRequestBody,
    SectionsResponse,
};
use super::state::ApiState;

pub const CALLER_HEADER: &str = "x-caller-id";

const MAX_CALLER_LEN: usize = 128;

fn caller_from(headers: &HeaderMap) -> Result<CallerId, ApiError> {
    let caller = headers
        .get(CALLER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(ApiError::caller_required)?;
    if caller.len() > MAX_CALLER_LEN {
        return Err(ApiError::bad_request(
            "caller id is too long",
            Some(format!("at most {MAX_CALLER_LEN} bytes")),
        ));
    }
    Ok(CallerId::new(caller))
}

fn language_or_default(state: &ApiState, requested: Option<&str>) -> Result<Language, ApiError> {
    match requested {
        Some(tag) => Language::parse(tag).map_err(|err| ApiError::from(LibraryError::from(err))),
        None => Ok(state.default_language.clone()),
    }
}

pub async fn get_book(
    State(state): State<ApiState>,
    Json(body): Json<BookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let book = state
        .library
        .get_or_compute_book(&body.input, &state.engine)
        .await?;
    Ok(Json(BookResponse { book }))
}

pub async fn get_book_with_narrative(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<NarrativeRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_from(&headers)?;
    let request = NarrativeRequest {
        caller,
        language: language_or_default(&state, body.language.as_deref())?,
        prompt_version: state.prompt_version,
        context: body.context,
    };

    let outcome = state
        .library
        .get_book_with_narrative(&body.input, &state.engine, &request)
        .await?;
    Ok(Json(NarrativeResponse {
        narrative_available: outcome.narrative_available(),
        narrative_status: outcome.status,
        book: outcome.book,
    }))
}

pub async fn get_book_with_sections(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<SectionsRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_from(&headers)?;
    if body.sections.is_empty() {
        return Err(ApiError::bad_request("at least one section is required", None));
    }
    let request = SectionsRequest {
        caller,
        language: language_or_default(&state, body.language.as_deref())?,
        sections: body.sections,
        context: body.context,
    };

    let outcome = state
        .library
        .get_book_with_sections(&body.input, &state.engine, &request)
        .await?;
    Ok(Json(SectionsResponse {
        book: outcome.book,
        unavailable_sections: outcome.unavailable_sections,
    }))
}

pub async fn health(State(state): State<ApiState>) -> Response {
    let Some(db) = state.db.as_ref() else {
        return StatusCode::NO_CONTENT.into_response();
    };
    match db.health_check().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => ApiError::unavailable("infra::http::health", &err).into_response(),
    }
}
