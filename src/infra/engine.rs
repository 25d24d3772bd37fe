//! HTTP client for the geometry engine.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    application::ports::{EngineError, GeometryEngine},
    domain::{EngineConfig, GeometryPayload, LibraryKind, NormalizedInput},
};

use super::error::InfraError;

#[derive(Serialize)]
struct ComputeRequest<'a> {
    library: LibraryKind,
    input: &'a NormalizedInput,
    engine: &'a EngineConfig,
}

#[derive(Debug, Clone)]
pub struct HttpGeometryEngine {
    client: Client,
    endpoint: String,
}

impl HttpGeometryEngine {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::client("geometry engine", err))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeometryEngine for HttpGeometryEngine {
    async fn compute(
        &self,
        input: &NormalizedInput,
        engine: &EngineConfig,
    ) -> Result<GeometryPayload, EngineError> {
        let url = format!("{}/v1/geometry/{}", self.endpoint, input.library());
        let request = ComputeRequest {
            library: input.library(),
            input,
            engine,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|err| EngineError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(EngineError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        if !status.is_success() {
            return Err(EngineError::Unavailable(format!("status {status}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| EngineError::InvalidPayload(err.to_string()))?;
        if !payload.is_object() {
            return Err(EngineError::InvalidPayload(
                "expected a JSON object".to_string(),
            ));
        }

        debug!(library = %input.library(), "geometry computed");
        Ok(GeometryPayload(payload))
    }
}

pub(crate) fn user_agent() -> &'static str {
    concat!("almanac/", env!("CARGO_PKG_VERSION"))
}
