use std::{collections::BTreeMap, time::Duration};

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::admission::{MetadataError, TensorMetadataSource};

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

#[derive(Debug, Deserialize)]
struct ModelInfo {
    safetensors: Option<SafetensorsInfo>,
}

#[derive(Debug, Deserialize)]
struct SafetensorsInfo {
    parameters: BTreeMap<String, u64>,
}

/// Reads the parameter-count summary the hub publishes for safetensors
/// repositories. Counts are keyed by dtype name (`F32`, `BF16`, `I8`, ...).
pub struct HubMetadataClient {
    endpoint: String,
    revision: Option<String>,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl HubMetadataClient {
    pub fn new(
        endpoint: impl Into<String>,
        revision: Option<String>,
        token: Option<String>,
    ) -> Result<Self, MetadataError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("gated_llm_service/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MetadataError::Unavailable(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            revision,
            token,
            client,
        })
    }

    fn url(&self, model_id: &str) -> String {
        match &self.revision {
            Some(revision) => format!(
                "{}/api/models/{model_id}/revision/{revision}",
                self.endpoint
            ),
            None => format!("{}/api/models/{model_id}", self.endpoint),
        }
    }
}

impl TensorMetadataSource for HubMetadataClient {
    fn tensor_metadata(&self, model_id: &str) -> Result<BTreeMap<String, u64>, MetadataError> {
        let url = self.url(model_id);
        debug!(%url, "fetching model metadata");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .map_err(|e| MetadataError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(MetadataError::NotFound(model_id.to_string()));
            }
            status if !status.is_success() => {
                return Err(MetadataError::Unavailable(format!(
                    "hub returned HTTP {status} for {model_id}"
                )));
            }
            _ => {}
        }

        let body = response
            .text()
            .map_err(|e| MetadataError::Unavailable(e.to_string()))?;
        parse_model_info(&body)
    }
}

fn parse_model_info(body: &str) -> Result<BTreeMap<String, u64>, MetadataError> {
    let info: ModelInfo =
        serde_json::from_str(body).map_err(|e| MetadataError::Malformed(e.to_string()))?;
    let safetensors = info.safetensors.ok_or_else(|| {
        MetadataError::Malformed("repository publishes no safetensors parameter counts".into())
    })?;
    if safetensors.parameters.is_empty() {
        return Err(MetadataError::Empty);
    }
    Ok(safetensors.parameters)
}
