use serde::{Deserialize, Serialize};

use crate::{
    generation::{Decoding, StopReason},
    input::{Content, Message},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    #[default]
    Greedy,
    TopP,
    TopK,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SamplingParams {
    #[serde(default)]
    pub strategy: SamplingStrategy,
    pub temperature: Option<f64>,
    pub top_k: Option<usize>,
    pub max_tokens: Option<usize>,
}

impl SamplingParams {
    pub fn max_tokens(&self, ceiling: usize) -> usize {
        self.max_tokens
            .filter(|&requested| requested > 0)
            .map_or(ceiling, |requested| requested.min(ceiling))
    }

    pub fn decoding(&self, default_temperature: f64, default_top_k: usize) -> Decoding {
        match self.strategy {
            SamplingStrategy::Greedy => Decoding::Greedy,
            SamplingStrategy::TopP | SamplingStrategy::TopK => Decoding::Sample {
                temperature: self.temperature.unwrap_or(default_temperature),
                top_k: Some(self.top_k.unwrap_or(default_top_k)).filter(|&k| k > 0),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub model: Option<String>,
    pub content: Content,
    #[serde(default)]
    pub sampling_params: SamplingParams,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub sampling_params: SamplingParams,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionResponse {
    pub content: String,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionMessage {
    pub role: &'static str,
    pub content: String,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub completion_message: CompletionMessage,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionStreamChunk {
    pub delta: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatEventType {
    Progress,
    Complete,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatStreamEvent {
    pub event_type: ChatEventType,
    pub delta: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionStreamChunk {
    pub event: ChatStreamEvent,
}
