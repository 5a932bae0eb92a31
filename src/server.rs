use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::{
    config::AppConfig,
    error::ServiceError,
    generation::StopReason,
    input::{PreparedInputs, prepare_chat, prepare_content},
    model::{
        ChatCompletionRequest, ChatCompletionResponse, ChatCompletionStreamChunk, ChatEventType,
        ChatStreamEvent, CompletionMessage, CompletionRequest, CompletionResponse,
        CompletionStreamChunk, GenerationJob, SamplingParams, ServiceContext, ServiceMetadata,
    },
};

const STREAM_BUFFER: usize = 16;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub context: Arc<ServiceContext>,
}

impl AppState {
    fn job(&self, params: &SamplingParams) -> GenerationJob {
        GenerationJob {
            max_tokens: params.max_tokens(self.config.max_tokens),
            decoding: params.decoding(self.config.temperature, self.config.top_k),
        }
    }

    fn note_requested_model(&self, requested: Option<&str>) {
        let Some(requested) = requested else {
            return;
        };
        if requested != self.context.model_id() {
            warn!(
                requested,
                serving = self.context.model_id(),
                "request names a different model, serving the loaded one"
            );
        }
    }
}

pub fn build_router(config: Arc<AppConfig>, context: Arc<ServiceContext>) -> Router {
    let state = AppState { config, context };

    Router::new()
        .route("/health", get(health))
        .route("/metadata", get(metadata))
        .route("/inference/completion", post(completion))
        .route("/inference/chat_completion", post(chat_completion))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health() -> &'static str {
    "ok"
}

async fn metadata(State(state): State<AppState>) -> Json<ServiceMetadata> {
    Json(state.context.metadata())
}

async fn completion(
    State(state): State<AppState>,
    Json(request): Json<CompletionRequest>,
) -> Result<Response, ServiceError> {
    state.note_requested_model(request.model.as_deref());
    let context = state.context.clone();
    context.runtime()?;
    let inputs = prepare_content(
        &request.content,
        context.capability(),
        context.codec().as_ref(),
    )?;
    let job = state.job(&request.sampling_params);
    info!(
        max_tokens = job.max_tokens,
        stream = request.stream,
        prompt_tokens = inputs.input_ids.len(),
        "completion request"
    );

    if request.stream {
        return Ok(stream_ndjson(context, inputs, job, |delta, stop_reason| {
            CompletionStreamChunk { delta, stop_reason }
        }));
    }

    let (content, stop_reason) = run_blocking(context, inputs, job).await?;
    Ok(Json(CompletionResponse {
        content,
        stop_reason,
    })
    .into_response())
}

async fn chat_completion(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ServiceError> {
    state.note_requested_model(request.model.as_deref());
    let context = state.context.clone();
    context.runtime()?;
    let inputs = prepare_chat(
        &request.messages,
        context.capability(),
        context.codec().as_ref(),
    )?;
    let job = state.job(&request.sampling_params);
    info!(
        messages = request.messages.len(),
        max_tokens = job.max_tokens,
        stream = request.stream,
        "chat completion request"
    );

    if request.stream {
        return Ok(stream_ndjson(context, inputs, job, |delta, stop_reason| {
            let event_type = match stop_reason {
                Some(_) => ChatEventType::Complete,
                None => ChatEventType::Progress,
            };
            ChatCompletionStreamChunk {
                event: ChatStreamEvent {
                    event_type,
                    delta,
                    stop_reason,
                },
            }
        }));
    }

    let (content, stop_reason) = run_blocking(context, inputs, job).await?;
    Ok(Json(ChatCompletionResponse {
        completion_message: CompletionMessage {
            role: "assistant",
            content,
            stop_reason,
        },
    })
    .into_response())
}

async fn run_blocking(
    context: Arc<ServiceContext>,
    inputs: PreparedInputs,
    job: GenerationJob,
) -> Result<(String, StopReason), ServiceError> {
    tokio::task::spawn_blocking(move || context.generate_text(inputs, job))
        .await
        .map_err(|e| ServiceError::Inference(format!("generation task failed: {e}")))?
}

/// Streams one JSON line per token. `frame` builds a chunk from a delta and,
/// for the final chunk only, the stop reason. Generation stops at the next
/// token once the client hangs up.
fn stream_ndjson<F, T>(
    context: Arc<ServiceContext>,
    inputs: PreparedInputs,
    job: GenerationJob,
    frame: F,
) -> Response
where
    F: Fn(String, Option<StopReason>) -> T + Send + 'static,
    T: Serialize,
{
    let (tx, rx) = mpsc::channel::<Result<String, Infallible>>(STREAM_BUFFER);

    tokio::task::spawn_blocking(move || {
        let outcome = context.generate_with(inputs, job, |token| {
            send_line(&tx, &frame(token.text.clone(), None))
        });
        match outcome {
            Ok(Some(stop_reason)) => {
                send_line(&tx, &frame(String::new(), Some(stop_reason)));
            }
            Ok(None) => debug!("client disconnected, generation cancelled"),
            Err(err) => {
                warn!(error = %err, "generation failed mid-stream");
                send_line(&tx, &serde_json::json!({ "error": err.to_string() }));
            }
        }
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

fn send_line<T: Serialize>(tx: &mpsc::Sender<Result<String, Infallible>>, chunk: &T) -> bool {
    match serde_json::to_string(chunk) {
        Ok(mut line) => {
            line.push('\n');
            tx.blocking_send(Ok(line)).is_ok()
        }
        Err(err) => {
            error!(error = %err, "failed to serialize stream chunk");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::to_bytes, http::StatusCode};
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        model::Capability,
        testing::{self, ScriptedRuntime},
    };

    fn state(runtime: ScriptedRuntime) -> AppState {
        let config = AppConfig::from_lookup(|key| match key {
            "MAX_TOKENS" => Some("8".to_string()),
            _ => None,
        })
        .unwrap();
        AppState {
            config: Arc::new(config),
            context: testing::context(runtime),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_lines(response: Response) -> Vec<Value> {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        std::str::from_utf8(&bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn completion_request(body: Value) -> Json<CompletionRequest> {
        Json(serde_json::from_value(body).unwrap())
    }

    fn chat_request(body: Value) -> Json<ChatCompletionRequest> {
        Json(serde_json::from_value(body).unwrap())
    }

    #[tokio::test]
    async fn health_is_ok() {
        assert_eq!(health().await, "ok");
    }

    #[tokio::test]
    async fn aggregated_completion_stops_at_end_of_message() {
        let state = state(ScriptedRuntime::new("hey").ending());
        let response = completion(State(state), completion_request(json!({"content": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"content": "hey", "stop_reason": "end_of_message"})
        );
    }

    #[tokio::test]
    async fn configured_ceiling_caps_request_budget() {
        let state = state(ScriptedRuntime::new("abcdefghijklmnop"));
        let response = completion(
            State(state),
            completion_request(json!({"content": "hi", "sampling_params": {"max_tokens": 50}})),
        )
        .await
        .unwrap();
        assert_eq!(
            body_json(response).await,
            json!({"content": "abcdefgh", "stop_reason": "out_of_tokens"})
        );
    }

    #[tokio::test]
    async fn streamed_completion_ends_with_stop_reason() {
        let state = state(ScriptedRuntime::new("ok").ending());
        let response = completion(
            State(state),
            completion_request(json!({"content": "hi", "stream": true})),
        )
        .await
        .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-ndjson"
        );
        let lines = body_lines(response).await;
        assert_eq!(
            lines,
            vec![
                json!({"delta": "o"}),
                json!({"delta": "k"}),
                json!({"delta": ""}),
                json!({"delta": "", "stop_reason": "end_of_message"}),
            ]
        );
    }

    #[tokio::test]
    async fn chat_completion_wraps_assistant_message() {
        let state = state(ScriptedRuntime::new("yo").ending());
        let response = chat_completion(
            State(state),
            chat_request(json!({"messages": [{"role": "user", "content": "hi"}]})),
        )
        .await
        .unwrap();
        assert_eq!(
            body_json(response).await,
            json!({"completion_message": {
                "role": "assistant",
                "content": "yo",
                "stop_reason": "end_of_message"
            }})
        );
    }

    #[tokio::test]
    async fn streamed_chat_emits_progress_then_complete() {
        let state = state(ScriptedRuntime::new("abc"));
        let response = chat_completion(
            State(state),
            chat_request(json!({
                "messages": [{"role": "user", "content": "hi"}],
                "sampling_params": {"max_tokens": 2},
                "stream": true
            })),
        )
        .await
        .unwrap();
        let lines = body_lines(response).await;
        assert_eq!(
            lines,
            vec![
                json!({"event": {"event_type": "progress", "delta": "a"}}),
                json!({"event": {"event_type": "progress", "delta": "b"}}),
                json!({"event": {"event_type": "complete", "delta": "", "stop_reason": "out_of_tokens"}}),
            ]
        );
    }

    #[tokio::test]
    async fn image_on_text_only_model_is_rejected() {
        let state = state(ScriptedRuntime::new("abc"));
        let err = completion(
            State(state),
            completion_request(json!({"content": {"image": {"uri": "file:///cat.png"}}})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::UnsupportedModality("image")));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn evicted_model_returns_service_unavailable() {
        let state = state(ScriptedRuntime::new("abc"));
        state.context.evict();
        let err = completion(
            State(state),
            completion_request(json!({"content": "hi", "stream": true})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn mid_stream_failure_is_reported_inline() {
        let mut runtime = ScriptedRuntime::new("abc");
        runtime.fail_at = Some(1);
        let state = state(runtime);
        let response = completion(
            State(state.clone()),
            completion_request(json!({"content": "hi", "stream": true})),
        )
        .await
        .unwrap();
        let lines = body_lines(response).await;
        assert_eq!(lines[0], json!({"delta": "a"}));
        assert!(lines[1]["error"].as_str().unwrap().contains("device lost"));
        assert_eq!(lines.len(), 2);
        assert!(state.context.is_loaded());
    }

    #[tokio::test]
    async fn metadata_reports_served_model() {
        let state = state(ScriptedRuntime::new("abc"));
        let Json(meta) = metadata(State(state)).await;
        assert_eq!(meta.model_id, "test/scripted");
        assert_eq!(meta.capability, Capability::TextOnly);
        assert!(meta.loaded);
    }
}
