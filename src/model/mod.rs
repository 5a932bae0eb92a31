mod context;
mod runtime;
mod tokenizer;
mod types;

#[cfg(feature = "tch-backend")]
mod loader;

pub use context::{GenerationJob, ServiceContext, ServiceMetadata};
pub use runtime::{
    Capability, DecodeCache, ForwardOutput, ForwardStep, LoadError, ModelLoader, ModelRuntime,
    ParameterDescriptor, TokenCodec,
};
pub use tokenizer::HfTokenizer;
pub use types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatCompletionStreamChunk, ChatEventType,
    ChatStreamEvent, CompletionMessage, CompletionRequest, CompletionResponse,
    CompletionStreamChunk, SamplingParams, SamplingStrategy,
};

#[cfg(feature = "tch-backend")]
pub use loader::{TorchScriptLoader, TorchScriptModel, torch_device};
