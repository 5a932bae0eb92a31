use std::sync::Arc;

use parking_lot::RwLock;
use rand::thread_rng;
use serde::Serialize;
use tracing::info;

use crate::{
    admission::AdmissionReport,
    error::ServiceError,
    generation::{Decoding, GeneratedToken, StopReason, generate_tokens},
    input::PreparedInputs,
    model::{Capability, ModelRuntime, TokenCodec},
};

pub struct ServiceContext {
    model_id: String,
    model: RwLock<Option<Arc<dyn ModelRuntime>>>,
    codec: Arc<dyn TokenCodec>,
    capability: Capability,
    report: Option<AdmissionReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetadata {
    pub model_id: String,
    pub loaded: bool,
    pub capability: Capability,
    pub admission: Option<AdmissionReport>,
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationJob {
    pub max_tokens: usize,
    pub decoding: Decoding,
}

impl ServiceContext {
    pub fn new(
        model_id: impl Into<String>,
        model: Arc<dyn ModelRuntime>,
        codec: Arc<dyn TokenCodec>,
        report: Option<AdmissionReport>,
    ) -> Self {
        let capability = model.capability();
        Self {
            model_id: model_id.into(),
            model: RwLock::new(Some(model)),
            codec,
            capability,
            report,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn codec(&self) -> Arc<dyn TokenCodec> {
        self.codec.clone()
    }

    pub fn runtime(&self) -> Result<Arc<dyn ModelRuntime>, ServiceError> {
        self.model.read().clone().ok_or(ServiceError::ModelLoading)
    }

    pub fn is_loaded(&self) -> bool {
        self.model.read().is_some()
    }

    pub fn evict(&self) {
        if self.model.write().take().is_some() {
            info!(model = %self.model_id, "model evicted");
        }
    }

    pub fn metadata(&self) -> ServiceMetadata {
        ServiceMetadata {
            model_id: self.model_id.clone(),
            loaded: self.is_loaded(),
            capability: self.capability,
            admission: self.report.clone(),
        }
    }

    /// Runs the decoding loop, handing each token to `sink`. Generation stops
    /// early when `sink` returns `false`.
    pub fn generate_with<F>(
        &self,
        inputs: PreparedInputs,
        job: GenerationJob,
        mut sink: F,
    ) -> Result<Option<StopReason>, ServiceError>
    where
        F: FnMut(&GeneratedToken) -> bool,
    {
        let runtime = self.runtime()?;
        let mut stream = generate_tokens(
            runtime.as_ref(),
            self.codec.as_ref(),
            inputs,
            job.max_tokens,
            job.decoding,
            thread_rng(),
        );
        for token in stream.by_ref() {
            let token = token?;
            if !sink(&token) {
                return Ok(None);
            }
        }
        Ok(stream.stop_reason())
    }

    pub fn generate_text(
        &self,
        inputs: PreparedInputs,
        job: GenerationJob,
    ) -> Result<(String, StopReason), ServiceError> {
        let mut text = String::new();
        let stop_reason = self.generate_with(inputs, job, |token| {
            text.push_str(&token.text);
            true
        })?;
        Ok((text, stop_reason.unwrap_or(StopReason::OutOfTokens)))
    }
}
