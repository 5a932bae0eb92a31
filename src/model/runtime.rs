use std::any::Any;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::{
    error::RuntimeError,
    input::ImageMedia,
    precision::{DType, PrecisionKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextOnly,
    TextAndImage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDescriptor {
    pub name: String,
    pub element_count: u64,
    pub dtype: DType,
}

/// Incremental-attention state handed back by the runtime after a forward
/// pass. The decoding loop only stores it and passes it back on the next step.
pub struct DecodeCache(Box<dyn Any + Send>);

impl DecodeCache {
    pub fn new<T: Any + Send>(state: T) -> Self {
        DecodeCache(Box::new(state))
    }

    pub fn into_inner<T: Any>(self) -> Option<T> {
        self.0.downcast::<T>().ok().map(|boxed| *boxed)
    }
}

impl fmt::Debug for DecodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DecodeCache(..)")
    }
}

pub struct ForwardStep<'a> {
    pub input_ids: &'a [i64],
    pub attention_mask: &'a [i64],
    pub images: &'a [ImageMedia],
    pub cache: Option<DecodeCache>,
}

pub struct ForwardOutput {
    pub logits: Vec<f32>,
    pub cache: Option<DecodeCache>,
}

pub trait ModelRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    fn parameters(&self) -> Result<Vec<ParameterDescriptor>, RuntimeError>;

    fn forward(&self, step: ForwardStep<'_>) -> Result<ForwardOutput, RuntimeError>;
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to fetch {model}: {reason}")]
    Network { model: String, reason: String },
    #[error("storage error while loading {model}: {reason}")]
    Storage { model: String, reason: String },
    #[error("{model} could not be loaded by this runtime: {reason}")]
    Incompatible { model: String, reason: String },
}

pub trait ModelLoader {
    fn load(&self, model_id: &str) -> Result<Box<dyn ModelRuntime>, LoadError>;

    /// Widest width parameters are held at once loaded. `Full` keeps the
    /// artifact's own dtypes.
    fn load_precision(&self) -> PrecisionKind {
        PrecisionKind::Full
    }

    fn unload(&self, model: Box<dyn ModelRuntime>);
}

pub trait TokenCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>, RuntimeError>;

    fn decode(&self, id: u32) -> Result<String, RuntimeError>;

    fn eos_id(&self) -> u32;
}
