use std::sync::Arc;

use crate::{
    error::RuntimeError,
    model::{
        Capability, DecodeCache, ForwardOutput, ForwardStep, ModelRuntime, ParameterDescriptor,
        ServiceContext, TokenCodec,
    },
    precision::DType,
};

pub const EOS: u32 = 26;
const VOCAB: usize = 27;

pub struct ScriptedRuntime {
    pub script: Vec<u32>,
    pub capability: Capability,
    pub fail_at: Option<usize>,
}

impl ScriptedRuntime {
    pub fn new(script: &str) -> Self {
        Self {
            script: script.bytes().map(letter_id).collect(),
            capability: Capability::TextOnly,
            fail_at: None,
        }
    }

    pub fn ending(mut self) -> Self {
        self.script.push(EOS);
        self
    }
}

impl ModelRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn parameters(&self) -> Result<Vec<ParameterDescriptor>, RuntimeError> {
        Ok(vec![ParameterDescriptor {
            name: "wte.weight".into(),
            element_count: 1024,
            dtype: DType::F32,
        }])
    }

    fn forward(&self, step: ForwardStep<'_>) -> Result<ForwardOutput, RuntimeError> {
        let position = match step.cache {
            Some(cache) => cache
                .into_inner::<usize>()
                .ok_or_else(|| RuntimeError("foreign cache".into()))?,
            None => 0,
        };
        if self.fail_at == Some(position) {
            return Err(RuntimeError("device lost".into()));
        }
        // Past the end of the script the model keeps repeating 'a'.
        let next = self.script.get(position).copied().unwrap_or(0);
        let mut logits = vec![-5.0; VOCAB];
        logits[next as usize] = 5.0;
        Ok(ForwardOutput {
            logits,
            cache: Some(DecodeCache::new(position + 1)),
        })
    }
}

fn letter_id(byte: u8) -> u32 {
    u32::from(byte.to_ascii_lowercase().wrapping_sub(b'a')) % 26
}

pub struct LetterCodec;

impl TokenCodec for LetterCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>, RuntimeError> {
        Ok(text.bytes().map(letter_id).collect())
    }

    fn decode(&self, id: u32) -> Result<String, RuntimeError> {
        match id {
            EOS => Ok(String::new()),
            0..=25 => Ok(char::from(b'a' + id as u8).to_string()),
            _ => Err(RuntimeError(format!("token {id} out of vocabulary"))),
        }
    }

    fn eos_id(&self) -> u32 {
        EOS
    }
}

pub fn context(runtime: ScriptedRuntime) -> Arc<ServiceContext> {
    Arc::new(ServiceContext::new(
        "test/scripted",
        Arc::new(runtime),
        Arc::new(LetterCodec),
        None,
    ))
}
