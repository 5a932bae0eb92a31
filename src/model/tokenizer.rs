use std::path::Path;

use tokenizers::{FromPretrainedParameters, Tokenizer};

use crate::{error::RuntimeError, error::ServiceError, model::TokenCodec};

pub struct HfTokenizer {
    inner: Tokenizer,
    eos_id: u32,
}

impl HfTokenizer {
    pub fn new(inner: Tokenizer, eos_token: &str) -> Result<Self, ServiceError> {
        let eos_id = inner.token_to_id(eos_token).ok_or_else(|| {
            ServiceError::Tokenizer(format!("end-of-sequence token {eos_token:?} not in vocabulary"))
        })?;
        Ok(Self { inner, eos_id })
    }

    pub fn from_file(path: &Path, eos_token: &str) -> Result<Self, ServiceError> {
        let inner = Tokenizer::from_file(path).map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Self::new(inner, eos_token)
    }

    pub fn from_pretrained(
        model_id: &str,
        revision: Option<&str>,
        token: Option<&str>,
        eos_token: &str,
    ) -> Result<Self, ServiceError> {
        let mut params = FromPretrainedParameters {
            auth_token: token.map(str::to_string),
            ..Default::default()
        };
        if let Some(revision) = revision {
            params.revision = revision.to_string();
        }
        let inner = Tokenizer::from_pretrained(model_id, Some(params))
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Self::new(inner, eos_token)
    }
}

impl TokenCodec for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, RuntimeError> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| RuntimeError(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, id: u32) -> Result<String, RuntimeError> {
        self.inner
            .decode(&[id], false)
            .map_err(|e| RuntimeError(e.to_string()))
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokenizers::models::wordlevel::WordLevel;

    use super::*;

    fn word_level() -> Tokenizer {
        let vocab: HashMap<String, u32> = [("<unk>", 0), ("hello", 1), ("<|endoftext|>", 2)]
            .into_iter()
            .map(|(token, id)| (token.to_string(), id))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        Tokenizer::new(model)
    }

    #[test]
    fn resolves_eos_from_vocabulary() {
        let codec = HfTokenizer::new(word_level(), "<|endoftext|>").unwrap();
        assert_eq!(codec.eos_id(), 2);
    }

    #[test]
    fn missing_eos_token_is_an_error() {
        let err = HfTokenizer::new(word_level(), "</s>").err().unwrap();
        assert!(matches!(err, ServiceError::Tokenizer(_)));
    }

    #[test]
    fn encodes_and_decodes_single_tokens() {
        let codec = HfTokenizer::new(word_level(), "<|endoftext|>").unwrap();
        assert_eq!(codec.encode("hello").unwrap(), vec![1]);
        assert_eq!(codec.decode(1).unwrap(), "hello");
    }

    #[test]
    fn unknown_words_map_to_unk() {
        let codec = HfTokenizer::new(word_level(), "<|endoftext|>").unwrap();
        assert_eq!(codec.encode("goodbye").unwrap(), vec![0]);
    }
}
