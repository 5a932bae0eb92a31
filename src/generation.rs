use rand::{
    Rng,
    distributions::{Distribution, WeightedIndex},
};
use serde::{Deserialize, Serialize};

use crate::{
    error::ServiceError,
    input::{ImageMedia, PreparedInputs},
    model::{DecodeCache, ForwardStep, ModelRuntime, TokenCodec},
};

/// Floor applied to the temperature so a zero temperature never divides by zero.
pub const MIN_TEMPERATURE: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    OutOfTokens,
    EndOfMessage,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoding {
    Greedy,
    Sample { temperature: f64, top_k: Option<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedToken {
    pub id: u32,
    pub text: String,
}

/// Lazily decodes one token per `next()` call.
pub struct TokenStream<'a, R> {
    runtime: &'a dyn ModelRuntime,
    codec: &'a dyn TokenCodec,
    rng: R,
    decoding: Decoding,
    max_tokens: usize,
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
    prepared: PreparedInputs,
    cache: Option<DecodeCache>,
    emitted: usize,
    finished: bool,
    stop_reason: Option<StopReason>,
}

pub fn generate_tokens<'a, R: Rng>(
    runtime: &'a dyn ModelRuntime,
    codec: &'a dyn TokenCodec,
    inputs: PreparedInputs,
    max_tokens: usize,
    decoding: Decoding,
    rng: R,
) -> TokenStream<'a, R> {
    let input_ids: Vec<i64> = inputs.input_ids.iter().map(|&id| id as i64).collect();
    let attention_mask = vec![1; input_ids.len()];
    TokenStream {
        runtime,
        codec,
        rng,
        decoding,
        max_tokens,
        input_ids,
        attention_mask,
        prepared: inputs,
        cache: None,
        emitted: 0,
        finished: false,
        stop_reason: None,
    }
}

impl<R: Rng> TokenStream<'_, R> {
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    fn step(&mut self) -> Result<GeneratedToken, ServiceError> {
        let first = self.emitted == 0;
        let cache = self.cache.take();
        // With a cache only the newest token is fed; otherwise the full context.
        let window = if cache.is_some() && !first {
            &self.input_ids[self.input_ids.len() - 1..]
        } else {
            &self.input_ids[..]
        };
        let images: &[ImageMedia] = if first { &self.prepared.images } else { &[] };

        let output = self.runtime.forward(ForwardStep {
            input_ids: window,
            attention_mask: &self.attention_mask,
            images,
            cache,
        })?;
        if output.logits.is_empty() {
            return Err(ServiceError::Inference("model returned empty logits".into()));
        }

        let index = match self.decoding {
            Decoding::Greedy => argmax(&output.logits),
            Decoding::Sample { temperature, top_k } => {
                let probs = softmax(&output.logits, temperature, top_k);
                sample(&probs, &mut self.rng)
            }
        };
        let id = index as u32;

        let text = self
            .codec
            .decode(id)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        self.input_ids.push(id as i64);
        self.attention_mask.push(1);
        self.cache = output.cache;

        Ok(GeneratedToken { id, text })
    }
}

impl<R: Rng> Iterator for TokenStream<'_, R> {
    type Item = Result<GeneratedToken, ServiceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.emitted >= self.max_tokens {
            self.finished = true;
            self.stop_reason = Some(StopReason::OutOfTokens);
            return None;
        }

        match self.step() {
            Ok(token) => {
                self.emitted += 1;
                if token.id == self.codec.eos_id() {
                    self.finished = true;
                    self.stop_reason = Some(StopReason::EndOfMessage);
                } else if self.emitted >= self.max_tokens {
                    self.finished = true;
                    self.stop_reason = Some(StopReason::OutOfTokens);
                }
                Some(Ok(token))
            }
            Err(err) => {
                self.finished = true;
                self.cache = None;
                Some(Err(err))
            }
        }
    }
}

pub fn argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map_or(0, |(idx, _)| idx)
}

/// Softmax of `logits / max(temperature, MIN_TEMPERATURE)`, optionally keeping
/// only the `top_k` largest logits. Non-finite logits get zero mass.
pub fn softmax(logits: &[f32], temperature: f64, top_k: Option<usize>) -> Vec<f64> {
    let temperature = temperature.max(MIN_TEMPERATURE);
    let mut scaled: Vec<f64> = logits
        .iter()
        .map(|&x| {
            if x.is_finite() {
                x as f64 / temperature
            } else {
                f64::NEG_INFINITY
            }
        })
        .collect();

    if let Some(k) = top_k.filter(|&k| k > 0 && k < scaled.len()) {
        let mut sorted = scaled.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let threshold = sorted[k - 1];
        for value in scaled.iter_mut() {
            if *value < threshold {
                *value = f64::NEG_INFINITY;
            }
        }
    }

    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        let mut fallback = vec![0.0; logits.len()];
        if let Some(first) = fallback.first_mut() {
            *first = 1.0;
        }
        return fallback;
    }

    let exps: Vec<f64> = scaled.iter().map(|&x| (x - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|x| x / total).collect()
}

pub fn sample<R: Rng>(probs: &[f64], rng: &mut R) -> usize {
    match WeightedIndex::new(probs) {
        Ok(dist) => dist.sample(rng),
        Err(_) => probs
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map_or(0, |(idx, _)| idx),
    }
}
