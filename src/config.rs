use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use crate::{hub::DEFAULT_ENDPOINT, precision::PrecisionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
}

impl DeviceSpec {
    pub fn accelerator_index(self) -> Option<usize> {
        match self {
            DeviceSpec::Cpu => None,
            DeviceSpec::Cuda(index) => Some(index),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_id: String,
    pub revision: Option<String>,
    pub hub_token: Option<String>,
    pub hub_endpoint: String,
    pub model_path: Option<PathBuf>,
    pub model_file: String,
    pub tokenizer_path: Option<PathBuf>,
    pub eos_token: String,
    pub cache_dir: PathBuf,
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub precision: PrecisionKind,
    pub device: DeviceSpec,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("listen_addr", &self.listen_addr)
            .field("model_id", &self.model_id)
            .field("revision", &self.revision)
            .field("hub_token", &self.hub_token.as_ref().map(|_| "<redacted>"))
            .field("hub_endpoint", &self.hub_endpoint)
            .field("model_path", &self.model_path)
            .field("model_file", &self.model_file)
            .field("tokenizer_path", &self.tokenizer_path)
            .field("eos_token", &self.eos_token)
            .field("cache_dir", &self.cache_dir)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("top_k", &self.top_k)
            .field("precision", &self.precision)
            .field("device", &self.device)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = var("SERVER_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8000".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000));

        let model_id = var("MODEL_ID").unwrap_or_else(|| "openai-community/gpt2".to_string());
        let revision = var("MODEL_REVISION");
        let hub_token = var("HUGGINGFACE_ACCESS_TOKEN")
            .or_else(|| var("HF_TOKEN"))
            .filter(|token| !token.trim().is_empty());
        let hub_endpoint = var("HF_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let model_path = var("MODEL_PATH").map(PathBuf::from);
        let model_file = var("MODEL_FILE").unwrap_or_else(|| "model.pt".to_string());
        let tokenizer_path = var("TOKENIZER_PATH").map(PathBuf::from);
        let eos_token = var("EOS_TOKEN").unwrap_or_else(|| "<|endoftext|>".to_string());

        let cache_dir = var("MODEL_CACHE_DIR")
            .map(PathBuf::from)
            .or_else(|| var("HF_HOME").map(|home| PathBuf::from(home).join("hub")))
            .unwrap_or_else(default_cache_dir);

        let max_tokens = var("MAX_TOKENS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);
        let temperature = var("TEMPERATURE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.8);
        let top_k = var("TOP_K").and_then(|v| v.parse().ok()).unwrap_or(40);

        let precision = match var("QUANTIZATION_BITS") {
            Some(raw) => parse_precision(&raw),
            None => PrecisionKind::Full,
        };

        let device = parse_device(&var("DEVICE").unwrap_or_else(|| "cpu".into()));

        Ok(Self {
            listen_addr,
            model_id,
            revision,
            hub_token,
            hub_endpoint,
            model_path,
            model_file,
            tokenizer_path,
            eos_token,
            cache_dir,
            max_tokens,
            temperature,
            top_k,
            precision,
            device,
        })
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("huggingface")
        .join("hub")
}

fn parse_precision(raw: &str) -> PrecisionKind {
    match raw.trim().parse::<u32>().ok().and_then(PrecisionKind::from_bits) {
        Some(kind) => kind,
        None => {
            tracing::warn!(value = raw, "unrecognized QUANTIZATION_BITS, using full precision");
            PrecisionKind::Full
        }
    }
}

fn parse_device(raw: &str) -> DeviceSpec {
    let lower = raw.to_lowercase();
    if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        DeviceSpec::Cuda(idx)
    } else {
        DeviceSpec::Cpu
    }
}
