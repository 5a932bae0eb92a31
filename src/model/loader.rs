use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tch::{Device, IValue, Kind, Tensor, no_grad};
use tracing::{debug, info, warn};

use crate::{
    config::{AppConfig, DeviceSpec},
    error::RuntimeError,
    model::{
        Capability, DecodeCache, ForwardOutput, ForwardStep, LoadError, ModelLoader, ModelRuntime,
        ParameterDescriptor,
    },
    precision::{DType, PrecisionKind},
};

pub fn torch_device(spec: DeviceSpec) -> Device {
    match spec {
        DeviceSpec::Cpu => Device::Cpu,
        DeviceSpec::Cuda(idx) => {
            if tch::Cuda::is_available() {
                Device::Cuda(idx)
            } else {
                warn!(index = idx, "CUDA requested but unavailable, falling back to CPU");
                Device::Cpu
            }
        }
    }
}

/// Resolves a model id to a TorchScript artifact, downloading it from the hub
/// when no local path is configured, and loads it onto the target device.
pub struct TorchScriptLoader {
    device: Device,
    local_path: Option<PathBuf>,
    module_file: String,
    cache_dir: PathBuf,
    revision: Option<String>,
    token: Option<String>,
    precision: PrecisionKind,
}

impl TorchScriptLoader {
    pub fn from_config(config: &AppConfig, device: Device) -> Self {
        // TorchScript modules can be cast to half precision but not quantized.
        let precision = match config.precision {
            PrecisionKind::Full => PrecisionKind::Full,
            PrecisionKind::Half => PrecisionKind::Half,
            requested @ (PrecisionKind::Int8 | PrecisionKind::Int4) => {
                warn!(%requested, "integer quantization unsupported, loading at 16-bit");
                PrecisionKind::Half
            }
        };
        Self {
            device,
            precision,
            local_path: config.model_path.clone(),
            module_file: config.model_file.clone(),
            cache_dir: config.cache_dir.clone(),
            revision: config.revision.clone(),
            token: config.hub_token.clone(),
        }
    }

    fn resolve_artifact(&self, model_id: &str) -> Result<PathBuf, LoadError> {
        if let Some(path) = &self.local_path {
            if !path.exists() {
                return Err(LoadError::Storage {
                    model: model_id.to_string(),
                    reason: format!("model artifact missing: {}", path.display()),
                });
            }
            return Ok(path.clone());
        }

        let mut builder = hf_hub::api::sync::ApiBuilder::new().with_cache_dir(self.cache_dir.clone());
        if let Some(token) = &self.token {
            builder = builder.with_token(Some(token.clone()));
        }
        let api = builder.build().map_err(|e| LoadError::Network {
            model: model_id.to_string(),
            reason: format!("failed to initialize hub client: {e}"),
        })?;

        let repo = match &self.revision {
            Some(revision) => hf_hub::Repo::with_revision(
                model_id.to_string(),
                hf_hub::RepoType::Model,
                revision.clone(),
            ),
            None => hf_hub::Repo::model(model_id.to_string()),
        };

        info!(model = model_id, file = %self.module_file, "downloading model artifact");
        api.repo(repo)
            .get(&self.module_file)
            .map_err(|e| LoadError::Network {
                model: model_id.to_string(),
                reason: e.to_string(),
            })
    }
}

impl ModelLoader for TorchScriptLoader {
    fn load(&self, model_id: &str) -> Result<Box<dyn ModelRuntime>, LoadError> {
        let path = self.resolve_artifact(model_id)?;
        let model = TorchScriptModel::load(model_id, &path, self.device, self.precision)?;
        Ok(Box::new(model))
    }

    fn load_precision(&self) -> PrecisionKind {
        self.precision
    }

    fn unload(&self, model: Box<dyn ModelRuntime>) {
        let name = model.name().to_string();
        drop(model);
        info!(model = %name, "model released");
    }
}

struct PastKeyValues(Vec<Vec<Tensor>>);

impl PastKeyValues {
    fn from_ivalue(value: IValue) -> Option<Self> {
        let layers = match value {
            IValue::Tuple(layers) | IValue::GenericList(layers) => layers,
            _ => return None,
        };
        layers
            .into_iter()
            .map(|layer| match layer {
                IValue::TensorList(tensors) => Some(tensors),
                IValue::Tuple(items) | IValue::GenericList(items) => items
                    .into_iter()
                    .map(|item| match item {
                        IValue::Tensor(t) => Some(t),
                        _ => None,
                    })
                    .collect(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(PastKeyValues)
    }

    fn into_ivalue(self) -> IValue {
        IValue::Tuple(
            self.0
                .into_iter()
                .map(|layer| IValue::Tuple(layer.into_iter().map(IValue::Tensor).collect()))
                .collect(),
        )
    }
}

pub struct TorchScriptModel {
    name: String,
    device: Device,
    module: Mutex<tch::CModule>,
}

impl TorchScriptModel {
    pub fn load(
        model_id: &str,
        path: &Path,
        device: Device,
        precision: PrecisionKind,
    ) -> Result<Self, LoadError> {
        let mut module =
            tch::CModule::load_on_device(path, device).map_err(|e| LoadError::Incompatible {
                model: model_id.to_string(),
                reason: e.to_string(),
            })?;
        module.set_eval();
        if precision == PrecisionKind::Half {
            // Only floating-point parameters are cast.
            module.to(device, Kind::Half, false);
        }

        Ok(Self {
            name: model_id.to_string(),
            device,
            module: Mutex::new(module),
        })
    }

    fn tensor(&self, values: &[i64]) -> Tensor {
        Tensor::from_slice(values)
            .reshape([1, values.len() as i64])
            .to(self.device)
    }
}

fn dtype_of(kind: Kind) -> DType {
    match kind {
        Kind::Float => DType::F32,
        Kind::Half => DType::F16,
        Kind::BFloat16 => DType::BF16,
        Kind::Int8 | Kind::QInt8 => DType::I8,
        Kind::Uint8 | Kind::QUInt8 => DType::U8,
        other => DType::Other(format!("{other:?}")),
    }
}

impl ModelRuntime for TorchScriptModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::TextOnly
    }

    fn parameters(&self) -> Result<Vec<ParameterDescriptor>, RuntimeError> {
        let named = self
            .module
            .lock()
            .named_parameters()
            .map_err(|e| RuntimeError(e.to_string()))?;
        Ok(named
            .into_iter()
            .map(|(name, tensor)| ParameterDescriptor {
                name,
                element_count: tensor.numel() as u64,
                dtype: dtype_of(tensor.kind()),
            })
            .collect())
    }

    fn forward(&self, step: ForwardStep<'_>) -> Result<ForwardOutput, RuntimeError> {
        let mut inputs = vec![
            IValue::Tensor(self.tensor(step.input_ids)),
            IValue::Tensor(self.tensor(step.attention_mask)),
        ];
        if let Some(cache) = step.cache {
            let past = cache
                .into_inner::<PastKeyValues>()
                .ok_or_else(|| RuntimeError("decode cache from another runtime".into()))?;
            inputs.push(past.into_ivalue());
        }

        no_grad(|| {
            let module = self.module.lock();
            let output = module
                .forward_is(&inputs)
                .map_err(|e| RuntimeError(e.to_string()))?;

            // Traced models return either bare logits or (logits, past, ..).
            let (logits, past) = match output {
                IValue::Tensor(t) => (t, None),
                IValue::Tuple(mut items) if !items.is_empty() => {
                    let rest = items.split_off(1);
                    let logits = match items.pop() {
                        Some(IValue::Tensor(t)) => t,
                        _ => {
                            return Err(RuntimeError(
                                "expected tensor as first tuple element".into(),
                            ));
                        }
                    };
                    (logits, rest.into_iter().next())
                }
                _ => return Err(RuntimeError("unexpected model output format".into())),
            };

            // [1, seq_len, vocab] -> [vocab] at the last position.
            let last = logits
                .select(1, -1)
                .squeeze()
                .to_kind(Kind::Float)
                .to(Device::Cpu);
            let logits = Vec::<f32>::try_from(&last).map_err(|e| RuntimeError(e.to_string()))?;

            Ok(ForwardOutput {
                logits,
                cache: past.and_then(cache_from_output),
            })
        })
    }
}

// Unrecognized layouts run without a cache: the next step re-feeds the full context.
fn cache_from_output(past: IValue) -> Option<DecodeCache> {
    match PastKeyValues::from_ivalue(past) {
        Some(past) => Some(DecodeCache::new(past)),
        None => {
            debug!("model returned an unrecognized past layout, decoding without cache");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_torch_kinds_to_dtypes() {
        assert_eq!(dtype_of(Kind::Float), DType::F32);
        assert_eq!(dtype_of(Kind::BFloat16), DType::BF16);
        assert_eq!(dtype_of(Kind::QInt8), DType::I8);
        assert!(matches!(dtype_of(Kind::Double), DType::Other(_)));
    }

    #[test]
    fn past_layers_round_trip_as_tensors() {
        let layer = IValue::Tuple(vec![
            IValue::Tensor(Tensor::zeros([1, 2, 3, 4], (Kind::Float, Device::Cpu))),
            IValue::Tensor(Tensor::ones([1, 2, 3, 4], (Kind::Float, Device::Cpu))),
        ]);
        let past = PastKeyValues::from_ivalue(IValue::Tuple(vec![layer])).unwrap();
        assert_eq!(past.0.len(), 1);
        assert_eq!(past.0[0].len(), 2);
        match past.into_ivalue() {
            IValue::Tuple(layers) => assert!(matches!(&layers[0], IValue::Tuple(kv) if kv.len() == 2)),
            _ => panic!("expected tuple"),
        }
    }

    #[test]
    fn non_tensor_past_disables_the_cache() {
        assert!(cache_from_output(IValue::Int(3)).is_none());
        assert!(cache_from_output(IValue::Tuple(vec![IValue::Tuple(vec![IValue::Double(1.0)])])).is_none());
    }

    #[test]
    fn integer_precisions_load_at_half() {
        let config = AppConfig::from_lookup(|key| match key {
            "QUANTIZATION_BITS" => Some("4".to_string()),
            _ => None,
        })
        .unwrap();
        let loader = TorchScriptLoader::from_config(&config, Device::Cpu);
        assert_eq!(loader.load_precision(), PrecisionKind::Half);
    }

    #[test]
    fn cpu_spec_maps_to_cpu_device() {
        assert_eq!(torch_device(DeviceSpec::Cpu), Device::Cpu);
    }

    #[test]
    fn missing_local_artifact_is_a_storage_error() {
        let loader = TorchScriptLoader {
            device: Device::Cpu,
            local_path: Some(PathBuf::from("/nonexistent/model.pt")),
            module_file: "model.pt".into(),
            cache_dir: std::env::temp_dir(),
            revision: None,
            token: None,
            precision: PrecisionKind::Full,
        };
        let err = loader.load("org/model").err().unwrap();
        assert!(matches!(err, LoadError::Storage { .. }));
    }
}
