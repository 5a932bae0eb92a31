use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::precision::PrecisionKind;

use super::AdmissionError;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("model {0} not found or access denied")]
    NotFound(String),
    #[error("metadata service unavailable: {0}")]
    Unavailable(String),
    #[error("malformed metadata: {0}")]
    Malformed(String),
    #[error("no parameter counts published")]
    Empty,
}

pub trait TensorMetadataSource {
    fn tensor_metadata(&self, model_id: &str) -> Result<BTreeMap<String, u64>, MetadataError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footprint {
    pub stored: u64,
    pub resident: u64,
}

/// Tensor names are a heuristic precision source: they can carry digits that
/// are not precision tags. The post-load measurement catches an under-prediction.
pub struct SizeEstimator<'a> {
    source: &'a dyn TensorMetadataSource,
}

impl<'a> SizeEstimator<'a> {
    pub fn new(source: &'a dyn TensorMetadataSource) -> Self {
        Self { source }
    }

    pub fn estimate(&self, model_id: &str, assumed: PrecisionKind) -> Result<u64, AdmissionError> {
        Ok(self.footprint(model_id, assumed)?.resident)
    }

    /// `assumed` caps each tensor's resident width. It must be a width the
    /// loader really materializes at; downloads always keep native widths.
    pub fn footprint(
        &self,
        model_id: &str,
        assumed: PrecisionKind,
    ) -> Result<Footprint, AdmissionError> {
        let tensors = self
            .source
            .tensor_metadata(model_id)
            .and_then(|tensors| {
                if tensors.is_empty() {
                    Err(MetadataError::Empty)
                } else {
                    Ok(tensors)
                }
            })
            .map_err(|source| AdmissionError::EstimationUnavailable {
                model: model_id.to_string(),
                source,
            })?;

        let mut footprint = Footprint {
            stored: 0,
            resident: 0,
        };
        for (name, elements) in &tensors {
            let native = PrecisionKind::infer_from_name(name);
            let precision = native.min(assumed);
            let bytes = precision.footprint(*elements);
            debug!(tensor = %name, elements, %precision, bytes, "estimated tensor footprint");
            footprint.stored = footprint.stored.saturating_add(native.footprint(*elements));
            footprint.resident = footprint.resident.saturating_add(bytes);
        }
        Ok(footprint)
    }
}
