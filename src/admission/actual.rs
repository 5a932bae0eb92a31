use tracing::warn;

use crate::{
    error::RuntimeError,
    model::ModelRuntime,
    precision::{DType, PrecisionKind},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct ActualSizeCalculator {
    fallback: PrecisionKind,
}

impl ActualSizeCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calculate(&self, model: &dyn ModelRuntime) -> Result<u64, RuntimeError> {
        let mut total = 0u64;
        for param in model.parameters()? {
            let precision = self.resolve(&param.name, &param.dtype);
            total = total.saturating_add(precision.footprint(param.element_count));
        }
        Ok(total)
    }

    fn resolve(&self, name: &str, dtype: &DType) -> PrecisionKind {
        PrecisionKind::from_dtype(dtype).unwrap_or_else(|| {
            warn!(
                parameter = %name,
                %dtype,
                fallback = %self.fallback,
                "unrecognized parameter dtype, costing at full precision"
            );
            self.fallback
        })
    }
}
