use serde::Serialize;
use tracing::{info, warn};

use crate::{
    model::{ModelLoader, ModelRuntime},
    precision::{PrecisionKind, as_gib},
};

use super::{
    ActualSizeCalculator, AdmissionError, CheckPhase, ResourceBudget, ResourceProbe,
    SizeEstimator, SizeVerdict, TensorMetadataSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTarget {
    Accelerator,
    Host,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionReport {
    pub model_id: String,
    pub assumed_precision: PrecisionKind,
    pub load_precision: PrecisionKind,
    pub estimated_download_bytes: u64,
    pub estimated_bytes: u64,
    pub actual_bytes: u64,
    pub estimate_error_percent: f64,
    pub target: MemoryTarget,
    pub pre_load: ResourceBudget,
    pub post_load: ResourceBudget,
}

pub struct Admitted {
    pub model: Box<dyn ModelRuntime>,
    pub report: AdmissionReport,
}

pub struct AdmissionController<'a> {
    metadata: &'a dyn TensorMetadataSource,
    probe: &'a dyn ResourceProbe,
    loader: &'a dyn ModelLoader,
    assumed: PrecisionKind,
    calculator: ActualSizeCalculator,
}

impl<'a> AdmissionController<'a> {
    pub fn new(
        metadata: &'a dyn TensorMetadataSource,
        probe: &'a dyn ResourceProbe,
        loader: &'a dyn ModelLoader,
        assumed: PrecisionKind,
    ) -> Self {
        Self {
            metadata,
            probe,
            loader,
            assumed,
            calculator: ActualSizeCalculator::new(),
        }
    }

    /// The loader is not touched unless the estimate fits. A loaded model that
    /// does not fit is handed back to the loader before the error is returned.
    pub fn check(&self, model_id: &str) -> Result<Admitted, AdmissionError> {
        let load_precision = self.assumed.max(self.loader.load_precision());
        if load_precision != self.assumed {
            warn!(
                model = model_id,
                assumed = %self.assumed,
                %load_precision,
                "loader cannot materialize the assumed precision, estimating at its width"
            );
        }
        info!(model = model_id, precision = %load_precision, "estimating model footprint");
        let footprint = SizeEstimator::new(self.metadata).footprint(model_id, load_precision)?;
        let estimated = footprint.resident;

        let pre_load = ResourceBudget::capture(self.probe)?;
        let verdict = pre_load.compare_split(footprint.stored, estimated);
        log_budget(CheckPhase::Estimate, &pre_load, &verdict);
        if !verdict.fits() {
            return Err(AdmissionError::Rejected {
                phase: CheckPhase::Estimate,
                verdict,
            });
        }

        info!(model = model_id, "estimate fits, loading model");
        let model = self.loader.load(model_id)?;

        let actual = match self.calculator.calculate(&*model) {
            Ok(actual) => actual,
            Err(err) => {
                self.loader.unload(model);
                return Err(err.into());
            }
        };

        let post_load = match ResourceBudget::capture(self.probe) {
            Ok(budget) => budget,
            Err(err) => {
                self.loader.unload(model);
                return Err(err.into());
            }
        };
        let verdict = post_load.returning_load(&pre_load, actual).compare(actual);
        log_budget(CheckPhase::Actual, &post_load, &verdict);
        if !verdict.fits() {
            warn!(
                model = model_id,
                estimated,
                actual,
                "loaded model exceeds budget, evicting"
            );
            self.loader.unload(model);
            return Err(AdmissionError::Rejected {
                phase: CheckPhase::Actual,
                verdict,
            });
        }

        let report = AdmissionReport {
            model_id: model_id.to_string(),
            assumed_precision: self.assumed,
            load_precision,
            estimated_download_bytes: footprint.stored,
            estimated_bytes: estimated,
            actual_bytes: actual,
            estimate_error_percent: estimate_error_percent(estimated, actual),
            target: if post_load.accelerator_present {
                MemoryTarget::Accelerator
            } else {
                MemoryTarget::Host
            },
            pre_load,
            post_load,
        };
        info!(
            model = model_id,
            estimated_gb = as_gib(estimated),
            actual_gb = as_gib(actual),
            "model admitted"
        );

        Ok(Admitted { model, report })
    }
}

fn log_budget(phase: CheckPhase, budget: &ResourceBudget, verdict: &SizeVerdict) {
    info!(
        %phase,
        required_gb = as_gib(verdict.required()),
        disk_gb = as_gib(budget.disk_bytes),
        accelerator_gb = as_gib(budget.accelerator_bytes),
        host_gb = as_gib(budget.host_bytes),
        accelerator = budget.accelerator_present,
        fits = verdict.fits(),
        "resource check"
    );
}

fn estimate_error_percent(estimated: u64, actual: u64) -> f64 {
    if actual == 0 {
        return 0.0;
    }
    (estimated as f64 - actual as f64) / actual as f64 * 100.0
}
