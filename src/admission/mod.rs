mod actual;
mod controller;
mod estimator;
mod probe;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::{error::RuntimeError, model::LoadError, precision::as_gib};

pub use actual::ActualSizeCalculator;
pub use controller::{AdmissionController, AdmissionReport, Admitted, MemoryTarget};
pub use estimator::{Footprint, MetadataError, SizeEstimator, TensorMetadataSource};
pub use probe::{ProbeError, ResourceProbe, SystemProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceBudget {
    pub accelerator_present: bool,
    pub accelerator_bytes: u64,
    pub host_bytes: u64,
    pub disk_bytes: u64,
}

impl ResourceBudget {
    pub fn capture(probe: &dyn ResourceProbe) -> Result<Self, ProbeError> {
        let accelerator_present = probe.accelerator_present()?;
        let accelerator_bytes = if accelerator_present {
            probe.available_accelerator_memory()?
        } else {
            0
        };
        Ok(Self {
            accelerator_present,
            accelerator_bytes,
            host_bytes: probe.available_host_memory()?,
            disk_bytes: probe.available_disk_space()?,
        })
    }

    pub fn compare(&self, required: u64) -> SizeVerdict {
        self.compare_split(required, required)
    }

    /// Disk against `stored`, then the memory pool the model lives in against `resident`.
    pub fn compare_split(&self, stored: u64, resident: u64) -> SizeVerdict {
        if stored > self.disk_bytes {
            return SizeVerdict::ExceedsDisk {
                required: stored,
                available: self.disk_bytes,
            };
        }
        if self.accelerator_present {
            if resident > self.accelerator_bytes {
                return SizeVerdict::ExceedsAccelerator {
                    required: resident,
                    available: self.accelerator_bytes,
                };
            }
            return SizeVerdict::Fits {
                required: resident,
                available: self.accelerator_bytes,
            };
        }
        if resident > self.host_bytes {
            return SizeVerdict::ExceedsHostMemory {
                required: resident,
                available: self.host_bytes,
            };
        }
        SizeVerdict::Fits {
            required: resident,
            available: self.host_bytes,
        }
    }

    /// Gives back what each pool lost since `before`, up to `loaded` bytes, so a
    /// resident model is not counted against its own allocation.
    pub fn returning_load(&self, before: &ResourceBudget, loaded: u64) -> Self {
        let give_back =
            |pre: u64, post: u64| post.saturating_add(pre.saturating_sub(post).min(loaded));
        let accelerator_bytes = if self.accelerator_present && before.accelerator_present {
            give_back(before.accelerator_bytes, self.accelerator_bytes)
        } else {
            self.accelerator_bytes
        };
        Self {
            accelerator_present: self.accelerator_present,
            accelerator_bytes,
            host_bytes: give_back(before.host_bytes, self.host_bytes),
            disk_bytes: give_back(before.disk_bytes, self.disk_bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum SizeVerdict {
    Fits { required: u64, available: u64 },
    ExceedsDisk { required: u64, available: u64 },
    ExceedsAccelerator { required: u64, available: u64 },
    ExceedsHostMemory { required: u64, available: u64 },
}

impl SizeVerdict {
    pub fn fits(&self) -> bool {
        matches!(self, SizeVerdict::Fits { .. })
    }

    pub fn required(&self) -> u64 {
        match *self {
            SizeVerdict::Fits { required, .. }
            | SizeVerdict::ExceedsDisk { required, .. }
            | SizeVerdict::ExceedsAccelerator { required, .. }
            | SizeVerdict::ExceedsHostMemory { required, .. } => required,
        }
    }

    pub fn available(&self) -> u64 {
        match *self {
            SizeVerdict::Fits { available, .. }
            | SizeVerdict::ExceedsDisk { available, .. }
            | SizeVerdict::ExceedsAccelerator { available, .. }
            | SizeVerdict::ExceedsHostMemory { available, .. } => available,
        }
    }

    fn resource(&self) -> &'static str {
        match self {
            SizeVerdict::Fits { .. } => "budget",
            SizeVerdict::ExceedsDisk { .. } => "disk space",
            SizeVerdict::ExceedsAccelerator { .. } => "accelerator memory",
            SizeVerdict::ExceedsHostMemory { .. } => "host memory",
        }
    }
}

impl fmt::Display for SizeVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let required = self.required();
        let available = self.available();
        if self.fits() {
            write!(
                f,
                "fits: requires {required} bytes ({:.2} GB), {available} bytes ({:.2} GB) available",
                as_gib(required),
                as_gib(available)
            )
        } else {
            write!(
                f,
                "insufficient {}: requires {required} bytes ({:.2} GB), only {available} bytes ({:.2} GB) available",
                self.resource(),
                as_gib(required),
                as_gib(available)
            )
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckPhase {
    Estimate,
    Actual,
}

impl fmt::Display for CheckPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckPhase::Estimate => f.write_str("pre-load estimate"),
            CheckPhase::Actual => f.write_str("post-load measurement"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("size estimate unavailable for {model}: {source}")]
    EstimationUnavailable {
        model: String,
        #[source]
        source: MetadataError,
    },
    #[error("{phase} rejected model: {verdict}")]
    Rejected {
        phase: CheckPhase,
        verdict: SizeVerdict,
    },
    #[error("resource probe failed: {0}")]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("failed to inspect loaded model: {0}")]
    Inspect(#[from] RuntimeError),
}

impl AdmissionError {
    pub fn verdict(&self) -> Option<&SizeVerdict> {
        match self {
            AdmissionError::Rejected { verdict, .. } => Some(verdict),
            _ => None,
        }
    }
}
