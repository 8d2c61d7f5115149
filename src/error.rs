use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::JobId;

/// External operation the core delegates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityKind {
    Decode,
    SuperResolution,
    Interpolation,
    Encode,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::SuperResolution => "super-resolution",
            Self::Interpolation => "interpolation",
            Self::Encode => "encode",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("'{}' is already queued or running", path.display())]
    DuplicateJob { path: PathBuf },

    #[error("unknown preset '{name}' (expected fast, standard or high-definition)")]
    UnknownPreset { name: String },

    #[error("inference needs {required} bytes but the budget is {budget} bytes")]
    BudgetExceeded { required: u64, budget: u64 },

    #[error("batch of {batch_size} frame(s) still exceeds the {budget} byte budget after {halvings} halving(s)")]
    ResourceExhausted {
        batch_size: usize,
        budget: u64,
        halvings: u32,
    },

    #[error("{capability} failed: {message}")]
    Capability {
        capability: CapabilityKind,
        message: String,
    },

    #[error("frame stream corrupted: {message}")]
    Corruption { message: String },

    #[error("no job with id {0}")]
    UnknownJob(JobId),

    #[error("queue state {}: {message}", path.display())]
    Persist { path: PathBuf, message: String },
}

impl PipelineError {
    pub fn capability(capability: CapabilityKind, err: impl fmt::Display) -> Self {
        Self::Capability {
            capability,
            message: err.to_string(),
        }
    }

    /// Wraps an `anyhow` chain, keeping every context layer in the message.
    pub fn from_anyhow(capability: CapabilityKind, err: anyhow::Error) -> Self {
        Self::Capability {
            capability,
            message: format!("{err:#}"),
        }
    }

    pub fn timeout(capability: CapabilityKind, seconds: f64) -> Self {
        Self::Capability {
            capability,
            message: format!("timed out after {seconds:.1}s"),
        }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateJob { .. } => ErrorKind::DuplicateJob,
            Self::UnknownPreset { .. } => ErrorKind::UnknownPreset,
            Self::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Capability { .. } => ErrorKind::Capability,
            Self::Corruption { .. } => ErrorKind::Corruption,
            Self::UnknownJob(_) => ErrorKind::UnknownJob,
            Self::Persist { .. } => ErrorKind::Persist,
        }
    }
}

/// Serialisable error classification recorded on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    DuplicateJob,
    UnknownPreset,
    BudgetExceeded,
    ResourceExhausted,
    Capability,
    Corruption,
    UnknownJob,
    Persist,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::DuplicateJob => "DuplicateJobError",
            Self::UnknownPreset => "UnknownPresetError",
            Self::BudgetExceeded => "BudgetExceededError",
            Self::ResourceExhausted => "ResourceExhaustedError",
            Self::Capability => "CapabilityError",
            Self::Corruption => "CorruptionError",
            Self::UnknownJob => "UnknownJobError",
            Self::Persist => "PersistError",
        };
        f.write_str(label)
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
