use std::fmt;

use thiserror::Error;

use crate::apply::ApplyReport;
use crate::finalize::FinalizationError;

/// Where in the mutation sequence an install stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    Lock,
    Fetch,
    Verify,
    Extract,
    Manifest,
    Swap,
    Link,
}

impl InstallStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Fetch => "fetch",
            Self::Verify => "verify",
            Self::Extract => "extract",
            Self::Manifest => "manifest",
            Self::Swap => "swap",
            Self::Link => "link",
        }
    }

    /// Whether a failure at this step can have changed the namespace.
    pub fn after_mutation(self) -> bool {
        matches!(self, Self::Link)
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct InstallFailure {
    pub step: InstallStep,
    pub cause: anyhow::Error,
}

impl InstallFailure {
    pub fn new(step: InstallStep, cause: anyhow::Error) -> Self {
        Self { step, cause }
    }
}

impl fmt::Display for InstallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "install failed during {}", self.step)
    }
}

impl std::error::Error for InstallFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

pub(crate) trait StepContext<T> {
    fn at_step(self, step: InstallStep) -> Result<T, InstallFailure>;
}

impl<T> StepContext<T> for anyhow::Result<T> {
    fn at_step(self, step: InstallStep) -> Result<T, InstallFailure> {
        self.map_err(|cause| InstallFailure::new(step, cause))
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Apply(#[from] InstallFailure),

    /// The package is installed; only its finalization hook failed.
    #[error("{error}")]
    Finalization {
        report: Box<ApplyReport>,
        error: FinalizationError,
    },
}
