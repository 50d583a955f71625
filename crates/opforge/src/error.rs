use thiserror::Error;

use crate::hashing::CacheKey;

/// Failures detected while collecting fragments or assembling a unit.
///
/// Both variants abort `assemble` before any compiler is invoked.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssembleError {
    #[error("configuration error in `{instance}`: {message}")]
    Configuration { instance: String, message: String },
    #[error(
        "conflicting build requirements: `{arg}` is required by `{required_by}` \
         but forbidden by `{forbidden_by}`"
    )]
    ConflictingBuildRequirements {
        arg: String,
        required_by: String,
        forbidden_by: String,
    },
}

impl AssembleError {
    pub fn configuration(instance: impl Into<String>, message: impl Into<String>) -> Self {
        AssembleError::Configuration {
            instance: instance.into(),
            message: message.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, AssembleError::Configuration { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AssembleError::ConflictingBuildRequirements { .. })
    }
}

pub type AssembleResult<T> = Result<T, AssembleError>;

/// The toolchain could not produce (or load) an artifact for a unit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("compilation of unit {key} failed: {diagnostics}")]
pub struct CompilationError {
    pub key: CacheKey,
    pub diagnostics: String,
}

impl CompilationError {
    pub fn new(key: CacheKey, diagnostics: impl Into<String>) -> Self {
        Self {
            key,
            diagnostics: diagnostics.into(),
        }
    }
}

/// Generated code reported a failure through the host error struct.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("computation failed with code {code}: {message}")]
pub struct RuntimeComputationFailure {
    pub code: i32,
    pub message: String,
}

impl RuntimeComputationFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForgeError {
    #[error(transparent)]
    Assemble(#[from] AssembleError),
    #[error(transparent)]
    Compilation(#[from] CompilationError),
    #[error(transparent)]
    Runtime(#[from] RuntimeComputationFailure),
}

pub type ForgeResult<T> = Result<T, ForgeError>;
