//! Kernel error types

use crate::loader::LoadError;
use core_types::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The part of a checkpoint or restore that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointStage {
    CpuFeatures,
    KernelState,
    MemoryFiles,
    Filesystem,
    Network,
    SaveRestoreExec,
}

impl fmt::Display for CheckpointStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckpointStage::CpuFeatures => "CPUID",
            CheckpointStage::KernelState => "kernel state",
            CheckpointStage::MemoryFiles => "memory files",
            CheckpointStage::Filesystem => "filesystem",
            CheckpointStage::Network => "network",
            CheckpointStage::SaveRestoreExec => "save/restore exec",
        };
        f.write_str(name)
    }
}

/// Errors returned by kernel operations
///
/// Payloads are owned strings so that errors can be cloned and retained,
/// e.g. as the sticky save status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    /// A mandatory Init argument is missing or invalid
    #[error("invalid kernel configuration: {0}")]
    InvalidConfig(String),

    #[error("kernel already started")]
    AlreadyStarted,

    /// The arguments to process creation were unusable
    #[error("failed to create process: {0}")]
    ProcessCreation(String),

    /// The executable image could not be loaded
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A failure an application would observe as an error number
    #[error(transparent)]
    Errno(#[from] Errno),

    /// A checkpoint was taken on a host this one cannot emulate
    #[error("host is incompatible with checkpoint: {0}")]
    HostIncompatible(String),

    /// Checkpoint or restore failed in `stage`
    #[error("{stage} stage failed: {message}")]
    Checkpoint {
        stage: CheckpointStage,
        message: String,
    },

    /// The platform backend failed
    #[error("platform error: {0}")]
    Platform(String),

    /// The kernel no longer accepts new tasks
    #[error("kernel is exiting")]
    Exiting,
}

impl KernelError {
    /// Builds a checkpoint error for `stage` from any displayable cause
    pub fn checkpoint(stage: CheckpointStage, cause: impl fmt::Display) -> Self {
        KernelError::Checkpoint {
            stage,
            message: cause.to_string(),
        }
    }

    /// Returns the error number an application would see, if any
    pub fn errno(&self) -> Option<Errno> {
        match self {
            KernelError::Errno(errno) => Some(*errno),
            KernelError::Load(err) => Some(err.errno),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_error_names_stage() {
        let err = KernelError::checkpoint(CheckpointStage::MemoryFiles, "short write");
        assert_eq!(err.to_string(), "memory files stage failed: short write");
    }

    #[test]
    fn test_errno_is_exposed() {
        let err: KernelError = Errno::EAGAIN.into();
        assert_eq!(err.errno(), Some(Errno::EAGAIN));
        assert_eq!(KernelError::AlreadyStarted.errno(), None);
    }
}
