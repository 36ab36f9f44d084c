//! Errors visible to sandboxed applications

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A Linux error number
///
/// These are the failures an application observes as the result of a
/// system call, as opposed to sandbox-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum Errno {
    #[error("EPERM: operation not permitted")]
    EPERM,
    #[error("ENOENT: no such file or directory")]
    ENOENT,
    #[error("ESRCH: no such process")]
    ESRCH,
    #[error("EINTR: interrupted system call")]
    EINTR,
    #[error("EAGAIN: resource temporarily unavailable")]
    EAGAIN,
    #[error("ENOMEM: cannot allocate memory")]
    ENOMEM,
    #[error("EACCES: permission denied")]
    EACCES,
    #[error("EBUSY: device or resource busy")]
    EBUSY,
    #[error("EEXIST: file exists")]
    EEXIST,
    #[error("ENOTDIR: not a directory")]
    ENOTDIR,
    #[error("EINVAL: invalid argument")]
    EINVAL,
    #[error("EMFILE: too many open files")]
    EMFILE,
    #[error("ENOEXEC: exec format error")]
    ENOEXEC,
}

impl Errno {
    /// Returns the numeric value of this error
    pub fn number(&self) -> i32 {
        match self {
            Errno::EPERM => 1,
            Errno::ENOENT => 2,
            Errno::ESRCH => 3,
            Errno::EINTR => 4,
            Errno::ENOEXEC => 8,
            Errno::EAGAIN => 11,
            Errno::ENOMEM => 12,
            Errno::EACCES => 13,
            Errno::EBUSY => 16,
            Errno::EEXIST => 17,
            Errno::ENOTDIR => 20,
            Errno::EINVAL => 22,
            Errno::EMFILE => 24,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_numbers() {
        assert_eq!(Errno::EAGAIN.number(), 11);
        assert_eq!(Errno::ESRCH.number(), 3);
        assert_eq!(Errno::EINVAL.number(), 22);
    }

    #[test]
    fn test_errno_display() {
        assert_eq!(
            Errno::EAGAIN.to_string(),
            "EAGAIN: resource temporarily unavailable"
        );
    }
}
