use thiserror::Error;

/// Operation errors surfaced to the kernel bridge as negative errno values.
/// The engine's contract is total: every failure is one of these, never a
/// panic.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("operation not permitted")]
    OperationNotPermitted,

    #[error("not a directory")]
    NotDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("bad file handle")]
    BadHandle,

    #[error("operation budget exhausted")]
    BudgetExhausted,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn to_errno(self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::PermissionDenied => libc::EACCES,
            FsError::OperationNotPermitted => libc::EPERM,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::BadHandle => libc::EBADF,
            FsError::BudgetExhausted => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(FsError::BudgetExhausted.to_errno(), libc::EIO);
        assert_eq!(FsError::NotEmpty.to_errno(), libc::ENOTEMPTY);
    }
}
