use super::errors::{FsError, FsResult};
use super::node::FileNode;

const S_IRUSR: u32 = 0o400;
const S_IWUSR: u32 = 0o200;
const S_IXUSR: u32 = 0o100;
const S_IRGRP: u32 = 0o040;
const S_IWGRP: u32 = 0o020;
const S_IXGRP: u32 = 0o010;
const S_IROTH: u32 = 0o004;
const S_IWOTH: u32 = 0o002;
const S_IXOTH: u32 = 0o001;

/// Caller identity as reported by the kernel bridge.
#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

/// The access classes a request wants granted.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessRequest {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl AccessRequest {
    pub fn read() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn write() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            execute: false,
        }
    }

    /// Decode an `access(2)` amode word. `F_OK` (zero) requests nothing.
    pub fn from_amode(amode: i32) -> Self {
        Self {
            read: amode & libc::R_OK != 0,
            write: amode & libc::W_OK != 0,
            execute: amode & libc::X_OK != 0,
        }
    }

    /// Decode the access mode of `open(2)` flags.
    pub fn from_open_flags(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => Self::write(),
            libc::O_RDWR => Self::read_write(),
            _ => Self::read(),
        }
    }
}

fn bit_granted(node: &FileNode, creds: &Credentials, bits: (u32, u32, u32)) -> bool {
    (creds.uid == node.uid && node.mode & bits.0 != 0)
        || (creds.gid == node.gid && node.mode & bits.1 != 0)
        || node.mode & bits.2 != 0
}

/// Literal mode-bit check. Every requested bit must be granted by the
/// caller's owner match, group match, or the other bits; there is no root
/// bypass.
pub fn check_access(node: &FileNode, creds: &Credentials, want: AccessRequest) -> FsResult<()> {
    if want.read && !bit_granted(node, creds, (S_IRUSR, S_IRGRP, S_IROTH)) {
        return Err(FsError::PermissionDenied);
    }
    if want.write && !bit_granted(node, creds, (S_IWUSR, S_IWGRP, S_IWOTH)) {
        return Err(FsError::PermissionDenied);
    }
    if want.execute && !bit_granted(node, creds, (S_IXUSR, S_IXGRP, S_IXOTH)) {
        return Err(FsError::PermissionDenied);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with_mode(mode: u32, uid: u32, gid: u32) -> FileNode {
        let handle = FileNode::new_regular(9, mode, uid, gid);
        let node = handle.lock().unwrap().clone();
        node
    }

    #[test]
    fn test_owner_bits() {
        let node = node_with_mode(0o600, 1000, 1000);
        let owner = Credentials {
            uid: 1000,
            gid: 1000,
        };
        assert!(check_access(&node, &owner, AccessRequest::read()).is_ok());
        assert!(check_access(&node, &owner, AccessRequest::write()).is_ok());
        assert!(check_access(
            &node,
            &owner,
            AccessRequest {
                execute: true,
                ..Default::default()
            }
        )
        .is_err());
    }

    #[test]
    fn test_group_and_other_bits() {
        let node = node_with_mode(0o640, 1000, 2000);
        let group = Credentials {
            uid: 1001,
            gid: 2000,
        };
        assert!(check_access(&node, &group, AccessRequest::read()).is_ok());
        assert!(check_access(&node, &group, AccessRequest::write()).is_err());

        let other = Credentials {
            uid: 1001,
            gid: 2001,
        };
        assert!(check_access(&node, &other, AccessRequest::read()).is_err());
    }

    #[test]
    fn test_no_root_bypass() {
        let node = node_with_mode(0o600, 1000, 1000);
        let root = Credentials { uid: 0, gid: 0 };
        assert!(check_access(&node, &root, AccessRequest::read()).is_err());
    }

    #[test]
    fn test_requested_bits_are_anded() {
        // Read is granted, write is not: a read+write request must fail as
        // a whole.
        let node = node_with_mode(0o400, 1000, 1000);
        let owner = Credentials {
            uid: 1000,
            gid: 1000,
        };
        assert!(check_access(&node, &owner, AccessRequest::read()).is_ok());
        assert!(check_access(&node, &owner, AccessRequest::read_write()).is_err());
    }

    #[test]
    fn test_empty_request_always_passes() {
        let node = node_with_mode(0o000, 1000, 1000);
        let anyone = Credentials { uid: 5, gid: 5 };
        assert!(check_access(&node, &anyone, AccessRequest::from_amode(libc::F_OK)).is_ok());
    }
}
