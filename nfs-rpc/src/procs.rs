//! NFS version 2 program and procedure numbers (RFC 1094).

pub const NFS_PROG: u32 = 100003;
pub const NFS_VER2: u32 = 2;

pub const NFSPROC_NULL: u32 = 0;
pub const NFSPROC_GETATTR: u32 = 1;
pub const NFSPROC_SETATTR: u32 = 2;
pub const NFSPROC_ROOT: u32 = 3;
pub const NFSPROC_LOOKUP: u32 = 4;
pub const NFSPROC_READLINK: u32 = 5;
pub const NFSPROC_READ: u32 = 6;
pub const NFSPROC_WRITECACHE: u32 = 7;
pub const NFSPROC_WRITE: u32 = 8;
pub const NFSPROC_CREATE: u32 = 9;
pub const NFSPROC_REMOVE: u32 = 10;
pub const NFSPROC_RENAME: u32 = 11;
pub const NFSPROC_LINK: u32 = 12;
pub const NFSPROC_SYMLINK: u32 = 13;
pub const NFSPROC_MKDIR: u32 = 14;
pub const NFSPROC_RMDIR: u32 = 15;
pub const NFSPROC_READDIR: u32 = 16;
pub const NFSPROC_STATFS: u32 = 17;

pub const NFS_NPROCS: u32 = 18;

/// Whether repeating the procedure is harmless.
///
/// Non-idempotent procedures get a longer initial timer on datagram mounts.
/// Unknown procedure numbers are treated as non-idempotent.
pub fn is_idempotent(procedure: u32) -> bool {
    matches!(
        procedure,
        NFSPROC_NULL
            | NFSPROC_GETATTR
            | NFSPROC_ROOT
            | NFSPROC_LOOKUP
            | NFSPROC_READLINK
            | NFSPROC_READ
            | NFSPROC_WRITECACHE
            | NFSPROC_READDIR
            | NFSPROC_STATFS
    )
}

pub fn name(procedure: u32) -> &'static str {
    match procedure {
        NFSPROC_NULL => "null",
        NFSPROC_GETATTR => "getattr",
        NFSPROC_SETATTR => "setattr",
        NFSPROC_ROOT => "root",
        NFSPROC_LOOKUP => "lookup",
        NFSPROC_READLINK => "readlink",
        NFSPROC_READ => "read",
        NFSPROC_WRITECACHE => "writecache",
        NFSPROC_WRITE => "write",
        NFSPROC_CREATE => "create",
        NFSPROC_REMOVE => "remove",
        NFSPROC_RENAME => "rename",
        NFSPROC_LINK => "link",
        NFSPROC_SYMLINK => "symlink",
        NFSPROC_MKDIR => "mkdir",
        NFSPROC_RMDIR => "rmdir",
        NFSPROC_READDIR => "readdir",
        NFSPROC_STATFS => "statfs",
        _ => "unknown",
    }
}
