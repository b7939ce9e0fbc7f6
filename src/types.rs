//! Common filesystem value types carried by operations.

use std::time::SystemTime;

use bitflags::bitflags;

use crate::gfid::Gfid;
use crate::inode::InodeRef;

/// Kind of a filesystem object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum IaType {
    /// Type not yet known (unlinked inode).
    #[default]
    Invalid,
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Block device node.
    BlockDevice,
    /// Character device node.
    CharDevice,
    /// Named pipe.
    Fifo,
    /// Unix domain socket.
    Socket,
}

impl IaType {
    /// Derive the type from a `st_mode`-style mode word.
    pub fn from_mode(mode: u32) -> IaType {
        match mode & libc::S_IFMT {
            libc::S_IFREG => IaType::Regular,
            libc::S_IFDIR => IaType::Directory,
            libc::S_IFLNK => IaType::Symlink,
            libc::S_IFBLK => IaType::BlockDevice,
            libc::S_IFCHR => IaType::CharDevice,
            libc::S_IFIFO => IaType::Fifo,
            libc::S_IFSOCK => IaType::Socket,
            _ => IaType::Invalid,
        }
    }
}

/// Attributes of a filesystem object, the shape every stat-like reply uses.
#[derive(Clone, Debug, Default)]
pub struct Iatt {
    /// Identifier of the object these attributes describe.
    pub gfid: Gfid,
    /// Object kind.
    pub ia_type: IaType,
    /// Device-local inode number, if the backing store exposes one.
    pub ino: u64,
    /// Permission bits (no type bits).
    pub prot: u32,
    /// Hard link count.
    pub nlink: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Device number for device nodes.
    pub rdev: u64,
    /// Size in bytes.
    pub size: u64,
    /// Block size used for allocation accounting.
    pub blksize: u32,
    /// Allocated 512-byte blocks.
    pub blocks: u64,
    /// Last access time.
    pub atime: Option<SystemTime>,
    /// Last modification time.
    pub mtime: Option<SystemTime>,
    /// Last status change time.
    pub ctime: Option<SystemTime>,
}

impl Iatt {
    /// Attributes for a freshly fabricated directory (synthetic entries).
    pub fn synthetic_dir(gfid: Gfid) -> Iatt {
        Iatt {
            gfid,
            ia_type: IaType::Directory,
            prot: 0o755,
            nlink: 2,
            blksize: 4096,
            ..Iatt::default()
        }
    }
}

bitflags! {
    /// Which fields of a `setattr` request are valid.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SetattrValid: u32 {
        /// Set permission bits.
        const MODE = 1 << 0;
        /// Set owner.
        const UID = 1 << 1;
        /// Set group.
        const GID = 1 << 2;
        /// Set size.
        const SIZE = 1 << 3;
        /// Set access time.
        const ATIME = 1 << 4;
        /// Set modification time.
        const MTIME = 1 << 5;
    }
}

bitflags! {
    /// Open flags carried by `open`/`create`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: i32 {
        /// Open write-only.
        const WRONLY = libc::O_WRONLY;
        /// Open read-write.
        const RDWR = libc::O_RDWR;
        /// Append on every write.
        const APPEND = libc::O_APPEND;
        /// Create if missing.
        const CREAT = libc::O_CREAT;
        /// Truncate on open.
        const TRUNC = libc::O_TRUNC;
        /// Fail if it already exists.
        const EXCL = libc::O_EXCL;
        /// Bypass the page cache.
        const DIRECT = libc::O_DIRECT;
    }
}

/// Location of an object in the namespace, as carried by path-based
/// operations. Either `(parent, name)` or a bare `gfid` must identify the
/// target; nameless locations are how by-GFID access reaches the graph.
#[derive(Clone, Debug, Default)]
pub struct Loc {
    /// Parent directory, when resolved.
    pub parent: Option<InodeRef>,
    /// Entry name under `parent`.
    pub name: Option<String>,
    /// The object itself, when already in the cache.
    pub inode: Option<InodeRef>,
    /// Identifier of the object, null until known.
    pub gfid: Gfid,
    /// Identifier of the parent, null for nameless locations.
    pub pargfid: Gfid,
}

impl Loc {
    /// A nameless location reaching an object purely by GFID.
    pub fn from_gfid(gfid: Gfid) -> Loc {
        Loc {
            gfid,
            ..Loc::default()
        }
    }

    /// A `(parent, name)` location.
    pub fn child_of(parent: InodeRef, name: impl Into<String>) -> Loc {
        let pargfid = parent.gfid();
        Loc {
            parent: Some(parent),
            name: Some(name.into()),
            pargfid,
            ..Loc::default()
        }
    }
}

/// One directory entry, as returned by `readdir`/`readdirp`.
#[derive(Clone, Debug)]
pub struct DirEntry {
    /// Inode number within the directory stream.
    pub ino: u64,
    /// Offset cookie for resuming the stream after this entry.
    pub off: u64,
    /// Entry kind.
    pub ia_type: IaType,
    /// Entry name.
    pub name: String,
    /// Full attributes, populated by `readdirp` only.
    pub stat: Option<Iatt>,
}

/// Filesystem-wide statistics (`statfs`).
#[derive(Clone, Debug, Default)]
pub struct Statfs {
    /// Fundamental block size.
    pub bsize: u64,
    /// Fragment size.
    pub frsize: u64,
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Free blocks for unprivileged users.
    pub bavail: u64,
    /// Total file slots.
    pub files: u64,
    /// Free file slots.
    pub ffree: u64,
    /// Maximum name length.
    pub namemax: u64,
}

/// Record-lock type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockType {
    /// Shared (read) lock.
    Read,
    /// Exclusive (write) lock.
    Write,
    /// Release.
    Unlock,
}

/// Record-lock command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockCmd {
    /// Probe whether the lock could be taken.
    GetLk,
    /// Take or release without blocking.
    SetLk,
    /// Take or release, queueing until granted.
    SetLkWait,
}

/// A byte-range lock request or grant.
#[derive(Clone, Debug)]
pub struct FlockSpec {
    /// Lock type.
    pub typ: LockType,
    /// Start offset.
    pub start: u64,
    /// Length; zero means to end of file.
    pub len: u64,
    /// Process owning the lock.
    pub pid: i32,
    /// Lock-owner cookie of the requester.
    pub lk_owner: u64,
}

/// Entry-lock command for namespace locking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntrylkCmd {
    /// Take or release without blocking.
    Lock,
    /// Take or release, queueing until granted.
    LockNb,
    /// Release.
    Unlock,
}

/// Entry-lock type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntrylkType {
    /// Shared.
    Rdlck,
    /// Exclusive.
    Wrlck,
}

/// Transform applied by `xattrop`/`fxattrop` to the stored value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XattropOp {
    /// Element-wise wrapping add of 32-bit counters.
    Add32,
    /// Element-wise wrapping add of 64-bit counters.
    Add64,
}
