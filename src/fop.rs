//! The filesystem operation vocabulary.
//!
//! Every operation a translator can route is described three ways here: its
//! kind ([`FopKind`], which doubles as the RPC procedure number), its request
//! shape (a [`Fop`] variant, which is also what a stub captures), and its
//! reply shape (a [`FopReply`] variant). Wind and unwind arity is fixed per
//! kind; an unwind whose reply kind does not match the wound kind is a
//! contract violation.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::errno::{Errno, OpResult};
use crate::fd::FdRef;
use crate::inode::InodeRef;
use crate::iobuf::IoPayload;
use crate::options::Options;
use crate::types::{
    DirEntry, EntrylkCmd, EntrylkType, FlockSpec, Iatt, Loc, LockCmd, OpenFlags, SetattrValid,
    Statfs, XattropOp,
};

/// Metadata dictionary riding along with a request or reply.
pub type Xdata = Option<Options>;

/// Operation kind; the numeric value is the RPC procedure number of the
/// filesystem program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum FopKind {
    Lookup = 1,
    Stat = 2,
    Access = 3,
    Readlink = 4,
    Setattr = 5,
    Fsetattr = 6,
    Truncate = 7,
    Ftruncate = 8,
    Mknod = 9,
    Mkdir = 10,
    Unlink = 11,
    Rmdir = 12,
    Symlink = 13,
    Rename = 14,
    Link = 15,
    Create = 16,
    Open = 17,
    Opendir = 18,
    Flush = 19,
    Fsync = 20,
    Fsyncdir = 21,
    Readv = 22,
    Writev = 23,
    Fallocate = 24,
    Discard = 25,
    Zerofill = 26,
    Readdir = 27,
    Readdirp = 28,
    Setxattr = 29,
    Getxattr = 30,
    Removexattr = 31,
    Fsetxattr = 32,
    Fgetxattr = 33,
    Fremovexattr = 34,
    Xattrop = 35,
    Fxattrop = 36,
    Lk = 37,
    Inodelk = 38,
    Finodelk = 39,
    Entrylk = 40,
    Fentrylk = 41,
    Rchecksum = 42,
    Statfs = 43,
    Getspec = 44,
}

/// Successful `lookup` result.
#[derive(Clone, Debug)]
pub struct EntryOk {
    /// The resolved inode.
    pub inode: InodeRef,
    /// Its attributes.
    pub stat: Iatt,
    /// Parent attributes after the operation.
    pub postparent: Iatt,
}

/// Successful entry-creating result (`mknod`/`mkdir`/`symlink`/`link`).
#[derive(Clone, Debug)]
pub struct NewEntryOk {
    /// The created or linked inode.
    pub inode: InodeRef,
    /// Its attributes.
    pub stat: Iatt,
    /// Parent attributes before.
    pub preparent: Iatt,
    /// Parent attributes after.
    pub postparent: Iatt,
}

/// Successful `create` result.
#[derive(Clone, Debug)]
pub struct CreateOk {
    /// The open handle.
    pub fd: FdRef,
    /// The created inode.
    pub inode: InodeRef,
    /// Its attributes.
    pub stat: Iatt,
    /// Parent attributes before.
    pub preparent: Iatt,
    /// Parent attributes after.
    pub postparent: Iatt,
}

/// Before/after attribute pair for data-modifying operations.
#[derive(Clone, Debug, Default)]
pub struct PrePostOk {
    /// Attributes before.
    pub pre: Iatt,
    /// Attributes after.
    pub post: Iatt,
}

/// Parent before/after pair for entry-removing operations.
#[derive(Clone, Debug, Default)]
pub struct ParentPairOk {
    /// Parent attributes before.
    pub preparent: Iatt,
    /// Parent attributes after.
    pub postparent: Iatt,
}

/// Successful `rename` result.
#[derive(Clone, Debug)]
pub struct RenameOk {
    /// Attributes of the renamed object.
    pub stat: Iatt,
    /// Old parent before.
    pub preoldparent: Iatt,
    /// Old parent after.
    pub postoldparent: Iatt,
    /// New parent before.
    pub prenewparent: Iatt,
    /// New parent after.
    pub postnewparent: Iatt,
}

/// Successful `readv` result.
#[derive(Clone, Debug)]
pub struct ReadvOk {
    /// The data, with the buffer references keeping it alive.
    pub payload: IoPayload,
    /// File attributes after the read.
    pub stat: Iatt,
}

/// Successful `rchecksum` result.
#[derive(Clone, Debug)]
pub struct RchecksumOk {
    /// Weak (rolling) checksum over the range.
    pub weak: u32,
    /// Strong checksum over the range.
    pub strong: Vec<u8>,
}

/// A filesystem operation request: the arguments a wind carries. A stub
/// captures exactly this (ownership moves into the stub) and a resume
/// redispatches it unchanged.
#[derive(Debug)]
#[allow(missing_docs)]
pub enum Fop {
    Lookup { loc: Loc, xdata: Xdata },
    Stat { loc: Loc, xdata: Xdata },
    Access { loc: Loc, mask: i32, xdata: Xdata },
    Readlink { loc: Loc, size: usize, xdata: Xdata },
    Setattr { loc: Loc, stat: Iatt, valid: SetattrValid, xdata: Xdata },
    Fsetattr { fd: FdRef, stat: Iatt, valid: SetattrValid, xdata: Xdata },
    Truncate { loc: Loc, offset: u64, xdata: Xdata },
    Ftruncate { fd: FdRef, offset: u64, xdata: Xdata },
    Mknod { loc: Loc, mode: u32, rdev: u64, umask: u32, xdata: Xdata },
    Mkdir { loc: Loc, mode: u32, umask: u32, xdata: Xdata },
    Unlink { loc: Loc, xflag: i32, xdata: Xdata },
    Rmdir { loc: Loc, flags: i32, xdata: Xdata },
    Symlink { linkpath: String, loc: Loc, umask: u32, xdata: Xdata },
    Rename { oldloc: Loc, newloc: Loc, xdata: Xdata },
    Link { oldloc: Loc, newloc: Loc, xdata: Xdata },
    Create { loc: Loc, flags: OpenFlags, mode: u32, umask: u32, fd: FdRef, xdata: Xdata },
    Open { loc: Loc, flags: OpenFlags, fd: FdRef, xdata: Xdata },
    Opendir { loc: Loc, fd: FdRef, xdata: Xdata },
    Flush { fd: FdRef, xdata: Xdata },
    Fsync { fd: FdRef, datasync: bool, xdata: Xdata },
    Fsyncdir { fd: FdRef, datasync: bool, xdata: Xdata },
    Readv { fd: FdRef, size: usize, offset: u64, flags: u32, xdata: Xdata },
    Writev { fd: FdRef, payload: IoPayload, offset: u64, flags: u32, xdata: Xdata },
    Fallocate { fd: FdRef, keep_size: bool, offset: u64, len: u64, xdata: Xdata },
    Discard { fd: FdRef, offset: u64, len: u64, xdata: Xdata },
    Zerofill { fd: FdRef, offset: u64, len: u64, xdata: Xdata },
    Readdir { fd: FdRef, size: usize, offset: u64, xdata: Xdata },
    Readdirp { fd: FdRef, size: usize, offset: u64, xdata: Xdata },
    Setxattr { loc: Loc, dict: Options, flags: i32, xdata: Xdata },
    Getxattr { loc: Loc, name: Option<String>, xdata: Xdata },
    Removexattr { loc: Loc, name: String, xdata: Xdata },
    Fsetxattr { fd: FdRef, dict: Options, flags: i32, xdata: Xdata },
    Fgetxattr { fd: FdRef, name: Option<String>, xdata: Xdata },
    Fremovexattr { fd: FdRef, name: String, xdata: Xdata },
    Xattrop { loc: Loc, optype: XattropOp, dict: Options, xdata: Xdata },
    Fxattrop { fd: FdRef, optype: XattropOp, dict: Options, xdata: Xdata },
    Lk { fd: FdRef, cmd: LockCmd, lock: FlockSpec, xdata: Xdata },
    Inodelk { volume: String, loc: Loc, cmd: LockCmd, lock: FlockSpec, xdata: Xdata },
    Finodelk { volume: String, fd: FdRef, cmd: LockCmd, lock: FlockSpec, xdata: Xdata },
    Entrylk { volume: String, loc: Loc, basename: Option<String>, cmd: EntrylkCmd, typ: EntrylkType, xdata: Xdata },
    Fentrylk { volume: String, fd: FdRef, basename: Option<String>, cmd: EntrylkCmd, typ: EntrylkType, xdata: Xdata },
    Rchecksum { fd: FdRef, offset: u64, len: u32, xdata: Xdata },
    Statfs { loc: Loc, xdata: Xdata },
    Getspec { key: String, flags: i32, xdata: Xdata },
}

impl Fop {
    /// The operation kind of this request.
    pub fn kind(&self) -> FopKind {
        match self {
            Fop::Lookup { .. } => FopKind::Lookup,
            Fop::Stat { .. } => FopKind::Stat,
            Fop::Access { .. } => FopKind::Access,
            Fop::Readlink { .. } => FopKind::Readlink,
            Fop::Setattr { .. } => FopKind::Setattr,
            Fop::Fsetattr { .. } => FopKind::Fsetattr,
            Fop::Truncate { .. } => FopKind::Truncate,
            Fop::Ftruncate { .. } => FopKind::Ftruncate,
            Fop::Mknod { .. } => FopKind::Mknod,
            Fop::Mkdir { .. } => FopKind::Mkdir,
            Fop::Unlink { .. } => FopKind::Unlink,
            Fop::Rmdir { .. } => FopKind::Rmdir,
            Fop::Symlink { .. } => FopKind::Symlink,
            Fop::Rename { .. } => FopKind::Rename,
            Fop::Link { .. } => FopKind::Link,
            Fop::Create { .. } => FopKind::Create,
            Fop::Open { .. } => FopKind::Open,
            Fop::Opendir { .. } => FopKind::Opendir,
            Fop::Flush { .. } => FopKind::Flush,
            Fop::Fsync { .. } => FopKind::Fsync,
            Fop::Fsyncdir { .. } => FopKind::Fsyncdir,
            Fop::Readv { .. } => FopKind::Readv,
            Fop::Writev { .. } => FopKind::Writev,
            Fop::Fallocate { .. } => FopKind::Fallocate,
            Fop::Discard { .. } => FopKind::Discard,
            Fop::Zerofill { .. } => FopKind::Zerofill,
            Fop::Readdir { .. } => FopKind::Readdir,
            Fop::Readdirp { .. } => FopKind::Readdirp,
            Fop::Setxattr { .. } => FopKind::Setxattr,
            Fop::Getxattr { .. } => FopKind::Getxattr,
            Fop::Removexattr { .. } => FopKind::Removexattr,
            Fop::Fsetxattr { .. } => FopKind::Fsetxattr,
            Fop::Fgetxattr { .. } => FopKind::Fgetxattr,
            Fop::Fremovexattr { .. } => FopKind::Fremovexattr,
            Fop::Xattrop { .. } => FopKind::Xattrop,
            Fop::Fxattrop { .. } => FopKind::Fxattrop,
            Fop::Lk { .. } => FopKind::Lk,
            Fop::Inodelk { .. } => FopKind::Inodelk,
            Fop::Finodelk { .. } => FopKind::Finodelk,
            Fop::Entrylk { .. } => FopKind::Entrylk,
            Fop::Fentrylk { .. } => FopKind::Fentrylk,
            Fop::Rchecksum { .. } => FopKind::Rchecksum,
            Fop::Statfs { .. } => FopKind::Statfs,
            Fop::Getspec { .. } => FopKind::Getspec,
        }
    }
}

/// A filesystem operation reply: the values an unwind carries. Failure is a
/// POSIX errno; the optional reply dictionary is delivered either way.
#[derive(Debug)]
#[allow(missing_docs)]
pub enum FopReply {
    Lookup { op: OpResult<EntryOk>, xdata: Xdata },
    Stat { op: OpResult<Iatt>, xdata: Xdata },
    Access { op: OpResult<()>, xdata: Xdata },
    Readlink { op: OpResult<(String, Iatt)>, xdata: Xdata },
    Setattr { op: OpResult<PrePostOk>, xdata: Xdata },
    Fsetattr { op: OpResult<PrePostOk>, xdata: Xdata },
    Truncate { op: OpResult<PrePostOk>, xdata: Xdata },
    Ftruncate { op: OpResult<PrePostOk>, xdata: Xdata },
    Mknod { op: OpResult<NewEntryOk>, xdata: Xdata },
    Mkdir { op: OpResult<NewEntryOk>, xdata: Xdata },
    Unlink { op: OpResult<ParentPairOk>, xdata: Xdata },
    Rmdir { op: OpResult<ParentPairOk>, xdata: Xdata },
    Symlink { op: OpResult<NewEntryOk>, xdata: Xdata },
    Rename { op: OpResult<RenameOk>, xdata: Xdata },
    Link { op: OpResult<NewEntryOk>, xdata: Xdata },
    Create { op: OpResult<CreateOk>, xdata: Xdata },
    Open { op: OpResult<FdRef>, xdata: Xdata },
    Opendir { op: OpResult<FdRef>, xdata: Xdata },
    Flush { op: OpResult<()>, xdata: Xdata },
    Fsync { op: OpResult<PrePostOk>, xdata: Xdata },
    Fsyncdir { op: OpResult<()>, xdata: Xdata },
    Readv { op: OpResult<ReadvOk>, xdata: Xdata },
    Writev { op: OpResult<PrePostOk>, xdata: Xdata },
    Fallocate { op: OpResult<PrePostOk>, xdata: Xdata },
    Discard { op: OpResult<PrePostOk>, xdata: Xdata },
    Zerofill { op: OpResult<PrePostOk>, xdata: Xdata },
    Readdir { op: OpResult<Vec<DirEntry>>, xdata: Xdata },
    Readdirp { op: OpResult<Vec<DirEntry>>, xdata: Xdata },
    Setxattr { op: OpResult<()>, xdata: Xdata },
    Getxattr { op: OpResult<Options>, xdata: Xdata },
    Removexattr { op: OpResult<()>, xdata: Xdata },
    Fsetxattr { op: OpResult<()>, xdata: Xdata },
    Fgetxattr { op: OpResult<Options>, xdata: Xdata },
    Fremovexattr { op: OpResult<()>, xdata: Xdata },
    Xattrop { op: OpResult<Options>, xdata: Xdata },
    Fxattrop { op: OpResult<Options>, xdata: Xdata },
    Lk { op: OpResult<FlockSpec>, xdata: Xdata },
    Inodelk { op: OpResult<()>, xdata: Xdata },
    Finodelk { op: OpResult<()>, xdata: Xdata },
    Entrylk { op: OpResult<()>, xdata: Xdata },
    Fentrylk { op: OpResult<()>, xdata: Xdata },
    Rchecksum { op: OpResult<RchecksumOk>, xdata: Xdata },
    Statfs { op: OpResult<Statfs>, xdata: Xdata },
    Getspec { op: OpResult<String>, xdata: Xdata },
}

impl FopReply {
    /// The operation kind this reply answers.
    pub fn kind(&self) -> FopKind {
        match self {
            FopReply::Lookup { .. } => FopKind::Lookup,
            FopReply::Stat { .. } => FopKind::Stat,
            FopReply::Access { .. } => FopKind::Access,
            FopReply::Readlink { .. } => FopKind::Readlink,
            FopReply::Setattr { .. } => FopKind::Setattr,
            FopReply::Fsetattr { .. } => FopKind::Fsetattr,
            FopReply::Truncate { .. } => FopKind::Truncate,
            FopReply::Ftruncate { .. } => FopKind::Ftruncate,
            FopReply::Mknod { .. } => FopKind::Mknod,
            FopReply::Mkdir { .. } => FopKind::Mkdir,
            FopReply::Unlink { .. } => FopKind::Unlink,
            FopReply::Rmdir { .. } => FopKind::Rmdir,
            FopReply::Symlink { .. } => FopKind::Symlink,
            FopReply::Rename { .. } => FopKind::Rename,
            FopReply::Link { .. } => FopKind::Link,
            FopReply::Create { .. } => FopKind::Create,
            FopReply::Open { .. } => FopKind::Open,
            FopReply::Opendir { .. } => FopKind::Opendir,
            FopReply::Flush { .. } => FopKind::Flush,
            FopReply::Fsync { .. } => FopKind::Fsync,
            FopReply::Fsyncdir { .. } => FopKind::Fsyncdir,
            FopReply::Readv { .. } => FopKind::Readv,
            FopReply::Writev { .. } => FopKind::Writev,
            FopReply::Fallocate { .. } => FopKind::Fallocate,
            FopReply::Discard { .. } => FopKind::Discard,
            FopReply::Zerofill { .. } => FopKind::Zerofill,
            FopReply::Readdir { .. } => FopKind::Readdir,
            FopReply::Readdirp { .. } => FopKind::Readdirp,
            FopReply::Setxattr { .. } => FopKind::Setxattr,
            FopReply::Getxattr { .. } => FopKind::Getxattr,
            FopReply::Removexattr { .. } => FopKind::Removexattr,
            FopReply::Fsetxattr { .. } => FopKind::Fsetxattr,
            FopReply::Fgetxattr { .. } => FopKind::Fgetxattr,
            FopReply::Fremovexattr { .. } => FopKind::Fremovexattr,
            FopReply::Xattrop { .. } => FopKind::Xattrop,
            FopReply::Fxattrop { .. } => FopKind::Fxattrop,
            FopReply::Lk { .. } => FopKind::Lk,
            FopReply::Inodelk { .. } => FopKind::Inodelk,
            FopReply::Finodelk { .. } => FopKind::Finodelk,
            FopReply::Entrylk { .. } => FopKind::Entrylk,
            FopReply::Fentrylk { .. } => FopKind::Fentrylk,
            FopReply::Rchecksum { .. } => FopKind::Rchecksum,
            FopReply::Statfs { .. } => FopKind::Statfs,
            FopReply::Getspec { .. } => FopKind::Getspec,
        }
    }

    /// Whether the reply carries a failure.
    pub fn is_err(&self) -> bool {
        self.errno().is_some()
    }

    /// The errno of a failed reply, `None` on success.
    pub fn errno(&self) -> Option<Errno> {
        macro_rules! err_of {
            ($op:expr) => {
                $op.as_ref().err().copied()
            };
        }
        match self {
            FopReply::Lookup { op, .. } => err_of!(op),
            FopReply::Stat { op, .. } => err_of!(op),
            FopReply::Access { op, .. } => err_of!(op),
            FopReply::Readlink { op, .. } => err_of!(op),
            FopReply::Setattr { op, .. } => err_of!(op),
            FopReply::Fsetattr { op, .. } => err_of!(op),
            FopReply::Truncate { op, .. } => err_of!(op),
            FopReply::Ftruncate { op, .. } => err_of!(op),
            FopReply::Mknod { op, .. } => err_of!(op),
            FopReply::Mkdir { op, .. } => err_of!(op),
            FopReply::Unlink { op, .. } => err_of!(op),
            FopReply::Rmdir { op, .. } => err_of!(op),
            FopReply::Symlink { op, .. } => err_of!(op),
            FopReply::Rename { op, .. } => err_of!(op),
            FopReply::Link { op, .. } => err_of!(op),
            FopReply::Create { op, .. } => err_of!(op),
            FopReply::Open { op, .. } => err_of!(op),
            FopReply::Opendir { op, .. } => err_of!(op),
            FopReply::Flush { op, .. } => err_of!(op),
            FopReply::Fsync { op, .. } => err_of!(op),
            FopReply::Fsyncdir { op, .. } => err_of!(op),
            FopReply::Readv { op, .. } => err_of!(op),
            FopReply::Writev { op, .. } => err_of!(op),
            FopReply::Fallocate { op, .. } => err_of!(op),
            FopReply::Discard { op, .. } => err_of!(op),
            FopReply::Zerofill { op, .. } => err_of!(op),
            FopReply::Readdir { op, .. } => err_of!(op),
            FopReply::Readdirp { op, .. } => err_of!(op),
            FopReply::Setxattr { op, .. } => err_of!(op),
            FopReply::Getxattr { op, .. } => err_of!(op),
            FopReply::Removexattr { op, .. } => err_of!(op),
            FopReply::Fsetxattr { op, .. } => err_of!(op),
            FopReply::Fgetxattr { op, .. } => err_of!(op),
            FopReply::Fremovexattr { op, .. } => err_of!(op),
            FopReply::Xattrop { op, .. } => err_of!(op),
            FopReply::Fxattrop { op, .. } => err_of!(op),
            FopReply::Lk { op, .. } => err_of!(op),
            FopReply::Inodelk { op, .. } => err_of!(op),
            FopReply::Finodelk { op, .. } => err_of!(op),
            FopReply::Entrylk { op, .. } => err_of!(op),
            FopReply::Fentrylk { op, .. } => err_of!(op),
            FopReply::Rchecksum { op, .. } => err_of!(op),
            FopReply::Statfs { op, .. } => err_of!(op),
            FopReply::Getspec { op, .. } => err_of!(op),
        }
    }

    /// Construct a failure reply of the right shape for `kind`. This is how
    /// bailouts, transport errors and allocation failures unwind a call
    /// whose real reply never arrived.
    pub fn error_for(kind: FopKind, errno: Errno) -> FopReply {
        match kind {
            FopKind::Lookup => FopReply::Lookup { op: Err(errno), xdata: None },
            FopKind::Stat => FopReply::Stat { op: Err(errno), xdata: None },
            FopKind::Access => FopReply::Access { op: Err(errno), xdata: None },
            FopKind::Readlink => FopReply::Readlink { op: Err(errno), xdata: None },
            FopKind::Setattr => FopReply::Setattr { op: Err(errno), xdata: None },
            FopKind::Fsetattr => FopReply::Fsetattr { op: Err(errno), xdata: None },
            FopKind::Truncate => FopReply::Truncate { op: Err(errno), xdata: None },
            FopKind::Ftruncate => FopReply::Ftruncate { op: Err(errno), xdata: None },
            FopKind::Mknod => FopReply::Mknod { op: Err(errno), xdata: None },
            FopKind::Mkdir => FopReply::Mkdir { op: Err(errno), xdata: None },
            FopKind::Unlink => FopReply::Unlink { op: Err(errno), xdata: None },
            FopKind::Rmdir => FopReply::Rmdir { op: Err(errno), xdata: None },
            FopKind::Symlink => FopReply::Symlink { op: Err(errno), xdata: None },
            FopKind::Rename => FopReply::Rename { op: Err(errno), xdata: None },
            FopKind::Link => FopReply::Link { op: Err(errno), xdata: None },
            FopKind::Create => FopReply::Create { op: Err(errno), xdata: None },
            FopKind::Open => FopReply::Open { op: Err(errno), xdata: None },
            FopKind::Opendir => FopReply::Opendir { op: Err(errno), xdata: None },
            FopKind::Flush => FopReply::Flush { op: Err(errno), xdata: None },
            FopKind::Fsync => FopReply::Fsync { op: Err(errno), xdata: None },
            FopKind::Fsyncdir => FopReply::Fsyncdir { op: Err(errno), xdata: None },
            FopKind::Readv => FopReply::Readv { op: Err(errno), xdata: None },
            FopKind::Writev => FopReply::Writev { op: Err(errno), xdata: None },
            FopKind::Fallocate => FopReply::Fallocate { op: Err(errno), xdata: None },
            FopKind::Discard => FopReply::Discard { op: Err(errno), xdata: None },
            FopKind::Zerofill => FopReply::Zerofill { op: Err(errno), xdata: None },
            FopKind::Readdir => FopReply::Readdir { op: Err(errno), xdata: None },
            FopKind::Readdirp => FopReply::Readdirp { op: Err(errno), xdata: None },
            FopKind::Setxattr => FopReply::Setxattr { op: Err(errno), xdata: None },
            FopKind::Getxattr => FopReply::Getxattr { op: Err(errno), xdata: None },
            FopKind::Removexattr => FopReply::Removexattr { op: Err(errno), xdata: None },
            FopKind::Fsetxattr => FopReply::Fsetxattr { op: Err(errno), xdata: None },
            FopKind::Fgetxattr => FopReply::Fgetxattr { op: Err(errno), xdata: None },
            FopKind::Fremovexattr => FopReply::Fremovexattr { op: Err(errno), xdata: None },
            FopKind::Xattrop => FopReply::Xattrop { op: Err(errno), xdata: None },
            FopKind::Fxattrop => FopReply::Fxattrop { op: Err(errno), xdata: None },
            FopKind::Lk => FopReply::Lk { op: Err(errno), xdata: None },
            FopKind::Inodelk => FopReply::Inodelk { op: Err(errno), xdata: None },
            FopKind::Finodelk => FopReply::Finodelk { op: Err(errno), xdata: None },
            FopKind::Entrylk => FopReply::Entrylk { op: Err(errno), xdata: None },
            FopKind::Fentrylk => FopReply::Fentrylk { op: Err(errno), xdata: None },
            FopKind::Rchecksum => FopReply::Rchecksum { op: Err(errno), xdata: None },
            FopKind::Statfs => FopReply::Statfs { op: Err(errno), xdata: None },
            FopKind::Getspec => FopReply::Getspec { op: Err(errno), xdata: None },
        }
    }
}
