//! Translators and their default plumbing.
//!
//! A translator is one node of the graph: a unit of filesystem behavior
//! receiving POSIX-shaped operations from its parents and forwarding work to
//! its children. Every operation has a default implementation that
//! tail-winds the call to the first child unmodified, so a translator that
//! has no opinion on an operation pays no per-call cost for it. A translator
//! that wants to observe a reply overrides the operation and winds with its
//! own callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{error, warn};
use parking_lot::{Mutex, RwLock};

use crate::errno::{Errno, OpResult};
use crate::fd::{Fd, FdRef};
use crate::fop::{Fop, Xdata};
use crate::inode::Inode;
use crate::options::Options;
use crate::stack::CallFrame;
use crate::types::{
    EntrylkCmd, EntrylkType, FlockSpec, Iatt, Loc, LockCmd, OpenFlags, SetattrValid, XattropOp,
};

pub mod notify;
pub mod scope;

pub use notify::Event;

/// Sink for events that reach the top of the graph with no parent left to
/// take them (the bridge to whatever mounted this graph).
pub type MasterSink = Arc<dyn Fn(&Event) + Send + Sync>;

/// State shared by every translator: its place in the graph, its options,
/// and its lifecycle flags.
pub struct XlatorBase {
    name: String,
    children: Vec<Arc<dyn Translator>>,
    parents: RwLock<Vec<Weak<dyn Translator>>>,
    options: Options,
    init_ok: AtomicBool,
    master: RwLock<Option<MasterSink>>,
    notify_lock: Mutex<()>,
}

impl std::fmt::Debug for XlatorBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XlatorBase")
            .field("name", &self.name)
            .field("children", &self.children.len())
            .finish()
    }
}

impl XlatorBase {
    /// Build with a name and children (graphs assemble leaves-first).
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn Translator>>) -> XlatorBase {
        XlatorBase::with_options(name, children, Options::new())
    }

    /// Build with options.
    pub fn with_options(
        name: impl Into<String>,
        children: Vec<Arc<dyn Translator>>,
        options: Options,
    ) -> XlatorBase {
        XlatorBase {
            name: name.into(),
            children,
            parents: RwLock::new(Vec::new()),
            options,
            init_ok: AtomicBool::new(false),
            master: RwLock::new(None),
            notify_lock: Mutex::new(()),
        }
    }

    /// The translator's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured options.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The children, in volume order.
    pub fn children(&self) -> &[Arc<dyn Translator>] {
        &self.children
    }

    /// First child, the default forwarding target.
    pub fn first_child(&self) -> Option<Arc<dyn Translator>> {
        self.children.first().cloned()
    }

    /// Parents whose graph edges point at this translator.
    pub fn parents(&self) -> Vec<Arc<dyn Translator>> {
        self.parents
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(crate) fn add_parent(&self, parent: Weak<dyn Translator>) {
        self.parents.write().push(parent);
    }

    /// Whether init has completed successfully.
    pub fn init_ok(&self) -> bool {
        self.init_ok.load(Ordering::SeqCst)
    }

    pub(crate) fn set_init_ok(&self, ok: bool) {
        self.init_ok.store(ok, Ordering::SeqCst);
    }

    pub(crate) fn master(&self) -> Option<MasterSink> {
        self.master.read().clone()
    }

    /// Register the graph master sink on this (top) translator.
    pub fn set_master(&self, sink: MasterSink) {
        *self.master.write() = Some(sink);
    }

    pub(crate) fn notify_lock(&self) -> &Mutex<()> {
        &self.notify_lock
    }
}

/// Forward `fop` to the first child on the caller's own frame, or fail the
/// call when this translator is a leaf that never implemented the operation.
pub fn default_fop(base: &XlatorBase, frame: &Arc<CallFrame>, fop: Fop) {
    match base.first_child() {
        Some(child) => frame.wind_tail(&child, fop),
        None => {
            error!(
                "{}: no child to forward {:?} to, failing the call",
                base.name(),
                fop.kind()
            );
            frame.unwind_err(Errno::ENOSYS);
        }
    }
}

/// One node of the translator graph.
///
/// Implementations override the operations they care about and inherit the
/// pass-through default for everything else. Overrides that wind with their
/// own callback receive the reply; overrides that queue a stub resume the
/// operation later from the same frame.
#[allow(unused_variables)]
pub trait Translator: Send + Sync {
    /// The shared translator state.
    fn base(&self) -> &XlatorBase;

    /// The translator's name.
    fn name(&self) -> &str {
        self.base().name()
    }

    /// One-time setup; children are initialised first. A translator whose
    /// init fails never receives events or operations.
    fn init(&self) -> OpResult<()> {
        Ok(())
    }

    /// Teardown, parents-first.
    fn fini(&self) {}

    /// Graph event delivery; the default propagates per the notify fabric
    /// rules. Overrides must continue propagation or absorb deliberately.
    fn notify(&self, event: &Event) {
        notify::default_notify(self.base(), event);
    }

    /// Destructor for this translator's inode-context slot; invoked when the
    /// table purges an inode that carried one.
    fn forget(&self, inode: &Inode, value1: u64, value2: u64) {}

    /// Destructor for this translator's fd-context slot on a file handle.
    fn release(&self, fd: &Fd) {}

    /// Destructor for this translator's fd-context slot on a directory
    /// handle.
    fn releasedir(&self, fd: &Fd) {}

    // --- name operations ---

    /// Resolve `(parent, name)` or a bare GFID to an inode.
    fn lookup(&self, frame: &Arc<CallFrame>, loc: Loc, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Lookup { loc, xdata });
    }

    /// Attributes by location.
    fn stat(&self, frame: &Arc<CallFrame>, loc: Loc, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Stat { loc, xdata });
    }

    /// Permission probe.
    fn access(&self, frame: &Arc<CallFrame>, loc: Loc, mask: i32, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Access { loc, mask, xdata });
    }

    /// Read a symlink target.
    fn readlink(&self, frame: &Arc<CallFrame>, loc: Loc, size: usize, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Readlink { loc, size, xdata });
    }

    // --- attribute operations ---

    /// Set attributes by location.
    fn setattr(
        &self,
        frame: &Arc<CallFrame>,
        loc: Loc,
        stat: Iatt,
        valid: SetattrValid,
        xdata: Xdata,
    ) {
        default_fop(self.base(), frame, Fop::Setattr { loc, stat, valid, xdata });
    }

    /// Set attributes by open handle.
    fn fsetattr(
        &self,
        frame: &Arc<CallFrame>,
        fd: FdRef,
        stat: Iatt,
        valid: SetattrValid,
        xdata: Xdata,
    ) {
        default_fop(self.base(), frame, Fop::Fsetattr { fd, stat, valid, xdata });
    }

    /// Truncate by location.
    fn truncate(&self, frame: &Arc<CallFrame>, loc: Loc, offset: u64, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Truncate { loc, offset, xdata });
    }

    /// Truncate by open handle.
    fn ftruncate(&self, frame: &Arc<CallFrame>, fd: FdRef, offset: u64, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Ftruncate { fd, offset, xdata });
    }

    // --- entry operations ---

    /// Create a device node, pipe or socket.
    fn mknod(
        &self,
        frame: &Arc<CallFrame>,
        loc: Loc,
        mode: u32,
        rdev: u64,
        umask: u32,
        xdata: Xdata,
    ) {
        default_fop(self.base(), frame, Fop::Mknod { loc, mode, rdev, umask, xdata });
    }

    /// Create a directory.
    fn mkdir(&self, frame: &Arc<CallFrame>, loc: Loc, mode: u32, umask: u32, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Mkdir { loc, mode, umask, xdata });
    }

    /// Remove an entry.
    fn unlink(&self, frame: &Arc<CallFrame>, loc: Loc, xflag: i32, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Unlink { loc, xflag, xdata });
    }

    /// Remove a directory.
    fn rmdir(&self, frame: &Arc<CallFrame>, loc: Loc, flags: i32, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Rmdir { loc, flags, xdata });
    }

    /// Create a symlink.
    fn symlink(
        &self,
        frame: &Arc<CallFrame>,
        linkpath: String,
        loc: Loc,
        umask: u32,
        xdata: Xdata,
    ) {
        default_fop(self.base(), frame, Fop::Symlink { linkpath, loc, umask, xdata });
    }

    /// Rename an entry.
    fn rename(&self, frame: &Arc<CallFrame>, oldloc: Loc, newloc: Loc, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Rename { oldloc, newloc, xdata });
    }

    /// Hard-link an entry.
    fn link(&self, frame: &Arc<CallFrame>, oldloc: Loc, newloc: Loc, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Link { oldloc, newloc, xdata });
    }

    /// Create and open a regular file.
    fn create(
        &self,
        frame: &Arc<CallFrame>,
        loc: Loc,
        flags: OpenFlags,
        mode: u32,
        umask: u32,
        fd: FdRef,
        xdata: Xdata,
    ) {
        default_fop(self.base(), frame, Fop::Create { loc, flags, mode, umask, fd, xdata });
    }

    // --- fd operations ---

    /// Open a file.
    fn open(&self, frame: &Arc<CallFrame>, loc: Loc, flags: OpenFlags, fd: FdRef, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Open { loc, flags, fd, xdata });
    }

    /// Open a directory.
    fn opendir(&self, frame: &Arc<CallFrame>, loc: Loc, fd: FdRef, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Opendir { loc, fd, xdata });
    }

    /// Flush dirty state for a handle.
    fn flush(&self, frame: &Arc<CallFrame>, fd: FdRef, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Flush { fd, xdata });
    }

    /// Sync file data.
    fn fsync(&self, frame: &Arc<CallFrame>, fd: FdRef, datasync: bool, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Fsync { fd, datasync, xdata });
    }

    /// Sync directory data.
    fn fsyncdir(&self, frame: &Arc<CallFrame>, fd: FdRef, datasync: bool, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Fsyncdir { fd, datasync, xdata });
    }

    /// Read from an open handle.
    fn readv(
        &self,
        frame: &Arc<CallFrame>,
        fd: FdRef,
        size: usize,
        offset: u64,
        flags: u32,
        xdata: Xdata,
    ) {
        default_fop(self.base(), frame, Fop::Readv { fd, size, offset, flags, xdata });
    }

    /// Write to an open handle.
    fn writev(
        &self,
        frame: &Arc<CallFrame>,
        fd: FdRef,
        payload: crate::iobuf::IoPayload,
        offset: u64,
        flags: u32,
        xdata: Xdata,
    ) {
        default_fop(self.base(), frame, Fop::Writev { fd, payload, offset, flags, xdata });
    }

    /// Preallocate a range.
    fn fallocate(
        &self,
        frame: &Arc<CallFrame>,
        fd: FdRef,
        keep_size: bool,
        offset: u64,
        len: u64,
        xdata: Xdata,
    ) {
        default_fop(self.base(), frame, Fop::Fallocate { fd, keep_size, offset, len, xdata });
    }

    /// Punch a hole in a range.
    fn discard(&self, frame: &Arc<CallFrame>, fd: FdRef, offset: u64, len: u64, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Discard { fd, offset, len, xdata });
    }

    /// Zero a range.
    fn zerofill(&self, frame: &Arc<CallFrame>, fd: FdRef, offset: u64, len: u64, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Zerofill { fd, offset, len, xdata });
    }

    // --- directory streams ---

    /// Read directory entries.
    fn readdir(&self, frame: &Arc<CallFrame>, fd: FdRef, size: usize, offset: u64, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Readdir { fd, size, offset, xdata });
    }

    /// Read directory entries with full attributes.
    fn readdirp(&self, frame: &Arc<CallFrame>, fd: FdRef, size: usize, offset: u64, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Readdirp { fd, size, offset, xdata });
    }

    // --- extended attributes ---

    /// Set extended attributes by location.
    fn setxattr(&self, frame: &Arc<CallFrame>, loc: Loc, dict: Options, flags: i32, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Setxattr { loc, dict, flags, xdata });
    }

    /// Get extended attributes by location; `None` fetches all.
    fn getxattr(&self, frame: &Arc<CallFrame>, loc: Loc, name: Option<String>, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Getxattr { loc, name, xdata });
    }

    /// Remove one extended attribute by location.
    fn removexattr(&self, frame: &Arc<CallFrame>, loc: Loc, name: String, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Removexattr { loc, name, xdata });
    }

    /// Set extended attributes by handle.
    fn fsetxattr(&self, frame: &Arc<CallFrame>, fd: FdRef, dict: Options, flags: i32, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Fsetxattr { fd, dict, flags, xdata });
    }

    /// Get extended attributes by handle.
    fn fgetxattr(&self, frame: &Arc<CallFrame>, fd: FdRef, name: Option<String>, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Fgetxattr { fd, name, xdata });
    }

    /// Remove one extended attribute by handle.
    fn fremovexattr(&self, frame: &Arc<CallFrame>, fd: FdRef, name: String, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Fremovexattr { fd, name, xdata });
    }

    /// Atomic transform of stored attribute counters by location.
    fn xattrop(&self, frame: &Arc<CallFrame>, loc: Loc, optype: XattropOp, dict: Options, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Xattrop { loc, optype, dict, xdata });
    }

    /// Atomic transform of stored attribute counters by handle.
    fn fxattrop(&self, frame: &Arc<CallFrame>, fd: FdRef, optype: XattropOp, dict: Options, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Fxattrop { fd, optype, dict, xdata });
    }

    // --- locks ---

    /// POSIX record lock on a handle.
    fn lk(&self, frame: &Arc<CallFrame>, fd: FdRef, cmd: LockCmd, lock: FlockSpec, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Lk { fd, cmd, lock, xdata });
    }

    /// Internal byte-range lock by location.
    fn inodelk(
        &self,
        frame: &Arc<CallFrame>,
        volume: String,
        loc: Loc,
        cmd: LockCmd,
        lock: FlockSpec,
        xdata: Xdata,
    ) {
        default_fop(self.base(), frame, Fop::Inodelk { volume, loc, cmd, lock, xdata });
    }

    /// Internal byte-range lock by handle.
    fn finodelk(
        &self,
        frame: &Arc<CallFrame>,
        volume: String,
        fd: FdRef,
        cmd: LockCmd,
        lock: FlockSpec,
        xdata: Xdata,
    ) {
        default_fop(self.base(), frame, Fop::Finodelk { volume, fd, cmd, lock, xdata });
    }

    /// Namespace entry lock by location.
    fn entrylk(
        &self,
        frame: &Arc<CallFrame>,
        volume: String,
        loc: Loc,
        basename: Option<String>,
        cmd: EntrylkCmd,
        typ: EntrylkType,
        xdata: Xdata,
    ) {
        default_fop(self.base(), frame, Fop::Entrylk { volume, loc, basename, cmd, typ, xdata });
    }

    /// Namespace entry lock by handle.
    fn fentrylk(
        &self,
        frame: &Arc<CallFrame>,
        volume: String,
        fd: FdRef,
        basename: Option<String>,
        cmd: EntrylkCmd,
        typ: EntrylkType,
        xdata: Xdata,
    ) {
        default_fop(self.base(), frame, Fop::Fentrylk { volume, fd, basename, cmd, typ, xdata });
    }

    // --- integrity, fs-wide, management ---

    /// Weak+strong checksum over a byte range.
    fn rchecksum(&self, frame: &Arc<CallFrame>, fd: FdRef, offset: u64, len: u32, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Rchecksum { fd, offset, len, xdata });
    }

    /// Filesystem-wide statistics.
    fn statfs(&self, frame: &Arc<CallFrame>, loc: Loc, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Statfs { loc, xdata });
    }

    /// Fetch a configuration specification by key.
    fn getspec(&self, frame: &Arc<CallFrame>, key: String, flags: i32, xdata: Xdata) {
        default_fop(self.base(), frame, Fop::Getspec { key, flags, xdata });
    }
}

/// Deliver `fop` to `xl` on `frame`, with the current-translator scope set
/// for the duration of the wind. This is the single entry every wind,
/// tail-wind and stub resume funnels through.
pub fn dispatch(xl: &Arc<dyn Translator>, frame: Arc<CallFrame>, fop: Fop) {
    let _scope = scope::enter(xl.name());
    match fop {
        Fop::Lookup { loc, xdata } => xl.lookup(&frame, loc, xdata),
        Fop::Stat { loc, xdata } => xl.stat(&frame, loc, xdata),
        Fop::Access { loc, mask, xdata } => xl.access(&frame, loc, mask, xdata),
        Fop::Readlink { loc, size, xdata } => xl.readlink(&frame, loc, size, xdata),
        Fop::Setattr { loc, stat, valid, xdata } => xl.setattr(&frame, loc, stat, valid, xdata),
        Fop::Fsetattr { fd, stat, valid, xdata } => xl.fsetattr(&frame, fd, stat, valid, xdata),
        Fop::Truncate { loc, offset, xdata } => xl.truncate(&frame, loc, offset, xdata),
        Fop::Ftruncate { fd, offset, xdata } => xl.ftruncate(&frame, fd, offset, xdata),
        Fop::Mknod { loc, mode, rdev, umask, xdata } => {
            xl.mknod(&frame, loc, mode, rdev, umask, xdata)
        }
        Fop::Mkdir { loc, mode, umask, xdata } => xl.mkdir(&frame, loc, mode, umask, xdata),
        Fop::Unlink { loc, xflag, xdata } => xl.unlink(&frame, loc, xflag, xdata),
        Fop::Rmdir { loc, flags, xdata } => xl.rmdir(&frame, loc, flags, xdata),
        Fop::Symlink { linkpath, loc, umask, xdata } => {
            xl.symlink(&frame, linkpath, loc, umask, xdata)
        }
        Fop::Rename { oldloc, newloc, xdata } => xl.rename(&frame, oldloc, newloc, xdata),
        Fop::Link { oldloc, newloc, xdata } => xl.link(&frame, oldloc, newloc, xdata),
        Fop::Create { loc, flags, mode, umask, fd, xdata } => {
            xl.create(&frame, loc, flags, mode, umask, fd, xdata)
        }
        Fop::Open { loc, flags, fd, xdata } => xl.open(&frame, loc, flags, fd, xdata),
        Fop::Opendir { loc, fd, xdata } => xl.opendir(&frame, loc, fd, xdata),
        Fop::Flush { fd, xdata } => xl.flush(&frame, fd, xdata),
        Fop::Fsync { fd, datasync, xdata } => xl.fsync(&frame, fd, datasync, xdata),
        Fop::Fsyncdir { fd, datasync, xdata } => xl.fsyncdir(&frame, fd, datasync, xdata),
        Fop::Readv { fd, size, offset, flags, xdata } => {
            xl.readv(&frame, fd, size, offset, flags, xdata)
        }
        Fop::Writev { fd, payload, offset, flags, xdata } => {
            xl.writev(&frame, fd, payload, offset, flags, xdata)
        }
        Fop::Fallocate { fd, keep_size, offset, len, xdata } => {
            xl.fallocate(&frame, fd, keep_size, offset, len, xdata)
        }
        Fop::Discard { fd, offset, len, xdata } => xl.discard(&frame, fd, offset, len, xdata),
        Fop::Zerofill { fd, offset, len, xdata } => xl.zerofill(&frame, fd, offset, len, xdata),
        Fop::Readdir { fd, size, offset, xdata } => xl.readdir(&frame, fd, size, offset, xdata),
        Fop::Readdirp { fd, size, offset, xdata } => xl.readdirp(&frame, fd, size, offset, xdata),
        Fop::Setxattr { loc, dict, flags, xdata } => xl.setxattr(&frame, loc, dict, flags, xdata),
        Fop::Getxattr { loc, name, xdata } => xl.getxattr(&frame, loc, name, xdata),
        Fop::Removexattr { loc, name, xdata } => xl.removexattr(&frame, loc, name, xdata),
        Fop::Fsetxattr { fd, dict, flags, xdata } => xl.fsetxattr(&frame, fd, dict, flags, xdata),
        Fop::Fgetxattr { fd, name, xdata } => xl.fgetxattr(&frame, fd, name, xdata),
        Fop::Fremovexattr { fd, name, xdata } => xl.fremovexattr(&frame, fd, name, xdata),
        Fop::Xattrop { loc, optype, dict, xdata } => xl.xattrop(&frame, loc, optype, dict, xdata),
        Fop::Fxattrop { fd, optype, dict, xdata } => xl.fxattrop(&frame, fd, optype, dict, xdata),
        Fop::Lk { fd, cmd, lock, xdata } => xl.lk(&frame, fd, cmd, lock, xdata),
        Fop::Inodelk { volume, loc, cmd, lock, xdata } => {
            xl.inodelk(&frame, volume, loc, cmd, lock, xdata)
        }
        Fop::Finodelk { volume, fd, cmd, lock, xdata } => {
            xl.finodelk(&frame, volume, fd, cmd, lock, xdata)
        }
        Fop::Entrylk { volume, loc, basename, cmd, typ, xdata } => {
            xl.entrylk(&frame, volume, loc, basename, cmd, typ, xdata)
        }
        Fop::Fentrylk { volume, fd, basename, cmd, typ, xdata } => {
            xl.fentrylk(&frame, volume, fd, basename, cmd, typ, xdata)
        }
        Fop::Rchecksum { fd, offset, len, xdata } => xl.rchecksum(&frame, fd, offset, len, xdata),
        Fop::Statfs { loc, xdata } => xl.statfs(&frame, loc, xdata),
        Fop::Getspec { key, flags, xdata } => xl.getspec(&frame, key, flags, xdata),
    }
}

/// An assembled translator graph: the top translator plus parent links and
/// lifecycle management for every node under it.
pub struct Graph {
    root: Arc<dyn Translator>,
    all: Vec<Arc<dyn Translator>>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("root", &self.root.name())
            .field("translators", &self.all.len())
            .finish()
    }
}

impl Graph {
    /// Wire parent links and collect every translator reachable from `root`,
    /// children before parents.
    pub fn assemble(root: Arc<dyn Translator>) -> Graph {
        let mut all = Vec::new();
        let mut seen: Vec<*const ()> = Vec::new();
        fn visit(
            xl: &Arc<dyn Translator>,
            all: &mut Vec<Arc<dyn Translator>>,
            seen: &mut Vec<*const ()>,
        ) {
            let key = Arc::as_ptr(xl) as *const ();
            if seen.contains(&key) {
                return;
            }
            seen.push(key);
            for child in xl.base().children() {
                child.base().add_parent(Arc::downgrade(xl));
                visit(child, all, seen);
            }
            all.push(xl.clone());
        }
        visit(&root, &mut all, &mut seen);
        Graph { root, all }
    }

    /// The top translator.
    pub fn root(&self) -> &Arc<dyn Translator> {
        &self.root
    }

    /// Every translator, children before parents.
    pub fn all(&self) -> &[Arc<dyn Translator>] {
        &self.all
    }

    /// Initialise children-first. A translator whose init fails is left
    /// un-activated and the failure propagates; already-initialised nodes
    /// stay up (the graph is unusable but torn down by drop order).
    pub fn init_all(&self) -> OpResult<()> {
        for xl in &self.all {
            match init_one(xl) {
                Ok(()) => xl.base().set_init_ok(true),
                Err(errno) => {
                    error!("{}: init failed: {}", xl.name(), errno);
                    return Err(errno);
                }
            }
        }
        Ok(())
    }

    /// Announce activation: `PARENT_UP` enters at the top and fans out
    /// downward through the default notify.
    pub fn start(&self) {
        self.root.notify(&Event::ParentUp);
    }

    /// Tear down, parents-first.
    pub fn fini_all(&self) {
        for xl in self.all.iter().rev() {
            if xl.base().init_ok() {
                xl.fini();
                xl.base().set_init_ok(false);
            }
        }
    }
}

fn init_one(xl: &Arc<dyn Translator>) -> OpResult<()> {
    if xl.base().init_ok() {
        warn!("{}: init called twice", xl.name());
        return Ok(());
    }
    xl.init()
}
