//! Open-file handles.
//!
//! An fd references an inode, remembers who opened it and how, and carries
//! per-translator context slots shaped like the inode's. Anonymous fds serve
//! core-internal operations that have no user session. When the last
//! reference drops, each translator that stored context is given its
//! `release`/`releasedir` hook before the handle disappears from the inode.

use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::inode::{Inode, InodeRef};
use crate::types::{IaType, OpenFlags};
use crate::xlator::Translator;

/// Pid recorded on anonymous handles.
pub const ANONYMOUS_PID: i32 = -1;

struct FdCtxSlot {
    key: usize,
    xl: Weak<dyn Translator>,
    value1: Option<u64>,
    value2: Option<u64>,
}

/// An open-file handle.
pub struct Fd {
    inode: InodeRef,
    pid: i32,
    flags: OpenFlags,
    anonymous: bool,
    ctx: Mutex<SmallVec<[FdCtxSlot; 2]>>,
}

impl std::fmt::Debug for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fd")
            .field("gfid", &self.inode.gfid())
            .field("pid", &self.pid)
            .field("anonymous", &self.anonymous)
            .finish()
    }
}

impl Fd {
    /// The inode this handle is open on.
    pub fn inode(&self) -> &InodeRef {
        &self.inode
    }

    /// Pid of the opener; [`ANONYMOUS_PID`] for anonymous handles.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Access flags the handle was opened with.
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Whether this is a core-internal handle with no user session.
    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    fn ctx_key(xl: &Arc<dyn Translator>) -> usize {
        Arc::as_ptr(xl) as *const () as usize
    }

    /// Store both context words for `xl`.
    pub fn ctx_set2(&self, xl: &Arc<dyn Translator>, value1: Option<u64>, value2: Option<u64>) {
        let key = Fd::ctx_key(xl);
        let mut slots = self.ctx.lock();
        match slots.iter_mut().find(|s| s.key == key) {
            Some(slot) => {
                if value1.is_some() {
                    slot.value1 = value1;
                }
                if value2.is_some() {
                    slot.value2 = value2;
                }
            }
            None => slots.push(FdCtxSlot {
                key,
                xl: Arc::downgrade(xl),
                value1,
                value2,
            }),
        }
    }

    /// Store the first context word for `xl`.
    pub fn ctx_set(&self, xl: &Arc<dyn Translator>, value: u64) {
        self.ctx_set2(xl, Some(value), None);
    }

    /// Both context words for `xl`.
    pub fn ctx_get2(&self, xl: &Arc<dyn Translator>) -> (Option<u64>, Option<u64>) {
        let key = Fd::ctx_key(xl);
        let slots = self.ctx.lock();
        match slots.iter().find(|s| s.key == key) {
            Some(slot) => (slot.value1, slot.value2),
            None => (None, None),
        }
    }

    /// First context word for `xl`.
    pub fn ctx_get(&self, xl: &Arc<dyn Translator>) -> Option<u64> {
        self.ctx_get2(xl).0
    }

    /// Delete `xl`'s slot, returning its words.
    pub fn ctx_del(&self, xl: &Arc<dyn Translator>) -> (Option<u64>, Option<u64>) {
        let key = Fd::ctx_key(xl);
        let mut slots = self.ctx.lock();
        match slots.iter().position(|s| s.key == key) {
            Some(at) => {
                let slot = slots.remove(at);
                (slot.value1, slot.value2)
            }
            None => (None, None),
        }
    }
}

/// A counted reference to an open-file handle. The last drop detaches the
/// handle from its inode and runs the translator release hooks.
pub struct FdRef {
    fd: Arc<Fd>,
}

impl std::fmt::Debug for FdRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fd.fmt(f)
    }
}

impl Clone for FdRef {
    fn clone(&self) -> FdRef {
        FdRef { fd: self.fd.clone() }
    }
}

impl std::ops::Deref for FdRef {
    type Target = Fd;

    fn deref(&self) -> &Fd {
        &self.fd
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        // runs exactly once, when the final reference lets go
        self.inode.prune_fds();
        let slots = std::mem::take(&mut *self.ctx.lock());
        let dir = self.inode.ia_type() == IaType::Directory;
        for slot in slots {
            if slot.value1.is_none() && slot.value2.is_none() {
                continue;
            }
            match slot.xl.upgrade() {
                Some(xl) => {
                    if dir {
                        xl.releasedir(self);
                    } else {
                        xl.release(self);
                    }
                }
                None => debug!("fd ctx owner died before release on {}", self.inode.gfid()),
            }
        }
    }
}

impl FdRef {
    /// Create a handle for `(inode, flags, pid)` and attach it to the inode.
    pub fn open(inode: InodeRef, flags: OpenFlags, pid: i32) -> FdRef {
        FdRef::build(inode, flags, pid, false)
    }

    /// Create an anonymous handle for core-internal operations.
    pub fn anonymous(inode: InodeRef) -> FdRef {
        FdRef::build(inode, OpenFlags::RDWR, ANONYMOUS_PID, true)
    }

    fn build(inode: InodeRef, flags: OpenFlags, pid: i32, anonymous: bool) -> FdRef {
        let fd = Arc::new(Fd {
            inode,
            pid,
            flags,
            anonymous,
            ctx: Mutex::new(SmallVec::new()),
        });
        fd.inode.attach_fd(&fd);
        FdRef { fd }
    }

    /// The shared handle.
    pub fn fd(&self) -> &Arc<Fd> {
        &self.fd
    }
}

/// Find an open handle on `inode` owned by `pid`.
pub fn fd_lookup(inode: &Inode, pid: i32) -> Option<FdRef> {
    inode.fd_lookup(pid).map(|fd| FdRef { fd })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfid::Gfid;
    use crate::inode::InodeTable;
    use crate::types::Iatt;
    use crate::xlator::XlatorBase;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ReleaseCounter {
        base: XlatorBase,
        releases: AtomicUsize,
    }

    impl ReleaseCounter {
        fn new() -> Arc<ReleaseCounter> {
            Arc::new(ReleaseCounter {
                base: XlatorBase::new("io-cache", vec![]),
                releases: AtomicUsize::new(0),
            })
        }
    }

    impl Translator for ReleaseCounter {
        fn base(&self) -> &XlatorBase {
            &self.base
        }

        fn release(&self, _fd: &Fd) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn some_file(table: &Arc<InodeTable>) -> InodeRef {
        let root = table.root();
        let inode = table.new_inode();
        let stat = Iatt {
            gfid: Gfid::random(),
            ia_type: crate::types::IaType::Regular,
            ..Iatt::default()
        };
        table.link(&inode, Some(&root), Some("f"), &stat).unwrap()
    }

    #[test]
    fn last_unref_runs_release() {
        let owner = ReleaseCounter::new();
        let owner_dyn: Arc<dyn Translator> = owner.clone();
        let table = InodeTable::new("t", 0);
        let inode = some_file(&table);

        let fd = FdRef::open(inode.clone(), OpenFlags::RDWR, 100);
        fd.ctx_set(&owner_dyn, 5);
        assert_eq!(inode.fd_count(), 1);

        let second = fd.clone();
        drop(fd);
        assert_eq!(owner.releases.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(owner.releases.load(Ordering::SeqCst), 1);
        assert_eq!(inode.fd_count(), 0);
    }

    #[test]
    fn anonymous_fd_lifecycle() {
        let table = InodeTable::new("t", 0);
        let inode = some_file(&table);

        let anon = FdRef::anonymous(inode.clone());
        assert!(anon.is_anonymous());
        assert_eq!(anon.pid(), ANONYMOUS_PID);
        assert_eq!(inode.fd_count(), 1);
        drop(anon);
        assert_eq!(inode.fd_count(), 0);
    }

    #[test]
    fn lookup_by_pid() {
        let table = InodeTable::new("t", 0);
        let inode = some_file(&table);

        let fd_a = FdRef::open(inode.clone(), OpenFlags::RDWR, 100);
        let _fd_b = FdRef::open(inode.clone(), OpenFlags::WRONLY, 200);

        let found = fd_lookup(&inode, 100).unwrap();
        assert_eq!(found.pid(), 100);
        assert!(Arc::ptr_eq(found.fd(), fd_a.fd()));
        assert!(fd_lookup(&inode, 300).is_none());
    }
}
