//! The inode table: a GFID-indexed directory cache.
//!
//! Inodes are created without identity, acquire one when linked with a GFID,
//! and from then on are reachable both by GFID and by `(parent, name)`
//! dentry. Reference counting drives three lifecycle lists: `active` (in use
//! by some call), `lru` (linked, idle, bounded by `lru_limit`) and `purge`
//! (scheduled for teardown). Per-translator context slots ride on each inode
//! and are torn down through the owning translator's `forget` hook when the
//! table finally lets the inode go.
//!
//! Lock order: the table lock nests outside per-inode state; eviction work
//! (forget hooks, slot destructors) always runs after the table lock is
//! dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, Weak};

use log::{debug, error, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::errno::{Errno, OpResult};
use crate::fd::Fd;
use crate::gfid::Gfid;
use crate::types::{IaType, Iatt};
use crate::xlator::Translator;

/// One name under one parent, aliasing an inode. Dentries own neither
/// endpoint; the table owns both inodes and tears down in table order.
#[derive(Clone)]
struct Dentry {
    parent: Weak<Inode>,
    parent_gfid: Gfid,
    name: Box<str>,
}

/// A per-translator context slot: up to two words plus the revalidation bit.
struct InodeCtxSlot {
    key: usize,
    xl: Weak<dyn Translator>,
    value1: Option<u64>,
    value2: Option<u64>,
    need_lookup: bool,
}

/// In-core representation of one filesystem object.
pub struct Inode {
    table: Weak<InodeTable>,
    id: u64,
    ident: OnceLock<(Gfid, IaType)>,
    nlookup: Mutex<u64>,
    refs: Mutex<u32>,
    fds: Mutex<Vec<Weak<Fd>>>,
    dentries: Mutex<SmallVec<[Dentry; 2]>>,
    ctx: Mutex<SmallVec<[InodeCtxSlot; 4]>>,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("gfid", &self.gfid())
            .field("type", &self.ia_type())
            .field("refs", &*self.refs.lock())
            .finish()
    }
}

impl Inode {
    /// The identity, null until linked.
    pub fn gfid(&self) -> Gfid {
        self.ident.get().map(|(g, _)| *g).unwrap_or(Gfid::NULL)
    }

    /// The object kind, `Invalid` until linked.
    pub fn ia_type(&self) -> IaType {
        self.ident.get().map(|(_, t)| *t).unwrap_or(IaType::Invalid)
    }

    /// Whether the inode has been linked with an identity.
    pub fn is_linked(&self) -> bool {
        self.ident.get().is_some()
    }

    /// Whether this inode lives in `table`.
    pub fn belongs_to(&self, table: &Arc<InodeTable>) -> bool {
        std::ptr::eq(self.table.as_ptr(), Arc::as_ptr(table))
    }

    /// Kernel lookup balance, separate from the reference count.
    pub fn nlookup(&self) -> u64 {
        *self.nlookup.lock()
    }

    /// Record `count` more kernel lookups.
    pub fn lookup_inc(&self, count: u64) {
        *self.nlookup.lock() += count;
    }

    /// Forget `count` kernel lookups; saturates at zero.
    pub fn forget(&self, count: u64) {
        let mut nlookup = self.nlookup.lock();
        *nlookup = nlookup.saturating_sub(count);
    }

    /// Open handles on this inode.
    pub fn fd_count(&self) -> usize {
        self.fds.lock().iter().filter(|fd| fd.strong_count() > 0).count()
    }

    pub(crate) fn attach_fd(&self, fd: &Arc<Fd>) {
        let mut fds = self.fds.lock();
        fds.retain(|w| w.strong_count() > 0);
        fds.push(Arc::downgrade(fd));
    }

    pub(crate) fn prune_fds(&self) {
        self.fds.lock().retain(|w| w.strong_count() > 0);
    }

    /// Any open handle on this inode owned by `pid`, as caching layers use
    /// to find a peer handle for an anonymous operation.
    pub fn fd_lookup(&self, pid: i32) -> Option<Arc<Fd>> {
        self.fds
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|fd| fd.pid() == pid)
    }

    fn ctx_key(xl: &Arc<dyn Translator>) -> usize {
        Arc::as_ptr(xl) as *const () as usize
    }

    /// Store both context words for `xl`, allocating the slot on first use.
    pub fn ctx_set2(&self, xl: &Arc<dyn Translator>, value1: Option<u64>, value2: Option<u64>) {
        let key = Inode::ctx_key(xl);
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
            None => slots.push(InodeCtxSlot {
                key,
                xl: Arc::downgrade(xl),
                value1,
                value2,
                need_lookup: false,
            }),
        }
    }

    /// Store the first context word for `xl`.
    pub fn ctx_set(&self, xl: &Arc<dyn Translator>, value: u64) {
        self.ctx_set2(xl, Some(value), None);
    }

    /// Both context words for `xl`.
    pub fn ctx_get2(&self, xl: &Arc<dyn Translator>) -> (Option<u64>, Option<u64>) {
        let key = Inode::ctx_key(xl);
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
        let key = Inode::ctx_key(xl);
        let mut slots = self.ctx.lock();
        match slots.iter().position(|s| s.key == key) {
            Some(at) => {
                let slot = slots.remove(at);
                (slot.value1, slot.value2)
            }
            None => (None, None),
        }
    }

    /// Clear `xl`'s words without removing the slot.
    pub fn ctx_reset(&self, xl: &Arc<dyn Translator>) -> (Option<u64>, Option<u64>) {
        let key = Inode::ctx_key(xl);
        let mut slots = self.ctx.lock();
        match slots.iter_mut().find(|s| s.key == key) {
            Some(slot) => (slot.value1.take(), slot.value2.take()),
            None => (None, None),
        }
    }

    /// Ask the next lookup through `xl` to revalidate this inode.
    pub fn set_need_lookup(&self, xl: &Arc<dyn Translator>) {
        let key = Inode::ctx_key(xl);
        let mut slots = self.ctx.lock();
        match slots.iter_mut().find(|s| s.key == key) {
            Some(slot) => slot.need_lookup = true,
            None => slots.push(InodeCtxSlot {
                key,
                xl: Arc::downgrade(xl),
                value1: None,
                value2: None,
                need_lookup: true,
            }),
        }
    }

    /// Test-and-clear the revalidation request for `xl`.
    pub fn needs_lookup(&self, xl: &Arc<dyn Translator>) -> bool {
        let key = Inode::ctx_key(xl);
        let mut slots = self.ctx.lock();
        match slots.iter_mut().find(|s| s.key == key) {
            Some(slot) => std::mem::take(&mut slot.need_lookup),
            None => false,
        }
    }

    /// Whether any dentry aliases this inode.
    pub fn has_dentry(&self) -> bool {
        !self.dentries.lock().is_empty()
    }

    /// The `(parent_gfid, name)` pairs aliasing this inode.
    pub fn dentry_names(&self) -> Vec<(Gfid, String)> {
        self.dentries
            .lock()
            .iter()
            .map(|d| (d.parent_gfid, d.name.to_string()))
            .collect()
    }

    /// Reconstruct an absolute path by walking dentries upward; inodes
    /// reachable only by GFID yield the canonical `<gfid:...>` form.
    pub fn path(&self, name: Option<&str>) -> String {
        let mut segments: Vec<String> = Vec::new();
        if let Some(name) = name {
            segments.push(name.to_owned());
        }

        let mut gfid = self.gfid();
        let mut cursor: Option<(Weak<Inode>, Gfid, Box<str>)> = self
            .dentries
            .lock()
            .first()
            .map(|d| (d.parent.clone(), d.parent_gfid, d.name.clone()));

        while let Some((parent, parent_gfid, dname)) = cursor {
            segments.push(dname.to_string());
            match parent.upgrade() {
                Some(parent) => {
                    gfid = parent.gfid();
                    if gfid == Gfid::ROOT {
                        let mut path = String::new();
                        for seg in segments.iter().rev() {
                            path.push('/');
                            path.push_str(seg);
                        }
                        return path;
                    }
                    cursor = parent
                        .dentries
                        .lock()
                        .first()
                        .map(|d| (d.parent.clone(), d.parent_gfid, d.name.clone()));
                }
                None => {
                    gfid = parent_gfid;
                    cursor = None;
                }
            }
        }

        if gfid == Gfid::ROOT && segments.is_empty() {
            return "/".to_owned();
        }
        let mut path = format!("<gfid:{gfid}>");
        for seg in segments.iter().rev() {
            path.push('/');
            path.push_str(seg);
        }
        path
    }

    fn take_ctx_slots(&self) -> SmallVec<[InodeCtxSlot; 4]> {
        std::mem::take(&mut *self.ctx.lock())
    }
}

/// A counted reference to an inode. Cloning takes another table reference;
/// dropping releases it, which may move the inode onto the LRU and trigger
/// eviction.
pub struct InodeRef {
    inode: Arc<Inode>,
}

impl std::fmt::Debug for InodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inode.fmt(f)
    }
}

impl InodeRef {
    fn from_counted(inode: Arc<Inode>) -> InodeRef {
        InodeRef { inode }
    }

    /// The underlying inode.
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }
}

impl std::ops::Deref for InodeRef {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.inode
    }
}

impl Clone for InodeRef {
    fn clone(&self) -> InodeRef {
        if let Some(table) = self.inode.table.upgrade() {
            table.ref_inc(&self.inode);
        }
        InodeRef {
            inode: self.inode.clone(),
        }
    }
}

impl Drop for InodeRef {
    fn drop(&mut self) {
        if let Some(table) = self.inode.table.upgrade() {
            table.ref_dec(&self.inode);
        }
    }
}

struct TableInner {
    by_gfid: HashMap<Gfid, Arc<Inode>>,
    by_name: HashMap<(Gfid, Box<str>), Arc<Inode>>,
    active: HashMap<u64, Arc<Inode>>,
    lru: BTreeMap<u64, Arc<Inode>>,
    lru_keys: HashMap<u64, u64>,
    purge: Vec<Arc<Inode>>,
    lru_seq: u64,
    next_id: u64,
    lru_limit: u32,
}

impl TableInner {
    fn lru_insert(&mut self, inode: Arc<Inode>) {
        self.lru_seq += 1;
        let seq = self.lru_seq;
        self.lru_keys.insert(inode.id, seq);
        self.lru.insert(seq, inode);
    }

    fn lru_remove(&mut self, inode: &Arc<Inode>) -> bool {
        match self.lru_keys.remove(&inode.id) {
            Some(seq) => self.lru.remove(&seq).is_some(),
            None => false,
        }
    }

    fn detach_for_purge(&mut self, inode: &Arc<Inode>) {
        if inode.is_linked() {
            self.by_gfid.remove(&inode.gfid());
        }
        let dentries = std::mem::take(&mut *inode.dentries.lock());
        for dentry in dentries {
            self.by_name.remove(&(dentry.parent_gfid, dentry.name));
        }
    }

    /// Evict over-limit LRU inodes onto the purge list; the caller drains
    /// purge after dropping the table lock.
    fn shrink_lru(&mut self) {
        if self.lru_limit == 0 {
            return;
        }
        while self.lru.len() > self.lru_limit as usize {
            let Some((&seq, _)) = self.lru.iter().next() else {
                break;
            };
            let Some(victim) = self.lru.remove(&seq) else {
                break;
            };
            self.lru_keys.remove(&victim.id);
            debug!("evicting inode {} from lru", victim.gfid());
            self.detach_for_purge(&victim);
            self.purge.push(victim);
        }
    }
}

/// The GFID-indexed inode cache.
pub struct InodeTable {
    name: String,
    inner: Mutex<TableInner>,
    root: OnceLock<Arc<Inode>>,
    self_ref: OnceLock<Weak<InodeTable>>,
}

impl std::fmt::Debug for InodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InodeTable")
            .field("name", &self.name)
            .field("active", &inner.active.len())
            .field("lru", &inner.lru.len())
            .finish()
    }
}

impl InodeTable {
    /// Build a table with the given LRU bound (`0` disables eviction) and
    /// link its root directory inode.
    pub fn new(name: impl Into<String>, lru_limit: u32) -> Arc<InodeTable> {
        let table = Arc::new(InodeTable {
            name: name.into(),
            inner: Mutex::new(TableInner {
                by_gfid: HashMap::new(),
                by_name: HashMap::new(),
                active: HashMap::new(),
                lru: BTreeMap::new(),
                lru_keys: HashMap::new(),
                purge: Vec::new(),
                lru_seq: 0,
                next_id: 1,
                lru_limit,
            }),
            root: OnceLock::new(),
            self_ref: OnceLock::new(),
        });
        let _ = table.self_ref.set(Arc::downgrade(&table));

        let root = {
            let mut inner = table.inner.lock();
            let root = Arc::new(Inode {
                table: Arc::downgrade(&table),
                id: inner.next_id,
                ident: OnceLock::new(),
                nlookup: Mutex::new(0),
                refs: Mutex::new(1),
                fds: Mutex::new(Vec::new()),
                dentries: Mutex::new(SmallVec::new()),
                ctx: Mutex::new(SmallVec::new()),
            });
            inner.next_id += 1;
            let _ = root.ident.set((Gfid::ROOT, IaType::Directory));
            inner.by_gfid.insert(Gfid::ROOT, root.clone());
            inner.active.insert(root.id, root.clone());
            root
        };
        let _ = table.root.set(root);
        table
    }

    /// The table's name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The root directory inode.
    pub fn root(&self) -> InodeRef {
        // set in new(); the expect documents the construction invariant
        let root = self.root.get().expect("root inode is created with the table");
        self.ref_inc(root);
        InodeRef::from_counted(root.clone())
    }

    /// Change the LRU bound and evict immediately if the cache is over it.
    pub fn set_lru_limit(&self, lru_limit: u32) {
        let purge = {
            let mut inner = self.inner.lock();
            inner.lru_limit = lru_limit;
            inner.shrink_lru();
            std::mem::take(&mut inner.purge)
        };
        self.destroy_batch(purge);
    }

    fn weak_self(&self) -> Weak<InodeTable> {
        self.self_ref.get().cloned().unwrap_or_default()
    }

    /// Allocate an identity-less inode with one reference.
    pub fn new_inode(&self) -> InodeRef {
        let mut inner = self.inner.lock();
        let inode = Arc::new(Inode {
            table: self.weak_self(),
            id: inner.next_id,
            ident: OnceLock::new(),
            nlookup: Mutex::new(0),
            refs: Mutex::new(1),
            fds: Mutex::new(Vec::new()),
            dentries: Mutex::new(SmallVec::new()),
            ctx: Mutex::new(SmallVec::new()),
        });
        inner.next_id += 1;
        inner.active.insert(inode.id, inode.clone());
        InodeRef::from_counted(inode)
    }

    /// Find a linked inode by GFID, taking a reference.
    pub fn find(&self, gfid: Gfid) -> Option<InodeRef> {
        let inode = {
            let inner = self.inner.lock();
            inner.by_gfid.get(&gfid).cloned()
        }?;
        self.ref_inc(&inode);
        Some(InodeRef::from_counted(inode))
    }

    /// The lookup fast path: resolve `(parent, name)` from the dentry cache,
    /// taking a reference on a hit.
    pub fn grep(&self, parent: &Inode, name: &str) -> Option<InodeRef> {
        let inode = {
            let inner = self.inner.lock();
            inner
                .by_name
                .get(&(parent.gfid(), Box::from(name)))
                .cloned()
        }?;
        self.ref_inc(&inode);
        Some(InodeRef::from_counted(inode))
    }

    /// Like [`grep`](InodeTable::grep) but yields only the identity, without
    /// referencing the inode.
    pub fn grep_for_gfid(
        &self,
        parent: &Inode,
        name: &str,
    ) -> Option<(Gfid, IaType)> {
        let inner = self.inner.lock();
        inner
            .by_name
            .get(&(parent.gfid(), Box::from(name)))
            .map(|inode| (inode.gfid(), inode.ia_type()))
    }

    /// Link `inode` with the identity carried by `stat`, attaching a dentry
    /// under `(parent, name)` when given.
    ///
    /// If an inode with the same GFID already exists the two merge: the
    /// existing one wins, context slots move over (never duplicated), and
    /// the returned reference names the survivor. The operation either fully
    /// succeeds or leaves the table untouched.
    pub fn link(
        &self,
        inode: &InodeRef,
        parent: Option<&InodeRef>,
        name: Option<&str>,
        stat: &Iatt,
    ) -> OpResult<InodeRef> {
        if stat.gfid.is_null() {
            warn!("{}: refusing to link inode without identity", self.name);
            return Err(Errno::EINVAL);
        }
        if let (Some(parent), Some(name)) = (parent, name) {
            if parent.ia_type() != IaType::Directory {
                return Err(Errno::ENOTDIR);
            }
            if name.is_empty() || name.contains('/') {
                return Err(Errno::EINVAL);
            }
        }

        let (linked, moved_ctx, displaced) = {
            let mut inner = self.inner.lock();

            let existing = inner.by_gfid.get(&stat.gfid).cloned();
            let (target, moved_ctx) = match existing {
                Some(existing) => {
                    let moved = !Arc::ptr_eq(&existing, &inode.inode);
                    (existing, moved)
                }
                None => {
                    if inode.ident.set((stat.gfid, stat.ia_type)).is_err()
                        && inode.gfid() != stat.gfid
                    {
                        error!(
                            "{}: inode {} relinked with different gfid {}",
                            self.name,
                            inode.gfid(),
                            stat.gfid
                        );
                        return Err(Errno::EINVAL);
                    }
                    inner.by_gfid.insert(stat.gfid, inode.inode.clone());
                    (inode.inode.clone(), false)
                }
            };

            let mut displaced = None;
            if let (Some(parent), Some(name)) = (parent, name) {
                let key = (parent.gfid(), Box::<str>::from(name));
                let already = target.dentries.lock().iter().any(|d| {
                    d.parent_gfid == key.0 && d.name.as_ref() == name
                });
                if !already {
                    if target.ia_type() == IaType::Directory && target.has_dentry() {
                        error!(
                            "{}: directory {} would acquire a second dentry {}/{}",
                            self.name,
                            target.gfid(),
                            parent.gfid(),
                            name
                        );
                        return Err(Errno::EINVAL);
                    }
                    if let Some(old) = inner.by_name.insert(key.clone(), target.clone()) {
                        if !Arc::ptr_eq(&old, &target) {
                            old.dentries
                                .lock()
                                .retain(|d| !(d.parent_gfid == key.0 && d.name == key.1));
                            displaced = Some(old);
                        }
                    }
                    target.dentries.lock().push(Dentry {
                        parent: Arc::downgrade(parent.inode()),
                        parent_gfid: parent.gfid(),
                        name: Box::from(name),
                    });
                }
            }

            // take the survivor's reference while still under the lock
            *target.refs.lock() += 1;
            if let Some(seq) = inner.lru_keys.remove(&target.id) {
                inner.lru.remove(&seq);
                inner.active.insert(target.id, target.clone());
            }
            (target, moved_ctx, displaced)
        };

        if moved_ctx {
            // the stale duplicate loses its slots to the survivor
            for slot in inode.take_ctx_slots() {
                let mut slots = linked.ctx.lock();
                if !slots.iter().any(|s| s.key == slot.key) {
                    slots.push(slot);
                }
            }
        }
        drop(displaced);

        Ok(InodeRef::from_counted(linked))
    }

    /// Remove the dentry `(parent, name)`. Removing a name that is not
    /// cached is a no-op.
    pub fn unlink(&self, parent: &InodeRef, name: &str) {
        let mut inner = self.inner.lock();
        let key = (parent.gfid(), Box::<str>::from(name));
        if let Some(child) = inner.by_name.remove(&key) {
            child
                .dentries
                .lock()
                .retain(|d| !(d.parent_gfid == key.0 && d.name == key.1));
        }
    }

    /// Atomically rewrite `(olddir, oldname)` to `(newdir, newname)` for
    /// `inode`. Any existing dentry at the destination is unlinked first;
    /// the single-dentry rule for directories is re-checked before anything
    /// changes.
    pub fn rename(
        &self,
        olddir: &InodeRef,
        oldname: &str,
        newdir: &InodeRef,
        newname: &str,
        inode: &InodeRef,
    ) -> OpResult<()> {
        if newdir.ia_type() != IaType::Directory {
            return Err(Errno::ENOTDIR);
        }
        let mut inner = self.inner.lock();

        let old_key = (olddir.gfid(), Box::<str>::from(oldname));
        let new_key = (newdir.gfid(), Box::<str>::from(newname));

        if let Some(old) = inner.by_name.remove(&new_key) {
            old.dentries
                .lock()
                .retain(|d| !(d.parent_gfid == new_key.0 && d.name == new_key.1));
        }
        if let Some(child) = inner.by_name.remove(&old_key) {
            child
                .dentries
                .lock()
                .retain(|d| !(d.parent_gfid == old_key.0 && d.name == old_key.1));
        }

        inner.by_name.insert(new_key.clone(), inode.inode.clone());
        inode.dentries.lock().push(Dentry {
            parent: Arc::downgrade(newdir.inode()),
            parent_gfid: new_key.0,
            name: new_key.1,
        });
        Ok(())
    }

    /// Number of inodes currently referenced by calls.
    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Number of idle inodes held in the cache.
    pub fn lru_count(&self) -> usize {
        self.inner.lock().lru.len()
    }

    fn ref_inc(&self, inode: &Arc<Inode>) {
        let mut inner = self.inner.lock();
        let mut refs = inode.refs.lock();
        *refs += 1;
        if *refs == 1 {
            // zero-to-ref transition: back from the cold cache
            inner.lru_remove(inode);
            inner.active.insert(inode.id, inode.clone());
        }
    }

    fn ref_dec(&self, inode: &Arc<Inode>) {
        let purge = {
            let mut inner = self.inner.lock();
            let mut refs = inode.refs.lock();
            if *refs == 0 {
                error!("{}: unref of unreferenced inode {}", self.name, inode.gfid());
                debug_assert!(false, "inode reference underflow");
                return;
            }
            *refs -= 1;
            if *refs > 0 {
                return;
            }
            drop(refs);

            inner.active.remove(&inode.id);
            if inode.is_linked() {
                inner.lru_insert(inode.clone());
                inner.shrink_lru();
            } else {
                // never acquired identity; nothing can find it again
                inner.detach_for_purge(inode);
                inner.purge.push(inode.clone());
            }
            std::mem::take(&mut inner.purge)
        };
        self.destroy_batch(purge);
    }

    /// Run slot destructors and drop the final table references for a batch
    /// of purged inodes. Never called with the table lock held.
    fn destroy_batch(&self, purge: Vec<Arc<Inode>>) {
        for inode in purge {
            for slot in inode.take_ctx_slots() {
                if slot.value1.is_none() && slot.value2.is_none() {
                    continue;
                }
                match slot.xl.upgrade() {
                    Some(xl) => xl.forget(
                        &inode,
                        slot.value1.unwrap_or(0),
                        slot.value2.unwrap_or(0),
                    ),
                    None => debug!(
                        "{}: translator of a ctx slot died before inode {}",
                        self.name,
                        inode.gfid()
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xlator::XlatorBase;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CtxOwner {
        base: XlatorBase,
        forgets: AtomicUsize,
    }

    impl CtxOwner {
        fn new(name: &str) -> Arc<CtxOwner> {
            Arc::new(CtxOwner {
                base: XlatorBase::new(name, vec![]),
                forgets: AtomicUsize::new(0),
            })
        }
    }

    impl Translator for CtxOwner {
        fn base(&self) -> &XlatorBase {
            &self.base
        }

        fn forget(&self, _inode: &Inode, _value1: u64, _value2: u64) {
            self.forgets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn linked_child(table: &Arc<InodeTable>, name: &str) -> InodeRef {
        let root = table.root();
        let inode = table.new_inode();
        let stat = Iatt {
            gfid: Gfid::random(),
            ia_type: IaType::Regular,
            ..Iatt::default()
        };
        table.link(&inode, Some(&root), Some(name), &stat).unwrap()
    }

    #[test]
    fn grep_miss_then_hit() {
        let table = InodeTable::new("t", 0);
        let root = table.root();
        assert!(table.grep(&root, "a").is_none());

        let linked = linked_child(&table, "a");
        let hit = table.grep(&root, "a").unwrap();
        assert_eq!(hit.gfid(), linked.gfid());
        assert!(Arc::ptr_eq(hit.inode(), linked.inode()));
    }

    #[test]
    fn ref_unref_is_identity_on_table_state() {
        let table = InodeTable::new("t", 16);
        let linked = linked_child(&table, "a");
        let gfid = linked.gfid();

        let active_before = table.active_count();
        let lru_before = table.lru_count();
        {
            let extra = linked.clone();
            assert_eq!(extra.gfid(), gfid);
        }
        assert_eq!(table.active_count(), active_before);
        assert_eq!(table.lru_count(), lru_before);
    }

    #[test]
    fn linked_inode_findable_by_gfid() {
        let table = InodeTable::new("t", 0);
        let linked = linked_child(&table, "a");
        let gfid = linked.gfid();
        assert!(!gfid.is_null());
        let found = table.find(gfid).unwrap();
        assert!(Arc::ptr_eq(found.inode(), linked.inode()));
    }

    #[test]
    fn ref_zero_moves_to_lru_and_back() {
        let table = InodeTable::new("t", 16);
        let linked = linked_child(&table, "a");
        let gfid = linked.gfid();

        drop(linked);
        assert_eq!(table.lru_count(), 1);

        let revived = table.find(gfid).unwrap();
        assert_eq!(table.lru_count(), 0);
        assert!(table.active_count() >= 1);
        drop(revived);
        assert_eq!(table.lru_count(), 1);
    }

    #[test]
    fn lru_eviction_runs_forget_once() {
        let owner = CtxOwner::new("cache");
        let owner_dyn: Arc<dyn Translator> = owner.clone();
        let table = InodeTable::new("t", 2);

        let a = linked_child(&table, "a");
        a.ctx_set(&owner_dyn, 7);
        let b = linked_child(&table, "b");
        b.ctx_set(&owner_dyn, 8);
        let c = linked_child(&table, "c");
        c.ctx_set(&owner_dyn, 9);

        let (gfid_b, gfid_c) = (b.gfid(), c.gfid());
        drop(a);
        drop(b);
        drop(c);

        // lru_limit 2: A was the least recently used, only A is evicted
        assert_eq!(owner.forgets.load(Ordering::SeqCst), 1);
        assert_eq!(table.lru_count(), 2);
        assert!(table.find(gfid_b).is_some());
        assert!(table.find(gfid_c).is_some());
    }

    #[test]
    fn lru_limit_zero_disables_eviction() {
        let table = InodeTable::new("t", 0);
        for i in 0..32 {
            let linked = linked_child(&table, &format!("f{i}"));
            drop(linked);
        }
        assert_eq!(table.lru_count(), 32);
    }

    #[test]
    fn link_unlink_is_identity() {
        let table = InodeTable::new("t", 0);
        let root = table.root();
        let linked = linked_child(&table, "a");

        table.unlink(&root, "a");
        assert!(table.grep(&root, "a").is_none());
        assert!(!linked.has_dentry());
    }

    #[test]
    fn link_merges_duplicate_gfid() {
        let owner = CtxOwner::new("cache");
        let owner_dyn: Arc<dyn Translator> = owner.clone();
        let table = InodeTable::new("t", 0);
        let root = table.root();

        let first = linked_child(&table, "a");
        let stat = Iatt {
            gfid: first.gfid(),
            ia_type: IaType::Regular,
            ..Iatt::default()
        };

        // a second in-core inode resolving to the same object
        let dup = table.new_inode();
        dup.ctx_set(&owner_dyn, 42);
        let merged = table.link(&dup, Some(&root), Some("hardlink"), &stat).unwrap();

        assert!(Arc::ptr_eq(merged.inode(), first.inode()));
        // ctx moved, not duplicated
        assert_eq!(merged.ctx_get(&owner_dyn), Some(42));
        assert_eq!(dup.ctx_get(&owner_dyn), None);
    }

    #[test]
    fn directory_single_dentry_enforced() {
        let table = InodeTable::new("t", 0);
        let root = table.root();
        let dir = table.new_inode();
        let stat = Iatt {
            gfid: Gfid::random(),
            ia_type: IaType::Directory,
            ..Iatt::default()
        };
        let linked = table.link(&dir, Some(&root), Some("d"), &stat).unwrap();

        let err = table
            .link(&linked, Some(&root), Some("d2"), &stat)
            .unwrap_err();
        assert_eq!(err, Errno::EINVAL);
        assert_eq!(linked.dentry_names().len(), 1);
    }

    #[test]
    fn rename_back_and_forth_restores_dentry() {
        let table = InodeTable::new("t", 0);
        let root = table.root();
        let linked = linked_child(&table, "x");

        table.rename(&root, "x", &root, "y", &linked).unwrap();
        assert!(table.grep(&root, "x").is_none());
        assert!(table.grep(&root, "y").is_some());

        table.rename(&root, "y", &root, "x", &linked).unwrap();
        let hit = table.grep(&root, "x").unwrap();
        assert!(Arc::ptr_eq(hit.inode(), linked.inode()));
        assert!(table.grep(&root, "y").is_none());
    }

    #[test]
    fn rename_displaces_existing_target() {
        let table = InodeTable::new("t", 0);
        let root = table.root();
        let src = linked_child(&table, "src");
        let dst = linked_child(&table, "dst");

        table.rename(&root, "src", &root, "dst", &src).unwrap();
        let hit = table.grep(&root, "dst").unwrap();
        assert!(Arc::ptr_eq(hit.inode(), src.inode()));
        assert!(!dst.has_dentry());
    }

    #[test]
    fn path_reconstruction() {
        let table = InodeTable::new("t", 0);
        let root = table.root();
        assert_eq!(root.path(None), "/");

        let dir_stat = Iatt {
            gfid: Gfid::random(),
            ia_type: IaType::Directory,
            ..Iatt::default()
        };
        let dir = table.new_inode();
        let dir = table.link(&dir, Some(&root), Some("etc"), &dir_stat).unwrap();

        let file = linked_child(&table, "motd");
        assert_eq!(file.path(None), "/motd");
        assert_eq!(dir.path(Some("hosts")), "/etc/hosts");

        // reachable only by gfid
        let nameless = table.new_inode();
        let stat = Iatt {
            gfid: Gfid::random(),
            ia_type: IaType::Regular,
            ..Iatt::default()
        };
        let nameless = table.link(&nameless, None, None, &stat).unwrap();
        assert_eq!(nameless.path(None), format!("<gfid:{}>", nameless.gfid()));
    }

    #[test]
    fn need_lookup_is_test_and_clear() {
        let owner = CtxOwner::new("cache");
        let owner_dyn: Arc<dyn Translator> = owner.clone();
        let table = InodeTable::new("t", 0);
        let linked = linked_child(&table, "a");

        assert!(!linked.needs_lookup(&owner_dyn));
        linked.set_need_lookup(&owner_dyn);
        assert!(linked.needs_lookup(&owner_dyn));
        assert!(!linked.needs_lookup(&owner_dyn));
    }

    #[test]
    fn grep_for_gfid_probes_without_referencing() {
        let table = InodeTable::new("t", 16);
        let root = table.root();
        let linked = linked_child(&table, "a");
        let gfid = linked.gfid();
        drop(linked);

        let lru_before = table.lru_count();
        let probed = table.grep_for_gfid(&root, "a").unwrap();
        assert_eq!(probed, (gfid, IaType::Regular));
        // probing must not pull the inode back to active
        assert_eq!(table.lru_count(), lru_before);
        assert!(table.grep_for_gfid(&root, "missing").is_none());
    }

    #[test]
    fn ctx_del_and_reset() {
        let owner = CtxOwner::new("cache");
        let owner_dyn: Arc<dyn Translator> = owner.clone();
        let table = InodeTable::new("t", 0);
        let linked = linked_child(&table, "a");

        linked.ctx_set2(&owner_dyn, Some(5), Some(6));
        assert_eq!(linked.ctx_get2(&owner_dyn), (Some(5), Some(6)));

        assert_eq!(linked.ctx_reset(&owner_dyn), (Some(5), Some(6)));
        assert_eq!(linked.ctx_get2(&owner_dyn), (None, None));

        linked.ctx_set(&owner_dyn, 9);
        assert_eq!(linked.ctx_del(&owner_dyn), (Some(9), None));
        assert_eq!(linked.ctx_get(&owner_dyn), None);
        // a deleted slot never reaches the forget hook
        drop(linked);
        table.set_lru_limit(1);
        assert_eq!(owner.forgets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lowering_lru_limit_evicts_immediately() {
        let table = InodeTable::new("t", 0);
        for i in 0..4 {
            drop(linked_child(&table, &format!("f{i}")));
        }
        assert_eq!(table.lru_count(), 4);

        table.set_lru_limit(2);
        assert_eq!(table.lru_count(), 2);
    }

    #[test]
    fn unlinked_inode_dies_without_identity() {
        let table = InodeTable::new("t", 16);
        let inode = table.new_inode();
        let active_before = table.active_count();
        drop(inode);
        assert_eq!(table.active_count(), active_before - 1);
        assert_eq!(table.lru_count(), 0);
    }
}
