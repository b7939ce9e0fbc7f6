//! Reference-counted buffer pool.
//!
//! Payload memory travels through the graph and across transports without
//! copying: a page is filled once, frozen, and then shared. An [`Iobref`] is
//! the small ordered set of buffers that rides along with a call and keeps
//! every member alive until the last holder lets go. The pool hands pages
//! back out only after the final reference drops.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

/// Default page size: at least 128 KiB, rounded up to the system page size.
pub fn default_page_size() -> usize {
    let sys = page_size::get();
    let base: usize = 128 * 1024;
    base.div_ceil(sys) * sys
}

struct PoolShared {
    page_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    max_free: usize,
}

impl PoolShared {
    fn put_back(&self, page: Box<[u8]>) {
        if page.len() != self.page_size {
            // oversized allocations bypass the pool in both directions
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(page);
        }
    }
}

/// A pool of fixed-size pages.
#[derive(Clone)]
pub struct IobufPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for IobufPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IobufPool")
            .field("page_size", &self.shared.page_size)
            .field("free", &self.shared.free.lock().len())
            .finish()
    }
}

impl IobufPool {
    /// A pool handing out pages of `page_size` bytes.
    pub fn new(page_size: usize) -> IobufPool {
        IobufPool {
            shared: Arc::new(PoolShared {
                page_size,
                free: Mutex::new(Vec::new()),
                max_free: 64,
            }),
        }
    }

    /// Page size of this pool.
    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    /// Number of pages currently sitting on the freelist.
    pub fn free_pages(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Take one page.
    pub fn get(&self) -> IobufMut {
        let page = self
            .shared
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.shared.page_size].into_boxed_slice());
        IobufMut {
            data: page,
            pool: Arc::downgrade(&self.shared),
        }
    }

    /// Take a buffer of at least `size` bytes. Requests beyond the page size
    /// bypass the pool but keep the same reference semantics.
    pub fn get_sized(&self, size: usize) -> IobufMut {
        if size <= self.shared.page_size {
            self.get()
        } else {
            IobufMut {
                data: vec![0u8; size].into_boxed_slice(),
                pool: Arc::downgrade(&self.shared),
            }
        }
    }
}

impl Default for IobufPool {
    fn default() -> IobufPool {
        IobufPool::new(default_page_size())
    }
}

/// A uniquely owned buffer being filled. Freeze it to share.
pub struct IobufMut {
    data: Box<[u8]>,
    pool: Weak<PoolShared>,
}

impl std::fmt::Debug for IobufMut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IobufMut").field("len", &self.data.len()).finish()
    }
}

impl IobufMut {
    /// Stop mutating and share the buffer.
    pub fn freeze(mut self) -> Arc<Iobuf> {
        let data = std::mem::take(&mut self.data);
        let pool = std::mem::replace(&mut self.pool, Weak::new());
        std::mem::forget(self);
        Arc::new(Iobuf { data, pool })
    }
}

impl Deref for IobufMut {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for IobufMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for IobufMut {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.put_back(std::mem::take(&mut self.data));
        }
    }
}

/// A shared, immutable buffer. The page returns to its pool when the last
/// reference drops; the pool never reuses a page that is still referenced.
pub struct Iobuf {
    data: Box<[u8]>,
    pool: Weak<PoolShared>,
}

impl std::fmt::Debug for Iobuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iobuf").field("len", &self.data.len()).finish()
    }
}

impl Iobuf {
    /// The buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Buffer capacity in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for Iobuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for Iobuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.put_back(std::mem::take(&mut self.data));
        }
    }
}

/// An ordered set of buffers kept alive together across asynchronous hops.
#[derive(Clone, Default)]
pub struct Iobref {
    bufs: SmallVec<[Arc<Iobuf>; 4]>,
}

impl std::fmt::Debug for Iobref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iobref").field("bufs", &self.bufs.len()).finish()
    }
}

impl Iobref {
    /// An empty set.
    pub fn new() -> Iobref {
        Iobref::default()
    }

    /// Add one buffer, taking a reference on it.
    pub fn add(&mut self, buf: Arc<Iobuf>) {
        self.bufs.push(buf);
    }

    /// Take references on every member of `other`.
    pub fn merge(&mut self, other: &Iobref) {
        self.bufs.extend(other.bufs.iter().cloned());
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Number of member buffers.
    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    /// Member buffers in insertion order.
    pub fn bufs(&self) -> &[Arc<Iobuf>] {
        &self.bufs
    }
}

/// A contiguous view into a shared buffer, valid while the buffer lives.
#[derive(Clone, Debug)]
pub struct IobufSlice {
    /// The backing buffer.
    pub buf: Arc<Iobuf>,
    /// Start offset within the buffer.
    pub offset: usize,
    /// Length of the view.
    pub len: usize,
}

impl IobufSlice {
    /// The viewed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.offset..self.offset + self.len]
    }
}

/// Payload data plus the reference set that keeps it alive. This is what
/// `readv` replies and `writev` requests carry through the graph.
#[derive(Clone, Debug, Default)]
pub struct IoPayload {
    /// Scatter/gather views, in order.
    pub vector: SmallVec<[IobufSlice; 2]>,
    /// References keeping every viewed buffer alive.
    pub iobref: Iobref,
}

impl IoPayload {
    /// Wrap owned bytes into a single-buffer payload.
    pub fn from_vec(pool: &IobufPool, data: &[u8]) -> IoPayload {
        let mut buf = pool.get_sized(data.len());
        buf[..data.len()].copy_from_slice(data);
        let buf = buf.freeze();
        let mut iobref = Iobref::new();
        iobref.add(buf.clone());
        IoPayload {
            vector: smallvec::smallvec![IobufSlice {
                buf,
                offset: 0,
                len: data.len(),
            }],
            iobref,
        }
    }

    /// Total byte length across the vector.
    pub fn len(&self) -> usize {
        self.vector.iter().map(|s| s.len).sum()
    }

    /// Whether the payload carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the scattered bytes into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for slice in &self.vector {
            out.extend_from_slice(slice.as_slice());
        }
        out
    }
}
