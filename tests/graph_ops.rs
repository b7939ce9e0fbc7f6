//! End-to-end operations through a small graph: a caching translator over
//! an in-memory storage leaf.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use stackfs::ctx::Ctx;
use stackfs::errno::Errno;
use stackfs::fd::FdRef;
use stackfs::fop::{EntryOk, Fop, FopReply, Xdata};
use stackfs::gfid::Gfid;
use stackfs::inode::InodeTable;
use stackfs::iobuf::IoPayload;
use stackfs::stack::{CallFrame, Identity};
use stackfs::sync::{syncop_getspec, syncop_lookup, syncop_readv, syncop_statfs, syncop_writev};
use stackfs::types::{IaType, Iatt, Loc, Statfs};
use stackfs::xlator::{Graph, Translator, XlatorBase};

/// An in-memory storage endpoint.
struct MemBrick {
    base: XlatorBase,
    ctx: Arc<Ctx>,
    names: Mutex<HashMap<(Gfid, String), Gfid>>,
    files: Mutex<HashMap<Gfid, Vec<u8>>>,
    lookups_served: AtomicUsize,
}

impl MemBrick {
    fn new(ctx: Arc<Ctx>) -> Arc<MemBrick> {
        Arc::new(MemBrick {
            base: XlatorBase::new("posix0", vec![]),
            ctx,
            names: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            lookups_served: AtomicUsize::new(0),
        })
    }

    fn add_file(&self, name: &str, data: Vec<u8>) -> Gfid {
        let gfid = Gfid::random();
        self.names
            .lock()
            .insert((Gfid::ROOT, name.to_owned()), gfid);
        self.files.lock().insert(gfid, data);
        gfid
    }

    fn stat_of(&self, gfid: Gfid) -> Option<Iatt> {
        let files = self.files.lock();
        let data = files.get(&gfid)?;
        Some(Iatt {
            gfid,
            ia_type: IaType::Regular,
            size: data.len() as u64,
            nlink: 1,
            blksize: 4096,
            ..Iatt::default()
        })
    }
}

impl Translator for MemBrick {
    fn base(&self) -> &XlatorBase {
        &self.base
    }

    fn lookup(&self, frame: &Arc<CallFrame>, loc: Loc, _xdata: Xdata) {
        self.lookups_served.fetch_add(1, Ordering::SeqCst);

        let gfid = if !loc.gfid.is_null() {
            Some(loc.gfid)
        } else if let (Some(parent), Some(name)) = (&loc.parent, &loc.name) {
            self.names.lock().get(&(parent.gfid(), name.clone())).copied()
        } else {
            None
        };
        let Some(gfid) = gfid else {
            frame.unwind_err(Errno::ENOENT);
            return;
        };
        let Some(stat) = self.stat_of(gfid) else {
            frame.unwind_err(Errno::ENOENT);
            return;
        };
        let Some(inode) = loc.inode else {
            frame.unwind_err(Errno::EINVAL);
            return;
        };
        frame.unwind(FopReply::Lookup {
            op: Ok(EntryOk {
                inode,
                stat,
                postparent: Iatt::synthetic_dir(Gfid::ROOT),
            }),
            xdata: None,
        });
    }

    fn open(
        &self,
        frame: &Arc<CallFrame>,
        loc: Loc,
        _flags: stackfs::types::OpenFlags,
        fd: FdRef,
        _xdata: Xdata,
    ) {
        let gfid = loc.inode.as_ref().map(|i| i.gfid()).unwrap_or(loc.gfid);
        if !self.files.lock().contains_key(&gfid) {
            frame.unwind_err(Errno::ENOENT);
            return;
        }
        frame.unwind(FopReply::Open { op: Ok(fd), xdata: None });
    }

    fn readv(
        &self,
        frame: &Arc<CallFrame>,
        fd: FdRef,
        size: usize,
        offset: u64,
        _flags: u32,
        _xdata: Xdata,
    ) {
        let gfid = fd.inode().gfid();
        let files = self.files.lock();
        let Some(data) = files.get(&gfid) else {
            frame.unwind_err(Errno::ENOENT);
            return;
        };
        let start = (offset as usize).min(data.len());
        let end = (start + size).min(data.len());
        let payload = IoPayload::from_vec(self.ctx.iobuf_pool(), &data[start..end]);
        let stat = Iatt {
            gfid,
            ia_type: IaType::Regular,
            size: data.len() as u64,
            ..Iatt::default()
        };
        frame.unwind(FopReply::Readv {
            op: Ok(stackfs::fop::ReadvOk { payload, stat }),
            xdata: None,
        });
    }

    fn writev(
        &self,
        frame: &Arc<CallFrame>,
        fd: FdRef,
        payload: IoPayload,
        offset: u64,
        _flags: u32,
        _xdata: Xdata,
    ) {
        let gfid = fd.inode().gfid();
        let mut files = self.files.lock();
        let Some(data) = files.get_mut(&gfid) else {
            frame.unwind_err(Errno::ENOENT);
            return;
        };
        let pre = Iatt {
            gfid,
            ia_type: IaType::Regular,
            size: data.len() as u64,
            ..Iatt::default()
        };
        let bytes = payload.to_vec();
        let end = offset as usize + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(&bytes);
        let post = Iatt {
            size: data.len() as u64,
            ..pre.clone()
        };
        frame.unwind(FopReply::Writev {
            op: Ok(stackfs::fop::PrePostOk { pre, post }),
            xdata: None,
        });
    }

    fn statfs(&self, frame: &Arc<CallFrame>, _loc: Loc, _xdata: Xdata) {
        frame.unwind(FopReply::Statfs {
            op: Ok(Statfs {
                bsize: 4096,
                blocks: 1 << 20,
                bfree: 1 << 19,
                bavail: 1 << 19,
                files: 1 << 16,
                ffree: 1 << 15,
                namemax: 255,
                ..Statfs::default()
            }),
            xdata: None,
        });
    }

    fn getspec(&self, frame: &Arc<CallFrame>, key: String, _flags: i32, _xdata: Xdata) {
        frame.unwind(FopReply::Getspec {
            op: Ok(format!("volume {key}\n    type storage/memory\nend-volume\n")),
            xdata: None,
        });
    }
}

/// Serves repeated lookups out of the inode table without touching the
/// layers below.
struct LookupCache {
    base: XlatorBase,
    table: Arc<InodeTable>,
    stats: Mutex<HashMap<Gfid, Iatt>>,
    self_ref: Weak<LookupCache>,
}

impl LookupCache {
    fn new(table: Arc<InodeTable>, child: Arc<dyn Translator>) -> Arc<LookupCache> {
        Arc::new_cyclic(|self_ref| LookupCache {
            base: XlatorBase::new("lookup-cache", vec![child]),
            table,
            stats: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }
}

impl Translator for LookupCache {
    fn base(&self) -> &XlatorBase {
        &self.base
    }

    fn lookup(&self, frame: &Arc<CallFrame>, loc: Loc, xdata: Xdata) {
        if let (Some(parent), Some(name)) = (&loc.parent, &loc.name) {
            if let Some(hit) = self.table.grep(parent, name) {
                let this: Arc<dyn Translator> = match self.self_ref.upgrade() {
                    Some(this) => this,
                    None => {
                        frame.unwind_err(Errno::EIO);
                        return;
                    }
                };
                if !hit.needs_lookup(&this) {
                    if let Some(stat) = self.stats.lock().get(&hit.gfid()).cloned() {
                        frame.unwind(FopReply::Lookup {
                            op: Ok(EntryOk {
                                inode: hit,
                                stat,
                                postparent: Iatt::synthetic_dir(Gfid::ROOT),
                            }),
                            xdata: None,
                        });
                        return;
                    }
                }
            }
        }

        let Some(child) = self.base.first_child() else {
            frame.unwind_err(Errno::ENOSYS);
            return;
        };
        let table = self.table.clone();
        let parent = loc.parent.clone();
        let name = loc.name.clone();
        let this = self.self_ref.clone();
        frame.wind(
            &child,
            Fop::Lookup { loc, xdata },
            Box::new(move |frame, reply| {
                let FopReply::Lookup { op, xdata } = reply else {
                    frame.unwind_err(Errno::EIO);
                    return;
                };
                match op {
                    Ok(entry) => {
                        let linked =
                            match table.link(&entry.inode, parent.as_ref(), name.as_deref(), &entry.stat)
                            {
                                Ok(linked) => linked,
                                Err(errno) => {
                                    frame.unwind_err(errno);
                                    return;
                                }
                            };
                        if let Some(this) = this.upgrade() {
                            this.stats.lock().insert(entry.stat.gfid, entry.stat.clone());
                        }
                        frame.unwind(FopReply::Lookup {
                            op: Ok(EntryOk {
                                inode: linked,
                                stat: entry.stat,
                                postparent: entry.postparent,
                            }),
                            xdata,
                        });
                    }
                    Err(errno) => frame.unwind(FopReply::Lookup { op: Err(errno), xdata }),
                }
            }),
        );
    }
}

struct Harness {
    ctx: Arc<Ctx>,
    table: Arc<InodeTable>,
    brick: Arc<MemBrick>,
    top: Arc<dyn Translator>,
    _graph: Graph,
}

fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = Ctx::new().unwrap();
    let table = InodeTable::new("client0", 0);
    let brick = MemBrick::new(ctx.clone());
    let cache = LookupCache::new(table.clone(), brick.clone());
    let graph = Graph::assemble(cache.clone());
    graph.init_all().unwrap();
    graph.start();
    Harness {
        ctx,
        table,
        brick,
        top: cache,
        _graph: graph,
    }
}

fn lookup_name(h: &Harness, name: &str) -> Result<EntryOk, Errno> {
    let root = h.table.root();
    let loc = Loc {
        inode: Some(h.table.new_inode()),
        ..Loc::child_of(root, name)
    };
    syncop_lookup(&h.ctx, &h.top, Identity::default(), loc, None)
}

#[test]
fn lookup_miss_then_hit_stays_cached() {
    let h = harness();
    let gfid = h.brick.add_file("a", vec![7u8; 100]);

    let first = lookup_name(&h, "a").unwrap();
    assert_eq!(first.stat.gfid, gfid);
    assert_eq!(h.brick.lookups_served.load(Ordering::SeqCst), 1);

    let second = lookup_name(&h, "a").unwrap();
    assert_eq!(second.stat.gfid, gfid);
    // same in-core inode, and the wire below the cache was not touched
    assert!(Arc::ptr_eq(first.inode.inode(), second.inode.inode()));
    assert_eq!(h.brick.lookups_served.load(Ordering::SeqCst), 1);
}

#[test]
fn lookup_of_missing_name_fails() {
    let h = harness();
    assert_eq!(lookup_name(&h, "nope").unwrap_err(), Errno::ENOENT);
}

#[test]
fn invalidation_forces_revalidate() {
    let h = harness();
    h.brick.add_file("a", vec![1u8; 10]);

    let first = lookup_name(&h, "a").unwrap();
    assert_eq!(h.brick.lookups_served.load(Ordering::SeqCst), 1);

    first.inode.set_need_lookup(&h.top);
    let _second = lookup_name(&h, "a").unwrap();
    assert_eq!(h.brick.lookups_served.load(Ordering::SeqCst), 2);
}

#[test]
fn anonymous_fd_readv() {
    let h = harness();
    h.brick.add_file("big", vec![0xabu8; 8192]);

    let entry = lookup_name(&h, "big").unwrap();
    let fd = FdRef::anonymous(entry.inode.clone());
    assert_eq!(entry.inode.fd_count(), 1);

    let out = syncop_readv(&h.ctx, &h.top, Identity::default(), fd, 4096, 0).unwrap();
    assert_eq!(out.payload.len(), 4096);
    assert!(out.payload.to_vec().iter().all(|b| *b == 0xab));
    assert_eq!(out.stat.size, 8192);

    // the handle dropped with the call; no open files remain
    assert_eq!(entry.inode.fd_count(), 0);
}

#[test]
fn open_then_read_through_the_handle() {
    let h = harness();
    h.brick.add_file("doc", vec![0x5au8; 512]);

    let entry = lookup_name(&h, "doc").unwrap();
    let loc = Loc {
        inode: Some(entry.inode.clone()),
        gfid: entry.inode.gfid(),
        ..Loc::default()
    };
    let fd = FdRef::open(entry.inode.clone(), stackfs::types::OpenFlags::RDWR, 321);
    let fd = stackfs::sync::syncop_open(
        &h.ctx,
        &h.top,
        Identity::default(),
        loc,
        stackfs::types::OpenFlags::RDWR,
        fd,
    )
    .unwrap();
    assert_eq!(fd.pid(), 321);

    let out = syncop_readv(&h.ctx, &h.top, Identity::default(), fd, 512, 0).unwrap();
    assert_eq!(out.payload.len(), 512);
}

#[test]
fn write_then_read_roundtrip() {
    let h = harness();
    h.brick.add_file("w", vec![0u8; 16]);

    let entry = lookup_name(&h, "w").unwrap();
    let fd = FdRef::anonymous(entry.inode.clone());
    let payload = IoPayload::from_vec(h.ctx.iobuf_pool(), b"hello, bricks");
    let out = syncop_writev(&h.ctx, &h.top, Identity::default(), fd, payload, 3).unwrap();
    assert_eq!(out.post.size, 16);

    let fd = FdRef::anonymous(entry.inode.clone());
    let read = syncop_readv(&h.ctx, &h.top, Identity::default(), fd, 13, 3).unwrap();
    assert_eq!(read.payload.to_vec(), b"hello, bricks");
}

#[test]
fn statfs_and_getspec_route_to_the_leaf() {
    let h = harness();
    let root = h.table.root();
    let loc = Loc {
        inode: Some(root.clone()),
        gfid: Gfid::ROOT,
        ..Loc::default()
    };
    let out = syncop_statfs(&h.ctx, &h.top, Identity::default(), loc).unwrap();
    assert_eq!(out.bsize, 4096);

    let spec = syncop_getspec(&h.ctx, &h.top, Identity::default(), "vol0".to_owned()).unwrap();
    assert!(spec.contains("storage/memory"));
}
