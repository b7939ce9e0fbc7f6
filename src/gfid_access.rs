//! By-GFID access through a synthetic directory.
//!
//! This top-of-graph translator exposes a virtual directory under the root
//! whose entries are canonical GFID strings. Looking one up builds a
//! nameless location for that GFID and winds an ordinary lookup down the
//! stack. Virtual inodes live in a second, private inode table so synthetic
//! entries never collide with the real namespace; each virtual inode tracks
//! the real inode it stands for, and operations substitute the real inode
//! before winding. When a lookup discovers that the real object is already
//! in the main table under another in-core inode, the virtual entry is
//! repointed at it and a fresh random GFID is returned so the kernel-facing
//! layer cannot alias the two.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;

use crate::errno::Errno;
use crate::fd::FdRef;
use crate::fop::{EntryOk, Fop, FopReply, Xdata};
use crate::gfid::Gfid;
use crate::inode::{InodeRef, InodeTable};
use crate::stack::CallFrame;
use crate::types::{Iatt, Loc, OpenFlags, SetattrValid};
use crate::xlator::{Translator, XlatorBase};

/// Name of the synthetic directory under the root.
pub const AUX_DIR_NAME: &str = ".gfid";

/// The by-GFID access overlay.
pub struct GfidAccess {
    base: XlatorBase,
    real_table: Arc<InodeTable>,
    vtable: Arc<InodeTable>,
    /// virtual gfid -> the real inode it stands for
    real_map: Mutex<HashMap<Gfid, InodeRef>>,
    self_ref: Weak<GfidAccess>,
}

impl std::fmt::Debug for GfidAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GfidAccess")
            .field("name", &self.base.name())
            .field("tracked", &self.real_map.lock().len())
            .finish()
    }
}

impl GfidAccess {
    /// Build the overlay over `child`, resolving real objects out of
    /// `real_table`.
    pub fn new(
        name: impl Into<String>,
        child: Arc<dyn Translator>,
        real_table: Arc<InodeTable>,
    ) -> Arc<GfidAccess> {
        let name = name.into();
        Arc::new_cyclic(|self_ref| GfidAccess {
            vtable: InodeTable::new(format!("{name}/virtual"), 0),
            base: XlatorBase::new(name, vec![child]),
            real_table,
            real_map: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// The private table holding virtual inodes.
    pub fn virtual_table(&self) -> &Arc<InodeTable> {
        &self.vtable
    }

    fn aux_dir_inode(&self) -> Result<InodeRef, Errno> {
        if let Some(existing) = self.vtable.find(Gfid::AUX_DIR) {
            return Ok(existing);
        }
        let root = self.vtable.root();
        let inode = self.vtable.new_inode();
        self.vtable.link(
            &inode,
            Some(&root),
            Some(AUX_DIR_NAME),
            &Iatt::synthetic_dir(Gfid::AUX_DIR),
        )
    }

    fn is_aux_dir_gfid(gfid: Gfid) -> bool {
        gfid == Gfid::AUX_DIR
    }

    fn loc_parent_gfid(loc: &Loc) -> Gfid {
        loc.parent
            .as_ref()
            .map(|p| p.gfid())
            .filter(|g| !g.is_null())
            .unwrap_or(loc.pargfid)
    }

    fn loc_gfid(loc: &Loc) -> Gfid {
        loc.inode
            .as_ref()
            .map(|i| i.gfid())
            .filter(|g| !g.is_null())
            .unwrap_or(loc.gfid)
    }

    fn names_aux_dir(loc: &Loc) -> bool {
        loc.name.as_deref() == Some(AUX_DIR_NAME)
            && GfidAccess::loc_parent_gfid(loc) == Gfid::ROOT
    }

    fn under_aux_dir(loc: &Loc) -> bool {
        GfidAccess::is_aux_dir_gfid(GfidAccess::loc_parent_gfid(loc))
    }

    fn on_aux_dir(loc: &Loc) -> bool {
        GfidAccess::is_aux_dir_gfid(GfidAccess::loc_gfid(loc))
    }

    fn is_virtual(&self, loc: &Loc) -> bool {
        loc.inode
            .as_ref()
            .map(|inode| inode.belongs_to(&self.vtable))
            .unwrap_or(false)
    }

    /// Swap a virtual location for the real object it stands for. Fails
    /// with `ESTALE` when the tracking is gone (the caller should retry
    /// with a fresh lookup).
    fn substitute(&self, loc: &mut Loc) -> Result<(), Errno> {
        let Some(inode) = loc.inode.as_ref() else {
            return Ok(());
        };
        if !inode.belongs_to(&self.vtable) {
            return Ok(());
        }
        let vgfid = inode.gfid();
        let real = self.real_map.lock().get(&vgfid).cloned();
        match real {
            Some(real) => {
                loc.gfid = real.gfid();
                loc.inode = Some(real);
                loc.parent = None;
                loc.name = None;
                loc.pargfid = Gfid::NULL;
                Ok(())
            }
            None => {
                debug!(
                    "{}: no real inode tracked for virtual {vgfid}",
                    self.base.name()
                );
                Err(Errno::ESTALE)
            }
        }
    }

    fn aux_lookup(&self, frame: &Arc<CallFrame>) {
        match self.aux_dir_inode() {
            Ok(inode) => frame.unwind(FopReply::Lookup {
                op: Ok(EntryOk {
                    inode,
                    stat: Iatt::synthetic_dir(Gfid::AUX_DIR),
                    postparent: Iatt::synthetic_dir(Gfid::ROOT),
                }),
                xdata: None,
            }),
            Err(errno) => frame.unwind_err(errno),
        }
    }

    /// A lookup for `<uuid>` under the synthetic directory: resolve the real
    /// object by bare GFID, then manufacture (or refresh) the virtual entry.
    fn virtual_lookup(&self, frame: &Arc<CallFrame>, loc: Loc, xdata: Xdata) {
        let Some(name) = loc.name.clone() else {
            frame.unwind_err(Errno::EINVAL);
            return;
        };
        let gfid = match Gfid::parse(&name) {
            Ok(gfid) => gfid,
            Err(_) => {
                debug!("{}: \"{name}\" is not a canonical identifier", self.base.name());
                frame.unwind_err(Errno::EINVAL);
                return;
            }
        };

        // reuse the in-core real inode when there is one, otherwise send a
        // fresh nameless inode down for the resolver to fill
        let sent = match self.real_table.find(gfid) {
            Some(existing) => existing,
            None => self.real_table.new_inode(),
        };
        let down_loc = Loc {
            inode: Some(sent.clone()),
            gfid,
            ..Loc::default()
        };

        let this = self.self_ref.clone();
        let Some(child) = self.base.first_child() else {
            frame.unwind_err(Errno::ENOSYS);
            return;
        };
        frame.wind(
            &child,
            Fop::Lookup {
                loc: down_loc,
                xdata,
            },
            Box::new(move |frame, reply| {
                let Some(this) = this.upgrade() else {
                    frame.unwind_err(Errno::EIO);
                    return;
                };
                this.virtual_lookup_cbk(frame, reply, gfid, sent, name);
            }),
        );
    }

    fn virtual_lookup_cbk(
        &self,
        frame: &Arc<CallFrame>,
        reply: FopReply,
        gfid: Gfid,
        sent: InodeRef,
        name: String,
    ) {
        let FopReply::Lookup { op, xdata } = reply else {
            frame.unwind_err(Errno::EIO);
            return;
        };
        let entry = match op {
            Ok(entry) => entry,
            Err(errno) => {
                frame.unwind(FopReply::Lookup { op: Err(errno), xdata });
                return;
            }
        };

        let linked = match self.real_table.link(&sent, None, None, &entry.stat) {
            Ok(linked) => linked,
            Err(errno) => {
                frame.unwind_err(errno);
                return;
            }
        };

        // a different in-core inode already owned this identity: repoint the
        // virtual entry at the survivor and hand back a throwaway identity
        // so the two can never alias upward
        let vgfid = if Arc::ptr_eq(linked.inode(), sent.inode()) {
            gfid
        } else {
            debug!(
                "{}: real inode for {gfid} already in core, revalidating entry",
                self.base.name()
            );
            Gfid::random()
        };

        let mut vstat = entry.stat.clone();
        vstat.gfid = vgfid;

        let aux = match self.aux_dir_inode() {
            Ok(aux) => aux,
            Err(errno) => {
                frame.unwind_err(errno);
                return;
            }
        };
        let vnode = self.vtable.new_inode();
        let vlinked = match self.vtable.link(&vnode, Some(&aux), Some(name.as_str()), &vstat) {
            Ok(vlinked) => vlinked,
            Err(errno) => {
                frame.unwind_err(errno);
                return;
            }
        };
        self.real_map.lock().insert(vgfid, linked);

        frame.unwind(FopReply::Lookup {
            op: Ok(EntryOk {
                inode: vlinked,
                stat: vstat,
                postparent: Iatt::synthetic_dir(Gfid::AUX_DIR),
            }),
            xdata,
        });
    }
}

impl Translator for GfidAccess {
    fn base(&self) -> &XlatorBase {
        &self.base
    }

    fn lookup(&self, frame: &Arc<CallFrame>, loc: Loc, xdata: Xdata) {
        if GfidAccess::names_aux_dir(&loc) {
            self.aux_lookup(frame);
            return;
        }
        if GfidAccess::under_aux_dir(&loc) {
            self.virtual_lookup(frame, loc, xdata);
            return;
        }
        let mut loc = loc;
        if self.is_virtual(&loc) {
            if let Err(errno) = self.substitute(&mut loc) {
                frame.unwind_err(errno);
                return;
            }
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Lookup { loc, xdata });
    }

    fn stat(&self, frame: &Arc<CallFrame>, loc: Loc, xdata: Xdata) {
        if GfidAccess::on_aux_dir(&loc) {
            frame.unwind(FopReply::Stat {
                op: Ok(Iatt::synthetic_dir(Gfid::AUX_DIR)),
                xdata: None,
            });
            return;
        }
        let mut loc = loc;
        if let Err(errno) = self.substitute(&mut loc) {
            frame.unwind_err(errno);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Stat { loc, xdata });
    }

    fn access(&self, frame: &Arc<CallFrame>, loc: Loc, mask: i32, xdata: Xdata) {
        if GfidAccess::on_aux_dir(&loc) {
            frame.unwind(FopReply::Access { op: Ok(()), xdata: None });
            return;
        }
        let mut loc = loc;
        if let Err(errno) = self.substitute(&mut loc) {
            frame.unwind_err(errno);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Access { loc, mask, xdata });
    }

    fn readlink(&self, frame: &Arc<CallFrame>, loc: Loc, size: usize, xdata: Xdata) {
        let mut loc = loc;
        if let Err(errno) = self.substitute(&mut loc) {
            frame.unwind_err(errno);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Readlink { loc, size, xdata });
    }

    fn setattr(
        &self,
        frame: &Arc<CallFrame>,
        loc: Loc,
        stat: Iatt,
        valid: SetattrValid,
        xdata: Xdata,
    ) {
        if GfidAccess::on_aux_dir(&loc) {
            frame.unwind_err(Errno::ENOTSUP);
            return;
        }
        let mut loc = loc;
        if let Err(errno) = self.substitute(&mut loc) {
            frame.unwind_err(errno);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Setattr { loc, stat, valid, xdata });
    }

    fn truncate(&self, frame: &Arc<CallFrame>, loc: Loc, offset: u64, xdata: Xdata) {
        if GfidAccess::on_aux_dir(&loc) {
            frame.unwind_err(Errno::EISDIR);
            return;
        }
        let mut loc = loc;
        if let Err(errno) = self.substitute(&mut loc) {
            frame.unwind_err(errno);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Truncate { loc, offset, xdata });
    }

    fn getxattr(&self, frame: &Arc<CallFrame>, loc: Loc, name: Option<String>, xdata: Xdata) {
        if GfidAccess::on_aux_dir(&loc) {
            frame.unwind_err(Errno::ENOTSUP);
            return;
        }
        let mut loc = loc;
        if let Err(errno) = self.substitute(&mut loc) {
            frame.unwind_err(errno);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Getxattr { loc, name, xdata });
    }

    fn open(&self, frame: &Arc<CallFrame>, loc: Loc, flags: OpenFlags, fd: FdRef, xdata: Xdata) {
        if GfidAccess::on_aux_dir(&loc) {
            frame.unwind_err(Errno::EISDIR);
            return;
        }
        let mut loc = loc;
        if self.is_virtual(&loc) {
            // a repointed virtual inode carries a throwaway identity; the
            // handle below would reference the wrong object, so force the
            // caller back through lookup
            let vgfid = GfidAccess::loc_gfid(&loc);
            let real_gfid = self.real_map.lock().get(&vgfid).map(|r| r.gfid());
            if real_gfid != Some(vgfid) {
                frame.unwind_err(Errno::ESTALE);
                return;
            }
            if let Err(errno) = self.substitute(&mut loc) {
                frame.unwind_err(errno);
                return;
            }
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Open { loc, flags, fd, xdata });
    }

    fn opendir(&self, frame: &Arc<CallFrame>, loc: Loc, fd: FdRef, xdata: Xdata) {
        if GfidAccess::on_aux_dir(&loc) {
            // synthetic directory streams are served locally
            frame.unwind(FopReply::Opendir { op: Ok(fd), xdata: None });
            return;
        }
        let mut loc = loc;
        if let Err(errno) = self.substitute(&mut loc) {
            frame.unwind_err(errno);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Opendir { loc, fd, xdata });
    }

    fn readdir(&self, frame: &Arc<CallFrame>, fd: FdRef, size: usize, offset: u64, xdata: Xdata) {
        if GfidAccess::is_aux_dir_gfid(fd.inode().gfid()) {
            frame.unwind(FopReply::Readdir { op: Ok(Vec::new()), xdata: None });
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Readdir { fd, size, offset, xdata });
    }

    fn readdirp(&self, frame: &Arc<CallFrame>, fd: FdRef, size: usize, offset: u64, xdata: Xdata) {
        if GfidAccess::is_aux_dir_gfid(fd.inode().gfid()) {
            frame.unwind(FopReply::Readdirp { op: Ok(Vec::new()), xdata: None });
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Readdirp { fd, size, offset, xdata });
    }

    // entries can be neither created nor removed through the synthetic tree

    fn mknod(&self, frame: &Arc<CallFrame>, loc: Loc, mode: u32, rdev: u64, umask: u32, xdata: Xdata) {
        if GfidAccess::names_aux_dir(&loc) {
            frame.unwind_err(Errno::ENOTSUP);
            return;
        }
        if GfidAccess::under_aux_dir(&loc) {
            frame.unwind_err(Errno::EPERM);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Mknod { loc, mode, rdev, umask, xdata });
    }

    fn mkdir(&self, frame: &Arc<CallFrame>, loc: Loc, mode: u32, umask: u32, xdata: Xdata) {
        if GfidAccess::names_aux_dir(&loc) {
            frame.unwind_err(Errno::ENOTSUP);
            return;
        }
        if GfidAccess::under_aux_dir(&loc) {
            frame.unwind_err(Errno::EPERM);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Mkdir { loc, mode, umask, xdata });
    }

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
        if GfidAccess::names_aux_dir(&loc) {
            frame.unwind_err(Errno::ENOTSUP);
            return;
        }
        if GfidAccess::under_aux_dir(&loc) {
            frame.unwind_err(Errno::EPERM);
            return;
        }
        crate::xlator::default_fop(
            self.base(),
            frame,
            Fop::Create { loc, flags, mode, umask, fd, xdata },
        );
    }

    fn unlink(&self, frame: &Arc<CallFrame>, loc: Loc, xflag: i32, xdata: Xdata) {
        if GfidAccess::names_aux_dir(&loc) || GfidAccess::under_aux_dir(&loc) {
            frame.unwind_err(Errno::EPERM);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Unlink { loc, xflag, xdata });
    }

    fn rmdir(&self, frame: &Arc<CallFrame>, loc: Loc, flags: i32, xdata: Xdata) {
        if GfidAccess::names_aux_dir(&loc) || GfidAccess::under_aux_dir(&loc) {
            frame.unwind_err(Errno::EPERM);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Rmdir { loc, flags, xdata });
    }

    fn symlink(&self, frame: &Arc<CallFrame>, linkpath: String, loc: Loc, umask: u32, xdata: Xdata) {
        if GfidAccess::names_aux_dir(&loc) {
            frame.unwind_err(Errno::ENOTSUP);
            return;
        }
        if GfidAccess::under_aux_dir(&loc) {
            frame.unwind_err(Errno::EPERM);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Symlink { linkpath, loc, umask, xdata });
    }

    fn rename(&self, frame: &Arc<CallFrame>, oldloc: Loc, newloc: Loc, xdata: Xdata) {
        if GfidAccess::under_aux_dir(&oldloc)
            || GfidAccess::under_aux_dir(&newloc)
            || GfidAccess::names_aux_dir(&oldloc)
            || GfidAccess::names_aux_dir(&newloc)
        {
            frame.unwind_err(Errno::EPERM);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Rename { oldloc, newloc, xdata });
    }

    fn link(&self, frame: &Arc<CallFrame>, oldloc: Loc, newloc: Loc, xdata: Xdata) {
        if GfidAccess::under_aux_dir(&oldloc)
            || GfidAccess::under_aux_dir(&newloc)
            || GfidAccess::names_aux_dir(&newloc)
        {
            frame.unwind_err(Errno::EPERM);
            return;
        }
        crate::xlator::default_fop(self.base(), frame, Fop::Link { oldloc, newloc, xdata });
    }
}
