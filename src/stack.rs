//! The call/frame stack.
//!
//! One filesystem operation travels the graph as a tree of frames rooted in
//! a [`RootFrame`] that carries the caller's identity. Winding allocates a
//! child frame bound to the target translator and dispatches the operation;
//! unwinding invokes the recorded callback in the caller's context and
//! destroys the child's per-call state. A tail-wind reuses the caller's
//! frame for translators that contribute no per-call state and therefore
//! give up the chance to post-process the reply.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::error;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::fop::{Fop, FopKind, FopReply};
use crate::xlator::{self, Translator};

/// Credentials and originator of one user request. Immutable after the root
/// frame is created; an internal operation with different credentials builds
/// a new root instead of mutating.
#[derive(Clone, Debug)]
pub struct Identity {
    /// Requesting user.
    pub uid: u32,
    /// Requesting group.
    pub gid: u32,
    /// Requesting process.
    pub pid: i32,
    /// Supplementary groups, at most 16 carried on the wire.
    pub groups: SmallVec<[u32; 16]>,
    /// Lock-owner cookie; defaults to the pid when unset.
    pub lk_owner: u64,
}

impl Default for Identity {
    fn default() -> Identity {
        Identity {
            uid: 0,
            gid: 0,
            pid: 0,
            groups: SmallVec::new(),
            lk_owner: 0,
        }
    }
}

impl Identity {
    /// The lock-owner cookie, falling back to the pid.
    pub fn effective_lk_owner(&self) -> u64 {
        if self.lk_owner != 0 {
            self.lk_owner
        } else {
            self.pid as u64
        }
    }
}

type ReplySink = Box<dyn FnOnce(FopReply) + Send>;

/// Callback recorded at wind time, run in the caller's translator context
/// when the target unwinds. Receives the caller's frame and the reply.
pub type UnwindHandler = Box<dyn FnOnce(&Arc<CallFrame>, FopReply) + Send>;

/// Root of one call's frame tree: identity plus the reply path taken when
/// the topmost frame unwinds.
pub struct RootFrame {
    /// Caller identity, shared read-only by every frame in the tree.
    pub identity: Identity,
    /// Monotonically increasing id of this call.
    pub unique: u64,
    /// Identifier of the transport the request arrived on, if any.
    pub peer: Option<String>,
    reply: Mutex<Option<ReplySink>>,
}

impl std::fmt::Debug for RootFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootFrame")
            .field("unique", &self.unique)
            .field("pid", &self.identity.pid)
            .finish()
    }
}

impl RootFrame {
    /// Build a root with the given identity and reply sink.
    pub fn new(
        identity: Identity,
        unique: u64,
        reply: impl FnOnce(FopReply) + Send + 'static,
    ) -> Arc<RootFrame> {
        Arc::new(RootFrame {
            identity,
            unique,
            peer: None,
            reply: Mutex::new(Some(Box::new(reply))),
        })
    }

    /// Build a root tagged with the originating transport identifier.
    pub fn with_peer(
        identity: Identity,
        unique: u64,
        peer: String,
        reply: impl FnOnce(FopReply) + Send + 'static,
    ) -> Arc<RootFrame> {
        Arc::new(RootFrame {
            identity,
            unique,
            peer: Some(peer),
            reply: Mutex::new(Some(Box::new(reply))),
        })
    }

    fn deliver(&self, reply: FopReply) {
        match self.reply.lock().take() {
            Some(sink) => sink(reply),
            None => {
                error!("call {} replied twice, dropping the second reply", self.unique);
                debug_assert!(false, "double reply on root frame");
            }
        }
    }
}

/// One stack element: the per-translator state of one call at one node of
/// the graph.
pub struct CallFrame {
    root: Arc<RootFrame>,
    parent: Option<Arc<CallFrame>>,
    this: RwLock<Arc<dyn Translator>>,
    kind: FopKind,
    local: Mutex<Option<Box<dyn Any + Send>>>,
    cbk: Mutex<Option<UnwindHandler>>,
    unwound: AtomicBool,
    self_ref: Weak<CallFrame>,
}

impl std::fmt::Debug for CallFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallFrame")
            .field("unique", &self.root.unique)
            .field("kind", &self.kind)
            .field("this", &self.this.read().name())
            .finish()
    }
}

impl CallFrame {
    fn new(
        root: Arc<RootFrame>,
        parent: Option<Arc<CallFrame>>,
        this: Arc<dyn Translator>,
        kind: FopKind,
        cbk: Option<UnwindHandler>,
    ) -> Arc<CallFrame> {
        Arc::new_cyclic(|self_ref| CallFrame {
            root,
            parent,
            this: RwLock::new(this),
            kind,
            local: Mutex::new(None),
            cbk: Mutex::new(cbk),
            unwound: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// The shared handle to this frame; frames only ever live behind `Arc`.
    fn arc(&self) -> Arc<CallFrame> {
        self.self_ref
            .upgrade()
            .expect("frame accessed while being destroyed")
    }

    /// The root of this call.
    pub fn root(&self) -> &Arc<RootFrame> {
        &self.root
    }

    /// The identity the call runs under.
    pub fn identity(&self) -> &Identity {
        &self.root.identity
    }

    /// The translator this frame currently belongs to.
    pub fn this(&self) -> Arc<dyn Translator> {
        self.this.read().clone()
    }

    /// The operation this frame was wound with.
    pub fn kind(&self) -> FopKind {
        self.kind
    }

    /// Store per-call scratch state for the owning translator.
    pub fn set_local<T: Any + Send>(&self, local: T) {
        *self.local.lock() = Some(Box::new(local));
    }

    /// Take the per-call scratch state back, downcast to its real type.
    pub fn take_local<T: Any + Send>(&self) -> Option<Box<T>> {
        let boxed = self.local.lock().take()?;
        match boxed.downcast() {
            Ok(local) => Some(local),
            Err(other) => {
                // wrong type requested; put it back rather than leak silently
                *self.local.lock() = Some(other);
                None
            }
        }
    }

    /// Inspect the per-call scratch state without taking it.
    pub fn with_local<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.local.lock();
        let local = guard.as_mut()?.downcast_mut::<T>()?;
        Some(f(local))
    }

    /// Wind `fop` to `target`, recording `cbk` to receive the reply. The
    /// callback runs in this translator's context with this frame.
    pub fn wind(&self, target: &Arc<dyn Translator>, fop: Fop, cbk: UnwindHandler) {
        let child = CallFrame::new(
            self.root.clone(),
            Some(self.arc()),
            target.clone(),
            fop.kind(),
            Some(cbk),
        );
        xlator::dispatch(target, child, fop);
    }

    /// Tail-wind: forward `fop` to `target` on this very frame. The reply
    /// will bypass this translator entirely.
    pub fn wind_tail(&self, target: &Arc<dyn Translator>, fop: Fop) {
        debug_assert_eq!(self.kind, fop.kind(), "tail-wind changes the operation kind");
        *self.this.write() = target.clone();
        xlator::dispatch(target, self.arc(), fop);
    }

    /// Unwind this frame with `reply`. Releases the frame's local, then runs
    /// the recorded callback in the caller's context, or delivers to the
    /// root's reply sink when this is the topmost frame.
    pub fn unwind(&self, reply: FopReply) {
        if reply.kind() != self.kind {
            error!(
                "unwind arity violation on call {}: wound {:?}, replied {:?}",
                self.root.unique,
                self.kind,
                reply.kind()
            );
            debug_assert!(
                false,
                "unwind reply kind {:?} does not match wound kind {:?}",
                reply.kind(),
                self.kind
            );
            return;
        }
        if self.unwound.swap(true, Ordering::SeqCst) {
            error!("frame of call {} unwound twice", self.root.unique);
            debug_assert!(false, "double unwind");
            return;
        }

        // per-call state dies with the frame, before the reply travels on
        drop(self.local.lock().take());

        let cbk = self.cbk.lock().take();
        match (&self.parent, cbk) {
            (Some(parent), Some(cbk)) => {
                let caller = parent.this();
                let _scope = xlator::scope::enter(caller.name());
                cbk(parent, reply);
            }
            (Some(parent), None) => {
                // a frame without a callback behaves like a tail-wind:
                // hand the reply straight to the caller's frame
                parent.unwind(reply);
            }
            (None, _) => {
                self.root.deliver(reply);
            }
        }
    }

    /// Unwind with the failure shape of the wound operation.
    pub fn unwind_err(&self, errno: crate::errno::Errno) {
        let kind = self.kind;
        self.unwind(FopReply::error_for(kind, errno));
    }
}

/// Start a call: build the topmost frame under `root` and dispatch `fop` to
/// `target`.
pub fn call(target: &Arc<dyn Translator>, root: Arc<RootFrame>, fop: Fop) {
    let frame = CallFrame::new(root, None, target.clone(), fop.kind(), None);
    xlator::dispatch(target, frame, fop);
}

/// The callback of a translator that forwards a reply untouched.
pub fn passthrough_cbk() -> UnwindHandler {
    Box::new(|frame, reply| frame.unwind(reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fop::{Fop, FopReply};
    use crate::options::Options;
    use crate::types::Loc;
    use crate::xlator::tests_support::{EchoLeaf, PassThrough};
    use crate::xlator::XlatorBase;
    use std::sync::mpsc;
    use std::time::Duration;

    fn statfs_fop() -> Fop {
        Fop::Statfs {
            loc: Loc::default(),
            xdata: None,
        }
    }

    #[test]
    fn wind_unwind_through_passthrough() {
        let leaf = EchoLeaf::new("leaf");
        let mid: Arc<dyn Translator> =
            PassThrough::new("mid", vec![leaf.clone() as Arc<dyn Translator>]);

        let (tx, rx) = mpsc::channel();
        let root = RootFrame::new(Identity::default(), 1, move |reply| {
            tx.send(reply).unwrap();
        });
        call(&mid, root, statfs_fop());

        let reply = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        match reply {
            FopReply::Statfs { op, .. } => assert!(op.is_ok()),
            other => panic!("wrong reply shape: {other:?}"),
        }
    }

    #[test]
    fn local_released_on_unwind() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Scratch;
        impl Drop for Scratch {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let leaf = EchoLeaf::new("leaf");
        let (tx, rx) = mpsc::channel();
        let root = RootFrame::new(Identity::default(), 2, move |reply| {
            tx.send(reply).unwrap();
        });

        let frame = CallFrame::new(
            root,
            None,
            leaf.clone() as Arc<dyn Translator>,
            FopKind::Statfs,
            None,
        );
        frame.set_local(Scratch);
        xlator::dispatch(&(leaf as Arc<dyn Translator>), frame, statfs_fop());

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn root_carries_peer_identifier() {
        let leaf = EchoLeaf::new("leaf");
        let (tx, rx) = mpsc::channel();
        let root = RootFrame::with_peer(
            Identity::default(),
            6,
            "10.0.0.9:1021".to_owned(),
            move |reply| {
                tx.send(reply).unwrap();
            },
        );
        assert_eq!(root.peer.as_deref(), Some("10.0.0.9:1021"));
        let target: Arc<dyn Translator> = leaf;
        call(&target, root, statfs_fop());
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn identity_reaches_the_leaf() {
        let leaf = EchoLeaf::new("leaf");
        let (tx, rx) = mpsc::channel();
        let identity = Identity {
            uid: 42,
            gid: 7,
            pid: 1234,
            groups: smallvec::smallvec![1, 2, 3],
            lk_owner: 0,
        };
        let root = RootFrame::new(identity, 3, move |reply| {
            tx.send(reply).unwrap();
        });
        let target: Arc<dyn Translator> = leaf.clone();
        call(&target, root, statfs_fop());
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let seen = leaf.last_identity();
        assert_eq!(seen.uid, 42);
        assert_eq!(seen.pid, 1234);
        assert_eq!(seen.effective_lk_owner(), 1234);
    }

    #[test]
    fn frame_local_accessors() {
        let leaf = EchoLeaf::new("leaf");
        let root = RootFrame::new(Identity::default(), 5, |_reply| {});
        let frame = CallFrame::new(
            root,
            None,
            leaf as Arc<dyn Translator>,
            FopKind::Statfs,
            None,
        );

        frame.set_local(41u32);
        assert_eq!(frame.with_local::<u32, _>(|v| std::mem::replace(v, 42)), Some(41));
        // a wrongly-typed take leaves the value in place
        assert!(frame.take_local::<String>().is_none());
        assert_eq!(*frame.take_local::<u32>().unwrap(), 42);
        assert!(frame.take_local::<u32>().is_none());
    }

    #[test]
    fn error_unwind_keeps_shape() {
        struct Failing {
            base: XlatorBase,
        }
        impl Translator for Failing {
            fn base(&self) -> &XlatorBase {
                &self.base
            }
            fn statfs(&self, frame: &Arc<CallFrame>, _loc: Loc, _xdata: Option<Options>) {
                frame.unwind_err(crate::errno::Errno::ENOMEM);
            }
        }

        let xl: Arc<dyn Translator> = Arc::new(Failing {
            base: XlatorBase::new("failing", vec![]),
        });
        let (tx, rx) = mpsc::channel();
        let root = RootFrame::new(Identity::default(), 4, move |reply| {
            tx.send(reply).unwrap();
        });
        call(&xl, root, statfs_fop());
        let reply = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.errno(), Some(crate::errno::Errno::ENOMEM));
        assert_eq!(reply.kind(), FopKind::Statfs);
    }
}
