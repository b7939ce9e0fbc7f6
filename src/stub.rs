//! Pause/resume capture for blocking translators.
//!
//! A translator that cannot service an operation right now (waiting on a
//! lock grant, a background build, a capacity gate) captures the in-flight
//! call as a stub: an inert record of the operation and its frame. The stub
//! owns the arguments. Resuming redispatches the operation from the same
//! frame as if the translator had never seen it; dropping an unresumed stub
//! fails the call instead of leaking the frame.

use std::sync::Arc;

use log::warn;

use crate::errno::Errno;
use crate::fop::Fop;
use crate::stack::CallFrame;
use crate::xlator::{self, Translator};

/// A captured, not-yet-dispatched operation.
pub struct CallStub {
    frame: Arc<CallFrame>,
    fop: Option<Fop>,
}

impl std::fmt::Debug for CallStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStub")
            .field("kind", &self.fop.as_ref().map(Fop::kind))
            .finish()
    }
}

impl CallStub {
    /// Capture `fop` with its frame. Ownership of the arguments moves in.
    pub fn new(frame: Arc<CallFrame>, fop: Fop) -> CallStub {
        debug_assert_eq!(frame.kind(), fop.kind());
        CallStub {
            frame,
            fop: Some(fop),
        }
    }

    /// The operation kind held by this stub.
    pub fn kind(&self) -> crate::fop::FopKind {
        self.frame.kind()
    }

    /// Redispatch the captured operation to `target` on the original frame.
    pub fn resume(mut self, target: &Arc<dyn Translator>) {
        if let Some(fop) = self.fop.take() {
            xlator::dispatch(target, self.frame.clone(), fop);
        }
    }

    /// Give up on the captured operation, unwinding it with `errno`.
    pub fn fail(mut self, errno: Errno) {
        if self.fop.take().is_some() {
            self.frame.unwind_err(errno);
        }
    }
}

impl Drop for CallStub {
    fn drop(&mut self) {
        if self.fop.take().is_some() {
            // a dropped stub must not strand its caller
            warn!("stub for {:?} dropped without resume, failing the call", self.frame.kind());
            self.frame.unwind_err(Errno::EIO);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fop::{Fop, FopKind, FopReply};
    use crate::stack::{call, Identity, RootFrame};
    use crate::types::Loc;
    use crate::xlator::{XlatorBase, tests_support::EchoLeaf};
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Queues every statfs and resumes it on demand.
    struct Gate {
        base: XlatorBase,
        parked: Mutex<Vec<CallStub>>,
    }

    impl Gate {
        fn new(children: Vec<Arc<dyn Translator>>) -> Arc<Gate> {
            Arc::new(Gate {
                base: XlatorBase::new("gate", children),
                parked: Mutex::new(Vec::new()),
            })
        }

        fn open(&self, target: &Arc<dyn Translator>) {
            for stub in self.parked.lock().drain(..) {
                stub.resume(target);
            }
        }
    }

    impl Translator for Gate {
        fn base(&self) -> &XlatorBase {
            &self.base
        }

        fn statfs(&self, frame: &Arc<CallFrame>, loc: Loc, xdata: crate::fop::Xdata) {
            self.parked
                .lock()
                .push(CallStub::new(frame.clone(), Fop::Statfs { loc, xdata }));
        }
    }

    #[test]
    fn queued_stub_resumes_from_same_frame() {
        let leaf = EchoLeaf::new("leaf");
        let leaf_dyn: Arc<dyn Translator> = leaf;
        let gate = Gate::new(vec![leaf_dyn.clone()]);
        let gate_dyn: Arc<dyn Translator> = gate.clone();

        let (tx, rx) = mpsc::channel();
        let root = RootFrame::new(Identity::default(), 20, move |reply| {
            tx.send(reply).unwrap();
        });
        call(
            &gate_dyn,
            root,
            Fop::Statfs {
                loc: Loc::default(),
                xdata: None,
            },
        );

        // held, not answered
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(gate.parked.lock().len(), 1);
        assert_eq!(gate.parked.lock()[0].kind(), FopKind::Statfs);

        gate.open(&leaf_dyn);
        let reply = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(reply, FopReply::Statfs { op: Ok(_), .. }));
    }

    #[test]
    fn dropped_stub_fails_the_call() {
        let leaf = EchoLeaf::new("leaf");
        let gate = Gate::new(vec![leaf as Arc<dyn Translator>]);
        let gate_dyn: Arc<dyn Translator> = gate.clone();

        let (tx, rx) = mpsc::channel();
        let root = RootFrame::new(Identity::default(), 21, move |reply| {
            tx.send(reply).unwrap();
        });
        call(
            &gate_dyn,
            root,
            Fop::Statfs {
                loc: Loc::default(),
                xdata: None,
            },
        );

        gate.parked.lock().clear();
        let reply = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.errno(), Some(Errno::EIO));
    }

    #[test]
    fn explicit_fail_carries_errno() {
        let leaf = EchoLeaf::new("leaf");
        let gate = Gate::new(vec![leaf as Arc<dyn Translator>]);
        let gate_dyn: Arc<dyn Translator> = gate.clone();

        let (tx, rx) = mpsc::channel();
        let root = RootFrame::new(Identity::default(), 22, move |reply| {
            tx.send(reply).unwrap();
        });
        call(
            &gate_dyn,
            root,
            Fop::Statfs {
                loc: Loc::default(),
                xdata: None,
            },
        );

        let stub = gate.parked.lock().pop().unwrap();
        stub.fail(Errno::EAGAIN);
        let reply = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.errno(), Some(Errno::EAGAIN));
    }
}
