//! The notify fabric: graph-wide event propagation.
//!
//! Events travel edge by edge through each translator's `notify` hook.
//! `PARENT_UP`/`PARENT_DOWN` fan out downward to every child; child-state
//! events climb to every parent whose init succeeded, or to the registered
//! graph master when the top is reached. Delivery per translator is
//! serialized; a hook never runs concurrently with itself.

use log::debug;

use super::XlatorBase;

/// A graph event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A parent has come up; the subtree below should activate.
    ParentUp,
    /// A parent is going away.
    ParentDown,
    /// A child subvolume became usable.
    ChildUp,
    /// A child subvolume became unusable.
    ChildDown,
    /// A child changed shape (graph switch under it).
    ChildModified,
    /// A child is attempting connection.
    ChildConnecting,
    /// Authentication with a remote endpoint was refused.
    AuthFailed,
    /// Transport-level ping latency report, in milliseconds.
    PingLatency(u64),
}

impl Event {
    /// Whether this event flows downward (parent-state) rather than upward.
    pub fn flows_down(&self) -> bool {
        matches!(self, Event::ParentUp | Event::ParentDown)
    }
}

/// The default propagation every translator inherits.
///
/// Overriders that still want fan-out call this after their own handling.
pub fn default_notify(base: &XlatorBase, event: &Event) {
    let _serial = base.notify_lock().lock();

    if event.flows_down() {
        for child in base.children() {
            child.notify(event);
        }
        return;
    }

    let parents = base.parents();
    let mut delivered = false;
    for parent in &parents {
        if !parent.base().init_ok() {
            debug!(
                "{}: not notifying {} of {:?}, its init has not completed",
                base.name(),
                parent.name(),
                event
            );
            continue;
        }
        parent.notify(event);
        delivered = true;
    }

    if !delivered {
        match base.master() {
            Some(master) => master(event),
            None => debug!("{}: event {:?} absorbed at top of graph", base.name(), event),
        }
    }
}
