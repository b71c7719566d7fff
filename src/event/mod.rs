//! One-to-many notification primitive for the capture engine.
//!
//! An [`Event`] is a notification point; an [`EventListener`] is a handle
//! owning a single subscription. The event keeps only weak references to its
//! subscribers, so dropping a listener deregisters it and dropping an event
//! leaves its listeners inert. Dispatch is strictly single-threaded: all
//! notification happens on the engine thread.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

type Handler = Box<dyn FnMut()>;

#[derive(Default)]
struct EventCore {
    next_key: u64,
    listeners: BTreeMap<u64, Weak<RefCell<ListenerSlot>>>,
}

struct ListenerSlot {
    event: Weak<RefCell<EventCore>>,
    key: u64,
    handler: Option<Handler>,
}

/// A notification point. Cloning produces another handle to the same
/// subscriber set, which lets callers queue a notification without keeping
/// the owning structure borrowed.
#[derive(Clone, Default)]
pub struct Event {
    core: Rc<RefCell<EventCore>>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invokes every currently subscribed handler once.
    ///
    /// A handler may unsubscribe itself (or any other listener) during the
    /// pass; a listener removed mid-pass is skipped if it has not run yet.
    pub fn notify(&self) {
        // Snapshot the keys so handlers can mutate the subscriber set
        // without invalidating the iteration.
        let keys: Vec<u64> = self.core.borrow().listeners.keys().copied().collect();
        for key in keys {
            let slot = {
                let core = self.core.borrow();
                match core.listeners.get(&key).and_then(Weak::upgrade) {
                    Some(slot) => slot,
                    None => continue,
                }
            };
            // Take the handler out while it runs so it may re-enter the
            // slot, e.g. to unsubscribe or resubscribe itself.
            let handler = slot.borrow_mut().handler.take();
            if let Some(mut handler) = handler {
                handler();
                let mut slot = slot.borrow_mut();
                if slot.handler.is_none() {
                    slot.handler = Some(handler);
                }
            }
        }
    }

    /// Number of live subscriptions.
    pub fn listener_count(&self) -> usize {
        self.core
            .borrow()
            .listeners
            .values()
            .filter(|w| w.upgrade().is_some())
            .count()
    }
}

/// A subscription handle. Owns at most one registration; dropping it
/// deregisters from the subscribed event.
pub struct EventListener {
    slot: Rc<RefCell<ListenerSlot>>,
}

impl EventListener {
    pub fn new() -> Self {
        Self {
            slot: Rc::new(RefCell::new(ListenerSlot {
                event: Weak::new(),
                key: 0,
                handler: None,
            })),
        }
    }

    /// Subscribes to `event`, replacing any existing subscription of this
    /// listener.
    pub fn subscribe<F: FnMut() + 'static>(&self, event: &Event, handler: F) {
        self.unsubscribe();
        let key = {
            let mut core = event.core.borrow_mut();
            let key = core.next_key;
            core.next_key += 1;
            core.listeners.insert(key, Rc::downgrade(&self.slot));
            key
        };
        let mut slot = self.slot.borrow_mut();
        slot.event = Rc::downgrade(&event.core);
        slot.key = key;
        slot.handler = Some(Box::new(handler));
    }

    /// Removes the current subscription. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        let mut slot = self.slot.borrow_mut();
        if let Some(core) = slot.event.upgrade() {
            core.borrow_mut().listeners.remove(&slot.key);
        }
        slot.event = Weak::new();
        slot.handler = None;
    }

    /// Whether this listener currently has a live subscription.
    pub fn is_subscribed(&self) -> bool {
        self.slot.borrow().event.upgrade().is_some()
    }
}

impl Default for EventListener {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
