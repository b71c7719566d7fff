//! Per-client session state: the watch map and push subscriptions.
//!
//! A [`StreamWatch`] is a cursor over one input stream that drains newly
//! arrived samples at a decimation stride and emits bounded `update`
//! messages. Watches are owned by their [`ClientConn`]; the stream's
//! `data_received` event only holds a weak reference, so tearing down a
//! connection releases everything.

use crate::device::{Registry, StreamRef};
use crate::event::{Event, EventListener};
use crate::protocol;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Cap on samples per `update` message. A large drain is split into
/// consecutive messages rather than one unbounded payload.
pub const MAX_UPDATE_SAMPLES: usize = 4096;

pub type OutboundTx = mpsc::UnboundedSender<String>;

type WatchMap = HashMap<u32, Rc<RefCell<StreamWatch>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchStatus {
    Pending,
    Finished,
}

/// A client subscription to incremental delivery of one stream's data.
pub struct StreamWatch {
    id: u32,
    device_id: String,
    stream: StreamRef,
    start_index: usize,
    end_index: usize,
    stride: usize,
    /// Next stream index to emit; advances by exactly `stride` per sample.
    index: usize,
    /// Samples emitted so far.
    out_index: usize,
    listener: EventListener,
    out: OutboundTx,
}

impl StreamWatch {
    /// Emits every sample that has arrived since the last drain, honoring
    /// the stride and the end bound. Returns `Finished` exactly once, on the
    /// drain whose batch carries the terminal marker.
    fn drain(&mut self) -> WatchStatus {
        let stream = self.stream.borrow();
        let fill = stream.fill();

        let mut batch = Vec::new();
        let mut batch_start = self.index;
        while self.index < fill && self.index < self.end_index {
            if let Some(value) = stream.sample(self.index) {
                batch.push(value);
            }
            self.index += self.stride;
            self.out_index += 1;
            if batch.len() >= MAX_UPDATE_SAMPLES {
                self.send(protocol::update_message(
                    self.id,
                    batch_start,
                    std::mem::take(&mut batch),
                    false,
                ));
                batch_start = self.index;
            }
        }

        if self.index >= self.end_index {
            self.send(protocol::update_message(self.id, batch_start, batch, true));
            debug!(watch = self.id, emitted = self.out_index, "watch complete");
            WatchStatus::Finished
        } else {
            if !batch.is_empty() {
                self.send(protocol::update_message(self.id, batch_start, batch, false));
            }
            WatchStatus::Pending
        }
    }

    /// Rewinds to the start of the (re-armed) buffer after a capture reset.
    fn reset(&mut self) {
        self.index = self.start_index;
        self.out_index = 0;
    }

    fn send(&self, msg: Value) {
        let _ = self.out.send(msg.to_string());
    }
}

/// One connected WebSocket client.
pub struct ClientConn {
    pub id: Uuid,
    out: OutboundTx,
    watches: Rc<RefCell<WatchMap>>,
    // Push subscriptions; held for their registrations.
    _device_list: EventListener,
    _streaming_state: EventListener,
}

impl ClientConn {
    pub fn new(
        id: Uuid,
        out: OutboundTx,
        registry: &Rc<RefCell<Registry>>,
        streaming: Rc<Cell<bool>>,
        streaming_state_changed: &Event,
    ) -> Self {
        let device_list = EventListener::new();
        {
            let registry_for_push = Rc::clone(registry);
            let tx = out.clone();
            device_list.subscribe(&registry.borrow().device_list_changed, move || {
                push(
                    &tx,
                    &protocol::devices_message(registry_for_push.borrow().device_json_list()),
                );
            });
        }

        let streaming_state = EventListener::new();
        {
            let tx = out.clone();
            streaming_state.subscribe(streaming_state_changed, move || {
                push(&tx, &protocol::streamstate_message(streaming.get()));
            });
        }

        Self {
            id,
            out,
            watches: Rc::new(RefCell::new(HashMap::new())),
            _device_list: device_list,
            _streaming_state: streaming_state,
        }
    }

    pub fn send_json(&self, msg: &Value) {
        push(&self.out, msg);
    }

    pub fn send_text(&self, text: String) {
        let _ = self.out.send(text);
    }

    /// Creates a watch, replacing any existing one with the same id, and
    /// drains whatever is already buffered. A watch that completes on the
    /// immediate drain is never registered.
    pub fn add_watch(
        &self,
        id: u32,
        device_id: String,
        stream: StreamRef,
        start_index: usize,
        end_index: usize,
        stride: usize,
    ) {
        self.cancel_watch(id);

        // A stream with no buffer can never deliver: collapse the range so
        // the watch terminates on its first drain.
        let end_index = if stream.borrow().capacity() == 0 {
            start_index
        } else {
            end_index
        };

        let data_received = stream.borrow().data_received.clone();
        let watch = Rc::new(RefCell::new(StreamWatch {
            id,
            device_id,
            stream,
            start_index,
            end_index,
            stride,
            index: start_index,
            out_index: 0,
            listener: EventListener::new(),
            out: self.out.clone(),
        }));

        if watch.borrow_mut().drain() == WatchStatus::Finished {
            return;
        }

        let weak_watch = Rc::downgrade(&watch);
        let weak_watches = Rc::downgrade(&self.watches);
        watch.borrow().listener.subscribe(&data_received, move || {
            on_data_received(&weak_watch, &weak_watches);
        });
        self.watches.borrow_mut().insert(id, watch);
    }

    /// Cancels a watch. Unknown ids are a no-op; no terminal message is
    /// emitted for a cancelled watch.
    pub fn cancel_watch(&self, id: u32) {
        if let Some(watch) = self.watches.borrow_mut().remove(&id) {
            watch.borrow().listener.unsubscribe();
        }
    }

    pub fn watch_count(&self) -> usize {
        self.watches.borrow().len()
    }

    /// Rewinds every watch on `device_id` after its capture was re-armed.
    pub fn reset_watches(&self, device_id: &str) {
        for watch in self.watches.borrow().values() {
            let mut watch = watch.borrow_mut();
            if watch.device_id == device_id {
                watch.reset();
            }
        }
    }

    /// Releases the watches bound to a detached device.
    pub fn drop_watches_for_device(&self, device_id: &str) {
        self.watches
            .borrow_mut()
            .retain(|_, w| w.borrow().device_id != device_id);
    }
}

fn on_data_received(watch: &Weak<RefCell<StreamWatch>>, watches: &Weak<RefCell<WatchMap>>) {
    let Some(watch) = watch.upgrade() else {
        return;
    };
    if watch.borrow_mut().drain() == WatchStatus::Finished {
        watch.borrow().listener.unsubscribe();
        if let Some(watches) = watches.upgrade() {
            let id = watch.borrow().id;
            watches.borrow_mut().remove(&id);
        }
    }
}

fn push(tx: &OutboundTx, msg: &Value) {
    // A send failure means the socket writer is gone; the disconnect
    // message will tear this connection down shortly.
    let _ = tx.send(msg.to_string());
}
