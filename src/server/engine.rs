//! The dispatch loop owning all mutable capture state.
//!
//! Devices, buffers, watches and the registry live on one dedicated thread.
//! WebSocket tasks and hardware clock threads never touch them directly;
//! they post [`EngineMsg`]s and the loop mutates state run-to-completion,
//! one message at a time. Device transitions queue their notifications,
//! which are dispatched here once the device borrow is released.

use crate::device::demo::{self, DemoSettings};
use crate::device::{ControlRequest, Device, DeviceRef, OutputSource, Registry};
use crate::event::{Event, EventListener};
use crate::protocol::{self, Command, CommandError};
use crate::server::session::{ClientConn, OutboundTx};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Hardware-side notifications, posted from outside the dispatch thread.
pub enum HwEvent {
    Attach(DeviceSpec),
    Detach { device_id: String },
    /// `samples` sample periods elapsed on an acquiring device.
    Tick { device_id: String, samples: usize },
}

/// What to attach. Devices hold thread-local state, so they are described
/// here and constructed on the dispatch thread.
pub enum DeviceSpec {
    Demo(DemoSettings),
}

pub enum EngineMsg {
    ClientConnected { id: Uuid, out: OutboundTx },
    ClientMessage { id: Uuid, text: String },
    ClientDisconnected { id: Uuid },
    Hardware(HwEvent),
    /// REST snapshot of the device listing.
    DeviceList { reply: oneshot::Sender<Vec<Value>> },
}

type ConnMap = HashMap<Uuid, Rc<ClientConn>>;

// Engine-held subscriptions to one device's events.
struct DeviceSubs {
    _state: EventListener,
    _reset: EventListener,
}

pub struct Engine {
    rx: mpsc::Receiver<EngineMsg>,
    tx: mpsc::Sender<EngineMsg>,
    registry: Rc<RefCell<Registry>>,
    conns: Rc<RefCell<ConnMap>>,
    streaming: Rc<Cell<bool>>,
    streaming_state_changed: Event,
    device_subs: HashMap<String, DeviceSubs>,
}

impl Engine {
    pub fn new(rx: mpsc::Receiver<EngineMsg>, tx: mpsc::Sender<EngineMsg>) -> Self {
        Self {
            rx,
            tx,
            registry: Rc::new(RefCell::new(Registry::new())),
            conns: Rc::new(RefCell::new(HashMap::new())),
            streaming: Rc::new(Cell::new(false)),
            streaming_state_changed: Event::new(),
            device_subs: HashMap::new(),
        }
    }

    /// Consumes messages until every sender is gone.
    pub fn run(mut self) {
        info!("engine dispatch loop running");
        while let Some(msg) = self.rx.blocking_recv() {
            self.handle(msg);
        }
        info!("engine dispatch loop stopped");
    }

    /// Handles one message to completion.
    pub fn handle(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::ClientConnected { id, out } => self.client_connected(id, out),
            EngineMsg::ClientMessage { id, text } => self.client_message(id, &text),
            EngineMsg::ClientDisconnected { id } => self.client_disconnected(id),
            EngineMsg::Hardware(event) => self.hardware_event(event),
            EngineMsg::DeviceList { reply } => {
                let _ = reply.send(self.registry.borrow().device_json_list());
            }
        }
    }

    fn client_connected(&mut self, id: Uuid, out: OutboundTx) {
        info!(client = %id, "client connected");
        let conn = Rc::new(ClientConn::new(
            id,
            out,
            &self.registry,
            Rc::clone(&self.streaming),
            &self.streaming_state_changed,
        ));

        // Initial state pushes, mirroring what change events would send.
        let (devices, configs) = {
            let registry = self.registry.borrow();
            let configs: Vec<Value> = registry
                .devices()
                .iter()
                .map(|d| d.borrow().to_json())
                .collect();
            (registry.device_json_list(), configs)
        };
        conn.send_json(&protocol::devices_message(devices));
        conn.send_json(&protocol::streamstate_message(self.streaming.get()));
        for config in configs {
            conn.send_json(&protocol::device_config_message(config));
        }

        self.conns.borrow_mut().insert(id, conn);
    }

    fn client_disconnected(&mut self, id: Uuid) {
        info!(client = %id, "client disconnected");
        // Dropping the connection releases its watches and subscriptions.
        self.conns.borrow_mut().remove(&id);
    }

    fn client_message(&mut self, id: Uuid, text: &str) {
        let Some(conn) = self.conns.borrow().get(&id).cloned() else {
            warn!(client = %id, "message from unknown client");
            return;
        };

        let result = match Command::parse(text) {
            Ok(command) => self.dispatch(&conn, command),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {}
            Err(err @ CommandError::Protocol(_)) => {
                warn!(client = %id, %err, "dropping unparsable message");
                conn.send_json(&protocol::error_message(&err));
            }
            Err(err) => {
                debug!(client = %id, %err, "command failed");
                conn.send_json(&protocol::error_message(&err));
            }
        }
    }

    fn dispatch(&mut self, conn: &Rc<ClientConn>, command: Command) -> Result<(), CommandError> {
        match command {
            Command::Watch {
                id,
                device,
                channel,
                stream,
                start_index,
                end_index,
                decimate_factor,
            } => {
                if decimate_factor == 0 {
                    return Err(CommandError::invalid("decimateFactor must be nonzero"));
                }
                let (device, stream) =
                    self.registry
                        .borrow()
                        .find_stream(&device, &channel, &stream)?;
                let device_id = device.borrow().id();
                conn.add_watch(id, device_id, stream, start_index, end_index, decimate_factor);
                Ok(())
            }

            Command::CancelListen { id } => {
                conn.cancel_watch(id);
                Ok(())
            }

            Command::Configure {
                device,
                mode,
                samples,
                sample_time,
                continuous,
                raw,
            } => {
                if !(sample_time > 0.0) {
                    return Err(CommandError::invalid("sampleTime must be positive"));
                }
                let device = self.registry.borrow().resolve(device.as_deref())?;
                let result = run_device(&device, |d| {
                    d.configure(mode, sample_time, samples, continuous, raw)
                });
                if let Err(err) = result {
                    self.hardware_failure(&device, &err);
                    return Ok(());
                }
                self.broadcast(&protocol::device_config_message(device.borrow().to_json()));
                Ok(())
            }

            Command::StartCapture { device } => {
                let device = self.registry.borrow().resolve(device.as_deref())?;
                if let Err(err) = run_device(&device, |d| d.start_capture()) {
                    self.hardware_failure(&device, &err);
                }
                Ok(())
            }

            Command::PauseCapture { device } => {
                let device = self.registry.borrow().resolve(device.as_deref())?;
                if let Err(err) = run_device(&device, |d| d.pause_capture()) {
                    self.hardware_failure(&device, &err);
                }
                Ok(())
            }

            Command::Set {
                device,
                channel,
                source,
            } => {
                let source = OutputSource::from_json(&source)?;
                let device = self.registry.borrow().resolve(device.as_deref())?;
                let described = device.borrow_mut().set_output(&channel, source)?;
                self.broadcast(&protocol::output_changed_message(&channel, described));
                Ok(())
            }

            Command::StartStreaming => {
                self.set_streaming(true);
                Ok(())
            }

            Command::StopStreaming => {
                self.set_streaming(false);
                Ok(())
            }

            Command::ControlTransfer {
                id,
                device,
                bm_request_type,
                b_request,
                w_value,
                w_index,
                w_length,
                data,
            } => {
                let request = ControlRequest {
                    request_type: bm_request_type,
                    request: b_request,
                    value: w_value,
                    index: w_index,
                    length: w_length,
                    data: Vec::new(),
                };
                let request = if request.is_in() {
                    request
                } else {
                    let data = data
                        .ok_or_else(|| CommandError::invalid("OUT transfer requires data"))?;
                    ControlRequest {
                        data: protocol::decode_transfer_data(&data, w_length as usize)?,
                        ..request
                    }
                };

                let device = self.registry.borrow().resolve(device.as_deref())?;
                let reply = device.borrow_mut().control_transfer(&request);
                let data = (request.is_in() && reply.status >= 0).then_some(reply.data.as_slice());
                conn.send_json(&protocol::control_transfer_return(reply.status, &id, data));
                Ok(())
            }

            Command::EnterBootloader { device } => {
                let device = self.registry.borrow().resolve(device.as_deref())?;
                let result = device.borrow_mut().enter_bootloader();
                if let Err(err) = result {
                    self.hardware_failure(&device, &err);
                }
                Ok(())
            }
        }
    }

    fn hardware_event(&mut self, event: HwEvent) {
        match event {
            HwEvent::Attach(spec) => {
                let device = match spec {
                    DeviceSpec::Demo(settings) => demo::create_device(&settings, self.tx.clone()),
                };
                self.attach_device(device);
            }
            HwEvent::Detach { device_id } => self.detach_device(&device_id),
            HwEvent::Tick { device_id, samples } => {
                let device = self.registry.borrow().get(&device_id);
                let Some(device) = device else {
                    // A clock tick can race a detach; nothing to do.
                    debug!(device = %device_id, "tick for unknown device");
                    return;
                };
                if let Err(err) = run_device(&device, |d| d.acquire(samples)) {
                    self.hardware_failure(&device, &err);
                }
            }
        }
    }

    fn attach_device(&mut self, device: Device) {
        let device = Rc::new(RefCell::new(device));
        let device_id = device.borrow().id();
        info!(device = %device_id, "device attached");

        // Broadcast capture state changes to every client.
        let state_listener = EventListener::new();
        {
            let conns = Rc::clone(&self.conns);
            let weak = Rc::downgrade(&device);
            state_listener.subscribe(&device.borrow().capture_state_changed, move || {
                let Some(device) = weak.upgrade() else { return };
                let (state, done) = {
                    let device = device.borrow();
                    (device.capture_state.as_str(), device.capture_done())
                };
                broadcast_to(&conns, &protocol::capture_state_message(state, done));
            });
        }

        // On re-arm, rewind every watch on this device before telling
        // clients, so no new data event reaches a stale cursor.
        let reset_listener = EventListener::new();
        {
            let conns = Rc::clone(&self.conns);
            let id = device_id.clone();
            reset_listener.subscribe(&device.borrow().capture_reset, move || {
                for conn in conns.borrow().values() {
                    conn.reset_watches(&id);
                }
                broadcast_to(&conns, &protocol::capture_reset_message());
            });
        }

        self.device_subs.insert(
            device_id,
            DeviceSubs {
                _state: state_listener,
                _reset: reset_listener,
            },
        );
        self.registry.borrow_mut().add(device);
        self.notify_device_list();
    }

    fn detach_device(&mut self, device_id: &str) {
        let Some(device) = self.registry.borrow_mut().remove(device_id) else {
            return;
        };
        info!(device = %device_id, "device detached");
        self.device_subs.remove(device_id);
        for conn in self.conns.borrow().values() {
            conn.drop_watches_for_device(device_id);
        }
        drop(device);
        self.notify_device_list();
    }

    /// Transport-level failures are a disconnect, not a command error.
    fn hardware_failure(&mut self, device: &DeviceRef, err: &anyhow::Error) {
        let device_id = device.borrow().id();
        error!(device = %device_id, %err, "hardware failure, detaching device");
        self.detach_device(&device_id);
    }

    fn set_streaming(&mut self, on: bool) {
        if self.streaming.get() == on {
            return;
        }
        info!(streaming = on, "streaming state changed");
        self.streaming.set(on);

        let devices: Vec<DeviceRef> = self.registry.borrow().devices().to_vec();
        for device in devices {
            let result = run_device(&device, |d| {
                if on {
                    d.start_capture()
                } else {
                    d.pause_capture()
                }
            });
            if let Err(err) = result {
                self.hardware_failure(&device, &err);
            }
        }
        self.streaming_state_changed.notify();
    }

    fn notify_device_list(&self) {
        let event = self.registry.borrow().device_list_changed.clone();
        event.notify();
    }

    fn broadcast(&self, msg: &Value) {
        broadcast_to(&self.conns, msg);
    }
}

/// Runs a device transition, then dispatches the notifications it queued
/// once the borrow is released. Handlers may re-borrow the device freely.
fn run_device<R>(device: &DeviceRef, f: impl FnOnce(&mut Device) -> R) -> R {
    let (result, pending) = {
        let mut dev = device.borrow_mut();
        let result = f(&mut dev);
        (result, dev.take_pending())
    };
    for event in pending {
        event.notify();
    }
    result
}

fn broadcast_to(conns: &Rc<RefCell<ConnMap>>, msg: &Value) {
    let text = msg.to_string();
    for conn in conns.borrow().values() {
        conn.send_text(text.clone());
    }
}
