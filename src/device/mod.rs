//! Device model: channels, input streams, output binding, and the capture
//! state machine.
//!
//! A device owns an ordered list of channels; each channel owns its input
//! streams and at most one output source. Hardware specifics live behind
//! [`DeviceDriver`]; the state machine and buffer bookkeeping are shared.
//! State transitions queue their notifications instead of firing them
//! inline, so the engine can dispatch events after the device borrow is
//! released.

pub mod demo;
pub mod output;
pub mod stream;

use crate::event::Event;
use crate::protocol::CommandError;
use anyhow::Result;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::info;

pub use output::OutputSource;
pub use stream::InputStream;

pub type StreamRef = Rc<RefCell<InputStream>>;
pub type DeviceRef = Rc<RefCell<Device>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Inactive,
    Ready,
    Active,
    Paused,
    Done,
}

impl CaptureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureState::Inactive => "inactive",
            CaptureState::Ready => "ready",
            CaptureState::Active => "active",
            CaptureState::Paused => "paused",
            CaptureState::Done => "done",
        }
    }
}

/// Capture parameters handed to the driver's prepare hook.
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    pub mode: u32,
    pub sample_time: f32,
    pub samples: usize,
    pub continuous: bool,
    pub raw: bool,
}

/// A vendor control request forwarded from a client.
#[derive(Debug, Clone)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    pub data: Vec<u8>,
}

impl ControlRequest {
    /// Device-to-host direction bit.
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Result of a control transfer: libusb-style status (negative on failure,
/// transferred byte count otherwise) plus IN data.
#[derive(Debug, Clone)]
pub struct ControlReply {
    pub status: i32,
    pub data: Vec<u8>,
}

/// Hardware-specific half of a device. Hooks run on the engine thread; a
/// hook error means the transport is gone and the device gets detached.
pub trait DeviceDriver {
    fn model(&self) -> &str;
    fn serial(&self) -> &str;
    fn hw_version(&self) -> &str {
        "unknown"
    }
    fn fw_version(&self) -> &str {
        "unknown"
    }

    fn on_prepare(&mut self, config: &CaptureConfig) -> Result<()>;
    fn on_start(&mut self) -> Result<()>;
    fn on_pause(&mut self) -> Result<()>;

    /// Produces one sample for each stream of `channel`, in stream order.
    /// `drive` carries the bound output source's mode tag and current value.
    fn measure(&mut self, channel: &str, drive: Option<(u32, f32)>) -> Vec<f32>;

    fn control_transfer(&mut self, request: &ControlRequest) -> ControlReply;

    fn enter_bootloader(&mut self) -> Result<()>;
}

#[derive(Debug)]
pub struct Channel {
    pub id: String,
    pub display_name: String,
    pub streams: Vec<StreamRef>,
    pub source: Option<OutputSource>,
}

impl Channel {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            streams: Vec::new(),
            source: None,
        }
    }

    pub fn with_streams(mut self, streams: Vec<InputStream>) -> Self {
        self.streams = streams
            .into_iter()
            .map(|s| Rc::new(RefCell::new(s)))
            .collect();
        self
    }

    pub fn stream_by_id(&self, id: &str) -> Option<&StreamRef> {
        self.streams.iter().find(|s| s.borrow().id == id)
    }
}

pub struct Device {
    driver: Box<dyn DeviceDriver>,
    pub channels: Vec<Channel>,

    pub capture_state: CaptureState,
    /// Requested capture length in seconds.
    pub capture_length: f32,
    /// Fixed-length target in samples; reaching it finishes a
    /// non-continuous capture.
    pub capture_samples: usize,
    pub capture_continuous: bool,
    pub capture_raw: bool,
    pub capture_mode: u32,
    pub sample_time: f32,

    /// Input samples acquired since the last (re)arm.
    capture_i: usize,
    /// Output samples generated; output sources index off this cursor.
    capture_o: usize,

    pub capture_state_changed: Event,
    pub capture_reset: Event,

    // Notifications queued by transitions, dispatched by the engine once
    // the device borrow is released.
    pending: Vec<Event>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id())
            .field("channels", &self.channels)
            .field("capture_state", &self.capture_state)
            .field("capture_length", &self.capture_length)
            .field("capture_samples", &self.capture_samples)
            .field("capture_continuous", &self.capture_continuous)
            .field("capture_raw", &self.capture_raw)
            .field("capture_mode", &self.capture_mode)
            .field("sample_time", &self.sample_time)
            .field("capture_i", &self.capture_i)
            .field("capture_o", &self.capture_o)
            .finish()
    }
}

impl Device {
    pub fn new(driver: Box<dyn DeviceDriver>, channels: Vec<Channel>, sample_time: f32) -> Self {
        Self {
            driver,
            channels,
            capture_state: CaptureState::Inactive,
            capture_length: 0.0,
            capture_samples: 0,
            capture_continuous: false,
            capture_raw: false,
            capture_mode: 0,
            sample_time,
            capture_i: 0,
            capture_o: 0,
            capture_state_changed: Event::new(),
            capture_reset: Event::new(),
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}~{}", self.driver.model(), self.driver.serial())
    }

    pub fn channel_by_id(&self, id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn capture_done(&self) -> bool {
        self.capture_state == CaptureState::Done
    }

    pub fn samples_acquired(&self) -> usize {
        self.capture_i
    }

    pub fn output_sample(&self) -> usize {
        self.capture_o
    }

    /// Drains the notifications queued by transitions since the last call.
    pub fn take_pending(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending)
    }

    /// Arms capture from a `configure` command: fixes the sample clock and
    /// mode, then prepares buffers for `samples` samples.
    pub fn configure(
        &mut self,
        mode: u32,
        sample_time: f32,
        samples: usize,
        continuous: bool,
        raw: bool,
    ) -> Result<()> {
        self.capture_mode = mode;
        self.capture_raw = raw;
        self.sample_time = sample_time;
        for channel in &self.channels {
            for stream in &channel.streams {
                stream.borrow_mut().sample_time = sample_time;
            }
        }
        self.prepare_capture(samples as f32 * sample_time, continuous)
    }

    /// Allocates stream buffers for `seconds` of data and lands in `Ready`.
    /// Valid from any state; an active capture is paused first so hardware
    /// is never torn down while acquiring.
    pub fn prepare_capture(&mut self, seconds: f32, continuous: bool) -> Result<()> {
        if self.capture_state == CaptureState::Active {
            self.pause_capture()?;
        }

        info!(device = %self.id(), seconds, continuous, "prepare capture");
        self.capture_length = seconds;
        self.capture_continuous = continuous;
        for channel in &self.channels {
            for stream in &channel.streams {
                let mut stream = stream.borrow_mut();
                let size = (seconds / stream.sample_time).round() as usize;
                stream.allocate(size);
            }
        }
        self.capture_samples = (seconds / self.sample_time).round() as usize;

        let config = CaptureConfig {
            mode: self.capture_mode,
            sample_time: self.sample_time,
            samples: self.capture_samples,
            continuous,
            raw: self.capture_raw,
        };
        self.driver.on_prepare(&config)?;

        self.capture_state = CaptureState::Ready;
        self.reset_capture();
        self.queue_state_changed();
        Ok(())
    }

    /// `Ready`/`Paused` to `Active`. A finished capture is re-armed first;
    /// any other state is a no-op.
    pub fn start_capture(&mut self) -> Result<()> {
        if self.capture_state == CaptureState::Done {
            self.reset_capture();
            self.capture_state = CaptureState::Ready;
        }
        if matches!(
            self.capture_state,
            CaptureState::Ready | CaptureState::Paused
        ) {
            info!(device = %self.id(), "start capture");
            self.driver.on_start()?;
            self.capture_state = CaptureState::Active;
            self.queue_state_changed();
        }
        Ok(())
    }

    /// `Active` to `Paused`; no-op otherwise.
    pub fn pause_capture(&mut self) -> Result<()> {
        if self.capture_state == CaptureState::Active {
            info!(device = %self.id(), "pause capture");
            self.driver.on_pause()?;
            self.capture_state = CaptureState::Paused;
            self.queue_state_changed();
        }
        Ok(())
    }

    /// Finishes the capture. From `Active` this is an implicit pause; from
    /// `Paused` only the state advances. Idempotent elsewhere.
    pub fn done_capture(&mut self) -> Result<()> {
        match self.capture_state {
            CaptureState::Active => {
                info!(device = %self.id(), "done capture");
                self.driver.on_pause()?;
            }
            CaptureState::Paused => {}
            _ => return Ok(()),
        }
        self.capture_state = CaptureState::Done;
        self.queue_state_changed();
        Ok(())
    }

    /// Re-arms the current buffers: fill cursors and sample counters go back
    /// to zero and every outstanding watch is told to resynchronize.
    fn reset_capture(&mut self) {
        for channel in &self.channels {
            for stream in &channel.streams {
                stream.borrow_mut().clear();
            }
        }
        self.capture_i = 0;
        self.capture_o = 0;
        self.pending.push(self.capture_reset.clone());
    }

    /// Appends up to `count` samples across all channels, driven by the
    /// bound output sources. Fires each stream's `data_received` once per
    /// batch and finishes or re-arms the capture at the sample target.
    pub fn acquire(&mut self, count: usize) -> Result<()> {
        if self.capture_state != CaptureState::Active {
            return Ok(());
        }

        // Continuous capture sweeps: a full buffer re-arms in place, so
        // watches resynchronize before any sample of the new sweep.
        if self.capture_continuous && self.capture_i >= self.capture_samples {
            self.reset_capture();
        }

        let n = count.min(self.capture_samples.saturating_sub(self.capture_i));
        for _ in 0..n {
            for ch in 0..self.channels.len() {
                let drive = self.channels[ch]
                    .source
                    .as_ref()
                    .map(|s| (s.mode, s.value(self.capture_o, self.sample_time)));
                let values = self.driver.measure(&self.channels[ch].id, drive);
                for (i, stream) in self.channels[ch].streams.iter().enumerate() {
                    let mut stream = stream.borrow_mut();
                    let unit = values.get(i).copied().unwrap_or(0.0);
                    let sample = if self.capture_raw {
                        stream.to_raw(unit)
                    } else {
                        unit
                    };
                    stream.put(sample);
                }
            }
            self.capture_i += 1;
            self.capture_o += 1;
        }

        if n > 0 {
            for channel in &self.channels {
                for stream in &channel.streams {
                    self.pending.push(stream.borrow().data_received.clone());
                }
            }
        }

        if !self.capture_continuous && self.capture_i >= self.capture_samples {
            self.done_capture()?;
        }
        Ok(())
    }

    /// Binds `source` to a channel, replacing any previous binding. Periodic
    /// sources continue the previous source's cycle position when asked to.
    pub fn set_output(&mut self, channel_id: &str, mut source: OutputSource) -> Result<Value, CommandError> {
        let start = self.capture_o;
        let channel = self
            .channels
            .iter_mut()
            .find(|c| c.id == channel_id)
            .ok_or(CommandError::NotFound("Channel"))?;
        source.activate(start, channel.source.as_ref());
        let described = source.describe();
        channel.source = Some(source);
        Ok(described)
    }

    pub fn control_transfer(&mut self, request: &ControlRequest) -> ControlReply {
        self.driver.control_transfer(request)
    }

    pub fn enter_bootloader(&mut self) -> Result<()> {
        self.driver.enter_bootloader()
    }

    fn queue_state_changed(&mut self) {
        self.pending.push(self.capture_state_changed.clone());
    }

    /// Device description used for both the `devices` listing and the
    /// `deviceConfig` push.
    pub fn to_json(&self) -> Value {
        let channels: Vec<Value> = self
            .channels
            .iter()
            .map(|c| {
                let streams: Vec<Value> = c
                    .streams
                    .iter()
                    .map(|s| {
                        let s = s.borrow();
                        json!({
                            "id": s.id,
                            "displayName": s.display_name,
                            "units": s.units,
                            "scale": s.scale,
                            "offset": s.offset,
                            "sampleTime": s.sample_time,
                            "outputMode": s.output_mode,
                        })
                    })
                    .collect();
                let mut n = json!({
                    "id": c.id,
                    "displayName": c.display_name,
                    "streams": streams,
                });
                if let Some(source) = &c.source {
                    n["output"] = source.describe();
                }
                n
            })
            .collect();

        json!({
            "id": self.id(),
            "model": self.driver.model(),
            "serial": self.driver.serial(),
            "hwVersion": self.driver.hw_version(),
            "fwVersion": self.driver.fw_version(),
            "captureState": self.capture_state.as_str(),
            "captureDone": self.capture_done(),
            "captureLength": self.capture_length,
            "captureSamples": self.capture_samples,
            "captureContinuous": self.capture_continuous,
            "captureMode": self.capture_mode,
            "sampleTime": self.sample_time,
            "channels": channels,
        })
    }
}

/// Process-wide set of attached devices. Mutated only by attach/detach
/// handling on the engine thread.
#[derive(Default)]
pub struct Registry {
    devices: Vec<DeviceRef>,
    pub device_list_changed: Event,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device. The caller fires `device_list_changed` once its
    /// registry borrow is released.
    pub fn add(&mut self, device: DeviceRef) {
        self.devices.push(device);
    }

    pub fn remove(&mut self, id: &str) -> Option<DeviceRef> {
        let pos = self.devices.iter().position(|d| d.borrow().id() == id)?;
        Some(self.devices.remove(pos))
    }

    pub fn get(&self, id: &str) -> Option<DeviceRef> {
        self.devices
            .iter()
            .find(|d| d.borrow().id() == id)
            .cloned()
    }

    pub fn devices(&self) -> &[DeviceRef] {
        &self.devices
    }

    pub fn device_json_list(&self) -> Vec<Value> {
        self.devices.iter().map(|d| d.borrow().to_json()).collect()
    }

    /// Resolves a command's device reference: an explicit id, or the sole
    /// attached device when omitted.
    pub fn resolve(&self, id: Option<&str>) -> Result<DeviceRef, CommandError> {
        match id {
            Some(id) => self.get(id).ok_or(CommandError::NotFound("Device")),
            None => match self.devices.len() {
                0 => Err(CommandError::NotFound("Device")),
                1 => Ok(self.devices[0].clone()),
                _ => Err(CommandError::invalid(
                    "device id required when multiple devices are attached",
                )),
            },
        }
    }

    /// Resolves a device/channel/stream identity path, naming the missing
    /// component on failure.
    pub fn find_stream(
        &self,
        device_id: &str,
        channel_id: &str,
        stream_id: &str,
    ) -> Result<(DeviceRef, StreamRef), CommandError> {
        let device = self
            .get(device_id)
            .ok_or(CommandError::NotFound("Device"))?;
        let stream = {
            let dev = device.borrow();
            let channel = dev
                .channel_by_id(channel_id)
                .ok_or(CommandError::NotFound("Channel"))?;
            channel
                .stream_by_id(stream_id)
                .ok_or(CommandError::NotFound("Stream"))?
                .clone()
        };
        Ok((device, stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct HookLog {
        prepares: Cell<u32>,
        starts: Cell<u32>,
        pauses: Cell<u32>,
    }

    struct TestDriver {
        log: Rc<HookLog>,
        next: Cell<f32>,
    }

    impl TestDriver {
        fn new(log: Rc<HookLog>) -> Self {
            Self {
                log,
                next: Cell::new(0.0),
            }
        }
    }

    impl DeviceDriver for TestDriver {
        fn model(&self) -> &str {
            "test"
        }
        fn serial(&self) -> &str {
            "0001"
        }
        fn on_prepare(&mut self, _config: &CaptureConfig) -> Result<()> {
            self.log.prepares.set(self.log.prepares.get() + 1);
            Ok(())
        }
        fn on_start(&mut self) -> Result<()> {
            self.log.starts.set(self.log.starts.get() + 1);
            Ok(())
        }
        fn on_pause(&mut self) -> Result<()> {
            self.log.pauses.set(self.log.pauses.get() + 1);
            Ok(())
        }
        fn measure(&mut self, _channel: &str, drive: Option<(u32, f32)>) -> Vec<f32> {
            // Driven channels echo the source; idle channels count up so
            // tests can see sample ordering.
            match drive {
                Some((_, v)) => vec![v],
                None => {
                    let v = self.next.get();
                    self.next.set(v + 1.0);
                    vec![v]
                }
            }
        }
        fn control_transfer(&mut self, request: &ControlRequest) -> ControlReply {
            ControlReply {
                status: request.length as i32,
                data: vec![0; request.length as usize],
            }
        }
        fn enter_bootloader(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn test_device() -> (Device, Rc<HookLog>) {
        let log = Rc::new(HookLog::default());
        let channel = Channel::new("a", "Channel A").with_streams(vec![InputStream::new(
            "x", "Value", "V", 1.0, 0.0, 0.001, 1,
        )]);
        let device = Device::new(
            Box::new(TestDriver::new(Rc::clone(&log))),
            vec![channel],
            0.001,
        );
        (device, log)
    }

    fn fire_pending(device: &mut Device) {
        for event in device.take_pending() {
            event.notify();
        }
    }

    #[test]
    fn test_initial_state_is_inactive() {
        let (device, _) = test_device();
        assert_eq!(device.capture_state, CaptureState::Inactive);
        assert_eq!(device.id(), "test~0001");
    }

    #[test]
    fn test_prepare_start_pause_done_transitions() {
        let (mut device, log) = test_device();

        device.prepare_capture(0.1, false).unwrap();
        assert_eq!(device.capture_state, CaptureState::Ready);
        assert_eq!(device.capture_samples, 100);
        assert_eq!(log.prepares.get(), 1);

        device.start_capture().unwrap();
        assert_eq!(device.capture_state, CaptureState::Active);
        assert_eq!(log.starts.get(), 1);

        device.pause_capture().unwrap();
        assert_eq!(device.capture_state, CaptureState::Paused);
        assert_eq!(log.pauses.get(), 1);

        device.start_capture().unwrap();
        assert_eq!(device.capture_state, CaptureState::Active);

        device.done_capture().unwrap();
        assert_eq!(device.capture_state, CaptureState::Done);
        // done from active runs the pause hook once more
        assert_eq!(log.pauses.get(), 2);
    }

    #[test]
    fn test_start_is_idempotent_and_fires_single_event() {
        let (mut device, log) = test_device();
        let events = Rc::new(Cell::new(0));
        let listener = crate::event::EventListener::new();
        let count = Rc::clone(&events);
        listener.subscribe(&device.capture_state_changed, move || {
            count.set(count.get() + 1)
        });

        device.prepare_capture(0.1, false).unwrap();
        fire_pending(&mut device);
        assert_eq!(events.get(), 1);

        device.start_capture().unwrap();
        fire_pending(&mut device);
        assert_eq!(events.get(), 2);

        // Second start is a no-op: no hook call, no extra event.
        device.start_capture().unwrap();
        fire_pending(&mut device);
        assert_eq!(events.get(), 2);
        assert_eq!(log.starts.get(), 1);
    }

    #[test]
    fn test_invalid_transitions_are_noops() {
        let (mut device, log) = test_device();

        // Nothing armed yet: start/pause/done all stay Inactive.
        device.start_capture().unwrap();
        device.pause_capture().unwrap();
        device.done_capture().unwrap();
        assert_eq!(device.capture_state, CaptureState::Inactive);
        assert_eq!(log.starts.get(), 0);
        assert_eq!(log.pauses.get(), 0);

        device.prepare_capture(0.1, false).unwrap();
        device.pause_capture().unwrap();
        assert_eq!(device.capture_state, CaptureState::Ready);
        device.done_capture().unwrap();
        assert_eq!(device.capture_state, CaptureState::Ready);
    }

    #[test]
    fn test_prepare_while_active_pauses_first() {
        let (mut device, log) = test_device();
        device.prepare_capture(0.1, false).unwrap();
        device.start_capture().unwrap();

        device.prepare_capture(0.2, true).unwrap();
        assert_eq!(device.capture_state, CaptureState::Ready);
        assert_eq!(log.pauses.get(), 1);
        assert!(device.capture_continuous);
        assert_eq!(device.capture_samples, 200);
    }

    #[test]
    fn test_acquire_fills_streams_and_finishes() {
        let (mut device, _) = test_device();
        device.configure(0, 0.001, 4, false, false).unwrap();
        device.start_capture().unwrap();

        device.acquire(3).unwrap();
        assert_eq!(device.samples_acquired(), 3);
        assert_eq!(device.capture_state, CaptureState::Active);

        // Overshooting the target clamps to the buffer and finishes.
        device.acquire(10).unwrap();
        assert_eq!(device.samples_acquired(), 4);
        assert_eq!(device.capture_state, CaptureState::Done);

        let stream = device.channels[0].streams[0].clone();
        let stream = stream.borrow();
        assert_eq!(stream.fill(), 4);
        assert_eq!(stream.capacity(), 4);
        assert_eq!(stream.sample(0), Some(0.0));
        assert_eq!(stream.sample(3), Some(3.0));
    }

    #[test]
    fn test_start_after_done_rearms() {
        let (mut device, _) = test_device();
        device.configure(0, 0.001, 2, false, false).unwrap();
        device.start_capture().unwrap();
        device.acquire(2).unwrap();
        assert_eq!(device.capture_state, CaptureState::Done);

        let resets = Rc::new(Cell::new(0));
        let listener = crate::event::EventListener::new();
        let count = Rc::clone(&resets);
        listener.subscribe(&device.capture_reset, move || count.set(count.get() + 1));

        device.take_pending();
        device.start_capture().unwrap();
        fire_pending(&mut device);
        assert_eq!(device.capture_state, CaptureState::Active);
        assert_eq!(resets.get(), 1);
        assert_eq!(device.samples_acquired(), 0);
        assert_eq!(device.channels[0].streams[0].borrow().fill(), 0);
    }

    #[test]
    fn test_continuous_capture_sweeps_instead_of_finishing() {
        let (mut device, _) = test_device();
        device.configure(0, 0.001, 3, true, false).unwrap();
        device.start_capture().unwrap();

        device.acquire(3).unwrap();
        assert_eq!(device.capture_state, CaptureState::Active);
        assert_eq!(device.samples_acquired(), 3);

        // The next batch starts a fresh sweep.
        device.acquire(2).unwrap();
        assert_eq!(device.samples_acquired(), 2);
        assert_eq!(device.channels[0].streams[0].borrow().fill(), 2);
        assert_eq!(device.capture_state, CaptureState::Active);
    }

    #[test]
    fn test_set_output_drives_measurements() {
        let (mut device, _) = test_device();
        device.configure(0, 0.001, 4, false, false).unwrap();
        device
            .set_output("a", OutputSource::constant(1, 2.5))
            .unwrap();
        device.start_capture().unwrap();
        device.acquire(4).unwrap();

        let stream = device.channels[0].streams[0].clone();
        assert_eq!(stream.borrow().sample(0), Some(2.5));
        assert_eq!(stream.borrow().sample(3), Some(2.5));
    }

    #[test]
    fn test_set_output_unknown_channel() {
        let (mut device, _) = test_device();
        let err = device
            .set_output("zz", OutputSource::constant(1, 0.0))
            .unwrap_err();
        assert_eq!(err, CommandError::NotFound("Channel"));
    }

    #[test]
    fn test_registry_find_stream_names_missing_component() {
        let mut registry = Registry::new();
        let (device, _) = test_device();
        registry.add(Rc::new(RefCell::new(device)));

        let (dev, stream) = registry.find_stream("test~0001", "a", "x").unwrap();
        assert_eq!(dev.borrow().id(), "test~0001");
        assert_eq!(stream.borrow().id, "x");

        assert_eq!(
            registry.find_stream("nope~0", "a", "x").unwrap_err(),
            CommandError::NotFound("Device")
        );
        assert_eq!(
            registry.find_stream("test~0001", "b", "x").unwrap_err(),
            CommandError::NotFound("Channel")
        );
        assert_eq!(
            registry.find_stream("test~0001", "a", "y").unwrap_err(),
            CommandError::NotFound("Stream")
        );
    }

    #[test]
    fn test_registry_resolve_sole_device() {
        let mut registry = Registry::new();
        assert!(registry.resolve(None).is_err());

        let (device, _) = test_device();
        registry.add(Rc::new(RefCell::new(device)));
        let dev = registry.resolve(None).unwrap();
        assert_eq!(dev.borrow().id(), "test~0001");
        assert!(registry.resolve(Some("test~0001")).is_ok());
        assert_eq!(
            registry.resolve(Some("gone~9")).unwrap_err(),
            CommandError::NotFound("Device")
        );
    }
}
