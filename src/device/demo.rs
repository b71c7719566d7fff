//! Simulated source-measure instrument.
//!
//! Stands in for real USB hardware: two channels, each sourcing voltage or
//! current into a configurable load and measuring both quantities back. A
//! clock thread paces acquisition by posting tick events to the engine; all
//! sample synthesis happens on the engine thread when the tick is handled.

use super::{
    Channel, ControlReply, ControlRequest, DeviceDriver, Device, CaptureConfig, InputStream,
};
use crate::server::engine::{EngineMsg, HwEvent};
use anyhow::Result;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Output mode sourcing a channel's voltage stream.
pub const MODE_SVMI: u32 = 1;
/// Output mode sourcing a channel's current stream.
pub const MODE_SIMV: u32 = 2;

const REGISTER_SPACE: usize = 256;

#[derive(Debug, Clone)]
pub struct DemoSettings {
    pub serial: String,
    /// Load resistance the sourced channel drives, in ohms.
    pub load_ohms: f32,
    /// Uniform measurement noise amplitude, in stream units.
    pub noise: f32,
    pub tick_interval_ms: u64,
    pub sample_time: f32,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            serial: "0001".to_string(),
            load_ohms: 1000.0,
            noise: 0.0,
            tick_interval_ms: 10,
            sample_time: 0.0001,
        }
    }
}

struct ClockShared {
    running: AtomicBool,
    shutdown: AtomicBool,
    sample_time_bits: AtomicU32,
}

impl ClockShared {
    fn sample_time(&self) -> f32 {
        f32::from_bits(self.sample_time_bits.load(Ordering::Relaxed))
    }
}

pub struct DemoDriver {
    serial: String,
    load_ohms: f32,
    noise: f32,
    registers: [u8; REGISTER_SPACE],
    clock: Arc<ClockShared>,
}

impl DemoDriver {
    pub fn new(settings: &DemoSettings) -> Self {
        Self {
            serial: settings.serial.clone(),
            load_ohms: settings.load_ohms.max(1.0),
            noise: settings.noise.max(0.0),
            registers: [0; REGISTER_SPACE],
            clock: Arc::new(ClockShared {
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                sample_time_bits: AtomicU32::new(settings.sample_time.to_bits()),
            }),
        }
    }

    /// Starts the pacing thread. It posts a tick per interval while the
    /// capture is running and exits when the driver is dropped or the
    /// engine goes away.
    fn spawn_clock(&self, device_id: String, interval_ms: u64, tx: tokio::sync::mpsc::Sender<EngineMsg>) {
        let shared = Arc::clone(&self.clock);
        let interval = Duration::from_millis(interval_ms.max(1));
        let spawned = thread::Builder::new()
            .name(format!("clock-{device_id}"))
            .spawn(move || {
                while !shared.shutdown.load(Ordering::Relaxed) {
                    thread::sleep(interval);
                    if !shared.running.load(Ordering::Relaxed) {
                        continue;
                    }
                    let sample_time = shared.sample_time().max(1e-9);
                    let samples = ((interval.as_secs_f32() / sample_time).round() as usize).max(1);
                    let msg = EngineMsg::Hardware(HwEvent::Tick {
                        device_id: device_id.clone(),
                        samples,
                    });
                    if tx.blocking_send(msg).is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("failed to spawn demo clock thread: {e}");
        }
    }

    fn noise(&self) -> f32 {
        if self.noise > 0.0 {
            rand::thread_rng().gen_range(-self.noise..=self.noise)
        } else {
            0.0
        }
    }
}

impl Drop for DemoDriver {
    fn drop(&mut self) {
        self.clock.shutdown.store(true, Ordering::Relaxed);
    }
}

impl DeviceDriver for DemoDriver {
    fn model(&self) -> &str {
        "demo"
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    fn hw_version(&self) -> &str {
        "1.0"
    }

    fn fw_version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn on_prepare(&mut self, config: &CaptureConfig) -> Result<()> {
        self.clock
            .sample_time_bits
            .store(config.sample_time.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn on_start(&mut self) -> Result<()> {
        self.clock.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn on_pause(&mut self) -> Result<()> {
        self.clock.running.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn measure(&mut self, _channel: &str, drive: Option<(u32, f32)>) -> Vec<f32> {
        let (volts, milliamps) = match drive {
            Some((MODE_SVMI, v)) => (v, v / self.load_ohms * 1000.0),
            Some((MODE_SIMV, ma)) => (ma / 1000.0 * self.load_ohms, ma),
            // Unbound or high-impedance: the channel floats.
            _ => (0.0, 0.0),
        };
        vec![volts + self.noise(), milliamps + self.noise()]
    }

    fn control_transfer(&mut self, request: &ControlRequest) -> ControlReply {
        // A tiny register file keeps the pass-through path exercisable
        // without hardware: wValue addresses, wLength counts bytes.
        let start = (request.value as usize) % REGISTER_SPACE;
        let len = (request.length as usize).min(REGISTER_SPACE - start);
        if request.is_in() {
            ControlReply {
                status: len as i32,
                data: self.registers[start..start + len].to_vec(),
            }
        } else {
            let len = len.min(request.data.len());
            self.registers[start..start + len].copy_from_slice(&request.data[..len]);
            ControlReply {
                status: len as i32,
                data: Vec::new(),
            }
        }
    }

    fn enter_bootloader(&mut self) -> Result<()> {
        debug!(serial = %self.serial, "demo device has no bootloader, ignoring");
        Ok(())
    }
}

/// Builds the demo device and starts its pacing clock.
pub fn create_device(settings: &DemoSettings, tx: tokio::sync::mpsc::Sender<EngineMsg>) -> Device {
    let driver = DemoDriver::new(settings);
    let device_id = format!("{}~{}", driver.model(), driver.serial());
    driver.spawn_clock(device_id, settings.tick_interval_ms, tx);

    let channels = ["a", "b"]
        .iter()
        .map(|id| {
            Channel::new(*id, format!("Channel {}", id.to_uppercase())).with_streams(vec![
                InputStream::new(
                    "v",
                    "Voltage",
                    "V",
                    10.0 / 4095.0,
                    -5.0,
                    settings.sample_time,
                    MODE_SVMI,
                ),
                InputStream::new(
                    "i",
                    "Current",
                    "mA",
                    400.0 / 4095.0,
                    -200.0,
                    settings.sample_time,
                    MODE_SIMV,
                ),
            ])
        })
        .collect();

    Device::new(Box::new(driver), channels, settings.sample_time)
}
