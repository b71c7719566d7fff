//! Input stream: metadata plus the sample buffer for one measured quantity.

use crate::event::Event;
use tracing::warn;

/// Upper bound on a single capture buffer. Requests beyond it stand in for
/// allocation failure: the stream degrades to zero capacity instead of
/// aborting the process, and watches on it complete immediately.
pub const MAX_BUFFER_SAMPLES: usize = 1 << 26;

/// One measured quantity of a channel: identity, engineering-unit scaling,
/// and the capture buffer with its fill cursor.
pub struct InputStream {
    pub id: String,
    pub display_name: String,
    pub units: String,
    /// unit value = raw * scale + offset
    pub scale: f32,
    pub offset: f32,
    /// Nominal seconds between samples.
    pub sample_time: f32,
    /// Output mode tag that sources this stream's quantity; 0 when the
    /// quantity cannot be sourced.
    pub output_mode: u32,

    data: Vec<f32>,
    capacity: usize,

    /// Fires after one or more samples have been put. The producer fires it
    /// once per batch, not once per sample.
    pub data_received: Event,
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStream")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("units", &self.units)
            .field("scale", &self.scale)
            .field("offset", &self.offset)
            .field("sample_time", &self.sample_time)
            .field("output_mode", &self.output_mode)
            .field("capacity", &self.capacity)
            .field("len", &self.data.len())
            .finish()
    }
}

impl InputStream {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        units: impl Into<String>,
        scale: f32,
        offset: f32,
        sample_time: f32,
        output_mode: u32,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            units: units.into(),
            scale,
            offset,
            sample_time,
            output_mode,
            data: Vec::new(),
            capacity: 0,
            data_received: Event::new(),
        }
    }

    /// Allocates space for `size` samples, discarding previous contents and
    /// resetting the fill cursor. Capacity is fixed until the next allocate.
    pub fn allocate(&mut self, size: usize) {
        if size > MAX_BUFFER_SAMPLES {
            warn!(
                stream = %self.id,
                requested = size,
                "capture buffer request too large, degrading stream to zero capacity"
            );
            self.data = Vec::new();
            self.capacity = 0;
            return;
        }
        self.data = Vec::with_capacity(size);
        self.capacity = size;
    }

    /// Drops buffered samples but keeps the allocation, for re-arming a
    /// capture at the same length.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Stores one sample. Returns false (sample dropped) when the buffer is
    /// full; the fill cursor never passes the allocated bound.
    pub fn put(&mut self, value: f32) -> bool {
        if self.data.len() < self.capacity {
            self.data.push(value);
            true
        } else {
            false
        }
    }

    /// Count of valid samples.
    pub fn fill(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    pub fn sample(&self, index: usize) -> Option<f32> {
        self.data.get(index).copied()
    }

    /// Converts an engineering-unit value back to raw counts.
    pub fn to_raw(&self, unit_value: f32) -> f32 {
        if self.scale == 0.0 {
            0.0
        } else {
            (unit_value - self.offset) / self.scale
        }
    }
}
