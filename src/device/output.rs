//! Output waveform sources bound to channels.
//!
//! Each variant is pure given a sample index: the same index always yields
//! the same value. Periodic variants carry a phase that can be recomputed on
//! activation so the waveform position is continuous across a source switch.

use crate::protocol::CommandError;
use serde_json::{json, Value};

/// Phase-carrying parameters shared by the periodic variants.
#[derive(Debug, Clone, PartialEq)]
pub struct Periodic {
    pub offset: f32,
    pub amplitude: f32,
    pub period: f32,
    pub phase: f32,
    pub relative_phase: bool,
}

impl Periodic {
    /// Recomputes the phase so the fractional cycle position at `sample`
    /// matches where `prev` was, instead of restarting at phase zero.
    fn continue_from(&mut self, sample: usize, prev: &Periodic) {
        if !self.relative_phase {
            return;
        }
        let s = sample as f32;
        let frac = (s + prev.phase).rem_euclid(prev.period) / prev.period;
        self.phase = (frac * self.period - s).rem_euclid(self.period);
    }

    /// Fractional position in the cycle at `sample`, in [0, 1).
    pub fn cycle_position(&self, sample: usize) -> f32 {
        (sample as f32 + self.phase).rem_euclid(self.period) / self.period
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Waveform {
    Constant {
        value: f32,
    },
    Square {
        high: f32,
        low: f32,
        high_samples: u32,
        low_samples: u32,
        phase: u32,
    },
    Sine(Periodic),
    Triangle(Periodic),
}

/// An output generator bound to a channel, with its activation bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSource {
    pub mode: u32,
    /// Output sample index at which this source became active.
    pub start_sample: usize,
    /// Sample index at which the value takes effect on the hardware.
    pub effective: usize,
    pub waveform: Waveform,
}

impl OutputSource {
    pub fn constant(mode: u32, value: f32) -> Self {
        Self {
            mode,
            start_sample: 0,
            effective: 0,
            waveform: Waveform::Constant { value },
        }
    }

    /// Builds a source from the body of a `set` command.
    pub fn from_json(n: &Value) -> Result<Self, CommandError> {
        let kind = n
            .get("source")
            .and_then(Value::as_str)
            .ok_or_else(|| CommandError::invalid("missing source tag"))?;
        let mode = req_u32(n, "mode")?;

        let waveform = match kind {
            "constant" => Waveform::Constant {
                value: req_f32(n, "value")?,
            },
            "square" => {
                let high_samples = req_u32(n, "highSamples")?;
                let low_samples = req_u32(n, "lowSamples")?;
                if high_samples + low_samples == 0 {
                    return Err(CommandError::invalid("square wave period is zero"));
                }
                Waveform::Square {
                    high: req_f32(n, "high")?,
                    low: req_f32(n, "low")?,
                    high_samples,
                    low_samples,
                    phase: opt_u32(n, "phase", 0)?,
                }
            }
            "sine" | "triangle" => {
                let periodic = Periodic {
                    offset: req_f32(n, "offset")?,
                    amplitude: req_f32(n, "amplitude")?,
                    period: req_f32(n, "period")?,
                    phase: opt_f32(n, "phase", 0.0)?,
                    relative_phase: n.get("relPhase").and_then(Value::as_bool).unwrap_or(true),
                };
                if !(periodic.period > 0.0) {
                    return Err(CommandError::invalid("period must be positive"));
                }
                if kind == "sine" {
                    Waveform::Sine(periodic)
                } else {
                    Waveform::Triangle(periodic)
                }
            }
            other => {
                return Err(CommandError::invalid(format!(
                    "unrecognized source '{other}'"
                )))
            }
        };

        Ok(Self {
            mode,
            start_sample: 0,
            effective: 0,
            waveform,
        })
    }

    /// Marks the source active starting at `sample`, carrying the cycle
    /// position over from a previous periodic source when requested.
    pub fn activate(&mut self, sample: usize, prev: Option<&OutputSource>) {
        self.start_sample = sample;
        self.effective = sample;
        let prev_periodic = match prev.map(|p| &p.waveform) {
            Some(Waveform::Sine(p)) | Some(Waveform::Triangle(p)) => Some(p.clone()),
            _ => None,
        };
        if let Some(prev) = prev_periodic {
            match &mut self.waveform {
                Waveform::Sine(p) | Waveform::Triangle(p) => p.continue_from(sample, &prev),
                _ => {}
            }
        }
    }

    /// The next value to drive at `sample`.
    pub fn value(&self, sample: usize, _sample_time: f32) -> f32 {
        match &self.waveform {
            Waveform::Constant { value } => *value,
            Waveform::Square {
                high,
                low,
                high_samples,
                low_samples,
                phase,
            } => {
                let period = (*high_samples + *low_samples) as usize;
                let s = (sample + *phase as usize) % period;
                if s < *low_samples as usize {
                    *low
                } else {
                    *high
                }
            }
            Waveform::Sine(p) => {
                ((sample as f32 + p.phase) * std::f32::consts::TAU / p.period).sin() * p.amplitude
                    + p.offset
            }
            Waveform::Triangle(p) => {
                (((sample as f32 + p.phase).rem_euclid(p.period) / p.period * 2.0 - 1.0).abs()
                    * 2.0
                    - 1.0)
                    * p.amplitude
                    + p.offset
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.waveform {
            Waveform::Constant { .. } => "constant",
            Waveform::Square { .. } => "square",
            Waveform::Sine(_) => "sine",
            Waveform::Triangle(_) => "triangle",
        }
    }

    /// Fields for the `outputChanged` broadcast.
    pub fn describe(&self) -> Value {
        let mut n = json!({
            "mode": self.mode,
            "startSample": self.start_sample,
            "effective": self.effective,
            "source": self.kind(),
        });
        match &self.waveform {
            Waveform::Constant { value } => {
                n["value"] = json!(value);
            }
            Waveform::Square {
                high,
                low,
                high_samples,
                low_samples,
                ..
            } => {
                n["high"] = json!(high);
                n["low"] = json!(low);
                n["highSamples"] = json!(high_samples);
                n["lowSamples"] = json!(low_samples);
            }
            Waveform::Sine(p) | Waveform::Triangle(p) => {
                n["offset"] = json!(p.offset);
                n["amplitude"] = json!(p.amplitude);
                n["period"] = json!(p.period);
            }
        }
        n
    }
}

fn req_f32(n: &Value, key: &str) -> Result<f32, CommandError> {
    n.get(key)
        .and_then(Value::as_f64)
        .map(|v| v as f32)
        .ok_or_else(|| CommandError::invalid(format!("missing or non-numeric field '{key}'")))
}

fn opt_f32(n: &Value, key: &str, default: f32) -> Result<f32, CommandError> {
    match n.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| CommandError::invalid(format!("non-numeric field '{key}'"))),
    }
}

fn req_u32(n: &Value, key: &str) -> Result<u32, CommandError> {
    n.get(key)
        .and_then(Value::as_u64)
        .filter(|v| *v <= u32::MAX as u64)
        .map(|v| v as u32)
        .ok_or_else(|| CommandError::invalid(format!("missing or non-integer field '{key}'")))
}

fn opt_u32(n: &Value, key: &str, default: u32) -> Result<u32, CommandError> {
    match n.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .filter(|v| *v <= u32::MAX as u64)
            .map(|v| v as u32)
            .ok_or_else(|| CommandError::invalid(format!("non-integer field '{key}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(period: f32, phase: f32) -> OutputSource {
        OutputSource::from_json(&json!({
            "source": "sine", "mode": 1,
            "offset": 0.0, "amplitude": 1.0, "period": period, "phase": phase,
        }))
        .unwrap()
    }

    #[test]
    fn test_constant_ignores_index() {
        let src = OutputSource::constant(1, 2.5);
        assert_eq!(src.value(0, 0.001), 2.5);
        assert_eq!(src.value(12345, 0.001), 2.5);
    }

    #[test]
    fn test_square_wave_levels() {
        let src = OutputSource::from_json(&json!({
            "source": "square", "mode": 1,
            "high": 3.0, "low": -3.0, "highSamples": 2, "lowSamples": 3,
        }))
        .unwrap();
        // Period 5: indices 0..3 low, 3..5 high.
        let expected = [-3.0, -3.0, -3.0, 3.0, 3.0, -3.0, -3.0];
        for (i, want) in expected.iter().enumerate() {
            assert_eq!(src.value(i, 0.001), *want, "sample {i}");
        }
    }

    #[test]
    fn test_sine_values() {
        let src = sine(100.0, 0.0);
        assert!((src.value(0, 0.001) - 0.0).abs() < 1e-5);
        assert!((src.value(25, 0.001) - 1.0).abs() < 1e-5);
        assert!((src.value(50, 0.001) - 0.0).abs() < 1e-4);
        assert!((src.value(75, 0.001) + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_triangle_values() {
        let src = OutputSource::from_json(&json!({
            "source": "triangle", "mode": 1,
            "offset": 0.0, "amplitude": 2.0, "period": 8.0,
        }))
        .unwrap();
        // Ramps -2 -> +2 over the first half period, back down over the second.
        assert_eq!(src.value(0, 0.001), 2.0);
        assert_eq!(src.value(2, 0.001), 0.0);
        assert_eq!(src.value(4, 0.001), -2.0);
        assert_eq!(src.value(6, 0.001), 0.0);
        assert_eq!(src.value(8, 0.001), 2.0);
    }

    #[test]
    fn test_relative_phase_preserves_cycle_position() {
        // A sine at period 100, phase 0 sits at 0.25 of its cycle at
        // sample 25; the replacing triangle must resume from the same
        // fractional position.
        let prev = sine(100.0, 0.0);
        let mut next = OutputSource::from_json(&json!({
            "source": "triangle", "mode": 1,
            "offset": 0.0, "amplitude": 1.0, "period": 60.0, "relPhase": true,
        }))
        .unwrap();
        next.activate(25, Some(&prev));

        let pos = match &next.waveform {
            Waveform::Triangle(p) => p.cycle_position(25),
            other => panic!("unexpected waveform {other:?}"),
        };
        assert!((pos - 0.25).abs() < 1e-4, "cycle position was {pos}");
        assert_eq!(next.start_sample, 25);
    }

    #[test]
    fn test_relative_phase_disabled_keeps_requested_phase() {
        let prev = sine(100.0, 0.0);
        let mut next = OutputSource::from_json(&json!({
            "source": "sine", "mode": 1,
            "offset": 0.0, "amplitude": 1.0, "period": 60.0, "phase": 5.0,
            "relPhase": false,
        }))
        .unwrap();
        next.activate(25, Some(&prev));
        match &next.waveform {
            Waveform::Sine(p) => assert_eq!(p.phase, 5.0),
            other => panic!("unexpected waveform {other:?}"),
        }
    }

    #[test]
    fn test_activation_after_constant_resets_phase() {
        let prev = OutputSource::constant(1, 1.0);
        let mut next = sine(100.0, 0.0);
        next.activate(40, Some(&prev));
        match &next.waveform {
            Waveform::Sine(p) => assert_eq!(p.phase, 0.0),
            other => panic!("unexpected waveform {other:?}"),
        }
        assert_eq!(next.start_sample, 40);
        assert_eq!(next.effective, 40);
    }

    #[test]
    fn test_missing_fields_and_unknown_tags_rejected() {
        let err = OutputSource::from_json(&json!({"source": "sine", "mode": 1})).unwrap_err();
        assert!(matches!(err, CommandError::InvalidParameter(_)));

        let err = OutputSource::from_json(&json!({"source": "sawtooth", "mode": 1})).unwrap_err();
        assert!(err.to_string().contains("sawtooth"));

        let err = OutputSource::from_json(&json!({
            "source": "square", "mode": 1,
            "high": 1.0, "low": 0.0, "highSamples": 0, "lowSamples": 0,
        }))
        .unwrap_err();
        assert!(matches!(err, CommandError::InvalidParameter(_)));
    }

    #[test]
    fn test_describe_includes_variant_fields() {
        let mut src = sine(100.0, 0.0);
        src.activate(10, None);
        let n = src.describe();
        assert_eq!(n["source"], "sine");
        assert_eq!(n["mode"], 1);
        assert_eq!(n["startSample"], 10);
        assert_eq!(n["effective"], 10);
        assert_eq!(n["period"], 100.0);
    }
}
