//! Tuning Planner
//!
//! Splits a requested RF frequency into the analog LO setting, the digital
//! up/down-converter shift and the residual quantization error.

use crate::types::TuneResult;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Tuning errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TuneError {
    #[error("Invalid frequency: {0} Hz")]
    InvalidFrequency(f64),

    #[error("Frequency {0} Hz is not reachable with the configured LO range and mixer span")]
    OutOfRange(f64),

    #[error("Invalid tuning parameters: {0}")]
    InvalidParams(String),
}

/// Usable range of the digital mixer shift
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MixerSpan {
    /// Full complex Nyquist band, `-clock/2 ..= clock/2`
    Nyquist,
    /// Positive shifts only, `0 ..= clock/2`
    UpperHalf,
    /// Explicit signed range in Hz
    Range { min: f64, max: f64 },
}

impl MixerSpan {
    /// Signed bounds of the span for a given converter clock
    pub fn bounds(&self, clock_rate: f64) -> (f64, f64) {
        match *self {
            MixerSpan::Nyquist => (-clock_rate / 2.0, clock_rate / 2.0),
            MixerSpan::UpperHalf => (0.0, clock_rate / 2.0),
            MixerSpan::Range { min, max } => (min, max),
        }
    }
}

impl Default for MixerSpan {
    fn default() -> Self {
        MixerSpan::Nyquist
    }
}

/// Front-end and converter parameters used by the planner
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuneParams {
    /// Converter clock rate in Hz
    #[serde(default = "default_clock_rate")]
    pub clock_rate: f64,
    /// Phase accumulator width in bits
    #[serde(default = "default_phase_bits")]
    pub phase_bits: u32,
    /// Analog LO step size in Hz
    #[serde(default = "default_lo_step")]
    pub lo_step: f64,
    /// Lowest analog LO setting in Hz
    #[serde(default)]
    pub lo_min: f64,
    /// Highest analog LO setting in Hz
    #[serde(default = "default_lo_max")]
    pub lo_max: f64,
    /// Usable digital mixer span
    #[serde(default)]
    pub mixer_span: MixerSpan,
}

fn default_clock_rate() -> f64 {
    100e6
}

fn default_phase_bits() -> u32 {
    32
}

fn default_lo_step() -> f64 {
    1e6
}

fn default_lo_max() -> f64 {
    4e9
}

impl Default for TuneParams {
    fn default() -> Self {
        Self {
            clock_rate: default_clock_rate(),
            phase_bits: default_phase_bits(),
            lo_step: default_lo_step(),
            lo_min: 0.0,
            lo_max: default_lo_max(),
            mixer_span: MixerSpan::default(),
        }
    }
}

impl TuneParams {
    /// Frequency resolution of one phase accumulator step
    pub fn dxc_resolution(&self) -> f64 {
        self.clock_rate / 2f64.powi(self.phase_bits as i32)
    }

    /// Check the parameters for consistency
    pub fn validate(&self) -> Result<(), TuneError> {
        if !(self.clock_rate.is_finite() && self.clock_rate > 0.0) {
            return Err(TuneError::InvalidParams(format!("clock_rate {}", self.clock_rate)));
        }
        if self.phase_bits == 0 || self.phase_bits > 48 {
            return Err(TuneError::InvalidParams(format!("phase_bits {}", self.phase_bits)));
        }
        if !(self.lo_step.is_finite() && self.lo_step > 0.0) {
            return Err(TuneError::InvalidParams(format!("lo_step {}", self.lo_step)));
        }
        if !(self.lo_min.is_finite() && self.lo_max.is_finite()) || self.lo_min > self.lo_max {
            return Err(TuneError::InvalidParams(format!(
                "lo range {}..{}", self.lo_min, self.lo_max
            )));
        }
        let (min, max) = self.mixer_span.bounds(self.clock_rate);
        if !(min.is_finite() && max.is_finite()) || min > max {
            return Err(TuneError::InvalidParams(format!("mixer span {}..{}", min, max)));
        }
        Ok(())
    }

    /// Round a digital shift to phase accumulator granularity
    fn quantize(&self, freq: f64) -> f64 {
        let scale = 2f64.powi(self.phase_bits as i32);
        let word = (freq * scale / self.clock_rate).round();
        word * (self.clock_rate / scale)
    }
}

/// Plan a tune to `requested` Hz
///
/// The analog LO is the realizable step nearest to the request whose remaining
/// offset fits the mixer span. When only the negated offset fits, the mixer
/// runs in the opposite direction and the result is flagged as spectrum
/// inverted. Identical inputs always yield identical output.
pub fn plan_tune(requested: f64, params: &TuneParams) -> Result<TuneResult, TuneError> {
    params.validate()?;
    if !requested.is_finite() || requested < 0.0 {
        return Err(TuneError::InvalidFrequency(requested));
    }

    let (span_min, span_max) = params.mixer_span.bounds(params.clock_rate);
    let reach = span_min.abs().max(span_max.abs());

    // Realizable LO multiples that could leave an offset within reach
    let k_lo = ((requested - reach) / params.lo_step)
        .floor()
        .max((params.lo_min / params.lo_step).ceil());
    let k_hi = ((requested + reach) / params.lo_step)
        .ceil()
        .min((params.lo_max / params.lo_step).floor());
    if k_lo > k_hi {
        return Err(TuneError::OutOfRange(requested));
    }

    let k0 = (requested / params.lo_step).round().clamp(k_lo, k_hi);
    let fits = |offset: f64| offset >= span_min && offset <= span_max;

    // Walk outward from the nearest candidate, closest first
    let mut below = k0 - 1.0;
    let mut above = k0 + 1.0;
    let mut next = Some(k0);

    while let Some(k) = next {
        let baseband_freq = k * params.lo_step;
        let ideal_dxc = requested - baseband_freq;

        let plan = if fits(ideal_dxc) {
            Some((params.quantize(ideal_dxc), false))
        } else if fits(-ideal_dxc) {
            Some((params.quantize(-ideal_dxc), true))
        } else {
            None
        };

        if let Some((dxc_freq, spectrum_inverted)) = plan {
            let applied = if spectrum_inverted { -dxc_freq } else { dxc_freq };
            let result = TuneResult {
                baseband_freq,
                dxc_freq,
                residual_freq: requested - baseband_freq - applied,
                spectrum_inverted,
            };
            trace!(
                "Tune plan for {} Hz: baseband={} dxc={} residual={} inverted={}",
                requested, result.baseband_freq, result.dxc_freq,
                result.residual_freq, result.spectrum_inverted
            );
            return Ok(result);
        }

        let below_ok = below >= k_lo;
        let above_ok = above <= k_hi;
        next = match (below_ok, above_ok) {
            (true, true) => {
                let d_below = (requested - below * params.lo_step).abs();
                let d_above = (above * params.lo_step - requested).abs();
                if d_below <= d_above {
                    below -= 1.0;
                    Some(below + 1.0)
                } else {
                    above += 1.0;
                    Some(above - 1.0)
                }
            }
            (true, false) => {
                below -= 1.0;
                Some(below + 1.0)
            }
            (false, true) => {
                above += 1.0;
                Some(above - 1.0)
            }
            (false, false) => None,
        };
    }

    Err(TuneError::OutOfRange(requested))
}
