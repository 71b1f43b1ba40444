// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Adaptive DC-offset and IQ-imbalance correction.
//!
//! One [`CorrectionUnit`] per stream per direction, operating in place on
//! sample blocks. All estimators are exponential moving averages (leaky
//! integrators) seeded at 0, so a freshly reset unit passes samples through
//! unchanged until the statistics build up. The estimates are rate-dependent;
//! the engine resets the unit whenever the stream's sample rate or placement
//! changes.

use serde::{Deserialize, Serialize};

use crate::Sample;

/// Smoothing factor for the DC bias trackers (~1k-sample window).
const DC_ALPHA: f32 = 1.0 / 1024.0;

/// Smoothing factor for the second-moment and imbalance trackers.
const IQ_ALPHA: f32 = 1.0 / 1024.0;

/// Correction mode for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionMode {
    /// Pass-through, no correction.
    #[default]
    None,
    /// DC-offset removal only.
    Dc,
    /// DC-offset removal plus amplitude/phase imbalance correction.
    DcAndIq,
}

/// Exponential moving average, `mean = mean * (1 - alpha) + x * alpha`.
#[derive(Debug, Clone, Copy)]
struct Ema {
    alpha: f32,
    value: f32,
}

impl Ema {
    fn new(alpha: f32) -> Self {
        Self { alpha, value: 0.0 }
    }

    fn feed(&mut self, x: f32) -> f32 {
        self.value = self.value * (1.0 - self.alpha) + x * self.alpha;
        self.value
    }

    fn value(&self) -> f32 {
        self.value
    }

    fn reset(&mut self) {
        self.value = 0.0;
    }
}

/// Per-stream adaptive corrector.
///
/// The I channel is the reference: it passes through the imbalance stage
/// unchanged, while Q is de-rotated by the estimated phase error and scaled
/// by the estimated amplitude ratio.
#[derive(Debug)]
pub struct CorrectionUnit {
    mode: CorrectionMode,
    i_beta: Ema,
    q_beta: Ema,
    avg_ii: Ema,
    avg_iq: Ema,
    avg_phi: Ema,
    avg_ii2: Ema,
    avg_qq2: Ema,
    avg_amp: Ema,
}

impl CorrectionUnit {
    /// Create a unit in the given mode with all estimators at their seed
    /// state.
    #[must_use]
    pub fn new(mode: CorrectionMode) -> Self {
        Self {
            mode,
            i_beta: Ema::new(DC_ALPHA),
            q_beta: Ema::new(DC_ALPHA),
            avg_ii: Ema::new(IQ_ALPHA),
            avg_iq: Ema::new(IQ_ALPHA),
            avg_phi: Ema::new(IQ_ALPHA),
            avg_ii2: Ema::new(IQ_ALPHA),
            avg_qq2: Ema::new(IQ_ALPHA),
            avg_amp: Ema::new(IQ_ALPHA),
        }
    }

    /// Current correction mode.
    #[must_use]
    pub fn mode(&self) -> CorrectionMode {
        self.mode
    }

    /// Change the correction mode, resetting the estimators if it differs
    /// from the current mode.
    pub fn set_mode(&mut self, mode: CorrectionMode) {
        if mode != self.mode {
            self.mode = mode;
            self.reset();
        }
    }

    /// Restore every estimator to its seed state (pass-through condition).
    pub fn reset(&mut self) {
        self.i_beta.reset();
        self.q_beta.reset();
        self.avg_ii.reset();
        self.avg_iq.reset();
        self.avg_phi.reset();
        self.avg_ii2.reset();
        self.avg_qq2.reset();
        self.avg_amp.reset();
    }

    /// Current DC bias estimate (I, Q).
    #[must_use]
    pub fn dc_estimate(&self) -> Sample {
        Sample::new(self.i_beta.value(), self.q_beta.value())
    }

    /// Current amplitude-ratio estimate (valid in `DcAndIq` mode).
    #[must_use]
    pub fn amplitude_estimate(&self) -> f32 {
        self.avg_amp.value()
    }

    /// Correct a block of samples in place.
    pub fn process(&mut self, samples: &mut [Sample]) {
        match self.mode {
            CorrectionMode::None => {}
            CorrectionMode::Dc => {
                for s in samples {
                    *s = self.correct_dc(*s);
                }
            }
            CorrectionMode::DcAndIq => {
                for s in samples {
                    let centered = self.correct_dc(*s);
                    *s = self.correct_imbalance(centered);
                }
            }
        }
    }

    fn correct_dc(&mut self, s: Sample) -> Sample {
        let i_bias = self.i_beta.feed(s.re);
        let q_bias = self.q_beta.feed(s.im);
        Sample::new(s.re - i_bias, s.im - q_bias)
    }

    fn correct_imbalance(&mut self, s: Sample) -> Sample {
        let (xi, xq) = (s.re, s.im);

        // phase error from the I*Q cross moment against the I power
        let avg_ii = self.avg_ii.feed(xi * xi);
        let avg_iq = self.avg_iq.feed(xi * xq);
        if avg_ii != 0.0 {
            self.avg_phi.feed(avg_iq / avg_ii);
        }

        let yi = xi;
        let yq = xq - self.avg_phi.value() * xi;

        // amplitude ratio from the de-rotated channel powers
        let avg_ii2 = self.avg_ii2.feed(yi * yi);
        let avg_qq2 = self.avg_qq2.feed(yq * yq);
        if avg_qq2 != 0.0 {
            self.avg_amp.feed((avg_ii2 / avg_qq2).sqrt());
        }

        Sample::new(yi, self.avg_amp.value() * yq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    fn tone(n: usize, cycles_per_sample: f32) -> Vec<Sample> {
        (0..n)
            .map(|k| {
                #[allow(clippy::cast_precision_loss, reason = "test signal synthesis")]
                let phase = TAU * cycles_per_sample * k as f32;
                Sample::new(phase.cos(), phase.sin())
            })
            .collect()
    }

    #[test]
    fn test_none_mode_passes_through() {
        let mut unit = CorrectionUnit::new(CorrectionMode::None);
        let original = tone(64, 0.01);
        let mut samples = original.clone();
        unit.process(&mut samples);
        assert_eq!(samples, original);
    }

    #[test]
    fn test_dc_bias_converges() {
        let mut unit = CorrectionUnit::new(CorrectionMode::Dc);
        let bias = Sample::new(0.25, -0.1);

        let mut tail_sum = Sample::new(0.0, 0.0);
        let mut tail_count = 0u32;
        for k in 0..8000 {
            let mut block = [bias];
            unit.process(&mut block);
            if k >= 7000 {
                tail_sum += block[0];
                tail_count += 1;
            }
        }

        let estimate = unit.dc_estimate();
        assert!((estimate.re - bias.re).abs() < 0.01);
        assert!((estimate.im - bias.im).abs() < 0.01);

        #[allow(clippy::cast_precision_loss, reason = "test accounting")]
        let tail_mean = tail_sum / tail_count as f32;
        assert!(tail_mean.re.abs() < 0.01);
        assert!(tail_mean.im.abs() < 0.01);
    }

    #[test]
    fn test_amplitude_imbalance_recovered() {
        let mut unit = CorrectionUnit::new(CorrectionMode::DcAndIq);

        // Q channel attenuated to half amplitude; the unit should settle on
        // an amplitude ratio of ~2 and restore Q to unity power.
        let mut samples = tone(60_000, 0.0113);
        for s in &mut samples {
            s.im *= 0.5;
        }
        unit.process(&mut samples);

        assert!((unit.amplitude_estimate() - 2.0).abs() < 0.1);

        let tail = &samples[samples.len() - 5000..];
        #[allow(clippy::cast_precision_loss, reason = "test accounting")]
        let n = tail.len() as f32;
        let i_power: f32 = tail.iter().map(|s| s.re * s.re).sum::<f32>() / n;
        let q_power: f32 = tail.iter().map(|s| s.im * s.im).sum::<f32>() / n;
        assert!((q_power / i_power - 1.0).abs() < 0.1);
    }

    #[test]
    fn test_balanced_tone_left_alone() {
        let mut unit = CorrectionUnit::new(CorrectionMode::DcAndIq);
        let mut samples = tone(60_000, 0.0113);
        unit.process(&mut samples);

        // ideal quadrature tone: phase estimate near 0, amplitude near 1
        assert!((unit.amplitude_estimate() - 1.0).abs() < 0.05);
        let last = samples[samples.len() - 1];
        assert!(last.norm() > 0.9 && last.norm() < 1.1);
    }

    #[test]
    fn test_reset_restores_pass_through() {
        let mut unit = CorrectionUnit::new(CorrectionMode::Dc);
        let mut block = vec![Sample::new(0.3, 0.3); 2000];
        unit.process(&mut block);
        assert!(unit.dc_estimate().re > 0.1);

        unit.reset();
        assert_eq!(unit.dc_estimate(), Sample::new(0.0, 0.0));

        // first sample after reset is corrected by only one EMA step
        let mut one = [Sample::new(1.0, 0.0)];
        unit.process(&mut one);
        assert!((one[0].re - (1.0 - 1.0 / 1024.0)).abs() < 1e-6);
    }
}
