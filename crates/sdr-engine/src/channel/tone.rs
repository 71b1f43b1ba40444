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

//! Complex-exponential tone source for the generation direction.

use std::f32::consts::TAU;

use crate::channel::ChannelSource;
use crate::Sample;

/// Generates `amplitude * e^(j*2*pi*frequency*t)` at the stream sample rate.
#[derive(Debug)]
pub struct ToneSource {
    frequency: f64,
    sample_rate: u32,
    amplitude: f32,
    phase: f32,
    step: f32,
}

impl ToneSource {
    /// Create a tone at `frequency` Hz relative to baseband.
    #[must_use]
    pub fn new(frequency: f64, sample_rate: u32, amplitude: f32) -> Self {
        let mut source = Self {
            frequency,
            sample_rate,
            amplitude,
            phase: 0.0,
            step: 0.0,
        };
        source.update_step();
        source
    }

    fn update_step(&mut self) {
        #[allow(clippy::cast_possible_truncation, reason = "phase step fits f32")]
        let step = (std::f64::consts::TAU * self.frequency
            / f64::from(self.sample_rate.max(1))) as f32;
        self.step = step;
    }
}

impl ChannelSource for ToneSource {
    fn pull(&mut self, out: &mut [Sample]) {
        for s in out {
            *s = Sample::new(
                self.amplitude * self.phase.cos(),
                self.amplitude * self.phase.sin(),
            );
            self.phase += self.step;
            if self.phase > TAU {
                self.phase -= TAU;
            } else if self.phase < -TAU {
                self.phase += TAU;
            }
        }
    }

    fn stream_changed(&mut self, sample_rate: u32, _center_frequency: i64) {
        self.sample_rate = sample_rate;
        self.update_step();
    }
}
