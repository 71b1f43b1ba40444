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

//! Channel processor graph.
//!
//! Channel sinks consume corrected acquisition samples in arrival order;
//! channel sources feed the generation pump. Both receive a single batched
//! `stream_changed` notification per applied settings delta when the
//! effective sample rate or center frequency moves.

pub mod recorder;
pub mod spectrum;
pub mod tone;

pub use recorder::WavRecorder;
pub use spectrum::SpectrumSink;
pub use tone::ToneSource;

use crate::Sample;

/// Consumer of acquisition samples for one stream.
pub trait ChannelSink: Send {
    /// Deliver a block of corrected samples in arrival order.
    fn feed(&mut self, samples: &[Sample]);

    /// Batched notification of a new effective sample rate / center
    /// frequency, emitted once per applied settings delta.
    fn stream_changed(&mut self, sample_rate: u32, center_frequency: i64) {
        let _ = (sample_rate, center_frequency);
    }
}

/// Producer of generation samples for one stream.
pub trait ChannelSource: Send {
    /// Fill `out` completely with the next samples.
    fn pull(&mut self, out: &mut [Sample]);

    /// Batched notification of a new effective sample rate / center
    /// frequency, emitted once per applied settings delta.
    fn stream_changed(&mut self, sample_rate: u32, center_frequency: i64) {
        let _ = (sample_rate, center_frequency);
    }
}
