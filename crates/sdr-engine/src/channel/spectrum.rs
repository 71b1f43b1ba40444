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

//! FFT spectrum tap.
//!
//! A [`SpectrumSink`] attaches to an acquisition stream, collects
//! power-of-two frames, runs a forward FFT, and delivers dB magnitude frames
//! over an async channel. Delivery is lossy: when the consumer lags, frames
//! are dropped rather than stalling the pump.

use std::sync::Arc;

use log::debug;
use rustfft::{Fft, FftPlanner};
use tokio::sync::mpsc;

use crate::channel::ChannelSink;
use crate::Sample;

/// Floor in dB for zero-magnitude bins.
const DB_FLOOR: f32 = -100.0;

/// FFT spectrum sink delivering `Vec<f32>` dB frames.
pub struct SpectrumSink {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    accumulator: Vec<Sample>,
    scratch: Vec<Sample>,
    tx: mpsc::Sender<Vec<f32>>,
    frames_sent: u64,
    frames_dropped: u64,
}

impl std::fmt::Debug for SpectrumSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumSink")
            .field("fft_size", &self.fft_size)
            .field("frames_sent", &self.frames_sent)
            .field("frames_dropped", &self.frames_dropped)
            .finish_non_exhaustive()
    }
}

impl SpectrumSink {
    /// Create a sink producing frames of `fft_size` bins, buffering up to
    /// `channel_capacity` frames toward the consumer.
    ///
    /// # Panics
    /// Panics if `fft_size` is not a power of two.
    #[must_use]
    pub fn new(fft_size: usize, channel_capacity: usize) -> (Self, mpsc::Receiver<Vec<f32>>) {
        assert!(fft_size.is_power_of_two(), "FFT size must be a power of two");
        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        let scratch = vec![Sample::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        let (tx, rx) = mpsc::channel(channel_capacity);
        (
            Self {
                fft,
                fft_size,
                accumulator: Vec::with_capacity(fft_size),
                scratch,
                tx,
                frames_sent: 0,
                frames_dropped: 0,
            },
            rx,
        )
    }

    fn emit_frame(&mut self) {
        let mut frame: Vec<Sample> = self.accumulator.drain(..self.fft_size).collect();
        self.fft.process_with_scratch(&mut frame, &mut self.scratch);

        // magnitude to dB, normalized by FFT size: 20*log10(mag) - 20*log10(N)
        #[allow(clippy::cast_precision_loss, reason = "FFT size to f32 is acceptable")]
        let normalization_db = 20.0 * (self.fft_size as f32).log10();
        let spectrum: Vec<f32> = frame
            .iter()
            .map(|bin| {
                let mag = bin.norm();
                if mag > 0.0 {
                    (20.0 * mag.log10() - normalization_db).max(DB_FLOOR)
                } else {
                    DB_FLOOR
                }
            })
            .collect();

        // non-blocking: drop the frame when the consumer lags
        if self.tx.try_send(spectrum).is_ok() {
            self.frames_sent += 1;
        } else {
            self.frames_dropped += 1;
        }

        let total = self.frames_sent + self.frames_dropped;
        if total % 256 == 0 {
            debug!(
                "spectrum: {} frames sent, {} dropped",
                self.frames_sent, self.frames_dropped
            );
        }
    }
}

impl ChannelSink for SpectrumSink {
    fn feed(&mut self, samples: &[Sample]) {
        self.accumulator.extend_from_slice(samples);
        while self.accumulator.len() >= self.fft_size {
            self.emit_frame();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    #[test]
    fn test_frames_sized_to_fft() {
        let (mut sink, mut rx) = SpectrumSink::new(64, 8);
        sink.feed(&vec![Sample::new(0.0, 0.0); 200]);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.len(), 64);
        // 200 samples = 3 full frames
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_zero_input_hits_floor() {
        let (mut sink, mut rx) = SpectrumSink::new(32, 4);
        sink.feed(&vec![Sample::new(0.0, 0.0); 32]);
        let frame = rx.try_recv().unwrap();
        assert!(frame.iter().all(|&db| (db - DB_FLOOR).abs() < f32::EPSILON));
    }

    #[test]
    fn test_tone_peaks_in_expected_bin() {
        let size = 64;
        let (mut sink, mut rx) = SpectrumSink::new(size, 4);
        // complex tone at bin 8
        #[allow(clippy::cast_precision_loss, reason = "test signal synthesis")]
        let samples: Vec<Sample> = (0..size)
            .map(|n| {
                let phase = TAU * 8.0 * n as f32 / size as f32;
                Sample::new(phase.cos(), phase.sin())
            })
            .collect();
        sink.feed(&samples);
        let frame = rx.try_recv().unwrap();
        let peak = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 8);
    }

    #[test]
    fn test_drop_on_full_channel() {
        let (mut sink, mut rx) = SpectrumSink::new(32, 1);
        sink.feed(&vec![Sample::new(1.0, 0.0); 32 * 5]);
        // capacity 1: exactly one frame queued, the rest dropped
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(sink.frames_dropped, 4);
    }
}
