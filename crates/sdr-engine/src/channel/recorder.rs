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

//! WAV recording sink.
//!
//! Records an acquisition stream to a 16-bit stereo WAV file, I on the left
//! channel and Q on the right, the same layout the WAV playback driver reads.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use log::{error, info, warn};

use crate::channel::ChannelSink;
use crate::Sample;

/// Channel sink that writes samples to a WAV file.
pub struct WavRecorder {
    writer: Option<WavWriter<BufWriter<File>>>,
    path: PathBuf,
    sample_rate: u32,
    samples_written: u64,
}

impl std::fmt::Debug for WavRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavRecorder")
            .field("path", &self.path)
            .field("sample_rate", &self.sample_rate)
            .field("samples_written", &self.samples_written)
            .finish_non_exhaustive()
    }
}

impl WavRecorder {
    /// Open a recorder writing to `path` at the given sample rate.
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> hound::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let spec = WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec)?;
        info!("recording to {} at {sample_rate} Hz", path.display());
        Ok(Self {
            writer: Some(writer),
            path,
            sample_rate,
            samples_written: 0,
        })
    }

    /// Timestamped default file name, e.g. `capture_20250824_153000.wav`.
    #[must_use]
    pub fn default_name() -> String {
        format!("capture_{}.wav", chrono::Local::now().format("%Y%m%d_%H%M%S"))
    }

    /// Number of complex samples written so far.
    #[must_use]
    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// Flush headers and close the file. Called automatically on drop.
    pub fn finalize(&mut self) {
        if let Some(writer) = self.writer.take() {
            match writer.finalize() {
                Ok(()) => info!(
                    "finalized {} ({} samples)",
                    self.path.display(),
                    self.samples_written
                ),
                Err(e) => error!("failed to finalize {}: {e}", self.path.display()),
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, reason = "value clamped to i16 range")]
    fn to_i16(value: f32) -> i16 {
        (value * 32767.0).clamp(-32768.0, 32767.0) as i16
    }
}

impl ChannelSink for WavRecorder {
    fn feed(&mut self, samples: &[Sample]) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        for s in samples {
            let ok = writer.write_sample(Self::to_i16(s.re)).is_ok()
                && writer.write_sample(Self::to_i16(s.im)).is_ok();
            if ok {
                self.samples_written += 1;
            } else {
                error!("write error on {}, stopping recording", self.path.display());
                self.finalize();
                return;
            }
        }
    }

    fn stream_changed(&mut self, sample_rate: u32, _center_frequency: i64) {
        if sample_rate != self.sample_rate && self.writer.is_some() {
            warn!(
                "sample rate changed {} -> {sample_rate} mid-recording; {} keeps its original rate",
                self.sample_rate,
                self.path.display()
            );
        }
    }
}

impl Drop for WavRecorder {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_expected_wav() {
        let path = std::env::temp_dir().join("sdr_engine_recorder_test.wav");
        {
            let mut recorder = WavRecorder::create(&path, 48_000).unwrap();
            let samples = vec![Sample::new(0.5, -0.5); 100];
            recorder.feed(&samples);
            assert_eq!(recorder.samples_written(), 100);
        }

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 48_000);
        assert_eq!(spec.bits_per_sample, 16);

        let frames: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(frames.len(), 200);
        assert_eq!(frames[0], 16383); // 0.5 * 32767
        assert_eq!(frames[1], -16383);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_saturating_conversion() {
        assert_eq!(WavRecorder::to_i16(2.0), 32767);
        assert_eq!(WavRecorder::to_i16(-2.0), -32768);
        assert_eq!(WavRecorder::to_i16(0.0), 0);
    }

    #[test]
    fn test_default_name_shape() {
        let name = WavRecorder::default_name();
        assert!(name.starts_with("capture_"));
        assert!(name.ends_with(".wav"));
    }
}
