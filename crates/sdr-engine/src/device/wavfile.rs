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

//! WAV playback device.
//!
//! Plays a 16-bit stereo WAV file as a single acquisition stream, left
//! channel as I and right channel as Q, paced by the wall clock at the file's
//! sample rate. End of file stops the worker.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hound::WavReader;
use log::{info, warn};

use crate::device::{DeviceDriver, PumpMode, WorkerHandle, WorkerMonitor};
use crate::fifo::SampleFifo;
use crate::{Direction, EngineError, Sample};

const BLOCK_SIZE: usize = 8192;

/// Acquisition driver that replays a WAV capture.
#[derive(Debug)]
pub struct WavFileDriver {
    path: PathBuf,
    open: bool,
    sample_rate: u32,
    center_frequency: i64,
    worker: Option<WorkerHandle>,
}

impl WavFileDriver {
    /// Create a driver for the given WAV file. The file is validated on
    /// `open`.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            open: false,
            sample_rate: 0,
            center_frequency: 0,
            worker: None,
        }
    }

    fn validate(path: &Path) -> Result<u32, EngineError> {
        let open_failure = |reason: String| EngineError::HardwareOpenFailure {
            serial: path.display().to_string(),
            reason,
        };
        let reader = WavReader::open(path).map_err(|e| open_failure(e.to_string()))?;
        let spec = reader.spec();
        if spec.channels != 2 {
            return Err(open_failure(format!(
                "WAV file must be stereo, found {} channels",
                spec.channels
            )));
        }
        if spec.bits_per_sample != 16 {
            return Err(open_failure(format!(
                "WAV file must be 16-bit, found {} bits per sample",
                spec.bits_per_sample
            )));
        }
        info!(
            "WAV file {}: {} Hz, {:.2} s",
            path.display(),
            spec.sample_rate,
            f64::from(reader.duration()) / f64::from(spec.sample_rate)
        );
        Ok(spec.sample_rate)
    }
}

fn playback_worker(
    path: &Path,
    fifo: &SampleFifo,
    monitor: &WorkerMonitor,
    stop: &std::sync::atomic::AtomicBool,
) {
    let mut reader = match WavReader::open(path) {
        Ok(reader) => reader,
        Err(e) => {
            monitor.report_failure(format!("failed to reopen {}: {e}", path.display()));
            return;
        }
    };
    let rate = reader.spec().sample_rate.max(1);
    let block_period = Duration::from_secs_f64(BLOCK_SIZE as f64 / f64::from(rate));
    let started = Instant::now();
    let mut blocks = 0u32;
    let mut block = Vec::with_capacity(BLOCK_SIZE);
    let mut samples = reader.samples::<i16>();

    while !stop.load(Ordering::Relaxed) {
        block.clear();
        while block.len() < BLOCK_SIZE {
            let Some(i_sample) = samples.next() else { break };
            let Some(q_sample) = samples.next() else { break };
            match (i_sample, q_sample) {
                (Ok(i), Ok(q)) => {
                    // int16 to normalized float32: -32768..32767 -> -1.0..1.0
                    block.push(Sample::new(
                        f32::from(i) / 32768.0,
                        f32::from(q) / 32768.0,
                    ));
                }
                (Err(e), _) | (_, Err(e)) => {
                    monitor.report_failure(format!("WAV read error: {e}"));
                    return;
                }
            }
        }
        if block.is_empty() {
            info!("WAV playback finished: {}", path.display());
            return;
        }
        fifo.write(0, &block);
        blocks += 1;
        let target = block_period * blocks;
        let elapsed = started.elapsed();
        if target > elapsed {
            std::thread::sleep(target - elapsed);
        }
    }
}

impl DeviceDriver for WavFileDriver {
    fn device_description(&self) -> String {
        format!("WAV playback {}", self.path.display())
    }

    fn open(&mut self, serial: &str) -> Result<(), EngineError> {
        let _ = serial; // identity comes from the file path
        if self.open {
            return Ok(());
        }
        self.sample_rate = Self::validate(&self.path)?;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.stop_streams(Direction::Acquisition);
            self.open = false;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn num_streams(&self, direction: Direction) -> usize {
        match direction {
            Direction::Acquisition => 1,
            Direction::Generation => 0,
        }
    }

    fn pump_mode(&self, _direction: Direction) -> PumpMode {
        PumpMode::Asynchronous
    }

    fn set_sample_rate(&mut self, rate: u32) -> Result<u32, EngineError> {
        // playback is fixed at the file's native rate
        if rate != self.sample_rate {
            warn!(
                "WAV playback rate is fixed at {} Hz (requested {rate})",
                self.sample_rate
            );
        }
        Ok(self.sample_rate)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_center_frequency(&mut self, hz: i64) -> Result<(), EngineError> {
        // no tuner: accept and cache for reporting
        self.center_frequency = hz;
        Ok(())
    }

    fn center_frequency(&self) -> i64 {
        self.center_frequency
    }

    fn start_streams(
        &mut self,
        direction: Direction,
        fifo: Arc<SampleFifo>,
        monitor: Arc<WorkerMonitor>,
    ) -> Result<(), EngineError> {
        if direction == Direction::Generation {
            return Err(EngineError::Unsupported);
        }
        if !self.open {
            return Err(EngineError::InvalidState("device not open".to_owned()));
        }
        self.stop_streams(direction);
        let path = self.path.clone();
        self.worker = Some(WorkerHandle::spawn("wav-playback", move |stop| {
            playback_worker(&path, &fifo, &monitor, &stop);
        }));
        Ok(())
    }

    fn stop_streams(&mut self, direction: Direction) {
        if direction == Direction::Acquisition {
            if let Some(mut worker) = self.worker.take() {
                worker.stop();
                worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};

    fn write_test_wav(path: &Path, frames: usize) {
        let spec = WavSpec {
            channels: 2,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for k in 0..frames {
            #[allow(clippy::cast_possible_truncation, reason = "test data")]
            let v = (k % 100) as i16;
            writer.write_sample(v).unwrap();
            writer.write_sample(-v).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_open_reads_spec() {
        let path = std::env::temp_dir().join("sdr_engine_wav_driver_spec.wav");
        write_test_wav(&path, 100);
        let mut driver = WavFileDriver::new(&path);
        driver.open("").unwrap();
        assert_eq!(driver.sample_rate(), 48_000);
        assert_eq!(driver.set_sample_rate(96_000).unwrap(), 48_000);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_open_missing_file_fails() {
        let mut driver = WavFileDriver::new("/nonexistent/capture.wav");
        assert!(matches!(
            driver.open(""),
            Err(EngineError::HardwareOpenFailure { .. })
        ));
    }

    #[test]
    fn test_playback_delivers_samples() {
        let path = std::env::temp_dir().join("sdr_engine_wav_driver_play.wav");
        write_test_wav(&path, 5000);
        let mut driver = WavFileDriver::new(&path);
        driver.open("").unwrap();
        let fifo = Arc::new(SampleFifo::new(1, 65_536));
        driver
            .start_streams(Direction::Acquisition, Arc::clone(&fifo), WorkerMonitor::new())
            .unwrap();

        let mut out = vec![Sample::new(0.0, 0.0); 100];
        let n = fifo.read(0, &mut out, Duration::from_secs(2));
        assert!(n > 0);
        // left channel 1 -> I 1/32768 at frame 1
        assert!((out[1].re - 1.0 / 32768.0).abs() < 1e-7);
        assert!((out[1].im + 1.0 / 32768.0).abs() < 1e-7);
        driver.stop_streams(Direction::Acquisition);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_generation_unsupported() {
        let mut driver = WavFileDriver::new("irrelevant.wav");
        let fifo = Arc::new(SampleFifo::new(1, 16));
        assert!(matches!(
            driver.start_streams(Direction::Generation, fifo, WorkerMonitor::new()),
            Err(EngineError::Unsupported)
        ));
    }
}
