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

//! Synthetic test-signal device.
//!
//! Produces a tone with programmable DC offset and IQ imbalance on the
//! acquisition side, paced by the wall clock, and consumes (discards)
//! generation samples. Supports any stream count in both directions, so it
//! doubles as the test double for engine, buddy, and correction tests.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::device::{DeviceDriver, PumpMode, WorkerHandle, WorkerMonitor};
use crate::fifo::SampleFifo;
use crate::{Direction, EngineError, Sample};

const BLOCK_SIZE: usize = 4096;

/// Test-signal generator parameters.
#[derive(Debug, Clone)]
pub struct TestSignalConfig {
    /// Number of acquisition streams.
    pub acquisition_streams: usize,
    /// Number of generation streams.
    pub generation_streams: usize,
    /// Pump placement mode for acquisition.
    pub acquisition_mode: PumpMode,
    /// Pump placement mode for generation.
    pub generation_mode: PumpMode,
    /// Tone frequency in Hz relative to baseband.
    pub tone_frequency: f64,
    /// Tone amplitude, 0..=1.
    pub amplitude: f32,
    /// Injected DC offset.
    pub dc_offset: Sample,
    /// Q channel gain factor (1.0 = balanced).
    pub q_gain: f32,
    /// Injected phase imbalance (fraction of I leaked into Q).
    pub phase_imbalance: f32,
    /// Simulate a failed open (device busy).
    pub fail_open: bool,
    /// Report a worker failure after this many acquisition blocks.
    pub fail_after_blocks: Option<u32>,
}

impl Default for TestSignalConfig {
    fn default() -> Self {
        Self {
            acquisition_streams: 1,
            generation_streams: 1,
            acquisition_mode: PumpMode::Synchronous,
            generation_mode: PumpMode::Asynchronous,
            tone_frequency: 100_000.0,
            amplitude: 0.5,
            dc_offset: Sample::new(0.0, 0.0),
            q_gain: 1.0,
            phase_imbalance: 0.0,
            fail_open: false,
            fail_after_blocks: None,
        }
    }
}

/// Open/close accounting shared with tests.
#[derive(Debug, Default)]
pub struct OpenCounters {
    opens: AtomicU32,
    closes: AtomicU32,
}

impl OpenCounters {
    /// Number of successful opens.
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Number of closes.
    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::Relaxed)
    }
}

/// Synthetic device driver.
#[derive(Debug)]
pub struct TestSignalDriver {
    config: TestSignalConfig,
    serial: Option<String>,
    sample_rate: u32,
    center_frequency: i64,
    counters: Arc<OpenCounters>,
    acquisition_workers: Vec<WorkerHandle>,
    generation_workers: Vec<WorkerHandle>,
}

impl Default for TestSignalDriver {
    fn default() -> Self {
        Self::with_config(TestSignalConfig::default())
    }
}

impl TestSignalDriver {
    /// Create a driver with the given generator parameters.
    #[must_use]
    pub fn with_config(config: TestSignalConfig) -> Self {
        Self {
            config,
            serial: None,
            sample_rate: 2_000_000,
            center_frequency: 100_000_000,
            counters: Arc::new(OpenCounters::default()),
            acquisition_workers: Vec::new(),
            generation_workers: Vec::new(),
        }
    }

    /// Open/close counters, cloneable before handing the driver off.
    #[must_use]
    pub fn counters(&self) -> Arc<OpenCounters> {
        Arc::clone(&self.counters)
    }

    fn spawn_acquisition_worker(
        &self,
        streams: Vec<usize>,
        fifo: Arc<SampleFifo>,
        monitor: Arc<WorkerMonitor>,
    ) -> WorkerHandle {
        let config = self.config.clone();
        let rate = self.sample_rate;
        WorkerHandle::spawn("testsig-acq", move |stop| {
            acquisition_worker(&config, rate, &streams, &fifo, &monitor, &stop);
        })
    }
}

#[allow(clippy::cast_precision_loss, reason = "sample index phase accumulation")]
fn acquisition_worker(
    config: &TestSignalConfig,
    sample_rate: u32,
    streams: &[usize],
    fifo: &SampleFifo,
    monitor: &WorkerMonitor,
    stop: &AtomicBool,
) {
    let step = TAU * config.tone_frequency / f64::from(sample_rate.max(1));
    let block_period = Duration::from_secs_f64(BLOCK_SIZE as f64 / f64::from(sample_rate.max(1)));
    let mut phase = 0.0f64;
    let mut block = vec![Sample::new(0.0, 0.0); BLOCK_SIZE];
    let mut blocks = 0u32;
    let started = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        for s in &mut block {
            #[allow(clippy::cast_possible_truncation, reason = "unit-range signal")]
            let (i, q) = ((phase.cos()) as f32, (phase.sin()) as f32);
            let xi = config.amplitude * i + config.dc_offset.re;
            let xq = config.amplitude * config.q_gain * (q + config.phase_imbalance * i)
                + config.dc_offset.im;
            *s = Sample::new(xi, xq);
            phase += step;
            if phase > TAU {
                phase -= TAU;
            }
        }
        for &stream in streams {
            fifo.write(stream, &block);
        }
        blocks += 1;
        if blocks % 512 == 0 {
            debug!("testsig: {blocks} acquisition blocks generated");
        }
        if let Some(limit) = config.fail_after_blocks {
            if blocks >= limit {
                monitor.report_failure(format!("simulated failure after {blocks} blocks"));
                return;
            }
        }
        // wall-clock pacing
        let target = block_period * blocks;
        let elapsed = started.elapsed();
        if target > elapsed {
            std::thread::sleep(target - elapsed);
        }
    }
}

fn generation_worker(stream: usize, sample_rate: u32, fifo: &SampleFifo, stop: &AtomicBool) {
    let block_period =
        Duration::from_secs_f64(BLOCK_SIZE as f64 / f64::from(sample_rate.max(1)));
    let mut block = vec![Sample::new(0.0, 0.0); BLOCK_SIZE];
    let mut underruns = 0u64;

    while !stop.load(Ordering::Relaxed) {
        let n = fifo.read(stream, &mut block, block_period);
        if n < block.len() {
            // underrun: a real DAC would emit zeros here
            underruns += 1;
            if underruns % 1000 == 1 {
                debug!("testsig stream {stream}: {underruns} generation underruns");
            }
        }
    }
}

impl DeviceDriver for TestSignalDriver {
    fn device_description(&self) -> String {
        format!(
            "TestSignal {}rx/{}tx",
            self.config.acquisition_streams, self.config.generation_streams
        )
    }

    fn open(&mut self, serial: &str) -> Result<(), EngineError> {
        if self.config.fail_open {
            return Err(EngineError::HardwareOpenFailure {
                serial: serial.to_owned(),
                reason: "device busy".to_owned(),
            });
        }
        if self.serial.is_some() {
            return Ok(());
        }
        info!("testsig: opened '{serial}'");
        self.serial = Some(serial.to_owned());
        self.counters.opens.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {
        if self.serial.take().is_some() {
            self.stop_streams(Direction::Acquisition);
            self.stop_streams(Direction::Generation);
            self.counters.closes.fetch_add(1, Ordering::Relaxed);
            info!("testsig: closed");
        }
    }

    fn is_open(&self) -> bool {
        self.serial.is_some()
    }

    fn num_streams(&self, direction: Direction) -> usize {
        match direction {
            Direction::Acquisition => self.config.acquisition_streams,
            Direction::Generation => self.config.generation_streams,
        }
    }

    fn pump_mode(&self, direction: Direction) -> PumpMode {
        match direction {
            Direction::Acquisition => self.config.acquisition_mode,
            Direction::Generation => self.config.generation_mode,
        }
    }

    fn set_sample_rate(&mut self, rate: u32) -> Result<u32, EngineError> {
        // the synthetic hardware accepts anything within a plausible range
        self.sample_rate = rate.clamp(8_000, 20_000_000);
        Ok(self.sample_rate)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_center_frequency(&mut self, hz: i64) -> Result<(), EngineError> {
        if hz < 0 {
            return Err(EngineError::ReprogramFailure {
                field: "centerFrequency".to_owned(),
                reason: format!("negative frequency {hz}"),
            });
        }
        self.center_frequency = hz;
        Ok(())
    }

    fn center_frequency(&self) -> i64 {
        self.center_frequency
    }

    fn enable_channel(
        &mut self,
        direction: Direction,
        index: usize,
        enabled: bool,
    ) -> Result<(), EngineError> {
        if index >= self.num_streams(direction) {
            return Err(EngineError::Unsupported);
        }
        debug!("testsig: channel {}{index} enabled={enabled}", direction.label());
        Ok(())
    }

    fn start_streams(
        &mut self,
        direction: Direction,
        fifo: Arc<SampleFifo>,
        monitor: Arc<WorkerMonitor>,
    ) -> Result<(), EngineError> {
        if !self.is_open() {
            return Err(EngineError::InvalidState("device not open".to_owned()));
        }
        let count = self.num_streams(direction);
        if count == 0 {
            return Err(EngineError::Unsupported);
        }
        match direction {
            Direction::Acquisition => {
                self.stop_streams(direction);
                match self.config.acquisition_mode {
                    // one worker drives all streams to keep them aligned
                    PumpMode::Synchronous => {
                        let worker = self.spawn_acquisition_worker(
                            (0..count).collect(),
                            fifo,
                            Arc::clone(&monitor),
                        );
                        self.acquisition_workers.push(worker);
                    }
                    PumpMode::Asynchronous => {
                        for stream in 0..count {
                            let worker = self.spawn_acquisition_worker(
                                vec![stream],
                                Arc::clone(&fifo),
                                Arc::clone(&monitor),
                            );
                            self.acquisition_workers.push(worker);
                        }
                    }
                }
            }
            Direction::Generation => {
                self.stop_streams(direction);
                let rate = self.sample_rate;
                for stream in 0..count {
                    let fifo = Arc::clone(&fifo);
                    let worker = WorkerHandle::spawn("testsig-gen", move |stop| {
                        generation_worker(stream, rate, &fifo, &stop);
                    });
                    self.generation_workers.push(worker);
                }
            }
        }
        Ok(())
    }

    fn stop_streams(&mut self, direction: Direction) {
        let workers = match direction {
            Direction::Acquisition => &mut self.acquisition_workers,
            Direction::Generation => &mut self.generation_workers,
        };
        for worker in workers.iter() {
            worker.stop();
        }
        for worker in workers.iter_mut() {
            worker.join();
        }
        workers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produces_samples_into_fifo() {
        let mut driver = TestSignalDriver::default();
        driver.open("test-0").unwrap();
        let fifo = Arc::new(SampleFifo::new(1, 65_536));
        let monitor = WorkerMonitor::new();
        driver
            .start_streams(Direction::Acquisition, Arc::clone(&fifo), monitor)
            .unwrap();

        let mut out = vec![Sample::new(0.0, 0.0); 4096];
        let n = fifo.read(0, &mut out, Duration::from_secs(2));
        assert!(n > 0);
        // tone amplitude 0.5, no DC: samples bounded and not all zero
        assert!(out[..n].iter().any(|s| s.norm() > 0.4));
        driver.stop_streams(Direction::Acquisition);
    }

    #[test]
    fn test_open_close_counters() {
        let mut driver = TestSignalDriver::default();
        let counters = driver.counters();
        driver.open("a").unwrap();
        driver.open("a").unwrap(); // second open is a no-op
        driver.close();
        driver.close();
        assert_eq!(counters.opens(), 1);
        assert_eq!(counters.closes(), 1);
    }

    #[test]
    fn test_fail_open() {
        let mut driver = TestSignalDriver::with_config(TestSignalConfig {
            fail_open: true,
            ..Default::default()
        });
        assert!(matches!(
            driver.open("busy"),
            Err(EngineError::HardwareOpenFailure { .. })
        ));
        assert!(!driver.is_open());
    }

    #[test]
    fn test_worker_failure_reported() {
        let mut driver = TestSignalDriver::with_config(TestSignalConfig {
            fail_after_blocks: Some(1),
            ..Default::default()
        });
        driver.open("t").unwrap();
        let fifo = Arc::new(SampleFifo::new(1, 65_536));
        let monitor = WorkerMonitor::new();
        driver
            .start_streams(Direction::Acquisition, fifo, Arc::clone(&monitor))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !monitor.is_failed() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(monitor.take_failure().is_some());
        driver.stop_streams(Direction::Acquisition);
    }

    #[test]
    fn test_start_requires_open() {
        let mut driver = TestSignalDriver::default();
        let fifo = Arc::new(SampleFifo::new(1, 1024));
        assert!(matches!(
            driver.start_streams(Direction::Acquisition, fifo, WorkerMonitor::new()),
            Err(EngineError::InvalidState(_))
        ));
    }
}
