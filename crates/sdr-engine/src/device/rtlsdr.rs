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

//! RTL-SDR acquisition device (requires the `hardware` feature).
//!
//! The rtlsdr device handle is not `Send`, so the USB device is opened and
//! used entirely within the worker thread; `open` only resolves the serial to
//! a device index. Retunes arriving while streaming are queued and applied by
//! the worker between reads.

use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{error, info, warn};

use crate::device::{DeviceDriver, PumpMode, WorkerHandle, WorkerMonitor};
use crate::fifo::SampleFifo;
use crate::{Direction, EngineError, Sample};

/// USB bulk read size: multiple of 512 bytes, 256 KiB per read.
const READ_SIZE: usize = 262_144;

/// Register writes queued for the worker thread that owns the USB handle.
#[derive(Debug, Default)]
struct PendingWrites {
    center_frequency: Option<u32>,
    sample_rate: Option<u32>,
}

/// Single-stream RTL-SDR acquisition driver.
#[derive(Debug)]
pub struct RtlSdrDriver {
    device_index: Option<i32>,
    sample_rate: u32,
    center_frequency: i64,
    pending: Arc<Mutex<PendingWrites>>,
    worker: Option<WorkerHandle>,
}

impl Default for RtlSdrDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RtlSdrDriver {
    /// Create an unopened driver.
    #[must_use]
    pub fn new() -> Self {
        Self {
            device_index: None,
            sample_rate: 2_400_000,
            center_frequency: 100_000_000,
            pending: Arc::new(Mutex::new(PendingWrites::default())),
            worker: None,
        }
    }

    fn resolve_serial(serial: &str) -> Option<i32> {
        let count = rtlsdr::get_device_count();
        for i in 0..count {
            if let Ok(usb_strings) = rtlsdr::get_device_usb_strings(i) {
                if usb_strings.serial == serial || serial.is_empty() {
                    return Some(i);
                }
            }
        }
        None
    }

    fn queue_write(&self, update: impl FnOnce(&mut PendingWrites)) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        update(&mut pending);
    }
}

#[allow(clippy::too_many_lines, reason = "single read loop owning the USB handle")]
fn read_worker(
    device_index: i32,
    sample_rate: u32,
    center_frequency: u32,
    pending: &Mutex<PendingWrites>,
    fifo: &SampleFifo,
    monitor: &WorkerMonitor,
    init_tx: &mpsc::Sender<Result<(), String>>,
    stop: &std::sync::atomic::AtomicBool,
) {
    let mut device = match rtlsdr::open(device_index) {
        Ok(device) => device,
        Err(e) => {
            let _ = init_tx.send(Err(format!("open failed: {e:?}")));
            return;
        }
    };
    let configured = device
        .set_sample_rate(sample_rate)
        .and_then(|()| device.set_center_freq(center_frequency))
        .and_then(|()| device.set_tuner_gain_mode(false))
        .and_then(|()| device.reset_buffer());
    if let Err(e) = configured {
        let _ = init_tx.send(Err(format!("configure failed: {e:?}")));
        return;
    }
    info!(
        "RTL-SDR {device_index} streaming at {:.3} MHz, {:.3} Msps",
        f64::from(center_frequency) / 1e6,
        f64::from(sample_rate) / 1e6
    );
    let _ = init_tx.send(Ok(()));

    let mut samples = Vec::with_capacity(READ_SIZE / 2);
    while !stop.load(Ordering::Relaxed) {
        // apply queued register writes between reads
        {
            let mut queued = pending.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(freq) = queued.center_frequency.take() {
                if let Err(e) = device.set_center_freq(freq) {
                    warn!("RTL-SDR retune to {freq} Hz failed: {e:?}");
                }
            }
            if let Some(rate) = queued.sample_rate.take() {
                if let Err(e) = device.set_sample_rate(rate) {
                    warn!("RTL-SDR rate change to {rate} Hz failed: {e:?}");
                }
            }
        }

        match device.read_sync(READ_SIZE as i32) {
            Ok(buf) => {
                // interleaved offset-binary u8: (x - 127.5) / 127.5
                samples.clear();
                for pair in buf.chunks_exact(2) {
                    samples.push(Sample::new(
                        (f32::from(pair[0]) - 127.5) / 127.5,
                        (f32::from(pair[1]) - 127.5) / 127.5,
                    ));
                }
                fifo.write(0, &samples);
            }
            Err(e) => {
                monitor.report_failure(format!("RTL-SDR read error: {e:?}"));
                break;
            }
        }
    }
    drop(device);
    info!("RTL-SDR {device_index} released");
}

impl DeviceDriver for RtlSdrDriver {
    fn device_description(&self) -> String {
        match self.device_index {
            Some(index) => format!("RTL-SDR #{index}"),
            None => "RTL-SDR (closed)".to_owned(),
        }
    }

    fn open(&mut self, serial: &str) -> Result<(), EngineError> {
        if self.device_index.is_some() {
            return Ok(());
        }
        let index = Self::resolve_serial(serial).ok_or_else(|| {
            EngineError::HardwareOpenFailure {
                serial: serial.to_owned(),
                reason: "no matching RTL-SDR device".to_owned(),
            }
        })?;
        info!("RTL-SDR serial '{serial}' resolved to device {index}");
        self.device_index = Some(index);
        Ok(())
    }

    fn close(&mut self) {
        self.stop_streams(Direction::Acquisition);
        self.device_index = None;
    }

    fn is_open(&self) -> bool {
        self.device_index.is_some()
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
        // R820T-class bounds
        let actual = rate.clamp(230_000, 3_200_000);
        self.sample_rate = actual;
        self.queue_write(|p| p.sample_rate = Some(actual));
        Ok(actual)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_center_frequency(&mut self, hz: i64) -> Result<(), EngineError> {
        let freq = u32::try_from(hz).map_err(|_| EngineError::ReprogramFailure {
            field: "centerFrequency".to_owned(),
            reason: format!("{hz} Hz out of tuner range"),
        })?;
        self.center_frequency = hz;
        self.queue_write(|p| p.center_frequency = Some(freq));
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
        let Some(index) = self.device_index else {
            return Err(EngineError::InvalidState("device not open".to_owned()));
        };
        self.stop_streams(direction);

        let (init_tx, init_rx) = mpsc::channel();
        let pending = Arc::clone(&self.pending);
        let sample_rate = self.sample_rate;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "validated in set_center_frequency")]
        let center_frequency = self.center_frequency.max(0) as u32;
        let worker = WorkerHandle::spawn("rtlsdr-read", move |stop| {
            read_worker(
                index,
                sample_rate,
                center_frequency,
                &pending,
                &fifo,
                &monitor,
                &init_tx,
                &stop,
            );
        });

        match init_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(reason)) => {
                error!("RTL-SDR initialization failed: {reason}");
                Err(EngineError::HardwareOpenFailure {
                    serial: format!("#{index}"),
                    reason,
                })
            }
            Err(_) => Err(EngineError::HardwareOpenFailure {
                serial: format!("#{index}"),
                reason: "initialization timed out".to_owned(),
            }),
        }
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
