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

//! Device driver contract.
//!
//! [`DeviceDriver`] is the narrow hardware contract the streaming engine
//! depends on; vendor register protocols and transport live behind it, per
//! radio family. Drivers own their worker threads: `start_streams` spawns
//! them, `stop_streams` signals and joins. Asynchronous worker failures are
//! reported through a [`WorkerMonitor`] polled by the engine pump.

pub mod testsig;
pub mod wavfile;

#[cfg(feature = "hardware")]
pub mod rtlsdr;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use log::{error, warn};

use crate::fifo::SampleFifo;
use crate::{Direction, EngineError};

/// How a direction's streams are clocked.
///
/// This is a property of the device, not of the engine; a MIMO device may
/// mix one mode per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    /// One clocked callback delivers/accepts a block for all streams
    /// together; stream-to-stream alignment is maintained.
    Synchronous,
    /// Each stream has its own producer/consumer; alignment is best-effort.
    Asynchronous,
}

/// Failure slot shared between driver workers and the engine pump.
///
/// A worker that hits an unrecoverable error records a message here and
/// exits; the pump polls the flag and transitions its direction to Error.
#[derive(Debug, Default)]
pub struct WorkerMonitor {
    failed: AtomicBool,
    message: Mutex<Option<String>>,
}

impl WorkerMonitor {
    /// Fresh monitor with no failure recorded.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a worker failure. The first message wins.
    pub fn report_failure(&self, message: impl Into<String>) {
        let message = message.into();
        error!("device worker failed: {message}");
        let mut slot = self
            .message
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(message);
        }
        drop(slot);
        self.failed.store(true, Ordering::Release);
    }

    /// Whether a failure has been reported.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Take the failure message, clearing the flag.
    pub fn take_failure(&self) -> Option<String> {
        if !self.failed.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Handle to one driver worker thread with a stop()/join() split.
#[derive(Debug)]
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn a worker running `body(stop_flag)`.
    pub fn spawn<F>(name: &str, body: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(stop_clone))
            .ok();
        if handle.is_none() {
            error!("failed to spawn worker thread '{name}'");
        }
        Self { stop, handle }
    }

    /// Signal the worker to stop (non-blocking).
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Wait for the worker to finish.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

/// Narrow hardware contract implemented per radio family.
///
/// `open`/`close` own the physical resource lifecycle; rate and frequency
/// setters reprogram it; `sample_rate`/`center_frequency` read back cached
/// state and are safe from any buddy. `start_streams` attaches the device's
/// clocked I/O to a [`SampleFifo`].
pub trait DeviceDriver: Send {
    /// Human-readable device description.
    fn device_description(&self) -> String;

    /// Open the physical device by serial.
    fn open(&mut self, serial: &str) -> Result<(), EngineError>;

    /// Close the physical device. Idempotent.
    fn close(&mut self);

    /// Whether the physical device is open.
    fn is_open(&self) -> bool;

    /// Number of streams for a direction (0 when unsupported).
    fn num_streams(&self, direction: Direction) -> usize;

    /// Pump placement mode for a direction.
    fn pump_mode(&self, direction: Direction) -> PumpMode;

    /// Program the device sample rate; returns the rate actually set.
    fn set_sample_rate(&mut self, rate: u32) -> Result<u32, EngineError>;

    /// Last successfully programmed sample rate (cached read).
    fn sample_rate(&self) -> u32;

    /// Program the hardware tuning frequency.
    fn set_center_frequency(&mut self, hz: i64) -> Result<(), EngineError>;

    /// Last successfully programmed tuning frequency (cached read).
    fn center_frequency(&self) -> i64;

    /// Enable or disable one stream channel.
    fn enable_channel(
        &mut self,
        _direction: Direction,
        _index: usize,
        _enabled: bool,
    ) -> Result<(), EngineError> {
        Err(EngineError::Unsupported)
    }

    /// Start the worker threads of a direction, wiring them to `fifo` and
    /// reporting asynchronous failures to `monitor`.
    fn start_streams(
        &mut self,
        direction: Direction,
        fifo: Arc<SampleFifo>,
        monitor: Arc<WorkerMonitor>,
    ) -> Result<(), EngineError>;

    /// Signal and join the worker threads of a direction. Idempotent.
    fn stop_streams(&mut self, direction: Direction);
}

/// Shared handle to one physical device, usable across buddies and threads.
pub type SharedDriver = Arc<Mutex<dyn DeviceDriver>>;
