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

//! Streaming engine.
//!
//! One [`StreamEngine`] per device instance, with an independent state
//! machine per direction. The control path (start/stop/apply-settings) is
//! serialized through a single settings mutex; the driver mutex is held only
//! for individual hardware-reprogram steps, never across a whole delta.
//! Sample pumps run on dedicated threads started on `start` and joined
//! before `stop` returns.

mod pump;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, info, warn};
use tokio::sync::{broadcast, watch};

use crate::correction::CorrectionMode;
use crate::device::{PumpMode, SharedDriver, WorkerHandle, WorkerMonitor};
use crate::fifo::{size_policy, SampleFifo};
use crate::freq::hardware_frequency;
use crate::settings::{EngineSettings, SettingsDelta, StreamSettings};
use crate::channel::{ChannelSink, ChannelSource};
use crate::{Direction, EngineError};

use pump::PumpContext;

/// Engine state of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Initial state; collaborators not yet constructed.
    NotStarted,
    /// Constructed, hardware closed or quiescent.
    Idle,
    /// Hardware opened and programmed, buffers sized, pumps not running.
    Ready,
    /// Sample pump executing.
    Running,
    /// Initialization or hardware failure; recovery requires re-init.
    Error,
}

impl EngineState {
    /// Coarse textual state for the run-command wire contract.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::NotStarted => "notStarted",
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Error => "error",
        }
    }
}

/// Events broadcast by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A direction changed state.
    StateChanged {
        direction: Direction,
        state: EngineState,
    },
    /// The effective sample rate or center frequency of a direction changed.
    /// Emitted at most once per applied settings delta per direction.
    StreamChanged {
        direction: Direction,
        sample_rate: u32,
        center_frequency: i64,
    },
}

/// Hot-reloadable pump parameters, one watch channel per direction.
#[derive(Debug, Clone)]
pub(crate) struct PumpParams {
    /// Correction mode per stream.
    pub correction: Vec<CorrectionMode>,
    /// Bumped to force a correction reset (rate/placement changes).
    pub reset_epoch: u64,
}

pub(crate) type SinkList = Arc<Mutex<Vec<Box<dyn ChannelSink>>>>;
pub(crate) type SourceList = Arc<Mutex<Vec<Box<dyn ChannelSource>>>>;

struct StateSlot {
    state: EngineState,
    message: Option<String>,
}

/// State cell shared between the control path and the pumps of one
/// direction.
pub(crate) struct DirectionShared {
    direction: Direction,
    slot: Mutex<StateSlot>,
    events: broadcast::Sender<EngineEvent>,
}

impl DirectionShared {
    fn new(direction: Direction, events: broadcast::Sender<EngineEvent>) -> Self {
        Self {
            direction,
            slot: Mutex::new(StateSlot {
                state: EngineState::NotStarted,
                message: None,
            }),
            events,
        }
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    fn lock(&self) -> MutexGuard<'_, StateSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> EngineState {
        self.lock().state
    }

    fn error_message(&self) -> Option<String> {
        self.lock().message.clone()
    }

    fn set_state(&self, state: EngineState) {
        let mut slot = self.lock();
        if slot.state == state {
            return;
        }
        slot.state = state;
        if state != EngineState::Error {
            slot.message = None;
        }
        drop(slot);
        info!("{} subsystem -> {}", self.direction.label(), state.name());
        let _ = self.events.send(EngineEvent::StateChanged {
            direction: self.direction,
            state,
        });
    }

    pub(crate) fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{} subsystem error: {message}", self.direction.label());
        let mut slot = self.lock();
        slot.state = EngineState::Error;
        slot.message = Some(message);
        drop(slot);
        let _ = self.events.send(EngineEvent::StateChanged {
            direction: self.direction,
            state: EngineState::Error,
        });
    }
}

struct DirectionRuntime {
    fifo: Option<Arc<SampleFifo>>,
    pumps: Vec<WorkerHandle>,
    monitor: Arc<WorkerMonitor>,
    params_tx: watch::Sender<PumpParams>,
    sinks: Vec<SinkList>,
    sources: Vec<SourceList>,
}

impl DirectionRuntime {
    fn new() -> Self {
        let (params_tx, _) = watch::channel(PumpParams {
            correction: Vec::new(),
            reset_epoch: 0,
        });
        Self {
            fifo: None,
            pumps: Vec::new(),
            monitor: WorkerMonitor::new(),
            params_tx,
            sinks: Vec::new(),
            sources: Vec::new(),
        }
    }

    fn sink_list(&mut self, stream: usize) -> SinkList {
        while self.sinks.len() <= stream {
            self.sinks.push(Arc::new(Mutex::new(Vec::new())));
        }
        Arc::clone(&self.sinks[stream])
    }

    fn source_list(&mut self, stream: usize) -> SourceList {
        while self.sources.len() <= stream {
            self.sources.push(Arc::new(Mutex::new(Vec::new())));
        }
        Arc::clone(&self.sources[stream])
    }
}

struct DirectionCtl {
    shared: Arc<DirectionShared>,
    runtime: Mutex<DirectionRuntime>,
}

/// Per-device-instance streaming engine.
pub struct StreamEngine {
    serial: String,
    driver: SharedDriver,
    /// Settings snapshot; doubles as the control-path serialization lock.
    settings: Mutex<EngineSettings>,
    acquisition: DirectionCtl,
    generation: DirectionCtl,
    events: broadcast::Sender<EngineEvent>,
}

impl std::fmt::Debug for StreamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("serial", &self.serial)
            .field("acquisition", &self.state(Direction::Acquisition).name())
            .field("generation", &self.state(Direction::Generation).name())
            .finish_non_exhaustive()
    }
}

impl StreamEngine {
    /// Create an engine for one device instance.
    ///
    /// Both directions start in `NotStarted`; the hardware is not touched
    /// until `start`.
    #[must_use]
    pub fn new(serial: impl Into<String>, driver: SharedDriver, settings: EngineSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            serial: serial.into(),
            driver,
            settings: Mutex::new(settings.clamped()),
            acquisition: DirectionCtl {
                shared: Arc::new(DirectionShared::new(Direction::Acquisition, events.clone())),
                runtime: Mutex::new(DirectionRuntime::new()),
            },
            generation: DirectionCtl {
                shared: Arc::new(DirectionShared::new(Direction::Generation, events.clone())),
                runtime: Mutex::new(DirectionRuntime::new()),
            },
            events,
        }
    }

    fn ctl(&self, direction: Direction) -> &DirectionCtl {
        match direction {
            Direction::Acquisition => &self.acquisition,
            Direction::Generation => &self.generation,
        }
    }

    fn lock_runtime(&self, direction: Direction) -> MutexGuard<'_, DirectionRuntime> {
        self.ctl(direction)
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_settings(&self) -> MutexGuard<'_, EngineSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_driver(&self) -> MutexGuard<'_, dyn crate::device::DeviceDriver + 'static> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state of a direction.
    #[must_use]
    pub fn state(&self, direction: Direction) -> EngineState {
        self.ctl(direction).shared.state()
    }

    /// Coarse textual state of a direction.
    #[must_use]
    pub fn state_name(&self, direction: Direction) -> &'static str {
        self.state(direction).name()
    }

    /// Error message of a direction, if it is in the Error state.
    #[must_use]
    pub fn error_message(&self, direction: Direction) -> Option<String> {
        self.ctl(direction).shared.error_message()
    }

    /// Subscribe to engine events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Current settings snapshot.
    #[must_use]
    pub fn settings(&self) -> EngineSettings {
        self.lock_settings().clone()
    }

    /// Register a channel sink on an acquisition stream.
    pub fn add_sink(&self, stream: usize, sink: Box<dyn ChannelSink>) {
        let mut runtime = self.lock_runtime(Direction::Acquisition);
        let list = runtime.sink_list(stream);
        drop(runtime);
        list.lock().unwrap_or_else(PoisonError::into_inner).push(sink);
    }

    /// Register a channel source on a generation stream.
    pub fn add_source(&self, stream: usize, source: Box<dyn ChannelSource>) {
        let mut runtime = self.lock_runtime(Direction::Generation);
        let list = runtime.source_list(stream);
        drop(runtime);
        list.lock().unwrap_or_else(PoisonError::into_inner).push(source);
    }

    /// Construct a direction's collaborators: `NotStarted -> Idle`.
    /// A no-op in any other state.
    pub fn initialize(&self, direction: Direction) {
        let shared = &self.ctl(direction).shared;
        if shared.state() == EngineState::NotStarted {
            shared.set_state(EngineState::Idle);
        }
    }

    /// Start a direction: open/program hardware, size buffers, start driver
    /// streams and pumps.
    ///
    /// The direction must have been initialized. Failures leave the
    /// direction in Error with a message and are also returned.
    pub fn start(&self, direction: Direction) -> Result<(), EngineError> {
        let settings = self.lock_settings();
        if self.state(direction) == EngineState::NotStarted {
            return Err(EngineError::InvalidState(format!(
                "{} subsystem not initialized",
                direction.label()
            )));
        }
        self.to_ready(direction, &settings);
        self.to_running(direction);
        drop(settings);
        match self.state(direction) {
            EngineState::Running => Ok(()),
            state => Err(EngineError::InvalidState(
                self.error_message(direction)
                    .unwrap_or_else(|| format!("start left {} in {}", direction.label(), state.name())),
            )),
        }
    }

    /// Stop a direction: interrupt and join pumps, stop driver streams,
    /// clear buffers. The pump threads have fully joined when this returns.
    pub fn stop(&self, direction: Direction) {
        let settings = self.lock_settings();
        self.to_idle(direction);
        drop(settings);
    }

    /// Run-command wire contract: `(subsystem, start/stop)` in, coarse
    /// textual state plus optional error message out.
    pub fn run_command(&self, direction: Direction, run: bool) -> (&'static str, Option<String>) {
        if run {
            self.initialize(direction);
            if let Err(e) = self.start(direction) {
                warn!("run command failed: {e}");
            }
        } else {
            self.stop(direction);
        }
        (self.state_name(direction), self.error_message(direction))
    }

    /// `Idle|Error -> Ready`: open hardware if needed, program rate and
    /// frequency, size the FIFO, reset corrections, announce the effective
    /// stream parameters once.
    fn to_ready(&self, direction: Direction, settings: &EngineSettings) {
        let shared = Arc::clone(&self.ctl(direction).shared);
        match shared.state() {
            EngineState::NotStarted
            | EngineState::Ready
            | EngineState::Running => return,
            EngineState::Idle | EngineState::Error => {}
        }

        let Some(stream) = settings.primary(direction).copied() else {
            shared.set_error(format!("no {} streams configured", direction.label()));
            return;
        };

        // open; driver lock held per step, not across the whole sequence
        {
            let mut driver = self.lock_driver();
            if !driver.is_open() {
                if let Err(e) = driver.open(&self.serial) {
                    drop(driver);
                    shared.set_error(e.to_string());
                    return;
                }
            }
        }
        let actual_rate = match self.lock_driver().set_sample_rate(stream.sample_rate) {
            Ok(rate) => rate,
            Err(e) => {
                shared.set_error(e.to_string());
                return;
            }
        };
        let tuning = hardware_frequency(
            stream.center_frequency,
            stream.transverter_offset,
            stream.transverter_enabled,
            stream.log2_rate_factor,
            stream.placement,
            actual_rate,
            stream.shift_scheme,
        );
        if let Err(e) = self.lock_driver().set_center_frequency(tuning) {
            shared.set_error(e.to_string());
            return;
        }

        let num_streams = self.lock_driver().num_streams(direction);
        let effective_rate = actual_rate >> stream.log2_rate_factor;
        let capacity = size_policy(effective_rate);
        {
            let mut runtime = self.lock_runtime(direction);
            match &runtime.fifo {
                Some(fifo) if fifo.num_streams() == num_streams => {
                    fifo.clear();
                    fifo.resize(capacity);
                }
                _ => runtime.fifo = Some(Arc::new(SampleFifo::new(num_streams, capacity))),
            }
            let modes = correction_modes(settings.streams(direction), num_streams);
            runtime.params_tx.send_modify(|p| {
                p.correction = modes;
                p.reset_epoch += 1;
            });
        }

        self.notify_stream_changed(direction, effective_rate, stream.center_frequency);
        shared.set_state(EngineState::Ready);
    }

    /// `Ready|Error -> Running`: start driver streams and spawn pumps.
    fn to_running(&self, direction: Direction) {
        let shared = Arc::clone(&self.ctl(direction).shared);
        match shared.state() {
            EngineState::NotStarted | EngineState::Idle | EngineState::Running => return,
            EngineState::Ready | EngineState::Error => {}
        }

        let mut runtime = self.lock_runtime(direction);
        // leftover handles from a run that ended in Error
        for pump in &runtime.pumps {
            pump.stop();
        }
        for pump in &mut runtime.pumps {
            pump.join();
        }
        runtime.pumps.clear();
        let Some(fifo) = runtime.fifo.as_ref().map(Arc::clone) else {
            shared.set_error("buffers not sized (no successful init)");
            return;
        };
        let monitor = Arc::clone(&runtime.monitor);
        let pump_mode = {
            let mut driver = self.lock_driver();
            if let Err(e) = driver.start_streams(direction, Arc::clone(&fifo), Arc::clone(&monitor))
            {
                drop(driver);
                drop(runtime);
                shared.set_error(e.to_string());
                return;
            }
            driver.pump_mode(direction)
        };

        let num_streams = fifo.num_streams();
        let context = |runtime: &DirectionRuntime| PumpContext {
            shared: Arc::clone(&shared),
            fifo: Arc::clone(&fifo),
            monitor: Arc::clone(&monitor),
            params: runtime.params_tx.subscribe(),
        };
        match (direction, pump_mode) {
            (Direction::Acquisition, PumpMode::Synchronous) => {
                let sinks: Vec<SinkList> = (0..num_streams).map(|s| runtime.sink_list(s)).collect();
                let ctx = context(&runtime);
                runtime.pumps.push(WorkerHandle::spawn("pump-rx-sync", move |stop| {
                    pump::acquisition_sync(ctx, sinks, &stop);
                }));
            }
            (Direction::Acquisition, PumpMode::Asynchronous) => {
                for stream in 0..num_streams {
                    let sinks = runtime.sink_list(stream);
                    let ctx = context(&runtime);
                    runtime.pumps.push(WorkerHandle::spawn("pump-rx", move |stop| {
                        pump::acquisition_async(ctx, stream, sinks, &stop);
                    }));
                }
            }
            (Direction::Generation, PumpMode::Synchronous) => {
                let sources: Vec<SourceList> =
                    (0..num_streams).map(|s| runtime.source_list(s)).collect();
                let ctx = context(&runtime);
                runtime.pumps.push(WorkerHandle::spawn("pump-tx-sync", move |stop| {
                    pump::generation_sync(ctx, sources, &stop);
                }));
            }
            (Direction::Generation, PumpMode::Asynchronous) => {
                for stream in 0..num_streams {
                    let sources = runtime.source_list(stream);
                    let ctx = context(&runtime);
                    runtime.pumps.push(WorkerHandle::spawn("pump-tx", move |stop| {
                        pump::generation_async(ctx, stream, sources, &stop);
                    }));
                }
            }
        }
        drop(runtime);
        shared.set_state(EngineState::Running);
    }

    /// `Ready|Running -> Idle`: interrupt the FIFO, join pumps, stop driver
    /// streams, clear buffers.
    fn to_idle(&self, direction: Direction) {
        let shared = &self.ctl(direction).shared;
        match shared.state() {
            EngineState::NotStarted | EngineState::Idle => return,
            // Error may have been reached mid-run; clean up the same way
            EngineState::Ready | EngineState::Running | EngineState::Error => {}
        }

        let mut runtime = self.lock_runtime(direction);
        if let Some(fifo) = &runtime.fifo {
            fifo.interrupt();
        }
        for pump in &runtime.pumps {
            pump.stop();
        }
        for pump in &mut runtime.pumps {
            pump.join();
        }
        runtime.pumps.clear();
        self.lock_driver().stop_streams(direction);
        if let Some(fifo) = &runtime.fifo {
            // no stale samples may survive a stop/start cycle
            fifo.clear();
        }
        // a failure reported during teardown (pumps already gone) must not
        // surface as an error on the next run
        if let Some(message) = runtime.monitor.take_failure() {
            warn!(
                "{} worker reported '{message}' during teardown, discarded",
                direction.label()
            );
        }
        drop(runtime);
        shared.set_state(EngineState::Idle);
    }

    /// Apply a settings delta, field by field.
    ///
    /// Serialized through the settings mutex: concurrent requests queue.
    /// Reprogram failures are logged per field and do not abort the rest of
    /// the delta or change state; at most one `StreamChanged` notification
    /// is emitted per direction after the whole delta.
    pub fn apply_settings(&self, delta: SettingsDelta) {
        let mut settings = self.lock_settings();
        for direction in [Direction::Acquisition, Direction::Generation] {
            self.apply_direction(direction, &delta);
        }
        *settings = delta.settings;
        drop(settings);
    }

    #[allow(clippy::too_many_lines, reason = "one branch per declared settings field")]
    fn apply_direction(&self, direction: Direction, delta: &SettingsDelta) {
        let streams = delta.settings.streams(direction);
        let mut notify = false;
        let mut reset_corrections = false;
        let mut correction_changed = false;

        for (index, stream) in streams.iter().enumerate() {
            let changed = |field: &str| delta.contains(direction, index, field);
            let hardware_facing = index == 0;
            let mut retune = false;
            let mut resize = false;

            if changed("sampleRate") {
                if hardware_facing {
                    match self.lock_driver().set_sample_rate(stream.sample_rate) {
                        Ok(actual) => info!(
                            "{}{index}: sample rate {} -> actual {actual}",
                            direction.label(),
                            stream.sample_rate
                        ),
                        // best-effort: device state may diverge until the
                        // next force apply
                        Err(e) => error!("{}{index}: {e}", direction.label()),
                    }
                }
                retune = true;
                resize = true;
                reset_corrections = true;
                notify = true;
            }
            if changed("log2RateFactor") {
                retune = true;
                resize = true;
                reset_corrections = true;
                notify = true;
            }
            if changed("placement") {
                retune = true;
                reset_corrections = true;
                notify = true;
            }
            if changed("centerFrequency")
                || changed("transverterOffset")
                || changed("transverterEnabled")
                || changed("shiftScheme")
            {
                retune = true;
                notify = true;
            }
            if changed("correction") {
                correction_changed = true;
            }

            if retune && hardware_facing {
                self.retune(direction, index, stream);
            }
            if resize && hardware_facing {
                let runtime = self.lock_runtime(direction);
                if let Some(fifo) = &runtime.fifo {
                    fifo.resize(size_policy(stream.effective_rate()));
                }
            }
        }

        if reset_corrections || correction_changed {
            let runtime = self.lock_runtime(direction);
            let count = runtime.fifo.as_ref().map_or(streams.len(), |f| f.num_streams());
            let modes = correction_modes(streams, count);
            runtime.params_tx.send_modify(|p| {
                p.correction = modes;
                if reset_corrections {
                    p.reset_epoch += 1;
                }
            });
        }

        // batched announcement: once per direction per delta, never per field
        if notify {
            if let Some(stream) = streams.first() {
                let actual_rate = self.lock_driver().sample_rate();
                let effective = actual_rate >> stream.log2_rate_factor;
                self.notify_stream_changed(direction, effective, stream.center_frequency);
            }
        }
    }

    fn retune(&self, direction: Direction, index: usize, stream: &StreamSettings) {
        let mut driver = self.lock_driver();
        let tuning = hardware_frequency(
            stream.center_frequency,
            stream.transverter_offset,
            stream.transverter_enabled,
            stream.log2_rate_factor,
            stream.placement,
            driver.sample_rate(),
            stream.shift_scheme,
        );
        match driver.set_center_frequency(tuning) {
            Ok(()) => info!("{}{index}: tuned to {tuning} Hz", direction.label()),
            // absorbed: the delta continues, state is untouched
            Err(e) => error!("{}{index}: {e}", direction.label()),
        }
    }

    fn notify_stream_changed(&self, direction: Direction, sample_rate: u32, center_frequency: i64) {
        let _ = self.events.send(EngineEvent::StreamChanged {
            direction,
            sample_rate,
            center_frequency,
        });
        let runtime = self.lock_runtime(direction);
        let sinks = runtime.sinks.clone();
        let sources = runtime.sources.clone();
        drop(runtime);
        for list in sinks {
            let mut list = list.lock().unwrap_or_else(PoisonError::into_inner);
            for sink in list.iter_mut() {
                sink.stream_changed(sample_rate, center_frequency);
            }
        }
        for list in sources {
            let mut list = list.lock().unwrap_or_else(PoisonError::into_inner);
            for source in list.iter_mut() {
                source.stream_changed(sample_rate, center_frequency);
            }
        }
    }

    /// Statistics: samples dropped at the device boundary per stream.
    #[must_use]
    pub fn dropped_samples(&self, direction: Direction) -> Vec<u64> {
        let runtime = self.lock_runtime(direction);
        runtime.fifo.as_ref().map_or_else(Vec::new, |fifo| {
            (0..fifo.num_streams()).map(|s| fifo.dropped(s)).collect()
        })
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.stop(Direction::Acquisition);
        self.stop(Direction::Generation);
    }
}

fn correction_modes(streams: &[StreamSettings], count: usize) -> Vec<CorrectionMode> {
    (0..count)
        .map(|s| streams.get(s).map_or(CorrectionMode::None, |st| st.correction))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testsig::{TestSignalConfig, TestSignalDriver};
    use crate::device::DeviceDriver;
    use crate::fifo::SampleFifo;
    use crate::Sample;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    fn test_engine(config: TestSignalConfig) -> StreamEngine {
        let driver: SharedDriver = Arc::new(Mutex::new(TestSignalDriver::with_config(config)));
        let settings = EngineSettings {
            acquisition: vec![StreamSettings::default()],
            generation: vec![StreamSettings::default()],
        };
        StreamEngine::new("test-serial", driver, settings)
    }

    /// Sink that counts samples and records the first sample value seen.
    struct ProbeSink {
        count: Arc<AtomicU32>,
        first: Arc<Mutex<Option<Sample>>>,
    }

    impl ChannelSink for ProbeSink {
        fn feed(&mut self, samples: &[Sample]) {
            #[allow(clippy::cast_possible_truncation, reason = "test accounting")]
            self.count.fetch_add(samples.len() as u32, Ordering::Relaxed);
            let mut first = self.first.lock().unwrap();
            if first.is_none() {
                *first = samples.first().copied();
            }
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_lifecycle_state_sequence() {
        let engine = test_engine(TestSignalConfig::default());
        assert_eq!(engine.state_name(Direction::Acquisition), "notStarted");

        // start before init is rejected
        assert!(matches!(
            engine.start(Direction::Acquisition),
            Err(EngineError::InvalidState(_))
        ));

        engine.initialize(Direction::Acquisition);
        assert_eq!(engine.state_name(Direction::Acquisition), "idle");
        // generation untouched: directions are independent
        assert_eq!(engine.state_name(Direction::Generation), "notStarted");

        engine.start(Direction::Acquisition).unwrap();
        assert_eq!(engine.state_name(Direction::Acquisition), "running");

        engine.stop(Direction::Acquisition);
        assert_eq!(engine.state_name(Direction::Acquisition), "idle");
    }

    #[test]
    fn test_run_command_wire_contract() {
        let engine = test_engine(TestSignalConfig::default());
        let (state, message) = engine.run_command(Direction::Acquisition, true);
        assert_eq!(state, "running");
        assert!(message.is_none());
        let (state, _) = engine.run_command(Direction::Acquisition, false);
        assert_eq!(state, "idle");
    }

    #[test]
    fn test_open_failure_leaves_error_with_message() {
        let engine = test_engine(TestSignalConfig {
            fail_open: true,
            ..Default::default()
        });
        engine.initialize(Direction::Acquisition);
        assert!(engine.start(Direction::Acquisition).is_err());
        assert_eq!(engine.state_name(Direction::Acquisition), "error");
        assert!(engine
            .error_message(Direction::Acquisition)
            .unwrap()
            .contains("busy"));
    }

    #[test]
    fn test_sink_receives_samples() {
        let engine = test_engine(TestSignalConfig::default());
        let count = Arc::new(AtomicU32::new(0));
        engine.add_sink(
            0,
            Box::new(ProbeSink {
                count: Arc::clone(&count),
                first: Arc::new(Mutex::new(None)),
            }),
        );
        engine.initialize(Direction::Acquisition);
        engine.start(Direction::Acquisition).unwrap();
        assert!(wait_for(
            || count.load(Ordering::Relaxed) > 10_000,
            Duration::from_secs(3)
        ));
        engine.stop(Direction::Acquisition);
    }

    #[test]
    fn test_single_notification_per_delta() {
        let engine = test_engine(TestSignalConfig::default());
        engine.initialize(Direction::Acquisition);
        engine.start(Direction::Acquisition).unwrap();

        let mut events = engine.subscribe();
        let old = engine.settings();
        let mut new = old.clone();
        // two changed fields in one delta, still one announcement
        new.acquisition[0].center_frequency = 101_000_000;
        new.acquisition[0].log2_rate_factor = 2;
        engine.apply_settings(SettingsDelta::from_diff(&old, new));

        let mut stream_changed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::StreamChanged { .. }) {
                stream_changed += 1;
            }
        }
        assert_eq!(stream_changed, 1);

        // retune took effect on the hardware side, shift included:
        // 2 Msps, log2=2, AtCenter default => shift 0
        assert_eq!(engine.settings().acquisition[0].center_frequency, 101_000_000);
        engine.stop(Direction::Acquisition);
    }

    #[test]
    fn test_unchanged_delta_is_silent() {
        let engine = test_engine(TestSignalConfig::default());
        engine.initialize(Direction::Acquisition);
        engine.start(Direction::Acquisition).unwrap();

        let mut events = engine.subscribe();
        let snapshot = engine.settings();
        engine.apply_settings(SettingsDelta::from_diff(&snapshot, snapshot.clone()));
        assert!(events.try_recv().is_err());
        engine.stop(Direction::Acquisition);
    }

    #[test]
    fn test_worker_failure_moves_direction_to_error() {
        let engine = test_engine(TestSignalConfig {
            fail_after_blocks: Some(2),
            ..Default::default()
        });
        engine.initialize(Direction::Acquisition);
        engine.start(Direction::Acquisition).unwrap();
        assert!(wait_for(
            || engine.state(Direction::Acquisition) == EngineState::Error,
            Duration::from_secs(3)
        ));
        assert!(engine
            .error_message(Direction::Acquisition)
            .unwrap()
            .contains("simulated failure"));
        engine.stop(Direction::Acquisition);
    }

    #[test]
    fn test_teardown_failure_does_not_poison_next_run() {
        // driver that reports a worker failure from stop_streams, after the
        // pumps have already been joined and stopped polling
        struct TeardownFaultDriver {
            open: bool,
            rate: u32,
            frequency: i64,
            monitor: Option<Arc<crate::device::WorkerMonitor>>,
        }

        impl DeviceDriver for TeardownFaultDriver {
            fn device_description(&self) -> String {
                "teardown-fault".to_owned()
            }
            fn open(&mut self, _serial: &str) -> Result<(), EngineError> {
                self.open = true;
                Ok(())
            }
            fn close(&mut self) {
                self.open = false;
            }
            fn is_open(&self) -> bool {
                self.open
            }
            fn num_streams(&self, direction: Direction) -> usize {
                usize::from(direction == Direction::Acquisition)
            }
            fn pump_mode(&self, _direction: Direction) -> PumpMode {
                PumpMode::Asynchronous
            }
            fn set_sample_rate(&mut self, rate: u32) -> Result<u32, EngineError> {
                self.rate = rate;
                Ok(rate)
            }
            fn sample_rate(&self) -> u32 {
                self.rate
            }
            fn set_center_frequency(&mut self, hz: i64) -> Result<(), EngineError> {
                self.frequency = hz;
                Ok(())
            }
            fn center_frequency(&self) -> i64 {
                self.frequency
            }
            fn start_streams(
                &mut self,
                _direction: Direction,
                _fifo: Arc<SampleFifo>,
                monitor: Arc<crate::device::WorkerMonitor>,
            ) -> Result<(), EngineError> {
                self.monitor = Some(monitor);
                Ok(())
            }
            fn stop_streams(&mut self, _direction: Direction) {
                if let Some(monitor) = self.monitor.take() {
                    monitor.report_failure("usb stall during teardown");
                }
            }
        }

        let driver: SharedDriver = Arc::new(Mutex::new(TeardownFaultDriver {
            open: false,
            rate: 48_000,
            frequency: 0,
            monitor: None,
        }));
        let engine = StreamEngine::new(
            "fault-0",
            driver,
            EngineSettings::single_acquisition(StreamSettings::default()),
        );

        engine.initialize(Direction::Acquisition);
        engine.start(Direction::Acquisition).unwrap();
        engine.stop(Direction::Acquisition);
        assert_eq!(engine.state_name(Direction::Acquisition), "idle");

        // the failure reported during the first teardown must not surface
        // on the second, healthy run
        engine.start(Direction::Acquisition).unwrap();
        assert!(!wait_for(
            || engine.state(Direction::Acquisition) == EngineState::Error,
            Duration::from_millis(400)
        ));
        assert_eq!(engine.state_name(Direction::Acquisition), "running");
        assert!(engine.error_message(Direction::Acquisition).is_none());
        engine.stop(Direction::Acquisition);
    }

    #[test]
    fn test_stop_start_never_replays_stale_samples() {
        // marker driver: every start_streams epoch writes a distinct
        // constant, so a stale sample from before the stop is detectable
        struct MarkerDriver {
            open: bool,
            epoch: u32,
            rate: u32,
            frequency: i64,
            worker: Option<WorkerHandle>,
        }

        impl DeviceDriver for MarkerDriver {
            fn device_description(&self) -> String {
                "marker".to_owned()
            }
            fn open(&mut self, _serial: &str) -> Result<(), EngineError> {
                self.open = true;
                Ok(())
            }
            fn close(&mut self) {
                self.open = false;
            }
            fn is_open(&self) -> bool {
                self.open
            }
            fn num_streams(&self, direction: Direction) -> usize {
                usize::from(direction == Direction::Acquisition)
            }
            fn pump_mode(&self, _direction: Direction) -> PumpMode {
                PumpMode::Asynchronous
            }
            fn set_sample_rate(&mut self, rate: u32) -> Result<u32, EngineError> {
                self.rate = rate;
                Ok(rate)
            }
            fn sample_rate(&self) -> u32 {
                self.rate
            }
            fn set_center_frequency(&mut self, hz: i64) -> Result<(), EngineError> {
                self.frequency = hz;
                Ok(())
            }
            fn center_frequency(&self) -> i64 {
                self.frequency
            }
            fn start_streams(
                &mut self,
                _direction: Direction,
                fifo: Arc<SampleFifo>,
                _monitor: Arc<crate::device::WorkerMonitor>,
            ) -> Result<(), EngineError> {
                self.epoch += 1;
                #[allow(clippy::cast_precision_loss, reason = "small test epochs")]
                let marker = Sample::new(self.epoch as f32, 0.0);
                self.worker = Some(WorkerHandle::spawn("marker", move |stop| {
                    let block = vec![marker; 256];
                    while !stop.load(Ordering::Relaxed) {
                        fifo.write(0, &block);
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }));
                Ok(())
            }
            fn stop_streams(&mut self, _direction: Direction) {
                if let Some(mut worker) = self.worker.take() {
                    worker.stop();
                    worker.join();
                }
            }
        }

        let driver: SharedDriver = Arc::new(Mutex::new(MarkerDriver {
            open: false,
            epoch: 0,
            rate: 48_000,
            frequency: 0,
            worker: None,
        }));
        let engine = StreamEngine::new(
            "marker-0",
            driver,
            EngineSettings::single_acquisition(StreamSettings::default()),
        );

        let first = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicU32::new(0));
        engine.add_sink(
            0,
            Box::new(ProbeSink {
                count: Arc::clone(&count),
                first: Arc::clone(&first),
            }),
        );

        engine.initialize(Direction::Acquisition);
        engine.start(Direction::Acquisition).unwrap();
        assert!(wait_for(
            || count.load(Ordering::Relaxed) > 0,
            Duration::from_secs(2)
        ));
        engine.stop(Direction::Acquisition);

        // second run must only ever see epoch-2 markers
        *first.lock().unwrap() = None;
        count.store(0, Ordering::Relaxed);
        engine.start(Direction::Acquisition).unwrap();
        assert!(wait_for(
            || count.load(Ordering::Relaxed) > 0,
            Duration::from_secs(2)
        ));
        engine.stop(Direction::Acquisition);

        let observed = first.lock().unwrap().unwrap();
        assert_eq!(observed.re, 2.0);
    }
}
