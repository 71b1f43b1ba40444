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

//! Pump thread bodies.
//!
//! One pump per (device instance, direction) in synchronous mode, one per
//! stream in asynchronous mode. Acquisition pumps read from the FIFO, apply
//! correction, and fan out to channel sinks in arrival order; generation
//! pumps fan in channel sources, apply correction, and write to the FIFO.
//! Pumps block only on the FIFO, poll a watch channel for correction changes,
//! and poll the driver worker monitor, transitioning the direction to Error
//! when a worker reports a failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use log::debug;
use tokio::sync::watch;

use crate::correction::CorrectionUnit;
use crate::device::WorkerMonitor;
use crate::engine::{DirectionShared, PumpParams, SinkList, SourceList};
use crate::fifo::SampleFifo;
use crate::Sample;

/// Samples per pump iteration.
pub(crate) const PUMP_BLOCK: usize = 4096;

/// FIFO wait per iteration; bounds the stop latency.
const PUMP_TIMEOUT: Duration = Duration::from_millis(100);

/// Everything a pump thread needs, cloned per pump.
pub(crate) struct PumpContext {
    pub shared: Arc<DirectionShared>,
    pub fifo: Arc<SampleFifo>,
    pub monitor: Arc<WorkerMonitor>,
    pub params: watch::Receiver<PumpParams>,
}

impl PumpContext {
    /// Poll the worker monitor; on failure move the direction to Error.
    /// Returns true when the pump should exit.
    fn check_monitor(&self) -> bool {
        if let Some(message) = self.monitor.take_failure() {
            self.shared.set_error(message);
            return true;
        }
        false
    }

    /// Pick up correction-mode changes and reset requests.
    fn refresh_corrections(&mut self, corrections: &mut [CorrectionUnit], epoch: &mut u64) {
        if !self.params.has_changed().unwrap_or(false) {
            return;
        }
        let params = self.params.borrow_and_update().clone();
        for (stream, unit) in corrections.iter_mut().enumerate() {
            unit.set_mode(params.correction.get(stream).copied().unwrap_or_default());
        }
        if params.reset_epoch != *epoch {
            *epoch = params.reset_epoch;
            for unit in corrections.iter_mut() {
                unit.reset();
            }
        }
    }
}

fn initial_corrections(params: &watch::Receiver<PumpParams>, streams: &[usize]) -> (Vec<CorrectionUnit>, u64) {
    let p = params.borrow().clone();
    let units = streams
        .iter()
        .map(|&s| CorrectionUnit::new(p.correction.get(s).copied().unwrap_or_default()))
        .collect();
    (units, p.reset_epoch)
}

/// Synchronous acquisition pump: one aligned window across all streams per
/// iteration, preserving stream-to-stream alignment.
pub(crate) fn acquisition_sync(mut ctx: PumpContext, sinks: Vec<SinkList>, stop: &AtomicBool) {
    let streams: Vec<usize> = (0..sinks.len()).collect();
    let (mut corrections, mut epoch) = initial_corrections(&ctx.params, &streams);
    let mut buffers: Vec<Vec<Sample>> = vec![Vec::new(); sinks.len()];
    let mut blocks = 0u64;

    while !stop.load(Ordering::Relaxed) {
        if ctx.check_monitor() {
            return;
        }
        ctx.refresh_corrections(&mut corrections, &mut epoch);

        let n = ctx.fifo.read_aligned(&mut buffers, PUMP_BLOCK, PUMP_TIMEOUT);
        if n == 0 {
            continue;
        }
        for (stream, buffer) in buffers.iter_mut().enumerate() {
            corrections[stream].process(buffer);
            feed_sinks(&sinks[stream], buffer);
        }
        blocks += 1;
        if blocks % 512 == 0 {
            debug!("{} sync pump: {blocks} blocks", ctx.shared.direction().label());
        }
    }
}

/// Asynchronous acquisition pump for one stream.
pub(crate) fn acquisition_async(
    mut ctx: PumpContext,
    stream: usize,
    sinks: SinkList,
    stop: &AtomicBool,
) {
    let (mut corrections, mut epoch) = initial_corrections(&ctx.params, &[stream]);
    let mut buffer = vec![Sample::new(0.0, 0.0); PUMP_BLOCK];
    let mut blocks = 0u64;

    while !stop.load(Ordering::Relaxed) {
        if ctx.check_monitor() {
            return;
        }
        ctx.refresh_corrections(&mut corrections, &mut epoch);

        let n = ctx.fifo.read(stream, &mut buffer, PUMP_TIMEOUT);
        if n == 0 {
            continue;
        }
        corrections[0].process(&mut buffer[..n]);
        feed_sinks(&sinks, &buffer[..n]);
        blocks += 1;
        if blocks % 512 == 0 {
            debug!(
                "{} async pump stream {stream}: {blocks} blocks",
                ctx.shared.direction().label()
            );
        }
    }
}

/// Synchronous generation pump: produce aligned blocks for all streams from
/// one thread.
pub(crate) fn generation_sync(mut ctx: PumpContext, sources: Vec<SourceList>, stop: &AtomicBool) {
    let streams: Vec<usize> = (0..sources.len()).collect();
    let (mut corrections, mut epoch) = initial_corrections(&ctx.params, &streams);
    let mut blocks: Vec<Vec<Sample>> =
        vec![vec![Sample::new(0.0, 0.0); PUMP_BLOCK]; sources.len()];
    let mut scratch = vec![Sample::new(0.0, 0.0); PUMP_BLOCK];

    while !stop.load(Ordering::Relaxed) {
        if ctx.check_monitor() {
            return;
        }
        ctx.refresh_corrections(&mut corrections, &mut epoch);

        for (stream, block) in blocks.iter_mut().enumerate() {
            pull_sources(&sources[stream], block, &mut scratch);
            corrections[stream].process(block);
        }
        // retry the same aligned window until it fits or we are stopped
        while !stop.load(Ordering::Relaxed) {
            if ctx.fifo.write_aligned(&blocks, PUMP_TIMEOUT) > 0 {
                break;
            }
        }
    }
}

/// Asynchronous generation pump for one stream.
pub(crate) fn generation_async(
    mut ctx: PumpContext,
    stream: usize,
    sources: SourceList,
    stop: &AtomicBool,
) {
    let (mut corrections, mut epoch) = initial_corrections(&ctx.params, &[stream]);
    let mut block = vec![Sample::new(0.0, 0.0); PUMP_BLOCK];
    let mut scratch = vec![Sample::new(0.0, 0.0); PUMP_BLOCK];

    while !stop.load(Ordering::Relaxed) {
        if ctx.check_monitor() {
            return;
        }
        ctx.refresh_corrections(&mut corrections, &mut epoch);

        pull_sources(&sources, &mut block, &mut scratch);
        corrections[0].process(&mut block);

        let mut written = 0;
        while written < block.len() && !stop.load(Ordering::Relaxed) {
            let n = ctx.fifo.write_blocking(stream, &block[written..], PUMP_TIMEOUT);
            written += n;
            if n == 0 && ctx.check_monitor() {
                return;
            }
        }
    }
}

fn feed_sinks(sinks: &SinkList, samples: &[Sample]) {
    let mut sinks = sinks.lock().unwrap_or_else(PoisonError::into_inner);
    for sink in sinks.iter_mut() {
        sink.feed(samples);
    }
}

/// Fan-in: zero-fill with no source, direct pull for one, running mean
/// `acc = (pull + k*acc) / (k + 1)` for several.
fn pull_sources(sources: &SourceList, out: &mut [Sample], scratch: &mut [Sample]) {
    let mut sources = sources.lock().unwrap_or_else(PoisonError::into_inner);
    match sources.len() {
        0 => out.fill(Sample::new(0.0, 0.0)),
        1 => sources[0].pull(out),
        _ => {
            if let Some((first, rest)) = sources.split_first_mut() {
                first.pull(out);
                for (k, source) in rest.iter_mut().enumerate() {
                    source.pull(&mut scratch[..out.len()]);
                    #[allow(clippy::cast_precision_loss, reason = "small fan-in counts")]
                    let (k0, k1) = ((k + 1) as f32, (k + 2) as f32);
                    for (acc, x) in out.iter_mut().zip(scratch.iter()) {
                        *acc = (*x + k0 * *acc) / k1;
                    }
                }
            }
        }
    }
}
