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

//! sdrpump: stream IQ samples from a configured SDR device.
//!
//! Loads the device list from the TOML configuration, registers the chosen
//! device with a buddy registry, runs the acquisition side of a
//! [`StreamEngine`] for a fixed duration, and optionally taps the stream
//! with a spectrum analyzer or a WAV recorder along the way.

mod config;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use sdr_engine::channel::{SpectrumSink, WavRecorder};
use sdr_engine::device::testsig::TestSignalDriver;
use sdr_engine::device::wavfile::WavFileDriver;
use sdr_engine::device::SharedDriver;
use sdr_engine::{
    BuddyRegistry, CorrectionMode, Direction, EngineEvent, EngineSettings, InstanceKind,
    SettingsDelta, StreamEngine,
};
use tokio::sync::broadcast::error::RecvError;

use config::{AppConfig, DeviceEntry, DeviceKind};

/// Spectrum tap FFT size.
const SPECTRUM_FFT_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CorrectionArg {
    /// Pass samples through unmodified
    None,
    /// Remove the DC offset
    Dc,
    /// Remove the DC offset and correct IQ imbalance
    Dciq,
}

impl From<CorrectionArg> for CorrectionMode {
    fn from(arg: CorrectionArg) -> Self {
        match arg {
            CorrectionArg::None => Self::None,
            CorrectionArg::Dc => Self::Dc,
            CorrectionArg::Dciq => Self::DcAndIq,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "sdrpump", version, about = "Stream IQ samples from an SDR device")]
struct Cli {
    /// Configured device name (defaults to the first enabled device)
    #[arg(long)]
    device: Option<String>,

    /// Streaming duration in seconds
    #[arg(long, default_value_t = 5)]
    duration: u64,

    /// Attach a spectrum tap and log frame summaries
    #[arg(long)]
    spectrum: bool,

    /// Record the stream to a 16-bit stereo WAV file
    #[arg(long, value_name = "PATH")]
    record: Option<PathBuf>,

    /// Retune to this frequency (Hz) halfway through the run
    #[arg(long, value_name = "HZ")]
    retune: Option<i64>,

    /// Override the configured correction mode
    #[arg(long, value_enum)]
    correction: Option<CorrectionArg>,

    /// List configured devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the configuration file path and exit
    #[arg(long)]
    config_path: bool,
}

fn build_driver(entry: &DeviceEntry) -> Result<SharedDriver, Box<dyn std::error::Error>> {
    match entry.kind {
        DeviceKind::TestSignal => Ok(Arc::new(Mutex::new(TestSignalDriver::default()))),
        DeviceKind::WavFile => {
            let path = entry
                .wav_path
                .as_ref()
                .ok_or("WavFile device has no wav_path configured")?;
            Ok(Arc::new(Mutex::new(WavFileDriver::new(path))))
        }
        #[cfg(feature = "hardware")]
        DeviceKind::RtlSdr => Ok(Arc::new(Mutex::new(
            sdr_engine::device::rtlsdr::RtlSdrDriver::new(),
        ))),
        #[cfg(not(feature = "hardware"))]
        DeviceKind::RtlSdr => {
            Err("RTL-SDR support requires building with the 'hardware' feature".into())
        }
    }
}

/// Log engine events from a dedicated thread hosting a tokio runtime.
fn spawn_event_logger(engine: &StreamEngine) -> std::thread::JoinHandle<()> {
    let mut events = engine.subscribe();
    std::thread::spawn(move || {
        let Ok(rt) = tokio::runtime::Runtime::new() else {
            error!("failed to start event logger runtime");
            return;
        };
        rt.block_on(async move {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::StateChanged { direction, state }) => {
                        info!("event: {} -> {}", direction.label(), state.name());
                    }
                    Ok(EngineEvent::StreamChanged {
                        direction,
                        sample_rate,
                        center_frequency,
                    }) => {
                        info!(
                            "event: {} stream now {sample_rate} Hz at {center_frequency} Hz",
                            direction.label()
                        );
                    }
                    Err(RecvError::Lagged(n)) => warn!("event logger lagged by {n} events"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    })
}

/// Summarize spectrum frames from a dedicated thread hosting a tokio runtime.
fn spawn_spectrum_logger(
    mut frames: tokio::sync::mpsc::Receiver<Vec<f32>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let Ok(rt) = tokio::runtime::Runtime::new() else {
            error!("failed to start spectrum logger runtime");
            return;
        };
        rt.block_on(async move {
            let mut count = 0u64;
            while let Some(frame) = frames.recv().await {
                count += 1;
                if count % 16 == 1 {
                    let (bin, peak) = frame.iter().enumerate().fold(
                        (0, f32::MIN),
                        |(bi, bp), (i, &v)| if v > bp { (i, v) } else { (bi, bp) },
                    );
                    info!(
                        "spectrum frame {count}: peak {peak:.1} dB in bin {bin}/{}",
                        frame.len()
                    );
                }
            }
        });
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if cli.config_path {
        println!("{}", AppConfig::get_config_path()?.display());
        return Ok(());
    }

    let config = AppConfig::load().unwrap_or_else(|e| {
        warn!("failed to load configuration, using defaults: {e}");
        AppConfig::default()
    });

    if cli.list_devices {
        for device in &config.devices {
            println!(
                "{}  kind={:?} serial='{}' enabled={} rate={} frequency={}",
                device.name,
                device.kind,
                device.serial,
                device.enabled,
                device.sample_rate,
                device.center_frequency_hz
            );
        }
        return Ok(());
    }

    let entry = match &cli.device {
        Some(name) => config
            .get_device(name)
            .ok_or_else(|| format!("no configured device named '{name}'"))?,
        None => config.first_enabled().ok_or("no enabled device in configuration")?,
    }
    .clone();

    let mut stream = entry.stream_settings();
    if let Some(correction) = cli.correction {
        stream.correction = correction.into();
    }
    let settings = EngineSettings::single_acquisition(stream);

    let mut registry = BuddyRegistry::new();
    let handle = registry.register(
        InstanceKind::Acquisition,
        entry.serial.clone(),
        build_driver(&entry)?,
    );
    registry.open_device(handle)?;
    let driver = registry.driver(handle).ok_or("device handle went stale")?;

    let engine = Arc::new(StreamEngine::new(entry.serial.clone(), driver, settings));
    registry.attach_engine(handle, Arc::clone(&engine));

    let mut workers = vec![spawn_event_logger(&engine)];

    if cli.spectrum {
        let (sink, frames) = SpectrumSink::new(SPECTRUM_FFT_SIZE, 8);
        engine.add_sink(0, Box::new(sink));
        workers.push(spawn_spectrum_logger(frames));
    }
    if let Some(path) = &cli.record {
        let recorder = WavRecorder::create(path, stream.effective_rate())?;
        engine.add_sink(0, Box::new(recorder));
        info!("recording to {}", path.display());
    }

    engine.initialize(Direction::Acquisition);
    engine.start(Direction::Acquisition)?;
    info!("'{}' streaming for {} s", entry.name, cli.duration);

    if let Some(hz) = cli.retune {
        let half = Duration::from_secs(cli.duration) / 2;
        std::thread::sleep(half);
        info!("retuning to {hz} Hz");
        let old = engine.settings();
        let mut new = old.clone();
        new.acquisition[0].center_frequency = hz;
        engine.apply_settings(SettingsDelta::from_diff(&old, new));
        std::thread::sleep(half);
    } else {
        std::thread::sleep(Duration::from_secs(cli.duration));
    }

    engine.stop(Direction::Acquisition);
    info!(
        "rx samples dropped at the device boundary: {:?}",
        engine.dropped_samples(Direction::Acquisition)
    );

    registry.close_device(handle);
    registry.detach(handle);
    drop(engine);
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}
