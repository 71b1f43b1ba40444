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

//! SDR device streaming engine.
//!
//! This library provides the device-independent core of an SDR application:
//! frequency planning, live DC/IQ correction, the sample pump between device
//! workers and channel processors, and coordination of logical device
//! instances that share one physical radio. The layers can be used
//! independently or composed together:
//!
//! - **Frequency planning** ([`freq`]): pure functions mapping a desired RF
//!   center frequency to the hardware tuning frequency under a
//!   decimation/interpolation factor and center-frequency placement policy
//! - **Correction** ([`correction`]): adaptive per-stream DC-offset and
//!   IQ-imbalance correction
//! - **Streaming** ([`engine`], [`fifo`], [`device`], [`channel`]): the
//!   per-direction state machine, bounded sample FIFO, narrow hardware
//!   driver contract, and the channel sink/source graph
//! - **Coordination** ([`buddy`]): groups of device instances sharing one
//!   physical front end, with leader election and teardown ordering
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//! use sdr_engine::{Direction, StreamEngine, EngineSettings, StreamSettings};
//! use sdr_engine::device::testsig::TestSignalDriver;
//!
//! let driver: sdr_engine::device::SharedDriver =
//!     Arc::new(Mutex::new(TestSignalDriver::default()));
//! let settings = EngineSettings::single_acquisition(StreamSettings::default());
//! let engine = StreamEngine::new("testsig-0", driver, settings);
//!
//! engine.initialize(Direction::Acquisition);
//! engine.start(Direction::Acquisition).unwrap();
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! engine.stop(Direction::Acquisition);
//! ```
//!
//! # Frequency planning only
//!
//! ```
//! use sdr_engine::freq::{hardware_frequency, Placement, ShiftScheme};
//!
//! // 2 Msps, decimation by 4, spectrum placed below center:
//! let hw = hardware_frequency(
//!     100_000_000, 0, false, 2, Placement::BelowCenter, 2_000_000,
//!     ShiftScheme::Standard,
//! );
//! assert_eq!(hw, 100_250_000);
//! ```

pub mod buddy;
pub mod channel;
pub mod correction;
pub mod device;
pub mod engine;
pub mod fifo;
pub mod freq;
pub mod settings;

use thiserror::Error;

/// Complex IQ sample, I in `re`, Q in `im`.
pub type Sample = num_complex::Complex<f32>;

pub use buddy::{BuddyRegistry, InstanceHandle, InstanceKind};
pub use correction::{CorrectionMode, CorrectionUnit};
pub use engine::{EngineEvent, EngineState, StreamEngine};
pub use fifo::SampleFifo;
pub use freq::{Placement, ShiftScheme};
pub use settings::{EngineSettings, SettingsDelta, StreamSettings};

/// Streaming direction of a device subsystem.
///
/// Acquisition is the receive half (device produces samples), generation the
/// transmit half (device consumes samples). The two halves of one device
/// instance have independent lifecycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Receive direction: samples flow device -> channel sinks.
    Acquisition,
    /// Transmit direction: samples flow channel sources -> device.
    Generation,
}

impl Direction {
    /// Subsystem index used by the run-command wire contract
    /// (0 = acquisition, 1 = generation).
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Acquisition => 0,
            Self::Generation => 1,
        }
    }

    /// Parse a subsystem index from the run-command wire contract.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Acquisition),
            1 => Some(Self::Generation),
            _ => None,
        }
    }

    /// Short lowercase label for log messages and settings keys.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Acquisition => "rx",
            Self::Generation => "tx",
        }
    }
}

/// Errors surfaced by the streaming engine and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Device serial not found, busy, or the open call failed.
    #[error("failed to open device '{serial}': {reason}")]
    HardwareOpenFailure { serial: String, reason: String },

    /// A specific register/rate/frequency write failed. Absorbed and logged
    /// by the settings-apply path; does not abort the remaining delta.
    #[error("reprogram of '{field}' failed: {reason}")]
    ReprogramFailure { field: String, reason: String },

    /// Attaching an incompatible instance to a buddy group, or using a stale
    /// instance handle. Rejected synchronously, group unchanged.
    #[error("buddy protocol violation: {0}")]
    BuddyProtocol(String),

    /// Capability not implemented for this device family.
    #[error("not implemented")]
    Unsupported,

    /// Operation not valid in the current engine state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Persisted settings blob was corrupt or of an unknown version; the
    /// caller should fall back to defaults.
    #[error("settings blob rejected: {0}")]
    SettingsBlob(String),
}
