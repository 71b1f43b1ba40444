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

//! Engine settings, settings deltas, and the persisted blob.
//!
//! A settings-change request carries a full [`EngineSettings`] snapshot plus
//! the list of changed field keys and a force flag; the engine applies only
//! the named fields (or everything under force). Keys take the form
//! `rx{i}.{field}` / `tx{i}.{field}`.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::correction::CorrectionMode;
use crate::freq::{Placement, ShiftScheme};
use crate::{Direction, EngineError};

/// Maximum supported decimation/interpolation exponent (factor 64).
pub const MAX_LOG2_RATE_FACTOR: u8 = 6;

/// Current version of the persisted settings blob.
const BLOB_VERSION: u32 = 1;

/// Field names used in settings-delta keys, in apply order.
pub const STREAM_FIELDS: [&str; 8] = [
    "sampleRate",
    "log2RateFactor",
    "centerFrequency",
    "placement",
    "transverterOffset",
    "transverterEnabled",
    "shiftScheme",
    "correction",
];

/// Configuration of one stream of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Device sample rate in Hz (pre decimation/interpolation).
    pub sample_rate: u32,
    /// Decimation (acquisition) or interpolation (generation) exponent, 0..=6.
    pub log2_rate_factor: u8,
    /// Desired RF center frequency in Hz.
    pub center_frequency: i64,
    /// Center-frequency placement policy.
    pub placement: Placement,
    /// Transverter offset in Hz, subtracted from the desired frequency when
    /// enabled.
    pub transverter_offset: i64,
    /// Whether transverter mode is enabled.
    pub transverter_enabled: bool,
    /// Frequency-shift scheme for this stream.
    pub shift_scheme: ShiftScheme,
    /// DC/IQ correction mode.
    pub correction: CorrectionMode,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            sample_rate: 2_000_000,
            log2_rate_factor: 0,
            center_frequency: 100_000_000,
            placement: Placement::AtCenter,
            transverter_offset: 0,
            transverter_enabled: false,
            shift_scheme: ShiftScheme::Standard,
            correction: CorrectionMode::None,
        }
    }
}

impl StreamSettings {
    /// Clamp out-of-range fields to their nearest valid bound.
    ///
    /// Range clamping is not an error; the clamped value is what gets
    /// applied.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        if self.log2_rate_factor > MAX_LOG2_RATE_FACTOR {
            warn!(
                "log2 rate factor {} clamped to {MAX_LOG2_RATE_FACTOR}",
                self.log2_rate_factor
            );
            self.log2_rate_factor = MAX_LOG2_RATE_FACTOR;
        }
        self.sample_rate = self.sample_rate.max(1);
        self.center_frequency = self.center_frequency.max(0);
        self
    }

    /// Post-decimation/interpolation sample rate in Hz.
    #[must_use]
    pub fn effective_rate(&self) -> u32 {
        self.sample_rate >> self.log2_rate_factor
    }
}

/// Full settings snapshot for one device instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Per-stream settings for the acquisition subsystem.
    pub acquisition: Vec<StreamSettings>,
    /// Per-stream settings for the generation subsystem.
    pub generation: Vec<StreamSettings>,
}

impl EngineSettings {
    /// Snapshot with one acquisition stream and no generation streams.
    #[must_use]
    pub fn single_acquisition(stream: StreamSettings) -> Self {
        Self {
            acquisition: vec![stream.clamped()],
            generation: Vec::new(),
        }
    }

    /// Streams of one direction.
    #[must_use]
    pub fn streams(&self, direction: Direction) -> &[StreamSettings] {
        match direction {
            Direction::Acquisition => &self.acquisition,
            Direction::Generation => &self.generation,
        }
    }

    /// Mutable streams of one direction.
    pub fn streams_mut(&mut self, direction: Direction) -> &mut Vec<StreamSettings> {
        match direction {
            Direction::Acquisition => &mut self.acquisition,
            Direction::Generation => &mut self.generation,
        }
    }

    /// The hardware-facing stream of a direction (stream 0).
    #[must_use]
    pub fn primary(&self, direction: Direction) -> Option<&StreamSettings> {
        self.streams(direction).first()
    }

    /// Clamp every stream of both directions.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        for stream in self.acquisition.iter_mut().chain(self.generation.iter_mut()) {
            *stream = stream.clamped();
        }
        self
    }

    /// Serialize to the versioned persisted blob.
    #[must_use]
    pub fn to_blob(&self) -> Vec<u8> {
        let blob = SettingsBlob {
            version: BLOB_VERSION,
            settings: self.clone(),
        };
        // EngineSettings has no non-serializable fields, so this cannot fail
        serde_json::to_vec(&blob).unwrap_or_default()
    }

    /// Deserialize from a persisted blob.
    ///
    /// A corrupt blob or an unknown version yields
    /// [`EngineError::SettingsBlob`]; callers fall back to defaults and
    /// report the failure rather than crash.
    pub fn from_blob(bytes: &[u8]) -> Result<Self, EngineError> {
        let blob: SettingsBlob = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::SettingsBlob(e.to_string()))?;
        if blob.version != BLOB_VERSION {
            return Err(EngineError::SettingsBlob(format!(
                "unknown version {}",
                blob.version
            )));
        }
        Ok(blob.settings.clamped())
    }
}

#[derive(Serialize, Deserialize)]
struct SettingsBlob {
    version: u32,
    settings: EngineSettings,
}

/// The set of changed configuration fields plus a force flag.
///
/// Produced by a settings-change request and consumed exactly once by the
/// engine's apply routine.
#[derive(Debug, Clone)]
pub struct SettingsDelta {
    /// Full settings snapshot to apply.
    pub settings: EngineSettings,
    /// Changed field keys, `rx{i}.{field}` / `tx{i}.{field}`.
    pub changed: Vec<String>,
    /// Apply all fields unconditionally.
    pub force: bool,
}

impl SettingsDelta {
    /// Delta that applies every field of `settings` unconditionally.
    #[must_use]
    pub fn force(settings: EngineSettings) -> Self {
        Self {
            settings: settings.clamped(),
            changed: Vec::new(),
            force: true,
        }
    }

    /// Compute the changed-field keys by comparing two snapshots.
    ///
    /// A stream-count mismatch in either direction degrades to a force delta,
    /// since per-field keys cannot describe added or removed streams.
    #[must_use]
    pub fn from_diff(old: &EngineSettings, new: EngineSettings) -> Self {
        let new = new.clamped();
        if old.acquisition.len() != new.acquisition.len()
            || old.generation.len() != new.generation.len()
        {
            return Self::force(new);
        }

        let mut changed = Vec::new();
        for direction in [Direction::Acquisition, Direction::Generation] {
            let prefix = direction.label();
            for (i, (old_s, new_s)) in old
                .streams(direction)
                .iter()
                .zip(new.streams(direction))
                .enumerate()
            {
                let mut push = |field: &str| changed.push(format!("{prefix}{i}.{field}"));
                if old_s.sample_rate != new_s.sample_rate {
                    push("sampleRate");
                }
                if old_s.log2_rate_factor != new_s.log2_rate_factor {
                    push("log2RateFactor");
                }
                if old_s.center_frequency != new_s.center_frequency {
                    push("centerFrequency");
                }
                if old_s.placement != new_s.placement {
                    push("placement");
                }
                if old_s.transverter_offset != new_s.transverter_offset {
                    push("transverterOffset");
                }
                if old_s.transverter_enabled != new_s.transverter_enabled {
                    push("transverterEnabled");
                }
                if old_s.shift_scheme != new_s.shift_scheme {
                    push("shiftScheme");
                }
                if old_s.correction != new_s.correction {
                    push("correction");
                }
            }
        }

        Self {
            settings: new,
            changed,
            force: false,
        }
    }

    /// Whether a field key is part of this delta.
    #[must_use]
    pub fn contains(&self, direction: Direction, stream: usize, field: &str) -> bool {
        if self.force {
            return true;
        }
        let key = format!("{}{stream}.{field}", direction.label());
        self.changed.iter().any(|c| c == &key)
    }
}
