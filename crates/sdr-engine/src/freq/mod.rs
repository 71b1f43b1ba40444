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

//! Frequency planning.
//!
//! Pure functions that map a desired RF center frequency to the frequency the
//! hardware must actually be tuned to, given the decimation/interpolation
//! factor and the center-frequency placement policy, plus the inverse mapping.
//! All arithmetic is integer Hz on `i64`; results are clamped to `>= 0`.

use serde::{Deserialize, Serialize};

use ShiftScheme::{Standard, TxSync};

/// Placement of the RF center frequency relative to the decimated or
/// interpolated baseband span.
///
/// Placing the center below or above the digital center keeps the tuner's
/// DC artifact out of the passband.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Center frequency sits in the lower half of the device passband.
    BelowCenter,
    /// Center frequency sits in the upper half of the device passband.
    AboveCenter,
    /// Center frequency coincides with the digital center (no shift).
    AtCenter,
}

/// Frequency-shift scheme selecting how the placement offset is derived.
///
/// The two schemes coexist in the wild and are selected per call site; the
/// choice is carried as an explicit parameter rather than inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShiftScheme {
    /// Shift of `rate / 2^(k+1)` for factors 1..=2 and `rate / 2^k` above.
    Standard,
    /// Scheme used when the companion direction must track the same shift
    /// policy: an alternating inf/sup fraction of the half sample rate that
    /// dodges interpolation spectral images.
    TxSync,
}

/// Half-rate fraction numerator/denominator per rate factor 1..=6 for the
/// [`ShiftScheme::TxSync`] scheme.
const TX_SYNC_FRACTIONS: [(i64, i64); 6] = [(1, 2), (3, 4), (5, 8), (11, 16), (21, 32), (21, 64)];

/// Signed baseband offset introduced by the center-frequency placement.
///
/// Returns 0 for `Placement::AtCenter` and for a rate factor of 0 in both
/// schemes. The sign follows the placement: below-center is negative,
/// above-center positive.
#[must_use]
pub fn frequency_shift(
    log2_rate_factor: u8,
    placement: Placement,
    sample_rate: u32,
    scheme: ShiftScheme,
) -> i64 {
    let sign = match placement {
        Placement::AtCenter => return 0,
        Placement::BelowCenter => -1i64,
        Placement::AboveCenter => 1i64,
    };
    if log2_rate_factor == 0 {
        return 0;
    }
    let rate = i64::from(sample_rate);

    match scheme {
        Standard => {
            let magnitude = if log2_rate_factor <= 2 {
                rate >> (log2_rate_factor + 1)
            } else {
                rate >> log2_rate_factor
            };
            sign * magnitude
        }
        TxSync => {
            let half = rate / 2;
            let (num, den) = TX_SYNC_FRACTIONS
                [usize::from(log2_rate_factor.min(6)) - 1];
            sign * (half * num) / den
        }
    }
}

/// Compute the frequency the hardware must be tuned to for a desired RF
/// center frequency.
///
/// Subtracts the transverter offset (when enabled) and the placement shift,
/// clamping to `>= 0` after each step. The result is what gets forwarded to
/// the radio-tuning collaborator.
#[must_use]
#[allow(clippy::too_many_arguments, reason = "mirrors the tuning parameter set")]
pub fn hardware_frequency(
    desired_frequency: i64,
    transverter_offset: i64,
    transverter_enabled: bool,
    log2_rate_factor: u8,
    placement: Placement,
    sample_rate: u32,
    scheme: ShiftScheme,
) -> i64 {
    let mut f = desired_frequency;
    if transverter_enabled {
        f -= transverter_offset;
    }
    f = f.max(0);
    f -= frequency_shift(log2_rate_factor, placement, sample_rate, scheme);
    f.max(0)
}

/// Inverse of [`hardware_frequency`]: recover the desired RF center frequency
/// from a hardware tuning frequency.
///
/// `desired_frequency(hardware_frequency(f, ..), ..) == f` for all inputs that
/// do not clamp at 0.
#[must_use]
#[allow(clippy::too_many_arguments, reason = "mirrors the tuning parameter set")]
pub fn desired_frequency(
    hardware_frequency: i64,
    transverter_offset: i64,
    transverter_enabled: bool,
    log2_rate_factor: u8,
    placement: Placement,
    sample_rate: u32,
    scheme: ShiftScheme,
) -> i64 {
    let mut f = hardware_frequency
        + frequency_shift(log2_rate_factor, placement, sample_rate, scheme);
    f = f.max(0);
    if transverter_enabled {
        f += transverter_offset;
    }
    f.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLACEMENTS: [Placement; 3] = [
        Placement::BelowCenter,
        Placement::AboveCenter,
        Placement::AtCenter,
    ];

    #[test]
    fn test_shift_zero_for_factor_zero() {
        for placement in PLACEMENTS {
            for scheme in [Standard, TxSync] {
                assert_eq!(frequency_shift(0, placement, 2_000_000, scheme), 0);
            }
        }
    }

    #[test]
    fn test_shift_zero_at_center() {
        for log2 in 0..=6u8 {
            for scheme in [Standard, TxSync] {
                assert_eq!(
                    frequency_shift(log2, Placement::AtCenter, 2_000_000, scheme),
                    0
                );
            }
        }
    }

    #[test]
    fn test_standard_shift_magnitudes() {
        let rate = 2_000_000;
        // factors 1..=2 use rate / 2^(k+1), above that rate / 2^k
        assert_eq!(
            frequency_shift(1, Placement::AboveCenter, rate, Standard),
            500_000
        );
        assert_eq!(
            frequency_shift(2, Placement::AboveCenter, rate, Standard),
            250_000
        );
        assert_eq!(
            frequency_shift(3, Placement::AboveCenter, rate, Standard),
            250_000
        );
        assert_eq!(
            frequency_shift(4, Placement::AboveCenter, rate, Standard),
            125_000
        );
        assert_eq!(
            frequency_shift(2, Placement::BelowCenter, rate, Standard),
            -250_000
        );
    }

    #[test]
    fn test_tx_sync_fraction_table() {
        let rate = 1_000_000;
        let half = i64::from(rate) / 2;
        let expected = [
            half / 2,
            half * 3 / 4,
            half * 5 / 8,
            half * 11 / 16,
            half * 21 / 32,
            half * 21 / 64,
        ];
        for (log2, want) in (1..=6u8).zip(expected) {
            assert_eq!(
                frequency_shift(log2, Placement::AboveCenter, rate, TxSync),
                want
            );
            assert_eq!(
                frequency_shift(log2, Placement::BelowCenter, rate, TxSync),
                -want
            );
        }
    }

    #[test]
    fn test_tx_sync_integer_truncation() {
        // odd rate: half = rate / 2 truncates before the fraction applies
        let rate = 1_000_001;
        assert_eq!(
            frequency_shift(1, Placement::AboveCenter, rate, TxSync),
            (i64::from(rate) / 2) / 2
        );
    }

    #[test]
    fn test_end_to_end_scenario() {
        // 2 Msps, decimation by 4, below center, standard scheme
        assert_eq!(
            frequency_shift(2, Placement::BelowCenter, 2_000_000, Standard),
            -250_000
        );
        assert_eq!(
            hardware_frequency(
                100_000_000,
                0,
                false,
                2,
                Placement::BelowCenter,
                2_000_000,
                Standard
            ),
            100_250_000
        );
    }

    #[test]
    fn test_round_trip() {
        for scheme in [Standard, TxSync] {
            for placement in PLACEMENTS {
                for log2 in 0..=6u8 {
                    for desired in [0i64, 7_000_000, 100_000_000, 1_090_000_000] {
                        let hw = hardware_frequency(
                            desired, 0, false, log2, placement, 2_000_000, scheme,
                        );
                        assert!(hw >= 0);
                        let back = desired_frequency(
                            hw, 0, false, log2, placement, 2_000_000, scheme,
                        );
                        assert_eq!(back, desired.max(0));
                    }
                }
            }
        }
    }

    #[test]
    fn test_round_trip_with_transverter() {
        let hw = hardware_frequency(
            10_368_100_000,
            10_224_000_000,
            true,
            2,
            Placement::BelowCenter,
            2_000_000,
            Standard,
        );
        assert_eq!(hw, 144_100_000 + 250_000);
        let back = desired_frequency(
            hw,
            10_224_000_000,
            true,
            2,
            Placement::BelowCenter,
            2_000_000,
            Standard,
        );
        assert_eq!(back, 10_368_100_000);
    }

    #[test]
    fn test_clamped_at_zero() {
        // transverter offset larger than the desired frequency clamps to 0,
        // then the below-center shift pushes the tuning back up
        let hw = hardware_frequency(
            100_000,
            200_000,
            true,
            2,
            Placement::BelowCenter,
            2_000_000,
            Standard,
        );
        assert_eq!(hw, 250_000);
    }
}
