//! Baud rate divisor calculation.
//!
//! UARTs clock their bit sampler at `16 * baud`. Integer-only peripherals get
//! the rounded divisor; LPC-style peripherals with a fractional divider get a
//! bounded search over `(divisor, add, mul)` where the achieved rate is
//! `clock / (16 * divisor * (1 + add / mul))`.

use super::ConfigError;

/// Largest deviation from the requested rate that is still accepted.
pub const TOLERANCE_PERCENT: u32 = 2;

/// Error below which the fractional search stops early.
pub const GOOD_ENOUGH_HZ: u32 = 10;

const MAX_MUL: u8 = 15;

/// A programmed divisor setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BaudDivisor {
    /// Integer divisor latch value.
    pub divisor: u32,
    /// Fractional divider numerator, 0 when unused.
    pub div_add: u8,
    /// Fractional divider denominator, 1 when unused.
    pub mul: u8,
}

impl BaudDivisor {
    /// Rate this setting produces from `clock_hz`, rounded to the nearest Hz.
    pub fn achieved(&self, clock_hz: u32) -> u32 {
        let num = clock_hz as u64 * self.mul as u64;
        let den = 16 * self.divisor as u64 * (self.mul as u64 + self.div_add as u64);
        if den == 0 {
            return 0;
        }
        ((num + den / 2) / den) as u32
    }
}

/// Whether `actual` is within [`TOLERANCE_PERCENT`] of `requested`.
pub fn within_tolerance(requested: u32, actual: u32) -> bool {
    let err = requested.abs_diff(actual) as u64;
    err * 100 <= requested as u64 * TOLERANCE_PERCENT as u64
}

/// Rounded integer divisor, for UARTs without a fractional divider.
pub fn integer_divisor(clock_hz: u32, baud: u32) -> Result<BaudDivisor, ConfigError> {
    if baud == 0 {
        return Err(ConfigError::BaudRate(baud));
    }
    let sampler = 16 * baud as u64;
    let divisor = ((clock_hz as u64 + sampler / 2) / sampler) as u32;
    let setting = BaudDivisor { divisor, div_add: 0, mul: 1 };
    check(setting, clock_hz, baud)
}

/// Divisor with fractional correction, for LPC-style UARTs.
///
/// Exact multiples are returned directly. Otherwise every divisor from half
/// the integer approximation up to the approximation itself is tried with
/// each `mul` in `1..=15` and `add` in `1..mul`, stopping once the error drops
/// below [`GOOD_ENOUGH_HZ`].
pub fn fractional_divisor(clock_hz: u32, baud: u32) -> Result<BaudDivisor, ConfigError> {
    if baud == 0 {
        return Err(ConfigError::BaudRate(baud));
    }
    let sampler = 16 * baud as u64;
    let approx = (clock_hz as u64 / sampler) as u32;
    if approx == 0 {
        return Err(ConfigError::BaudRate(baud));
    }
    if clock_hz as u64 % sampler == 0 {
        return Ok(BaudDivisor { divisor: approx, div_add: 0, mul: 1 });
    }

    let mut best = BaudDivisor { divisor: approx, div_add: 0, mul: 1 };
    let mut best_err = baud.abs_diff(best.achieved(clock_hz));
    'search: for divisor in (approx / 2).max(1)..=approx {
        for mul in 1..=MAX_MUL {
            for div_add in 1..mul {
                let candidate = BaudDivisor { divisor, div_add, mul };
                let err = baud.abs_diff(candidate.achieved(clock_hz));
                if err < best_err {
                    best = candidate;
                    best_err = err;
                }
                if best_err < GOOD_ENOUGH_HZ {
                    break 'search;
                }
            }
        }
    }
    check(best, clock_hz, baud)
}

fn check(setting: BaudDivisor, clock_hz: u32, baud: u32) -> Result<BaudDivisor, ConfigError> {
    if setting.divisor == 0 || !within_tolerance(baud, setting.achieved(clock_hz)) {
        return Err(ConfigError::BaudRate(baud));
    }
    Ok(setting)
}
