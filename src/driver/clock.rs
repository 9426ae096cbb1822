//! SPI clock divider search and input-delay compensation.

use embedded_hal::spi::Mode;

use super::config::{BusConfig, DeviceConfig, DeviceFlags};
use crate::constants::{
    CLK_MAX_ERROR_PERMILLE, CLK_N_MAX, CLK_N_MIN, CLK_PRE_DIV_MAX, DEFAULT_DUTY_CYCLE,
    GPIO_MATRIX_DELAY_NS,
};
use crate::error::{Error, Result};

/// Clock divider settings.
///
/// The SPI clock is `source / (pre * n)` unless `equal_sysclk` is set, in
/// which case it runs at the source frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockConfig {
    /// Pre-divider (1..=8192)
    pub pre: u32,
    /// Cycle counter (2..=64)
    pub n: u32,
    /// Clock level changes after this many source cycles of `n`
    pub high_cycles: u32,
    /// Bypass the divider
    pub equal_sysclk: bool,
    /// Frequency actually produced
    pub freq_hz: u32,
}

/// Pick the closest divider not above `target_hz`.
///
/// Falls back to the slowest clock when even that is above the target.
#[must_use]
pub fn calc_clock(source_hz: u32, target_hz: u32, duty_cycle: u16) -> ClockConfig {
    if target_hz >= source_hz {
        return ClockConfig {
            pre: 1,
            n: 1,
            high_cycles: 0,
            equal_sysclk: true,
            freq_hz: source_hz,
        };
    }

    let source = source_hz as u64;
    let target = target_hz.max(1) as u64;
    let mut best = (CLK_PRE_DIV_MAX, CLK_N_MAX, (source / (CLK_PRE_DIV_MAX * CLK_N_MAX) as u64) as u32);
    let mut found = false;

    for n in CLK_N_MIN..=CLK_N_MAX {
        let pre = source.div_ceil(n as u64 * target);
        if pre == 0 || pre > CLK_PRE_DIV_MAX as u64 {
            continue;
        }
        let freq = (source / (pre * n as u64)) as u32;
        if !found || freq > best.2 {
            best = (pre as u32, n, freq);
            found = true;
        }
    }

    let (pre, n, freq_hz) = best;
    let duty = if duty_cycle == 0 { DEFAULT_DUTY_CYCLE } else { duty_cycle } as u32;
    ClockConfig {
        pre,
        n,
        high_cycles: ((n * duty) / 256).clamp(1, n - 1),
        equal_sysclk: false,
        freq_hz,
    }
}

/// Everything the hardware needs to address one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceTiming {
    /// Clock divider
    pub clock: ClockConfig,
    /// Clock polarity and phase
    pub mode: Mode,
    /// Device flags (bit order, duplex, wiring, CS polarity)
    pub flags: DeviceFlags,
    /// Chip-select slot driven for this device
    pub cs_slot: u8,
    /// Chip-select setup cycles
    pub cs_setup: u8,
    /// Chip-select hold cycles
    pub cs_hold: u8,
    /// Extra dummy cycles inserted to absorb input delay
    pub timing_dummy: u8,
    /// MISO sampling delay in source cycles; -1 samples half a clock early
    pub miso_delay: i8,
}

impl DeviceTiming {
    /// Whether the device runs half duplex
    #[inline]
    #[must_use]
    pub fn is_half_duplex(&self) -> bool {
        self.flags.contains(DeviceFlags::HALF_DUPLEX)
    }
}

/// Input delay expressed in source clock cycles.
fn delay_cycles(source_hz: u32, input_delay_ns: u32, gpio_matrix: bool) -> u64 {
    let gpio_ns = if gpio_matrix { GPIO_MATRIX_DELAY_NS } else { 0 };
    // One extra ns covers a rounded-down input delay
    (1 + input_delay_ns as u64 + gpio_ns as u64) * (source_hz as u64 / 1000) / 1_000_000
}

/// Fastest full-duplex clock that tolerates the given input delay.
#[must_use]
pub fn freq_limit(source_hz: u32, input_delay_ns: u32, gpio_matrix: bool) -> u32 {
    (source_hz as u64 / (delay_cycles(source_hz, input_delay_ns, gpio_matrix) + 1)) as u32
}

/// Resolve a device configuration into hardware timing.
pub(crate) fn compute_timing(config: &DeviceConfig, bus: &BusConfig, cs_slot: u8) -> Result<DeviceTiming> {
    let source_hz = config.source_hz();
    let clock = calc_clock(source_hz, config.clock_speed_hz, config.duty_cycle);

    let error = clock.freq_hz.abs_diff(config.clock_speed_hz) as u64 * 1000
        / config.clock_speed_hz as u64;
    if error > CLK_MAX_ERROR_PERMILLE as u64 {
        return Err(Error::NotSupported);
    }

    let apb_period_n = delay_cycles(source_hz, config.input_delay_ns, bus.gpio_matrix);
    let spiclk_apb_n = (source_hz / clock.freq_hz.max(1)).max(1) as u64;
    let dummy_required = apb_period_n / spiclk_apb_n;

    let miso_delay: i64 = if dummy_required > 0 {
        ((dummy_required + 1) * spiclk_apb_n) as i64 - apb_period_n as i64 - 1
    } else if apb_period_n * 4 <= spiclk_apb_n {
        -1
    } else {
        0
    };

    let no_compensate = config.flags.contains(DeviceFlags::NO_DUMMY);
    if !config.is_half_duplex() && dummy_required > 0 && !no_compensate {
        // Full duplex cannot insert dummy cycles
        return Err(Error::NotSupported);
    }
    let timing_dummy = if config.is_half_duplex() && !no_compensate {
        u8::try_from(dummy_required).map_err(|_| Error::NotSupported)?
    } else {
        0
    };

    Ok(DeviceTiming {
        clock,
        mode: config.mode,
        flags: config.flags,
        cs_slot,
        cs_setup: config.cs_setup,
        cs_hold: config.cs_hold,
        timing_dummy,
        miso_delay: miso_delay.clamp(i8::MIN as i64, i8::MAX as i64) as i8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::APB_CLK_HZ;

    #[test]
    fn exact_divisor() {
        let c = calc_clock(APB_CLK_HZ, 10_000_000, 128);
        assert!(!c.equal_sysclk);
        assert_eq!(c.freq_hz, 10_000_000);
        assert_eq!(APB_CLK_HZ / (c.pre * c.n), 10_000_000);
    }

    #[test]
    fn never_above_target() {
        for target in [1_000, 33_333, 300_000, 7_000_000, 26_000_000, 59_000_000] {
            let c = calc_clock(APB_CLK_HZ, target, 128);
            assert!(c.freq_hz <= target, "{target} -> {}", c.freq_hz);
            assert!((CLK_N_MIN..=CLK_N_MAX).contains(&c.n));
            assert!((1..=CLK_PRE_DIV_MAX).contains(&c.pre));
        }
    }

    #[test]
    fn source_rate_bypasses_divider() {
        let c = calc_clock(APB_CLK_HZ, APB_CLK_HZ, 128);
        assert!(c.equal_sysclk);
        assert_eq!(c.freq_hz, APB_CLK_HZ);
    }

    #[test]
    fn below_slowest_clamps_to_slowest() {
        let c = calc_clock(APB_CLK_HZ, 10, 128);
        assert_eq!((c.pre, c.n), (CLK_PRE_DIV_MAX, CLK_N_MAX));
    }

    #[test]
    fn high_cycles_follow_duty() {
        let c = calc_clock(APB_CLK_HZ, 10_000_000, 128);
        assert_eq!(c.high_cycles, c.n / 2);
        let c0 = calc_clock(APB_CLK_HZ, 10_000_000, 0);
        assert_eq!(c0.high_cycles, c.high_cycles);
    }

    #[test]
    fn timing_records_real_frequency() {
        let bus = BusConfig::new();
        let cfg = DeviceConfig::new(26_000_000);
        let t = compute_timing(&cfg, &bus, 2).unwrap();
        assert_eq!(t.cs_slot, 2);
        assert!(t.clock.freq_hz <= 26_000_000);
        assert_eq!(t.timing_dummy, 0);
    }

    #[test]
    fn far_below_slowest_not_supported() {
        let bus = BusConfig::new();
        let cfg = DeviceConfig::new(50);
        assert_eq!(compute_timing(&cfg, &bus, 0), Err(Error::NotSupported));
    }

    #[test]
    fn input_delay_adds_dummy_in_half_duplex() {
        let bus = BusConfig::new().with_gpio_matrix(true);
        let cfg = DeviceConfig::new(40_000_000)
            .with_input_delay_ns(50)
            .with_flags(DeviceFlags::HALF_DUPLEX);
        let t = compute_timing(&cfg, &bus, 0).unwrap();
        assert!(t.timing_dummy > 0);
    }

    #[test]
    fn input_delay_too_long_for_full_duplex() {
        let bus = BusConfig::new().with_gpio_matrix(true);
        let cfg = DeviceConfig::new(40_000_000).with_input_delay_ns(50);
        assert_eq!(compute_timing(&cfg, &bus, 0), Err(Error::NotSupported));
        assert!(freq_limit(APB_CLK_HZ, 50, true) < 40_000_000);

        let cfg = DeviceConfig::new(40_000_000)
            .with_input_delay_ns(50)
            .with_flags(DeviceFlags::NO_DUMMY);
        assert!(compute_timing(&cfg, &bus, 0).is_ok());
    }
}
