//! Static device configuration and the clocking math derived from it.

use core::time::Duration;

use crate::error::{Error, Result};

/// Elements clocked out per frame, including the calibration edges the
/// moving-average stage may trim off.
pub const NUM_ELEMENTS_TOTAL: usize = 3648;

/// The stream-out pixel clock runs at the prescaled clock divided by this.
const DATA_CLKDIV: u32 = 4;

/// Slack added on top of the modelled worst case acquisition time.
const WATCHDOG_MARGIN: Duration = Duration::from_millis(100);

/// Settle time after toggling the light source before the device is told to
/// do anything. Bus-bound, not sample-bound.
pub(crate) const LIGHT_SETTLE: Duration = Duration::from_millis(50);

/// Time granted to the device for the dark-current calibration pass.
pub(crate) const CALIBRATION_TIME: Duration = Duration::from_millis(50);

const SHUTTER_DIV_MAX: u32 = 0x00FF_FFFF;

/// Pipeline stage enable flags, mirroring the device's pipeline register.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Pipeline {
    pub dark_current: bool,
    pub moving_avg: bool,
    pub total_avg: bool,
}

impl Pipeline {
    pub(crate) fn bits(self) -> u8 {
        (self.dark_current as u8) | (self.moving_avg as u8) << 1 | (self.total_avg as u8) << 2
    }
}

/// Immutable per-device configuration, fixed at initialization.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Base clock fed to the FPGA, in Hz.
    pub clock_hz: u32,
    /// Prescaler between the base clock and the shutter/pixel timing base.
    pub prescaler: u8,
    pub integration_time_us: u32,
    pub pipeline: Pipeline,
    pub moving_avg_n: u8,
    pub total_avg_n: u8,
}

impl DeviceConfig {
    fn psc_hz(&self) -> u32 {
        self.clock_hz / self.prescaler.max(1) as u32
    }

    fn pixel_hz(&self) -> u32 {
        self.psc_hz() / DATA_CLKDIV
    }

    /// Shutter divisor expressing `time_us` on this clock tree. The divisor
    /// register is 24 bits wide; anything it cannot express is rejected.
    pub fn shutter_divisor(&self, time_us: u32) -> Result<u32> {
        let div = time_us as u64 * self.psc_hz() as u64 / 1_000_000;
        if div == 0 {
            return Err(Error::InvalidArgument("integration time below one tick"));
        }
        if div > SHUTTER_DIV_MAX as u64 {
            return Err(Error::InvalidArgument("integration time overflows divisor"));
        }
        Ok(div as u32)
    }

    /// Inverse of [`Self::shutter_divisor`].
    pub fn integration_time_us(&self, div: u32) -> u32 {
        (div as u64 * 1_000_000 / self.psc_hz() as u64) as u32
    }

    /// Time to stream `elements` pixels out of the CCD.
    fn frame_duration(&self, elements: usize) -> Duration {
        Duration::from_micros(elements as u64 * 1_000_000 / self.pixel_hz() as u64)
    }

    /// Worst-case acquisition time for the watchdog. Total averaging makes
    /// the device accumulate `total_avg_n` full integration passes before it
    /// raises the fifo watermark, so each pass is budgeted for.
    pub fn watchdog_budget(&self, div: u32, pipeline: Pipeline, total_avg_n: u8) -> Duration {
        let integration = Duration::from_micros(self.integration_time_us(div) as u64);
        let frame = self.frame_duration(NUM_ELEMENTS_TOTAL);
        let mut budget = integration + frame;
        if pipeline.total_avg {
            budget += (frame + integration) * total_avg_n as u32;
        }
        budget + WATCHDOG_MARGIN
    }
}

/// Calibrated elements produced per frame. The moving-average stage consumes
/// `n` elements off both edges of the frame.
pub fn effective_elements(pipeline: Pipeline, moving_avg_n: u8) -> usize {
    let mut elements = NUM_ELEMENTS_TOTAL;
    if pipeline.moving_avg {
        elements -= 2 * moving_avg_n as usize;
    }
    elements
}
