// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-port configuration.

use crate::irq::msi_cap::MsiCapFlags;
use crate::platform::Platform;
use std::time::Duration;

/// Low-power strategy used across system suspend.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LowPowerMode {
    /// Keep the link trained and let it enter L1.2. The controller votes to
    /// hand the reference clock to hardware control.
    RetainLink,
    /// Turn the link off through L2 and power the port down completely.
    DropLink,
}

/// Behavioral flags for a port.
#[derive(Debug, Copy, Clone, Default)]
pub struct PortFlags {
    /// Leave the DVFS voltage request from the MAC enabled.
    pub wants_dvfs_request: bool,
    /// Drive the optional peripheral reset line across power transitions.
    pub wants_peripheral_reset: bool,
    /// The link is intentionally held down.
    pub soft_off: bool,
}

/// Timing constants for link and power transitions.
#[derive(Debug, Copy, Clone)]
pub struct LinkTimings {
    /// Settle time after each reset group change during startup.
    pub reset_settle: Duration,
    /// Link-up poll interval.
    pub link_poll_interval: Duration,
    /// Link-up timeout, the platform D3cold wait.
    pub d3cold_wait: Duration,
    /// L2 entry poll interval.
    pub l2_poll_interval: Duration,
    /// L2 entry timeout.
    pub l2_timeout: Duration,
    /// Sleep-protect-ready poll interval.
    pub sleep_protect_poll_interval: Duration,
    /// Sleep-protect-ready timeout.
    pub sleep_protect_timeout: Duration,
    /// Delay before the single sleep-protect recheck.
    pub sleep_protect_debounce: Duration,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            reset_settle: Duration::from_millis(50),
            link_poll_interval: Duration::from_micros(20),
            d3cold_wait: Duration::from_millis(100),
            l2_poll_interval: Duration::from_micros(20),
            l2_timeout: Duration::from_millis(50),
            sleep_protect_poll_interval: Duration::from_micros(10),
            sleep_protect_timeout: Duration::from_millis(10),
            sleep_protect_debounce: Duration::from_micros(50),
        }
    }
}

/// Static configuration of one controller port.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Port index.
    pub index: usize,
    /// Physical address of the register window, used for MSI capture
    /// addresses.
    pub phys_base: u64,
    /// Highest link generation to train to. `None` keeps the hardware
    /// default.
    pub max_link_speed: Option<u8>,
    /// Strategy used for system suspend.
    pub low_power: LowPowerMode,
    /// Behavioral flags.
    pub flags: PortFlags,
    /// Silicon family hooks.
    pub platform: Platform,
    /// Capabilities exposed by the MSI capability domain.
    pub msi_caps: MsiCapFlags,
    /// Timing constants.
    pub timings: LinkTimings,
}

impl PortConfig {
    /// Returns a configuration with default settings.
    pub fn new(index: usize, phys_base: u64) -> Self {
        Self {
            index,
            phys_base,
            max_link_speed: None,
            low_power: LowPowerMode::DropLink,
            flags: PortFlags::default(),
            platform: Platform::Generic,
            msi_caps: MsiCapFlags::new().with_multi_vector(true).with_msix(true),
            timings: LinkTimings::default(),
        }
    }

    /// Sets the maximum link generation.
    pub fn with_max_link_speed(mut self, speed: u8) -> Self {
        self.max_link_speed = Some(speed);
        self
    }

    /// Sets the low-power strategy.
    pub fn with_low_power(mut self, mode: LowPowerMode) -> Self {
        self.low_power = mode;
        self
    }

    /// Sets the behavioral flags.
    pub fn with_flags(mut self, flags: PortFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the silicon family.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Sets the MSI capability flags.
    pub fn with_msi_caps(mut self, caps: MsiCapFlags) -> Self {
        self.msi_caps = caps;
        self
    }

    /// Overrides the timing constants.
    pub fn with_timings(mut self, timings: LinkTimings) -> Self {
        self.timings = timings;
        self
    }
}
