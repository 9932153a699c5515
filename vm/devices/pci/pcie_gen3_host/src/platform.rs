// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Collaborators owned by the platform, and per-family hooks.

use crate::Error;
use crate::atr::TranslationWindow;
use crate::io::RegisterIo;
use crate::io::RegisterIoExt;
use crate::time::Clock;
use pcie_gen3_defs as defs;
use std::sync::Arc;
use std::time::Duration;

/// The PCIe PHY.
pub trait Phy: Send + Sync {
    /// Initializes the PHY after its reset is released.
    fn init(&self) -> anyhow::Result<()>;
    /// Powers the PHY on.
    fn power_on(&self) -> anyhow::Result<()>;
    /// Powers the PHY off.
    fn power_off(&self) -> anyhow::Result<()>;
    /// Undoes [`Phy::init`].
    fn exit(&self) -> anyhow::Result<()>;
    /// Reruns receiver calibration on a live link.
    fn recalibrate(&self) -> anyhow::Result<()>;
}

/// A reset line driven outside the controller.
pub trait ResetLine: Send + Sync {
    /// Holds the block in reset.
    fn assert(&self) -> anyhow::Result<()>;
    /// Releases the block from reset.
    fn deassert(&self) -> anyhow::Result<()>;
}

/// The controller's bus and functional clocks.
pub trait Clocks: Send + Sync {
    /// Enables all clocks.
    fn enable(&self) -> anyhow::Result<()>;
    /// Disables all clocks.
    fn disable(&self) -> anyhow::Result<()>;
}

/// Pin multiplexing for the port's sideband signals.
pub trait PinControl: Send + Sync {
    /// Selects the active pin state.
    fn set_active(&self) -> anyhow::Result<()>;
    /// Selects the idle (low leakage) pin state.
    fn set_idle(&self) -> anyhow::Result<()>;
}

/// The always-on reference clock buffer shared with other subsystems.
pub trait ClockReference: Send + Sync {
    /// Requests the reference clock on behalf of `subsystem_id`.
    fn request_reference_clock(&self, subsystem_id: u32) -> anyhow::Result<()>;
    /// Drops the reference clock request of `subsystem_id`.
    fn release_reference_clock(&self, subsystem_id: u32) -> anyhow::Result<()>;
    /// Writes the raw voter register binding oscillator `xo_id` to
    /// `subsystem_id`.
    fn voter_write(&self, subsystem_id: u32, xo_id: u32, enable: bool) -> anyhow::Result<()>;
}

/// The bridge layer that enumerates the hierarchy behind the port.
pub trait HostBridge: Send + Sync {
    /// Host bridge windows, in enumeration order.
    fn windows(&self) -> Vec<TranslationWindow>;
    /// Saves configuration of the downstream bus.
    fn save_config(&self) -> anyhow::Result<()>;
    /// Restores the configuration saved by [`HostBridge::save_config`].
    fn restore_config(&self) -> anyhow::Result<()>;
}

/// The upstream interrupt line the controller is wired to.
pub trait ParentInterrupt: Send + Sync {
    /// Routes the controller interrupt to `cpu`.
    fn set_affinity(&self, cpu: u32) -> anyhow::Result<()>;
}

/// Everything a port needs from the platform.
#[derive(Clone)]
pub struct PortResources {
    /// Controller registers.
    pub regs: Arc<dyn RegisterIo>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// PHY.
    pub phy: Arc<dyn Phy>,
    /// PHY reset line, if separate from the controller's.
    pub phy_reset: Option<Arc<dyn ResetLine>>,
    /// MAC reset line, if separate from the controller's.
    pub mac_reset: Option<Arc<dyn ResetLine>>,
    /// Reset line of the attached peripheral.
    pub peripheral_reset: Option<Arc<dyn ResetLine>>,
    /// Controller clocks.
    pub clocks: Arc<dyn Clocks>,
    /// Pin multiplexing.
    pub pins: Arc<dyn PinControl>,
    /// Shared reference clock.
    pub clock_ref: Arc<dyn ClockReference>,
    /// Bridge layer.
    pub bridge: Arc<dyn HostBridge>,
    /// Upstream interrupt line.
    pub parent_irq: Arc<dyn ParentInterrupt>,
}

/// Silicon family of a port, resolved once when the port is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    /// No family-specific behavior.
    Generic,
    /// Holds a request on the shared reference clock while powered.
    ClockVote {
        /// Subsystem identifier used with the clock buffer.
        subsystem_id: u32,
    },
    /// As [`Platform::ClockVote`], and rebinds a second oscillator across
    /// L1.2 suspend.
    ClockVoteXoRebind {
        /// Subsystem identifier used with the clock buffer.
        subsystem_id: u32,
        /// Oscillator bound during suspend.
        xo_id: u32,
        /// Settle delay after the rebind.
        settle: Duration,
    },
}

impl Platform {
    fn subsystem_id(&self) -> Option<u32> {
        match *self {
            Platform::Generic => None,
            Platform::ClockVote { subsystem_id }
            | Platform::ClockVoteXoRebind { subsystem_id, .. } => Some(subsystem_id),
        }
    }

    /// Runs once before the first power-up.
    pub(crate) fn pre_init(&self, regs: &dyn RegisterIo) {
        if self.subsystem_id().is_some() {
            // The vote starts out under software control.
            regs.clear_bits(
                defs::CLKREQ_CTRL,
                defs::ClkreqControl::new().with_hw_mode(true).into_bits(),
            );
        }
    }

    pub(crate) fn pre_power_up(&self, clock_ref: &dyn ClockReference) -> Result<(), Error> {
        if let Some(id) = self.subsystem_id() {
            clock_ref.request_reference_clock(id).map_err(Error::Clock)?;
        }
        Ok(())
    }

    pub(crate) fn post_power_down(&self, clock_ref: &dyn ClockReference) -> Result<(), Error> {
        if let Some(id) = self.subsystem_id() {
            clock_ref.release_reference_clock(id).map_err(Error::Clock)?;
        }
        Ok(())
    }

    /// Runs before the controller votes for hardware clock control.
    pub(crate) fn suspend_l12(
        &self,
        clock_ref: &dyn ClockReference,
        clock: &dyn Clock,
    ) -> Result<(), Error> {
        if let Platform::ClockVoteXoRebind {
            subsystem_id,
            xo_id,
            settle,
        } = *self
        {
            clock_ref
                .voter_write(subsystem_id, xo_id, true)
                .map_err(Error::VoteRequestFailed)?;
            clock.delay(settle);
        }
        Ok(())
    }

    /// Runs after the controller retracts its vote.
    pub(crate) fn resume_l12(&self, clock_ref: &dyn ClockReference) -> Result<(), Error> {
        if let Platform::ClockVoteXoRebind {
            subsystem_id,
            xo_id,
            ..
        } = *self
        {
            clock_ref
                .voter_write(subsystem_id, xo_id, false)
                .map_err(Error::VoteRequestFailed)?;
        }
        Ok(())
    }
}
