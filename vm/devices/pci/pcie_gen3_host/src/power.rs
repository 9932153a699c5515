// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Power sequencing and the two system suspend strategies.
//!
//! [`LowPowerMode::RetainLink`] keeps the link trained and hands the
//! reference clock to hardware control through the clock vote, letting the
//! link idle in L1.2. [`LowPowerMode::DropLink`] sends the link to L2 and
//! powers the controller off; resume brings it up from scratch.

use crate::Error;
use crate::config::LowPowerMode;
use crate::config::PortConfig;
use crate::link;
use crate::platform::PortResources;
use crate::port::Port;
use crate::port::PortState;
use crate::vote::Voter;

/// One reversible step of controller power-up, in power-up order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum PowerStep {
    ReferenceClock,
    PeripheralReset,
    PhyReset,
    PhyInit,
    PhyPower,
    MacReset,
    Clocks,
}

impl PowerStep {
    const ALL: [PowerStep; 7] = [
        PowerStep::ReferenceClock,
        PowerStep::PeripheralReset,
        PowerStep::PhyReset,
        PowerStep::PhyInit,
        PowerStep::PhyPower,
        PowerStep::MacReset,
        PowerStep::Clocks,
    ];

    fn up(self, config: &PortConfig, res: &PortResources) -> Result<(), Error> {
        match self {
            PowerStep::ReferenceClock => config.platform.pre_power_up(res.clock_ref.as_ref()),
            PowerStep::PeripheralReset => match &res.peripheral_reset {
                Some(line) if config.flags.wants_peripheral_reset => {
                    line.deassert().map_err(Error::Reset)
                }
                _ => Ok(()),
            },
            PowerStep::PhyReset => match &res.phy_reset {
                Some(line) => line.deassert().map_err(Error::Reset),
                None => Ok(()),
            },
            PowerStep::PhyInit => res.phy.init().map_err(Error::Phy),
            PowerStep::PhyPower => res.phy.power_on().map_err(Error::Phy),
            PowerStep::MacReset => match &res.mac_reset {
                Some(line) => line.deassert().map_err(Error::Reset),
                None => Ok(()),
            },
            PowerStep::Clocks => res.clocks.enable().map_err(Error::Clock),
        }
    }

    fn down(self, config: &PortConfig, res: &PortResources) -> Result<(), Error> {
        match self {
            PowerStep::ReferenceClock => config.platform.post_power_down(res.clock_ref.as_ref()),
            PowerStep::PeripheralReset => match &res.peripheral_reset {
                Some(line) if config.flags.wants_peripheral_reset => {
                    line.assert().map_err(Error::Reset)
                }
                _ => Ok(()),
            },
            PowerStep::PhyReset => match &res.phy_reset {
                Some(line) => line.assert().map_err(Error::Reset),
                None => Ok(()),
            },
            PowerStep::PhyInit => res.phy.exit().map_err(Error::Phy),
            PowerStep::PhyPower => res.phy.power_off().map_err(Error::Phy),
            PowerStep::MacReset => match &res.mac_reset {
                Some(line) => line.assert().map_err(Error::Reset),
                None => Ok(()),
            },
            PowerStep::Clocks => res.clocks.disable().map_err(Error::Clock),
        }
    }
}

/// Undoes `steps` in reverse. Every step is attempted; the first failure is
/// returned.
fn unwind(steps: &[PowerStep], config: &PortConfig, res: &PortResources) -> Result<(), Error> {
    let mut result = Ok(());
    for &step in steps.iter().rev() {
        if let Err(err) = step.down(config, res) {
            tracing::error!(
                port = config.index,
                ?step,
                error = &err as &dyn std::error::Error,
                "power down step failed"
            );
            if result.is_ok() {
                result = Err(err);
            }
        }
    }
    result
}

/// Releases resets, powers the PHY and enables clocks.
///
/// On failure the steps already taken are undone, leaving the port
/// unpowered.
pub(crate) fn power_up(config: &PortConfig, res: &PortResources) -> Result<(), Error> {
    for (i, step) in PowerStep::ALL.into_iter().enumerate() {
        if let Err(err) = step.up(config, res) {
            tracing::error!(
                port = config.index,
                ?step,
                error = &err as &dyn std::error::Error,
                "power up failed"
            );
            // Best effort; the original failure is what the caller sees.
            let _ = unwind(&PowerStep::ALL[..i], config, res);
            return Err(err);
        }
    }
    tracing::debug!(port = config.index, "powered up");
    Ok(())
}

/// The reverse of [`power_up`].
pub(crate) fn power_down(config: &PortConfig, res: &PortResources) -> Result<(), Error> {
    let result = unwind(&PowerStep::ALL, config, res);
    tracing::debug!(port = config.index, "powered down");
    result
}

impl Port {
    /// Prepares the port for system suspend using its configured strategy.
    ///
    /// Any error means the system suspend must not continue.
    pub fn suspend(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.soft_off {
            tracing::info!(port = self.index(), "soft off, nothing to suspend");
            return Ok(());
        }
        if !state.powered {
            return Err(Error::PoweredOff);
        }
        tracing::info!(port = self.index(), mode = ?self.config.low_power, "suspend");
        match self.config.low_power {
            LowPowerMode::RetainLink => self.suspend_retain_link(),
            LowPowerMode::DropLink => self.suspend_drop_link(&mut state),
        }
    }

    /// Undoes [`Port::suspend`].
    ///
    /// If a dropped link fails to come back, the port is left powered down
    /// and the diagnostic snapshot describes the failure.
    pub fn resume(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.soft_off {
            tracing::info!(port = self.index(), "soft off, nothing to resume");
            return Ok(());
        }
        tracing::info!(port = self.index(), mode = ?self.config.low_power, "resume");
        match self.config.low_power {
            LowPowerMode::RetainLink => {
                if !state.powered {
                    return Err(Error::PoweredOff);
                }
                self.resume_retain_link()
            }
            LowPowerMode::DropLink => self.resume_drop_link(&mut state),
        }
    }

    fn suspend_retain_link(&self) -> Result<(), Error> {
        self.config
            .platform
            .suspend_l12(self.res.clock_ref.as_ref(), self.res.clock.as_ref())?;
        self.vote.cast(Voter::Controller, true)
    }

    fn resume_retain_link(&self) -> Result<(), Error> {
        self.vote.cast(Voter::Controller, false)?;
        self.config
            .platform
            .resume_l12(self.res.clock_ref.as_ref())
    }

    fn suspend_drop_link(&self, state: &mut PortState) -> Result<(), Error> {
        self.res.bridge.save_config().map_err(Error::HostBridge)?;
        if let Err(err) = link::turn_off_link(
            self.res.regs.as_ref(),
            self.res.clock.as_ref(),
            &self.config.timings,
            self.index(),
        ) {
            self.diag.capture(true, false);
            return Err(err);
        }
        state.saved_irq = Some(self.irq.registers().save());
        self.power_off(state)?;
        self.res.pins.set_idle().map_err(Error::PinControl)
    }

    fn resume_drop_link(&self, state: &mut PortState) -> Result<(), Error> {
        if state.powered {
            return Ok(());
        }
        self.res.pins.set_active().map_err(Error::PinControl)?;
        self.bring_up(state)?;
        self.res.bridge.restore_config().map_err(Error::HostBridge)?;
        if let Some(saved) = state.saved_irq.take() {
            self.irq.registers().restore(&saved);
        }
        Ok(())
    }
}
