// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Link training and reset sequencing.

use crate::Error;
use crate::config::LinkTimings;
use crate::config::PortFlags;
use crate::io::RegisterIo;
use crate::io::RegisterIoExt;
use crate::time::Clock;
use crate::time::Poll;
use pcie_gen3_defs as defs;
use pcie_gen3_defs::ltssm;

/// Startup progress of the reset sequencer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LinkState {
    /// The controller is unpowered or has not been started.
    #[default]
    PowerOff,
    /// All four reset lines are asserted.
    ResetAsserted,
    /// MAC, PHY and bridge are out of reset; port enable is still asserted.
    ResetPartial,
    /// All reset lines are released.
    PortEnableDeasserted,
    /// Waiting for the data link layer to come up.
    LinkPolling,
    /// The link is up.
    LinkUp,
    /// The link did not come up in time.
    LinkTimeoutFatal,
}

/// Negotiated link parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Current link generation.
    pub speed: u8,
    /// Negotiated lane count.
    pub width: u8,
    /// Raw LTSSM status register.
    pub ltssm: u32,
}

/// Result of a successful sequencer run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The link trained.
    Up(LinkInfo),
    /// Polling was skipped because the port is held soft-off.
    SoftOff,
}

/// Programs the controller-level settings that precede reset sequencing.
pub fn configure_controller(regs: &dyn RegisterIo, flags: &PortFlags) {
    regs.modify(defs::SETTING, |v| {
        defs::Setting::from(v).with_rc_mode(true).into_bits()
    });
    regs.modify(defs::PCI_IDS_1, |v| {
        defs::PciIds1::from(v)
            .with_class_code(defs::CLASS_BRIDGE_PCI_NORMAL)
            .into_bits()
    });
    regs.clear_bits(
        defs::INT_ENABLE,
        defs::IntRegister::new().with_intx(0xf).into_bits(),
    );
    if !flags.wants_dvfs_request {
        regs.modify(defs::MISC_CTRL, |v| {
            defs::MiscCtrl::from(v)
                .with_disable_dvfsrc_voltage_request(true)
                .into_bits()
        });
    }
}

/// Limits the link to `max_speed` if the hardware advertises it.
///
/// Returns whether the limit was applied. An unsupported speed is not an
/// error; the controller keeps its default.
pub fn negotiate_speed(regs: &dyn RegisterIo, port: usize, max_speed: Option<u8>) -> bool {
    let Some(speed) = max_speed else {
        return false;
    };
    let bitmap = defs::BaseCfg::from(regs.read_u32(defs::BASE_CFG)).speed_bitmap();
    let supported = (1..=4).contains(&speed) && bitmap & (1 << (speed - 1)) != 0;
    if !supported {
        tracing::warn!(
            port,
            speed,
            bitmap,
            "unsupported max link speed, keeping default"
        );
        return false;
    }

    regs.modify(defs::SETTING, |v| {
        let gen_support = if speed >= 2 { (1 << (speed - 1)) - 1 } else { 0 };
        defs::Setting::from(v)
            .with_gen_support(gen_support)
            .into_bits()
    });
    regs.modify(defs::EXP_LNKCTL2, |v| {
        defs::LinkControl2::from(v)
            .with_target_speed(speed)
            .into_bits()
    });
    tracing::debug!(port, speed, "limited link speed");
    true
}

/// Reads the negotiated link parameters.
pub fn read_link_info(regs: &dyn RegisterIo) -> LinkInfo {
    let status = defs::LinkControlStatus::from(regs.read_u32(defs::EXP_LNKCTL));
    LinkInfo {
        speed: status.current_speed(),
        width: status.negotiated_width(),
        ltssm: regs.read_u32(defs::LTSSM_STATUS),
    }
}

/// Drives the reset lines and waits for link-up.
#[derive(Debug, Default)]
pub struct LinkTrainer {
    state: LinkState,
}

impl LinkTrainer {
    /// Creates a trainer for an unpowered port.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current sequencer state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Records that the controller lost power.
    pub fn power_off(&mut self) {
        self.state = LinkState::PowerOff;
    }

    /// Runs the reset sequence from the top.
    ///
    /// With `soft_off` set, the link status is never read and the run
    /// succeeds once the resets are released.
    pub fn run(
        &mut self,
        regs: &dyn RegisterIo,
        clock: &dyn Clock,
        timings: &LinkTimings,
        port: usize,
        soft_off: bool,
    ) -> Result<LinkOutcome, Error> {
        regs.set_bits(defs::RST_CTRL, defs::ResetControl::all().into_bits());
        self.state = LinkState::ResetAsserted;
        clock.sleep(timings.reset_settle);

        regs.clear_bits(
            defs::RST_CTRL,
            defs::ResetControl::new()
                .with_mac(true)
                .with_phy(true)
                .with_bridge(true)
                .into_bits(),
        );
        self.state = LinkState::ResetPartial;
        clock.sleep(timings.reset_settle);

        regs.clear_bits(
            defs::RST_CTRL,
            defs::ResetControl::new().with_port_enable(true).into_bits(),
        );
        self.state = LinkState::PortEnableDeasserted;

        if soft_off {
            tracing::info!(port, "soft off, not waiting for link");
            return Ok(LinkOutcome::SoftOff);
        }

        self.state = LinkState::LinkPolling;
        let poll = Poll::sleeping(timings.link_poll_interval, timings.d3cold_wait);
        match poll.run(
            clock,
            || regs.read_u32(defs::LINK_STATUS),
            |v| defs::LinkStatus::from(v).link_up(),
        ) {
            Ok(_) => {
                self.state = LinkState::LinkUp;
                let info = read_link_info(regs);
                tracing::info!(
                    port,
                    speed = info.speed,
                    width = info.width,
                    "link up"
                );
                Ok(LinkOutcome::Up(info))
            }
            Err(timeout) => {
                self.state = LinkState::LinkTimeoutFatal;
                let ltssm = regs.read_u32(defs::LTSSM_STATUS);
                tracing::error!(
                    port,
                    ltssm,
                    state = ltssm::name(defs::LtssmStatus::from(ltssm).state()),
                    link_status = timeout.last,
                    elapsed = ?timeout.elapsed,
                    "link down"
                );
                Err(Error::LinkDownFatal { ltssm })
            }
        }
    }
}

/// Requests link turn-off and waits for the LTSSM to reach L2 idle.
pub fn turn_off_link(
    regs: &dyn RegisterIo,
    clock: &dyn Clock,
    timings: &LinkTimings,
    port: usize,
) -> Result<(), Error> {
    regs.set_bits(
        defs::ICMD_PM,
        defs::IcmdPm::new().with_turn_off_link(true).into_bits(),
    );
    Poll::sleeping(timings.l2_poll_interval, timings.l2_timeout)
        .run(
            clock,
            || regs.read_u32(defs::LTSSM_STATUS),
            |v| defs::LtssmStatus::from(v).state() == ltssm::L2_IDLE,
        )
        .map(drop)
        .map_err(|timeout| {
            tracing::error!(
                port,
                ltssm = timeout.last,
                state = ltssm::name(defs::LtssmStatus::from(timeout.last).state()),
                "link did not enter L2"
            );
            Error::L2EntryTimeout {
                ltssm: timeout.last,
            }
        })
}
