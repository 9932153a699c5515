// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! One host controller port and its lifecycle.

use crate::Error;
use crate::atr::WindowTable;
use crate::config::PortConfig;
use crate::diag::Diagnostics;
use crate::diag::LinkDiagnostics;
use crate::irq::InterruptHierarchy;
use crate::irq::IrqEnableState;
use crate::link;
use crate::link::LinkInfo;
use crate::link::LinkOutcome;
use crate::link::LinkState;
use crate::link::LinkTrainer;
use crate::platform::PortResources;
use crate::power;
use crate::vote::PowerVote;
use crate::vote::Voter;
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) struct PortState {
    pub(crate) trainer: LinkTrainer,
    pub(crate) windows: WindowTable,
    pub(crate) soft_off: bool,
    pub(crate) powered: bool,
    pub(crate) saved_irq: Option<IrqEnableState>,
    pub(crate) link: Option<LinkInfo>,
}

/// A probed host controller port.
///
/// Process-context operations serialize on an internal mutex.
/// [`Port::handle_interrupt`] does not take it and may run concurrently with
/// any of them.
pub struct Port {
    pub(crate) config: PortConfig,
    pub(crate) res: PortResources,
    pub(crate) irq: InterruptHierarchy,
    pub(crate) vote: PowerVote,
    pub(crate) diag: Diagnostics,
    pub(crate) state: Mutex<PortState>,
}

impl Port {
    /// Powers the port up, trains the link and programs the translation
    /// windows reported by the host bridge.
    ///
    /// On failure the port is left powered down.
    pub fn probe(config: PortConfig, res: PortResources) -> Result<Arc<Self>, Error> {
        config.platform.pre_init(res.regs.as_ref());
        let irq = InterruptHierarchy::new(
            res.regs.clone(),
            config.phys_base,
            config.msi_caps,
            res.parent_irq.clone(),
        );
        let vote = PowerVote::new(
            res.regs.clone(),
            res.clock.clone(),
            config.timings,
            config.index,
        );
        let diag = Diagnostics::new(res.regs.clone(), config.index);
        let port = Port {
            state: Mutex::new(PortState {
                trainer: LinkTrainer::new(),
                windows: WindowTable::new(),
                soft_off: config.flags.soft_off,
                powered: false,
                saved_irq: None,
                link: None,
            }),
            config,
            res,
            irq,
            vote,
            diag,
        };
        port.bring_up(&mut port.state.lock())?;
        tracing::info!(port = port.index(), "probed");
        Ok(Arc::new(port))
    }

    /// Port index.
    pub fn index(&self) -> usize {
        self.config.index
    }

    /// The port configuration.
    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// The interrupt domains of this port.
    pub fn irq(&self) -> &InterruptHierarchy {
        &self.irq
    }

    /// The clock vote state.
    pub fn vote(&self) -> &PowerVote {
        &self.vote
    }

    /// Diagnostic snapshots.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    /// Whether the controller is powered.
    pub fn is_powered(&self) -> bool {
        self.state.lock().powered
    }

    /// Whether the link is deliberately held down.
    pub fn is_soft_off(&self) -> bool {
        self.state.lock().soft_off
    }

    /// Parameters of the trained link, if it is up.
    pub fn link_info(&self) -> Option<LinkInfo> {
        self.state.lock().link
    }

    /// Reset sequencer progress.
    pub fn link_state(&self) -> LinkState {
        self.state.lock().trainer.state()
    }

    /// Link diagnostics. While the port is unpowered these come from the last
    /// snapshot, if any.
    pub fn link_diagnostics(&self) -> LinkDiagnostics {
        let state = self.state.lock();
        if state.powered {
            self.diag.link_diagnostics(self.irq.msi().pending())
        } else {
            self.diag
                .last_snapshot()
                .map_or_else(LinkDiagnostics::new, |s| s.link_diagnostics())
        }
    }

    /// Services the controller interrupt. Returns whether any source was
    /// pending.
    pub fn handle_interrupt(&self) -> bool {
        self.irq.dispatch(|| {
            self.diag
                .handle_error_event(self.res.phy.as_ref(), self.irq.msi().pending());
        })
    }

    /// Casts the vote of the endpoint sharing this port's reference clock.
    pub fn endpoint_vote(&self, hw_mode: bool) -> Result<(), Error> {
        let state = self.state.lock();
        if !state.powered {
            return Err(Error::PoweredOff);
        }
        self.vote.cast(Voter::Endpoint, hw_mode)
    }

    /// Blocks all traffic through the controller and masks its interrupts.
    pub fn disable_data_transit(&self) -> Result<(), Error> {
        let state = self.state.lock();
        if !state.powered {
            return Err(Error::PoweredOff);
        }
        self.diag.disable_data_transit(self.irq.registers());
        Ok(())
    }

    /// Turns the link off and powers the port down until
    /// [`Port::soft_power_on`]. Suspend and resume do nothing meanwhile.
    pub fn soft_power_off(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.soft_off && !state.powered {
            return Ok(());
        }
        if state.powered {
            if state.link.is_some() {
                link::turn_off_link(
                    self.res.regs.as_ref(),
                    self.res.clock.as_ref(),
                    &self.config.timings,
                    self.index(),
                )?;
            }
            state.saved_irq = Some(self.irq.registers().save());
            self.power_off(&mut state)?;
            self.res.pins.set_idle().map_err(Error::PinControl)?;
        }
        state.soft_off = true;
        tracing::info!(port = self.index(), "soft power off");
        Ok(())
    }

    /// Brings the port back from [`Port::soft_power_off`], or trains the link
    /// of a port probed with the soft-off flag.
    pub fn soft_power_on(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if !state.soft_off {
            return Ok(());
        }
        state.soft_off = false;
        let result = if state.powered {
            self.startup(&mut state).inspect_err(|_| {
                if let Err(down) = self.power_off(&mut state) {
                    tracing::error!(
                        port = self.index(),
                        error = &down as &dyn std::error::Error,
                        "power down after failed startup"
                    );
                }
            })
        } else {
            self.res
                .pins
                .set_active()
                .map_err(Error::PinControl)
                .and_then(|()| self.bring_up(&mut state))
        };
        if let Err(err) = result {
            state.soft_off = true;
            return Err(err);
        }
        if let Some(saved) = state.saved_irq.take() {
            self.irq.registers().restore(&saved);
        }
        tracing::info!(port = self.index(), "soft power on");
        Ok(())
    }

    /// Masks the port's interrupts and powers it down.
    ///
    /// Fails while endpoint drivers still hold MSI vectors. Once this
    /// succeeds no further vectors can be allocated.
    pub fn remove(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        self.irq.msi().close()?;
        if state.powered {
            self.irq.registers().mask_all();
            self.power_off(&mut state)?;
        }
        tracing::info!(port = self.index(), "removed");
        Ok(())
    }

    /// Powers up and starts the controller, powering it back down if
    /// startup fails.
    pub(crate) fn bring_up(&self, state: &mut PortState) -> Result<(), Error> {
        power::power_up(&self.config, &self.res)?;
        state.powered = true;
        if let Err(err) = self.startup(state) {
            if let Err(down) = self.power_off(state) {
                tracing::error!(
                    port = self.index(),
                    error = &down as &dyn std::error::Error,
                    "power down after failed startup"
                );
            }
            return Err(err);
        }
        Ok(())
    }

    /// Programs the controller, trains the link and installs the translation
    /// windows.
    fn startup(&self, state: &mut PortState) -> Result<(), Error> {
        let regs = self.res.regs.as_ref();
        link::configure_controller(regs, &self.config.flags);
        link::negotiate_speed(regs, self.index(), self.config.max_link_speed);

        let outcome = state.trainer.run(
            regs,
            self.res.clock.as_ref(),
            &self.config.timings,
            self.index(),
            state.soft_off,
        );
        state.link = match outcome {
            Ok(LinkOutcome::Up(info)) => Some(info),
            Ok(LinkOutcome::SoftOff) => None,
            Err(err) => {
                self.diag.capture(true, false);
                return Err(err);
            }
        };

        self.irq.registers().enable_msi(self.config.phys_base);

        state.windows.reset();
        for window in self.res.bridge.windows() {
            state.windows.install(regs, &window)?;
        }
        Ok(())
    }

    /// Powers the controller down. Hardware configuration is lost.
    pub(crate) fn power_off(&self, state: &mut PortState) -> Result<(), Error> {
        state.powered = false;
        state.link = None;
        state.trainer.power_off();
        state.windows.reset();
        power::power_down(&self.config, &self.res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::TranslationWindow;
    use crate::atr::WindowKind;
    use crate::config::PortFlags;
    use crate::test_helpers::Event;
    use crate::test_helpers::PhyCall;
    use crate::test_helpers::TestPort;
    use crate::test_helpers::init_tracing;
    use pcie_gen3_defs as defs;
    use pcie_gen3_defs::aer;
    use pcie_gen3_defs::ltssm;
    use std::sync::atomic::Ordering;

    #[test]
    fn probe_programs_windows() {
        let test = TestPort::new();
        test.bridge.set_windows([
            TestPort::mem_window(0x2000_0000, 0x10_0000),
            TranslationWindow {
                host_addr: 0x2020_0000,
                pci_addr: 0,
                size: 0x1_0000,
                kind: WindowKind::Io,
            },
        ]);
        let port = Port::probe(PortConfig::new(0, 0x1_1228_0000), test.resources()).unwrap();
        assert!(port.is_powered());
        assert_eq!(port.link_state(), LinkState::LinkUp);
        assert_eq!(
            port.link_info().map(|i| (i.speed, i.width)),
            Some((3, 1))
        );
        assert_eq!(test.regs.peek(defs::atr_entry(0)) & 1, 1);
        assert_eq!(test.regs.peek(defs::atr_entry(1)) & 1, 1);
        assert_eq!(test.regs.peek(defs::atr_entry(2)), 0);
        assert_eq!(test.regs.peek(defs::MSI_SET_ENABLE), 0xff);

        let diag = port.link_diagnostics();
        assert!(diag.link_up());
        assert_eq!(diag.ltssm(), ltssm::L0);
    }

    #[test]
    fn failed_probe_powers_down() {
        let test = TestPort::new();
        test.regs.set_trainable(false);
        let err = Port::probe(PortConfig::new(1, 0), test.resources())
            .err()
            .unwrap();
        assert!(matches!(err, Error::LinkDownFatal { .. }));
        let events = test.log.take();
        assert_eq!(events.last(), Some(&Event::PhyReset(true)));
        assert!(events.contains(&Event::Clocks(false)));
    }

    #[test]
    fn too_many_windows_fails_probe() {
        let test = TestPort::new();
        test.bridge.set_windows(
            (0..9).map(|i| TestPort::mem_window(0x2000_0000 + i * 0x1000, 0x1000)),
        );
        let err = Port::probe(PortConfig::new(0, 0), test.resources())
            .err()
            .unwrap();
        assert!(matches!(err, Error::WindowTableFull));
        assert!(test.log.take().contains(&Event::Clocks(false)));
    }

    #[test]
    fn soft_off_probe_then_on() {
        let test = TestPort::new();
        let config = PortConfig::new(0, 0).with_flags(PortFlags {
            soft_off: true,
            ..Default::default()
        });
        let port = Port::probe(config, test.resources()).unwrap();
        assert!(port.is_powered());
        assert_eq!(port.link_info(), None);
        assert_eq!(test.regs.read_count(defs::LINK_STATUS), 0);

        port.soft_power_on().unwrap();
        assert!(!port.is_soft_off());
        assert!(port.link_info().is_some());
    }

    #[test]
    fn soft_off_and_on() {
        let test = TestPort::new();
        let port = Port::probe(PortConfig::new(0, 0), test.resources()).unwrap();
        port.irq().intx().unmask(3);
        let enable = test.regs.peek(defs::INT_ENABLE);

        port.soft_power_off().unwrap();
        assert!(port.is_soft_off());
        assert!(!port.is_powered());
        assert_eq!(port.link_state(), LinkState::PowerOff);
        // idempotent
        port.soft_power_off().unwrap();
        assert!(matches!(port.endpoint_vote(true), Err(Error::PoweredOff)));

        port.soft_power_on().unwrap();
        assert!(port.is_powered());
        assert_eq!(test.regs.peek(defs::INT_ENABLE), enable);
        let events = test.log.take();
        assert_eq!(events.iter().filter(|e| **e == Event::Pins(false)).count(), 1);
        assert_eq!(events.iter().filter(|e| **e == Event::Pins(true)).count(), 1);
    }

    #[test]
    fn replay_timeout_recalibrates_phy() {
        let test = TestPort::new();
        let port = Port::probe(PortConfig::new(0, 0), test.resources()).unwrap();
        test.log.take();
        test.regs
            .poke(defs::AER_COR_STATUS, aer::COR_REPLAY_TIMER_TIMEOUT);
        test.regs.raise_aer_event();
        assert!(port.handle_interrupt());
        assert_eq!(test.log.take(), [Event::Phy(PhyCall::Recalibrate)]);
        assert_eq!(port.diagnostics().dump_count(), 1);
        assert_eq!(port.irq().stats().error_events.load(Ordering::Relaxed), 1);
        assert!(!port.handle_interrupt());
    }

    #[test]
    fn remove_refuses_with_vectors() {
        let test = TestPort::new();
        let port = Port::probe(PortConfig::new(0, 0), test.resources()).unwrap();
        let range = port.irq().msi().allocate(4).unwrap();
        assert!(matches!(
            port.remove(),
            Err(Error::VectorsInUse { count: 4 })
        ));
        assert!(port.is_powered());
        port.irq().msi().free(range);
        port.remove().unwrap();
        assert!(!port.is_powered());
        assert!(matches!(
            port.irq().msi().allocate(1),
            Err(Error::PoweredOff)
        ));
    }

    #[test]
    fn failed_soft_power_on_powers_down() {
        init_tracing();
        let test = TestPort::new();
        let config = PortConfig::new(0, 0).with_flags(PortFlags {
            soft_off: true,
            ..Default::default()
        });
        let port = Port::probe(config, test.resources()).unwrap();
        test.regs.set_trainable(false);
        test.log.take();

        let err = port.soft_power_on().unwrap_err();
        assert!(matches!(err, Error::LinkDownFatal { .. }));
        assert!(port.is_soft_off());
        assert!(!port.is_powered());
        assert!(test.log.take().contains(&Event::Clocks(false)));
    }

    #[test]
    fn unpowered_diagnostics_come_from_snapshot() {
        let test = TestPort::new();
        let port = Port::probe(PortConfig::new(0, 0), test.resources()).unwrap();
        assert_eq!(port.link_diagnostics().ltssm(), ltssm::L0);
        port.soft_power_off().unwrap();
        let reads = test.regs.read_count(defs::LTSSM_STATUS);
        assert_eq!(
            port.link_diagnostics(),
            LinkDiagnostics::new().with_ltssm(ltssm::L0).with_link_up(true)
        );
        assert_eq!(test.regs.read_count(defs::LTSSM_STATUS), reads);
    }

    #[test]
    fn quiesce_requires_power() {
        let test = TestPort::new();
        let port = Port::probe(PortConfig::new(0, 0), test.resources()).unwrap();
        port.disable_data_transit().unwrap();
        assert_eq!(test.regs.peek(defs::INT_ENABLE), 0);
        port.remove().unwrap();
        assert!(matches!(port.disable_data_transit(), Err(Error::PoweredOff)));
    }
}
