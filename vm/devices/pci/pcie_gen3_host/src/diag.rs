// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error event capture and link diagnostics.

use crate::io::RegisterIo;
use crate::io::RegisterIoExt;
use crate::irq::IrqRegisters;
use crate::platform::Phy;
use bitfield_struct::bitfield;
use pcie_gen3_defs as defs;
use pcie_gen3_defs::aer;
use pcie_gen3_defs::ltssm;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Debug bus selectors captured by a full dump.
const DEBUG_BUS_SELECTORS: [u32; 8] = [
    0x0000_0000, // ltssm history
    0x0001_0000, // phy lane 0 status
    0x0002_0000, // tx replay buffer
    0x0003_0000, // rx tlp state
    0x0004_0000, // flow control credits
    0x0005_0000, // axi master
    0x0006_0000, // axi slave
    0x0007_0000, // power management
];

/// Register state captured when a link or protocol error is observed.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DiagSnapshot {
    /// LTSSM status register.
    pub ltssm: u32,
    /// Link status register.
    pub link_status: u32,
    /// Top-level interrupt status.
    pub int_status: u32,
    /// AER uncorrectable error status.
    pub aer_uncorrectable: u32,
    /// AER correctable error status.
    pub aer_correctable: u32,
    /// Nonzero if an enabled MSI vector was pending.
    pub msi_pending: u32,
    /// Debug bus words, zero unless a full dump was taken.
    pub debug_bus: [u32; DEBUG_BUS_SELECTORS.len()],
}

static_assertions::const_assert_eq!(size_of::<DiagSnapshot>(), 56);

impl DiagSnapshot {
    /// The snapshot decoded as a [`LinkDiagnostics`] bitmask.
    pub fn link_diagnostics(&self) -> LinkDiagnostics {
        LinkDiagnostics::new()
            .with_ltssm(defs::LtssmStatus::from(self.ltssm).state())
            .with_link_up(defs::LinkStatus::from(self.link_status).link_up())
            .with_completion_timeout(self.aer_uncorrectable & aer::UNCOR_COMPLETION_TIMEOUT != 0)
            .with_receiver_error(self.aer_correctable & aer::COR_RECEIVER_ERROR != 0)
            .with_malformed_tlp(self.aer_uncorrectable & aer::UNCOR_MALFORMED_TLP != 0)
            .with_msi_pending(self.msi_pending != 0)
            .with_dl_down_exit(defs::LinkStatus::from(self.link_status).dl_down_event())
    }
}

/// Link diagnostics reported to the platform.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct LinkDiagnostics {
    /// LTSSM state encoding.
    #[bits(5)]
    pub ltssm: u8,
    /// Data link layer up.
    pub link_up: bool,
    /// Uncorrectable completion timeout.
    pub completion_timeout: bool,
    /// Correctable receiver error.
    pub receiver_error: bool,
    /// Uncorrectable malformed TLP.
    pub malformed_tlp: bool,
    /// An MSI owned by this driver was captured but not serviced.
    pub msi_pending: bool,
    /// The data link layer dropped out of DL_Active.
    pub dl_down_exit: bool,
    #[bits(21)]
    _reserved: u32,
}

/// What the error path found when an AER event was signaled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// Uncorrectable status at the time of the event.
    pub uncorrectable: u32,
    /// Correctable status at the time of the event.
    pub correctable: u32,
    /// Whether a full dump and PHY recalibration ran.
    pub dumped: bool,
}

/// Diagnostic state of one port.
pub struct Diagnostics {
    regs: Arc<dyn RegisterIo>,
    port: usize,
    last: spin::Mutex<Option<DiagSnapshot>>,
    dumps: AtomicU64,
}

impl Diagnostics {
    /// Creates diagnostics over the controller registers.
    pub fn new(regs: Arc<dyn RegisterIo>, port: usize) -> Self {
        Self {
            regs,
            port,
            last: spin::Mutex::new(None),
            dumps: AtomicU64::new(0),
        }
    }

    /// Reads the current register state and keeps it as the latest
    /// snapshot. With `full` set the debug bus is walked as well.
    ///
    /// Safe in interrupt context.
    pub fn capture(&self, full: bool, msi_pending: bool) -> DiagSnapshot {
        let regs = self.regs.as_ref();
        let mut snapshot = DiagSnapshot {
            ltssm: regs.read_u32(defs::LTSSM_STATUS),
            link_status: regs.read_u32(defs::LINK_STATUS),
            int_status: regs.read_u32(defs::INT_STATUS),
            aer_uncorrectable: regs.read_u32(defs::AER_UNCOR_STATUS),
            aer_correctable: regs.read_u32(defs::AER_COR_STATUS),
            msi_pending: msi_pending.into(),
            debug_bus: [0; DEBUG_BUS_SELECTORS.len()],
        };
        if full {
            for (word, &selector) in snapshot.debug_bus.iter_mut().zip(&DEBUG_BUS_SELECTORS) {
                regs.write_u32(defs::DEBUG_SEL, selector);
                *word = regs.read_u32(defs::DEBUG_OUT);
            }
            self.dumps.fetch_add(1, Ordering::Relaxed);
        }
        *self.last.lock() = Some(snapshot);
        snapshot
    }

    /// The most recent snapshot.
    pub fn last_snapshot(&self) -> Option<DiagSnapshot> {
        *self.last.lock()
    }

    /// Number of full dumps taken.
    pub fn dump_count(&self) -> u64 {
        self.dumps.load(Ordering::Relaxed)
    }

    /// Handles a signaled AER event from the interrupt path.
    ///
    /// A replay timer timeout triggers the full dump and a PHY
    /// recalibration. The link is left up; recovery policy belongs to the
    /// platform.
    pub fn handle_error_event(&self, phy: &dyn Phy, msi_pending: bool) -> ErrorEvent {
        let uncorrectable = self.regs.read_u32(defs::AER_UNCOR_STATUS);
        let correctable = self.regs.read_u32(defs::AER_COR_STATUS);
        let replay_timeout = correctable & aer::COR_REPLAY_TIMER_TIMEOUT != 0;

        let snapshot = self.capture(replay_timeout, msi_pending);
        tracing::warn!(
            port = self.port,
            uncorrectable,
            correctable,
            state = ltssm::name(defs::LtssmStatus::from(snapshot.ltssm).state()),
            "aer event"
        );
        if replay_timeout {
            tracing::error!(
                port = self.port,
                debug_bus = ?snapshot.debug_bus,
                "replay timer timeout"
            );
            if let Err(err) = phy.recalibrate() {
                tracing::error!(
                    port = self.port,
                    error = err.as_ref() as &dyn std::error::Error,
                    "phy recalibration failed"
                );
            }
        }

        self.regs.write_u32(defs::AER_UNCOR_STATUS, uncorrectable);
        self.regs.write_u32(defs::AER_COR_STATUS, correctable);
        ErrorEvent {
            uncorrectable,
            correctable,
            dumped: replay_timeout,
        }
    }

    /// Current link diagnostics read from the controller.
    pub fn link_diagnostics(&self, msi_pending: bool) -> LinkDiagnostics {
        self.capture(false, msi_pending).link_diagnostics()
    }

    /// Blocks all AXI traffic through the controller and masks every
    /// interrupt source.
    pub fn disable_data_transit(&self, irq: &IrqRegisters) {
        self.regs.modify(defs::MISC_CTRL, |v| {
            defs::MiscCtrl::from(v)
                .with_block_slave_transit(true)
                .with_block_master_transit(true)
                .into_bits()
        });
        irq.mask_all();
        tracing::warn!(port = self.port, "data transit disabled");
    }
}
