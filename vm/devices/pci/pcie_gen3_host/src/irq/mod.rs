// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interrupt routing.
//!
//! The controller funnels every interrupt source onto one parent line.
//! [`InterruptHierarchy::dispatch`] demultiplexes it: AER error events
//! first, then legacy INTx lines, then the eight MSI sets. Both the INTx
//! and MSI domains read-modify-write enable registers from the dispatch
//! path, so they share one spinlock through [`IrqRegisters`].

pub mod intx;
pub mod msi;
pub mod msi_cap;

use crate::io::RegisterIo;
use crate::io::RegisterIoExt;
use crate::platform::ParentInterrupt;
use intx::IntxDomain;
use msi::MsiDomain;
use msi_cap::MsiCapDomain;
use msi_cap::MsiCapFlags;
use pcie_gen3_defs as defs;
use pcie_gen3_defs::MSI_SET_COUNT;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// A handler for one interrupt, called in hard interrupt context.
pub trait IrqHandler: Send + Sync {
    /// Services the interrupt `hwirq` of the owning domain.
    fn handle(&self, hwirq: u32);
}

impl<F: Fn(u32) + Send + Sync> IrqHandler for F {
    fn handle(&self, hwirq: u32) {
        self(hwirq)
    }
}

/// Saved interrupt enable state, restored after the controller loses power.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IrqEnableState {
    /// Top-level enable register.
    pub int_enable: u32,
    /// Per-set MSI enable registers.
    pub set_enable: [u32; MSI_SET_COUNT as usize],
}

/// Enable registers shared by the INTx and MSI domains.
///
/// Every read-modify-write of [`defs::INT_ENABLE`] and the per-set enable
/// registers goes through the spinlock held here.
pub struct IrqRegisters {
    regs: Arc<dyn RegisterIo>,
    lock: spin::Mutex<()>,
}

impl IrqRegisters {
    /// Wraps the controller registers.
    pub fn new(regs: Arc<dyn RegisterIo>) -> Self {
        Self {
            regs,
            lock: spin::Mutex::new(()),
        }
    }

    /// Raw register access for reads and write-one-to-clear status bits.
    pub fn regs(&self) -> &dyn RegisterIo {
        self.regs.as_ref()
    }

    /// Updates the top-level enable register.
    pub fn update_int_enable(&self, f: impl FnOnce(u32) -> u32) -> u32 {
        let _guard = self.lock.lock();
        self.regs.modify(defs::INT_ENABLE, f)
    }

    /// Updates the enable register of MSI set `set`.
    pub fn update_set_enable(&self, set: u32, f: impl FnOnce(u32) -> u32) -> u32 {
        let _guard = self.lock.lock();
        self.regs.modify(defs::msi_set_enable(set), f)
    }

    /// Programs the MSI capture addresses and enables all sets.
    pub fn enable_msi(&self, phys_base: u64) {
        for set in 0..MSI_SET_COUNT {
            let addr = phys_base + defs::msi_set_offset(set) as u64;
            self.regs.write_u32(defs::msi_set_offset(set), addr as u32);
            self.regs
                .write_u32(defs::msi_set_addr_hi(set), (addr >> 32) as u32);
        }
        let _guard = self.lock.lock();
        self.regs
            .set_bits(defs::MSI_SET_ENABLE, (1 << MSI_SET_COUNT) - 1);
        self.regs.set_bits(
            defs::INT_ENABLE,
            defs::IntRegister::new().with_msi_sets(0xff).into_bits(),
        );
    }

    /// Snapshots the enable registers.
    pub fn save(&self) -> IrqEnableState {
        let _guard = self.lock.lock();
        IrqEnableState {
            int_enable: self.regs.read_u32(defs::INT_ENABLE),
            set_enable: std::array::from_fn(|set| {
                self.regs.read_u32(defs::msi_set_enable(set as u32))
            }),
        }
    }

    /// Writes back a snapshot taken by [`IrqRegisters::save`].
    pub fn restore(&self, state: &IrqEnableState) {
        let _guard = self.lock.lock();
        for (set, &enable) in state.set_enable.iter().enumerate() {
            self.regs.write_u32(defs::msi_set_enable(set as u32), enable);
        }
        self.regs.write_u32(defs::INT_ENABLE, state.int_enable);
    }

    /// Masks every interrupt source at the top level.
    pub fn mask_all(&self) {
        let _guard = self.lock.lock();
        self.regs.write_u32(defs::INT_ENABLE, 0);
    }
}

/// Interrupt counters.
#[derive(Debug, Default)]
pub struct IrqStats {
    /// INTx interrupts delivered.
    pub intx: AtomicU64,
    /// MSI interrupts delivered.
    pub msi: AtomicU64,
    /// AER error events handled.
    pub error_events: AtomicU64,
    /// Interrupts with no handler installed.
    pub spurious: AtomicU64,
}

impl IrqStats {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The three interrupt domains of one port.
pub struct InterruptHierarchy {
    shared: Arc<IrqRegisters>,
    intx: IntxDomain,
    msi: Arc<MsiDomain>,
    msi_cap: MsiCapDomain,
    stats: Arc<IrqStats>,
}

impl InterruptHierarchy {
    /// Builds the domains for a controller whose registers live at
    /// `phys_base`.
    pub fn new(
        regs: Arc<dyn RegisterIo>,
        phys_base: u64,
        caps: MsiCapFlags,
        parent: Arc<dyn ParentInterrupt>,
    ) -> Self {
        let shared = Arc::new(IrqRegisters::new(regs));
        let stats = Arc::new(IrqStats::default());
        let msi = Arc::new(MsiDomain::new(
            shared.clone(),
            phys_base,
            parent,
            stats.clone(),
        ));
        Self {
            intx: IntxDomain::new(shared.clone(), stats.clone()),
            msi_cap: MsiCapDomain::new(msi.clone(), caps),
            msi,
            shared,
            stats,
        }
    }

    /// The shared enable register handle.
    pub fn registers(&self) -> &Arc<IrqRegisters> {
        &self.shared
    }

    /// The legacy INTx domain.
    pub fn intx(&self) -> &IntxDomain {
        &self.intx
    }

    /// The bottom MSI domain.
    pub fn msi(&self) -> &Arc<MsiDomain> {
        &self.msi
    }

    /// The MSI capability domain endpoint drivers allocate from.
    pub fn msi_cap(&self) -> &MsiCapDomain {
        &self.msi_cap
    }

    /// Interrupt counters.
    pub fn stats(&self) -> &IrqStats {
        &self.stats
    }

    /// Services the controller's parent interrupt.
    ///
    /// `on_error` runs before any INTx or MSI handler when an AER event is
    /// pending, so it observes the error state as it was when the interrupt
    /// fired. Returns whether any source was pending.
    pub fn dispatch(&self, on_error: impl FnOnce()) -> bool {
        let regs = self.shared.regs();
        let status = defs::IntRegister::from(regs.read_u32(defs::INT_STATUS));

        if status.aer_event() {
            IrqStats::inc(&self.stats.error_events);
            on_error();
            regs.write_u32(
                defs::INT_STATUS,
                defs::IntRegister::new().with_aer_event(true).into_bits(),
            );
        }

        let intx = status.intx();
        for line in 0..defs::INTX_COUNT {
            if intx & (1 << line) != 0 {
                self.intx.handle(line);
            }
        }

        let sets = status.msi_sets();
        for set in 0..MSI_SET_COUNT {
            if sets & (1 << set) != 0 {
                self.msi.handle_set(set);
                regs.write_u32(
                    defs::INT_STATUS,
                    defs::IntRegister::new().with_msi_sets(1 << set).into_bits(),
                );
            }
        }

        status.aer_event() || intx != 0 || sets != 0
    }
}
