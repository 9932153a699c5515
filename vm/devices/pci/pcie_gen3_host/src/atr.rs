// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Address translation table (outbound windows).
//!
//! Each window maps a power-of-two sized host physical range onto PCI bus
//! addresses. Slots are handed out in order and are only reclaimed wholesale
//! when the controller loses power. Programming a window is a sequence of
//! five independent register writes; there is no way to roll back a
//! partially written table.

use crate::Error;
use crate::io::RegisterIo;
use pcie_gen3_defs as defs;
use pcie_gen3_defs::ATR_WINDOW_COUNT;

/// Smallest supported window, log2. The low 12 address bits carry the size
/// and enable fields.
pub const MIN_WINDOW_SHIFT: u32 = 12;
/// Largest supported window, log2.
pub const MAX_WINDOW_SHIFT: u32 = 63;

/// Transaction type generated for accesses through a window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WindowKind {
    /// Memory read/write TLPs.
    Memory,
    /// I/O read/write TLPs.
    Io,
}

/// One host to PCI address mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TranslationWindow {
    /// Host physical base.
    pub host_addr: u64,
    /// PCI bus base.
    pub pci_addr: u64,
    /// Size in bytes.
    pub size: u64,
    /// Transaction type.
    pub kind: WindowKind,
}

/// Index of a programmed translation table entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotId(pub u8);

/// Returns log2 of `size` if it is a supported window size.
pub fn window_shift(size: u64) -> Option<u32> {
    if !size.is_power_of_two() {
        return None;
    }
    let shift = size.trailing_zeros();
    (MIN_WINDOW_SHIFT..=MAX_WINDOW_SHIFT)
        .contains(&shift)
        .then_some(shift)
}

/// Tracks the translation slots in use on one port.
#[derive(Debug, Default)]
pub struct WindowTable {
    installed: u8,
}

impl WindowTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self { installed: 0 }
    }

    /// Number of windows programmed since the last reset.
    pub fn installed(&self) -> usize {
        self.installed.into()
    }

    /// Forgets all windows. The hardware table is not touched; it is lost
    /// with controller power.
    pub fn reset(&mut self) {
        self.installed = 0;
    }

    /// Programs `window` into the next free slot.
    ///
    /// Validation happens before any register is written.
    pub fn install(
        &mut self,
        regs: &dyn RegisterIo,
        window: &TranslationWindow,
    ) -> Result<SlotId, Error> {
        let shift = window_shift(window.size)
            .ok_or(Error::WindowSizeInvalid { size: window.size })?;
        if u32::from(self.installed) >= ATR_WINDOW_COUNT {
            return Err(Error::WindowTableFull);
        }

        let slot = SlotId(self.installed);
        let entry = defs::atr_entry(slot.0.into());
        let (target, tlp_type) = match window.kind {
            WindowKind::Memory => (defs::ATR_TYPE_MEM, defs::ATR_TLP_TYPE_MEM),
            WindowKind::Io => (defs::ATR_TYPE_IO, defs::ATR_TLP_TYPE_IO),
        };

        let src_lsb = defs::AtrSrcAddrLsb::new()
            .with_enable(true)
            .with_size((shift - 1) as u8)
            .with_addr_4k((window.host_addr as u32) >> MIN_WINDOW_SHIFT);

        regs.write_u32(entry, src_lsb.into_bits());
        regs.write_u32(
            entry + defs::ATR_SRC_ADDR_MSB_OFFSET,
            (window.host_addr >> 32) as u32,
        );
        regs.write_u32(
            entry + defs::ATR_TRSL_ADDR_LSB_OFFSET,
            window.pci_addr as u32,
        );
        regs.write_u32(
            entry + defs::ATR_TRSL_ADDR_MSB_OFFSET,
            (window.pci_addr >> 32) as u32,
        );
        regs.write_u32(
            entry + defs::ATR_TRSL_PARAM_OFFSET,
            defs::AtrParams::new()
                .with_target(target)
                .with_tlp_type(tlp_type)
                .into_bits(),
        );

        self.installed += 1;
        tracing::debug!(
            slot = slot.0,
            host_addr = window.host_addr,
            pci_addr = window.pci_addr,
            size = window.size,
            kind = ?window.kind,
            "programmed translation window"
        );
        Ok(slot)
    }
}
