// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Legacy INTx lines.
//!
//! INTx is level triggered. The status bit latched by the controller is only
//! cleared at end of interrupt, after the handler has serviced the device.

use super::IrqHandler;
use super::IrqRegisters;
use super::IrqStats;
use pcie_gen3_defs::INTX_COUNT;
use pcie_gen3_defs::INTX_SHIFT;
use pcie_gen3_defs::INT_STATUS;
use std::sync::Arc;

/// The INTA..INTD domain.
pub struct IntxDomain {
    shared: Arc<IrqRegisters>,
    handlers: spin::RwLock<[Option<Arc<dyn IrqHandler>>; INTX_COUNT as usize]>,
    stats: Arc<IrqStats>,
}

fn bit(line: u32) -> u32 {
    assert!(line < INTX_COUNT, "invalid intx line {line}");
    1 << (line + INTX_SHIFT)
}

impl IntxDomain {
    pub(crate) fn new(shared: Arc<IrqRegisters>, stats: Arc<IrqStats>) -> Self {
        Self {
            shared,
            handlers: spin::RwLock::new(Default::default()),
            stats,
        }
    }

    /// Installs the handler for `line`, replacing any previous one.
    ///
    /// # Panics
    ///
    /// Panics if `line` is not below [`INTX_COUNT`].
    pub fn set_handler(&self, line: u32, handler: Arc<dyn IrqHandler>) {
        assert!(line < INTX_COUNT, "invalid intx line {line}");
        self.handlers.write()[line as usize] = Some(handler);
    }

    /// Removes the handler for `line`.
    pub fn clear_handler(&self, line: u32) {
        if let Some(handler) = self.handlers.write().get_mut(line as usize) {
            *handler = None;
        }
    }

    /// Disables `line` at the top-level enable register.
    ///
    /// # Panics
    ///
    /// Panics if `line` is out of range.
    pub fn mask(&self, line: u32) {
        self.shared.update_int_enable(|v| v & !bit(line));
    }

    /// Enables `line` at the top-level enable register.
    ///
    /// # Panics
    ///
    /// Panics if `line` is out of range.
    pub fn unmask(&self, line: u32) {
        self.shared.update_int_enable(|v| v | bit(line));
    }

    /// Clears the latched status of `line`.
    ///
    /// # Panics
    ///
    /// Panics if `line` is out of range.
    pub fn end_of_interrupt(&self, line: u32) {
        self.shared.regs().write_u32(INT_STATUS, bit(line));
    }

    /// Runs the handler for an asserted line, then signals end of interrupt.
    ///
    /// A line with no handler is masked so a stuck level does not storm.
    pub(crate) fn handle(&self, line: u32) {
        let handler = self.handlers.read()[line as usize].clone();
        match handler {
            Some(handler) => {
                IrqStats::inc(&self.stats.intx);
                handler.handle(line);
            }
            None => {
                IrqStats::inc(&self.stats.spurious);
                tracing::warn!(line, "spurious intx, masking");
                self.mask(line);
            }
        }
        self.end_of_interrupt(line);
    }
}
