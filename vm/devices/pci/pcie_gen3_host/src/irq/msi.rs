// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bottom MSI domain.
//!
//! The controller captures MSI writes into eight sets of 32 vectors. A
//! vector's set is `hwirq / 32` and its message data is `hwirq % 32`. Ranges
//! are handed out from a 256-bit bitmap as naturally aligned power-of-two
//! blocks, so multi-vector MSI gets the alignment it requires.

use super::IrqHandler;
use super::IrqRegisters;
use super::IrqStats;
use crate::Error;
use crate::platform::ParentInterrupt;
use bitvec::array::BitArray;
use bitvec::order::Lsb0;
use pcie_gen3_defs as defs;
use pcie_gen3_defs::MSI_SET_COUNT;
use pcie_gen3_defs::MSI_VECTOR_COUNT;
use pcie_gen3_defs::MSI_VECTORS_PER_SET;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

type Bitmap = BitArray<[u32; (MSI_VECTOR_COUNT / 32) as usize], Lsb0>;

/// A block of vectors returned by [`MsiDomain::allocate`].
#[derive(Debug, PartialEq, Eq)]
pub struct MsiRange {
    first: u32,
    count: u32,
    order: u32,
}

impl MsiRange {
    /// The first vector.
    pub fn first(&self) -> u32 {
        self.first
    }

    /// The number of vectors requested.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The number of vectors reserved, the request rounded up to a power of
    /// two.
    pub fn reserved(&self) -> u32 {
        1 << self.order
    }

    /// The requested vectors.
    pub fn hwirqs(&self) -> std::ops::Range<u32> {
        self.first..self.first + self.count
    }
}

/// Address/data pair an endpoint writes to raise a vector.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MsiMessage {
    /// Capture address of the vector's set.
    pub address: u64,
    /// Vector index within the set.
    pub data: u32,
}

/// The 256-vector MSI domain of one port.
pub struct MsiDomain {
    shared: Arc<IrqRegisters>,
    phys_base: u64,
    bitmap: parking_lot::Mutex<Bitmap>,
    /// Only changed with `bitmap` locked.
    closed: AtomicBool,
    handlers: spin::RwLock<Vec<Option<Arc<dyn IrqHandler>>>>,
    parent: Arc<dyn ParentInterrupt>,
    stats: Arc<IrqStats>,
}

fn split(hwirq: u32) -> (u32, u32) {
    assert!(hwirq < MSI_VECTOR_COUNT, "invalid msi vector {hwirq}");
    (hwirq / MSI_VECTORS_PER_SET, hwirq % MSI_VECTORS_PER_SET)
}

impl MsiDomain {
    pub(crate) fn new(
        shared: Arc<IrqRegisters>,
        phys_base: u64,
        parent: Arc<dyn ParentInterrupt>,
        stats: Arc<IrqStats>,
    ) -> Self {
        Self {
            shared,
            phys_base,
            bitmap: parking_lot::Mutex::new(Bitmap::ZERO),
            closed: AtomicBool::new(false),
            handlers: spin::RwLock::new(vec![None; MSI_VECTOR_COUNT as usize]),
            parent,
            stats,
        }
    }

    /// Reserves `count` contiguous vectors.
    ///
    /// The block is rounded up to a power of two and aligned to its size.
    /// Process context only. Fails with [`Error::PoweredOff`] once the port
    /// has been removed.
    pub fn allocate(&self, count: u32) -> Result<MsiRange, Error> {
        if count == 0 || count > MSI_VECTOR_COUNT {
            return Err(Error::InvalidVectorCount(count));
        }
        let size = count.next_power_of_two();
        let mut bitmap = self.bitmap.lock();
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::PoweredOff);
        }
        let first = (0..MSI_VECTOR_COUNT)
            .step_by(size as usize)
            .find(|&first| bitmap[first as usize..(first + size) as usize].not_any())
            .ok_or(Error::MsiSpaceExhausted { count })?;
        bitmap[first as usize..(first + size) as usize].fill(true);
        drop(bitmap);

        tracing::debug!(first, count, "allocated msi vectors");
        Ok(MsiRange {
            first,
            count,
            order: size.trailing_zeros(),
        })
    }

    /// Releases a block returned by [`MsiDomain::allocate`].
    ///
    /// The vectors are disabled and their captured status cleared, so the
    /// next owner starts from a masked vector.
    pub fn free(&self, range: MsiRange) {
        let start = range.first as usize;
        let end = start + range.reserved() as usize;
        {
            let mut handlers = self.handlers.write();
            for handler in &mut handlers[start..end] {
                *handler = None;
            }
        }
        let end_hwirq = range.first + range.reserved();
        let mut hwirq = range.first;
        while hwirq < end_hwirq {
            let (set, bit) = split(hwirq);
            let n = (end_hwirq - hwirq).min(MSI_VECTORS_PER_SET - bit);
            let mask = (u32::MAX >> (32 - n)) << bit;
            self.shared.update_set_enable(set, |v| v & !mask);
            self.shared
                .regs()
                .write_u32(defs::msi_set_status(set), mask);
            hwirq += n;
        }
        let mut bitmap = self.bitmap.lock();
        if !bitmap[start..end].all() {
            tracing::warn!(
                first = range.first,
                count = range.count,
                "freeing unallocated msi vectors"
            );
        }
        bitmap[start..end].fill(false);
    }

    /// Stops further allocation if no vectors are in use.
    pub(crate) fn close(&self) -> Result<(), Error> {
        let bitmap = self.bitmap.lock();
        let count = bitmap.count_ones() as u32;
        if count != 0 {
            return Err(Error::VectorsInUse { count });
        }
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Number of vectors currently reserved.
    pub fn allocated(&self) -> u32 {
        self.bitmap.lock().count_ones() as u32
    }

    /// Installs the handler for `hwirq`, which must be allocated.
    pub fn set_handler(&self, hwirq: u32, handler: Arc<dyn IrqHandler>) -> Result<(), Error> {
        let allocated = hwirq < MSI_VECTOR_COUNT && self.bitmap.lock()[hwirq as usize];
        if !allocated {
            return Err(Error::VectorNotAllocated { hwirq });
        }
        self.handlers.write()[hwirq as usize] = Some(handler);
        Ok(())
    }

    /// Clears the captured status bit of `hwirq`.
    ///
    /// # Panics
    ///
    /// Panics if `hwirq` is not below [`MSI_VECTOR_COUNT`]. The per-vector
    /// operations below share this precondition.
    pub fn ack(&self, hwirq: u32) {
        let (set, bit) = split(hwirq);
        self.shared
            .regs()
            .write_u32(defs::msi_set_status(set), 1 << bit);
    }

    /// Disables `hwirq` in its set.
    ///
    /// # Panics
    ///
    /// Panics if `hwirq` is out of range.
    pub fn mask(&self, hwirq: u32) {
        let (set, bit) = split(hwirq);
        self.shared.update_set_enable(set, |v| v & !(1 << bit));
    }

    /// Enables `hwirq` in its set.
    ///
    /// # Panics
    ///
    /// Panics if `hwirq` is out of range.
    pub fn unmask(&self, hwirq: u32) {
        let (set, bit) = split(hwirq);
        self.shared.update_set_enable(set, |v| v | (1 << bit));
    }

    /// The message an endpoint must write to raise `hwirq`.
    ///
    /// # Panics
    ///
    /// Panics if `hwirq` is out of range.
    pub fn compose_message(&self, hwirq: u32) -> MsiMessage {
        let (set, bit) = split(hwirq);
        MsiMessage {
            address: self.phys_base + defs::msi_set_offset(set) as u64,
            data: bit,
        }
    }

    /// All vectors share the controller's parent line, so affinity is that
    /// of the parent.
    ///
    /// # Panics
    ///
    /// Panics if `hwirq` is out of range.
    pub fn set_affinity(&self, hwirq: u32, cpu: u32) -> anyhow::Result<()> {
        split(hwirq);
        self.parent.set_affinity(cpu)
    }

    /// Whether any enabled vector has a captured, unserviced write.
    pub fn pending(&self) -> bool {
        let regs = self.shared.regs();
        (0..MSI_SET_COUNT).any(|set| {
            regs.read_u32(defs::msi_set_status(set)) & regs.read_u32(defs::msi_set_enable(set))
                != 0
        })
    }

    /// Services set `set` until no enabled vector is pending.
    ///
    /// Status is re-read after each pass since vectors may be captured again
    /// while their handlers run.
    pub(crate) fn handle_set(&self, set: u32) {
        let regs = self.shared.regs();
        loop {
            let mut pending = regs.read_u32(defs::msi_set_status(set))
                & regs.read_u32(defs::msi_set_enable(set));
            if pending == 0 {
                break;
            }
            while pending != 0 {
                let bit = pending.trailing_zeros();
                pending &= pending - 1;
                let hwirq = set * MSI_VECTORS_PER_SET + bit;
                self.ack(hwirq);
                let handler = self.handlers.read()[hwirq as usize].clone();
                match handler {
                    Some(handler) => {
                        IrqStats::inc(&self.stats.msi);
                        handler.handle(hwirq);
                    }
                    None => {
                        IrqStats::inc(&self.stats.spurious);
                        tracing::warn!(hwirq, "spurious msi");
                    }
                }
            }
        }
    }
}
