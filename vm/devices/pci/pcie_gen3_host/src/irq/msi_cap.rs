// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MSI capability domain.
//!
//! Endpoint drivers allocate vectors here. The domain holds no state of its
//! own; it shapes requests according to the MSI or MSI-X rules and forwards
//! them to the bottom domain.

use super::msi::MsiDomain;
use super::msi::MsiMessage;
use super::msi::MsiRange;
use crate::Error;
use bitfield_struct::bitfield;
use std::sync::Arc;

/// Most vectors a single MSI capability can request.
const MSI_MAX_VECTORS: u32 = 32;
/// Most vectors an MSI-X table can hold.
const MSIX_MAX_VECTORS: u32 = 2048;

/// Capabilities advertised to endpoint drivers.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct MsiCapFlags {
    /// Multiple vectors per MSI capability.
    pub multi_vector: bool,
    /// MSI-X tables.
    pub msix: bool,
    #[bits(6)]
    _reserved: u8,
}

/// Interrupt capability used by an endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MsiKind {
    /// MSI: one contiguous, aligned block.
    Msi,
    /// MSI-X: independently allocated vectors.
    MsiX,
}

/// One vector handed to an endpoint driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MsiVector {
    /// Bottom domain vector.
    pub hwirq: u32,
    /// Message to program into the endpoint.
    pub message: MsiMessage,
}

/// Vectors allocated for one endpoint.
#[derive(Debug)]
pub struct MsiAllocation {
    kind: MsiKind,
    ranges: Vec<MsiRange>,
    vectors: Vec<MsiVector>,
}

impl MsiAllocation {
    /// The capability the vectors were allocated for.
    pub fn kind(&self) -> MsiKind {
        self.kind
    }

    /// The allocated vectors, in table order.
    pub fn vectors(&self) -> &[MsiVector] {
        &self.vectors
    }
}

/// The capability-level MSI domain.
pub struct MsiCapDomain {
    bottom: Arc<MsiDomain>,
    flags: MsiCapFlags,
}

impl MsiCapDomain {
    pub(crate) fn new(bottom: Arc<MsiDomain>, flags: MsiCapFlags) -> Self {
        Self { bottom, flags }
    }

    /// The advertised capabilities.
    pub fn flags(&self) -> MsiCapFlags {
        self.flags
    }

    /// Allocates `count` vectors for an endpoint.
    pub fn alloc_vectors(&self, kind: MsiKind, count: u32) -> Result<MsiAllocation, Error> {
        let ranges = match kind {
            MsiKind::Msi => {
                if count == 0 || count > MSI_MAX_VECTORS {
                    return Err(Error::InvalidVectorCount(count));
                }
                if count > 1 && !self.flags.multi_vector() {
                    return Err(Error::InvalidVectorCount(count));
                }
                vec![self.bottom.allocate(count)?]
            }
            MsiKind::MsiX => {
                if !self.flags.msix() {
                    return Err(Error::MsixUnsupported);
                }
                if count == 0 || count > MSIX_MAX_VECTORS {
                    return Err(Error::InvalidVectorCount(count));
                }
                let mut ranges = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    match self.bottom.allocate(1) {
                        Ok(range) => ranges.push(range),
                        Err(err) => {
                            for range in ranges {
                                self.bottom.free(range);
                            }
                            return Err(err);
                        }
                    }
                }
                ranges
            }
        };

        let vectors = ranges
            .iter()
            .flat_map(MsiRange::hwirqs)
            .map(|hwirq| MsiVector {
                hwirq,
                message: self.bottom.compose_message(hwirq),
            })
            .collect();

        Ok(MsiAllocation {
            kind,
            ranges,
            vectors,
        })
    }

    /// Returns an allocation's vectors to the bottom domain.
    pub fn free_vectors(&self, allocation: MsiAllocation) {
        for range in allocation.ranges {
            self.bottom.free(range);
        }
    }

    /// Masks a vector.
    pub fn mask(&self, vector: &MsiVector) {
        self.bottom.mask(vector.hwirq);
    }

    /// Unmasks a vector.
    pub fn unmask(&self, vector: &MsiVector) {
        self.bottom.unmask(vector.hwirq);
    }
}
