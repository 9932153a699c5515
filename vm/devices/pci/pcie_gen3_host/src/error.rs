// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use pcie_gen3_defs::ATR_WINDOW_COUNT;
use thiserror::Error;

/// Errors returned by the host controller driver.
#[derive(Debug, Error)]
#[expect(missing_docs)]
pub enum Error {
    #[error("translation window size {size:#x} is not a supported power of two")]
    WindowSizeInvalid { size: u64 },
    #[error("all {} translation windows are in use", ATR_WINDOW_COUNT)]
    WindowTableFull,
    #[error("link did not come up, ltssm status {ltssm:#010x}")]
    LinkDownFatal { ltssm: u32 },
    #[error("link did not enter L2, ltssm status {ltssm:#010x}")]
    L2EntryTimeout { ltssm: u32 },
    #[error("sleep protect not ready after clock gating")]
    SleepProtectNotReady,
    #[error("reference clock vote request failed")]
    VoteRequestFailed(#[source] anyhow::Error),
    #[error("no free msi range for {count} vectors")]
    MsiSpaceExhausted { count: u32 },
    #[error("invalid msi vector count {0}")]
    InvalidVectorCount(u32),
    #[error("msi-x is not supported by this domain")]
    MsixUnsupported,
    #[error("msi vector {hwirq} is not allocated")]
    VectorNotAllocated { hwirq: u32 },
    #[error("{count} msi vectors still allocated")]
    VectorsInUse { count: u32 },
    #[error("phy operation failed")]
    Phy(#[source] anyhow::Error),
    #[error("clock operation failed")]
    Clock(#[source] anyhow::Error),
    #[error("reset line operation failed")]
    Reset(#[source] anyhow::Error),
    #[error("pin state change failed")]
    PinControl(#[source] anyhow::Error),
    #[error("host bridge configuration save/restore failed")]
    HostBridge(#[source] anyhow::Error),
    #[error("port is powered off")]
    PoweredOff,
    #[error("no port {index}")]
    NoSuchPort { index: usize },
    #[error("port {index} is already probed")]
    PortExists { index: usize },
}

const EINVAL: i32 = 22;
const ENOSPC: i32 = 28;
const EBUSY: i32 = 16;
const ETIMEDOUT: i32 = 110;
const EIO: i32 = 5;
const ENODEV: i32 = 19;
const EOPNOTSUPP: i32 = 95;

impl Error {
    /// The negative errno used when reporting this error to the platform.
    pub fn errno(&self) -> i32 {
        -match self {
            Error::WindowSizeInvalid { .. }
            | Error::InvalidVectorCount(_)
            | Error::VectorNotAllocated { .. } => EINVAL,
            Error::WindowTableFull | Error::MsiSpaceExhausted { .. } => ENOSPC,
            Error::LinkDownFatal { .. }
            | Error::L2EntryTimeout { .. }
            | Error::SleepProtectNotReady => ETIMEDOUT,
            Error::VectorsInUse { .. } => EBUSY,
            Error::MsixUnsupported => EOPNOTSUPP,
            Error::PoweredOff | Error::NoSuchPort { .. } => ENODEV,
            Error::PortExists { .. } => EBUSY,
            Error::VoteRequestFailed(_)
            | Error::Phy(_)
            | Error::Clock(_)
            | Error::Reset(_)
            | Error::PinControl(_)
            | Error::HostBridge(_) => EIO,
        }
    }
}
