// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Driver core for a PCIe Gen3 root complex host controller.
//!
//! A [`Port`] owns one controller: it sequences power and resets, trains the
//! link, programs the address translation windows and exposes the
//! controller's interrupt domains to endpoint drivers. [`HostDriver`] keeps
//! the probed ports and provides the per-index entry points used by platform
//! code, including system suspend and resume.
//!
//! Everything the controller needs from the rest of the platform (PHY,
//! clocks, reset lines, the shared reference clock, the bridge layer) is
//! supplied through the traits in [`platform`].

pub mod atr;
pub mod config;
pub mod diag;
pub mod io;
pub mod irq;
pub mod link;
pub mod manager;
pub mod platform;
pub mod port;
pub mod time;
pub mod vote;

mod error;
mod power;

#[cfg(test)]
mod test_helpers;

pub use config::LinkTimings;
pub use config::LowPowerMode;
pub use config::PortConfig;
pub use config::PortFlags;
pub use error::Error;
pub use manager::HostDriver;
pub use platform::Platform;
pub use platform::PortResources;
pub use port::Port;
