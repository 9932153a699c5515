// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Registry of probed ports and the entry points used by platform code.

use crate::Error;
use crate::config::PortConfig;
use crate::platform::PortResources;
use crate::port::Port;
use anyhow::Context as _;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::sync::Arc;

/// Number of controller ports the registry can hold.
pub const MAX_PORTS: usize = 4;

const EIO: i32 = 5;

/// Owns every probed [`Port`] and routes per-index requests to it.
pub struct HostDriver {
    ports: RwLock<[Option<Arc<Port>>; MAX_PORTS]>,
    probing: Mutex<[bool; MAX_PORTS]>,
}

impl HostDriver {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            ports: RwLock::new(Default::default()),
            probing: Mutex::new([false; MAX_PORTS]),
        }
    }

    /// Probes a port and registers it under its configured index.
    ///
    /// Link training sleeps, so the registry is not locked while the port
    /// probes; the index is reserved instead. A port that fails to probe is
    /// powered down and not registered.
    pub fn probe(&self, config: PortConfig, res: PortResources) -> anyhow::Result<Arc<Port>> {
        let index = config.index;
        if index >= MAX_PORTS {
            return Err(Error::NoSuchPort { index }.into());
        }
        {
            let mut probing = self.probing.lock();
            if probing[index] || self.ports.read()[index].is_some() {
                return Err(Error::PortExists { index }.into());
            }
            probing[index] = true;
        }
        let result = Port::probe(config, res);
        // Register before dropping the reservation so the index is never
        // seen as free in between.
        if let Ok(port) = &result {
            self.ports.write()[index] = Some(port.clone());
        }
        self.probing.lock()[index] = false;
        result.with_context(|| format!("failed to probe port {index}"))
    }

    /// Removes a port from the registry after powering it down.
    pub fn remove(&self, index: usize) -> anyhow::Result<()> {
        let mut ports = self.ports.write();
        let port = ports
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(Error::NoSuchPort { index })?;
        port.remove()
            .with_context(|| format!("failed to remove port {index}"))?;
        ports[index] = None;
        Ok(())
    }

    /// The port registered at `index`.
    pub fn port(&self, index: usize) -> Option<Arc<Port>> {
        self.ports.read().get(index)?.clone()
    }

    fn get(&self, index: usize) -> Result<Arc<Port>, Error> {
        self.port(index).ok_or(Error::NoSuchPort { index })
    }

    fn ports(&self) -> Vec<Arc<Port>> {
        self.ports.read().iter().flatten().cloned().collect()
    }

    /// Powers a released port back up and retrains its link.
    pub fn probe_port(&self, index: usize) -> anyhow::Result<()> {
        self.get(index)?
            .soft_power_on()
            .with_context(|| format!("failed to power on port {index}"))
    }

    /// Turns a port's link off and powers it down, leaving it registered.
    pub fn release_port(&self, index: usize) -> anyhow::Result<()> {
        self.get(index)?
            .soft_power_off()
            .with_context(|| format!("failed to power off port {index}"))
    }

    /// The raw link diagnostics bitmask of a port.
    pub fn dump_link_info(&self, index: usize) -> anyhow::Result<u32> {
        let port = self.get(index)?;
        let diag = port.link_diagnostics();
        tracing::info!(port = index, diag = diag.into_bits(), "link diagnostics");
        Ok(diag.into_bits())
    }

    /// Emergency quiesce of a port.
    pub fn disable_data_transit(&self, index: usize) -> anyhow::Result<()> {
        self.get(index)?
            .disable_data_transit()
            .with_context(|| format!("failed to disable data transit on port {index}"))
    }

    /// Casts the endpoint's clock vote on a port.
    pub fn vote(&self, index: usize, hw_mode: bool) -> anyhow::Result<()> {
        self.get(index)?
            .endpoint_vote(hw_mode)
            .with_context(|| format!("clock vote failed on port {index}"))
    }

    /// Suspends every port in index order.
    ///
    /// On failure the ports already suspended are resumed again and the
    /// error is returned; the system suspend must be aborted.
    pub fn suspend(&self) -> anyhow::Result<()> {
        let ports = self.ports();
        for (i, port) in ports.iter().enumerate() {
            if let Err(err) = port.suspend() {
                for done in ports[..i].iter().rev() {
                    if let Err(err) = done.resume() {
                        tracing::error!(
                            port = done.index(),
                            error = &err as &dyn std::error::Error,
                            "resume after aborted suspend failed"
                        );
                    }
                }
                return Err(err)
                    .with_context(|| format!("failed to suspend port {}", port.index()));
            }
        }
        Ok(())
    }

    /// Resumes every port in reverse index order.
    ///
    /// A port that fails to resume does not stop the others; the first
    /// failure is returned.
    pub fn resume(&self) -> anyhow::Result<()> {
        let mut result = Ok(());
        for port in self.ports().iter().rev() {
            if let Err(err) = port.resume() {
                tracing::error!(
                    port = port.index(),
                    error = &err as &dyn std::error::Error,
                    "resume failed"
                );
                if result.is_ok() {
                    result = Err(err)
                        .with_context(|| format!("failed to resume port {}", port.index()));
                }
            }
        }
        result
    }

    /// Removes every port. Ports that refuse removal stay registered.
    pub fn teardown(&self) -> anyhow::Result<()> {
        let mut result = Ok(());
        for index in 0..MAX_PORTS {
            if self.port(index).is_none() {
                continue;
            }
            if let Err(err) = self.remove(index) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// The negative errno for a failure returned by [`HostDriver`].
pub fn errno(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|e| e.downcast_ref::<Error>())
        .map_or(-EIO, Error::errno)
}
