// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hardware control vote for the shared reference clock.
//!
//! The controller and the endpoint on the same clock net each vote whether
//! the reference clock may be gated by hardware. Hardware mode is only
//! enabled while both agree. When it drops back to software control, the
//! sleep protect logic must report ready before anything relies on the clock
//! again. The vote lock spans the combination, the register write, and that
//! wait, so a concurrent vote can never land between deciding and verifying.

use crate::Error;
use crate::config::LinkTimings;
use crate::io::RegisterIo;
use crate::io::RegisterIoExt;
use crate::time::Clock;
use crate::time::Poll;
use pcie_gen3_defs as defs;
use std::sync::Arc;

/// A party to the vote.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Voter {
    /// The host controller itself.
    Controller,
    /// The endpoint sharing the reference clock.
    Endpoint,
}

#[derive(Debug, Copy, Clone)]
struct VoteState {
    controller: bool,
    endpoint: bool,
    effective: bool,
}

/// Vote state of one port.
pub struct PowerVote {
    regs: Arc<dyn RegisterIo>,
    clock: Arc<dyn Clock>,
    timings: LinkTimings,
    port: usize,
    state: spin::Mutex<VoteState>,
}

impl PowerVote {
    /// Creates the vote state. The controller starts out voting against
    /// hardware mode and the endpoint starts out not objecting.
    pub fn new(
        regs: Arc<dyn RegisterIo>,
        clock: Arc<dyn Clock>,
        timings: LinkTimings,
        port: usize,
    ) -> Self {
        Self {
            regs,
            clock,
            timings,
            port,
            state: spin::Mutex::new(VoteState {
                controller: false,
                endpoint: true,
                effective: false,
            }),
        }
    }

    /// Whether hardware currently controls the reference clock.
    pub fn effective(&self) -> bool {
        self.state.lock().effective
    }

    /// The current `(controller, endpoint)` votes.
    pub fn votes(&self) -> (bool, bool) {
        let state = self.state.lock();
        (state.controller, state.endpoint)
    }

    /// Records `voter`'s vote and applies the combined result.
    ///
    /// Fails with [`Error::SleepProtectNotReady`] if hardware mode was just
    /// dropped and the sleep protect logic never reported ready. The
    /// register has been written by then; callers must not continue the
    /// power transition.
    pub fn cast(&self, voter: Voter, hw_mode: bool) -> Result<(), Error> {
        let mut state = self.state.lock();
        match voter {
            Voter::Controller => state.controller = hw_mode,
            Voter::Endpoint => state.endpoint = hw_mode,
        }
        let was = state.effective;
        let effective = state.controller && state.endpoint;
        let bit = defs::ClkreqControl::new().with_hw_mode(true).into_bits();
        if effective {
            self.regs.set_bits(defs::CLKREQ_CTRL, bit);
        } else {
            self.regs.clear_bits(defs::CLKREQ_CTRL, bit);
        }
        state.effective = effective;

        tracing::debug!(
            port = self.port,
            ?voter,
            hw_mode,
            effective,
            "clock vote"
        );

        if was && !effective {
            self.wait_sleep_protect()?;
        }
        Ok(())
    }

    fn wait_sleep_protect(&self) -> Result<(), Error> {
        let read = || self.regs.read_u32(defs::SLEEP_PROTECT);
        let ready = |v: u32| defs::SleepProtect::from(v).ready();
        let poll = Poll::spinning(
            self.timings.sleep_protect_poll_interval,
            self.timings.sleep_protect_timeout,
        );
        if poll.run(self.clock.as_ref(), read, ready).is_ok() {
            return Ok(());
        }

        // The ready signal can lag the clock request by a few cycles.
        self.clock.delay(self.timings.sleep_protect_debounce);
        if ready(read()) {
            tracing::warn!(port = self.port, "sleep protect ready after debounce");
            return Ok(());
        }
        tracing::error!(port = self.port, "sleep protect not ready");
        Err(Error::SleepProtectNotReady)
    }
}
