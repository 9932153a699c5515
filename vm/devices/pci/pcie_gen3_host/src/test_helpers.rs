// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::atr::TranslationWindow;
use crate::atr::WindowKind;
use crate::io::RegisterIo;
use crate::platform::ClockReference;
use crate::platform::Clocks;
use crate::platform::HostBridge;
use crate::platform::ParentInterrupt;
use crate::platform::Phy;
use crate::platform::PinControl;
use crate::platform::PortResources;
use crate::platform::ResetLine;
use crate::time::Clock;
use parking_lot::Mutex;
use pcie_gen3_defs as defs;
use pcie_gen3_defs::ltssm;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Link status, LTSSM and negotiated link once training completes: gen3 x1.
const TRAINED_LNKCTL: u32 = 0x13 << 16;
const DEBUG_OUT_TAG: u32 = 0xdb00_0000;

type ReadHook = Arc<dyn Fn() -> Option<u32> + Send + Sync>;

struct RegisterState {
    values: Vec<u32>,
    writes: Vec<(usize, u32)>,
    reads: HashMap<usize, usize>,
    trainable: bool,
    l2_capable: bool,
    sleep_protect_ready: bool,
}

impl RegisterState {
    fn reset_values(&mut self) {
        self.values.fill(0);
        self.values[defs::BASE_CFG / 4] = defs::BaseCfg::new().with_speed_bitmap(0b111).into_bits();
        self.values[defs::SLEEP_PROTECT / 4] = self.sleep_protect_ready.into();
    }

    fn set(&mut self, offset: usize, value: u32) {
        self.values[offset / 4] = value;
    }

    fn get(&self, offset: usize) -> u32 {
        self.values[offset / 4]
    }

    fn link_up(&self) -> bool {
        defs::LinkStatus::from(self.get(defs::LINK_STATUS)).link_up()
    }

    fn set_link(&mut self, up: bool, state: u8) {
        let status = defs::LinkStatus::from(self.get(defs::LINK_STATUS)).with_link_up(up);
        self.set(defs::LINK_STATUS, status.into_bits());
        self.set(
            defs::LTSSM_STATUS,
            defs::LtssmStatus::new().with_state(state).into_bits(),
        );
    }

    fn is_w1c(offset: usize) -> bool {
        matches!(
            offset,
            defs::INT_STATUS | defs::AER_UNCOR_STATUS | defs::AER_COR_STATUS
        ) || (0..defs::MSI_SET_COUNT).any(|set| offset == defs::msi_set_status(set))
    }

    fn write(&mut self, offset: usize, data: u32) {
        self.writes.push((offset, data));
        if Self::is_w1c(offset) {
            let value = self.get(offset) & !data;
            self.set(offset, value);
            return;
        }
        match offset {
            defs::LINK_STATUS => {
                let dl_down = defs::LinkStatus::new().with_dl_down_event(true).into_bits();
                let value = self.get(offset) & !(data & dl_down);
                self.set(offset, value);
            }
            defs::RST_CTRL => {
                self.set(offset, data);
                if data == 0 && self.trainable {
                    self.set_link(true, ltssm::L0);
                    let control = self.get(defs::EXP_LNKCTL) & 0xffff;
                    self.set(defs::EXP_LNKCTL, control | TRAINED_LNKCTL);
                } else {
                    self.set_link(false, ltssm::DETECT_QUIET);
                }
            }
            defs::ICMD_PM => {
                self.set(offset, data);
                if defs::IcmdPm::from(data).turn_off_link() && self.l2_capable && self.link_up() {
                    self.set_link(false, ltssm::L2_IDLE);
                }
            }
            defs::DEBUG_SEL => {
                self.set(offset, data);
                self.set(defs::DEBUG_OUT, DEBUG_OUT_TAG | data);
            }
            _ => self.set(offset, data),
        }
    }
}

/// An emulated controller register window.
pub struct TestRegisters {
    state: Mutex<RegisterState>,
    hooks: Mutex<HashMap<usize, ReadHook>>,
}

impl TestRegisters {
    pub fn new() -> Self {
        let mut state = RegisterState {
            values: vec![0; defs::REGISTER_WINDOW_LEN / 4],
            writes: Vec::new(),
            reads: HashMap::new(),
            trainable: true,
            l2_capable: true,
            sleep_protect_ready: true,
        };
        state.reset_values();
        Self {
            state: Mutex::new(state),
            hooks: Mutex::new(HashMap::new()),
        }
    }

    /// Reads a register without side effects.
    pub fn peek(&self, offset: usize) -> u32 {
        self.state.lock().get(offset)
    }

    /// Sets a register without side effects.
    pub fn poke(&self, offset: usize, value: u32) {
        self.state.lock().set(offset, value);
    }

    pub fn dump(&self) -> Vec<u32> {
        self.state.lock().values.clone()
    }

    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub fn read_count(&self, offset: usize) -> usize {
        self.state.lock().reads.get(&offset).copied().unwrap_or(0)
    }

    /// Overrides reads of `offset` whenever `hook` returns a value.
    pub fn on_read(&self, offset: usize, hook: impl Fn() -> Option<u32> + Send + Sync + 'static) {
        self.hooks.lock().insert(offset, Arc::new(hook));
    }

    pub fn set_trainable(&self, trainable: bool) {
        self.state.lock().trainable = trainable;
    }

    pub fn set_l2_capable(&self, capable: bool) {
        self.state.lock().l2_capable = capable;
    }

    pub fn set_sleep_protect_ready(&self, ready: bool) {
        let mut state = self.state.lock();
        state.sleep_protect_ready = ready;
        state.set(defs::SLEEP_PROTECT, ready.into());
    }

    /// Returns every register to its power-on value.
    pub fn power_loss(&self) {
        self.state.lock().reset_values();
    }

    pub fn raise_intx(&self, line: u32) {
        let mut state = self.state.lock();
        let status = state.get(defs::INT_STATUS) | 1 << (defs::INTX_SHIFT + line);
        state.set(defs::INT_STATUS, status);
    }

    pub fn raise_msi(&self, hwirq: u32) {
        let set = hwirq / defs::MSI_VECTORS_PER_SET;
        let bit = hwirq % defs::MSI_VECTORS_PER_SET;
        let mut state = self.state.lock();
        let status = state.get(defs::msi_set_status(set)) | 1 << bit;
        state.set(defs::msi_set_status(set), status);
        let status = state.get(defs::INT_STATUS) | 1 << (defs::MSI_SHIFT + set);
        state.set(defs::INT_STATUS, status);
    }

    pub fn raise_aer_event(&self) {
        let mut state = self.state.lock();
        let status = state.get(defs::INT_STATUS)
            | defs::IntRegister::new().with_aer_event(true).into_bits();
        state.set(defs::INT_STATUS, status);
    }

    fn check(offset: usize) {
        assert!(
            offset % 4 == 0 && offset < defs::REGISTER_WINDOW_LEN,
            "bad register offset {offset:#x}"
        );
    }
}

impl RegisterIo for TestRegisters {
    fn len(&self) -> usize {
        defs::REGISTER_WINDOW_LEN
    }

    fn read_u32(&self, offset: usize) -> u32 {
        Self::check(offset);
        *self.state.lock().reads.entry(offset).or_default() += 1;
        let hook = self.hooks.lock().get(&offset).cloned();
        if let Some(value) = hook.and_then(|hook| hook()) {
            return value;
        }
        self.state.lock().get(offset)
    }

    fn write_u32(&self, offset: usize, data: u32) {
        Self::check(offset);
        self.state.lock().write(offset, data);
    }
}

/// A virtual clock. Time only advances when the code under test waits.
#[derive(Default)]
pub struct TestClock {
    waited: Mutex<(Duration, Duration)>,
}

impl TestClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slept(&self) -> Duration {
        self.waited.lock().0
    }

    pub fn spun(&self) -> Duration {
        self.waited.lock().1
    }
}

impl Clock for TestClock {
    fn now(&self) -> Duration {
        let (slept, spun) = *self.waited.lock();
        slept + spun
    }

    fn sleep(&self, duration: Duration) {
        self.waited.lock().0 += duration;
    }

    fn delay(&self, duration: Duration) {
        self.waited.lock().1 += duration;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PhyCall {
    Init,
    PowerOn,
    PowerOff,
    Exit,
    Recalibrate,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClockRefCall {
    Request(u32),
    Release(u32),
    Voter(u32, u32, bool),
}

/// Calls made into the platform fakes. Reset lines record whether they were
/// asserted, clocks whether they were enabled, pins whether they went
/// active.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    Phy(PhyCall),
    PhyReset(bool),
    MacReset(bool),
    PeripheralReset(bool),
    Clocks(bool),
    Pins(bool),
    ClockRef(ClockRefCall),
    BridgeSave,
    BridgeRestore,
}

#[derive(Default)]
pub struct EventLog(Mutex<Vec<Event>>);

impl EventLog {
    fn push(&self, event: Event) {
        self.0.lock().push(event);
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.lock())
    }

    fn snapshot(&self) -> Vec<Event> {
        self.0.lock().clone()
    }
}

pub struct TestPhy {
    log: Arc<EventLog>,
    fail_power_on: AtomicBool,
}

impl TestPhy {
    pub fn new() -> Self {
        Self::with_log(Default::default())
    }

    pub fn with_log(log: Arc<EventLog>) -> Self {
        Self {
            log,
            fail_power_on: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<PhyCall> {
        self.log
            .snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::Phy(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn fail_power_on(&self, fail: bool) {
        self.fail_power_on.store(fail, Ordering::SeqCst);
    }
}

impl Phy for TestPhy {
    fn init(&self) -> anyhow::Result<()> {
        self.log.push(Event::Phy(PhyCall::Init));
        Ok(())
    }

    fn power_on(&self) -> anyhow::Result<()> {
        if self.fail_power_on.load(Ordering::SeqCst) {
            anyhow::bail!("phy power on failed");
        }
        self.log.push(Event::Phy(PhyCall::PowerOn));
        Ok(())
    }

    fn power_off(&self) -> anyhow::Result<()> {
        self.log.push(Event::Phy(PhyCall::PowerOff));
        Ok(())
    }

    fn exit(&self) -> anyhow::Result<()> {
        self.log.push(Event::Phy(PhyCall::Exit));
        Ok(())
    }

    fn recalibrate(&self) -> anyhow::Result<()> {
        self.log.push(Event::Phy(PhyCall::Recalibrate));
        Ok(())
    }
}

pub struct TestResetLine {
    log: Arc<EventLog>,
    event: fn(bool) -> Event,
}

impl ResetLine for TestResetLine {
    fn assert(&self) -> anyhow::Result<()> {
        self.log.push((self.event)(true));
        Ok(())
    }

    fn deassert(&self) -> anyhow::Result<()> {
        self.log.push((self.event)(false));
        Ok(())
    }
}

/// Disabling the clocks loses all register state.
pub struct TestClocks {
    log: Arc<EventLog>,
    regs: Arc<TestRegisters>,
}

impl Clocks for TestClocks {
    fn enable(&self) -> anyhow::Result<()> {
        self.log.push(Event::Clocks(true));
        Ok(())
    }

    fn disable(&self) -> anyhow::Result<()> {
        self.log.push(Event::Clocks(false));
        self.regs.power_loss();
        Ok(())
    }
}

pub struct TestPins {
    log: Arc<EventLog>,
}

impl PinControl for TestPins {
    fn set_active(&self) -> anyhow::Result<()> {
        self.log.push(Event::Pins(true));
        Ok(())
    }

    fn set_idle(&self) -> anyhow::Result<()> {
        self.log.push(Event::Pins(false));
        Ok(())
    }
}

pub struct TestClockReference {
    log: Arc<EventLog>,
    fail_voter: AtomicBool,
}

impl TestClockReference {
    pub fn new() -> Self {
        Self::with_log(Default::default())
    }

    pub fn with_log(log: Arc<EventLog>) -> Self {
        Self {
            log,
            fail_voter: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<ClockRefCall> {
        self.log
            .snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::ClockRef(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn fail_voter(&self, fail: bool) {
        self.fail_voter.store(fail, Ordering::SeqCst);
    }
}

impl ClockReference for TestClockReference {
    fn request_reference_clock(&self, subsystem_id: u32) -> anyhow::Result<()> {
        self.log.push(Event::ClockRef(ClockRefCall::Request(subsystem_id)));
        Ok(())
    }

    fn release_reference_clock(&self, subsystem_id: u32) -> anyhow::Result<()> {
        self.log.push(Event::ClockRef(ClockRefCall::Release(subsystem_id)));
        Ok(())
    }

    fn voter_write(&self, subsystem_id: u32, xo_id: u32, enable: bool) -> anyhow::Result<()> {
        if self.fail_voter.load(Ordering::SeqCst) {
            anyhow::bail!("voter write rejected");
        }
        self.log
            .push(Event::ClockRef(ClockRefCall::Voter(subsystem_id, xo_id, enable)));
        Ok(())
    }
}

pub struct TestHostBridge {
    log: Arc<EventLog>,
    windows: Mutex<Vec<TranslationWindow>>,
}

impl TestHostBridge {
    pub fn set_windows(&self, windows: impl IntoIterator<Item = TranslationWindow>) {
        *self.windows.lock() = windows.into_iter().collect();
    }
}

impl HostBridge for TestHostBridge {
    fn windows(&self) -> Vec<TranslationWindow> {
        self.windows.lock().clone()
    }

    fn save_config(&self) -> anyhow::Result<()> {
        self.log.push(Event::BridgeSave);
        Ok(())
    }

    fn restore_config(&self) -> anyhow::Result<()> {
        self.log.push(Event::BridgeRestore);
        Ok(())
    }
}

#[derive(Default)]
pub struct TestParentInterrupt {
    cpu: Mutex<Option<u32>>,
}

impl TestParentInterrupt {
    pub fn cpu(&self) -> Option<u32> {
        *self.cpu.lock()
    }
}

impl ParentInterrupt for TestParentInterrupt {
    fn set_affinity(&self, cpu: u32) -> anyhow::Result<()> {
        *self.cpu.lock() = Some(cpu);
        Ok(())
    }
}

/// A complete set of platform fakes for one port, sharing one event log.
pub struct TestPort {
    pub regs: Arc<TestRegisters>,
    pub clock: Arc<TestClock>,
    pub log: Arc<EventLog>,
    pub phy: Arc<TestPhy>,
    pub clock_ref: Arc<TestClockReference>,
    pub bridge: Arc<TestHostBridge>,
    pub parent: Arc<TestParentInterrupt>,
}

impl TestPort {
    pub fn new() -> Self {
        let log = Arc::new(EventLog::default());
        Self {
            regs: Arc::new(TestRegisters::new()),
            clock: Arc::new(TestClock::new()),
            phy: Arc::new(TestPhy::with_log(log.clone())),
            clock_ref: Arc::new(TestClockReference::with_log(log.clone())),
            bridge: Arc::new(TestHostBridge {
                log: log.clone(),
                windows: Mutex::new(Vec::new()),
            }),
            parent: Arc::new(TestParentInterrupt::default()),
            log,
        }
    }

    pub fn mem_window(host_addr: u64, size: u64) -> TranslationWindow {
        TranslationWindow {
            host_addr,
            pci_addr: host_addr,
            size,
            kind: WindowKind::Memory,
        }
    }

    fn reset_line(&self, event: fn(bool) -> Event) -> Option<Arc<dyn ResetLine>> {
        Some(Arc::new(TestResetLine {
            log: self.log.clone(),
            event,
        }))
    }

    pub fn resources(&self) -> PortResources {
        PortResources {
            regs: self.regs.clone(),
            clock: self.clock.clone(),
            phy: self.phy.clone(),
            phy_reset: self.reset_line(Event::PhyReset),
            mac_reset: self.reset_line(Event::MacReset),
            peripheral_reset: self.reset_line(Event::PeripheralReset),
            clocks: Arc::new(TestClocks {
                log: self.log.clone(),
                regs: self.regs.clone(),
            }),
            pins: Arc::new(TestPins {
                log: self.log.clone(),
            }),
            clock_ref: self.clock_ref.clone(),
            bridge: self.bridge.clone(),
            parent_irq: self.parent.clone(),
        }
    }
}
