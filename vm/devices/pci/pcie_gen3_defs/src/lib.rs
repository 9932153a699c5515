// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Register layout of the Gen3 PCIe host controller MAC.
//!
//! Offsets are byte offsets from the start of the controller's register
//! window. Configuration space of the root port itself is mirrored at
//! [`CFG_OFFSET`].

#![no_std]
#![forbid(unsafe_code)]
#![expect(missing_docs)] // register and field names are self-explanatory

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Size of the controller register window.
pub const REGISTER_WINDOW_LEN: usize = 0x2000;

/// Number of legacy INTx lines.
pub const INTX_COUNT: u32 = 4;
/// Number of hardware MSI sets.
pub const MSI_SET_COUNT: u32 = 8;
/// Number of vectors captured by a single MSI set.
pub const MSI_VECTORS_PER_SET: u32 = 32;
/// Total MSI vectors handled by the controller.
pub const MSI_VECTOR_COUNT: u32 = MSI_SET_COUNT * MSI_VECTORS_PER_SET;
/// Number of address translation table entries.
pub const ATR_WINDOW_COUNT: u32 = 8;

/// Root-complex class code programmed into [`PCI_IDS_1`].
pub const CLASS_BRIDGE_PCI_NORMAL: u32 = 0x060400;

pub const BASE_CFG: usize = 0x14;
pub const SETTING: usize = 0x80;
pub const PCI_IDS_1: usize = 0x9c;
pub const RST_CTRL: usize = 0x148;
pub const LTSSM_STATUS: usize = 0x150;
pub const LINK_STATUS: usize = 0x154;
pub const DEBUG_SEL: usize = 0x160;
pub const DEBUG_OUT: usize = 0x164;
pub const INT_ENABLE: usize = 0x180;
pub const INT_STATUS: usize = 0x184;
pub const MSI_SET_ENABLE: usize = 0x190;
pub const ICMD_PM: usize = 0x198;
pub const CLKREQ_CTRL: usize = 0x1a8;
pub const SLEEP_PROTECT: usize = 0x1ac;
pub const MISC_CTRL: usize = 0x348;

/// Base of the MSI set register blocks.
pub const MSI_SET_BASE: usize = 0xc00;
/// Stride between MSI set register blocks.
pub const MSI_SET_STRIDE: usize = 0x10;
/// Offset of the per-set status register within a set block.
pub const MSI_SET_STATUS_OFFSET: usize = 0x04;
/// Offset of the per-set enable register within a set block.
pub const MSI_SET_ENABLE_OFFSET: usize = 0x08;
/// Base of the per-set capture address high words.
pub const MSI_SET_ADDR_HI_BASE: usize = 0xc80;
/// Stride between per-set capture address high words.
pub const MSI_SET_ADDR_HI_STRIDE: usize = 0x4;

/// Base of the address translation table.
pub const ATR_BASE: usize = 0x800;
/// Stride between translation table entries.
pub const ATR_STRIDE: usize = 0x20;
pub const ATR_SRC_ADDR_MSB_OFFSET: usize = 0x4;
pub const ATR_TRSL_ADDR_LSB_OFFSET: usize = 0x8;
pub const ATR_TRSL_ADDR_MSB_OFFSET: usize = 0xc;
pub const ATR_TRSL_PARAM_OFFSET: usize = 0x10;

/// Root port configuration space mirror.
pub const CFG_OFFSET: usize = 0x1000;
/// PCI Express Link Control / Link Status.
pub const EXP_LNKCTL: usize = CFG_OFFSET + 0x90;
/// PCI Express Link Control 2.
pub const EXP_LNKCTL2: usize = CFG_OFFSET + 0xb0;
/// AER uncorrectable error status.
pub const AER_UNCOR_STATUS: usize = CFG_OFFSET + 0x104;
/// AER correctable error status.
pub const AER_COR_STATUS: usize = CFG_OFFSET + 0x110;

/// Offset of the block of registers for MSI set `set`.
pub const fn msi_set_offset(set: u32) -> usize {
    MSI_SET_BASE + set as usize * MSI_SET_STRIDE
}

/// Offset of the status register of MSI set `set`.
pub const fn msi_set_status(set: u32) -> usize {
    msi_set_offset(set) + MSI_SET_STATUS_OFFSET
}

/// Offset of the enable register of MSI set `set`.
pub const fn msi_set_enable(set: u32) -> usize {
    msi_set_offset(set) + MSI_SET_ENABLE_OFFSET
}

/// Offset of the capture address high word of MSI set `set`.
pub const fn msi_set_addr_hi(set: u32) -> usize {
    MSI_SET_ADDR_HI_BASE + set as usize * MSI_SET_ADDR_HI_STRIDE
}

/// Offset of translation table entry `slot`.
pub const fn atr_entry(slot: u32) -> usize {
    ATR_BASE + slot as usize * ATR_STRIDE
}

/// Advertised capabilities strapped by the silicon.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct BaseCfg {
    #[bits(8)]
    _reserved: u32,
    /// Bit `n` set means generation `n + 1` is supported.
    #[bits(8)]
    pub speed_bitmap: u8,
    #[bits(16)]
    _reserved2: u32,
}

/// Controller mode and link capability overrides.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Setting {
    pub rc_mode: bool,
    #[bits(7)]
    _reserved: u32,
    #[bits(4)]
    pub link_width: u8,
    /// Mask of generations above Gen1 the controller may train to.
    #[bits(3)]
    pub gen_support: u8,
    #[bits(17)]
    _reserved2: u32,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PciIds1 {
    pub revision_id: u8,
    #[bits(24)]
    pub class_code: u32,
}

/// Software reset lines. A set bit holds the block in reset.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct ResetControl {
    pub mac: bool,
    pub phy: bool,
    pub bridge: bool,
    pub port_enable: bool,
    #[bits(28)]
    _reserved: u32,
}

impl ResetControl {
    /// All four reset lines asserted.
    pub const fn all() -> Self {
        Self::new()
            .with_mac(true)
            .with_phy(true)
            .with_bridge(true)
            .with_port_enable(true)
    }
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct LtssmStatus {
    #[bits(24)]
    _reserved: u32,
    #[bits(5)]
    pub state: u8,
    #[bits(3)]
    _reserved2: u32,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct LinkStatus {
    #[bits(8)]
    _reserved: u32,
    pub link_up: bool,
    #[bits(3)]
    _reserved2: u32,
    /// Latched when the data link layer left DL_Active. Write one to clear.
    pub dl_down_event: bool,
    #[bits(19)]
    _reserved3: u32,
}

/// Layout shared by [`INT_ENABLE`] and [`INT_STATUS`].
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct IntRegister {
    #[bits(8)]
    _reserved: u32,
    /// One bit per MSI set.
    pub msi_sets: u8,
    #[bits(8)]
    _reserved2: u32,
    /// One bit per INTx line, INTA at the lowest bit.
    #[bits(4)]
    pub intx: u8,
    _reserved3: bool,
    /// AER uncorrectable/correctable error message received.
    pub aer_event: bool,
    #[bits(2)]
    _reserved4: u32,
}

/// Bit position of INTx line 0 in [`IntRegister`].
pub const INTX_SHIFT: u32 = 24;
/// Bit position of MSI set 0 in [`IntRegister`].
pub const MSI_SHIFT: u32 = 8;

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IcmdPm {
    #[bits(4)]
    _reserved: u32,
    pub turn_off_link: bool,
    #[bits(27)]
    _reserved2: u32,
}

/// Reference clock request control.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ClkreqControl {
    /// Let the hardware gate the reference clock through CLKREQ#.
    pub hw_mode: bool,
    #[bits(31)]
    _reserved: u32,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SleepProtect {
    pub ready: bool,
    #[bits(31)]
    _reserved: u32,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MiscCtrl {
    _reserved: bool,
    pub disable_dvfsrc_voltage_request: bool,
    #[bits(6)]
    _reserved2: u32,
    pub block_slave_transit: bool,
    pub block_master_transit: bool,
    #[bits(22)]
    _reserved3: u32,
}

/// Low word of the translation source address. The low 12 bits of the
/// address are replaced by the size and enable fields.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct AtrSrcAddrLsb {
    pub enable: bool,
    /// log2(window size) - 1.
    #[bits(6)]
    pub size: u8,
    #[bits(5)]
    _reserved: u32,
    #[bits(20)]
    pub addr_4k: u32,
}

/// Translation target encoding for the memory window type.
pub const ATR_TYPE_MEM: u8 = 0;
/// Translation target encoding for the I/O window type.
pub const ATR_TYPE_IO: u8 = 1;
/// TLP type for memory requests.
pub const ATR_TLP_TYPE_MEM: u8 = 0;
/// TLP type for I/O requests.
pub const ATR_TLP_TYPE_IO: u8 = 2;

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct AtrParams {
    #[bits(4)]
    pub target: u8,
    #[bits(12)]
    _reserved: u32,
    #[bits(3)]
    pub tlp_type: u8,
    #[bits(13)]
    _reserved2: u32,
}

/// Link Control (low half) and Link Status (high half).
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct LinkControlStatus {
    pub control: u16,
    #[bits(4)]
    pub current_speed: u8,
    #[bits(6)]
    pub negotiated_width: u8,
    #[bits(6)]
    _reserved: u32,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct LinkControl2 {
    #[bits(4)]
    pub target_speed: u8,
    #[bits(28)]
    _reserved: u32,
}

/// AER status bits consumed by the error path.
pub mod aer {
    /// Uncorrectable: completion timeout.
    pub const UNCOR_COMPLETION_TIMEOUT: u32 = 1 << 14;
    /// Uncorrectable: malformed TLP.
    pub const UNCOR_MALFORMED_TLP: u32 = 1 << 18;
    /// Correctable: receiver error.
    pub const COR_RECEIVER_ERROR: u32 = 1 << 0;
    /// Correctable: replay timer timeout.
    pub const COR_REPLAY_TIMER_TIMEOUT: u32 = 1 << 12;
}

/// LTSSM state encodings reported in [`LtssmStatus::state`].
pub mod ltssm {
    pub const DETECT_QUIET: u8 = 0x00;
    pub const L0: u8 = 0x10;
    pub const L2_IDLE: u8 = 0x14;

    const NAMES: [&str; 27] = [
        "detect.quiet",
        "detect.active",
        "polling.active",
        "polling.compliance",
        "polling.configuration",
        "config.linkwidthstart",
        "config.linkwidthaccept",
        "config.lanenumwait",
        "config.lanenumaccept",
        "config.complete",
        "config.idle",
        "recovery.receiverlock",
        "recovery.equalization",
        "recovery.speed",
        "recovery.receiverconfig",
        "recovery.idle",
        "L0",
        "L0s",
        "L1.entry",
        "L1.idle",
        "L2.idle",
        "L2.transmitwake",
        "disable",
        "loopback.entry",
        "loopback.active",
        "loopback.exit",
        "hotreset",
    ];

    /// Human-readable name of an LTSSM state encoding.
    pub fn name(state: u8) -> &'static str {
        NAMES.get(state as usize).copied().unwrap_or("unknown")
    }

}
