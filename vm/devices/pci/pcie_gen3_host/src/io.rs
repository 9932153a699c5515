// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Controller register access.

// UNSAFETY: Volatile access to the mapped controller register window.
#![expect(unsafe_code)]

use std::ptr::NonNull;

/// Access to a controller's 32-bit register window.
///
/// Offsets are in bytes from the start of the window and must be 4-byte
/// aligned.
pub trait RegisterIo: Send + Sync {
    /// Returns the length of the register window in bytes.
    fn len(&self) -> usize;
    /// Reads a 32-bit register.
    fn read_u32(&self, offset: usize) -> u32;
    /// Writes a 32-bit register.
    fn write_u32(&self, offset: usize, data: u32);
}

/// Read-modify-write helpers over [`RegisterIo`].
///
/// These are plain sequences of a read and a write. Callers that race with
/// other writers of the same register must hold the lock covering it.
pub trait RegisterIoExt: RegisterIo {
    /// Replaces the register value with `f(old)`, returning the new value.
    fn modify(&self, offset: usize, f: impl FnOnce(u32) -> u32) -> u32 {
        let value = f(self.read_u32(offset));
        self.write_u32(offset, value);
        value
    }

    /// Sets `mask` in the register.
    fn set_bits(&self, offset: usize, mask: u32) -> u32 {
        self.modify(offset, |v| v | mask)
    }

    /// Clears `mask` in the register.
    fn clear_bits(&self, offset: usize, mask: u32) -> u32 {
        self.modify(offset, |v| v & !mask)
    }
}

impl<T: RegisterIo + ?Sized> RegisterIoExt for T {}

/// A register window mapped into the address space.
pub struct MappedRegisters {
    base: NonNull<u32>,
    len: usize,
}

// SAFETY: device registers may be accessed from any thread; all accesses are
// single volatile loads and stores.
unsafe impl Send for MappedRegisters {}
// SAFETY: see above.
unsafe impl Sync for MappedRegisters {}

impl MappedRegisters {
    /// Wraps an existing mapping of the controller registers.
    ///
    /// # Safety
    /// `base` must be 4-byte aligned and valid for volatile reads and writes
    /// of `len` bytes for the lifetime of the returned object, and no other
    /// owner may access the same mapping.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self {
            base: base.cast(),
            len,
        }
    }

    fn check(&self, offset: usize) {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.len,
            "register offset {offset:#x} out of range"
        );
    }
}

impl RegisterIo for MappedRegisters {
    fn len(&self) -> usize {
        self.len
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.check(offset);
        // SAFETY: the offset is aligned and in bounds, and the mapping is
        // valid per the contract of `new`.
        unsafe { self.base.byte_add(offset).read_volatile() }
    }

    fn write_u32(&self, offset: usize, data: u32) {
        self.check(offset);
        // SAFETY: the offset is aligned and in bounds, and the mapping is
        // valid per the contract of `new`.
        unsafe { self.base.byte_add(offset).write_volatile(data) }
    }
}
