//! Descriptor-table registers.
//!
//! The hypervisor never builds descriptor tables of its own; it snapshots the
//! tables of the operating system it is about to virtualize and replays them.

use core::arch::asm;

/// X86_64's system table register (GDTR/IDTR image): a 16-bit limit followed
/// by the 64-bit linear base.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SystemTableRegister {
    pub limit: u16,
    pub base: u64,
}

impl SystemTableRegister {
    /// Snapshot the global-descriptor-table register.
    #[inline]
    pub fn sgdt() -> Self {
        let mut this = SystemTableRegister { limit: 0, base: 0 };
        unsafe {
            asm!("sgdt [{}]", in(reg) &mut this, options(nostack));
        }
        this
    }

    /// Snapshot the interrupt-descriptor-table register.
    #[inline]
    pub fn sidt() -> Self {
        let mut this = SystemTableRegister { limit: 0, base: 0 };
        unsafe {
            asm!("sidt [{}]", in(reg) &mut this, options(nostack));
        }
        this
    }

    /// Load this image into the global-descriptor-table register.
    ///
    /// # Safety
    /// The named table must stay mapped for as long as the CPU may walk it.
    #[inline]
    pub unsafe fn lgdt(&self) {
        asm!("lgdt [{}]", in(reg) self, options(nostack));
    }

    /// Load this image into the interrupt-descriptor-table register.
    ///
    /// # Safety
    /// Same contract as [`SystemTableRegister::lgdt`].
    #[inline]
    pub unsafe fn lidt(&self) {
        asm!("lidt [{}]", in(reg) self, options(nostack));
    }
}

const _: () = assert!(core::mem::size_of::<SystemTableRegister>() == 10);
