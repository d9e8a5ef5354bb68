//! Execution-state capture and replay.
//!
//! A hyperjacking launch needs to photograph the running processor, hand the
//! photograph to hardware as the guest state, and later reproduce it
//! bit-exactly. [`MachineFrame`] is that photograph. [`capture_frame`]
//! records the point immediately after its own call site as the resume RIP,
//! so a later [`restore_frame`] (or a VM entry whose guest RIP/RSP/RFLAGS
//! were taken from the frame) continues as if the capture call had just
//! returned.

use super::intrinsics::{read_cr3, read_dr7, read_ldtr, read_tr};
use super::msr::{Msr, IA32_DEBUGCTL, IA32_FS_BASE, IA32_GS_BASE};
use super::table::SystemTableRegister;
use super::{Cr0, Cr4};
use core::arch::naked_asm;

/// General purpose registers, in the layout the frame asm uses.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GeneralPurposeRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// A resumable snapshot of one processor's execution state.
///
/// Field offsets are load-bearing: the capture/restore thunks and the VM-exit
/// trampoline address this structure by constant displacement.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct MachineFrame {
    pub gprs: GeneralPurposeRegisters, // 0x00
    pub rflags: u64,                   // 0x78
    pub rip: u64,                      // 0x80
    pub rsp: u64,                      // 0x88
    pub cs: u16,                       // 0x90
    pub ss: u16,                       // 0x92
    pub ds: u16,                       // 0x94
    pub es: u16,                       // 0x96
    pub fs: u16,                       // 0x98
    pub gs: u16,                       // 0x9a
    _pad: u32,
}

const _: () = assert!(core::mem::size_of::<GeneralPurposeRegisters>() == 0x78);
const _: () = assert!(core::mem::size_of::<MachineFrame>() == 0xa0);

impl MachineFrame {
    pub fn zeroed() -> Self {
        // SAFETY: every field is an integer; the all-zero pattern is valid.
        unsafe { core::mem::zeroed() }
    }
}

/// Record the current execution state into `frame`.
///
/// The recorded RSP/RIP describe the state as of the instruction following
/// the call. The scratch register holding the frame pointer (RDI) is
/// recorded as the frame address itself, which is exactly its value at the
/// call site.
///
/// # Safety
/// `frame` must be valid for writes and outlive every later replay of it.
#[unsafe(naked)]
pub unsafe extern "C" fn capture_frame(frame: *mut MachineFrame) {
    naked_asm!(
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r11",
        "mov [rdi + 0x28], r10",
        "mov [rdi + 0x30], r9",
        "mov [rdi + 0x38], r8",
        "mov [rdi + 0x40], rsi",
        "mov [rdi + 0x48], rdi",
        "mov [rdi + 0x50], rbp",
        "mov [rdi + 0x58], rdx",
        "mov [rdi + 0x60], rcx",
        "mov [rdi + 0x68], rbx",
        "mov [rdi + 0x70], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x78], rax",
        // The return address is the resume point; the caller's stack pointer
        // is what it will be once this call returns.
        "mov rax, [rsp]",
        "mov [rdi + 0x80], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x88], rax",
        "mov word ptr [rdi + 0x90], cs",
        "mov word ptr [rdi + 0x92], ss",
        "mov word ptr [rdi + 0x94], ds",
        "mov word ptr [rdi + 0x96], es",
        "mov word ptr [rdi + 0x98], fs",
        "mov word ptr [rdi + 0x9a], gs",
        "ret",
    )
}

/// Resume execution at the state recorded in `frame`.
///
/// DS and ES are reloaded from the frame; CS, SS, RSP, RIP and RFLAGS are
/// installed atomically by an IRETQ. FS and GS selectors are left alone so
/// their base MSRs survive; callers that need them exact rewrite them
/// afterwards.
///
/// # Safety
/// The frame must describe a state that is legal to return to from the
/// current privilege level.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_frame(frame: *const MachineFrame) -> ! {
    naked_asm!(
        "mov es, word ptr [rdi + 0x96]",
        "mov ds, word ptr [rdi + 0x94]",
        // Interrupt-return frame: SS, RSP, RFLAGS, CS, RIP.
        "movzx rax, word ptr [rdi + 0x92]",
        "push rax",
        "push qword ptr [rdi + 0x88]",
        "push qword ptr [rdi + 0x78]",
        "movzx rax, word ptr [rdi + 0x90]",
        "push rax",
        "push qword ptr [rdi + 0x80]",
        "mov r15, [rdi + 0x00]",
        "mov r14, [rdi + 0x08]",
        "mov r13, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r11, [rdi + 0x20]",
        "mov r10, [rdi + 0x28]",
        "mov r9,  [rdi + 0x30]",
        "mov r8,  [rdi + 0x38]",
        "mov rsi, [rdi + 0x40]",
        "mov rbp, [rdi + 0x50]",
        "mov rdx, [rdi + 0x58]",
        "mov rcx, [rdi + 0x60]",
        "mov rbx, [rdi + 0x68]",
        "mov rax, [rdi + 0x70]",
        "mov rdi, [rdi + 0x48]",
        "iretq",
    )
}

/// The processor state that does not travel in a [`MachineFrame`] but that
/// the VMCS needs anyway.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SpecialRegisters {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    pub debug_control: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub gdtr_limit: u16,
    pub idtr_limit: u16,
    pub ldtr: u16,
    pub tr: u16,
}

impl SpecialRegisters {
    pub fn zeroed() -> Self {
        // SAFETY: every field is an integer; the all-zero pattern is valid.
        unsafe { core::mem::zeroed() }
    }

    /// Snapshot the current processor's control, debug and table state.
    pub fn capture() -> Self {
        let gdtr = SystemTableRegister::sgdt();
        let idtr = SystemTableRegister::sidt();
        Self {
            cr0: Cr0::current().bits(),
            cr3: read_cr3(),
            cr4: Cr4::current().bits(),
            dr7: read_dr7(),
            debug_control: Msr::<IA32_DEBUGCTL>::read(),
            fs_base: Msr::<IA32_FS_BASE>::read(),
            gs_base: Msr::<IA32_GS_BASE>::read(),
            gdtr_base: gdtr.base,
            idtr_base: idtr.base,
            gdtr_limit: gdtr.limit,
            idtr_limit: idtr.limit,
            ldtr: read_ldtr(),
            tr: read_tr(),
        }
    }
}
