//! VM-exit funnel.
//!
//! Hardware jumps to [`vmexit_entry`] with RSP loaded from HOST_RSP, which
//! points at the register frame carved into the top of the per-processor
//! stack. The thunk dumps the guest's general registers into that frame,
//! fetches the `VpData` pointer parked just above it, and hands both to the
//! Rust dispatcher. When the dispatcher returns, the (possibly rewritten)
//! registers are reloaded and the guest continues via VMRESUME; the one
//! request that never returns is the distinguished teardown CPUID.

use crate::ept::{EptViolationQualification, Gpa};
use crate::state;
use crate::vmcs::{self, ActiveVmcs, Field};
use crate::vp::VpData;
use bedrock::x86_64::context::{restore_frame, MachineFrame};
use bedrock::x86_64::intrinsics::{wbinvd, write_cr3, xsetbv};
use bedrock::x86_64::table::SystemTableRegister;
use bedrock::x86_64::Rflags;
use core::arch::naked_asm;
use core::arch::x86_64::__cpuid_count;
use num_enum::TryFromPrimitive;

/// EAX value of the CPUID that asks the hypervisor to dismantle itself.
pub const TEARDOWN_LEAF: u32 = 0x4141_4141;
/// ECX value that must accompany [`TEARDOWN_LEAF`].
pub const TEARDOWN_MAGIC: u32 = 0x4242_4242;

/// Basic exit reasons (Appendix C, Table C-1) this build can meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum BasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InterruptWindow = 7,
    Cpuid = 10,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdtsc = 16,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    MovCr = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    Invvpid = 53,
    Wbinvd = 54,
    Xsetbv = 55,
}

/// The trampoline installed as HOST_RIP.
///
/// Layout contract with [`crate::vp::HostStackLayout`]: RSP points at a
/// [`MachineFrame`] whose general registers this thunk owns, and the quad
/// at RSP + size_of::<MachineFrame>() is the owning `VpData`.
#[unsafe(naked)]
pub unsafe extern "C" fn vmexit_entry() {
    naked_asm!(
        "mov [rsp + 0x00], r15",
        "mov [rsp + 0x08], r14",
        "mov [rsp + 0x10], r13",
        "mov [rsp + 0x18], r12",
        "mov [rsp + 0x20], r11",
        "mov [rsp + 0x28], r10",
        "mov [rsp + 0x30], r9",
        "mov [rsp + 0x38], r8",
        "mov [rsp + 0x40], rsi",
        "mov [rsp + 0x48], rdi",
        "mov [rsp + 0x50], rbp",
        "mov [rsp + 0x58], rdx",
        "mov [rsp + 0x60], rcx",
        "mov [rsp + 0x68], rbx",
        "mov [rsp + 0x70], rax",
        "mov rdi, [rsp + 0xa0]",
        "mov rsi, rsp",
        "call {handler}",
        "mov r15, [rsp + 0x00]",
        "mov r14, [rsp + 0x08]",
        "mov r13, [rsp + 0x10]",
        "mov r12, [rsp + 0x18]",
        "mov r11, [rsp + 0x20]",
        "mov r10, [rsp + 0x28]",
        "mov r9,  [rsp + 0x30]",
        "mov r8,  [rsp + 0x38]",
        "mov rsi, [rsp + 0x40]",
        "mov rdi, [rsp + 0x48]",
        "mov rbp, [rsp + 0x50]",
        "mov rdx, [rsp + 0x58]",
        "mov rcx, [rsp + 0x60]",
        "mov rbx, [rsp + 0x68]",
        "mov rax, [rsp + 0x70]",
        "vmresume",
        "call {failed}",
        handler = sym handle_exit,
        failed = sym resume_failed,
    )
}

/// Dispatch one VM exit. Returning resumes the guest with the registers in
/// `frame`.
unsafe extern "C" fn handle_exit(vp: *mut VpData, frame: *mut MachineFrame) {
    let vmcs = ActiveVmcs::current();
    let reason = vmcs
        .read(Field::ExitReason)
        .expect("exit reason must be readable") as u16;

    match BasicExitReason::try_from(reason) {
        Ok(BasicExitReason::Cpuid) => handle_cpuid(vp, frame, &vmcs),
        Ok(BasicExitReason::Invd) => {
            // The guest asked to drop the caches; doing that for real would
            // lose the hypervisor's own dirty lines. Write back instead.
            wbinvd();
            vmcs.advance_guest_rip().expect("rip update failed");
        }
        Ok(BasicExitReason::Xsetbv) => {
            let gprs = &(*frame).gprs;
            xsetbv(
                gprs.rcx as u32,
                (gprs.rdx & 0xffff_ffff) << 32 | gprs.rax & 0xffff_ffff,
            );
            vmcs.advance_guest_rip().expect("rip update failed");
        }
        Ok(BasicExitReason::EptViolation) => {
            let gpa = vmcs
                .read(Field::GuestPhysicalAddress)
                .expect("faulting address must be readable");
            let qualification = EptViolationQualification::from_bits_truncate(
                vmcs.read(Field::ExitQualification)
                    .expect("qualification must be readable"),
            );
            let hv = state::global();
            hv.ept
                .lock()
                .handle_violation(
                    &hv.host,
                    Gpa::new(gpa as usize).expect("hardware reported a bad address"),
                    qualification,
                )
                .expect("unserviceable EPT violation");
        }
        Ok(
            BasicExitReason::Vmcall
            | BasicExitReason::Vmclear
            | BasicExitReason::Vmlaunch
            | BasicExitReason::Vmptrld
            | BasicExitReason::Vmptrst
            | BasicExitReason::Vmread
            | BasicExitReason::Vmresume
            | BasicExitReason::Vmwrite
            | BasicExitReason::Vmxoff
            | BasicExitReason::Vmxon
            | BasicExitReason::Invept
            | BasicExitReason::Invvpid,
        ) => {
            // No nested virtualization: answer every VMX instruction with
            // VMfailInvalid (CF set, ZF clear).
            let rflags = vmcs
                .read(Field::GuestRflags)
                .expect("rflags must be readable");
            vmcs.write(
                Field::GuestRflags,
                (rflags | Rflags::CF.bits()) & !Rflags::ZF.bits(),
            )
            .expect("rflags update failed");
            vmcs.advance_guest_rip().expect("rip update failed");
        }
        _ => {
            let rip = vmcs.read(Field::GuestRip).unwrap_or(0);
            panic!("unhandled VM exit: reason {reason} at guest rip {rip:#x}");
        }
    }
}

/// CPUID exits: either the teardown request or plain emulation by running
/// the instruction on behalf of the guest.
unsafe fn handle_cpuid(vp: *mut VpData, frame: *mut MachineFrame, vmcs: &ActiveVmcs) {
    let gprs = &mut (*frame).gprs;
    let (leaf, subleaf) = (gprs.rax as u32, gprs.rcx as u32);
    if leaf == TEARDOWN_LEAF && subleaf == TEARDOWN_MAGIC {
        teardown(vp, frame, vmcs);
    }

    let result = __cpuid_count(leaf, subleaf);
    gprs.rax = result.eax as u64;
    gprs.rbx = result.ebx as u64;
    gprs.rcx = result.ecx as u64;
    gprs.rdx = result.edx as u64;
    if leaf == 1 {
        // Own up to being a hypervisor.
        gprs.rcx |= 1 << 31;
    }
    vmcs.advance_guest_rip().expect("rip update failed");
}

/// Answer the teardown CPUID: unload VMX on this processor and continue the
/// guest natively at the next instruction, on its own stack.
unsafe fn teardown(vp: *mut VpData, frame: *mut MachineFrame, vmcs: &ActiveVmcs) -> ! {
    let resume_rip = vmcs.read(Field::GuestRip).expect("rip must be readable")
        + vmcs
            .read(Field::VmExitInstructionLength)
            .expect("length must be readable");
    let resume_rsp = vmcs.read(Field::GuestRsp).expect("rsp must be readable");
    let resume_rflags = vmcs
        .read(Field::GuestRflags)
        .expect("rflags must be readable");
    let guest_cr3 = vmcs.read(Field::GuestCr3).expect("cr3 must be readable");

    let f = &mut *frame;
    f.rip = resume_rip;
    f.rsp = resume_rsp;
    f.rflags = resume_rflags;
    // The interrupted context is the same kernel thread that launched;
    // its selectors are the ones photographed then.
    f.cs = (*vp).frame.cs;
    f.ss = (*vp).frame.ss;
    f.ds = (*vp).frame.ds;
    f.es = (*vp).frame.es;
    f.fs = (*vp).frame.fs;
    f.gs = (*vp).frame.gs;

    // The exit loaded 0xffff descriptor-table limits; put the guest's
    // tables back before leaving VMX operation.
    let special = &(*vp).special;
    SystemTableRegister {
        limit: special.gdtr_limit,
        base: special.gdtr_base,
    }
    .lgdt();
    SystemTableRegister {
        limit: special.idtr_limit,
        base: special.idtr_base,
    }
    .lidt();
    write_cr3(guest_cr3);

    vmcs::vmxoff();
    restore_frame(frame)
}

/// VMRESUME fell through: the VMCS went bad while the guest was running.
/// There is no one to return to.
unsafe extern "C" fn resume_failed() -> ! {
    panic!("VMRESUME failed: {:?}", vmcs::instruction_error());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reasons_decode_from_hardware_numbers() {
        assert_eq!(BasicExitReason::try_from(10).unwrap(), BasicExitReason::Cpuid);
        assert_eq!(
            BasicExitReason::try_from(48).unwrap(),
            BasicExitReason::EptViolation
        );
        assert!(BasicExitReason::try_from(0x3fu16).is_err());
    }

    #[test]
    fn teardown_signal_is_the_documented_pair() {
        assert_eq!(TEARDOWN_LEAF, 0x4141_4141);
        assert_eq!(TEARDOWN_MAGIC, 0x4242_4242);
    }
}
