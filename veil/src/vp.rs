//! Per-processor virtualization lifecycle.
//!
//! Bring-up on each logical processor is one function that control passes
//! through three times. The first pass photographs the live register file,
//! enters VMX root operation, fills in the VMCS (guest state = photograph,
//! host state = the exit funnel) and executes VMLAUNCH. Because the guest
//! RIP/RSP/RFLAGS came from the photograph, a successful VMLAUNCH "returns"
//! to the instruction after the capture — the second pass, now in guest
//! mode, which replays the full photograph so no register differs from the
//! original. The replay lands at the same spot a third time, at which point
//! the processor is virtualized and the function finally returns to its
//! caller inside the guest.
//!
//! The passes are told apart by a volatile per-processor flag: 0 before the
//! launch, 1 once the VMCS is committed, 2 after the replay.

use crate::exit;
use crate::host::{Host, KernelHost};
use crate::vmcs::{self, ActiveVmcs, Field, VmxRegion};
use crate::vmx::{
    self, adjust_controls, apply_fixed_bits, PinBasedControls, PrimaryProcControls,
    SecondaryProcControls, VmEntryControls, VmExitControls, VmxCapabilities,
};
use crate::HvError;
use bedrock::addressing::{Pa, Va, PAGE_SIZE};
use bedrock::x86_64::context::{
    capture_frame, restore_frame, MachineFrame, SpecialRegisters,
};
use bedrock::x86_64::msr::{wrmsr, IA32_FS_BASE, IA32_GS_BASE};
use bedrock::x86_64::segmentation::{decode_descriptor, SegmentRegister, SegmentSelector};
use bedrock::x86_64::{Cr0, Cr4};
use core::arch::x86_64::__cpuid_count;
use core::ptr;

/// Bytes of dedicated stack each processor's exit handling runs on.
pub const HOST_STACK_SIZE: usize = 24 * 1024;

const PROGRESS_PRE_LAUNCH: u32 = 0;
const PROGRESS_LAUNCHED: u32 = 1;
const PROGRESS_RESUMED: u32 = 2;

/// The exit-handling stack. HOST_RSP points at `exit_frame`, so the
/// trampoline finds the register save area at positive offsets from RSP and
/// its `VpData` pointer immediately above it.
#[repr(C, align(16))]
pub(crate) struct HostStackLayout {
    stack: [u8; HOST_STACK_SIZE - core::mem::size_of::<MachineFrame>() - 16],
    pub(crate) exit_frame: MachineFrame,
    pub(crate) vp: *mut VpData,
    _pad: u64,
}

const _: () = assert!(core::mem::size_of::<HostStackLayout>() == HOST_STACK_SIZE);

/// Everything one logical processor needs to live in VMX root mode.
///
/// Instances sit in one contiguous, zeroed allocation (see
/// [`crate::state`]); nothing here is constructed, only wired up.
#[repr(C, align(4096))]
pub struct VpData {
    pub(crate) stack: HostStackLayout,
    vmxon_region: VmxRegion,
    vmcs_region: VmxRegion,
    /// Register file photographed at the top of [`launch`].
    pub(crate) frame: MachineFrame,
    /// Control/debug/table state photographed alongside it.
    pub(crate) special: SpecialRegisters,
    capabilities: VmxCapabilities,
    vmxon_pa: Pa,
    vmcs_pa: Pa,
    launch_progress: u32,
    /// CR3 of the system address space, valid regardless of which user
    /// process was interrupted. Becomes HOST_CR3.
    pub(crate) system_cr3: u64,
}

impl VpData {
    /// Point the stack-top back-pointer at this instance. Must be called
    /// once after the backing memory is placed, before any launch.
    pub(crate) fn wire_stack(&mut self) {
        self.stack.vp = self;
    }

    fn progress(vp: *const VpData) -> u32 {
        // Volatile: the flag is read on both sides of a hardware control
        // transfer the compiler cannot see.
        unsafe { ptr::read_volatile(ptr::addr_of!((*vp).launch_progress)) }
    }

    fn set_progress(vp: *mut VpData, v: u32) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*vp).launch_progress), v) }
    }
}

/// Move the current processor under the hypervisor.
///
/// Returns `Ok(())` on the third pass, executing as the guest with a
/// register file identical to the capture. On any failure the processor is
/// left outside VMX operation.
///
/// # Safety
/// `vp` must be this processor's zeroed-and-wired [`VpData`]; the caller
/// must be pinned to the processor at an elevated priority.
pub(crate) unsafe fn launch(vp: *mut VpData, eptp: u64, msr_bitmap: Pa) -> Result<(), HvError> {
    (*vp).special = SpecialRegisters::capture();
    capture_frame(ptr::addr_of_mut!((*vp).frame));
    // Everything below runs again each time the photograph is replayed:
    // once by VMLAUNCH, once by restore_frame.
    match VpData::progress(vp) {
        PROGRESS_PRE_LAUNCH => {
            (*vp).capabilities = VmxCapabilities::read(&KernelHost);
            let vmcs = enter_root(vp)?;
            if let Err(err) = populate(&vmcs, &*vp, eptp, msr_bitmap) {
                vmcs::vmxoff();
                return Err(err);
            }
            VpData::set_progress(vp, PROGRESS_LAUNCHED);
            let error = vmcs::vmlaunch();
            // Only reached when the launch itself failed.
            VpData::set_progress(vp, PROGRESS_PRE_LAUNCH);
            vmcs::vmxoff();
            Err(HvError::VmxFail(error))
        }
        PROGRESS_LAUNCHED => {
            // VMLAUNCH dropped us here as the guest, with whatever registers
            // the launch path last held. One replay makes the file match the
            // capture bit for bit.
            VpData::set_progress(vp, PROGRESS_RESUMED);
            restore_frame(ptr::addr_of!((*vp).frame))
        }
        PROGRESS_RESUMED => Ok(()),
        _ => unreachable!("corrupted launch progress"),
    }
}

/// Dismantle the hypervisor on the current processor.
///
/// Issues the distinguished CPUID; the exit handler executes VMXOFF and
/// restores execution to the instruction after it on the original stack. On
/// a processor that never virtualized the CPUID simply executes natively.
///
/// # Safety
/// Same pinning contract as [`launch`].
pub(crate) unsafe fn devirtualize(vp: *mut VpData) {
    __cpuid_count(exit::TEARDOWN_LEAF, exit::TEARDOWN_MAGIC);
    // The restore came back through an IRETQ, which left the data-segment
    // RPL bits behind. A compatibility-mode thread faults on its next
    // transition unless DS/ES and the 32-bit TEB segment FS are rewritten;
    // reloading FS clears its base, so both base MSRs are put back too.
    let frame = &(*vp).frame;
    SegmentRegister::Ds.load(SegmentSelector::from_raw(frame.ds));
    SegmentRegister::Es.load(SegmentSelector::from_raw(frame.es));
    SegmentRegister::Fs.load(SegmentSelector::from_raw(frame.fs));
    wrmsr(IA32_FS_BASE, (*vp).special.fs_base);
    wrmsr(IA32_GS_BASE, (*vp).special.gs_base);
    VpData::set_progress(vp, PROGRESS_PRE_LAUNCH);
}

/// Enter VMX root operation: validate IA32_VMX_BASIC, stamp both regions,
/// narrow CR0/CR4 to the fixed bits, VMXON, then VMCLEAR + VMPTRLD the
/// VMCS. Failure leaves the processor outside VMX operation.
unsafe fn enter_root(vp: *mut VpData) -> Result<ActiveVmcs, HvError> {
    let caps = (*vp).capabilities;
    if caps.region_size() > PAGE_SIZE
        || caps.region_memory_type() != vmx::VMX_MEMORY_TYPE_WRITEBACK
        || !caps.has_true_controls()
    {
        return Err(HvError::Unsupported);
    }

    let revision = caps.revision_id();
    (*vp).vmxon_region.set_revision_id(revision);
    (*vp).vmcs_region.set_revision_id(revision);

    let host = KernelHost;
    (*vp).vmxon_pa = host.va_to_pa(
        Va::new(ptr::addr_of!((*vp).vmxon_region) as usize).expect("vp data not in kernel space"),
    );
    (*vp).vmcs_pa = host.va_to_pa(
        Va::new(ptr::addr_of!((*vp).vmcs_region) as usize).expect("vp data not in kernel space"),
    );

    // Narrowing CR4 also sets CR4.VMXE, the gate VMXON checks.
    Cr0::from_bits_unchecked(apply_fixed_bits(
        Cr0::current().bits(),
        caps.msr(vmx::IA32_VMX_CR0_FIXED0),
        caps.msr(vmx::IA32_VMX_CR0_FIXED1),
    ))
    .apply();
    Cr4::from_bits_unchecked(apply_fixed_bits(
        Cr4::current().bits(),
        caps.msr(vmx::IA32_VMX_CR4_FIXED0),
        caps.msr(vmx::IA32_VMX_CR4_FIXED1),
    ))
    .apply();

    vmcs::vmxon((*vp).vmxon_pa)?;
    if let Err(err) = vmcs::vmclear((*vp).vmcs_pa) {
        vmcs::vmxoff();
        return Err(err);
    }
    match vmcs::vmptrld((*vp).vmcs_pa) {
        Ok(vmcs) => Ok(vmcs),
        Err(err) => {
            vmcs::vmxoff();
            Err(err)
        }
    }
}

/// Fill the current VMCS so that the guest is this processor's captured
/// state and the host is the exit funnel.
unsafe fn populate(
    vmcs: &ActiveVmcs,
    vp: &VpData,
    eptp: u64,
    msr_bitmap: Pa,
) -> Result<(), HvError> {
    let caps = &vp.capabilities;
    let frame = &vp.frame;
    let special = &vp.special;

    // A 4 KiB VMCS requires an all-ones link pointer.
    vmcs.write(Field::VmcsLinkPointer, u64::MAX)?;
    // All-zero bitmap: no MSR access exits.
    vmcs.write(Field::MsrBitmap, msr_bitmap.into_usize() as u64)?;
    // Any nonzero VPID tags this guest's cached linear translations.
    vmcs.write(Field::Vpid, 1)?;
    vmcs.write(Field::EptPointer, eptp)?;

    // Controls, each laundered through its capability MSR.
    vmcs.write(
        Field::PinBasedControls,
        adjust_controls(
            PinBasedControls::empty().bits(),
            caps.msr(vmx::IA32_VMX_TRUE_PINBASED_CTLS),
        ) as u64,
    )?;
    vmcs.write(
        Field::PrimaryProcControls,
        adjust_controls(
            (PrimaryProcControls::USE_MSR_BITMAPS
                | PrimaryProcControls::ACTIVATE_SECONDARY_CONTROLS)
                .bits(),
            caps.msr(vmx::IA32_VMX_TRUE_PROCBASED_CTLS),
        ) as u64,
    )?;
    vmcs.write(
        Field::SecondaryProcControls,
        adjust_controls(
            (SecondaryProcControls::ENABLE_EPT
                | SecondaryProcControls::ENABLE_RDTSCP
                | SecondaryProcControls::ENABLE_VPID
                | SecondaryProcControls::ENABLE_XSAVES_XRSTORS)
                .bits(),
            caps.msr(vmx::IA32_VMX_PROCBASED_CTLS2),
        ) as u64,
    )?;
    vmcs.write(
        Field::VmExitControls,
        adjust_controls(
            (VmExitControls::HOST_ADDRESS_SPACE_SIZE
                | VmExitControls::ACKNOWLEDGE_INTERRUPT_ON_EXIT)
                .bits(),
            caps.msr(vmx::IA32_VMX_TRUE_EXIT_CTLS),
        ) as u64,
    )?;
    vmcs.write(
        Field::VmEntryControls,
        adjust_controls(
            VmEntryControls::IA32E_MODE_GUEST.bits(),
            caps.msr(vmx::IA32_VMX_TRUE_ENTRY_CTLS),
        ) as u64,
    )?;

    // Segments: the guest gets each register decoded out of the captured
    // GDT; the host keeps the same selectors with RPL cleared.
    let gdt = special.gdtr_base;
    let slots = [
        (
            frame.cs,
            Field::GuestCsSelector,
            Field::GuestCsLimit,
            Field::GuestCsAccessRights,
            Field::GuestCsBase,
            Some(Field::HostCsSelector),
        ),
        (
            frame.ss,
            Field::GuestSsSelector,
            Field::GuestSsLimit,
            Field::GuestSsAccessRights,
            Field::GuestSsBase,
            Some(Field::HostSsSelector),
        ),
        (
            frame.ds,
            Field::GuestDsSelector,
            Field::GuestDsLimit,
            Field::GuestDsAccessRights,
            Field::GuestDsBase,
            Some(Field::HostDsSelector),
        ),
        (
            frame.es,
            Field::GuestEsSelector,
            Field::GuestEsLimit,
            Field::GuestEsAccessRights,
            Field::GuestEsBase,
            Some(Field::HostEsSelector),
        ),
        (
            frame.fs,
            Field::GuestFsSelector,
            Field::GuestFsLimit,
            Field::GuestFsAccessRights,
            Field::GuestFsBase,
            Some(Field::HostFsSelector),
        ),
        (
            frame.gs,
            Field::GuestGsSelector,
            Field::GuestGsLimit,
            Field::GuestGsAccessRights,
            Field::GuestGsBase,
            Some(Field::HostGsSelector),
        ),
        (
            special.tr,
            Field::GuestTrSelector,
            Field::GuestTrLimit,
            Field::GuestTrAccessRights,
            Field::GuestTrBase,
            Some(Field::HostTrSelector),
        ),
        (
            special.ldtr,
            Field::GuestLdtrSelector,
            Field::GuestLdtrLimit,
            Field::GuestLdtrAccessRights,
            Field::GuestLdtrBase,
            None,
        ),
    ];
    for (raw, selector_f, limit_f, rights_f, base_f, host_selector_f) in slots {
        let selector = SegmentSelector::from_raw(raw);
        let segment = decode_descriptor(gdt, selector);
        vmcs.write(selector_f, segment.selector as u64)?;
        vmcs.write(limit_f, segment.limit as u64)?;
        vmcs.write(rights_f, segment.access_rights as u64)?;
        vmcs.write(base_f, segment.base)?;
        if let Some(host_selector_f) = host_selector_f {
            vmcs.write(host_selector_f, selector.without_rpl().pack() as u64)?;
        }
    }
    // Host bases: only FS, GS and TR exist in the host-state area. The GS
    // base travels in its MSR on both sides.
    vmcs.write(
        Field::HostFsBase,
        decode_descriptor(gdt, SegmentSelector::from_raw(frame.fs)).base,
    )?;
    vmcs.write(
        Field::HostTrBase,
        decode_descriptor(gdt, SegmentSelector::from_raw(special.tr)).base,
    )?;
    vmcs.write(Field::GuestGsBase, special.gs_base)?;
    vmcs.write(Field::HostGsBase, special.gs_base)?;

    // Descriptor tables: mirrored into the guest, base-only for the host.
    vmcs.write(Field::GuestGdtrBase, special.gdtr_base)?;
    vmcs.write(Field::GuestGdtrLimit, special.gdtr_limit as u64)?;
    vmcs.write(Field::GuestIdtrBase, special.idtr_base)?;
    vmcs.write(Field::GuestIdtrLimit, special.idtr_limit as u64)?;
    vmcs.write(Field::HostGdtrBase, special.gdtr_base)?;
    vmcs.write(Field::HostIdtrBase, special.idtr_base)?;

    // Control registers narrowed by the fixed-bit MSRs; the read shadows
    // show the guest its own unnarrowed values.
    let cr0 = apply_fixed_bits(
        special.cr0,
        caps.msr(vmx::IA32_VMX_CR0_FIXED0),
        caps.msr(vmx::IA32_VMX_CR0_FIXED1),
    );
    let cr4 = apply_fixed_bits(
        special.cr4,
        caps.msr(vmx::IA32_VMX_CR4_FIXED0),
        caps.msr(vmx::IA32_VMX_CR4_FIXED1),
    );
    vmcs.write(Field::GuestCr0, cr0)?;
    vmcs.write(Field::HostCr0, cr0)?;
    vmcs.write(Field::Cr0ReadShadow, special.cr0)?;
    vmcs.write(Field::GuestCr4, cr4)?;
    vmcs.write(Field::HostCr4, cr4)?;
    vmcs.write(Field::Cr4ReadShadow, special.cr4)?;

    // The guest keeps the address space that was live at capture; the host
    // runs in the system address space, valid from any process context.
    vmcs.write(Field::GuestCr3, special.cr3)?;
    vmcs.write(Field::HostCr3, vp.system_cr3)?;

    vmcs.write(Field::GuestDr7, special.dr7)?;
    vmcs.write(Field::GuestIa32Debugctl, special.debug_control)?;

    // This is what makes VMLAUNCH "return" into the capture point.
    vmcs.write(Field::GuestRsp, frame.rsp)?;
    vmcs.write(Field::GuestRip, frame.rip)?;
    vmcs.write(Field::GuestRflags, frame.rflags)?;

    // The exit funnel: register frame carved at the top of the dedicated
    // stack, trampoline as entry point.
    let host_rsp = ptr::addr_of!(vp.stack.exit_frame) as u64;
    debug_assert_eq!(host_rsp & 0xf, 0, "host stack must stay 16-byte aligned");
    vmcs.write(Field::HostRsp, host_rsp)?;
    vmcs.write(Field::HostRip, exit::vmexit_entry as *const () as u64)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vp_data_layout_holds_trampoline_contract() {
        // The trampoline reads its VpData pointer from HOST_RSP plus the
        // frame size; both the frame offset and the stack size are fixed.
        assert_eq!(
            core::mem::size_of::<HostStackLayout>(),
            HOST_STACK_SIZE
        );
        let frame_offset = core::mem::offset_of!(HostStackLayout, exit_frame);
        let vp_offset = core::mem::offset_of!(HostStackLayout, vp);
        assert_eq!(frame_offset % 16, 0);
        assert_eq!(
            vp_offset - frame_offset,
            core::mem::size_of::<MachineFrame>()
        );
        assert_eq!(core::mem::align_of::<VpData>(), 0x1000);
    }
}
