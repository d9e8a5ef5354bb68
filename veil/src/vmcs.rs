//! Virtual-Machine Control Structure access.
//!
//! A VMCS is a 4 KiB, revision-stamped blob the processor owns; software
//! only ever touches it through VMREAD/VMWRITE against the *current* VMCS.
//! Every VMX instruction reports failure through RFLAGS (CF for "no current
//! VMCS", ZF for "failed, error number available"), so each wrapper here
//! clears CF first and folds both flags into one SETNA test, the error
//! number being fetched afterwards when available.

use crate::HvError;
use bedrock::addressing::Pa;
use core::arch::asm;
use num_enum::FromPrimitive;

/// A 4 KiB VMX region: used both for the VMXON region and for the VMCS.
/// Hardware demands the revision identifier from IA32_VMX_BASIC in the first
/// word before it will accept either.
#[repr(C, align(4096))]
pub struct VmxRegion {
    revision_id: u32,
    abort_indicator: u32,
    data: [u8; 0x1000 - 8],
}

const _: () = assert!(core::mem::size_of::<VmxRegion>() == 0x1000);

impl VmxRegion {
    /// Stamp the region with the hardware revision identifier. Bit 31 (the
    /// shadow-VMCS indicator) stays clear.
    pub fn set_revision_id(&mut self, revision_id: u32) {
        self.revision_id = revision_id & 0x7fff_ffff;
    }
}

/// Vm-instruction error numbers (Table 31-1), as read from the current VMCS
/// after a flags-reported failure.
#[derive(Debug, Eq, PartialEq, Clone, Copy, FromPrimitive)]
#[repr(u64)]
pub enum VmInstructionError {
    /// VMCALL executed in VMX root operation.
    VmcallInVmxRoot = 1,
    /// VMCLEAR with an invalid physical address.
    VmclearWithInvalidAddress = 2,
    /// VMCLEAR with the VMXON pointer.
    VmclearWithVmxonPointer = 3,
    /// VMLAUNCH with a non-clear VMCS.
    VmlaunchWithNonClearVmcs = 4,
    /// VMRESUME with a non-launched VMCS.
    VmresumeWithNonLaunchedVmcs = 5,
    /// VMRESUME after VMXOFF.
    VmresumeAfterVmxoff = 6,
    /// VM entry with invalid control fields.
    EntryWithInvalidControlFields = 7,
    /// VM entry with invalid host-state fields.
    EntryWithInvalidHostState = 8,
    /// VMPTRLD with an invalid physical address.
    VmptrldWithInvalidAddress = 9,
    /// VMPTRLD with the VMXON pointer.
    VmptrldWithVmxonPointer = 10,
    /// VMPTRLD with the wrong revision identifier.
    VmptrldWithWrongRevision = 11,
    /// VMREAD/VMWRITE of an unsupported component.
    UnsupportedVmcsComponent = 12,
    /// VMWRITE to a read-only component.
    WriteToReadOnlyComponent = 13,
    /// VMXON executed in VMX root operation.
    VmxonInVmxRoot = 15,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidInveptOperand = 28,
    /// Anything this build has no name for, including "error number
    /// unavailable".
    #[num_enum(default)]
    Unknown = 0,
}

/// The VMCS component encodings this hypervisor touches.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum Field {
    // 16-bit control and state fields.
    Vpid = 0x0000,
    GuestEsSelector = 0x0800,
    GuestCsSelector = 0x0802,
    GuestSsSelector = 0x0804,
    GuestDsSelector = 0x0806,
    GuestFsSelector = 0x0808,
    GuestGsSelector = 0x080A,
    GuestLdtrSelector = 0x080C,
    GuestTrSelector = 0x080E,
    HostEsSelector = 0x0C00,
    HostCsSelector = 0x0C02,
    HostSsSelector = 0x0C04,
    HostDsSelector = 0x0C06,
    HostFsSelector = 0x0C08,
    HostGsSelector = 0x0C0A,
    HostTrSelector = 0x0C0C,
    // 64-bit control and state fields.
    MsrBitmap = 0x2004,
    EptPointer = 0x201A,
    GuestPhysicalAddress = 0x2400,
    VmcsLinkPointer = 0x2800,
    GuestIa32Debugctl = 0x2802,
    // 32-bit control, read-only and state fields.
    PinBasedControls = 0x4000,
    PrimaryProcControls = 0x4002,
    ExceptionBitmap = 0x4004,
    VmExitControls = 0x400C,
    VmEntryControls = 0x4012,
    SecondaryProcControls = 0x401E,
    VmInstructionErrorNumber = 0x4400,
    ExitReason = 0x4402,
    VmExitInstructionLength = 0x440C,
    GuestEsLimit = 0x4800,
    GuestCsLimit = 0x4802,
    GuestSsLimit = 0x4804,
    GuestDsLimit = 0x4806,
    GuestFsLimit = 0x4808,
    GuestGsLimit = 0x480A,
    GuestLdtrLimit = 0x480C,
    GuestTrLimit = 0x480E,
    GuestGdtrLimit = 0x4810,
    GuestIdtrLimit = 0x4812,
    GuestEsAccessRights = 0x4814,
    GuestCsAccessRights = 0x4816,
    GuestSsAccessRights = 0x4818,
    GuestDsAccessRights = 0x481A,
    GuestFsAccessRights = 0x481C,
    GuestGsAccessRights = 0x481E,
    GuestLdtrAccessRights = 0x4820,
    GuestTrAccessRights = 0x4822,
    // Natural-width control, read-only and state fields.
    Cr0ReadShadow = 0x6004,
    Cr4ReadShadow = 0x6006,
    ExitQualification = 0x6400,
    GuestCr0 = 0x6800,
    GuestCr3 = 0x6802,
    GuestCr4 = 0x6804,
    GuestEsBase = 0x6806,
    GuestCsBase = 0x6808,
    GuestSsBase = 0x680A,
    GuestDsBase = 0x680C,
    GuestFsBase = 0x680E,
    GuestGsBase = 0x6810,
    GuestLdtrBase = 0x6812,
    GuestTrBase = 0x6814,
    GuestGdtrBase = 0x6816,
    GuestIdtrBase = 0x6818,
    GuestDr7 = 0x681A,
    GuestRsp = 0x681C,
    GuestRip = 0x681E,
    GuestRflags = 0x6820,
    HostCr0 = 0x6C00,
    HostCr3 = 0x6C02,
    HostCr4 = 0x6C04,
    HostFsBase = 0x6C06,
    HostGsBase = 0x6C08,
    HostTrBase = 0x6C0A,
    HostGdtrBase = 0x6C0C,
    HostIdtrBase = 0x6C0E,
    HostRsp = 0x6C14,
    HostRip = 0x6C16,
}

/// Fetch the error number of the last flags-reported VMX failure.
pub fn instruction_error() -> VmInstructionError {
    unsafe {
        let err: i8;
        let number: u64;
        asm!(
            "clc",
            "vmread {}, {}",
            "setna {}",
            out(reg) number,
            in(reg) Field::VmInstructionErrorNumber as u64,
            out(reg_byte) err
        );
        if err != 0 {
            VmInstructionError::Unknown
        } else {
            VmInstructionError::from_primitive(number)
        }
    }
}

/// Enter VMX root operation with `region` as the VMXON region.
///
/// # Safety
/// CR4.VMXE and the feature-control MSR must permit VMXON; `region` must be
/// revision-stamped, 4 KiB and page-aligned.
pub unsafe fn vmxon(region: Pa) -> Result<(), HvError> {
    let err: i8;
    let pa = region.into_usize();
    asm!(
        "clc",
        "vmxon [{}]",
        "setna {}",
        in(reg) &pa,
        out(reg_byte) err
    );
    if err != 0 {
        Err(HvError::VmxFail(instruction_error()))
    } else {
        Ok(())
    }
}

/// Leave VMX operation.
///
/// # Safety
/// Caller must be in VMX root operation.
pub unsafe fn vmxoff() {
    asm!("vmxoff");
}

/// Clear the launch state of the VMCS at `vmcs` and flush it to memory.
///
/// # Safety
/// Caller must be in VMX root operation.
pub unsafe fn vmclear(vmcs: Pa) -> Result<(), HvError> {
    let err: i8;
    let pa = vmcs.into_usize();
    asm!(
        "clc",
        "vmclear [{}]",
        "setna {}",
        in(reg) &pa,
        out(reg_byte) err
    );
    if err != 0 {
        Err(HvError::VmxFail(instruction_error()))
    } else {
        Ok(())
    }
}

/// Make the VMCS at `vmcs` current, yielding the handle VMREAD/VMWRITE work
/// through.
///
/// # Safety
/// Caller must be in VMX root operation; the region must be revision-stamped
/// and VMCLEARed at least once.
pub unsafe fn vmptrld(vmcs: Pa) -> Result<ActiveVmcs, HvError> {
    let err: i8;
    let pa = vmcs.into_usize();
    asm!(
        "clc",
        "vmptrld [{}]",
        "setna {}",
        in(reg) &pa,
        out(reg_byte) err
    );
    if err != 0 {
        Err(HvError::VmxFail(instruction_error()))
    } else {
        Ok(ActiveVmcs { _p: () })
    }
}

/// Launch the current VMCS. Returns only on failure; on success the next
/// instruction retired is the guest's.
///
/// # Safety
/// The current VMCS must be fully populated and clear.
pub unsafe fn vmlaunch() -> VmInstructionError {
    asm!("vmlaunch");
    instruction_error()
}

/// INVEPT, single-context: drop cached translations tagged with `eptp`.
///
/// # Safety
/// Caller must be in VMX operation and `eptp` must be a value previously
/// installed in a VMCS.
pub unsafe fn invept_single_context(eptp: u64) {
    #[repr(C, align(16))]
    struct InveptDescriptor {
        eptp: u64,
        reserved: u64,
    }
    let descriptor = InveptDescriptor { eptp, reserved: 0 };
    asm!(
        "invept {}, [{}]",
        in(reg) 1u64,
        in(reg) &descriptor,
    );
}

/// A witness that some VMCS is current on this processor.
pub struct ActiveVmcs {
    _p: (),
}

impl ActiveVmcs {
    /// Assert that a VMCS is already current (used by the VM-exit path,
    /// where hardware guarantees it).
    ///
    /// # Safety
    /// Caller must know a VMCS is current; reads and writes go to it.
    pub unsafe fn current() -> Self {
        Self { _p: () }
    }

    /// Read from the vmcs field of the current vmcs.
    pub fn read(&self, field: Field) -> Result<u64, HvError> {
        unsafe {
            let err: i8;
            let v: u64;
            asm!(
                "clc",
                "vmread {}, {}",
                "setna {}",
                out(reg) v,
                in(reg) field as u64,
                out(reg_byte) err
            );
            if err != 0 {
                Err(HvError::VmxFail(instruction_error()))
            } else {
                Ok(v)
            }
        }
    }

    /// Write to the vmcs field of the current vmcs.
    pub fn write(&self, field: Field, v: u64) -> Result<(), HvError> {
        unsafe {
            let err: i8;
            asm!(
                "clc",
                "vmwrite {}, {}",
                "setna {}",
                in(reg) field as u64,
                in(reg) v,
                out(reg_byte) err
            );
            if err != 0 {
                Err(HvError::VmxFail(instruction_error()))
            } else {
                Ok(())
            }
        }
    }

    /// Move the guest past the instruction that caused the current exit.
    pub fn advance_guest_rip(&self) -> Result<(), HvError> {
        self.write(
            Field::GuestRip,
            self.read(Field::GuestRip)? + self.read(Field::VmExitInstructionLength)?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmx_region_is_exactly_one_page() {
        assert_eq!(core::mem::size_of::<VmxRegion>(), 0x1000);
        assert_eq!(core::mem::align_of::<VmxRegion>(), 0x1000);
    }

    #[test]
    fn revision_stamp_clears_shadow_indicator() {
        let mut region = VmxRegion {
            revision_id: 0,
            abort_indicator: 0,
            data: [0; 0x1000 - 8],
        };
        region.set_revision_id(0x8000_0012);
        assert_eq!(region.revision_id, 0x12);
    }

    #[test]
    fn unknown_error_numbers_collapse_to_unknown() {
        assert_eq!(
            VmInstructionError::from_primitive(4),
            VmInstructionError::VmlaunchWithNonClearVmcs
        );
        assert_eq!(
            VmInstructionError::from_primitive(999),
            VmInstructionError::Unknown
        );
    }
}
