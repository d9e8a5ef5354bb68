//! Hardware capability probe.
//!
//! Runs once at load time, before anything is allocated, and decides whether
//! this machine can be hyperjacked at all. Every check is a hard
//! requirement; any miss aborts the load with nothing to unwind.

use crate::host::Host;
use crate::vmx::{self, FeatureControl, PrimaryProcControls, SecondaryProcControls};
use crate::HvError;

// CPUID leaf 0 vendor words for "GenuineIntel" (EBX, EDX, ECX).
const VENDOR_GENU: u32 = 0x756e_6547;
const VENDOR_INEI: u32 = 0x4965_6e69;
const VENDOR_NTEL: u32 = 0x6c65_746e;

// CPUID.1:ECX feature bits.
const FEATURE_VMX: u32 = 1 << 5;
const FEATURE_HYPERVISOR_PRESENT: u32 = 1 << 31;

/// Check that the processor supports what the hypervisor is about to do:
/// an Intel part with VMX, not already virtualized, firmware-unlocked for
/// VMXON outside SMX, with secondary processor controls and EPT available.
pub fn probe<H: Host>(host: &H) -> Result<(), HvError> {
    let vendor = host.cpuid(0);
    if (vendor.ebx, vendor.edx, vendor.ecx) != (VENDOR_GENU, VENDOR_INEI, VENDOR_NTEL) {
        return Err(HvError::Unsupported);
    }

    let features = host.cpuid(1);
    if features.ecx & FEATURE_VMX == 0 {
        return Err(HvError::Unsupported);
    }
    // Refuse to nest under an existing hypervisor.
    if features.ecx & FEATURE_HYPERVISOR_PRESENT != 0 {
        return Err(HvError::Unsupported);
    }

    // Firmware must have locked the feature-control MSR with VMXON enabled
    // outside SMX; an unlocked register means it was never configured.
    let feature_control =
        FeatureControl::from_bits_truncate(host.read_msr(vmx::IA32_FEATURE_CONTROL));
    if !feature_control.contains(FeatureControl::LOCKED | FeatureControl::VMXON_OUTSIDE_SMX) {
        return Err(HvError::Unsupported);
    }

    // IA32_VMX_PROCBASED_CTLS2 only means something if the secondary
    // controls can be activated in the first place.
    let primary = host.read_msr(vmx::IA32_VMX_PROCBASED_CTLS);
    if (primary >> 32) as u32 & PrimaryProcControls::ACTIVATE_SECONDARY_CONTROLS.bits() == 0 {
        return Err(HvError::Unsupported);
    }

    let secondary = host.read_msr(vmx::IA32_VMX_PROCBASED_CTLS2);
    if (secondary >> 32) as u32 & SecondaryProcControls::ENABLE_EPT.bits() == 0 {
        return Err(HvError::Unsupported);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryMap;
    use bedrock::addressing::{Pa, Va};
    use core::arch::x86_64::CpuidResult;

    struct Caps {
        vendor: (u32, u32, u32),
        features_ecx: u32,
        feature_control: u64,
        procbased: u64,
        procbased2: u64,
    }

    impl Caps {
        fn supported() -> Self {
            Self {
                vendor: (VENDOR_GENU, VENDOR_INEI, VENDOR_NTEL),
                features_ecx: FEATURE_VMX,
                feature_control: (FeatureControl::LOCKED | FeatureControl::VMXON_OUTSIDE_SMX)
                    .bits(),
                procbased: (PrimaryProcControls::ACTIVATE_SECONDARY_CONTROLS.bits() as u64) << 32,
                procbased2: (SecondaryProcControls::ENABLE_EPT.bits() as u64) << 32,
            }
        }
    }

    impl Host for Caps {
        fn cpuid(&self, leaf: u32) -> CpuidResult {
            match leaf {
                0 => CpuidResult {
                    eax: 0x16,
                    ebx: self.vendor.0,
                    ecx: self.vendor.2,
                    edx: self.vendor.1,
                },
                1 => CpuidResult {
                    eax: 0,
                    ebx: 0,
                    ecx: self.features_ecx,
                    edx: 0,
                },
                _ => unreachable!("probe only reads leaves 0 and 1"),
            }
        }

        fn read_msr(&self, index: u32) -> u64 {
            match index {
                vmx::IA32_FEATURE_CONTROL => self.feature_control,
                vmx::IA32_VMX_PROCBASED_CTLS => self.procbased,
                vmx::IA32_VMX_PROCBASED_CTLS2 => self.procbased2,
                _ => unreachable!("probe reads no other msr"),
            }
        }

        fn alloc_contiguous(&self, _: usize) -> Option<Va> {
            unreachable!("probe allocates nothing")
        }
        fn free_contiguous(&self, _: Va, _: usize) {
            unreachable!()
        }
        fn va_to_pa(&self, _: Va) -> Pa {
            unreachable!()
        }
        fn pa_to_va(&self, _: Pa) -> Va {
            unreachable!()
        }
        fn memory_map(&self) -> MemoryMap {
            unreachable!()
        }
        fn invept_single_context(&self, _: u64) {
            unreachable!()
        }
    }

    #[test]
    fn supported_machine_passes() {
        assert_eq!(probe(&Caps::supported()), Ok(()));
    }

    #[test]
    fn non_intel_vendor_fails() {
        let mut caps = Caps::supported();
        caps.vendor = (0x6874_7541, 0x6974_6e65, 0x444d_4163); // AuthenticAMD
        assert_eq!(probe(&caps), Err(HvError::Unsupported));
    }

    #[test]
    fn missing_vmx_feature_fails() {
        let mut caps = Caps::supported();
        caps.features_ecx &= !FEATURE_VMX;
        assert_eq!(probe(&caps), Err(HvError::Unsupported));
    }

    #[test]
    fn existing_hypervisor_fails() {
        let mut caps = Caps::supported();
        caps.features_ecx |= FEATURE_HYPERVISOR_PRESENT;
        assert_eq!(probe(&caps), Err(HvError::Unsupported));
    }

    #[test]
    fn unlocked_feature_control_fails() {
        let mut caps = Caps::supported();
        caps.feature_control = FeatureControl::VMXON_OUTSIDE_SMX.bits();
        assert_eq!(probe(&caps), Err(HvError::Unsupported));
    }

    #[test]
    fn vmxon_disabled_outside_smx_fails() {
        let mut caps = Caps::supported();
        caps.feature_control = FeatureControl::LOCKED.bits();
        assert_eq!(probe(&caps), Err(HvError::Unsupported));
    }

    #[test]
    fn missing_secondary_controls_fails() {
        let mut caps = Caps::supported();
        caps.procbased = 0;
        assert_eq!(probe(&caps), Err(HvError::Unsupported));
    }

    #[test]
    fn ept_not_allowed_fails() {
        let mut caps = Caps::supported();
        caps.procbased2 = 0;
        assert_eq!(probe(&caps), Err(HvError::Unsupported));
    }
}
