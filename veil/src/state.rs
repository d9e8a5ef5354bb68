//! Global hypervisor state and the per-processor dispatch boundary.
//!
//! Hardware pins these structures to fixed addresses — the EPTP in every
//! VMCS names one PML4, HOST_RIP one trampoline, HOST_RSP one stack per
//! processor — so the crate owns exactly one [`Hypervisor`] instance,
//! created by [`load`] and destroyed by [`unload`]. In between, the
//! driver wrapper fans [`on_load`]/[`on_unload`] out to every logical
//! processor at an elevated priority that keeps each handler pinned and
//! unpreempted.

use crate::ept::ExtendedPageTable;
use crate::host::{Host, KernelHost};
use crate::probe;
use crate::vp::{self, VpData};
use crate::HvError;
use bedrock::addressing::{Va, PAGE_SIZE};
use bedrock::x86_64::intrinsics::cpu_id;
use bedrock::{info, warning};
use core::ptr;
use spin_lock::SpinLock;

/// Everything shared between processors.
pub struct Hypervisor {
    pub(crate) host: KernelHost,
    /// The translation tree and its single-writer lock. Taken only at the
    /// dispatch priority: by the bring-up processor before anyone else is
    /// in VMX, and by EPT-violation handlers afterwards.
    pub(crate) ept: SpinLock<ExtendedPageTable>,
    /// Zeroed 4 KiB page: no MSR intercepts. Shared read-only by all VMCSs.
    msr_bitmap: Va,
    /// EPTP value, written once by `load`, read-only afterwards.
    eptp: u64,
    /// One contiguous block of `cpus` VpData slots.
    vps: Va,
    cpus: usize,
}

impl Hypervisor {
    /// The VpData slot of processor `index`.
    pub(crate) fn vp(&self, index: usize) -> *mut VpData {
        assert!(index < self.cpus, "processor index out of range");
        // SAFETY: the block holds `cpus` slots and outlives every user.
        unsafe {
            (self.vps.into_usize() as *mut VpData).add(index)
        }
    }
}

static mut HYPERVISOR: Option<Hypervisor> = None;

/// The loaded hypervisor.
///
/// # Safety
/// Callable only between a successful [`load`] and [`unload`].
pub(crate) unsafe fn global() -> &'static Hypervisor {
    (*ptr::addr_of!(HYPERVISOR))
        .as_ref()
        .expect("hypervisor not loaded")
}

/// Probe the hardware and build everything shared: the identity-mapped EPT
/// tree, the MSR bitmap and the per-processor data block. Nothing is held
/// on failure.
///
/// # Safety
/// Must run exactly once per load, from the driver's load path, before any
/// [`on_load`] is dispatched. `cpus` must exceed every processor id the
/// dispatch facility will run handlers on.
pub unsafe fn load(cpus: usize) -> Result<(), HvError> {
    assert!(cpus > 0);
    let host = KernelHost;
    probe::probe(&host)?;
    info!("veil: hardware probe passed");

    let mut ept = ExtendedPageTable::empty();
    if let Err(err) = ept.initialize(&host) {
        ept.cleanup(&host);
        return Err(err);
    }
    let eptp = ept.pointer();

    let Some(msr_bitmap) = host.alloc_contiguous(PAGE_SIZE) else {
        ept.cleanup(&host);
        return Err(HvError::OutOfResources);
    };
    ptr::write_bytes(msr_bitmap.into_usize() as *mut u8, 0, PAGE_SIZE);

    let vps_bytes = cpus * core::mem::size_of::<VpData>();
    let Some(vps) = host.alloc_contiguous(vps_bytes) else {
        host.free_contiguous(msr_bitmap, PAGE_SIZE);
        ept.cleanup(&host);
        return Err(HvError::OutOfResources);
    };
    ptr::write_bytes(vps.into_usize() as *mut u8, 0, vps_bytes);

    let hv = Hypervisor {
        host,
        ept: SpinLock::new(ept),
        msr_bitmap,
        eptp,
        vps,
        cpus,
    };
    for index in 0..cpus {
        (*hv.vp(index)).wire_stack();
    }
    *ptr::addr_of_mut!(HYPERVISOR) = Some(hv);
    info!("veil: shared state ready for {} processors", cpus);
    Ok(())
}

/// First-time bring-up for the current processor. On success the caller is
/// already executing as the guest.
///
/// # Safety
/// Must run pinned to one processor at the dispatch priority, after a
/// successful [`load`]. `system_cr3` must name the system address space.
pub unsafe fn on_load(system_cr3: u64) -> Result<(), HvError> {
    let hv = global();
    let id = cpu_id();
    let vp = hv.vp(id);
    (*vp).system_cr3 = system_cr3;

    match vp::launch(vp, hv.eptp, hv.host.va_to_pa(hv.msr_bitmap)) {
        Ok(()) => {
            info!("veil: processor {} virtualized", id);
            Ok(())
        }
        Err(err) => {
            // This processor stays native; peers that already launched are
            // left alone.
            warning!("veil: processor {} failed to virtualize: {:?}", id, err);
            Err(err)
        }
    }
}

/// Teardown for the current processor: issues the distinguished CPUID the
/// exit handler answers with VMXOFF. Harmless on a processor that never
/// virtualized.
///
/// # Safety
/// Same pinning contract as [`on_load`].
pub unsafe fn on_unload() {
    let hv = global();
    let id = cpu_id();
    vp::devirtualize(hv.vp(id));
    info!("veil: processor {} devirtualized", id);
}

/// Release everything [`load`] built.
///
/// # Safety
/// Must run after every processor has been through [`on_unload`]; no VMCS
/// may still reference the EPT tree or the MSR bitmap.
pub unsafe fn unload() {
    let Some(hv) = (*ptr::addr_of_mut!(HYPERVISOR)).take() else {
        return;
    };
    let host = hv.host;
    let mut ept = hv.ept.into_inner();
    ept.cleanup(&host);
    host.free_contiguous(hv.msr_bitmap, PAGE_SIZE);
    host.free_contiguous(hv.vps, hv.cpus * core::mem::size_of::<VpData>());
    info!("veil: unloaded");
}
