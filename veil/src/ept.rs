//! Extended Page Tables.
//!
//! EPT is the second translation the processor performs while a guest runs:
//! guest-physical to host-physical. This hypervisor virtualizes the machine
//! it runs on, so the map is the identity — every guest frame translates to
//! the frame of the same number — and its only reason to exist is that VMX
//! non-root operation requires one. The tree is built eagerly over the OS's
//! physical-memory ranges at load time; anything outside them (MMIO windows,
//! most prominently) faults on first touch and is mapped lazily by
//! [`ExtendedPageTable::handle_violation`].
//!
//! Entries are bit-exact hardware structures (Tables 29-1 through 29-6 of
//! the SDM); they are built with explicit shifts and masks, never
//! language-level bitfields.

use crate::host::Host;
use crate::HvError;
use bedrock::addressing::{Pa, Va, PAGE_SHIFT, PAGE_SIZE};
use bedrock::x86_64::msr::IA32_APIC_BASE;

/// Guest physical address. Identity-mapped here, but the type keeps guest
/// and host physical addresses from crossing wires.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gpa(usize);

impl Gpa {
    /// Create a new guest-physical address with a range check.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 1 << 48 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// The address of guest page frame `pfn`.
    #[inline]
    pub const fn of_frame(pfn: usize) -> Self {
        Self(pfn << PAGE_SHIFT)
    }

    /// Rebuild an address from its four table indices and page offset.
    #[inline]
    pub const fn compose(
        pml4: usize,
        pdpt: usize,
        pd: usize,
        pt: usize,
        offset: usize,
    ) -> Self {
        Self(pml4 << 39 | pdpt << 30 | pd << 21 | pt << 12 | offset)
    }

    /// Cast into usize.
    #[inline]
    pub const unsafe fn into_usize(self) -> usize {
        self.0
    }

    /// Guest page-frame number.
    #[inline]
    pub const fn pfn(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Index into the PML4 (bits 47:39).
    #[inline]
    pub const fn pml4_index(self) -> usize {
        self.0 >> 39 & 0x1ff
    }

    /// Index into the page-directory-pointer table (bits 38:30).
    #[inline]
    pub const fn pdpt_index(self) -> usize {
        self.0 >> 30 & 0x1ff
    }

    /// Index into the page directory (bits 29:21).
    #[inline]
    pub const fn pd_index(self) -> usize {
        self.0 >> 21 & 0x1ff
    }

    /// Index into the page table (bits 20:12).
    #[inline]
    pub const fn pt_index(self) -> usize {
        self.0 >> 12 & 0x1ff
    }

    /// Offset within the 4 KiB page (bits 11:0).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & 0xfff
    }
}

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

// Physical-frame field shared by every EPT entry format (bits 51:12).
const EPT_PFN_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags::bitflags! {
    /// Permission and status bits of a non-terminal EPT entry (a PML4E,
    /// PDPTE or PDE that references the next table level).
    pub struct EptTableFlags: u64 {
        /// Reads allowed under this entry.
        const READ = 1 << 0;
        /// Writes allowed under this entry.
        const WRITE = 1 << 1;
        /// Instruction fetches allowed under this entry.
        const EXECUTE = 1 << 2;
        /// Set by hardware when the region is accessed (EPTP bit 6 only).
        const ACCESSED = 1 << 8;

        const FULL = Self::READ.bits | Self::WRITE.bits | Self::EXECUTE.bits;
    }
}

bitflags::bitflags! {
    /// Bits of a terminal EPT entry mapping a 4-KByte page.
    pub struct EptPageFlags: u64 {
        /// Reads allowed from the page.
        const READ = 1 << 0;
        /// Writes allowed to the page.
        const WRITE = 1 << 1;
        /// Instruction fetches allowed from the page.
        const EXECUTE = 1 << 2;
        /// Memory type writeback (value 6 in bits 5:3).
        const MEMORY_TYPE_WRITEBACK = 6 << 3;
        /// Ignore the guest PAT type for this page.
        const IGNORE_PAT = 1 << 6;
        /// Set by hardware when the page is accessed (EPTP bit 6 only).
        const ACCESSED = 1 << 8;
        /// Set by hardware when the page is written (EPTP bit 6 only).
        const DIRTY = 1 << 9;
        /// Suppress #VE for violations on this page.
        const SUPPRESS_VE = 1 << 63;

        const FULL = Self::READ.bits | Self::WRITE.bits | Self::EXECUTE.bits;
    }
}

/// A non-terminal EPT entry: either zero, or RWX with the physical frame of
/// the next table level.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct EptTableEntry(u64);

const _: () = assert!(core::mem::size_of::<EptTableEntry>() == 8);

impl EptTableEntry {
    /// Get the flags of this entry.
    #[inline]
    pub const fn flags(&self) -> EptTableFlags {
        EptTableFlags::from_bits_truncate(self.0)
    }

    /// Physical address of the child table, if one is linked.
    #[inline]
    pub fn table_pa(&self) -> Option<Pa> {
        if self.0 & EptTableFlags::FULL.bits() != 0 {
            Pa::new((self.0 & EPT_PFN_MASK) as usize)
        } else {
            None
        }
    }

    /// Link a freshly zeroed child table into this entry with full rights.
    #[inline]
    pub fn link(&mut self, table: Pa) {
        debug_assert!(table.is_page_aligned());
        self.0 = unsafe { table.into_usize() } as u64 | EptTableFlags::FULL.bits();
    }
}

/// A terminal EPT entry: either zero, or an RWX writeback mapping of one
/// guest page frame.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct EptPageEntry(u64);

const _: () = assert!(core::mem::size_of::<EptPageEntry>() == 8);

impl EptPageEntry {
    /// Get the flags of this entry.
    #[inline]
    pub const fn flags(&self) -> EptPageFlags {
        EptPageFlags::from_bits_truncate(self.0)
    }

    /// Whether this entry maps a page.
    #[inline]
    pub fn is_present(&self) -> bool {
        self.0 & EptPageFlags::FULL.bits() != 0
    }

    /// Physical address of the mapped page, if any.
    #[inline]
    pub fn page_pa(&self) -> Option<Pa> {
        if self.is_present() {
            Pa::new((self.0 & EPT_PFN_MASK) as usize)
        } else {
            None
        }
    }

    /// Map `page` with full rights and writeback memory type.
    #[inline]
    pub fn map(&mut self, page: Pa) {
        debug_assert!(page.is_page_aligned());
        self.0 = unsafe { page.into_usize() } as u64
            | (EptPageFlags::FULL | EptPageFlags::MEMORY_TYPE_WRITEBACK).bits();
    }
}

bitflags::bitflags! {
    /// Exit qualification for EPT violations (Table 28-7).
    pub struct EptViolationQualification: u64 {
        /// The access was a data read.
        const DATA_READ = 1 << 0;
        /// The access was a data write.
        const DATA_WRITE = 1 << 1;
        /// The access was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 2;
        /// AND of the read bits over the walked entries: the address was
        /// readable.
        const GPA_READABLE = 1 << 3;
        /// AND of the write bits: the address was writable.
        const GPA_WRITABLE = 1 << 4;
        /// AND of the execute bits: the address was executable.
        const GPA_EXECUTABLE = 1 << 5;
        /// The guest linear-address field is valid.
        const GUEST_LINEAR_VALID = 1 << 7;
        /// The access translated a linear address (clear: page-walk access).
        const TRANSLATED_ACCESS = 1 << 8;
    }
}

impl EptViolationQualification {
    /// Whether the violation describes a guest-physical address with no
    /// translation at all: the three rights bits are the AND over the walked
    /// entries, and an installed identity mapping always grants RWX, so all
    /// three clear means the walk hit a hole.
    #[inline]
    pub fn is_missing_translation(&self) -> bool {
        !self.intersects(
            Self::GPA_READABLE | Self::GPA_WRITABLE | Self::GPA_EXECUTABLE,
        )
    }
}

// EPTP layout: memory type in bits 2:0, (page-walk length - 1) in bits 5:3,
// accessed/dirty assist in bit 6, PML4 frame from bit 12 up.
const EPTP_MEMORY_TYPE_WRITEBACK: u64 = 6;
const EPTP_WALK_LENGTH_4: u64 = 3 << 3;

/// Owner of the PML4 and every descendant table.
///
/// One instance exists per machine. Mutation is serialized by the spinlock
/// in [`crate::state`]; the concurrent readers are the processors' page
/// walkers, which re-walk after the INVEPT that follows every change.
pub struct ExtendedPageTable {
    pml4: Option<Va>,
    eptp: u64,
}

impl ExtendedPageTable {
    pub const fn empty() -> Self {
        Self {
            pml4: None,
            eptp: 0,
        }
    }

    /// The EPTP value describing this tree; zero before `initialize`.
    #[inline]
    pub fn pointer(&self) -> u64 {
        self.eptp
    }

    /// Allocate and build the identity map: every 4 KiB frame of every
    /// OS-reported physical range, plus the local APIC page, which the
    /// range list omits but the guest touches on its very next interrupt.
    ///
    /// On failure the partially built tree stays in place for [`cleanup`]
    /// to unwind.
    ///
    /// [`cleanup`]: Self::cleanup
    pub fn initialize<H: Host>(&mut self, host: &H) -> Result<(), HvError> {
        debug_assert!(self.pml4.is_none(), "double initialize");
        let pml4 = Self::alloc_table(host)?;
        self.pml4 = Some(pml4);
        self.eptp = EPTP_MEMORY_TYPE_WRITEBACK
            | EPTP_WALK_LENGTH_4
            | unsafe { host.va_to_pa(pml4).into_usize() } as u64;

        let map = host.memory_map();
        for range in map.iter() {
            for pfn in range.frames() {
                self.map_page(host, Gpa::of_frame(pfn))?;
            }
        }

        let apic_base = host.read_msr(IA32_APIC_BASE) & EPT_PFN_MASK;
        self.map_page(host, Gpa::of_frame(apic_base as usize >> PAGE_SHIFT))?;
        Ok(())
    }

    /// Install an identity mapping for the 4 KiB page containing `gpa`,
    /// creating interior tables as needed. A live leaf is never rewritten.
    ///
    /// Callers serialize through the tree spinlock; the walk itself takes no
    /// locks.
    pub fn map_page<H: Host>(&mut self, host: &H, gpa: Gpa) -> Result<(), HvError> {
        let root = self.pml4.expect("extended page table not initialized");

        let mut table = root;
        for index in [gpa.pml4_index(), gpa.pdpt_index(), gpa.pd_index()] {
            let entries =
                unsafe { &mut *(table.into_usize() as *mut [EptTableEntry; 512]) };
            let entry = &mut entries[index];
            let next = match entry.table_pa() {
                Some(pa) => pa,
                None => {
                    let child = Self::alloc_table(host)?;
                    let pa = host.va_to_pa(child);
                    entry.link(pa);
                    pa
                }
            };
            table = host.pa_to_va(next);
        }

        let leaves = unsafe { &mut *(table.into_usize() as *mut [EptPageEntry; 512]) };
        let leaf = &mut leaves[gpa.pt_index()];
        if !leaf.is_present() {
            // Identity map: the host frame is the guest frame. The
            // conversion cannot fail below the 48-bit guest-physical bound.
            leaf.map(Pa::new(gpa.pfn() << PAGE_SHIFT).unwrap());
        }
        Ok(())
    }

    /// Service an EPT-violation exit for `gpa`.
    ///
    /// A qualification whose rights bits are all clear means the walk found
    /// no translation — a physical page outside the boot-time range list —
    /// and is answered by materializing the identity mapping and flushing
    /// this EPTP's cached translations. Anything else cannot happen under an
    /// identity map that never revokes rights, and is reported fatal without
    /// touching the tree.
    pub fn handle_violation<H: Host>(
        &mut self,
        host: &H,
        gpa: Gpa,
        qualification: EptViolationQualification,
    ) -> Result<(), HvError> {
        if !qualification.is_missing_translation() {
            return Err(HvError::Fatal(qualification));
        }
        self.map_page(host, gpa)?;
        host.invept_single_context(self.eptp);
        Ok(())
    }

    /// Free the whole tree depth-first. Idempotent once the root is gone.
    pub fn cleanup<H: Host>(&mut self, host: &H) {
        let Some(root) = self.pml4.take() else {
            return;
        };
        self.eptp = 0;

        let free =
            |va: Va| host.free_contiguous(va, PAGE_SIZE);
        unsafe {
            let pml4 = &*(root.into_usize() as *const [EptTableEntry; 512]);
            for pdpt_pa in pml4.iter().filter_map(EptTableEntry::table_pa) {
                let pdpt_va = host.pa_to_va(pdpt_pa);
                let pdpt = &*(pdpt_va.into_usize() as *const [EptTableEntry; 512]);
                for pd_pa in pdpt.iter().filter_map(EptTableEntry::table_pa) {
                    let pd_va = host.pa_to_va(pd_pa);
                    let pd = &*(pd_va.into_usize() as *const [EptTableEntry; 512]);
                    for pt_pa in pd.iter().filter_map(EptTableEntry::table_pa) {
                        free(host.pa_to_va(pt_pa));
                    }
                    free(pd_va);
                }
                free(pdpt_va);
            }
        }
        free(root);
    }

    fn alloc_table<H: Host>(host: &H) -> Result<Va, HvError> {
        let table = host
            .alloc_contiguous(PAGE_SIZE)
            .ok_or(HvError::OutOfResources)?;
        // Zero before linkage regardless of what the allocator promises.
        unsafe {
            core::ptr::write_bytes(table.into_usize() as *mut u8, 0, PAGE_SIZE);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryMap;
    use core::arch::x86_64::CpuidResult;
    use std::alloc::{alloc, dealloc, Layout};
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeSet;

    const APIC_BASE_RAW: u64 = 0xfee0_0900; // enable/BSP flag bits set

    struct StubHost {
        map: MemoryMap,
        apic_base: u64,
        allocated: Cell<usize>,
        outstanding: Cell<usize>,
        fail_at: Cell<usize>, // 1-based allocation ordinal that fails; 0 = never
        invept: RefCell<Vec<u64>>,
    }

    impl StubHost {
        fn new(ranges: &[(usize, usize)]) -> Self {
            let mut map = MemoryMap::empty();
            for &(start, end) in ranges {
                map.push(Pa::new(start).unwrap()..Pa::new(end).unwrap());
            }
            Self {
                map,
                apic_base: APIC_BASE_RAW,
                allocated: Cell::new(0),
                outstanding: Cell::new(0),
                fail_at: Cell::new(0),
                invept: RefCell::new(Vec::new()),
            }
        }

        fn layout(bytes: usize) -> Layout {
            Layout::from_size_align(bytes, PAGE_SIZE).unwrap()
        }
    }

    impl Host for StubHost {
        fn cpuid(&self, _leaf: u32) -> CpuidResult {
            unreachable!("the EPT engine never issues CPUID")
        }

        fn read_msr(&self, index: u32) -> u64 {
            assert_eq!(index, IA32_APIC_BASE);
            self.apic_base
        }

        fn alloc_contiguous(&self, bytes: usize) -> Option<Va> {
            let ordinal = self.allocated.get() + 1;
            if self.fail_at.get() == ordinal {
                return None;
            }
            self.allocated.set(ordinal);
            self.outstanding.set(self.outstanding.get() + 1);
            let ptr = unsafe { alloc(Self::layout(bytes)) };
            assert!(!ptr.is_null());
            Va::new(ptr as usize)
        }

        fn free_contiguous(&self, va: Va, bytes: usize) {
            self.outstanding.set(self.outstanding.get() - 1);
            unsafe { dealloc(va.into_usize() as *mut u8, Self::layout(bytes)) };
        }

        fn va_to_pa(&self, va: Va) -> Pa {
            Pa::new(unsafe { va.into_usize() }).unwrap()
        }

        fn pa_to_va(&self, pa: Pa) -> Va {
            Va::new(unsafe { pa.into_usize() }).unwrap()
        }

        fn memory_map(&self) -> MemoryMap {
            self.map.clone()
        }

        fn invept_single_context(&self, eptp: u64) {
            self.invept.borrow_mut().push(eptp);
        }
    }

    unsafe fn table<'a>(host: &StubHost, pa: Pa) -> &'a [EptTableEntry; 512] {
        &*(host.pa_to_va(pa).into_usize() as *const [EptTableEntry; 512])
    }

    unsafe fn leaves<'a>(host: &StubHost, pa: Pa) -> &'a [EptPageEntry; 512] {
        &*(host.pa_to_va(pa).into_usize() as *const [EptPageEntry; 512])
    }

    /// Every identity leaf in the tree as (gpa, raw entry), plus the set of
    /// child-table frames for the strict-tree check.
    fn snapshot(host: &StubHost, ept: &ExtendedPageTable) -> (Vec<(usize, u64)>, Vec<Pa>) {
        let mut pages = Vec::new();
        let mut children = Vec::new();
        let root = host.va_to_pa(ept.pml4.unwrap());
        unsafe {
            for (i4, e4) in table(host, root).iter().enumerate() {
                let Some(pdpt) = e4.table_pa() else { continue };
                assert_eq!(e4.flags() & EptTableFlags::FULL, EptTableFlags::FULL);
                children.push(pdpt);
                for (i3, e3) in table(host, pdpt).iter().enumerate() {
                    let Some(pd) = e3.table_pa() else { continue };
                    assert_eq!(e3.flags() & EptTableFlags::FULL, EptTableFlags::FULL);
                    children.push(pd);
                    for (i2, e2) in table(host, pd).iter().enumerate() {
                        let Some(pt) = e2.table_pa() else { continue };
                        assert_eq!(e2.flags() & EptTableFlags::FULL, EptTableFlags::FULL);
                        children.push(pt);
                        for (i1, leaf) in leaves(host, pt).iter().enumerate() {
                            if leaf.is_present() {
                                let gpa = Gpa::compose(i4, i3, i2, i1, 0);
                                pages.push((gpa.into_usize(), leaf.0));
                            }
                        }
                    }
                }
            }
        }
        (pages, children)
    }

    fn initialized(ranges: &[(usize, usize)]) -> (StubHost, ExtendedPageTable) {
        let host = StubHost::new(ranges);
        let mut ept = ExtendedPageTable::empty();
        ept.initialize(&host).expect("initialize failed");
        (host, ept)
    }

    #[test]
    fn address_decomposition_round_trips() {
        for addr in [
            0usize,
            0xfff,
            0x1000,
            0xfee0_0000,
            0x0000_7fff_ffff_ffff,
            0x0000_8000_0000_0000 - 1,
            0x1234_5678_9abc,
        ] {
            let gpa = Gpa::new(addr).unwrap();
            assert_eq!(
                Gpa::compose(
                    gpa.pml4_index(),
                    gpa.pdpt_index(),
                    gpa.pd_index(),
                    gpa.pt_index(),
                    gpa.page_offset()
                ),
                gpa
            );
        }
        assert!(Gpa::new(1 << 48).is_none());
    }

    #[test]
    fn eptp_encodes_writeback_four_level_walk() {
        let (host, ept) = initialized(&[]);
        let eptp = ept.pointer();
        assert_eq!(eptp & 0x7, 6, "memory type must be writeback");
        assert_eq!(eptp >> 3 & 0x7, 3, "page-walk length must be 4");
        assert_eq!(eptp & 1 << 6, 0, "accessed/dirty assist stays off");
        assert_eq!(
            eptp & EPT_PFN_MASK,
            unsafe { host.va_to_pa(ept.pml4.unwrap()).into_usize() } as u64
        );
    }

    #[test]
    fn scenario_a_single_range_build() {
        let (host, ept) = initialized(&[(0x0, 0x10_0000)]);
        let (pages, _) = snapshot(&host, &ept);
        // 256 frames for the megabyte plus the APIC page.
        assert_eq!(pages.len(), 257);
        assert!(pages.iter().any(|&(gpa, _)| gpa == 0xfee0_0000));

        // The megabyte and the APIC page share PML4[0]; three interior
        // levels for each of the two distinct upper-index paths plus the
        // shared root and PDPT.
        let root = host.va_to_pa(ept.pml4.unwrap());
        let present: Vec<usize> = unsafe {
            table(&host, root)
                .iter()
                .enumerate()
                .filter(|(_, e)| e.table_pa().is_some())
                .map(|(i, _)| i)
                .collect()
        };
        assert_eq!(present, vec![0]);
        // PML4 + PDPT + 2 PDs + 2 PTs.
        assert_eq!(host.allocated.get(), 6);
    }

    #[test]
    fn scenario_b_two_disjoint_ranges() {
        let (host, ept) = initialized(&[(0x1000, 0x2000), (0x4000, 0x5000)]);
        let (pages, _) = snapshot(&host, &ept);
        assert_eq!(pages.len(), 3);

        let root = host.va_to_pa(ept.pml4.unwrap());
        unsafe {
            let pdpt = table(&host, root)[0].table_pa().unwrap();
            let pd = table(&host, pdpt)[0].table_pa().unwrap();
            let pt = table(&host, pd)[0].table_pa().unwrap();
            let present: Vec<usize> = leaves(&host, pt)
                .iter()
                .enumerate()
                .filter(|(_, l)| l.is_present())
                .map(|(i, _)| i)
                .collect();
            assert_eq!(present, vec![1, 4]);
        }
    }

    #[test]
    fn scenario_c_fault_driven_map() {
        let (host, mut ept) = initialized(&[]);
        let before = snapshot(&host, &ept).0.len();
        assert_eq!(before, 1); // APIC only

        ept.handle_violation(
            &host,
            Gpa::new(0x7000).unwrap(),
            EptViolationQualification::from_bits_truncate(0),
        )
        .expect("missing translation must be mapped");

        let (pages, _) = snapshot(&host, &ept);
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().any(|&(gpa, _)| gpa == 0x7000));
        assert_eq!(*host.invept.borrow(), vec![ept.pointer()]);
    }

    #[test]
    fn scenario_d_rights_violation_is_fatal() {
        let (host, mut ept) = initialized(&[(0x7000, 0x8000)]);
        let before = snapshot(&host, &ept);

        // A write to a page whose walked entries granted read but not
        // write: translation exists, rights do not. The identity map never
        // produces this.
        let qualification = EptViolationQualification::DATA_WRITE
            | EptViolationQualification::GPA_READABLE;
        assert_eq!(
            ept.handle_violation(&host, Gpa::new(0x7000).unwrap(), qualification),
            Err(HvError::Fatal(qualification))
        );

        assert_eq!(snapshot(&host, &ept), before, "no mutation on fatal path");
        assert!(host.invept.borrow().is_empty());
    }

    #[test]
    fn read_fault_without_translation_maps() {
        // Qualification 0x1: a data read whose walk found nothing. The
        // rights bits are the AND over walked entries, so "all clear" is
        // what a genuine hole reports even though an access bit is set.
        let (host, mut ept) = initialized(&[]);
        ept.handle_violation(
            &host,
            Gpa::new(0x7000).unwrap(),
            EptViolationQualification::DATA_READ,
        )
        .expect("hole must be mapped regardless of access kind");
        assert_eq!(host.invept.borrow().len(), 1);
    }

    #[test]
    fn scenario_e_allocation_failure_unwinds() {
        // Two ranges under different PDs so initialize needs six tables;
        // fail the fifth.
        let host = StubHost::new(&[(0x1000, 0x3000), (0x4020_0000, 0x4020_1000)]);
        host.fail_at.set(5);
        let mut ept = ExtendedPageTable::empty();
        assert_eq!(ept.initialize(&host), Err(HvError::OutOfResources));

        ept.cleanup(&host);
        assert_eq!(host.outstanding.get(), 0, "every allocation must be freed");
        // Second cleanup is a no-op.
        ept.cleanup(&host);
        assert_eq!(host.outstanding.get(), 0);
    }

    #[test]
    fn cleanup_frees_exactly_what_was_allocated() {
        let (host, mut ept) = initialized(&[(0x0, 0x40_0000)]);
        ept.map_page(&host, Gpa::new(0x12_3456_7000).unwrap())
            .unwrap();
        assert!(host.outstanding.get() > 0);
        ept.cleanup(&host);
        assert_eq!(host.outstanding.get(), 0);
        assert_eq!(ept.pointer(), 0);
    }

    #[test]
    fn map_page_is_idempotent() {
        let (host, mut ept) = initialized(&[]);
        let gpa = Gpa::new(0xcafe_0000).unwrap();
        ept.map_page(&host, gpa).unwrap();
        let after_first = snapshot(&host, &ept);
        let allocated = host.allocated.get();

        ept.map_page(&host, gpa).unwrap();
        assert_eq!(snapshot(&host, &ept), after_first);
        assert_eq!(host.allocated.get(), allocated, "no table churn on remap");
    }

    #[test]
    fn tree_is_well_formed() {
        let (host, mut ept) = initialized(&[(0x0, 0x8000)]);
        for gpa in [0x7fff_f000usize, 0xfee0_1000, 0x8_0000_0000] {
            ept.map_page(&host, Gpa::new(gpa).unwrap()).unwrap();
        }

        let (pages, children) = snapshot(&host, &ept);
        for &(gpa, raw) in &pages {
            let entry = EptPageEntry(raw);
            assert_eq!(entry.flags() & EptPageFlags::FULL, EptPageFlags::FULL);
            assert_eq!(
                entry.flags() & EptPageFlags::MEMORY_TYPE_WRITEBACK,
                EptPageFlags::MEMORY_TYPE_WRITEBACK
            );
            assert_eq!(
                unsafe { entry.page_pa().unwrap().into_usize() },
                gpa,
                "identity mapping must hold"
            );
        }

        // Strict tree: no two parent entries reference the same child.
        let unique: BTreeSet<_> =
            children.iter().map(|pa| unsafe { pa.into_usize() }).collect();
        assert_eq!(unique.len(), children.len());
    }

    #[test]
    fn coverage_is_ranges_plus_apic() {
        let ranges = [(0x0usize, 0x5000usize), (0x1_0000, 0x1_3000)];
        let (host, ept) = initialized(&ranges);

        let expected: BTreeSet<usize> = ranges
            .iter()
            .flat_map(|&(s, e)| (s >> PAGE_SHIFT..e >> PAGE_SHIFT))
            .chain(core::iter::once(0xfee0_0000 >> PAGE_SHIFT))
            .collect();
        let mapped: BTreeSet<usize> = snapshot(&host, &ept)
            .0
            .iter()
            .map(|&(gpa, _)| gpa >> PAGE_SHIFT)
            .collect();
        assert_eq!(mapped, expected);
    }
}
