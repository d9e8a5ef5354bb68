//! Veil: a minimal Intel VT-x hypervisor that virtualizes the operating
//! system it is loaded into.
//!
//! After bring-up every logical processor runs in VMX root mode and the OS
//! that loaded the driver keeps executing — unmodified, at near-native speed
//! — as the guest of an identity-mapped virtual machine. Nothing is
//! multiplexed: there is one guest, its physical address space equals the
//! host's, and the only interception beyond what hardware forces is a
//! distinguished CPUID used to tear the whole thing down again.
//!
//! The interesting machinery is in two places:
//!
//! - [`ept`] builds and lazily extends the identity-mapped second-level
//!   translation tree hardware walks on every guest memory access.
//! - [`vp`] performs the per-processor launch dance that captures the live
//!   register file, installs it as both guest and host state, and makes
//!   VMLAUNCH "return" into the guest at the point of capture.
//!
//! The loadable-driver wrapper owns everything OS-shaped: driver entry and
//! unload, fanning handlers out to every processor at elevated priority, the
//! contiguous allocator, and the debug output channel. Its obligations are
//! collected in the [`host::Host`] trait and the extern symbols
//! [`host::KernelHost`] binds to.

#![cfg_attr(not(test), no_std)]

pub mod ept;
pub mod exit;
pub mod host;
pub mod probe;
pub mod state;
pub mod vmcs;
pub mod vmx;
pub mod vp;

pub use host::{Host, KernelHost, MemoryMap};
pub use state::{load, on_load, on_unload, unload};

/// Errors surfaced by the hypervisor core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvError {
    /// Hardware or firmware lacks a capability the hypervisor requires.
    /// Surfaces at load time, before any resource is held.
    Unsupported,
    /// A contiguous allocation failed. Whatever was built so far is torn
    /// down by the cleanup paths.
    OutOfResources,
    /// A VMX instruction reported failure through the flags discipline.
    VmxFail(vmcs::VmInstructionError),
    /// An EPT violation whose qualification does not describe a missing
    /// translation. The identity map never revokes rights, so this is a bug.
    Fatal(ept::EptViolationQualification),
}
