//! Bare-metal x86_64 support for the veil hypervisor.
//!
//! Everything in this crate talks directly to the processor: control
//! registers, MSRs, descriptor tables, segment machinery and the register
//! frames used to capture and replay a processor's execution state. Nothing
//! here knows about VMX control semantics; that lives in the `veil` crate.

#![cfg_attr(not(test), no_std)]

pub mod addressing;
pub mod kprint;
pub mod x86_64;
