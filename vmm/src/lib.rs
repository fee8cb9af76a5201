//! Second-level address translation and trap-and-emulate core of an in-kernel
//! hypervisor.
//!
//! A host kernel uses this crate to run an unmodified guest kernel in VMX
//! non-root mode. The crate owns three tightly coupled parts:
//!
//! * the extended page table manager ([`ept`]) translating guest-physical
//!   addresses to host pages,
//! * the vmexit dispatcher ([`vmexits`], [`hypervisor::Hypervisor::dispatch`])
//!   emulating intercepted guest operations,
//! * the hypercall bridge ([`hypercall`]) exposing host memory map, messaging
//!   and network services to the guest.
//!
//! Everything the host kernel provides (page allocation, environments,
//! messaging, the NIC, the VMCS accessors and the actual vmentry) is consumed
//! through the traits in [`mm`], [`host`], [`vmcs`] and [`vcpu`].
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

pub mod addressing;
pub mod ept;
pub mod guest;
pub mod host;
pub mod hypercall;
pub mod hypervisor;
pub mod loader;
pub mod mm;
pub mod multiboot;
pub mod net;
pub mod probe;
pub mod vcpu;
pub mod vm_control;
pub mod vmcs;
pub mod vmexits;

pub use probe::Probe;

use alloc::boxed::Box;
use ept::EptMappingError;
use vmcs::ExitReason;

/// Possible errors of the vmexit handling path.
///
/// Every variant is fatal to the guest that raised it.
#[derive(Debug)]
pub enum VmError {
    /// No controller in the chain handled the exit.
    HandleVmexitFailed(ExitReason),
    /// A controller recognized the exit but failed to emulate it.
    ControllerError(Box<dyn core::fmt::Debug + Send + Sync>),
    /// Extended page table manipulation failed.
    Ept(EptMappingError),
}

impl From<EptMappingError> for VmError {
    fn from(e: EptMappingError) -> Self {
        VmError::Ept(e)
    }
}

/// Error taxonomy reported to the user-level launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed or out-of-range argument.
    InvalidArgument,
    /// The page allocator is exhausted.
    OutOfMemory,
    /// No mapping exists.
    NotFound,
    /// The environment is unknown or is not a guest.
    BadEnvironment,
    /// The slot already holds a mapping.
    AlreadyMapped,
    /// The kernel image is not a native ELF64 executable.
    NotExecutable,
    /// The boot image could not be read.
    Io,
}

impl Error {
    /// Negative status code handed back to the user-level launcher.
    pub const fn errno(self) -> i64 {
        match self {
            Error::InvalidArgument => -3,
            Error::OutOfMemory => -4,
            Error::NotFound => -21,
            Error::BadEnvironment => -2,
            Error::AlreadyMapped => -3,
            Error::NotExecutable => -14,
            Error::Io => -1,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::InvalidArgument => "invalid argument",
            Error::OutOfMemory => "out of memory",
            Error::NotFound => "no such mapping",
            Error::BadEnvironment => "bad environment",
            Error::AlreadyMapped => "already mapped",
            Error::NotExecutable => "not a native executable",
            Error::Io => "i/o error",
        };
        write!(f, "{} ({})", msg, self.errno())
    }
}

impl From<EptMappingError> for Error {
    fn from(e: EptMappingError) -> Self {
        match e {
            EptMappingError::InvalidArgument => Error::InvalidArgument,
            EptMappingError::OutOfMemory => Error::OutOfMemory,
            EptMappingError::NotFound => Error::NotFound,
            EptMappingError::AlreadyMapped => Error::AlreadyMapped,
        }
    }
}
