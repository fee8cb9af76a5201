//! Virtual CPU interface.
//!
//! The host kernel owns the actual vmlaunch/vmresume path. This crate sees a
//! vcpu as something that can be entered with a register image and that
//! exposes the VMCS of the guest it runs.
use crate::{guest::GuestInfo, vmcs::RegisterFile, VmError};

/// General purpose registers of the guest.
///
/// Saved on every vmexit and restored on every vmentry.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct GeneralPurposeRegisters {
    pub r15: usize,
    pub r14: usize,
    pub r13: usize,
    pub r12: usize,
    pub r11: usize,
    pub r10: usize,
    pub r9: usize,
    pub r8: usize,
    pub rsi: usize,
    pub rdi: usize,
    pub rbp: usize,
    pub rdx: usize,
    pub rcx: usize,
    pub rbx: usize,
    pub rax: usize,
}

/// A visible state for VCpu.
///
/// Lives for one exit dispatch.
pub struct GenericVCpuState<'a> {
    /// The activated vmcs.
    pub vmcs: &'a mut dyn RegisterFile,
    /// general purpose register of the vcpu.
    pub gprs: &'a mut GeneralPurposeRegisters,
    /// The guest descriptor.
    pub guest: &'a mut GuestInfo,
}

/// Possible result of the Vmexit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmexitResult {
    /// VCpu can be continued.
    Ok,
    /// The guest waits for something; hand the cpu back to the scheduler.
    Yield,
}

/// Entry into VMX non-root operation.
pub trait VirtualCpu {
    /// Load `gprs`, enter the guest and return on the next vmexit with `gprs`
    /// holding the guest registers at the exit.
    fn enter(&mut self, gprs: &mut GeneralPurposeRegisters) -> Result<(), VmError>;

    /// The vmcs of the guest this vcpu runs.
    fn vmcs(&mut self) -> &mut dyn RegisterFile;
}
