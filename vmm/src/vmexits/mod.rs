//! Interface to play with vmexits.
//!
//! Each category of intercepted guest operation has its own controller.
//! Controllers are chained as nested tuples; a controller that does not
//! recognize an exit hands it to the next one by returning
//! [`VmError::HandleVmexitFailed`], and the unit controller at the end of the
//! chain rejects everything.
use crate::{
    ept::ExtendedPageTable,
    vcpu::{GenericVCpuState, VmexitResult},
    vmcs::ExitReason,
    VmError,
};

pub mod cpuid;
pub mod ept;
pub mod hypercall;
pub mod msr;
pub mod pio;

/// Controller that defines action on vmexit.
pub trait VmexitController {
    /// Handle the vmexit on this controller.
    ///
    /// Returns [`VmError::HandleVmexitFailed`] when failed to handle vmexit on this controller.
    fn handle(
        &mut self,
        reason: ExitReason,
        ept: &mut ExtendedPageTable,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError>;
}

impl VmexitController for () {
    fn handle(
        &mut self,
        reason: ExitReason,
        _ept: &mut ExtendedPageTable,
        _generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError> {
        Err(VmError::HandleVmexitFailed(reason))
    }
}

impl<A: VmexitController, B: VmexitController> VmexitController for (A, B) {
    fn handle(
        &mut self,
        reason: ExitReason,
        ept: &mut ExtendedPageTable,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError> {
        let (a, b) = self;
        match a.handle(reason, ept, generic_vcpu_state) {
            Err(VmError::HandleVmexitFailed(reason)) => b.handle(reason, ept, generic_vcpu_state),
            r => r,
        }
    }
}

impl<T: VmexitController + ?Sized> VmexitController for alloc::boxed::Box<T> {
    fn handle(
        &mut self,
        reason: ExitReason,
        ept: &mut ExtendedPageTable,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError> {
        (**self).handle(reason, ept, generic_vcpu_state)
    }
}
