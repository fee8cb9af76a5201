//! Hypercall vmexit controller.
//!
//! A guest requests host services by executing `vmcall` with a call number in
//! RAX and arguments in the other general purpose registers. The controller
//! resolves the registers into a [`Hypercall`] and hands it to a
//! [`HypercallAbi`]; an unknown call number is fatal.
use crate::{
    ept::ExtendedPageTable,
    vcpu::{GenericVCpuState, VmexitResult},
    vmcs::{BasicExitReason, ExitReason},
    VmError,
};
use alloc::boxed::Box;

/// Hypercall vmexit controller.
pub struct Controller<H: HypercallAbi> {
    inner: H,
}

impl<H: HypercallAbi> Controller<H> {
    /// Create a new hypercall controller.
    pub fn new(inner: H) -> Self {
        Self { inner }
    }

    /// The abi behind this controller.
    pub fn inner(&self) -> &H {
        &self.inner
    }
}

impl<H: HypercallAbi> super::VmexitController for Controller<H> {
    fn handle(
        &mut self,
        reason: ExitReason,
        ept: &mut ExtendedPageTable,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError> {
        match &reason {
            ExitReason::BasicExitReason(BasicExitReason::Vmcall) => {
                let hc = H::Call::resolve(generic_vcpu_state)
                    .ok_or(VmError::ControllerError(Box::new("Unknown hypercall")))?;
                if hc.forwards_rip_first() {
                    generic_vcpu_state.vmcs.forward_rip()?;
                    self.inner.handle(hc, ept, generic_vcpu_state)
                } else {
                    self.inner
                        .handle(hc, ept, generic_vcpu_state)
                        .and_then(|r| generic_vcpu_state.vmcs.forward_rip().map(|_| r))
                }
            }
            _ => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}

/// Trait that represent the hypercall abi.
pub trait HypercallAbi
where
    Self: Sync + Send + 'static,
{
    /// Hypercalls that this controller can handle.
    type Call: Hypercall;

    /// Handle the hypercall `hc`.
    fn handle(
        &mut self,
        hc: Self::Call,
        ept: &mut ExtendedPageTable,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError>;
}

/// Trait that represent the enumeration of supported hypercall.
pub trait Hypercall {
    /// Resolve the requested hypercall.
    fn resolve(generic_vcpu_state: &mut GenericVCpuState) -> Option<Self>
    where
        Self: Sized;

    /// Whether rip must move past the `vmcall` before the call is serviced.
    ///
    /// Such calls may switch away from the guest and must not move rip again
    /// once they are done.
    fn forwards_rip_first(&self) -> bool {
        false
    }
}
