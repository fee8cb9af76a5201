//! Cpuid vmexit controller.
//!
//! The guest cannot execute cpuid directly. The instruction is replayed on the
//! host and the result is forwarded, except that the VMX feature bit of leaf 1
//! is hidden so the guest never tries to become a hypervisor itself.
use core::arch::x86_64::{CpuidResult, __cpuid_count};
use crate::{
    ept::ExtendedPageTable,
    vcpu::{GenericVCpuState, VmexitResult},
    vmcs::{BasicExitReason, ExitReason},
    VmError,
};

/// Leaf 1 ECX bit reporting VMX support.
pub const CPUID_1_ECX_VMX: u32 = 1 << 5;

/// Source of cpuid results, taking the leaf (eax) and subleaf (ecx).
pub type CpuidSource = fn(u32, u32) -> CpuidResult;

/// Execute cpuid on the current processor.
pub fn host_cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    __cpuid_count(leaf, subleaf)
}

/// Cpuid vmexit controller.
pub struct Controller {
    source: CpuidSource,
}

impl Controller {
    /// Create a new cpuid controller forwarding the host's cpuid.
    pub fn new() -> Self {
        Self::with_source(host_cpuid)
    }

    /// Create a new cpuid controller over another cpuid source.
    pub fn with_source(source: CpuidSource) -> Self {
        Self { source }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl super::VmexitController for Controller {
    fn handle(
        &mut self,
        reason: ExitReason,
        _ept: &mut ExtendedPageTable,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError> {
        match &reason {
            ExitReason::BasicExitReason(BasicExitReason::Cpuid) => {
                let GenericVCpuState { vmcs, gprs, .. } = generic_vcpu_state;
                let leaf = gprs.rax as u32;
                let CpuidResult {
                    eax,
                    ebx,
                    mut ecx,
                    edx,
                } = (self.source)(leaf, gprs.rcx as u32);
                if leaf == 1 {
                    ecx &= !CPUID_1_ECX_VMX;
                }
                gprs.rax = eax as usize;
                gprs.rbx = ebx as usize;
                gprs.rcx = ecx as usize;
                gprs.rdx = edx as usize;
                vmcs.forward_rip()?;
                Ok(VmexitResult::Ok)
            }
            _ => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        addressing::Gpa,
        guest::GuestInfo,
        host::EnvId,
        mm::testing::HostPages,
        vcpu::GeneralPurposeRegisters,
        vmcs::{Field, RegisterFile},
        vmexits::VmexitController,
    };
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Fields(BTreeMap<Field, u64>);

    impl RegisterFile for Fields {
        fn read(&self, field: Field) -> Result<u64, VmError> {
            Ok(self.0.get(&field).copied().unwrap_or(0))
        }
        fn write(&mut self, field: Field, v: u64) -> Result<(), VmError> {
            self.0.insert(field, v);
            Ok(())
        }
    }

    fn all_ones(_: u32, _: u32) -> CpuidResult {
        CpuidResult {
            eax: !0,
            ebx: !0,
            ecx: !0,
            edx: !0,
        }
    }

    fn cpuid(controller: &mut Controller, leaf: usize) -> (GeneralPurposeRegisters, u64) {
        let mut ept = ExtendedPageTable::new(HostPages::new()).unwrap();
        let mut info = GuestInfo::new(EnvId(1), 64 << 20, Gpa::new(0x7000).unwrap());
        let mut vmcs = Fields::default();
        vmcs.write(Field::GuestRip, 0x7000).unwrap();
        vmcs.write(Field::VmexitInstructionLength, 2).unwrap();
        let mut gprs = GeneralPurposeRegisters {
            rax: leaf,
            ..Default::default()
        };
        let mut state = GenericVCpuState {
            vmcs: &mut vmcs,
            gprs: &mut gprs,
            guest: &mut info,
        };
        let reason = ExitReason::BasicExitReason(BasicExitReason::Cpuid);
        assert_eq!(
            controller.handle(reason, &mut ept, &mut state).unwrap(),
            VmexitResult::Ok
        );
        let rip = vmcs.read(Field::GuestRip).unwrap();
        (gprs, rip)
    }

    #[test]
    fn vmx_is_hidden_whatever_the_hardware_says() {
        let mut controller = Controller::with_source(all_ones);
        let (gprs, rip) = cpuid(&mut controller, 1);
        assert_eq!(gprs.rcx as u32, !CPUID_1_ECX_VMX);
        assert_eq!(gprs.rax as u32, !0);
        assert_eq!(gprs.rdx as u32, !0);
        assert_eq!(rip, 0x7002);

        let (gprs, _) = cpuid(&mut controller, 7);
        assert_eq!(gprs.rcx as u32, !0);
    }

    #[test]
    fn entry_failures_are_not_emulated() {
        let mut controller = Controller::with_source(all_ones);
        let mut ept = ExtendedPageTable::new(HostPages::new()).unwrap();
        let mut info = GuestInfo::new(EnvId(1), 64 << 20, Gpa::new(0x7000).unwrap());
        let mut vmcs = Fields::default();
        let mut gprs = GeneralPurposeRegisters::default();
        let mut state = GenericVCpuState {
            vmcs: &mut vmcs,
            gprs: &mut gprs,
            guest: &mut info,
        };
        let reason = ExitReason::EntryFailure(BasicExitReason::Cpuid);
        assert!(matches!(
            controller.handle(reason, &mut ept, &mut state),
            Err(VmError::HandleVmexitFailed(r)) if r == reason
        ));
        assert_eq!(gprs.rcx, 0);
    }
}
