//! Model-specific register vmexit controller.
//!
//! RDMSR reads the register selected by ECX into EDX:EAX, WRMSR writes EDX:EAX
//! into it. Every MSR access of the guest traps, and only registers with a
//! handler registered on the [`Controller`] are emulated; anything else is
//! unhandled.
//!
//! The stock handler is [`Efer`], which keeps IA32_EFER in the guest's MSR
//! shadow table and turns on the IA-32e mode guest entry control when the
//! guest enables long mode.
use crate::{
    ept::ExtendedPageTable,
    vcpu::{GenericVCpuState, VmexitResult},
    vm_control::{Efer as EferFlags, VmcsEntryCtl},
    vmcs::{BasicExitReason, ExitReason, Field},
    VmError,
};
use alloc::{
    boxed::Box,
    collections::{btree_map::Entry, BTreeMap},
    format,
};

/// Index of the IA32_EFER MSR.
pub const IA32_EFER: u32 = 0xC000_0080;

/// Trait that represent handlers for MSR registers.
pub trait Msr
where
    Self: Send + Sync,
{
    /// Handler on rdmsr.
    fn rdmsr(&self, index: u32, generic_vcpu_state: &mut GenericVCpuState)
        -> Result<u64, VmError>;
    /// Handler on wrmsr.
    fn wrmsr(
        &mut self,
        index: u32,
        value: u64,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<(), VmError>;
}

/// Msr vmexit controller.
pub struct Controller {
    msrs: BTreeMap<u32, Box<dyn Msr>>,
}

impl Controller {
    /// Create a new msr controller.
    pub fn new() -> Self {
        Self {
            msrs: BTreeMap::new(),
        }
    }

    /// Insert msr handler to the index.
    ///
    /// Return false if msr handler for index is exists.
    /// Otherwise, return true.
    pub fn insert(&mut self, index: u32, msr: impl Msr + 'static) -> bool {
        match self.msrs.entry(index) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(Box::new(msr));
                true
            }
        }
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
        let index = generic_vcpu_state.gprs.rcx as u32;
        match &reason {
            ExitReason::BasicExitReason(BasicExitReason::Rdmsr) => {
                let msr = match self.msrs.get(&index) {
                    Some(msr) => msr,
                    None => return Err(VmError::HandleVmexitFailed(reason)),
                };
                let value = msr.rdmsr(index, generic_vcpu_state)?;
                generic_vcpu_state.gprs.rax = (value & 0xffff_ffff) as usize;
                generic_vcpu_state.gprs.rdx = (value >> 32) as usize;
                generic_vcpu_state.vmcs.forward_rip()?;
                Ok(VmexitResult::Ok)
            }
            ExitReason::BasicExitReason(BasicExitReason::Wrmsr) => {
                let msr = match self.msrs.get_mut(&index) {
                    Some(msr) => msr,
                    None => return Err(VmError::HandleVmexitFailed(reason)),
                };
                let gprs = &generic_vcpu_state.gprs;
                let value = ((gprs.rdx as u64 & 0xffff_ffff) << 32) | (gprs.rax as u64 & 0xffff_ffff);
                msr.wrmsr(index, value, generic_vcpu_state)?;
                generic_vcpu_state.vmcs.forward_rip()?;
                Ok(VmexitResult::Ok)
            }
            _ => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}

/// IA32_EFER backed by the guest MSR shadow table.
pub struct Efer;

impl Msr for Efer {
    fn rdmsr(
        &self,
        index: u32,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<u64, VmError> {
        generic_vcpu_state.guest.msr(index).ok_or_else(|| {
            VmError::ControllerError(Box::new(format!("msr {:#x} is not shadowed", index)))
        })
    }

    fn wrmsr(
        &mut self,
        index: u32,
        value: u64,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<(), VmError> {
        let GenericVCpuState { vmcs, guest, .. } = generic_vcpu_state;
        let current = guest.msr(index).ok_or_else(|| {
            VmError::ControllerError(Box::new(format!("msr {:#x} is not shadowed", index)))
        })?;
        let (current, new) = (
            EferFlags::from_bits_truncate(current),
            EferFlags::from_bits_truncate(value),
        );
        if !current.contains(EferFlags::LME) && new.contains(EferFlags::LME) {
            // Keep the reserved bits as the host configured them.
            let ctls = vmcs.read(Field::VmentryControls)?;
            vmcs.write(
                Field::VmentryControls,
                ctls | VmcsEntryCtl::IA32E_MODE_GUEST.bits() as u64,
            )?;
        }
        guest.set_msr(index, value);
        Ok(())
    }
}
