//! Port-mapped IO vmexit controller.
//!
//! Every `in`/`out` of the guest traps. The port, direction and width come
//! from the exit qualification, so no instruction decoding is needed. The
//! request is forwarded to the [`PioHandler`] registered for the port; ports
//! without a handler, and the string forms `ins`/`outs`, are unhandled.
//!
//! The only device emulated out of the box is the [`Cmos`] RTC/NVRAM pair on
//! ports 0x70/0x71, which a guest kernel probes to size its memory.
use crate::{
    ept::ExtendedPageTable,
    vcpu::{GeneralPurposeRegisters, GenericVCpuState, VmexitResult},
    vmcs::{BasicExitReason, ExitReason, IoDirection, IoQualification},
    VmError,
};
use alloc::{
    boxed::Box,
    collections::btree_map::{BTreeMap, Entry},
    format,
    sync::Arc,
};
use num_enum::TryFromPrimitive;
use spin_lock::SpinLock;

/// Trait that represent handlers for port-mapped devices.
pub trait PioHandler
where
    Self: Send + Sync,
{
    /// handle I/O instructions on the device indicated by the port with the operands included in direction.
    fn handle(
        &self,
        port: u16,
        direction: Direction,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError>;
}

impl<T: PioHandler> PioHandler for Arc<T> {
    fn handle(
        &self,
        port: u16,
        direction: Direction,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError> {
        (**self).handle(port, direction, generic_vcpu_state)
    }
}

/// Direction and the Value of the instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Input byte from I/O port into AL.
    InbAl,
    /// Input word from I/O port into AX.
    InwAx,
    /// Input double word from I/O port into EAX.
    IndEax,
    /// Output a byte (1 byte)
    Outb(u8),
    /// Output a word (2 bytes)
    Outw(u16),
    /// Output a double word (4 bytes)
    Outd(u32),
}

impl Direction {
    fn decode(q: &IoQualification, rax: usize) -> Option<Self> {
        Some(match (q.direction, q.size) {
            (IoDirection::In, 1) => Direction::InbAl,
            (IoDirection::In, 2) => Direction::InwAx,
            (IoDirection::In, 4) => Direction::IndEax,
            (IoDirection::Out, 1) => Direction::Outb(rax as u8),
            (IoDirection::Out, 2) => Direction::Outw(rax as u16),
            (IoDirection::Out, 4) => Direction::Outd(rax as u32),
            _ => return None,
        })
    }

    /// Store the result of an input into the destination register.
    ///
    /// Only the bytes the instruction writes are touched; a 32-bit input
    /// zero-extends into RAX.
    pub fn complete(&self, gprs: &mut GeneralPurposeRegisters, value: u32) {
        match self {
            Direction::InbAl => gprs.rax = (gprs.rax & !0xff) | (value as usize & 0xff),
            Direction::InwAx => gprs.rax = (gprs.rax & !0xffff) | (value as usize & 0xffff),
            Direction::IndEax => gprs.rax = value as usize,
            _ => (),
        }
    }
}

/// Pio vmexit controller.
pub struct Controller {
    pios: BTreeMap<u16, Box<dyn PioHandler>>,
}

impl Controller {
    /// Create a new pio controller.
    pub fn new() -> Self {
        Self {
            pios: BTreeMap::new(),
        }
    }

    /// Insert pio handler to the index.
    ///
    /// Return false if pio handler for index is exists.
    /// Otherwise, return true.
    pub fn register(&mut self, port: u16, pio: impl PioHandler + 'static) -> bool {
        match self.pios.entry(port) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(Box::new(pio));
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
        match &reason {
            ExitReason::BasicExitReason(BasicExitReason::IoInstruction(q)) if !q.string => {
                let direction = match Direction::decode(q, generic_vcpu_state.gprs.rax) {
                    Some(direction) => direction,
                    None => return Err(VmError::HandleVmexitFailed(reason)),
                };
                let pio = match self.pios.get(&q.port) {
                    Some(pio) => pio,
                    None => return Err(VmError::HandleVmexitFailed(reason)),
                };
                pio.handle(q.port, direction, generic_vcpu_state)
                    .and_then(|s| generic_vcpu_state.vmcs.forward_rip().map(|_| s))
            }
            _ => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}

/// CMOS register select port.
pub const IO_RTC: u16 = 0x70;
/// CMOS data port.
pub const IO_RTC_DATA: u16 = 0x71;

/// NVRAM registers describing the memory size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum CmosRegister {
    /// Low byte of base memory size in KiB.
    BaseLo = 0x15,
    /// High byte of base memory size in KiB.
    BaseHi = 0x16,
    /// Low byte of extended memory size in KiB.
    ExtLo = 0x17,
    /// High byte of extended memory size in KiB.
    ExtHi = 0x18,
}

impl CmosRegister {
    /// Value of the register for a guest with `phys_size` bytes of memory.
    pub fn value(&self, phys_size: usize) -> u8 {
        let ext = (phys_size / 1024).saturating_sub(1024);
        match self {
            CmosRegister::BaseLo => (640 & 0xff) as u8,
            CmosRegister::BaseHi => (640 >> 8) as u8,
            CmosRegister::ExtLo => (ext & 0xff) as u8,
            CmosRegister::ExtHi => ((ext >> 8) & 0xff) as u8,
        }
    }
}

/// CMOS/RTC device answering memory-size queries.
///
/// Register it on both [`IO_RTC`] and [`IO_RTC_DATA`] through an [`Arc`] so
/// the two ports share the latch.
#[derive(Default)]
pub struct Cmos {
    latch: SpinLock<u8>,
}

impl Cmos {
    /// Create a new cmos with a cleared latch.
    pub fn new() -> Self {
        Self {
            latch: SpinLock::new(0),
        }
    }
}

impl PioHandler for Cmos {
    fn handle(
        &self,
        port: u16,
        direction: Direction,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError> {
        match (port, direction) {
            (IO_RTC, Direction::Outb(reg)) => {
                *self.latch.lock() = reg;
                Ok(VmexitResult::Ok)
            }
            (IO_RTC_DATA, Direction::InbAl | Direction::InwAx | Direction::IndEax) => {
                let latch = *self.latch.lock();
                let reg = CmosRegister::try_from(latch).map_err(|_| {
                    VmError::ControllerError(Box::new(format!(
                        "unsupported cmos register {:#x}",
                        latch
                    )))
                })?;
                let value = reg.value(generic_vcpu_state.guest.phys_size);
                direction.complete(generic_vcpu_state.gprs, value as u32);
                Ok(VmexitResult::Ok)
            }
            (port, direction) => Err(VmError::ControllerError(Box::new(format!(
                "unsupported cmos access {:?} on port {:#x}",
                direction, port
            )))),
        }
    }
}
