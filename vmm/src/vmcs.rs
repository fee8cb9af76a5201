//! Virtual machine control structure.
//!
//! The hypervisor never touches the VMCS directly. The host kernel hands it a
//! [`RegisterFile`] for the current VMCS, typically a thin wrapper over
//! `vmread`/`vmwrite`, and everything the exit handlers need is expressed in
//! terms of [`Field`]s on it.
use crate::{addressing::Gpa, VmError};

/// Vmcs field.
#[allow(missing_docs)]
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Field {
    // 64bit control fields
    Eptptr = 0x0000201A,
    // 64bit read-only data fields
    GuestPhysicalAddr = 0x00002400,
    // 32bit control fields
    VmentryControls = 0x00004012,
    // 32bit read-only data fields
    VmexitReason = 0x00004402,
    VmexitInstructionLength = 0x0000440C,
    // natural width read-only data fields
    VmexitQualification = 0x00006400,
    // natural width guest-state fields
    GuestRip = 0x0000681E,
}

/// Access to the fields of the current VMCS.
pub trait RegisterFile {
    /// Read a field.
    fn read(&self, field: Field) -> Result<u64, VmError>;
    /// Write a field.
    fn write(&mut self, field: Field, v: u64) -> Result<(), VmError>;

    /// Resolve the exit reason of the activated vmcs.
    fn exit_reason(&self) -> Result<ExitReason, VmError> {
        let reason = self.read(Field::VmexitReason)?;
        match reason {
            reason if reason & 0x20000000 != 0 => Ok(ExitReason::ExitFromVmxRootOperation(
                parse_basic_reason(self, reason & 0xffff)?,
            )),
            reason if reason & 0x80000000 != 0 => Ok(ExitReason::EntryFailure(
                parse_basic_reason(self, reason & 0xffff)?,
            )),
            reason => Ok(ExitReason::BasicExitReason(parse_basic_reason(
                self,
                reason & 0xffff,
            )?)),
        }
    }

    /// Forward the guest rip past the instruction that caused the exit.
    fn forward_rip(&mut self) -> Result<(), VmError> {
        let rip = self.read(Field::GuestRip)? + self.read(Field::VmexitInstructionLength)?;
        self.write(Field::GuestRip, rip)
    }
}

fn parse_basic_reason<R: RegisterFile + ?Sized>(
    regs: &R,
    reason: u64,
) -> Result<BasicExitReason, VmError> {
    Ok(match reason {
        0x0 => BasicExitReason::ExceptionOrNmi,
        0x1 => BasicExitReason::ExternalInt,
        0x2 => BasicExitReason::TripleFault,
        0x7 => BasicExitReason::InterruptWindow,
        0xa => BasicExitReason::Cpuid,
        0xc => BasicExitReason::Hlt,
        0x12 => BasicExitReason::Vmcall,
        0x1c => BasicExitReason::MovCr,
        0x1e => BasicExitReason::IoInstruction(IoQualification::decode(
            regs.read(Field::VmexitQualification)?,
        )),
        0x1f => BasicExitReason::Rdmsr,
        0x20 => BasicExitReason::Wrmsr,
        0x21 => BasicExitReason::EntfailGuestState,
        0x22 => BasicExitReason::EntfailMsrLoading,
        0x28 => BasicExitReason::Pause,
        0x30 => BasicExitReason::EptViolation {
            qualification: EptViolationQualification::from_bits_truncate(
                regs.read(Field::VmexitQualification)?,
            ),
            fault_addr: Gpa::new(regs.read(Field::GuestPhysicalAddr)? as usize),
        },
        0x31 => BasicExitReason::EptMisconfig,
        0x34 => BasicExitReason::VmxPreemptTimer,
        code => BasicExitReason::Unknown(code as u16),
    })
}

/// Basic exit reasons this hypervisor distinguishes.
///
/// See Appendix C of the Intel SDM for the numbering.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicExitReason {
    ExceptionOrNmi,
    ExternalInt,
    TripleFault,
    InterruptWindow,
    Cpuid,
    Hlt,
    Vmcall,
    MovCr,
    /// I/O instruction, decoded from the exit qualification.
    IoInstruction(IoQualification),
    Rdmsr,
    Wrmsr,
    EntfailGuestState,
    EntfailMsrLoading,
    Pause,
    EptViolation {
        qualification: EptViolationQualification,
        fault_addr: Option<Gpa>,
    },
    EptMisconfig,
    VmxPreemptTimer,
    /// Any other reason, with its raw code.
    Unknown(u16),
}

bitflags::bitflags! {
    /// Exit Qualification for EPT Violations
    ///
    /// See Intel Manual volume 3C. Table 28-7. Exit Qualification for EPT Violations
    pub struct EptViolationQualification: u64 {
        /// The access was a data read.
        const READ = 1 << 0;
        /// The access was a data write.
        const WRITE = 1 << 1;
        /// The access was an instruction fetch.
        const FETCH = 1 << 2;
        /// The guest-physical address was readable.
        const READABLE = 1 << 3;
        /// The guest-physical address was writeable.
        const WRITEABLE = 1 << 4;
        /// The guest-physical address was executable.
        const EXECUTABLE = 1 << 5;
        /// The guest linear-address field is valid.
        const LINEAR_VALID = 1 << 7;
        /// The access was to the translation of a linear address.
        const LINEAR_TRANSLATED = 1 << 8;
    }
}

/// Direction of a port I/O access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// `in`: the device produces a value.
    In,
    /// `out`: the guest produces a value.
    Out,
}

/// Exit qualification of an I/O instruction.
///
/// See Table 28-5. Exit Qualification for I/O Instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoQualification {
    /// Port number.
    pub port: u16,
    /// Direction of the access.
    pub direction: IoDirection,
    /// Access width in bytes (1, 2 or 4).
    pub size: u8,
    /// `ins`/`outs` rather than `in`/`out`.
    pub string: bool,
    /// Has a rep prefix.
    pub rep: bool,
}

impl IoQualification {
    /// Decode a raw exit qualification.
    pub const fn decode(qualification: u64) -> Self {
        Self {
            port: (qualification >> 16) as u16,
            direction: if qualification & (1 << 3) != 0 {
                IoDirection::In
            } else {
                IoDirection::Out
            },
            size: (qualification & 7) as u8 + 1,
            string: qualification & (1 << 4) != 0,
            rep: qualification & (1 << 5) != 0,
        }
    }
}

/// Enumeration of vmexit reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exit during the run.
    BasicExitReason(BasicExitReason),
    /// Failed on vmlaunch or vmresume.
    EntryFailure(BasicExitReason),
    /// Exit from vmx root operation.
    ExitFromVmxRootOperation(BasicExitReason),
}

impl ExitReason {
    /// get basic exit reason of the exit reason.
    pub fn get_basic_reason(&self) -> &BasicExitReason {
        match self {
            Self::BasicExitReason(e)
            | Self::EntryFailure(e)
            | Self::ExitFromVmxRootOperation(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn decode_io() {
        // out dx, al with dx = 0x70
        let q = IoQualification::decode(0x0070_0000);
        assert_eq!(q.port, 0x70);
        assert_eq!(q.direction, IoDirection::Out);
        assert_eq!(q.size, 1);

        // in eax, dx with dx = 0x71
        let q = IoQualification::decode(0x0071_000b);
        assert_eq!(q.port, 0x71);
        assert_eq!(q.direction, IoDirection::In);
        assert_eq!(q.size, 4);
    }

    #[test]
    fn ept_violation_reason() {
        let mut regs = Fields::default();
        regs.write(Field::VmexitReason, 0x30).unwrap();
        regs.write(Field::VmexitQualification, 0x182).unwrap();
        regs.write(Field::GuestPhysicalAddr, 0x10_0123).unwrap();
        match *regs.exit_reason().unwrap().get_basic_reason() {
            BasicExitReason::EptViolation {
                qualification,
                fault_addr,
            } => {
                assert!(qualification.contains(EptViolationQualification::WRITE));
                assert_eq!(fault_addr, Gpa::new(0x10_0123));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn entry_failure_bit() {
        let mut regs = Fields::default();
        regs.write(Field::VmexitReason, 0x8000_0021).unwrap();
        assert_eq!(
            regs.exit_reason().unwrap(),
            ExitReason::EntryFailure(BasicExitReason::EntfailGuestState)
        );
    }

    #[test]
    fn forward_rip() {
        let mut regs = Fields::default();
        regs.write(Field::GuestRip, 0x7c00).unwrap();
        regs.write(Field::VmexitInstructionLength, 3).unwrap();
        regs.forward_rip().unwrap();
        assert_eq!(regs.read(Field::GuestRip).unwrap(), 0x7c03);
    }
}
