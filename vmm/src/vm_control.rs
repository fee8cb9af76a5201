//! VM-execution control bits touched by the exit handlers.

bitflags::bitflags! {
    /// Table 24-15. Definitions of VM-Entry Controls.
    pub struct VmcsEntryCtl: u32 {
        /// The logical processor is in IA-32e mode after VM entry.
        ///
        /// Its value is loaded into IA32_EFER.LMA as part of VM entry.
        const IA32E_MODE_GUEST = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Bits of the IA32_EFER MSR.
    pub struct Efer: u64 {
        /// Long mode enable.
        const LME = 1 << 8;
    }
}
