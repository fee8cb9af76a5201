//! Guest descriptor.
//!
//! A guest is a host environment whose code runs in VMX non-root mode. Its
//! descriptor carries the configuration the launcher chose at creation, the
//! extended page table, the saved register image and the chain of vmexit
//! controllers that emulate its intercepted operations.
use crate::{
    addressing::{Gpa, PAGE_SIZE},
    ept::ExtendedPageTable,
    host::{EnvId, HostServices},
    hypercall::HypercallCtx,
    mm::PageAllocator,
    net::{ClearSlot, RxProducer, ShadowRing},
    vcpu::{GeneralPurposeRegisters, GenericVCpuState, VmexitResult},
    vmcs::RegisterFile,
    vmexits::{self, cpuid, ept, hypercall, msr, pio, VmexitController},
    Error, VmError,
};
use alloc::{collections::BTreeMap, sync::Arc};

/// Guest physical address the boot sector is loaded at and executed from.
pub const DEFAULT_ENTRY: usize = 0x7000;
/// Environment id a guest uses to address the storage service.
pub const DEFAULT_STORAGE_SENTINEL: i32 = 1;

/// Configuration of a guest to create.
///
/// ```ignore
/// let config = GuestConfig::new(64 << 20)
///     .prefault(true)
///     .rx_clear(ClearSlot::Fixed(0));
/// ```
#[derive(Debug, Clone)]
pub struct GuestConfig {
    phys_size: usize,
    entry: usize,
    prefault: bool,
    rx_clear: ClearSlot,
    storage_sentinel: i32,
}

impl GuestConfig {
    /// Configuration of a guest with `phys_size` bytes of physical memory.
    pub fn new(phys_size: usize) -> Self {
        Self {
            phys_size,
            entry: DEFAULT_ENTRY,
            prefault: false,
            rx_clear: ClearSlot::default(),
            storage_sentinel: DEFAULT_STORAGE_SENTINEL,
        }
    }

    /// Set the guest physical address execution starts at.
    #[inline]
    pub fn entry(mut self, entry: usize) -> Self {
        self.entry = entry;
        self
    }

    /// Back every RAM page at creation instead of on first touch.
    #[inline]
    pub fn prefault(mut self, en: bool) -> Self {
        self.prefault = en;
        self
    }

    /// Choose the receive descriptor reset after each NETRECV.
    #[inline]
    pub fn rx_clear(mut self, clear: ClearSlot) -> Self {
        self.rx_clear = clear;
        self
    }

    /// Choose the destination id that stands for the storage service.
    #[inline]
    pub fn storage_sentinel(mut self, id: i32) -> Self {
        self.storage_sentinel = id;
        self
    }

    fn validate(&self) -> Result<Gpa, Error> {
        if self.phys_size == 0
            || self.phys_size % PAGE_SIZE != 0
            || self.phys_size <= ept::HIGH_MEMORY_BASE
            || self.entry >= self.phys_size
        {
            return Err(Error::InvalidArgument);
        }
        Gpa::new(self.entry).ok_or(Error::InvalidArgument)
    }
}

/// Read-only facts about a guest, plus its MSR shadow table.
#[derive(Debug)]
pub struct GuestInfo {
    /// Environment of the guest.
    pub id: EnvId,
    /// Bytes of guest physical memory.
    pub phys_size: usize,
    /// Where execution starts.
    pub entry: Gpa,
    msrs: BTreeMap<u32, u64>,
}

impl GuestInfo {
    pub(crate) fn new(id: EnvId, phys_size: usize, entry: Gpa) -> Self {
        let mut msrs = BTreeMap::new();
        msrs.insert(msr::IA32_EFER, 0);
        Self {
            id,
            phys_size,
            entry,
            msrs,
        }
    }

    /// Shadowed value of the MSR `index`.
    pub fn msr(&self, index: u32) -> Option<u64> {
        self.msrs.get(&index).copied()
    }

    /// Update the shadowed value of the MSR `index`.
    pub fn set_msr(&mut self, index: u32, value: u64) {
        self.msrs.insert(index, value);
    }
}

/// Lifecycle of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestState {
    /// Exists but holds no memory yet.
    Created,
    /// Some memory is staged; not yet released to the scheduler.
    Staged,
    /// May be entered.
    Runnable,
    /// Currently executing on a cpu.
    Running,
    /// Torn down.
    Destroyed,
}

/// The controller chain every guest runs with.
///
/// EPT faults are tried first since they are by far the most frequent exit.
pub type Controllers = (
    ept::Controller,
    (
        cpuid::Controller,
        (
            msr::Controller,
            (
                pio::Controller,
                (hypercall::Controller<HypercallCtx>, ()),
            ),
        ),
    ),
);

fn controllers(services: HostServices, config: &GuestConfig) -> Controllers {
    let mut msrs = msr::Controller::new();
    msrs.insert(msr::IA32_EFER, msr::Efer);

    let mut pios = pio::Controller::new();
    let cmos = Arc::new(pio::Cmos::new());
    pios.register(pio::IO_RTC, cmos.clone());
    pios.register(pio::IO_RTC_DATA, cmos);

    let (producer, consumer) = ShadowRing::channel(config.rx_clear);
    let hypercalls = hypercall::Controller::new(HypercallCtx::new(
        services,
        producer,
        consumer,
        config.storage_sentinel,
    ));

    (
        ept::Controller::new(),
        (
            cpuid::Controller::new(),
            (msrs, (pios, (hypercalls, ()))),
        ),
    )
}

/// A guest kernel and everything the hypervisor keeps for it.
pub struct Guest {
    info: GuestInfo,
    pub(crate) ept: ExtendedPageTable,
    pub(crate) state: GuestState,
    pub(crate) gprs: GeneralPurposeRegisters,
    pub(crate) launched: bool,
    controllers: Controllers,
}

impl Guest {
    /// Create the descriptor of guest `id`.
    ///
    /// The guest starts with an empty table, or with all of its RAM backed
    /// when the configuration asks for it.
    pub fn new(
        id: EnvId,
        config: &GuestConfig,
        allocator: Arc<dyn PageAllocator>,
        services: HostServices,
    ) -> Result<Self, Error> {
        let entry = config.validate()?;
        let mut ept = ExtendedPageTable::new(allocator)?;
        if config.prefault {
            vmexits::ept::prefault(&mut ept, config.phys_size)?;
        }
        Ok(Self {
            info: GuestInfo::new(id, config.phys_size, entry),
            ept,
            state: GuestState::Created,
            gprs: GeneralPurposeRegisters::default(),
            launched: false,
            controllers: controllers(services, config),
        })
    }

    /// Facts about this guest.
    #[inline]
    pub fn info(&self) -> &GuestInfo {
        &self.info
    }

    /// Lifecycle state.
    #[inline]
    pub fn state(&self) -> GuestState {
        self.state
    }

    /// The guest's extended page table.
    #[inline]
    pub fn ept(&self) -> &ExtendedPageTable {
        &self.ept
    }

    /// Saved guest registers.
    #[inline]
    pub fn gprs(&self) -> &GeneralPurposeRegisters {
        &self.gprs
    }

    /// Producing end of the guest's shadow receive ring.
    pub fn rx_producer(&self) -> &RxProducer {
        let (_, (_, (_, (_, (hypercalls, _))))) = &self.controllers;
        hypercalls.inner().rx_producer()
    }

    /// Run the exit recorded in `vmcs` through the controller chain.
    pub fn handle_exit(&mut self, vmcs: &mut dyn RegisterFile) -> Result<VmexitResult, VmError> {
        let reason = vmcs.exit_reason()?;
        let Self {
            info,
            ept,
            gprs,
            controllers,
            ..
        } = self;
        let mut state = GenericVCpuState {
            vmcs,
            gprs,
            guest: info,
        };
        controllers.handle(reason, ept, &mut state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = GuestConfig::new(64 << 20);
        assert_eq!(config.entry, 0x7000);
        assert!(!config.prefault);
        assert_eq!(config.rx_clear, ClearSlot::Consumed);
        assert_eq!(config.storage_sentinel, 1);
        assert_eq!(config.validate(), Gpa::new(0x7000).ok_or(Error::InvalidArgument));
    }

    #[test]
    fn config_rejects_bad_sizes() {
        assert_eq!(GuestConfig::new(0).validate(), Err(Error::InvalidArgument));
        assert_eq!(
            GuestConfig::new((64 << 20) + 1).validate(),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            GuestConfig::new(1 << 20).validate(),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            GuestConfig::new(64 << 20).entry(64 << 20).validate(),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn efer_is_shadowed() {
        let mut info = GuestInfo::new(EnvId(3), 64 << 20, Gpa::new(0x7000).unwrap());
        assert_eq!(info.msr(msr::IA32_EFER), Some(0));
        assert_eq!(info.msr(0x174), None);
        info.set_msr(msr::IA32_EFER, 0x100);
        assert_eq!(info.msr(msr::IA32_EFER), Some(0x100));
    }
}
