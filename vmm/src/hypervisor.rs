//! Guest lifecycle.
//!
//! The [`Hypervisor`] is the single entry point the host kernel uses: the
//! launcher's system calls create and stage guests through it, the scheduler
//! runs them, and the trap layer hands it every vmexit.
//!
//! A guest moves through
//!
//! ```text
//! Created -> Staged -> Runnable -> Running -> Destroyed
//!                         ^           |
//!                         +-- yield --+
//! ```
//!
//! Any exit the controllers cannot handle is fatal: the guest is torn down on
//! the spot and every page it held is released.
use crate::{
    addressing::{Gpa, PAGE_SIZE},
    ept::{Frame, Permission},
    guest::{Guest, GuestConfig, GuestState},
    host::{EnvId, EnvType, HostServices},
    loader::{self, BootImage},
    mm::PageAllocator,
    net::RxProducer,
    vcpu::{GeneralPurposeRegisters, VirtualCpu, VmexitResult},
    vmcs::{Field, RegisterFile},
    Error, VmError,
};
use alloc::{collections::BTreeMap, sync::Arc};
use spin_lock::SpinLock;

/// How a guest left the cpu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The exit was handled; enter the guest again.
    Resume,
    /// The guest waits for something and is runnable again.
    Yield,
    /// The guest hit a fatal exit and no longer exists.
    Destroyed,
}

/// Owner of every guest on this machine.
pub struct Hypervisor {
    allocator: Arc<dyn PageAllocator>,
    services: HostServices,
    guests: SpinLock<BTreeMap<EnvId, Guest>>,
}

impl Hypervisor {
    /// Create a hypervisor over the host's page allocator and services.
    pub fn new(allocator: Arc<dyn PageAllocator>, services: HostServices) -> Self {
        Self {
            allocator,
            services,
            guests: SpinLock::new(BTreeMap::new()),
        }
    }

    fn expect_guest_env(&self, id: EnvId) -> Result<(), Error> {
        match self.services.registry.env_type(id) {
            Some(EnvType::Guest) => Ok(()),
            _ => Err(Error::BadEnvironment),
        }
    }

    // A running guest is taken out of the table so no lock is held while it
    // executes or while its exits call into host services.
    fn checkout(&self, id: EnvId) -> Result<Guest, Error> {
        self.guests.lock().remove(&id).ok_or(Error::BadEnvironment)
    }

    fn checkin(&self, guest: Guest) {
        self.guests.lock().insert(guest.info().id, guest);
    }

    fn with_guest_mut<R>(
        &self,
        id: EnvId,
        f: impl FnOnce(&mut Guest) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut guests = self.guests.lock();
        let guest = guests.get_mut(&id).ok_or(Error::BadEnvironment)?;
        f(guest)
    }

    /// Inspect guest `id`.
    pub fn with_guest<R>(&self, id: EnvId, f: impl FnOnce(&Guest) -> R) -> Option<R> {
        self.guests.lock().get(&id).map(f)
    }

    /// Producing end of guest `id`'s shadow receive ring.
    pub fn rx_producer(&self, id: EnvId) -> Option<RxProducer> {
        self.with_guest(id, |guest| guest.rx_producer().clone())
    }

    /// Turn the guest environment `id` into a guest.
    pub fn create_guest(&self, id: EnvId, config: GuestConfig) -> Result<(), Error> {
        self.expect_guest_env(id)?;
        if self.guests.lock().contains_key(&id) {
            return Err(Error::InvalidArgument);
        }
        let guest = Guest::new(id, &config, self.allocator.clone(), self.services.clone())?;
        log::info!(
            "[{:?}] guest created: {:#x} bytes, entry {:?}, {} pages prefaulted",
            id,
            guest.info().phys_size,
            guest.info().entry,
            guest.ept().leaf_count()
        );
        self.checkin(guest);
        Ok(())
    }

    /// Map the page at `src_addr` of environment `src_env` at `gpa` of
    /// `guest`, replacing any existing mapping.
    pub fn map_region(
        &self,
        src_env: EnvId,
        src_addr: usize,
        guest: EnvId,
        gpa: usize,
        perm: Permission,
    ) -> Result<(), Error> {
        self.services
            .registry
            .env_type(src_env)
            .ok_or(Error::BadEnvironment)?;
        self.expect_guest_env(guest)?;
        if src_addr % PAGE_SIZE != 0 || gpa % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        self.with_guest_mut(guest, |guest| {
            match gpa.checked_add(PAGE_SIZE) {
                Some(end) if end <= guest.info().phys_size => (),
                _ => return Err(Error::InvalidArgument),
            }
            let src = self
                .services
                .registry
                .source_page(src_env, src_addr)
                .ok_or(Error::InvalidArgument)?;
            if perm.contains(Permission::WRITE) && !src.writable {
                return Err(Error::InvalidArgument);
            }
            let gpa = Gpa::new(gpa).ok_or(Error::InvalidArgument)?;
            guest.ept.map(gpa, Frame::Page(src.pa), perm, true)?;
            if guest.state == GuestState::Created {
                guest.state = GuestState::Staged;
            }
            Ok(())
        })
    }

    /// Load the `kernel` and `boot` sector images into `guest`.
    pub fn stage_image(
        &self,
        guest: EnvId,
        kernel: &dyn BootImage,
        boot: &dyn BootImage,
    ) -> Result<(), Error> {
        self.with_guest_mut(guest, |guest| {
            if !matches!(guest.state, GuestState::Created | GuestState::Staged) {
                return Err(Error::InvalidArgument);
            }
            let (phys_size, entry) = (guest.info().phys_size, guest.info().entry);
            loader::load_kernel(&mut guest.ept, phys_size, kernel)?;
            loader::load_boot_sector(&mut guest.ept, phys_size, entry, boot)?;
            guest.state = GuestState::Staged;
            log::info!(
                "[{:?}] guest staged: {} pages",
                guest.info().id,
                guest.ept().leaf_count()
            );
            Ok(())
        })
    }

    /// Release a staged guest to the scheduler.
    pub fn set_runnable(&self, guest: EnvId) -> Result<(), Error> {
        self.with_guest_mut(guest, |guest| match guest.state {
            GuestState::Staged => {
                guest.state = GuestState::Runnable;
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        })
    }

    /// Run guest `id` on `cpu` until it yields or dies.
    pub fn run(&self, id: EnvId, cpu: &mut dyn VirtualCpu) -> Result<Exit, Error> {
        let mut guest = self.checkout(id)?;
        if guest.state != GuestState::Runnable {
            self.checkin(guest);
            return Err(Error::InvalidArgument);
        }
        guest.state = GuestState::Running;

        let r = Self::prepare(&mut guest, cpu.vmcs()).and_then(|_| loop {
            cpu.enter(&mut guest.gprs)?;
            match guest.handle_exit(cpu.vmcs())? {
                VmexitResult::Ok => continue,
                VmexitResult::Yield => break Ok(()),
            }
        });
        match r {
            Ok(()) => {
                guest.state = GuestState::Runnable;
                self.checkin(guest);
                Ok(Exit::Yield)
            }
            Err(e) => {
                Self::fatal(guest, cpu.vmcs(), e);
                Ok(Exit::Destroyed)
            }
        }
    }

    fn prepare(guest: &mut Guest, vmcs: &mut dyn RegisterFile) -> Result<(), VmError> {
        vmcs.write(Field::Eptptr, guest.ept().eptp())?;
        if !guest.launched {
            vmcs.write(Field::GuestRip, guest.info().entry.into_usize() as u64)?;
            guest.launched = true;
        }
        Ok(())
    }

    /// Handle one vmexit of guest `id`.
    ///
    /// The guest must have been released to the scheduler. It stays Running
    /// until it yields. `gprs` holds the guest registers saved at the exit and is updated with
    /// the registers to resume with.
    pub fn dispatch(
        &self,
        id: EnvId,
        vmcs: &mut dyn RegisterFile,
        gprs: &mut GeneralPurposeRegisters,
    ) -> Result<Exit, Error> {
        let mut guest = self.checkout(id)?;
        if !matches!(guest.state, GuestState::Runnable | GuestState::Running) {
            self.checkin(guest);
            return Err(Error::InvalidArgument);
        }
        guest.state = GuestState::Running;
        guest.gprs = *gprs;
        match guest.handle_exit(vmcs) {
            Ok(r) => {
                *gprs = guest.gprs;
                let exit = match r {
                    VmexitResult::Ok => Exit::Resume,
                    VmexitResult::Yield => {
                        guest.state = GuestState::Runnable;
                        Exit::Yield
                    }
                };
                self.checkin(guest);
                Ok(exit)
            }
            Err(e) => {
                Self::fatal(guest, vmcs, e);
                Ok(Exit::Destroyed)
            }
        }
    }

    fn fatal(guest: Guest, vmcs: &mut dyn RegisterFile, e: VmError) {
        let rip = vmcs.read(Field::GuestRip).unwrap_or(0);
        match &e {
            VmError::HandleVmexitFailed(reason) => log::warn!(
                "[{:?}] unhandled vmexit {:?} at rip {:#x}",
                guest.info().id,
                reason,
                rip
            ),
            e => log::warn!(
                "[{:?}] vmexit failed at rip {:#x}: {:?}",
                guest.info().id,
                rip,
                e
            ),
        }
        Self::teardown(guest);
    }

    /// Destroy guest `id` and release all of its memory.
    pub fn destroy(&self, id: EnvId) -> Result<(), Error> {
        let guest = self.checkout(id)?;
        Self::teardown(guest);
        Ok(())
    }

    fn teardown(mut guest: Guest) {
        let pages = guest.ept().leaf_count();
        guest.ept.unmap_all();
        guest.state = GuestState::Destroyed;
        log::info!(
            "[{:?}] guest destroyed, {} pages released",
            guest.info().id,
            pages
        );
    }
}
