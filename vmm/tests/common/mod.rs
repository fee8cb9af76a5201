//! Host-side collaborators for scenario tests.
#![allow(dead_code)]

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};
use vmm::{
    addressing::{Gpa, Hpa, Hva, PAGE_MASK, PAGE_SIZE},
    guest::GuestConfig,
    host::{EnvId, EnvRegistry, EnvType, HostServices, Messaging, Network, SourcePage},
    hypervisor::Hypervisor,
    mm::PageAllocator,
    net::NetError,
    vcpu::{GeneralPurposeRegisters, VirtualCpu},
    vmcs::{Field, RegisterFile},
    VmError,
};

pub const GUEST: EnvId = EnvId(0x1001);
pub const STORAGE: EnvId = EnvId(0x1002);
pub const LAUNCHER: EnvId = EnvId(0x1003);
pub const MIB: usize = 1 << 20;

pub const EXIT_CPUID: u64 = 0xa;
pub const EXIT_HLT: u64 = 0xc;
pub const EXIT_VMCALL: u64 = 0x12;
pub const EXIT_IO: u64 = 0x1e;
pub const EXIT_RDMSR: u64 = 0x1f;
pub const EXIT_WRMSR: u64 = 0x20;
pub const EXIT_EPT_VIOLATION: u64 = 0x30;

/// Page allocator over the test process heap.
///
/// Host physical addresses are the heap addresses themselves.
pub struct HeapPages {
    counts: Mutex<BTreeMap<usize, usize>>,
    budget: Mutex<Option<usize>>,
    allocated: Mutex<usize>,
}

impl HeapPages {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(BTreeMap::new()),
            budget: Mutex::new(None),
            allocated: Mutex::new(0),
        })
    }

    fn layout() -> Layout {
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
    }

    pub fn refcount(&self, pa: Hpa) -> usize {
        let pa = pa.into_usize() & !PAGE_MASK;
        self.counts.lock().unwrap().get(&pa).copied().unwrap_or(0)
    }

    /// Pages currently allocated.
    pub fn live(&self) -> usize {
        self.counts.lock().unwrap().len()
    }

    /// Allocations served so far.
    pub fn allocated(&self) -> usize {
        *self.allocated.lock().unwrap()
    }

    /// Let `n` more allocations succeed, then fail.
    pub fn fail_after(&self, n: usize) {
        *self.budget.lock().unwrap() = Some(n);
    }

    /// Allocate a page owned by the test and fill it with `byte`.
    pub fn filled(&self, byte: u8) -> Hpa {
        let pa = self.alloc_zeroed().unwrap();
        unsafe { std::ptr::write_bytes(pa.into_usize() as *mut u8, byte, PAGE_SIZE) };
        pa
    }

    /// Drop the test's own reference on `pa`.
    pub fn release(&self, pa: Hpa) {
        self.decref(pa);
    }
}

impl PageAllocator for HeapPages {
    fn alloc_zeroed(&self) -> Option<Hpa> {
        if let Some(budget) = self.budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        let ptr = unsafe { alloc_zeroed(Self::layout()) } as usize;
        self.counts.lock().unwrap().insert(ptr, 1);
        *self.allocated.lock().unwrap() += 1;
        Hpa::new(ptr)
    }

    fn incref(&self, pa: Hpa) {
        *self
            .counts
            .lock()
            .unwrap()
            .get_mut(&pa.into_usize())
            .expect("incref on a free page") += 1;
    }

    fn decref(&self, pa: Hpa) {
        let mut counts = self.counts.lock().unwrap();
        let cnt = counts
            .get_mut(&pa.into_usize())
            .expect("reference count underflow");
        *cnt -= 1;
        if *cnt == 0 {
            counts.remove(&pa.into_usize());
            unsafe { dealloc(pa.into_usize() as *mut u8, Self::layout()) };
        }
    }

    fn hva(&self, pa: Hpa) -> Option<Hva> {
        if self
            .counts
            .lock()
            .unwrap()
            .contains_key(&(pa.into_usize() & !PAGE_MASK))
        {
            Hva::new(pa.into_usize())
        } else {
            None
        }
    }
}

impl Drop for HeapPages {
    fn drop(&mut self) {
        for (ptr, _) in std::mem::take(&mut *self.counts.lock().unwrap()) {
            unsafe { dealloc(ptr as *mut u8, Self::layout()) };
        }
    }
}

/// Vmcs backed by a map. Unwritten fields read as zero.
#[derive(Default)]
pub struct Fields(pub BTreeMap<Field, u64>);

impl Fields {
    pub fn get(&self, field: Field) -> u64 {
        self.0.get(&field).copied().unwrap_or(0)
    }

    pub fn set(&mut self, field: Field, v: u64) {
        self.0.insert(field, v);
    }

    /// Record an exit with `reason` caused by an instruction of `len` bytes.
    pub fn exit(&mut self, reason: u64, len: u64) {
        self.set(Field::VmexitReason, reason);
        self.set(Field::VmexitInstructionLength, len);
    }

    pub fn ept_violation(&mut self, gpa: usize) {
        self.exit(EXIT_EPT_VIOLATION, 0);
        self.set(Field::VmexitQualification, 0x181);
        self.set(Field::GuestPhysicalAddr, gpa as u64);
    }

    /// `in`/`out` of `size` bytes on `port`.
    pub fn io(&mut self, port: u16, size: u64, input: bool) {
        self.exit(EXIT_IO, 2);
        let q = ((port as u64) << 16) | (size - 1) | if input { 1 << 3 } else { 0 };
        self.set(Field::VmexitQualification, q);
    }
}

impl RegisterFile for Fields {
    fn read(&self, field: Field) -> Result<u64, VmError> {
        Ok(self.get(field))
    }

    fn write(&mut self, field: Field, v: u64) -> Result<(), VmError> {
        self.set(field, v);
        Ok(())
    }
}

/// One scripted vmexit: sets up the vmcs and the registers the guest exits
/// with.
pub type Step = Box<dyn FnMut(&mut Fields, &mut GeneralPurposeRegisters)>;

/// Wrap a closure into a [`Step`].
pub fn step(f: impl FnMut(&mut Fields, &mut GeneralPurposeRegisters) + 'static) -> Step {
    Box::new(f)
}

/// Virtual cpu replaying a script of vmexits.
///
/// Each entry records the registers and rip the hypervisor resumes the guest
/// with. Entering with an exhausted script fails the entry.
#[derive(Default)]
pub struct ScriptedCpu {
    pub vmcs: Fields,
    pub script: VecDeque<Step>,
    pub entries: Vec<(GeneralPurposeRegisters, u64)>,
}

impl ScriptedCpu {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            script: steps.into(),
            ..Default::default()
        }
    }

    pub fn rip(&self) -> u64 {
        self.vmcs.get(Field::GuestRip)
    }
}

impl VirtualCpu for ScriptedCpu {
    fn enter(&mut self, gprs: &mut GeneralPurposeRegisters) -> Result<(), VmError> {
        self.entries.push((*gprs, self.rip()));
        match self.script.pop_front() {
            Some(mut step) => {
                step(&mut self.vmcs, gprs);
                Ok(())
            }
            None => Err(VmError::ControllerError(Box::new("script exhausted"))),
        }
    }

    fn vmcs(&mut self) -> &mut dyn RegisterFile {
        &mut self.vmcs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub from: EnvId,
    pub to: EnvId,
    pub value: u32,
    pub page: Option<Hpa>,
    pub perm: u32,
}

/// Messaging that records every call.
pub struct Mailbox {
    pub sent: Mutex<Vec<Sent>>,
    pub received: Mutex<Vec<(EnvId, Option<Gpa>)>>,
    pub send_result: Mutex<i64>,
}

impl Mailbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            send_result: Mutex::new(0),
        })
    }
}

impl Messaging for Mailbox {
    fn try_send(&self, from: EnvId, to: EnvId, value: u32, page: Option<Hpa>, perm: u32) -> i64 {
        self.sent.lock().unwrap().push(Sent {
            from,
            to,
            value,
            page,
            perm,
        });
        *self.send_result.lock().unwrap()
    }

    fn recv(&self, receiver: EnvId, dst: Option<Gpa>) -> i64 {
        self.received.lock().unwrap().push((receiver, dst));
        0
    }
}

/// Network interface with an inspectable wire.
pub struct Nic {
    pub transmitted: Mutex<Vec<Vec<u8>>>,
    pub inbound: Mutex<VecDeque<Vec<u8>>>,
}

impl Nic {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transmitted: Mutex::new(Vec::new()),
            inbound: Mutex::new(VecDeque::new()),
        })
    }
}

impl Network for Nic {
    fn transmit(&self, buf: &[u8]) -> Result<(), NetError> {
        self.transmitted.lock().unwrap().push(buf.to_vec());
        Ok(())
    }

    fn receive(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        let packet = self.inbound.lock().unwrap().pop_front().ok_or(NetError::Empty)?;
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }
}

/// Environment table.
pub struct Registry {
    pub envs: Mutex<BTreeMap<EnvId, EnvType>>,
    pub pages: Mutex<BTreeMap<(EnvId, usize), SourcePage>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        let mut envs = BTreeMap::new();
        envs.insert(GUEST, EnvType::Guest);
        envs.insert(STORAGE, EnvType::Storage);
        envs.insert(LAUNCHER, EnvType::User);
        Arc::new(Self {
            envs: Mutex::new(envs),
            pages: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn add_page(&self, env: EnvId, va: usize, pa: Hpa, writable: bool) {
        self.pages
            .lock()
            .unwrap()
            .insert((env, va), SourcePage { pa, writable });
    }
}

impl EnvRegistry for Registry {
    fn env_type(&self, id: EnvId) -> Option<EnvType> {
        self.envs.lock().unwrap().get(&id).copied()
    }

    fn source_page(&self, env: EnvId, va: usize) -> Option<SourcePage> {
        self.pages.lock().unwrap().get(&(env, va)).copied()
    }

    fn find(&self, ty: EnvType) -> Option<EnvId> {
        self.envs
            .lock()
            .unwrap()
            .iter()
            .find(|(_, t)| **t == ty)
            .map(|(id, _)| *id)
    }
}

/// A hypervisor and handles on everything it talks to.
pub struct Host {
    pub pages: Arc<HeapPages>,
    pub mailbox: Arc<Mailbox>,
    pub nic: Arc<Nic>,
    pub registry: Arc<Registry>,
    pub hv: Hypervisor,
}

impl Host {
    pub fn new() -> Self {
        let pages = HeapPages::new();
        let mailbox = Mailbox::new();
        let nic = Nic::new();
        let registry = Registry::new();
        let services = HostServices {
            registry: registry.clone(),
            messaging: mailbox.clone(),
            network: nic.clone(),
        };
        let hv = Hypervisor::new(pages.clone(), services);
        Self {
            pages,
            mailbox,
            nic,
            registry,
            hv,
        }
    }

    /// A runnable 64 MiB guest with nothing mapped.
    pub fn runnable_guest(&self, config: GuestConfig) -> EnvId {
        self.hv.create_guest(GUEST, config).unwrap();
        let pa = self.pages.filled(0);
        self.registry.add_page(LAUNCHER, 0x40_0000, pa, true);
        self.hv
            .map_region(LAUNCHER, 0x40_0000, GUEST, 0x7000, vmm::ept::Permission::FULL)
            .unwrap();
        self.pages.release(pa);
        self.hv.set_runnable(GUEST).unwrap();
        GUEST
    }
}

/// Step exiting with a vmcall.
pub fn vmcall(
    rax: usize,
    rdx: usize,
    rcx: usize,
    rbx: usize,
    rdi: usize,
) -> Step {
    step(move |vmcs, gprs| {
        vmcs.exit(EXIT_VMCALL, 3);
        gprs.rax = rax;
        gprs.rdx = rdx;
        gprs.rcx = rcx;
        gprs.rbx = rbx;
        gprs.rdi = rdi;
    })
}

/// Step that yields: a NETRECV on an empty ring.
pub fn idle() -> Step {
    vmcall(8, 0x20_0000, 0, 0, 0)
}
