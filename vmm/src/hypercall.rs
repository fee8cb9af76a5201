//! Hypercall bridge.
//!
//! The paravirtual interface a guest kernel uses to reach host services:
//!
//! | rax | call    | arguments                                       |
//! |-----|---------|-------------------------------------------------|
//! | 1   | MBMAP   |                                                 |
//! | 2   | IPCSEND | rdx = dest, rcx = value, rbx = page, rdi = perm |
//! | 3   | IPCRECV | rdx = page                                      |
//! | 7   | NETSEND | rdx = buffer, rcx = length                      |
//! | 8   | NETRECV | rdx = buffer                                    |
//!
//! Results come back in RAX, except MBMAP which answers in RBX. Guest
//! addresses are guest physical addresses translated through the guest's
//! EPT.
use crate::{
    addressing::Gpa,
    ept::{ExtendedPageTable, Frame, Permission},
    host::{EnvId, EnvType, HostServices, E_IPC_NOT_RECV},
    mm::Page,
    multiboot::{self, MULTIBOOT_MAP_ADDR},
    net::{self, RxConsumer, RxProducer, PACKET_SIZE},
    probe::Probe,
    vcpu::{GenericVCpuState, VmexitResult},
    vmexits::hypercall,
    Error, VmError,
};
use alloc::boxed::Box;
use num_enum::TryFromPrimitive;

/// Hypercall numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u64)]
pub enum HypercallNumber {
    /// Query the memory map.
    MbMap = 1,
    /// Send a message.
    IpcSend = 2,
    /// Receive a message.
    IpcRecv = 3,
    /// Transmit a packet.
    NetSend = 7,
    /// Receive a packet.
    NetRecv = 8,
}

/// Supported hypercalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hypercall {
    /// Build the multiboot memory map and return its address in rbx.
    MbMap,
    /// Send `value` and optionally the page at `page` to `to`.
    IpcSend {
        /// Destination environment. Provides on rdx.
        to: i32,
        /// Value. Provides on rcx.
        value: u32,
        /// Guest physical address of the page to send. Provides on rbx.
        page: usize,
        /// Permission of the page. Provides on rdi.
        perm: u32,
    },
    /// Wait for a message.
    IpcRecv {
        /// Guest physical address to receive a page at. Provides on rdx.
        dst: usize,
    },
    /// Transmit a packet.
    NetSend {
        /// Guest physical address of the packet. Provides on rdx.
        buf: usize,
        /// Length of the packet. Provides on rcx.
        len: usize,
    },
    /// Receive a packet.
    NetRecv {
        /// Guest physical address of the buffer. Provides on rdx.
        buf: usize,
    },
}

impl hypercall::Hypercall for Hypercall {
    fn resolve(GenericVCpuState { gprs, .. }: &mut GenericVCpuState) -> Option<Self> {
        Some(match HypercallNumber::try_from(gprs.rax as u64).ok()? {
            HypercallNumber::MbMap => Hypercall::MbMap,
            HypercallNumber::IpcSend => Hypercall::IpcSend {
                to: gprs.rdx as i32,
                value: gprs.rcx as u32,
                page: gprs.rbx,
                perm: gprs.rdi as u32,
            },
            HypercallNumber::IpcRecv => Hypercall::IpcRecv { dst: gprs.rdx },
            HypercallNumber::NetSend => Hypercall::NetSend {
                buf: gprs.rdx,
                len: gprs.rcx,
            },
            HypercallNumber::NetRecv => Hypercall::NetRecv { buf: gprs.rdx },
        })
    }

    fn forwards_rip_first(&self) -> bool {
        // The receive may switch away and come back through a fresh vmentry.
        matches!(self, Hypercall::IpcRecv { .. })
    }
}

/// Hypercall context of one guest.
pub struct HypercallCtx {
    services: HostServices,
    rx_producer: RxProducer,
    rx: RxConsumer,
    storage_sentinel: i32,
}

impl HypercallCtx {
    /// Create a new context over the guest's shadow receive ring.
    pub fn new(
        services: HostServices,
        rx_producer: RxProducer,
        rx: RxConsumer,
        storage_sentinel: i32,
    ) -> Self {
        Self {
            services,
            rx_producer,
            rx,
            storage_sentinel,
        }
    }

    /// Producing end of the guest's shadow receive ring.
    pub fn rx_producer(&self) -> &RxProducer {
        &self.rx_producer
    }

    fn resolve_destination(&self, to: i32) -> EnvId {
        if to == self.storage_sentinel {
            if let Some(id) = self.services.registry.find(EnvType::Storage) {
                return id;
            }
        }
        EnvId(to)
    }
}

impl hypercall::HypercallAbi for HypercallCtx {
    type Call = Hypercall;

    fn handle(
        &mut self,
        hc: Self::Call,
        ept: &mut ExtendedPageTable,
        GenericVCpuState { gprs, guest, .. }: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError> {
        let invalid = Error::InvalidArgument.errno();
        match hc {
            Hypercall::MbMap => {
                let bytes = multiboot::encode(guest.phys_size);
                let mut page = Page::new(ept.allocator())
                    .ok_or_else(|| VmError::ControllerError(Box::new("out of memory")))?;
                page.inner_mut()[..bytes.len()].copy_from_slice(&bytes);
                let gpa = Gpa::new(MULTIBOOT_MAP_ADDR)
                    .ok_or_else(|| VmError::ControllerError(Box::new("bad multiboot address")))?;
                ept.map(gpa, Frame::Page(page.pa()), Permission::FULL, true)?;
                gprs.rbx = MULTIBOOT_MAP_ADDR;
                Ok(VmexitResult::Ok)
            }
            Hypercall::IpcSend {
                to,
                value,
                page,
                perm,
            } => {
                let to = self.resolve_destination(to);
                let page = if page >= guest.phys_size {
                    None
                } else {
                    match Gpa::new(page)
                        .filter(|gpa| gpa.is_aligned())
                        .and_then(|gpa| ept.gpa2hpa(gpa))
                    {
                        Some(pa) => Some(pa),
                        None => {
                            gprs.rax = invalid as usize;
                            return Ok(VmexitResult::Ok);
                        }
                    }
                };
                let r = self
                    .services
                    .messaging
                    .try_send(guest.id, to, value, page, perm);
                gprs.rax = r as usize;
                if r == E_IPC_NOT_RECV {
                    Ok(VmexitResult::Yield)
                } else {
                    Ok(VmexitResult::Ok)
                }
            }
            Hypercall::IpcRecv { dst } => {
                let dst = if dst < guest.phys_size {
                    Gpa::new(dst)
                } else {
                    None
                };
                gprs.rax = self.services.messaging.recv(guest.id, dst) as usize;
                Ok(VmexitResult::Ok)
            }
            Hypercall::NetSend { buf, len } => {
                if len > PACKET_SIZE {
                    gprs.rax = net::NetError::TooLong.errno() as usize;
                    return Ok(VmexitResult::Ok);
                }
                let mut packet = [0u8; PACKET_SIZE];
                let packet = &mut packet[..len];
                let copied = Gpa::new(buf).and_then(|gpa| ept.read_guest(gpa, packet));
                gprs.rax = match copied {
                    None => invalid as usize,
                    Some(()) => match self.services.network.transmit(packet) {
                        Ok(()) => 0,
                        Err(e) => e.errno() as usize,
                    },
                };
                Ok(VmexitResult::Ok)
            }
            Hypercall::NetRecv { buf } => {
                net::drain(self.services.network.as_ref(), &self.rx_producer);
                let gpa = match Gpa::new(buf) {
                    Some(gpa) => gpa,
                    None => {
                        gprs.rax = invalid as usize;
                        return Ok(VmexitResult::Ok);
                    }
                };
                match self
                    .rx
                    .consume(|packet| ept.write_guest(gpa, packet).map(|_| packet.len()))
                {
                    Ok(Some(len)) => {
                        gprs.rax = len;
                        Ok(VmexitResult::Ok)
                    }
                    Ok(None) => {
                        gprs.rax = invalid as usize;
                        Ok(VmexitResult::Ok)
                    }
                    Err(_) => {
                        gprs.rax = 0;
                        Ok(VmexitResult::Yield)
                    }
                }
            }
        }
    }
}
