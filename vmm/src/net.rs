//! Shadow receive ring of a guest.
//!
//! The host NIC ring must be drained at the host's pace, not the guest's. Each
//! guest therefore owns a ring of receive descriptors in host memory: the
//! host-side wrapper ([`drain`]) copies packets from the device into it
//! through an [`RxProducer`], and the NETRECV hypercall hands them to the
//! guest one at a time through an [`RxConsumer`].
use crate::host::Network;
use alloc::{sync::Arc, vec::Vec};
use spin_lock::SpinLock;

/// Number of descriptors in a ring.
pub const RING_SIZE: usize = 64;
/// Size of a packet buffer.
pub const PACKET_SIZE: usize = 2048;

/// Errors of the network path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Packet does not fit in a buffer.
    TooLong,
    /// No free descriptor.
    QueueFull,
    /// No packet to receive.
    Empty,
}

impl NetError {
    /// Negative status code handed back to the guest.
    pub const fn errno(self) -> i64 {
        match self {
            NetError::TooLong => -16,
            NetError::QueueFull => -17,
            NetError::Empty => -18,
        }
    }
}

bitflags::bitflags! {
    /// Receive descriptor status.
    pub struct RxStatus: u8 {
        /// Descriptor done.
        const DD = 0x01;
        /// End of packet.
        const EOP = 0x02;
    }
}

/// Receive descriptor and its buffer.
#[derive(Clone)]
pub struct RxDescriptor {
    /// Length of the packet in the buffer.
    pub length: u16,
    /// Status bits.
    pub status: RxStatus,
    /// Packet checksum.
    pub checksum: u16,
    /// Error bits.
    pub errors: u8,
    /// Packet buffer.
    pub buffer: [u8; PACKET_SIZE],
}

impl RxDescriptor {
    const EMPTY: Self = Self {
        length: 0,
        status: RxStatus::empty(),
        checksum: 0,
        errors: 0,
        buffer: [0; PACKET_SIZE],
    };

    fn clear(&mut self) {
        self.length = 0;
        self.status = RxStatus::empty();
        self.checksum = 0;
        self.errors = 0;
    }
}

/// Descriptor reset after the consumer takes a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearSlot {
    /// The descriptor just consumed.
    Consumed,
    /// Always the descriptor at this index.
    Fixed(usize),
}

impl Default for ClearSlot {
    fn default() -> Self {
        ClearSlot::Consumed
    }
}

struct RingState {
    descs: Vec<RxDescriptor>,
    head: usize,
    tail: usize,
    clear: ClearSlot,
}

/// Fixed-capacity ring of receive descriptors.
pub struct ShadowRing {
    state: SpinLock<RingState>,
}

impl ShadowRing {
    /// Create an empty ring and its two ends.
    pub fn channel(clear: ClearSlot) -> (RxProducer, RxConsumer) {
        let ring = Arc::new(ShadowRing {
            state: SpinLock::new(RingState {
                descs: alloc::vec![RxDescriptor::EMPTY; RING_SIZE],
                head: 0,
                tail: 0,
                clear,
            }),
        });
        (RxProducer { ring: ring.clone() }, RxConsumer { ring })
    }

    /// Number of packets waiting.
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state
            .descs
            .iter()
            .filter(|desc| desc.status.contains(RxStatus::DD))
            .count()
    }

    /// Copy of the descriptor at `index`, without its buffer.
    pub fn descriptor(&self, index: usize) -> (u16, RxStatus) {
        let state = self.state.lock();
        let desc = &state.descs[index % RING_SIZE];
        (desc.length, desc.status)
    }
}

/// Producing end of a [`ShadowRing`].
#[derive(Clone)]
pub struct RxProducer {
    ring: Arc<ShadowRing>,
}

impl RxProducer {
    /// Put a packet at the head of the ring.
    pub fn push(&self, packet: &[u8]) -> Result<(), NetError> {
        if packet.len() > PACKET_SIZE {
            return Err(NetError::TooLong);
        }
        let mut guard = self.ring.state.lock();
        let state = &mut *guard;
        let desc = &mut state.descs[state.head];
        if desc.status.contains(RxStatus::DD) {
            return Err(NetError::QueueFull);
        }
        desc.buffer[..packet.len()].copy_from_slice(packet);
        desc.length = packet.len() as u16;
        desc.status = RxStatus::DD | RxStatus::EOP;
        state.head = (state.head + 1) % RING_SIZE;
        Ok(())
    }

    /// The ring this producer feeds.
    pub fn ring(&self) -> &ShadowRing {
        &self.ring
    }
}

/// Consuming end of a [`ShadowRing`].
pub struct RxConsumer {
    ring: Arc<ShadowRing>,
}

impl RxConsumer {
    /// Pass the packet at the tail of the ring to `f`.
    ///
    /// The packet is taken off the ring only if `f` returns `Some`; otherwise
    /// it stays at the tail for the next call.
    pub fn consume<R>(&self, f: impl FnOnce(&[u8]) -> Option<R>) -> Result<Option<R>, NetError> {
        let mut guard = self.ring.state.lock();
        let state = &mut *guard;
        let tail = state.tail;
        let desc = &state.descs[tail];
        if !desc.status.contains(RxStatus::DD) {
            return Err(NetError::Empty);
        }
        let r = match f(&desc.buffer[..desc.length as usize]) {
            Some(r) => r,
            None => return Ok(None),
        };
        let clear = match state.clear {
            ClearSlot::Consumed => tail,
            ClearSlot::Fixed(index) => index % RING_SIZE,
        };
        state.descs[clear].clear();
        state.tail = (tail + 1) % RING_SIZE;
        Ok(Some(r))
    }

    /// The ring this consumer drains.
    pub fn ring(&self) -> &ShadowRing {
        &self.ring
    }
}

/// Move every packet the device holds into the shadow ring.
///
/// Packets that find the ring full are dropped, so the device ring is freed
/// however slowly the guest consumes. Returns the number of packets queued.
pub fn drain(network: &dyn Network, producer: &RxProducer) -> usize {
    let mut buf = [0u8; PACKET_SIZE];
    let mut queued = 0;
    while let Ok(len) = network.receive(&mut buf) {
        match producer.push(&buf[..len.min(PACKET_SIZE)]) {
            Ok(()) => queued += 1,
            Err(e) => log::trace!("shadow ring drops a packet of {} bytes: {:?}", len, e),
        }
    }
    queued
}
