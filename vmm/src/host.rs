//! Services of the host kernel the hypervisor depends on.
//!
//! The environment model, the messaging primitive and the NIC driver all
//! belong to the host. The hypervisor reaches them only through these traits.
use crate::{
    addressing::{Gpa, Hpa},
    net::NetError,
};
use alloc::sync::Arc;

/// Identifier of a host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvId(pub i32);

/// Kind of a host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvType {
    /// Ordinary user environment.
    User,
    /// Environment running a guest kernel.
    Guest,
    /// The storage (file system) service.
    Storage,
    /// The network service.
    Network,
}

/// A page of a host environment's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePage {
    /// Host page backing the address.
    pub pa: Hpa,
    /// Whether the environment may write the page.
    pub writable: bool,
}

/// Environment lookup.
pub trait EnvRegistry
where
    Self: Send + Sync,
{
    /// Type of the environment `id`, if it exists.
    fn env_type(&self, id: EnvId) -> Option<EnvType>;
    /// Page mapped at `va` in the address space of `env`.
    fn source_page(&self, env: EnvId, va: usize) -> Option<SourcePage>;
    /// First environment of type `ty`.
    fn find(&self, ty: EnvType) -> Option<EnvId>;
}

/// Status of a send to an environment that is not receiving.
pub const E_IPC_NOT_RECV: i64 = -7;

/// Inter-environment message passing.
///
/// Both calls return 0 or a negative status code.
pub trait Messaging
where
    Self: Send + Sync,
{
    /// Try to deliver `value` and, optionally, `page` with `perm` to `to`.
    fn try_send(&self, from: EnvId, to: EnvId, value: u32, page: Option<Hpa>, perm: u32) -> i64;
    /// Wait for a message. A page in the message lands at `dst`.
    ///
    /// The host may switch away before this returns.
    fn recv(&self, receiver: EnvId, dst: Option<Gpa>) -> i64;
}

/// Network interface.
pub trait Network
where
    Self: Send + Sync,
{
    /// Queue `buf` for transmission.
    fn transmit(&self, buf: &[u8]) -> Result<(), NetError>;
    /// Take one received packet into `buf`, returning its length.
    fn receive(&self, buf: &mut [u8]) -> Result<usize, NetError>;
}

/// Handles on every host service, shared by all guests.
#[derive(Clone)]
pub struct HostServices {
    /// Environment lookup.
    pub registry: Arc<dyn EnvRegistry>,
    /// Message passing.
    pub messaging: Arc<dyn Messaging>,
    /// Network interface.
    pub network: Arc<dyn Network>,
}
