//! Extended Page Table.
//!
//! Each guest owns one 4-level table translating guest physical addresses into
//! host pages. The table is built lazily: intermediate levels come into
//! existence the first time a mapping below them is installed, and every
//! intermediate entry grants full access so that only leaves restrict the
//! guest.
//!
//! The structure of the tree is kept in an arena of table nodes addressed by
//! index, parents owning their children. Every node is backed by a page from
//! the [`PageAllocator`] that receives the hardware-format entries, so the
//! root can be loaded into the EPT pointer as is.
//!
//! Reference counting follows two rules:
//! * a leaf of a RAM page holds exactly one reference on that page,
//! * a leaf of a device page ([`Frame::Mmio`]) holds none.
use crate::{
    addressing::{Gpa, Hpa, Hva, GPA_LIMIT, PAGE_SHIFT},
    mm::PageAllocator,
};
use alloc::{sync::Arc, vec::Vec};

/// Number of entries in a single table.
pub const ENTRY_COUNT: usize = 512;

/// Possible errors of EPT manipulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptMappingError {
    /// Unaligned address, or an empty permission.
    InvalidArgument,
    /// Failed to allocate a table node.
    OutOfMemory,
    /// No table exists on the path.
    NotFound,
    /// Has a duplicated mapping.
    AlreadyMapped,
}

bitflags::bitflags! {
    /// Flags of an EPT entry.
    ///
    /// Table 28-1 through 28-6 of the SDM share the layout of the low bits.
    pub struct EptFlags: u64 {
        /// Reads are allowed from the region controlled by this entry.
        const READ = 1 << 0;
        /// Writes are allowed to the region controlled by this entry.
        const WRITE = 1 << 1;
        /// Instruction fetches are allowed from the region controlled by this entry.
        const EXECUTE = 1 << 2;
        /// Write-back memory type. Only meaningful on a leaf.
        const MEMORY_TYPE_WB = 6 << 3;
        /// Full access, as carried by every intermediate entry.
        const FULL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

bitflags::bitflags! {
    /// Possible memory permissions.
    pub struct Permission: usize {
        /// Page is readable.
        const READ = 1 << 0;
        /// Page is writable.
        const WRITE = 1 << 1;
        /// Page is executable.
        const EXECUTABLE = 1 << 2;
        /// Readable, writable and executable.
        const FULL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTABLE.bits();
    }
}

/// A hardware-format EPT entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct EptEntry(u64);

impl EptEntry {
    const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

    /// An entry that maps nothing.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Get a physical address pointed by this entry.
    #[inline]
    pub fn pa(&self) -> Option<Hpa> {
        if self.flags().intersects(EptFlags::FULL) {
            Hpa::new((self.0 & Self::ADDR_MASK) as usize)
        } else {
            None
        }
    }

    /// Get a flags this entry.
    #[inline]
    pub const fn flags(&self) -> EptFlags {
        EptFlags::from_bits_truncate(self.0)
    }

    /// Raw value of the entry.
    #[inline]
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Set physical address of this entry.
    ///
    /// # WARNING
    /// Permission of this entry is not changed.
    #[inline]
    pub fn set_pa(&mut self, pa: Hpa) -> Result<&mut Self, EptMappingError> {
        let pa = pa.into_usize() as u64;
        if pa & !Self::ADDR_MASK != 0 {
            Err(EptMappingError::InvalidArgument)
        } else {
            self.0 = pa | (self.0 & EptFlags::all().bits());
            Ok(self)
        }
    }

    /// Set a permission of this entry.
    #[inline]
    pub fn set_perm(&mut self, perm: EptFlags) -> &mut Self {
        self.0 = perm.bits() | (self.0 & !EptFlags::all().bits());
        self
    }
}

impl core::fmt::Debug for EptEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EptEntry({:?}, {:?})", self.pa(), self.flags())
    }
}

/// Host page a leaf points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// Reference-counted host RAM page.
    Page(Hpa),
    /// Device memory mapped at the same address in host and guest.
    Mmio(Hpa),
}

impl Frame {
    /// Host physical address of the frame.
    pub const fn pa(&self) -> Hpa {
        match self {
            Frame::Page(pa) | Frame::Mmio(pa) => *pa,
        }
    }

    fn entry(&self, perm: Permission) -> EptEntry {
        let mut flags = EptFlags::from_bits_truncate(perm.bits() as u64);
        if let Frame::Page(_) = self {
            // Device pages stay uncacheable (memory type 0).
            flags |= EptFlags::MEMORY_TYPE_WB;
        }
        let mut entry = EptEntry::empty();
        // Frames are validated to be page-aligned before they reach a slot.
        let _ = entry.set_pa(self.pa());
        *entry.set_perm(flags)
    }
}

type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Table(NodeId),
    Leaf(Frame, Permission),
}

struct Node {
    pa: Hpa,
    hva: Hva,
    slots: Vec<Slot>,
}

impl Node {
    fn write(&self, index: usize, entry: EptEntry) {
        debug_assert!(index < ENTRY_COUNT);
        // The backing page is owned by this node for its whole lifetime.
        unsafe {
            self.hva
                .as_mut_ptr::<EptEntry>()
                .add(index)
                .write_volatile(entry)
        }
    }
}

#[inline]
fn index_of(gpa: Gpa, level: usize) -> usize {
    (gpa.into_usize() >> (PAGE_SHIFT + 9 * level)) & (ENTRY_COUNT - 1)
}

/// Extended page table of a guest.
pub struct ExtendedPageTable {
    allocator: Arc<dyn PageAllocator>,
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
}

/// Handle to the leaf slot of a guest physical page.
///
/// Obtained from [`ExtendedPageTable::lookup`].
pub struct LeafSlot<'a> {
    table: &'a mut ExtendedPageTable,
    node: NodeId,
    index: usize,
}

impl LeafSlot<'_> {
    /// The mapping held by the slot, if any.
    pub fn get(&self) -> Option<(Frame, Permission)> {
        match self.table.node(self.node).slots[self.index] {
            Slot::Leaf(frame, perm) => Some((frame, perm)),
            _ => None,
        }
    }

    /// Whether the slot holds a mapping.
    pub fn is_mapped(&self) -> bool {
        self.get().is_some()
    }

    /// Hardware entry backing the slot.
    pub fn entry(&self) -> EptEntry {
        let node = self.table.node(self.node);
        unsafe { node.hva.as_mut_ptr::<EptEntry>().add(self.index).read_volatile() }
    }

    fn install(&mut self, frame: Frame, perm: Permission) -> Option<Frame> {
        let old = self.get().map(|(frame, _)| frame);
        self.table
            .set_slot(self.node, self.index, Slot::Leaf(frame, perm));
        old
    }
}

impl ExtendedPageTable {
    /// Create an empty table with a freshly allocated root.
    pub fn new(allocator: Arc<dyn PageAllocator>) -> Result<Self, EptMappingError> {
        let mut ept = Self {
            allocator,
            nodes: Vec::new(),
            free: Vec::new(),
        };
        let root = ept.alloc_node()?;
        debug_assert_eq!(root, ROOT);
        Ok(ept)
    }

    /// Host physical address of the root table.
    pub fn root(&self) -> Hpa {
        self.node(ROOT).pa
    }

    /// Value to load into the EPT pointer VMCS field.
    ///
    /// Write-back paging structures with a 4-level walk.
    pub fn eptp(&self) -> u64 {
        self.root().into_usize() as u64 | (3 << 3) | 6
    }

    /// Allocator backing the table.
    pub fn allocator(&self) -> &Arc<dyn PageAllocator> {
        &self.allocator
    }

    fn node(&self, id: NodeId) -> &Node {
        match self.nodes.get(id) {
            Some(Some(node)) => node,
            _ => unreachable!("ept node {} is not live", id),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id) {
            Some(Some(node)) => node,
            _ => unreachable!("ept node {} is not live", id),
        }
    }

    fn alloc_node(&mut self) -> Result<NodeId, EptMappingError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(ENTRY_COUNT)
            .map_err(|_| EptMappingError::OutOfMemory)?;
        slots.resize(ENTRY_COUNT, Slot::Empty);
        if self.free.is_empty() {
            // Keep room to recycle every node without allocating.
            let want = self.nodes.len() + 1;
            self.nodes
                .try_reserve(1)
                .and_then(|_| self.free.try_reserve(want - self.free.len()))
                .map_err(|_| EptMappingError::OutOfMemory)?;
        }

        let pa = self
            .allocator
            .alloc_zeroed()
            .ok_or(EptMappingError::OutOfMemory)?;
        let hva = match self.allocator.hva(pa) {
            Some(hva) => hva,
            None => {
                self.allocator.decref(pa);
                return Err(EptMappingError::OutOfMemory);
            }
        };
        let node = Some(Node { pa, hva, slots });
        Ok(match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        })
    }

    fn free_node(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(id).and_then(Option::take) {
            self.allocator.decref(node.pa);
            self.free.push(id);
        }
    }

    fn set_slot(&mut self, id: NodeId, index: usize, slot: Slot) {
        let entry = match slot {
            Slot::Empty => EptEntry::empty(),
            Slot::Table(child) => {
                let mut entry = EptEntry::empty();
                let _ = entry.set_pa(self.node(child).pa);
                *entry.set_perm(EptFlags::FULL)
            }
            Slot::Leaf(frame, perm) => frame.entry(perm),
        };
        let node = self.node_mut(id);
        node.slots[index] = slot;
        node.write(index, entry);
    }

    // Undo the links made by a failed lookup, deepest first.
    fn unwind(&mut self, created: &[Option<(NodeId, usize)>]) {
        for &(parent, index) in created.iter().rev().flatten() {
            let slot = self.node(parent).slots[index];
            if let Slot::Table(child) = slot {
                self.set_slot(parent, index, Slot::Empty);
                self.free_node(child);
            }
        }
    }

    /// Find the leaf slot for `gpa`.
    ///
    /// When `create` is set, missing intermediate tables are allocated and
    /// linked with full permission. If an allocation fails, every table this
    /// call linked is unlinked and released before returning
    /// [`EptMappingError::OutOfMemory`]. Without `create`, a missing table
    /// yields [`EptMappingError::NotFound`].
    pub fn lookup(&mut self, gpa: Gpa, create: bool) -> Result<LeafSlot<'_>, EptMappingError> {
        if !gpa.is_aligned() || gpa.into_usize() >= GPA_LIMIT {
            return Err(EptMappingError::InvalidArgument);
        }

        let mut created = [None; 3];
        let mut node = ROOT;
        for (depth, level) in (1..=3).rev().enumerate() {
            let index = index_of(gpa, level);
            let slot = self.node(node).slots[index];
            node = match slot {
                Slot::Table(child) => child,
                Slot::Empty if create => match self.alloc_node() {
                    Ok(child) => {
                        self.set_slot(node, index, Slot::Table(child));
                        created[depth] = Some((node, index));
                        child
                    }
                    Err(e) => {
                        self.unwind(&created);
                        return Err(e);
                    }
                },
                _ => return Err(EptMappingError::NotFound),
            };
        }
        Ok(LeafSlot {
            index: index_of(gpa, 0),
            node,
            table: self,
        })
    }

    /// Map `frame` at `gpa` with `perm`.
    ///
    /// The new page gains a reference before the replaced page, if any, loses
    /// one. Without `overwrite`, an existing mapping is left untouched and
    /// [`EptMappingError::AlreadyMapped`] is returned.
    pub fn map(
        &mut self,
        gpa: Gpa,
        frame: Frame,
        perm: Permission,
        overwrite: bool,
    ) -> Result<(), EptMappingError> {
        if perm.is_empty() || !frame.pa().is_aligned() {
            return Err(EptMappingError::InvalidArgument);
        }
        let allocator = self.allocator.clone();
        let mut slot = self.lookup(gpa, true)?;
        if slot.is_mapped() && !overwrite {
            return Err(EptMappingError::AlreadyMapped);
        }
        if let Frame::Page(pa) = frame {
            allocator.incref(pa);
        }
        if let Some(Frame::Page(old)) = slot.install(frame, perm) {
            allocator.decref(old);
        }
        Ok(())
    }

    fn find(&self, gpa: Gpa) -> Option<(Frame, Permission)> {
        if gpa.into_usize() >= GPA_LIMIT {
            return None;
        }
        let mut node = ROOT;
        for level in (1..=3).rev() {
            match self.node(node).slots[index_of(gpa, level)] {
                Slot::Table(child) => node = child,
                _ => return None,
            }
        }
        match self.node(node).slots[index_of(gpa, 0)] {
            Slot::Leaf(frame, perm) => Some((frame, perm)),
            _ => None,
        }
    }

    /// Inspect the mapping that covers `gpa`.
    pub fn walk(&self, gpa: Gpa) -> Result<(Frame, Permission), EptMappingError> {
        self.find(gpa).ok_or(EptMappingError::NotFound)
    }

    /// Translate `gpa` into a host virtual address, keeping the page offset.
    pub fn translate(&self, gpa: Gpa) -> Option<Hva> {
        let (frame, _) = self.find(gpa)?;
        self.allocator
            .hva(frame.pa())
            .map(|hva| hva + gpa.page_offset())
    }

    /// Number of installed leaves.
    pub fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .flatten()
            .map(|node| {
                node.slots
                    .iter()
                    .filter(|slot| matches!(slot, Slot::Leaf(..)))
                    .count()
            })
            .sum()
    }

    fn release(&mut self, id: NodeId) {
        for index in 0..ENTRY_COUNT {
            let slot = self.node(id).slots[index];
            match slot {
                Slot::Table(child) => self.release(child),
                Slot::Leaf(Frame::Page(pa), _) => self.allocator.decref(pa),
                _ => (),
            }
        }
        self.free_node(id);
    }

    /// Release every mapping and every intermediate table.
    ///
    /// The root survives and the table stays usable.
    pub fn unmap_all(&mut self) {
        for index in 0..ENTRY_COUNT {
            let slot = self.node(ROOT).slots[index];
            if let Slot::Table(child) = slot {
                self.set_slot(ROOT, index, Slot::Empty);
                self.release(child);
            }
        }
    }
}

impl Drop for ExtendedPageTable {
    fn drop(&mut self) {
        if matches!(self.nodes.get(ROOT), Some(Some(_))) {
            self.unmap_all();
            self.free_node(ROOT);
        }
    }
}
