//! Multiboot memory map handed to the guest.
//!
//! The guest kernel asks for its physical memory layout with the MBMAP
//! hypercall and gets a multiboot info structure whose memory map describes
//! three ranges: conventional memory, the legacy I/O hole and extended memory.
use crate::vmexits::ept::{HIGH_MEMORY_BASE, LOW_MEMORY_END};

/// The memory map fields of the info structure are valid.
pub const MB_FLAG_MMAP: u32 = 1 << 6;
/// Usable RAM.
pub const MB_TYPE_USABLE: u32 = 1;
/// Reserved range.
pub const MB_TYPE_RESERVED: u32 = 2;
/// Guest physical address the info structure is placed at.
pub const MULTIBOOT_MAP_ADDR: usize = 0x6000;

/// Multiboot information structure.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

/// One memory map entry.
///
/// `size` counts the bytes after itself.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MemoryMapEntry {
    pub size: u32,
    pub base_addr_low: u32,
    pub base_addr_high: u32,
    pub length_low: u32,
    pub length_high: u32,
    pub ty: u32,
}

/// Size of [`MultibootInfo`] in guest memory.
pub const INFO_SIZE: usize = core::mem::size_of::<MultibootInfo>();
/// Size of a [`MemoryMapEntry`] in guest memory.
pub const ENTRY_SIZE: usize = core::mem::size_of::<MemoryMapEntry>();
/// Number of entries in the memory map.
pub const ENTRY_COUNT: usize = 3;

const _: () = assert!(INFO_SIZE == 52);
const _: () = assert!(ENTRY_SIZE == 24);

impl MemoryMapEntry {
    fn new(base: u64, length: u64, ty: u32) -> Self {
        Self {
            size: (ENTRY_SIZE - 4) as u32,
            base_addr_low: base as u32,
            base_addr_high: (base >> 32) as u32,
            length_low: length as u32,
            length_high: (length >> 32) as u32,
            ty,
        }
    }
}

/// Build the info structure and memory map of a guest with `phys_size` bytes.
pub fn memory_map(phys_size: usize) -> (MultibootInfo, [MemoryMapEntry; ENTRY_COUNT]) {
    let entries = [
        MemoryMapEntry::new(0, LOW_MEMORY_END as u64, MB_TYPE_USABLE),
        MemoryMapEntry::new(LOW_MEMORY_END as u64, 0x60000, MB_TYPE_RESERVED),
        MemoryMapEntry::new(
            HIGH_MEMORY_BASE as u64,
            phys_size.saturating_sub(HIGH_MEMORY_BASE) as u64,
            MB_TYPE_USABLE,
        ),
    ];
    let info = MultibootInfo {
        flags: MB_FLAG_MMAP,
        mmap_length: (ENTRY_SIZE * ENTRY_COUNT) as u32,
        mmap_addr: (MULTIBOOT_MAP_ADDR + INFO_SIZE) as u32,
        ..Default::default()
    };
    (info, entries)
}

/// Serialize the info structure followed by the memory map.
pub fn encode(phys_size: usize) -> [u8; INFO_SIZE + ENTRY_SIZE * ENTRY_COUNT] {
    let (info, entries) = memory_map(phys_size);
    let words = [
        info.flags,
        info.mem_lower,
        info.mem_upper,
        info.boot_device,
        info.cmdline,
        info.mods_count,
        info.mods_addr,
        info.syms[0],
        info.syms[1],
        info.syms[2],
        info.syms[3],
        info.mmap_length,
        info.mmap_addr,
    ]
    .into_iter()
    .chain(entries.iter().flat_map(|e| {
        [
            e.size,
            e.base_addr_low,
            e.base_addr_high,
            e.length_low,
            e.length_high,
            e.ty,
        ]
    }));

    let mut out = [0u8; INFO_SIZE + ENTRY_SIZE * ENTRY_COUNT];
    for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn layout() {
        let bytes = encode(64 << 20);
        assert_eq!(bytes.len(), 52 + 72);
        assert_eq!(word(&bytes, 0), MB_FLAG_MMAP);
        assert_eq!(word(&bytes, 44), 72);
        assert_eq!(word(&bytes, 48), 0x6000 + 52);

        // Third entry: extended memory.
        let e = 52 + 2 * 24;
        assert_eq!(word(&bytes, e), 20);
        assert_eq!(word(&bytes, e + 4), 0x100000);
        assert_eq!(word(&bytes, e + 12), (64 << 20) - 0x100000);
        assert_eq!(word(&bytes, e + 20), MB_TYPE_USABLE);

        // Second entry: the hole.
        assert_eq!(word(&bytes, 52 + 24 + 4), 0xA0000);
        assert_eq!(word(&bytes, 52 + 24 + 12), 0x60000);
        assert_eq!(word(&bytes, 52 + 24 + 20), MB_TYPE_RESERVED);
    }
}
