//! Boot image loader.
//!
//! Staging a guest copies two images into its physical memory: the kernel,
//! an ELF64 executable whose loadable segments land at their physical
//! addresses, and the boot sector, whose first 512 bytes land at the entry
//! point. Every page is backed by a fresh host page and mapped with full
//! permission, replacing whatever was mapped there before.
use crate::{
    addressing::{Gpa, PAGE_SIZE},
    ept::{ExtendedPageTable, Frame, Permission},
    mm::Page,
    Error,
};
use alloc::vec::Vec;
use num_enum::TryFromPrimitive;

/// Bytes of the boot sector.
pub const BOOT_SECTOR_SIZE: usize = 512;

/// A positional reader over a boot image.
pub trait BootImage {
    /// Read at most `buf.len()` bytes at `offset`, returning how many were
    /// read. Zero means end of image.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Error>;

    /// Fill `buf` with the bytes at `offset`.
    fn read_exact_at(&self, mut offset: usize, mut buf: &mut [u8]) -> Result<(), Error> {
        while !buf.is_empty() {
            match self.read_at(offset, buf)? {
                0 => return Err(Error::Io),
                n => {
                    offset += n;
                    buf = &mut buf[n..];
                }
            }
        }
        Ok(())
    }
}

impl BootImage for Vec<u8> {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Error> {
        let src = self.get(offset..).unwrap_or(&[]);
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        Ok(n)
    }
}

/// Program header types.
#[repr(u32)]
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum PType {
    Null = 0x0,
    Load = 0x1,
    Dynamic = 0x2,
    Interp = 0x3,
    Note = 0x4,
    Shlib = 0x5,
    Phdr = 0x6,
    Tls = 0x7,
}

const ELF_MAGIC: [u8; 4] = *b"\x7FELF";
const ELF_CLASS64: u8 = 2;
const ELF_DATA_LSB: u8 = 1;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    let mut w = [0; 4];
    w.copy_from_slice(&b[off..off + 4]);
    u32::from_le_bytes(w)
}

fn u64_at(b: &[u8], off: usize) -> u64 {
    let mut w = [0; 8];
    w.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(w)
}

/// The parts of an ELF64 file header the loader needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    /// Entry point.
    pub entry: u64,
    /// File offset of the program header table.
    pub phoff: u64,
    /// Size of a program header table entry.
    pub phentsize: u16,
    /// Number of program headers.
    pub phnum: u16,
}

impl ElfHeader {
    /// Parse a little-endian ELF64 header.
    pub fn parse(b: &[u8; EHDR_SIZE]) -> Result<Self, Error> {
        if b[..4] != ELF_MAGIC || b[4] != ELF_CLASS64 || b[5] != ELF_DATA_LSB {
            return Err(Error::NotExecutable);
        }
        let header = Self {
            entry: u64_at(b, 24),
            phoff: u64_at(b, 32),
            phentsize: u16_at(b, 54),
            phnum: u16_at(b, 56),
        };
        if header.phnum != 0 && (header.phentsize as usize) < PHDR_SIZE {
            return Err(Error::NotExecutable);
        }
        Ok(header)
    }
}

/// Program header of an ELF64 file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

impl Phdr {
    fn parse(b: &[u8; PHDR_SIZE]) -> Self {
        Self {
            p_type: u32_at(b, 0),
            p_flags: u32_at(b, 4),
            p_offset: u64_at(b, 8),
            p_vaddr: u64_at(b, 16),
            p_paddr: u64_at(b, 24),
            p_filesz: u64_at(b, 32),
            p_memsz: u64_at(b, 40),
        }
    }

    /// Type of the segment, if known.
    #[inline]
    pub fn type_(&self) -> Option<PType> {
        PType::try_from(self.p_type).ok()
    }
}

/// Copy `filesz` bytes at `offset` of `image` to guest physical `gpa`, and
/// back the rest of `memsz` with blank pages.
///
/// An unaligned `gpa` pulls in the file bytes preceding the segment on its
/// first page. Returns the number of pages mapped.
pub fn load_segment(
    ept: &mut ExtendedPageTable,
    phys_size: usize,
    gpa: usize,
    memsz: usize,
    image: &dyn BootImage,
    filesz: usize,
    offset: usize,
) -> Result<usize, Error> {
    if filesz > memsz {
        return Err(Error::InvalidArgument);
    }
    let shift = gpa % PAGE_SIZE;
    let gpa = gpa - shift;
    let memsz = memsz.checked_add(shift).ok_or(Error::InvalidArgument)?;
    let filesz = filesz + shift;
    let offset = offset.checked_sub(shift).ok_or(Error::InvalidArgument)?;
    offset.checked_add(filesz).ok_or(Error::InvalidArgument)?;
    match gpa.checked_add(memsz) {
        Some(end) if end <= phys_size => (),
        _ => return Err(Error::InvalidArgument),
    }

    let mut mapped = 0;
    for i in (0..memsz).step_by(PAGE_SIZE) {
        let mut page = Page::new(ept.allocator()).ok_or(Error::OutOfMemory)?;
        if i < filesz {
            let len = PAGE_SIZE.min(filesz - i);
            image.read_exact_at(offset + i, &mut page.inner_mut()[..len])?;
        }
        let at = Gpa::new(gpa + i).ok_or(Error::InvalidArgument)?;
        ept.map(at, Frame::Page(page.pa()), Permission::FULL, true)?;
        mapped += 1;
    }
    Ok(mapped)
}

/// Load every PT_LOAD segment of the kernel `image` at its physical address.
///
/// Returns the kernel's entry point.
pub fn load_kernel(
    ept: &mut ExtendedPageTable,
    phys_size: usize,
    image: &dyn BootImage,
) -> Result<u64, Error> {
    let mut raw = [0; EHDR_SIZE];
    image
        .read_exact_at(0, &mut raw)
        .map_err(|_| Error::NotExecutable)?;
    let header = ElfHeader::parse(&raw)?;

    let phoff = usize::try_from(header.phoff).map_err(|_| Error::NotExecutable)?;
    for i in 0..header.phnum as usize {
        let at = (header.phentsize as usize)
            .checked_mul(i)
            .and_then(|off| off.checked_add(phoff))
            .ok_or(Error::NotExecutable)?;
        let mut raw = [0; PHDR_SIZE];
        image.read_exact_at(at, &mut raw)?;
        let phdr = Phdr::parse(&raw);
        if phdr.type_() != Some(PType::Load) {
            continue;
        }
        let field = |v: u64| usize::try_from(v).map_err(|_| Error::InvalidArgument);
        load_segment(
            ept,
            phys_size,
            field(phdr.p_paddr)?,
            field(phdr.p_memsz)?,
            image,
            field(phdr.p_filesz)?,
            field(phdr.p_offset)?,
        )?;
    }
    Ok(header.entry)
}

/// Load the boot sector `image` at `entry`.
pub fn load_boot_sector(
    ept: &mut ExtendedPageTable,
    phys_size: usize,
    entry: Gpa,
    image: &dyn BootImage,
) -> Result<(), Error> {
    load_segment(
        ept,
        phys_size,
        entry.into_usize(),
        BOOT_SECTOR_SIZE,
        image,
        BOOT_SECTOR_SIZE,
        0,
    )
    .map(|_| ())
}
