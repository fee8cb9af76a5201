//! EPT violation vmexit controller.
//!
//! Guest memory is populated on demand. The first access to a guest physical
//! page traps with an EPT violation, the faulting address is classified
//! against a fixed table of named regions, and the page is backed either by a
//! fresh host page (RAM) or by the host device page at the same address
//! (identity). Addresses outside every region are unhandled and fatal.
use crate::{
    addressing::{Gpa, Hpa, PAGE_SIZE},
    ept::{EptMappingError, ExtendedPageTable, Frame, Permission},
    mm::Page,
    vcpu::{GenericVCpuState, VmexitResult},
    vmcs::{BasicExitReason, ExitReason},
    VmError,
};
use core::ops::Range;

/// How a region of guest physical memory is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Fresh zeroed host pages, owned by the guest.
    Ram,
    /// The host page at the same physical address.
    Identity,
}

/// A named range of guest physical memory.
#[derive(Debug)]
pub struct Region {
    /// Name of the region, for logging.
    pub name: &'static str,
    /// Guest physical range covered.
    pub range: Range<usize>,
    /// Backing of the pages in the region.
    pub backing: Backing,
}

/// End of conventional memory.
pub const LOW_MEMORY_END: usize = 0xA0000;
/// Start of the memory above the legacy holes.
pub const HIGH_MEMORY_BASE: usize = 0x100000;

/// Fixed regions below and above the guest's high memory.
pub static REGIONS: [Region; 4] = [
    Region {
        name: "low memory",
        range: 0..LOW_MEMORY_END,
        backing: Backing::Ram,
    },
    Region {
        name: "legacy video",
        range: 0xB8000..0xB9000,
        backing: Backing::Identity,
    },
    Region {
        name: "bios extension",
        range: 0xF0000..HIGH_MEMORY_BASE,
        backing: Backing::Identity,
    },
    Region {
        name: "local apic",
        range: 0xFEE0_0000..0xFEE0_1000,
        backing: Backing::Identity,
    },
];

/// Guest RAM above 1MiB. The end is the guest's physical size.
pub static HIGH_MEMORY: Region = Region {
    name: "high memory",
    range: HIGH_MEMORY_BASE..usize::MAX,
    backing: Backing::Ram,
};

/// Find the region `gpa` belongs to in a guest of `phys_size` bytes.
pub fn classify(gpa: Gpa, phys_size: usize) -> Option<&'static Region> {
    let gpa = gpa.into_usize();
    REGIONS
        .iter()
        .find(|region| region.range.contains(&gpa))
        .or_else(|| {
            if gpa >= HIGH_MEMORY_BASE && gpa < phys_size {
                Some(&HIGH_MEMORY)
            } else {
                None
            }
        })
}

/// Back the page containing `gpa` according to its region.
///
/// A page that is already mapped is left as is.
pub fn populate(
    ept: &mut ExtendedPageTable,
    region: &Region,
    gpa: Gpa,
) -> Result<(), EptMappingError> {
    let gpa = gpa.page_down();
    let r = match region.backing {
        Backing::Ram => {
            let page = Page::new(ept.allocator()).ok_or(EptMappingError::OutOfMemory)?;
            // The table takes its own reference; ours drops with `page`.
            ept.map(gpa, Frame::Page(page.pa()), Permission::FULL, false)
        }
        Backing::Identity => {
            let pa = Hpa::new(gpa.into_usize()).ok_or(EptMappingError::InvalidArgument)?;
            ept.map(gpa, Frame::Mmio(pa), Permission::FULL, false)
        }
    };
    match r {
        Err(EptMappingError::AlreadyMapped) => Ok(()),
        r => r,
    }
}

/// Back every RAM page of a guest of `phys_size` bytes up front.
pub fn prefault(ept: &mut ExtendedPageTable, phys_size: usize) -> Result<(), EptMappingError> {
    let ranges = [0..LOW_MEMORY_END, HIGH_MEMORY_BASE..phys_size];
    for range in ranges {
        for gpa in range.step_by(PAGE_SIZE) {
            let gpa = Gpa::new(gpa).ok_or(EptMappingError::InvalidArgument)?;
            let region = classify(gpa, phys_size).ok_or(EptMappingError::InvalidArgument)?;
            populate(ept, region, gpa)?;
        }
    }
    Ok(())
}

/// EPT violation vmexit controller.
#[derive(Default)]
pub struct Controller;

impl Controller {
    /// Create a new ept violation controller.
    pub fn new() -> Self {
        Self
    }
}

impl super::VmexitController for Controller {
    fn handle(
        &mut self,
        reason: ExitReason,
        ept: &mut ExtendedPageTable,
        generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError> {
        match &reason {
            ExitReason::BasicExitReason(BasicExitReason::EptViolation {
                fault_addr: Some(gpa),
                ..
            }) => {
                let region = match classify(*gpa, generic_vcpu_state.guest.phys_size) {
                    Some(region) => region,
                    None => return Err(VmError::HandleVmexitFailed(reason)),
                };
                if ept.walk(gpa.page_down()).is_ok() {
                    // Already serviced; never allocate twice for one page.
                    return Ok(VmexitResult::Ok);
                }
                populate(ept, region, *gpa)?;
                log::debug!(
                    "[{:?}] ept violation at {:?} ({}) serviced",
                    generic_vcpu_state.guest.id,
                    gpa,
                    region.name
                );
                Ok(VmexitResult::Ok)
            }
            _ => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpa(addr: usize) -> Gpa {
        Gpa::new(addr).unwrap()
    }

    #[test]
    fn region_table() {
        let size = 64 << 20;
        assert_eq!(classify(gpa(0x9f000), size).unwrap().backing, Backing::Ram);
        assert!(classify(gpa(0xA0000), size).is_none());
        assert_eq!(
            classify(gpa(0xB8123), size).unwrap().backing,
            Backing::Identity
        );
        assert!(classify(gpa(0xB9000), size).is_none());
        assert_eq!(classify(gpa(0xFFFFF), size).unwrap().name, "bios extension");
        assert_eq!(classify(gpa(0x100000), size).unwrap().name, "high memory");
        assert!(classify(gpa(size), size).is_none());
        assert_eq!(classify(gpa(0xFEE0_0020), size).unwrap().name, "local apic");
        assert!(classify(gpa(0xFEE0_1000), size).is_none());
    }
}
