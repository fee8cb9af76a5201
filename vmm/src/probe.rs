//! Guest memory access from the host.
use crate::{
    addressing::{Gpa, Hpa, Hva, PAGE_SIZE},
    ept::ExtendedPageTable,
};

/// Traits to probe guest memory.
pub trait Probe {
    /// Translate guest physical address to host physical address
    fn gpa2hpa(&self, gpa: Gpa) -> Option<Hpa>;
    /// Translate guest physical address to host virtual address
    fn gpa2hva(&self, gpa: Gpa) -> Option<Hva>;

    /// Copy guest memory starting at `gpa` into `buf`.
    ///
    /// The range may span several guest pages. Returns `None` if any page of
    /// the range is not accessible from the host.
    fn read_guest(&self, gpa: Gpa, buf: &mut [u8]) -> Option<()> {
        let mut done = 0;
        while done < buf.len() {
            let cur = gpa + done;
            let len = (PAGE_SIZE - cur.page_offset()).min(buf.len() - done);
            let hva = self.gpa2hva(cur)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    hva.as_mut_ptr::<u8>() as *const u8,
                    buf[done..].as_mut_ptr(),
                    len,
                );
            }
            done += len;
        }
        Some(())
    }

    /// Copy `data` into guest memory starting at `gpa`.
    ///
    /// Same page rules as [`Probe::read_guest`].
    fn write_guest(&self, gpa: Gpa, data: &[u8]) -> Option<()> {
        let mut done = 0;
        while done < data.len() {
            let cur = gpa + done;
            let len = (PAGE_SIZE - cur.page_offset()).min(data.len() - done);
            let hva = self.gpa2hva(cur)?;
            unsafe {
                core::ptr::copy_nonoverlapping(data[done..].as_ptr(), hva.as_mut_ptr::<u8>(), len);
            }
            done += len;
        }
        Some(())
    }
}

impl Probe for ExtendedPageTable {
    fn gpa2hpa(&self, gpa: Gpa) -> Option<Hpa> {
        self.walk(gpa)
            .ok()
            .map(|(frame, _)| frame.pa() + gpa.page_offset())
    }

    fn gpa2hva(&self, gpa: Gpa) -> Option<Hva> {
        self.translate(gpa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ept::{Frame, Permission},
        mm::{testing::HostPages, PageAllocator},
    };

    #[test]
    fn copy_across_pages() {
        let pages = HostPages::new();
        let mut ept = ExtendedPageTable::new(pages.clone()).unwrap();
        for gpa in [0x3000, 0x4000] {
            let pa = pages.alloc_zeroed().unwrap();
            ept.map(Gpa::new(gpa).unwrap(), Frame::Page(pa), Permission::FULL, false)
                .unwrap();
            pages.decref(pa);
        }

        let data: Vec<u8> = (0..64).collect();
        let at = Gpa::new(0x3fe0).unwrap();
        ept.write_guest(at, &data).unwrap();

        let mut back = [0u8; 64];
        ept.read_guest(at, &mut back).unwrap();
        assert_eq!(&back[..], &data[..]);
        assert!(ept.read_guest(Gpa::new(0x4ff0).unwrap(), &mut back).is_none());
    }
}
