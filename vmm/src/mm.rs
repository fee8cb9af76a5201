//! Host physical memory, as seen by the hypervisor.
//!
//! The host kernel owns the physical page allocator. The hypervisor only needs
//! zeroed pages, reference counting and a host-virtual window onto each page,
//! which is what [`PageAllocator`] captures.
use crate::addressing::{Hpa, Hva, PAGE_SIZE};
use alloc::sync::Arc;

/// Physical page allocator with per-page reference counts.
///
/// Reference counts must be maintained atomically by the implementor.
pub trait PageAllocator
where
    Self: Send + Sync,
{
    /// Allocate a zero-filled page. The caller owns one reference.
    fn alloc_zeroed(&self) -> Option<Hpa>;
    /// Take an additional reference on `pa`.
    fn incref(&self, pa: Hpa);
    /// Drop a reference on `pa`, freeing the page when the count reaches zero.
    ///
    /// # Panics
    /// Panics if the count is already zero.
    fn decref(&self, pa: Hpa);
    /// Host virtual address through which `pa` can be accessed.
    ///
    /// Returns `None` for addresses the host cannot reach.
    fn hva(&self, pa: Hpa) -> Option<Hva>;
}

/// A reference on one page of host memory.
///
/// The reference is released when the `Page` is dropped, unless it is leaked
/// with [`Page::into_raw`].
pub struct Page {
    pa: Hpa,
    hva: Hva,
    allocator: Arc<dyn PageAllocator>,
}

impl Page {
    /// Allocate a new zeroed page.
    pub fn new(allocator: &Arc<dyn PageAllocator>) -> Option<Self> {
        let pa = allocator.alloc_zeroed()?;
        match allocator.hva(pa) {
            Some(hva) => Some(Self {
                pa,
                hva,
                allocator: allocator.clone(),
            }),
            None => {
                allocator.decref(pa);
                None
            }
        }
    }

    /// Get host physical address of this page.
    #[inline]
    pub fn pa(&self) -> Hpa {
        self.pa
    }

    /// Get host virtual address of this page.
    #[inline]
    pub fn hva(&self) -> Hva {
        self.hva
    }

    /// Consumes the page, returning the host physical address.
    ///
    /// The reference is not released.
    pub fn into_raw(self) -> Hpa {
        let this = core::mem::ManuallyDrop::new(self);
        // Release the allocator handle only.
        drop(unsafe { core::ptr::read(&this.allocator) });
        this.pa
    }

    /// Get a mutable reference of the page contents.
    pub fn inner_mut(&mut self) -> &mut [u8] {
        // Exclusive ownership of the reference keeps the window valid.
        unsafe { core::slice::from_raw_parts_mut(self.hva.as_mut_ptr::<u8>(), PAGE_SIZE) }
    }

    /// Get a reference of the page contents.
    pub fn inner(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.hva.as_mut_ptr::<u8>() as *const u8, PAGE_SIZE) }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.allocator.decref(self.pa);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Page allocator over host heap memory, for unit tests.
    use super::PageAllocator;
    use crate::addressing::{Hpa, Hva, PAGE_SIZE};
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    pub struct HostPages {
        counts: Mutex<BTreeMap<usize, usize>>,
        budget: Mutex<Option<usize>>,
    }

    impl HostPages {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                counts: Mutex::new(BTreeMap::new()),
                budget: Mutex::new(None),
            })
        }

        pub fn refcount(&self, pa: Hpa) -> usize {
            self.counts
                .lock()
                .unwrap()
                .get(&pa.into_usize())
                .copied()
                .unwrap_or(0)
        }

        pub fn live(&self) -> usize {
            self.counts.lock().unwrap().len()
        }

        /// Let `n` more allocations succeed, then fail.
        pub fn fail_after(&self, n: usize) {
            *self.budget.lock().unwrap() = Some(n);
        }

        fn layout() -> Layout {
            Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
        }
    }

    impl PageAllocator for HostPages {
        fn alloc_zeroed(&self) -> Option<Hpa> {
            if let Some(budget) = self.budget.lock().unwrap().as_mut() {
                if *budget == 0 {
                    return None;
                }
                *budget -= 1;
            }
            let ptr = unsafe { alloc_zeroed(Self::layout()) } as usize;
            self.counts.lock().unwrap().insert(ptr, 1);
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
            let base = pa.into_usize() & !crate::addressing::PAGE_MASK;
            if self.counts.lock().unwrap().contains_key(&base) {
                Hva::new(pa.into_usize())
            } else {
                None
            }
        }
    }

    impl Drop for HostPages {
        fn drop(&mut self) {
            for (ptr, _) in core::mem::take(&mut *self.counts.lock().unwrap()) {
                unsafe { dealloc(ptr as *mut u8, Self::layout()) };
            }
        }
    }
}
