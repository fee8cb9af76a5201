//! Address types.
//!
//! Three address spaces meet in this crate: the guest-physical space the guest
//! kernel believes is its RAM, the host-physical space the page allocator hands
//! out, and the host-virtual window through which the host touches a
//! host-physical page. Mixing them up is the classic hypervisor bug, so each
//! gets its own newtype and conversions only happen through the EPT or the
//! page allocator.

/// Page size.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: usize = 12;
/// Mask for page offset.
pub const PAGE_MASK: usize = 0xfff;

/// Guest physical addresses are translated by a 4-level table and stop here.
pub const GPA_LIMIT: usize = 1 << 48;

/// Guest physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Gpa(usize);

impl Gpa {
    /// Create a new guest physical address with a check.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < GPA_LIMIT {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Offset inside the page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Round down to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Whether the address sits on a page boundary.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

/// Host physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Hpa(usize);

impl Hpa {
    /// HPA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new host physical address with a check.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Whether the address sits on a page boundary.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

/// Host virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Hva(usize);

impl Hva {
    /// Create a new host virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Cast into a raw pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Gpa);
impl_arith!(Hpa);
impl_arith!(Hva);

macro_rules! impl_fmt {
    ($t: ident) => {
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($t), "(0x{:x})"), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($t), "(0x{:x})"), self.0)
            }
        }
    };
}

impl_fmt!(Gpa);
impl_fmt!(Hpa);
impl_fmt!(Hva);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpa_rounding() {
        let gpa = Gpa::new(0x1234_5678).unwrap();
        assert_eq!(gpa.page_offset(), 0x678);
        assert_eq!(gpa.page_down(), Gpa::new(0x1234_5000).unwrap());
        assert!(!gpa.is_aligned());
        assert!(gpa.page_down().is_aligned());
    }

    #[test]
    fn non_canonical_is_rejected() {
        assert!(Hva::new(0x0000_8000_0000_0000).is_none());
        assert!(Hva::new(0xffff_8000_0000_1000).is_some());
        assert!(Gpa::new(0xffff_0000_0000_0000).is_none());
        assert!(Gpa::new(GPA_LIMIT | 0x7100).is_none());
        assert!(Gpa::new(GPA_LIMIT - 1).is_some());
    }

    #[test]
    fn debug_format() {
        extern crate alloc;
        assert_eq!(alloc::format!("{:?}", Gpa::new(0xb8000).unwrap()), "Gpa(0xb8000)");
    }
}
