// Page-granular memory blocks that hold loaded sections. A MemoryRegion is allocated
// read-write through the `region` crate, filled and patched by the linker, and then sealed
// exactly once to its final protection: read+execute for code, read-write for data and
// zero-filled data, read-only for constant data. The permission set has no writable and
// executable combination, and a sealed region refuses further writes, so a code block can
// only become executable after all of its bytes are final. Dropping the region releases the
// pages.

//! Permission-tagged memory regions.

use std::fmt;

use region::Protection;

use super::error::LinkError;
use super::object::SectionKind;

/// Final protection of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ReadWrite,
    ReadOnly,
    ReadExecute,
}

impl Permission {
    /// Permission a loaded section of `kind` ends up with.
    pub fn for_section(kind: SectionKind) -> Self {
        match kind {
            SectionKind::Text => Permission::ReadExecute,
            SectionKind::Data | SectionKind::Bss => Permission::ReadWrite,
            SectionKind::ReadOnlyData => Permission::ReadOnly,
        }
    }

    fn protection(self) -> Protection {
        match self {
            Permission::ReadWrite => Protection::READ_WRITE,
            Permission::ReadOnly => Protection::READ,
            Permission::ReadExecute => Protection::READ_EXECUTE,
        }
    }

    pub fn is_executable(self) -> bool {
        self == Permission::ReadExecute
    }

    pub fn is_writable(self) -> bool {
        self == Permission::ReadWrite
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::ReadWrite => f.write_str("rw-"),
            Permission::ReadOnly => f.write_str("r--"),
            Permission::ReadExecute => f.write_str("r-x"),
        }
    }
}

/// Native page size of the host.
pub fn page_size() -> usize {
    region::page::size()
}

/// A block of process memory holding all sections of one kind.
pub struct MemoryRegion {
    kind: SectionKind,
    allocation: region::Allocation,
    len: usize,
    permission: Permission,
    sealed: bool,
}

impl MemoryRegion {
    /// Allocate a writable, zero-initialised block of at least `len` bytes.
    pub(crate) fn allocate(kind: SectionKind, len: usize) -> Result<Self, LinkError> {
        let mut allocation = region::alloc(len.max(1), Protection::READ_WRITE)?;
        let capacity = allocation.len();
        // SAFETY: the allocation is `capacity` bytes, readable and writable,
        // and exclusively owned here.
        unsafe {
            std::ptr::write_bytes(allocation.as_mut_ptr::<u8>(), 0, capacity);
        }
        log::trace!(
            "allocated {:?} block of {} bytes ({} reserved)",
            kind,
            len,
            capacity
        );
        Ok(Self {
            kind,
            allocation,
            len,
            permission: Permission::ReadWrite,
            sealed: false,
        })
    }

    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    /// Address of the first byte.
    pub fn base(&self) -> usize {
        self.allocation.as_ptr::<u8>() as usize
    }

    /// Bytes in use.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes reserved, a multiple of the page size.
    pub fn capacity(&self) -> usize {
        self.allocation.len()
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Whether `address` falls inside the used part of the region.
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base() && address < self.base() + self.len
    }

    /// Used bytes of the region. Every permission includes read access.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `len <= capacity` and all permissions are readable.
        unsafe { std::slice::from_raw_parts(self.allocation.as_ptr::<u8>(), self.len) }
    }

    /// Used bytes, writable until the region is sealed.
    pub(crate) fn bytes_mut(&mut self) -> Result<&mut [u8], LinkError> {
        if self.sealed {
            return Err(LinkError::Memory {
                reason: format!("{:?} region is sealed", self.kind),
            });
        }
        let len = self.len;
        // SAFETY: unsealed regions are read-write and owned by `self`.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.allocation.as_mut_ptr::<u8>(), len) })
    }

    /// Apply the final protection. Allowed once.
    pub(crate) fn seal(&mut self, permission: Permission) -> Result<(), LinkError> {
        if self.sealed {
            return Err(LinkError::Memory {
                reason: format!("{:?} region sealed twice", self.kind),
            });
        }
        // SAFETY: the range is exactly our own allocation and nothing holds a
        // mutable borrow of it across this call.
        unsafe {
            region::protect(
                self.allocation.as_ptr::<u8>(),
                self.allocation.len(),
                permission.protection(),
            )?;
        }
        self.permission = permission;
        self.sealed = true;
        log::trace!(
            "sealed {:?} region at {:#x} as {}",
            self.kind,
            self.base(),
            permission
        );
        Ok(())
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("kind", &self.kind)
            .field("base", &format_args!("{:#x}", self.base()))
            .field("len", &self.len)
            .field("permission", &self.permission)
            .field("sealed", &self.sealed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_page_granular_and_zeroed() {
        let region = MemoryRegion::allocate(SectionKind::Data, 10).unwrap();
        assert_eq!(region.len(), 10);
        assert!(region.capacity() >= page_size());
        assert_eq!(region.capacity() % page_size(), 0);
        assert_eq!(region.base() % page_size(), 0);
        assert!(region.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_seal_once() {
        let mut region = MemoryRegion::allocate(SectionKind::ReadOnlyData, 4).unwrap();
        region.bytes_mut().unwrap().copy_from_slice(b"abcd");
        region.seal(Permission::ReadOnly).unwrap();

        assert!(region.is_sealed());
        assert_eq!(region.bytes(), b"abcd");
        assert!(region.bytes_mut().is_err());
        assert!(region.seal(Permission::ReadWrite).is_err());
    }

    #[test]
    fn test_permissions_never_write_and_execute() {
        for kind in SectionKind::ALL {
            let permission = Permission::for_section(kind);
            assert!(!(permission.is_writable() && permission.is_executable()));
        }
        assert_eq!(
            Permission::for_section(SectionKind::Text),
            Permission::ReadExecute
        );
    }

    #[test]
    fn test_contains() {
        let region = MemoryRegion::allocate(SectionKind::Bss, 32).unwrap();
        assert!(region.contains(region.base()));
        assert!(region.contains(region.base() + 31));
        assert!(!region.contains(region.base() + 32));
    }
}
