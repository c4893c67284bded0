//! `mprotect` backend for Linux, macOS and other Unix systems.

use std::io;
use std::ptr::NonNull;

use libc::{PROT_EXEC, PROT_READ, PROT_WRITE, c_int, c_void};
use log::{debug, warn};
use nix::sys::mman::{ProtFlags, mprotect};
use nix::unistd::{SysconfVar, sysconf};

use super::{MemoryController, Protection, change_pages, page_span};
use crate::error::{PatchError, Result};

const DEFAULT_PAGE_SIZE: usize = 4096;

/// Native protection for each portable value, indexed by `Protection::bits()`.
const PROT_TABLE: [c_int; 8] = [
    0,                                  // ---
    PROT_READ,                          // r--
    PROT_WRITE,                         // -w-
    PROT_READ | PROT_WRITE,             // rw-
    PROT_EXEC,                          // --x
    PROT_READ | PROT_EXEC,              // r-x
    PROT_WRITE | PROT_EXEC,             // -wx
    PROT_READ | PROT_WRITE | PROT_EXEC, // rwx
];

fn to_native(protection: Protection) -> ProtFlags {
    ProtFlags::from_bits_truncate(PROT_TABLE[protection.bits() as usize])
}

#[cfg_attr(not(any(target_os = "linux", target_os = "macos")), allow(dead_code))]
fn from_native(native: c_int) -> Protection {
    let mut bits = 0;
    if native & PROT_READ != 0 {
        bits |= Protection::READ;
    }
    if native & PROT_WRITE != 0 {
        bits |= Protection::WRITE;
    }
    if native & PROT_EXEC != 0 {
        bits |= Protection::EXEC;
    }
    Protection::from_bits(bits)
}

/// Protection controller for the current process.
#[derive(Debug, Clone, Copy)]
pub struct NativeMemory {
    page_size: usize,
}

impl NativeMemory {
    pub fn new() -> Self {
        let page_size = match sysconf(SysconfVar::PAGE_SIZE) {
            Ok(Some(size)) if size > 0 => size as usize,
            _ => DEFAULT_PAGE_SIZE,
        };
        Self { page_size }
    }

    fn query(&self, pages: &[usize]) -> Result<Vec<Protection>> {
        query_protections(pages)
    }

    fn protect_page(&self, page: usize, protection: Protection) -> Result<()> {
        let ptr = NonNull::new(page as *mut c_void).ok_or_else(|| {
            PatchError::platform(
                "mprotect",
                page,
                self.page_size,
                io::Error::from_raw_os_error(libc::EINVAL),
            )
        })?;
        // SAFETY: only the protection of pages already mapped in this
        // process is changed; no memory is unmapped or reallocated.
        unsafe { mprotect(ptr, self.page_size, to_native(protection)) }
            .map_err(|errno| PatchError::platform("mprotect", page, self.page_size, errno.into()))
    }
}

impl Default for NativeMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryController for NativeMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn protection(&self, address: usize) -> Result<Protection> {
        let page = address & !(self.page_size - 1);
        let protections = self.query(&[page])?;
        protections.first().copied().ok_or_else(|| {
            PatchError::platform("query protection", address, 1, unmapped())
        })
    }

    fn set_protection(
        &self,
        address: usize,
        length: usize,
        protection: Protection,
    ) -> Result<Protection> {
        let pages: Vec<usize> = page_span(address, length, self.page_size).collect();
        if pages.is_empty() {
            return self.protection(address);
        }

        let current = self.query(&pages)?;
        let previous = current[0];
        if current.iter().any(|p| *p != previous) {
            warn!(
                "Range 0x{:x} (+{}) spans pages with mixed protection {:?}; restoring as {}",
                address, length, current, previous
            );
        }

        change_pages(
            address,
            length,
            self.page_size,
            protection,
            previous,
            |page, protection| self.protect_page(page, protection),
        )?;

        debug!(
            "Protection of 0x{:x} (+{}) set to {} (was {})",
            address, length, protection, previous
        );
        Ok(previous)
    }

    fn restore_protection(
        &self,
        address: usize,
        length: usize,
        protection: Protection,
    ) -> Result<()> {
        for page in page_span(address, length, self.page_size) {
            self.protect_page(page, protection)?;
        }
        Ok(())
    }
}

fn unmapped() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOMEM)
}

#[cfg(target_os = "linux")]
fn query_protections(pages: &[usize]) -> Result<Vec<Protection>> {
    use procfs::process::{MMPermissions, Process};

    let first = pages.first().copied().unwrap_or_default();
    let to_error = |e: procfs::ProcError| {
        PatchError::platform(
            "read /proc/self/maps",
            first,
            pages.len(),
            io::Error::other(e.to_string()),
        )
    };

    let process = Process::myself().map_err(to_error)?;
    let maps = process.maps().map_err(to_error)?;

    pages
        .iter()
        .map(|&page| {
            let page_addr = page as u64;
            let map = maps
                .iter()
                .find(|m| m.address.0 <= page_addr && page_addr < m.address.1)
                .ok_or_else(|| PatchError::platform("query protection", page, 1, unmapped()))?;

            let mut native = 0;
            if map.perms.contains(MMPermissions::READ) {
                native |= PROT_READ;
            }
            if map.perms.contains(MMPermissions::WRITE) {
                native |= PROT_WRITE;
            }
            if map.perms.contains(MMPermissions::EXECUTE) {
                native |= PROT_EXEC;
            }
            Ok(from_native(native))
        })
        .collect()
}

#[cfg(target_os = "macos")]
fn query_protections(pages: &[usize]) -> Result<Vec<Protection>> {
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;
    use mach2::vm_region::{VM_REGION_BASIC_INFO_64, vm_region_basic_info_64};
    use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

    pages
        .iter()
        .map(|&page| {
            let mut region_addr = page as mach_vm_address_t;
            let mut region_size: mach_vm_size_t = 0;
            // SAFETY: plain-old-data out parameter for mach_vm_region.
            let mut info: vm_region_basic_info_64 = unsafe { std::mem::zeroed() };
            let mut info_count = vm_region_basic_info_64::count();
            let mut object_name: u32 = 0;

            // SAFETY: every out pointer refers to a live local of the expected type.
            let kr = unsafe {
                mach2::vm::mach_vm_region(
                    mach_task_self(),
                    &mut region_addr,
                    &mut region_size,
                    VM_REGION_BASIC_INFO_64,
                    (&mut info as *mut vm_region_basic_info_64)
                        as mach2::vm_region::vm_region_info_t,
                    &mut info_count,
                    &mut object_name,
                )
            };
            if kr != KERN_SUCCESS {
                return Err(PatchError::platform(
                    "mach_vm_region",
                    page,
                    1,
                    io::Error::other(format!("kern_return_t {}", kr)),
                ));
            }
            // mach_vm_region returns the next region when the page is unmapped
            if region_addr > page as mach_vm_address_t {
                return Err(PatchError::platform("query protection", page, 1, unmapped()));
            }
            Ok(from_native(info.protection as c_int))
        })
        .collect()
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn query_protections(pages: &[usize]) -> Result<Vec<Protection>> {
    debug!("No protection query on this platform; assuming code pages are r-x");
    Ok(vec![Protection::RX; pages.len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mapping {
        addr: *mut c_void,
        len: usize,
    }

    impl Mapping {
        fn new(pages: usize, prot: c_int) -> Self {
            let len = NativeMemory::new().page_size() * pages;
            let addr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    prot,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            assert_ne!(addr, libc::MAP_FAILED);
            Self { addr, len }
        }

        fn base(&self) -> usize {
            self.addr as usize
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.addr, self.len);
            }
        }
    }

    #[test]
    fn test_native_table_covers_every_protection() {
        for bits in 0..8u8 {
            let protection = Protection::from_bits(bits);
            assert_eq!(from_native(PROT_TABLE[bits as usize]), protection);
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(NativeMemory::new().page_size().is_power_of_two());
    }

    #[test]
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn test_set_protection_returns_previous() {
        let memory = NativeMemory::new();
        let mapping = Mapping::new(1, PROT_READ | PROT_EXEC);

        let previous = memory
            .set_protection(mapping.base() + 8, 4, Protection::RW)
            .unwrap();

        assert_eq!(previous, Protection::RX);
        assert_eq!(memory.protection(mapping.base()).unwrap(), Protection::RW);
    }

    #[test]
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn test_set_protection_covers_every_page() {
        let memory = NativeMemory::new();
        let page = memory.page_size();
        let mapping = Mapping::new(3, PROT_READ);

        // Starts near the end of page 0 and ends in page 2
        memory
            .set_protection(mapping.base() + page - 2, page + 4, Protection::RW)
            .unwrap();

        assert_eq!(memory.protection(mapping.base()).unwrap(), Protection::RW);
        assert_eq!(memory.protection(mapping.base() + page).unwrap(), Protection::RW);
        assert_eq!(
            memory.protection(mapping.base() + 2 * page).unwrap(),
            Protection::RW
        );
    }

    #[test]
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn test_restore_protection_applies_saved_value() {
        let memory = NativeMemory::new();
        let page = memory.page_size();
        let mapping = Mapping::new(2, PROT_READ | PROT_WRITE | PROT_EXEC);

        memory
            .restore_protection(mapping.base() + page - 2, 4, Protection::RX)
            .unwrap();

        assert_eq!(memory.protection(mapping.base()).unwrap(), Protection::RX);
        assert_eq!(memory.protection(mapping.base() + page).unwrap(), Protection::RX);
    }

    #[test]
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn test_partly_unmapped_range_keeps_mapped_page() {
        let memory = NativeMemory::new();
        let page = memory.page_size();
        let mapping = Mapping::new(2, PROT_READ | PROT_EXEC);
        unsafe {
            libc::munmap((mapping.base() + page) as *mut c_void, page);
        }

        let result = memory.set_protection(mapping.base() + page - 2, 4, Protection::RWX);

        assert!(matches!(result, Err(PatchError::Platform { .. })));
        assert_eq!(memory.protection(mapping.base()).unwrap(), Protection::RX);
    }
}
