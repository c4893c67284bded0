//! `VirtualProtect` backend.

use std::io;
use std::mem;

use log::debug;
use windows_sys::Win32::System::Memory::{
    MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
    PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY, VirtualProtect, VirtualQuery,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use super::{MemoryController, Protection, change_pages, page_span};
use crate::error::{PatchError, Result};

/// Native protection for each portable value, indexed by `Protection::bits()`.
/// Windows has no write-only pages: `-w-` and `-wx` map to the nearest
/// superset.
const PROT_TABLE: [PAGE_PROTECTION_FLAGS; 8] = [
    PAGE_NOACCESS,          // ---
    PAGE_READONLY,          // r--
    PAGE_READWRITE,         // -w-
    PAGE_READWRITE,         // rw-
    PAGE_EXECUTE,           // --x
    PAGE_EXECUTE_READ,      // r-x
    PAGE_EXECUTE_READWRITE, // -wx
    PAGE_EXECUTE_READWRITE, // rwx
];

fn to_native(protection: Protection) -> PAGE_PROTECTION_FLAGS {
    PROT_TABLE[protection.bits() as usize]
}

/// Maps the low protection byte; modifier bits such as `PAGE_GUARD` are dropped.
fn from_native(native: PAGE_PROTECTION_FLAGS) -> Protection {
    match native & 0xff {
        PAGE_READONLY => Protection::R,
        PAGE_READWRITE | PAGE_WRITECOPY => Protection::RW,
        PAGE_EXECUTE => Protection::X,
        PAGE_EXECUTE_READ => Protection::RX,
        PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY => Protection::RWX,
        _ => Protection::None,
    }
}

/// Protection controller for the current process.
#[derive(Debug, Clone, Copy)]
pub struct NativeMemory {
    page_size: usize,
}

impl NativeMemory {
    pub fn new() -> Self {
        // SAFETY: GetSystemInfo fills the provided struct and cannot fail.
        let page_size = unsafe {
            let mut info: SYSTEM_INFO = mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        };
        Self {
            page_size: if page_size == 0 { 4096 } else { page_size },
        }
    }

    fn protect_page(&self, page: usize, protection: Protection) -> Result<()> {
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        // SAFETY: only the protection of committed pages is changed.
        let ok = unsafe {
            VirtualProtect(page as *const _, self.page_size, to_native(protection), &mut old)
        };
        if ok == 0 {
            return Err(PatchError::platform(
                "VirtualProtect",
                page,
                self.page_size,
                io::Error::last_os_error(),
            ));
        }
        Ok(())
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
        // SAFETY: VirtualQuery only inspects the address space.
        let (written, info) = unsafe {
            let mut info: MEMORY_BASIC_INFORMATION = mem::zeroed();
            let written = VirtualQuery(
                address as *const _,
                &mut info,
                mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            );
            (written, info)
        };
        if written == 0 {
            return Err(PatchError::platform(
                "VirtualQuery",
                address,
                1,
                io::Error::last_os_error(),
            ));
        }
        if info.State != MEM_COMMIT {
            return Ok(Protection::None);
        }
        Ok(from_native(info.Protect))
    }

    fn set_protection(
        &self,
        address: usize,
        length: usize,
        protection: Protection,
    ) -> Result<Protection> {
        let previous = self.protection(address)?;

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
