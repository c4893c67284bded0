#![allow(dead_code)]

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use callpatch::{
    MemoryController, NativeMemory, Protection, Result, Symbol, SymbolSource, SymbolTable,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Anonymous mapping holding machine code, left read/execute like a real
/// text section.
#[cfg(unix)]
pub struct CodePage {
    addr: *mut libc::c_void,
    len: usize,
}

// The mapping is only touched through raw addresses.
#[cfg(unix)]
unsafe impl Send for CodePage {}
#[cfg(unix)]
unsafe impl Sync for CodePage {}

#[cfg(unix)]
impl CodePage {
    pub fn new(code: &[u8]) -> Self {
        let len = NativeMemory::new().page_size();
        assert!(code.len() <= len);

        unsafe {
            let addr = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(addr, libc::MAP_FAILED);

            ptr::write_bytes(addr as *mut u8, 0xcc, len); // int3 padding
            ptr::copy_nonoverlapping(code.as_ptr(), addr as *mut u8, code.len());
            assert_eq!(
                libc::mprotect(addr, len, libc::PROT_READ | libc::PROT_EXEC),
                0
            );

            Self { addr, len }
        }
    }

    pub fn base(&self) -> usize {
        self.addr as usize
    }

    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts((self.addr as *const u8).add(offset), len).to_vec() }
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        let raw = self.read(offset, 4);
        i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    }
}

#[cfg(unix)]
impl Drop for CodePage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

/// Symbol source returning a fixed list and counting how often it runs.
pub struct StaticSymbols {
    pub symbols: Vec<Symbol>,
    pub loads: Arc<AtomicUsize>,
}

impl StaticSymbols {
    pub fn new(symbols: Vec<Symbol>) -> Self {
        Self {
            symbols,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl SymbolSource for StaticSymbols {
    fn load(&self) -> Result<SymbolTable> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(SymbolTable::new(self.symbols.clone()))
    }
}

/// Native memory backend that counts protection changes.
#[derive(Clone)]
pub struct CountingMemory {
    inner: NativeMemory,
    pub changes: Arc<AtomicUsize>,
}

impl CountingMemory {
    pub fn new() -> Self {
        Self {
            inner: NativeMemory::new(),
            changes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn changes(&self) -> usize {
        self.changes.load(Ordering::SeqCst)
    }
}

impl MemoryController for CountingMemory {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn protection(&self, address: usize) -> Result<Protection> {
        self.inner.protection(address)
    }

    fn set_protection(
        &self,
        address: usize,
        length: usize,
        protection: Protection,
    ) -> Result<Protection> {
        self.changes.fetch_add(1, Ordering::SeqCst);
        self.inner.set_protection(address, length, protection)
    }

    fn restore_protection(
        &self,
        address: usize,
        length: usize,
        protection: Protection,
    ) -> Result<()> {
        self.changes.fetch_add(1, Ordering::SeqCst);
        self.inner.restore_protection(address, length, protection)
    }
}
