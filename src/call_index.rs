//! Reverse index from call targets to the direct call sites that reach them.

use std::collections::HashMap;
use std::fmt;

use log::{debug, info, warn};

use crate::decoder::{Instruction, InstructionStream};
use crate::error::Result;
use crate::models::{CallSite, Symbol};
use crate::symbols::SymbolTable;
use crate::utils::fault_window;

/// Source of the code bytes to scan.
pub trait CodeReader: Send + Sync {
    /// Bytes of `[start, end)`, or `None` when the range cannot be read.
    fn bytes(&self, start: usize, end: usize) -> Option<&[u8]>;
}

/// Reads code straight from this process's address space.
///
/// Ranges are trusted to come from the running executable's symbol table.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveCode;

impl CodeReader for LiveCode {
    fn bytes(&self, start: usize, end: usize) -> Option<&[u8]> {
        if start == 0 || end <= start {
            return None;
        }
        // SAFETY: symbol ranges of the running executable lie in its mapped,
        // readable code section, which is never unmapped.
        Some(unsafe { std::slice::from_raw_parts(start as *const u8, end - start) })
    }
}

/// Code held in an owned buffer laid out at `base`.
#[derive(Debug, Clone)]
pub struct CodeBuffer {
    base: usize,
    bytes: Vec<u8>,
}

impl CodeBuffer {
    pub fn new(base: usize, bytes: Vec<u8>) -> Self {
        Self { base, bytes }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn end(&self) -> usize {
        self.base + self.bytes.len()
    }
}

impl CodeReader for CodeBuffer {
    fn bytes(&self, start: usize, end: usize) -> Option<&[u8]> {
        let from = start.checked_sub(self.base)?;
        let to = end.checked_sub(self.base)?;
        self.bytes.get(from..to)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub functions_scanned: usize,
    /// Functions whose decoding stopped at an undecodable instruction.
    pub functions_aborted: usize,
    pub instructions: usize,
    pub call_sites: usize,
}

impl fmt::Display for IndexStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} functions ({} aborted), {} instructions, {} call sites",
            self.functions_scanned, self.functions_aborted, self.instructions, self.call_sites
        )
    }
}

/// Map from call target address to the call sites referencing it, in
/// discovery order.
#[derive(Debug, Default)]
pub struct CallIndex {
    sites: HashMap<usize, Vec<CallSite>>,
    stats: IndexStats,
}

impl CallIndex {
    /// Decodes every symbol of `table` and records each direct call.
    ///
    /// A function that fails to decode keeps the call sites found before the
    /// fault and is otherwise skipped.
    pub fn build(table: &SymbolTable, code: &dyn CodeReader, bitness: u32) -> Result<Self> {
        let mut index = CallIndex::default();

        for symbol in table.enumerate() {
            let Some(bytes) = code.bytes(symbol.entry, symbol.end) else {
                debug!(
                    "Skipping {} at 0x{:x}: code not readable",
                    symbol.name, symbol.entry
                );
                continue;
            };
            index.scan(symbol, bytes, bitness)?;
        }

        info!("Call index built: {}", index.stats);
        Ok(index)
    }

    fn scan(&mut self, symbol: &Symbol, bytes: &[u8], bitness: u32) -> Result<()> {
        self.stats.functions_scanned += 1;

        for instruction in InstructionStream::new(bitness, bytes, symbol.entry)? {
            match instruction {
                Ok(Instruction::DirectCall {
                    call_site, target, ..
                }) => {
                    self.stats.instructions += 1;
                    self.stats.call_sites += 1;
                    self.sites.entry(target).or_default().push(call_site);
                }
                Ok(Instruction::Other { .. }) => self.stats.instructions += 1,
                Err(fault) => {
                    self.stats.functions_aborted += 1;
                    warn!("Stopped indexing {}: {}", symbol.name, fault);
                    let offset = fault.address - symbol.entry;
                    debug!("{}", fault_window(bytes, offset, fault.address));
                }
            }
        }
        Ok(())
    }

    /// Call sites whose call targets `address`.
    pub fn call_sites(&self, address: usize) -> Option<&[CallSite]> {
        self.sites.get(&address).map(Vec::as_slice)
    }

    /// Iterates over every indexed target and its call sites.
    pub fn targets(&self) -> impl Iterator<Item = (usize, &[CallSite])> {
        self.sites.iter().map(|(target, sites)| (*target, sites.as_slice()))
    }

    /// Number of distinct call targets.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x40_0000;

    /// a: ret
    /// b: push rbp; call a; call a; pop rbp; ret
    /// c: call b; <invalid>; call a
    fn fixture() -> (SymbolTable, CodeBuffer) {
        let mut code = vec![0xcc; 0x30];
        code[0x00] = 0xc3;

        let b = [0x55, 0xe8, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0, 0x5d, 0xc3];
        code[0x10..0x10 + b.len()].copy_from_slice(&b);
        code[0x12..0x16].copy_from_slice(&(0x00i32 - 0x16).to_le_bytes());
        code[0x17..0x1b].copy_from_slice(&(0x00i32 - 0x1b).to_le_bytes());

        let c = [0xe8, 0, 0, 0, 0, 0x06, 0xe8, 0, 0, 0, 0];
        code[0x20..0x20 + c.len()].copy_from_slice(&c);
        code[0x21..0x25].copy_from_slice(&(0x10i32 - 0x25).to_le_bytes());
        code[0x27..0x2b].copy_from_slice(&(0x00i32 - 0x2b).to_le_bytes());

        let table = SymbolTable::new(vec![
            Symbol::new("a", BASE, BASE + 0x10),
            Symbol::new("b", BASE + 0x10, BASE + 0x1d),
            Symbol::new("c", BASE + 0x20, BASE + 0x2b),
        ]);
        (table, CodeBuffer::new(BASE, code))
    }

    #[test]
    fn test_sites_in_discovery_order() {
        let (table, code) = fixture();
        let index = CallIndex::build(&table, &code, 64).unwrap();

        assert_eq!(
            index.call_sites(BASE).unwrap(),
            &[BASE + 0x12, BASE + 0x17]
        );
        assert_eq!(index.call_sites(BASE + 0x10).unwrap(), &[BASE + 0x21]);
    }

    #[test]
    fn test_displacement_resolves_to_target() {
        let (table, code) = fixture();
        let index = CallIndex::build(&table, &code, 64).unwrap();

        for (target, sites) in index.targets() {
            for &site in sites {
                let raw = code.bytes(site, site + 4).unwrap();
                let disp = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                assert_eq!((site + 4).wrapping_add_signed(disp as isize), target);
            }
        }
    }

    #[test]
    fn test_decode_fault_aborts_only_that_function() {
        let (table, code) = fixture();
        let index = CallIndex::build(&table, &code, 64).unwrap();

        let stats = index.stats();
        assert_eq!(stats.functions_scanned, 3);
        assert_eq!(stats.functions_aborted, 1);
        assert_eq!(stats.call_sites, 3);
        // The call in c after the invalid byte is never seen
        assert!(!index.call_sites(BASE).unwrap().contains(&(BASE + 0x27)));
    }

    #[test]
    fn test_uncalled_function_has_no_sites() {
        let (table, code) = fixture();
        let index = CallIndex::build(&table, &code, 64).unwrap();

        assert!(index.call_sites(BASE + 0x20).is_none());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_unreadable_symbol_is_skipped() {
        let (_, code) = fixture();
        let table = SymbolTable::new(vec![Symbol::new("outside", 0x1000, 0x1010)]);
        let index = CallIndex::build(&table, &code, 64).unwrap();

        assert!(index.is_empty());
        assert_eq!(index.stats().functions_scanned, 0);
    }

    #[test]
    fn test_code_buffer_bounds() {
        let code = CodeBuffer::new(0x1000, vec![1, 2, 3, 4]);
        assert_eq!(code.bytes(0x1001, 0x1003), Some(&[2u8, 3][..]));
        assert_eq!(code.bytes(0x0fff, 0x1002), None);
        assert_eq!(code.bytes(0x1002, 0x1005), None);
        assert_eq!(code.end(), 0x1004);
    }
}
