//! Immutable function symbol index and its build-once loader.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, OnceLock};

use log::{debug, info};

use crate::error::{PatchError, Result};
use crate::models::Symbol;

/// Name and address index over the functions of one executable.
#[derive(Debug, Default)]
pub struct SymbolTable {
    /// Sorted by entry address.
    symbols: Vec<Symbol>,
    by_name: HashMap<String, usize>,
    by_demangled: HashMap<String, usize>,
}

impl SymbolTable {
    /// Builds the table. Names and entry addresses must be unique; later
    /// duplicates of either are dropped.
    pub fn new(mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by(|a, b| a.entry.cmp(&b.entry).then_with(|| a.name.cmp(&b.name)));
        symbols.dedup_by(|later, first| {
            let alias = later.entry == first.entry;
            if alias {
                debug!("Dropping alias {} of {} at 0x{:x}", later.name, first.name, later.entry);
            }
            alias
        });

        let mut seen = HashMap::with_capacity(symbols.len());
        symbols.retain(|s| match seen.entry(s.name.clone()) {
            Entry::Occupied(_) => {
                debug!("Dropping duplicate symbol {} at 0x{:x}", s.name, s.entry);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
        });

        let by_name = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        // Demangled paths without hash are only indexed when unambiguous
        let mut by_demangled: HashMap<String, Option<usize>> = HashMap::new();
        for (i, symbol) in symbols.iter().enumerate() {
            let Ok(demangled) = rustc_demangle::try_demangle(&symbol.name) else {
                continue;
            };
            let path = format!("{:#}", demangled);
            if path == symbol.name {
                continue;
            }
            by_demangled
                .entry(path)
                .and_modify(|slot| *slot = None)
                .or_insert(Some(i));
        }
        let by_demangled = by_demangled
            .into_iter()
            .filter_map(|(path, slot)| slot.map(|i| (path, i)))
            .collect();

        Self {
            symbols,
            by_name,
            by_demangled,
        }
    }

    pub fn lookup_by_name(&self, name: &str) -> Result<&Symbol> {
        self.by_name
            .get(name)
            .map(|&i| &self.symbols[i])
            .ok_or_else(|| PatchError::not_found("symbol", name))
    }

    /// Looks up a Rust function by its demangled path, e.g. `my_crate::module::function`.
    pub fn lookup_by_demangled_name(&self, path: &str) -> Result<&Symbol> {
        self.by_demangled
            .get(path)
            .map(|&i| &self.symbols[i])
            .ok_or_else(|| PatchError::not_found("symbol", path))
    }

    /// Symbol whose `[entry, end)` range contains `address`.
    pub fn lookup_by_address(&self, address: usize) -> Result<&Symbol> {
        let idx = self.symbols.partition_point(|s| s.entry <= address);
        idx.checked_sub(1)
            .map(|i| &self.symbols[i])
            .filter(|s| s.contains(address))
            .ok_or_else(|| PatchError::not_found("symbol for address", format!("0x{:x}", address)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Every symbol in entry order. Each call starts a fresh pass.
    pub fn enumerate(&self) -> Symbols<'_> {
        Symbols {
            inner: self.symbols.iter(),
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl<'a> IntoIterator for &'a SymbolTable {
    type Item = &'a Symbol;
    type IntoIter = Symbols<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.enumerate()
    }
}

/// Iterator over the symbols of a [`SymbolTable`].
#[derive(Debug, Clone)]
pub struct Symbols<'a> {
    inner: std::slice::Iter<'a, Symbol>,
}

impl<'a> Iterator for Symbols<'a> {
    type Item = &'a Symbol;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Symbols<'_> {}

/// Produces a symbol table, typically by reading an executable image.
pub trait SymbolSource: Send + Sync {
    fn load(&self) -> Result<SymbolTable>;
}

/// Builds a symbol table at most once and hands the same result to every caller.
pub struct SymbolTableLoader {
    source: Box<dyn SymbolSource>,
    table: OnceLock<Result<Arc<SymbolTable>>>,
}

impl SymbolTableLoader {
    pub fn new(source: Box<dyn SymbolSource>) -> Self {
        Self {
            source,
            table: OnceLock::new(),
        }
    }

    /// Returns the cached table, building it on first use. Concurrent first
    /// callers block until the single build finishes. A failed build is
    /// cached as well.
    pub fn table(&self) -> Result<Arc<SymbolTable>> {
        self.table
            .get_or_init(|| {
                let table = self.source.load()?;
                info!("Symbol table built with {} functions", table.len());
                Ok(Arc::new(table))
            })
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.table.get().is_some()
    }
}

impl fmt::Debug for SymbolTableLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolTableLoader")
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
