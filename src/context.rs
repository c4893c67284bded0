//! Patching configuration and the process-wide service that owns the
//! symbol table, the call index and the memory backend.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use log::info;

use crate::adapter::FunctionHandle;
use crate::call_index::{CallIndex, CodeReader, LiveCode};
use crate::error::{PatchError, Result};
use crate::image::ExecutableReader;
use crate::memory::{MemoryController, NativeMemory};
use crate::redirect::FunctionRedirector;
use crate::symbols::{SymbolSource, SymbolTable, SymbolTableLoader};

/// Configuration for a patch context
#[derive(Debug, Clone)]
pub struct PatchConfig {
    /// Try the live mapping of the executable before reading it from disk.
    pub read_from_memory: bool,
    /// Executable to parse. If None, uses the path of the running executable.
    pub executable_path: Option<PathBuf>,
    /// Decoder mode in bits (16, 32 or 64)
    pub bitness: u32,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            read_from_memory: cfg!(target_os = "linux"),
            executable_path: None,
            bitness: usize::BITS,
        }
    }
}

/// Process-wide patching service.
///
/// Owns the build-once symbol table and call index together with the
/// memory backend used for writes. Both caches are built on first use and
/// are read-only afterwards, so one context can be shared by every thread.
pub struct PatchContext {
    config: PatchConfig,
    symbols: SymbolTableLoader,
    call_index: OnceLock<Result<Arc<CallIndex>>>,
    memory: Box<dyn MemoryController>,
    code: Box<dyn CodeReader>,
    live_code: bool,
}

impl PatchContext {
    /// Creates a context for the running executable.
    pub fn new() -> Self {
        Self::with_config(PatchConfig::default())
    }

    /// Creates a context for the running executable with custom configuration.
    pub fn with_config(config: PatchConfig) -> Self {
        PatchContextBuilder::new().config(config).build()
    }

    pub fn builder() -> PatchContextBuilder {
        PatchContextBuilder::new()
    }

    /// Shared context for the running executable with default configuration.
    pub fn global() -> &'static PatchContext {
        static GLOBAL: OnceLock<PatchContext> = OnceLock::new();
        GLOBAL.get_or_init(PatchContext::new)
    }

    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    pub fn memory(&self) -> &dyn MemoryController {
        self.memory.as_ref()
    }

    pub fn symbol_table(&self) -> Result<Arc<SymbolTable>> {
        self.symbols.table()
    }

    /// Whether a function named `name` exists in the symbol table.
    pub fn symbol_exists(&self, name: &str) -> Result<bool> {
        Ok(self.symbol_table()?.contains(name))
    }

    /// Returns the call index, building it (and the symbol table) on first use.
    pub fn call_index(&self) -> Result<Arc<CallIndex>> {
        self.call_index
            .get_or_init(|| {
                if self.live_code && !cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
                    return Err(PatchError::Unsupported(
                        "call indexing of non-x86 code",
                    ));
                }
                let table = self.symbols.table()?;
                let index = CallIndex::build(&table, self.code.as_ref(), self.config.bitness)?;
                info!("Indexed {} call targets", index.len());
                Ok(Arc::new(index))
            })
            .clone()
    }

    pub fn redirector(&self) -> FunctionRedirector<'_> {
        FunctionRedirector::new(self)
    }

    /// Callable for the function named `name`, looked up by exact or
    /// demangled name.
    ///
    /// # Safety
    ///
    /// `F` must match the real signature and ABI of the named function.
    pub unsafe fn expose_function<F: FunctionHandle>(&self, name: &str) -> Result<F> {
        let table = self.symbol_table()?;
        let symbol = table
            .lookup_by_name(name)
            .or_else(|_| table.lookup_by_demangled_name(name))?;
        // SAFETY: the caller vouches for the signature; the address is a
        // function entry of this executable.
        Ok(unsafe { F::from_code_address(symbol.entry) })
    }
}

impl Default for PatchContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchContext")
            .field("config", &self.config)
            .field("symbols", &self.symbols)
            .field("call_index_built", &self.call_index.get().is_some())
            .finish()
    }
}

/// Builder for PatchContext with fluent API
pub struct PatchContextBuilder {
    config: PatchConfig,
    source: Option<Box<dyn SymbolSource>>,
    memory: Option<Box<dyn MemoryController>>,
    code: Option<Box<dyn CodeReader>>,
}

impl PatchContextBuilder {
    pub fn new() -> Self {
        Self {
            config: PatchConfig::default(),
            source: None,
            memory: None,
            code: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: PatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the executable read by the default symbol source.
    pub fn executable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.executable_path = Some(path.into());
        self
    }

    /// Enables or disables reading the image from the live mapping.
    pub fn read_from_memory(mut self, enable: bool) -> Self {
        self.config.read_from_memory = enable;
        self
    }

    /// Sets the decoder mode.
    pub fn bitness(mut self, bitness: u32) -> Self {
        self.config.bitness = bitness;
        self
    }

    /// Uses `source` instead of parsing the running executable.
    pub fn symbol_source(mut self, source: impl SymbolSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Uses `memory` for protection changes instead of the OS backend.
    pub fn memory(mut self, memory: impl MemoryController + 'static) -> Self {
        self.memory = Some(Box::new(memory));
        self
    }

    /// Reads code to index through `code` instead of this address space.
    pub fn code_reader(mut self, code: impl CodeReader + 'static) -> Self {
        self.code = Some(Box::new(code));
        self
    }

    pub fn build(self) -> PatchContext {
        let source = self
            .source
            .unwrap_or_else(|| Box::new(ExecutableReader::new(&self.config)));
        let live_code = self.code.is_none();

        PatchContext {
            symbols: SymbolTableLoader::new(source),
            call_index: OnceLock::new(),
            memory: self.memory.unwrap_or_else(|| Box::new(NativeMemory::new())),
            code: self.code.unwrap_or_else(|| Box::new(LiveCode)),
            live_code,
            config: self.config,
        }
    }
}

impl Default for PatchContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
