//! Acquisition and parsing of the running executable's own image.

use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::PathBuf;

use log::{debug, warn};
use object::{
    FileKind, Object, ObjectSection, ObjectSymbol, ObjectSymbolTable, SymbolKind, SymbolSection,
};

use crate::context::PatchConfig;
use crate::error::{PatchError, Result};
use crate::models::Symbol;
use crate::symbols::{SymbolSource, SymbolTable};

const TEXT_SECTIONS: [&str; 2] = [".text", "__text"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Elf,
    MachO,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Elf => write!(f, "ELF"),
            ImageFormat::MachO => write!(f, "Mach-O"),
        }
    }
}

/// Where the image bytes were read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOrigin {
    /// The process's own mapping of its executable, starting at `base`.
    Memory { base: usize },
    Disk(PathBuf),
    Buffer,
}

/// Bytes of an executable together with their detected container format.
#[derive(Debug, Clone)]
pub struct ExecutableImage {
    data: Vec<u8>,
    format: ImageFormat,
    origin: ImageOrigin,
}

impl ExecutableImage {
    pub fn parse(data: Vec<u8>, origin: ImageOrigin) -> Result<Self> {
        let kind = FileKind::parse(data.as_slice())?;
        let format = match kind {
            FileKind::Elf32 | FileKind::Elf64 => ImageFormat::Elf,
            FileKind::MachO32 | FileKind::MachO64 => ImageFormat::MachO,
            _ => return Err(PatchError::Unsupported("only ELF and Mach-O images carry symbols")),
        };
        Ok(Self {
            data,
            format,
            origin,
        })
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn origin(&self) -> &ImageOrigin {
        &self.origin
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Link-time address range of the code section.
    pub fn text_range(&self) -> Result<Range<u64>> {
        let file = object::File::parse(self.data.as_slice())?;
        let text = text_section(&file)?;
        Ok(text.address()..text.address() + text.size())
    }

    /// Functions defined in the code section, rebased by `bias`.
    pub fn symbols(&self, bias: usize) -> Result<Vec<Symbol>> {
        let file = object::File::parse(self.data.as_slice())?;
        let text = text_section(&file)?;
        let text_range = text.address()..text.address() + text.size();

        let table = match file.symbol_table() {
            Some(table) => table,
            None => {
                warn!("Executable has no static symbol table; falling back to dynamic symbols");
                file.dynamic_symbol_table()
                    .ok_or_else(|| PatchError::not_found("symbol table", ".symtab"))?
            }
        };

        let raw = table
            .symbols()
            .filter(|sym| sym.kind() == SymbolKind::Text && sym.is_definition())
            .filter(|sym| sym.section() == SymbolSection::Section(text.index()))
            .filter_map(|sym| match sym.name() {
                Ok(name) if !name.is_empty() => Some(RawSymbol {
                    name: name.to_string(),
                    address: sym.address(),
                    size: sym.size(),
                }),
                _ => None,
            })
            .collect();

        Ok(bound_symbols(raw, text_range, bias))
    }
}

fn text_section<'data, 'file>(
    file: &'file object::File<'data>,
) -> Result<object::Section<'data, 'file>> {
    TEXT_SECTIONS
        .iter()
        .find_map(|name| file.section_by_name(name))
        .ok_or_else(|| PatchError::not_found("section", TEXT_SECTIONS[0]))
}

struct RawSymbol {
    name: String,
    address: u64,
    size: u64,
}

/// Turns raw symbol records into `[entry, end)` ranges inside `text`.
///
/// A symbol without a size extends to the next higher entry or the end of
/// the section. A sized symbol is clipped at the next higher entry so
/// ranges never overlap.
fn bound_symbols(mut raw: Vec<RawSymbol>, text: Range<u64>, bias: usize) -> Vec<Symbol> {
    raw.retain(|sym| text.contains(&sym.address));
    raw.sort_by_key(|sym| sym.address);

    let mut symbols = Vec::with_capacity(raw.len());
    for (i, sym) in raw.iter().enumerate() {
        let next = raw[i + 1..]
            .iter()
            .map(|other| other.address)
            .find(|&address| address > sym.address)
            .unwrap_or(text.end);

        let end = if sym.size > 0 {
            sym.address.saturating_add(sym.size).min(next)
        } else {
            next
        };
        if end <= sym.address {
            continue;
        }

        symbols.push(Symbol::new(
            sym.name.clone(),
            (sym.address as usize).wrapping_add(bias),
            (end as usize).wrapping_add(bias),
        ));
    }
    symbols
}

/// Reads the running executable and produces its symbol table.
///
/// The live mapping is tried first when enabled; the file on disk is used
/// when that is unavailable or does not parse.
#[derive(Debug, Clone)]
pub struct ExecutableReader {
    read_from_memory: bool,
    executable_path: Option<PathBuf>,
}

impl ExecutableReader {
    pub fn new(config: &PatchConfig) -> Self {
        Self {
            read_from_memory: config.read_from_memory,
            executable_path: config.executable_path.clone(),
        }
    }

    pub fn executable_path(&self) -> Result<PathBuf> {
        match &self.executable_path {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(|e| PatchError::io("current executable", e)),
        }
    }

    pub fn read_from_disk(&self) -> Result<ExecutableImage> {
        let path = self.executable_path()?;
        debug!("Reading executable image from {}", path.display());
        let data = fs::read(&path).map_err(|e| PatchError::io(&path, e))?;
        ExecutableImage::parse(data, ImageOrigin::Disk(path))
    }

    /// Reads the executable's live mapping through `/proc/self/mem`.
    ///
    /// The leading file-backed mappings must mirror the file layout, and the
    /// image only parses when they also cover the section header table. The
    /// loader maps just the `PT_LOAD` segments, which usually end before that
    /// table, so a normally started program gets a parse error here and
    /// [`SymbolSource::load`] falls back to the file on disk. A file mapped
    /// whole, as some packers and in-memory loaders do, reads completely.
    #[cfg(target_os = "linux")]
    pub fn read_from_memory(&self) -> Result<ExecutableImage> {
        use std::io::{Read, Seek, SeekFrom};

        let path = self.executable_path()?;
        let (base, end) = live_image_range(&path)?;

        let mut content = vec![0u8; end - base];
        let mut file = fs::File::open("/proc/self/mem")
            .map_err(|e| PatchError::io("/proc/self/mem", e))?;
        file.seek(SeekFrom::Start(base as u64))
            .and_then(|_| file.read_exact(&mut content))
            .map_err(|e| PatchError::io("/proc/self/mem", e))?;

        debug!(
            "Read {} bytes of executable image from memory at 0x{:x}",
            content.len(),
            base
        );
        ExecutableImage::parse(content, ImageOrigin::Memory { base })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn read_from_memory(&self) -> Result<ExecutableImage> {
        Err(PatchError::Unsupported(
            "reading the executable image from memory",
        ))
    }
}

impl SymbolSource for ExecutableReader {
    fn load(&self) -> Result<SymbolTable> {
        let bias = load_bias();

        if self.read_from_memory {
            match self
                .read_from_memory()
                .and_then(|image| image.symbols(bias))
            {
                Ok(symbols) => return Ok(SymbolTable::new(symbols)),
                Err(e) => debug!("In-memory image unusable ({}); reading from disk", e),
            }
        }

        let image = self.read_from_disk()?;
        debug!("Parsing {} image ({} bytes)", image.format(), image.data().len());
        Ok(SymbolTable::new(image.symbols(bias)?))
    }
}

/// Start and end of the executable's leading file-backed mappings, provided
/// they mirror the file layout byte for byte.
#[cfg(target_os = "linux")]
fn live_image_range(path: &std::path::Path) -> Result<(usize, usize)> {
    use procfs::process::{MMapPath, Process};

    let to_error = |e: procfs::ProcError| {
        PatchError::io("/proc/self/maps", std::io::Error::other(e.to_string()))
    };
    let maps = Process::myself()
        .map_err(to_error)?
        .maps()
        .map_err(to_error)?;

    let mut range: Option<(u64, u64)> = None;
    for map in maps.iter() {
        let same_file = matches!(&map.pathname, MMapPath::Path(p) if p.as_path() == path);
        if !same_file {
            continue;
        }
        match range {
            None if map.offset == 0 => range = Some(map.address),
            Some((base, end)) if map.address.0 == end && map.offset == end - base => {
                range = Some((base, map.address.1));
            }
            _ => break,
        }
    }

    range
        .map(|(base, end)| (base as usize, end as usize))
        .ok_or_else(|| PatchError::not_found("mapping", path.display().to_string()))
}

/// Difference between run-time and link-time addresses of the main
/// executable. Zero for images loaded at their linked address.
#[cfg(target_os = "linux")]
pub fn load_bias() -> usize {
    use libc::{c_int, c_void, dl_phdr_info, size_t};

    unsafe extern "C" fn first_object(
        info: *mut dl_phdr_info,
        _size: size_t,
        data: *mut c_void,
    ) -> c_int {
        // SAFETY: the loader passes a valid info record and our own out pointer.
        unsafe {
            *(data as *mut usize) = (*info).dlpi_addr as usize;
        }
        1 // the main executable is reported first
    }

    let mut bias: usize = 0;
    // SAFETY: the callback only writes through the pointer we hand it.
    unsafe {
        libc::dl_iterate_phdr(Some(first_object), &mut bias as *mut usize as *mut c_void);
    }
    bias
}

#[cfg(target_os = "macos")]
pub fn load_bias() -> usize {
    // SAFETY: image 0 is always the main executable.
    unsafe { libc::_dyld_get_image_vmaddr_slide(0) as usize }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn load_bias() -> usize {
    0
}
