//! Page protection control and in-place byte patching for the running process.
//!
//! Protection is changed page by page over every page overlapping the
//! requested range. The range is assumed to carry one uniform protection:
//! the snapshot taken before a change records the protection of the first
//! page only, and restoring it applies that value to the whole range. A
//! mixed range is reported with a warning but not special-cased.

#[cfg(unix)]
mod posix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use posix::NativeMemory;
#[cfg(windows)]
pub use windows::NativeMemory;

use std::fmt;
use std::ptr;

use log::{error, trace, warn};

use crate::error::{PatchError, Result};
use crate::utils::hex_bytes;

/// Portable page protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    None,
    R,
    W,
    X,
    RW,
    RX,
    WX,
    RWX,
}

impl Protection {
    pub const READ: u8 = 0x1;
    pub const WRITE: u8 = 0x2;
    pub const EXEC: u8 = 0x4;

    pub const fn bits(self) -> u8 {
        match self {
            Protection::None => 0,
            Protection::R => Self::READ,
            Protection::W => Self::WRITE,
            Protection::X => Self::EXEC,
            Protection::RW => Self::READ | Self::WRITE,
            Protection::RX => Self::READ | Self::EXEC,
            Protection::WX => Self::WRITE | Self::EXEC,
            Protection::RWX => Self::READ | Self::WRITE | Self::EXEC,
        }
    }

    /// Builds a protection from R/W/X bits; any other bit is ignored.
    pub const fn from_bits(bits: u8) -> Self {
        match bits & (Self::READ | Self::WRITE | Self::EXEC) {
            0 => Protection::None,
            0x1 => Protection::R,
            0x2 => Protection::W,
            0x3 => Protection::RW,
            0x4 => Protection::X,
            0x5 => Protection::RX,
            0x6 => Protection::WX,
            _ => Protection::RWX,
        }
    }

    pub fn is_readable(self) -> bool {
        self.bits() & Self::READ != 0
    }

    pub fn is_writable(self) -> bool {
        self.bits() & Self::WRITE != 0
    }

    pub fn is_executable(self) -> bool {
        self.bits() & Self::EXEC != 0
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.is_readable() { 'r' } else { '-' },
            if self.is_writable() { 'w' } else { '-' },
            if self.is_executable() { 'x' } else { '-' }
        )
    }
}

/// Protection a range held before it was temporarily changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionSnapshot {
    pub address: usize,
    pub length: usize,
    pub protection: Protection,
}

impl ProtectionSnapshot {
    pub fn restore(&self, memory: &dyn MemoryController) -> Result<()> {
        memory.restore_protection(self.address, self.length, self.protection)
    }
}

/// OS page protection backend.
pub trait MemoryController: Send + Sync {
    fn page_size(&self) -> usize;

    /// Current protection of the page containing `address`.
    fn protection(&self, address: usize) -> Result<Protection>;

    /// Applies `protection` to every page overlapping `[address, address + length)`
    /// and returns the protection the range had before.
    fn set_protection(&self, address: usize, length: usize, protection: Protection)
    -> Result<Protection>;

    /// Puts a saved protection back on `[address, address + length)`.
    ///
    /// Called while a range is still writable and executable, so backends
    /// should apply the value directly without querying the range first.
    fn restore_protection(
        &self,
        address: usize,
        length: usize,
        protection: Protection,
    ) -> Result<()> {
        self.set_protection(address, length, protection).map(|_| ())
    }
}

/// Start addresses of every page overlapping `[address, address + length)`.
pub fn page_span(address: usize, length: usize, page_size: usize) -> impl Iterator<Item = usize> {
    let mask = !(page_size - 1);
    let first = address & mask;
    let end = if length == 0 {
        first
    } else {
        address.saturating_add(length)
    };
    (first..end).step_by(page_size)
}

/// Applies `protection` to each page of the range through `change`.
///
/// When a page fails, the pages already changed are set back to `previous`
/// and the page's error is returned. If that rollback fails too, the result
/// is [`PatchError::RestoreFailed`] since part of the range keeps the new
/// protection.
pub(crate) fn change_pages(
    address: usize,
    length: usize,
    page_size: usize,
    protection: Protection,
    previous: Protection,
    mut change: impl FnMut(usize, Protection) -> Result<()>,
) -> Result<()> {
    let mut changed = 0;
    for page in page_span(address, length, page_size) {
        let Err(e) = change(page, protection) else {
            changed += 1;
            continue;
        };
        if changed == 0 {
            return Err(e);
        }

        for done in page_span(address, length, page_size).take(changed) {
            if let Err(rollback) = change(done, previous) {
                error!(
                    "Protection change of 0x{:x} failed ({}) and 0x{:x} stays {}",
                    page, e, done, protection
                );
                return Err(PatchError::RestoreFailed {
                    address,
                    length,
                    original: Vec::new(),
                    source: Box::new(rollback),
                });
            }
        }
        warn!(
            "Protection change of 0x{:x} failed; {} earlier pages set back to {}",
            page, changed, previous
        );
        return Err(e);
    }
    Ok(())
}

/// Reverts a protection change when dropped, including during unwinding.
struct ProtectionGuard<'a> {
    memory: &'a dyn MemoryController,
    snapshot: Option<ProtectionSnapshot>,
}

impl<'a> ProtectionGuard<'a> {
    fn open(
        memory: &'a dyn MemoryController,
        address: usize,
        length: usize,
        protection: Protection,
    ) -> Result<Self> {
        let previous = memory.set_protection(address, length, protection)?;
        trace!(
            "Opened 0x{:x} (+{}) as {} (was {})",
            address, length, protection, previous
        );
        Ok(Self {
            memory,
            snapshot: Some(ProtectionSnapshot {
                address,
                length,
                protection: previous,
            }),
        })
    }

    fn restore(mut self) -> Result<()> {
        match self.snapshot.take() {
            Some(snapshot) => snapshot.restore(self.memory),
            None => Ok(()),
        }
    }
}

impl Drop for ProtectionGuard<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take()
            && let Err(e) = snapshot.restore(self.memory)
        {
            error!(
                "Failed to restore protection of 0x{:x} during unwind: {}",
                snapshot.address, e
            );
        }
    }
}

/// Outcome of an operation run inside a protection window, together with
/// the error of the restore that closed it.
struct Windowed<T> {
    outcome: Result<T>,
    restore: Result<()>,
}

fn run_windowed<T>(
    memory: &dyn MemoryController,
    address: usize,
    length: usize,
    protection: Protection,
    operation: impl FnOnce() -> Result<T>,
) -> Result<Windowed<T>> {
    let guard = ProtectionGuard::open(memory, address, length, protection)?;
    let outcome = operation();
    Ok(Windowed {
        outcome,
        restore: guard.restore(),
    })
}

fn restore_failed(
    address: usize,
    length: usize,
    protection: Protection,
    original: Vec<u8>,
    source: PatchError,
) -> PatchError {
    error!(
        "Protection of 0x{:x} (+{}) left as {}: {}",
        address, length, protection, source
    );
    PatchError::RestoreFailed {
        address,
        length,
        original,
        source: Box::new(source),
    }
}

/// Runs `operation` with `[address, address + length)` temporarily set to
/// `protection`, then restores the previous protection.
///
/// Restoration is attempted whether `operation` returns an error or panics.
/// A failed restoration is reported as [`PatchError::RestoreFailed`] even when
/// `operation` itself failed, since the range is left in its temporary state.
pub fn with_temporary_protection<T>(
    memory: &dyn MemoryController,
    address: usize,
    length: usize,
    protection: Protection,
    operation: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let window = run_windowed(memory, address, length, protection, operation)?;
    match window.restore {
        Ok(()) => window.outcome,
        Err(e) => {
            if let Err(op_err) = &window.outcome {
                error!("Operation on 0x{:x} failed before restore: {}", address, op_err);
            }
            Err(restore_failed(address, length, protection, Vec::new(), e))
        }
    }
}

/// Overwrites `new_bytes.len()` bytes at `address` and returns the bytes
/// that were there before.
///
/// The range is opened read/write/execute only for the copy. Passing the
/// returned bytes back restores the original content. When the write lands
/// but the protection cannot be restored, the error is
/// [`PatchError::RestoreFailed`] with the replaced bytes in `original`.
///
/// # Safety
///
/// `address` must point to `new_bytes.len()` bytes of mapped memory owned by
/// this process, and the new content must leave any code in that range
/// immediately valid for threads that may be executing it.
pub unsafe fn patch_memory(
    memory: &dyn MemoryController,
    address: usize,
    new_bytes: &[u8],
) -> Result<Vec<u8>> {
    let length = new_bytes.len();
    if length == 0 {
        return Ok(Vec::new());
    }

    let window = run_windowed(memory, address, length, Protection::RWX, || {
        let target = address as *mut u8;
        let mut old_bytes = vec![0u8; length];
        // SAFETY: the caller guarantees the range is mapped; it is readable
        // and writable while the window is open.
        unsafe {
            ptr::copy_nonoverlapping(target, old_bytes.as_mut_ptr(), length);
            ptr::copy_nonoverlapping(new_bytes.as_ptr(), target, length);
        }
        trace!(
            "Patched 0x{:x}: [{}] -> [{}]",
            address,
            hex_bytes(&old_bytes),
            hex_bytes(new_bytes)
        );
        Ok(old_bytes)
    })?;

    match (window.outcome, window.restore) {
        (outcome, Ok(())) => outcome,
        (Ok(old_bytes), Err(e)) => {
            Err(restore_failed(address, length, Protection::RWX, old_bytes, e))
        }
        (Err(_), Err(e)) => {
            Err(restore_failed(address, length, Protection::RWX, Vec::new(), e))
        }
    }
}
