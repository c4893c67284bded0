//! Call-site redirection for the running executable on x86 and x86-64.
//!
//! The executable's own symbol table is parsed once, every function is
//! decoded to find its direct `call rel32` instructions, and redirecting a
//! function rewrites the displacement of each call that targets it.

pub mod adapter;
pub mod call_index;
pub mod context;
pub mod decoder;
pub mod error;
pub mod image;
pub mod memory;
pub mod models;
pub mod redirect;
pub mod symbols;
mod utils;

pub use adapter::FunctionHandle;
pub use call_index::{CallIndex, CodeBuffer, CodeReader, IndexStats, LiveCode};
pub use context::{PatchConfig, PatchContext, PatchContextBuilder};
pub use decoder::{DecodeFault, Instruction, InstructionStream};
pub use error::{PatchError, Result};
pub use image::{ExecutableImage, ExecutableReader, ImageFormat, ImageOrigin, load_bias};
pub use memory::{
    MemoryController, NativeMemory, Protection, ProtectionSnapshot, patch_memory,
    with_temporary_protection,
};
pub use models::{CallSite, PatchedSite, Symbol};
pub use redirect::{FunctionRedirector, Redirection};
pub use symbols::{SymbolSource, SymbolTable, SymbolTableLoader, Symbols};

/// Redirects direct calls of `source` to `destination` using the global context.
///
/// # Safety
///
/// See [`FunctionRedirector::redirect_function`].
pub unsafe fn redirect_function<F: FunctionHandle>(
    source: F,
    destination: F,
) -> Result<Redirection> {
    unsafe {
        PatchContext::global()
            .redirector()
            .redirect_function(source, destination)
    }
}

/// Undoes a redirect made through the global context.
///
/// # Safety
///
/// See [`FunctionRedirector::revert`].
pub unsafe fn revert(redirection: &Redirection) -> Result<()> {
    unsafe { PatchContext::global().redirector().revert(redirection) }
}
