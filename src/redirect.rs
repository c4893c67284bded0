//! Rewriting direct call sites so they reach a different function.

use log::{debug, info};

use crate::adapter::FunctionHandle;
use crate::context::PatchContext;
use crate::error::{PatchError, Result};
use crate::memory::patch_memory;
use crate::models::{CallSite, PatchedSite};

/// Outcome of a successful redirect, sufficient to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub source: usize,
    pub destination: usize,
    pub sites: Vec<PatchedSite>,
}

/// Redirects every indexed direct call to one function toward another.
///
/// Sites are patched one at a time, each inside its own short protection
/// window. Other threads keep running; they observe either the old or the
/// new 4-byte displacement, both valid call targets.
#[derive(Debug, Clone, Copy)]
pub struct FunctionRedirector<'a> {
    context: &'a PatchContext,
}

impl<'a> FunctionRedirector<'a> {
    pub fn new(context: &'a PatchContext) -> Self {
        Self { context }
    }

    /// Points every direct call to `source` at `destination`.
    ///
    /// Fails with [`PatchError::NotReferenced`] when no call site targets
    /// `source`, and with [`PatchError::DisplacementOutOfRange`] when any
    /// site cannot reach `destination`. Neither case writes memory. Any
    /// failure once a site has been written, including a write whose page
    /// protection could not be restored, yields [`PatchError::PartialFailure`]
    /// listing every written site; patched sites are not rolled back.
    ///
    /// # Safety
    ///
    /// `destination` must be the entry of a function callable with the same
    /// signature and ABI as `source`.
    pub unsafe fn redirect(&self, source: usize, destination: usize) -> Result<Redirection> {
        let index = self.context.call_index()?;
        let sites = index
            .call_sites(source)
            .filter(|sites| !sites.is_empty())
            .ok_or(PatchError::NotReferenced { address: source })?;

        let writes = sites
            .iter()
            .map(|&site| Ok((site, displacement(site, destination)?.to_le_bytes())))
            .collect::<Result<Vec<_>>>()?;

        // SAFETY: every site is the displacement field of a decoded call.
        let sites = unsafe { self.apply(&writes)? };
        info!(
            "Redirected {} call sites from 0x{:x} to 0x{:x}",
            sites.len(),
            source,
            destination
        );
        Ok(Redirection {
            source,
            destination,
            sites,
        })
    }

    /// Redirects calls of `source` to `destination`; the shared type `F`
    /// guarantees matching signatures.
    ///
    /// # Safety
    ///
    /// Both handles must point into this executable's code.
    pub unsafe fn redirect_function<F: FunctionHandle>(
        &self,
        source: F,
        destination: F,
    ) -> Result<Redirection> {
        unsafe { self.redirect(source.code_address(), destination.code_address()) }
    }

    /// Restores the bytes each site held before `redirection`.
    ///
    /// # Safety
    ///
    /// The sites must not have been rewritten by anything else since.
    pub unsafe fn revert(&self, redirection: &Redirection) -> Result<()> {
        let writes: Vec<_> = redirection
            .sites
            .iter()
            .map(|patched| (patched.site, patched.original))
            .collect();

        // SAFETY: the sites were patched by this redirector.
        let restored = unsafe { self.apply(&writes)? };
        info!(
            "Restored {} call sites of 0x{:x}",
            restored.len(),
            redirection.source
        );
        Ok(())
    }

    unsafe fn apply(&self, writes: &[(CallSite, [u8; 4])]) -> Result<Vec<PatchedSite>> {
        let memory = self.context.memory();
        let total = writes.len();
        let mut patched = Vec::with_capacity(total);

        for &(site, bytes) in writes {
            // SAFETY: forwarded from the caller.
            match unsafe { patch_memory(memory, site, &bytes) } {
                Ok(old) => {
                    debug!("Patched call site 0x{:x}", site);
                    patched.push(PatchedSite {
                        site,
                        original: [old[0], old[1], old[2], old[3]],
                    });
                }
                Err(e) => {
                    // The bytes landed even though the page stayed open
                    if let PatchError::RestoreFailed { original, .. } = &e
                        && let Ok(original) = <[u8; 4]>::try_from(original.as_slice())
                    {
                        debug!("Patched call site 0x{:x} but left it writable", site);
                        patched.push(PatchedSite { site, original });
                    }
                    if patched.is_empty() {
                        return Err(e);
                    }
                    return Err(PatchError::PartialFailure {
                        succeeded: patched.len(),
                        total,
                        patched,
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(patched)
    }
}

/// rel32 displacement that makes the call whose displacement field sits at
/// `site` land on `destination`.
pub fn displacement(site: CallSite, destination: usize) -> Result<i32> {
    let delta = destination as i128 - site as i128 - 4;
    i32::try_from(delta).map_err(|_| PatchError::DisplacementOutOfRange { site, destination })
}
