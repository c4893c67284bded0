/// A function in the running executable, in run-time addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub name: String,
    pub entry: usize,
    /// Exclusive end address.
    pub end: usize,
}

impl Symbol {
    pub fn new(name: impl Into<String>, entry: usize, end: usize) -> Self {
        Self {
            name: name.into(),
            entry,
            end,
        }
    }

    pub fn size(&self) -> usize {
        self.end.saturating_sub(self.entry)
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.entry && address < self.end
    }
}

/// Address of the 4-byte displacement field of a direct `call rel32`.
pub type CallSite = usize;

/// One call site rewritten by a redirect, with the bytes it held before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchedSite {
    pub site: CallSite,
    pub original: [u8; 4],
}
