/// Space-separated lowercase hex, e.g. `e8 10 00 00 00`.
pub(crate) fn hex_bytes(content: &[u8]) -> String {
    let mut out = String::with_capacity(content.len() * 3);
    for (i, byte) in content.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Bytes around an undecodable instruction, e.g. `0x00401013: [06] 90 c3`.
/// The faulting byte is bracketed; at most `WINDOW` bytes are shown.
pub(crate) fn fault_window(code: &[u8], offset: usize, address: usize) -> String {
    const WINDOW: usize = 16;
    let Some((first, rest)) = code.get(offset..).and_then(|tail| tail.split_first()) else {
        return format!("0x{:08x}: <no bytes>", address);
    };
    let rest = &rest[..rest.len().min(WINDOW - 1)];
    if rest.is_empty() {
        format!("0x{:08x}: [{:02x}]", address, first)
    } else {
        format!("0x{:08x}: [{:02x}] {}", address, first, hex_bytes(rest))
    }
}
