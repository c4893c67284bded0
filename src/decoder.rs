//! Instruction-length decoding over raw code bytes.
//!
//! Only one instruction form is interpreted: the direct near call with a
//! one-byte `E8` opcode and a 32-bit displacement. Everything else is
//! reported by address and length so the caller can step over it.

use iced_x86::{Decoder, DecoderError, DecoderOptions};
use thiserror::Error;

use crate::error::{PatchError, Result};
use crate::models::CallSite;

const CALL_REL32: u8 = 0xe8;
const CALL_REL32_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    DirectCall {
        address: usize,
        /// Address of the displacement field, one byte past the opcode.
        call_site: CallSite,
        target: usize,
        length: usize,
    },
    Other {
        address: usize,
        length: usize,
    },
}

impl Instruction {
    pub fn address(&self) -> usize {
        match *self {
            Instruction::DirectCall { address, .. } | Instruction::Other { address, .. } => address,
        }
    }

    pub fn length(&self) -> usize {
        match *self {
            Instruction::DirectCall { length, .. } | Instruction::Other { length, .. } => length,
        }
    }
}

/// The decoder could not determine an instruction length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Cannot decode instruction at 0x{address:x}: {error:?}")]
pub struct DecodeFault {
    pub address: usize,
    pub error: DecoderError,
}

/// Decodes `bytes` laid out at `base` one instruction at a time.
///
/// The stream ends after the first [`DecodeFault`].
pub struct InstructionStream<'a> {
    decoder: Decoder<'a>,
    bytes: &'a [u8],
    base: usize,
    fused: bool,
}

impl<'a> InstructionStream<'a> {
    pub fn new(bitness: u32, bytes: &'a [u8], base: usize) -> Result<Self> {
        let decoder = Decoder::try_with_ip(bitness, bytes, base as u64, DecoderOptions::NONE)
            .map_err(|_| PatchError::Unsupported("decoder bitness must be 16, 32 or 64"))?;
        Ok(Self {
            decoder,
            bytes,
            base,
            fused: false,
        })
    }
}

impl Iterator for InstructionStream<'_> {
    type Item = std::result::Result<Instruction, DecodeFault>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused || !self.decoder.can_decode() {
            return None;
        }

        let offset = self.decoder.position();
        let address = self.base.wrapping_add(offset);
        let decoded = self.decoder.decode();

        if decoded.is_invalid() {
            self.fused = true;
            return Some(Err(DecodeFault {
                address,
                error: self.decoder.last_error(),
            }));
        }

        let length = decoded.len();
        if length == 0 {
            // Stepping by zero would never terminate
            panic!("Decoder reported a zero-length instruction at 0x{:x}", address);
        }

        let raw = &self.bytes[offset..offset + length];
        if raw[0] == CALL_REL32 && length == CALL_REL32_LEN {
            let displacement = i32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]);
            return Some(Ok(Instruction::DirectCall {
                address,
                call_site: address.wrapping_add(1),
                target: address
                    .wrapping_add(length)
                    .wrapping_add_signed(displacement as isize),
                length,
            }));
        }

        Some(Ok(Instruction::Other { address, length }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8], base: usize) -> Vec<std::result::Result<Instruction, DecodeFault>> {
        InstructionStream::new(64, bytes, base).unwrap().collect()
    }

    #[test]
    fn test_direct_call_forward() {
        // push rbp; call +0x10; pop rbp; ret
        let code = [0x55, 0xe8, 0x10, 0x00, 0x00, 0x00, 0x5d, 0xc3];
        let instructions = decode(&code, 0x1000);

        assert_eq!(instructions.len(), 4);
        assert_eq!(
            instructions[1],
            Ok(Instruction::DirectCall {
                address: 0x1001,
                call_site: 0x1002,
                target: 0x1016,
                length: 5,
            })
        );
        assert_eq!(
            instructions[3],
            Ok(Instruction::Other {
                address: 0x1007,
                length: 1,
            })
        );
    }

    #[test]
    fn test_direct_call_backward() {
        // call to itself
        let code = [0xe8, 0xfb, 0xff, 0xff, 0xff];
        let instructions = decode(&code, 0x2000);

        match instructions[0] {
            Ok(Instruction::DirectCall { target, .. }) => assert_eq!(target, 0x2000),
            other => panic!("Expected DirectCall, got {:?}", other),
        }
    }

    #[test]
    fn test_lengths_cover_every_byte() {
        // mov rax, 0x1122334455667788; nop; add rsp, 8; ret
        let code = [
            0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x90, 0x48, 0x83, 0xc4,
            0x08, 0xc3,
        ];
        let total: usize = decode(&code, 0)
            .into_iter()
            .map(|i| i.unwrap().length())
            .sum();
        assert_eq!(total, code.len());
    }

    #[test]
    fn test_indirect_call_is_not_direct() {
        // call rax; call qword ptr [rip+0]
        let code = [0xff, 0xd0, 0xff, 0x15, 0x00, 0x00, 0x00, 0x00];
        assert!(
            decode(&code, 0)
                .into_iter()
                .all(|i| matches!(i, Ok(Instruction::Other { .. })))
        );
    }

    #[test]
    fn test_invalid_instruction_stops_stream() {
        // nop; push es (invalid in 64-bit mode); nop
        let code = [0x90, 0x06, 0x90];
        let instructions = decode(&code, 0x3000);

        assert_eq!(instructions.len(), 2);
        assert_eq!(
            instructions[1],
            Err(DecodeFault {
                address: 0x3001,
                error: DecoderError::InvalidInstruction,
            })
        );
    }

    #[test]
    fn test_truncated_call_is_a_fault() {
        let code = [0xe8, 0x00, 0x00];
        let instructions = decode(&code, 0);

        assert_eq!(instructions.len(), 1);
        assert!(matches!(
            instructions[0],
            Err(DecodeFault {
                error: DecoderError::NoMoreBytes,
                ..
            })
        ));
    }

    #[test]
    fn test_unsupported_bitness() {
        assert!(matches!(
            InstructionStream::new(8, &[0x90], 0),
            Err(PatchError::Unsupported(_))
        ));
    }
}
