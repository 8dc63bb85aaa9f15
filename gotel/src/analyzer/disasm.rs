// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Return-site discovery. The kernel gives us no function-exit event for
//! uprobes, so every function is disassembled end to end and a breakpoint is
//! placed on each return instruction.

use capstone::{
    Capstone,
    arch::{self, BuildsCapstone},
};

use crate::errors::GotelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    /// Variable-length instructions.
    X86_64,
    /// Fixed 4-byte instructions.
    Aarch64,
}

fn disassembler(arch: Arch) -> Result<Capstone, GotelError> {
    let cs = match arch {
        Arch::X86_64 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .build(),
        Arch::Aarch64 => Capstone::new()
            .arm64()
            .mode(arch::arm64::ArchMode::Arm)
            .build(),
    };
    cs.map_err(|e| GotelError::Error(format!("capstone init failed: {e}")))
}

/// Decodes `code` linearly from offset 0 until the full function length is
/// consumed and returns the offset of every return instruction, ascending.
///
/// Both architectures spell all return-equivalent instructions with a
/// `ret`-family mnemonic (`ret`, `retf`, aarch64 `ret Xn`).
pub fn return_offsets(arch: Arch, symbol: &str, code: &[u8]) -> Result<Vec<u64>, GotelError> {
    if code.is_empty() {
        return Ok(Vec::new());
    }
    let cs = disassembler(arch)?;
    let insns = cs
        .disasm_all(code, 0)
        .map_err(|e| GotelError::Error(format!("capstone failed on {symbol}: {e}")))?;

    let mut offsets = Vec::new();
    let mut consumed = 0u64;
    for insn in insns.iter() {
        if insn
            .mnemonic()
            .is_some_and(|m| m.starts_with("ret"))
        {
            offsets.push(insn.address());
        }
        consumed = insn.address() + insn.bytes().len() as u64;
    }
    // The decoder stops silently at an undecodable byte; anything short of
    // the declared function length is a decode failure at that offset.
    if consumed != code.len() as u64 {
        return Err(GotelError::DisassemblyFailed {
            symbol: symbol.to_string(),
            offset: consumed,
        });
    }
    Ok(offsets)
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_x86_two_returns_with_padding() {
        // push rbp; pop rbp; ret; int3; int3; ret
        let code = [0x55, 0x5d, 0xc3, 0xcc, 0xcc, 0xc3];
        let offsets = return_offsets(Arch::X86_64, "f", &code).unwrap();
        let len = code.len() as u64;
        assert_eq!(offsets, vec![len - 4, len - 1]);
    }

    #[test]
    fn test_x86_no_return() {
        // xor eax, eax; jmp short -2 (tail spin, no ret)
        let code = [0x31, 0xc0, 0xeb, 0xfe];
        assert!(return_offsets(Arch::X86_64, "f", &code).unwrap().is_empty());
    }

    #[test]
    fn test_aarch64_single_return() {
        // nop; ret
        let code = [0x1f, 0x20, 0x03, 0xd5, 0xc0, 0x03, 0x5f, 0xd6];
        let offsets = return_offsets(Arch::Aarch64, "f", &code).unwrap();
        assert_eq!(offsets, vec![4]);
    }

    #[test]
    fn test_truncated_instruction_reports_offset() {
        // nop followed by half an instruction.
        let code = [0x1f, 0x20, 0x03, 0xd5, 0xc0, 0x03];
        assert_matches!(
            return_offsets(Arch::Aarch64, "f", &code),
            Err(GotelError::DisassemblyFailed { offset: 4, .. })
        );
    }

    #[test]
    fn test_empty_function() {
        assert!(return_offsets(Arch::X86_64, "f", &[]).unwrap().is_empty());
    }
}
