//! A thin `rbpf` wrapper used only so `trampoline.rs`'s dispatch semantics
//! and `bvar.rs`'s built-ins can be exercised against a real embedded BPF
//! interpreter in tests, standing in for the sandboxed in-kernel VM the
//! host provides at runtime. Production attachment never goes through
//! here: it goes through `backend.rs` and whatever opaque program FD the
//! real kernel VM hands back.

use crate::error::{Error, ErrorKind, Result};

/// Assembles the two-instruction eBPF program `mov64 r0, imm; exit`, a
/// minimal fixture sufficient to exercise `rbpf::EbpfVmNoData` without a
/// real tracepoint underneath.
pub fn assemble_return_immediate(value: i32) -> Vec<u8> {
    // BPF_ALU64 | BPF_MOV | BPF_K, dst=r0, imm=value
    let mov = encode_insn(0xb7, 0, 0, 0, value);
    // BPF_JMP | BPF_EXIT
    let exit = encode_insn(0x95, 0, 0, 0, 0);
    let mut bytecode = Vec::with_capacity(16);
    bytecode.extend_from_slice(&mov);
    bytecode.extend_from_slice(&exit);
    bytecode
}

fn encode_insn(opcode: u8, dst: u8, src: u8, off: i16, imm: i32) -> [u8; 8] {
    let mut insn = [0u8; 8];
    insn[0] = opcode;
    insn[1] = (dst & 0x0f) | ((src & 0x0f) << 4);
    insn[2..4].copy_from_slice(&off.to_le_bytes());
    insn[4..8].copy_from_slice(&imm.to_le_bytes());
    insn
}

/// Runs a raw eBPF program with no input data and returns its r0 on exit.
pub fn run_no_data(bytecode: &[u8]) -> Result<u64> {
    let mut vm = rbpf::EbpfVmNoData::new(Some(bytecode))
        .map_err(|e| Error::with_message(ErrorKind::BpfError, e.to_string()))?;
    vm.execute_program()
        .map_err(|e| Error::with_message(ErrorKind::BpfError, e.to_string()))
}

/// Runs a raw eBPF program against a mutable memory buffer (the dispatch
/// context a real trampoline's R1 would point at), returning r0 on exit.
pub fn run_with_context(bytecode: &[u8], mem: &mut [u8]) -> Result<u64> {
    let mut vm = rbpf::EbpfVmRaw::new(Some(bytecode))
        .map_err(|e| Error::with_message(ErrorKind::BpfError, e.to_string()))?;
    vm.execute_program(mem)
        .map_err(|e| Error::with_message(ErrorKind::BpfError, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembled_return_immediate_executes_to_that_value() {
        let program = assemble_return_immediate(42);
        assert_eq!(run_no_data(&program).unwrap(), 42);
    }

    #[test]
    fn run_with_context_accepts_a_scratch_buffer() {
        let program = assemble_return_immediate(7);
        let mut mem = [0u8; 64];
        assert_eq!(run_with_context(&program, &mut mem).unwrap(), 7);
    }
}
