//! Emitted-machine-code decryption (spec.md §4.2 "Emitted-decryption
//! contract"), grounded on `include/poly/encryption.hpp`'s
//! `impl::CipherImpl<CipherMode::kCBC, Enc>::assemble_decryption`.

use iced_x86::{Code, Instruction, MemoryOperand, Register};

use crate::cipher::Secret;
use crate::emitter::asm::{Assembler, Label};
use crate::error::CipherError;

#[derive(Clone, Copy)]
enum Width {
    W32,
    W64,
}

impl Width {
    fn from_bytes(n: usize) -> Width {
        match n {
            4 => Width::W32,
            8 => Width::W64,
            other => panic!("unsupported cipher word size {other}"),
        }
    }
}

// Four caller-saved scratch registers dedicated to the decryption loop,
// matching the original allocating fresh compiler virtuals for `state`,
// `saved`, `key`, and the block counter inside `assemble_decryption`
// rather than going through the general-purpose obfuscator allocator
// (this code runs once per stub, before any obfuscation pass sees it).
const COUNTER: Register = Register::R10;
const PLAIN: Register = Register::R11;
const SAVED: Register = Register::R9;
const KEY: Register = Register::R8;

fn narrow(reg: Register, width: Width) -> Register {
    match (reg, width) {
        (Register::R10, Width::W32) => Register::R10D,
        (Register::R10, Width::W64) => Register::R10,
        (Register::R11, Width::W32) => Register::R11D,
        (Register::R11, Width::W64) => Register::R11,
        (Register::R9, Width::W32) => Register::R9D,
        (Register::R9, Width::W64) => Register::R9,
        (Register::R8, Width::W32) => Register::R8D,
        (Register::R8, Width::W64) => Register::R8,
        _ => reg,
    }
}

fn mov_code_reg_imm(width: Width) -> Code {
    match width {
        Width::W32 => Code::Mov_r32_imm32,
        Width::W64 => Code::Mov_r64_imm64,
    }
}

fn mov_code_reg_mem(width: Width) -> Code {
    match width {
        Width::W32 => Code::Mov_r32_rm32,
        Width::W64 => Code::Mov_r64_rm64,
    }
}

fn mov_code_mem_reg(width: Width) -> Code {
    match width {
        Width::W32 => Code::Mov_rm32_r32,
        Width::W64 => Code::Mov_rm64_r64,
    }
}

fn xor_code_reg_reg(width: Width) -> Code {
    match width {
        Width::W32 => Code::Xor_r32_rm32,
        Width::W64 => Code::Xor_r64_rm64,
    }
}

fn test_code_reg_reg(width: Width) -> Code {
    match width {
        Width::W32 => Code::Test_rm32_r32,
        Width::W64 => Code::Test_rm64_r64,
    }
}

fn dec_code(width: Width) -> Code {
    match width {
        Width::W32 => Code::Dec_rm32,
        Width::W64 => Code::Dec_rm64,
    }
}

/// Reads up to 8 little-endian bytes of `bytes` into an `i64`, zero-padding.
fn le_bytes_to_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    i64::from_le_bytes(buf)
}

/// `assemble_decryption(secret, emitter, data_ptr_reg, data_len, exit_label)`.
///
/// Emits, onto `asm`, a loop that decrypts `data_len` bytes starting at
/// `*data_ptr_reg` in place, leaving `data_ptr_reg` one past the last
/// block, then jumps to `exit_label`:
///
/// ```text
/// state ← iv
/// for each block b at [ptr]:
///     saved ← b
///     b ← D(secret, b) ⊕ state     // for XOR: D == E
///     state ← saved
///     store b back
///     ptr += N
/// jmp exit_label
/// ```
///
/// If `data_len % N != 0`, nothing is emitted and
/// [`CipherError::NotAligned`] is returned — the caller (the polymorphic
/// engine) only ever invokes this with the host's text-section size, a
/// build-time-known quantity it is expected to align itself, unlike
/// [`crate::cipher::Cipher::encrypt`]/`decrypt`, which do process an
/// aligned prefix of a misaligned buffer (spec.md §9 Open Question 1,
/// `SPEC_FULL.md` §3).
pub fn assemble_decryption<const N: usize>(
    secret: &Secret<N>,
    asm: &mut Assembler,
    data_ptr_reg: Register,
    data_len: u64,
    exit_label: Label,
) -> Result<(), CipherError> {
    let block_size = N as u64;
    if data_len % block_size != 0 {
        return Err(CipherError::NotAligned { len: data_len as usize, block_size: N });
    }
    let block_count = (data_len / block_size) as i64;

    let w = Width::from_bytes(N);
    let counter = narrow(COUNTER, w);
    let plain = narrow(PLAIN, w);
    let saved = narrow(SAVED, w);
    let key = narrow(KEY, w);

    let key_imm = le_bytes_to_i64(&secret.key.to_le_bytes());
    let iv_imm = le_bytes_to_i64(&secret.iv.to_le_bytes());

    // mov counter, block_count ; mov saved, iv  (saved doubles as the
    // running CBC state register) ; mov key, key. The key is loaded into
    // a register rather than used as an xor immediate so W64 carries its
    // full 8 bytes — `xor r64, imm32` sign-extends the immediate to 64
    // bits, which would silently truncate an 8-byte key to its low 4
    // bytes.
    asm.push(Instruction::with_reg_i64(mov_code_reg_imm(w), counter, block_count).expect("mov reg,imm"));
    asm.push(Instruction::with_reg_i64(mov_code_reg_imm(w), saved, iv_imm).expect("mov reg,imm"));
    asm.push(Instruction::with_reg_i64(mov_code_reg_imm(w), key, key_imm).expect("mov reg,imm"));

    let loop_label = asm.create_label();
    let test_top = asm.bind_label(loop_label, Instruction::with_reg_reg(test_code_reg_reg(w), counter, counter).expect("test"));
    asm.push(test_top);
    asm.push(Instruction::with_branch(Code::Je_rel32_64, exit_label.raw()).expect("je exit_label"));

    // plain <- [ptr]
    asm.push(
        Instruction::with_reg_mem(mov_code_reg_mem(w), plain, MemoryOperand::with_base(data_ptr_reg))
            .expect("mov plain,[ptr]"),
    );
    // plain <- plain ^ key ^ saved(state)
    asm.push(Instruction::with_reg_reg(xor_code_reg_reg(w), plain, key).expect("xor plain,key"));
    asm.push(Instruction::with_reg_reg(xor_code_reg_reg(w), plain, saved).expect("xor plain,saved"));
    // saved <- ciphertext just read (becomes next iteration's state)
    asm.push(
        Instruction::with_reg_mem(mov_code_reg_mem(w), saved, MemoryOperand::with_base(data_ptr_reg))
            .expect("mov saved,[ptr]"),
    );
    // [ptr] <- plain
    asm.push(
        Instruction::with_mem_reg(mov_code_mem_reg(w), MemoryOperand::with_base(data_ptr_reg), plain)
            .expect("mov [ptr],plain"),
    );
    // ptr += N
    asm.push(Instruction::with_reg_i32(Code::Add_rm64_imm8, data_ptr_reg, block_size as i32).expect("add ptr,N"));
    // counter -= 1
    asm.push(Instruction::with1(dec_code(w), counter).expect("dec counter"));
    asm.push(Instruction::with_branch(Code::Jmp_rel32_64, loop_label.raw()).expect("jmp loop_label"));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::Block;

    /// Exercises the build-time alignment guard (spec.md §4.2); the loop
    /// body itself is validated indirectly by `cipher::tests` folding the
    /// same CBC-XOR algebra in plain Rust, since running JIT-encoded
    /// bytes requires a native target this environment can't execute.
    #[test]
    fn rejects_misaligned_length_without_emitting() {
        let secret = Secret::<8> { iv: Block([0; 8]), key: Block([0; 8]) };
        let mut asm = Assembler::new_x64();
        let label = asm.create_label();
        let err = assemble_decryption(&secret, &mut asm, Register::RDI, 11, label).unwrap_err();
        assert!(matches!(err, CipherError::NotAligned { len: 11, block_size: 8 }));
        assert!(asm.instructions.is_empty());
    }
}
