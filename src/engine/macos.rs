//! macOS "make text writable" pass (spec.md §4.3), grounded on
//! `src/macos/engine.cpp`: BSD `mprotect` via `syscall`, errors signaled
//! through the carry flag rather than a negative return value.

use iced_x86::{Code, Instruction, Register};

use crate::emitter::asm::Assembler;
use crate::engine::{align_len_for_mprotect, MakeWritableContext, MakeWritablePass};

const SYS_MPROTECT_BSD: i64 = 0x2000000 + 74;
const PROT_RWX: i64 = 0x7;

pub struct MacosMakeWritable;

impl MakeWritablePass for MacosMakeWritable {
    /// Same argument setup as [`crate::engine::linux::LinuxMakeWritable`]
    /// but with the BSD syscall number and a `jc exit_label` check, since
    /// BSD syscalls report failure via the carry flag. The engine is
    /// additionally expected to have flipped the `__TEXT` segment's
    /// max-protection to include write at editor-construction time (see
    /// `crate::editor::mach::MachEditor`'s `max_protection` field) — this
    /// pass only emits the runtime syscall, not that build-time segment flag.
    fn emit(asm: &mut Assembler, ctx: &MakeWritableContext) {
        let (aligned_va, aligned_len) = align_len_for_mprotect(ctx.text_va, ctx.text_len);

        asm.push(Instruction::with_reg_i64(Code::Mov_r64_imm64, Register::RDI, aligned_va as i64).expect("mov rdi,va"));
        asm.push(Instruction::with_reg_i64(Code::Mov_r64_imm64, Register::RSI, aligned_len as i64).expect("mov rsi,len"));
        asm.push(Instruction::with_reg_i32(Code::Mov_r32_imm32, Register::EDX, PROT_RWX as i32).expect("mov edx,prot"));
        asm.push(Instruction::with_reg_i64(Code::Mov_r64_imm64, Register::RAX, SYS_MPROTECT_BSD).expect("mov rax,nr"));
        asm.push(Instruction::with(Code::Syscall));
        asm.push(Instruction::with_branch(Code::Jb_rel32_64, ctx.exit_label.raw()).expect("jc exit_label"));
    }
}
