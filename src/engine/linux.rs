//! Linux "make text writable" pass (spec.md §4.3), grounded on
//! `src/linux/engine.cpp`: raw `mprotect` via `syscall`, no libc.

use iced_x86::{Code, Instruction, Register};

use crate::emitter::asm::Assembler;
use crate::engine::{align_len_for_mprotect, MakeWritableContext, MakeWritablePass};

const SYS_MPROTECT: i64 = 10;
const PROT_RWX: i64 = 0x7;

pub struct LinuxMakeWritable;

impl MakeWritablePass for LinuxMakeWritable {
    /// `mov rdi, aligned_va; mov rsi, aligned_len; mov rdx, 7; mov rax, 10;
    /// syscall; test rax, rax; jne exit_label` — nonzero (negative errno)
    /// return means `mprotect` failed.
    fn emit(asm: &mut Assembler, ctx: &MakeWritableContext) {
        let (aligned_va, aligned_len) = align_len_for_mprotect(ctx.text_va, ctx.text_len);

        asm.push(Instruction::with_reg_i64(Code::Mov_r64_imm64, Register::RDI, aligned_va as i64).expect("mov rdi,va"));
        asm.push(Instruction::with_reg_i64(Code::Mov_r64_imm64, Register::RSI, aligned_len as i64).expect("mov rsi,len"));
        asm.push(Instruction::with_reg_i32(Code::Mov_r32_imm32, Register::EDX, PROT_RWX as i32).expect("mov edx,prot"));
        asm.push(Instruction::with_reg_i32(Code::Mov_r32_imm32, Register::EAX, SYS_MPROTECT as i32).expect("mov eax,nr"));
        asm.push(Instruction::with(Code::Syscall));
        asm.push(Instruction::with_reg_reg(Code::Test_rm64_r64, Register::RAX, Register::RAX).expect("test rax,rax"));
        asm.push(Instruction::with_branch(Code::Jne_rel32_64, ctx.exit_label.raw()).expect("jne exit_label"));
    }
}
