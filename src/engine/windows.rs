//! Windows "make text writable" pass (spec.md §4.3), grounded on
//! `src/windows/engine.cpp`: calls the imported `KERNEL32!VirtualProtect`.

use iced_x86::{Code, Instruction, MemoryOperand, Register};

use crate::emitter::asm::Assembler;
use crate::engine::{align_len_for_mprotect, MakeWritableContext, MakeWritablePass};

const PAGE_EXECUTE_READWRITE: i64 = 0x40;

pub struct WindowsMakeWritable;

impl MakeWritablePass for WindowsMakeWritable {
    /// `VirtualProtect(lpAddress, dwSize, PAGE_EXECUTE_READWRITE,
    /// &old_protect)` via the Win64 calling convention (rcx, rdx, r8, r9),
    /// with a stack-local slot reserved for `old_protect`. `je exit_label`
    /// since `VirtualProtect` returns zero on failure.
    ///
    /// `ctx.virtual_protect_va` is the import's resolved VA
    /// (`PeEditor::get_imported_function_va`); the engine references
    /// `VirtualProtect` once more from ordinary code elsewhere so the
    /// linker keeps the import even when this call site is the only other
    /// use (spec.md §4.3).
    fn emit(asm: &mut Assembler, ctx: &MakeWritableContext) {
        let (aligned_va, aligned_len) = align_len_for_mprotect(ctx.text_va, ctx.text_len);

        // reserve 32 bytes of shadow space plus 8 for old_protect, per the
        // Win64 calling convention
        asm.push(Instruction::with_reg_i32(Code::Sub_rm64_imm8, Register::RSP, 0x28).expect("sub rsp,0x28"));

        asm.push(Instruction::with_reg_i64(Code::Mov_r64_imm64, Register::RCX, aligned_va as i64).expect("mov rcx,va"));
        asm.push(Instruction::with_reg_i64(Code::Mov_r64_imm64, Register::RDX, aligned_len as i64).expect("mov rdx,len"));
        asm.push(Instruction::with_reg_i32(Code::Mov_r32_imm32, Register::R8D, PAGE_EXECUTE_READWRITE as i32).expect("mov r8d,prot"));
        asm.push(Instruction::with_reg_mem(Code::Lea_r64_m, Register::R9, MemoryOperand::with_base(Register::RSP)).expect("lea r9,[rsp]"));

        asm.push(
            Instruction::with_mem(Code::Call_rm64, MemoryOperand::with_base_displ(Register::RIP, ctx.virtual_protect_va as i64))
                .expect("call [rip+iat_slot]"),
        );

        asm.push(Instruction::with_reg_reg(Code::Test_rm32_r32, Register::EAX, Register::EAX).expect("test eax,eax"));
        asm.push(Instruction::with_branch(Code::Je_rel32_64, ctx.exit_label.raw()).expect("je exit_label"));

        asm.push(Instruction::with_reg_i32(Code::Add_rm64_imm8, Register::RSP, 0x28).expect("add rsp,0x28"));
    }
}
