//! Just-in-time x86-64 assembler wrapper (spec component C3) and virtual
//! register allocator, grounded on `include/engine/code_container.hpp` /
//! `src/code_container.cpp`.
//!
//! The original wraps an `asmjit::CodeHolder` + `x86::Compiler`, tracking
//! free/used/untouchable register sets and a stack of allocated memory
//! slots. `polyforge` wraps `iced_x86`'s instruction list + `BlockEncoder`
//! the same way: [`Assembler`] owns a flat `Vec<Instruction>` (the
//! `CodeHolder` analog — spec.md §3's "lifetime co-terminates with one
//! stub-emission session") and a [`RegisterAllocator`].

use std::collections::HashSet;

use iced_x86::{BlockEncoder, BlockEncoderOptions, Instruction, InstructionBlock, Register};

use crate::error::EmitterError;
use crate::rng::Rng;

/// One stack-resident virtual register: a `[rsp + offset]` slot, plus
/// whether it's been marked free and is eligible to be popped once it's
/// at the top of the tracked stack (mirrors `StackPosition{memory_block,
/// releasable}`).
#[derive(Debug, Clone, Copy)]
struct StackSlot {
    offset: i64,
    size: u32,
    releasable: bool,
}

/// An allocated operand: either a physical register or a stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VReg {
    Physical(Register),
    Stack { offset: i64, size: u32 },
}

const GP_REGISTERS: [Register; 16] = [
    Register::RAX,
    Register::RBX,
    Register::RCX,
    Register::RDX,
    Register::RBP,
    Register::RSP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

fn downcast(reg: Register, size: u32) -> Register {
    use Register::*;
    // Only the width-indexed GP registers this engine ever hands out need
    // a downcast table; `reg` is always one of `GP_REGISTERS` (r64 form).
    let idx = GP_REGISTERS.iter().position(|r| *r == reg).expect("not a tracked GP register");
    match size {
        1 => [AL, BL, CL, DL, BPL, SPL, SIL, DIL, R8L, R9L, R10L, R11L, R12L, R13L, R14L, R15L][idx],
        2 => [AX, BX, CX, DX, BP, SP, SI, DI, R8W, R9W, R10W, R11W, R12W, R13W, R14W, R15W][idx],
        4 => [EAX, EBX, ECX, EDX, EBP, ESP, ESI, EDI, R8D, R9D, R10D, R11D, R12D, R13D, R14D, R15D][idx],
        8 => reg,
        _ => panic!("unsupported register width {size}"),
    }
}

fn to_r64(reg: Register) -> Register {
    reg.full_register()
}

/// Tracks which physical registers are free/used/untouchable, and the
/// stack of virtual stack slots, exactly as `src/code_container.cpp`
/// does for its `unordered_set<x86::Gp>` triple and `used_stack_` vector.
pub struct RegisterAllocator {
    free: HashSet<Register>,
    used: HashSet<Register>,
    untouchable: HashSet<Register>,
    stack: Vec<StackSlot>,
    next_offset: i64,
}

impl Default for RegisterAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterAllocator {
    pub fn new() -> Self {
        // rsp/rbp stay out of the free pool: the original reserves them
        // implicitly by never inserting them as "all registers" minus the
        // frame/stack pointer; we mirror that by excluding them here.
        let free: HashSet<Register> = GP_REGISTERS
            .iter()
            .copied()
            .filter(|r| *r != Register::RSP && *r != Register::RBP)
            .collect();
        RegisterAllocator {
            free,
            used: HashSet::new(),
            untouchable: HashSet::new(),
            // the constructor seeds `used_stack_` with a first slot at [rsp, 0]
            stack: vec![StackSlot { offset: 0, size: 0, releasable: false }],
            next_offset: 0,
        }
    }

    /// `get_virtual_register(size)`: for power-of-two sizes up to 8 bytes
    /// with at least one free register, flips a fair coin between reusing
    /// a free physical register and allocating a fresh stack slot;
    /// otherwise always allocates a stack slot. Size 0 is the "no
    /// operand" case and returns `None` (the original's `empty_operand_`).
    pub fn get_virtual_register(&mut self, size: u32, rng: &mut Rng) -> Option<VReg> {
        if size == 0 {
            return None;
        }
        let eligible_for_register = size.is_power_of_two() && size <= 8 && !self.free.is_empty();
        if eligible_for_register && rng.random_bool() {
            let candidates: Vec<Register> = self.free.iter().copied().collect();
            let reg = *rng.choose(&candidates);
            self.free.remove(&reg);
            self.used.insert(reg);
            return Some(VReg::Physical(downcast(reg, size)));
        }
        self.next_offset -= size as i64;
        let slot = StackSlot { offset: self.next_offset, size, releasable: false };
        self.stack.push(slot);
        Some(VReg::Stack { offset: slot.offset, size })
    }

    /// `mark_as_untouchable`: removes from `free`, inserts into `untouchable`.
    pub fn mark_as_untouchable(&mut self, reg: Register) {
        let r64 = to_r64(reg);
        self.free.remove(&r64);
        self.untouchable.insert(r64);
    }

    /// `mark_as_free` on a register: untouchable registers are reported
    /// as such (and *also* removed from `used`, matching the original's
    /// `getStatus()` check happening after the removal from `used_`), any
    /// other used register moves from `used` to `free`.
    pub fn mark_register_free(&mut self, reg: Register) -> Result<(), EmitterError> {
        let r64 = to_r64(reg);
        self.used.remove(&r64);
        if self.untouchable.contains(&r64) {
            return Err(EmitterError::OperandIsUntouchable);
        }
        self.free.insert(r64);
        Ok(())
    }

    /// `mark_as_free` on a stack slot: mark it releasable, then pop every
    /// trailing releasable slot off the stack (not necessarily the one
    /// just freed, if something non-releasable sits above it).
    pub fn mark_stack_free(&mut self, offset: i64) {
        if let Some(slot) = self.stack.iter_mut().rev().find(|s| s.offset == offset) {
            slot.releasable = true;
        }
        while self.stack.last().map(|s| s.releasable).unwrap_or(false) {
            self.stack.pop();
        }
    }
}

/// The emitter's instruction accumulator (`CodeHolder` analog). Owns the
/// straight-line `Vec<Instruction>` built up by [`crate::emitter::obfuscate`]
/// and by direct callers (e.g. [`crate::cipher::emit`]).
pub struct Assembler {
    pub instructions: Vec<Instruction>,
    pub allocator: RegisterAllocator,
    bitness: u32,
    next_label: u64,
}

/// An opaque forward/backward branch target, analogous to `asmjit::Label`.
/// Internally just a virtual instruction-pointer value unique within one
/// [`Assembler`]; `BlockEncoder` resolves the real displacement once the
/// block's final layout is known, matching branch targets to the
/// instruction whose own (pre-layout) `ip` equals the branch's target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u64);

impl Label {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl Assembler {
    pub fn new_x64() -> Self {
        Assembler { instructions: Vec::new(), allocator: RegisterAllocator::new(), bitness: 64, next_label: 1 }
    }

    pub fn push(&mut self, instr: Instruction) {
        self.instructions.push(instr);
    }

    pub fn extend(&mut self, instrs: impl IntoIterator<Item = Instruction>) {
        self.instructions.extend(instrs);
    }

    /// Reserves a fresh label value. Call [`Assembler::bind_label`] on the
    /// instruction that should be its target before encoding.
    pub fn create_label(&mut self) -> Label {
        let id = self.next_label;
        self.next_label += 1;
        Label(id)
    }

    /// Marks `instr` as the target of `label`: any branch built with
    /// `Instruction::with_branch(code, label.raw())` will resolve to this
    /// instruction once the block is laid out.
    pub fn bind_label(&mut self, label: Label, mut instr: Instruction) -> Instruction {
        instr.set_ip(label.0);
        instr
    }

    pub fn label_target(&self, label: Label) -> u64 {
        label.0
    }


    /// `produce_raw(jump_to, section_va, alignment)`: finalizes the
    /// accumulated instructions, relocating them to `section_va` as if
    /// loaded there (`CodeHolder::relocateToBase` in the original), and
    /// returns the flat bytes. The original appends a trailing `jmp
    /// jump_to` before finalizing, which `RetToJmpPass`/this crate's
    /// equivalent stub-building path is expected to have already done by
    /// the time `produce_raw` runs (see `crate::engine`).
    pub fn produce_raw(&self, section_va: u64) -> Result<Vec<u8>, EmitterError> {
        let block = InstructionBlock::new(&self.instructions, section_va);
        let result = BlockEncoder::encode(self.bitness, block, BlockEncoderOptions::NONE)
            .map_err(|e| EmitterError::Encoding(e.to_string()))?;
        Ok(result.code_buffer)
    }
}
