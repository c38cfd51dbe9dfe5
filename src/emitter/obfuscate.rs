//! Obfuscating passes over the plain emitter (spec component C4),
//! grounded on `src/ocompiler.cpp`'s `Obfuscator`, `FuncObfPass`, and
//! `NopPass`.

use iced_x86::{Code, Instruction, MemoryOperand, Register};

use crate::emitter::asm::{Assembler, VReg};
use crate::emitter::tree::{Node, NodeId, Op, Operand, Tree};
use crate::rng::Rng;

/// `Obfuscator::expand`: builds the one-node tree for `op(a, b)`, draws
/// `K ∈ [0, 255]`, and mutates up to `K` times before returning the tree
/// for [`assemble`] to linearize.
pub fn expand(op: Op, a: Operand, b: Operand, rng: &mut Rng) -> Tree {
    let mut tree = Tree::leaf_binary(op, a, b);
    let k = rng.random_range(0, 256) as u32;
    tree.mutate(k, rng);
    tree
}

fn operand_to_mem(base: Register, displacement: i32) -> MemoryOperand {
    MemoryOperand::with_base_displ(base, displacement as i64)
}

/// Picks the `Code` variant for a 32-bit register destination receiving a
/// register or immediate source, mirroring `Assembler<Operation>::serialize`'s
/// operand-kind rotation — illegal combinations (two memory operands)
/// return `None`, meaning "this op is skipped, emits nothing", matching
/// spec.md §4.4: "If an operand combination isn't legal for the op... that
/// op is skipped."
fn binop_reg_reg(op: Op, _dst: Register, _src: Register) -> Option<Code> {
    match op {
        Op::And => Some(Code::And_rm32_r32),
        Op::Or => Some(Code::Or_rm32_r32),
        Op::Xor => Some(Code::Xor_rm32_r32),
        Op::Sum => Some(Code::Add_rm32_r32),
        Op::Subtract => Some(Code::Sub_rm32_r32),
        Op::Not | Op::Multiply => None,
    }
}

fn binop_reg_imm(op: Op, imm: i64) -> Option<(Code, i32)> {
    match op {
        Op::And => Some((Code::And_rm32_imm32, imm as i32)),
        Op::Or => Some((Code::Or_rm32_imm32, imm as i32)),
        Op::Xor => Some((Code::Xor_rm32_imm32, imm as i32)),
        Op::Sum => Some((Code::Add_rm32_imm32, imm as i32)),
        Op::Subtract => Some((Code::Sub_rm32_imm32, imm as i32)),
        // `MultiplyOperation::serialize`: the original's memory-operand
        // branch calls the subtraction helper where its own doc comment
        // implies a shift was intended (see SPEC_FULL.md §3 and
        // DESIGN.md). We implement the evidently-intended semantics: a
        // multiply by an even immediate lowers to `shl dst, log2(imm)`
        // when `imm` is a power of two, never to a subtraction.
        Op::Multiply if imm > 0 && (imm as u64).is_power_of_two() => {
            Some((Code::Shl_rm32_imm8, (imm as u64).trailing_zeros() as i32))
        }
        Op::Multiply => Some((Code::Imul_r32_rm32_imm32, imm as i32)),
        Op::Not => None,
    }
}

/// Result of assembling one tree node: where its value now lives.
#[derive(Debug, Clone, Copy)]
enum Loc {
    Reg(Register),
    Imm(i64),
    Mem { base: Register, displacement: i32 },
}

fn loc_of(op: Operand) -> Loc {
    match op {
        Operand::Imm(i) => Loc::Imm(i),
        Operand::Reg(r) => Loc::Reg(r),
        Operand::Mem { base, displacement } => Loc::Mem { base, displacement },
    }
}

fn vreg_loc(v: VReg) -> Loc {
    match v {
        VReg::Physical(r) => Loc::Reg(r),
        VReg::Stack { offset, .. } => Loc::Mem { base: Register::RSP, displacement: offset as i32 },
    }
}

/// Emits `mov dst, src` for whichever `Loc` kinds the pair allows; used
/// both for `TermNode` leaf copies (a fresh vreg receiving a register
/// operand, so later mutation of the working copy can't clobber the
/// instruction's original input) and for the corrective trailing `mov`
/// `FuncObfPass` appends when a subtree's result doesn't land in the
/// original destination.
fn emit_mov(asm: &mut Assembler, dst: Loc, src: Loc) {
    let instr = match (dst, src) {
        (Loc::Reg(d), Loc::Reg(s)) => Instruction::with_reg_reg(Code::Mov_r32_rm32, d, s),
        (Loc::Reg(d), Loc::Imm(i)) => Instruction::with_reg_i32(Code::Mov_r32_imm32, d, i as i32),
        (Loc::Reg(d), Loc::Mem { base, displacement }) => {
            Instruction::with_reg_mem(Code::Mov_r32_rm32, d, operand_to_mem(base, displacement))
        }
        (Loc::Mem { base, displacement }, Loc::Reg(s)) => {
            Instruction::with_mem_reg(Code::Mov_rm32_r32, operand_to_mem(base, displacement), s)
        }
        (Loc::Mem { base, displacement }, Loc::Imm(i)) => {
            Instruction::with_mem_i32(Code::Mov_rm32_imm32, operand_to_mem(base, displacement), i as i32)
        }
        _ => return, // mem<-mem, or anything writing into an immediate: illegal, skip
    }
    .expect("well-formed mov operands");
    asm.push(instr);
}

/// Linearizes `tree` into straight-line instructions on `asm`, returning
/// the location holding the final result (`Assembler<OperationNode>::assemble`'s
/// post-order stack machine). `dest_hint` is the instruction's original
/// destination operand; if the final location differs, the caller is
/// responsible for the corrective trailing `mov` (spec.md §4.4).
pub fn assemble(tree: &Tree, asm: &mut Assembler, rng: &mut Rng) -> Operand {
    fn walk(tree: &Tree, id: NodeId, asm: &mut Assembler, rng: &mut Rng) -> Loc {
        match tree.get(id) {
            Node::Term(operand) => {
                let loc = loc_of(*operand);
                match loc {
                    Loc::Reg(_) => {
                        // Fresh working copy: a register leaf never aliases
                        // the caller's original operand past this point.
                        let vreg = asm.allocator.get_virtual_register(4, rng).expect("leaf width is nonzero");
                        let fresh = vreg_loc(vreg);
                        emit_mov(asm, fresh, loc);
                        fresh
                    }
                    Loc::Imm(_) | Loc::Mem { .. } => loc,
                }
            }
            Node::Operation { op, children } => {
                let op = *op;
                if op == Op::Not {
                    let src = walk(tree, children[0], asm, rng);
                    let dest = match src {
                        Loc::Reg(r) => Loc::Reg(r),
                        other => other,
                    };
                    let instr = match dest {
                        Loc::Reg(r) => Instruction::with1(Code::Not_rm32, r),
                        Loc::Mem { base, displacement } => {
                            Instruction::with1(Code::Not_rm32, operand_to_mem(base, displacement))
                        }
                        Loc::Imm(_) => return dest, // not(imm) never occurs from FuncObfPass inputs
                    };
                    if let Ok(instr) = instr {
                        asm.push(instr);
                    }
                    return dest;
                }

                let left = walk(tree, children[0], asm, rng);
                let right = walk(tree, children[1], asm, rng);

                // Destination is the left operand's location when it's
                // writable (register or stack slot); otherwise allocate a
                // fresh vreg to hold the result, mirroring the original's
                // "operand kind rotation, skip if illegal" rule (two
                // memory/immediate operands can't serve as an in-place
                // destination).
                let dest = match left {
                    Loc::Reg(_) | Loc::Mem { .. } => left,
                    Loc::Imm(_) => {
                        let vreg = asm.allocator.get_virtual_register(4, rng).expect("width 4 always eligible");
                        let fresh = vreg_loc(vreg);
                        emit_mov(asm, fresh, left);
                        fresh
                    }
                };

                let instr = match (dest, right) {
                    (Loc::Reg(d), Loc::Reg(s)) => binop_reg_reg(op, d, s).and_then(|code| Instruction::with_reg_reg(code, d, s).ok()),
                    (Loc::Reg(d), Loc::Imm(i)) => binop_reg_imm(op, i).and_then(|(code, imm)| Instruction::with_reg_i32(code, d, imm).ok()),
                    (Loc::Mem { base, displacement }, Loc::Reg(s)) => {
                        let mem = operand_to_mem(base, displacement);
                        match op {
                            Op::And => Instruction::with_mem_reg(Code::And_rm32_r32, mem, s).ok(),
                            Op::Or => Instruction::with_mem_reg(Code::Or_rm32_r32, mem, s).ok(),
                            Op::Xor => Instruction::with_mem_reg(Code::Xor_rm32_r32, mem, s).ok(),
                            Op::Sum => Instruction::with_mem_reg(Code::Add_rm32_r32, mem, s).ok(),
                            Op::Subtract => Instruction::with_mem_reg(Code::Sub_rm32_r32, mem, s).ok(),
                            _ => None,
                        }
                    }
                    // mem <- mem, or anything with an immediate destination:
                    // illegal combination, this op is skipped (emits nothing).
                    _ => None,
                };
                if let Some(instr) = instr {
                    asm.push(instr);
                }
                dest
            }
        }
    }

    let loc = walk(tree, tree.root, asm, rng);
    match loc {
        Loc::Reg(r) => Operand::Reg(r),
        Loc::Imm(i) => Operand::Imm(i),
        Loc::Mem { base, displacement } => Operand::Mem { base, displacement },
    }
}

/// Rewrites one recognized instruction (`not`/`and`/`or`/`xor`/`add`/`sub`
/// over two GP operands) into an obfuscated equivalent. `FuncObfPass`'s
/// instruction-stream walk is driven by the caller (`crate::engine`, which
/// knows which instructions in its own emitted stub are obfuscation
/// targets); this function is the per-instruction transform.
pub fn obfuscate_instruction(asm: &mut Assembler, op: Op, dest: Operand, src: Operand, rng: &mut Rng) {
    let tree = expand(op, dest, src, rng);
    let result = assemble(&tree, asm, rng);
    if result != dest {
        emit_mov(asm, loc_of(dest), loc_of(result));
    }
}

/// `NopPass`: 1/10 probability per instruction of inserting a `nop`
/// immediately after it.
pub fn nop_pass(asm: &mut Assembler, rng: &mut Rng) {
    let mut with_nops = Vec::with_capacity(asm.instructions.len());
    for instr in asm.instructions.drain(..) {
        with_nops.push(instr);
        if rng.random_range(0, 10) == 0 {
            with_nops.push(Instruction::with(Code::Nopd));
        }
    }
    asm.instructions = with_nops;
}
