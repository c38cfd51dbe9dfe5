//! Obfuscation equivalence across many seeds and all recognized
//! operations (spec.md §8 "Obfuscation equivalence"). Runs the tree
//! mutation step through plain-Rust arithmetic rather than encoding and
//! executing bytes, since this environment has no native toolchain to run
//! JIT-encoded machine code on (see `tests/engine_pipeline.rs` for the
//! end-to-end path, marked `#[ignore]` for the same reason).

use polyforge::emitter::tree::{Node, NodeId, Op, Operand, Tree};
use polyforge::rng::Rng;

fn eval(op: Op, x: i64, y: i64) -> i64 {
    match op {
        Op::And => x & y,
        Op::Or => x | y,
        Op::Xor => x ^ y,
        Op::Sum => x.wrapping_add(y),
        Op::Subtract => x.wrapping_sub(y),
        Op::Multiply => x.wrapping_mul(y),
        Op::Not => unreachable!("unary, handled separately"),
    }
}

fn fold(tree: &Tree, id: NodeId) -> i64 {
    match tree.get(id) {
        Node::Term(Operand::Imm(i)) => *i & 0xFFFF_FFFF,
        Node::Term(_) => panic!("fold requires immediate leaves"),
        Node::Operation { op, children } => {
            if *op == Op::Not {
                return !fold(tree, children[0]) & 0xFFFF_FFFF;
            }
            let a = fold(tree, children[0]);
            let b = fold(tree, children[1]);
            eval(*op, a, b) & 0xFFFF_FFFF
        }
    }
}

#[test]
fn every_binary_op_survives_heavy_mutation_across_many_seeds() {
    let ops = [Op::And, Op::Or, Op::Xor, Op::Sum, Op::Subtract];
    let pairs = [(0xDEADBEEFu32 as i64, 0x12345678i64), (0, 0), (u32::MAX as i64, 1), (0x8000_0000u32 as i64, 0x8000_0000u32 as i64)];

    for seed in 0..20u64 {
        let mut rng = Rng::from_seed(seed);
        for op in ops {
            for (x, y) in pairs {
                let mut tree = Tree::leaf_binary(op, Operand::Imm(x), Operand::Imm(y));
                let budget = rng.random_range(0, 256) as u32;
                tree.mutate(budget, &mut rng);
                let expected = eval(op, x, y) & 0xFFFF_FFFF;
                assert_eq!(fold(&tree, tree.root), expected, "seed {seed} op {op:?} x={x:#x} y={y:#x}");
            }
        }
    }
}

#[test]
fn not_survives_mutation() {
    let mut rng = Rng::from_seed(7);
    let mut tree = Tree::leaf_unary(Op::Not, Operand::Imm(0xDEADBEEFu32 as i64));
    tree.mutate(100, &mut rng);
    assert_eq!(fold(&tree, tree.root), !(0xDEADBEEFu32 as i64) & 0xFFFF_FFFF);
}
