//! Operation-tree IR for instruction obfuscation (spec component C2).
//!
//! The original (`include/poly/ocompiler.hpp`) builds this as a tree of
//! heap-allocated `Operation`/`TermNode`/`OperationNode` objects linked by
//! raw/smart pointers. Per the REDESIGN FLAGS in spec.md §9 ("replace
//! node-pointer trees with an arena of nodes indexed by `u32`"), every
//! node here lives in one `Tree`'s `Vec<Node>` and is referenced by
//! [`NodeId`], so there is no parent/child ownership cycle to reason
//! about and the post-order walk in [`Tree::assemble`] is an iterative
//! stack loop rather than recursion over owned pointers.

use iced_x86::Register;

/// Index into a [`Tree`]'s node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(pub u32);

/// Leaf operand kinds, matching spec.md §3 "Operand / Register / Memory".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Imm(i64),
    Reg(Register),
    /// `[base + displacement]`, base is always a GP register here.
    Mem { base: Register, displacement: i32 },
}

/// The six arithmetic/bitwise operations `FuncObfPass` recognizes, plus
/// `Not` (unary) and `Multiply` (only ever a mutation *output*, never a
/// `FuncObfPass` input — see `SPEC_FULL.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Not,
    And,
    Or,
    Xor,
    Sum,
    Subtract,
    Multiply,
}

impl Op {
    pub fn arity(self) -> usize {
        match self {
            Op::Not => 1,
            _ => 2,
        }
    }
}

/// One node of the tree: either a leaf wrapping an [`Operand`], or an
/// interior node applying an [`Op`] to `arity()` children.
#[derive(Debug, Clone)]
pub enum Node {
    Term(Operand),
    Operation { op: Op, children: Vec<NodeId> },
}

/// The eleven mutation kinds from `enums.hpp`'s `MutationType`: one
/// "simple" (identity) rewrite per recognized op, plus four structural
/// rewrites that only apply to `Or`/`Xor`/`Sum`/`Subtract`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationType {
    NotSimple,
    AndSimple,
    OrSimple,
    XorSimple,
    SumSimple,
    SubtractSimple,
    MultiplySimple,
    OrRecursive,
    XorRecursive,
    SumRecursive,
    SubtractRecursive,
}

impl MutationType {
    /// The simple (no-op) rewrite applicable to any op — leaves the node
    /// untouched. Used as one of the candidates `random_from` can select
    /// so that not every visited node is restructured.
    fn simple_for(op: Op) -> MutationType {
        match op {
            Op::Not => MutationType::NotSimple,
            Op::And => MutationType::AndSimple,
            Op::Or => MutationType::OrSimple,
            Op::Xor => MutationType::XorSimple,
            Op::Sum => MutationType::SumSimple,
            Op::Subtract => MutationType::SubtractSimple,
            Op::Multiply => MutationType::MultiplySimple,
        }
    }

    /// Recursive rewrites available for `op`, if any (empty for `Not`,
    /// `And`, `Multiply`, matching `get_casual_mutation_type`'s per-op
    /// candidate lists in the original).
    fn recursive_for(op: Op) -> &'static [MutationType] {
        match op {
            Op::Or => &[MutationType::OrRecursive],
            Op::Xor => &[MutationType::XorRecursive],
            Op::Sum => &[MutationType::SumRecursive],
            Op::Subtract => &[MutationType::SubtractRecursive],
            _ => &[],
        }
    }
}

/// An arena-backed operation tree rooted at `root`.
pub struct Tree {
    nodes: Vec<Node>,
    pub root: NodeId,
}

impl Tree {
    /// Builds the initial one-node tree for a binary op (`Obfuscator::expand`'s
    /// starting point): `op(a, b)`.
    pub fn leaf_binary(op: Op, a: Operand, b: Operand) -> Tree {
        let mut nodes = vec![Node::Term(a), Node::Term(b)];
        let root_idx = nodes.len() as u32;
        nodes.push(Node::Operation { op, children: vec![NodeId(0), NodeId(1)] });
        Tree { nodes, root: NodeId(root_idx) }
    }

    pub fn leaf_unary(op: Op, a: Operand) -> Tree {
        let mut nodes = vec![Node::Term(a)];
        let root_idx = nodes.len() as u32;
        nodes.push(Node::Operation { op, children: vec![NodeId(0)] });
        Tree { nodes, root: NodeId(root_idx) }
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    /// Candidate mutation types applicable to the op at `id`: the simple
    /// (identity) rewrite plus any structural rewrites for that op.
    fn candidates(&self, id: NodeId) -> Vec<MutationType> {
        let op = match self.get(id) {
            Node::Operation { op, .. } => *op,
            Node::Term(_) => return Vec::new(),
        };
        let mut out = vec![MutationType::simple_for(op)];
        out.extend_from_slice(MutationType::recursive_for(op));
        out
    }

    /// Rewrites the node at `id` into the subtree `mutation` describes,
    /// per the table in spec.md §4.4:
    ///
    /// | op        | rewrite                              |
    /// |-----------|---------------------------------------|
    /// | or(a,b)   | sum(xor(a,b), and(a,b))               |
    /// | xor(a,b)  | sub(sum(a,b), mul(2, and(a,b)))       |
    /// | sum(a,b)  | sum(xor(a,b), mul(2, and(a,b)))        |
    /// | sub(a,b)  | sub(xor(a,b), mul(2, and(not(a), b)))  |
    ///
    /// Simple rewrites are a no-op (they exist so `random_from` can pick
    /// "leave it alone" with the same probability mass as a real rewrite).
    /// Returns the (possibly new) node id the caller should continue
    /// traversing from — a fresh subtree root when a rewrite fired.
    fn apply(&mut self, id: NodeId, mutation: MutationType) -> NodeId {
        let (a, b) = match self.get(id) {
            Node::Operation { children, .. } if children.len() == 2 => (children[0], children[1]),
            _ => return id,
        };
        let new_root = match mutation {
            MutationType::OrRecursive => {
                let xor_ab = self.push(Node::Operation { op: Op::Xor, children: vec![a, b] });
                let and_ab = self.push(Node::Operation { op: Op::And, children: vec![a, b] });
                self.push(Node::Operation { op: Op::Sum, children: vec![xor_ab, and_ab] })
            }
            MutationType::XorRecursive => {
                let sum_ab = self.push(Node::Operation { op: Op::Sum, children: vec![a, b] });
                let and_ab = self.push(Node::Operation { op: Op::And, children: vec![a, b] });
                let two = self.push(Node::Term(Operand::Imm(2)));
                let mul = self.push(Node::Operation { op: Op::Multiply, children: vec![and_ab, two] });
                self.push(Node::Operation { op: Op::Subtract, children: vec![sum_ab, mul] })
            }
            MutationType::SumRecursive => {
                let xor_ab = self.push(Node::Operation { op: Op::Xor, children: vec![a, b] });
                let and_ab = self.push(Node::Operation { op: Op::And, children: vec![a, b] });
                let two = self.push(Node::Term(Operand::Imm(2)));
                let mul = self.push(Node::Operation { op: Op::Multiply, children: vec![and_ab, two] });
                self.push(Node::Operation { op: Op::Sum, children: vec![xor_ab, mul] })
            }
            MutationType::SubtractRecursive => {
                let xor_ab = self.push(Node::Operation { op: Op::Xor, children: vec![a, b] });
                let not_a = self.push(Node::Operation { op: Op::Not, children: vec![a] });
                let and_nab = self.push(Node::Operation { op: Op::And, children: vec![not_a, b] });
                let two = self.push(Node::Term(Operand::Imm(2)));
                let mul = self.push(Node::Operation { op: Op::Multiply, children: vec![and_nab, two] });
                self.push(Node::Operation { op: Op::Subtract, children: vec![xor_ab, mul] })
            }
            _ => id, // *Simple: identity
        };
        if new_root != id {
            self.nodes[id.0 as usize] = self.nodes[new_root.0 as usize].clone();
        }
        id
    }

    /// Every interior node reachable from `root`, in post-order, not
    /// counting nodes pushed by mutations applied during this same call
    /// (mirrors the original's `transform_tree`: one pass visits the tree
    /// as it stood at pass-start, but newly created nodes become visible
    /// on the *next* pass because they're now reachable from `root`).
    fn post_order(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![(self.root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            let children = match self.get(id) {
                Node::Operation { children, .. } => children.clone(),
                Node::Term(_) => Vec::new(),
            };
            stack.push((id, true));
            for c in children.into_iter().rev() {
                stack.push((c, false));
            }
        }
        out
    }

    /// Applies up to `budget` mutations, one full post-order pass at a
    /// time, picking a random candidate rewrite for every interior node
    /// visited in a pass until the budget is exhausted — matching
    /// `Obfuscator::expand`'s `while (limit > 0) { transform_tree(...) }`
    /// loop, where each pass can both consume budget on several nodes and
    /// grow the tree with nodes a later pass will revisit.
    pub fn mutate(&mut self, mut budget: u32, rng: &mut crate::rng::Rng) {
        while budget > 0 {
            let nodes = self.post_order();
            if nodes.is_empty() {
                break;
            }
            for id in nodes {
                if budget == 0 {
                    break;
                }
                let candidates = self.candidates(id);
                if candidates.is_empty() {
                    continue;
                }
                let chosen = *rng.choose(&candidates);
                self.apply(id, chosen);
                budget -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Rng;

    #[test]
    fn mutation_preserves_arity_invariant() {
        let mut rng = Rng::from_seed(3);
        let mut tree = Tree::leaf_binary(Op::Xor, Operand::Reg(Register::EAX), Operand::Reg(Register::EBX));
        tree.mutate(64, &mut rng);
        for id in tree.post_order() {
            if let Node::Operation { op, children } = tree.get(id) {
                assert_eq!(children.len(), op.arity());
            }
        }
    }

    #[test]
    fn zero_budget_leaves_tree_untouched() {
        let mut rng = Rng::from_seed(1);
        let mut tree = Tree::leaf_binary(Op::Sum, Operand::Reg(Register::EAX), Operand::Imm(4));
        tree.mutate(0, &mut rng);
        assert!(matches!(tree.get(tree.root), Node::Operation { op: Op::Sum, .. }));
    }
}
