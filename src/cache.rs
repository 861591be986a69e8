//! Hash-consing expression node cache
//!
//! The cache is the single owner of every expression node. Interning is
//! deduplicating: structurally identical nodes (same opcode, operands and
//! constant payload, with commutative operand pairs canonically ordered)
//! share one [`Id`], so expression graphs are DAGs rather than trees and
//! common subexpressions are evaluated once.
//!
//! Each node records its rank (longest path to a leaf), which gives the
//! evaluator a safe bottom-up execution order. The cache also keeps a
//! registry of affine-marked nodes (`a*x + b*y + c*z + d`) so that affine
//! combinations can be recognized and merged without structural pattern
//! matching.
//!
//! # Lifecycle
//!
//! Nodes are never mutated or individually deleted. [`Cache::reset`] is
//! the only reclamation: it discards every node in bulk and bumps the
//! cache's generation counter. Trees carry the generation they were built
//! against, and any use of a stale tree panics instead of reading
//! nonsense ids.
//!
//! # Thread safety
//!
//! The handle is `Clone` and shares one store behind a `RwLock`:
//! concurrent reads are fine, interning serializes writers. A `reset`
//! while other threads hold trees is caught by the generation check, not
//! by the type system.
//!
//! Author: Moroya Sakamoto

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::eval::kernels::{fold_binary, fold_unary};
use crate::opcode::Opcode;

/// Stable identity of one node within a cache
///
/// `Id(0)` is reserved to mean "no operand" and never names a real node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(pub(crate) u32);

impl Id {
    pub(crate) const NONE: Id = Id(0);

    /// Returns true for the reserved "absent operand" id
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// One immutable expression node
#[derive(Clone, Copy, Debug)]
pub(crate) struct Node {
    pub op: Opcode,
    /// Scalar payload, meaningful only when `op` is `Const`
    pub value: f32,
    pub lhs: Id,
    pub rhs: Id,
    pub rank: u32,
}

/// Structural key for hash-consing
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct NodeKey {
    op: Opcode,
    value_bits: u32,
    lhs: Id,
    rhs: Id,
}

pub(crate) struct CacheInner {
    /// Node storage; index 0 is a sentinel so `Id` doubles as index
    nodes: Vec<Node>,
    index: HashMap<NodeKey, Id>,
    /// Coefficients `[a, b, c, d]` for every AffineVec node
    affine: HashMap<Id, [f32; 4]>,
    generation: u64,
    x: Id,
    y: Id,
    z: Id,
}

impl CacheInner {
    fn new() -> Self {
        let mut inner = CacheInner {
            nodes: vec![Node {
                op: Opcode::Const,
                value: 0.0,
                lhs: Id::NONE,
                rhs: Id::NONE,
                rank: 0,
            }],
            index: HashMap::new(),
            affine: HashMap::new(),
            generation: 0,
            x: Id::NONE,
            y: Id::NONE,
            z: Id::NONE,
        };
        inner.seed_axes();
        inner
    }

    /// The axis variables always exist, even in a freshly reset cache
    fn seed_axes(&mut self) {
        self.x = self.intern(Opcode::VarX, 0.0, Id::NONE, Id::NONE);
        self.y = self.intern(Opcode::VarY, 0.0, Id::NONE, Id::NONE);
        self.z = self.intern(Opcode::VarZ, 0.0, Id::NONE, Id::NONE);
    }

    #[inline]
    pub(crate) fn node(&self, id: Id) -> &Node {
        &self.nodes[id.0 as usize]
    }

    #[inline]
    pub(crate) fn var_x(&self) -> Id {
        self.x
    }

    #[inline]
    pub(crate) fn var_y(&self) -> Id {
        self.y
    }

    #[inline]
    pub(crate) fn var_z(&self) -> Id {
        self.z
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Intern a node by structural key, creating it only if absent
    ///
    /// Commutative opcodes order their operand pair by id before hashing,
    /// so `a + b` and `b + a` resolve to the same node.
    pub(crate) fn intern(&mut self, op: Opcode, value: f32, lhs: Id, rhs: Id) -> Id {
        let (lhs, rhs) = if op.is_commutative() && lhs.0 > rhs.0 {
            (rhs, lhs)
        } else {
            (lhs, rhs)
        };
        let key = NodeKey {
            op,
            value_bits: value.to_bits(),
            lhs,
            rhs,
        };
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let rank = match op.arity() {
            0 => 0,
            1 => self.node(lhs).rank + 1,
            _ => self.node(lhs).rank.max(self.node(rhs).rank) + 1,
        };
        let id = Id(self.nodes.len() as u32);
        self.nodes.push(Node {
            op,
            value,
            lhs,
            rhs,
            rank,
        });
        self.index.insert(key, id);
        id
    }

    pub(crate) fn constant(&mut self, v: f32) -> Id {
        self.intern(Opcode::Const, v, Id::NONE, Id::NONE)
    }

    /// Affine form of a node, if it has one
    ///
    /// Constants are degenerate affine forms; AffineVec markers carry
    /// their coefficients in the registry.
    pub(crate) fn affine_of(&self, id: Id) -> Option<[f32; 4]> {
        let node = self.node(id);
        match node.op {
            Opcode::Const => Some([0.0, 0.0, 0.0, node.value]),
            Opcode::AffineVec => self.affine.get(&id).copied(),
            _ => None,
        }
    }

    /// Build the affine combination `a*x + b*y + c*z + d` and wrap it in
    /// an AffineVec marker
    ///
    /// The expansion goes through the raw builder so that affine detection
    /// does not recurse into itself; identity folding keeps degenerate
    /// forms small (the x axis expands to the bare `VarX` node).
    pub(crate) fn affine(&mut self, coeff: [f32; 4]) -> Id {
        let (x, y, z) = (self.x, self.y, self.z);
        let ca = self.constant(coeff[0]);
        let cb = self.constant(coeff[1]);
        let cc = self.constant(coeff[2]);
        let cd = self.constant(coeff[3]);
        let ax = self.op_binary_raw(Opcode::Mul, ca, x);
        let by = self.op_binary_raw(Opcode::Mul, cb, y);
        let cz = self.op_binary_raw(Opcode::Mul, cc, z);
        let xy = self.op_binary_raw(Opcode::Add, ax, by);
        let zd = self.op_binary_raw(Opcode::Add, cz, cd);
        let body = self.op_binary_raw(Opcode::Add, xy, zd);
        let id = self.intern(Opcode::AffineVec, 0.0, body, Id::NONE);
        self.affine.insert(id, coeff);
        id
    }

    /// Unary operation with constant folding
    pub(crate) fn op_unary(&mut self, op: Opcode, a: Id) -> Id {
        debug_assert_eq!(op.arity(), 1);
        let an = *self.node(a);
        if an.op == Opcode::Const {
            let v = fold_unary(op, an.value);
            return self.constant(v);
        }
        if op == Opcode::Neg {
            // --a collapses; negated affine forms stay affine
            if an.op == Opcode::Neg {
                return an.lhs;
            }
            if let Some(c) = self.affine_of(a) {
                return self.affine([-c[0], -c[1], -c[2], -c[3]]);
            }
        }
        self.intern(op, 0.0, a, Id::NONE)
    }

    /// Binary operation with constant folding and affine propagation
    pub(crate) fn op_binary(&mut self, op: Opcode, a: Id, b: Id) -> Id {
        debug_assert_eq!(op.arity(), 2);
        let an = *self.node(a);
        let bn = *self.node(b);
        if an.op == Opcode::Const && bn.op == Opcode::Const {
            let v = fold_binary(op, an.value, bn.value);
            return self.constant(v);
        }

        // Combinations of affine forms stay affine, so the query keeps
        // succeeding on composed expressions like x + 2*y - 1.
        let fa = self.affine_of(a);
        let fb = self.affine_of(b);
        match op {
            Opcode::Add => {
                if let (Some(p), Some(q)) = (fa, fb) {
                    return self.affine([p[0] + q[0], p[1] + q[1], p[2] + q[2], p[3] + q[3]]);
                }
            }
            Opcode::Sub => {
                if let (Some(p), Some(q)) = (fa, fb) {
                    return self.affine([p[0] - q[0], p[1] - q[1], p[2] - q[2], p[3] - q[3]]);
                }
            }
            Opcode::Mul => {
                if let (Some(p), true) = (fa, bn.op == Opcode::Const) {
                    let s = bn.value;
                    return self.affine([p[0] * s, p[1] * s, p[2] * s, p[3] * s]);
                }
                if let (true, Some(q)) = (an.op == Opcode::Const, fb) {
                    let s = an.value;
                    return self.affine([q[0] * s, q[1] * s, q[2] * s, q[3] * s]);
                }
            }
            Opcode::Div => {
                if let (Some(p), true) = (fa, bn.op == Opcode::Const && bn.value != 0.0) {
                    let s = 1.0 / bn.value;
                    return self.affine([p[0] * s, p[1] * s, p[2] * s, p[3] * s]);
                }
            }
            _ => {}
        }
        self.op_binary_raw(op, a, b)
    }

    /// Binary intern with folding and trivial identities, no affine layer
    fn op_binary_raw(&mut self, op: Opcode, a: Id, b: Id) -> Id {
        let an = *self.node(a);
        let bn = *self.node(b);
        if an.op == Opcode::Const && bn.op == Opcode::Const {
            let v = fold_binary(op, an.value, bn.value);
            return self.constant(v);
        }
        let a_const = (an.op == Opcode::Const).then_some(an.value);
        let b_const = (bn.op == Opcode::Const).then_some(bn.value);
        match op {
            Opcode::Add => {
                if a_const == Some(0.0) {
                    return b;
                }
                if b_const == Some(0.0) {
                    return a;
                }
            }
            Opcode::Sub => {
                if b_const == Some(0.0) {
                    return a;
                }
            }
            Opcode::Mul => {
                if a_const == Some(0.0) || b_const == Some(0.0) {
                    return self.constant(0.0);
                }
                if a_const == Some(1.0) {
                    return b;
                }
                if b_const == Some(1.0) {
                    return a;
                }
            }
            Opcode::Div => {
                if b_const == Some(1.0) {
                    return a;
                }
            }
            _ => {}
        }
        self.intern(op, 0.0, a, b)
    }

    /// Every id reachable from `root` by following operand edges
    pub(crate) fn connected(&self, root: Id) -> HashSet<Id> {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = self.node(id);
            if !node.lhs.is_none() {
                stack.push(node.lhs);
            }
            if !node.rhs.is_none() {
                stack.push(node.rhs);
            }
        }
        seen
    }

    /// Rewrite the subgraph under `root` with AffineVec markers stripped
    ///
    /// The evaluator only understands arithmetic opcodes; markers resolve
    /// to their expanded body. Rebuilding goes through the raw builder so
    /// constant subtrees fold while collapsing.
    pub(crate) fn collapse(&mut self, root: Id) -> Id {
        let mut memo = HashMap::new();
        self.collapse_rec(root, &mut memo)
    }

    fn collapse_rec(&mut self, id: Id, memo: &mut HashMap<Id, Id>) -> Id {
        if let Some(&out) = memo.get(&id) {
            return out;
        }
        let node = *self.node(id);
        let out = match node.op.arity() {
            0 => id,
            1 => {
                let l = self.collapse_rec(node.lhs, memo);
                if node.op == Opcode::AffineVec {
                    l
                } else if l == node.lhs {
                    id
                } else {
                    self.op_unary(node.op, l)
                }
            }
            _ => {
                let l = self.collapse_rec(node.lhs, memo);
                let r = self.collapse_rec(node.rhs, memo);
                if l == node.lhs && r == node.rhs {
                    id
                } else {
                    self.op_binary_raw(node.op, l, r)
                }
            }
        };
        memo.insert(id, out);
        out
    }

    fn reset(&mut self) {
        self.nodes.truncate(1);
        self.index.clear();
        self.affine.clear();
        self.generation += 1;
        self.seed_axes();
    }
}

/// Shared handle to a node cache
///
/// Cloning is cheap and shares the underlying store; the cache lives as
/// long as its longest-lived handle (trees hold one). Tree-building
/// constructors live on this type — see [`Cache::x`],
/// [`Cache::constant`](Cache::constant) and friends in the `tree` module.
#[derive(Clone)]
pub struct Cache {
    pub(crate) inner: Arc<RwLock<CacheInner>>,
}

impl Cache {
    /// Create an empty cache (the three axis variables are pre-seeded)
    pub fn new() -> Self {
        Cache {
            inner: Arc::new(RwLock::new(CacheInner::new())),
        }
    }

    /// Discard every node and invalidate all outstanding trees
    ///
    /// This is the only deletion operation; it exists to bound memory
    /// growth across many short-lived tree constructions (interactive
    /// reload loops). Trees and evaluators built before the reset panic
    /// on next use rather than reading stale ids.
    pub fn reset(&self) {
        self.write().reset();
    }

    /// Current generation; bumped by every [`reset`](Cache::reset)
    pub fn generation(&self) -> u64 {
        self.read().generation()
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if no nodes beyond the pre-seeded axes exist
    pub fn is_empty(&self) -> bool {
        self.len() <= 3
    }

    /// Returns true if two handles share one store
    #[inline]
    pub fn same_store(&self, other: &Cache) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn read(&self) -> std::sync::RwLockReadGuard<'_, CacheInner> {
        self.inner
            .read()
            .expect("Cache: RwLock poisoned on read()")
    }

    pub(crate) fn write(&self) -> std::sync::RwLockWriteGuard<'_, CacheInner> {
        self.inner
            .write()
            .expect("Cache: RwLock poisoned on write()")
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_deduplicates() {
        let cache = Cache::new();
        let mut inner = cache.write();
        let c1 = inner.constant(2.5);
        let c2 = inner.constant(2.5);
        assert_eq!(c1, c2);
        let x = inner.var_x();
        let a = inner.op_binary_raw(Opcode::Min, x, c1);
        let b = inner.op_binary_raw(Opcode::Min, x, c2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_commutative_canonical_order() {
        let cache = Cache::new();
        let mut inner = cache.write();
        let x = inner.var_x();
        let y = inner.var_y();
        let ab = inner.intern(Opcode::Add, 0.0, x, y);
        let ba = inner.intern(Opcode::Add, 0.0, y, x);
        assert_eq!(ab, ba);
        // Non-commutative ops keep operand order distinct
        let sub_ab = inner.intern(Opcode::Sub, 0.0, x, y);
        let sub_ba = inner.intern(Opcode::Sub, 0.0, y, x);
        assert_ne!(sub_ab, sub_ba);
    }

    #[test]
    fn test_rank_increases_over_operands() {
        let cache = Cache::new();
        let mut inner = cache.write();
        let x = inner.var_x();
        assert_eq!(inner.node(x).rank, 0);
        let c = inner.constant(3.0);
        assert_eq!(inner.node(c).rank, 0);
        let sq = inner.intern(Opcode::Square, 0.0, x, Id::NONE);
        assert_eq!(inner.node(sq).rank, 1);
        let sum = inner.intern(Opcode::Add, 0.0, sq, c);
        assert_eq!(inner.node(sum).rank, 2);
    }

    #[test]
    fn test_constant_folding() {
        let cache = Cache::new();
        let mut inner = cache.write();
        let a = inner.constant(3.0);
        let b = inner.constant(4.0);
        let sum = inner.op_binary(Opcode::Add, a, b);
        assert_eq!(inner.node(sum).op, Opcode::Const);
        assert_eq!(inner.node(sum).value, 7.0);
    }

    #[test]
    fn test_affine_axis_is_degenerate_form() {
        let cache = Cache::new();
        let mut inner = cache.write();
        let x = inner.affine([1.0, 0.0, 0.0, 0.0]);
        assert_eq!(inner.node(x).op, Opcode::AffineVec);
        // Identity folding reduces the expansion to the bare variable
        assert_eq!(inner.node(x).lhs, inner.var_x());
        assert_eq!(inner.affine_of(x), Some([1.0, 0.0, 0.0, 0.0]));
    }

    #[test]
    fn test_affine_propagation_through_add() {
        let cache = Cache::new();
        let mut inner = cache.write();
        let x = inner.affine([1.0, 0.0, 0.0, 0.0]);
        let y = inner.affine([0.0, 1.0, 0.0, 0.0]);
        let sum = inner.op_binary(Opcode::Add, x, y);
        assert_eq!(inner.affine_of(sum), Some([1.0, 1.0, 0.0, 0.0]));
    }

    #[test]
    fn test_collapse_strips_markers() {
        let cache = Cache::new();
        let mut inner = cache.write();
        let x = inner.affine([1.0, 0.0, 0.0, 0.0]);
        let collapsed = inner.collapse(x);
        assert_eq!(collapsed, inner.var_x());
        // min(x, 5) keeps the Min but loses the marker operand
        let c5 = inner.constant(5.0);
        let m = inner.op_binary(Opcode::Min, x, c5);
        let mc = inner.collapse(m);
        assert_eq!(inner.node(mc).op, Opcode::Min);
        let lhs = inner.node(mc).lhs;
        let rhs = inner.node(mc).rhs;
        assert!(lhs == inner.var_x() || rhs == inner.var_x());
    }

    #[test]
    fn test_connected_subgraph() {
        let cache = Cache::new();
        let mut inner = cache.write();
        let x = inner.var_x();
        let y = inner.var_y();
        let sq = inner.intern(Opcode::Square, 0.0, x, Id::NONE);
        let unrelated = inner.intern(Opcode::Sqrt, 0.0, y, Id::NONE);
        let set = inner.connected(sq);
        assert!(set.contains(&sq));
        assert!(set.contains(&x));
        assert!(!set.contains(&unrelated));
        assert!(!set.contains(&y));
    }

    #[test]
    fn test_reset_bumps_generation() {
        let cache = Cache::new();
        assert_eq!(cache.generation(), 0);
        {
            let mut inner = cache.write();
            let x = inner.var_x();
            inner.intern(Opcode::Square, 0.0, x, Id::NONE);
        }
        let before = cache.len();
        assert!(before > 3);
        cache.reset();
        assert_eq!(cache.generation(), 1);
        assert_eq!(cache.len(), 3); // axes are re-seeded
    }
}
