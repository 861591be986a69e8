//! Tree handles over cached expression graphs
//!
//! A [`Tree`] is a cheap, value-like handle: shared ownership of a
//! [`Cache`] plus the id of one root node. Composing trees with operators
//! or builder methods interns new nodes through the cache, so identical
//! subexpressions collapse to shared DAG nodes automatically:
//!
//! ```rust
//! use alice_implicit::prelude::*;
//!
//! let cache = Cache::new();
//! let (x, y) = (cache.x(), cache.y());
//! let circle = x.square() + y.square() - 1.0;
//! let mut ev = Evaluator::new(&circle);
//! assert!(ev.eval(Vec3::new(1.0, 0.0, 0.0)).abs() < 1e-6);
//! ```
//!
//! Trees record the cache generation they were built against; using a
//! tree after [`Cache::reset`] panics with a clear message instead of
//! resolving stale ids.
//!
//! Author: Moroya Sakamoto

use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::cache::{Cache, Id};
use crate::opcode::Opcode;

impl Cache {
    /// The x axis variable, as the degenerate affine form `1*x`
    pub fn x(&self) -> Tree {
        self.affine(1.0, 0.0, 0.0, 0.0)
    }

    /// The y axis variable
    pub fn y(&self) -> Tree {
        self.affine(0.0, 1.0, 0.0, 0.0)
    }

    /// The z axis variable
    pub fn z(&self) -> Tree {
        self.affine(0.0, 0.0, 1.0, 0.0)
    }

    /// A constant leaf
    pub fn constant(&self, v: f32) -> Tree {
        let id = self.write().constant(v);
        self.wrap(id)
    }

    /// The affine combination `a*x + b*y + c*z + d`, marked so
    /// [`Tree::affine_coefficients`] recovers the coefficients
    pub fn affine(&self, a: f32, b: f32, c: f32, d: f32) -> Tree {
        let id = self.write().affine([a, b, c, d]);
        self.wrap(id)
    }

    fn wrap(&self, id: Id) -> Tree {
        Tree {
            cache: self.clone(),
            id,
            generation: self.generation(),
        }
    }
}

/// Immutable handle to one root node of a cached expression graph
#[derive(Clone)]
pub struct Tree {
    pub(crate) cache: Cache,
    pub(crate) id: Id,
    pub(crate) generation: u64,
}

impl Tree {
    /// Panic if this tree predates the cache's current generation
    pub(crate) fn check_generation(&self) {
        let current = self.cache.generation();
        assert!(
            self.generation == current,
            "Tree from generation {} used after cache reset (generation {})",
            self.generation,
            current
        );
    }

    /// The cache this tree resolves against
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// A constant tree sharing this tree's cache
    pub fn constant(&self, v: f32) -> Tree {
        self.cache.constant(v)
    }

    fn unary(&self, op: Opcode) -> Tree {
        self.check_generation();
        let id = self.cache.write().op_unary(op, self.id);
        self.cache.wrap(id)
    }

    fn binary(&self, op: Opcode, rhs: &Tree) -> Tree {
        self.check_generation();
        rhs.check_generation();
        assert!(
            self.cache.same_store(&rhs.cache),
            "cannot combine trees from different caches"
        );
        let id = self.cache.write().op_binary(op, self.id, rhs.id);
        self.cache.wrap(id)
    }

    // === Unary builders ===

    /// Absolute value
    pub fn abs(&self) -> Tree {
        self.unary(Opcode::Abs)
    }

    /// Square (`t * t` as a single node)
    pub fn square(&self) -> Tree {
        self.unary(Opcode::Square)
    }

    /// Square root
    pub fn sqrt(&self) -> Tree {
        self.unary(Opcode::Sqrt)
    }

    /// Sine
    pub fn sin(&self) -> Tree {
        self.unary(Opcode::Sin)
    }

    /// Cosine
    pub fn cos(&self) -> Tree {
        self.unary(Opcode::Cos)
    }

    /// Tangent
    pub fn tan(&self) -> Tree {
        self.unary(Opcode::Tan)
    }

    /// Arc sine
    pub fn asin(&self) -> Tree {
        self.unary(Opcode::Asin)
    }

    /// Arc cosine
    pub fn acos(&self) -> Tree {
        self.unary(Opcode::Acos)
    }

    /// Arc tangent
    pub fn atan(&self) -> Tree {
        self.unary(Opcode::Atan)
    }

    /// Exponential
    pub fn exp(&self) -> Tree {
        self.unary(Opcode::Exp)
    }

    // === Binary builders ===

    /// Minimum (CSG union for signed distance fields)
    pub fn min(&self, rhs: &Tree) -> Tree {
        self.binary(Opcode::Min, rhs)
    }

    /// Maximum (CSG intersection for signed distance fields)
    pub fn max(&self, rhs: &Tree) -> Tree {
        self.binary(Opcode::Max, rhs)
    }

    /// `atan2(self, rhs)` with self as the y argument
    pub fn atan2(&self, rhs: &Tree) -> Tree {
        self.binary(Opcode::Atan2, rhs)
    }

    /// `self ^ rhs`; the derivative rule assumes a constant exponent
    pub fn pow(&self, rhs: &Tree) -> Tree {
        self.binary(Opcode::Pow, rhs)
    }

    /// `self ^ (1/rhs)`
    pub fn nth_root(&self, rhs: &Tree) -> Tree {
        self.binary(Opcode::NthRoot, rhs)
    }

    /// `self mod rhs`, normalized to a non-negative result
    pub fn modulo(&self, rhs: &Tree) -> Tree {
        self.binary(Opcode::Mod, rhs)
    }

    /// `rhs` wherever `self` evaluates to NaN, otherwise `self`
    pub fn nanfill(&self, rhs: &Tree) -> Tree {
        self.binary(Opcode::NanFill, rhs)
    }

    // === Projections ===

    /// Opcode of the root node
    pub fn op(&self) -> Opcode {
        self.check_generation();
        self.cache.read().node(self.id).op
    }

    /// Rank of the root node (longest path to a leaf)
    pub fn rank(&self) -> u32 {
        self.check_generation();
        self.cache.read().node(self.id).rank
    }

    /// Constant payload, when the root is a constant leaf
    pub fn const_value(&self) -> Option<f32> {
        self.check_generation();
        let inner = self.cache.read();
        let node = inner.node(self.id);
        (node.op == Opcode::Const).then_some(node.value)
    }

    /// First operand as a tree, when present
    pub fn lhs(&self) -> Option<Tree> {
        self.check_generation();
        let id = self.cache.read().node(self.id).lhs;
        (!id.is_none()).then(|| self.cache.wrap(id))
    }

    /// Second operand as a tree, when present
    pub fn rhs(&self) -> Option<Tree> {
        self.check_generation();
        let id = self.cache.read().node(self.id).rhs;
        (!id.is_none()).then(|| self.cache.wrap(id))
    }

    /// Coefficients `[a, b, c, d]` if this tree is the affine combination
    /// `a*x + b*y + c*z + d`, `None` otherwise
    pub fn affine_coefficients(&self) -> Option<[f32; 4]> {
        self.check_generation();
        self.cache.read().affine_of(self.id)
    }

    /// Canonical form with affine markers rewritten into plain arithmetic
    ///
    /// The evaluator applies this internally; it is exposed for callers
    /// that want to inspect the graph the evaluator will actually run.
    pub fn collapse(&self) -> Tree {
        self.check_generation();
        let id = self.cache.write().collapse(self.id);
        self.cache.wrap(id)
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

// Operator overloads: every combination of owned/borrowed operands plus
// f32 on either side, all funneling into the cache builders.
macro_rules! tree_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait<&Tree> for &Tree {
            type Output = Tree;
            fn $method(self, rhs: &Tree) -> Tree {
                self.binary($op, rhs)
            }
        }

        impl $trait<Tree> for Tree {
            type Output = Tree;
            fn $method(self, rhs: Tree) -> Tree {
                (&self).binary($op, &rhs)
            }
        }

        impl $trait<&Tree> for Tree {
            type Output = Tree;
            fn $method(self, rhs: &Tree) -> Tree {
                (&self).binary($op, rhs)
            }
        }

        impl $trait<Tree> for &Tree {
            type Output = Tree;
            fn $method(self, rhs: Tree) -> Tree {
                self.binary($op, &rhs)
            }
        }

        impl $trait<f32> for &Tree {
            type Output = Tree;
            fn $method(self, rhs: f32) -> Tree {
                let c = self.constant(rhs);
                self.binary($op, &c)
            }
        }

        impl $trait<f32> for Tree {
            type Output = Tree;
            fn $method(self, rhs: f32) -> Tree {
                let c = self.constant(rhs);
                (&self).binary($op, &c)
            }
        }

        impl $trait<&Tree> for f32 {
            type Output = Tree;
            fn $method(self, rhs: &Tree) -> Tree {
                let c = rhs.constant(self);
                c.binary($op, rhs)
            }
        }

        impl $trait<Tree> for f32 {
            type Output = Tree;
            fn $method(self, rhs: Tree) -> Tree {
                let c = rhs.constant(self);
                c.binary($op, &rhs)
            }
        }
    };
}

tree_binop!(Add, add, Opcode::Add);
tree_binop!(Sub, sub, Opcode::Sub);
tree_binop!(Mul, mul, Opcode::Mul);
tree_binop!(Div, div, Opcode::Div);

impl Neg for &Tree {
    type Output = Tree;
    fn neg(self) -> Tree {
        self.unary(Opcode::Neg)
    }
}

impl Neg for Tree {
    type Output = Tree;
    fn neg(self) -> Tree {
        (&self).unary(Opcode::Neg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operators_deduplicate() {
        let cache = Cache::new();
        let x = cache.x();
        let y = cache.y();
        let a = &x + &y;
        let b = &y + &x;
        assert_eq!(a.id, b.id);
        let c = &x * &x;
        let d = &x * &x;
        assert_eq!(c.id, d.id);
    }

    #[test]
    fn test_axis_affine_coefficients() {
        let cache = Cache::new();
        assert_eq!(cache.x().affine_coefficients(), Some([1.0, 0.0, 0.0, 0.0]));
        assert_eq!(cache.y().affine_coefficients(), Some([0.0, 1.0, 0.0, 0.0]));
        assert_eq!(cache.z().affine_coefficients(), Some([0.0, 0.0, 1.0, 0.0]));
    }

    #[test]
    fn test_composed_affine_coefficients() {
        let cache = Cache::new();
        let t = cache.x() * 2.0 + cache.y() - 3.0;
        assert_eq!(t.affine_coefficients(), Some([2.0, 1.0, 0.0, -3.0]));
        // A non-affine composition loses the form
        let q = cache.x().square() + cache.y();
        assert_eq!(q.affine_coefficients(), None);
    }

    #[test]
    fn test_projections() {
        let cache = Cache::new();
        let x = cache.x().collapse();
        assert_eq!(x.op(), Opcode::VarX);
        assert_eq!(x.rank(), 0);
        let c = cache.constant(4.5);
        assert_eq!(c.const_value(), Some(4.5));
        let sum = (&x + 1.0).collapse();
        assert_eq!(sum.op(), Opcode::Add);
        assert!(sum.rank() >= 1);
        assert!(sum.lhs().is_some());
        assert!(sum.rhs().is_some());
    }

    #[test]
    #[should_panic(expected = "after cache reset")]
    fn test_stale_tree_panics() {
        let cache = Cache::new();
        let x = cache.x();
        cache.reset();
        let _ = x.op();
    }

    #[test]
    #[should_panic(expected = "different caches")]
    fn test_cross_cache_panics() {
        let a = Cache::new();
        let b = Cache::new();
        let _ = a.x() + b.y();
    }
}
