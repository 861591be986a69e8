//! ALICE-Implicit: expression-graph evaluation for implicit surfaces
//!
//! Shapes are arithmetic expressions over the spatial variables `x`,
//! `y`, `z`, built through a hash-consing [`Cache`](cache::Cache) so
//! that shared subexpressions are stored and evaluated once. A
//! [`Tree`](tree::Tree) is a lightweight handle to one such expression;
//! an [`Evaluator`](eval::Evaluator) freezes a tree into a flat,
//! rank-ordered program with three batched backends: scalar values,
//! forward-mode derivatives and interval arithmetic.
//!
//! Interval results drive the evaluator's push/pop masking: subtrees
//! proven irrelevant over a spatial region are skipped by later passes
//! inside it, which is what makes recursive subdivision rendering
//! cheap.
//!
//! ```
//! use alice_implicit::prelude::*;
//!
//! let cache = Cache::new();
//! let (x, y, z) = (cache.x(), cache.y(), cache.z());
//! let sphere = (x.square() + y.square() + z.square()).sqrt() - cache.constant(1.0);
//!
//! let mut eval = Evaluator::new(&sphere);
//! assert_eq!(eval.eval(Vec3::new(2.0, 0.0, 0.0)), 1.0);
//!
//! let bound = eval.eval_interval(Vec3::splat(-0.5), Vec3::splat(0.5));
//! assert!(bound.hi < 0.0); // the whole box is inside
//! ```
//!
//! Author: Moroya Sakamoto

#![warn(missing_docs)]

pub mod cache;
pub mod eval;
pub mod interval;
pub mod opcode;
pub mod tree;

pub use cache::Cache;
pub use eval::{EvalError, Evaluator, BATCH_SIZE};
pub use interval::Interval;
pub use opcode::Opcode;
pub use tree::Tree;

/// Common imports for working with the crate
pub mod prelude {
    pub use crate::cache::Cache;
    pub use crate::eval::parallel::{eval_gradients, eval_points, eval_points_serial};
    pub use crate::eval::{EvalError, Evaluator, BATCH_SIZE};
    pub use crate::interval::Interval;
    pub use crate::opcode::Opcode;
    pub use crate::tree::Tree;
    pub use glam::{Mat4, Vec3};
}
