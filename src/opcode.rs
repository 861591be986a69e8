//! Opcode definitions for the expression graph
//!
//! Every node in a [`Cache`](crate::cache::Cache) carries one of these
//! opcodes. The set is closed: the evaluator dispatches on it exhaustively
//! and there is no user-defined operation escape hatch.
//!
//! Author: Moroya Sakamoto

use serde::{Deserialize, Serialize};

/// Operation code for one expression-graph node
///
/// Grouped by arity:
/// - **Nullary**: `Const`, the three axis variables, and the `AffineVec`
///   marker (which wraps an already-expanded affine combination and is
///   stripped by [`Tree::collapse`](crate::tree::Tree::collapse) before
///   evaluation).
/// - **Unary**: negation, absolute value, square, square root, the trig
///   family, and exp.
/// - **Binary**: arithmetic, min/max, atan2, pow, nth-root, modulo and
///   NaN-fill.
/// - **Pass-through**: `FirstArg`/`SecondArg` never appear in a cache; the
///   evaluator substitutes them for a clause whose other operand subtree
///   has been masked out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    /// Constant leaf; the node's scalar payload holds the value
    Const = 0,
    /// Axis variable x
    VarX = 1,
    /// Axis variable y
    VarY = 2,
    /// Axis variable z
    VarZ = 3,
    /// Marker wrapping an affine combination `a*x + b*y + c*z + d`
    AffineVec = 4,

    // === Unary ===
    /// `-a`
    Neg = 16,
    /// `|a|`
    Abs = 17,
    /// `a * a`
    Square = 18,
    /// `sqrt(a)`
    Sqrt = 19,
    /// `sin(a)`
    Sin = 20,
    /// `cos(a)`
    Cos = 21,
    /// `tan(a)`
    Tan = 22,
    /// `asin(a)`
    Asin = 23,
    /// `acos(a)`
    Acos = 24,
    /// `atan(a)`
    Atan = 25,
    /// `exp(a)`
    Exp = 26,

    // === Binary ===
    /// `a + b`
    Add = 32,
    /// `a - b`
    Sub = 33,
    /// `a * b`
    Mul = 34,
    /// `a / b`
    Div = 35,
    /// `min(a, b)`
    Min = 36,
    /// `max(a, b)`
    Max = 37,
    /// `atan2(a, b)` (a is the y argument)
    Atan2 = 38,
    /// `a ^ b` (b is constant in practice; the derivative rule assumes it)
    Pow = 39,
    /// `a ^ (1/b)`
    NthRoot = 40,
    /// `a mod b`, normalized to a non-negative result
    Mod = 41,
    /// `b` where `a` is NaN, otherwise `a`
    NanFill = 42,

    // === Pass-through (evaluator-internal) ===
    /// Forward the first operand unchanged
    FirstArg = 48,
    /// Forward the second operand unchanged
    SecondArg = 49,
}

impl Opcode {
    /// Number of operands the opcode consumes (0, 1, or 2)
    #[inline]
    pub fn arity(self) -> usize {
        match self {
            Opcode::Const | Opcode::VarX | Opcode::VarY | Opcode::VarZ => 0,
            Opcode::AffineVec
            | Opcode::Neg
            | Opcode::Abs
            | Opcode::Square
            | Opcode::Sqrt
            | Opcode::Sin
            | Opcode::Cos
            | Opcode::Tan
            | Opcode::Asin
            | Opcode::Acos
            | Opcode::Atan
            | Opcode::Exp
            | Opcode::FirstArg => 1,
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Min
            | Opcode::Max
            | Opcode::Atan2
            | Opcode::Pow
            | Opcode::NthRoot
            | Opcode::Mod
            | Opcode::NanFill
            | Opcode::SecondArg => 2,
        }
    }

    /// Returns true for `Const` and the three axis variables
    #[inline]
    pub fn is_leaf(self) -> bool {
        matches!(
            self,
            Opcode::Const | Opcode::VarX | Opcode::VarY | Opcode::VarZ
        )
    }

    /// Returns true if operand order does not matter
    ///
    /// The cache sorts the operand pair of commutative opcodes before
    /// hashing, so `a + b` and `b + a` intern to the same node.
    #[inline]
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Mul | Opcode::Min | Opcode::Max
        )
    }

    /// Returns true for the evaluator-internal pass-through markers
    #[inline]
    pub fn is_passthrough(self) -> bool {
        matches!(self, Opcode::FirstArg | Opcode::SecondArg)
    }
}
