//! Shared helpers for integration tests
//!
//! Author: Moroya Sakamoto

// Not every test binary uses every helper
#![allow(dead_code)]

use alice_implicit::prelude::*;

/// Signed distance to a sphere of radius `r` at the origin
pub fn sphere(cache: &Cache, r: f32) -> Tree {
    let (x, y, z) = (cache.x(), cache.y(), cache.z());
    (x.square() + y.square() + z.square()).sqrt() - cache.constant(r)
}

/// Implicit circle of radius `r` in the z = 0 plane (no sqrt, so the
/// gradient is polynomial and exact)
pub fn circle(cache: &Cache, r: f32) -> Tree {
    let (x, y) = (cache.x(), cache.y());
    x.square() + y.square() - cache.constant(r * r)
}

/// Union of two shapes (min of distances)
pub fn union(a: &Tree, b: &Tree) -> Tree {
    a.min(b)
}

/// Intersection of two shapes (max of distances)
pub fn intersection(a: &Tree, b: &Tree) -> Tree {
    a.max(b)
}

/// A deterministic scatter of sample points covering `[-s, s]^3`
pub fn scatter(n: usize, s: f32) -> Vec<Vec3> {
    (0..n)
        .map(|i| {
            let t = i as f32;
            Vec3::new(
                (t * 0.7391).sin() * s,
                (t * 1.1731).cos() * s,
                ((t * 0.3079).sin() * s * 2.0).rem_euclid(2.0 * s) - s,
            )
        })
        .collect()
}

/// Evaluate a tree by walking its structure directly, one point at a
/// time. Slow, but independent of the batched evaluator, so the two
/// can check each other.
pub fn eval_reference(t: &Tree, p: Vec3) -> f32 {
    if let Some(v) = t.const_value() {
        return v;
    }
    if let Some([a, b, c, d]) = t.affine_coefficients() {
        return a * p.x + b * p.y + c * p.z + d;
    }
    let lhs = t.lhs().map(|l| eval_reference(&l, p));
    let rhs = t.rhs().map(|r| eval_reference(&r, p));
    match t.op() {
        Opcode::VarX => p.x,
        Opcode::VarY => p.y,
        Opcode::VarZ => p.z,
        op => {
            let a = lhs.unwrap();
            match op {
                Opcode::Neg => -a,
                Opcode::Abs => a.abs(),
                Opcode::Square => a * a,
                Opcode::Sqrt => a.sqrt(),
                Opcode::Sin => a.sin(),
                Opcode::Cos => a.cos(),
                Opcode::Tan => a.tan(),
                Opcode::Asin => a.asin(),
                Opcode::Acos => a.acos(),
                Opcode::Atan => a.atan(),
                Opcode::Exp => a.exp(),
                op => {
                    let b = rhs.unwrap();
                    match op {
                        Opcode::Add => a + b,
                        Opcode::Sub => a - b,
                        Opcode::Mul => a * b,
                        Opcode::Div => a / b,
                        Opcode::Min => a.min(b),
                        Opcode::Max => a.max(b),
                        Opcode::Atan2 => a.atan2(b),
                        Opcode::Pow => a.powf(b),
                        Opcode::NthRoot => a.powf(1.0 / b),
                        Opcode::Mod => a.rem_euclid(b),
                        Opcode::NanFill => {
                            if a.is_nan() {
                                b
                            } else {
                                a
                            }
                        }
                        op => panic!("unexpected opcode {:?}", op),
                    }
                }
            }
        }
    }
}

/// Assert two floats agree within `eps`, treating NaN == NaN
pub fn assert_close(a: f32, b: f32, eps: f32) {
    if a.is_nan() && b.is_nan() {
        return;
    }
    assert!((a - b).abs() <= eps, "{} != {} (eps {})", a, b, eps);
}
