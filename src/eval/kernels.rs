//! Per-opcode arithmetic kernels: scalar, 8-wide SIMD, and interval
//!
//! Each kernel takes whole batch buffers and dispatches on the opcode
//! once, outside the sample loop. Opcodes with hardware-friendly forms
//! (add/sub/mul/div/min/max/neg/abs/square/sqrt and the pass-throughs)
//! run 8 samples per step through `wide::f32x8`; the transcendental and
//! piecewise-exotic ones fall back to a lane-wise scalar loop over the
//! same buffers. Lanes are always distinct sample points, never distinct
//! clauses.
//!
//! The derivative kernels implement closed-form rules: product and
//! quotient rules, chain rule through the trig family and exp, branch
//! selection for min/max/abs, a zero clamp for sqrt of negative inputs,
//! and a deliberate pass-through for mod (good enough for normals, wrong
//! near the discontinuities).
//!
//! Author: Moroya Sakamoto

use wide::{f32x8, CmpLt};

use crate::interval::{
    atan2_interval, mod_interval, nth_root_interval, pow_interval, Interval,
};
use crate::opcode::Opcode;

/// SIMD lane width; batch buffers are padded to a multiple of this
pub(crate) const LANES: usize = 8;

#[inline(always)]
fn load(sl: &[f32]) -> f32x8 {
    let mut arr = [0.0f32; LANES];
    arr.copy_from_slice(sl);
    f32x8::new(arr)
}

#[inline(always)]
fn store(v: f32x8, out: &mut [f32]) {
    out.copy_from_slice(&v.to_array());
}

/// Scalar evaluation of a unary opcode (also used for constant folding)
#[inline]
pub(crate) fn fold_unary(op: Opcode, a: f32) -> f32 {
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
        Opcode::AffineVec | Opcode::FirstArg => a,
        _ => unreachable!("{:?} is not a unary opcode", op),
    }
}

/// Scalar evaluation of a binary opcode (also used for constant folding)
#[inline]
pub(crate) fn fold_binary(op: Opcode, a: f32, b: f32) -> f32 {
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
        Opcode::SecondArg => b,
        _ => unreachable!("{:?} is not a binary opcode", op),
    }
}

#[inline(always)]
fn wide1(a: &[f32], out: &mut [f32], f: impl Fn(f32x8) -> f32x8) {
    for (o, x) in out.chunks_exact_mut(LANES).zip(a.chunks_exact(LANES)) {
        store(f(load(x)), o);
    }
}

#[inline(always)]
fn wide2(a: &[f32], b: &[f32], out: &mut [f32], f: impl Fn(f32x8, f32x8) -> f32x8) {
    for ((o, x), y) in out
        .chunks_exact_mut(LANES)
        .zip(a.chunks_exact(LANES))
        .zip(b.chunks_exact(LANES))
    {
        store(f(load(x), load(y)), o);
    }
}

#[inline(always)]
fn scalar1(a: &[f32], out: &mut [f32], f: impl Fn(f32) -> f32) {
    for (o, &x) in out.iter_mut().zip(a) {
        *o = f(x);
    }
}

#[inline(always)]
fn scalar2(a: &[f32], b: &[f32], out: &mut [f32], f: impl Fn(f32, f32) -> f32) {
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = f(x, y);
    }
}

/// Batched value kernel: `out[i] = op(a[i], b[i])`
///
/// All three slices have the same (lane-padded) length. Unary opcodes
/// ignore `b`; the caller passes any valid slice for it.
pub(crate) fn value_kernel(op: Opcode, a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), out.len());
    debug_assert_eq!(b.len(), out.len());
    debug_assert_eq!(out.len() % LANES, 0);

    match op {
        // === 8-wide ===
        Opcode::Add => wide2(a, b, out, |x, y| x + y),
        Opcode::Sub => wide2(a, b, out, |x, y| x - y),
        Opcode::Mul => wide2(a, b, out, |x, y| x * y),
        Opcode::Div => wide2(a, b, out, |x, y| x / y),
        Opcode::Min => wide2(a, b, out, |x, y| x.min(y)),
        Opcode::Max => wide2(a, b, out, |x, y| x.max(y)),
        Opcode::Neg => wide1(a, out, |x| -x),
        Opcode::Abs => wide1(a, out, |x| x.abs()),
        Opcode::Square => wide1(a, out, |x| x * x),
        Opcode::Sqrt => wide1(a, out, |x| x.sqrt()),
        Opcode::FirstArg => out.copy_from_slice(a),
        Opcode::SecondArg => out.copy_from_slice(b),

        // === Scalar fallback (no vector form) ===
        Opcode::Sin => scalar1(a, out, |x| x.sin()),
        Opcode::Cos => scalar1(a, out, |x| x.cos()),
        Opcode::Tan => scalar1(a, out, |x| x.tan()),
        Opcode::Asin => scalar1(a, out, |x| x.asin()),
        Opcode::Acos => scalar1(a, out, |x| x.acos()),
        Opcode::Atan => scalar1(a, out, |x| x.atan()),
        Opcode::Exp => scalar1(a, out, |x| x.exp()),
        Opcode::Atan2 => scalar2(a, b, out, |x, y| x.atan2(y)),
        Opcode::Pow => scalar2(a, b, out, |x, y| x.powf(y)),
        Opcode::NthRoot => scalar2(a, b, out, |x, y| x.powf(1.0 / y)),
        Opcode::Mod => scalar2(a, b, out, |x, y| x.rem_euclid(y)),
        Opcode::NanFill => scalar2(a, b, out, |x, y| if x.is_nan() { y } else { x }),

        Opcode::Const | Opcode::VarX | Opcode::VarY | Opcode::VarZ | Opcode::AffineVec => {
            unreachable!("{:?} reached arithmetic dispatch", op)
        }
    }
}

/// Operand buffers for one side of the derivative kernel
pub(crate) struct DerivIn<'a> {
    pub v: &'a [f32],
    pub dx: &'a [f32],
    pub dy: &'a [f32],
    pub dz: &'a [f32],
}

/// Output buffers for the derivative kernel
pub(crate) struct DerivOut<'a> {
    pub v: &'a mut [f32],
    pub dx: &'a mut [f32],
    pub dy: &'a mut [f32],
    pub dz: &'a mut [f32],
}

/// Batched derivative kernel: values plus the three partials
///
/// The value pass runs first (some rules read the freshly computed
/// output, e.g. sqrt), then the partials are propagated per axis.
pub(crate) fn deriv_kernel(op: Opcode, a: DerivIn, b: DerivIn, out: DerivOut) {
    let DerivOut {
        v: ov,
        dx: odx,
        dy: ody,
        dz: odz,
    } = out;
    value_kernel(op, a.v, b.v, ov);
    let n = ov.len();

    match op {
        Opcode::Add => {
            wide2(a.dx, b.dx, odx, |p, q| p + q);
            wide2(a.dy, b.dy, ody, |p, q| p + q);
            wide2(a.dz, b.dz, odz, |p, q| p + q);
        }
        Opcode::Sub => {
            wide2(a.dx, b.dx, odx, |p, q| p - q);
            wide2(a.dy, b.dy, ody, |p, q| p - q);
            wide2(a.dz, b.dz, odz, |p, q| p - q);
        }
        Opcode::Neg => {
            wide1(a.dx, odx, |p| -p);
            wide1(a.dy, ody, |p| -p);
            wide1(a.dz, odz, |p| -p);
        }
        Opcode::Mul => {
            // Product rule, 8 lanes at a time
            let mut i = 0;
            while i < n {
                let r = i..i + LANES;
                let av = load(&a.v[r.clone()]);
                let bv = load(&b.v[r.clone()]);
                store(av * load(&b.dx[r.clone()]) + load(&a.dx[r.clone()]) * bv, &mut odx[r.clone()]);
                store(av * load(&b.dy[r.clone()]) + load(&a.dy[r.clone()]) * bv, &mut ody[r.clone()]);
                store(av * load(&b.dz[r.clone()]) + load(&a.dz[r.clone()]) * bv, &mut odz[r]);
                i += LANES;
            }
        }
        Opcode::Div => {
            // Quotient rule
            let mut i = 0;
            while i < n {
                let r = i..i + LANES;
                let av = load(&a.v[r.clone()]);
                let bv = load(&b.v[r.clone()]);
                let p = bv * bv;
                store((bv * load(&a.dx[r.clone()]) - av * load(&b.dx[r.clone()])) / p, &mut odx[r.clone()]);
                store((bv * load(&a.dy[r.clone()]) - av * load(&b.dy[r.clone()])) / p, &mut ody[r.clone()]);
                store((bv * load(&a.dz[r.clone()]) - av * load(&b.dz[r.clone()])) / p, &mut odz[r]);
                i += LANES;
            }
        }
        Opcode::Min => {
            // Derivative of the winning branch
            let mut i = 0;
            while i < n {
                let r = i..i + LANES;
                let m = load(&a.v[r.clone()]).cmp_lt(load(&b.v[r.clone()]));
                store(m.blend(load(&a.dx[r.clone()]), load(&b.dx[r.clone()])), &mut odx[r.clone()]);
                store(m.blend(load(&a.dy[r.clone()]), load(&b.dy[r.clone()])), &mut ody[r.clone()]);
                store(m.blend(load(&a.dz[r.clone()]), load(&b.dz[r.clone()])), &mut odz[r]);
                i += LANES;
            }
        }
        Opcode::Max => {
            let mut i = 0;
            while i < n {
                let r = i..i + LANES;
                let m = load(&a.v[r.clone()]).cmp_lt(load(&b.v[r.clone()]));
                store(m.blend(load(&b.dx[r.clone()]), load(&a.dx[r.clone()])), &mut odx[r.clone()]);
                store(m.blend(load(&b.dy[r.clone()]), load(&a.dy[r.clone()])), &mut ody[r.clone()]);
                store(m.blend(load(&b.dz[r.clone()]), load(&a.dz[r.clone()])), &mut odz[r]);
                i += LANES;
            }
        }
        Opcode::Square => {
            let two = f32x8::splat(2.0);
            let mut i = 0;
            while i < n {
                let r = i..i + LANES;
                let av = load(&a.v[r.clone()]);
                store(two * av * load(&a.dx[r.clone()]), &mut odx[r.clone()]);
                store(two * av * load(&a.dy[r.clone()]), &mut ody[r.clone()]);
                store(two * av * load(&a.dz[r.clone()]), &mut odz[r]);
                i += LANES;
            }
        }
        Opcode::Sqrt => {
            // Clamp the derivative at zero for negative inputs instead of
            // propagating NaN
            for i in 0..n {
                if a.v[i] < 0.0 {
                    odx[i] = 0.0;
                    ody[i] = 0.0;
                    odz[i] = 0.0;
                } else {
                    let den = 2.0 * ov[i];
                    odx[i] = a.dx[i] / den;
                    ody[i] = a.dy[i] / den;
                    odz[i] = a.dz[i] / den;
                }
            }
        }
        Opcode::Abs => {
            for i in 0..n {
                if a.v[i] < 0.0 {
                    odx[i] = -a.dx[i];
                    ody[i] = -a.dy[i];
                    odz[i] = -a.dz[i];
                } else {
                    odx[i] = a.dx[i];
                    ody[i] = a.dy[i];
                    odz[i] = a.dz[i];
                }
            }
        }
        Opcode::Atan2 => {
            for i in 0..n {
                let d = a.v[i] * a.v[i] + b.v[i] * b.v[i];
                odx[i] = (a.dx[i] * b.v[i] - a.v[i] * b.dx[i]) / d;
                ody[i] = (a.dy[i] * b.v[i] - a.v[i] * b.dy[i]) / d;
                odz[i] = (a.dz[i] * b.v[i] - a.v[i] * b.dz[i]) / d;
            }
        }
        Opcode::Pow => {
            // d(a^b) = b * a^(b-1) * da; the log(a)*db term is dropped
            // since the exponent is constant in practice (and log of a
            // negative base would poison the gradient with NaN)
            for i in 0..n {
                let m = a.v[i].powf(b.v[i] - 1.0);
                odx[i] = m * b.v[i] * a.dx[i];
                ody[i] = m * b.v[i] * a.dy[i];
                odz[i] = m * b.v[i] * a.dz[i];
            }
        }
        Opcode::NthRoot => {
            for i in 0..n {
                let e = 1.0 / b.v[i];
                let m = a.v[i].powf(e - 1.0);
                odx[i] = m * e * a.dx[i];
                ody[i] = m * e * a.dy[i];
                odz[i] = m * e * a.dz[i];
            }
        }
        Opcode::Mod => {
            // Not how partial derivatives of mod actually work, but close
            // enough for normals rendering away from the seams
            odx.copy_from_slice(a.dx);
            ody.copy_from_slice(a.dy);
            odz.copy_from_slice(a.dz);
        }
        Opcode::NanFill => {
            for i in 0..n {
                if a.v[i].is_nan() {
                    odx[i] = b.dx[i];
                    ody[i] = b.dy[i];
                    odz[i] = b.dz[i];
                } else {
                    odx[i] = a.dx[i];
                    ody[i] = a.dy[i];
                    odz[i] = a.dz[i];
                }
            }
        }
        Opcode::Sin => {
            for i in 0..n {
                let c = a.v[i].cos();
                odx[i] = a.dx[i] * c;
                ody[i] = a.dy[i] * c;
                odz[i] = a.dz[i] * c;
            }
        }
        Opcode::Cos => {
            for i in 0..n {
                let s = -a.v[i].sin();
                odx[i] = a.dx[i] * s;
                ody[i] = a.dy[i] * s;
                odz[i] = a.dz[i] * s;
            }
        }
        Opcode::Tan => {
            for i in 0..n {
                let c = a.v[i].cos();
                let s = 1.0 / (c * c);
                odx[i] = a.dx[i] * s;
                ody[i] = a.dy[i] * s;
                odz[i] = a.dz[i] * s;
            }
        }
        Opcode::Asin => {
            for i in 0..n {
                let d = (1.0 - a.v[i] * a.v[i]).sqrt();
                odx[i] = a.dx[i] / d;
                ody[i] = a.dy[i] / d;
                odz[i] = a.dz[i] / d;
            }
        }
        Opcode::Acos => {
            for i in 0..n {
                let d = -(1.0 - a.v[i] * a.v[i]).sqrt();
                odx[i] = a.dx[i] / d;
                ody[i] = a.dy[i] / d;
                odz[i] = a.dz[i] / d;
            }
        }
        Opcode::Atan => {
            for i in 0..n {
                let d = a.v[i] * a.v[i] + 1.0;
                odx[i] = a.dx[i] / d;
                ody[i] = a.dy[i] / d;
                odz[i] = a.dz[i] / d;
            }
        }
        Opcode::Exp => {
            for i in 0..n {
                let e = a.v[i].exp();
                odx[i] = e * a.dx[i];
                ody[i] = e * a.dy[i];
                odz[i] = e * a.dz[i];
            }
        }
        Opcode::FirstArg => {
            odx.copy_from_slice(a.dx);
            ody.copy_from_slice(a.dy);
            odz.copy_from_slice(a.dz);
        }
        Opcode::SecondArg => {
            odx.copy_from_slice(b.dx);
            ody.copy_from_slice(b.dy);
            odz.copy_from_slice(b.dz);
        }
        Opcode::Const | Opcode::VarX | Opcode::VarY | Opcode::VarZ | Opcode::AffineVec => {
            unreachable!("{:?} reached arithmetic dispatch", op)
        }
    }
}

/// Interval kernel: conservative bounds per opcode
pub(crate) fn interval_kernel(op: Opcode, a: Interval, b: Interval) -> Interval {
    match op {
        Opcode::Add => a + b,
        Opcode::Sub => a - b,
        Opcode::Mul => a * b,
        Opcode::Div => a / b,
        Opcode::Min => a.min(b),
        Opcode::Max => a.max(b),
        Opcode::Atan2 => atan2_interval(a, b),
        Opcode::Pow => pow_interval(a, b),
        Opcode::NthRoot => nth_root_interval(a, b),
        Opcode::Mod => mod_interval(a, b),
        Opcode::NanFill => {
            if a.is_nan() {
                b
            } else {
                a
            }
        }
        Opcode::Neg => -a,
        Opcode::Abs => a.abs(),
        Opcode::Square => a.square(),
        Opcode::Sqrt => a.sqrt(),
        Opcode::Sin => a.sin(),
        Opcode::Cos => a.cos(),
        Opcode::Tan => a.tan(),
        Opcode::Asin => a.asin(),
        Opcode::Acos => a.acos(),
        Opcode::Atan => a.atan(),
        Opcode::Exp => a.exp(),
        Opcode::FirstArg => a,
        Opcode::SecondArg => b,
        Opcode::Const | Opcode::VarX | Opcode::VarY | Opcode::VarZ | Opcode::AffineVec => {
            unreachable!("{:?} reached arithmetic dispatch", op)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: usize = 16;

    fn buf(f: impl Fn(usize) -> f32) -> Vec<f32> {
        (0..N).map(f).collect()
    }

    #[test]
    fn test_value_kernel_matches_scalar_fold() {
        let a = buf(|i| i as f32 * 0.37 - 2.0);
        let b = buf(|i| 1.5 - i as f32 * 0.21);
        let ops = [
            Opcode::Add,
            Opcode::Sub,
            Opcode::Mul,
            Opcode::Div,
            Opcode::Min,
            Opcode::Max,
            Opcode::Atan2,
            Opcode::Mod,
        ];
        for op in ops {
            let mut out = vec![0.0; N];
            value_kernel(op, &a, &b, &mut out);
            for i in 0..N {
                let expect = fold_binary(op, a[i], b[i]);
                assert!(
                    (out[i] - expect).abs() < 1e-6 || (out[i].is_nan() && expect.is_nan()),
                    "{:?} lane {}: {} != {}",
                    op,
                    i,
                    out[i],
                    expect
                );
            }
        }
    }

    #[test]
    fn test_unary_wide_matches_scalar() {
        let a = buf(|i| i as f32 * 0.5 - 3.0);
        let ops = [Opcode::Neg, Opcode::Abs, Opcode::Square];
        for op in ops {
            let mut out = vec![0.0; N];
            value_kernel(op, &a, &a, &mut out);
            for i in 0..N {
                assert_eq!(out[i], fold_unary(op, a[i]), "{:?} lane {}", op, i);
            }
        }
    }

    #[test]
    fn test_min_deriv_picks_winning_branch() {
        let av = buf(|i| if i < 8 { -1.0 } else { 1.0 });
        let bv = vec![0.0; N];
        let ones = vec![1.0; N];
        let zeros = vec![0.0; N];
        let mut ov = vec![0.0; N];
        let mut odx = vec![0.0; N];
        let mut ody = vec![0.0; N];
        let mut odz = vec![0.0; N];
        deriv_kernel(
            Opcode::Min,
            DerivIn {
                v: &av,
                dx: &ones,
                dy: &zeros,
                dz: &zeros,
            },
            DerivIn {
                v: &bv,
                dx: &zeros,
                dy: &ones,
                dz: &zeros,
            },
            DerivOut {
                v: &mut ov,
                dx: &mut odx,
                dy: &mut ody,
                dz: &mut odz,
            },
        );
        for i in 0..N {
            if i < 8 {
                // a wins: derivative comes from a
                assert_eq!(odx[i], 1.0);
                assert_eq!(ody[i], 0.0);
            } else {
                assert_eq!(odx[i], 0.0);
                assert_eq!(ody[i], 1.0);
            }
        }
    }

    #[test]
    fn test_sqrt_deriv_clamps_negative() {
        let av = buf(|i| i as f32 - 8.0);
        let ones = vec![1.0; N];
        let zeros = vec![0.0; N];
        let mut ov = vec![0.0; N];
        let mut odx = vec![0.0; N];
        let mut ody = vec![0.0; N];
        let mut odz = vec![0.0; N];
        deriv_kernel(
            Opcode::Sqrt,
            DerivIn {
                v: &av,
                dx: &ones,
                dy: &zeros,
                dz: &zeros,
            },
            DerivIn {
                v: &av,
                dx: &zeros,
                dy: &zeros,
                dz: &zeros,
            },
            DerivOut {
                v: &mut ov,
                dx: &mut odx,
                dy: &mut ody,
                dz: &mut odz,
            },
        );
        for i in 0..N {
            if av[i] < 0.0 {
                assert_eq!(odx[i], 0.0);
            } else {
                assert!(odx[i].is_finite() || av[i] == 0.0);
            }
        }
    }

    #[test]
    fn test_interval_kernel_min() {
        let a = Interval::new(-1.0, 10.0);
        let b = Interval::point(5.0);
        let r = interval_kernel(Opcode::Min, a, b);
        assert_eq!(r.lo, -1.0);
        assert_eq!(r.hi, 5.0);
    }
}
