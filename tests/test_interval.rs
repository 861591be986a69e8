//! Interval evaluation soundness
//!
//! The invariant under test: for any tree and any box, every sampled
//! value inside the box falls within the interval result (modulo a tiny
//! epsilon for float rounding).
//!
//! Author: Moroya Sakamoto

mod common;

use alice_implicit::prelude::*;
use common::*;

const EPS: f32 = 1e-3;

fn assert_sound(tree: &Tree, lo: Vec3, hi: Vec3) {
    let mut e = Evaluator::new(tree);
    let r = e.eval_interval(lo, hi);
    let mut reval = Evaluator::new(tree);
    for i in 0..8 {
        for j in 0..8 {
            for k in 0..8 {
                let t = Vec3::new(i as f32, j as f32, k as f32) / 7.0;
                let p = lo + (hi - lo) * t;
                let v = reval.eval(p);
                if v.is_nan() {
                    continue;
                }
                assert!(
                    v >= r.lo - EPS && v <= r.hi + EPS,
                    "{} outside [{}, {}] at {:?}",
                    v,
                    r.lo,
                    r.hi,
                    p
                );
            }
        }
    }
}

#[test]
fn test_sphere_bounds() {
    let cache = Cache::new();
    let s = sphere(&cache, 1.0);
    assert_sound(&s, Vec3::splat(-2.0), Vec3::splat(2.0));
    assert_sound(&s, Vec3::splat(0.25), Vec3::splat(0.5));
}

#[test]
fn test_csg_bounds() {
    let cache = Cache::new();
    let a = sphere(&cache, 1.0);
    let b = circle(&cache, 0.5);
    let shape = intersection(&union(&a, &b), &-cache.z());
    assert_sound(&shape, Vec3::splat(-1.5), Vec3::splat(1.5));
}

#[test]
fn test_transcendental_bounds() {
    let cache = Cache::new();
    let (x, y) = (cache.x(), cache.y());
    let t = (x * 3.0).sin() + (y.cos() * 0.5) + cache.z().exp();
    assert_sound(&t, Vec3::new(-2.0, -2.0, -1.0), Vec3::new(2.0, 2.0, 1.0));
}

#[test]
fn test_division_crossing_zero_is_conservative() {
    let cache = Cache::new();
    let t = cache.constant(1.0) / cache.x();
    let mut e = Evaluator::new(&t);
    let r = e.eval_interval(Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
    assert_eq!(r.lo, f32::NEG_INFINITY);
    assert_eq!(r.hi, f32::INFINITY);
}

#[test]
fn test_inside_box_is_strictly_negative() {
    let cache = Cache::new();
    let s = sphere(&cache, 2.0);
    let mut e = Evaluator::new(&s);
    let r = e.eval_interval(Vec3::splat(-0.5), Vec3::splat(0.5));
    assert!(r.hi < 0.0);
}

#[test]
fn test_outside_box_is_strictly_positive() {
    let cache = Cache::new();
    let s = sphere(&cache, 1.0);
    let mut e = Evaluator::new(&s);
    let r = e.eval_interval(Vec3::new(5.0, 5.0, 5.0), Vec3::new(6.0, 6.0, 6.0));
    assert!(r.lo > 0.0);
}

#[test]
fn test_min_clamps_upper_bound() {
    let cache = Cache::new();
    let t = cache.x().min(&cache.constant(5.0));
    let mut e = Evaluator::new(&t);
    let r = e.eval_interval(Vec3::new(-1.0, 0.0, 0.0), Vec3::new(10.0, 0.0, 0.0));
    assert_eq!(r.lo, -1.0);
    assert_eq!(r.hi, 5.0);
}

#[test]
fn test_transformed_region() {
    let cache = Cache::new();
    let s = sphere(&cache, 1.0);
    let mat = Mat4::from_translation(Vec3::new(4.0, 0.0, 0.0));
    let mut e = Evaluator::with_transform(&s, mat);
    // The box around -4 on x maps onto the sphere's center
    let r = e.eval_interval(
        Vec3::new(-4.5, -0.5, -0.5),
        Vec3::new(-3.5, 0.5, 0.5),
    );
    assert!(r.lo < 0.0);
    assert!(r.contains(0.866 - 1.0)); // corner distance
}
