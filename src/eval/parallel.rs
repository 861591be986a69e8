//! Bulk point evaluation across threads
//!
//! Evaluators are cheap to build relative to large point sets, so the
//! parallel paths give every worker its own evaluator (the compile step
//! reads the shared cache; the hot loops touch nothing shared). Batches
//! are [`BATCH_SIZE`] points, matching the evaluator arena.
//!
//! Author: Moroya Sakamoto

use glam::Vec3;
use rayon::prelude::*;

use crate::eval::{Evaluator, BATCH_SIZE};
use crate::tree::Tree;

fn eval_chunk(e: &mut Evaluator, chunk: &[Vec3]) -> Vec<f32> {
    for (i, &p) in chunk.iter().enumerate() {
        e.set(i, p);
    }
    e.values(chunk.len()).to_vec()
}

/// Evaluate `tree` at every point, in order, on the current thread
pub fn eval_points_serial(tree: &Tree, points: &[Vec3]) -> Vec<f32> {
    let mut e = Evaluator::new(tree);
    let mut out = Vec::with_capacity(points.len());
    for chunk in points.chunks(BATCH_SIZE) {
        out.extend_from_slice(&eval_chunk(&mut e, chunk)[..]);
    }
    out
}

/// Evaluate `tree` at every point, in order, across the rayon pool
pub fn eval_points(tree: &Tree, points: &[Vec3]) -> Vec<f32> {
    points
        .par_chunks(BATCH_SIZE)
        .map_init(|| Evaluator::new(tree), |e, chunk| eval_chunk(e, chunk))
        .flatten()
        .collect()
}

/// Evaluate value and gradient at every point across the rayon pool
pub fn eval_gradients(tree: &Tree, points: &[Vec3]) -> Vec<(f32, Vec3)> {
    points
        .par_chunks(BATCH_SIZE)
        .map_init(
            || Evaluator::new(tree),
            |e, chunk| {
                for (i, &p) in chunk.iter().enumerate() {
                    e.set(i, p);
                }
                let (v, dx, dy, dz) = e.derivs(chunk.len());
                (0..chunk.len())
                    .map(|i| (v[i], Vec3::new(dx[i], dy[i], dz[i])))
                    .collect::<Vec<_>>()
            },
        )
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;

    fn sphere(cache: &Cache, r: f32) -> Tree {
        let x = cache.x();
        let y = cache.y();
        let z = cache.z();
        (x.square() + y.square() + z.square()).sqrt() - cache.constant(r)
    }

    #[test]
    fn test_parallel_matches_serial() {
        let cache = Cache::new();
        let tree = sphere(&cache, 1.0);
        let points: Vec<Vec3> = (0..1000)
            .map(|i| {
                let t = i as f32 * 0.01;
                Vec3::new(t.sin(), t.cos(), t * 0.1)
            })
            .collect();
        let serial = eval_points_serial(&tree, &points);
        let parallel = eval_points(&tree, &points);
        assert_eq!(serial.len(), points.len());
        assert_eq!(serial, parallel);
    }

    #[test]
    fn test_gradients_on_unit_sphere() {
        let cache = Cache::new();
        let tree = sphere(&cache, 1.0);
        let points = vec![Vec3::new(2.0, 0.0, 0.0), Vec3::new(0.0, -3.0, 0.0)];
        let out = eval_gradients(&tree, &points);
        assert_eq!(out[0].0, 1.0);
        assert!((out[0].1 - Vec3::X).length() < 1e-6);
        assert!((out[1].1 - Vec3::NEG_Y).length() < 1e-6);
    }
}
