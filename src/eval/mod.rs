//! Batched expression evaluation: values, derivatives and intervals
//!
//! An [`Evaluator`] freezes one tree into a flat clause list ordered by
//! rank, with one result arena slot per clause. The same clause list
//! drives three passes:
//!
//! - [`Evaluator::values`]: up to [`BATCH_SIZE`] scalar samples at once,
//!   8 lanes per SIMD step
//! - [`Evaluator::derivs`]: values plus forward-mode partials, giving
//!   exact surface normals away from non-differentiable points
//! - [`Evaluator::interval`]: one conservative bound over a box region
//!
//! Interval results additionally feed the [`Evaluator::push`] /
//! [`Evaluator::pop`] masking protocol: after an interval pass over a
//! region, `push` disables every clause that provably cannot affect the
//! root inside that region (min/max branches dominated over the whole
//! box), so subsequent passes in the region skip them. `pop` restores
//! the previous state; push/pop nest LIFO for recursive spatial
//! subdivision.
//!
//! Construction walks the tree once through the shared [`Cache`]; after
//! that the evaluator owns plain vectors and never locks, so one
//! evaluator per worker thread scales linearly.
//!
//! Author: Moroya Sakamoto

pub(crate) mod kernels;
pub mod parallel;

use glam::{Mat4, Vec3};
use thiserror::Error;

use crate::cache::{Cache, Id};
use crate::interval::Interval;
use crate::opcode::Opcode;
use crate::tree::Tree;

use kernels::{deriv_kernel, interval_kernel, value_kernel, DerivIn, DerivOut, LANES};

/// Maximum number of sample points per batched pass
pub const BATCH_SIZE: usize = 256;

/// Marker for a clause with no second operand
const NO_ARG: u32 = u32::MAX;

/// Errors from fallible evaluator construction
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    /// The tree was built before the most recent cache reset
    #[error("tree from generation {tree} used after cache reset (generation {cache})")]
    StaleGeneration {
        /// Generation the tree was built against
        tree: u64,
        /// Current cache generation
        cache: u64,
    },
}

/// One flattened operation
///
/// Operand fields index into the clause list; rank ordering guarantees
/// both are strictly smaller than the clause's own index.
///
/// `disabled` is the cumulative mask across every enclosing push; it is
/// set and cleared only at row-prefix boundaries, so `pop` can restore
/// it from the row's saved active count alone. `ignored` is transient
/// scratch for the walk inside one `push` and is always false outside
/// it.
struct Clause {
    op: Opcode,
    a: u32,
    b: u32,
    disabled: bool,
    ignored: bool,
}

impl Clause {
    #[inline]
    fn has_b(&self) -> bool {
        self.b != NO_ARG
    }
}

/// Clauses of one rank, partitioned into enabled and disabled halves
///
/// Indices in `[0, active)` are enabled; swaps during a push stay inside
/// the range that was active when that push began, so popping the saved
/// count restores the exact previous membership.
struct Row {
    clauses: Vec<u32>,
    active: usize,
    saved: Vec<usize>,
}

/// Batched evaluator for one tree under one coordinate transform
pub struct Evaluator {
    cache: Cache,
    generation: u64,

    mat: Mat4,
    mat_inv: Mat4,

    clauses: Vec<Clause>,
    /// Rank r clauses live in `rows[r - 1]`; rank 0 needs no scheduling
    rows: Vec<Row>,

    /// Flat arenas, `BATCH_SIZE` floats per clause
    values: Vec<f32>,
    dx: Vec<f32>,
    dy: Vec<f32>,
    dz: Vec<f32>,
    /// One interval result per clause
    intervals: Vec<Interval>,

    x: usize,
    y: usize,
    z: usize,
    root: usize,
}

impl Evaluator {
    /// Compile `tree` for evaluation in its own coordinates
    ///
    /// # Panics
    ///
    /// Panics if the tree is stale (its cache was reset after it was
    /// built). Use [`Evaluator::try_with_transform`] to handle that as
    /// an error instead.
    pub fn new(tree: &Tree) -> Self {
        Self::with_transform(tree, Mat4::IDENTITY)
    }

    /// Compile `tree`, mapping every query point through `mat` first
    ///
    /// The transform applies to inputs: a query at `p` evaluates the
    /// tree at `mat * p`. Gradients are mapped back through the inverse
    /// so normals stay consistent with the query coordinates.
    ///
    /// # Panics
    ///
    /// Panics if the tree is stale.
    pub fn with_transform(tree: &Tree, mat: Mat4) -> Self {
        match Self::try_with_transform(tree, mat) {
            Ok(e) => e,
            Err(e) => panic!("{}", e),
        }
    }

    /// Fallible variant of [`Evaluator::with_transform`]
    pub fn try_with_transform(tree: &Tree, mat: Mat4) -> Result<Self, EvalError> {
        let cache = tree.cache().clone();
        let generation = cache.generation();
        if tree.generation != generation {
            return Err(EvalError::StaleGeneration {
                tree: tree.generation,
                cache: generation,
            });
        }

        let mut inner = cache.write();
        let root_id = inner.collapse(tree.id);
        let connected = inner.connected(root_id);

        // Axis clauses come first so their slots are known a priori,
        // then the remaining rank-0 nodes, then ranked clauses ordered
        // by (rank, id). Operand slots always precede their consumers.
        let mut ids: Vec<Id> = connected
            .iter()
            .copied()
            .filter(|&id| {
                id != inner.var_x() && id != inner.var_y() && id != inner.var_z()
            })
            .collect();
        ids.sort_by_key(|&id| (inner.node(id).rank, id));

        let mut slot = std::collections::HashMap::with_capacity(ids.len() + 3);
        slot.insert(inner.var_x(), 0u32);
        slot.insert(inner.var_y(), 1u32);
        slot.insert(inner.var_z(), 2u32);
        for (i, &id) in ids.iter().enumerate() {
            slot.insert(id, (i + 3) as u32);
        }

        let n = ids.len() + 3;
        let mut clauses = Vec::with_capacity(n);
        for op in [Opcode::VarX, Opcode::VarY, Opcode::VarZ] {
            clauses.push(Clause {
                op,
                a: NO_ARG,
                b: NO_ARG,
                disabled: false,
                ignored: false,
            });
        }

        let max_rank = ids
            .last()
            .map(|&id| inner.node(id).rank)
            .unwrap_or(0) as usize;
        let mut rows: Vec<Row> = (0..max_rank)
            .map(|_| Row {
                clauses: Vec::new(),
                active: 0,
                saved: Vec::new(),
            })
            .collect();

        let mut values = vec![0.0f32; n * BATCH_SIZE];
        let dx = unit_axis_arena(n, 0);
        let dy = unit_axis_arena(n, 1);
        let dz = unit_axis_arena(n, 2);
        let mut intervals = vec![Interval::ZERO; n];

        for &id in &ids {
            let node = *inner.node(id);
            let ci = clauses.len();
            let (a, b) = match node.op.arity() {
                0 => (NO_ARG, NO_ARG),
                1 => (slot[&node.lhs], NO_ARG),
                _ => (slot[&node.lhs], slot[&node.rhs]),
            };
            clauses.push(Clause {
                op: node.op,
                a,
                b,
                disabled: false,
                ignored: false,
            });
            if node.op == Opcode::Const {
                // Constant slots are filled once and never recomputed
                values[ci * BATCH_SIZE..(ci + 1) * BATCH_SIZE].fill(node.value);
                intervals[ci] = Interval::point(node.value);
            } else {
                rows[node.rank as usize - 1].clauses.push(ci as u32);
            }
        }
        for row in &mut rows {
            row.active = row.clauses.len();
        }

        let root = slot[&root_id] as usize;
        drop(inner);

        Ok(Evaluator {
            cache,
            generation,
            mat,
            mat_inv: mat.inverse(),
            clauses,
            rows,
            values,
            dx,
            dy,
            dz,
            intervals,
            x: 0,
            y: 1,
            z: 2,
            root,
        })
    }

    /// The cache this evaluator was compiled from
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Cache generation this evaluator was compiled against
    ///
    /// The evaluator owns its clause arenas and never reads the cache
    /// after construction, so it keeps working across a reset; this is
    /// for callers that want to notice the tree it came from is gone.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the coordinate transform without recompiling
    pub fn set_transform(&mut self, mat: Mat4) {
        self.mat = mat;
        self.mat_inv = mat.inverse();
    }

    // === Input loading ===

    /// Store one sample point at batch index `i`
    ///
    /// The transform is applied here, so the evaluation passes see tree
    /// coordinates directly.
    ///
    /// # Panics
    ///
    /// Panics if `i >= BATCH_SIZE`.
    #[inline]
    pub fn set(&mut self, i: usize, p: Vec3) {
        assert!(i < BATCH_SIZE, "batch index {} out of range", i);
        let q = self.mat.transform_point3(p);
        self.values[self.x * BATCH_SIZE + i] = q.x;
        self.values[self.y * BATCH_SIZE + i] = q.y;
        self.values[self.z * BATCH_SIZE + i] = q.z;
    }

    /// Load an axis-aligned box as the interval inputs
    pub fn set_region(&mut self, lo: Vec3, hi: Vec3) {
        let x = Interval::new(lo.x, hi.x);
        let y = Interval::new(lo.y, hi.y);
        let z = Interval::new(lo.z, hi.z);
        let m = &self.mat;
        self.intervals[self.x] =
            x * m.x_axis.x + (y * m.y_axis.x) + (z * m.z_axis.x) + m.w_axis.x;
        self.intervals[self.y] =
            x * m.x_axis.y + (y * m.y_axis.y) + (z * m.z_axis.y) + m.w_axis.y;
        self.intervals[self.z] =
            x * m.x_axis.z + (y * m.y_axis.z) + (z * m.z_axis.z) + m.w_axis.z;
    }

    // === Evaluation passes ===

    /// Evaluate the first `count` loaded points, returning their values
    ///
    /// # Panics
    ///
    /// Panics if `count > BATCH_SIZE`.
    pub fn values(&mut self, count: usize) -> &[f32] {
        assert!(count <= BATCH_SIZE, "count {} exceeds batch size", count);
        let lanes = padded(count);
        let clauses = &self.clauses;
        let values = &mut self.values;
        for row in &self.rows {
            for &ci in &row.clauses[..row.active] {
                let ci = ci as usize;
                let c = &clauses[ci];
                let op = effective_op(clauses, c);
                let (head, tail) = values.split_at_mut(ci * BATCH_SIZE);
                let out = &mut tail[..lanes];
                let a = &head[c.a as usize * BATCH_SIZE..][..lanes];
                let b = if c.has_b() {
                    &head[c.b as usize * BATCH_SIZE..][..lanes]
                } else {
                    a
                };
                value_kernel(op, a, b, out);
            }
        }
        &self.values[self.root * BATCH_SIZE..][..count]
    }

    /// Evaluate values and partial derivatives for the first `count`
    /// loaded points
    ///
    /// Returns `(values, dx, dy, dz)` slices. Gradients are expressed in
    /// query coordinates (the inverse transform is already applied).
    pub fn derivs(&mut self, count: usize) -> (&[f32], &[f32], &[f32], &[f32]) {
        assert!(count <= BATCH_SIZE, "count {} exceeds batch size", count);
        let lanes = padded(count);
        let clauses = &self.clauses;
        for row in &self.rows {
            for &ci in &row.clauses[..row.active] {
                let ci = ci as usize;
                let c = &clauses[ci];
                let op = effective_op(clauses, c);
                let ai = c.a as usize;
                let bi = if c.has_b() { c.b as usize } else { ai };

                let (vh, vt) = self.values.split_at_mut(ci * BATCH_SIZE);
                let (xh, xt) = self.dx.split_at_mut(ci * BATCH_SIZE);
                let (yh, yt) = self.dy.split_at_mut(ci * BATCH_SIZE);
                let (zh, zt) = self.dz.split_at_mut(ci * BATCH_SIZE);
                let a = DerivIn {
                    v: &vh[ai * BATCH_SIZE..][..lanes],
                    dx: &xh[ai * BATCH_SIZE..][..lanes],
                    dy: &yh[ai * BATCH_SIZE..][..lanes],
                    dz: &zh[ai * BATCH_SIZE..][..lanes],
                };
                let b = DerivIn {
                    v: &vh[bi * BATCH_SIZE..][..lanes],
                    dx: &xh[bi * BATCH_SIZE..][..lanes],
                    dy: &yh[bi * BATCH_SIZE..][..lanes],
                    dz: &zh[bi * BATCH_SIZE..][..lanes],
                };
                let out = DerivOut {
                    v: &mut vt[..lanes],
                    dx: &mut xt[..lanes],
                    dy: &mut yt[..lanes],
                    dz: &mut zt[..lanes],
                };
                deriv_kernel(op, a, b, out);
            }
        }

        // Gradients were computed against tree coordinates; map them
        // back so callers can use them as normals at their query points.
        let base = self.root * BATCH_SIZE;
        for i in 0..count {
            let g = Vec3::new(
                self.dx[base + i],
                self.dy[base + i],
                self.dz[base + i],
            );
            let n = self.mat_inv.transform_vector3(g);
            self.dx[base + i] = n.x;
            self.dy[base + i] = n.y;
            self.dz[base + i] = n.z;
        }

        (
            &self.values[base..][..count],
            &self.dx[base..][..count],
            &self.dy[base..][..count],
            &self.dz[base..][..count],
        )
    }

    /// Evaluate the loaded region, returning a conservative bound on the
    /// tree's value over it
    ///
    /// Per-clause interval results stay stored for [`Evaluator::push`]
    /// to consult.
    pub fn interval(&mut self) -> Interval {
        let clauses = &self.clauses;
        let intervals = &mut self.intervals;
        for row in &self.rows {
            for &ci in &row.clauses[..row.active] {
                let ci = ci as usize;
                let c = &clauses[ci];
                let op = effective_op(clauses, c);
                let a = intervals[c.a as usize];
                let b = if c.has_b() {
                    intervals[c.b as usize]
                } else {
                    a
                };
                intervals[ci] = interval_kernel(op, a, b);
            }
        }
        intervals[self.root]
    }

    // === Single-point conveniences ===

    /// Evaluate the tree at one point
    pub fn eval(&mut self, p: Vec3) -> f32 {
        self.set(0, p);
        self.values(1)[0]
    }

    /// Evaluate value and gradient at one point
    pub fn eval_derivs(&mut self, p: Vec3) -> (f32, Vec3) {
        self.set(0, p);
        let (v, dx, dy, dz) = self.derivs(1);
        (v[0], Vec3::new(dx[0], dy[0], dz[0]))
    }

    /// Evaluate a bound over one axis-aligned box
    pub fn eval_interval(&mut self, lo: Vec3, hi: Vec3) -> Interval {
        self.set_region(lo, hi);
        self.interval()
    }

    // === Masking ===

    /// Disable every clause that cannot affect the root over the most
    /// recently evaluated region
    ///
    /// Uses the stored per-clause interval results: a min (or max)
    /// branch whose bound is dominated over the whole region is switched
    /// off, along with everything only it referenced. A min/max whose
    /// operand is already masked by an enclosing push is walked as the
    /// pass-through of its surviving side; the masked operand's stored
    /// interval is stale and is never consulted. Before any interval
    /// pass all stored results are zero, which never proves dominance,
    /// so a premature push safely keeps everything enabled.
    ///
    /// Pairs with [`Evaluator::pop`]; pushes nest.
    pub fn push(&mut self) {
        let clauses = &mut self.clauses;
        let intervals = &self.intervals;

        // Snapshot, then pessimistically ignore everything active.
        // Clauses masked by an enclosing push sit outside the prefix
        // and are not touched at any point below.
        for row in &mut self.rows {
            row.saved.push(row.active);
            for &ci in &row.clauses[..row.active] {
                clauses[ci as usize].ignored = true;
            }
        }
        clauses[self.root].ignored = false;

        // Walk top-down, waking the operands each live clause needs
        // under its effective opcode
        for row in self.rows.iter().rev() {
            for &ci in &row.clauses[..row.active] {
                let ci = ci as usize;
                if clauses[ci].ignored {
                    continue;
                }
                let (op, a, b) = {
                    let c = &clauses[ci];
                    (c.op, c.a as usize, if c.has_b() { c.b as usize } else { ci })
                };
                let a_masked = clauses[a].disabled;
                let b_masked = b != ci && clauses[b].disabled;
                if b_masked {
                    clauses[a].ignored = false;
                    continue;
                }
                if a_masked {
                    clauses[b].ignored = false;
                    continue;
                }
                match op {
                    Opcode::Min => {
                        let ia = intervals[a];
                        let ib = intervals[b];
                        if ia.hi < ib.lo {
                            clauses[a].ignored = false;
                        } else if ib.hi < ia.lo {
                            clauses[b].ignored = false;
                        } else {
                            clauses[a].ignored = false;
                            clauses[b].ignored = false;
                        }
                    }
                    Opcode::Max => {
                        let ia = intervals[a];
                        let ib = intervals[b];
                        if ia.lo > ib.hi {
                            clauses[a].ignored = false;
                        } else if ib.lo > ia.hi {
                            clauses[b].ignored = false;
                        } else {
                            clauses[a].ignored = false;
                            clauses[b].ignored = false;
                        }
                    }
                    _ => {
                        clauses[a].ignored = false;
                        if b != ci {
                            clauses[b].ignored = false;
                        }
                    }
                }
            }
        }

        // Clauses still ignored become masked; compact each row so the
        // evaluation passes only touch the enabled prefix
        for row in &mut self.rows {
            let mut keep = 0;
            for i in 0..row.active {
                let ci = row.clauses[i] as usize;
                if clauses[ci].ignored {
                    clauses[ci].ignored = false;
                    clauses[ci].disabled = true;
                } else {
                    row.clauses.swap(keep, i);
                    keep += 1;
                }
            }
            row.active = keep;
        }
    }

    /// Undo the most recent [`Evaluator::push`]
    ///
    /// Every clause inside a row's restored prefix was enabled when the
    /// matching push snapshotted it, and swaps never cross the prefix
    /// boundary, so restoring the count and clearing the prefix's masks
    /// reproduces the prior state exactly. Clauses masked by enclosing
    /// pushes stay outside the prefix and stay masked.
    ///
    /// # Panics
    ///
    /// Panics if there is no matching push.
    pub fn pop(&mut self) {
        let clauses = &mut self.clauses;
        for row in &mut self.rows {
            let restored = row
                .saved
                .pop()
                .expect("pop() without matching push()");
            row.active = restored;
            for &ci in &row.clauses[..restored] {
                clauses[ci as usize].disabled = false;
            }
        }
    }

    /// Fraction of scheduled clauses currently enabled
    ///
    /// Equals 1.0 outside any push; drops as pushes prove subtrees
    /// irrelevant.
    pub fn utilization(&self) -> f64 {
        let total: usize = self.rows.iter().map(|r| r.clauses.len()).sum();
        if total == 0 {
            return 1.0;
        }
        let active: usize = self.rows.iter().map(|r| r.active).sum();
        active as f64 / total as f64
    }

    /// Number of clauses in the compiled program, axes included
    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    /// Returns true if the root is an axis clause and nothing else was
    /// compiled
    pub fn is_empty(&self) -> bool {
        self.clauses.len() <= 3
    }
}

/// Round up to a whole number of SIMD lanes
#[inline]
fn padded(count: usize) -> usize {
    count.div_ceil(LANES).max(1) * LANES
}

/// Opcode to actually execute, accounting for masked operands
///
/// A min/max whose dominated side was disabled by a push degrades to a
/// pass-through of the surviving side.
#[inline]
fn effective_op(clauses: &[Clause], c: &Clause) -> Opcode {
    if c.op.arity() == 2 {
        let b_disabled = c.has_b() && clauses[c.b as usize].disabled;
        if b_disabled {
            return Opcode::FirstArg;
        }
        if clauses[c.a as usize].disabled {
            return Opcode::SecondArg;
        }
    }
    c.op
}

/// Derivative arena with the axis clause's own row set to a unit basis
///
/// Axis partials are constant (dx/dx = 1 everywhere), so they are
/// written once at construction; constants keep all-zero partials.
fn unit_axis_arena(n: usize, axis: usize) -> Vec<f32> {
    let mut arena = vec![0.0f32; n * BATCH_SIZE];
    arena[axis * BATCH_SIZE..(axis + 1) * BATCH_SIZE].fill(1.0);
    arena
}
