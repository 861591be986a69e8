//! Interval arithmetic for conservative range evaluation
//!
//! Evaluates expressions over boxes of inputs instead of single points,
//! returning bounds `[lo, hi]` guaranteed to contain every value the
//! expression can take on that box. Adaptive subdivision callers use the
//! result to discard whole regions:
//!
//! - If `result.lo > 0`: the region is entirely outside the surface
//! - If `result.hi < 0`: the region is entirely inside
//! - Otherwise the surface may cross the region
//!
//! Two operations are deliberately looser than true interval arithmetic
//! and documented as such: `pow_interval`/`nth_root_interval` use only the
//! lower bound of the exponent interval, and `mod_interval` returns
//! `[0, rhs.hi]`. Downstream subdivision relies on these exact bounds.
//!
//! Author: Moroya Sakamoto

use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_2, PI};
use std::ops::{Add, Div, Mul, Neg, Sub};

/// A closed interval `[lo, hi]` of possible values
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    /// Lower bound
    pub lo: f32,
    /// Upper bound
    pub hi: f32,
}

impl Interval {
    /// Create a new interval
    #[inline(always)]
    pub fn new(lo: f32, hi: f32) -> Self {
        debug_assert!(!(lo > hi), "lo ({}) > hi ({})", lo, hi);
        Self { lo, hi }
    }

    /// Create a point interval `[v, v]`
    #[inline(always)]
    pub fn point(v: f32) -> Self {
        Self { lo: v, hi: v }
    }

    /// The entire real line
    pub const EVERYTHING: Self = Self {
        lo: f32::NEG_INFINITY,
        hi: f32::INFINITY,
    };

    /// Zero interval
    pub const ZERO: Self = Self { lo: 0.0, hi: 0.0 };

    /// Width of the interval
    #[inline(always)]
    pub fn width(self) -> f32 {
        self.hi - self.lo
    }

    /// Returns true if `v` lies within the bounds
    #[inline(always)]
    pub fn contains(self, v: f32) -> bool {
        v >= self.lo && v <= self.hi
    }

    /// Returns true if the interval is entirely positive
    #[inline(always)]
    pub fn is_positive(self) -> bool {
        self.lo > 0.0
    }

    /// Returns true if the interval is entirely negative
    #[inline(always)]
    pub fn is_negative(self) -> bool {
        self.hi < 0.0
    }

    /// Returns true if either bound is NaN
    #[inline(always)]
    pub fn is_nan(self) -> bool {
        self.lo.is_nan() || self.hi.is_nan()
    }

    /// Absolute value of an interval
    #[inline(always)]
    pub fn abs(self) -> Self {
        if self.lo >= 0.0 {
            self
        } else if self.hi <= 0.0 {
            Self {
                lo: -self.hi,
                hi: -self.lo,
            }
        } else {
            Self {
                lo: 0.0,
                hi: self.hi.max(-self.lo),
            }
        }
    }

    /// Square root (clamped to non-negative)
    #[inline(always)]
    pub fn sqrt(self) -> Self {
        Self {
            lo: self.lo.max(0.0).sqrt(),
            hi: self.hi.max(0.0).sqrt(),
        }
    }

    /// Square of an interval
    #[inline(always)]
    pub fn square(self) -> Self {
        if self.lo >= 0.0 {
            Self {
                lo: self.lo * self.lo,
                hi: self.hi * self.hi,
            }
        } else if self.hi <= 0.0 {
            Self {
                lo: self.hi * self.hi,
                hi: self.lo * self.lo,
            }
        } else {
            Self {
                lo: 0.0,
                hi: (self.lo * self.lo).max(self.hi * self.hi),
            }
        }
    }

    /// Minimum of two intervals
    #[inline(always)]
    pub fn min(self, other: Self) -> Self {
        Self {
            lo: self.lo.min(other.lo),
            hi: self.hi.min(other.hi),
        }
    }

    /// Maximum of two intervals
    #[inline(always)]
    pub fn max(self, other: Self) -> Self {
        Self {
            lo: self.lo.max(other.lo),
            hi: self.hi.max(other.hi),
        }
    }

    /// Exponential (monotone)
    #[inline(always)]
    pub fn exp(self) -> Self {
        Self {
            lo: self.lo.exp(),
            hi: self.hi.exp(),
        }
    }

    /// Arc tangent (monotone)
    #[inline(always)]
    pub fn atan(self) -> Self {
        Self {
            lo: self.lo.atan(),
            hi: self.hi.atan(),
        }
    }

    /// Arc sine, domain clamped to `[-1, 1]`
    #[inline(always)]
    pub fn asin(self) -> Self {
        Self {
            lo: self.lo.clamp(-1.0, 1.0).asin(),
            hi: self.hi.clamp(-1.0, 1.0).asin(),
        }
    }

    /// Arc cosine, domain clamped to `[-1, 1]` (anti-monotone)
    #[inline(always)]
    pub fn acos(self) -> Self {
        Self {
            lo: self.hi.clamp(-1.0, 1.0).acos(),
            hi: self.lo.clamp(-1.0, 1.0).acos(),
        }
    }

    /// Cosine over the interval
    ///
    /// Checks whether any extremum `k*pi` falls inside the interval; if the
    /// width spans a full period the result is `[-1, 1]`.
    pub fn cos(self) -> Self {
        if self.width() >= 2.0 * PI {
            return Self { lo: -1.0, hi: 1.0 };
        }
        let mut lo = self.lo.cos().min(self.hi.cos());
        let mut hi = self.lo.cos().max(self.hi.cos());
        // k ranges over multiples of pi inside [lo, hi]
        let k_min = (self.lo / PI).ceil() as i64;
        let k_max = (self.hi / PI).floor() as i64;
        for k in k_min..=k_max {
            if k % 2 == 0 {
                hi = 1.0;
            } else {
                lo = -1.0;
            }
        }
        Self { lo, hi }
    }

    /// Sine over the interval (phase-shifted cosine)
    #[inline]
    pub fn sin(self) -> Self {
        Self {
            lo: self.lo - FRAC_PI_2,
            hi: self.hi - FRAC_PI_2,
        }
        .cos()
    }

    /// Tangent over the interval
    ///
    /// Returns the whole real line when the interval spans an asymptote.
    pub fn tan(self) -> Self {
        if self.width() >= PI {
            return Self::EVERYTHING;
        }
        // Asymptotes sit at pi/2 + k*pi
        let k_min = ((self.lo - FRAC_PI_2) / PI).ceil() as i64;
        let k_max = ((self.hi - FRAC_PI_2) / PI).floor() as i64;
        if k_max >= k_min {
            return Self::EVERYTHING;
        }
        Self {
            lo: self.lo.tan(),
            hi: self.hi.tan(),
        }
    }
}

impl Add for Interval {
    type Output = Self;
    #[inline(always)]
    fn add(self, rhs: Self) -> Self {
        Self {
            lo: self.lo + rhs.lo,
            hi: self.hi + rhs.hi,
        }
    }
}

impl Sub for Interval {
    type Output = Self;
    #[inline(always)]
    fn sub(self, rhs: Self) -> Self {
        Self {
            lo: self.lo - rhs.hi,
            hi: self.hi - rhs.lo,
        }
    }
}

impl Mul for Interval {
    type Output = Self;
    #[inline(always)]
    fn mul(self, rhs: Self) -> Self {
        let a = self.lo * rhs.lo;
        let b = self.lo * rhs.hi;
        let c = self.hi * rhs.lo;
        let d = self.hi * rhs.hi;
        Self {
            lo: a.min(b).min(c).min(d),
            hi: a.max(b).max(c).max(d),
        }
    }
}

impl Div for Interval {
    type Output = Self;
    #[inline(always)]
    fn div(self, rhs: Self) -> Self {
        if rhs.lo <= 0.0 && rhs.hi >= 0.0 {
            return Self::EVERYTHING;
        }
        let a = self.lo / rhs.lo;
        let b = self.lo / rhs.hi;
        let c = self.hi / rhs.lo;
        let d = self.hi / rhs.hi;
        Self {
            lo: a.min(b).min(c).min(d),
            hi: a.max(b).max(c).max(d),
        }
    }
}

impl Neg for Interval {
    type Output = Self;
    #[inline(always)]
    fn neg(self) -> Self {
        Self {
            lo: -self.hi,
            hi: -self.lo,
        }
    }
}

impl Mul<f32> for Interval {
    type Output = Self;
    #[inline(always)]
    fn mul(self, rhs: f32) -> Self {
        if rhs >= 0.0 {
            Self {
                lo: self.lo * rhs,
                hi: self.hi * rhs,
            }
        } else {
            Self {
                lo: self.hi * rhs,
                hi: self.lo * rhs,
            }
        }
    }
}

impl Add<f32> for Interval {
    type Output = Self;
    #[inline(always)]
    fn add(self, rhs: f32) -> Self {
        Self {
            lo: self.lo + rhs,
            hi: self.hi + rhs,
        }
    }
}

/// `atan2(y, x)` over intervals
///
/// Exact only when `x` is strictly positive (the quotient is monotone
/// there); any other configuration conservatively returns `[-pi, pi]`.
#[inline]
pub fn atan2_interval(y: Interval, x: Interval) -> Interval {
    if x.lo > 0.0 {
        (y / x).atan()
    } else {
        Interval { lo: -PI, hi: PI }
    }
}

/// `a ^ e` where `e` is the lower bound of the exponent interval
///
/// Documented approximation: this is not general interval exponentiation.
/// Candidate extrema are the endpoint powers, plus zero when the base
/// interval straddles zero with a positive exponent.
pub fn pow_interval(a: Interval, b: Interval) -> Interval {
    let e = b.lo;
    let straddles = a.lo < 0.0 && a.hi > 0.0;
    if straddles && e < 0.0 {
        return Interval::EVERYTHING;
    }
    let p = a.lo.powf(e);
    let q = a.hi.powf(e);
    let mut lo = p.min(q);
    let mut hi = p.max(q);
    if straddles {
        lo = lo.min(0.0);
        hi = hi.max(0.0);
    }
    Interval { lo, hi }
}

/// `a ^ (1/n)` where `n` is the lower bound of the divisor interval
///
/// Odd roots preserve sign; even roots clamp the base at zero like sqrt.
pub fn nth_root_interval(a: Interval, b: Interval) -> Interval {
    let n = b.lo;
    let odd = (n as i64) % 2 != 0;
    let root = |v: f32| -> f32 {
        if odd {
            v.signum() * v.abs().powf(1.0 / n)
        } else {
            v.max(0.0).powf(1.0 / n)
        }
    };
    let p = root(a.lo);
    let q = root(a.hi);
    Interval {
        lo: p.min(q),
        hi: p.max(q),
    }
}

/// `a mod b` over intervals: the coarse conservative bound `[0, b.hi]`
#[inline(always)]
pub fn mod_interval(_a: Interval, b: Interval) -> Interval {
    Interval { lo: 0.0, hi: b.hi }
}
