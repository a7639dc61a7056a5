//! Fixed-point scalar and positional types.
//!
//! `Q16` is the Q16.16 scalar used for every field value, ratio, threshold,
//! slope, and radius. `Q48` is the higher-precision Q48.16 type used for
//! world-scale positions. All arithmetic here is integer-only; there is no
//! floating point on any path a query can take. `to_f64` exists purely for
//! human-readable test assertions and must never be called from a provider's
//! sampling path.

use std::ops::{Add, Neg, Sub};

/// Number of fractional bits shared by `Q16` and `Q48`.
pub const FRAC_BITS: u32 = 16;

/// Sentinel raw value meaning "field not evaluated". Reserved: no legitimate
/// computed value is permitted to collide with it (arithmetic below clamps
/// just short of `i32::MIN` to preserve this).
pub const UNKNOWN_Q16: i32 = i32::MIN;

/// A signed Q16.16 fixed-point scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Q16(pub i32);

impl Q16 {
    pub const ZERO: Q16 = Q16(0);
    pub const ONE: Q16 = Q16(1 << FRAC_BITS);
    pub const HALF: Q16 = Q16(1 << (FRAC_BITS - 1));
    pub const MAX: Q16 = Q16(i32::MAX);
    /// Smallest representable value that is not the `UNKNOWN_Q16` sentinel.
    pub const MIN: Q16 = Q16(i32::MIN + 1);

    pub const fn from_raw(raw: i32) -> Self {
        Q16(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub fn from_int(n: i32) -> Self {
        Q16((n as i64).saturating_mul(1i64 << FRAC_BITS).clamp(Self::MIN.0 as i64, Self::MAX.0 as i64) as i32)
    }

    pub fn from_ratio(num: i32, den: i32) -> Self {
        if den == 0 {
            return if num >= 0 { Self::MAX } else { Self::MIN };
        }
        let r = ((num as i64) << FRAC_BITS) / (den as i64);
        Q16(r.clamp(Self::MIN.0 as i64, Self::MAX.0 as i64) as i32)
    }

    /// Debug/test-only conversion. Never call on a sampling hot path.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / (1i64 << FRAC_BITS) as f64
    }

    /// Debug/test-only constructor. Never call on a sampling hot path.
    pub fn from_f64(v: f64) -> Self {
        Q16((v * (1i64 << FRAC_BITS) as f64).round() as i32)
    }

    pub fn add(self, rhs: Q16) -> Q16 {
        Q16((self.0 as i64 + rhs.0 as i64).clamp(Self::MIN.0 as i64, Self::MAX.0 as i64) as i32)
    }

    pub fn sub(self, rhs: Q16) -> Q16 {
        Q16((self.0 as i64 - rhs.0 as i64).clamp(Self::MIN.0 as i64, Self::MAX.0 as i64) as i32)
    }

    pub fn mul(self, rhs: Q16) -> Q16 {
        let r = (self.0 as i64 * rhs.0 as i64) >> FRAC_BITS;
        Q16(r.clamp(Self::MIN.0 as i64, Self::MAX.0 as i64) as i32)
    }

    pub fn div(self, rhs: Q16) -> Q16 {
        if rhs.0 == 0 {
            return if self.0 >= 0 { Self::MAX } else { Self::MIN };
        }
        let r = ((self.0 as i64) << FRAC_BITS) / (rhs.0 as i64);
        Q16(r.clamp(Self::MIN.0 as i64, Self::MAX.0 as i64) as i32)
    }

    pub fn neg(self) -> Q16 {
        Q16(self.0.saturating_neg().max(Self::MIN.0))
    }

    pub fn abs(self) -> Q16 {
        if self.0 < 0 { self.neg() } else { self }
    }

    pub fn clamp(self, lo: Q16, hi: Q16) -> Q16 {
        if self.0 < lo.0 {
            lo
        } else if self.0 > hi.0 {
            hi
        } else {
            self
        }
    }

    pub fn lerp(a: Q16, b: Q16, t: Q16) -> Q16 {
        a.add(b.sub(a).mul(t))
    }

    pub fn max(self, rhs: Q16) -> Q16 {
        if self.0 >= rhs.0 { self } else { rhs }
    }

    pub fn min(self, rhs: Q16) -> Q16 {
        if self.0 <= rhs.0 { self } else { rhs }
    }

    /// Integer square root via Newton's method on the doubled-scale raw
    /// value, returning a Q16.16 result. Negative inputs return zero.
    pub fn sqrt(self) -> Q16 {
        if self.0 <= 0 {
            return Q16::ZERO;
        }
        let scaled = (self.0 as u64) << FRAC_BITS;
        Q16(isqrt_u64(scaled).min(Self::MAX.0 as u64) as i32)
    }

    /// Floor-division of this value by a positive cell size, returning the
    /// integer lattice cell index. `cell_size` must be strictly positive.
    pub fn floor_cell(self, cell_size: Q16) -> i32 {
        debug_assert!(cell_size.0 > 0);
        let num = self.0 as i64;
        let den = cell_size.0 as i64;
        num.div_euclid(den) as i32
    }

    /// Remainder (always in `[0, cell_size)`) complementing `floor_cell`.
    pub fn cell_remainder(self, cell_size: Q16) -> Q16 {
        debug_assert!(cell_size.0 > 0);
        let num = self.0 as i64;
        let den = cell_size.0 as i64;
        Q16(num.rem_euclid(den) as i32)
    }
}

fn isqrt_u64(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}

impl Add for Q16 {
    type Output = Q16;
    fn add(self, rhs: Q16) -> Q16 {
        Q16::add(self, rhs)
    }
}

impl Sub for Q16 {
    type Output = Q16;
    fn sub(self, rhs: Q16) -> Q16 {
        Q16::sub(self, rhs)
    }
}

impl Neg for Q16 {
    type Output = Q16;
    fn neg(self) -> Q16 {
        Q16::neg(self)
    }
}

/// A field value that is either known (a `Q16`) or explicitly unevaluated.
///
/// This is the typed replacement for comparing raw values against
/// `UNKNOWN_Q16` inline: arithmetic and formulas operate on `Q16` directly
/// once a value is known, and this sum type carries the "was this even
/// computed" bit separately. Flatten to a raw `i32` (via `to_raw`) only at
/// tile-array / wire boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Known(Q16),
    Unknown,
}

impl FieldValue {
    pub fn from_raw(raw: i32) -> Self {
        if raw == UNKNOWN_Q16 {
            FieldValue::Unknown
        } else {
            FieldValue::Known(Q16(raw))
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            FieldValue::Known(q) => q.0,
            FieldValue::Unknown => UNKNOWN_Q16,
        }
    }

    pub fn is_unknown(self) -> bool {
        matches!(self, FieldValue::Unknown)
    }

    pub fn known(self) -> Option<Q16> {
        match self {
            FieldValue::Known(q) => Some(q),
            FieldValue::Unknown => None,
        }
    }

    pub fn unwrap_or(self, default: Q16) -> Q16 {
        match self {
            FieldValue::Known(q) => q,
            FieldValue::Unknown => default,
        }
    }

    pub fn map(self, f: impl FnOnce(Q16) -> Q16) -> Self {
        match self {
            FieldValue::Known(q) => FieldValue::Known(f(q)),
            FieldValue::Unknown => FieldValue::Unknown,
        }
    }
}

impl From<Q16> for FieldValue {
    fn from(q: Q16) -> Self {
        FieldValue::Known(q)
    }
}

/// A Q16.16 (x, y, z) point in a domain's local coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: Q16,
    pub y: Q16,
    pub z: Q16,
}

impl Point {
    pub const ZERO: Point = Point { x: Q16::ZERO, y: Q16::ZERO, z: Q16::ZERO };

    pub fn new(x: Q16, y: Q16, z: Q16) -> Self {
        Point { x, y, z }
    }

    pub fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    /// Euclidean length, computed entirely in integer arithmetic.
    pub fn length(self) -> Q16 {
        let sx = self.x.0 as i64;
        let sy = self.y.0 as i64;
        let sz = self.z.0 as i64;
        let mag2_q32 = sx * sx + sy * sy + sz * sz;
        let mag2_q16 = (mag2_q32 >> FRAC_BITS).max(0) as u64;
        Q16(isqrt_u64(mag2_q16 << FRAC_BITS).min(Q16::MAX.0 as u64) as i32)
    }

    /// Lattice cell coordinate of this point for a given cell size.
    pub fn to_cell(self, cell_size: Q16) -> (i32, i32, i32) {
        (
            self.x.floor_cell(cell_size),
            self.y.floor_cell(cell_size),
            self.z.floor_cell(cell_size),
        )
    }
}

/// An axis-aligned bounding box. `contains` is inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point,
    pub max: Point,
}

impl Aabb {
    pub fn new(min: Point, max: Point) -> Self {
        Aabb { min, max }
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x.0 >= self.min.x.0
            && p.x.0 <= self.max.x.0
            && p.y.0 >= self.min.y.0
            && p.y.0 <= self.max.y.0
            && p.z.0 >= self.min.z.0
            && p.z.0 <= self.max.z.0
    }
}

/// A signed Q48.16 fixed-point scalar, used for world-scale positions that
/// would overflow `Q16`'s 32-bit range near a world's outer edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Q48(pub i64);

impl Q48 {
    pub const ZERO: Q48 = Q48(0);

    pub fn from_q16(q: Q16) -> Self {
        Q48(q.0 as i64)
    }

    pub fn to_q16_saturating(self) -> Q16 {
        Q16(self.0.clamp(Q16::MIN.0 as i64, Q16::MAX.0 as i64) as i32)
    }

    pub fn add(self, rhs: Q48) -> Q48 {
        Q48(self.0.saturating_add(rhs.0))
    }

    pub fn sub(self, rhs: Q48) -> Q48 {
        Q48(self.0.saturating_sub(rhs.0))
    }
}

/// A Q48.16 (x, y, z) point in world-scale (global) coordinates, distinct
/// from a domain-local `Point`. Conversion between the two happens at a
/// terrain surface's origin.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WorldPoint {
    pub x: Q48,
    pub y: Q48,
    pub z: Q48,
}

impl WorldPoint {
    pub fn new(x: Q48, y: Q48, z: Q48) -> Self {
        WorldPoint { x, y, z }
    }
}
