//! Shared resolution-ladder helpers (§4.2): nearest-sample indexing, tile/
//! window id hashing, tile-coordinate arithmetic, and the pre-ladder
//! refusal outcomes every domain checks before walking its tier list.

use crate::fixed::{Point, Q16};
use crate::rng::hash_u64s;

use crate::fixed::Aabb;

use super::budget::Budget;
use super::cache::CacheKey;
use super::existence::{ArchivalState, ExistenceState};
use super::policy::DomainPolicy;
use super::tier::Tier;

/// Map a coordinate (already relative to the tile's origin on this axis) to
/// the nearest grid index, via banker's-style midpoint rounding:
/// `(rem*2 >= step) => round up`. Clamped to `[0, dim-1]`.
pub fn nearest_index(rel: Q16, step: Q16, dim: u32) -> u32 {
    debug_assert!(step.raw() > 0);
    debug_assert!(dim > 0);
    let cell = rel.floor_cell(step);
    let rem = rel.cell_remainder(step);
    let round_up = (rem.raw() as i64) * 2 >= step.raw() as i64;
    let idx = if round_up { cell + 1 } else { cell };
    idx.clamp(0, dim as i32 - 1) as u32
}

/// Flatten a 3D sample index into the tile's lexicographic (z-major,
/// y-middle, x-fastest) array order.
pub fn sample_array_index(ix: u32, iy: u32, iz: u32, n: u32) -> usize {
    ((iz * n + iy) * n + ix) as usize
}

/// Deterministic tile id from a tile's `(tx, ty, tz, resolution)` coordinate.
pub fn tile_id_hash(tx: i32, ty: i32, tz: i32, resolution: Tier) -> u64 {
    hash_u64s(&[tx as u32 as u64, ty as u32 as u64, tz as u32 as u64, resolution.rank() as u64])
}

/// Deterministic window id from `(start, window_ticks)`, per §9: two
/// distinct windows of identical duration starting at different ticks never
/// alias.
pub fn window_id_hash(start: i64, window_ticks: u32) -> u64 {
    hash_u64s(&[start as u64, window_ticks as u64])
}

/// Which tile (tx,ty,tz) a point falls in for a given tile size, and that
/// tile's origin (min corner) in local units.
pub fn tile_coord_from_point(tile_size: Q16, point: Point) -> (i32, i32, i32, Point) {
    let tx = point.x.floor_cell(tile_size);
    let ty = point.y.floor_cell(tile_size);
    let tz = point.z.floor_cell(tile_size);
    let scale = |i: i32| Q16::from_raw((i as i64 * tile_size.raw() as i64).clamp(Q16::MIN.0 as i64, Q16::MAX.0 as i64) as i32);
    (tx, ty, tz, Point::new(scale(tx), scale(ty), scale(tz)))
}

/// Grid spacing between adjacent samples across a tile of `tile_size` with
/// `dim` samples per axis.
pub fn grid_step(tile_size: Q16, dim: u32) -> Q16 {
    debug_assert!(dim > 0);
    Q16::from_raw(tile_size.raw() / dim as i32)
}

/// The local-space position of sample grid point `(ix, iy, iz)`, measured
/// from `tile_origin`. Grid points sit on integer multiples of `step`
/// (not cell centers) so that `nearest_index` of this exact position maps
/// back to the same index — this is what makes tile sampling agree exactly
/// with a FULL analytic evaluation at a grid point (§8 tile-grid-consistency
/// law).
pub fn sample_point_for_index(tile_origin: Point, step: Q16, ix: u32, iy: u32, iz: u32) -> Point {
    let off = |i: u32| Q16::from_int(i as i32).mul(step);
    Point::new(tile_origin.x + off(ix), tile_origin.y + off(iy), tile_origin.z + off(iz))
}

/// Nearest sample grid indices for `point` within a tile rooted at
/// `tile_origin` with the given grid `step` and `dim` samples per axis.
pub fn nearest_sample_indices(point: Point, tile_origin: Point, step: Q16, dim: u32) -> (u32, u32, u32) {
    (
        nearest_index(point.x - tile_origin.x, step, dim),
        nearest_index(point.y - tile_origin.y, step, dim),
        nearest_index(point.z - tile_origin.z, step, dim),
    )
}

/// The four pre-ladder checks of §4.2, evaluated before any tier is
/// attempted. `Proceed` means none of the short-circuits applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreLadderOutcome {
    Proceed,
    DomainInactive,
    NoSource,
    OutOfBounds,
    Collapsed(u64),
}

/// Evaluate the four pre-ladder checks of §4.2, in order. `capsule_lookup`
/// should return the containing capsule's id, if any.
pub fn pre_ladder_check(
    existence: ExistenceState,
    archival: ArchivalState,
    has_source: bool,
    bounds: Aabb,
    point: Point,
    capsule_lookup: impl FnOnce(Point) -> Option<u64>,
) -> PreLadderOutcome {
    if !existence.is_active(archival) {
        return PreLadderOutcome::DomainInactive;
    }
    if !has_source {
        return PreLadderOutcome::NoSource;
    }
    if !bounds.contains(point) {
        return PreLadderOutcome::OutOfBounds;
    }
    if let Some(id) = capsule_lookup(point) {
        return PreLadderOutcome::Collapsed(id);
    }
    PreLadderOutcome::Proceed
}

/// Which tile (if any) a successful ladder step resolved to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiledInfo {
    pub tx: i32,
    pub ty: i32,
    pub tz: i32,
    pub dim: u32,
    pub tile_origin: Point,
    pub tile_id: u64,
    pub step: Q16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LadderSuccess {
    pub tier: Tier,
    pub tile: Option<TiledInfo>,
}

/// Walk the tier ladder (FULL, MEDIUM, COARSE, ANALYTIC), filtered to tiers
/// at or coarser than `policy.max_resolution`, charging tier and
/// tile-build costs against `budget` as it goes. Returns the first tier
/// whose costs fit the remaining budget, or `None` if every tier was too
/// expensive (§4.2: "If every tier fails the policy or budget check →
/// REFUSED, reason = BUDGET").
pub fn run_ladder(
    policy: &DomainPolicy,
    budget: &mut Budget,
    domain_id: u64,
    authoring_version: u64,
    point: Point,
    window: Option<(i64, u32)>,
    mut tile_is_cached: impl FnMut(&CacheKey) -> bool,
) -> Option<LadderSuccess> {
    for tier in Tier::LADDER {
        if tier < policy.max_resolution {
            continue;
        }
        if !budget.consume(policy.cost_for(tier)) {
            continue;
        }
        if !tier.is_tiled() {
            return Some(LadderSuccess { tier, tile: None });
        }

        let dim = policy.sample_dim_for(tier);
        let (tx, ty, tz, tile_origin) = tile_coord_from_point(policy.tile_size, point);
        let tile_id = tile_id_hash(tx, ty, tz, tier);
        let key = CacheKey { domain_id, tile_id, resolution: tier, authoring_version, window };
        if !tile_is_cached(&key) && !budget.consume(policy.tile_build_cost_for(tier)) {
            continue;
        }
        let step = grid_step(policy.tile_size, dim);
        return Some(LadderSuccess {
            tier,
            tile: Some(TiledInfo { tx, ty, tz, dim, tile_origin, tile_id, step }),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_index_rounds_half_up() {
        let step = Q16::from_int(4);
        assert_eq!(nearest_index(Q16::from_f64(1.9), step, 8), 0);
        assert_eq!(nearest_index(Q16::from_f64(2.0), step, 8), 1);
        assert_eq!(nearest_index(Q16::from_f64(2.1), step, 8), 1);
    }

    #[test]
    fn nearest_index_clamps_to_dim() {
        let step = Q16::from_int(4);
        assert_eq!(nearest_index(Q16::from_f64(1000.0), step, 4), 3);
        assert_eq!(nearest_index(Q16::from_f64(-1000.0), step, 4), 0);
    }

    #[test]
    fn sample_array_index_is_lexicographic() {
        assert_eq!(sample_array_index(0, 0, 0, 4), 0);
        assert_eq!(sample_array_index(1, 0, 0, 4), 1);
        assert_eq!(sample_array_index(0, 1, 0, 4), 4);
        assert_eq!(sample_array_index(0, 0, 1, 4), 16);
    }

    #[test]
    fn tile_id_hash_is_stable_and_resolution_sensitive() {
        let a = tile_id_hash(1, 2, 3, Tier::Medium);
        let b = tile_id_hash(1, 2, 3, Tier::Medium);
        let c = tile_id_hash(1, 2, 3, Tier::Coarse);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn window_id_hash_distinguishes_distinct_windows() {
        let a = window_id_hash(0, 1000);
        let b = window_id_hash(1, 1000);
        assert_ne!(a, b);
    }

    #[test]
    fn grid_sample_point_round_trips_through_nearest_index() {
        let tile_origin = Point::new(Q16::from_int(16), Q16::from_int(0), Q16::from_int(0));
        let step = Q16::from_f64(2.0);
        let dim = 8;
        for ix in 0..dim {
            let p = sample_point_for_index(tile_origin, step, ix, 0, 0);
            let (found_ix, _, _) = nearest_sample_indices(p, tile_origin, step, dim);
            assert_eq!(found_ix, ix, "grid point {ix} must map back to itself");
        }
    }

    #[test]
    fn run_ladder_exhausts_to_none_when_budget_is_zero() {
        let policy = DomainPolicy::default_with_tile_size(Q16::from_int(16));
        let mut budget = Budget::new(0);
        let result = run_ladder(&policy, &mut budget, 1, 0, Point::ZERO, None, |_| false);
        assert!(result.is_none());
        assert_eq!(budget.used_units, 0);
    }

    #[test]
    fn run_ladder_picks_full_when_affordable() {
        let policy = DomainPolicy::default_with_tile_size(Q16::from_int(16));
        let mut budget = Budget::new(10);
        let result = run_ladder(&policy, &mut budget, 1, 0, Point::ZERO, None, |_| false).unwrap();
        assert_eq!(result.tier, Tier::Full);
        assert!(result.tile.is_none());
    }

    #[test]
    fn pre_ladder_check_order_domain_inactive_beats_everything() {
        let bounds = Aabb::new(Point::ZERO, Point::new(Q16::from_int(10), Q16::from_int(10), Q16::from_int(10)));
        let outcome = pre_ladder_check(ExistenceState::Declared, ArchivalState::Live, true, bounds, Point::ZERO, |_| None);
        assert_eq!(outcome, PreLadderOutcome::DomainInactive);
    }

    #[test]
    fn pre_ladder_check_out_of_bounds() {
        let bounds = Aabb::new(Point::ZERO, Point::new(Q16::from_int(10), Q16::from_int(10), Q16::from_int(10)));
        let outside = Point::new(Q16::from_int(100), Q16::ZERO, Q16::ZERO);
        let outcome = pre_ladder_check(ExistenceState::Realized, ArchivalState::Live, true, bounds, outside, |_| None);
        assert_eq!(outcome, PreLadderOutcome::OutOfBounds);
    }

    #[test]
    fn pre_ladder_check_collapsed_precedence() {
        let bounds = Aabb::new(Point::ZERO, Point::new(Q16::from_int(10), Q16::from_int(10), Q16::from_int(10)));
        let outcome = pre_ladder_check(ExistenceState::Realized, ArchivalState::Live, true, bounds, Point::ZERO, |_| Some(77));
        assert_eq!(outcome, PreLadderOutcome::Collapsed(77));
    }

    #[test]
    fn run_ladder_skips_to_medium_when_max_resolution_caps_full() {
        let mut policy = DomainPolicy::default_with_tile_size(Q16::from_int(16));
        policy.max_resolution = Tier::Medium;
        let mut budget = Budget::new(100);
        let result = run_ladder(&policy, &mut budget, 1, 0, Point::ZERO, None, |_| false).unwrap();
        assert_eq!(result.tier, Tier::Medium);
        assert!(result.tile.is_some());
    }
}
