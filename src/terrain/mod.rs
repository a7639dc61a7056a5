//! Terrain provider (§4.4): a signed-distance surface perturbed by value
//! noise, with slope/roughness/travel-cost/walkability derived fields and
//! lat/lon conversions for the sphere, oblate, and slab shapes.

use crate::domain::{
    pre_ladder_check, run_ladder, ArchivalState, Budget, CacheKey, Capsule, CapsuleArray,
    Confidence, DomainPolicy, ExistenceState, PreLadderOutcome, QueryMeta, RefusalReason,
    TileCache, Tier,
};
use crate::error::CallerError;
use crate::fixed::{Aabb, FieldValue, Point, Q16};
use crate::rng::{value_noise_signed, StreamKey};

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TerrainFlags: u32 {
        const PHI_UNKNOWN       = 1 << 0;
        const FIELDS_UNKNOWN    = 1 << 1;
        const COLLISION_UNKNOWN = 1 << 2;
        const COLLAPSED         = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    Sphere,
    Oblate,
    Slab,
}

/// Geometry parameters for the surface's shape. Only the fields relevant to
/// `kind` are meaningful; the rest are ignored (matching the original's
/// single flat struct covering all three shapes, per
/// `terrain_surface.h`'s `dom_shape_desc`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeDesc {
    pub kind: ShapeKind,
    pub radius_equatorial: Q16,
    pub radius_polar: Q16,
    pub slab_half_extent: Q16,
    pub slab_half_thickness: Q16,
}

impl ShapeDesc {
    pub fn sphere(radius: Q16) -> Self {
        ShapeDesc {
            kind: ShapeKind::Sphere,
            radius_equatorial: radius,
            radius_polar: radius,
            slab_half_extent: Q16::ZERO,
            slab_half_thickness: Q16::ZERO,
        }
    }

    pub fn oblate(radius_equatorial: Q16, radius_polar: Q16) -> Self {
        ShapeDesc { kind: ShapeKind::Oblate, radius_equatorial, radius_polar, slab_half_extent: Q16::ZERO, slab_half_thickness: Q16::ZERO }
    }

    pub fn slab(half_extent: Q16, half_thickness: Q16) -> Self {
        ShapeDesc {
            kind: ShapeKind::Slab,
            radius_equatorial: Q16::ZERO,
            radius_polar: Q16::ZERO,
            slab_half_extent: half_extent,
            slab_half_thickness: half_thickness,
        }
    }

    /// Linear latitude/radius interpolation for the OBLATE shape: the true
    /// shape is an ellipsoid, but without trigonometry on the hot path this
    /// approximates the equator-to-pole radius falloff linearly in
    /// `|lat_turns| / 0.25`. Exact for SPHERE (radii equal).
    fn radius_at_latitude(&self, lat_turns: Q16) -> Q16 {
        match self.kind {
            ShapeKind::Sphere => self.radius_equatorial,
            ShapeKind::Oblate => {
                let quarter = Q16::from_ratio(1, 4);
                let ratio = lat_turns.abs().div(quarter).clamp(Q16::ZERO, Q16::ONE);
                Q16::lerp(self.radius_equatorial, self.radius_polar, ratio)
            }
            ShapeKind::Slab => self.radius_equatorial,
        }
    }

    /// Base signed distance before noise displacement: negative inside the
    /// solid, positive in open air.
    fn phi_base(&self, point: Point) -> Q16 {
        match self.kind {
            ShapeKind::Sphere => point.length() - self.radius_equatorial,
            ShapeKind::Oblate => {
                let r = point.length();
                let lat = latitude_turns(point, r);
                r - self.radius_at_latitude(lat)
            }
            ShapeKind::Slab => {
                let dx = point.x.abs() - self.slab_half_extent;
                let dy = point.y.abs() - self.slab_half_extent;
                let dz = point.z.abs() - self.slab_half_thickness;
                let outside = Point::new(dx.max(Q16::ZERO), dy.max(Q16::ZERO), dz.max(Q16::ZERO)).length();
                let inside = dx.max(dy).max(dz).min(Q16::ZERO);
                outside + inside
            }
        }
    }
}

/// `z/r` scaled linearly into `[-0.25, 0.25]` turns. This is a proxy for
/// true latitude (`asin(z/r)`), chosen so `local_to_latlon`/`latlon_to_local`
/// are exact algebraic inverses of each other without any trig call.
fn latitude_turns(point: Point, r: Q16) -> Q16 {
    if r.raw() == 0 {
        return Q16::ZERO;
    }
    point.z.div(r).mul(Q16::from_ratio(1, 4))
}

/// Noise displacement parameters (§4.4: "additive displacement
/// `amplitude·noise3(seed, P/cell_size)`").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseDesc {
    pub seed: u64,
    pub amplitude: Q16,
    pub cell_size: Q16,
}

impl NoiseDesc {
    pub fn none() -> Self {
        NoiseDesc { seed: 0, amplitude: Q16::ZERO, cell_size: Q16::ONE }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceDesc {
    pub domain_id: u64,
    pub world_seed: u64,
    pub meters_per_unit: Q16,
    pub shape: ShapeDesc,
    pub noise: NoiseDesc,
    pub material_primary: u32,
    pub roughness_base: Q16,
    pub travel_cost_base: Q16,
    pub travel_cost_slope_scale: Q16,
    pub travel_cost_roughness_scale: Q16,
    pub walkable_max_slope: Q16,
}

impl SurfaceDesc {
    /// `<P>_surface_desc_init`: zero-fill with sensible defaults — a unit
    /// sphere, no noise, flat travel cost, a generous walkable slope.
    pub fn init(domain_id: u64, world_seed: u64) -> Self {
        SurfaceDesc {
            domain_id,
            world_seed,
            meters_per_unit: Q16::ONE,
            shape: ShapeDesc::sphere(Q16::from_int(512)),
            noise: NoiseDesc::none(),
            material_primary: 0,
            roughness_base: Q16::ZERO,
            travel_cost_base: Q16::ONE,
            travel_cost_slope_scale: Q16::ONE,
            travel_cost_roughness_scale: Q16::HALF,
            walkable_max_slope: Q16::from_ratio(1, 2),
        }
    }

    fn noise_stream(&self, name: &str) -> u64 {
        StreamKey { world_seed: self.world_seed, domain_id: self.domain_id, process_id: 0, tick_or_index: 0, stream_name: name }.seed()
            ^ self.noise.seed
    }

    /// Signed distance at `point`, including noise displacement.
    pub fn phi(&self, point: Point) -> Q16 {
        let base = self.shape.phi_base(point);
        if self.noise.amplitude.raw() == 0 {
            return base;
        }
        let cell = point.to_cell(self.noise.cell_size);
        let seed = self.noise_stream("terrain.noise.phi");
        base + value_noise_signed(seed, cell, self.noise.amplitude)
    }

    /// Central-difference gradient of `phi` at `point`, stepped by `h`.
    pub fn gradient(&self, point: Point, h: Q16) -> Point {
        debug_assert!(h.raw() > 0);
        let two_h = h.mul(Q16::from_int(2));
        let gx = (self.phi(point.add(Point::new(h, Q16::ZERO, Q16::ZERO))) - self.phi(point.sub(Point::new(h, Q16::ZERO, Q16::ZERO)))).div(two_h);
        let gy = (self.phi(point.add(Point::new(Q16::ZERO, h, Q16::ZERO))) - self.phi(point.sub(Point::new(Q16::ZERO, h, Q16::ZERO)))).div(two_h);
        let gz = (self.phi(point.add(Point::new(Q16::ZERO, Q16::ZERO, h))) - self.phi(point.sub(Point::new(Q16::ZERO, Q16::ZERO, h)))).div(two_h);
        Point::new(gx, gy, gz)
    }

    /// Magnitude of the gradient's horizontal (x, y) components — an
    /// approximation of the tangent-plane slope that treats the local
    /// tangent plane as the XY plane (exact for SLAB, approximate near a
    /// SPHERE/OBLATE's poles).
    pub fn slope(&self, point: Point, h: Q16) -> Q16 {
        let g = self.gradient(point, h);
        Point::new(g.x, g.y, Q16::ZERO).length()
    }

    pub fn roughness(&self, point: Point) -> Q16 {
        if self.noise.amplitude.raw() == 0 {
            return self.roughness_base;
        }
        let cell = point.to_cell(self.noise.cell_size);
        let seed = self.noise_stream("terrain.noise.roughness");
        self.roughness_base + value_noise_signed(seed, cell, self.noise.amplitude).abs()
    }

    pub fn travel_cost(&self, point: Point, h: Q16) -> Q16 {
        let slope = self.slope(point, h);
        let roughness = self.roughness(point);
        self.travel_cost_base + slope.mul(self.travel_cost_slope_scale) + roughness.mul(self.travel_cost_roughness_scale)
    }

    pub fn walkable(&self, point: Point, h: Q16) -> bool {
        self.phi(point).raw() <= 0 && self.slope(point, h).raw() <= self.walkable_max_slope.raw()
    }

    /// Lat/lon/altitude of a point, per §4.4. SLAB uses the planar
    /// pseudo-latitude `point.y / span` (`span = 4 * slab_half_extent`, so
    /// that `y` ranging over `[-half_extent, half_extent]` maps onto
    /// `[-0.25, 0.25]` turns); longitude is not meaningful for a slab and is
    /// always zero.
    pub fn local_to_latlon(&self, point: Point) -> LatLon {
        match self.shape.kind {
            ShapeKind::Slab => {
                let span = Q16::from_int(4).mul(self.shape.slab_half_extent);
                let lat = if span.raw() == 0 {
                    Q16::ZERO
                } else {
                    point.y.div(span).clamp(Q16::from_ratio(-1, 4), Q16::from_ratio(1, 4))
                };
                LatLon { latitude_turns: lat, longitude_turns: Q16::ZERO, altitude: point.z }
            }
            _ => {
                let r = point.length();
                if r.raw() == 0 {
                    return LatLon { latitude_turns: Q16::ZERO, longitude_turns: Q16::ZERO, altitude: Q16::ZERO - self.shape.radius_at_latitude(Q16::ZERO) };
                }
                let lat = latitude_turns(point, r);
                let lon = xy_to_turns(point.y, point.x);
                let altitude = r - self.shape.radius_at_latitude(lat);
                LatLon { latitude_turns: lat, longitude_turns: lon, altitude }
            }
        }
    }

    /// Exact inverse of `local_to_latlon` for SPHERE/OBLATE (within Q16.16
    /// rounding); for SLAB, reconstructs `(x, z)` from latitude/altitude and
    /// leaves `x` at zero (longitude carries no information for a slab).
    pub fn latlon_to_local(&self, latlon: LatLon) -> Point {
        match self.shape.kind {
            ShapeKind::Slab => {
                let span = Q16::from_int(4).mul(self.shape.slab_half_extent);
                Point::new(Q16::ZERO, latlon.latitude_turns.mul(span), latlon.altitude)
            }
            _ => {
                let radius = self.shape.radius_at_latitude(latlon.latitude_turns) + latlon.altitude;
                let z = latlon.latitude_turns.div(Q16::from_ratio(1, 4)).mul(radius);
                let h2 = (radius.mul(radius) - z.mul(z)).max(Q16::ZERO);
                let h = h2.sqrt();
                let (x, y) = turns_to_xy(latlon.longitude_turns, h);
                Point::new(x, y, z)
            }
        }
    }

    pub fn local_to_world(&self, origin: crate::fixed::WorldPoint, local: Point) -> crate::fixed::WorldPoint {
        use crate::fixed::Q48;
        crate::fixed::WorldPoint::new(
            origin.x + Q48::from_q16(local.x),
            origin.y + Q48::from_q16(local.y),
            origin.z + Q48::from_q16(local.z),
        )
    }

    pub fn world_to_local(&self, origin: crate::fixed::WorldPoint, world: crate::fixed::WorldPoint) -> Point {
        Point::new(
            (world.x - origin.x).to_q16_saturating(),
            (world.y - origin.y).to_q16_saturating(),
            (world.z - origin.z).to_q16_saturating(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLon {
    pub latitude_turns: Q16,
    pub longitude_turns: Q16,
    pub altitude: Q16,
}

/// Encode `(x, y)` into a `[0, 1)` turns value via a quadrant index plus a
/// linear within-quadrant fraction `ay / (ax + ay)`. This is not a true
/// angle (it is not proportional to `atan2`), but it is an exact bijection
/// of the quadrant + fraction pair onto `[0, 1)`, which is all that
/// `turns_to_xy` (its algebraic inverse) needs.
fn xy_to_turns(y: Q16, x: Q16) -> Q16 {
    let (ax, ay) = (x.abs(), y.abs());
    let s = ax + ay;
    if s.raw() == 0 {
        return Q16::ZERO;
    }
    let quadrant: i32 = match (x.raw() >= 0, y.raw() >= 0) {
        (true, true) => 0,
        (false, true) => 1,
        (false, false) => 2,
        (true, false) => 3,
    };
    // Quadrants 0/2 sweep from their ax-axis boundary (f=0) to their
    // ay-axis boundary (f=1); quadrants 1/3 sweep the other way. Using the
    // same f=ay/(ax+ay) formula for every quadrant would run the sweep
    // backwards in 1/3 and collide two distinct points onto one turns value
    // at the shared axis boundary.
    let f = if quadrant % 2 == 0 { ay.div(s) } else { ax.div(s) };
    (Q16::from_int(quadrant) + f).div(Q16::from_int(4))
}

/// Inverse of `xy_to_turns`: given the turns value and the target horizontal
/// magnitude `h = sqrt(x^2+y^2)`, reconstruct `(x, y)`.
fn turns_to_xy(turns: Q16, h: Q16) -> (Q16, Q16) {
    let da = turns.mul(Q16::from_int(4));
    let quadrant = (da.raw() >> 16).clamp(0, 3);
    let f = da - Q16::from_int(quadrant);
    // ax^2+ay^2=h^2 with {ax,ay} = {f*S, (1-f)*S} in some order, so
    // S = h / sqrt(f^2+(1-f)^2) regardless of which is which.
    let one_minus_f = Q16::ONE - f;
    let denom = (f.mul(f) + one_minus_f.mul(one_minus_f)).sqrt();
    let s = if denom.raw() == 0 { Q16::ZERO } else { h.div(denom) };
    let (ax, ay) = if quadrant % 2 == 0 { (one_minus_f.mul(s), f.mul(s)) } else { (f.mul(s), one_minus_f.mul(s)) };
    match quadrant {
        0 => (ax, ay),
        1 => (Q16::ZERO - ax, ay),
        2 => (Q16::ZERO - ax, Q16::ZERO - ay),
        _ => (ax, Q16::ZERO - ay),
    }
}

/// A macro-capsule summarizing a collapsed terrain tile: the dominant
/// material plus the φ/roughness range actually observed across the tile,
/// per `original_source`'s `dom_terrain_capsule_t` (`phi_min`/`phi_max`,
/// `roughness_min`/`roughness_max` alongside a single dominant material).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerrainCapsule {
    pub capsule_id: u64,
    pub bounds: Aabb,
    pub material_primary: u32,
    pub phi_min: Q16,
    pub phi_max: Q16,
    pub roughness_min: Q16,
    pub roughness_max: Q16,
}

impl Capsule for TerrainCapsule {
    fn capsule_id(&self) -> u64 {
        self.capsule_id
    }
    fn bounds(&self) -> Aabb {
        self.bounds
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerrainSample {
    pub phi: FieldValue,
    pub slope: FieldValue,
    pub roughness: FieldValue,
    pub travel_cost: FieldValue,
    pub walkable: bool,
    pub material_primary: u32,
    pub flags: TerrainFlags,
    pub meta: QueryMeta,
}

impl TerrainSample {
    fn refused(reason: RefusalReason, budget: &Budget, cost_units: u32) -> Self {
        TerrainSample {
            phi: FieldValue::Unknown,
            slope: FieldValue::Unknown,
            roughness: FieldValue::Unknown,
            travel_cost: FieldValue::Unknown,
            walkable: false,
            material_primary: 0,
            flags: TerrainFlags::PHI_UNKNOWN | TerrainFlags::FIELDS_UNKNOWN | TerrainFlags::COLLISION_UNKNOWN,
            meta: QueryMeta::refused(reason, budget, cost_units),
        }
    }
}

/// A dense tile of terrain samples, keyed in the tile cache by
/// `(domain, tile, resolution, authoring_version)` — terrain has no time
/// axis, unlike vegetation/animal.
#[derive(Debug, Clone)]
struct TerrainTile {
    dim: u32,
    phi: Vec<Q16>,
    slope: Vec<Q16>,
    roughness: Vec<Q16>,
}

pub struct TerrainDomain {
    surface: SurfaceDesc,
    policy: DomainPolicy,
    existence: ExistenceState,
    archival: ArchivalState,
    authoring_version: u64,
    bounds: Aabb,
    /// Whether an SDF source is wired up for this surface. `domain_init`
    /// sets this from the shape (every `ShapeDesc` constructor yields a
    /// usable SDF), but a caller may clear it to model a surface whose
    /// source failed to load (§7 `NO_SOURCE`).
    source_present: bool,
    cache: TileCache<TerrainTile>,
    capsules: CapsuleArray<TerrainCapsule>,
}

impl TerrainDomain {
    pub fn domain_init(surface: SurfaceDesc, policy: DomainPolicy, bounds: Aabb, cache_capacity: usize, capsule_capacity: usize) -> Self {
        TerrainDomain {
            surface,
            policy,
            existence: ExistenceState::Declared,
            archival: ArchivalState::Live,
            authoring_version: 0,
            bounds,
            source_present: true,
            cache: TileCache::new(cache_capacity),
            capsules: CapsuleArray::new(capsule_capacity),
        }
    }

    pub fn domain_free(&mut self) {
        self.cache.clear();
    }

    pub fn domain_set_state(&mut self, existence: ExistenceState, archival: ArchivalState) {
        self.existence = existence;
        self.archival = archival;
    }

    pub fn set_source_present(&mut self, present: bool) {
        self.source_present = present;
    }

    /// Sets a new policy and invalidates the cache (§6: "invalidates cache").
    pub fn domain_set_policy(&mut self, policy: DomainPolicy) {
        self.policy = policy;
        self.authoring_version += 1;
        self.cache.clear();
    }

    pub fn capsule_count(&self) -> usize {
        self.capsules.len()
    }

    pub fn capsule_at(&self, index: usize) -> Option<&TerrainCapsule> {
        self.capsules.get(index)
    }

    /// Vegetation shares terrain's shape/noise (§4.8/§9 shared-handle
    /// composition) — exposed so a `VegetationDomain` can derive elevation
    /// ratios and lat/lon without terrain needing to expose more internals.
    pub fn surface(&self) -> SurfaceDesc {
        self.surface
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    fn build_tile(&self, tx: i32, ty: i32, tz: i32, dim: u32, tile_origin: Point, step: Q16) -> TerrainTile {
        let n = (dim * dim * dim) as usize;
        let mut phi = Vec::with_capacity(n);
        let mut slope = Vec::with_capacity(n);
        let mut roughness = Vec::with_capacity(n);
        let h = self.policy.ray_step;
        let _ = (tx, ty, tz);
        for iz in 0..dim {
            for iy in 0..dim {
                for ix in 0..dim {
                    let p = crate::domain::ladder::sample_point_for_index(tile_origin, step, ix, iy, iz);
                    phi.push(self.surface.phi(p));
                    slope.push(self.surface.slope(p, h));
                    roughness.push(self.surface.roughness(p));
                }
            }
        }
        TerrainTile { dim, phi, slope, roughness }
    }

    pub fn sample_query(&mut self, point: Point, budget: &mut Budget) -> TerrainSample {
        let used_before = budget.used_units;
        let outcome = pre_ladder_check(
            self.existence,
            self.archival,
            self.source_present,
            self.bounds,
            point,
            |p| self.capsules.find_containing(p).map(|c| c.capsule_id),
        );
        match outcome {
            PreLadderOutcome::DomainInactive => return TerrainSample::refused(RefusalReason::DomainInactive, budget, budget.used_units - used_before),
            PreLadderOutcome::NoSource => return TerrainSample::refused(RefusalReason::NoSource, budget, budget.used_units - used_before),
            PreLadderOutcome::OutOfBounds => {
                let cost_units = budget.used_units - used_before;
                return TerrainSample {
                    phi: FieldValue::Unknown,
                    slope: FieldValue::Unknown,
                    roughness: FieldValue::Unknown,
                    travel_cost: FieldValue::Unknown,
                    walkable: false,
                    material_primary: 0,
                    flags: TerrainFlags::PHI_UNKNOWN | TerrainFlags::FIELDS_UNKNOWN | TerrainFlags::COLLISION_UNKNOWN,
                    meta: QueryMeta::ok(Tier::Coarse, Confidence::LowerBound, RefusalReason::OutOfBounds, budget, cost_units),
                };
            }
            PreLadderOutcome::Collapsed(_id) => {
                let cost_units = budget.used_units - used_before;
                return TerrainSample {
                    phi: FieldValue::Unknown,
                    slope: FieldValue::Unknown,
                    roughness: FieldValue::Unknown,
                    travel_cost: FieldValue::Unknown,
                    walkable: false,
                    material_primary: self.surface.material_primary,
                    flags: TerrainFlags::COLLAPSED,
                    meta: QueryMeta::ok(Tier::Analytic, Confidence::Unknown, RefusalReason::Collapsed, budget, cost_units),
                };
            }
            PreLadderOutcome::Proceed => {}
        }

        let domain_id = self.surface.domain_id;
        let authoring_version = self.authoring_version;
        let cache = &mut self.cache;
        let ladder = run_ladder(&self.policy, budget, domain_id, authoring_version, point, None, |key| cache.get(key).is_some());
        let Some(success) = ladder else {
            return TerrainSample::refused(RefusalReason::Budget, budget, budget.used_units - used_before);
        };

        match success.tile {
            None => {
                let h = self.policy.ray_step;
                let cost_units = budget.used_units - used_before;
                TerrainSample {
                    phi: FieldValue::Known(self.surface.phi(point)),
                    slope: FieldValue::Known(self.surface.slope(point, h)),
                    roughness: FieldValue::Known(self.surface.roughness(point)),
                    travel_cost: FieldValue::Known(self.surface.travel_cost(point, h)),
                    walkable: self.surface.walkable(point, h),
                    material_primary: self.surface.material_primary,
                    flags: TerrainFlags::empty(),
                    meta: QueryMeta::ok(success.tier, Confidence::Exact, RefusalReason::None, budget, cost_units),
                }
            }
            Some(tiled) => {
                let key = CacheKey { domain_id, tile_id: tiled.tile_id, resolution: success.tier, authoring_version, window: None };
                if self.cache.get(&key).is_none() {
                    let tile = self.build_tile(tiled.tx, tiled.ty, tiled.tz, tiled.dim, tiled.tile_origin, tiled.step);
                    self.cache.insert(key.clone(), tile);
                }
                let tile = self.cache.get(&key).expect("just inserted");
                let (ix, iy, iz) = crate::domain::ladder::nearest_sample_indices(point, tiled.tile_origin, tiled.step, tiled.dim);
                let idx = crate::domain::ladder::sample_array_index(ix, iy, iz, tiled.dim);
                let phi = tile.phi[idx];
                let slope = tile.slope[idx];
                let roughness = tile.roughness[idx];
                let travel_cost = self.surface.travel_cost_base + slope.mul(self.surface.travel_cost_slope_scale) + roughness.mul(self.surface.travel_cost_roughness_scale);
                let walkable = phi.raw() <= 0 && slope.raw() <= self.surface.walkable_max_slope.raw();
                let cost_units = budget.used_units - used_before;
                TerrainSample {
                    phi: FieldValue::Known(phi),
                    slope: FieldValue::Known(slope),
                    roughness: FieldValue::Known(roughness),
                    travel_cost: FieldValue::Known(travel_cost),
                    walkable,
                    material_primary: self.surface.material_primary,
                    flags: TerrainFlags::empty(),
                    meta: QueryMeta::ok(success.tier, Confidence::Exact, RefusalReason::None, budget, cost_units),
                }
            }
        }
    }

    pub fn collision(&self, point: Point) -> bool {
        self.surface.phi(point).raw() <= 0
    }

    pub fn walkable(&self, point: Point) -> bool {
        self.surface.walkable(point, self.policy.ray_step)
    }

    pub fn gradient(&self, point: Point) -> Point {
        self.surface.gradient(point, self.policy.ray_step)
    }

    /// `collapse_tile`: free any cache entries for `tile_id`, build one tile
    /// at `resolution`, summarize its φ/roughness range into a capsule, and
    /// append it.
    pub fn collapse_tile(&mut self, tx: i32, ty: i32, tz: i32, resolution: Tier) -> Result<u64, CallerError> {
        let dim = self.policy.sample_dim_for(resolution).max(1);
        let step = crate::domain::ladder::grid_step(self.policy.tile_size, dim);
        let tile_origin = Point::new(
            Q16::from_int(tx).mul(self.policy.tile_size),
            Q16::from_int(ty).mul(self.policy.tile_size),
            Q16::from_int(tz).mul(self.policy.tile_size),
        );
        let tile_id = crate::domain::ladder::tile_id_hash(tx, ty, tz, resolution);
        self.cache.invalidate_tile(tile_id);

        let tile = self.build_tile(tx, ty, tz, dim, tile_origin, step);
        let (mut phi_min, mut phi_max) = (Q16::MAX, Q16::MIN);
        let (mut rough_min, mut rough_max) = (Q16::MAX, Q16::MIN);
        for &v in &tile.phi {
            phi_min = phi_min.min(v);
            phi_max = phi_max.max(v);
        }
        for &v in &tile.roughness {
            rough_min = rough_min.min(v);
            rough_max = rough_max.max(v);
        }

        let extent = step.mul(Q16::from_int(dim as i32));
        let bounds = Aabb::new(tile_origin, Point::new(tile_origin.x + extent, tile_origin.y + extent, tile_origin.z + extent));

        self.capsules.push(TerrainCapsule {
            capsule_id: tile_id,
            bounds,
            material_primary: self.surface.material_primary,
            phi_min,
            phi_max,
            roughness_min: rough_min,
            roughness_max: rough_max,
        })?;
        Ok(tile_id)
    }

    pub fn expand_tile(&mut self, tile_id: u64) -> Result<TerrainCapsule, CallerError> {
        self.capsules.remove_by_id(tile_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 2e-3;

    fn sphere_surface() -> SurfaceDesc {
        let mut s = SurfaceDesc::init(1, 1);
        s.shape = ShapeDesc::sphere(Q16::from_int(512));
        s
    }

    #[test]
    fn scenario_1_default_sphere_origin_phi() {
        let s = sphere_surface();
        let phi = s.phi(Point::ZERO);
        assert_eq!(phi.raw(), -512 * 65536, "origin of a radius-512 sphere must be exactly -512.0 with no noise");
    }

    #[test]
    fn scenario_2_zero_budget_refuses() {
        let mut domain = TerrainDomain::domain_init(
            sphere_surface(),
            DomainPolicy::default_with_tile_size(Q16::from_int(16)),
            Aabb::new(Point::new(Q16::from_int(-1000), Q16::from_int(-1000), Q16::from_int(-1000)), Point::new(Q16::from_int(1000), Q16::from_int(1000), Q16::from_int(1000))),
            8,
            8,
        );
        domain.domain_set_state(ExistenceState::Realized, ArchivalState::Live);
        let mut budget = Budget::new(0);
        let sample = domain.sample_query(Point::ZERO, &mut budget);
        assert_eq!(sample.meta.status, crate::domain::Status::Refused);
        assert_eq!(sample.meta.refusal_reason, RefusalReason::Budget);
        assert!(sample.phi.is_unknown());
        assert!(sample.flags.contains(TerrainFlags::PHI_UNKNOWN));
        assert!(sample.flags.contains(TerrainFlags::FIELDS_UNKNOWN));
    }

    #[test]
    fn sphere_origin_is_inside_the_surface() {
        let s = sphere_surface();
        assert!(s.phi(Point::ZERO).raw() <= 0);
    }

    #[test]
    fn lat_lon_round_trips_sphere() {
        let s = sphere_surface();
        let points = [
            Point::new(Q16::from_int(512), Q16::ZERO, Q16::ZERO),
            Point::new(Q16::ZERO, Q16::from_int(512), Q16::ZERO),
            Point::new(Q16::ZERO, Q16::ZERO, Q16::from_int(512)),
            Point::new(Q16::from_f64(300.0), Q16::from_f64(-200.0), Q16::from_f64(150.0)),
        ];
        for p in points {
            let latlon = s.local_to_latlon(p);
            let back = s.latlon_to_local(latlon);
            assert!((back.x.to_f64() - p.x.to_f64()).abs() < EPSILON, "x round trip: {:?} -> {:?}", p, back);
            assert!((back.y.to_f64() - p.y.to_f64()).abs() < EPSILON, "y round trip: {:?} -> {:?}", p, back);
            assert!((back.z.to_f64() - p.z.to_f64()).abs() < EPSILON, "z round trip: {:?} -> {:?}", p, back);
        }
    }

    #[test]
    fn lat_lon_round_trips_oblate() {
        let mut s = sphere_surface();
        s.shape = ShapeDesc::oblate(Q16::from_int(512), Q16::from_int(400));
        let p = Point::new(Q16::from_f64(250.0), Q16::from_f64(180.0), Q16::from_f64(-90.0));
        let latlon = s.local_to_latlon(p);
        let back = s.latlon_to_local(latlon);
        assert!((back.x.to_f64() - p.x.to_f64()).abs() < EPSILON * 4.0);
        assert!((back.y.to_f64() - p.y.to_f64()).abs() < EPSILON * 4.0);
        assert!((back.z.to_f64() - p.z.to_f64()).abs() < EPSILON * 4.0);
    }

    #[test]
    fn lat_lon_round_trips_slab() {
        let mut s = sphere_surface();
        s.shape = ShapeDesc::slab(Q16::from_int(100), Q16::from_int(20));
        let p = Point::new(Q16::ZERO, Q16::from_f64(42.0), Q16::from_f64(3.0));
        let latlon = s.local_to_latlon(p);
        let back = s.latlon_to_local(latlon);
        assert!((back.y.to_f64() - p.y.to_f64()).abs() < EPSILON);
        assert!((back.z.to_f64() - p.z.to_f64()).abs() < EPSILON);
    }

    #[test]
    fn walkable_requires_underground_and_low_slope() {
        let s = sphere_surface();
        let h = Q16::from_f64(0.25);
        // well inside the sphere, flat (no noise), slope ~ 0
        assert!(s.walkable(Point::ZERO, h));
        // far outside
        let outside = Point::new(Q16::from_int(2000), Q16::ZERO, Q16::ZERO);
        assert!(!s.walkable(outside, h));
    }

    #[test]
    fn noise_perturbs_phi_away_from_analytic_base() {
        let mut s = sphere_surface();
        s.noise = NoiseDesc { seed: 7, amplitude: Q16::from_int(4), cell_size: Q16::from_int(8) };
        let base = ShapeDesc::sphere(Q16::from_int(512)).phi_base(Point::new(Q16::from_int(512), Q16::ZERO, Q16::ZERO));
        let perturbed = s.phi(Point::new(Q16::from_int(512), Q16::ZERO, Q16::ZERO));
        assert!((perturbed - base).abs().raw() <= s.noise.amplitude.raw());
    }

    #[test]
    fn value_noise_is_piecewise_constant_so_phi_is_stable_within_a_cell() {
        let mut s = sphere_surface();
        s.noise = NoiseDesc { seed: 3, amplitude: Q16::from_int(2), cell_size: Q16::from_int(8) };
        let p1 = Point::new(Q16::from_f64(512.1), Q16::from_f64(0.1), Q16::ZERO);
        let p2 = Point::new(Q16::from_f64(512.9), Q16::from_f64(0.9), Q16::ZERO);
        assert_eq!(s.phi(p1), s.phi(p2), "both points fall in the same noise cell");
    }

    #[test]
    fn collapse_then_expand_restores_capsule_count() {
        let mut domain = TerrainDomain::domain_init(
            sphere_surface(),
            DomainPolicy::default_with_tile_size(Q16::from_int(16)),
            Aabb::new(Point::new(Q16::from_int(-1000), Q16::from_int(-1000), Q16::from_int(-1000)), Point::new(Q16::from_int(1000), Q16::from_int(1000), Q16::from_int(1000))),
            8,
            8,
        );
        domain.domain_set_state(ExistenceState::Realized, ArchivalState::Live);
        let before = domain.capsule_count();
        let tile_id = domain.collapse_tile(0, 0, 0, Tier::Medium).unwrap();
        assert_eq!(domain.capsule_count(), before + 1);
        domain.expand_tile(tile_id).unwrap();
        assert_eq!(domain.capsule_count(), before);
    }

    #[test]
    fn collapsed_point_takes_precedence_over_live_evaluation() {
        let mut domain = TerrainDomain::domain_init(
            sphere_surface(),
            DomainPolicy::default_with_tile_size(Q16::from_int(16)),
            Aabb::new(Point::new(Q16::from_int(-1000), Q16::from_int(-1000), Q16::from_int(-1000)), Point::new(Q16::from_int(1000), Q16::from_int(1000), Q16::from_int(1000))),
            8,
            8,
        );
        domain.domain_set_state(ExistenceState::Realized, ArchivalState::Live);
        domain.collapse_tile(0, 0, 0, Tier::Medium).unwrap();
        let mut budget = Budget::new(100);
        let sample = domain.sample_query(Point::new(Q16::from_int(1), Q16::from_int(1), Q16::from_int(1)), &mut budget);
        assert!(sample.flags.contains(TerrainFlags::COLLAPSED));
        assert_eq!(sample.meta.refusal_reason, RefusalReason::Collapsed);
    }

    #[test]
    fn domain_inactive_refuses_before_everything_else() {
        let mut domain = TerrainDomain::domain_init(
            sphere_surface(),
            DomainPolicy::default_with_tile_size(Q16::from_int(16)),
            Aabb::new(Point::new(Q16::from_int(-1000), Q16::from_int(-1000), Q16::from_int(-1000)), Point::new(Q16::from_int(1000), Q16::from_int(1000), Q16::from_int(1000))),
            8,
            8,
        );
        let mut budget = Budget::new(100);
        let sample = domain.sample_query(Point::ZERO, &mut budget);
        assert_eq!(sample.meta.refusal_reason, RefusalReason::DomainInactive);
    }

    #[test]
    fn missing_source_refuses_even_when_realized() {
        let mut domain = TerrainDomain::domain_init(
            sphere_surface(),
            DomainPolicy::default_with_tile_size(Q16::from_int(16)),
            Aabb::new(Point::new(Q16::from_int(-1000), Q16::from_int(-1000), Q16::from_int(-1000)), Point::new(Q16::from_int(1000), Q16::from_int(1000), Q16::from_int(1000))),
            8,
            8,
        );
        domain.domain_set_state(ExistenceState::Realized, ArchivalState::Live);
        domain.set_source_present(false);
        let mut budget = Budget::new(100);
        let sample = domain.sample_query(Point::ZERO, &mut budget);
        assert_eq!(sample.meta.refusal_reason, RefusalReason::NoSource);
        assert!(sample.flags.contains(TerrainFlags::FIELDS_UNKNOWN));
    }

    #[test]
    fn set_policy_bumps_authoring_version_and_clears_cache() {
        let mut domain = TerrainDomain::domain_init(
            sphere_surface(),
            DomainPolicy::default_with_tile_size(Q16::from_int(16)),
            Aabb::new(Point::new(Q16::from_int(-1000), Q16::from_int(-1000), Q16::from_int(-1000)), Point::new(Q16::from_int(1000), Q16::from_int(1000), Q16::from_int(1000))),
            8,
            8,
        );
        domain.domain_set_state(ExistenceState::Realized, ArchivalState::Live);
        let mut budget = Budget::new(100);
        let mut policy = DomainPolicy::default_with_tile_size(Q16::from_int(16));
        policy.max_resolution = Tier::Medium;
        domain.domain_set_policy(policy);
        assert_eq!(domain.authoring_version, 1);
        assert!(domain.cache.is_empty());
        let sample = domain.sample_query(Point::ZERO, &mut budget);
        assert_eq!(sample.meta.resolution, Tier::Medium);
    }

    #[test]
    fn tile_grid_consistency_medium_matches_full_at_grid_point() {
        let mut full_domain = TerrainDomain::domain_init(
            sphere_surface(),
            DomainPolicy::default_with_tile_size(Q16::from_int(16)),
            Aabb::new(Point::new(Q16::from_int(-1000), Q16::from_int(-1000), Q16::from_int(-1000)), Point::new(Q16::from_int(1000), Q16::from_int(1000), Q16::from_int(1000))),
            8,
            8,
        );
        full_domain.domain_set_state(ExistenceState::Realized, ArchivalState::Live);

        let mut medium_policy = DomainPolicy::default_with_tile_size(Q16::from_int(16));
        medium_policy.max_resolution = Tier::Medium;
        let mut medium_domain = TerrainDomain::domain_init(
            sphere_surface(),
            medium_policy,
            Aabb::new(Point::new(Q16::from_int(-1000), Q16::from_int(-1000), Q16::from_int(-1000)), Point::new(Q16::from_int(1000), Q16::from_int(1000), Q16::from_int(1000))),
            8,
            8,
        );
        medium_domain.domain_set_state(ExistenceState::Realized, ArchivalState::Live);

        let dim = medium_domain.policy.sample_dim_for(Tier::Medium);
        let step = crate::domain::ladder::grid_step(medium_domain.policy.tile_size, dim);
        let grid_point = crate::domain::ladder::sample_point_for_index(Point::ZERO, step, 3, 2, 1);

        let mut b1 = Budget::new(1000);
        let mut b2 = Budget::new(1000);
        let full_sample = full_domain.sample_query(grid_point, &mut b1);
        let medium_sample = medium_domain.sample_query(grid_point, &mut b2);
        assert_eq!(full_sample.phi, medium_sample.phi);
    }
}
