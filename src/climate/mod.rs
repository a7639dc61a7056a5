//! Climate provider (§4.5): temperature/precipitation/seasonality envelope
//! fields derived from latitude and altitude ratios plus per-field noise, an
//! anchor override mechanism, prevailing-wind derivation, and the
//! confidence-weighted masked-predicate biome classifier.

use crate::domain::{
    pre_ladder_check, run_ladder, ArchivalState, Budget, CacheKey, Capsule, CapsuleArray,
    Confidence, DomainPolicy, ExistenceState, PreLadderOutcome, QueryMeta, RefusalReason,
    TileCache, Tier,
};
use crate::error::CallerError;
use crate::fixed::{Aabb, FieldValue, Point, Q16};
use crate::rng::{value_noise_signed, StreamKey};
use crate::terrain::{ShapeDesc, ShapeKind, SurfaceDesc as TerrainSurfaceDesc};

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClimateFlags: u32 {
        const FIELDS_UNKNOWN = 1 << 0;
        const WIND_UNKNOWN   = 1 << 1;
        const COLLAPSED      = 1 << 2;
    }
}

/// One of the 8 compass sectors a prevailing wind resolves to, per
/// `climate_fields.h`'s `dom_climate_wind_dir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindDir {
    Unknown,
    North,
    Northeast,
    East,
    Southeast,
    South,
    Southwest,
    West,
    Northwest,
}

impl WindDir {
    /// `dom_climate_wind_dir_from_sector`'s lookup table: sector 0 is East,
    /// sectors advance counter-clockwise.
    fn from_sector(sector: u32) -> WindDir {
        const DIRS: [WindDir; 8] = [
            WindDir::East,
            WindDir::Northeast,
            WindDir::North,
            WindDir::Northwest,
            WindDir::West,
            WindDir::Southwest,
            WindDir::South,
            WindDir::Southeast,
        ];
        DIRS[(sector & 7) as usize]
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AnchorMask: u32 {
        const TEMPERATURE_MEAN  = 1 << 0;
        const TEMPERATURE_RANGE = 1 << 1;
        const PRECIP_MEAN       = 1 << 2;
        const PRECIP_RANGE      = 1 << 3;
        const SEASONALITY       = 1 << 4;
        const WIND_PREVAILING   = 1 << 5;
    }
}

/// Fixed overrides for a subset of the envelope fields, mask-selected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorDesc {
    pub mask: AnchorMask,
    pub temperature_mean: Q16,
    pub temperature_range: Q16,
    pub precipitation_mean: Q16,
    pub precipitation_range: Q16,
    pub seasonality: Q16,
    pub wind_prevailing: WindDir,
}

impl AnchorDesc {
    pub fn none() -> Self {
        AnchorDesc {
            mask: AnchorMask::empty(),
            temperature_mean: Q16::ZERO,
            temperature_range: Q16::ZERO,
            precipitation_mean: Q16::ZERO,
            precipitation_range: Q16::ZERO,
            seasonality: Q16::ZERO,
            wind_prevailing: WindDir::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateNoiseDesc {
    pub seed: u64,
    pub amplitude: Q16,
    pub cell_size: Q16,
}

impl ClimateNoiseDesc {
    pub fn none() -> Self {
        ClimateNoiseDesc { seed: 0, amplitude: Q16::ZERO, cell_size: Q16::ONE }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceDesc {
    pub domain_id: u64,
    pub world_seed: u64,
    pub meters_per_unit: Q16,
    pub shape: ShapeDesc,
    pub noise: ClimateNoiseDesc,

    pub temp_equator: Q16,
    pub temp_pole: Q16,
    pub temp_altitude_scale: Q16,
    pub temp_range_base: Q16,
    pub temp_range_lat_scale: Q16,

    pub precip_equator: Q16,
    pub precip_pole: Q16,
    pub precip_altitude_scale: Q16,
    pub precip_range_base: Q16,
    pub precip_range_lat_scale: Q16,

    pub seasonality_base: Q16,
    pub seasonality_lat_scale: Q16,

    pub noise_temp_scale: Q16,
    pub noise_precip_scale: Q16,
    pub noise_season_scale: Q16,

    pub wind_band_count: u32,
    pub anchor: AnchorDesc,
}

impl SurfaceDesc {
    /// `<P>_surface_desc_init`: a temperate sphere with no anchors, 8 wind
    /// bands, and no noise.
    pub fn init(domain_id: u64, world_seed: u64) -> Self {
        SurfaceDesc {
            domain_id,
            world_seed,
            meters_per_unit: Q16::ONE,
            shape: ShapeDesc::sphere(Q16::from_int(512)),
            noise: ClimateNoiseDesc::none(),
            temp_equator: Q16::ONE,
            temp_pole: Q16::ZERO,
            temp_altitude_scale: Q16::ZERO,
            temp_range_base: Q16::from_ratio(1, 4),
            temp_range_lat_scale: Q16::ZERO,
            precip_equator: Q16::ONE,
            precip_pole: Q16::ZERO,
            precip_altitude_scale: Q16::ZERO,
            precip_range_base: Q16::from_ratio(1, 4),
            precip_range_lat_scale: Q16::ZERO,
            seasonality_base: Q16::from_ratio(1, 4),
            seasonality_lat_scale: Q16::ZERO,
            noise_temp_scale: Q16::ZERO,
            noise_precip_scale: Q16::ZERO,
            noise_season_scale: Q16::ZERO,
            wind_band_count: 8,
            anchor: AnchorDesc::none(),
        }
    }

    fn noise_stream(&self, name: &str) -> u64 {
        StreamKey { world_seed: self.world_seed, domain_id: self.domain_id, process_id: 0, tick_or_index: 0, stream_name: name }.seed()
            ^ self.noise.seed
    }

    fn lat_ratio(&self, point: Point) -> Q16 {
        let latlon = self.latlon(point);
        latlon.latitude_turns.abs().div(Q16::from_ratio(1, 4)).clamp(Q16::ZERO, Q16::ONE)
    }

    fn altitude_ratio(&self, point: Point) -> Q16 {
        let latlon = self.latlon(point);
        let alt = latlon.altitude.max(Q16::ZERO);
        let denom = match self.shape.kind {
            ShapeKind::Slab => self.shape.slab_half_thickness,
            _ => self.shape.radius_equatorial.max(self.shape.radius_polar),
        };
        let denom = if denom.raw() <= 0 { Q16::ONE } else { denom };
        alt.div(denom).clamp(Q16::ZERO, Q16::ONE)
    }

    /// Delegates to the terrain shape's own lat/lon/altitude conversion — a
    /// `ShapeDesc` is shared between terrain and climate surfaces (§4.5
    /// reuses terrain's shape/lat-lon machinery rather than re-deriving it).
    fn latlon(&self, point: Point) -> crate::terrain::LatLon {
        let surface = TerrainSurfaceDesc { domain_id: self.domain_id, world_seed: self.world_seed, meters_per_unit: self.meters_per_unit, shape: self.shape, ..TerrainSurfaceDesc::init(self.domain_id, self.world_seed) };
        surface.local_to_latlon(point)
    }

    fn noise_at(&self, point: Point, seed: u64) -> Q16 {
        if self.noise.amplitude.raw() == 0 {
            return Q16::ZERO;
        }
        let cell = point.to_cell(self.noise.cell_size);
        value_noise_signed(seed, cell, self.noise.amplitude)
    }

    fn wind_prevailing(&self, point: Point, lat_ratio: Q16, latitude_turns: Q16) -> WindDir {
        let band_count = if self.wind_band_count > 0 { self.wind_band_count } else { 8 };
        let cell = point.to_cell(self.noise.cell_size);
        let seed = self.noise_stream("climate.noise.wind");
        let noise_ratio = crate::rng::value_noise_ratio(seed, cell);
        let mut sector = ((noise_ratio.raw() as u64) * band_count as u64) >> 16;
        if sector >= band_count as u64 {
            sector = (band_count - 1) as u64;
        }
        let mut sector = ((sector * 8) / band_count as u64) as u32;
        if lat_ratio.raw() > Q16::HALF.raw() {
            sector = (sector + 2) & 7;
        }
        if latitude_turns.raw() < 0 {
            sector = (sector + 4) & 7;
        }
        WindDir::from_sector(sector)
    }

    /// `dom_climate_eval_fields`: the full envelope-field evaluation at a
    /// point, including anchor overrides.
    pub fn eval(&self, point: Point) -> ClimateFields {
        let lat_ratio = self.lat_ratio(point);
        let alt_ratio = self.altitude_ratio(point);
        let latlon = self.latlon(point);

        let mut temperature_mean = Q16::lerp(self.temp_equator, self.temp_pole, lat_ratio)
            .sub(self.temp_altitude_scale.mul(alt_ratio))
            .add(self.noise_at(point, self.noise_stream("climate.noise.temp")).mul(self.noise_temp_scale))
            .clamp(Q16::ZERO, Q16::ONE);
        let mut temperature_range = self.temp_range_base.add(self.temp_range_lat_scale.mul(lat_ratio)).clamp(Q16::ZERO, Q16::ONE);

        let mut precipitation_mean = Q16::lerp(self.precip_equator, self.precip_pole, lat_ratio)
            .sub(self.precip_altitude_scale.mul(alt_ratio))
            .add(self.noise_at(point, self.noise_stream("climate.noise.precip")).mul(self.noise_precip_scale))
            .clamp(Q16::ZERO, Q16::ONE);
        let mut precipitation_range = self.precip_range_base.add(self.precip_range_lat_scale.mul(lat_ratio)).clamp(Q16::ZERO, Q16::ONE);

        let mut seasonality = self.seasonality_base.add(self.seasonality_lat_scale.mul(lat_ratio))
            .add(self.noise_at(point, self.noise_stream("climate.noise.season")).mul(self.noise_season_scale))
            .clamp(Q16::ZERO, Q16::ONE);

        if self.anchor.mask.contains(AnchorMask::TEMPERATURE_MEAN) {
            temperature_mean = self.anchor.temperature_mean;
        }
        if self.anchor.mask.contains(AnchorMask::TEMPERATURE_RANGE) {
            temperature_range = self.anchor.temperature_range;
        }
        if self.anchor.mask.contains(AnchorMask::PRECIP_MEAN) {
            precipitation_mean = self.anchor.precipitation_mean;
        }
        if self.anchor.mask.contains(AnchorMask::PRECIP_RANGE) {
            precipitation_range = self.anchor.precipitation_range;
        }
        if self.anchor.mask.contains(AnchorMask::SEASONALITY) {
            seasonality = self.anchor.seasonality;
        }

        let wind_prevailing = if self.anchor.mask.contains(AnchorMask::WIND_PREVAILING) {
            self.anchor.wind_prevailing
        } else {
            self.wind_prevailing(point, lat_ratio, latlon.latitude_turns)
        };

        ClimateFields {
            temperature_mean: temperature_mean.clamp(Q16::ZERO, Q16::ONE),
            temperature_range: temperature_range.clamp(Q16::ZERO, Q16::ONE),
            precipitation_mean: precipitation_mean.clamp(Q16::ZERO, Q16::ONE),
            precipitation_range: precipitation_range.clamp(Q16::ZERO, Q16::ONE),
            seasonality: seasonality.clamp(Q16::ZERO, Q16::ONE),
            wind_prevailing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateFields {
    pub temperature_mean: Q16,
    pub temperature_range: Q16,
    pub precipitation_mean: Q16,
    pub precipitation_range: Q16,
    pub seasonality: Q16,
    pub wind_prevailing: WindDir,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateSample {
    pub temperature_mean: FieldValue,
    pub temperature_range: FieldValue,
    pub precipitation_mean: FieldValue,
    pub precipitation_range: FieldValue,
    pub seasonality: FieldValue,
    pub wind_prevailing: WindDir,
    pub flags: ClimateFlags,
    pub meta: QueryMeta,
}

impl ClimateSample {
    fn refused(reason: RefusalReason, budget: &Budget, cost_units: u32) -> Self {
        ClimateSample {
            temperature_mean: FieldValue::Unknown,
            temperature_range: FieldValue::Unknown,
            precipitation_mean: FieldValue::Unknown,
            precipitation_range: FieldValue::Unknown,
            seasonality: FieldValue::Unknown,
            wind_prevailing: WindDir::Unknown,
            flags: ClimateFlags::FIELDS_UNKNOWN | ClimateFlags::WIND_UNKNOWN,
            meta: QueryMeta::refused(reason, budget, cost_units),
        }
    }

    fn from_fields(fields: ClimateFields, tier: Tier, budget: &Budget, cost_units: u32) -> Self {
        let mut flags = ClimateFlags::empty();
        if fields.wind_prevailing == WindDir::Unknown {
            flags |= ClimateFlags::WIND_UNKNOWN;
        }
        ClimateSample {
            temperature_mean: FieldValue::Known(fields.temperature_mean),
            temperature_range: FieldValue::Known(fields.temperature_range),
            precipitation_mean: FieldValue::Known(fields.precipitation_mean),
            precipitation_range: FieldValue::Known(fields.precipitation_range),
            seasonality: FieldValue::Known(fields.seasonality),
            wind_prevailing: fields.wind_prevailing,
            flags,
            meta: QueryMeta::ok(tier, Confidence::Exact, RefusalReason::None, budget, cost_units),
        }
    }
}

/// A macro-capsule summarizing a collapsed climate tile, per
/// `dom_climate_macro_capsule`: averages plus a 4-bin histogram per field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateCapsule {
    pub capsule_id: u64,
    pub bounds: Aabb,
    pub sample_count: u32,
    pub temperature_mean_avg: Q16,
    pub precipitation_mean_avg: Q16,
    pub temperature_hist: [u32; 4],
    pub precipitation_hist: [u32; 4],
    pub seasonality_hist: [u32; 4],
}

impl Capsule for ClimateCapsule {
    fn capsule_id(&self) -> u64 {
        self.capsule_id
    }
    fn bounds(&self) -> Aabb {
        self.bounds
    }
}

fn hist_bin(value: Q16) -> usize {
    let scaled = value.clamp(Q16::ZERO, Q16::ONE).mul(Q16::from_int(4)).raw();
    ((scaled >> 16) as usize).min(3)
}

#[derive(Debug, Clone)]
struct ClimateTile {
    dim: u32,
    temperature_mean: Vec<Q16>,
    temperature_range: Vec<Q16>,
    precipitation_mean: Vec<Q16>,
    precipitation_range: Vec<Q16>,
    seasonality: Vec<Q16>,
    wind_prevailing: Vec<WindDir>,
}

pub struct ClimateDomain {
    surface: SurfaceDesc,
    policy: DomainPolicy,
    existence: ExistenceState,
    archival: ArchivalState,
    authoring_version: u64,
    bounds: Aabb,
    source_present: bool,
    cache: TileCache<ClimateTile>,
    capsules: CapsuleArray<ClimateCapsule>,
}

impl ClimateDomain {
    pub fn domain_init(surface: SurfaceDesc, policy: DomainPolicy, bounds: Aabb, cache_capacity: usize, capsule_capacity: usize) -> Self {
        ClimateDomain {
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

    pub fn domain_set_policy(&mut self, policy: DomainPolicy) {
        self.policy = policy;
        self.authoring_version += 1;
        self.cache.clear();
    }

    pub fn capsule_count(&self) -> usize {
        self.capsules.len()
    }

    pub fn capsule_at(&self, index: usize) -> Option<&ClimateCapsule> {
        self.capsules.get(index)
    }

    /// Weather's surface shares climate's shape and seed (§4.6/§9
    /// shared-handle composition) — exposed so a `WeatherDomain` can derive
    /// its own event centers/radii from the same geometry.
    pub fn surface(&self) -> SurfaceDesc {
        self.surface
    }

    fn build_tile(&self, dim: u32, tile_origin: Point, step: Q16) -> ClimateTile {
        let n = (dim * dim * dim) as usize;
        let mut tile = ClimateTile {
            dim,
            temperature_mean: Vec::with_capacity(n),
            temperature_range: Vec::with_capacity(n),
            precipitation_mean: Vec::with_capacity(n),
            precipitation_range: Vec::with_capacity(n),
            seasonality: Vec::with_capacity(n),
            wind_prevailing: Vec::with_capacity(n),
        };
        for iz in 0..dim {
            for iy in 0..dim {
                for ix in 0..dim {
                    let p = crate::domain::ladder::sample_point_for_index(tile_origin, step, ix, iy, iz);
                    let fields = self.surface.eval(p);
                    tile.temperature_mean.push(fields.temperature_mean);
                    tile.temperature_range.push(fields.temperature_range);
                    tile.precipitation_mean.push(fields.precipitation_mean);
                    tile.precipitation_range.push(fields.precipitation_range);
                    tile.seasonality.push(fields.seasonality);
                    tile.wind_prevailing.push(fields.wind_prevailing);
                }
            }
        }
        tile
    }

    pub fn sample_query(&mut self, point: Point, budget: &mut Budget) -> ClimateSample {
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
            PreLadderOutcome::DomainInactive => return ClimateSample::refused(RefusalReason::DomainInactive, budget, budget.used_units - used_before),
            PreLadderOutcome::NoSource => return ClimateSample::refused(RefusalReason::NoSource, budget, budget.used_units - used_before),
            PreLadderOutcome::OutOfBounds => {
                let cost_units = budget.used_units - used_before;
                return ClimateSample {
                    temperature_mean: FieldValue::Unknown,
                    temperature_range: FieldValue::Unknown,
                    precipitation_mean: FieldValue::Unknown,
                    precipitation_range: FieldValue::Unknown,
                    seasonality: FieldValue::Unknown,
                    wind_prevailing: WindDir::Unknown,
                    flags: ClimateFlags::FIELDS_UNKNOWN | ClimateFlags::WIND_UNKNOWN,
                    meta: QueryMeta::ok(Tier::Coarse, Confidence::LowerBound, RefusalReason::OutOfBounds, budget, cost_units),
                };
            }
            PreLadderOutcome::Collapsed(_id) => {
                let cost_units = budget.used_units - used_before;
                return ClimateSample {
                    temperature_mean: FieldValue::Unknown,
                    temperature_range: FieldValue::Unknown,
                    precipitation_mean: FieldValue::Unknown,
                    precipitation_range: FieldValue::Unknown,
                    seasonality: FieldValue::Unknown,
                    wind_prevailing: WindDir::Unknown,
                    flags: ClimateFlags::COLLAPSED,
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
            return ClimateSample::refused(RefusalReason::Budget, budget, budget.used_units - used_before);
        };

        match success.tile {
            None => {
                let cost_units = budget.used_units - used_before;
                ClimateSample::from_fields(self.surface.eval(point), success.tier, budget, cost_units)
            }
            Some(tiled) => {
                let key = CacheKey { domain_id, tile_id: tiled.tile_id, resolution: success.tier, authoring_version, window: None };
                if self.cache.get(&key).is_none() {
                    let tile = self.build_tile(tiled.dim, tiled.tile_origin, tiled.step);
                    self.cache.insert(key.clone(), tile);
                }
                let tile = self.cache.get(&key).expect("just inserted");
                let (ix, iy, iz) = crate::domain::ladder::nearest_sample_indices(point, tiled.tile_origin, tiled.step, tiled.dim);
                let idx = crate::domain::ladder::sample_array_index(ix, iy, iz, tiled.dim);
                let fields = ClimateFields {
                    temperature_mean: tile.temperature_mean[idx],
                    temperature_range: tile.temperature_range[idx],
                    precipitation_mean: tile.precipitation_mean[idx],
                    precipitation_range: tile.precipitation_range[idx],
                    seasonality: tile.seasonality[idx],
                    wind_prevailing: tile.wind_prevailing[idx],
                };
                let cost_units = budget.used_units - used_before;
                ClimateSample::from_fields(fields, success.tier, budget, cost_units)
            }
        }
    }

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

        let tile = self.build_tile(dim, tile_origin, step);
        let n = tile.temperature_mean.len() as u32;
        let mut temperature_hist = [0u32; 4];
        let mut precipitation_hist = [0u32; 4];
        let mut seasonality_hist = [0u32; 4];
        let (mut temp_sum, mut precip_sum) = (0i64, 0i64);
        for i in 0..tile.temperature_mean.len() {
            temperature_hist[hist_bin(tile.temperature_mean[i])] += 1;
            precipitation_hist[hist_bin(tile.precipitation_mean[i])] += 1;
            seasonality_hist[hist_bin(tile.seasonality[i])] += 1;
            temp_sum += tile.temperature_mean[i].raw() as i64;
            precip_sum += tile.precipitation_mean[i].raw() as i64;
        }
        let avg = |sum: i64| if n == 0 { Q16::ZERO } else { Q16::from_raw((sum / n as i64) as i32) };

        let extent = step.mul(Q16::from_int(dim as i32));
        let bounds = Aabb::new(tile_origin, Point::new(tile_origin.x + extent, tile_origin.y + extent, tile_origin.z + extent));

        self.capsules.push(ClimateCapsule {
            capsule_id: tile_id,
            bounds,
            sample_count: n,
            temperature_mean_avg: avg(temp_sum),
            precipitation_mean_avg: avg(precip_sum),
            temperature_hist,
            precipitation_hist,
            seasonality_hist,
        })?;
        Ok(tile_id)
    }

    pub fn expand_tile(&mut self, tile_id: u64) -> Result<ClimateCapsule, CallerError> {
        self.capsules.remove_by_id(tile_id)
    }
}

// ---------------------------------------------------------------------
// Biome classifier (§4.5): a pure function, no domain state.
// ---------------------------------------------------------------------

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BiomeRuleMask: u32 {
        const TEMP      = 1 << 0;
        const PRECIP    = 1 << 1;
        const SEASON    = 1 << 2;
        const ELEVATION = 1 << 3;
        const MOISTURE  = 1 << 4;
        const HARDNESS  = 1 << 5;
        const STRATA    = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiomeRule {
    pub biome_id: u32,
    pub mask: BiomeRuleMask,
    pub temp_min: Q16,
    pub temp_max: Q16,
    pub precip_min: Q16,
    pub precip_max: Q16,
    pub season_min: Q16,
    pub season_max: Q16,
    pub elevation_min: Q16,
    pub elevation_max: Q16,
    pub moisture_min: Q16,
    pub moisture_max: Q16,
    pub hardness_min: Q16,
    pub hardness_max: Q16,
    pub required_strata_id: u32,
}

#[derive(Debug, Clone)]
pub struct BiomeCatalog {
    pub rules: Vec<BiomeRule>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BiomeInputFlags: u32 {
        const ELEVATION_UNKNOWN = 1 << 0;
        const MOISTURE_UNKNOWN  = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BiomeResultFlags: u32 {
        const UNKNOWN = 1 << 0;
    }
}

/// The subset of a geology sample the biome classifier needs: hardness plus
/// the active stratum at the query point, grounded on `dom_geology_sample`'s
/// `hardness`/`strata_layer_id` fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeologyBiomeInputs {
    pub hardness: FieldValue,
    pub strata_layer_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiomeInputs<'a> {
    pub climate: Option<&'a ClimateSample>,
    pub geology: Option<&'a GeologyBiomeInputs>,
    pub elevation: Q16,
    pub moisture_proxy: Q16,
    pub flags: BiomeInputFlags,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiomeResult {
    pub biome_id: u32,
    pub confidence: Q16,
    pub flags: BiomeResultFlags,
}

/// `value_match`: counts this predicate toward `total`; if the input is
/// unknown, the rule is not rejected on it (only `total` advances). If
/// known, `known` advances too, and the rule is rejected when the value
/// falls outside `[min, max]`.
fn value_match(value: Option<Q16>, min: Q16, max: Q16, total: &mut u32, known: &mut u32) -> bool {
    *total += 1;
    let Some(v) = value else { return true };
    *known += 1;
    v.raw() >= min.raw() && v.raw() <= max.raw()
}

/// `biome_resolve` (§4.5): pure function, no domain state. Iterates every
/// rule, scoring survivors by `confidence = known/total`; ties break by
/// higher `known`, then lower `biome_id`.
pub fn biome_resolve(catalog: &BiomeCatalog, inputs: &BiomeInputs) -> BiomeResult {
    if catalog.rules.is_empty() {
        return BiomeResult { biome_id: 0, confidence: Q16::ZERO, flags: BiomeResultFlags::UNKNOWN };
    }

    let climate_known = inputs.climate.map(|c| !c.flags.contains(ClimateFlags::FIELDS_UNKNOWN)).unwrap_or(false);
    let geology_known = inputs.geology.is_some();
    let moisture_known = !inputs.flags.contains(BiomeInputFlags::MOISTURE_UNKNOWN);
    let elevation_known = !inputs.flags.contains(BiomeInputFlags::ELEVATION_UNKNOWN);

    let mut best: Option<(u32, Q16, u32)> = None;

    for rule in &catalog.rules {
        let mut total = 0u32;
        let mut known = 0u32;
        let mut ok = true;

        if ok && rule.mask.contains(BiomeRuleMask::TEMP) {
            let value = climate_known.then(|| inputs.climate.unwrap().temperature_mean.known()).flatten();
            ok = value_match(value, rule.temp_min, rule.temp_max, &mut total, &mut known);
        }
        if ok && rule.mask.contains(BiomeRuleMask::PRECIP) {
            let value = climate_known.then(|| inputs.climate.unwrap().precipitation_mean.known()).flatten();
            ok = value_match(value, rule.precip_min, rule.precip_max, &mut total, &mut known);
        }
        if ok && rule.mask.contains(BiomeRuleMask::SEASON) {
            let value = climate_known.then(|| inputs.climate.unwrap().seasonality.known()).flatten();
            ok = value_match(value, rule.season_min, rule.season_max, &mut total, &mut known);
        }
        if ok && rule.mask.contains(BiomeRuleMask::ELEVATION) {
            let value = elevation_known.then_some(inputs.elevation);
            ok = value_match(value, rule.elevation_min, rule.elevation_max, &mut total, &mut known);
        }
        if ok && rule.mask.contains(BiomeRuleMask::MOISTURE) {
            let value = moisture_known.then_some(inputs.moisture_proxy);
            ok = value_match(value, rule.moisture_min, rule.moisture_max, &mut total, &mut known);
        }
        if ok && rule.mask.contains(BiomeRuleMask::HARDNESS) {
            let value = if geology_known { inputs.geology.unwrap().hardness.known() } else { None };
            ok = value_match(value, rule.hardness_min, rule.hardness_max, &mut total, &mut known);
        }
        if ok && rule.mask.contains(BiomeRuleMask::STRATA) {
            total += 1;
            match inputs.geology.and_then(|g| g.strata_layer_id) {
                None => {}
                Some(id) => {
                    if id == rule.required_strata_id {
                        known += 1;
                    } else {
                        ok = false;
                    }
                }
            }
        }

        if !ok {
            continue;
        }

        let confidence = if total > 0 { Q16::from_raw((((known as u64) << 16) / total as u64) as i32) } else { Q16::ZERO };
        let better = match best {
            None => true,
            Some((best_id, best_conf, best_known)) => {
                confidence.raw() > best_conf.raw()
                    || (confidence == best_conf && known > best_known)
                    || (confidence == best_conf && known == best_known && rule.biome_id < best_id)
            }
        };
        if better {
            best = Some((rule.biome_id, confidence, known));
        }
    }

    match best {
        Some((biome_id, confidence, known)) if known > 0 => {
            BiomeResult { biome_id, confidence, flags: BiomeResultFlags::empty() }
        }
        _ => BiomeResult { biome_id: 0, confidence: Q16::ZERO, flags: BiomeResultFlags::UNKNOWN },
    }
}
