//! Vegetation provider (§4.8): per-cell species suitability scoring and
//! probabilistic instance placement, layered on top of terrain, climate,
//! weather and geology. The only provider whose tile contents depend on a
//! time window as well as a spatial tile (`CacheKey.window`), since recent
//! rainfall feeds moisture scoring.

use rand::Rng;

use crate::climate::{
    biome_resolve, BiomeCatalog, BiomeInputFlags, BiomeInputs, ClimateDomain, ClimateFlags,
    ClimateSample, GeologyBiomeInputs,
};
use crate::domain::{
    pre_ladder_check, run_ladder, ArchivalState, Budget, CacheKey, Capsule, CapsuleArray,
    Confidence, DomainPolicy, ExistenceState, PreLadderOutcome, QueryMeta, RefusalReason, Status,
    TileCache, Tier,
};
use crate::error::CallerError;
use crate::fixed::{Aabb, FieldValue, Point, Q16};
use crate::geology::{GeologyDomain, GeologyFlags, GeologySample};
use crate::rng::{hash_u64s, ratio_u01, StreamKey};
use crate::terrain::{ShapeKind, SurfaceDesc as TerrainSurfaceDesc, TerrainDomain, TerrainFlags};
use crate::weather::{EventType, WeatherDomain, WeatherFlags, WeatherSample};

use bitflags::bitflags;

pub const MAX_SPECIES: usize = 16;
pub const HIST_BINS: usize = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VegetationFlags: u32 {
        const FIELDS_UNKNOWN = 1 << 0;
        const COLLAPSED      = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VegMode {
    Static,
    Regenerative,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateTolerance {
    pub temperature_min: Q16,
    pub temperature_max: Q16,
    pub moisture_min: Q16,
    pub moisture_max: Q16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesDesc {
    pub species_id: u32,
    pub preferred_biomes: Vec<u32>,
    pub climate_tolerance: ClimateTolerance,
    pub growth_rate: Q16,
    pub max_size: Q16,
    pub lifespan_ticks: u64,
    pub slope_max: Q16,
    pub material_mask: u32,
    pub hardness_min: Q16,
    pub hardness_max: Q16,
    pub grow_period_ticks: u64,
    pub die_period_ticks: u64,
    pub regen_period_ticks: u64,
    pub regen_chance: Q16,
    pub death_rate: Q16,
}

impl SpeciesDesc {
    /// A bare species with no preference (grows anywhere, never dies).
    pub fn init(species_id: u32) -> Self {
        SpeciesDesc {
            species_id,
            preferred_biomes: Vec::new(),
            climate_tolerance: ClimateTolerance {
                temperature_min: Q16::ZERO,
                temperature_max: Q16::ONE,
                moisture_min: Q16::ZERO,
                moisture_max: Q16::ONE,
            },
            growth_rate: Q16::from_f64(0.1),
            max_size: Q16::ONE,
            lifespan_ticks: 0,
            slope_max: Q16::ZERO,
            material_mask: 0,
            hardness_min: Q16::ZERO,
            hardness_max: Q16::ZERO,
            grow_period_ticks: 0,
            die_period_ticks: 0,
            regen_period_ticks: 0,
            regen_chance: Q16::ONE,
            death_rate: Q16::ZERO,
        }
    }
}

/// No `terrain_desc`/`climate_desc`/`geology_desc`/`weather_schedule` copies
/// here: `VegetationDomain` owns the four sub-domains directly and reaches
/// their shared shape/noise through `TerrainDomain::surface()`/
/// `ClimateDomain::surface()`, so the geometry exists exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct VegetationSurfaceDesc {
    pub domain_id: u64,
    pub world_seed: u64,
    /// Placement grid cell size; also bounds how far above/below the
    /// terrain surface a cell is still considered "on the ground".
    pub placement_cell_size: Q16,
    pub density_base: Q16,
    pub weather_window_ticks: u64,
    pub mode: VegMode,
    pub species: Vec<SpeciesDesc>,
    pub biome_catalog: BiomeCatalog,
}

impl VegetationSurfaceDesc {
    pub fn init(domain_id: u64, world_seed: u64) -> Self {
        VegetationSurfaceDesc {
            domain_id,
            world_seed,
            placement_cell_size: Q16::ONE,
            density_base: Q16::from_f64(0.5),
            weather_window_ticks: 0,
            mode: VegMode::Static,
            species: Vec::new(),
            biome_catalog: BiomeCatalog { rules: Vec::new() },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VegetationInstance {
    pub species_id: u32,
    pub location: Point,
    pub size: Q16,
    pub health: Q16,
    pub age_ticks: u64,
}

/// `1 - |value - mid| / half`, clamped at the tolerance window's edges;
/// `1` whenever the window is degenerate (`maxv <= minv`).
fn range_factor(value: Q16, minv: Q16, maxv: Q16) -> Q16 {
    if maxv <= minv {
        return Q16::ONE;
    }
    if value < minv || value > maxv {
        return Q16::ZERO;
    }
    let half = maxv.sub(minv).div(Q16::from_int(2));
    if half.raw() <= 0 {
        return Q16::ONE;
    }
    let mid = minv.add(half);
    let diff = value.sub(mid).abs();
    if diff >= half {
        return Q16::ZERO;
    }
    Q16::ONE.sub(diff.div(half))
}

/// Altitude above the surface, scaled by the shape's characteristic extent
/// and clamped to `[0, 1]`. `local_to_latlon` is infallible in this port, so
/// unlike the original there is no "invalid latlon" branch to fall back on.
fn elevation_ratio(terrain_surface: &TerrainSurfaceDesc, point: Point) -> Q16 {
    let shape = terrain_surface.shape;
    let denom = match shape.kind {
        ShapeKind::Slab => shape.slab_half_thickness,
        _ => shape.radius_equatorial.max(shape.radius_polar),
    };
    let denom = if denom.raw() > 0 { denom } else { Q16::ONE };
    let latlon = terrain_surface.local_to_latlon(point);
    let altitude = latlon.altitude.max(Q16::ZERO);
    altitude.div(denom).clamp(Q16::ZERO, Q16::ONE)
}

fn window_start(tick: u64, window_ticks: u64) -> u64 {
    if window_ticks == 0 {
        tick
    } else {
        tick - tick % window_ticks
    }
}

fn recent_wetness(weather: &mut WeatherDomain, win_start: u64, window_ticks: u32) -> Q16 {
    if window_ticks == 0 {
        return Q16::ZERO;
    }
    let events = weather.events_in_window(win_start, window_ticks);
    let mut sum = Q16::ZERO;
    let mut count: i32 = 0;
    for event in &events {
        if matches!(event.event_type, EventType::Rain | EventType::Snow) {
            sum = sum.add(event.intensity);
            count += 1;
        }
    }
    if count == 0 {
        Q16::ZERO
    } else {
        Q16::from_raw(sum.raw() / count)
    }
}

fn moisture_proxy(climate: &ClimateSample, weather: &WeatherSample, recent: Q16) -> FieldValue {
    if climate.flags.contains(ClimateFlags::FIELDS_UNKNOWN) || weather.flags.contains(WeatherFlags::FIELDS_UNKNOWN) {
        return FieldValue::Unknown;
    }
    let sum = climate.precipitation_mean.unwrap_or(Q16::ZERO)
        .add(weather.surface_wetness.unwrap_or(Q16::ZERO))
        .add(recent);
    FieldValue::Known(Q16::from_raw(sum.raw() / 3).clamp(Q16::ZERO, Q16::ONE))
}

fn biome_allowed(species: &SpeciesDesc, biome_id: u32) -> bool {
    if species.preferred_biomes.is_empty() {
        return true;
    }
    if biome_id == 0 {
        return false;
    }
    species.preferred_biomes.contains(&biome_id)
}

fn species_suitability(
    species: &SpeciesDesc,
    terrain_slope: FieldValue,
    terrain_material: u32,
    climate: &ClimateSample,
    moisture: Q16,
    geology: &GeologySample,
    biome_id: u32,
) -> Q16 {
    if !biome_allowed(species, biome_id) {
        return Q16::ZERO;
    }
    let temp_factor = range_factor(
        climate.temperature_mean.unwrap_or(Q16::ZERO),
        species.climate_tolerance.temperature_min,
        species.climate_tolerance.temperature_max,
    );
    let moisture_factor = range_factor(moisture, species.climate_tolerance.moisture_min, species.climate_tolerance.moisture_max);
    let mut factor = temp_factor.mul(moisture_factor);
    if factor.raw() <= 0 {
        return Q16::ZERO;
    }

    if species.slope_max.raw() > 0 {
        let slope = terrain_slope.unwrap_or(Q16::ZERO);
        if slope >= species.slope_max {
            return Q16::ZERO;
        }
        factor = factor.mul(Q16::ONE.sub(slope.div(species.slope_max)));
    }
    if species.material_mask != 0 {
        let bit = 1u32 << (terrain_material & 31);
        if species.material_mask & bit == 0 {
            return Q16::ZERO;
        }
    }
    if species.hardness_min.raw() > 0 || species.hardness_max.raw() > 0 {
        let hardness = geology.hardness.unwrap_or(Q16::ZERO);
        if hardness < species.hardness_min || hardness > species.hardness_max {
            return Q16::ZERO;
        }
    }
    factor.clamp(Q16::ZERO, Q16::ONE)
}

fn rng_for_cell(surface: &VegetationSurfaceDesc, purpose: &str, cell_key: u64, species_id: u32, event_index: u64) -> rand_chacha::ChaCha8Rng {
    let stream_name = format!("noise.stream.{}.vegetation.{}", surface.domain_id, purpose);
    StreamKey {
        world_seed: surface.world_seed,
        domain_id: surface.domain_id,
        process_id: species_id as u64,
        tick_or_index: hash_u64s(&[cell_key, event_index]),
        stream_name: &stream_name,
    }
    .rng()
}

/// `None` if the species has died out at this tick; otherwise the instance's
/// current age-within-lifespan.
fn instance_alive(surface: &VegetationSurfaceDesc, species: &SpeciesDesc, tick: u64, cell_key: u64) -> Option<u64> {
    if surface.mode == VegMode::Static {
        return Some(0);
    }
    let regen = species.regen_period_ticks;
    let lifespan = species.lifespan_ticks;
    if regen == 0 {
        return if lifespan == 0 || tick < lifespan { Some(tick) } else { None };
    }

    let mut rng = rng_for_cell(surface, "birth", cell_key, species.species_id, 0);
    let birth_offset = rng.gen::<u64>() % regen;
    if tick < birth_offset {
        return None;
    }
    let since_birth = tick - birth_offset;
    let cycle_index = since_birth / regen;
    let phase = since_birth % regen;
    if lifespan > 0 && phase >= lifespan {
        return None;
    }
    if species.regen_chance.raw() <= 0 {
        return None;
    }
    if species.regen_chance < Q16::ONE {
        let mut rng2 = rng_for_cell(surface, "regen", cell_key, species.species_id, cycle_index);
        let ratio = ratio_u01(&mut rng2);
        if ratio > species.regen_chance {
            return None;
        }
    }
    if species.death_rate.raw() > 0 && species.die_period_ticks > 0 && lifespan > 0 {
        let max_events = lifespan / species.die_period_ticks;
        if max_events > 0 {
            let mut rng3 = rng_for_cell(surface, "die", cell_key, species.species_id, cycle_index);
            let ratio = ratio_u01(&mut rng3);
            if ratio < species.death_rate {
                let event_index = rng3.gen::<u64>() % max_events;
                let death_offset = event_index * species.die_period_ticks;
                if phase >= death_offset {
                    return None;
                }
            }
        }
    }
    Some(phase)
}

fn instance_build(
    surface: &VegetationSurfaceDesc,
    species: &SpeciesDesc,
    tick: u64,
    cell_key: u64,
    suitability: Q16,
    cell_center: Point,
) -> Option<VegetationInstance> {
    let age = instance_alive(surface, species, tick, cell_key)?;
    let size = if surface.mode == VegMode::Static {
        species.max_size.mul(suitability)
    } else {
        let base = if species.grow_period_ticks > 0 {
            let steps = (age / species.grow_period_ticks + 1) as i64;
            let scaled = (species.growth_rate.raw() as i64 * steps).clamp(0, species.max_size.raw() as i64);
            Q16::from_raw(scaled as i32)
        } else {
            species.max_size
        };
        base.mul(suitability)
    };
    let size = size.min(species.max_size);

    let mut health = suitability;
    if species.lifespan_ticks > 0 {
        let ratio_raw = ((age as u128) << 16) / species.lifespan_ticks as u128;
        let ratio_raw = ratio_raw.min(i32::MAX as u128) as i32;
        let age_ratio = Q16::from_raw(ratio_raw).clamp(Q16::ZERO, Q16::ONE);
        health = health.mul(Q16::ONE.sub(age_ratio));
    }

    Some(VegetationInstance { species_id: species.species_id, location: cell_center, size, health, age_ticks: age })
}

fn hist_bin_veg(value: Q16) -> usize {
    let scaled = value.clamp(Q16::ZERO, Q16::ONE).mul(Q16::from_int(HIST_BINS as i32 - 1)).raw();
    ((scaled >> 16) as usize).min(HIST_BINS - 1)
}

fn hist_ratio(count: u32, total: u32) -> Q16 {
    if total == 0 {
        Q16::ZERO
    } else {
        Q16::from_raw((((count as i64) << 16) / total as i64) as i32)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VegetationFields {
    pub coverage: FieldValue,
    pub suitability: FieldValue,
    pub biome_id: u32,
    pub instance: Option<VegetationInstance>,
    pub flags: VegetationFlags,
}

impl VegetationFields {
    fn unknown() -> Self {
        VegetationFields {
            coverage: FieldValue::Unknown,
            suitability: FieldValue::Unknown,
            biome_id: 0,
            instance: None,
            flags: VegetationFlags::FIELDS_UNKNOWN,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VegetationSample {
    pub coverage: FieldValue,
    pub suitability: FieldValue,
    pub biome_id: u32,
    pub instance: Option<VegetationInstance>,
    pub flags: VegetationFlags,
    pub meta: QueryMeta,
}

impl VegetationSample {
    fn refused(reason: RefusalReason, budget: &Budget, cost_units: u32) -> Self {
        VegetationSample {
            coverage: FieldValue::Unknown,
            suitability: FieldValue::Unknown,
            biome_id: 0,
            instance: None,
            flags: VegetationFlags::FIELDS_UNKNOWN,
            meta: QueryMeta::refused(reason, budget, cost_units),
        }
    }

    fn from_fields(fields: VegetationFields, tier: Tier, budget: &Budget, cost_units: u32) -> Self {
        let confidence = if fields.flags.contains(VegetationFlags::FIELDS_UNKNOWN) { Confidence::Unknown } else { Confidence::Exact };
        VegetationSample {
            coverage: fields.coverage,
            suitability: fields.suitability,
            biome_id: fields.biome_id,
            instance: fields.instance,
            flags: fields.flags,
            meta: QueryMeta::ok(tier, confidence, RefusalReason::None, budget, cost_units),
        }
    }
}

/// A macro-capsule summarizing a collapsed tile+window, per §4.8/§9:
/// coverage average, and per-species size/age histograms plus a
/// reproducible cursor seed (`StreamKey::seed`) each species' regen stream
/// would resume from — unlike weather's `next_event_index`, this needs no
/// Open Question workaround since it's the literal pre-RNG seed value.
#[derive(Debug, Clone, PartialEq)]
pub struct VegetationCapsule {
    pub capsule_id: u64,
    pub bounds: Aabb,
    pub coverage_avg: Q16,
    pub species_ids: Vec<u32>,
    pub size_hist: Vec<[Q16; HIST_BINS]>,
    pub age_hist: Vec<[Q16; HIST_BINS]>,
    pub species_cursor_seed: Vec<u64>,
}

impl Capsule for VegetationCapsule {
    fn capsule_id(&self) -> u64 {
        self.capsule_id
    }
    fn bounds(&self) -> Aabb {
        self.bounds
    }
}

#[derive(Debug, Clone)]
struct VegetationTile {
    dim: u32,
    coverage: Vec<Q16>,
    suitability: Vec<Q16>,
    biome_id: Vec<u32>,
    instance: Vec<Option<VegetationInstance>>,
    unknown: Vec<bool>,
}

pub struct VegetationDomain {
    surface: VegetationSurfaceDesc,
    terrain: TerrainDomain,
    climate: ClimateDomain,
    weather: WeatherDomain,
    geology: GeologyDomain,
    policy: DomainPolicy,
    existence: ExistenceState,
    archival: ArchivalState,
    authoring_version: u64,
    cache: TileCache<VegetationTile>,
    capsules: CapsuleArray<VegetationCapsule>,
}

impl VegetationDomain {
    pub fn domain_init(
        surface: VegetationSurfaceDesc,
        terrain: TerrainDomain,
        climate: ClimateDomain,
        weather: WeatherDomain,
        geology: GeologyDomain,
        policy: DomainPolicy,
        cache_capacity: usize,
        capsule_capacity: usize,
    ) -> Self {
        VegetationDomain {
            surface,
            terrain,
            climate,
            weather,
            geology,
            policy,
            existence: ExistenceState::Declared,
            archival: ArchivalState::Live,
            authoring_version: 0,
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

    pub fn domain_set_policy(&mut self, policy: DomainPolicy) {
        self.policy = policy;
        self.authoring_version += 1;
        self.cache.clear();
    }

    pub fn capsule_count(&self) -> usize {
        self.capsules.len()
    }

    pub fn capsule_at(&self, index: usize) -> Option<&VegetationCapsule> {
        self.capsules.get(index)
    }

    /// Animal agents (§4.9) share terrain/climate/weather through
    /// vegetation's own composed sub-domains rather than duplicating them a
    /// second time — the same shared-handle pattern `surface()` established
    /// for terrain/climate.
    pub fn terrain_sample(&mut self, point: Point, budget: &mut Budget) -> crate::terrain::TerrainSample {
        self.terrain.sample_query(point, budget)
    }

    pub fn climate_sample(&mut self, point: Point, budget: &mut Budget) -> ClimateSample {
        self.climate.sample_query(point, budget)
    }

    pub fn weather_sample(&mut self, point: Point, tick: u64, budget: &mut Budget) -> WeatherSample {
        self.weather.sample_query(point, tick, budget)
    }

    pub fn terrain_surface(&self) -> TerrainSurfaceDesc {
        self.terrain.surface()
    }

    pub fn terrain_bounds(&self) -> Aabb {
        self.terrain.bounds()
    }

    /// `dom_veg_eval_fields`: queries all four sub-providers, derives
    /// moisture/elevation/biome, then scores and probabilistically places
    /// one instance among species that pass both suitability and a placement
    /// roll. FULL and ANALYTIC tiers call this directly with the caller's
    /// real budget; MEDIUM/COARSE call it once per tile cell while building.
    fn eval_at(&mut self, point: Point, tick: u64, budget: &mut Budget) -> VegetationFields {
        let terrain = self.terrain.sample_query(point, budget);
        if terrain.meta.status == Status::Refused || terrain.flags.contains(TerrainFlags::FIELDS_UNKNOWN) {
            return VegetationFields::unknown();
        }
        let cell_size = if self.surface.placement_cell_size.raw() > 0 { self.surface.placement_cell_size } else { Q16::ONE };
        let phi = terrain.phi.unwrap_or(Q16::ZERO);
        if phi > Q16::ZERO || phi.abs() > cell_size {
            return VegetationFields {
                coverage: FieldValue::Known(Q16::ZERO),
                suitability: FieldValue::Known(Q16::ZERO),
                biome_id: 0,
                instance: None,
                flags: VegetationFlags::empty(),
            };
        }

        let climate = self.climate.sample_query(point, budget);
        if climate.meta.status == Status::Refused || climate.flags.contains(ClimateFlags::FIELDS_UNKNOWN) {
            return VegetationFields::unknown();
        }
        let weather = self.weather.sample_query(point, tick, budget);
        if weather.meta.status == Status::Refused || weather.flags.contains(WeatherFlags::FIELDS_UNKNOWN) {
            return VegetationFields::unknown();
        }
        let geology = self.geology.sample_query(point, budget);
        if geology.meta.status == Status::Refused || geology.flags.contains(GeologyFlags::FIELDS_UNKNOWN) {
            return VegetationFields::unknown();
        }

        let win_start = window_start(tick, self.surface.weather_window_ticks);
        let recent = recent_wetness(&mut self.weather, win_start, self.surface.weather_window_ticks as u32);
        let moisture = moisture_proxy(&climate, &weather, recent);

        let terrain_surface = self.terrain.surface();
        let elevation = elevation_ratio(&terrain_surface, point);

        let biome_id = if !self.surface.biome_catalog.rules.is_empty() {
            let geology_inputs = GeologyBiomeInputs {
                hardness: geology.hardness,
                strata_layer_id: if geology.flags.contains(GeologyFlags::STRATA_UNKNOWN) { None } else { Some(geology.strata_layer_id) },
            };
            let inputs = BiomeInputs {
                climate: Some(&climate),
                geology: Some(&geology_inputs),
                elevation,
                moisture_proxy: moisture.unwrap_or(Q16::ZERO),
                flags: if moisture.is_unknown() { BiomeInputFlags::MOISTURE_UNKNOWN } else { BiomeInputFlags::empty() },
            };
            let result = biome_resolve(&self.surface.biome_catalog, &inputs);
            result.biome_id
        } else {
            0
        };

        let (cx, cy, cz) = point.to_cell(cell_size);
        let key = hash_u64s(&[cx as i64 as u64, cy as i64 as u64, cz as i64 as u64]);
        let half = cell_size.div(Q16::from_int(2));
        let cell_center = Point::new(
            Q16::from_int(cx).mul(cell_size).add(half),
            Q16::from_int(cy).mul(cell_size).add(half),
            Q16::from_int(cz).mul(cell_size).add(half),
        );

        let mut best_coverage = Q16::ZERO;
        let mut max_suitability = Q16::ZERO;
        let mut selected: Option<(u32, Q16, VegetationInstance)> = None;

        for species in &self.surface.species {
            let suitability = species_suitability(species, terrain.slope, terrain.material_primary, &climate, moisture.unwrap_or(Q16::ZERO), &geology, biome_id);
            if suitability.raw() <= 0 {
                continue;
            }
            if suitability > max_suitability {
                max_suitability = suitability;
            }
            let coverage = self.surface.density_base.mul(suitability).clamp(Q16::ZERO, Q16::ONE);
            if coverage > best_coverage {
                best_coverage = coverage;
            }

            let mut rng = rng_for_cell(&self.surface, "placement", key, species.species_id, 0);
            let ratio = ratio_u01(&mut rng);
            if ratio > coverage {
                continue;
            }
            let better = match &selected {
                None => true,
                Some((best_id, best_score, _)) => suitability > *best_score || (suitability == *best_score && species.species_id < *best_id),
            };
            if better {
                if let Some(instance) = instance_build(&self.surface, species, tick, key, suitability, cell_center) {
                    selected = Some((species.species_id, suitability, instance));
                }
            }
        }

        VegetationFields {
            coverage: FieldValue::Known(best_coverage),
            suitability: FieldValue::Known(max_suitability),
            biome_id,
            instance: selected.map(|(_, _, inst)| inst),
            flags: VegetationFlags::empty(),
        }
    }

    fn build_tile(&mut self, dim: u32, tile_origin: Point, step: Q16, tick: u64) -> VegetationTile {
        let n = (dim * dim * dim) as usize;
        let mut tile = VegetationTile {
            dim,
            coverage: Vec::with_capacity(n),
            suitability: Vec::with_capacity(n),
            biome_id: Vec::with_capacity(n),
            instance: Vec::with_capacity(n),
            unknown: Vec::with_capacity(n),
        };
        let mut local_budget = Budget::new(u32::MAX);
        for iz in 0..dim {
            for iy in 0..dim {
                for ix in 0..dim {
                    let p = crate::domain::ladder::sample_point_for_index(tile_origin, step, ix, iy, iz);
                    let fields = self.eval_at(p, tick, &mut local_budget);
                    tile.coverage.push(fields.coverage.unwrap_or(Q16::ZERO));
                    tile.suitability.push(fields.suitability.unwrap_or(Q16::ZERO));
                    tile.biome_id.push(fields.biome_id);
                    tile.instance.push(fields.instance);
                    tile.unknown.push(fields.flags.contains(VegetationFlags::FIELDS_UNKNOWN));
                }
            }
        }
        tile
    }

    pub fn sample_query(&mut self, point: Point, tick: u64, budget: &mut Budget) -> VegetationSample {
        let used_before = budget.used_units;
        let terrain_bounds = self.terrain.bounds();
        let outcome = pre_ladder_check(
            self.existence,
            self.archival,
            true,
            terrain_bounds,
            point,
            |p| self.capsules.find_containing(p).map(|c| c.capsule_id),
        );
        match outcome {
            PreLadderOutcome::DomainInactive => return VegetationSample::refused(RefusalReason::DomainInactive, budget, budget.used_units - used_before),
            PreLadderOutcome::NoSource => return VegetationSample::refused(RefusalReason::NoSource, budget, budget.used_units - used_before),
            PreLadderOutcome::OutOfBounds => {
                let cost_units = budget.used_units - used_before;
                let mut sample = VegetationSample::refused(RefusalReason::None, budget, cost_units);
                sample.meta = QueryMeta::ok(Tier::Coarse, Confidence::LowerBound, RefusalReason::OutOfBounds, budget, cost_units);
                return sample;
            }
            PreLadderOutcome::Collapsed(_id) => {
                let cost_units = budget.used_units - used_before;
                let mut sample = VegetationSample::refused(RefusalReason::None, budget, cost_units);
                sample.flags = VegetationFlags::COLLAPSED;
                sample.meta = QueryMeta::ok(Tier::Analytic, Confidence::Unknown, RefusalReason::Collapsed, budget, cost_units);
                return sample;
            }
            PreLadderOutcome::Proceed => {}
        }

        let domain_id = self.surface.domain_id;
        let authoring_version = self.authoring_version;
        let win_start = window_start(tick, self.surface.weather_window_ticks);
        let window = Some((win_start as i64, self.surface.weather_window_ticks as u32));
        let cache = &mut self.cache;
        let ladder = run_ladder(&self.policy, budget, domain_id, authoring_version, point, window, |key| cache.get(key).is_some());
        let Some(success) = ladder else {
            return VegetationSample::refused(RefusalReason::Budget, budget, budget.used_units - used_before);
        };

        match success.tile {
            None => {
                let fields = self.eval_at(point, tick, budget);
                let cost_units = budget.used_units - used_before;
                VegetationSample::from_fields(fields, success.tier, budget, cost_units)
            }
            Some(tiled) => {
                let key = CacheKey { domain_id, tile_id: tiled.tile_id, resolution: success.tier, authoring_version, window };
                if self.cache.get(&key).is_none() {
                    let tile = self.build_tile(tiled.dim, tiled.tile_origin, tiled.step, tick);
                    self.cache.insert(key.clone(), tile);
                }
                let tile = self.cache.get(&key).expect("just inserted");
                let (ix, iy, iz) = crate::domain::ladder::nearest_sample_indices(point, tiled.tile_origin, tiled.step, tiled.dim);
                let idx = crate::domain::ladder::sample_array_index(ix, iy, iz, tiled.dim);
                let fields = VegetationFields {
                    coverage: FieldValue::Known(tile.coverage[idx]),
                    suitability: FieldValue::Known(tile.suitability[idx]),
                    biome_id: tile.biome_id[idx],
                    instance: tile.instance[idx],
                    flags: if tile.unknown[idx] { VegetationFlags::FIELDS_UNKNOWN } else { VegetationFlags::empty() },
                };
                let cost_units = budget.used_units - used_before;
                VegetationSample::from_fields(fields, success.tier, budget, cost_units)
            }
        }
    }

    pub fn collapse_tile(&mut self, tx: i32, ty: i32, tz: i32, resolution: Tier, tick: u64) -> Result<u64, CallerError> {
        let dim = self.policy.sample_dim_for(resolution).max(1);
        let step = crate::domain::ladder::grid_step(self.policy.tile_size, dim);
        let tile_origin = Point::new(
            Q16::from_int(tx).mul(self.policy.tile_size),
            Q16::from_int(ty).mul(self.policy.tile_size),
            Q16::from_int(tz).mul(self.policy.tile_size),
        );
        let tile_id = crate::domain::ladder::tile_id_hash(tx, ty, tz, resolution);
        self.cache.invalidate_tile(tile_id);

        let win_start = window_start(tick, self.surface.weather_window_ticks);
        let tile = self.build_tile(dim, tile_origin, step, tick);

        let mut coverage_sum = Q16::ZERO;
        let mut species_ids: Vec<u32> = Vec::new();
        let mut size_hist: Vec<[Q16; HIST_BINS]> = Vec::new();
        let mut age_hist: Vec<[Q16; HIST_BINS]> = Vec::new();
        let mut size_counts: Vec<[u32; HIST_BINS]> = Vec::new();
        let mut age_counts: Vec<[u32; HIST_BINS]> = Vec::new();
        let mut total_counts: Vec<u32> = Vec::new();

        for i in 0..tile.coverage.len() {
            coverage_sum = coverage_sum.add(tile.coverage[i]);
            if let Some(instance) = tile.instance[i] {
                let pos = match species_ids.iter().position(|&id| id == instance.species_id) {
                    Some(p) => p,
                    None => {
                        species_ids.push(instance.species_id);
                        size_hist.push([Q16::ZERO; HIST_BINS]);
                        age_hist.push([Q16::ZERO; HIST_BINS]);
                        size_counts.push([0u32; HIST_BINS]);
                        age_counts.push([0u32; HIST_BINS]);
                        total_counts.push(0);
                        species_ids.len() - 1
                    }
                };
                let species = self.surface.species.iter().find(|s| s.species_id == instance.species_id);
                let max_size = species.map(|s| s.max_size).unwrap_or(Q16::ONE);
                let lifespan = species.map(|s| s.lifespan_ticks).unwrap_or(0);
                let size_ratio = if max_size.raw() > 0 { instance.size.div(max_size) } else { Q16::ZERO };
                size_counts[pos][hist_bin_veg(size_ratio)] += 1;
                if lifespan > 0 {
                    let ratio_raw = ((instance.age_ticks as u128) << 16) / lifespan as u128;
                    let age_ratio = Q16::from_raw(ratio_raw.min(i32::MAX as u128) as i32).clamp(Q16::ZERO, Q16::ONE);
                    age_counts[pos][hist_bin_veg(age_ratio)] += 1;
                }
                total_counts[pos] += 1;
            }
        }

        for pos in 0..species_ids.len() {
            for b in 0..HIST_BINS {
                size_hist[pos][b] = hist_ratio(size_counts[pos][b], total_counts[pos]);
                age_hist[pos][b] = hist_ratio(age_counts[pos][b], total_counts[pos]);
            }
        }

        let species_cursor_seed: Vec<u64> = species_ids
            .iter()
            .map(|&species_id| {
                let species = self.surface.species.iter().find(|s| s.species_id == species_id);
                let regen = species.map(|s| s.regen_period_ticks).unwrap_or(0).max(1);
                let cycle_index = win_start / regen;
                let stream_name = format!("noise.stream.{}.vegetation.regen", self.surface.domain_id);
                StreamKey {
                    world_seed: self.surface.world_seed,
                    domain_id: self.surface.domain_id,
                    process_id: species_id as u64,
                    tick_or_index: cycle_index,
                    stream_name: &stream_name,
                }
                .seed()
            })
            .collect();

        let extent = step.mul(Q16::from_int(dim as i32));
        let bounds = Aabb::new(tile_origin, Point::new(tile_origin.x + extent, tile_origin.y + extent, tile_origin.z + extent));
        let n = tile.coverage.len().max(1) as i64;
        let coverage_avg = Q16::from_raw((coverage_sum.raw() as i64 / n) as i32);

        self.capsules.push(VegetationCapsule {
            capsule_id: tile_id,
            bounds,
            coverage_avg,
            species_ids,
            size_hist,
            age_hist,
            species_cursor_seed,
        })?;
        Ok(tile_id)
    }

    pub fn expand_tile(&mut self, tile_id: u64) -> Result<VegetationCapsule, CallerError> {
        self.capsules.remove_by_id(tile_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::climate::SurfaceDesc as ClimateSurfaceDesc;
    use crate::domain::DomainPolicy;
    use crate::geology::SurfaceDesc as GeologySurfaceDesc;
    use crate::terrain::{NoiseDesc, ShapeDesc};
    use crate::weather::ScheduleDesc;

    fn shape() -> ShapeDesc {
        ShapeDesc { kind: ShapeKind::Sphere, radius_equatorial: Q16::from_int(1000), radius_polar: Q16::from_int(1000), slab_half_extent: Q16::ZERO, slab_half_thickness: Q16::ZERO }
    }

    fn domain() -> VegetationDomain {
        let bounds = Aabb::new(Point::new(Q16::from_int(-2000), Q16::from_int(-2000), Q16::from_int(-2000)), Point::new(Q16::from_int(2000), Q16::from_int(2000), Q16::from_int(2000)));
        let mut terrain_surface = crate::terrain::SurfaceDesc::init(1, 42);
        terrain_surface.shape = shape();
        let policy = DomainPolicy::default_with_tile_size(Q16::from_int(16));
        let terrain = TerrainDomain::domain_init(terrain_surface, policy, bounds, 8, 8);

        let mut climate_surface = ClimateSurfaceDesc::init(2, 42);
        climate_surface.shape = shape();
        let climate = ClimateDomain::domain_init(climate_surface, policy, bounds, 8, 8);

        let schedule = ScheduleDesc::init();
        let weather = WeatherDomain::domain_init(ClimateDomain::domain_init(climate_surface, policy, bounds, 8, 8), schedule, policy, 8, 8);

        let mut geology_surface = GeologySurfaceDesc::init(4, 42);
        geology_surface.shape = shape();
        let geology = GeologyDomain::domain_init(geology_surface, policy, bounds, 8, 8);

        let mut surface = VegetationSurfaceDesc::init(5, 42);
        surface.placement_cell_size = Q16::from_int(4);
        surface.density_base = Q16::from_f64(0.8);
        surface.species.push(SpeciesDesc::init(1));

        VegetationDomain::domain_init(surface, terrain, climate, weather, geology, policy, 8, 8)
    }

    #[test]
    fn domain_inactive_refuses_before_everything_else() {
        let mut d = domain();
        d.domain_set_state(ExistenceState::Nonexistent, ArchivalState::Live);
        let mut budget = Budget::new(1000);
        let sample = d.sample_query(Point::new(Q16::from_int(10), Q16::ZERO, Q16::ZERO), 0, &mut budget);
        assert_eq!(sample.meta.status, Status::Refused);
        assert_eq!(sample.meta.refusal_reason, RefusalReason::DomainInactive);
    }

    #[test]
    fn zero_budget_refuses() {
        let mut d = domain();
        let mut budget = Budget::new(0);
        let sample = d.sample_query(Point::new(Q16::from_int(1000), Q16::ZERO, Q16::ZERO), 0, &mut budget);
        assert_eq!(sample.meta.status, Status::Refused);
        assert_eq!(sample.meta.refusal_reason, RefusalReason::Budget);
    }

    #[test]
    fn out_of_bounds_point_reports_lower_bound() {
        let mut d = domain();
        let mut budget = Budget::new(1000);
        let sample = d.sample_query(Point::new(Q16::from_int(100_000), Q16::ZERO, Q16::ZERO), 0, &mut budget);
        assert_eq!(sample.meta.confidence, Confidence::LowerBound);
        assert_eq!(sample.meta.refusal_reason, RefusalReason::OutOfBounds);
    }

    #[test]
    fn on_surface_sample_is_not_unknown() {
        let mut d = domain();
        let mut budget = Budget::new(100_000);
        let point = Point::new(Q16::from_int(1000), Q16::ZERO, Q16::ZERO);
        let sample = d.sample_query(point, 0, &mut budget);
        assert_eq!(sample.meta.status, Status::Ok);
    }

    #[test]
    fn far_from_surface_reports_zero_coverage_not_unknown() {
        let mut d = domain();
        let mut budget = Budget::new(100_000);
        let point = Point::new(Q16::from_int(1000), Q16::from_int(500), Q16::ZERO);
        let sample = d.sample_query(point, 0, &mut budget);
        assert_eq!(sample.coverage, FieldValue::Known(Q16::ZERO));
        assert!(!sample.flags.contains(VegetationFlags::FIELDS_UNKNOWN));
    }

    #[test]
    fn range_factor_is_one_at_midpoint() {
        let f = range_factor(Q16::from_f64(0.5), Q16::ZERO, Q16::ONE);
        assert_eq!(f, Q16::ONE);
    }

    #[test]
    fn range_factor_is_zero_outside_window() {
        assert_eq!(range_factor(Q16::from_f64(2.0), Q16::ZERO, Q16::ONE), Q16::ZERO);
    }

    #[test]
    fn range_factor_degenerate_window_is_always_one() {
        assert_eq!(range_factor(Q16::from_f64(5.0), Q16::ONE, Q16::ZERO), Q16::ONE);
    }

    #[test]
    fn biome_allowed_with_no_preference_is_universal() {
        let species = SpeciesDesc::init(1);
        assert!(biome_allowed(&species, 0));
        assert!(biome_allowed(&species, 7));
    }

    #[test]
    fn biome_allowed_rejects_unlisted_biome() {
        let mut species = SpeciesDesc::init(1);
        species.preferred_biomes = vec![3, 4];
        assert!(!biome_allowed(&species, 0));
        assert!(!biome_allowed(&species, 5));
        assert!(biome_allowed(&species, 3));
    }

    #[test]
    fn static_mode_instance_is_always_alive_with_zero_age() {
        let surface = VegetationSurfaceDesc::init(1, 1);
        let species = SpeciesDesc::init(1);
        assert_eq!(instance_alive(&surface, &species, 1_000_000, 99), Some(0));
    }

    #[test]
    fn regenerative_without_regen_period_respects_lifespan() {
        let mut surface = VegetationSurfaceDesc::init(1, 1);
        surface.mode = VegMode::Regenerative;
        let mut species = SpeciesDesc::init(1);
        species.lifespan_ticks = 100;
        assert_eq!(instance_alive(&surface, &species, 50, 1), Some(50));
        assert_eq!(instance_alive(&surface, &species, 150, 1), None);
    }

    #[test]
    fn instance_build_is_deterministic_for_same_inputs() {
        let surface = VegetationSurfaceDesc::init(1, 7);
        let species = SpeciesDesc::init(1);
        let center = Point::new(Q16::from_int(4), Q16::ZERO, Q16::ZERO);
        let a = instance_build(&surface, &species, 10, 42, Q16::from_f64(0.7), center);
        let b = instance_build(&surface, &species, 10, 42, Q16::from_f64(0.7), center);
        assert_eq!(a, b);
    }

    #[test]
    fn hist_bin_veg_covers_full_unit_range() {
        assert_eq!(hist_bin_veg(Q16::ZERO), 0);
        assert_eq!(hist_bin_veg(Q16::ONE), HIST_BINS - 1);
    }

    #[test]
    fn collapse_then_expand_restores_capsule_count() {
        let mut d = domain();
        assert_eq!(d.capsule_count(), 0);
        let id = d.collapse_tile(0, 0, 0, Tier::Medium, 0).unwrap();
        assert_eq!(d.capsule_count(), 1);
        let capsule = d.expand_tile(id).unwrap();
        assert_eq!(capsule.capsule_id, id);
        assert_eq!(d.capsule_count(), 0);
    }

    #[test]
    fn moisture_proxy_is_unknown_when_either_source_is_unknown() {
        let climate = ClimateSample {
            temperature_mean: FieldValue::Known(Q16::ZERO),
            temperature_range: FieldValue::Known(Q16::ZERO),
            precipitation_mean: FieldValue::Known(Q16::ZERO),
            precipitation_range: FieldValue::Known(Q16::ZERO),
            seasonality: FieldValue::Known(Q16::ZERO),
            wind_prevailing: crate::climate::WindDir::Unknown,
            flags: ClimateFlags::FIELDS_UNKNOWN,
            meta: QueryMeta::refused(RefusalReason::None, &Budget::new(10), 0),
        };
        let weather = WeatherSample {
            temperature_current: FieldValue::Known(Q16::ZERO),
            precipitation_current: FieldValue::Known(Q16::ZERO),
            surface_wetness: FieldValue::Known(Q16::ZERO),
            wind_current: crate::climate::WindDir::Unknown,
            active_event_mask: 0,
            active_event_count: 0,
            flags: WeatherFlags::empty(),
            meta: QueryMeta::refused(RefusalReason::None, &Budget::new(10), 0),
        };
        assert!(moisture_proxy(&climate, &weather, Q16::ZERO).is_unknown());
    }
}
