//! Animal agent provider (§4.9): coarse, event-driven agents layered on top
//! of vegetation (and through it, terrain/climate/weather). Species compete
//! for a placement cell via a weighted spawn roll; the winner's birth tick,
//! energy, health, need and displaced location are all derived, not stored.

use rand::Rng;

use crate::climate::{
    biome_resolve, BiomeCatalog, BiomeInputFlags, BiomeInputs, BiomeResultFlags, ClimateFlags,
    ClimateSample,
};
use crate::domain::{
    pre_ladder_check, run_ladder, ArchivalState, Budget, CacheKey, Capsule, CapsuleArray,
    Confidence, DomainPolicy, ExistenceState, PreLadderOutcome, QueryMeta, RefusalReason, Status,
    TileCache, Tier,
};
use crate::error::CallerError;
use crate::fixed::{Aabb, Point, Q16};
use crate::rng::{hash_u64s, StreamKey};
use crate::terrain::{ShapeKind, SurfaceDesc as TerrainSurfaceDesc, TerrainFlags};
use crate::vegetation::{VegetationDomain, VegetationFlags};
use crate::weather::WeatherFlags;

use bitflags::bitflags;

pub const MAX_SPECIES: usize = 16;
pub const HIST_BINS: usize = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AnimalFlags: u32 {
        const FIELDS_UNKNOWN = 1 << 0;
        const AGENT_PRESENT  = 1 << 1;
        const COLLAPSED      = 1 << 2;
        const DEAD           = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementMode {
    Land,
    Water,
    Air,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Need {
    Eat,
    Rest,
    Reproduce,
    Wander,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathReason {
    None,
    Age,
    Starvation,
    Stress,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateTolerance {
    pub temperature_min: Q16,
    pub temperature_max: Q16,
    pub moisture_min: Q16,
    pub moisture_max: Q16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetabolismDesc {
    pub energy_consumption_rate: Q16,
    pub rest_requirement: Q16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReproductionDesc {
    pub maturity_age_ticks: u64,
    pub gestation_ticks: u64,
    pub offspring_min: u32,
    pub offspring_max: u32,
    pub reproduction_chance: Q16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesDesc {
    pub species_id: u32,
    pub preferred_biomes: Vec<u32>,
    pub climate_tolerance: ClimateTolerance,
    pub movement_mode: MovementMode,
    pub diet_species: Vec<u32>,
    pub metabolism: MetabolismDesc,
    pub reproduction: ReproductionDesc,
    pub lifespan_ticks: u64,
    pub size_class: u32,
    pub movement_speed: Q16,
    pub slope_max: Q16,
    pub death_rate: Q16,
}

impl SpeciesDesc {
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
            movement_mode: MovementMode::Land,
            diet_species: Vec::new(),
            metabolism: MetabolismDesc { energy_consumption_rate: Q16::from_f64(0.1), rest_requirement: Q16::from_f64(0.4) },
            reproduction: ReproductionDesc {
                maturity_age_ticks: 400,
                gestation_ticks: 200,
                offspring_min: 1,
                offspring_max: 2,
                reproduction_chance: Q16::from_f64(0.5),
            },
            lifespan_ticks: 1600,
            size_class: 0,
            movement_speed: Q16::from_f64(0.2),
            slope_max: Q16::from_f64(0.8),
            death_rate: Q16::from_f64(0.1),
        }
    }
}

/// No `vegetation_desc` copy here: `AnimalDomain` owns a `VegetationDomain`
/// directly and reaches terrain/climate/weather through its passthrough
/// accessors, the same shared-handle composition vegetation itself uses for
/// terrain/climate.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimalSurfaceDesc {
    pub domain_id: u64,
    pub world_seed: u64,
    pub placement_cell_size: Q16,
    pub density_base: Q16,
    pub decision_period_ticks: u64,
    pub species: Vec<SpeciesDesc>,
    pub biome_catalog: BiomeCatalog,
}

impl AnimalSurfaceDesc {
    pub fn init(domain_id: u64, world_seed: u64) -> Self {
        AnimalSurfaceDesc {
            domain_id,
            world_seed,
            placement_cell_size: Q16::from_int(12),
            density_base: Q16::from_f64(0.25),
            decision_period_ticks: 120,
            species: Vec::new(),
            biome_catalog: BiomeCatalog { rules: Vec::new() },
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        if self.species.len() > MAX_SPECIES {
            errors.push(format!("species_count must be <= {MAX_SPECIES}, got {}", self.species.len()));
        }
        if self.placement_cell_size.raw() <= 0 {
            errors.push(format!(
                "placement_cell_size must be > 0, got {}. Example: placement_cell_size = Q16::from_int(12)",
                self.placement_cell_size.to_f64()
            ));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors.join("\n")) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimalAgent {
    pub species_id: u32,
    pub location: Point,
    pub energy: Q16,
    pub health: Q16,
    pub age_ticks: u64,
    pub current_need: Need,
    pub movement_mode: MovementMode,
}

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

/// `dom_animal_moisture_proxy`: climate's precipitation mean, averaged with
/// weather's surface wetness only when weather is known (if climate is
/// unknown but weather isn't, this still blends weather against a zero
/// baseline — preserved from the original rather than "fixed", since the
/// unknown flag it also returns is what callers are meant to check).
fn moisture_proxy(climate: &ClimateSample, weather: &crate::weather::WeatherSample) -> (Q16, bool) {
    let climate_known = !climate.flags.contains(ClimateFlags::FIELDS_UNKNOWN);
    let weather_known = !weather.flags.contains(WeatherFlags::FIELDS_UNKNOWN);
    let mut moisture = Q16::ZERO;
    if climate_known {
        moisture = climate.precipitation_mean.unwrap_or(Q16::ZERO);
    }
    if weather_known {
        moisture = moisture.add(weather.surface_wetness.unwrap_or(Q16::ZERO)).div(Q16::from_int(2));
    }
    (moisture.clamp(Q16::ZERO, Q16::ONE), !climate_known || !weather_known)
}

fn window_start(tick: u64, window_ticks: u64) -> u64 {
    if window_ticks == 0 {
        tick
    } else {
        tick - tick % window_ticks
    }
}

fn spawn_period(surface: &AnimalSurfaceDesc, species: &SpeciesDesc) -> u64 {
    let mut period = species.reproduction.gestation_ticks;
    if period == 0 {
        period = species.lifespan_ticks;
    }
    if period == 0 {
        period = surface.decision_period_ticks;
    }
    period.max(1)
}

fn species_index(surface: &AnimalSurfaceDesc, species_id: u32) -> Option<usize> {
    surface.species.iter().position(|s| s.species_id == species_id)
}

fn diet_allows(species: &SpeciesDesc, vegetation_instance: Option<&crate::vegetation::VegetationInstance>) -> bool {
    if species.diet_species.is_empty() {
        return true;
    }
    match vegetation_instance {
        None => false,
        Some(instance) => species.diet_species.contains(&instance.species_id),
    }
}

fn hist_bin_animal(value: Q16) -> usize {
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

fn rng_for(surface: &AnimalSurfaceDesc, purpose: &str, cell_key: u64, species_id: u32, event_index: u64) -> rand_chacha::ChaCha8Rng {
    let stream_name = format!("noise.stream.{}.animal.{}", surface.domain_id, purpose);
    StreamKey {
        world_seed: surface.world_seed,
        domain_id: surface.domain_id,
        process_id: species_id as u64,
        tick_or_index: hash_u64s(&[cell_key, event_index]),
        stream_name: &stream_name,
    }
    .rng()
}

/// The per-species summary cursor used by capsule storage always keys off
/// cell 0 — it isn't tied to a location, only to a species/tick cadence —
/// so `StreamKey::seed()` alone is the reproducible substitute for
/// `dom_animal_rng_cursor`'s raw RNG-state readout.
fn rng_cursor(surface: &AnimalSurfaceDesc, species: &SpeciesDesc, tick: u64) -> u64 {
    let period = spawn_period(surface, species);
    let event_index = tick / period;
    let stream_name = format!("noise.stream.{}.animal.spawn", surface.domain_id);
    StreamKey {
        world_seed: surface.world_seed,
        domain_id: surface.domain_id,
        process_id: species.species_id as u64,
        tick_or_index: hash_u64s(&[0, event_index]),
        stream_name: &stream_name,
    }
    .seed()
}

const NEED_THRESHOLD_EAT: f64 = 0.3;
const NEED_THRESHOLD_REPRO: f64 = 0.6;
const NEED_THRESHOLD_STRESS: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimalFields {
    pub suitability: Q16,
    pub biome_id: u32,
    pub vegetation_coverage: Q16,
    pub vegetation_consumed: Q16,
    pub agent: Option<AnimalAgent>,
    pub death_reason: DeathReason,
    pub flags: AnimalFlags,
}

impl AnimalFields {
    fn unknown() -> Self {
        AnimalFields {
            suitability: Q16::ZERO,
            biome_id: 0,
            vegetation_coverage: Q16::ZERO,
            vegetation_consumed: Q16::ZERO,
            agent: None,
            death_reason: DeathReason::None,
            flags: AnimalFlags::FIELDS_UNKNOWN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimalSample {
    pub suitability: Q16,
    pub biome_id: u32,
    pub vegetation_coverage: Q16,
    pub vegetation_consumed: Q16,
    pub agent: Option<AnimalAgent>,
    pub death_reason: DeathReason,
    pub flags: AnimalFlags,
    pub meta: QueryMeta,
}

impl AnimalSample {
    fn refused(reason: RefusalReason, budget: &Budget, cost_units: u32) -> Self {
        AnimalSample {
            suitability: Q16::ZERO,
            biome_id: 0,
            vegetation_coverage: Q16::ZERO,
            vegetation_consumed: Q16::ZERO,
            agent: None,
            death_reason: DeathReason::None,
            flags: AnimalFlags::FIELDS_UNKNOWN,
            meta: QueryMeta::refused(reason, budget, cost_units),
        }
    }

    fn from_fields(fields: AnimalFields, tier: Tier, budget: &Budget, cost_units: u32) -> Self {
        let confidence = if fields.flags.contains(AnimalFlags::FIELDS_UNKNOWN) { Confidence::Unknown } else { Confidence::Exact };
        AnimalSample {
            suitability: fields.suitability,
            biome_id: fields.biome_id,
            vegetation_coverage: fields.vegetation_coverage,
            vegetation_consumed: fields.vegetation_consumed,
            agent: fields.agent,
            death_reason: fields.death_reason,
            flags: fields.flags,
            meta: QueryMeta::ok(tier, confidence, RefusalReason::None, budget, cost_units),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnimalCapsule {
    pub capsule_id: u64,
    pub bounds: Aabb,
    pub species_ids: Vec<u32>,
    pub population_counts: Vec<u32>,
    pub energy_hist: Vec<[Q16; HIST_BINS]>,
    pub age_hist: Vec<[Q16; HIST_BINS]>,
    pub rng_cursor: Vec<u64>,
}

impl Capsule for AnimalCapsule {
    fn capsule_id(&self) -> u64 {
        self.capsule_id
    }
    fn bounds(&self) -> Aabb {
        self.bounds
    }
}

#[derive(Debug, Clone)]
struct AnimalTile {
    dim: u32,
    suitability: Vec<Q16>,
    biome_id: Vec<u32>,
    vegetation_coverage: Vec<Q16>,
    vegetation_consumed: Vec<Q16>,
    agent: Vec<Option<AnimalAgent>>,
    death_reason: Vec<DeathReason>,
    unknown: Vec<bool>,
}

pub struct AnimalDomain {
    vegetation: VegetationDomain,
    surface: AnimalSurfaceDesc,
    policy: DomainPolicy,
    existence: ExistenceState,
    archival: ArchivalState,
    authoring_version: u64,
    cache: TileCache<AnimalTile>,
    capsules: CapsuleArray<AnimalCapsule>,
}

impl AnimalDomain {
    pub fn domain_init(
        surface: AnimalSurfaceDesc,
        vegetation: VegetationDomain,
        policy: DomainPolicy,
        cache_capacity: usize,
        capsule_capacity: usize,
    ) -> Self {
        AnimalDomain {
            vegetation,
            surface,
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

    pub fn capsule_at(&self, index: usize) -> Option<&AnimalCapsule> {
        self.capsules.get(index)
    }

    /// `dom_animal_eval_fields`: queries terrain/climate (refusing to
    /// unknown on either), treats weather/vegetation refusal as a
    /// degraded-but-still-scorable `fields_unknown` flag rather than a hard
    /// bail, resolves a biome, then runs every species through a
    /// suitability score and a weighted spawn roll. The highest-weight
    /// species that rolls under its own density wins the cell; everything
    /// past that point (birth tick, death checks, energy/health, need,
    /// displaced location) is derived for that one winner only.
    fn eval_at(&mut self, point: Point, tick: u64, budget: &mut Budget) -> AnimalFields {
        let terrain = self.vegetation.terrain_sample(point, budget);
        if terrain.meta.status == Status::Refused || terrain.flags.contains(TerrainFlags::FIELDS_UNKNOWN) {
            return AnimalFields { flags: AnimalFlags::FIELDS_UNKNOWN, ..AnimalFields::unknown() };
        }
        let climate = self.vegetation.climate_sample(point, budget);
        if climate.meta.status == Status::Refused || climate.flags.contains(ClimateFlags::FIELDS_UNKNOWN) {
            return AnimalFields { flags: AnimalFlags::FIELDS_UNKNOWN, ..AnimalFields::unknown() };
        }

        let mut fields_unknown = false;
        let weather = self.vegetation.weather_sample(point, tick, budget);
        if weather.meta.status == Status::Refused || weather.flags.contains(WeatherFlags::FIELDS_UNKNOWN) {
            fields_unknown = true;
        }
        let vegetation = self.vegetation.sample_query(point, tick, budget);
        if vegetation.meta.status == Status::Refused || vegetation.flags.contains(VegetationFlags::FIELDS_UNKNOWN) {
            fields_unknown = true;
        }

        let temperature = if !weather.flags.contains(WeatherFlags::FIELDS_UNKNOWN) {
            weather.temperature_current.unwrap_or(Q16::ZERO)
        } else {
            climate.temperature_mean.unwrap_or(Q16::ZERO)
        };
        let (moisture, moisture_unknown) = moisture_proxy(&climate, &weather);
        if moisture_unknown {
            fields_unknown = true;
        }

        let terrain_surface = self.vegetation.terrain_surface();
        let elevation = elevation_ratio(&terrain_surface, point);

        let mut input_flags = BiomeInputFlags::empty();
        if moisture_unknown {
            input_flags |= BiomeInputFlags::MOISTURE_UNKNOWN;
        }
        let biome_result = biome_resolve(
            &self.surface.biome_catalog,
            &BiomeInputs { climate: Some(&climate), geology: None, elevation, moisture_proxy: moisture, flags: input_flags },
        );
        let biome_id = biome_result.biome_id;
        let biome_unknown = biome_result.flags.contains(BiomeResultFlags::UNKNOWN);

        let mut veg_coverage = vegetation.coverage.unwrap_or(Q16::ZERO);
        if vegetation.flags.contains(VegetationFlags::FIELDS_UNKNOWN) {
            veg_coverage = Q16::ZERO;
        }

        let base_density = self.surface.density_base;
        let cell_size = if self.surface.placement_cell_size.raw() > 0 { self.surface.placement_cell_size } else { Q16::ONE };
        let (cx, cy, cz) = point.to_cell(cell_size);
        let cell_key = hash_u64s(&[cx as i64 as u64, cy as i64 as u64, cz as i64 as u64]);
        let half = cell_size.div(Q16::from_int(2));
        let cell_center = Point::new(
            Q16::from_int(cx).mul(cell_size).add(half),
            Q16::from_int(cy).mul(cell_size).add(half),
            Q16::from_int(cz).mul(cell_size).add(half),
        );

        let mut best_index: Option<usize> = None;
        let mut best_weight = Q16::ZERO;
        let mut suitability = Q16::ZERO;

        for (i, species) in self.surface.species.iter().enumerate() {
            let temp_factor = range_factor(temperature, species.climate_tolerance.temperature_min, species.climate_tolerance.temperature_max);
            let moisture_factor = range_factor(moisture, species.climate_tolerance.moisture_min, species.climate_tolerance.moisture_max);

            let biome_factor = if species.preferred_biomes.is_empty() {
                Q16::ONE
            } else if biome_unknown {
                Q16::from_f64(0.5)
            } else if species.preferred_biomes.contains(&biome_id) {
                Q16::ONE
            } else {
                Q16::ZERO
            };

            let mut veg_factor = if fields_unknown { Q16::from_f64(0.5) } else { veg_coverage.clamp(Q16::ZERO, Q16::ONE) };
            if !diet_allows(species, vegetation.instance.as_ref()) {
                veg_factor = Q16::ZERO;
            }

            let walk_factor = match species.movement_mode {
                MovementMode::Land => {
                    let slope_max = if species.slope_max.raw() > 0 { species.slope_max } else { terrain_surface.walkable_max_slope };
                    let slope = terrain.slope.unwrap_or(Q16::ZERO);
                    let phi = terrain.phi.unwrap_or(Q16::ZERO);
                    if slope > slope_max || phi > Q16::ZERO { Q16::ZERO } else { Q16::ONE }
                }
                MovementMode::Water => {
                    if terrain.phi.unwrap_or(Q16::ZERO) <= Q16::ZERO { Q16::ZERO } else { Q16::ONE }
                }
                MovementMode::Air => Q16::ONE,
            };

            let local_suitability = temp_factor.mul(moisture_factor).mul(biome_factor).mul(veg_factor).mul(walk_factor);
            if local_suitability.raw() <= 0 {
                continue;
            }
            let density = base_density.mul(local_suitability);
            if density.raw() <= 0 {
                continue;
            }

            let period = spawn_period(&self.surface, species);
            let event_index = tick / period;
            let mut rng = rng_for(&self.surface, "spawn", cell_key, species.species_id, event_index);
            let roll = Q16::from_raw(rng.gen_range(0i64..(1i64 << 16)) as i32);
            if roll < density {
                let weight = density.sub(roll);
                if best_index.is_none() || weight > best_weight {
                    best_index = Some(i);
                    best_weight = weight;
                    suitability = local_suitability;
                }
            }
        }

        let mut out = AnimalFields {
            suitability,
            biome_id,
            vegetation_coverage: veg_coverage,
            vegetation_consumed: Q16::ZERO,
            agent: None,
            death_reason: DeathReason::None,
            flags: if fields_unknown { AnimalFlags::FIELDS_UNKNOWN } else { AnimalFlags::empty() },
        };

        let Some(best_index) = best_index else {
            return out;
        };
        let species = &self.surface.species[best_index];

        let period = spawn_period(&self.surface, species);
        let event_index = tick / period;
        let temp_factor = range_factor(temperature, species.climate_tolerance.temperature_min, species.climate_tolerance.temperature_max);
        let moisture_factor = range_factor(moisture, species.climate_tolerance.moisture_min, species.climate_tolerance.moisture_max);
        let climate_factor = temp_factor.mul(moisture_factor);

        let mut birth_rng = rng_for(&self.surface, "birth", cell_key, species.species_id, event_index);
        let birth_tick = event_index * period + birth_rng.gen::<u64>() % period;
        if tick < birth_tick {
            return out;
        }
        let age_ticks = tick - birth_tick;
        if species.lifespan_ticks > 0 && age_ticks >= species.lifespan_ticks {
            out.death_reason = DeathReason::Age;
            out.flags |= AnimalFlags::DEAD;
            return out;
        }

        let mut veg_consumed = species.metabolism.energy_consumption_rate.max(Q16::ZERO);
        if veg_consumed > veg_coverage {
            veg_consumed = veg_coverage;
        }
        out.vegetation_consumed = veg_consumed;

        let mut energy = veg_coverage.clamp(Q16::ZERO, Q16::ONE).mul(suitability);
        let travel_cost = terrain.travel_cost.unwrap_or(Q16::ZERO);
        if travel_cost.raw() > 0 {
            let penalty = travel_cost.clamp(Q16::ZERO, Q16::ONE);
            energy = energy.sub(penalty.mul(Q16::from_f64(0.2)));
        }
        energy = energy.add(veg_consumed).sub(species.metabolism.energy_consumption_rate);
        energy = energy.clamp(Q16::ZERO, Q16::ONE);

        let health = energy.mul(climate_factor).clamp(Q16::ZERO, Q16::ONE);

        if energy.raw() <= 0 {
            out.death_reason = DeathReason::Starvation;
            out.flags |= AnimalFlags::DEAD;
            return out;
        }
        if climate_factor <= Q16::from_f64(NEED_THRESHOLD_STRESS) {
            out.death_reason = DeathReason::Stress;
            out.flags |= AnimalFlags::DEAD;
            return out;
        }

        let need = if energy < Q16::from_f64(NEED_THRESHOLD_EAT) {
            Need::Eat
        } else if species.metabolism.rest_requirement.raw() > 0 && energy < species.metabolism.rest_requirement {
            Need::Rest
        } else if age_ticks >= species.reproduction.maturity_age_ticks && energy > Q16::from_f64(NEED_THRESHOLD_REPRO) {
            Need::Reproduce
        } else {
            Need::Wander
        };

        let mut move_speed = species.movement_speed;
        if move_speed.raw() <= 0 {
            move_speed = Q16::from_f64(0.2);
        }
        let mut move_radius = cell_size.mul(move_speed);
        let half_cell = cell_size.div(Q16::from_int(2));
        if move_radius > half_cell {
            move_radius = half_cell;
        }
        let decision_period = self.surface.decision_period_ticks.max(1);
        let decision_index = tick / decision_period;
        let mut move_rng = rng_for(&self.surface, "move", cell_key, species.species_id, decision_index);
        let rx = Q16::from_raw(move_rng.gen_range(0i64..(1i64 << 16)) as i32);
        let ry = Q16::from_raw(move_rng.gen_range(0i64..(1i64 << 16)) as i32);
        let rz = Q16::from_raw(move_rng.gen_range(0i64..(1i64 << 16)) as i32);
        let half = Q16::from_f64(0.5);
        let span = Q16::from_int(2);
        let offset = |r: Q16| r.sub(half).mul(span).mul(move_radius);
        let mut location = cell_center;
        let slope = terrain.slope.unwrap_or(Q16::ZERO);
        let phi = terrain.phi.unwrap_or(Q16::ZERO);
        let displace = match species.movement_mode {
            MovementMode::Land => slope <= terrain_surface.walkable_max_slope && phi <= Q16::ZERO,
            MovementMode::Water => phi > Q16::ZERO,
            MovementMode::Air => true,
        };
        if displace {
            location = Point::new(location.x + offset(rx), location.y + offset(ry), location.z + offset(rz));
        }

        out.flags |= AnimalFlags::AGENT_PRESENT;
        out.agent = Some(AnimalAgent {
            species_id: species.species_id,
            location,
            energy,
            health,
            age_ticks,
            current_need: need,
            movement_mode: species.movement_mode,
        });
        out
    }

    fn build_tile(&mut self, dim: u32, tile_origin: Point, step: Q16, eval_tick: u64) -> AnimalTile {
        let n = (dim * dim * dim) as usize;
        let mut tile = AnimalTile {
            dim,
            suitability: Vec::with_capacity(n),
            biome_id: Vec::with_capacity(n),
            vegetation_coverage: Vec::with_capacity(n),
            vegetation_consumed: Vec::with_capacity(n),
            agent: Vec::with_capacity(n),
            death_reason: Vec::with_capacity(n),
            unknown: Vec::with_capacity(n),
        };
        let mut local_budget = Budget::new(u32::MAX);
        for iz in 0..dim {
            for iy in 0..dim {
                for ix in 0..dim {
                    let p = crate::domain::ladder::sample_point_for_index(tile_origin, step, ix, iy, iz);
                    let fields = self.eval_at(p, eval_tick, &mut local_budget);
                    tile.suitability.push(fields.suitability);
                    tile.biome_id.push(fields.biome_id);
                    tile.vegetation_coverage.push(fields.vegetation_coverage);
                    tile.vegetation_consumed.push(fields.vegetation_consumed);
                    tile.agent.push(fields.agent);
                    tile.death_reason.push(fields.death_reason);
                    tile.unknown.push(fields.flags.contains(AnimalFlags::FIELDS_UNKNOWN));
                }
            }
        }
        tile
    }

    pub fn sample_query(&mut self, point: Point, tick: u64, budget: &mut Budget) -> AnimalSample {
        let used_before = budget.used_units;
        let bounds = self.vegetation.terrain_bounds();
        let outcome = pre_ladder_check(
            self.existence,
            self.archival,
            true,
            bounds,
            point,
            |p| self.capsules.find_containing(p).map(|c| c.capsule_id),
        );
        match outcome {
            PreLadderOutcome::DomainInactive => return AnimalSample::refused(RefusalReason::DomainInactive, budget, budget.used_units - used_before),
            PreLadderOutcome::NoSource => return AnimalSample::refused(RefusalReason::NoSource, budget, budget.used_units - used_before),
            PreLadderOutcome::OutOfBounds => {
                let cost_units = budget.used_units - used_before;
                let mut sample = AnimalSample::refused(RefusalReason::None, budget, cost_units);
                sample.meta = QueryMeta::ok(Tier::Coarse, Confidence::LowerBound, RefusalReason::OutOfBounds, budget, cost_units);
                return sample;
            }
            PreLadderOutcome::Collapsed(_id) => {
                let cost_units = budget.used_units - used_before;
                let mut sample = AnimalSample::refused(RefusalReason::None, budget, cost_units);
                sample.flags = AnimalFlags::COLLAPSED;
                sample.meta = QueryMeta::ok(Tier::Analytic, Confidence::Unknown, RefusalReason::Collapsed, budget, cost_units);
                return sample;
            }
            PreLadderOutcome::Proceed => {}
        }

        let window_ticks = self.surface.decision_period_ticks.max(1);
        let eval_tick = window_start(tick, window_ticks);
        let window = Some((eval_tick as i64, window_ticks as u32));

        let domain_id = self.surface.domain_id;
        let authoring_version = self.authoring_version;
        let cache = &mut self.cache;
        let ladder = run_ladder(&self.policy, budget, domain_id, authoring_version, point, window, |key| cache.get(key).is_some());
        let Some(success) = ladder else {
            return AnimalSample::refused(RefusalReason::Budget, budget, budget.used_units - used_before);
        };

        match success.tile {
            None => {
                let fields = self.eval_at(point, eval_tick, budget);
                let cost_units = budget.used_units - used_before;
                AnimalSample::from_fields(fields, success.tier, budget, cost_units)
            }
            Some(tiled) => {
                let key = CacheKey { domain_id, tile_id: tiled.tile_id, resolution: success.tier, authoring_version, window };
                if self.cache.get(&key).is_none() {
                    let tile = self.build_tile(tiled.dim, tiled.tile_origin, tiled.step, eval_tick);
                    self.cache.insert(key.clone(), tile);
                }
                let tile = self.cache.get(&key).expect("just inserted");
                let (ix, iy, iz) = crate::domain::ladder::nearest_sample_indices(point, tiled.tile_origin, tiled.step, tiled.dim);
                let idx = crate::domain::ladder::sample_array_index(ix, iy, iz, tiled.dim);
                let fields = AnimalFields {
                    suitability: tile.suitability[idx],
                    biome_id: tile.biome_id[idx],
                    vegetation_coverage: tile.vegetation_coverage[idx],
                    vegetation_consumed: tile.vegetation_consumed[idx],
                    agent: tile.agent[idx],
                    death_reason: tile.death_reason[idx],
                    flags: if tile.unknown[idx] { AnimalFlags::FIELDS_UNKNOWN } else { AnimalFlags::empty() }
                        | if tile.agent[idx].is_some() { AnimalFlags::AGENT_PRESENT } else { AnimalFlags::empty() },
                };
                let cost_units = budget.used_units - used_before;
                AnimalSample::from_fields(fields, success.tier, budget, cost_units)
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

        let window_ticks = self.surface.decision_period_ticks.max(1);
        let eval_tick = window_start(tick, window_ticks);
        let tile = self.build_tile(dim, tile_origin, step, eval_tick);

        let mut species_ids: Vec<u32> = Vec::new();
        let mut population_counts: Vec<u32> = Vec::new();
        let mut energy_counts: Vec<[u32; HIST_BINS]> = Vec::new();
        let mut age_counts: Vec<[u32; HIST_BINS]> = Vec::new();

        for agent in tile.agent.iter().flatten() {
            let Some(idx) = species_index(&self.surface, agent.species_id) else { continue };
            let pos = match species_ids.iter().position(|&id| id == agent.species_id) {
                Some(p) => p,
                None => {
                    species_ids.push(agent.species_id);
                    population_counts.push(0);
                    energy_counts.push([0u32; HIST_BINS]);
                    age_counts.push([0u32; HIST_BINS]);
                    species_ids.len() - 1
                }
            };
            let species = &self.surface.species[idx];
            let energy_ratio = agent.energy.clamp(Q16::ZERO, Q16::ONE);
            let age_ratio = if species.lifespan_ticks > 0 {
                let ratio_raw = ((agent.age_ticks as u128) << 16) / species.lifespan_ticks as u128;
                Q16::from_raw(ratio_raw.min(i32::MAX as u128) as i32)
            } else {
                Q16::ZERO
            };
            population_counts[pos] += 1;
            energy_counts[pos][hist_bin_animal(energy_ratio)] += 1;
            age_counts[pos][hist_bin_animal(age_ratio)] += 1;
        }

        let energy_hist: Vec<[Q16; HIST_BINS]> = (0..species_ids.len())
            .map(|pos| std::array::from_fn(|b| hist_ratio(energy_counts[pos][b], population_counts[pos])))
            .collect();
        let age_hist: Vec<[Q16; HIST_BINS]> = (0..species_ids.len())
            .map(|pos| std::array::from_fn(|b| hist_ratio(age_counts[pos][b], population_counts[pos])))
            .collect();
        let rng_cursor_vec: Vec<u64> = species_ids
            .iter()
            .map(|&id| {
                let species = self.surface.species.iter().find(|s| s.species_id == id).expect("species present in surface");
                rng_cursor(&self.surface, species, eval_tick)
            })
            .collect();

        let extent = step.mul(Q16::from_int(dim as i32));
        let bounds = Aabb::new(tile_origin, Point::new(tile_origin.x + extent, tile_origin.y + extent, tile_origin.z + extent));

        self.capsules.push(AnimalCapsule {
            capsule_id: tile_id,
            bounds,
            species_ids,
            population_counts,
            energy_hist,
            age_hist,
            rng_cursor: rng_cursor_vec,
        })?;
        Ok(tile_id)
    }

    pub fn expand_tile(&mut self, tile_id: u64) -> Result<AnimalCapsule, CallerError> {
        self.capsules.remove_by_id(tile_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::climate::{ClimateDomain, SurfaceDesc as ClimateSurfaceDesc};
    use crate::domain::DomainPolicy;
    use crate::geology::{GeologyDomain, SurfaceDesc as GeologySurfaceDesc};
    use crate::terrain::{ShapeDesc, TerrainDomain};
    use crate::vegetation::VegetationSurfaceDesc;
    use crate::weather::{ScheduleDesc, WeatherDomain};

    fn shape() -> ShapeDesc {
        ShapeDesc { kind: ShapeKind::Sphere, radius_equatorial: Q16::from_int(1000), radius_polar: Q16::from_int(1000), slab_half_extent: Q16::ZERO, slab_half_thickness: Q16::ZERO }
    }

    fn domain() -> AnimalDomain {
        let bounds = Aabb::new(Point::new(Q16::from_int(-2000), Q16::from_int(-2000), Q16::from_int(-2000)), Point::new(Q16::from_int(2000), Q16::from_int(2000), Q16::from_int(2000)));
        let policy = DomainPolicy::default_with_tile_size(Q16::from_int(16));

        let mut terrain_surface = crate::terrain::SurfaceDesc::init(1, 42);
        terrain_surface.shape = shape();
        let terrain = TerrainDomain::domain_init(terrain_surface, policy, bounds, 8, 8);

        let mut climate_surface = ClimateSurfaceDesc::init(2, 42);
        climate_surface.shape = shape();
        let climate = ClimateDomain::domain_init(climate_surface, policy, bounds, 8, 8);

        let schedule = ScheduleDesc::init();
        let weather = WeatherDomain::domain_init(ClimateDomain::domain_init(climate_surface, policy, bounds, 8, 8), schedule, policy, 8, 8);

        let mut geology_surface = GeologySurfaceDesc::init(4, 42);
        geology_surface.shape = shape();
        let geology = GeologyDomain::domain_init(geology_surface, policy, bounds, 8, 8);

        let mut veg_surface = VegetationSurfaceDesc::init(5, 42);
        veg_surface.placement_cell_size = Q16::from_int(4);
        veg_surface.density_base = Q16::from_f64(0.8);
        veg_surface.species.push(crate::vegetation::SpeciesDesc::init(1));
        let vegetation = VegetationDomain::domain_init(veg_surface, terrain, climate, weather, geology, policy, 8, 8);

        let mut surface = AnimalSurfaceDesc::init(6, 42);
        surface.placement_cell_size = Q16::from_int(8);
        surface.density_base = Q16::from_f64(0.5);
        surface.species.push(SpeciesDesc::init(1));

        AnimalDomain::domain_init(surface, vegetation, policy, 8, 8)
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
    fn on_surface_sample_succeeds() {
        let mut d = domain();
        let mut budget = Budget::new(200_000);
        let point = Point::new(Q16::from_int(1000), Q16::ZERO, Q16::ZERO);
        let sample = d.sample_query(point, 0, &mut budget);
        assert_eq!(sample.meta.status, Status::Ok);
    }

    #[test]
    fn range_factor_is_one_at_midpoint() {
        assert_eq!(range_factor(Q16::from_f64(0.5), Q16::ZERO, Q16::ONE), Q16::ONE);
    }

    #[test]
    fn diet_allows_universal_when_species_has_no_diet_list() {
        let species = SpeciesDesc::init(1);
        assert!(diet_allows(&species, None));
    }

    #[test]
    fn diet_rejects_when_no_matching_instance_present() {
        let mut species = SpeciesDesc::init(1);
        species.diet_species = vec![7];
        assert!(!diet_allows(&species, None));
    }

    #[test]
    fn hist_bin_animal_covers_full_unit_range() {
        assert_eq!(hist_bin_animal(Q16::ZERO), 0);
        assert_eq!(hist_bin_animal(Q16::ONE), HIST_BINS - 1);
    }

    #[test]
    fn hist_ratio_handles_zero_total() {
        assert_eq!(hist_ratio(0, 0), Q16::ZERO);
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
    fn window_start_snaps_to_period_boundary() {
        assert_eq!(window_start(125, 120), 120);
        assert_eq!(window_start(119, 120), 0);
        assert_eq!(window_start(10, 0), 10);
    }

    #[test]
    fn validate_rejects_too_many_species() {
        let mut surface = AnimalSurfaceDesc::init(1, 1);
        for i in 0..(MAX_SPECIES as u32 + 1) {
            surface.species.push(SpeciesDesc::init(i));
        }
        assert!(surface.validate().is_err());
    }

    #[test]
    fn spawn_period_falls_back_through_gestation_lifespan_decision() {
        let mut surface = AnimalSurfaceDesc::init(1, 1);
        surface.decision_period_ticks = 50;
        let mut species = SpeciesDesc::init(1);
        species.reproduction.gestation_ticks = 0;
        species.lifespan_ticks = 0;
        assert_eq!(spawn_period(&surface, &species), 50);
        species.lifespan_ticks = 300;
        assert_eq!(spawn_period(&surface, &species), 300);
        species.reproduction.gestation_ticks = 200;
        assert_eq!(spawn_period(&surface, &species), 200);
    }
}
