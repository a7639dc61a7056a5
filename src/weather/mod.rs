//! Weather provider (§4.6): short-lived point events (rain, snow, heatwave,
//! cold snap, wind shift) layered on top of climate's envelope fields.
//! Events are never stored; `event_build` reconstructs any single event from
//! its `(domain, event_type, event_index)` coordinate on demand, the same
//! stream-reseeding trick terrain/climate use for noise (§4.1). Macro-capsules
//! here summarize a *time window*, not a tile — weather has no spatial
//! resolution ladder of its own, only climate's.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::climate::{ClimateDomain, ClimateFlags, ClimateSample, SurfaceDesc as ClimateSurfaceDesc, WindDir};
use crate::domain::{ArchivalState, Budget, Confidence, DomainPolicy, ExistenceState, QueryMeta, RefusalReason, Status, Tier};
use crate::error::CallerError;
use crate::fixed::{FieldValue, Point, Q16};
use crate::rng::{gen_index, gen_range_q16, hash_u64s, StreamKey};
use crate::terrain::{LatLon, ShapeDesc, ShapeKind, SurfaceDesc as TerrainSurfaceDesc};

use bitflags::bitflags;

const MAX_EVENTS_PER_QUERY: usize = 64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WeatherFlags: u32 {
        const FIELDS_UNKNOWN = 1 << 0;
        const WIND_UNKNOWN   = 1 << 1;
        const EVENTS_UNKNOWN = 1 << 2;
        const COLLAPSED      = 1 << 3;
    }
}

/// One of the five recurring event kinds, per `weather_fields.h`'s
/// `dom_weather_event_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Rain,
    Snow,
    Heatwave,
    ColdSnap,
    WindShift,
}

impl EventType {
    pub const ALL: [EventType; 5] = [EventType::Rain, EventType::Snow, EventType::Heatwave, EventType::ColdSnap, EventType::WindShift];

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            EventType::Rain => "rain",
            EventType::Snow => "snow",
            EventType::Heatwave => "heatwave",
            EventType::ColdSnap => "cold_snap",
            EventType::WindShift => "wind_shift",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventProfile {
    pub period_ticks: u64,
    pub duration_ticks: u64,
    pub intensity_min: Q16,
    pub intensity_max: Q16,
    pub radius_ratio_min: Q16,
    pub radius_ratio_max: Q16,
    pub temp_scale: Q16,
    pub precip_scale: Q16,
    pub wetness_scale: Q16,
}

impl EventProfile {
    fn valid(&self) -> bool {
        self.period_ticks != 0 && self.duration_ticks != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleDesc {
    pub seed: u64,
    pub profiles: [EventProfile; 5],
}

impl ScheduleDesc {
    /// `dom_weather_surface_desc_init`'s per-event-type defaults: a shared
    /// baseline intensity/radius band, then per-type period, duration, and
    /// field-scale overrides.
    pub fn init() -> Self {
        let base = EventProfile {
            period_ticks: 0,
            duration_ticks: 0,
            intensity_min: Q16::from_ratio(1, 5),
            intensity_max: Q16::from_ratio(4, 5),
            radius_ratio_min: Q16::from_ratio(1, 10),
            radius_ratio_max: Q16::from_ratio(2, 5),
            temp_scale: Q16::ZERO,
            precip_scale: Q16::ZERO,
            wetness_scale: Q16::ZERO,
        };
        ScheduleDesc {
            seed: 0,
            profiles: [
                EventProfile { period_ticks: 240, duration_ticks: 80, temp_scale: Q16::from_ratio(1, 10), precip_scale: Q16::from_ratio(4, 5), wetness_scale: Q16::from_ratio(7, 10), ..base },
                EventProfile { period_ticks: 300, duration_ticks: 90, temp_scale: Q16::from_ratio(3, 10), precip_scale: Q16::from_ratio(7, 10), wetness_scale: Q16::from_ratio(3, 5), ..base },
                EventProfile { period_ticks: 420, duration_ticks: 120, temp_scale: Q16::from_ratio(3, 5), precip_scale: Q16::ZERO, wetness_scale: Q16::ZERO, ..base },
                EventProfile { period_ticks: 360, duration_ticks: 100, temp_scale: Q16::from_ratio(3, 5), precip_scale: Q16::ZERO, wetness_scale: Q16::ZERO, ..base },
                EventProfile { period_ticks: 200, duration_ticks: 60, temp_scale: Q16::ZERO, precip_scale: Q16::ZERO, wetness_scale: Q16::ZERO, ..base },
            ],
        }
    }

    fn profile(&self, event_type: EventType) -> &EventProfile {
        &self.profiles[event_type.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeatherEvent {
    pub event_id: u64,
    pub event_type: EventType,
    pub domain_id: u64,
    pub start_tick: u64,
    pub duration_ticks: u64,
    pub intensity: Q16,
    pub center: Point,
    pub radius: Q16,
    pub wind_dir: WindDir,
}

/// The wind-direction roll for a WIND_SHIFT event: `draw % 8` maps onto the
/// compass directions in their enum declaration order. Distinct from
/// `climate::WindDir::from_sector`'s geometric sector-rotation lookup — this
/// one has no geographic meaning, it is a bare random pick.
fn roll_wind_dir(rng: &mut ChaCha8Rng) -> WindDir {
    const DIRS: [WindDir; 8] = [
        WindDir::North,
        WindDir::Northeast,
        WindDir::East,
        WindDir::Southeast,
        WindDir::South,
        WindDir::Southwest,
        WindDir::West,
        WindDir::Northwest,
    ];
    DIRS[gen_index(rng, 8) as usize]
}

/// A world-unit scale factor for radius/center draws: the shape's own
/// characteristic extent, falling back to 256 when the shape carries no
/// usable extent (a zero-radius placeholder shape, say).
fn shape_scale(shape: &ShapeDesc) -> Q16 {
    match shape.kind {
        ShapeKind::Slab => {
            if shape.slab_half_extent.raw() > 0 { shape.slab_half_extent } else { Q16::from_int(256) }
        }
        _ => {
            let r = shape.radius_equatorial.max(shape.radius_polar);
            if r.raw() > 0 { r } else { Q16::from_int(256) }
        }
    }
}

fn rng_for_event(climate_surface: &ClimateSurfaceDesc, schedule: &ScheduleDesc, domain_id: u64, event_type: EventType, event_index: u64) -> ChaCha8Rng {
    let stream_name = format!("noise.stream.weather.{}.{}", domain_id, event_type.name());
    StreamKey {
        world_seed: climate_surface.world_seed ^ schedule.seed,
        domain_id,
        process_id: 0,
        tick_or_index: event_index,
        stream_name: &stream_name,
    }
    .rng()
}

/// An event's center point: a `(x, y)` offset for SLAB shapes, or a
/// lat/lon draw converted through the shared terrain/climate shape for
/// SPHERE/OBLATE, mirroring `dom_weather_event_build`'s two branches.
fn event_center(climate_surface: &ClimateSurfaceDesc, rng: &mut ChaCha8Rng) -> Point {
    let shape = &climate_surface.shape;
    match shape.kind {
        ShapeKind::Slab => {
            let span = Q16::from_int(2).mul(shape_scale(shape));
            let rx = gen_range_q16(rng, Q16::ZERO, Q16::ONE).sub(Q16::HALF).mul(span);
            let ry = gen_range_q16(rng, Q16::ZERO, Q16::ONE).sub(Q16::HALF).mul(span);
            Point::new(rx, ry, Q16::ZERO)
        }
        _ => {
            let rlat = gen_range_q16(rng, Q16::ZERO, Q16::ONE).mul(Q16::from_ratio(1, 2)).sub(Q16::from_ratio(1, 4));
            let rlon = gen_range_q16(rng, Q16::ZERO, Q16::ONE).sub(Q16::HALF);
            let terrain_surface = TerrainSurfaceDesc {
                domain_id: climate_surface.domain_id,
                world_seed: climate_surface.world_seed,
                meters_per_unit: climate_surface.meters_per_unit,
                shape: climate_surface.shape,
                ..TerrainSurfaceDesc::init(climate_surface.domain_id, climate_surface.world_seed)
            };
            terrain_surface.latlon_to_local(LatLon { latitude_turns: rlat, longitude_turns: rlon, altitude: Q16::ZERO })
        }
    }
}

fn event_radius(profile: &EventProfile, climate_surface: &ClimateSurfaceDesc, rng: &mut ChaCha8Rng) -> Q16 {
    let ratio = gen_range_q16(rng, profile.radius_ratio_min, profile.radius_ratio_max);
    ratio.mul(shape_scale(&climate_surface.shape))
}

/// `dom_weather_event_build`: lazily reconstructs the one event at
/// `(event_type, event_index)`, deterministically, from the stream seeded by
/// `(world_seed ^ schedule.seed, domain_id, 0, event_index, stream_name)`.
fn event_build(schedule: &ScheduleDesc, climate_surface: &ClimateSurfaceDesc, domain_id: u64, event_type: EventType, event_index: u64) -> Option<WeatherEvent> {
    let profile = schedule.profile(event_type);
    if !profile.valid() {
        return None;
    }
    let duration_ticks = profile.duration_ticks.min(profile.period_ticks);
    let jitter_max = profile.period_ticks - duration_ticks;
    let mut rng = rng_for_event(climate_surface, schedule, domain_id, event_type, event_index);
    let jitter = if jitter_max > 0 { rng.gen_range(0..=jitter_max) } else { 0 };
    let intensity = gen_range_q16(&mut rng, profile.intensity_min, profile.intensity_max);
    let center = event_center(climate_surface, &mut rng);
    let radius = event_radius(profile, climate_surface, &mut rng);
    let wind_dir = if event_type == EventType::WindShift { roll_wind_dir(&mut rng) } else { WindDir::Unknown };
    let start_tick = event_index.saturating_mul(profile.period_ticks).saturating_add(jitter);
    let event_id = hash_u64s(&[domain_id, event_type.index() as u64, start_tick]);
    Some(WeatherEvent { event_id, event_type, domain_id, start_tick, duration_ticks, intensity, center, radius, wind_dir })
}

fn point_within_radius(point: Point, center: Point, radius: Q16) -> bool {
    if radius.raw() <= 0 {
        return false;
    }
    let dx = (point.x.raw() - center.x.raw()) as i64;
    let dy = (point.y.raw() - center.y.raw()) as i64;
    let dz = (point.z.raw() - center.z.raw()) as i64;
    let dist2 = dx * dx + dy * dy + dz * dz;
    let r = radius.raw() as i64;
    dist2 <= r * r
}

/// `dom_weather_event_active_at`: the event (if any) of `event_type` whose
/// occurrence at `tick` covers both the tick and, if given, the point.
fn event_active_at(schedule: &ScheduleDesc, climate_surface: &ClimateSurfaceDesc, domain_id: u64, event_type: EventType, tick: u64, point: Option<Point>) -> Option<WeatherEvent> {
    let profile = schedule.profile(event_type);
    if !profile.valid() {
        return None;
    }
    let event_index = tick / profile.period_ticks;
    let event = event_build(schedule, climate_surface, domain_id, event_type, event_index)?;
    if tick < event.start_tick || tick >= event.start_tick.saturating_add(event.duration_ticks) {
        return None;
    }
    if let Some(p) = point {
        if !point_within_radius(p, event.center, event.radius) {
            return None;
        }
    }
    Some(event)
}

fn window_overlaps(event_start: u64, event_duration: u64, window_start: u64, window_ticks: u32) -> bool {
    let event_end = event_start.saturating_add(event_duration);
    let window_end = window_start.saturating_add(window_ticks as u64);
    event_start < window_end && event_end > window_start
}

/// `dom_weather_apply_event`: additively perturbs the running sample per
/// event type, scaled by `intensity * profile.<field>_scale` against the
/// climate envelope's own range for that field.
fn apply_event(event: &WeatherEvent, profile: &EventProfile, climate: &ClimateSample, sample: &mut WeatherSample) {
    let temp_range = climate.temperature_range.unwrap_or(Q16::ZERO);
    let precip_range = climate.precipitation_range.unwrap_or(Q16::ZERO);
    let temp_delta = temp_range.mul(event.intensity).mul(profile.temp_scale);
    let precip_delta = precip_range.mul(event.intensity).mul(profile.precip_scale);
    let wetness_delta = event.intensity.mul(profile.wetness_scale);

    let temperature_current = sample.temperature_current.unwrap_or(Q16::ZERO);
    let precipitation_current = sample.precipitation_current.unwrap_or(Q16::ZERO);
    let surface_wetness = sample.surface_wetness.unwrap_or(Q16::ZERO);

    match event.event_type {
        EventType::Rain => {
            sample.precipitation_current = FieldValue::Known(precipitation_current + precip_delta);
            sample.surface_wetness = FieldValue::Known(surface_wetness + wetness_delta);
        }
        EventType::Snow => {
            sample.precipitation_current = FieldValue::Known(precipitation_current + precip_delta);
            sample.temperature_current = FieldValue::Known(temperature_current - temp_delta);
            sample.surface_wetness = FieldValue::Known(surface_wetness + wetness_delta);
        }
        EventType::Heatwave => {
            sample.temperature_current = FieldValue::Known(temperature_current + temp_delta);
        }
        EventType::ColdSnap => {
            sample.temperature_current = FieldValue::Known(temperature_current - temp_delta);
        }
        EventType::WindShift => {
            if event.wind_dir != WindDir::Unknown {
                sample.wind_current = event.wind_dir;
                sample.flags.remove(WeatherFlags::WIND_UNKNOWN);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeatherSample {
    pub temperature_current: FieldValue,
    pub precipitation_current: FieldValue,
    pub surface_wetness: FieldValue,
    pub wind_current: WindDir,
    pub active_event_mask: u32,
    pub active_event_count: u32,
    pub flags: WeatherFlags,
    pub meta: QueryMeta,
}

impl WeatherSample {
    fn refused(reason: RefusalReason, budget: &Budget, cost_units: u32) -> Self {
        WeatherSample {
            temperature_current: FieldValue::Unknown,
            precipitation_current: FieldValue::Unknown,
            surface_wetness: FieldValue::Unknown,
            wind_current: WindDir::Unknown,
            active_event_mask: 0,
            active_event_count: 0,
            flags: WeatherFlags::FIELDS_UNKNOWN | WeatherFlags::WIND_UNKNOWN | WeatherFlags::EVENTS_UNKNOWN,
            meta: QueryMeta::refused(reason, budget, cost_units),
        }
    }
}

/// A macro-capsule summarizing a collapsed time window: per-event-type
/// counts and a 4-bin intensity-ratio histogram, plus cumulative
/// precipitation/temperature-deviation totals. `next_event_index` stands in
/// for `dom_weather_capsule_t`'s raw RNG-cursor register, which has no
/// counterpart for `ChaCha8Rng`'s opaque internal state — it instead records
/// the `event_index` sampling would resume from per type once this window
/// expands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeatherCapsule {
    pub window_id: u64,
    pub start_tick: u64,
    pub window_ticks: u32,
    pub cumulative_precip: i64,
    pub cumulative_temp_dev: i64,
    pub event_counts: [u32; 5],
    pub intensity_hist: [[Q16; 4]; 5],
    pub next_event_index: [u64; 5],
}

/// The `*3>>16` bucketing (distinct from climate/geology's `*4>>16`
/// `hist_bin`): `DOM_WEATHER_HIST_BINS` is 4, and the original scales by
/// `BINS - 1` rather than `BINS`.
fn hist_bin_weather(value: Q16) -> usize {
    let scaled = value.clamp(Q16::ZERO, Q16::ONE).mul(Q16::from_int(3)).raw();
    ((scaled >> 16) as usize).min(3)
}

fn hist_ratio(count: u32, total: u32) -> Q16 {
    if total == 0 { Q16::ZERO } else { Q16::from_ratio(count as i32, total as i32) }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EventCacheKey {
    domain_id: u64,
    window_id: u64,
    authoring_version: u64,
}

struct EventCacheSlot {
    key: EventCacheKey,
    events: Vec<WeatherEvent>,
    last_used: u64,
    insert_order: u64,
}

/// A dedicated LRU cache for time-windowed event lists, mirroring
/// `domain::cache::TileCache`'s linear-scan `(last_used, insert_order)`
/// eviction tie-break, but keyed on `(domain, window_id, authoring_version)`
/// rather than `(domain, tile, resolution, authoring_version)` — weather has
/// no spatial tiling of its own, only a time window (see
/// `domain::cache::CacheKey`'s doc comment, which calls this out by name).
struct EventCache {
    capacity: usize,
    slots: Vec<EventCacheSlot>,
    use_counter: u64,
    next_insert_order: u64,
}

impl EventCache {
    fn new(capacity: usize) -> Self {
        EventCache { capacity, slots: Vec::new(), use_counter: 0, next_insert_order: 0 }
    }

    fn get(&mut self, key: &EventCacheKey) -> Option<&Vec<WeatherEvent>> {
        self.use_counter += 1;
        let uc = self.use_counter;
        let idx = self.slots.iter().position(|s| &s.key == key)?;
        self.slots[idx].last_used = uc;
        Some(&self.slots[idx].events)
    }

    fn insert(&mut self, key: EventCacheKey, events: Vec<WeatherEvent>) {
        let order = self.next_insert_order;
        self.next_insert_order += 1;
        if self.slots.len() < self.capacity {
            self.slots.push(EventCacheSlot { key, events, last_used: 0, insert_order: order });
            return;
        }
        let evict_idx = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| (s.last_used, s.insert_order))
            .map(|(i, _)| i)
            .expect("capacity > 0 implies at least one slot when full");
        self.slots[evict_idx] = EventCacheSlot { key, events, last_used: 0, insert_order: order };
    }

    fn clear(&mut self) {
        self.slots.clear();
    }
}

pub struct WeatherDomain {
    climate: ClimateDomain,
    schedule: ScheduleDesc,
    policy: DomainPolicy,
    existence: ExistenceState,
    archival: ArchivalState,
    authoring_version: u64,
    cache: EventCache,
    capsules: Vec<WeatherCapsule>,
    capsule_capacity: usize,
}

impl WeatherDomain {
    pub fn domain_init(climate: ClimateDomain, schedule: ScheduleDesc, policy: DomainPolicy, cache_capacity: usize, capsule_capacity: usize) -> Self {
        WeatherDomain {
            climate,
            schedule,
            policy,
            existence: ExistenceState::Declared,
            archival: ArchivalState::Live,
            authoring_version: 0,
            cache: EventCache::new(cache_capacity),
            capsules: Vec::with_capacity(capsule_capacity),
            capsule_capacity,
        }
    }

    pub fn domain_free(&mut self) {
        self.climate.domain_free();
        self.cache.clear();
    }

    pub fn domain_set_state(&mut self, existence: ExistenceState, archival: ArchivalState) {
        self.existence = existence;
        self.archival = archival;
        self.climate.domain_set_state(existence, archival);
    }

    /// Sets a new policy on both this domain and its climate sub-domain,
    /// invalidating both caches.
    pub fn domain_set_policy(&mut self, policy: DomainPolicy) {
        self.policy = policy;
        self.climate.domain_set_policy(policy);
        self.authoring_version += 1;
        self.cache.clear();
    }

    pub fn capsule_count(&self) -> usize {
        self.capsules.len()
    }

    pub fn capsule_at(&self, index: usize) -> Option<&WeatherCapsule> {
        self.capsules.get(index)
    }

    fn domain_id(&self) -> u64 {
        self.climate.surface().domain_id
    }

    fn domain_collapsed(&self, tick: u64) -> bool {
        self.capsules.iter().any(|c| tick >= c.start_tick && tick < c.start_tick.saturating_add(c.window_ticks as u64))
    }

    /// `dom_weather_events_at`: every event of any type active at `(point,
    /// tick)`, capped at `MAX_EVENTS_PER_QUERY`.
    pub fn events_at(&self, point: Point, tick: u64) -> Vec<WeatherEvent> {
        let surface = self.climate.surface();
        let domain_id = surface.domain_id;
        let mut events = Vec::new();
        for event_type in EventType::ALL {
            if events.len() >= MAX_EVENTS_PER_QUERY {
                break;
            }
            if let Some(event) = event_active_at(&self.schedule, &surface, domain_id, event_type, tick, Some(point)) {
                events.push(event);
            }
        }
        events
    }

    /// `dom_weather_events_in_window`: every event of any type overlapping
    /// `[window_start, window_start+window_ticks)`, cache-checked first.
    pub fn events_in_window(&mut self, window_start: u64, window_ticks: u32) -> Vec<WeatherEvent> {
        let domain_id = self.domain_id();
        let window_id = crate::domain::ladder::window_id_hash(window_start as i64, window_ticks);
        let key = EventCacheKey { domain_id, window_id, authoring_version: self.authoring_version };
        if let Some(events) = self.cache.get(&key) {
            return events.clone();
        }

        let surface = self.climate.surface();
        let mut events = Vec::new();
        let mut truncated = false;
        'outer: for event_type in EventType::ALL {
            let profile = self.schedule.profile(event_type);
            if !profile.valid() {
                continue;
            }
            let first_index = window_start / profile.period_ticks;
            let last_index = window_start.saturating_add(window_ticks as u64).saturating_sub(1) / profile.period_ticks;
            for event_index in first_index..=last_index {
                if events.len() >= MAX_EVENTS_PER_QUERY {
                    truncated = true;
                    break 'outer;
                }
                if let Some(event) = event_build(&self.schedule, &surface, domain_id, event_type, event_index) {
                    if window_overlaps(event.start_tick, event.duration_ticks, window_start, window_ticks) {
                        events.push(event);
                    }
                }
            }
        }
        if truncated {
            tracing::warn!(domain_id, window_start, window_ticks, "weather event window truncated at capacity");
        }
        self.cache.insert(key, events.clone());
        events
    }

    /// `dom_weather_sample_query`: domain-active and time-collapse checks,
    /// then delegates to the climate sub-domain and layers active events on
    /// top, clamping to climate's own mean±range envelope.
    pub fn sample_query(&mut self, point: Point, tick: u64, budget: &mut Budget) -> WeatherSample {
        let used_before = budget.used_units;
        if !self.existence.is_active(self.archival) {
            return WeatherSample::refused(RefusalReason::DomainInactive, budget, budget.used_units - used_before);
        }
        if self.domain_collapsed(tick) {
            return WeatherSample {
                temperature_current: FieldValue::Unknown,
                precipitation_current: FieldValue::Unknown,
                surface_wetness: FieldValue::Unknown,
                wind_current: WindDir::Unknown,
                active_event_mask: 0,
                active_event_count: 0,
                flags: WeatherFlags::FIELDS_UNKNOWN | WeatherFlags::WIND_UNKNOWN | WeatherFlags::EVENTS_UNKNOWN | WeatherFlags::COLLAPSED,
                meta: QueryMeta::ok(Tier::Analytic, Confidence::Unknown, RefusalReason::Collapsed, budget, budget.used_units - used_before),
            };
        }

        let climate = self.climate.sample_query(point, budget);
        if climate.meta.status == Status::Refused || climate.flags.contains(ClimateFlags::FIELDS_UNKNOWN) {
            let mut flags = WeatherFlags::FIELDS_UNKNOWN | WeatherFlags::EVENTS_UNKNOWN;
            if climate.flags.contains(ClimateFlags::WIND_UNKNOWN) {
                flags |= WeatherFlags::WIND_UNKNOWN;
            }
            return WeatherSample {
                temperature_current: FieldValue::Unknown,
                precipitation_current: FieldValue::Unknown,
                surface_wetness: FieldValue::Unknown,
                wind_current: WindDir::Unknown,
                active_event_mask: 0,
                active_event_count: 0,
                flags,
                meta: climate.meta,
            };
        }

        if !budget.consume(self.policy.cost_for(Tier::Analytic)) {
            return WeatherSample::refused(RefusalReason::Budget, budget, budget.used_units - used_before);
        }

        let mut flags = WeatherFlags::empty();
        let wind_current = if climate.flags.contains(ClimateFlags::WIND_UNKNOWN) {
            flags |= WeatherFlags::WIND_UNKNOWN;
            WindDir::Unknown
        } else {
            climate.wind_prevailing
        };

        let mut sample = WeatherSample {
            temperature_current: climate.temperature_mean,
            precipitation_current: climate.precipitation_mean,
            surface_wetness: FieldValue::Known(Q16::ZERO),
            wind_current,
            active_event_mask: 0,
            active_event_count: 0,
            flags,
            meta: QueryMeta::ok(climate.meta.resolution, climate.meta.confidence, RefusalReason::None, budget, budget.used_units - used_before),
        };

        let surface = self.climate.surface();
        let domain_id = surface.domain_id;
        for event_type in EventType::ALL {
            let profile = self.schedule.profile(event_type);
            if let Some(event) = event_active_at(&self.schedule, &surface, domain_id, event_type, tick, Some(point)) {
                sample.active_event_mask |= 1 << event_type.index();
                sample.active_event_count += 1;
                apply_event(&event, profile, &climate, &mut sample);
            }
        }

        let temp_mean = climate.temperature_mean.unwrap_or(Q16::ZERO);
        let temp_range = climate.temperature_range.unwrap_or(Q16::ZERO);
        let precip_mean = climate.precipitation_mean.unwrap_or(Q16::ZERO);
        let precip_range = climate.precipitation_range.unwrap_or(Q16::ZERO);

        let temp = sample.temperature_current.unwrap_or(Q16::ZERO).clamp(temp_mean - temp_range, temp_mean + temp_range);
        let precip_max = (precip_mean + precip_range).max(Q16::ZERO);
        let precip_min = (precip_mean - precip_range).max(Q16::ZERO);
        let precip = sample.precipitation_current.unwrap_or(Q16::ZERO).clamp(precip_min, precip_max);

        let base_wetness = if precip_max.raw() > 0 { precip.div(precip_max) } else { Q16::ZERO };
        let wetness = (base_wetness + sample.surface_wetness.unwrap_or(Q16::ZERO)).clamp(Q16::ZERO, Q16::ONE);

        sample.temperature_current = FieldValue::Known(temp);
        sample.precipitation_current = FieldValue::Known(precip);
        sample.surface_wetness = FieldValue::Known(wetness);

        sample
    }

    /// `dom_weather_domain_collapse_window`: builds the window's event list,
    /// accumulates per-type counts/intensity histograms/cumulative totals,
    /// and appends a macro-capsule.
    pub fn collapse_window(&mut self, window_start: u64, window_ticks: u32) -> Result<u64, CallerError> {
        if self.capsules.len() >= self.capsule_capacity {
            tracing::warn!(capacity = self.capsule_capacity, "weather capsule array full");
            return Err(CallerError::CapsuleArrayFull);
        }
        let window_id = crate::domain::ladder::window_id_hash(window_start as i64, window_ticks);
        let events = self.events_in_window(window_start, window_ticks);

        let mut event_counts = [0u32; 5];
        let mut intensity_values: [Vec<Q16>; 5] = [Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new()];
        let (mut cumulative_precip, mut cumulative_temp_dev) = (0i64, 0i64);
        for event in &events {
            let idx = event.event_type.index();
            event_counts[idx] += 1;
            intensity_values[idx].push(event.intensity);
            let profile = self.schedule.profile(event.event_type);
            match event.event_type {
                EventType::Rain | EventType::Snow => cumulative_precip += profile.precip_scale.mul(event.intensity).raw() as i64,
                EventType::Heatwave => cumulative_temp_dev += profile.temp_scale.mul(event.intensity).raw() as i64,
                EventType::ColdSnap => cumulative_temp_dev -= profile.temp_scale.mul(event.intensity).raw() as i64,
                EventType::WindShift => {}
            }
        }

        let mut intensity_hist = [[Q16::ZERO; 4]; 5];
        for idx in 0..5 {
            let mut bins = [0u32; 4];
            for &v in &intensity_values[idx] {
                bins[hist_bin_weather(v)] += 1;
            }
            let total = event_counts[idx];
            for bin in 0..4 {
                intensity_hist[idx][bin] = hist_ratio(bins[bin], total);
            }
        }

        let mut next_event_index = [0u64; 5];
        for event_type in EventType::ALL {
            let profile = self.schedule.profile(event_type);
            if profile.valid() {
                next_event_index[event_type.index()] = window_start.saturating_add(window_ticks as u64) / profile.period_ticks;
            }
        }

        self.capsules.push(WeatherCapsule {
            window_id,
            start_tick: window_start,
            window_ticks,
            cumulative_precip,
            cumulative_temp_dev,
            event_counts,
            intensity_hist,
            next_event_index,
        });
        Ok(window_id)
    }

    pub fn expand_window(&mut self, window_id: u64) -> Result<WeatherCapsule, CallerError> {
        match self.capsules.iter().position(|c| c.window_id == window_id) {
            Some(idx) => Ok(self.capsules.swap_remove(idx)),
            None => Err(CallerError::CapsuleNotFound(window_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::Aabb;

    fn default_bounds() -> Aabb {
        Aabb::new(
            Point::new(Q16::from_int(-1000), Q16::from_int(-1000), Q16::from_int(-1000)),
            Point::new(Q16::from_int(1000), Q16::from_int(1000), Q16::from_int(1000)),
        )
    }

    fn default_weather_domain() -> WeatherDomain {
        let policy = DomainPolicy::default_with_tile_size(Q16::from_int(16));
        let mut climate = ClimateDomain::domain_init(ClimateSurfaceDesc::init(1, 1), policy, default_bounds(), 8, 8);
        climate.domain_set_state(ExistenceState::Realized, ArchivalState::Live);
        let mut weather = WeatherDomain::domain_init(climate, ScheduleDesc::init(), policy, 8, 8);
        weather.domain_set_state(ExistenceState::Realized, ArchivalState::Live);
        weather
    }

    #[test]
    fn domain_inactive_refuses_before_everything_else() {
        let policy = DomainPolicy::default_with_tile_size(Q16::from_int(16));
        let climate = ClimateDomain::domain_init(ClimateSurfaceDesc::init(1, 1), policy, default_bounds(), 8, 8);
        let mut weather = WeatherDomain::domain_init(climate, ScheduleDesc::init(), policy, 8, 8);
        let mut budget = Budget::new(100);
        let sample = weather.sample_query(Point::ZERO, 0, &mut budget);
        assert_eq!(sample.meta.refusal_reason, RefusalReason::DomainInactive);
    }

    #[test]
    fn scenario_zero_budget_refuses() {
        let mut weather = default_weather_domain();
        let mut budget = Budget::new(0);
        let sample = weather.sample_query(Point::ZERO, 0, &mut budget);
        assert_eq!(sample.meta.status, Status::Refused);
        assert!(sample.flags.contains(WeatherFlags::FIELDS_UNKNOWN));
    }

    #[test]
    fn event_build_is_deterministic_across_reinit() {
        let schedule = ScheduleDesc::init();
        let surface = ClimateSurfaceDesc::init(1, 1);
        let a = event_build(&schedule, &surface, 1, EventType::Rain, 3).unwrap();
        let b = event_build(&schedule, &surface, 1, EventType::Rain, 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn event_duration_never_exceeds_period() {
        let schedule = ScheduleDesc::init();
        let surface = ClimateSurfaceDesc::init(1, 1);
        for event_type in EventType::ALL {
            let event = event_build(&schedule, &surface, 1, event_type, 0).unwrap();
            let profile = schedule.profile(event_type);
            assert!(event.duration_ticks <= profile.period_ticks);
        }
    }

    #[test]
    fn wind_shift_event_sets_a_known_direction() {
        let schedule = ScheduleDesc::init();
        let surface = ClimateSurfaceDesc::init(1, 1);
        let event = event_build(&schedule, &surface, 1, EventType::WindShift, 0).unwrap();
        assert_ne!(event.wind_dir, WindDir::Unknown);
    }

    #[test]
    fn non_wind_events_carry_no_wind_direction() {
        let schedule = ScheduleDesc::init();
        let surface = ClimateSurfaceDesc::init(1, 1);
        let event = event_build(&schedule, &surface, 1, EventType::Rain, 0).unwrap();
        assert_eq!(event.wind_dir, WindDir::Unknown);
    }

    #[test]
    fn event_active_at_respects_radius() {
        let schedule = ScheduleDesc::init();
        let surface = ClimateSurfaceDesc::init(1, 1);
        let event = event_build(&schedule, &surface, 1, EventType::Rain, 0).unwrap();
        let far = Point::new(event.center.x + event.radius + event.radius, event.center.y, event.center.z);
        assert!(event_active_at(&schedule, &surface, 1, EventType::Rain, event.start_tick, Some(far)).is_none());
        assert!(event_active_at(&schedule, &surface, 1, EventType::Rain, event.start_tick, Some(event.center)).is_some());
    }

    #[test]
    fn events_in_window_caches_and_matches_direct_scan() {
        let mut weather = default_weather_domain();
        let first = weather.events_in_window(0, 1000);
        let second = weather.events_in_window(0, 1000);
        assert_eq!(first, second);
    }

    #[test]
    fn collapse_then_expand_restores_capsule_count() {
        let mut weather = default_weather_domain();
        let before = weather.capsule_count();
        let window_id = weather.collapse_window(0, 1000).unwrap();
        assert_eq!(weather.capsule_count(), before + 1);
        weather.expand_window(window_id).unwrap();
        assert_eq!(weather.capsule_count(), before);
    }

    #[test]
    fn collapsed_window_reports_unknown_fields_and_events() {
        let mut weather = default_weather_domain();
        weather.collapse_window(0, 1000).unwrap();
        let mut budget = Budget::new(100);
        let sample = weather.sample_query(Point::ZERO, 500, &mut budget);
        assert!(sample.flags.contains(WeatherFlags::COLLAPSED));
        assert_eq!(sample.meta.refusal_reason, RefusalReason::Collapsed);
    }

    #[test]
    fn temperature_stays_within_climate_envelope() {
        let mut weather = default_weather_domain();
        let mut budget = Budget::new(10_000);
        for tick in (0..2000).step_by(97) {
            let sample = weather.sample_query(Point::new(Q16::from_int(100), Q16::ZERO, Q16::ZERO), tick, &mut budget);
            if sample.meta.status != Status::Ok {
                continue;
            }
            let t = sample.temperature_current.known().unwrap();
            assert!(t.raw() >= 0 && t.raw() <= Q16::ONE.raw());
        }
    }

    #[test]
    fn heatwave_event_raises_current_temperature_above_mean() {
        let mut s = ClimateSurfaceDesc::init(1, 1);
        s.anchor.mask = crate::climate::AnchorMask::TEMPERATURE_MEAN | crate::climate::AnchorMask::TEMPERATURE_RANGE;
        s.anchor.temperature_mean = Q16::from_f64(0.5);
        s.anchor.temperature_range = Q16::from_f64(0.3);
        let climate_fields = s.eval(Point::ZERO);
        let climate = ClimateSample {
            temperature_mean: FieldValue::Known(climate_fields.temperature_mean),
            temperature_range: FieldValue::Known(climate_fields.temperature_range),
            precipitation_mean: FieldValue::Known(climate_fields.precipitation_mean),
            precipitation_range: FieldValue::Known(climate_fields.precipitation_range),
            seasonality: FieldValue::Known(climate_fields.seasonality),
            wind_prevailing: climate_fields.wind_prevailing,
            flags: ClimateFlags::empty(),
            meta: QueryMeta::ok(Tier::Full, Confidence::Exact, RefusalReason::None, &Budget::new(10), 0),
        };
        let mut sample = WeatherSample {
            temperature_current: climate.temperature_mean,
            precipitation_current: climate.precipitation_mean,
            surface_wetness: FieldValue::Known(Q16::ZERO),
            wind_current: WindDir::Unknown,
            active_event_mask: 0,
            active_event_count: 0,
            flags: WeatherFlags::empty(),
            meta: QueryMeta::ok(Tier::Full, Confidence::Exact, RefusalReason::None, &Budget::new(10), 0),
        };
        let event = WeatherEvent {
            event_id: 1,
            event_type: EventType::Heatwave,
            domain_id: 1,
            start_tick: 0,
            duration_ticks: 10,
            intensity: Q16::ONE,
            center: Point::ZERO,
            radius: Q16::from_int(10),
            wind_dir: WindDir::Unknown,
        };
        let profile = *ScheduleDesc::init().profile(EventType::Heatwave);
        apply_event(&event, &profile, &climate, &mut sample);
        let t = sample.temperature_current.known().unwrap();
        assert!(t.raw() > climate.temperature_mean.known().unwrap().raw());
    }

    #[test]
    fn hist_bin_weather_covers_full_unit_range() {
        assert_eq!(hist_bin_weather(Q16::ZERO), 0);
        assert_eq!(hist_bin_weather(Q16::ONE), 3);
        assert_eq!(hist_bin_weather(Q16::from_f64(0.5)), 1);
    }

    #[test]
    fn hist_ratio_handles_zero_total() {
        assert_eq!(hist_ratio(0, 0), Q16::ZERO);
        assert_eq!(hist_ratio(2, 4), Q16::HALF);
    }
}
