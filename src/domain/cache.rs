//! LRU tile cache (§3, §4.3): fixed-capacity array, linear-scan lookup,
//! `last_used`/`insert_order` eviction tie-break.

use super::tier::Tier;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub domain_id: u64,
    pub tile_id: u64,
    pub resolution: Tier,
    pub authoring_version: u64,
    /// `(window_start, window_ticks)` for time-varying providers
    /// (vegetation, animal). `None` for spatially-keyed-only providers
    /// (terrain, climate, geology). Weather keys on `(domain, window_id,
    /// authoring_version)` and uses its own event-list cache, not this type.
    pub window: Option<(i64, u32)>,
}

struct Slot<T> {
    key: CacheKey,
    tile: T,
    last_used: u64,
    insert_order: u64,
}

pub struct TileCache<T> {
    capacity: usize,
    slots: Vec<Slot<T>>,
    use_counter: u64,
    next_insert_order: u64,
}

impl<T> TileCache<T> {
    pub fn new(capacity: usize) -> Self {
        TileCache { capacity, slots: Vec::new(), use_counter: 0, next_insert_order: 0 }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Linear scan for a matching key. On hit, bumps `last_used` so this
    /// slot survives longer under LRU eviction.
    pub fn get(&mut self, key: &CacheKey) -> Option<&T> {
        self.use_counter += 1;
        let uc = self.use_counter;
        let idx = self.slots.iter().position(|s| &s.key == key)?;
        self.slots[idx].last_used = uc;
        tracing::debug!(tile_id = key.tile_id, resolution = ?key.resolution, "tile cache hit");
        Some(&self.slots[idx].tile)
    }

    /// Insert a freshly-built tile, evicting the LRU slot if at capacity.
    /// Unlike `get`, insertion does not advance `use_counter` — a tile that
    /// is inserted and never subsequently read keeps `last_used == 0`, which
    /// is what makes the `insert_order` tie-break observable at all (see
    /// `eviction_ties_break_on_oldest_insert_order` below).
    pub fn insert(&mut self, key: CacheKey, tile: T) {
        let order = self.next_insert_order;
        self.next_insert_order += 1;

        if self.slots.len() < self.capacity {
            self.slots.push(Slot { key, tile, last_used: 0, insert_order: order });
            return;
        }

        let evict_idx = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| (s.last_used, s.insert_order))
            .map(|(i, _)| i)
            .expect("capacity > 0 implies at least one slot when full");
        tracing::debug!(
            evicted_tile_id = self.slots[evict_idx].key.tile_id,
            inserted_tile_id = key.tile_id,
            "evicting lru tile cache slot"
        );
        self.slots[evict_idx] = Slot { key, tile, last_used: 0, insert_order: order };
    }

    /// Sweep the array, freeing every entry for `domain_id`.
    pub fn invalidate_domain(&mut self, domain_id: u64) {
        self.slots.retain(|s| s.key.domain_id != domain_id);
    }

    /// Free any cache entries whose `tile_id` matches, regardless of other
    /// key components (resolution, window). Used by `collapse_tile`.
    pub fn invalidate_tile(&mut self, tile_id: u64) {
        self.slots.retain(|s| s.key.tile_id != tile_id);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
