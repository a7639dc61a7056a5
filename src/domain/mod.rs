//! Common domain framework (§3, §4.2, §4.3, §4.10): the resolution ladder,
//! budget, LRU tile cache, capsule array, and query-meta types shared by
//! every provider domain.

pub mod budget;
pub mod cache;
pub mod capsule;
pub mod existence;
pub mod ladder;
pub mod meta;
pub mod policy;
pub mod tier;

pub use budget::Budget;
pub use cache::{CacheKey, TileCache};
pub use capsule::{Capsule, CapsuleArray};
pub use existence::{ArchivalState, ExistenceState};
pub use ladder::{pre_ladder_check, run_ladder, LadderSuccess, PreLadderOutcome, TiledInfo};
pub use meta::{Confidence, QueryMeta, RefusalReason, Status};
pub use policy::DomainPolicy;
pub use tier::Tier;

/// Domain, tile, and capsule ids are plain 64-bit hashes (§3); no newtype
/// wrapper is introduced since every provider passes them around as bare
/// `u64`s at its external interface (§6).
pub type DomainId = u64;
pub type TileId = u64;
pub type CapsuleId = u64;
