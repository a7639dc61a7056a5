//! Domain policy (§3): tile size, resolution cap, per-tier costs and
//! sample densities, ray-marching parameters. Shared verbatim across all six
//! providers. Immutable after `set_policy`; setting a new policy invalidates
//! the owning domain's cache (enforced by each domain's `set_policy` method,
//! not here).

use crate::fixed::Q16;

use super::tier::Tier;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainPolicy {
    pub tile_size: Q16,
    pub max_resolution: Tier,
    /// Indexed by `Tier::rank()`. Only the MEDIUM/COARSE entries are
    /// meaningful (FULL/ANALYTIC are point evaluations), but all four tiers
    /// are represented for uniform indexing against `Tier::LADDER`.
    pub sample_dim: [u32; 4],
    pub cost: [u32; 4],
    pub tile_build_cost: [u32; 4],
    pub ray_step: Q16,
    pub max_ray_steps: u32,
}

impl DomainPolicy {
    pub fn default_with_tile_size(tile_size: Q16) -> Self {
        DomainPolicy {
            tile_size,
            max_resolution: Tier::Full,
            sample_dim: [1, 8, 4, 1],
            cost: [1, 2, 1, 1],
            tile_build_cost: [0, 64, 16, 0],
            ray_step: Q16::from_f64(0.25),
            max_ray_steps: 32,
        }
    }

    pub fn sample_dim_for(&self, tier: Tier) -> u32 {
        self.sample_dim[tier.rank() as usize]
    }

    pub fn cost_for(&self, tier: Tier) -> u32 {
        self.cost[tier.rank() as usize]
    }

    pub fn tile_build_cost_for(&self, tier: Tier) -> u32 {
        self.tile_build_cost[tier.rank() as usize]
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        if self.tile_size.raw() <= 0 {
            errors.push(format!(
                "tile_size must be > 0, got {}. Example: tile_size = Q16::from_int(16)",
                self.tile_size.to_f64()
            ));
        }
        if self.max_ray_steps == 0 {
            errors.push("max_ray_steps must be > 0, got 0. Example: max_ray_steps = 32".to_string());
        }
        if self.ray_step.raw() <= 0 {
            errors.push(format!(
                "ray_step must be > 0, got {}. Example: ray_step = Q16::from_f64(0.25)",
                self.ray_step.to_f64()
            ));
        }
        for tier in [Tier::Medium, Tier::Coarse] {
            if self.sample_dim_for(tier) == 0 {
                errors.push(format!(
                    "sample_dim for {tier:?} must be > 0, got 0. Example: sample_dim[{}] = 8",
                    tier.rank()
                ));
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors.join("\n")) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_validates() {
        let p = DomainPolicy::default_with_tile_size(Q16::from_int(16));
        assert!(p.validate().is_ok());
    }

    #[test]
    fn zero_tile_size_rejected() {
        let mut p = DomainPolicy::default_with_tile_size(Q16::from_int(16));
        p.tile_size = Q16::ZERO;
        let err = p.validate().unwrap_err();
        assert!(err.contains("tile_size"));
    }

    #[test]
    fn zero_sample_dim_rejected() {
        let mut p = DomainPolicy::default_with_tile_size(Q16::from_int(16));
        p.sample_dim[Tier::Medium.rank() as usize] = 0;
        let err = p.validate().unwrap_err();
        assert!(err.contains("Medium"));
    }

    #[test]
    fn multiple_errors_reported_together() {
        let mut p = DomainPolicy::default_with_tile_size(Q16::from_int(16));
        p.tile_size = Q16::ZERO;
        p.max_ray_steps = 0;
        let err = p.validate().unwrap_err();
        assert!(err.contains("tile_size"));
        assert!(err.contains("max_ray_steps"));
    }
}
