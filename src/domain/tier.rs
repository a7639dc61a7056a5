//! Resolution tier ladder (§3, §4.2).

/// Resolution tier, ordered finest-to-coarsest. `Refused` is not a tier a
/// ladder step attempts — it is the terminal "every tier failed" outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Full = 0,
    Medium = 1,
    Coarse = 2,
    Analytic = 3,
    Refused = 4,
}

impl Tier {
    /// The four tiers a ladder walk actually attempts, finest first.
    pub const LADDER: [Tier; 4] = [Tier::Full, Tier::Medium, Tier::Coarse, Tier::Analytic];

    pub fn rank(self) -> u8 {
        self as u8
    }

    /// Whether this tier builds/reuses a dense tile (MEDIUM, COARSE) as
    /// opposed to evaluating analytically at the exact point (FULL,
    /// ANALYTIC).
    pub fn is_tiled(self) -> bool {
        matches!(self, Tier::Medium | Tier::Coarse)
    }
}
