//! Rating arithmetic: per-role steps, clamping and selection chances.

use crate::config::{RatingStepsConfig, RatingsConfig, SelectionChance};
use crate::error::ConfigError;

pub const METACHAIN_SHARD_ID: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct RatingsComputer {
    config: RatingsConfig,
    chances: Vec<SelectionChance>,
}

impl RatingsComputer {
    pub fn new(config: RatingsConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut chances = config.selection_chances.clone();
        chances.sort_by_key(|c| c.max_threshold);
        Ok(Self { config, chances })
    }

    pub fn start_rating(&self) -> u32 {
        self.config.start_rating
    }

    pub fn min_rating(&self) -> u32 {
        self.config.min_rating
    }

    pub fn max_rating(&self) -> u32 {
        self.config.max_rating
    }

    pub fn signed_blocks_threshold(&self) -> f32 {
        self.config.signed_blocks_threshold
    }

    pub fn max_computable_rounds(&self) -> u64 {
        self.config.max_computable_rounds
    }

    pub fn steps(&self, shard_id: u32) -> &RatingStepsConfig {
        if shard_id == METACHAIN_SHARD_ID {
            &self.config.meta
        } else {
            &self.config.shard
        }
    }

    /// Applies a signed change and keeps the result in `[min, max]`.
    pub fn apply(&self, rating: u32, delta: i64) -> u32 {
        let min = i64::from(self.config.min_rating);
        let max = i64::from(self.config.max_rating);
        (i64::from(rating).saturating_add(delta)).clamp(min, max) as u32
    }

    pub fn compute_increase_proposer(&self, shard_id: u32, rating: u32) -> u32 {
        self.apply(rating, i64::from(self.steps(shard_id).increase_proposer))
    }

    /// Proposer decrease grows geometrically with the number of consecutive
    /// rounds the proposer has missed.
    pub fn compute_decrease_proposer(&self, shard_id: u32, rating: u32, consecutive_misses: u32) -> u32 {
        let steps = self.steps(shard_id);
        let exponent = consecutive_misses.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = f64::from(steps.consecutive_missed_blocks_penalty).powi(exponent);
        let decrease = (f64::from(steps.decrease_proposer) * factor).min(i64::MAX as f64) as i64;
        self.apply(rating, -decrease)
    }

    pub fn compute_increase_validator(&self, shard_id: u32, rating: u32) -> u32 {
        self.apply(rating, i64::from(self.steps(shard_id).increase_validator))
    }

    pub fn compute_decrease_validator(&self, shard_id: u32, rating: u32) -> u32 {
        self.apply(rating, -i64::from(self.steps(shard_id).decrease_validator))
    }

    /// Chance in percent of being selected in a consensus group.
    pub fn chance(&self, rating: u32) -> u32 {
        self.chances
            .iter()
            .find(|c| rating <= c.max_threshold)
            .or_else(|| self.chances.last())
            .map(|c| c.chance_percent)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn computer() -> RatingsComputer {
        RatingsComputer::new(RatingsConfig::default()).unwrap()
    }

    #[test]
    fn meta_uses_its_own_steps() {
        let rc = computer();
        assert_eq!(rc.compute_increase_validator(0, 5_000), 5_002);
        assert_eq!(rc.compute_increase_validator(METACHAIN_SHARD_ID, 5_000), 5_003);
        assert_eq!(rc.compute_decrease_validator(METACHAIN_SHARD_ID, 5_000), 4_994);
    }

    #[test]
    fn consecutive_misses_grow_the_penalty() {
        let rc = computer();
        assert_eq!(rc.compute_decrease_proposer(0, 5_000, 1), 4_980);
        assert_eq!(rc.compute_decrease_proposer(0, 5_000, 2), 4_978);
        assert!(rc.compute_decrease_proposer(0, 5_000, 30) < rc.compute_decrease_proposer(0, 5_000, 10));
    }

    #[test]
    fn ratings_stay_in_bounds() {
        let rc = computer();
        assert_eq!(rc.compute_increase_proposer(0, 9_995), 10_000);
        assert_eq!(rc.compute_decrease_proposer(0, 5, 1), 1);
        assert_eq!(rc.compute_decrease_proposer(0, 5_000, u32::MAX), 1);
    }

    #[test]
    fn chance_table_lookup() {
        let rc = computer();
        assert_eq!(rc.chance(0), 5);
        assert_eq!(rc.chance(500), 0);
        assert_eq!(rc.chance(3_000), 17);
        assert_eq!(rc.chance(10_000), 22);
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let config = RatingsConfig {
            min_rating: 10_000,
            ..RatingsConfig::default()
        };
        assert!(RatingsComputer::new(config).is_err());
    }

    proptest! {
        #[test]
        fn apply_clamps(rating in 1u32..=10_000, delta in any::<i64>()) {
            let rc = computer();
            let next = rc.apply(rating, delta);
            prop_assert!(next >= rc.min_rating() && next <= rc.max_rating());
        }
    }
}
