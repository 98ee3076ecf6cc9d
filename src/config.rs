//! JSON configuration for the system contracts and the rating engine.
//!
//! Every section has a `Default` so a partial file only overrides what it
//! names. `validate` runs before anything is built from the values.

use cosmwasm_std::{Binary, Uint128};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::address::ADDRESS_LEN;
use crate::error::ConfigError;
use crate::features::EnableEpochs;
use crate::helpers::deserialize_int;

/// Basis points used for service fees.
pub const MAX_SERVICE_FEE: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemScConfig {
    #[serde(default)]
    pub staking: StakingSystemScConfig,
    #[serde(default)]
    pub validator: ValidatorSystemScConfig,
    #[serde(default)]
    pub delegation_manager: DelegationManagerSystemScConfig,
    #[serde(default)]
    pub gas_cost: GasCost,
    #[serde(default)]
    pub enable_epochs: EnableEpochs,
    #[serde(default)]
    pub funding: FundingMode,
    #[serde(default)]
    pub ratings: RatingsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StakingSystemScConfig {
    #[serde(deserialize_with = "deserialize_int")]
    pub min_num_nodes: u64,
    /// Active keys cap; registrations past it go to the waiting list.
    #[serde(deserialize_with = "deserialize_int")]
    pub max_num_nodes: u64,
    /// Nonces that must pass between unStake and unBond.
    #[serde(deserialize_with = "deserialize_int")]
    pub unbond_period: u64,
    /// Epochs that must pass between unStake and unBond when the epoch check
    /// is active; also gates unBondTokens.
    pub unbond_period_in_epochs: u32,
}

impl Default for StakingSystemScConfig {
    fn default() -> Self {
        Self {
            min_num_nodes: 1,
            max_num_nodes: 400,
            unbond_period: 250,
            unbond_period_in_epochs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatorSystemScConfig {
    pub node_price: Uint128,
    /// Smallest total an owner with registered nodes may keep after unStakeTokens.
    pub min_deposit: Uint128,
    pub unjail_price: Uint128,
    /// Exact BLS key length required by `stake`; any non-empty key when unset.
    #[serde(default)]
    pub bls_key_length: Option<usize>,
}

impl Default for ValidatorSystemScConfig {
    fn default() -> Self {
        Self {
            node_price: Uint128::new(2_500_000),
            min_deposit: Uint128::new(2_500_000),
            unjail_price: Uint128::new(2_500),
            bls_key_length: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelegationManagerSystemScConfig {
    pub min_creation_deposit: Uint128,
    pub min_delegation_amount: Uint128,
    pub min_service_fee: u64,
    pub max_service_fee: u64,
}

impl Default for DelegationManagerSystemScConfig {
    fn default() -> Self {
        Self {
            min_creation_deposit: Uint128::new(1_250_000),
            min_delegation_amount: Uint128::new(1_000),
            min_service_fee: 0,
            max_service_fee: MAX_SERVICE_FEE,
        }
    }
}

/// Gas billed by the system contracts per operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GasCost {
    pub stake: u64,
    pub unstake: u64,
    pub unbond: u64,
    pub unjail: u64,
    pub claim: u64,
    pub get: u64,
    pub change_reward_address: u64,
    pub delegation_ops: u64,
    pub delegation_mgr_ops: u64,
    pub validator_to_delegation: u64,
    pub get_all_node_states: u64,
    pub get_active_fund: u64,
}

impl Default for GasCost {
    fn default() -> Self {
        Self {
            stake: 5_000_000,
            unstake: 5_000_000,
            unbond: 5_000_000,
            unjail: 5_000_000,
            claim: 5_000_000,
            get: 1_000_000,
            change_reward_address: 5_000_000,
            delegation_ops: 1_000_000,
            delegation_mgr_ops: 50_000_000,
            validator_to_delegation: 500_000_000,
            get_all_node_states: 20_000_000,
            get_active_fund: 50_000,
        }
    }
}

/// How stake funding is authenticated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FundingMode {
    /// The call value is the stake delta and the caller is the owner.
    #[default]
    NativeValue,
    /// A dedicated authority reports new totals; native transfers are off.
    AbstractStaking { authority: Binary },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatingStepsConfig {
    pub increase_validator: u32,
    pub decrease_validator: u32,
    pub increase_proposer: u32,
    pub decrease_proposer: u32,
    /// Multiplier applied to the proposer decrease per consecutive miss.
    pub consecutive_missed_blocks_penalty: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionChance {
    pub max_threshold: u32,
    pub chance_percent: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatingsConfig {
    pub start_rating: u32,
    pub max_rating: u32,
    pub min_rating: u32,
    pub signed_blocks_threshold: f32,
    pub max_computable_rounds: u64,
    pub shard: RatingStepsConfig,
    pub meta: RatingStepsConfig,
    pub selection_chances: Vec<SelectionChance>,
}

impl Default for RatingsConfig {
    fn default() -> Self {
        Self {
            start_rating: 5_000,
            max_rating: 10_000,
            min_rating: 1,
            signed_blocks_threshold: 0.01,
            max_computable_rounds: 1_000,
            shard: RatingStepsConfig {
                increase_validator: 2,
                decrease_validator: 4,
                increase_proposer: 10,
                decrease_proposer: 20,
                consecutive_missed_blocks_penalty: 1.1,
            },
            meta: RatingStepsConfig {
                increase_validator: 3,
                decrease_validator: 6,
                increase_proposer: 12,
                decrease_proposer: 24,
                consecutive_missed_blocks_penalty: 1.1,
            },
            selection_chances: vec![
                SelectionChance { max_threshold: 0, chance_percent: 5 },
                SelectionChance { max_threshold: 1_000, chance_percent: 0 },
                SelectionChance { max_threshold: 2_000, chance_percent: 16 },
                SelectionChance { max_threshold: 4_000, chance_percent: 17 },
                SelectionChance { max_threshold: 6_000, chance_percent: 18 },
                SelectionChance { max_threshold: 7_000, chance_percent: 19 },
                SelectionChance { max_threshold: 8_000, chance_percent: 20 },
                SelectionChance { max_threshold: 9_000, chance_percent: 21 },
                SelectionChance { max_threshold: 10_000, chance_percent: 22 },
            ],
        }
    }
}

impl RatingsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_rating < 1 || self.min_rating >= self.max_rating {
            return Err(ConfigError::Invalid(format!(
                "rating bounds min {} max {}",
                self.min_rating, self.max_rating
            )));
        }
        if self.start_rating < self.min_rating || self.start_rating > self.max_rating {
            return Err(ConfigError::Invalid(format!(
                "start rating {} outside [{}, {}]",
                self.start_rating, self.min_rating, self.max_rating
            )));
        }
        if !(0.0..=1.0).contains(&self.signed_blocks_threshold) {
            return Err(ConfigError::Invalid(format!(
                "signed blocks threshold {}",
                self.signed_blocks_threshold
            )));
        }
        for steps in [&self.shard, &self.meta] {
            if steps.consecutive_missed_blocks_penalty < 1.0 {
                return Err(ConfigError::Invalid(
                    "consecutive missed blocks penalty must be at least 1".to_string(),
                ));
            }
        }
        if self.selection_chances.is_empty()
            || self
                .selection_chances
                .windows(2)
                .any(|w| w[0].max_threshold >= w[1].max_threshold)
        {
            return Err(ConfigError::Invalid(
                "selection chances must be sorted by threshold".to_string(),
            ));
        }
        Ok(())
    }
}

impl SystemScConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: SystemScConfig =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validator.node_price.is_zero() {
            return Err(ConfigError::ZeroNodePrice);
        }
        if self.validator.bls_key_length == Some(0) {
            return Err(ConfigError::Invalid("bls key length must be positive".to_string()));
        }
        if self.staking.min_num_nodes > self.staking.max_num_nodes {
            return Err(ConfigError::Invalid(format!(
                "min num nodes {} greater than max num nodes {}",
                self.staking.min_num_nodes, self.staking.max_num_nodes
            )));
        }
        let mgr = &self.delegation_manager;
        if mgr.min_service_fee > mgr.max_service_fee || mgr.max_service_fee > MAX_SERVICE_FEE {
            return Err(ConfigError::Invalid(format!(
                "service fee bounds [{}, {}]",
                mgr.min_service_fee, mgr.max_service_fee
            )));
        }
        if let FundingMode::AbstractStaking { authority } = &self.funding {
            if authority.len() != ADDRESS_LEN {
                return Err(ConfigError::InvalidAddress {
                    name: "abstract staking authority",
                    expected: ADDRESS_LEN,
                    got: authority.len(),
                });
            }
        }
        self.ratings.validate()
    }
}
